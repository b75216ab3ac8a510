//! Reference evaluator for the CPI transform.
//!
//! Runs a `cpi_ir` module over a flat, word-addressed guest memory. The
//! point of this crate is differential and adversarial testing of the
//! transform, so the memory model is deliberately unforgiving:
//!
//! - Locals are bump-allocated contiguously; out-of-bounds stores land on
//!   whatever is adjacent, as they would on a real stack.
//! - Function pointers are plain words; an indirect call through a word
//!   that is not a defined function traps.
//! - Opaque calls run arbitrary native handlers with full access to
//!   guest memory, and none to the safe region.
//!
//! Safe-region intrinsics emitted by the transform dispatch into a
//! [`cpi_rt::SafeRegion`] owned by the [`Vm`], one per execution context.

pub mod memory;
pub mod vm;

pub use memory::{GuestMem, DEFAULT_MEMORY_WORDS, STACK_BASE};
pub use vm::{decode_fn, encode_fn, OpaqueHandler, Vm, DEFAULT_STEP_LIMIT, FUNC_ADDR_BASE};

use thiserror::Error;

/// Execution traps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Trap {
    /// Access to null or past the end of guest memory.
    #[error("out-of-bounds access at address {addr:#x}")]
    OutOfBounds {
        /// The offending word address.
        addr: u64,
    },
    /// Indirect call through a word that is not a defined function.
    #[error("indirect call through corrupt function pointer {word:#x}")]
    BadFunctionPointer {
        /// The word that failed to decode.
        word: u64,
    },
    /// Opaque call to a symbol with no registered handler.
    #[error("call to unregistered external symbol '{symbol}'")]
    UnknownExternal {
        /// The unresolved symbol.
        symbol: String,
    },
    /// Use of an instruction result that was never computed.
    #[error("use of a value that was never computed")]
    UndefinedValue,
    /// A block ended without a terminator.
    #[error("control fell off the end of a basic block")]
    MissingTerminator,
    /// The per-run step budget was exhausted.
    #[error("step budget exhausted")]
    StepLimit,
    /// Call nesting exceeded the depth limit.
    #[error("call depth exceeded")]
    CallDepth,
    /// A safe-region operation failed.
    #[error(transparent)]
    Region(#[from] cpi_rt::RegionError),
}
