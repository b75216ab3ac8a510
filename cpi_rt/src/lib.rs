//! Safe-region runtime for code-pointer integrity.
//!
//! Relocated code pointers live in a [`SafeRegion`]: isolated,
//! handle-addressed storage separate from the memory a buffer overflow
//! can reach. The region exposes the small ABI the instrumented code
//! depends on:
//!
//! ```text
//! handle  allocate()
//! void    store(handle, word)
//! word    load(handle)
//! handle  allocate_with_shadow(origin)
//! word    load_verified(handle, origin)
//! int     checkpoint()
//! void    restore(cursor)
//! ```
//!
//! All operations are synchronous and complete or abort on a violated
//! invariant; nothing here blocks. One region serves exactly one logical
//! call stack; embeddings with several independent execution contexts
//! create one region each. The region deliberately knows nothing about
//! the memory its origins live in: callers of the `*_shadow`/`*_verified`
//! operations dereference origin pointers themselves and pass current
//! origin *values*.

#![warn(missing_docs)]

mod region;

pub use region::{DivergencePolicy, Handle, SafeRegion, SLOTS_PER_BLOCK};

use thiserror::Error;

/// Errors surfaced by safe-region operations.
///
/// Everything else the region can detect (stale handles, restore above
/// the cursor, growth failure) is a violated invariant of the
/// instrumented program or the host and aborts instead of returning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    /// A shadowed slot and its foreign origin disagree under the strict
    /// divergence policy.
    #[error(
        "shadowed slot {handle} diverged from its origin (slot {slot:#x}, origin {origin:#x})"
    )]
    ShadowDivergence {
        /// Raw index of the diverged handle.
        handle: u32,
        /// Value held by the safe-region slot.
        slot: u64,
        /// Value held by the foreign origin.
        origin: u64,
    },
}
