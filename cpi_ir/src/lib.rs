//! Program representation for the code-pointer-integrity transform.
//!
//! The transform consumes a program as a set of functions, each a list of
//! basic blocks of instructions, with module-wide composite-type
//! declarations. This crate provides exactly that surface:
//!
//! - [`types`]: interned types and word-granular layout
//! - [`instr`]: the alloca-based instruction set, including the
//!   safe-region runtime intrinsics the transform emits
//! - [`function`]: functions, blocks, and modules
//! - [`builder`]: a convenience construction API
//!
//! Everything the transform does not rewrite passes through untouched;
//! the representation makes no attempt to be a general-purpose compiler
//! IR beyond what instrumentation and its tests require.

pub mod arena;
pub mod builder;
pub mod function;
pub mod instr;
pub mod types;

pub use arena::{Arena, Id};
pub use builder::FunctionBuilder;
pub use function::{BasicBlock, BlockId, FuncId, Function, Module};
pub use instr::{Args, BinaryOp, Callee, CastKind, Instr, InstrId, Op, RtFn, Value};
pub use types::{StructDef, StructId, Type, TypeId, TypeTable};
