//! Instruction definitions.
//!
//! The instruction set is the unoptimized, alloca-based register-transfer
//! form: locals live in stack slots created by `Alloca` in the entry
//! block, and every access goes through an explicit `Load`/`Store` with
//! an address computed by `FieldAddr` (structurally-constant field) or
//! `IndexAddr` (dynamic element). There are no phis.
//!
//! Instructions are arena-allocated; operands are [`Value`]s, which refer
//! to instruction results, parameters, or immediates. A killed
//! instruction becomes [`Op::Nop`] in place so ids stay stable.

use crate::arena::Id;
use crate::function::{BlockId, FuncId};
use crate::types::TypeId;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Values
// =============================================================================

/// Identifier for an instruction (and, for value-producing instructions,
/// its result).
pub type InstrId = Id<Instr>;

/// An operand: an SSA-ish reference to a produced or immediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// Result of another instruction.
    Instr(InstrId),
    /// Function parameter by index.
    Param(u32),
    /// Integer immediate.
    ConstInt(i64),
    /// Address-of a defined function (a function-pointer constant).
    FuncAddr(FuncId),
    /// Null pointer.
    Null,
}

// =============================================================================
// Operators
// =============================================================================

/// Binary integer operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Equality comparison, yields 0 or 1.
    Eq,
    /// Signed less-than, yields 0 or 1.
    Lt,
}

/// Representation casts between function pointers and opaque words.
///
/// The transform inserts these around relocated accesses; execution-wise
/// both are the identity on the underlying word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// Function pointer reinterpreted as an opaque word.
    FnPtrToWord,
    /// Opaque word reinterpreted as a function pointer.
    WordToFnPtr,
}

/// Safe-region runtime intrinsics.
///
/// Only the transform emits calls to these; input programs never contain
/// them, which is what makes one transform application a fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtFn {
    /// `allocate() -> handle`
    Allocate,
    /// `store(handle, word)`
    Store,
    /// `load(handle) -> word`
    Load,
    /// `allocate_with_shadow(origin_ptr) -> handle`
    AllocateWithShadow,
    /// `load_verified(handle, origin_ptr) -> word`
    LoadVerified,
    /// `checkpoint() -> cursor`
    Checkpoint,
    /// `restore(cursor)`
    Restore,
}

impl RtFn {
    /// Symbolic name, as it would appear at link time.
    pub fn symbol(self) -> &'static str {
        match self {
            RtFn::Allocate => "__cpi_alloca",
            RtFn::Store => "__cpi_store",
            RtFn::Load => "__cpi_load",
            RtFn::AllocateWithShadow => "__cpi_alloca_shadow",
            RtFn::LoadVerified => "__cpi_load_verified",
            RtFn::Checkpoint => "__cpi_checkpoint",
            RtFn::Restore => "__cpi_restore",
        }
    }
}

/// The target of a direct call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// A function defined in this module; covered by the transform.
    Local(FuncId),
    /// An external declaration. Its body and memory effects are unknown.
    Opaque(Arc<str>),
    /// A safe-region runtime intrinsic.
    Runtime(RtFn),
}

/// Argument list storage; nearly all calls have at most four arguments.
pub type Args = SmallVec<[Value; 4]>;

// =============================================================================
// Instructions
// =============================================================================

/// An instruction operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Reserve a frame slot for a local of type `ty`, yielding its
    /// address. Legal only in the entry block.
    Alloca {
        /// Type of the local.
        ty: TypeId,
    },
    /// Load the word at `ptr`.
    Load {
        /// Address to read.
        ptr: Value,
    },
    /// Store `value` to the word at `ptr`.
    Store {
        /// Address to write.
        ptr: Value,
        /// Word to write.
        value: Value,
    },
    /// Address of field `field` of the struct at `base`.
    ///
    /// `field` is a structurally-constant index; `struct_ty` names the
    /// composite type being addressed.
    FieldAddr {
        /// Struct base address.
        base: Value,
        /// Composite type of the pointee.
        struct_ty: TypeId,
        /// Constant field index.
        field: u32,
    },
    /// Address of the `index`-th word after `base`. Dynamic; used for
    /// array elements and any pointer arithmetic the program performs.
    IndexAddr {
        /// Base address.
        base: Value,
        /// Word offset, computed at runtime.
        index: Value,
    },
    /// Direct call.
    Call {
        /// Call target.
        callee: Callee,
        /// Arguments.
        args: Args,
    },
    /// Call through a function-pointer value.
    CallIndirect {
        /// The function-pointer word to invoke.
        target: Value,
        /// Arguments.
        args: Args,
    },
    /// Representation cast.
    Cast {
        /// Direction of the cast.
        kind: CastKind,
        /// Operand.
        value: Value,
    },
    /// Binary integer operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Value,
        /// Right operand.
        rhs: Value,
    },
    /// Unconditional branch.
    Br {
        /// Successor block.
        target: BlockId,
    },
    /// Conditional branch on `cond != 0`.
    CondBr {
        /// Condition word.
        cond: Value,
        /// Successor when the condition is nonzero.
        then_block: BlockId,
        /// Successor when the condition is zero.
        else_block: BlockId,
    },
    /// Return from the function.
    Ret {
        /// Returned value, if any.
        value: Option<Value>,
    },
    /// Tombstone for a killed instruction.
    Nop,
}

/// An instruction: currently just its operation. Ids into the containing
/// function's arena double as result names.
#[derive(Debug, Clone)]
pub struct Instr {
    /// The operation.
    pub op: Op,
}

impl Instr {
    /// Create an instruction from an operation.
    #[inline]
    pub fn new(op: Op) -> Self {
        Instr { op }
    }
}

impl Op {
    /// Whether this operation terminates a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Br { .. } | Op::CondBr { .. } | Op::Ret { .. })
    }

    /// Whether this operation produces a value.
    pub fn produces_value(&self) -> bool {
        match self {
            Op::Alloca { .. }
            | Op::Load { .. }
            | Op::FieldAddr { .. }
            | Op::IndexAddr { .. }
            | Op::CallIndirect { .. }
            | Op::Cast { .. }
            | Op::Binary { .. } => true,
            Op::Call { callee, .. } => !matches!(
                callee,
                Callee::Runtime(RtFn::Store) | Callee::Runtime(RtFn::Restore)
            ),
            _ => false,
        }
    }

    /// Visit every operand.
    pub fn for_each_operand(&self, mut f: impl FnMut(Value)) {
        match self {
            Op::Alloca { .. } | Op::Br { .. } | Op::Nop => {}
            Op::Load { ptr } => f(*ptr),
            Op::Store { ptr, value } => {
                f(*ptr);
                f(*value);
            }
            Op::FieldAddr { base, .. } => f(*base),
            Op::IndexAddr { base, index } => {
                f(*base);
                f(*index);
            }
            Op::Call { args, .. } => {
                for &a in args {
                    f(a);
                }
            }
            Op::CallIndirect { target, args } => {
                f(*target);
                for &a in args {
                    f(a);
                }
            }
            Op::Cast { value, .. } => f(*value),
            Op::Binary { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Op::CondBr { cond, .. } => f(*cond),
            Op::Ret { value } => {
                if let Some(v) = value {
                    f(*v);
                }
            }
        }
    }

    /// Visit every operand mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Op::Alloca { .. } | Op::Br { .. } | Op::Nop => {}
            Op::Load { ptr } => f(ptr),
            Op::Store { ptr, value } => {
                f(ptr);
                f(value);
            }
            Op::FieldAddr { base, .. } => f(base),
            Op::IndexAddr { base, index } => {
                f(base);
                f(index);
            }
            Op::Call { args, .. } => {
                for a in args {
                    f(a);
                }
            }
            Op::CallIndirect { target, args } => {
                f(target);
                for a in args {
                    f(a);
                }
            }
            Op::Cast { value, .. } => f(value),
            Op::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Op::CondBr { cond, .. } => f(cond),
            Op::Ret { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    /// Whether any operand equals `target`.
    pub fn uses(&self, target: Value) -> bool {
        let mut found = false;
        self.for_each_operand(|v| found |= v == target);
        found
    }
}
