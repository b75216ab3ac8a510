//! Function construction API.
//!
//! `FunctionBuilder` appends instructions to a current block, one method
//! per instruction kind, and hands back `Value`s for results. Used by
//! embedders and throughout the test suites.
//!
//! ```
//! use cpi_ir::builder::FunctionBuilder;
//! use cpi_ir::types::TypeTable;
//! use cpi_ir::instr::Value;
//!
//! let mut types = TypeTable::new();
//! let int = types.int();
//! let mut b = FunctionBuilder::new("answer", vec![]);
//! let slot = b.alloca(int);
//! b.store(slot, Value::ConstInt(42));
//! let v = b.load(slot);
//! b.ret(Some(v));
//! let func = b.finish();
//! assert!(func.validate().is_ok());
//! ```

use crate::function::{BlockId, FuncId, Function};
use crate::instr::{Args, BinaryOp, Callee, CastKind, Op, RtFn, Value};
use crate::types::TypeId;
use std::sync::Arc;

/// Builds one function, block by block.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start a new function. The builder is positioned at the entry block.
    pub fn new(name: impl Into<Arc<str>>, params: Vec<TypeId>) -> Self {
        let func = Function::new(name, params);
        let current = func.entry;
        FunctionBuilder { func, current }
    }

    /// Create a new (empty) block without switching to it.
    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    /// Switch the insertion point to `block`.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// The block currently being appended to.
    #[inline]
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    fn push(&mut self, op: Op) -> Value {
        let id = self.func.append(self.current, op);
        Value::Instr(id)
    }

    fn push_void(&mut self, op: Op) {
        self.func.append(self.current, op);
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    /// Reserve a local slot of type `ty`; yields its address.
    pub fn alloca(&mut self, ty: TypeId) -> Value {
        self.push(Op::Alloca { ty })
    }

    /// Load the word at `ptr`.
    pub fn load(&mut self, ptr: Value) -> Value {
        self.push(Op::Load { ptr })
    }

    /// Store `value` at `ptr`.
    pub fn store(&mut self, ptr: Value, value: Value) {
        self.push_void(Op::Store { ptr, value });
    }

    /// Address of constant field `field` of the `struct_ty` value at `base`.
    pub fn field_addr(&mut self, base: Value, struct_ty: TypeId, field: u32) -> Value {
        self.push(Op::FieldAddr {
            base,
            struct_ty,
            field,
        })
    }

    /// Address `base + index` (word granularity).
    pub fn index_addr(&mut self, base: Value, index: Value) -> Value {
        self.push(Op::IndexAddr { base, index })
    }

    /// Call a function defined in this module.
    pub fn call(&mut self, callee: FuncId, args: &[Value]) -> Value {
        self.push(Op::Call {
            callee: Callee::Local(callee),
            args: Args::from_slice(args),
        })
    }

    /// Call an external symbol.
    pub fn call_opaque(&mut self, symbol: impl Into<Arc<str>>, args: &[Value]) -> Value {
        self.push(Op::Call {
            callee: Callee::Opaque(symbol.into()),
            args: Args::from_slice(args),
        })
    }

    /// Call a safe-region intrinsic. Reserved for the transform.
    pub fn call_runtime(&mut self, rt: RtFn, args: &[Value]) -> Value {
        self.push(Op::Call {
            callee: Callee::Runtime(rt),
            args: Args::from_slice(args),
        })
    }

    /// Call through a function-pointer value.
    pub fn call_indirect(&mut self, target: Value, args: &[Value]) -> Value {
        self.push(Op::CallIndirect {
            target,
            args: Args::from_slice(args),
        })
    }

    /// Representation cast.
    pub fn cast(&mut self, kind: CastKind, value: Value) -> Value {
        self.push(Op::Cast { kind, value })
    }

    /// Binary integer operation.
    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        self.push(Op::Binary { op, lhs, rhs })
    }

    /// Unconditional branch.
    pub fn br(&mut self, target: BlockId) {
        self.push_void(Op::Br { target });
    }

    /// Conditional branch on `cond != 0`.
    pub fn cond_br(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.push_void(Op::CondBr {
            cond,
            then_block,
            else_block,
        });
    }

    /// Return.
    pub fn ret(&mut self, value: Option<Value>) {
        self.push_void(Op::Ret { value });
    }

    /// Finish building and take the function.
    pub fn finish(self) -> Function {
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeTable;

    #[test]
    fn test_branching_function() {
        let mut types = TypeTable::new();
        let int = types.int();

        let mut b = FunctionBuilder::new("pick", vec![int]);
        let then_block = b.create_block();
        let else_block = b.create_block();

        b.cond_br(Value::Param(0), then_block, else_block);

        b.switch_to(then_block);
        b.ret(Some(Value::ConstInt(1)));

        b.switch_to(else_block);
        b.ret(Some(Value::ConstInt(2)));

        let func = b.finish();
        assert!(func.validate().is_ok());
        assert_eq!(func.return_sites().len(), 2);
    }

    #[test]
    fn test_alloca_load_store() {
        let mut types = TypeTable::new();
        let fp = types.fn_ptr();

        let mut b = FunctionBuilder::new("f", vec![]);
        let slot = b.alloca(fp);
        b.store(slot, Value::Null);
        let v = b.load(slot);
        b.ret(Some(v));

        let func = b.finish();
        assert!(func.validate().is_ok());
        assert_eq!(func.block(func.entry).instrs.len(), 4);
    }
}
