//! Functions, basic blocks, and modules.
//!
//! A function is an arena of instructions plus an arena of basic blocks;
//! each block is an ordered list of instruction ids ending in a
//! terminator. The entry block is the only legal home for `Alloca`s.
//!
//! A module bundles the type table with the set of defined functions.
//! External code is referred to by symbol through `Callee::Opaque` and
//! never has a body here.

use crate::arena::{Arena, Id};
use crate::instr::{Instr, InstrId, Op, Value};
use crate::types::{TypeId, TypeTable};
use std::sync::Arc;

// =============================================================================
// Basic Block
// =============================================================================

/// Block identifier.
pub type BlockId = Id<BasicBlock>;

/// A basic block: an ordered list of instructions.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Instruction ids in execution order. The last live instruction is
    /// the terminator.
    pub instrs: Vec<InstrId>,
}

// =============================================================================
// Function
// =============================================================================

/// Function identifier.
pub type FuncId = Id<Function>;

/// A function definition.
#[derive(Debug, Clone)]
pub struct Function {
    /// Symbol name.
    pub name: Arc<str>,
    /// Parameter types.
    pub params: Vec<TypeId>,
    /// Instruction storage.
    pub instrs: Arena<Instr>,
    /// Block storage.
    pub blocks: Arena<BasicBlock>,
    /// Entry block.
    pub entry: BlockId,
}

impl Function {
    /// Create a function with an empty entry block.
    pub fn new(name: impl Into<Arc<str>>, params: Vec<TypeId>) -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(BasicBlock::default());
        Function {
            name: name.into(),
            params,
            instrs: Arena::new(),
            blocks,
            entry,
        }
    }

    /// Get an instruction.
    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    /// Get an instruction mutably.
    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id]
    }

    /// Get a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    /// Get a block mutably.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    /// Allocate a new block.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.alloc(BasicBlock::default())
    }

    /// Allocate an instruction without placing it in a block.
    pub fn add_instr(&mut self, op: Op) -> InstrId {
        self.instrs.alloc(Instr::new(op))
    }

    /// Allocate an instruction and append it to a block.
    pub fn append(&mut self, block: BlockId, op: Op) -> InstrId {
        let id = self.add_instr(op);
        self.blocks[block].instrs.push(id);
        id
    }

    /// All live (non-tombstone) instructions that use `target` as an
    /// operand, in arena order.
    pub fn uses_of(&self, target: Value) -> Vec<InstrId> {
        self.instrs
            .iter()
            .filter(|(_, instr)| !matches!(instr.op, Op::Nop) && instr.op.uses(target))
            .map(|(id, _)| id)
            .collect()
    }

    /// Replace every operand equal to `old` with `new` across the whole
    /// function. Returns the number of operands replaced.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) -> usize {
        let mut replaced = 0;
        for (_, instr) in self.instrs.iter_mut() {
            instr.op.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                    replaced += 1;
                }
            });
        }
        replaced
    }

    /// Kill an instruction: tombstone it in place and unlink it from its
    /// block. The id stays valid (and dead) forever.
    pub fn kill(&mut self, id: InstrId) {
        self.instrs[id].op = Op::Nop;
        for bid in self.blocks.ids().collect::<Vec<_>>() {
            self.blocks[bid].instrs.retain(|&i| i != id);
        }
    }

    /// All `Ret` instruction ids, across every block.
    pub fn return_sites(&self) -> Vec<InstrId> {
        self.instrs
            .iter()
            .filter(|(_, instr)| matches!(instr.op, Op::Ret { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    /// Structural sanity check: every block ends in a terminator, and
    /// `Alloca`s appear only in the entry block.
    pub fn validate(&self) -> Result<(), String> {
        for (bid, block) in self.blocks.iter() {
            match block.instrs.last() {
                Some(&last) if self.instrs[last].op.is_terminator() => {}
                Some(_) => return Err(format!("block {} does not end in a terminator", bid)),
                None => return Err(format!("block {} is empty", bid)),
            }
            for &iid in &block.instrs {
                if matches!(self.instrs[iid].op, Op::Alloca { .. }) && bid != self.entry {
                    return Err(format!("alloca {} outside the entry block", iid));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Module
// =============================================================================

/// A whole program: types plus defined functions.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Composite-type declarations.
    pub types: TypeTable,
    /// Defined functions.
    pub functions: Arena<Function>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a module around an existing type table.
    pub fn with_types(types: TypeTable) -> Self {
        Module {
            types,
            functions: Arena::new(),
        }
    }

    /// Add a function definition.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        self.functions.alloc(func)
    }

    /// Get a function.
    #[inline]
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id]
    }

    /// Get a function mutably.
    #[inline]
    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id]
    }

    /// Find a function by name.
    pub fn by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .find(|(_, f)| &*f.name == name)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{BinaryOp, Op};

    fn sample_function() -> Function {
        let mut f = Function::new("f", vec![]);
        let entry = f.entry;
        let a = f.append(
            entry,
            Op::Binary {
                op: BinaryOp::Add,
                lhs: Value::ConstInt(1),
                rhs: Value::ConstInt(2),
            },
        );
        f.append(
            entry,
            Op::Ret {
                value: Some(Value::Instr(a)),
            },
        );
        f
    }

    #[test]
    fn test_uses_and_replace() {
        let mut f = sample_function();
        let add = f.block(f.entry).instrs[0];
        assert_eq!(f.uses_of(Value::Instr(add)).len(), 1);

        let n = f.replace_all_uses(Value::Instr(add), Value::ConstInt(3));
        assert_eq!(n, 1);
        assert!(f.uses_of(Value::Instr(add)).is_empty());
    }

    #[test]
    fn test_kill_unlinks() {
        let mut f = sample_function();
        let add = f.block(f.entry).instrs[0];
        f.kill(add);
        assert!(matches!(f.instr(add).op, Op::Nop));
        assert_eq!(f.block(f.entry).instrs.len(), 1);
    }

    #[test]
    fn test_validate_rejects_unterminated() {
        let mut f = Function::new("g", vec![]);
        let entry = f.entry;
        f.append(
            entry,
            Op::Binary {
                op: BinaryOp::Add,
                lhs: Value::ConstInt(0),
                rhs: Value::ConstInt(0),
            },
        );
        assert!(f.validate().is_err());

        f.append(entry, Op::Ret { value: None });
        assert!(f.validate().is_ok());
    }

    #[test]
    fn test_module_by_name() {
        let mut m = Module::new();
        let id = m.add_function(sample_function());
        assert_eq!(m.by_name("f"), Some(id));
        assert_eq!(m.by_name("missing"), None);
    }
}
