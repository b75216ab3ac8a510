//! The evaluator.
//!
//! Executes one function at a time over a [`GuestMem`], recursing into
//! local callees. Function pointers travel as encoded words; indirect
//! calls through a word that does not decode to a defined function trap,
//! which is how a successfully corrupted code pointer manifests here.
//!
//! Opaque (external) calls dispatch to registered native handlers. A
//! handler receives the guest memory and the argument words and may read
//! and write memory arbitrarily; it is the adversary model for the
//! boundary-synchronization tests. Handlers have no access to the safe
//! region: foreign code cannot reach relocated storage by construction.
//!
//! Safe-region intrinsics dispatch into the `SafeRegion` owned by the
//! `Vm`. The region ABI traffics in origin *values*, so the dereference
//! of origin pointers happens here, in the one component that owns guest
//! memory.

use crate::memory::{GuestMem, DEFAULT_MEMORY_WORDS, STACK_BASE};
use crate::Trap;

use cpi_ir::{BinaryOp, Callee, FuncId, Module, Op, RtFn, Value};
use cpi_rt::{DivergencePolicy, Handle, SafeRegion};

use rustc_hash::FxHashMap;
use std::sync::Arc;

// =============================================================================
// Function-Pointer Encoding
// =============================================================================

/// Base of the encoded function-pointer address space. Well above any
/// guest stack address, so pointer words and data words never collide by
/// accident.
pub const FUNC_ADDR_BASE: u64 = 0x4000_0000;

/// Encode a defined function as a function-pointer word.
#[inline]
pub fn encode_fn(func: FuncId) -> u64 {
    FUNC_ADDR_BASE + func.index() as u64
}

/// Decode a function-pointer word, if it denotes a defined function.
pub fn decode_fn(module: &Module, word: u64) -> Option<FuncId> {
    let index = word.checked_sub(FUNC_ADDR_BASE)?;
    let id = FuncId::new(u32::try_from(index).ok()?);
    module.functions.get(id).map(|_| id)
}

// =============================================================================
// Limits
// =============================================================================

/// Default per-run step budget.
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Maximum call depth.
pub const MAX_CALL_DEPTH: usize = 256;

// =============================================================================
// Vm
// =============================================================================

/// Native handler for an opaque call: `(guest memory, args) -> result`.
pub type OpaqueHandler = Box<dyn FnMut(&mut GuestMem, &[u64]) -> u64>;

/// One execution context: guest memory, a stack cursor, a safe region,
/// and the opaque-call handler registry.
pub struct Vm {
    mem: GuestMem,
    region: SafeRegion,
    handlers: FxHashMap<Arc<str>, OpaqueHandler>,
    sp: u64,
    steps: u64,
    step_limit: u64,
}

impl Vm {
    /// Create a context with default memory and the strict divergence
    /// policy.
    pub fn new() -> Self {
        Self::with_policy(DivergencePolicy::Strict)
    }

    /// Create a context with an explicit divergence policy for its safe
    /// region.
    pub fn with_policy(policy: DivergencePolicy) -> Self {
        Vm {
            mem: GuestMem::new(DEFAULT_MEMORY_WORDS),
            region: SafeRegion::with_policy(policy),
            handlers: FxHashMap::default(),
            sp: STACK_BASE,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Register a native handler for an opaque symbol.
    pub fn register_opaque(&mut self, symbol: impl Into<Arc<str>>, handler: OpaqueHandler) {
        self.handlers.insert(symbol.into(), handler);
    }

    /// Guest memory.
    #[inline]
    pub fn mem(&self) -> &GuestMem {
        &self.mem
    }

    /// Guest memory, mutable. Tests use this to play attacker between
    /// runs.
    #[inline]
    pub fn mem_mut(&mut self) -> &mut GuestMem {
        &mut self.mem
    }

    /// The safe region.
    #[inline]
    pub fn region(&self) -> &SafeRegion {
        &self.region
    }

    /// Run a function to completion. The stack cursor resets to the base
    /// for each top-level run; the safe region persists across runs so
    /// callers can assert on its cursor afterwards.
    pub fn run(&mut self, module: &Module, func: FuncId, args: &[u64]) -> Result<u64, Trap> {
        self.sp = STACK_BASE;
        self.steps = 0;
        self.exec(module, func, args, 0)
    }

    fn exec(
        &mut self,
        module: &Module,
        func_id: FuncId,
        args: &[u64],
        depth: usize,
    ) -> Result<u64, Trap> {
        if depth >= MAX_CALL_DEPTH {
            return Err(Trap::CallDepth);
        }
        let func = module.function(func_id);
        let frame_base = self.sp;
        let mut values: Vec<Option<u64>> = vec![None; func.instrs.len()];
        let mut block = func.entry;

        let eval = |values: &[Option<u64>], v: Value| -> Result<u64, Trap> {
            match v {
                Value::Instr(id) => values
                    .get(id.as_usize())
                    .copied()
                    .flatten()
                    .ok_or(Trap::UndefinedValue),
                Value::Param(i) => args.get(i as usize).copied().ok_or(Trap::UndefinedValue),
                Value::ConstInt(i) => Ok(i as u64),
                Value::FuncAddr(f) => Ok(encode_fn(f)),
                Value::Null => Ok(0),
            }
        };

        loop {
            let mut next_block = None;
            for &iid in &func.block(block).instrs {
                self.steps += 1;
                if self.steps > self.step_limit {
                    return Err(Trap::StepLimit);
                }

                let result = match &func.instr(iid).op {
                    Op::Nop => None,
                    Op::Alloca { ty } => {
                        let size = module.types.size_words(*ty) as u64;
                        let addr = self.sp;
                        for off in 0..size {
                            self.mem.store(addr + off, 0)?;
                        }
                        self.sp = addr + size;
                        Some(addr)
                    }
                    Op::Load { ptr } => {
                        let addr = eval(&values, *ptr)?;
                        Some(self.mem.load(addr)?)
                    }
                    Op::Store { ptr, value } => {
                        let addr = eval(&values, *ptr)?;
                        let word = eval(&values, *value)?;
                        self.mem.store(addr, word)?;
                        None
                    }
                    Op::FieldAddr {
                        base,
                        struct_ty,
                        field,
                    } => {
                        let addr = eval(&values, *base)?;
                        let sid = module
                            .types
                            .as_struct(*struct_ty)
                            .expect("FieldAddr on a non-struct type");
                        Some(addr + module.types.field_offset(sid, *field) as u64)
                    }
                    Op::IndexAddr { base, index } => {
                        let addr = eval(&values, *base)?;
                        let off = eval(&values, *index)?;
                        Some(addr.wrapping_add(off))
                    }
                    Op::Cast { value, .. } => Some(eval(&values, *value)?),
                    Op::Binary { op, lhs, rhs } => {
                        let a = eval(&values, *lhs)?;
                        let b = eval(&values, *rhs)?;
                        Some(match op {
                            BinaryOp::Add => a.wrapping_add(b),
                            BinaryOp::Sub => a.wrapping_sub(b),
                            BinaryOp::Mul => a.wrapping_mul(b),
                            BinaryOp::Eq => (a == b) as u64,
                            BinaryOp::Lt => ((a as i64) < (b as i64)) as u64,
                        })
                    }
                    Op::Call { callee, args: call_args } => {
                        let mut argv = Vec::with_capacity(call_args.len());
                        for &a in call_args {
                            argv.push(eval(&values, a)?);
                        }
                        match callee {
                            Callee::Local(f) => Some(self.exec(module, *f, &argv, depth + 1)?),
                            Callee::Opaque(symbol) => Some(self.call_opaque(symbol, &argv)?),
                            Callee::Runtime(rt) => self.call_runtime(*rt, &argv)?,
                        }
                    }
                    Op::CallIndirect { target, args: call_args } => {
                        let word = eval(&values, *target)?;
                        let callee = decode_fn(module, word)
                            .ok_or(Trap::BadFunctionPointer { word })?;
                        let mut argv = Vec::with_capacity(call_args.len());
                        for &a in call_args {
                            argv.push(eval(&values, a)?);
                        }
                        Some(self.exec(module, callee, &argv, depth + 1)?)
                    }
                    Op::Br { target } => {
                        next_block = Some(*target);
                        None
                    }
                    Op::CondBr {
                        cond,
                        then_block,
                        else_block,
                    } => {
                        let c = eval(&values, *cond)?;
                        next_block = Some(if c != 0 { *then_block } else { *else_block });
                        None
                    }
                    Op::Ret { value } => {
                        let result = match value {
                            Some(v) => eval(&values, *v)?,
                            None => 0,
                        };
                        self.sp = frame_base;
                        return Ok(result);
                    }
                };

                if let Some(word) = result {
                    values[iid.as_usize()] = Some(word);
                }
                if next_block.is_some() {
                    break;
                }
            }

            match next_block {
                Some(b) => block = b,
                None => return Err(Trap::MissingTerminator),
            }
        }
    }

    fn call_opaque(&mut self, symbol: &Arc<str>, argv: &[u64]) -> Result<u64, Trap> {
        let mut handler =
            self.handlers
                .remove(symbol)
                .ok_or_else(|| Trap::UnknownExternal {
                    symbol: symbol.to_string(),
                })?;
        let result = handler(&mut self.mem, argv);
        self.handlers.insert(symbol.clone(), handler);
        Ok(result)
    }

    /// Dispatch a safe-region intrinsic. Returns the produced word, or
    /// `None` for the void operations.
    fn call_runtime(&mut self, rt: RtFn, argv: &[u64]) -> Result<Option<u64>, Trap> {
        let arg = |i: usize| -> Result<u64, Trap> {
            argv.get(i).copied().ok_or(Trap::UndefinedValue)
        };
        match rt {
            RtFn::Allocate => Ok(Some(self.region.allocate().index() as u64)),
            RtFn::Store => {
                let h = Handle::from_index(arg(0)? as u32);
                self.region.store(h, arg(1)?);
                Ok(None)
            }
            RtFn::Load => {
                let h = Handle::from_index(arg(0)? as u32);
                Ok(Some(self.region.load(h)))
            }
            RtFn::AllocateWithShadow => {
                let origin = arg(0)?;
                let current = self.mem.load(origin)?;
                Ok(Some(self.region.allocate_with_shadow(current).index() as u64))
            }
            RtFn::LoadVerified => {
                let h = Handle::from_index(arg(0)? as u32);
                let origin = arg(1)?;
                let current = self.mem.load(origin)?;
                Ok(Some(self.region.load_verified(h, current)?))
            }
            RtFn::Checkpoint => Ok(Some(self.region.checkpoint() as u64)),
            RtFn::Restore => {
                self.region.restore(arg(0)? as u32);
                Ok(None)
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
