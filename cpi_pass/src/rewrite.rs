//! Allocation rewriting.
//!
//! Relocates sensitive locals out of ordinary stack storage and into the
//! safe region, one function at a time. Detection is restricted to the
//! entry block, the only legal home for local-scope allocations:
//!
//! - **Raw function-pointer locals** are replaced outright: the alloca
//!   becomes a runtime `allocate()`, loads become `load(handle)` plus a
//!   representation cast, stores become a cast plus `store(handle, w)`.
//! - **Sensitive struct locals** keep their alloca and layout; only the
//!   constant-index accesses to code-pointer fields are redirected, one
//!   handle per (instance, field) pair. Non-sensitive fields are never
//!   touched.
//!
//! Anything that is not a direct load, direct store, or constant-index
//! field access is left exactly as it was and reported, never guessed.
//! A raw local whose address is passed into a call is excluded entirely;
//! rewriting it would be unsound.
//!
//! Rewrites are staged: new instructions are arena-allocated up front,
//! recorded as insertions relative to existing sites, and spliced into
//! the block lists in a single pass by [`FunctionRewriter::finish`],
//! which also brackets the function with `checkpoint()`/`restore()` on
//! every return path.

use crate::report::{FunctionReport, SkipReason};
use crate::sensitivity::SensitiveFieldMap;

use cpi_ir::{
    Args, BlockId, Callee, CastKind, Function, InstrId, Op, RtFn, Type, TypeId, TypeTable, Value,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

// =============================================================================
// Use Classification
// =============================================================================

/// How a site uses a sensitive address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UseKind {
    /// Direct load through the address.
    Load,
    /// Direct store through the address; carries the stored value.
    Store {
        /// The value being written.
        value: Value,
    },
    /// The address itself passed as a call argument.
    CallArg,
    /// Anything else.
    Other,
}

/// Classify every live use of `addr` in `func`.
pub(crate) fn classify_uses(func: &Function, addr: Value) -> Vec<(InstrId, UseKind)> {
    let mut out = Vec::new();
    for id in func.uses_of(addr) {
        let kind = match &func.instr(id).op {
            Op::Load { ptr } if *ptr == addr => UseKind::Load,
            Op::Store { ptr, value } if *ptr == addr && *value != addr => {
                UseKind::Store { value: *value }
            }
            Op::Call { callee, args } if !matches!(callee, Callee::Runtime(_)) => {
                if args.contains(&addr) {
                    UseKind::CallArg
                } else {
                    UseKind::Other
                }
            }
            Op::CallIndirect { args, .. } if args.contains(&addr) => UseKind::CallArg,
            _ => UseKind::Other,
        };
        out.push((id, kind));
    }
    out
}

// =============================================================================
// Relocation Records
// =============================================================================

/// A struct field redirected into the safe region, keyed by its owning
/// local. The synchronizer uses these to bracket escaping calls.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelocatedField {
    /// The aggregate's alloca.
    pub alloca: InstrId,
    /// The composite type.
    pub struct_ty: TypeId,
    /// The field index.
    pub field: u32,
    /// The handle value backing the field.
    pub handle: Value,
}

/// A foreign-origin field mirrored by a shadowed handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShadowedField {
    /// The parameter the origin is reached through.
    pub param: u32,
    /// The origin address (an entry-block field address).
    pub origin: Value,
    /// The shadowed handle value.
    pub handle: Value,
}

// =============================================================================
// Function Rewriter
// =============================================================================

/// Per-function rewriting state shared by the allocation rewriter and
/// the boundary synchronizer.
pub struct FunctionRewriter<'a> {
    pub(crate) func: &'a mut Function,
    pub(crate) types: &'a TypeTable,
    pub(crate) map: &'a SensitiveFieldMap,
    /// Instructions to splice at the front of the entry block, in order.
    pub(crate) prelude: Vec<InstrId>,
    /// Site → instructions to insert immediately before it.
    pub(crate) before: FxHashMap<InstrId, Vec<InstrId>>,
    /// Site → instructions to insert immediately after it.
    pub(crate) after: FxHashMap<InstrId, Vec<InstrId>>,
    /// Sites to unlink from their blocks.
    pub(crate) killed: FxHashSet<InstrId>,
    /// Relocated (instance, field) pairs.
    pub(crate) relocated: Vec<RelocatedField>,
    /// Shadowed foreign-origin fields.
    pub(crate) shadowed: Vec<ShadowedField>,
    /// Aggregates with unrecognized uses; synchronization for these is
    /// undetermined and is refused rather than inferred.
    pub(crate) tainted_allocas: FxHashSet<InstrId>,
    /// Parameters with unrecognized field-address uses, likewise.
    pub(crate) tainted_params: FxHashSet<u32>,
    pub(crate) report: FunctionReport,
}

impl<'a> FunctionRewriter<'a> {
    /// Start rewriting one function.
    pub fn new(func: &'a mut Function, types: &'a TypeTable, map: &'a SensitiveFieldMap) -> Self {
        let report = FunctionReport::new(func.name.clone());
        FunctionRewriter {
            func,
            types,
            map,
            prelude: Vec::new(),
            before: FxHashMap::default(),
            after: FxHashMap::default(),
            killed: FxHashSet::default(),
            relocated: Vec::new(),
            shadowed: Vec::new(),
            tainted_allocas: FxHashSet::default(),
            tainted_params: FxHashSet::default(),
            report,
        }
    }

    // =========================================================================
    // Shared Rewrite Machinery
    // =========================================================================

    /// Tombstone a site and mark it for unlinking at splice time. Its
    /// position is retained until then so relative insertions still
    /// resolve.
    pub(crate) fn kill_site(&mut self, id: InstrId) {
        self.func.instr_mut(id).op = Op::Nop;
        self.killed.insert(id);
    }

    /// Emit a fresh safe-region `allocate()` in the entry prelude.
    pub(crate) fn prelude_allocate(&mut self) -> Value {
        let id = self.func.add_instr(Op::Call {
            callee: Callee::Runtime(RtFn::Allocate),
            args: Args::new(),
        });
        self.prelude.push(id);
        Value::Instr(id)
    }

    /// Rewrite a direct load site to `load(handle)` plus a cast back to
    /// the pointer representation.
    pub(crate) fn rewrite_load_site(&mut self, site: InstrId, handle: Value) {
        let rt = self.func.add_instr(Op::Call {
            callee: Callee::Runtime(RtFn::Load),
            args: Args::from_slice(&[handle]),
        });
        let cast = self.func.add_instr(Op::Cast {
            kind: CastKind::WordToFnPtr,
            value: Value::Instr(rt),
        });
        self.func
            .replace_all_uses(Value::Instr(site), Value::Instr(cast));
        self.before.entry(site).or_default().extend([rt, cast]);
        self.kill_site(site);
    }

    /// Rewrite a verified load site for a shadowed handle.
    pub(crate) fn rewrite_verified_load_site(
        &mut self,
        site: InstrId,
        handle: Value,
        origin: Value,
    ) {
        let rt = self.func.add_instr(Op::Call {
            callee: Callee::Runtime(RtFn::LoadVerified),
            args: Args::from_slice(&[handle, origin]),
        });
        let cast = self.func.add_instr(Op::Cast {
            kind: CastKind::WordToFnPtr,
            value: Value::Instr(rt),
        });
        self.func
            .replace_all_uses(Value::Instr(site), Value::Instr(cast));
        self.before.entry(site).or_default().extend([rt, cast]);
        self.kill_site(site);
    }

    /// Rewrite a direct store site to a representation cast plus
    /// `store(handle, w)`. With `mirror`, the original value is also
    /// written to the foreign origin so code that bypasses the
    /// indirection keeps a coherent view.
    pub(crate) fn rewrite_store_site(&mut self, site: InstrId, handle: Value, mirror: Option<Value>) {
        let value = match &self.func.instr(site).op {
            Op::Store { value, .. } => *value,
            other => unreachable!("store rewrite on non-store op {:?}", other),
        };
        let cast = self.func.add_instr(Op::Cast {
            kind: CastKind::FnPtrToWord,
            value,
        });
        let rt = self.func.add_instr(Op::Call {
            callee: Callee::Runtime(RtFn::Store),
            args: Args::from_slice(&[handle, Value::Instr(cast)]),
        });
        let seq = self.before.entry(site).or_default();
        seq.push(cast);
        seq.push(rt);
        if let Some(origin) = mirror {
            let raw = self.func.add_instr(Op::Store { ptr: origin, value });
            self.before.entry(site).or_default().push(raw);
        }
        self.kill_site(site);
    }

    // =========================================================================
    // Local Relocation
    // =========================================================================

    /// Find and relocate every sensitive local created in the entry
    /// block.
    pub fn relocate_locals(&mut self) {
        let entry_ids: Vec<InstrId> = self.func.block(self.func.entry).instrs.clone();
        for id in entry_ids {
            let ty = match &self.func.instr(id).op {
                Op::Alloca { ty } => *ty,
                _ => continue,
            };
            match self.types.get(ty) {
                Type::FnPtr => self.relocate_raw_local(id),
                Type::Struct(_) if self.map.is_sensitive_struct(ty) => {
                    self.relocate_struct_local(id, ty)
                }
                _ => {}
            }
        }
    }

    fn relocate_raw_local(&mut self, alloca: InstrId) {
        let addr = Value::Instr(alloca);
        let uses = classify_uses(self.func, addr);

        if uses.iter().any(|(_, k)| matches!(k, UseKind::CallArg)) {
            warn!(
                function = %self.func.name,
                instr = %alloca,
                "address of function-pointer local escapes into a call; left unprotected"
            );
            self.report.skip(alloca, SkipReason::EscapingAddress);
            return;
        }

        let handle = self.prelude_allocate();
        debug!(function = %self.func.name, instr = %alloca, "relocating function-pointer local");

        for (site, kind) in uses {
            match kind {
                UseKind::Load => self.rewrite_load_site(site, handle),
                UseKind::Store { .. } => self.rewrite_store_site(site, handle, None),
                UseKind::CallArg => unreachable!("escaping locals are excluded above"),
                UseKind::Other => {
                    warn!(
                        function = %self.func.name,
                        instr = %site,
                        "unrecognized use of relocated local; site left unmodified"
                    );
                    self.report.skip(site, SkipReason::UnrecognizedUse);
                    self.tainted_allocas.insert(alloca);
                }
            }
        }
        self.report.relocated += 1;

        // The original allocation goes away only once nothing refers to
        // its address any more.
        if self.func.uses_of(addr).is_empty() {
            self.kill_site(alloca);
        }
    }

    fn relocate_struct_local(&mut self, alloca: InstrId, struct_ty: TypeId) {
        let addr = Value::Instr(alloca);
        let sensitive: Vec<u32> = self
            .map
            .fields_of(struct_ty)
            .expect("struct classified sensitive without field set")
            .to_vec();

        // Uses of the aggregate base that are not constant-index field
        // accesses. Escapes into calls are legal here (the synchronizer
        // brackets them); everything else unexpected taints the
        // instance.
        for use_id in self.func.uses_of(addr) {
            let unrecognized = match &self.func.instr(use_id).op {
                Op::FieldAddr { base, .. } if *base == addr => false,
                Op::IndexAddr { base, .. } if *base == addr => {
                    warn!(
                        function = %self.func.name,
                        instr = %use_id,
                        "dynamically indexed access into sensitive struct; left unprotected"
                    );
                    self.report.skip(use_id, SkipReason::DynamicFieldIndex);
                    // A dynamic index is also an independently taken
                    // address; synchronizing such an instance across a
                    // call has no determined policy.
                    self.tainted_allocas.insert(alloca);
                    false
                }
                Op::Call { callee, args }
                    if !matches!(callee, Callee::Runtime(_)) && args.contains(&addr) =>
                {
                    false
                }
                Op::CallIndirect { args, .. } if args.contains(&addr) => false,
                Op::Load { ptr } | Op::Store { ptr, .. } if *ptr == addr => {
                    // A word access through the bare base aliases field 0.
                    sensitive.contains(&0)
                }
                _ => true,
            };
            if unrecognized {
                warn!(
                    function = %self.func.name,
                    instr = %use_id,
                    "unrecognized use of sensitive struct local"
                );
                self.report.skip(use_id, SkipReason::UnrecognizedUse);
                self.tainted_allocas.insert(alloca);
            }
        }

        for field in sensitive {
            let fa_sites: Vec<InstrId> = self
                .func
                .instrs
                .iter()
                .filter(|(_, instr)| {
                    matches!(
                        &instr.op,
                        Op::FieldAddr { base, field: f, .. } if *base == addr && *f == field
                    )
                })
                .map(|(id, _)| id)
                .collect();
            if fa_sites.is_empty() {
                continue;
            }

            let handle = self.prelude_allocate();
            self.relocated.push(RelocatedField {
                alloca,
                struct_ty,
                field,
                handle,
            });
            self.report.relocated += 1;
            debug!(
                function = %self.func.name,
                instr = %alloca,
                field,
                "relocating sensitive struct field"
            );

            for fa in fa_sites {
                let fa_val = Value::Instr(fa);
                for (site, kind) in classify_uses(self.func, fa_val) {
                    match kind {
                        UseKind::Load => self.rewrite_load_site(site, handle),
                        UseKind::Store { .. } => self.rewrite_store_site(site, handle, None),
                        UseKind::CallArg | UseKind::Other => {
                            warn!(
                                function = %self.func.name,
                                instr = %site,
                                "unrecognized use of sensitive field address"
                            );
                            self.report.skip(site, SkipReason::UnrecognizedUse);
                            self.tainted_allocas.insert(alloca);
                        }
                    }
                }
                if self.func.uses_of(fa_val).is_empty() {
                    self.kill_site(fa);
                }
            }
        }
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Bracket the function with `checkpoint()`/`restore()` if anything
    /// was relocated, splice all staged insertions, and hand back the
    /// report.
    pub fn finish(mut self) -> FunctionReport {
        if !self.prelude.is_empty() {
            let cp = self.func.add_instr(Op::Call {
                callee: Callee::Runtime(RtFn::Checkpoint),
                args: Args::new(),
            });
            self.prelude.insert(0, cp);

            // Every return path restores the cursor captured at entry.
            for ret in self.func.return_sites() {
                let restore = self.func.add_instr(Op::Call {
                    callee: Callee::Runtime(RtFn::Restore),
                    args: Args::from_slice(&[Value::Instr(cp)]),
                });
                self.before.entry(ret).or_default().push(restore);
            }
            self.report.changed = true;
        }
        self.splice();
        self.report
    }

    fn splice(&mut self) {
        let block_ids: Vec<BlockId> = self.func.blocks.ids().collect();
        for bid in block_ids {
            let old = std::mem::take(&mut self.func.block_mut(bid).instrs);
            let mut new = Vec::with_capacity(old.len() + self.prelude.len());
            if bid == self.func.entry {
                new.append(&mut self.prelude);
            }
            for id in old {
                if let Some(pre) = self.before.remove(&id) {
                    new.extend(pre);
                }
                if !self.killed.contains(&id) {
                    new.push(id);
                }
                if let Some(post) = self.after.remove(&id) {
                    new.extend(post);
                }
            }
            self.func.block_mut(bid).instrs = new;
        }
        debug_assert!(self.before.is_empty(), "insertions against unlinked sites");
        debug_assert!(self.after.is_empty(), "insertions against unlinked sites");
    }
}
