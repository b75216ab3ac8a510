//! Boundary synchronization.
//!
//! The allocation rewriter makes locally-created sensitive values safe.
//! Two cases remain, both involving memory the transform does not own:
//!
//! **Foreign-origin sensitive pointers**: a sensitive-struct pointer
//! received as a parameter points at storage owned elsewhere. Its
//! sensitive fields get *shadowed* handles: the slot is initialized from
//! the origin, every write goes to both the slot and the origin, and
//! every read is served from the slot after verifying it against the
//! origin. Foreign code that never learned about the indirection keeps
//! seeing correct values at the original location; the price is weaker
//! protection for this value class, which is a documented limitation
//! rather than something to paper over.
//!
//! **Escapes into calls the transform cannot see through**: when a
//! relocated aggregate's address (or a shadowed pointer) is passed to a
//! call, the callee reads and may write the original location. Each such
//! call is bracketed: a *commit* copies slot → origin immediately before
//! the call, a *restore* copies origin → slot immediately after. This is
//! correct across exactly one call boundary; reentrant callees, aliasing
//! through other pointers during the call, and concurrent access are out
//! of scope. Calls to module-local functions get the same bracketing:
//! the analysis is intra-procedural, and the callee's own shadowing
//! discipline reads and mirrors the origin, so the bracket is what keeps
//! the two sides coherent.
//!
//! An aggregate that escapes into a call *and* has its address taken in
//! an unrecognized way is not synchronized at all: the combination's
//! correct policy is undetermined, so it is flagged instead of inferred.

use crate::report::SkipReason;
use crate::rewrite::{classify_uses, FunctionRewriter, ShadowedField, UseKind};

use cpi_ir::{Args, Callee, CastKind, InstrId, Op, RtFn, TypeId, Value};
use tracing::{debug, warn};

impl FunctionRewriter<'_> {
    // =========================================================================
    // Foreign-Origin Parameters
    // =========================================================================

    /// Shadow every sensitive field accessed through a sensitive-struct
    /// pointer parameter.
    pub fn shadow_foreign_params(&mut self) {
        let params: Vec<(u32, TypeId)> = self
            .func
            .params
            .iter()
            .enumerate()
            .filter_map(|(i, &ty)| {
                let pointee = self.types.pointee(ty)?;
                self.map
                    .is_sensitive_struct(pointee)
                    .then_some((i as u32, pointee))
            })
            .collect();

        for (param, pointee) in params {
            let base = Value::Param(param);

            // Dynamic indexing through the foreign pointer is the same
            // soundness gap as for locals: unprotected, reported, and a
            // bar to synchronizing the pointer across calls.
            for use_id in self.func.uses_of(base) {
                if matches!(&self.func.instr(use_id).op, Op::IndexAddr { base: b, .. } if *b == base)
                {
                    warn!(
                        function = %self.func.name,
                        instr = %use_id,
                        "dynamically indexed access through sensitive-struct pointer"
                    );
                    self.report.skip(use_id, SkipReason::DynamicFieldIndex);
                    self.tainted_params.insert(param);
                }
            }

            let sensitive: Vec<u32> = self
                .map
                .fields_of(pointee)
                .expect("sensitive pointee without field set")
                .to_vec();

            for field in sensitive {
                let fa_sites: Vec<InstrId> = self
                    .func
                    .instrs
                    .iter()
                    .filter(|(_, instr)| {
                        matches!(
                            &instr.op,
                            Op::FieldAddr { base: b, field: f, .. } if *b == base && *f == field
                        )
                    })
                    .map(|(id, _)| id)
                    .collect();
                if fa_sites.is_empty() {
                    continue;
                }

                // Materialize the origin address once at entry and seed
                // the shadowed slot from it.
                let origin_fa = self.func.add_instr(Op::FieldAddr {
                    base,
                    struct_ty: pointee,
                    field,
                });
                self.prelude.push(origin_fa);
                let origin = Value::Instr(origin_fa);

                let handle_call = self.func.add_instr(Op::Call {
                    callee: Callee::Runtime(RtFn::AllocateWithShadow),
                    args: Args::from_slice(&[origin]),
                });
                self.prelude.push(handle_call);
                let handle = Value::Instr(handle_call);

                self.shadowed.push(ShadowedField {
                    param,
                    origin,
                    handle,
                });
                self.report.shadowed += 1;
                debug!(
                    function = %self.func.name,
                    param,
                    field,
                    "shadowing foreign-origin sensitive field"
                );

                for fa in fa_sites {
                    let fa_val = Value::Instr(fa);
                    for (site, kind) in classify_uses(self.func, fa_val) {
                        match kind {
                            UseKind::Load => {
                                self.rewrite_verified_load_site(site, handle, origin)
                            }
                            UseKind::Store { .. } => {
                                self.rewrite_store_site(site, handle, Some(origin))
                            }
                            UseKind::CallArg | UseKind::Other => {
                                warn!(
                                    function = %self.func.name,
                                    instr = %site,
                                    "unrecognized use of foreign sensitive field address"
                                );
                                self.report.skip(site, SkipReason::UnrecognizedUse);
                                self.tainted_params.insert(param);
                            }
                        }
                    }
                    if self.func.uses_of(fa_val).is_empty() {
                        self.kill_site(fa);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Escaping Calls
    // =========================================================================

    /// Bracket every call that can observe relocated storage with
    /// commit/restore pairs.
    pub fn sync_escaping_calls(&mut self) {
        let call_sites: Vec<(InstrId, Vec<Value>)> = self
            .func
            .instrs
            .iter()
            .filter_map(|(id, instr)| match &instr.op {
                Op::Call { callee, args } if !matches!(callee, Callee::Runtime(_)) => {
                    Some((id, args.to_vec()))
                }
                Op::CallIndirect { args, .. } => Some((id, args.to_vec())),
                _ => None,
            })
            .collect();

        for (call, args) in call_sites {
            let mut synced = false;

            // Relocated aggregates whose base address is an argument.
            let mut escaping_allocas: Vec<InstrId> = self
                .relocated
                .iter()
                .filter(|r| args.contains(&Value::Instr(r.alloca)))
                .map(|r| r.alloca)
                .collect();
            escaping_allocas.dedup();

            for alloca in escaping_allocas {
                if self.tainted_allocas.contains(&alloca) {
                    warn!(
                        function = %self.func.name,
                        instr = %call,
                        "aggregate escapes with independently taken address; not synchronized"
                    );
                    self.report.skip(call, SkipReason::EscapeWithAddressTaken);
                    continue;
                }
                let fields: Vec<(TypeId, u32, Value)> = self
                    .relocated
                    .iter()
                    .filter(|r| r.alloca == alloca)
                    .map(|r| (r.struct_ty, r.field, r.handle))
                    .collect();
                for (struct_ty, field, handle) in fields {
                    let origin = self.func.add_instr(Op::FieldAddr {
                        base: Value::Instr(alloca),
                        struct_ty,
                        field,
                    });
                    self.emit_commit(call, Some(origin), Value::Instr(origin), handle);
                    self.emit_restore(call, Value::Instr(origin), handle);
                }
                synced = true;
            }

            // Shadowed foreign pointers passed onward.
            let escaping_shadows: Vec<ShadowedField> = self
                .shadowed
                .iter()
                .filter(|s| args.contains(&Value::Param(s.param)))
                .copied()
                .collect();

            for shadow in escaping_shadows {
                if self.tainted_params.contains(&shadow.param) {
                    warn!(
                        function = %self.func.name,
                        instr = %call,
                        "foreign pointer escapes with independently taken address; not synchronized"
                    );
                    self.report.skip(call, SkipReason::EscapeWithAddressTaken);
                    continue;
                }
                self.emit_commit(call, None, shadow.origin, shadow.handle);
                self.emit_restore(call, shadow.origin, shadow.handle);
                synced = true;
            }

            if synced {
                self.report.synced_calls += 1;
                debug!(function = %self.func.name, instr = %call, "synchronized escaping call");
            }
        }
    }

    /// Commit: copy the handle's slot to the foreign location, right
    /// before the call. `origin_fa` is a freshly created field-address
    /// instruction to place first, if one was needed.
    fn emit_commit(
        &mut self,
        call: InstrId,
        origin_fa: Option<InstrId>,
        origin: Value,
        handle: Value,
    ) {
        let ld = self.func.add_instr(Op::Call {
            callee: Callee::Runtime(RtFn::Load),
            args: Args::from_slice(&[handle]),
        });
        let cast = self.func.add_instr(Op::Cast {
            kind: CastKind::WordToFnPtr,
            value: Value::Instr(ld),
        });
        let st = self.func.add_instr(Op::Store {
            ptr: origin,
            value: Value::Instr(cast),
        });
        let seq = self.before.entry(call).or_default();
        if let Some(fa) = origin_fa {
            seq.push(fa);
        }
        seq.push(ld);
        seq.push(cast);
        seq.push(st);
    }

    /// Restore: copy the (possibly externally modified) foreign location
    /// back into the handle's slot, right after the call returns.
    fn emit_restore(&mut self, call: InstrId, origin: Value, handle: Value) {
        let ld = self.func.add_instr(Op::Load { ptr: origin });
        let cast = self.func.add_instr(Op::Cast {
            kind: CastKind::FnPtrToWord,
            value: Value::Instr(ld),
        });
        let st = self.func.add_instr(Op::Call {
            callee: Callee::Runtime(RtFn::Store),
            args: Args::from_slice(&[handle, Value::Instr(cast)]),
        });
        let seq = self.after.entry(call).or_default();
        seq.push(ld);
        seq.push(cast);
        seq.push(st);
    }
}
