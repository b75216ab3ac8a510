//! Code-pointer integrity transform.
//!
//! Protects function-pointer values (and struct fields holding them)
//! from corruption by memory-safety bugs: their storage is relocated
//! into a safe region addressed only through opaque handles, separate
//! from the stack and heap memory a buffer overflow can reach.
//!
//! The transform runs in three stages over each function, after a single
//! whole-module sensitivity analysis:
//!
//! 1. [`sensitivity`] classifies composite types by their code-pointer
//!    fields, once, into a read-only side table.
//! 2. [`rewrite`] relocates sensitive locals and redirects their
//!    accesses through the runtime, bracketing the function with
//!    checkpoint/restore on every return path.
//! 3. [`boundary`] shadows sensitive fields reached through foreign
//!    pointers and brackets escaping calls with commit/restore.
//!
//! Everything the transform cannot prove safe to rewrite it leaves
//! untouched and reports; see [`report`].

use cpi_ir::{Callee, Module, Op};
use tracing::{debug, info};

pub mod boundary;
pub mod report;
pub mod rewrite;
pub mod sensitivity;

pub use report::{FunctionReport, ModuleReport, SkipReason, SkippedSite};
pub use rewrite::FunctionRewriter;
pub use sensitivity::SensitiveFieldMap;

// =============================================================================
// Pass Interface
// =============================================================================

/// A whole-module transformation pass.
pub trait ModulePass {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Run over a module. Returns whether anything changed.
    fn run(&mut self, module: &mut Module) -> bool;
}

// =============================================================================
// CPI Pass
// =============================================================================

/// The code-pointer-integrity pass.
#[derive(Debug, Default)]
pub struct CpiPass {
    report: ModuleReport,
}

impl CpiPass {
    /// Create the pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// The report from the most recent run.
    pub fn report(&self) -> &ModuleReport {
        &self.report
    }

    /// Consume the pass, keeping the report.
    pub fn into_report(self) -> ModuleReport {
        self.report
    }
}

impl ModulePass for CpiPass {
    fn name(&self) -> &'static str {
        "cpi"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        let map = SensitiveFieldMap::build(&module.types);
        debug!(sensitive_types = map.len(), "sensitivity analysis complete");

        let mut reports = Vec::new();
        let Module {
            ref types,
            ref mut functions,
        } = *module;

        for (_, func) in functions.iter_mut() {
            // Input programs never contain runtime intrinsics, so their
            // presence means this function has already been rewritten;
            // one application is a fixed point.
            if already_instrumented(func) {
                debug!(function = %func.name, "already instrumented, skipping");
                reports.push(FunctionReport::new(func.name.clone()));
                continue;
            }

            let mut rw = FunctionRewriter::new(func, types, &map);
            rw.relocate_locals();
            rw.shadow_foreign_params();
            rw.sync_escaping_calls();
            reports.push(rw.finish());
        }

        self.report = ModuleReport { functions: reports };
        info!(
            relocated = self.report.total_relocated(),
            shadowed = self.report.total_shadowed(),
            synced_calls = self.report.total_synced_calls(),
            skipped = self.report.total_skipped(),
            "cpi transform complete"
        );
        self.report.changed()
    }
}

/// Whether a function already contains safe-region intrinsic calls.
fn already_instrumented(func: &cpi_ir::Function) -> bool {
    func.instrs.iter().any(|(_, instr)| {
        matches!(
            &instr.op,
            Op::Call {
                callee: Callee::Runtime(_),
                ..
            }
        )
    })
}

/// Convenience entry point: run the pass once and return its report.
pub fn instrument(module: &mut Module) -> ModuleReport {
    let mut pass = CpiPass::new();
    pass.run(module);
    pass.into_report()
}
