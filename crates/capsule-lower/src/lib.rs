#![deny(unused_must_use)]
#![warn(clippy::dbg_macro, clippy::todo, clippy::unimplemented)]
#![forbid(unsafe_code)]

//! Closure-environment synthesis.
//!
//! Pipeline for one unit: [`bind_module`] produces a validated [`ScopeTree`];
//! [`lower_unit`] then runs capture analysis, environment planning,
//! synthesis (reconciled against an optional [`GenerationBaseline`]) and the
//! body rewrite, returning a [`LoweredUnit`] or nothing at all.

pub mod bind;
pub mod capture;
mod error;
pub mod generation;
pub mod hir;
pub mod lir;
pub mod naming;
mod options;
pub mod plan;
mod rewrite;
pub mod scope;
pub mod synth;
mod types;

pub use bind::bind_module;
pub use capture::{Capture, CaptureAnalysis};
pub use error::{BindError, LowerError};
pub use generation::{Degradation, GenerationBaseline, GenerationReport, Transition};
pub use lir::LoweredUnit;
pub use options::{LowerOptions, MergePolicy};
pub use plan::{EnvIdentity, EnvironmentPlan, Representation};
pub use scope::ScopeTree;
pub use synth::EnvType;
pub use types::Ty;

use tracing::debug;

/// Lower one unit. Either every environment, function and lambda is
/// produced, or an error is returned and nothing is.
pub fn lower_unit(
    tree: &ScopeTree,
    options: &LowerOptions,
    baseline: Option<&GenerationBaseline>,
) -> Result<LoweredUnit, LowerError> {
    tree.validate()?;
    if let Some(b) = baseline {
        if b.unit != tree.unit {
            return Err(LowerError::Structural {
                msg: format!(
                    "baseline belongs to unit '{}', not '{}'",
                    b.unit, tree.unit
                ),
            });
        }
    }
    let analysis = CaptureAnalysis::analyze(tree)?;
    let plan = plan::plan_environments(tree, &analysis, options)?;
    let synthesis = synth::synthesize(tree, &plan, options, baseline)?;
    let unit = rewrite::rewrite_unit(tree, &plan, synthesis)?;
    debug!(
        unit = %unit.unit,
        generation = unit.generation,
        envs = unit.envs.len(),
        lambdas = unit.lambdas.len(),
        degraded = unit.report.degraded.len(),
        "unit lowered"
    );
    Ok(unit)
}

/// Lower independent units in parallel. Each unit owns its naming counter and
/// symbol table, so the results equal lowering them one by one.
pub fn lower_units(
    units: &[(ScopeTree, Option<GenerationBaseline>)],
    options: &LowerOptions,
) -> Vec<Result<LoweredUnit, LowerError>> {
    std::thread::scope(|s| {
        let handles: Vec<_> = units
            .iter()
            .map(|(tree, baseline)| s.spawn(move || lower_unit(tree, options, baseline.as_ref())))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(LowerError::Structural {
                        msg: "lowering worker panicked".to_string(),
                    })
                })
            })
            .collect()
    })
}
