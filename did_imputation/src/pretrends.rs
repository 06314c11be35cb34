//! Pre-trend test: leads of treatment in the no-treatment model.
//!
//! Under parallel trends the coefficients on `1{event_time = k}`, `k < 0`, fitted on
//! untreated observations alongside the first-stage model, should be zero.

use crate::first_stage::{FirstStageRequest, FixedEffectsSolver};
use crate::panel::{Covariate, EventTime, Panel};
use crate::ImputationError;
use tracing::{info, warn};

/// Coefficient on one lead of treatment.
#[derive(Debug, Clone, PartialEq)]
pub struct PretrendEstimate {
    pub event_time: i64,
    pub estimate: f64,
    /// Native standard error of the solver, clustered by unit.
    pub std_error: f64,
}

fn dummy_name(k: i64) -> String {
    format!("event_time::{}", k)
}

/// Refits the first stage on untreated rows with one indicator per lead in `leads`.
///
/// Leads whose indicator the solver drops as collinear are left out of the result.
pub fn estimate_pretrends(
    solver: &dyn FixedEffectsSolver,
    panel: &Panel,
    leads: &[i64],
) -> Result<Vec<PretrendEstimate>, ImputationError> {
    let mut covariates = panel.covariates.clone();
    covariates.extend(leads.iter().map(|&k| Covariate {
        name: dummy_name(k),
        values: panel
            .event_time
            .iter()
            .map(|&e| if e == EventTime::Finite(k) { 1.0 } else { 0.0 })
            .collect(),
    }));

    let untreated = panel.untreated_rows();
    info!(leads = leads.len(), "fitting pre-trend coefficients");
    let fit = solver.fit(&FirstStageRequest {
        outcome: &panel.outcome,
        covariates: &covariates,
        factors: &panel.factors,
        subset: &untreated,
        weights: &panel.row_weights,
        cluster: Some(&panel.unit),
    })?;

    let mut estimates = Vec::with_capacity(leads.len());
    for &k in leads {
        match fit.coefficient(&dummy_name(k)) {
            Some(coef) => estimates.push(PretrendEstimate {
                event_time: k,
                estimate: coef.estimate,
                std_error: coef.std_error,
            }),
            None => warn!(
                event_time = k,
                "pre-trend indicator is collinear with the fixed effects; omitted"
            ),
        }
    }
    Ok(estimates)
}
