//! The no-treatment model: linear regression with absorbed fixed effects.
//!
//! `FixedEffectsSolver` is the seam to the first-stage fitting routine. The crate
//! ships `DemeanSolver`, which partials the fixed effects out of the outcome and the
//! covariates by alternating projections (Frisch-Waugh-Lovell), runs weighted least
//! squares on the demeaned data and then recovers the fixed effects.

use crate::math::demean::Absorber;
use crate::math::ols::{cluster_vcov, iid_vcov, ols};
use crate::panel::{Covariate, Factor};
use crate::ImputationError;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

/// Name of the constant column fitted when no factor is absorbed.
pub const INTERCEPT: &str = "(Intercept)";

/// Relative residual norm under which a demeaned covariate or a fixed-effect level
/// counts as collinear.
const COLLINEARITY_TOL: f64 = 1e-9;

/// What the first-stage solver is asked to fit.
#[derive(Debug, Clone, Copy)]
pub struct FirstStageRequest<'a> {
    /// Outcome over all panel rows.
    pub outcome: &'a [f64],
    pub covariates: &'a [Covariate],
    /// Absorbed factors over all panel rows.
    pub factors: &'a [Factor],
    /// Rows the model is estimated on.
    pub subset: &'a [usize],
    /// Observation weights over all panel rows.
    pub weights: &'a [f64],
    /// Cluster for the native standard errors; iid when `None`.
    pub cluster: Option<&'a Factor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetainedCoefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
}

/// Fixed-effect structure kept by the fit for one absorbed factor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedFactor {
    pub name: String,
    /// Effect per level code; `None` for levels absent from the estimation rows.
    pub effects: Vec<Option<f64>>,
    /// Level codes that carry a free parameter. Reference levels, levels spanned by
    /// earlier factors and unseen levels are excluded.
    pub retained: Vec<u32>,
}

/// The fitted first stage.
#[derive(Debug, Clone)]
pub struct FirstStageFit {
    pub coefficients: Vec<RetainedCoefficient>,
    pub fixed_effects: Vec<RetainedFactor>,
    pub n_obs: usize,
    pub converged: bool,
}

impl FirstStageFit {
    pub fn coefficient(&self, name: &str) -> Option<&RetainedCoefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    /// Fitted no-treatment value for every row of the request, including rows outside
    /// the estimation subset. Rows with a level the fit never saw get `NaN`.
    pub fn predict(&self, request: &FirstStageRequest) -> Result<Vec<f64>, ImputationError> {
        let covariates = request.covariates;
        let factors = request.factors;
        let mut fitted = vec![0.0; request.outcome.len()];

        for coef in &self.coefficients {
            if coef.name == INTERCEPT {
                fitted.iter_mut().for_each(|f| *f += coef.estimate);
                continue;
            }
            let column = covariates
                .iter()
                .find(|c| c.name == coef.name)
                .ok_or_else(|| {
                    ImputationError::FirstStageError(format!(
                        "Coefficient '{}' has no matching covariate",
                        coef.name
                    ))
                })?;
            for (f, x) in fitted.iter_mut().zip(&column.values) {
                *f += coef.estimate * x;
            }
        }

        for fe in &self.fixed_effects {
            let factor = factors.iter().find(|f| f.name == fe.name).ok_or_else(|| {
                ImputationError::FirstStageError(format!(
                    "Fixed effect '{}' has no matching factor",
                    fe.name
                ))
            })?;
            for (f, &code) in fitted.iter_mut().zip(&factor.codes) {
                *f += fe
                    .effects
                    .get(code as usize)
                    .copied()
                    .flatten()
                    .unwrap_or(f64::NAN);
            }
        }
        Ok(fitted)
    }
}

/// A linear model with absorbed categorical factors, fitted on a row subset.
pub trait FixedEffectsSolver: Send + Sync + std::fmt::Debug {
    fn fit(&self, request: &FirstStageRequest) -> Result<FirstStageFit, ImputationError>;
}

/// Alternating-projections solver.
#[derive(Debug, Clone)]
pub struct DemeanSolver {
    tolerance: f64,
    max_iters: usize,
}

impl Default for DemeanSolver {
    fn default() -> Self {
        Self::new(1e-10, 10_000)
    }
}

impl DemeanSolver {
    pub fn new(tolerance: f64, max_iters: usize) -> Self {
        Self {
            tolerance,
            max_iters,
        }
    }
}

impl FixedEffectsSolver for DemeanSolver {
    fn fit(&self, request: &FirstStageRequest) -> Result<FirstStageFit, ImputationError> {
        let subset = request.subset;
        let n_obs = subset.len();
        if n_obs == 0 {
            return Err(ImputationError::FirstStageError(
                "Estimation sample is empty".to_string(),
            ));
        }

        let weights: Vec<f64> = subset.iter().map(|&i| request.weights[i]).collect();
        let y: Vec<f64> = subset.iter().map(|&i| request.outcome[i]).collect();

        let mut x_names: Vec<String> = Vec::new();
        let mut x_raw: Vec<Vec<f64>> = Vec::new();
        if request.factors.is_empty() {
            x_names.push(INTERCEPT.to_string());
            x_raw.push(vec![1.0; n_obs]);
        }
        for cov in request.covariates {
            x_names.push(cov.name.clone());
            x_raw.push(subset.iter().map(|&i| cov.values[i]).collect());
        }

        let absorber = Absorber::new(
            request
                .factors
                .iter()
                .map(|f| subset.iter().map(|&i| f.codes[i]).collect())
                .collect(),
            &request
                .factors
                .iter()
                .map(Factor::n_levels)
                .collect::<Vec<_>>(),
            weights.clone(),
            self.tolerance,
            self.max_iters,
        );

        // 1. Partial out the fixed effects.
        let mut converged = true;
        let mut y_resid = y.clone();
        let (sweeps, ok) = absorber.demean(&mut y_resid);
        converged &= ok;
        debug!(sweeps, "demeaned outcome");

        let mut x_resid = x_raw.clone();
        for x in &mut x_resid {
            let (_, ok) = absorber.demean(x);
            converged &= ok;
        }

        // 2. Drop covariates that are collinear with the fixed effects or with
        //    covariates kept before them.
        let kept = independent_columns(&x_resid, &x_raw, &weights);
        for (j, name) in x_names.iter().enumerate() {
            if !kept.contains(&j) {
                debug!(covariate = %name, "dropping collinear covariate");
            }
        }

        // 3. Free fixed-effect levels: every seen level of the first factor. Later
        //    factors lose their first seen level (the reference) and then every level
        //    spanned by the levels before it, such as a factor nested in the first.
        let seen: Vec<Vec<u32>> = request
            .factors
            .iter()
            .enumerate()
            .map(|(k, factor)| {
                (0..factor.n_levels())
                    .filter(|&l| absorber.is_seen(k, l))
                    .map(|l| l as u32)
                    .collect()
            })
            .collect();
        let candidates: Vec<Vec<u32>> = seen
            .iter()
            .enumerate()
            .map(|(k, levels)| levels.iter().skip(usize::from(k > 0)).copied().collect())
            .collect();
        let retained = absorber.independent_levels(&candidates, COLLINEARITY_TOL);
        for (k, (levels, free)) in candidates.iter().zip(&retained).enumerate() {
            let redundant = levels.len() - free.len();
            if redundant > 0 {
                debug!(
                    factor = %request.factors[k].name,
                    redundant,
                    "dropping redundant fixed-effect levels"
                );
            }
        }

        // 4. Weighted least squares on the demeaned data.
        let w_vec = DVector::from_vec(weights.clone());
        let (beta, std_errors) = if kept.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let x_mat = DMatrix::from_fn(n_obs, kept.len(), |r, c| x_resid[kept[c]][r]);
            let y_vec = DVector::from_column_slice(&y_resid);
            let fit = ols(&y_vec, &x_mat, Some(&w_vec))?;
            let vcov = match request.cluster {
                Some(cluster) => {
                    let codes: Vec<u32> = subset.iter().map(|&i| cluster.codes[i]).collect();
                    cluster_vcov(&x_mat, &fit, Some(&w_vec), &codes)
                }
                None => {
                    let absorbed = retained.iter().map(Vec::len).sum();
                    iid_vcov(&fit, Some(&w_vec), absorbed)
                }
            };
            let se = (0..kept.len()).map(|j| vcov[(j, j)].sqrt()).collect();
            (fit.coefficients.iter().copied().collect(), se)
        };

        // 5. Recover the fixed effects from y - Xβ.
        let mut r = y;
        for (b, &j) in beta.iter().zip(&kept) {
            for (ri, x) in r.iter_mut().zip(&x_raw[j]) {
                *ri -= b * x;
            }
        }
        let (mut effects, sweeps, ok) = absorber.recover(&r);
        converged &= ok;
        debug!(sweeps, "recovered fixed effects");
        if !converged {
            warn!(
                max_iters = self.max_iters,
                "alternating projections did not converge; try a larger max_iters"
            );
        }

        // 6. Normalization: every factor after the first has its first seen level as
        //    reference, with the shift moved into the first factor.
        let mut fixed_effects = Vec::with_capacity(request.factors.len());
        let mut shift = 0.0;
        for (k, levels) in seen.iter().enumerate().skip(1) {
            if let Some(&reference) = levels.first() {
                let offset = effects[k][reference as usize];
                effects[k].iter_mut().for_each(|e| *e -= offset);
                shift += offset;
            }
        }
        for (k, (factor, retained)) in request.factors.iter().zip(retained).enumerate() {
            let effects = (0..factor.n_levels())
                .map(|l| {
                    absorber.is_seen(k, l).then(|| {
                        if k == 0 {
                            effects[k][l] + shift
                        } else {
                            effects[k][l]
                        }
                    })
                })
                .collect();
            fixed_effects.push(RetainedFactor {
                name: factor.name.clone(),
                effects,
                retained,
            });
        }

        let coefficients = kept
            .iter()
            .zip(beta.iter().zip(&std_errors))
            .map(|(&j, (&estimate, &std_error))| RetainedCoefficient {
                name: x_names[j].clone(),
                estimate,
                std_error,
            })
            .collect();

        Ok(FirstStageFit {
            coefficients,
            fixed_effects,
            n_obs,
            converged,
        })
    }
}

/// Indices of the demeaned columns that are linearly independent, scanning left to
/// right with weighted Gram-Schmidt.
fn independent_columns(demeaned: &[Vec<f64>], raw: &[Vec<f64>], weights: &[f64]) -> Vec<usize> {
    let wdot = |a: &[f64], b: &[f64]| -> f64 {
        a.iter()
            .zip(b)
            .zip(weights)
            .map(|((x, y), w)| w * x * y)
            .sum()
    };

    let mut basis: Vec<Vec<f64>> = Vec::new();
    let mut kept = Vec::new();
    for (j, column) in demeaned.iter().enumerate() {
        let scale = wdot(&raw[j], &raw[j]);
        let mut resid = column.clone();
        for q in &basis {
            let coef = wdot(q, &resid) / wdot(q, q);
            resid.iter_mut().zip(q).for_each(|(r, qi)| *r -= coef * qi);
        }
        let ss = wdot(&resid, &resid);
        if scale > 0.0 && ss > COLLINEARITY_TOL * scale {
            basis.push(resid);
            kept.push(j);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(name: &str, codes: Vec<u32>, n_levels: usize) -> Factor {
        Factor {
            name: name.to_string(),
            codes,
            levels: (0..n_levels).map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_two_way_fit_recovers_effects_and_slope() {
        // 4 units x 3 periods, y = 2.5 x + alpha_i + psi_t.
        let alpha = [1.0, -0.5, 2.0, 0.3];
        let psi = [0.0, 0.7, -1.2];
        let mut units = Vec::new();
        let mut periods = Vec::new();
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..4 {
            for t in 0..3 {
                let xv = ((i * 7 + t * 3) % 5) as f64 + 0.25 * t as f64;
                units.push(i as u32);
                periods.push(t as u32);
                x.push(xv);
                y.push(2.5 * xv + alpha[i] + psi[t]);
            }
        }
        let factors = vec![factor("unit", units, 4), factor("period", periods, 3)];
        let covariates = vec![Covariate {
            name: "x".to_string(),
            values: x,
        }];
        let subset: Vec<usize> = (0..12).collect();
        let weights = vec![1.0; 12];
        let request = FirstStageRequest {
            outcome: &y,
            covariates: &covariates,
            factors: &factors,
            subset: &subset,
            weights: &weights,
            cluster: Some(&factors[0]),
        };

        let fit = DemeanSolver::new(1e-12, 10_000).fit(&request).unwrap();
        assert!(fit.converged);
        assert!((fit.coefficient("x").unwrap().estimate - 2.5).abs() < 1e-8);
        assert_eq!(fit.fixed_effects[0].retained, vec![0, 1, 2, 3]);
        assert_eq!(fit.fixed_effects[1].retained, vec![1, 2]);
        // Period 0 is the reference.
        assert_eq!(fit.fixed_effects[1].effects[0], Some(0.0));

        let fitted = fit.predict(&request).unwrap();
        for (f, obs) in fitted.iter().zip(&y) {
            assert!((f - obs).abs() < 1e-8);
        }
    }

    #[test]
    fn test_collinear_covariate_is_dropped() {
        let units = vec![0, 0, 1, 1, 2, 2];
        let periods = vec![0, 1, 0, 1, 0, 1];
        let factors = vec![factor("unit", units, 3), factor("period", periods, 2)];
        let covariates = vec![
            // Constant within unit: absorbed by the unit effect.
            Covariate {
                name: "size".to_string(),
                values: vec![3.0, 3.0, 5.0, 5.0, 1.0, 1.0],
            },
            Covariate {
                name: "x".to_string(),
                values: vec![0.1, 0.9, 0.4, 0.2, 0.8, 0.5],
            },
        ];
        let y = vec![1.0, 2.0, 1.5, 1.1, 0.3, 0.9];
        let subset: Vec<usize> = (0..6).collect();
        let weights = vec![1.0; 6];
        let request = FirstStageRequest {
            outcome: &y,
            covariates: &covariates,
            factors: &factors,
            subset: &subset,
            weights: &weights,
            cluster: None,
        };
        let fit = DemeanSolver::default().fit(&request).unwrap();
        assert!(fit.coefficient("size").is_none());
        assert!(fit.coefficient("x").is_some());
        assert!(fit.coefficient("x").unwrap().std_error.is_finite());
    }

    #[test]
    fn test_nested_factor_has_no_free_levels() {
        // 4 units x 3 periods; the cohort factor is constant within unit.
        let units: Vec<u32> = (0..12).map(|i| i / 3).collect();
        let periods: Vec<u32> = (0..12).map(|i| i % 3).collect();
        let cohorts: Vec<u32> = units.iter().map(|&u| u / 2).collect();
        let factors = vec![
            factor("unit", units.clone(), 4),
            factor("period", periods.clone(), 3),
            factor("cohort", cohorts, 2),
        ];
        let y: Vec<f64> = units
            .iter()
            .zip(&periods)
            .map(|(&u, &t)| u as f64 * 0.7 + t as f64 * 1.3)
            .collect();
        let subset: Vec<usize> = (0..12).collect();
        let weights = vec![1.0; 12];
        let request = FirstStageRequest {
            outcome: &y,
            covariates: &[],
            factors: &factors,
            subset: &subset,
            weights: &weights,
            cluster: None,
        };
        let fit = DemeanSolver::new(1e-12, 10_000).fit(&request).unwrap();
        assert_eq!(fit.fixed_effects[0].retained, vec![0, 1, 2, 3]);
        assert_eq!(fit.fixed_effects[1].retained, vec![1, 2]);
        assert!(fit.fixed_effects[2].retained.is_empty());

        let fitted = fit.predict(&request).unwrap();
        for (f, obs) in fitted.iter().zip(&y) {
            assert!((f - obs).abs() < 1e-8);
        }
    }

    #[test]
    fn test_unseen_levels_predict_nan() {
        // Unit 1 only appears outside the estimation subset.
        let factors = vec![
            factor("unit", vec![0, 0, 1, 1], 2),
            factor("period", vec![0, 1, 0, 1], 2),
        ];
        let y = vec![1.0, 2.0, 5.0, 6.0];
        let subset = vec![0, 1];
        let weights = vec![1.0; 4];
        let request = FirstStageRequest {
            outcome: &y,
            covariates: &[],
            factors: &factors,
            subset: &subset,
            weights: &weights,
            cluster: None,
        };
        let fit = DemeanSolver::default().fit(&request).unwrap();
        assert_eq!(fit.fixed_effects[0].retained, vec![0]);
        assert_eq!(fit.fixed_effects[0].effects[1], None);
        let fitted = fit.predict(&request).unwrap();
        assert!((fitted[0] - 1.0).abs() < 1e-8);
        assert!((fitted[1] - 2.0).abs() < 1e-8);
        assert!(fitted[2].is_nan() && fitted[3].is_nan());
    }

    #[test]
    fn test_no_factors_fits_intercept() {
        let covariates = vec![Covariate {
            name: "x".to_string(),
            values: vec![0.0, 1.0, 2.0, 3.0],
        }];
        let y = vec![1.0, 3.0, 5.0, 7.0];
        let subset: Vec<usize> = (0..4).collect();
        let weights = vec![1.0; 4];
        let request = FirstStageRequest {
            outcome: &y,
            covariates: &covariates,
            factors: &[],
            subset: &subset,
            weights: &weights,
            cluster: None,
        };
        let fit = DemeanSolver::default().fit(&request).unwrap();
        assert!((fit.coefficient(INTERCEPT).unwrap().estimate - 1.0).abs() < 1e-9);
        assert!((fit.coefficient("x").unwrap().estimate - 2.0).abs() < 1e-9);
    }
}
