//! Conservative clustered variance of the imputation estimator.
//!
//! For a treatment-weight vector `w`, the untreated observations receive implied
//! weights `v* = -Z (Z₀ᵀΩ₀Z₀)⁻¹ Z₁ᵀ w₁` that carry the first-stage estimation error into
//! the estimate. Treated residuals are centered within `(cohort, event time)` cells
//! and the weighted, centered residuals are summed by unit; the variance is the sum of
//! squared unit totals.

use crate::design::DesignMatrix;
use crate::estimate::point_estimate;
use crate::panel::{Panel, TreatmentWeights, WeightLabel};
use crate::ImputationError;
use nalgebra::DMatrix;
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Smallest admissible pivot of the unit-diagonal (Jacobi-scaled) untreated normal
/// equations.
const PIVOT_FLOOR: f64 = 1e-12;

/// Estimate and variance components for one treatment-weight vector.
#[derive(Debug, Clone)]
pub struct VectorEstimate {
    pub label: WeightLabel,
    pub estimate: f64,
    pub variance: f64,
    /// Treatment weight on treated rows, implied weight `ω v*` on untreated rows.
    pub correction: Vec<f64>,
    /// Residuals with treated rows centered within their `(cohort, event time)` cell.
    pub centered: Vec<f64>,
}

impl VectorEstimate {
    pub fn std_error(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Shared, read-only state for every weight vector of one estimation call.
pub struct VarianceEngine<'a> {
    panel: &'a Panel,
    design: &'a DesignMatrix,
    residual: &'a [f64],
    untreated: Vec<usize>,
    cholesky: Result<CscCholesky<f64>, String>,
    /// Column scaling `1 / sqrt(diag)` applied before factoring.
    scale: Vec<f64>,
    /// Treated row indices per `(cohort, event time)` cell.
    cells: Vec<Vec<usize>>,
}

impl<'a> VarianceEngine<'a> {
    /// Factors `Z₀ᵀΩ₀Z₀` once, after scaling it to a unit diagonal so the pivot check
    /// does not depend on the units of the covariates. A singular system is
    /// remembered and reported per weight vector.
    pub fn new(panel: &'a Panel, design: &'a DesignMatrix, residual: &'a [f64]) -> Self {
        let untreated = panel.untreated_rows();
        let gram = design.weighted_gram(&untreated, &panel.row_weights);
        let (scaled, scale) = jacobi_scaled(&gram);
        let cholesky = CscCholesky::factor(&scaled)
            .map_err(|e| format!("untreated normal equations are not positive definite ({e:?})"))
            .and_then(|chol| {
                let min = pivots(&chol).into_iter().fold(f64::INFINITY, f64::min);
                if min > PIVOT_FLOOR {
                    Ok(chol)
                } else {
                    Err(format!(
                        "untreated normal equations are rank deficient (smallest scaled pivot {min:.3e})"
                    ))
                }
            });
        debug!(columns = design.ncols(), "factored untreated normal equations");

        let mut by_cell: BTreeMap<(i64, i64), Vec<usize>> = BTreeMap::new();
        for i in panel.treated_rows() {
            if let (Some(g), Some(e)) = (panel.cohort[i], panel.event_time[i].finite()) {
                by_cell.entry((g, e)).or_default().push(i);
            }
        }

        Self {
            panel,
            design,
            residual,
            untreated,
            cholesky,
            scale,
            cells: by_cell.into_values().collect(),
        }
    }

    /// Implied weights: `w` on treated rows, `ω · v*` on untreated rows.
    pub fn correction_weights(&self, w: &[f64]) -> Result<Vec<f64>, ImputationError> {
        let chol = self
            .cholesky
            .as_ref()
            .map_err(|msg| ImputationError::SingularSystemError(msg.clone()))?;

        let treated_w: Vec<f64> = w
            .iter()
            .zip(&self.panel.treated)
            .map(|(&wi, &d)| if d { wi } else { 0.0 })
            .collect();
        let rhs: Vec<f64> = self
            .design
            .transpose_mul(&treated_w)
            .iter()
            .zip(&self.scale)
            .map(|(r, s)| r * s)
            .collect();
        let y = chol.solve(&DMatrix::from_column_slice(rhs.len(), 1, &rhs));
        let x: Vec<f64> = y.iter().zip(&self.scale).map(|(y, s)| y * s).collect();
        let projected = self.design.mul(&x);

        let mut v = treated_w;
        for &i in &self.untreated {
            v[i] = -projected[i] * self.panel.row_weights[i];
        }
        Ok(v)
    }

    /// Residuals with the `v²`-weighted cell mean removed from treated rows.
    pub fn centered_residuals(&self, v: &[f64]) -> Vec<f64> {
        let mut centered = self.residual.to_vec();
        for cell in &self.cells {
            let (num, den) = cell.iter().fold((0.0, 0.0), |(num, den), &i| {
                let v2 = v[i] * v[i];
                (num + v2 * self.residual[i], den + v2)
            });
            let tau_bar = if den == 0.0 || !(num / den).is_finite() {
                0.0
            } else {
                num / den
            };
            for &i in cell {
                centered[i] -= tau_bar;
            }
        }
        centered
    }

    /// `Σ_units (Σ_{rows of unit} v · τ̃)²`.
    pub fn clustered_variance(&self, v: &[f64], centered: &[f64]) -> f64 {
        let mut totals = vec![0.0; self.panel.unit.n_levels()];
        for ((&code, vi), ci) in self.panel.unit.codes.iter().zip(v).zip(centered) {
            totals[code as usize] += vi * ci;
        }
        totals.iter().map(|t| t * t).sum()
    }

    pub fn estimate(&self, weights: &TreatmentWeights) -> VectorEstimate {
        let estimate = point_estimate(&self.panel.treated, &weights.values, self.residual);

        let active = weights
            .values
            .iter()
            .zip(&self.panel.treated)
            .any(|(&w, &d)| d && w != 0.0);
        if !active {
            return VectorEstimate {
                label: weights.label.clone(),
                estimate: 0.0,
                variance: 0.0,
                correction: vec![0.0; self.panel.len()],
                centered: self.residual.to_vec(),
            };
        }

        match self.correction_weights(&weights.values) {
            Ok(v) => {
                let centered = self.centered_residuals(&v);
                let variance = self.clustered_variance(&v, &centered);
                VectorEstimate {
                    label: weights.label.clone(),
                    estimate,
                    variance,
                    correction: v,
                    centered,
                }
            }
            Err(e) => {
                warn!(term = %weights.label, error = %e, "standard error unavailable");
                let correction = weights
                    .values
                    .iter()
                    .zip(&self.panel.treated)
                    .map(|(&w, &d)| if d { w } else { f64::NAN })
                    .collect();
                VectorEstimate {
                    label: weights.label.clone(),
                    estimate,
                    variance: f64::NAN,
                    correction,
                    centered: self.residual.to_vec(),
                }
            }
        }
    }

    /// Estimates every weight vector in parallel, keeping their order.
    pub fn estimate_all(&self, weights: &[TreatmentWeights]) -> Vec<VectorEstimate> {
        weights.par_iter().map(|w| self.estimate(w)).collect()
    }
}

/// `D⁻½ G D⁻½` with `D = diag(G)`, and the scale `D⁻½`. Empty columns keep scale 1.
fn jacobi_scaled(gram: &CscMatrix<f64>) -> (CscMatrix<f64>, Vec<f64>) {
    let mut scale = vec![1.0; gram.ncols()];
    for (i, j, &v) in gram.triplet_iter() {
        if i == j && v > 0.0 {
            scale[j] = 1.0 / v.sqrt();
        }
    }
    let mut coo = CooMatrix::new(gram.nrows(), gram.ncols());
    for (i, j, &v) in gram.triplet_iter() {
        coo.push(i, j, v * scale[i] * scale[j]);
    }
    (CscMatrix::from(&coo), scale)
}

/// Squared diagonal of the Cholesky factor.
fn pivots(chol: &CscCholesky<f64>) -> Vec<f64> {
    chol.l()
        .col_iter()
        .enumerate()
        .map(|(j, col)| {
            col.row_indices()
                .iter()
                .zip(col.values())
                .find(|(&i, _)| i == j)
                .map_or(0.0, |(_, &v)| v * v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::first_stage::{DemeanSolver, FixedEffectsSolver};
    use crate::panel::{PanelSpec, Selection};
    use nalgebra::DVector;
    use polars::prelude::*;

    fn staggered() -> Panel {
        let df = df!(
            "id" => &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4],
            "year" => &[1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4],
            "g" => &[0, 0, 0, 0, 2, 2, 2, 2, 3, 3, 3, 3, 0, 0, 0, 0],
            "y" => &[1.0, 2.2, 2.9, 4.1, 2.0, 4.5, 5.2, 6.8, 0.4, 1.6, 4.3, 5.9, 0.7, 1.5, 3.0, 3.6]
        )
        .unwrap();
        let fe = vec!["id".to_string(), "year".to_string()];
        Panel::from_frame(
            &df,
            &PanelSpec {
                outcome: "y",
                unit: "id",
                time: "year",
                cohort: "g",
                weights: None,
                covariates: &[],
                fixed_effects: &fe,
                treatment_weights: &[],
            },
        )
        .unwrap()
    }

    fn residuals(panel: &Panel) -> (DesignMatrix, Vec<f64>) {
        let untreated = panel.untreated_rows();
        let request = panel.first_stage_request(&untreated);
        let fit = DemeanSolver::new(1e-13, 100_000).fit(&request).unwrap();
        let fitted = fit.predict(&request).unwrap();
        let residual = panel.outcome.iter().zip(&fitted).map(|(y, f)| y - f).collect();
        (DesignMatrix::build(&fit, panel).unwrap(), residual)
    }

    #[test]
    fn test_matches_dense_reference() {
        let panel = staggered();
        let (design, residual) = residuals(&panel);
        let engine = VarianceEngine::new(&panel, &design, &residual);
        let horizons = panel.resolve_horizons(&Selection::All).unwrap();
        let weights = panel.treatment_weights(Some(horizons.as_slice()));

        let z: DMatrix<f64> = DMatrix::from(design.matrix());
        let untreated = panel.untreated_rows();
        let treated = panel.treated_rows();
        let z0 = DMatrix::from_fn(untreated.len(), z.ncols(), |r, c| z[(untreated[r], c)]);
        let z1 = DMatrix::from_fn(treated.len(), z.ncols(), |r, c| z[(treated[r], c)]);
        let gram_inv = (z0.transpose() * &z0).try_inverse().unwrap();

        for w in &weights {
            let got = engine.estimate(w);
            let w1 = DVector::from_iterator(treated.len(), treated.iter().map(|&i| w.values[i]));
            let v_star = -(&z * &gram_inv * z1.transpose() * &w1);

            let mut v = vec![0.0; panel.len()];
            for &i in &untreated {
                v[i] = v_star[i];
            }
            for &i in &treated {
                v[i] = w.values[i];
            }
            for i in 0..panel.len() {
                assert!((got.correction[i] - v[i]).abs() < 1e-8, "row {}", i);
            }

            // Dense centering by (cohort, event time) and clustering by unit.
            let mut centered = residual.clone();
            for &i in &treated {
                let cell: Vec<usize> = treated
                    .iter()
                    .copied()
                    .filter(|&j| {
                        panel.cohort[j] == panel.cohort[i]
                            && panel.event_time[j] == panel.event_time[i]
                    })
                    .collect();
                let den: f64 = cell.iter().map(|&j| v[j] * v[j]).sum();
                let num: f64 = cell.iter().map(|&j| v[j] * v[j] * residual[j]).sum();
                centered[i] = residual[i] - if den > 0.0 { num / den } else { 0.0 };
            }
            let mut variance = 0.0;
            for unit in 0..panel.unit.n_levels() as u32 {
                let total: f64 = (0..panel.len())
                    .filter(|&i| panel.unit.codes[i] == unit)
                    .map(|i| v[i] * centered[i])
                    .sum();
                variance += total * total;
            }
            assert!((got.variance - variance).abs() < 1e-8);
            assert!(got.std_error().is_finite());
        }
    }

    #[test]
    fn test_zero_vector_short_circuits() {
        let panel = staggered();
        let (design, residual) = residuals(&panel);
        let engine = VarianceEngine::new(&panel, &design, &residual);
        let zero = TreatmentWeights {
            label: WeightLabel::Column("none".to_string()),
            values: vec![0.0; panel.len()],
        };
        let got = engine.estimate(&zero);
        assert_eq!(got.estimate, 0.0);
        assert_eq!(got.variance, 0.0);
    }

    #[test]
    fn test_degenerate_cell_is_not_centered() {
        let panel = staggered();
        let (design, residual) = residuals(&panel);
        let engine = VarianceEngine::new(&panel, &design, &residual);
        let v = vec![0.0; panel.len()];
        assert_eq!(engine.centered_residuals(&v), residual);
    }

    #[test]
    fn test_parallel_order_is_preserved() {
        let panel = staggered();
        let (design, residual) = residuals(&panel);
        let engine = VarianceEngine::new(&panel, &design, &residual);
        let horizons = panel.resolve_horizons(&Selection::All).unwrap();
        let weights = panel.treatment_weights(Some(horizons.as_slice()));
        let all = engine.estimate_all(&weights);
        for (w, got) in weights.iter().zip(&all) {
            assert_eq!(got.label, w.label);
            assert_eq!(got.variance, engine.estimate(w).variance);
        }
    }
}
