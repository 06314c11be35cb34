//! Sparse design matrix `Z` of the fitted no-treatment model over every panel row.

use crate::first_stage::{FirstStageFit, INTERCEPT};
use crate::panel::Panel;
use crate::ImputationError;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use std::collections::HashSet;

/// Covariate columns for the retained coefficients followed by one-hot columns for the
/// retained levels of every absorbed factor, in panel row order.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    z: CscMatrix<f64>,
    columns: Vec<String>,
}

impl DesignMatrix {
    pub fn build(fit: &FirstStageFit, panel: &Panel) -> Result<Self, ImputationError> {
        let n = panel.len();
        let mut entries: Vec<(usize, usize, f64)> = Vec::new();
        let mut columns = Vec::new();

        for coef in &fit.coefficients {
            let j = columns.len();
            if coef.name == INTERCEPT {
                entries.extend((0..n).map(|i| (i, j, 1.0)));
            } else {
                let covariate = panel
                    .covariates
                    .iter()
                    .find(|c| c.name == coef.name)
                    .ok_or_else(|| {
                        ImputationError::DesignMatrixError(format!(
                            "Retained coefficient '{}' is not a covariate of the panel",
                            coef.name
                        ))
                    })?;
                entries.extend(
                    covariate
                        .values
                        .iter()
                        .enumerate()
                        .filter(|(_, &x)| x != 0.0)
                        .map(|(i, &x)| (i, j, x)),
                );
            }
            columns.push(coef.name.clone());
        }

        for fe in &fit.fixed_effects {
            let factor = panel
                .factors
                .iter()
                .find(|f| f.name == fe.name)
                .ok_or_else(|| {
                    ImputationError::DesignMatrixError(format!(
                        "Absorbed factor '{}' is not in the panel",
                        fe.name
                    ))
                })?;
            if fe.effects.len() != factor.n_levels() {
                return Err(ImputationError::DesignMatrixError(format!(
                    "Factor '{}' reports {} levels, the panel has {}",
                    fe.name,
                    fe.effects.len(),
                    factor.n_levels()
                )));
            }

            let mut column_of = vec![None; factor.n_levels()];
            let mut seen = HashSet::new();
            for &code in &fe.retained {
                let level = code as usize;
                if level >= factor.n_levels() {
                    return Err(ImputationError::DesignMatrixError(format!(
                        "Factor '{}' retains level code {} out of range",
                        fe.name, code
                    )));
                }
                if !seen.insert(code) {
                    return Err(ImputationError::DesignMatrixError(format!(
                        "Factor '{}' retains level code {} twice",
                        fe.name, code
                    )));
                }
                column_of[level] = Some(columns.len());
                columns.push(format!("{}::{}", fe.name, factor.levels[level]));
            }
            entries.extend(
                factor
                    .codes
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &c)| column_of[c as usize].map(|j| (i, j, 1.0))),
            );
        }

        // Every column needs support among the weighted untreated rows or the normal
        // equations cannot be solved.
        let mut support = vec![false; columns.len()];
        for &(i, j, _) in &entries {
            if !panel.treated[i] && panel.row_weights[i] > 0.0 {
                support[j] = true;
            }
        }
        if let Some(j) = support.iter().position(|&s| !s) {
            return Err(ImputationError::DesignMatrixError(format!(
                "Column '{}' is empty on the untreated observations",
                columns[j]
            )));
        }

        let mut coo = CooMatrix::new(n, columns.len());
        for (i, j, v) in entries {
            coo.push(i, j, v);
        }
        Ok(Self {
            z: CscMatrix::from(&coo),
            columns,
        })
    }

    pub fn nrows(&self) -> usize {
        self.z.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.z.ncols()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn matrix(&self) -> &CscMatrix<f64> {
        &self.z
    }

    /// `Z₀ᵀ Ω₀ Z₀` over the given rows with row weights `ω`.
    pub fn weighted_gram(&self, rows: &[usize], weights: &[f64]) -> CscMatrix<f64> {
        let mut include = vec![None; self.nrows()];
        for &i in rows {
            include[i] = Some(weights[i].sqrt());
        }
        let mut coo = CooMatrix::new(self.nrows(), self.ncols());
        for (j, col) in self.z.col_iter().enumerate() {
            for (&i, &v) in col.row_indices().iter().zip(col.values()) {
                if let Some(s) = include[i] {
                    coo.push(i, j, s * v);
                }
            }
        }
        let scaled = CscMatrix::from(&coo);
        &scaled.transpose() * &scaled
    }

    /// `Zᵀ w`.
    pub fn transpose_mul(&self, w: &[f64]) -> Vec<f64> {
        self.z
            .col_iter()
            .map(|col| {
                col.row_indices()
                    .iter()
                    .zip(col.values())
                    .map(|(&i, &v)| v * w[i])
                    .sum()
            })
            .collect()
    }

    /// `Z x`.
    pub fn mul(&self, x: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.nrows()];
        for (col, &xj) in self.z.col_iter().zip(x) {
            for (&i, &v) in col.row_indices().iter().zip(col.values()) {
                out[i] += v * xj;
            }
        }
        out
    }
}
