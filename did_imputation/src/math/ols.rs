use crate::ImputationError;
use nalgebra::{DMatrix, DVector};

/// Represents the results of a (weighted) least-squares regression.
#[derive(Debug)]
pub struct OlsResult {
    pub coefficients: DVector<f64>,
    /// `(X'WX)⁻¹`, the bread of the sandwich estimators.
    pub bread: DMatrix<f64>,
    pub residuals: DVector<f64>,
}

/// Performs an Ordinary Least Squares (OLS) or Weighted Least Squares (WLS) regression.
///
/// The function calculates the coefficient vector `β` using the formula:
/// `β = (X'WX)⁻¹ * X'Wy` (where W is the weight matrix, Identity if unweighted)
///
/// # Arguments
///
/// * `y` - A `DVector` representing the outcome variable.
/// * `x` - A `DMatrix` representing the predictor variables. The first-stage solver
///   passes columns already demeaned by the absorbed fixed effects.
/// * `weights` - An optional `DVector` of observation weights.
///
/// # Returns
///
/// A `Result` containing the `OlsResult` on success, or an `ImputationError` if the
/// `X'WX` matrix is singular and cannot be inverted.
pub fn ols(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    weights: Option<&DVector<f64>>,
) -> Result<OlsResult, ImputationError> {
    let (xtx, xty) = if let Some(w) = weights {
        // Transform data X* = sqrt(W)X, y* = sqrt(W)y and run OLS on the result.
        let w_sqrt = w.map(|v| v.sqrt());

        let mut x_w = x.clone();
        for j in 0..x.ncols() {
            let mut col = x_w.column_mut(j);
            col.component_mul_assign(&w_sqrt);
        }
        let y_w = y.component_mul(&w_sqrt);

        (x_w.transpose() * &x_w, x_w.transpose() * &y_w)
    } else {
        (x.transpose() * x, x.transpose() * y)
    };

    // X'WX is positive definite when there is no perfect multicollinearity.
    let cholesky = xtx.cholesky().ok_or_else(|| {
        ImputationError::FirstStageError(
            "Failed to perform Cholesky decomposition. Matrix may be singular or not positive definite due to multicollinearity.".to_string(),
        )
    })?;

    let coefficients = cholesky.solve(&xty);
    let residuals = y - x * &coefficients;
    let bread = cholesky.inverse();

    Ok(OlsResult {
        coefficients,
        bread,
        residuals,
    })
}

/// Homoskedastic variance-covariance matrix: `σ² (X'WX)⁻¹` with `σ² = e'We / (n - k)`.
///
/// `dof_absorbed` counts parameters absorbed before the regression (fixed-effect levels)
/// so that `n - k` reflects every estimated parameter.
pub fn iid_vcov(
    result: &OlsResult,
    weights: Option<&DVector<f64>>,
    dof_absorbed: usize,
) -> DMatrix<f64> {
    let n = result.residuals.len();
    let k = result.coefficients.len() + dof_absorbed;
    let sse = match weights {
        Some(w) => result.residuals.dot(&result.residuals.component_mul(w)),
        None => result.residuals.norm_squared(),
    };
    let dof = n.saturating_sub(k).max(1) as f64;
    &result.bread * (sse / dof)
}

/// Cluster-robust variance-covariance matrix.
///
/// Sandwich `(X'WX)⁻¹ (Σ_g s_g s_g') (X'WX)⁻¹` with cluster scores
/// `s_g = Σ_{i∈g} w_i x_i e_i`, scaled by `G/(G-1) · (n-1)/(n-k)`.
pub fn cluster_vcov(
    x: &DMatrix<f64>,
    result: &OlsResult,
    weights: Option<&DVector<f64>>,
    clusters: &[u32],
) -> DMatrix<f64> {
    let n = x.nrows();
    let k = x.ncols();

    let n_clusters = clusters.iter().map(|&c| c as usize + 1).max().unwrap_or(0);
    let mut scores = DMatrix::<f64>::zeros(n_clusters, k);
    for i in 0..n {
        let w = weights.map_or(1.0, |w| w[i]);
        let scale = w * result.residuals[i];
        let g = clusters[i] as usize;
        for j in 0..k {
            scores[(g, j)] += x[(i, j)] * scale;
        }
    }

    let g = {
        let mut present = vec![false; n_clusters];
        clusters.iter().for_each(|&c| present[c as usize] = true);
        present.iter().filter(|&&p| p).count() as f64
    };
    if g < 2.0 || n <= k {
        return DMatrix::from_element(k, k, f64::NAN);
    }

    let meat = scores.transpose() * &scores;
    let adjustment = (g / (g - 1.0)) * ((n - 1) as f64 / (n - k) as f64);
    &result.bread * meat * &result.bread * adjustment
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_ols_simple_regression() {
        // y = 1 + 2x. DMatrix::from_vec is column-major.
        let x = DMatrix::from_vec(
            5,
            2,
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 2.0, 3.0, 4.0],
        );
        let y = DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0, 9.0]);

        let result = ols(&y, &x, None).expect("OLS calculation failed on valid data");
        assert!((result.coefficients[0] - 1.0).abs() < 1e-9, "Intercept is incorrect");
        assert!((result.coefficients[1] - 2.0).abs() < 1e-9, "Slope is incorrect");
        assert!(result.residuals.norm() < 1e-9);
    }

    #[test]
    fn test_weighted_regression_matches_replicated_rows() {
        // Weight 2 on the last row equals duplicating it.
        let x = DMatrix::from_vec(3, 2, vec![1.0, 1.0, 1.0, 0.0, 1.0, 2.0]);
        let y = DVector::from_vec(vec![0.0, 2.0, 3.0]);
        let w = DVector::from_vec(vec![1.0, 1.0, 2.0]);
        let weighted = ols(&y, &x, Some(&w)).unwrap();

        let x_rep = DMatrix::from_vec(4, 2, vec![1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 2.0, 2.0]);
        let y_rep = DVector::from_vec(vec![0.0, 2.0, 3.0, 3.0]);
        let replicated = ols(&y_rep, &x_rep, None).unwrap();

        for j in 0..2 {
            assert!((weighted.coefficients[j] - replicated.coefficients[j]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_ols_handles_singular_matrix() {
        // Column 2 is 2 * Column 1.
        let x = DMatrix::from_vec(3, 2, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        let y = DVector::from_vec(vec![1.0, 2.0, 3.0]);

        match ols(&y, &x, None) {
            Err(ImputationError::FirstStageError(msg)) => {
                assert!(msg.contains("Failed to perform Cholesky decomposition"));
            }
            _ => panic!("Expected a FirstStageError for a singular matrix"),
        }
    }

    #[test]
    fn test_cluster_vcov_needs_two_clusters() {
        let x = DMatrix::from_vec(3, 1, vec![1.0, 2.0, 3.0]);
        let y = DVector::from_vec(vec![1.0, 2.5, 2.9]);
        let result = ols(&y, &x, None).unwrap();
        let single = cluster_vcov(&x, &result, None, &[0, 0, 0]);
        assert!(single[(0, 0)].is_nan());
        let split = cluster_vcov(&x, &result, None, &[0, 1, 1]);
        assert!(split[(0, 0)].is_finite() && split[(0, 0)] > 0.0);
    }
}
