//! Point estimate of a weighted treatment effect.

/// `Σ_{treated} w_it · τ̂_it`, accumulated in row order.
///
/// `residual` holds `y - ŷ`, which on treated rows is the imputed individual effect.
pub fn point_estimate(treated: &[bool], weights: &[f64], residual: &[f64]) -> f64 {
    treated
        .iter()
        .zip(weights.iter().zip(residual))
        .filter(|(&d, (&w, _))| d && w != 0.0)
        .map(|(_, (w, r))| w * r)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untreated_rows_do_not_contribute() {
        let treated = [false, true, true, false];
        let weights = [0.7, 0.25, 0.75, 0.3];
        let residual = [10.0, 2.0, 4.0, -10.0];
        assert!((point_estimate(&treated, &weights, &residual) - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weight_ignores_nan_residual() {
        let treated = [true, true];
        let weights = [0.0, 1.0];
        let residual = [f64::NAN, 1.5];
        assert_eq!(point_estimate(&treated, &weights, &residual), 1.5);
    }
}
