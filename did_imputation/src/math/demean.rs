//! Alternating projections over any number of absorbed factors.

/// Weighted level structure of the absorbed factors over the estimation rows.
pub struct Absorber {
    /// Level code of each estimation row, per factor.
    codes: Vec<Vec<u32>>,
    /// Total weight of each level, per factor.
    level_weights: Vec<Vec<f64>>,
    weights: Vec<f64>,
    tolerance: f64,
    max_iters: usize,
}

impl Absorber {
    pub fn new(
        codes: Vec<Vec<u32>>,
        n_levels: &[usize],
        weights: Vec<f64>,
        tolerance: f64,
        max_iters: usize,
    ) -> Self {
        let level_weights = codes
            .iter()
            .zip(n_levels)
            .map(|(factor_codes, &n)| {
                let mut totals = vec![0.0; n];
                for (&c, &w) in factor_codes.iter().zip(&weights) {
                    totals[c as usize] += w;
                }
                totals
            })
            .collect();
        Self {
            codes,
            level_weights,
            weights,
            tolerance,
            max_iters,
        }
    }

    pub fn n_factors(&self) -> usize {
        self.codes.len()
    }

    /// Whether a level carries positive weight among the estimation rows.
    pub fn is_seen(&self, factor: usize, level: usize) -> bool {
        self.level_weights[factor][level] > 0.0
    }

    /// Iteratively demeans `values` by every factor (Zig-Zag algorithm).
    ///
    /// Returns the number of sweeps and whether the change between sweeps fell below
    /// the tolerance.
    pub fn demean(&self, values: &mut [f64]) -> (usize, bool) {
        if self.codes.is_empty() {
            return (0, true);
        }
        let mut iter = 0;
        while iter < self.max_iters {
            let prev = values.to_vec();
            for (k, factor_codes) in self.codes.iter().enumerate() {
                let mut sums = vec![0.0; self.level_weights[k].len()];
                for ((&c, &v), &w) in factor_codes.iter().zip(values.iter()).zip(&self.weights) {
                    sums[c as usize] += w * v;
                }
                for (&c, v) in factor_codes.iter().zip(values.iter_mut()) {
                    let total = self.level_weights[k][c as usize];
                    if total > 0.0 {
                        *v -= sums[c as usize] / total;
                    }
                }
            }
            iter += 1;

            let diff = distance(values, &prev);
            let scale = 1.0 + norm(values);
            if diff <= self.tolerance * scale {
                return (iter, true);
            }
        }
        (iter, false)
    }

    /// Recovers the fixed effects of `residual = Σ_k effect_k[level] + ε` using
    /// alternating projections (Gauss-Seidel on the normal equations).
    ///
    /// Effects of levels without weight stay at zero. The returned effects are one
    /// solution among the equivalent normalizations; callers pick references.
    pub fn recover(&self, residual: &[f64]) -> (Vec<Vec<f64>>, usize, bool) {
        let mut effects: Vec<Vec<f64>> = self
            .level_weights
            .iter()
            .map(|levels| vec![0.0; levels.len()])
            .collect();
        if self.codes.is_empty() {
            return (effects, 0, true);
        }

        let n = residual.len();
        let scale = 1.0 + norm(residual);
        let mut fitted = vec![0.0; n];
        let mut iter = 0;
        while iter < self.max_iters {
            let mut change = 0.0;
            for k in 0..self.codes.len() {
                let codes = &self.codes[k];
                let mut sums = vec![0.0; effects[k].len()];
                for i in 0..n {
                    let own = effects[k][codes[i] as usize];
                    sums[codes[i] as usize] += self.weights[i] * (residual[i] - (fitted[i] - own));
                }
                for (level, sum) in sums.iter().enumerate() {
                    let total = self.level_weights[k][level];
                    if total > 0.0 {
                        let updated = sum / total;
                        change += (updated - effects[k][level]).powi(2);
                        effects[k][level] = updated;
                    }
                }
                fitted = self.fitted(&effects, n);
            }
            iter += 1;
            if change.sqrt() <= self.tolerance * scale {
                return (effects, iter, true);
            }
        }
        (effects, iter, false)
    }

    /// Filters the candidate levels of every factor after the first down to those whose
    /// indicator columns are linearly independent of the first factor's indicators and
    /// of the candidates kept before them. The first factor's candidates pass through.
    ///
    /// The first factor's indicators are orthogonal to each other, so they are
    /// partialled out in closed form (Schur complement) and the remaining candidates go
    /// through a pivoted Cholesky pass in order. A candidate is dropped when its
    /// residual weight falls below `tolerance` times its own weight.
    pub fn independent_levels(&self, candidates: &[Vec<u32>], tolerance: f64) -> Vec<Vec<u32>> {
        if self.n_factors() < 2 {
            return candidates.to_vec();
        }

        let mut column_of: Vec<Vec<Option<usize>>> = self
            .level_weights
            .iter()
            .map(|levels| vec![None; levels.len()])
            .collect();
        let mut columns: Vec<(usize, u32)> = Vec::new();
        for (k, levels) in candidates.iter().enumerate().skip(1) {
            for &level in levels {
                column_of[k][level as usize] = Some(columns.len());
                columns.push((k, level));
            }
        }
        let q = columns.len();

        // Indicator cross-products of the candidates, minus their projection on the
        // first factor.
        let mut schur = vec![vec![0.0; q]; q];
        let mut by_level: Vec<Vec<(usize, f64)>> = vec![Vec::new(); self.level_weights[0].len()];
        for (i, &w) in self.weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            let row: Vec<usize> = (1..self.codes.len())
                .filter_map(|k| column_of[k][self.codes[k][i] as usize])
                .collect();
            for &a in &row {
                for &b in &row {
                    schur[a][b] += w;
                }
                by_level[self.codes[0][i] as usize].push((a, w));
            }
        }
        let diagonal: Vec<f64> = (0..q).map(|j| schur[j][j]).collect();
        for (level, entries) in by_level.iter().enumerate() {
            let total = self.level_weights[0][level];
            if total <= 0.0 || entries.is_empty() {
                continue;
            }
            let mut cross: Vec<(usize, f64)> = Vec::new();
            for &(a, w) in entries {
                match cross.iter_mut().find(|(c, _)| *c == a) {
                    Some((_, s)) => *s += w,
                    None => cross.push((a, w)),
                }
            }
            for &(a, ca) in &cross {
                for &(b, cb) in &cross {
                    schur[a][b] -= ca * cb / total;
                }
            }
        }

        // Pivoted Cholesky in candidate order; `factor[m]` is the row of L for the m-th
        // kept column.
        let mut kept: Vec<usize> = Vec::new();
        let mut factor: Vec<Vec<f64>> = Vec::new();
        for j in 0..q {
            let mut row = Vec::with_capacity(kept.len() + 1);
            for (m, &p) in kept.iter().enumerate() {
                let dot: f64 = (0..m).map(|t| row[t] * factor[m][t]).sum();
                row.push((schur[j][p] - dot) / factor[m][m]);
            }
            let residual = schur[j][j] - row.iter().map(|v| v * v).sum::<f64>();
            if residual > tolerance * diagonal[j] {
                row.push(residual.sqrt());
                kept.push(j);
                factor.push(row);
            }
        }

        let mut independent = vec![Vec::new(); candidates.len()];
        independent[0] = candidates[0].clone();
        for j in kept {
            let (k, level) = columns[j];
            independent[k].push(level);
        }
        independent
    }

    fn fitted(&self, effects: &[Vec<f64>], n: usize) -> Vec<f64> {
        let mut fitted = vec![0.0; n];
        for (codes, levels) in self.codes.iter().zip(effects) {
            for (f, &c) in fitted.iter_mut().zip(codes) {
                *f += levels[c as usize];
            }
        }
        fitted
    }
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}
