//! Panel preprocessing: treatment status, event time and treatment weights.
//!
//! Everything here is derived from the caller's `DataFrame` once per estimation call
//! and owned by a `Panel`; the input frame is never modified.

use crate::first_stage::FirstStageRequest;
use crate::ImputationError;
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Time relative to treatment onset.
///
/// `Never` sorts before every finite value and stands for the infinite past: rows of
/// never-treated units stay in the untreated sample but never enter a horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventTime {
    Never,
    Finite(i64),
}

impl EventTime {
    pub fn finite(self) -> Option<i64> {
        match self {
            EventTime::Never => None,
            EventTime::Finite(e) => Some(e),
        }
    }
}

/// Either every available value or an explicit list.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    Values(Vec<i64>),
}

impl FromStr for Selection {
    type Err = ImputationError;

    /// Accepts `all` (or `true`) and comma-separated integers such as `-3,-2,-1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") || trimmed.eq_ignore_ascii_case("true") {
            return Ok(Selection::All);
        }
        let values = trimmed
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse::<i64>().map_err(|_| {
                    ImputationError::ConfigurationError(format!(
                        "'{}' is not an integer event time",
                        v
                    ))
                })
            })
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(Selection::Values(values))
    }
}

/// A categorical column coded to dense level indices. Levels are sorted.
#[derive(Debug, Clone)]
pub struct Factor {
    pub name: String,
    pub codes: Vec<u32>,
    pub levels: Vec<String>,
}

impl Factor {
    pub fn from_labels(name: &str, labels: &[String]) -> Self {
        let levels: Vec<String> = labels
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect();
        let index: HashMap<&str, u32> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i as u32))
            .collect();
        let codes = labels.iter().map(|l| index[l.as_str()]).collect();
        Self {
            name: name.to_string(),
            codes,
            levels,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    fn filter(&self, keep: &[bool]) -> Self {
        Self {
            name: self.name.clone(),
            codes: select(&self.codes, keep),
            levels: self.levels.clone(),
        }
    }
}

/// A numeric covariate over all panel rows.
#[derive(Debug, Clone)]
pub struct Covariate {
    pub name: String,
    pub values: Vec<f64>,
}

/// Identifies a treatment-weight vector and, through `Display`, its output term.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightLabel {
    Static,
    Horizon(i64),
    Column(String),
}

impl fmt::Display for WeightLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WeightLabel::Static => write!(f, "treat"),
            WeightLabel::Horizon(h) => write!(f, "{}", h),
            WeightLabel::Column(name) => write!(f, "{}", name),
        }
    }
}

/// One treatment-weight vector over all panel rows.
#[derive(Debug, Clone)]
pub struct TreatmentWeights {
    pub label: WeightLabel,
    pub values: Vec<f64>,
}

impl TreatmentWeights {
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Column names the preprocessor reads.
#[derive(Debug, Clone)]
pub struct PanelSpec<'a> {
    pub outcome: &'a str,
    pub unit: &'a str,
    pub time: &'a str,
    pub cohort: &'a str,
    pub weights: Option<&'a str>,
    pub covariates: &'a [String],
    pub fixed_effects: &'a [String],
    pub treatment_weights: &'a [String],
}

/// Per-call working record for one estimation. All vectors are row-aligned.
#[derive(Debug, Clone)]
pub struct Panel {
    pub outcome: Vec<f64>,
    pub unit: Factor,
    pub time: Vec<i64>,
    /// Treatment onset; `Some` only for ever-treated units.
    pub cohort: Vec<Option<i64>>,
    pub treated: Vec<bool>,
    pub event_time: Vec<EventTime>,
    pub row_weights: Vec<f64>,
    pub covariates: Vec<Covariate>,
    /// Absorbed first-stage factors.
    pub factors: Vec<Factor>,
    pub explicit_weights: Vec<(String, Vec<f64>)>,
    /// The cleaned input rows, aligned with the vectors above.
    pub frame: DataFrame,
}

impl Panel {
    /// Derives treatment status, event time and first-stage inputs from `df`.
    ///
    /// Rows with nulls in the outcome, unit, time, weight, covariate or fixed-effect
    /// columns are dropped. Null cohorts mark never-treated units.
    pub fn from_frame(df: &DataFrame, spec: &PanelSpec) -> Result<Self, ImputationError> {
        let mut cols = vec![
            spec.outcome.to_string(),
            spec.unit.to_string(),
            spec.time.to_string(),
        ];
        if let Some(w) = spec.weights {
            cols.push(w.to_string());
        }
        cols.extend(spec.covariates.iter().cloned());
        cols.extend(spec.fixed_effects.iter().cloned());

        let mut required = cols.clone();
        required.push(spec.cohort.to_string());
        required.extend(spec.treatment_weights.iter().cloned());
        for c in &required {
            if df.column(c).is_err() {
                return Err(ImputationError::ConfigurationError(format!(
                    "Column not found: {}",
                    c
                )));
            }
        }

        let frame = df.drop_nulls(Some(cols.as_slice()))?;
        if frame.height() < df.height() {
            warn!(
                dropped = df.height() - frame.height(),
                "dropping rows with missing values"
            );
        }
        if frame.height() == 0 {
            return Err(ImputationError::ConfigurationError(
                "No complete observations in the panel".to_string(),
            ));
        }

        let outcome = required_f64(&frame, spec.outcome)?;
        if outcome.iter().any(|y| !y.is_finite()) {
            return Err(ImputationError::ConfigurationError(format!(
                "Outcome column '{}' contains non-finite values",
                spec.outcome
            )));
        }
        let unit = Factor::from_labels(spec.unit, &labels(&frame, spec.unit)?);
        let time = required_i64(&frame, spec.time)?;

        let cohort: Vec<Option<i64>> = optional_f64(&frame, spec.cohort)?
            .into_iter()
            .map(|g| match g {
                Some(g) if g.is_finite() && g > 0.0 => {
                    if g.fract() == 0.0 {
                        Ok(Some(g as i64))
                    } else {
                        Err(ImputationError::ConfigurationError(format!(
                            "Cohort column '{}' holds the non-integer period {}",
                            spec.cohort, g
                        )))
                    }
                }
                _ => Ok(None),
            })
            .collect::<Result<_, _>>()?;

        let treated: Vec<bool> = cohort
            .iter()
            .zip(&time)
            .map(|(g, &t)| g.is_some_and(|g| t >= g))
            .collect();
        let event_time: Vec<EventTime> = cohort
            .iter()
            .zip(&time)
            .map(|(g, &t)| g.map_or(EventTime::Never, |g| EventTime::Finite(t - g)))
            .collect();

        let mut seen = HashSet::with_capacity(time.len());
        for (code, &t) in unit.codes.iter().zip(&time) {
            if !seen.insert((*code, t)) {
                return Err(ImputationError::ConfigurationError(format!(
                    "Unit '{}' has more than one observation in period {}",
                    unit.levels[*code as usize], t
                )));
            }
        }

        let row_weights = match spec.weights {
            Some(w) => {
                let values = required_f64(&frame, w)?;
                if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return Err(ImputationError::ConfigurationError(format!(
                        "Weight column '{}' must be finite and non-negative",
                        w
                    )));
                }
                values
            }
            None => vec![1.0; frame.height()],
        };

        let covariates = spec
            .covariates
            .iter()
            .map(|name| {
                Ok(Covariate {
                    name: name.clone(),
                    values: required_f64(&frame, name)?,
                })
            })
            .collect::<Result<Vec<_>, ImputationError>>()?;

        let factors = spec
            .fixed_effects
            .iter()
            .map(|name| Ok(Factor::from_labels(name, &labels(&frame, name)?)))
            .collect::<Result<Vec<_>, ImputationError>>()?;

        let explicit_weights = spec
            .treatment_weights
            .iter()
            .map(|name| {
                let values = optional_f64(&frame, name)?
                    .into_iter()
                    .zip(&treated)
                    .map(|(w, &d)| if d { w.unwrap_or(0.0) } else { 0.0 })
                    .collect();
                Ok((name.clone(), values))
            })
            .collect::<Result<Vec<_>, ImputationError>>()?;

        debug!(
            n_obs = frame.height(),
            n_treated = treated.iter().filter(|&&d| d).count(),
            "panel prepared"
        );

        Ok(Self {
            outcome,
            unit,
            time,
            cohort,
            treated,
            event_time,
            row_weights,
            covariates,
            factors,
            explicit_weights,
            frame,
        })
    }

    pub fn len(&self) -> usize {
        self.outcome.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcome.is_empty()
    }

    pub fn n_treated(&self) -> usize {
        self.treated.iter().filter(|&&d| d).count()
    }

    pub fn untreated_rows(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| !self.treated[i]).collect()
    }

    pub fn treated_rows(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.treated[i]).collect()
    }

    /// Distinct finite event times, ascending.
    pub fn finite_event_times(&self) -> BTreeSet<i64> {
        self.event_time.iter().filter_map(|e| e.finite()).collect()
    }

    /// Resolves a horizon request to the event times that get their own estimate.
    pub fn resolve_horizons(&self, selection: &Selection) -> Result<Vec<i64>, ImputationError> {
        let available = self.finite_event_times();
        match selection {
            Selection::All => Ok(available.into_iter().filter(|&e| e >= 0).collect()),
            Selection::Values(values) => {
                for &h in values {
                    if h < 0 {
                        return Err(ImputationError::ConfigurationError(format!(
                            "Horizon {} is negative; use pre-trends for pre-treatment periods",
                            h
                        )));
                    }
                    if !available.contains(&h) {
                        return Err(ImputationError::ConfigurationError(format!(
                            "Horizon {} is not an event time in the data",
                            h
                        )));
                    }
                }
                let mut resolved = values.clone();
                resolved.sort_unstable();
                resolved.dedup();
                Ok(resolved)
            }
        }
    }

    /// Resolves a pre-trend request to the negative event times to test.
    pub fn resolve_pretrends(&self, selection: &Selection) -> Result<Vec<i64>, ImputationError> {
        let available = self.finite_event_times();
        match selection {
            Selection::All => Ok(available.into_iter().filter(|&e| e < 0).collect()),
            Selection::Values(values) => {
                for &k in values {
                    if !available.contains(&k) {
                        return Err(ImputationError::ConfigurationError(format!(
                            "Pre-trend {} is not an event time in the data",
                            k
                        )));
                    }
                    if k >= 0 {
                        return Err(ImputationError::ConfigurationError(format!(
                            "Pre-trend {} is not a pre-treatment event time",
                            k
                        )));
                    }
                }
                let mut resolved = values.clone();
                resolved.sort_unstable();
                resolved.dedup();
                Ok(resolved)
            }
        }
    }

    /// Builds the treatment-weight vectors.
    ///
    /// Explicit columns win. Otherwise one vector per horizon, or the single static
    /// vector when no horizons are given. Built vectors are treated-row indicators
    /// scaled by the observation weights and normalized to sum to one.
    pub fn treatment_weights(&self, horizons: Option<&[i64]>) -> Vec<TreatmentWeights> {
        if !self.explicit_weights.is_empty() {
            return self
                .explicit_weights
                .iter()
                .map(|(name, values)| TreatmentWeights {
                    label: WeightLabel::Column(name.clone()),
                    values: values.clone(),
                })
                .collect();
        }

        match horizons {
            Some(horizons) => horizons
                .iter()
                .map(|&h| TreatmentWeights {
                    label: WeightLabel::Horizon(h),
                    values: self.normalized(|i| self.event_time[i] == EventTime::Finite(h)),
                })
                .collect(),
            None => vec![TreatmentWeights {
                label: WeightLabel::Static,
                values: self.normalized(|i| self.treated[i]),
            }],
        }
    }

    fn normalized(&self, include: impl Fn(usize) -> bool) -> Vec<f64> {
        let mut values: Vec<f64> = (0..self.len())
            .map(|i| {
                if self.treated[i] && include(i) {
                    self.row_weights[i]
                } else {
                    0.0
                }
            })
            .collect();
        let total: f64 = values.iter().sum();
        if total > 0.0 {
            values.iter_mut().for_each(|v| *v /= total);
        }
        values
    }

    /// The first-stage request for the given estimation rows.
    pub fn first_stage_request<'a>(&'a self, subset: &'a [usize]) -> FirstStageRequest<'a> {
        FirstStageRequest {
            outcome: &self.outcome,
            covariates: &self.covariates,
            factors: &self.factors,
            subset,
            weights: &self.row_weights,
            cluster: Some(&self.unit),
        }
    }

    /// Keeps the rows where `keep` is true.
    pub fn filter(&self, keep: &[bool]) -> Result<Self, ImputationError> {
        let mask: BooleanChunked = keep.iter().map(|&k| Some(k)).collect();
        Ok(Self {
            outcome: select(&self.outcome, keep),
            unit: self.unit.filter(keep),
            time: select(&self.time, keep),
            cohort: select(&self.cohort, keep),
            treated: select(&self.treated, keep),
            event_time: select(&self.event_time, keep),
            row_weights: select(&self.row_weights, keep),
            covariates: self
                .covariates
                .iter()
                .map(|c| Covariate {
                    name: c.name.clone(),
                    values: select(&c.values, keep),
                })
                .collect(),
            factors: self.factors.iter().map(|f| f.filter(keep)).collect(),
            explicit_weights: self
                .explicit_weights
                .iter()
                .map(|(name, values)| (name.clone(), select(values, keep)))
                .collect(),
            frame: self.frame.filter(&mask)?,
        })
    }
}

fn select<T: Clone>(values: &[T], keep: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, &k)| k)
        .map(|(v, _)| v.clone())
        .collect()
}

fn optional_f64(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, ImputationError> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    let values: Vec<Option<f64>> = column.f64()?.into_iter().collect();
    Ok(values)
}

fn required_f64(df: &DataFrame, name: &str) -> Result<Vec<f64>, ImputationError> {
    optional_f64(df, name)?
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| {
                ImputationError::ConfigurationError(format!(
                    "Column '{}' must be numeric",
                    name
                ))
            })
        })
        .collect()
}

fn required_i64(df: &DataFrame, name: &str) -> Result<Vec<i64>, ImputationError> {
    required_f64(df, name)?
        .into_iter()
        .map(|v| {
            if v.is_finite() && v.fract() == 0.0 {
                Ok(v as i64)
            } else {
                Err(ImputationError::ConfigurationError(format!(
                    "Column '{}' must hold integer periods, found {}",
                    name, v
                )))
            }
        })
        .collect()
}

fn labels(df: &DataFrame, name: &str) -> Result<Vec<String>, ImputationError> {
    let column = df.column(name)?.cast(&DataType::String)?;
    let values = column
        .str()?
        .into_iter()
        .map(|v| {
            v.map(str::to_string).ok_or_else(|| {
                ImputationError::ConfigurationError(format!(
                    "Column '{}' has values that cannot be used as categories",
                    name
                ))
            })
        })
        .collect::<Result<Vec<String>, _>>()?;
    Ok(values)
}
