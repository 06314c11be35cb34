//! A Rust implementation of the Borusyak-Jaravel-Spiess (BJS) imputation estimator
//! for staggered-adoption difference-in-differences designs.
//!
//! The estimator fits a no-treatment model (unit and period fixed effects by default)
//! on untreated observations only, imputes the untreated counterfactual for every
//! treated observation, and aggregates the differences with user-chosen treatment
//! weights. Standard errors follow the conservative clustered variance estimator of
//! BJS (2021, Eq. 6, 8 and 10), which propagates the first-stage estimation error
//! through a sparse projection of the treatment weights onto the untreated sample.
//!
//! # Example
//!
//! ```ignore
//! use polars::prelude::*;
//! use did_imputation::{DidImputationBuilder, Selection};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let df = df!(
//!         "id" =>     &[1, 1, 1, 2, 2, 2, 3, 3, 3],
//!         "year" =>   &[1, 2, 3, 1, 2, 3, 1, 2, 3],
//!         "g" =>      &[0, 0, 0, 2, 2, 2, 3, 3, 3],
//!         "y" =>      &[1.0, 2.1, 2.9, 1.4, 4.6, 5.3, 0.2, 1.1, 4.4]
//!     )?;
//!
//!     let results = DidImputationBuilder::new(df, "y", "id", "year", "g")
//!         .horizon(Selection::All)
//!         .run()?;
//!
//!     results.summary();
//!     Ok(())
//! }
//! ```

use polars::prelude::*;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod design;
pub mod estimate;
pub mod first_stage;
pub mod formula;
mod math;
pub mod panel;
pub mod pretrends;
pub mod results;
pub mod variance;

pub use crate::design::DesignMatrix;
pub use crate::first_stage::{
    DemeanSolver, FirstStageFit, FirstStageRequest, FixedEffectsSolver, RetainedCoefficient,
    RetainedFactor,
};
pub use crate::formula::Formula;
pub use crate::panel::{EventTime, Panel, Selection, TreatmentWeights, WeightLabel};
pub use crate::results::{ImputationResults, TermEstimate};
pub use crate::variance::{VarianceEngine, VectorEstimate};

use crate::panel::PanelSpec;
use crate::pretrends::estimate_pretrends;

/// Error type for the `did_imputation` library.
#[derive(Error, Debug)]
pub enum ImputationError {
    /// Wraps a `PolarsError`.
    #[error("Polars error: {0}")]
    PolarsError(#[from] PolarsError),
    /// A requested column, horizon, pre-trend or formula term cannot be resolved
    /// against the data.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    /// The sparse design matrix cannot be reconciled with the structure retained by
    /// the first-stage fit.
    #[error("Design matrix error: {0}")]
    DesignMatrixError(String),
    /// The untreated normal-equations system is singular or ill-conditioned.
    #[error("Singular system: {0}")]
    SingularSystemError(String),
    /// The first-stage solver failed.
    #[error("First stage error: {0}")]
    FirstStageError(String),
}

/// The no-treatment model fitted on untreated observations.
///
/// `fixed_effects = None` means the default two-way specification: unit and period
/// fixed effects, no covariates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirstStage {
    pub covariates: Vec<String>,
    pub fixed_effects: Option<Vec<String>>,
}

impl FirstStage {
    /// Parses a one-sided first-stage formula such as `"~ x1 + x2 | id + year"`.
    pub fn parse(formula: &str) -> Result<Self, ImputationError> {
        let parsed = Formula::parse(formula)?;
        Ok(parsed.into_first_stage())
    }
}

/// The main entry point for configuring and running the imputation estimator.
///
/// This struct is created using a builder pattern.
#[derive(Debug, Clone)]
pub struct DidImputationBuilder {
    dataframe: DataFrame,
    outcome: String,
    unit: String,
    time: String,
    cohort: String,
    weights_col: Option<String>,
    treatment_weights: Vec<String>,
    horizon: Option<Selection>,
    pretrends: Option<Selection>,
    first_stage: FirstStage,
    full_output: bool,
    tolerance: f64,
    max_iters: usize,
    solver: Option<Arc<dyn FixedEffectsSolver>>,
}

impl DidImputationBuilder {
    /// Creates a new `DidImputationBuilder`.
    ///
    /// # Arguments
    ///
    /// * `dataframe` - A `polars::DataFrame` holding one row per unit and period.
    /// * `outcome` - The outcome column (e.g., "y").
    /// * `unit` - The unit identifier column.
    /// * `time` - The calendar period column (integer valued).
    /// * `cohort` - The treatment onset column. Null, zero, negative or infinite
    ///   values mark never-treated units.
    pub fn new(dataframe: DataFrame, outcome: &str, unit: &str, time: &str, cohort: &str) -> Self {
        Self {
            dataframe,
            outcome: outcome.to_string(),
            unit: unit.to_string(),
            time: time.to_string(),
            cohort: cohort.to_string(),
            weights_col: None,
            treatment_weights: Vec::new(),
            horizon: None,
            pretrends: None,
            first_stage: FirstStage::default(),
            full_output: false,
            tolerance: 1e-10,
            max_iters: 10_000,
            solver: None,
        }
    }

    /// Creates a new `DidImputationBuilder` from a two-sided formula whose left-hand side
    /// names the outcome, e.g. `"y ~ x | id + year"`.
    pub fn from_formula(
        dataframe: DataFrame,
        formula: &str,
        unit: &str,
        time: &str,
        cohort: &str,
    ) -> Result<Self, ImputationError> {
        let parsed = Formula::parse(formula)?;
        let outcome = parsed.outcome.clone().ok_or_else(|| {
            ImputationError::ConfigurationError(format!(
                "Formula '{}' has no outcome on the left-hand side",
                formula
            ))
        })?;
        let mut builder = Self::new(dataframe, &outcome, unit, time, cohort);
        builder.first_stage = parsed.into_first_stage();
        Ok(builder)
    }

    /// Sets the column holding observation weights.
    pub fn weights(&mut self, weights: &str) -> &mut Self {
        self.weights_col = Some(weights.to_string());
        self
    }

    /// Uses user-supplied treatment-weight columns instead of the static or
    /// horizon weights. The columns are used as given and are not normalized.
    pub fn treatment_weights(&mut self, columns: &[&str]) -> &mut Self {
        self.treatment_weights = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Requests one estimate per event-time horizon.
    pub fn horizon(&mut self, horizon: Selection) -> &mut Self {
        self.horizon = Some(horizon);
        self
    }

    /// Requests pre-trend coefficients for the given negative event times.
    pub fn pretrends(&mut self, pretrends: Selection) -> &mut Self {
        self.pretrends = Some(pretrends);
        self
    }

    /// Sets the first-stage specification.
    pub fn first_stage(&mut self, first_stage: FirstStage) -> &mut Self {
        self.first_stage = first_stage;
        self
    }

    /// Sets the first-stage specification from a one-sided formula.
    pub fn first_stage_formula(&mut self, formula: &str) -> Result<&mut Self, ImputationError> {
        self.first_stage = FirstStage::parse(formula)?;
        Ok(self)
    }

    /// Attaches the augmented panel (residuals, correction weights, centered
    /// residuals) to the results.
    pub fn full_output(&mut self, full: bool) -> &mut Self {
        self.full_output = full;
        self
    }

    /// Convergence tolerance of the default fixed-effects solver.
    pub fn tolerance(&mut self, tol: f64) -> &mut Self {
        self.tolerance = tol;
        self
    }

    /// Iteration cap of the default fixed-effects solver.
    pub fn max_iters(&mut self, iters: usize) -> &mut Self {
        self.max_iters = iters;
        self
    }

    /// Replaces the default alternating-projections solver.
    pub fn solver(&mut self, solver: Arc<dyn FixedEffectsSolver>) -> &mut Self {
        self.solver = Some(solver);
        self
    }

    fn resolved_solver(&self) -> Arc<dyn FixedEffectsSolver> {
        match &self.solver {
            Some(solver) => Arc::clone(solver),
            None => Arc::new(DemeanSolver::new(self.tolerance, self.max_iters)),
        }
    }

    /// Executes the imputation estimator.
    pub fn run(&self) -> Result<ImputationResults, ImputationError> {
        let fixed_effects = self
            .first_stage
            .fixed_effects
            .clone()
            .unwrap_or_else(|| vec![self.unit.clone(), self.time.clone()]);

        let spec = PanelSpec {
            outcome: &self.outcome,
            unit: &self.unit,
            time: &self.time,
            cohort: &self.cohort,
            weights: self.weights_col.as_deref(),
            covariates: &self.first_stage.covariates,
            fixed_effects: &fixed_effects,
            treatment_weights: &self.treatment_weights,
        };
        let panel = Panel::from_frame(&self.dataframe, &spec)?;

        let horizons = match &self.horizon {
            Some(selection) if self.treatment_weights.is_empty() => {
                Some(panel.resolve_horizons(selection)?)
            }
            _ => None,
        };
        let leads = self
            .pretrends
            .as_ref()
            .map(|selection| panel.resolve_pretrends(selection))
            .transpose()?;

        let untreated = panel.untreated_rows();
        if untreated.is_empty() {
            return Err(ImputationError::ConfigurationError(
                "No untreated observations to fit the first stage".to_string(),
            ));
        }
        info!(
            n_obs = panel.len(),
            n_untreated = untreated.len(),
            n_units = panel.unit.n_levels(),
            "fitting first stage on untreated observations"
        );

        let solver = self.resolved_solver();
        let request = panel.first_stage_request(&untreated);
        let fit = solver.fit(&request)?;
        let fitted = fit.predict(&request)?;

        // Treated rows whose unit or period never appears untreated have no counterfactual.
        let keep: Vec<bool> = fitted.iter().map(|f| f.is_finite()).collect();
        let n_dropped = keep.iter().filter(|&&k| !k).count();
        let (panel, fitted) = if n_dropped > 0 {
            warn!(
                n_dropped,
                "dropping treated observations whose counterfactual cannot be imputed"
            );
            let kept_fitted = fitted
                .iter()
                .zip(&keep)
                .filter(|(_, &k)| k)
                .map(|(&f, _)| f)
                .collect::<Vec<f64>>();
            (panel.filter(&keep)?, kept_fitted)
        } else {
            (panel, fitted)
        };

        let residual: Vec<f64> = panel
            .outcome
            .iter()
            .zip(&fitted)
            .map(|(y, f)| y - f)
            .collect();

        let weights = panel.treatment_weights(horizons.as_deref());
        let design = DesignMatrix::build(&fit, &panel)?;
        let engine = VarianceEngine::new(&panel, &design, &residual);
        let effects = engine.estimate_all(&weights);

        let pretrends = match leads {
            Some(leads) if !leads.is_empty() => {
                estimate_pretrends(solver.as_ref(), &panel, &leads)?
            }
            _ => Vec::new(),
        };

        let frame = if self.full_output {
            Some(results::augment_panel(
                &panel, &fitted, &residual, &weights, &effects,
            )?)
        } else {
            None
        };

        Ok(ImputationResults::assemble(
            &pretrends, &effects, &panel, n_dropped, frame,
        ))
    }
}
