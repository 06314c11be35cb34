//! Result tables and the augmented diagnostic panel.

use crate::panel::{Panel, TreatmentWeights};
use crate::pretrends::PretrendEstimate;
use crate::variance::VectorEstimate;
use crate::ImputationError;
use comfy_table::{Cell, Table};
use getset::Getters;
use polars::prelude::*;
use serde::Serialize;

/// Normal critical value for two-sided 95% intervals.
const Z_95: f64 = 1.96;

/// One row of the results table.
#[derive(Debug, Getters, Clone, Serialize)]
#[getset(get = "pub")]
pub struct TermEstimate {
    term: String,
    estimate: f64,
    std_error: f64,
    conf_low: f64,
    conf_high: f64,
}

impl TermEstimate {
    pub fn new(term: &str, estimate: f64, std_error: f64) -> Self {
        Self {
            term: term.to_string(),
            estimate,
            std_error,
            conf_low: estimate - Z_95 * std_error,
            conf_high: estimate + Z_95 * std_error,
        }
    }
}

/// Holds all the results from the imputation estimator.
#[derive(Debug, Getters, Serialize)]
#[getset(get = "pub")]
pub struct ImputationResults {
    /// Pre-trend rows first, then one row per treatment-weight vector.
    terms: Vec<TermEstimate>,
    /// Observations used after dropping incomplete rows.
    n_obs: usize,
    /// Treated observations among them.
    n_treated: usize,
    n_units: usize,
    /// Treated observations dropped because no counterfactual could be imputed.
    n_dropped: usize,
    /// The panel with fitted values, residuals and per-term diagnostics.
    #[serde(skip)]
    panel: Option<DataFrame>,
}

impl ImputationResults {
    pub(crate) fn assemble(
        pretrends: &[PretrendEstimate],
        effects: &[VectorEstimate],
        panel: &Panel,
        n_dropped: usize,
        frame: Option<DataFrame>,
    ) -> Self {
        let terms = pretrends
            .iter()
            .map(|p| TermEstimate::new(&p.event_time.to_string(), p.estimate, p.std_error))
            .chain(
                effects
                    .iter()
                    .map(|e| TermEstimate::new(&e.label.to_string(), e.estimate, e.std_error())),
            )
            .collect();
        Self {
            terms,
            n_obs: panel.len(),
            n_treated: panel.n_treated(),
            n_units: panel.unit.codes.iter().collect::<std::collections::HashSet<_>>().len(),
            n_dropped,
            panel: frame,
        }
    }

    /// Looks up a row by its term label, e.g. `"treat"`, `"0"` or `"-2"`.
    pub fn term(&self, name: &str) -> Option<&TermEstimate> {
        self.terms.iter().find(|t| t.term == name)
    }

    /// Prints a formatted summary of the estimates to the console.
    pub fn summary(&self) {
        println!("Imputation Difference-in-Differences (Borusyak, Jaravel & Spiess)");
        println!("==================================================================");
        println!("Observations: {} ({} treated)", self.n_obs, self.n_treated);
        println!("Units:        {}", self.n_units);
        if self.n_dropped > 0 {
            println!(
                "Dropped:      {} treated observations without an imputable counterfactual",
                self.n_dropped
            );
        }
        println!();

        let mut table = Table::new();
        table.set_header(vec!["Term", "Estimate", "Std. Err.", "95% CI"]);
        for t in &self.terms {
            table.add_row(vec![
                Cell::new(&t.term),
                Cell::new(format!("{:.4}", t.estimate)),
                Cell::new(format!("{:.4}", t.std_error)),
                Cell::new(format!("[{:.3}, {:.3}]", t.conf_low, t.conf_high)),
            ]);
        }
        println!("{}", table);
    }

    /// Exports the results to a Markdown table.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("### Imputation Difference-in-Differences Results\n\n");
        md.push_str("| Term | Estimate | Std. Err. | 95% CI |\n");
        md.push_str("|---|---|---|---|\n");
        for t in &self.terms {
            md.push_str(&format!(
                "| {} | {:.4} | {:.4} | [{:.3}, {:.3}] |\n",
                t.term, t.estimate, t.std_error, t.conf_low, t.conf_high
            ));
        }
        md
    }

    /// Exports the results to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The results table as a `DataFrame` with columns
    /// `term, estimate, std_error, conf_low, conf_high`.
    pub fn to_frame(&self) -> PolarsResult<DataFrame> {
        df!(
            "term" => self.terms.iter().map(|t| t.term.clone()).collect::<Vec<_>>(),
            "estimate" => self.terms.iter().map(|t| t.estimate).collect::<Vec<_>>(),
            "std_error" => self.terms.iter().map(|t| t.std_error).collect::<Vec<_>>(),
            "conf_low" => self.terms.iter().map(|t| t.conf_low).collect::<Vec<_>>(),
            "conf_high" => self.terms.iter().map(|t| t.conf_high).collect::<Vec<_>>()
        )
    }
}

/// The cleaned input rows with the estimator's working columns appended. A working
/// column whose name is already taken by an input column is a configuration error.
pub(crate) fn augment_panel(
    panel: &Panel,
    fitted: &[f64],
    residual: &[f64],
    weights: &[TreatmentWeights],
    effects: &[VectorEstimate],
) -> Result<DataFrame, ImputationError> {
    let mut derived = vec![
        Series::new("treat".into(), panel.treated.clone()),
        Series::new(
            "event_time".into(),
            panel
                .event_time
                .iter()
                .map(|e| e.finite())
                .collect::<Vec<Option<i64>>>(),
        ),
        Series::new("fitted".into(), fitted.to_vec()),
        Series::new("residual".into(), residual.to_vec()),
    ];
    for (w, e) in weights.iter().zip(effects) {
        let term = w.label.to_string();
        derived.push(Series::new(format!("weight_{}", term).into(), w.values.clone()));
        derived.push(Series::new(format!("v_{}", term).into(), e.correction.clone()));
        derived.push(Series::new(
            format!("residual_centered_{}", term).into(),
            e.centered.clone(),
        ));
    }

    let mut frame = panel.frame.clone();
    for series in derived {
        if frame.get_column_index(series.name()).is_some() {
            return Err(ImputationError::ConfigurationError(format!(
                "Input column '{}' clashes with an output column; rename it or disable full output",
                series.name()
            )));
        }
        frame.with_column(series)?;
    }
    Ok(frame)
}
