use clap::{CommandFactory, Parser};
use did_imputation::{DidImputationBuilder, Selection};
use polars::prelude::*;
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the input CSV data file
    #[arg(short, long)]
    data: PathBuf,

    /// The name of the column that contains the outcome variable
    #[arg(long)]
    outcome: String,

    /// The unit identifier column
    #[arg(long)]
    unit: String,

    /// The calendar period column (integer valued)
    #[arg(long)]
    time: String,

    /// The treatment onset column; empty, 0 or negative for never-treated units
    #[arg(long)]
    cohort: String,

    /// Column name for observation weights
    #[arg(long)]
    weights: Option<String>,

    /// A comma-separated list of treatment-weight columns, used as given
    #[arg(long, value_delimiter = ',')]
    treatment_weights: Option<Vec<String>>,

    /// Event-time horizons to estimate: "all" or a comma-separated list (e.g. "0,1,2")
    #[arg(long)]
    horizon: Option<String>,

    /// Pre-trend event times to test: "all" or a comma-separated list (e.g. "-3,-2")
    #[arg(long, allow_hyphen_values = true)]
    pretrends: Option<String>,

    /// First-stage formula (e.g., "~ x1 + x2 | id + year"); defaults to unit and period fixed effects
    #[arg(long)]
    first_stage: Option<String>,

    /// Convergence tolerance of the fixed-effects solver
    #[arg(long, default_value_t = 1e-10)]
    tolerance: f64,

    /// Iteration cap of the fixed-effects solver
    #[arg(long, default_value_t = 10_000)]
    max_iters: usize,

    /// Path to export results as JSON
    #[arg(long)]
    output_json: Option<PathBuf>,

    /// Path to export results as Markdown
    #[arg(long)]
    output_markdown: Option<PathBuf>,

    /// Path to export the augmented panel (residuals and correction weights) as CSV
    #[arg(long)]
    output_panel: Option<PathBuf>,
}

fn run_analysis(args: Cli) -> Result<(), Box<dyn Error>> {
    let df = LazyCsvReader::new(&args.data)
        .with_has_header(true)
        .finish()?
        .collect()?;

    let mut builder = DidImputationBuilder::new(df, &args.outcome, &args.unit, &args.time, &args.cohort);
    builder
        .tolerance(args.tolerance)
        .max_iters(args.max_iters)
        .full_output(args.output_panel.is_some());
    if let Some(weights) = &args.weights {
        builder.weights(weights);
    }
    if let Some(columns) = &args.treatment_weights {
        let columns: Vec<&str> = columns.iter().map(AsRef::as_ref).collect();
        builder.treatment_weights(&columns);
    }
    if let Some(horizon) = &args.horizon {
        builder.horizon(horizon.parse::<Selection>()?);
    }
    if let Some(pretrends) = &args.pretrends {
        builder.pretrends(pretrends.parse::<Selection>()?);
    }
    if let Some(formula) = &args.first_stage {
        builder.first_stage_formula(formula)?;
    }

    let results = builder.run()?;
    results.summary();

    if let Some(path) = args.output_json {
        let json = results
            .to_json()
            .map_err(|e| format!("Failed to serialize to JSON: {}", e))?;
        std::fs::write(path, json)?;
    }
    if let Some(path) = args.output_markdown {
        std::fs::write(path, results.to_markdown())?;
    }
    if let (Some(path), Some(panel)) = (args.output_panel, results.panel()) {
        let mut panel = panel.clone();
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).finish(&mut panel)?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run_analysis(cli) {
        eprintln!("Error: {}", e);
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        std::process::exit(1);
    }
}
