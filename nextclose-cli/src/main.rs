//! NextClose CLI — run the forecasting pipeline or individual stages.
//!
//! Commands:
//! - `run`: ingest, forecast, ensemble and evaluate in order
//! - `ingest` / `forecast` / `ensemble` / `evaluate`: one stage
//! - `report`: aggregate error metrics from stored evaluations
//! - `signals`: top-predicted model per entity on the latest as-of date
//! - `status`: stored row counts and date coverage per entity
//!
//! A retryable storage failure exits with code 75 so an external scheduler
//! can retry the whole batch. Any other failure exits with 1.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use nextclose_core::store::{SeriesQuery, SeriesStore};
use nextclose_runner::report::{evaluations_csv, signals_csv, summary_csv, summary_json};
use nextclose_runner::{
    summarize, top_signals, GroupBy, Pipeline, PipelineConfig, PipelineError, SignalRow, SummaryRow,
};

const EXIT_RETRYABLE: i32 = 75;

#[derive(Parser)]
#[command(
    name = "nextclose",
    version,
    about = "NextClose — walk-forward next-close forecasting pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Common {
    /// Path to the pipeline TOML config.
    #[arg(long, default_value = "nextclose.toml")]
    config: PathBuf,

    /// Restrict to these entity ids (comma separated). Defaults to the
    /// config universe, or every stored entity when that is empty.
    #[arg(long, value_delimiter = ',')]
    entities: Vec<String>,

    /// Print the stage report as JSON instead of text.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage: ingest, forecast, ensemble, evaluate.
    Run {
        #[command(flatten)]
        common: Common,

        /// Session date to ingest through (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        today: Option<String>,

        /// Backfill start for entities with no stored prices (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,
    },
    /// Fetch and store missing sessions.
    Ingest {
        #[command(flatten)]
        common: Common,

        /// Session date to ingest through (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        today: Option<String>,

        /// Backfill start for entities with no stored prices (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,
    },
    /// Walk-forward forecasts for every registered model.
    Forecast {
        #[command(flatten)]
        common: Common,

        /// Recompute the whole history instead of only new as-of dates.
        #[arg(long, default_value_t = false)]
        full: bool,
    },
    /// Rebuild mean/median ensembles from stored member forecasts.
    Ensemble {
        #[command(flatten)]
        common: Common,
    },
    /// Score stored forecasts against realized next closes.
    Evaluate {
        #[command(flatten)]
        common: Common,
    },
    /// Aggregate MAE, MAPE, RMSE and direction accuracy.
    Report {
        #[command(flatten)]
        common: Common,

        /// Grouping: model, entity-model or date-model.
        #[arg(long, default_value = "model")]
        group_by: GroupBy,

        /// Only these models (comma separated).
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,

        /// First as-of date (YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,

        /// Last as-of date (YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,

        /// Output format: table, csv, json, or raw (per-row CSV).
        #[arg(long, default_value = "table")]
        format: String,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Top-predicted base model per entity on one as-of date.
    Signals {
        #[command(flatten)]
        common: Common,

        /// As-of date (YYYY-MM-DD). Defaults to the latest stored forecast.
        #[arg(long)]
        as_of: Option<String>,

        /// Write CSV to this file instead of printing a table.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Stored row counts and date coverage per entity.
    Status {
        #[command(flatten)]
        common: Common,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli.command) {
        eprintln!("Error: {err:#}");
        let retryable = err
            .downcast_ref::<PipelineError>()
            .is_some_and(PipelineError::is_retryable);
        std::process::exit(if retryable { EXIT_RETRYABLE } else { 1 });
    }
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            common,
            today,
            start,
        } => {
            let (pipeline, entities) = open(&common)?;
            let today = parse_date_or_today(today.as_deref())?;
            let start = parse_date(start.as_deref())?;
            let report = pipeline.run(&entities, today, start)?;
            emit(&report, common.json, || {
                print_ingest(&report.ingest);
                print_forecast(&report.forecast);
                println!(
                    "ensemble: {} rows over {} entities",
                    report.ensemble.rows_written, report.ensemble.entities
                );
                println!(
                    "evaluate: {} records written, {} pending",
                    report.evaluate.records_written, report.evaluate.pending
                );
            })
        }
        Commands::Ingest {
            common,
            today,
            start,
        } => {
            let (pipeline, entities) = open(&common)?;
            let today = parse_date_or_today(today.as_deref())?;
            let start = parse_date(start.as_deref())?;
            let report = pipeline.ingest(&entities, today, start)?;
            emit(&report, common.json, || print_ingest(&report))
        }
        Commands::Forecast { common, full } => {
            let (pipeline, entities) = open(&common)?;
            let entities = or_stored(&pipeline, entities)?;
            let report = pipeline.forecast(&entities, full)?;
            emit(&report, common.json, || print_forecast(&report))
        }
        Commands::Ensemble { common } => {
            let (pipeline, entities) = open(&common)?;
            let entities = or_stored(&pipeline, entities)?;
            let report = pipeline.ensemble(&entities)?;
            emit(&report, common.json, || {
                println!(
                    "ensemble: {} rows over {} entities",
                    report.rows_written, report.entities
                )
            })
        }
        Commands::Evaluate { common } => {
            let (pipeline, entities) = open(&common)?;
            let entities = or_stored(&pipeline, entities)?;
            let report = pipeline.evaluate(&entities)?;
            emit(&report, common.json, || {
                println!(
                    "evaluate: {} records written, {} pending",
                    report.records_written, report.pending
                )
            })
        }
        Commands::Report {
            common,
            group_by,
            models,
            from,
            to,
            format,
            output,
        } => run_report(&common, group_by, models, from, to, &format, output),
        Commands::Signals {
            common,
            as_of,
            output,
        } => run_signals(&common, as_of, output),
        Commands::Status { common } => {
            let (pipeline, entities) = open(&common)?;
            let status = pipeline.status(&entities)?;
            emit(&status, common.json, || {
                println!("store: {}   models: {}", status.store, status.models.join(", "));
                println!(
                    "{:<12} {:>7} {:>12} {:>12} {:>9} {:>12} {:>7}",
                    "entity", "prices", "first", "last", "forecasts", "last as-of", "evals"
                );
                for e in &status.entities {
                    println!(
                        "{:<12} {:>7} {:>12} {:>12} {:>9} {:>12} {:>7}",
                        e.entity_id,
                        e.prices,
                        fmt_date(e.first_date),
                        fmt_date(e.last_date),
                        e.forecasts,
                        fmt_date(e.last_forecast),
                        e.evaluations
                    );
                }
            })
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn open(common: &Common) -> Result<(Pipeline, Vec<String>)> {
    let config = PipelineConfig::from_file(&common.config)
        .with_context(|| format!("loading {}", common.config.display()))?;
    let entities = if common.entities.is_empty() {
        config.universe.clone()
    } else {
        common.entities.clone()
    };
    let pipeline = Pipeline::from_config(&config)?;
    log::debug!(
        "config {} opened: store {}, {} entities",
        common.config.display(),
        pipeline.store().name(),
        entities.len()
    );
    Ok((pipeline, entities))
}

/// Stages after ingest fall back to whatever the store holds.
fn or_stored(pipeline: &Pipeline, entities: Vec<String>) -> Result<Vec<String>> {
    if !entities.is_empty() {
        return Ok(entities);
    }
    Ok(pipeline.stored_entities()?)
}

fn parse_date(s: Option<&str>) -> Result<Option<NaiveDate>> {
    s.map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("dates must be YYYY-MM-DD")
}

fn parse_date_or_today(s: Option<&str>) -> Result<NaiveDate> {
    Ok(parse_date(s)?.unwrap_or_else(|| chrono::Local::now().date_naive()))
}

fn fmt_date(d: Option<NaiveDate>) -> String {
    d.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
}

fn emit<T: Serialize>(report: &T, json: bool, text: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        text();
    }
    Ok(())
}

fn print_ingest(r: &nextclose_runner::IngestReport) {
    println!(
        "ingest: {} planned, {} up to date, {} fetched, {} stored, {} rejected ({} ms)",
        r.planned, r.up_to_date, r.rows_fetched, r.rows_stored, r.rows_rejected, r.elapsed_ms
    );
    for f in &r.failures {
        println!("  failed {}: {}", f.entity_id, f.reason);
    }
}

fn print_forecast(r: &nextclose_runner::ForecastReport) {
    println!(
        "forecast: {} rows over {} entities, {} below history floor ({} ms)",
        r.forecasts_written, r.entities, r.insufficient_history, r.elapsed_ms
    );
    for u in &r.unavailable {
        println!("  unavailable: {u}");
    }
    for f in &r.failures {
        println!(
            "  failed {} / {}: {}",
            f.entity_id,
            f.model_name.as_deref().unwrap_or("-"),
            f.reason
        );
    }
}

fn run_report(
    common: &Common,
    group_by: GroupBy,
    models: Vec<String>,
    from: Option<String>,
    to: Option<String>,
    format: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let (pipeline, entities) = open(common)?;

    let mut query = SeriesQuery::all();
    if !entities.is_empty() {
        query = query.with_entities(entities);
    }
    if !models.is_empty() {
        query = query.with_models(models);
    }
    let from = parse_date(from.as_deref())?;
    let to = parse_date(to.as_deref())?;
    if from.is_some() || to.is_some() {
        query = query.between(
            from.unwrap_or(NaiveDate::MIN),
            to.unwrap_or(NaiveDate::MAX),
        );
    }

    let records = pipeline
        .store()
        .query_evaluations(&query, pipeline.timeout())
        .map_err(|source| PipelineError::Storage {
            stage: nextclose_runner::Stage::Evaluate,
            entity_id: None,
            source,
        })?;
    let rows = summarize(&records, group_by);

    let rendered = match format {
        "table" => render_table(&rows),
        "csv" => summary_csv(&rows)?,
        "json" => summary_json(&rows)?,
        "raw" => evaluations_csv(&records)?,
        other => bail!("unknown format '{other}'. Valid: table, csv, json, raw"),
    };

    match output {
        Some(path) => {
            std::fs::write(&path, rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{} rows written to {}", rows.len(), path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn run_signals(common: &Common, as_of: Option<String>, output: Option<PathBuf>) -> Result<()> {
    let (pipeline, entities) = open(common)?;
    let as_of = parse_date(as_of.as_deref())?;

    let mut query = SeriesQuery::all();
    if !entities.is_empty() {
        query = query.with_entities(entities);
    }
    if let Some(day) = as_of {
        query = query.between(day, day);
    }
    let forecasts = pipeline
        .store()
        .query_forecasts(&query, pipeline.timeout())
        .map_err(|source| PipelineError::Storage {
            stage: nextclose_runner::Stage::Forecast,
            entity_id: None,
            source,
        })?;
    let rows = top_signals(&forecasts, as_of);

    if let Some(path) = output {
        std::fs::write(&path, signals_csv(&rows)?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("{} signals written to {}", rows.len(), path.display());
        return Ok(());
    }
    emit(&rows, common.json, || print!("{}", render_signals(&rows)))
}

fn render_signals(rows: &[SignalRow]) -> String {
    let mut out = format!(
        "{:<12} {:<10} {:<18} {:>12}\n",
        "as_of", "entity", "model", "predicted"
    );
    for r in rows {
        out.push_str(&format!(
            "{:<12} {:<10} {:<18} {:>12.4}\n",
            r.as_of, r.entity_id, r.model_name, r.predicted_value
        ));
    }
    out
}

fn render_table(rows: &[SummaryRow]) -> String {
    let mut out = format!(
        "{:<12} {:<10} {:<18} {:>6} {:>10} {:>8} {:>10} {:>6}\n",
        "as_of", "entity", "model", "n", "mae", "mape%", "rmse", "dir%"
    );
    for r in rows {
        let s = &r.summary;
        out.push_str(&format!(
            "{:<12} {:<10} {:<18} {:>6} {:>10.4} {:>8} {:>10.4} {:>6.1}\n",
            fmt_date(r.as_of),
            r.entity_id.as_deref().unwrap_or("*"),
            r.model_name,
            s.count,
            s.mae,
            s.mape.map(|m| format!("{m:.2}")).unwrap_or_else(|| "-".into()),
            s.rmse,
            s.direction_accuracy * 100.0
        ));
    }
    out
}
