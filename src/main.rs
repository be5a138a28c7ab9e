mod aggregate;
mod args;
mod cohort;
mod common;
mod constants;
mod error;
mod ingest;
mod join;
mod model;
mod npi;
mod render;
mod report;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;

use args::Args;
use error::PipelineError;
use report::Report;

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(failure_code(&err))
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let config = args.run_config().context("invalid arguments")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed starting tokio runtime")?;
    let output = runtime.block_on(report::run_pipeline(&config));
    // A loader that hit its timeout may still hold a blocking thread.
    runtime.shutdown_timeout(Duration::from_secs(1));
    let output = output.context("pipeline failed")?;
    let report = &output.report;

    render::write_json(&args.output, report).context("writing JSON artifact")?;
    tracing::info!("JSON: {}", args.output.display());
    if let Some(path) = args.markdown_path() {
        render::write_markdown(&path, report).context("writing markdown")?;
        tracing::info!("Markdown: {}", path.display());
    }
    if let Some(path) = args.cohorts_csv_path() {
        render::write_cohorts_csv(&path, report).context("writing cohort CSV")?;
        tracing::info!("Cohorts CSV: {}", path.display());
    }
    if let Some(path) = args.discards_csv_path() {
        render::write_discards_csv(&path, &output.ledger).context("writing discard ledger")?;
        tracing::info!("Discards CSV: {} ({} rows)", path.display(), output.ledger.len());
    }

    Ok(ExitCode::from(completion_code(report, args.allow_partial)))
}

/// Typed pipeline failures keep their code through any `.context()` layers.
fn failure_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}

/// Status for a run whose artifacts were all written.
fn completion_code(report: &Report, allow_partial: bool) -> u8 {
    let degraded = report.degraded_sources();
    if degraded.is_empty() {
        return 0;
    }
    let names = degraded
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if allow_partial {
        tracing::warn!("report written with unavailable sources: {names} (--allow-partial)");
        0
    } else {
        tracing::warn!("report written with unavailable sources: {names}");
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::{period, scenario_one};
    use crate::cohort::PaymentAttribution;
    use crate::error::UnavailableReason;
    use crate::model::SourceKind;
    use crate::report::{AnalysisOptions, Inputs, build_report, join_inputs};
    use std::path::PathBuf;

    fn report(prescriptions_missing: bool) -> Report {
        let (roster, payments, prescriptions) = scenario_one();
        let inputs = Inputs {
            roster: Ok(roster),
            payments: Ok(payments),
            prescriptions: if prescriptions_missing {
                Err(PipelineError::unavailable(
                    SourceKind::Prescriptions,
                    UnavailableReason::Missing("part_d.csv".to_string()),
                ))
            } else {
                Ok(prescriptions)
            },
        };
        let options = AnalysisOptions {
            drugs: Vec::new(),
            top_drugs: None,
            attribution: PaymentAttribution::Drug,
            min_sample_size: 30,
            top_risk: 25,
            strict_npi_checksum: false,
        };
        let snapshot = join_inputs(period(), &options, &inputs);
        build_report(&snapshot, &options, &inputs).unwrap()
    }

    #[test]
    fn degraded_report_exits_two_unless_partial_is_allowed() {
        assert_eq!(completion_code(&report(false), false), 0);
        assert_eq!(completion_code(&report(true), false), 2);
        assert_eq!(completion_code(&report(true), true), 0);
    }

    #[test]
    fn typed_failures_survive_context_layers() {
        let write = anyhow::Error::new(PipelineError::write_failure(
            PathBuf::from("out/report.json"),
            std::io::Error::other("disk full"),
        ))
        .context("writing JSON artifact")
        .context("run failed");
        assert_eq!(failure_code(&write), 3);

        let mismatch = Err::<(), _>(PipelineError::CohortMismatch {
            numerator: "HUMIRA paid 2022".to_string(),
            denominator: "HUMIRA unpaid 2021".to_string(),
        })
        .context("pipeline failed");
        assert_eq!(failure_code(&mismatch.unwrap_err()), 4);

        assert_eq!(failure_code(&anyhow::anyhow!("invalid arguments")), 1);
    }
}
