use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::cohort::PaymentAttribution;
use crate::common::sibling_path;
use crate::constants::{DEFAULT_MIN_SAMPLE_SIZE, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_TOP_RISK};
use crate::error::Result;
use crate::ingest::SourceLocator;
use crate::model::ReportingPeriod;
use crate::report::{AnalysisOptions, RunConfig};

#[derive(Debug, Parser)]
#[command(name = "payment_influence")]
#[command(about = "Join Open Payments with Part D prescribing by NPI and report payment influence cohorts")]
pub struct Args {
    /// First day of the reporting period (YYYY-MM-DD, inclusive).
    #[arg(long)]
    pub start: NaiveDate,

    /// Last day of the reporting period (YYYY-MM-DD, inclusive).
    #[arg(long)]
    pub end: NaiveDate,

    /// Provider roster: a .csv/.parquet path or <warehouse.duckdb>::<table>.
    #[arg(long)]
    pub roster: SourceLocator,

    /// Open Payments records: a .csv/.parquet path or <warehouse.duckdb>::<table>.
    #[arg(long)]
    pub payments: SourceLocator,

    /// Part D prescription records: a .csv/.parquet path or <warehouse.duckdb>::<table>.
    #[arg(long)]
    pub prescriptions: SourceLocator,

    /// JSON artifact output path.
    #[arg(long)]
    pub output: PathBuf,

    /// Markdown tables output path.
    #[arg(long)]
    pub markdown: Option<PathBuf>,

    /// Write markdown next to the JSON artifact (<stem>.md) when --markdown is not given.
    #[arg(long, default_value_t = false)]
    pub write_markdown: bool,

    /// CSV export of every cohort record.
    #[arg(long)]
    pub cohorts_csv: Option<PathBuf>,

    /// Write the cohort CSV next to the JSON artifact (<stem>-cohorts.csv).
    #[arg(long, default_value_t = false)]
    pub write_cohorts_csv: bool,

    /// CSV ledger of every input row excluded by the join.
    #[arg(long)]
    pub discards_csv: Option<PathBuf>,

    /// Write the discard ledger next to the JSON artifact (<stem>-discards.csv).
    #[arg(long, default_value_t = false)]
    pub write_discards_csv: bool,

    /// Drug to analyse. A generic name selects every brand prescribed under it.
    /// Repeatable; default is every prescribed drug.
    #[arg(long = "drug")]
    pub drugs: Vec<String>,

    /// Limit the default drug list to the N drugs with the highest prescription cost.
    #[arg(long)]
    pub top_drugs: Option<usize>,

    /// Which payments count as paid for a drug.
    #[arg(long, value_enum, default_value_t = PaymentAttribution::Drug)]
    pub attribution: PaymentAttribution,

    /// Cohorts with fewer providers on either side are flagged as low sample.
    #[arg(long, default_value_t = DEFAULT_MIN_SAMPLE_SIZE)]
    pub min_sample_size: usize,

    /// Number of provider risk scores to report.
    #[arg(long, default_value_t = DEFAULT_TOP_RISK)]
    pub top_risk: usize,

    /// Per-source query timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS)]
    pub query_timeout_secs: u64,

    /// Discard NPIs whose check digit does not verify instead of only warning.
    #[arg(long, default_value_t = false)]
    pub strict_npi_checksum: bool,

    /// Exit 0 even when some sections are unavailable.
    #[arg(long, default_value_t = false)]
    pub allow_partial: bool,
}

impl Args {
    pub fn markdown_path(&self) -> Option<PathBuf> {
        self.markdown
            .clone()
            .or_else(|| self.write_markdown.then(|| sibling_path(&self.output, ".md")))
    }

    pub fn cohorts_csv_path(&self) -> Option<PathBuf> {
        self.cohorts_csv.clone().or_else(|| {
            self.write_cohorts_csv
                .then(|| sibling_path(&self.output, "-cohorts.csv"))
        })
    }

    pub fn discards_csv_path(&self) -> Option<PathBuf> {
        self.discards_csv.clone().or_else(|| {
            self.write_discards_csv
                .then(|| sibling_path(&self.output, "-discards.csv"))
        })
    }

    pub fn run_config(&self) -> Result<RunConfig> {
        Ok(RunConfig {
            period: ReportingPeriod::new(self.start, self.end)?,
            roster: self.roster.clone(),
            payments: self.payments.clone(),
            prescriptions: self.prescriptions.clone(),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            analysis: AnalysisOptions {
                drugs: self.drugs.clone(),
                top_drugs: self.top_drugs,
                attribution: self.attribution,
                min_sample_size: self.min_sample_size,
                top_risk: self.top_risk,
                strict_npi_checksum: self.strict_npi_checksum,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "payment_influence",
            "--start",
            "2022-01-01",
            "--end",
            "2022-12-31",
            "--roster",
            "data/roster.csv",
            "--payments",
            "warehouse.duckdb::open_payments",
            "--prescriptions",
            "data/part_d.parquet",
            "--output",
            "out/report.json",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_come_from_constants() {
        let args = parse(&[]);
        assert_eq!(args.min_sample_size, 30);
        assert_eq!(args.top_risk, 25);
        assert_eq!(args.attribution, PaymentAttribution::Drug);
        assert_eq!(args.markdown_path(), None);
        assert_eq!(
            args.payments,
            SourceLocator::Table {
                database: PathBuf::from("warehouse.duckdb"),
                table: "open_payments".to_string(),
            }
        );
        let config = args.run_config().unwrap();
        assert_eq!(config.query_timeout, Duration::from_secs(300));
    }

    #[test]
    fn write_switches_derive_sibling_paths() {
        let args = parse(&[
            "--write-markdown",
            "--write-discards-csv",
            "--cohorts-csv",
            "elsewhere/c.csv",
            "--attribution",
            "drug-or-manufacturer",
            "--drug",
            "Humira",
            "--drug",
            "Eliquis",
        ]);
        assert_eq!(args.markdown_path(), Some(PathBuf::from("out/report.md")));
        assert_eq!(
            args.discards_csv_path(),
            Some(PathBuf::from("out/report-discards.csv"))
        );
        assert_eq!(args.cohorts_csv_path(), Some(PathBuf::from("elsewhere/c.csv")));
        assert_eq!(args.attribution, PaymentAttribution::DrugOrManufacturer);
        assert_eq!(args.drugs, vec!["Humira", "Eliquis"]);
    }

    #[test]
    fn inverted_period_is_rejected() {
        let mut args = parse(&[]);
        args.end = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        assert!(matches!(
            args.run_config(),
            Err(PipelineError::InvalidPeriod(_))
        ));
    }

    #[test]
    fn bad_date_fails_to_parse() {
        let result = Args::try_parse_from([
            "payment_influence",
            "--start",
            "01/01/2022",
            "--end",
            "2022-12-31",
            "--roster",
            "r.csv",
            "--payments",
            "p.csv",
            "--prescriptions",
            "x.csv",
            "--output",
            "o.json",
        ]);
        assert!(result.is_err());
    }
}
