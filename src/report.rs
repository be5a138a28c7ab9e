use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::aggregate::{
    CohortRecord, DrugSelection, GroupingSpec, PaymentCategory, PrescriptionPattern,
    ProviderRisk, ProviderTypeCount, aggregate, payment_categories, prescription_patterns,
    risk_scores, roster_mix, select_drugs,
};
use crate::cohort::{GroupBy, PaymentAttribution};
use crate::constants::REPORT_SCHEMA_VERSION;
use crate::error::{PipelineError, Result};
use crate::ingest::{self, SourceLocator, fetch_with_timeout};
use crate::join::{DiscardEntry, DiscardTally, JoinOptions, Snapshot, join};
use crate::model::{
    DrugKey, PaymentRecord, PrescriptionRecord, ReportingPeriod, RosterEntry, SourceKind,
};

/// Outcome of one report section. Unavailable sections carry the typed
/// failure that blocked them instead of zero-filled data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Section<T> {
    Computed {
        data: T,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        notes: Vec<String>,
    },
    Unavailable {
        kind: String,
        source: SourceKind,
        detail: String,
    },
}

impl<T> Section<T> {
    pub fn computed(data: T) -> Self {
        Self::Computed {
            data,
            notes: Vec::new(),
        }
    }

    pub fn blocked_by(source: SourceKind, err: &PipelineError) -> Self {
        Self::Unavailable {
            kind: err.kind().to_string(),
            source,
            detail: err.to_string(),
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Computed { data, .. } => Some(data),
            Self::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sections {
    pub roster_mix: Section<Vec<ProviderTypeCount>>,
    pub payment_categories: Section<Vec<PaymentCategory>>,
    pub prescription_patterns: Section<Vec<PrescriptionPattern>>,
    pub influence_by_drug: Section<Vec<CohortRecord>>,
    pub influence_by_provider_type: Section<Vec<CohortRecord>>,
    pub influence_by_specialty: Section<Vec<CohortRecord>>,
    pub influence_by_payment_tier: Section<Vec<CohortRecord>>,
    pub influence_by_consecutive_years: Section<Vec<CohortRecord>>,
    pub provider_risk: Section<Vec<ProviderRisk>>,
}

impl Sections {
    /// Cohort sections in report order, with their display titles.
    pub fn cohort_sections(&self) -> [(&'static str, &Section<Vec<CohortRecord>>); 5] {
        [
            ("Influence by Drug", &self.influence_by_drug),
            ("Influence by Provider Type", &self.influence_by_provider_type),
            ("Influence by Specialty", &self.influence_by_specialty),
            ("Influence by Payment Tier", &self.influence_by_payment_tier),
            (
                "Influence by Consecutive Payment Years",
                &self.influence_by_consecutive_years,
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Loaded { rows: usize },
    Unavailable { kind: String, detail: String },
}

/// How every input row was accounted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub sources: BTreeMap<SourceKind, SourceStatus>,
    pub providers_joined: usize,
    pub discard_count: usize,
    pub tally: DiscardTally,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub schema_version: u32,
    pub period: ReportingPeriod,
    pub attribution: PaymentAttribution,
    pub min_sample_size: usize,
    pub drugs: Vec<DrugKey>,
    /// Requested drugs with no joined prescriptions; not measured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched_drugs: Vec<DrugKey>,
    pub reconciliation: Reconciliation,
    pub sections: Sections,
}

impl Report {
    pub fn degraded_sources(&self) -> Vec<SourceKind> {
        self.reconciliation
            .sources
            .iter()
            .filter(|(_, status)| matches!(status, SourceStatus::Unavailable { .. }))
            .map(|(source, _)| *source)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Explicit drug list; empty means every prescribed drug.
    pub drugs: Vec<String>,
    pub top_drugs: Option<usize>,
    pub attribution: PaymentAttribution,
    pub min_sample_size: usize,
    pub top_risk: usize,
    pub strict_npi_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub period: ReportingPeriod,
    pub roster: SourceLocator,
    pub payments: SourceLocator,
    pub prescriptions: SourceLocator,
    pub query_timeout: Duration,
    pub analysis: AnalysisOptions,
}

/// Per-source load results; a failed source degrades only what depends on it.
pub struct Inputs {
    pub roster: Result<Vec<RosterEntry>>,
    pub payments: Result<Vec<PaymentRecord>>,
    pub prescriptions: Result<Vec<PrescriptionRecord>>,
}

fn status_of<T>(loaded: &Result<Vec<T>>) -> SourceStatus {
    match loaded {
        Ok(rows) => SourceStatus::Loaded { rows: rows.len() },
        Err(err) => SourceStatus::Unavailable {
            kind: err.kind().to_string(),
            detail: err.to_string(),
        },
    }
}

fn rows_or_empty<T>(loaded: &Result<Vec<T>>) -> &[T] {
    match loaded {
        Ok(rows) => rows,
        Err(_) => &[],
    }
}

struct Availability<'a> {
    failures: Vec<(SourceKind, &'a PipelineError)>,
}

impl<'a> Availability<'a> {
    fn new(inputs: &'a Inputs) -> Self {
        let failures = [
            (SourceKind::Roster, inputs.roster.as_ref().err()),
            (SourceKind::Payments, inputs.payments.as_ref().err()),
            (SourceKind::Prescriptions, inputs.prescriptions.as_ref().err()),
        ]
        .into_iter()
        .filter_map(|(source, err)| err.map(|e| (source, e)))
        .collect();
        Self { failures }
    }

    /// First failed source among `needs`, in roster, payments, prescriptions order.
    fn blocker(&self, needs: &[SourceKind]) -> Option<(SourceKind, &'a PipelineError)> {
        self.failures
            .iter()
            .find(|(source, _)| needs.contains(source))
            .copied()
    }

    fn section<T>(&self, name: &str, needs: &[SourceKind], compute: impl FnOnce() -> T) -> Section<T> {
        match self.blocker(needs) {
            Some((source, err)) => {
                tracing::warn!("section {name} unavailable: {err}");
                Section::blocked_by(source, err)
            }
            None => Section::computed(compute()),
        }
    }

    fn cohort_section(
        &self,
        snapshot: &Snapshot,
        grouping: &GroupingSpec,
    ) -> Result<Section<Vec<CohortRecord>>> {
        if let Some((source, err)) = self.blocker(ALL_SOURCES) {
            tracing::warn!(
                "section influence_by_{} unavailable: {err}",
                grouping.group_by.as_str()
            );
            return Ok(Section::blocked_by(source, err));
        }
        let outcome = aggregate(snapshot, grouping)?;
        Ok(Section::Computed {
            data: outcome.records,
            notes: outcome.notes,
        })
    }
}

const ALL_SOURCES: &[SourceKind] = &[
    SourceKind::Roster,
    SourceKind::Payments,
    SourceKind::Prescriptions,
];

/// Joins whatever loaded; a failed source contributes no rows.
pub fn join_inputs(period: ReportingPeriod, options: &AnalysisOptions, inputs: &Inputs) -> Snapshot {
    let started = Instant::now();
    tracing::info!("Step 2/3: join sources on NPI");
    let snapshot = join(
        period,
        rows_or_empty(&inputs.roster),
        rows_or_empty(&inputs.payments),
        rows_or_empty(&inputs.prescriptions),
        &JoinOptions {
            strict_npi_checksum: options.strict_npi_checksum,
        },
    );
    tracing::info!(
        "joined {} providers, discarded {} rows ({:.2?})",
        snapshot.providers.len(),
        snapshot.tally.discard_count(),
        started.elapsed()
    );
    snapshot
}

/// Aggregates a snapshot into report sections. Only a cohort mismatch is fatal.
pub fn build_report(
    snapshot: &Snapshot,
    options: &AnalysisOptions,
    inputs: &Inputs,
) -> Result<Report> {
    let started = Instant::now();
    tracing::info!("Step 3/3: aggregate cohorts");
    let availability = Availability::new(inputs);
    let DrugSelection {
        drugs,
        unmatched: unmatched_drugs,
    } = select_drugs(snapshot, &options.drugs, options.top_drugs);
    tracing::info!("analysing {} drug(s)", drugs.len());

    let grouping = |group_by| GroupingSpec {
        group_by,
        drugs: drugs.clone(),
        attribution: options.attribution,
        min_sample_size: options.min_sample_size,
    };
    let sections = Sections {
        roster_mix: availability.section("roster_mix", &[SourceKind::Roster], || {
            roster_mix(snapshot)
        }),
        payment_categories: availability.section(
            "payment_categories",
            &[SourceKind::Roster, SourceKind::Payments],
            || payment_categories(snapshot),
        ),
        prescription_patterns: availability.section(
            "prescription_patterns",
            &[SourceKind::Roster, SourceKind::Prescriptions],
            || prescription_patterns(snapshot, &drugs),
        ),
        influence_by_drug: availability.cohort_section(snapshot, &grouping(GroupBy::Drug))?,
        influence_by_provider_type: availability
            .cohort_section(snapshot, &grouping(GroupBy::ProviderType))?,
        influence_by_specialty: availability
            .cohort_section(snapshot, &grouping(GroupBy::Specialty))?,
        influence_by_payment_tier: availability
            .cohort_section(snapshot, &grouping(GroupBy::PaymentTier))?,
        influence_by_consecutive_years: availability
            .cohort_section(snapshot, &grouping(GroupBy::ConsecutiveYears))?,
        provider_risk: availability.section("provider_risk", ALL_SOURCES, || {
            risk_scores(snapshot, &drugs, options.attribution, options.top_risk)
        }),
    };
    tracing::info!("aggregation complete ({:.2?})", started.elapsed());

    let sources = [
        (SourceKind::Roster, status_of(&inputs.roster)),
        (SourceKind::Payments, status_of(&inputs.payments)),
        (SourceKind::Prescriptions, status_of(&inputs.prescriptions)),
    ]
    .into_iter()
    .collect();

    Ok(Report {
        schema_version: REPORT_SCHEMA_VERSION,
        period: snapshot.period,
        attribution: options.attribution,
        min_sample_size: options.min_sample_size,
        drugs,
        unmatched_drugs,
        reconciliation: Reconciliation {
            sources,
            providers_joined: snapshot.providers.len(),
            discard_count: snapshot.tally.discard_count(),
            tally: snapshot.tally.clone(),
        },
        sections,
    })
}

async fn load<T, F>(
    source_kind: SourceKind,
    locator: &SourceLocator,
    timeout: Duration,
    loader: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let loaded = fetch_with_timeout(source_kind, timeout, loader).await;
    match &loaded {
        Ok(_) => tracing::info!("loaded {source_kind} from {locator} ({:.2?})", started.elapsed()),
        Err(err) => tracing::warn!("{err}"),
    }
    loaded
}

/// Everything a run produces before it is written out.
pub struct PipelineOutput {
    pub report: Report,
    pub ledger: Vec<DiscardEntry>,
}

/// Loads every source, then joins and aggregates them into a [`Report`].
pub async fn run_pipeline(config: &RunConfig) -> Result<PipelineOutput> {
    tracing::info!("payment influence run, period {}", config.period);
    tracing::info!("Step 1/3: load sources");
    let timeout = config.query_timeout;
    let period = config.period;

    let locator = config.roster.clone();
    let roster = load(SourceKind::Roster, &config.roster, timeout, move || {
        ingest::load_roster(&locator)
    })
    .await;
    let locator = config.payments.clone();
    let payments = load(SourceKind::Payments, &config.payments, timeout, move || {
        ingest::load_payments(&locator, &period)
    })
    .await;
    let locator = config.prescriptions.clone();
    let prescriptions = load(
        SourceKind::Prescriptions,
        &config.prescriptions,
        timeout,
        move || ingest::load_prescriptions(&locator, &period),
    )
    .await;

    let inputs = Inputs {
        roster,
        payments,
        prescriptions,
    };
    let snapshot = join_inputs(period, &config.analysis, &inputs);
    let report = build_report(&snapshot, &config.analysis, &inputs)?;
    Ok(PipelineOutput {
        report,
        ledger: snapshot.ledger,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::{period, scenario_one};
    use crate::error::UnavailableReason;
    use std::fs;
    use std::path::Path;

    fn options() -> AnalysisOptions {
        AnalysisOptions {
            drugs: Vec::new(),
            top_drugs: None,
            attribution: PaymentAttribution::Drug,
            min_sample_size: 30,
            top_risk: 25,
            strict_npi_checksum: false,
        }
    }

    fn report_for(inputs: &Inputs) -> Report {
        let snapshot = join_inputs(period(), &options(), inputs);
        build_report(&snapshot, &options(), inputs).unwrap()
    }

    #[test]
    fn empty_prescriptions_make_patterns_unavailable() {
        let (roster, payments, _) = scenario_one();
        let inputs = Inputs {
            roster: Ok(roster),
            payments: Ok(payments),
            prescriptions: Err(PipelineError::unavailable(
                SourceKind::Prescriptions,
                UnavailableReason::Empty,
            )),
        };
        let report = report_for(&inputs);

        match &report.sections.prescription_patterns {
            Section::Unavailable {
                kind,
                source,
                detail,
            } => {
                assert_eq!(kind, "data_unavailable");
                assert_eq!(*source, SourceKind::Prescriptions);
                assert!(detail.contains("zero rows"));
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert!(report.sections.influence_by_drug.data().is_none());
        assert!(report.sections.provider_risk.data().is_none());
        // Sections that do not read prescriptions still compute.
        assert!(report.sections.roster_mix.data().is_some());
        assert!(report.sections.payment_categories.data().is_some());
        assert_eq!(report.degraded_sources(), vec![SourceKind::Prescriptions]);
    }

    #[test]
    fn requested_drugs_without_prescriptions_are_listed_not_measured() {
        let (roster, payments, prescriptions) = scenario_one();
        let inputs = Inputs {
            roster: Ok(roster),
            payments: Ok(payments),
            prescriptions: Ok(prescriptions),
        };
        let options = AnalysisOptions {
            drugs: vec!["humira".to_string(), "Ozempic".to_string()],
            ..options()
        };
        let snapshot = join_inputs(period(), &options, &inputs);
        let report = build_report(&snapshot, &options, &inputs).unwrap();

        assert_eq!(report.drugs, vec![DrugKey::normalize("Humira").unwrap()]);
        assert_eq!(report.unmatched_drugs, vec![DrugKey::normalize("Ozempic").unwrap()]);
        let by_drug = report.sections.influence_by_drug.data().unwrap();
        assert_eq!(by_drug.len(), 1);
        let patterns = report.sections.prescription_patterns.data().unwrap();
        assert_eq!(patterns.len(), 1);
        assert!(patterns.iter().all(|p| p.prescribers > 0));
    }

    #[test]
    fn complete_inputs_compute_every_section() {
        let (roster, payments, prescriptions) = scenario_one();
        let inputs = Inputs {
            roster: Ok(roster),
            payments: Ok(payments),
            prescriptions: Ok(prescriptions),
        };
        let report = report_for(&inputs);
        assert!(report.degraded_sources().is_empty());
        assert_eq!(report.drugs.len(), 1);
        let by_drug = report.sections.influence_by_drug.data().unwrap();
        assert_eq!(by_drug[0].metrics.influence_factor, Some(3.23));
        assert!(by_drug[0].metrics.sample_size_flag);
        match &report.sections.influence_by_drug {
            Section::Computed { notes, .. } => assert_eq!(notes.len(), 1),
            other => panic!("expected computed, got {other:?}"),
        }
        assert_eq!(report.reconciliation.providers_joined, 15);
        assert_eq!(report.reconciliation.discard_count, 0);
        assert_eq!(
            report.reconciliation.sources[&SourceKind::Payments],
            SourceStatus::Loaded { rows: 10 }
        );
    }

    #[test]
    fn missing_roster_blocks_everything() {
        let (_, payments, prescriptions) = scenario_one();
        let inputs = Inputs {
            roster: Err(PipelineError::unavailable(
                SourceKind::Roster,
                UnavailableReason::Missing("roster.csv".to_string()),
            )),
            payments: Ok(payments),
            prescriptions: Ok(prescriptions),
        };
        let report = report_for(&inputs);
        assert!(report.sections.roster_mix.data().is_none());
        assert!(report.sections.prescription_patterns.data().is_none());
        // Every payment row is accounted for as unmatched.
        assert_eq!(report.reconciliation.tally.payments.unmatched_npi, 10);
    }

    fn write(dir: &Path, name: &str, contents: &str) -> SourceLocator {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        SourceLocator::File(path)
    }

    #[tokio::test]
    async fn pipeline_runs_over_csv_sources() {
        let dir = tempfile::tempdir().unwrap();
        let roster = write(
            dir.path(),
            "roster.csv",
            "NPI,name,specialty,provider_type\n\
             1234567893,Dr. A,Rheumatology,MD\n\
             1111111112,Dr. B,Rheumatology,NP\n\
             123456789,Dr. Short,Rheumatology,MD\n",
        );
        let payments = write(
            dir.path(),
            "payments.csv",
            "covered_recipient_npi,total_amount_of_payment_usdollars,date_of_payment,name_of_drug_or_biological_or_device_or_medical_supply_1\n\
             1234567893,250.00,2022-05-01,Humira\n",
        );
        let prescriptions = write(dir.path(), "rx.csv", "");
        let config = RunConfig {
            period: ReportingPeriod::new(
                chrono::NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
                chrono::NaiveDate::from_ymd_opt(2022, 12, 31).unwrap(),
            )
            .unwrap(),
            roster,
            payments,
            prescriptions,
            query_timeout: Duration::from_secs(60),
            analysis: options(),
        };
        let output = run_pipeline(&config).await.unwrap();
        let report = output.report;
        assert_eq!(report.reconciliation.providers_joined, 2);
        assert_eq!(report.reconciliation.tally.roster.discarded(), 1);
        assert_eq!(output.ledger.len(), 1);
        assert!(report.sections.payment_categories.data().is_some());
        assert!(matches!(
            report.sections.prescription_patterns,
            Section::Unavailable { .. }
        ));
        assert_eq!(report.degraded_sources(), vec![SourceKind::Prescriptions]);
    }
}
