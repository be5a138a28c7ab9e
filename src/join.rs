use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cohort::PaymentAttribution;
use crate::common::cents_from_dollars;
use crate::error::PipelineError;
use crate::model::{
    DrugKey, PaymentRecord, PrescriptionRecord, Provider, ReportingPeriod, RosterEntry,
    SourceKind,
};
use crate::npi::{Npi, NpiCheck, NpiDefect, classify_npi};

#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Treat NPIs that fail the check digit as malformed instead of warning.
    pub strict_npi_checksum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiscardReason {
    MalformedNpi(NpiDefect),
    UnmatchedNpi,
    DuplicateNpi,
    InvalidValue,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedNpi(defect) => write!(f, "malformed_npi:{defect}"),
            Self::UnmatchedNpi => f.write_str("unmatched_npi"),
            Self::DuplicateNpi => f.write_str("duplicate_npi"),
            Self::InvalidValue => f.write_str("invalid_value"),
        }
    }
}

/// One excluded input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardEntry {
    pub source_kind: SourceKind,
    pub identifier: String,
    pub record_id: Option<String>,
    pub reason: DiscardReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTally {
    pub rows_read: usize,
    pub joined: usize,
    pub malformed_npi: BTreeMap<NpiDefect, usize>,
    pub unmatched_npi: usize,
    pub duplicate_npi: usize,
    pub invalid_value: usize,
    /// Kept rows whose NPI failed the check digit (only counted when not strict).
    pub checksum_warnings: usize,
}

impl SourceTally {
    pub fn malformed(&self) -> usize {
        self.malformed_npi.values().sum()
    }

    pub fn discarded(&self) -> usize {
        self.malformed() + self.unmatched_npi + self.duplicate_npi + self.invalid_value
    }
}

/// Reconciliation counts: for every source, `rows_read == joined + discarded`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardTally {
    pub roster: SourceTally,
    pub payments: SourceTally,
    pub prescriptions: SourceTally,
}

impl DiscardTally {
    pub fn source(&self, source_kind: SourceKind) -> &SourceTally {
        match source_kind {
            SourceKind::Roster => &self.roster,
            SourceKind::Payments => &self.payments,
            SourceKind::Prescriptions => &self.prescriptions,
        }
    }

    fn source_mut(&mut self, source_kind: SourceKind) -> &mut SourceTally {
        match source_kind {
            SourceKind::Roster => &mut self.roster,
            SourceKind::Payments => &mut self.payments,
            SourceKind::Prescriptions => &mut self.prescriptions,
        }
    }

    pub fn discard_count(&self) -> usize {
        self.roster.discarded() + self.payments.discarded() + self.prescriptions.discarded()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedPayment {
    pub drug: Option<DrugKey>,
    pub manufacturer: Option<String>,
    pub amount_cents: i64,
    pub year: Option<i32>,
    pub nature: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RxTotals {
    pub rows: usize,
    pub claims: f64,
    pub cost_cents: i64,
    pub days_supply: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub payments: Vec<JoinedPayment>,
    pub prescriptions: BTreeMap<DrugKey, RxTotals>,
}

impl ProviderProfile {
    pub fn prescribed(&self, drug: &DrugKey) -> Option<&RxTotals> {
        self.prescriptions.get(drug)
    }

    pub fn exposure(&self, rule: &AttributionRule) -> Exposure {
        let mut exposure = Exposure::default();
        for payment in self.payments.iter().filter(|p| rule.matches(p)) {
            exposure.payment_count += 1;
            exposure.amount_cents += payment.amount_cents;
            if let Some(year) = payment.year {
                exposure.years.insert(year);
            }
        }
        exposure
    }
}

/// Attributed payments of one provider for one drug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exposure {
    pub payment_count: usize,
    pub amount_cents: i64,
    pub years: BTreeSet<i32>,
}

impl Exposure {
    pub fn is_paid(&self) -> bool {
        self.payment_count > 0
    }

    /// Longest run of consecutive program years with at least one attributed payment.
    pub fn longest_year_run(&self) -> u32 {
        let mut best = 0u32;
        let mut run = 0u32;
        let mut prev: Option<i32> = None;
        for year in &self.years {
            run = match prev {
                Some(p) if *year == p + 1 => run + 1,
                _ => 1,
            };
            best = best.max(run);
            prev = Some(*year);
        }
        best
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrugInfo {
    pub generic: Option<DrugKey>,
}

/// Decides whether a joined payment counts toward a drug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionRule {
    drug: DrugKey,
    generic: Option<DrugKey>,
    manufacturers: BTreeSet<String>,
}

impl AttributionRule {
    fn tagged(&self, payment: &JoinedPayment) -> bool {
        match &payment.drug {
            Some(tag) => *tag == self.drug || Some(tag) == self.generic.as_ref(),
            None => false,
        }
    }

    pub fn matches(&self, payment: &JoinedPayment) -> bool {
        self.tagged(payment)
            || payment
                .manufacturer
                .as_ref()
                .is_some_and(|m| self.manufacturers.contains(m))
    }
}

/// Immutable, provider-indexed view of one run's inputs.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub period: ReportingPeriod,
    pub providers: BTreeMap<Npi, ProviderProfile>,
    pub drugs: BTreeMap<DrugKey, DrugInfo>,
    pub tally: DiscardTally,
    pub ledger: Vec<DiscardEntry>,
}

impl Snapshot {
    pub fn attribution_rule(&self, drug: &DrugKey, attribution: PaymentAttribution) -> AttributionRule {
        let generic = self.drugs.get(drug).and_then(|info| info.generic.clone());
        let mut rule = AttributionRule {
            drug: drug.clone(),
            generic,
            manufacturers: BTreeSet::new(),
        };
        if attribution == PaymentAttribution::DrugOrManufacturer {
            let manufacturers: BTreeSet<String> = self
                .providers
                .values()
                .flat_map(|p| p.payments.iter())
                .filter(|p| rule.tagged(p))
                .filter_map(|p| p.manufacturer.clone())
                .collect();
            rule.manufacturers = manufacturers;
        }
        rule
    }

    /// Sum of every joined payment in the period; the base for payment shares.
    pub fn total_payment_cents(&self) -> i64 {
        self.providers
            .values()
            .flat_map(|p| p.payments.iter())
            .map(|p| p.amount_cents)
            .sum()
    }
}

/// The identifying parts of one input row.
#[derive(Clone, Copy)]
struct Row<'r> {
    source_kind: SourceKind,
    raw_npi: &'r str,
    record_id: Option<&'r str>,
}

struct Joiner<'a> {
    options: &'a JoinOptions,
    tally: DiscardTally,
    ledger: Vec<DiscardEntry>,
}

impl Joiner<'_> {
    fn discard(&mut self, row: Row<'_>, reason: DiscardReason, detail: String) {
        let tally = self.tally.source_mut(row.source_kind);
        match reason {
            DiscardReason::MalformedNpi(defect) => {
                *tally.malformed_npi.entry(defect).or_insert(0) += 1;
            }
            DiscardReason::UnmatchedNpi => tally.unmatched_npi += 1,
            DiscardReason::DuplicateNpi => tally.duplicate_npi += 1,
            DiscardReason::InvalidValue => tally.invalid_value += 1,
        }
        self.ledger.push(DiscardEntry {
            source_kind: row.source_kind,
            identifier: row.raw_npi.to_string(),
            record_id: row.record_id.map(str::to_string),
            reason,
            detail,
        });
    }

    fn validate(&mut self, row: Row<'_>) -> Option<Npi> {
        let defect = match classify_npi(row.raw_npi) {
            NpiCheck::Valid(npi) => return Some(npi),
            NpiCheck::ChecksumInvalid(npi) if !self.options.strict_npi_checksum => {
                self.tally.source_mut(row.source_kind).checksum_warnings += 1;
                return Some(npi);
            }
            NpiCheck::ChecksumInvalid(_) => NpiDefect::ChecksumInvalid,
            NpiCheck::Malformed(defect) => defect,
        };
        let detail = PipelineError::JoinKeyMalformed {
            source_kind: row.source_kind,
            raw: row.raw_npi.to_string(),
            defect,
        }
        .to_string();
        self.discard(row, DiscardReason::MalformedNpi(defect), detail);
        None
    }

    /// Validated NPI that is on the roster, or `None` after recording the discard.
    fn roster_match(
        &mut self,
        row: Row<'_>,
        providers: &BTreeMap<Npi, ProviderProfile>,
    ) -> Option<Npi> {
        let npi = self.validate(row)?;
        if providers.contains_key(&npi) {
            Some(npi)
        } else {
            self.discard(
                row,
                DiscardReason::UnmatchedNpi,
                format!("NPI {npi} is not on the provider roster"),
            );
            None
        }
    }
}

fn drug_of(record: &PrescriptionRecord) -> Option<(DrugKey, Option<DrugKey>)> {
    let generic = record.generic_name.as_deref().and_then(DrugKey::normalize);
    let brand = record.brand_name.as_deref().and_then(DrugKey::normalize);
    match brand {
        Some(brand) => Some((brand, generic)),
        None => generic.map(|g| (g, None)),
    }
}

/// Links payments and prescriptions to roster providers by NPI.
///
fn normalize_name(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then(|| collapsed.to_uppercase())
}

/// Manufacturer identity shared by rows that carry a name, an id, or both.
struct ManufacturerIds {
    names_by_id: BTreeMap<String, String>,
}

impl ManufacturerIds {
    fn learn(payments: &[PaymentRecord]) -> Self {
        let mut names_by_id = BTreeMap::new();
        for record in payments {
            let id = record.manufacturer_id.as_deref().and_then(normalize_name);
            let name = record.manufacturer.as_deref().and_then(normalize_name);
            if let (Some(id), Some(name)) = (id, name) {
                names_by_id.entry(id).or_insert(name);
            }
        }
        Self { names_by_id }
    }

    fn identify(&self, record: &PaymentRecord) -> Option<String> {
        if let Some(name) = record.manufacturer.as_deref().and_then(normalize_name) {
            return Some(name);
        }
        let id = record.manufacturer_id.as_deref().and_then(normalize_name)?;
        Some(
            self.names_by_id
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("ID:{id}")),
        )
    }
}

/// Every excluded row is counted in the returned tally and listed in the
/// ledger; nothing is dropped silently.
pub fn join(
    period: ReportingPeriod,
    roster: &[RosterEntry],
    payments: &[PaymentRecord],
    prescriptions: &[PrescriptionRecord],
    options: &JoinOptions,
) -> Snapshot {
    let mut joiner = Joiner {
        options,
        tally: DiscardTally::default(),
        ledger: Vec::new(),
    };
    let mut providers: BTreeMap<Npi, ProviderProfile> = BTreeMap::new();
    let mut drugs: BTreeMap<DrugKey, DrugInfo> = BTreeMap::new();

    joiner.tally.roster.rows_read = roster.len();
    for entry in roster {
        let row = Row {
            source_kind: SourceKind::Roster,
            raw_npi: &entry.npi,
            record_id: None,
        };
        let Some(npi) = joiner.validate(row) else {
            continue;
        };
        if providers.contains_key(&npi) {
            joiner.discard(
                row,
                DiscardReason::DuplicateNpi,
                format!("NPI {npi} appears more than once on the roster; first row kept"),
            );
            continue;
        }
        joiner.tally.roster.joined += 1;
        providers.insert(
            npi.clone(),
            ProviderProfile {
                provider: Provider {
                    npi,
                    name: entry.name.clone(),
                    specialty: entry.specialty.clone(),
                    provider_type: entry.provider_type,
                },
                payments: Vec::new(),
                prescriptions: BTreeMap::new(),
            },
        );
    }

    let manufacturers = ManufacturerIds::learn(payments);
    joiner.tally.payments.rows_read = payments.len();
    for record in payments {
        let row = Row {
            source_kind: SourceKind::Payments,
            raw_npi: &record.recipient_npi,
            record_id: record.record_id.as_deref(),
        };
        let Some(npi) = joiner.roster_match(row, &providers) else {
            continue;
        };
        let Some(amount) = record.amount.filter(|a| a.is_finite()) else {
            joiner.discard(
                row,
                DiscardReason::InvalidValue,
                "payment has no usable amount".to_string(),
            );
            continue;
        };
        joiner.tally.payments.joined += 1;
        if let Some(profile) = providers.get_mut(&npi) {
            profile.payments.push(JoinedPayment {
                drug: record.drug.as_deref().and_then(DrugKey::normalize),
                manufacturer: manufacturers.identify(record),
                amount_cents: cents_from_dollars(amount),
                year: record.program_year,
                nature: record.nature.clone(),
            });
        }
    }

    joiner.tally.prescriptions.rows_read = prescriptions.len();
    for record in prescriptions {
        let row = Row {
            source_kind: SourceKind::Prescriptions,
            raw_npi: &record.prescriber_npi,
            record_id: None,
        };
        let Some(npi) = joiner.roster_match(row, &providers) else {
            continue;
        };
        let usable = drug_of(record).zip(record.total_cost.filter(|c| c.is_finite()));
        let Some(((drug, generic), cost)) = usable else {
            joiner.discard(
                row,
                DiscardReason::InvalidValue,
                "prescription row has no drug name or no usable total cost".to_string(),
            );
            continue;
        };
        joiner.tally.prescriptions.joined += 1;
        let info = drugs.entry(drug.clone()).or_default();
        if info.generic.is_none() {
            info.generic = generic;
        }
        if let Some(profile) = providers.get_mut(&npi) {
            let totals = profile.prescriptions.entry(drug).or_default();
            totals.rows += 1;
            totals.claims += record.claim_count.unwrap_or(0.0);
            totals.cost_cents += cents_from_dollars(cost);
            totals.days_supply += record.days_supply.unwrap_or(0.0);
        }
    }

    for source_kind in [
        SourceKind::Roster,
        SourceKind::Payments,
        SourceKind::Prescriptions,
    ] {
        let tally = joiner.tally.source(source_kind);
        if tally.discarded() > 0 {
            tracing::warn!(
                "{source_kind}: excluded {} of {} rows (malformed_npi={} unmatched_npi={} duplicate_npi={} invalid_value={})",
                tally.discarded(),
                tally.rows_read,
                tally.malformed(),
                tally.unmatched_npi,
                tally.duplicate_npi,
                tally.invalid_value
            );
        }
        if tally.checksum_warnings > 0 {
            tracing::warn!(
                "{source_kind}: kept {} rows whose NPI fails the check digit",
                tally.checksum_warnings
            );
        }
    }

    Snapshot {
        period,
        providers,
        drugs,
        tally: joiner.tally,
        ledger: joiner.ledger,
    }
}
