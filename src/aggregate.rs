//! Cohort statistics over a joined [`Snapshot`].
//!
//! Every ratio is computed from a [`PopulationView`]: the prescribers of one
//! drug in one period, optionally narrowed by provider type or specialty. The
//! paid stratum and the unpaid baseline are both cut from that one view, and
//! [`influence_factor`] refuses stats that come from different populations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::cohort::{
    CohortKey, CohortSpec, GroupBy, PaymentAttribution, PaymentTier, Population, Restriction,
    Stratum,
};
use crate::common::{dollars, pct, round_cents, round_to};
use crate::constants::{UNKNOWN_SPECIALTY, UNSPECIFIED_CATEGORY};
use crate::error::{PipelineError, Result};
use crate::join::{AttributionRule, Exposure, ProviderProfile, Snapshot};
use crate::model::{DrugKey, Provider, ProviderType, ReportingPeriod};
use crate::npi::Npi;

const TIER_POINTS: f64 = 40.0;
const PERSISTENCE_POINTS: f64 = 30.0;
const VOLUME_POINTS: f64 = 30.0;
const PERSISTENCE_CAP_YEARS: u32 = 5;
const VOLUME_CAP_RATIO: f64 = 10.0;

pub fn specialty_label(provider: &Provider) -> &str {
    provider
        .specialty
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SPECIALTY)
}

fn admits(restriction: &Restriction, provider: &Provider) -> bool {
    match restriction {
        Restriction::None => true,
        Restriction::ProviderType(t) => provider.provider_type == *t,
        Restriction::Specialty(s) => specialty_label(provider) == s,
    }
}

fn in_stratum(stratum: Stratum, exposure: &Exposure) -> bool {
    if !exposure.is_paid() {
        return false;
    }
    match stratum {
        Stratum::Paid => true,
        Stratum::Tier(tier) => PaymentTier::from_cents(exposure.amount_cents) == tier,
        Stratum::ConsecutiveYears(n) => exposure.longest_year_run() == n,
    }
}

struct Member<'a> {
    profile: &'a ProviderProfile,
    rx_cents: i64,
    exposure: Exposure,
}

/// Prescribers of one drug in one period, with their attributed payments.
pub struct PopulationView<'a> {
    period: ReportingPeriod,
    population: Population,
    members: Vec<Member<'a>>,
}

impl<'a> PopulationView<'a> {
    pub fn build(snapshot: &'a Snapshot, population: &Population, rule: &AttributionRule) -> Self {
        let members = snapshot
            .providers
            .values()
            .filter(|profile| admits(&population.restriction, &profile.provider))
            .filter_map(|profile| {
                let rx = profile.prescribed(&population.drug)?;
                Some(Member {
                    profile,
                    rx_cents: rx.cost_cents,
                    exposure: profile.exposure(rule),
                })
            })
            .collect();
        Self {
            period: snapshot.period,
            population: population.clone(),
            members,
        }
    }

    fn stats(&self, keep: impl Fn(&Member<'a>) -> bool) -> CohortStats {
        let mut stats = CohortStats {
            period: self.period,
            population: self.population.clone(),
            providers: 0,
            rx_cents: 0,
            payment_cents: 0,
        };
        for member in self.members.iter().filter(|m| keep(*m)) {
            stats.providers += 1;
            stats.rx_cents += member.rx_cents;
            stats.payment_cents += member.exposure.amount_cents;
        }
        stats
    }

    pub fn stratum(&self, stratum: Stratum) -> CohortStats {
        self.stats(|m| in_stratum(stratum, &m.exposure))
    }

    /// Same population, zero attributed payments.
    pub fn baseline(&self) -> CohortStats {
        self.stats(|m| !m.exposure.is_paid())
    }

    fn provider_types(&self) -> BTreeSet<ProviderType> {
        self.members
            .iter()
            .map(|m| m.profile.provider.provider_type)
            .collect()
    }

    fn specialties(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .map(|m| specialty_label(&m.profile.provider).to_string())
            .collect()
    }

    fn tiers(&self) -> BTreeSet<PaymentTier> {
        self.members
            .iter()
            .filter(|m| m.exposure.is_paid())
            .map(|m| PaymentTier::from_cents(m.exposure.amount_cents))
            .collect()
    }

    fn year_runs(&self) -> BTreeSet<u32> {
        self.members
            .iter()
            .filter(|m| m.exposure.is_paid())
            .map(|m| m.exposure.longest_year_run())
            .filter(|n| *n > 0)
            .collect()
    }
}

/// Sums for one side of a ratio, tagged with the population they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortStats {
    pub period: ReportingPeriod,
    pub population: Population,
    pub providers: usize,
    pub rx_cents: i64,
    pub payment_cents: i64,
}

impl CohortStats {
    pub fn mean_rx(&self) -> Option<f64> {
        (self.providers > 0).then(|| dollars(self.rx_cents) / self.providers as f64)
    }

    pub fn mean_payment(&self) -> Option<f64> {
        (self.providers > 0).then(|| dollars(self.payment_cents) / self.providers as f64)
    }
}

fn ensure_same_population(numerator: &CohortStats, denominator: &CohortStats) -> Result<()> {
    if numerator.population == denominator.population && numerator.period == denominator.period {
        Ok(())
    } else {
        Err(PipelineError::CohortMismatch {
            numerator: format!("{} ({})", numerator.population, numerator.period),
            denominator: format!("{} ({})", denominator.population, denominator.period),
        })
    }
}

/// `mean_rx(paid) / mean_rx(unpaid)`, undefined when either side is empty or the baseline is zero.
pub fn influence_factor(paid: &CohortStats, unpaid: &CohortStats) -> Result<Option<f64>> {
    ensure_same_population(paid, unpaid)?;
    Ok(match (paid.mean_rx(), unpaid.mean_rx()) {
        (Some(p), Some(u)) if u > 0.0 => Some(p / u),
        _ => None,
    })
}

/// Incremental mean prescription value per mean payment dollar.
pub fn roi_factor(paid: &CohortStats, unpaid: &CohortStats) -> Result<Option<f64>> {
    ensure_same_population(paid, unpaid)?;
    Ok(
        match (paid.mean_rx(), unpaid.mean_rx(), paid.mean_payment()) {
            (Some(p), Some(u), Some(pay)) if pay > 0.0 => Some((p - u) / pay),
            _ => None,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMetrics {
    pub provider_count: usize,
    pub paid_count: usize,
    pub unpaid_count: usize,
    pub avg_rx_paid: Option<f64>,
    pub avg_rx_unpaid: Option<f64>,
    pub total_rx_paid: f64,
    pub total_rx_unpaid: f64,
    pub total_payments: f64,
    pub avg_payment: Option<f64>,
    pub payment_share_pct: Option<f64>,
    pub influence_factor: Option<f64>,
    pub roi_factor: Option<f64>,
    pub sample_size_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRecord {
    #[serde(flatten)]
    pub key: CohortKey,
    #[serde(flatten)]
    pub metrics: CohortMetrics,
}

fn record_for(
    view: &PopulationView<'_>,
    spec: &CohortSpec,
    period_payment_cents: i64,
    min_sample_size: usize,
) -> Result<CohortRecord> {
    if spec.period != view.period || spec.population != view.population {
        return Err(PipelineError::CohortMismatch {
            numerator: spec.to_string(),
            denominator: format!("{} ({})", view.population, view.period),
        });
    }
    let paid = view.stratum(spec.stratum);
    let unpaid = view.baseline();
    let influence = influence_factor(&paid, &unpaid)?;
    let roi = roi_factor(&paid, &unpaid)?;

    let provider_count = paid.providers + unpaid.providers;
    let sample_size_flag = provider_count < min_sample_size
        || paid.providers < min_sample_size
        || unpaid.providers < min_sample_size;

    Ok(CohortRecord {
        key: spec.key(),
        metrics: CohortMetrics {
            provider_count,
            paid_count: paid.providers,
            unpaid_count: unpaid.providers,
            avg_rx_paid: paid.mean_rx().map(round_cents),
            avg_rx_unpaid: unpaid.mean_rx().map(round_cents),
            total_rx_paid: dollars(paid.rx_cents),
            total_rx_unpaid: dollars(unpaid.rx_cents),
            total_payments: dollars(paid.payment_cents),
            avg_payment: paid.mean_payment().map(round_cents),
            payment_share_pct: pct(paid.payment_cents as f64, period_payment_cents as f64),
            influence_factor: influence.map(|v| round_to(v, 2)),
            roi_factor: roi.map(|v| round_to(v, 2)),
            sample_size_flag,
        },
    })
}

/// Metrics for one cohort of `snapshot`.
pub fn measure(
    snapshot: &Snapshot,
    spec: &CohortSpec,
    min_sample_size: usize,
) -> Result<CohortRecord> {
    if spec.period != snapshot.period {
        return Err(PipelineError::CohortMismatch {
            numerator: spec.to_string(),
            denominator: format!("snapshot ({})", snapshot.period),
        });
    }
    let rule = snapshot.attribution_rule(&spec.population.drug, spec.attribution);
    let view = PopulationView::build(snapshot, &spec.population, &rule);
    record_for(
        &view,
        spec,
        snapshot.total_payment_cents(),
        min_sample_size,
    )
}

#[derive(Debug, Clone)]
pub struct GroupingSpec {
    pub group_by: GroupBy,
    pub drugs: Vec<DrugKey>,
    pub attribution: PaymentAttribution,
    pub min_sample_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupOutcome {
    pub records: Vec<CohortRecord>,
    /// Low-sample annotations, one per flagged cohort.
    pub notes: Vec<String>,
}

fn cohort_specs(
    view: &PopulationView<'_>,
    drug: &DrugKey,
    grouping: &GroupingSpec,
) -> Vec<CohortSpec> {
    let spec = |population: Population, stratum: Stratum| {
        CohortSpec::new(view.period, population, stratum, grouping.attribution)
    };
    match grouping.group_by {
        GroupBy::Drug => vec![spec(Population::prescribers_of(drug.clone()), Stratum::Paid)],
        GroupBy::ProviderType => view
            .provider_types()
            .into_iter()
            .map(|t| spec(Population::with_provider_type(drug.clone(), t), Stratum::Paid))
            .collect(),
        GroupBy::Specialty => view
            .specialties()
            .into_iter()
            .map(|s| spec(Population::with_specialty(drug.clone(), s), Stratum::Paid))
            .collect(),
        GroupBy::PaymentTier => view
            .tiers()
            .into_iter()
            .map(|t| spec(Population::prescribers_of(drug.clone()), Stratum::Tier(t)))
            .collect(),
        GroupBy::ConsecutiveYears => view
            .year_runs()
            .into_iter()
            .map(|n| {
                spec(
                    Population::prescribers_of(drug.clone()),
                    Stratum::ConsecutiveYears(n),
                )
            })
            .collect(),
    }
}

fn low_sample_note(spec: &CohortSpec, metrics: &CohortMetrics, minimum: usize) -> String {
    let count = metrics
        .provider_count
        .min(metrics.paid_count)
        .min(metrics.unpaid_count);
    PipelineError::InsufficientSample {
        cohort: spec.to_string(),
        count,
        minimum,
    }
    .to_string()
}

/// Cohort records for every selected drug, one drug partition at a time.
pub fn aggregate(snapshot: &Snapshot, grouping: &GroupingSpec) -> Result<GroupOutcome> {
    let period_payment_cents = snapshot.total_payment_cents();
    let mut outcome = GroupOutcome::default();
    for drug in &grouping.drugs {
        let rule = snapshot.attribution_rule(drug, grouping.attribution);
        let everyone = PopulationView::build(snapshot, &Population::prescribers_of(drug.clone()), &rule);
        for spec in cohort_specs(&everyone, drug, grouping) {
            let record = if spec.population == everyone.population {
                record_for(&everyone, &spec, period_payment_cents, grouping.min_sample_size)?
            } else {
                let view = PopulationView::build(snapshot, &spec.population, &rule);
                record_for(&view, &spec, period_payment_cents, grouping.min_sample_size)?
            };
            if record.metrics.sample_size_flag {
                let note = low_sample_note(&spec, &record.metrics, grouping.min_sample_size);
                tracing::warn!("{note}");
                outcome.notes.push(note);
            }
            outcome.records.push(record);
        }
    }
    Ok(outcome)
}

/// Drugs chosen for analysis, plus requested names with no joined prescriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrugSelection {
    pub drugs: Vec<DrugKey>,
    pub unmatched: Vec<DrugKey>,
}

/// Drugs to analyse. An explicit name resolves to every prescribed brand it
/// names directly or as the generic; names nobody prescribed are reported as
/// unmatched rather than measured. Without a list, every prescribed drug is
/// ranked by total prescription cost, optionally cut to `top_n`.
pub fn select_drugs(snapshot: &Snapshot, explicit: &[String], top_n: Option<usize>) -> DrugSelection {
    if !explicit.is_empty() {
        let mut selection = DrugSelection::default();
        let mut seen = BTreeSet::new();
        for name in explicit.iter().filter_map(|raw| DrugKey::normalize(raw)) {
            let matched: Vec<&DrugKey> = snapshot
                .drugs
                .iter()
                .filter(|(brand, info)| **brand == name || info.generic.as_ref() == Some(&name))
                .map(|(brand, _)| brand)
                .collect();
            if matched.is_empty() {
                if !selection.unmatched.contains(&name) {
                    tracing::warn!("drug {name}: no joined prescriptions, skipped");
                    selection.unmatched.push(name);
                }
                continue;
            }
            for brand in matched {
                if seen.insert(brand.clone()) {
                    selection.drugs.push(brand.clone());
                }
            }
        }
        return selection;
    }
    let mut cost_by_drug: BTreeMap<&DrugKey, i64> = BTreeMap::new();
    for profile in snapshot.providers.values() {
        for (drug, totals) in &profile.prescriptions {
            *cost_by_drug.entry(drug).or_insert(0) += totals.cost_cents;
        }
    }
    let mut ranked: Vec<(&DrugKey, i64)> = cost_by_drug.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let limit = top_n.unwrap_or(ranked.len());
    DrugSelection {
        drugs: ranked
            .into_iter()
            .take(limit)
            .map(|(drug, _)| drug.clone())
            .collect(),
        unmatched: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRisk {
    pub npi: Npi,
    pub name: Option<String>,
    pub specialty: String,
    pub provider_type: ProviderType,
    pub drug: DrugKey,
    pub payment_tier: PaymentTier,
    pub total_payments: f64,
    pub consecutive_years: u32,
    pub rx_cost: f64,
    pub rx_ratio: Option<f64>,
    pub risk_score: f64,
}

fn risk_score(tier: PaymentTier, years: u32, rx_ratio: Option<f64>) -> f64 {
    let persistence = f64::from(years.min(PERSISTENCE_CAP_YEARS)) / f64::from(PERSISTENCE_CAP_YEARS);
    let volume = rx_ratio.map_or(0.0, |r| r.min(VOLUME_CAP_RATIO) / VOLUME_CAP_RATIO);
    TIER_POINTS * tier.weight() + PERSISTENCE_POINTS * persistence + VOLUME_POINTS * volume
}

/// Highest-scoring paid prescribers across `drugs`, ties broken by NPI then drug.
pub fn risk_scores(
    snapshot: &Snapshot,
    drugs: &[DrugKey],
    attribution: PaymentAttribution,
    top_n: usize,
) -> Vec<ProviderRisk> {
    let mut scored = Vec::new();
    for drug in drugs {
        let rule = snapshot.attribution_rule(drug, attribution);
        let view = PopulationView::build(snapshot, &Population::prescribers_of(drug.clone()), &rule);
        let baseline_mean = view.baseline().mean_rx().filter(|m| *m > 0.0);
        for member in view.members.iter().filter(|m| m.exposure.is_paid()) {
            let tier = PaymentTier::from_cents(member.exposure.amount_cents);
            let years = member.exposure.longest_year_run();
            let rx_cost = dollars(member.rx_cents);
            let rx_ratio = baseline_mean.map(|b| rx_cost / b);
            let provider = &member.profile.provider;
            scored.push(ProviderRisk {
                npi: provider.npi.clone(),
                name: provider.name.clone(),
                specialty: specialty_label(provider).to_string(),
                provider_type: provider.provider_type,
                drug: drug.clone(),
                payment_tier: tier,
                total_payments: dollars(member.exposure.amount_cents),
                consecutive_years: years,
                rx_cost,
                rx_ratio: rx_ratio.map(|r| round_to(r, 2)),
                risk_score: round_to(risk_score(tier, years, rx_ratio), 2),
            });
        }
    }
    scored.sort_by(|a, b| {
        b.risk_score
            .total_cmp(&a.risk_score)
            .then_with(|| a.npi.cmp(&b.npi))
            .then_with(|| a.drug.cmp(&b.drug))
    });
    scored.truncate(top_n);
    scored
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTypeCount {
    pub provider_type: ProviderType,
    pub providers: usize,
    pub share_pct: Option<f64>,
}

pub fn roster_mix(snapshot: &Snapshot) -> Vec<ProviderTypeCount> {
    let mut counts: BTreeMap<ProviderType, usize> = BTreeMap::new();
    for profile in snapshot.providers.values() {
        *counts.entry(profile.provider.provider_type).or_insert(0) += 1;
    }
    let total = snapshot.providers.len();
    counts
        .into_iter()
        .map(|(provider_type, providers)| ProviderTypeCount {
            provider_type,
            providers,
            share_pct: pct(providers as f64, total as f64),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCategory {
    pub category: String,
    pub payment_count: usize,
    pub providers: usize,
    pub total_payments: f64,
    pub avg_payment: f64,
    pub share_pct: Option<f64>,
}

/// Joined payments grouped by nature-of-payment category, largest total first.
pub fn payment_categories(snapshot: &Snapshot) -> Vec<PaymentCategory> {
    #[derive(Default)]
    struct Acc<'a> {
        count: usize,
        cents: i64,
        providers: BTreeSet<&'a Npi>,
    }
    let mut by_category: BTreeMap<&str, Acc<'_>> = BTreeMap::new();
    for (npi, profile) in &snapshot.providers {
        for payment in &profile.payments {
            let category = payment
                .nature
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(UNSPECIFIED_CATEGORY);
            let acc = by_category.entry(category).or_default();
            acc.count += 1;
            acc.cents += payment.amount_cents;
            acc.providers.insert(npi);
        }
    }
    let total = snapshot.total_payment_cents();
    let mut rows: Vec<PaymentCategory> = by_category
        .into_iter()
        .map(|(category, acc)| PaymentCategory {
            category: category.to_string(),
            payment_count: acc.count,
            providers: acc.providers.len(),
            total_payments: dollars(acc.cents),
            avg_payment: round_cents(dollars(acc.cents) / acc.count as f64),
            share_pct: pct(acc.cents as f64, total as f64),
        })
        .collect();
    rows.sort_by(|a, b| {
        b.total_payments
            .total_cmp(&a.total_payments)
            .then_with(|| a.category.cmp(&b.category))
    });
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionPattern {
    pub drug: DrugKey,
    pub generic_name: Option<DrugKey>,
    pub prescribers: usize,
    pub claims: f64,
    pub total_cost: f64,
    pub days_supply: f64,
    pub avg_cost_per_prescriber: Option<f64>,
}

pub fn prescription_patterns(snapshot: &Snapshot, drugs: &[DrugKey]) -> Vec<PrescriptionPattern> {
    drugs
        .iter()
        .map(|drug| {
            let mut pattern = PrescriptionPattern {
                drug: drug.clone(),
                generic_name: snapshot.drugs.get(drug).and_then(|d| d.generic.clone()),
                prescribers: 0,
                claims: 0.0,
                total_cost: 0.0,
                days_supply: 0.0,
                avg_cost_per_prescriber: None,
            };
            let mut cost_cents = 0i64;
            for totals in snapshot.providers.values().filter_map(|p| p.prescribed(drug)) {
                pattern.prescribers += 1;
                pattern.claims += totals.claims;
                pattern.days_supply += totals.days_supply;
                cost_cents += totals.cost_cents;
            }
            pattern.total_cost = dollars(cost_cents);
            pattern.avg_cost_per_prescriber = (pattern.prescribers > 0)
                .then(|| round_cents(dollars(cost_cents) / pattern.prescribers as f64));
            pattern
        })
        .collect()
}
