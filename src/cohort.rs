//! Typed cohort definitions.
//!
//! A [`CohortSpec`] names a population (who prescribed the drug, optionally
//! narrowed to a provider type or specialty) and a stratum inside it. The
//! unpaid baseline is derived from the same spec, so a ratio's numerator and
//! denominator always describe one population in one period.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{DrugKey, ProviderType, ReportingPeriod};

/// Which payments count as "paid for drug D".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAttribution {
    /// Payments tagged with the drug's brand or generic name.
    Drug,
    /// Drug-tagged payments plus any payment from a manufacturer that made one.
    DrugOrManufacturer,
}

impl fmt::Display for PaymentAttribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drug => f.write_str("drug"),
            Self::DrugOrManufacturer => f.write_str("drug_or_manufacturer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PaymentTier {
    #[serde(rename = "<$100")]
    Under100,
    #[serde(rename = "$100-$500")]
    From100To500,
    #[serde(rename = "$500-$1K")]
    From500To1K,
    #[serde(rename = "$1K-$5K")]
    From1KTo5K,
    #[serde(rename = "$5K-$10K")]
    From5KTo10K,
    #[serde(rename = "$10K+")]
    Over10K,
}

impl PaymentTier {
    pub const ALL: [PaymentTier; 6] = [
        Self::Under100,
        Self::From100To500,
        Self::From500To1K,
        Self::From1KTo5K,
        Self::From5KTo10K,
        Self::Over10K,
    ];

    pub fn from_cents(cents: i64) -> Self {
        match cents {
            c if c < 10_000 => Self::Under100,
            c if c < 50_000 => Self::From100To500,
            c if c < 100_000 => Self::From500To1K,
            c if c < 500_000 => Self::From1KTo5K,
            c if c < 1_000_000 => Self::From5KTo10K,
            _ => Self::Over10K,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Under100 => "<$100",
            Self::From100To500 => "$100-$500",
            Self::From500To1K => "$500-$1K",
            Self::From1KTo5K => "$1K-$5K",
            Self::From5KTo10K => "$5K-$10K",
            Self::Over10K => "$10K+",
        }
    }

    /// 0.0 for the lowest tier up to 1.0 for the highest.
    pub fn weight(self) -> f64 {
        let idx = Self::ALL.iter().position(|t| *t == self).unwrap_or(0);
        idx as f64 / (Self::ALL.len() - 1) as f64
    }
}

impl fmt::Display for PaymentTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Restriction {
    None,
    ProviderType(ProviderType),
    Specialty(String),
}

/// Providers who prescribed `drug` at least once in the period, narrowed by `restriction`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Population {
    pub drug: DrugKey,
    pub restriction: Restriction,
}

impl Population {
    pub fn prescribers_of(drug: DrugKey) -> Self {
        Self {
            drug,
            restriction: Restriction::None,
        }
    }

    pub fn with_provider_type(drug: DrugKey, provider_type: ProviderType) -> Self {
        Self {
            drug,
            restriction: Restriction::ProviderType(provider_type),
        }
    }

    pub fn with_specialty(drug: DrugKey, specialty: impl Into<String>) -> Self {
        Self {
            drug,
            restriction: Restriction::Specialty(specialty.into()),
        }
    }
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.restriction {
            Restriction::None => write!(f, "{} prescribers", self.drug),
            Restriction::ProviderType(t) => write!(f, "{} prescribers [{t}]", self.drug),
            Restriction::Specialty(s) => write!(f, "{} prescribers [{s}]", self.drug),
        }
    }
}

/// Which paid providers of a population form the numerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stratum {
    Paid,
    Tier(PaymentTier),
    ConsecutiveYears(u32),
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paid => f.write_str("paid"),
            Self::Tier(t) => write!(f, "tier {t}"),
            Self::ConsecutiveYears(n) => write!(f, "{n} consecutive year(s)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortSpec {
    pub period: ReportingPeriod,
    pub population: Population,
    pub stratum: Stratum,
    pub attribution: PaymentAttribution,
}

impl CohortSpec {
    pub fn new(
        period: ReportingPeriod,
        population: Population,
        stratum: Stratum,
        attribution: PaymentAttribution,
    ) -> Self {
        Self {
            period,
            population,
            stratum,
            attribution,
        }
    }

    pub fn key(&self) -> CohortKey {
        let (provider_type, specialty) = match &self.population.restriction {
            Restriction::None => (None, None),
            Restriction::ProviderType(t) => (Some(*t), None),
            Restriction::Specialty(s) => (None, Some(s.clone())),
        };
        let (payment_tier, consecutive_years) = match self.stratum {
            Stratum::Paid => (None, None),
            Stratum::Tier(t) => (Some(t), None),
            Stratum::ConsecutiveYears(n) => (None, Some(n)),
        };
        CohortKey {
            drug: self.population.drug.clone(),
            provider_type,
            specialty,
            payment_tier,
            consecutive_years,
        }
    }
}

impl fmt::Display for CohortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} ({})", self.population, self.stratum, self.period)
    }
}

/// Serialized identity of a cohort record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CohortKey {
    pub drug: DrugKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<ProviderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_tier: Option<PaymentTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_years: Option<u32>,
}

/// The dimension a report section groups cohorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Drug,
    ProviderType,
    Specialty,
    PaymentTier,
    ConsecutiveYears,
}

impl GroupBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drug => "drug",
            Self::ProviderType => "provider_type",
            Self::Specialty => "specialty",
            Self::PaymentTier => "payment_tier",
            Self::ConsecutiveYears => "consecutive_years",
        }
    }
}
