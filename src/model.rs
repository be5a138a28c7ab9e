use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};
use crate::npi::Npi;

/// Which input table a record, tally or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Roster,
    Payments,
    Prescriptions,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Roster => "roster",
            Self::Payments => "payments",
            Self::Prescriptions => "prescriptions",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive calendar window every record and aggregate of a run is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(PipelineError::InvalidPeriod(format!(
                "end {end} is before start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn first_year(&self) -> i32 {
        self.start.year()
    }

    pub fn last_year(&self) -> i32 {
        self.end.year()
    }

    /// `YYYYMM` bounds used to filter monthly claim rows.
    pub fn month_bounds(&self) -> (i64, i64) {
        (
            i64::from(self.start.year()) * 100 + i64::from(self.start.month()),
            i64::from(self.end.year()) * 100 + i64::from(self.end.month()),
        )
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    Physician,
    #[serde(rename = "NP")]
    NursePractitioner,
    #[serde(rename = "PA")]
    PhysicianAssistant,
    Other,
    Unknown,
}

impl ProviderType {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unknown;
        };
        let norm = raw.trim().to_ascii_lowercase().replace('.', "");
        match norm.as_str() {
            "" => Self::Unknown,
            "physician" | "md" | "do" | "mbbs" | "doctor" => Self::Physician,
            "np" | "nurse practitioner" | "aprn" | "fnp" | "crnp" | "np-c" => {
                Self::NursePractitioner
            }
            "pa" | "pa-c" | "physician assistant" | "physician associate" => {
                Self::PhysicianAssistant
            }
            _ if norm.contains("nurse practitioner") => Self::NursePractitioner,
            _ if norm.contains("physician assistant") => Self::PhysicianAssistant,
            _ if norm.contains("physician") => Self::Physician,
            _ => Self::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Physician => "Physician",
            Self::NursePractitioner => "NP",
            Self::PhysicianAssistant => "PA",
            Self::Other => "Other",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Normalized drug name: trimmed, inner whitespace collapsed, upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrugKey(String);

impl DrugKey {
    pub fn normalize(raw: &str) -> Option<Self> {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            None
        } else {
            Some(Self(collapsed.to_uppercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DrugKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub npi: Npi,
    pub name: Option<String>,
    pub specialty: Option<String>,
    pub provider_type: ProviderType,
}

/// One roster row as read; the NPI is validated by the joiner.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub npi: String,
    pub name: Option<String>,
    pub specialty: Option<String>,
    pub provider_type: ProviderType,
}

/// One Open Payments row inside the reporting period.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub record_id: Option<String>,
    pub recipient_npi: String,
    pub manufacturer_id: Option<String>,
    pub manufacturer: Option<String>,
    pub amount: Option<f64>,
    pub nature: Option<String>,
    pub program_year: Option<i32>,
    pub drug: Option<String>,
}

/// One Part D claim row inside the reporting period.
#[derive(Debug, Clone, PartialEq)]
pub struct PrescriptionRecord {
    pub prescriber_npi: String,
    pub brand_name: Option<String>,
    pub generic_name: Option<String>,
    pub claim_count: Option<f64>,
    pub total_cost: Option<f64>,
    pub days_supply: Option<f64>,
    pub claim_year: Option<i32>,
    pub claim_month: Option<u32>,
}
