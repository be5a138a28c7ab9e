use std::{fmt, path::PathBuf};
use thiserror::Error;

use crate::model::SourceKind;
use crate::npi::NpiDefect;

/// Why a source produced no usable rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// File, database or table does not exist.
    Missing(String),
    /// The source exists but holds zero rows.
    Empty,
    /// Rows exist, none inside the reporting period.
    NoRowsInPeriod,
    Timeout { secs: u64 },
    QueryFailed(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(what) => write!(f, "{what} not found"),
            Self::Empty => f.write_str("source returned zero rows"),
            Self::NoRowsInPeriod => f.write_str("no rows inside the reporting period"),
            Self::Timeout { secs } => write!(f, "query timed out after {secs}s"),
            Self::QueryFailed(msg) => write!(f, "query failed: {msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{source_kind} data unavailable: {reason}")]
    DataUnavailable {
        source_kind: SourceKind,
        reason: UnavailableReason,
    },

    #[error("{source_kind} schema mismatch on column `{column}`: {detail}")]
    SchemaMismatch {
        source_kind: SourceKind,
        column: String,
        detail: String,
    },

    #[error("malformed NPI `{raw}` in {source_kind}: {defect}")]
    JoinKeyMalformed {
        source_kind: SourceKind,
        raw: String,
        defect: NpiDefect,
    },

    #[error("cohort {cohort} has {count} providers, below the minimum of {minimum}")]
    InsufficientSample {
        cohort: String,
        count: usize,
        minimum: usize,
    },

    #[error("failed writing {}: {source}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cohort mismatch: numerator population {numerator} does not match denominator population {denominator}")]
    CohortMismatch {
        numerator: String,
        denominator: String,
    },

    #[error("invalid reporting period: {0}")]
    InvalidPeriod(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn unavailable(source_kind: SourceKind, reason: UnavailableReason) -> Self {
        Self::DataUnavailable {
            source_kind,
            reason,
        }
    }

    pub fn write_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Stable snake_case name used in the JSON artifact.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataUnavailable { .. } => "data_unavailable",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::JoinKeyMalformed { .. } => "join_key_malformed",
            Self::InsufficientSample { .. } => "insufficient_sample",
            Self::WriteFailure { .. } => "write_failure",
            Self::CohortMismatch { .. } => "cohort_mismatch",
            Self::InvalidPeriod(_) => "invalid_period",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DataUnavailable { .. } | Self::SchemaMismatch { .. } => 2,
            Self::WriteFailure { .. } => 3,
            Self::CohortMismatch { .. } => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_unavailable_names_source_and_reason() {
        let err = PipelineError::unavailable(SourceKind::Prescriptions, UnavailableReason::Empty);
        assert_eq!(
            err.to_string(),
            "prescriptions data unavailable: source returned zero rows"
        );
        assert_eq!(err.kind(), "data_unavailable");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn write_failure_reports_attempted_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = PipelineError::write_failure("/out/report.json", io_err);
        let msg = err.to_string();
        assert!(msg.contains("/out/report.json"));
        assert!(msg.contains("read-only"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn timeout_reason_is_readable() {
        let reason = UnavailableReason::Timeout { secs: 5 };
        assert_eq!(reason.to_string(), "query timed out after 5s");
    }
}
