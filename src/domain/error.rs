//! Domain error types.

use chrono::NaiveDate;

/// Top-level error type for qtsim.
#[derive(Debug, thiserror::Error)]
pub enum QtsimError {
    #[error("data gap: {field} for {instrument} on {date} was never recorded")]
    DataGap {
        instrument: String,
        field: String,
        date: NaiveDate,
    },

    #[error("unknown {axis} label: {label}")]
    UnknownLabel { axis: &'static str, label: String },

    #[error("incompatible strategy roles: {reason}")]
    IncompatibleRole { reason: String },

    #[error("parameter space has no feasible point: {reason}")]
    EmptySearchSpace { reason: String },

    #[error("insufficient cash on {date}: need {required:.2}, have {available:.2}")]
    InsufficientCash {
        date: NaiveDate,
        required: f64,
        available: f64,
    },

    #[error("input contract violated: {reason}")]
    ContractBreach { reason: String },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown strategy: {id}")]
    UnknownStrategy { id: String },

    #[error("data provider rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("data provider error: {reason}")]
    Provider { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QtsimError {
    pub(crate) fn breach(reason: impl Into<String>) -> Self {
        QtsimError::ContractBreach {
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        QtsimError::IncompatibleRole {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_param(name: impl Into<String>, reason: impl Into<String>) -> Self {
        QtsimError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<&QtsimError> for std::process::ExitCode {
    fn from(err: &QtsimError) -> Self {
        let code: u8 = match err {
            QtsimError::Io(_) => 1,
            QtsimError::ConfigParse { .. }
            | QtsimError::ConfigMissing { .. }
            | QtsimError::ConfigInvalid { .. } => 2,
            QtsimError::Provider { .. } | QtsimError::RateLimited { .. } => 3,
            QtsimError::UnknownStrategy { .. }
            | QtsimError::InvalidParameter { .. }
            | QtsimError::IncompatibleRole { .. }
            | QtsimError::EmptySearchSpace { .. } => 4,
            QtsimError::DataGap { .. }
            | QtsimError::UnknownLabel { .. }
            | QtsimError::ContractBreach { .. } => 5,
            QtsimError::InsufficientCash { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
