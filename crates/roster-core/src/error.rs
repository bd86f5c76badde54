use crate::accessor::RekeyReport;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("partial failure: {message}")]
    PartialFailure { message: String, report: Box<RekeyReport> },
    #[error("network error: {0}")]
    Network(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

impl ReconcileError {
    /// Stable code for machine-readable output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Integrity(_) => "integrity",
            Self::PartialFailure { .. } => "partial_failure",
            Self::Network(_) => "network",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
        }
    }

    #[must_use]
    pub fn report(&self) -> Option<&RekeyReport> {
        match self {
            Self::PartialFailure { report, .. } => Some(report),
            _ => None,
        }
    }
}
