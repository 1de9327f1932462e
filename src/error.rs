use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Outcome of applying one message to one project.
///
/// Everything except [`TrackerError::Invariant`] is a per-message failure:
/// it is logged and the worker moves on. `Invariant` means in-memory state
/// no longer matches what the tracker expects and must never be treated as
/// routine.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid {field} value '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("filter evaluation failed: {0}")]
    Filter(String),

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl TrackerError {
    pub fn is_invariant(&self) -> bool {
        matches!(self, TrackerError::Invariant(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::InvalidField { .. } => "invalid_field",
            TrackerError::Filter(_) => "filter",
            TrackerError::Persistence(_) => "persistence",
            TrackerError::Invariant(_) => "invariant",
        }
    }
}
