use thiserror::Error;

pub type Result<T> = std::result::Result<T, PromoterError>;

#[derive(Error, Debug)]
pub enum PromoterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest load error: {0}")]
    Load(String),

    #[error("Manifest conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inventory error for {registry}: {reason}")]
    Inventory { registry: String, reason: String },

    #[error("Unsafe promotion edge: {0}")]
    EdgeSafety(String),

    #[error("Execution error: {0}")]
    Exec(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PromoterError {
    /// Transient errors are eligible for retry; everything else is semantic.
    pub fn is_transient(&self) -> bool {
        matches!(self, PromoterError::Transient(_))
    }
}
