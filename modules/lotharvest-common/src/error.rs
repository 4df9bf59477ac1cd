use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    /// Login could not be established within the retry budget. The only
    /// error allowed to terminate a per-site run early.
    #[error("Session error for {site}: {message}")]
    Session { site: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Pagination error: {0}")]
    Pagination(String),

    #[error("Invalid currency string: {0:?}")]
    InvalidCurrency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl HarvestError {
    pub fn session(site: &str, message: impl Into<String>) -> Self {
        HarvestError::Session {
            site: site.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error is allowed to abort a per-site run. Everything
    /// else is caught at the smallest feasible unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarvestError::Session { .. })
    }
}
