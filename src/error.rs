use thiserror::Error;

/// The delivery session could not be opened or authenticated. Aborts a run
/// before any message is attempted.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Deliverer initialization failed: {0}")]
    Init(String),

    #[error("Session cookies unusable: {0}")]
    Cookies(String),

    #[error("Deliverer rejected session (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for SetupError {
    fn from(err: reqwest::Error) -> Self {
        SetupError::Init(err.to_string())
    }
}

/// History or counters could not be read or durably written.
#[derive(Debug, Error)]
#[error("Persistence error: {0}")]
pub struct PersistenceError(pub String);

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError(err.to_string())
    }
}

/// A single delivery attempt failed. Recoverable by retry.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Network(err.to_string())
    }
}

/// A lead's profile reference cannot be turned into a recipient handle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unusable profile handle {raw:?}: {reason}")]
pub struct DataQualityError {
    pub raw: String,
    pub reason: &'static str,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        LookupError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for LookupError {
    fn from(err: serde_json::Error) -> Self {
        LookupError::Parse(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Config validation failed: {0}")]
    Validation(String),

    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },
}

/// Errors that end a campaign run. Everything else is absorbed per recipient.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
