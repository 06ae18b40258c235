use crate::domain::{OwnerId, ResourceKind};

/// Core error type.
///
/// Adapter crates map their specific failures into this type (or into
/// `ProviderError` at the provider port) so the command surface and the
/// sweeper can handle failures consistently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid lifetime for {kind} channel: {hours}h (allowed {min}-{max}h)")]
    InvalidLifetime {
        kind: ResourceKind,
        hours: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid channel name: {0}")]
    InvalidName(String),

    #[error("channel provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("corrupt record for owner {owner}: {reason}")]
    StoreCorruption { owner: OwnerId, reason: String },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl Error {
    /// Store failures are the ones the sweeper escalates to process supervision.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::StoreCorruption { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
