//! Unified error handling for the discovery engine.
//!
//! Every public engine operation returns [`Result`]; nothing panics across the
//! engine boundary. Variants map one-to-one onto the stable taxonomy codes
//! returned by [`DiscoveryError::code`], which transports forward verbatim.

use thiserror::Error;

/// Unified error type for discovery engine operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Malformed input: bad coordinates, out-of-range rating, bad config
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Scan attempted before the minimum interval elapsed
    #[error("Scan throttled for account '{account_id}', retry in {retry_after_ms}ms")]
    Throttled {
        account_id: String,
        retry_after_ms: i64,
    },

    /// Duplicate ledger insert. Classified internally, never surfaced by the engine.
    #[error("Spot '{spot_id}' already discovered by '{account_id}'")]
    AlreadyDiscovered { account_id: String, spot_id: String },

    /// Unknown trail, spot or other catalog entity
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Missing or invalid account context
    #[error("Session not found")]
    SessionNotFound,

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Schema migration failure
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DiscoveryError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for the given entity kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable taxonomy code for transports and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            DiscoveryError::Validation { .. } => "VALIDATION",
            DiscoveryError::Throttled { .. } => "THROTTLED",
            DiscoveryError::AlreadyDiscovered { .. } => "ALREADY_DISCOVERED",
            DiscoveryError::NotFound { .. } => "NOT_FOUND",
            DiscoveryError::SessionNotFound => "SESSION_NOT_FOUND",
            DiscoveryError::Storage(_)
            | DiscoveryError::Migration(_)
            | DiscoveryError::Serialization(_) => "INTERNAL",
        }
    }

    /// Whether the client should surface this as a visible error state.
    ///
    /// Only structural failures are user-visible; proximity and throttle
    /// failures degrade silently.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NotFound { .. } | DiscoveryError::SessionNotFound
        )
    }
}

/// Result type alias for discovery engine operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Extension trait for converting Option to DiscoveryError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not found error.
    fn ok_or_not_found(self, kind: &'static str, id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, kind: &'static str, id: &str) -> Result<T> {
        self.ok_or_else(|| DiscoveryError::not_found(kind, id))
    }
}
