//! Error types for the key-value store chain

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the key-value store chain
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Key Errors
    // =========================================================================
    /// Key can not be projected onto a canonical string
    #[error("unsupported key type {kind} for key {key}")]
    UnsupportedKeyType { key: String, kind: &'static str },

    /// A key inside a batch failed normalization
    #[error("can not build string key for {key}: {source}")]
    InvalidKey {
        key: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// Operation failed on the last (authoritative) tier of a chain
    #[error("could not {op} {key} in kvstore {tier}: {source}")]
    Tier {
        op: &'static str,
        key: String,
        tier: String,
        #[source]
        source: Box<Error>,
    },

    /// Backend reported a failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Failure raised by an external backend implementation
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Value could not be encoded or decoded by a codec
    #[error("{codec} codec failed for key {key}: {reason}")]
    Codec {
        codec: &'static str,
        key: String,
        reason: String,
    },

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("failed to parse duration: {0}")]
    DurationParse(String),

    /// Chain element without a registered factory
    #[error("invalid element type {element} for kvstore chain {name}")]
    UnknownElement { name: String, element: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    /// Metrics sink error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Wrap an error raised by the tier `tier` while running `op` on `key`.
    pub fn tier(op: &'static str, key: impl ToString, tier: impl ToString, source: Error) -> Self {
        Error::Tier {
            op,
            key: key.to_string(),
            tier: tier.to_string(),
            source: Box::new(source),
        }
    }

    /// Returns true if the error was caused by a key that can not be normalized
    pub fn is_key_error(&self) -> bool {
        match self {
            Error::UnsupportedKeyType { .. } | Error::InvalidKey { .. } => true,
            Error::Tier { source, .. } => source.is_key_error(),
            _ => false,
        }
    }
}
