//! Error taxonomy for the pipeline.
//!
//! Ingestion-side errors ([`ThreatScopeError::UnsupportedFormat`],
//! [`ThreatScopeError::CorruptInput`]) abort only the document that raised
//! them. Query-side availability errors ([`ThreatScopeError::EmbeddingUnavailable`],
//! [`ThreatScopeError::ModelUnavailable`], [`ThreatScopeError::ModelTimeout`])
//! degrade the answer instead of crashing. Nothing here is retried by the
//! pipeline itself; backoff belongs to the provider adapters.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ThreatScopeError>;

#[derive(Debug, Error)]
pub enum ThreatScopeError {
    /// Input format is not one of pdf, txt, or log.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The declared format matched but the bytes could not be decoded.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    /// Invalid configuration, detected at load time or first use.
    #[error("config error: {0}")]
    Config(String),

    /// A vector's dimensionality disagrees with the index.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The enrichment backend is unreachable. Never fatal: the IOC is kept
    /// without enrichment.
    #[error("enrichment unavailable: {0}")]
    EnrichmentUnavailable(String),

    /// The embedding provider failed or exhausted its retries.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The generative model endpoint is unreachable or rejected the call.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The generative model did not answer within the caller's deadline.
    #[error("model timed out after {0:?}")]
    ModelTimeout(Duration),

    /// The technique catalog failed to load or validate. Fatal at startup.
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
