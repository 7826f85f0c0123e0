#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Custom error type for media provider operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Transport creation failed: {0}")]
    TransportCreation(String),

    #[error("Negotiation rejected: {0}")]
    Negotiation(String),

    #[error("Handle not found: {0}")]
    HandleNotFound(String),

    #[error("Handle closed: {0}")]
    Closed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Direction of a participant's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Send,
    Receive,
}

impl TransportRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportRole::Send => "send",
            TransportRole::Receive => "receive",
        }
    }
}

/// Kind of media track carried by a producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// DTLS state of a transport as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Opaque handle onto a provider transport.
///
/// `params` is what the client needs to build its side of the transport
/// (ICE parameters, candidates and DTLS parameters in the provider's format).
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub id: String,
    pub role: TransportRole,
    pub params: Value,
}

/// Opaque handle onto a provider producer
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub id: String,
    pub kind: MediaKind,
}

/// Opaque handle onto a provider consumer (always created paused)
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub params: Value,
}

/// Asynchronous notifications from the provider back into the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    TransportClosed { transport_id: String },
    ProducerClosed { producer_id: String },
    DtlsStateChanged { transport_id: String, state: DtlsState },
}
