#![forbid(unsafe_code)]

// World module - proximity-aware subscription orchestration.
//
// `World` owns the registry and the transport facade. The operations are split by
// concern: session.rs (connection lifecycle), subscription.rs (reconciliation),
// scheduler.rs (debounce and broadcast loops).

pub mod facade;
pub mod proximity;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod subscription;

pub use facade::TransportFacade;
pub use proximity::ProximityConfig;
pub use registry::{ConsumerState, PairState, Position, Registry};

use crate::config::ServerConfig;
use crate::media::{MediaError, MediaProvider};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{Outbound, ServerMessage};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors surfaced by world operations
#[derive(Error, Debug)]
pub enum WorldError {
    /// Referenced entity is gone, usually a race with a disconnect
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Cannot consume producer {producer_id} with the given RTP capabilities")]
    CapabilityMismatch { producer_id: String },

    #[error("Not joined")]
    NotJoined,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport creation failed: {0}")]
    TransportCreation(String),

    #[error("{kind} already exists: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("Consumer limit reached ({0})")]
    ConsumerLimit(usize),
}

impl WorldError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        WorldError::NotFound { kind, id: id.to_string() }
    }

    /// Races with concurrent teardown: logged and absorbed, never surfaced as failures
    pub fn is_benign(&self) -> bool {
        matches!(self, WorldError::NotFound { .. })
    }
}

impl From<MediaError> for WorldError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::TransportCreation(msg) => WorldError::TransportCreation(msg),
            MediaError::HandleNotFound(id) | MediaError::Closed(id) => WorldError::NotFound { kind: "handle", id },
            MediaError::Negotiation(msg) => WorldError::Negotiation(msg),
            MediaError::InvalidParameters(e) => WorldError::Negotiation(format!("invalid parameters: {e}")),
            MediaError::Other(e) => WorldError::Negotiation(e.to_string()),
        }
    }
}

/// Result type alias for world operations
pub type WorldResult<T> = Result<T, WorldError>;

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub proximity: ProximityConfig,
    /// Where joining participants appear
    pub spawn: Position,
    /// Cap on consumers plus in-flight reservations per subscriber
    pub max_consumers: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            proximity: ProximityConfig::default(),
            spawn: Position::new(100.0, 100.0),
            max_consumers: 64,
        }
    }
}

impl From<&ServerConfig> for WorldConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            proximity: ProximityConfig::new(config.proximity_threshold, config.proximity_exit_threshold),
            spawn: Position::new(config.spawn_x, config.spawn_y),
            max_consumers: config.max_consumers_per_participant,
        }
    }
}

/// Shared orchestrator state.
///
/// The registry mutex is the single serialization point: every check-and-claim
/// happens inside one critical section and the guard is never held across an
/// `.await`. Provider calls run unlocked and re-validate on commit.
pub struct World {
    registry: StdMutex<Registry>,
    facade: TransportFacade,
    config: WorldConfig,
    /// Participants whose position changed since the last reconcile tick
    dirty: StdMutex<HashSet<String>>,
    metrics: ServerMetrics,
}

impl World {
    pub fn new(provider: Arc<dyn MediaProvider>, config: WorldConfig, metrics: ServerMetrics) -> Self {
        Self {
            registry: StdMutex::new(Registry::new()),
            facade: TransportFacade::new(provider),
            config,
            dirty: StdMutex::new(HashSet::new()),
            metrics,
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub(crate) fn facade(&self) -> &TransportFacade {
        &self.facade
    }

    pub(crate) fn mark_dirty(&self, participant_id: &str) {
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(participant_id.to_string());
    }

    pub(crate) fn take_dirty(&self) -> HashSet<String> {
        std::mem::take(&mut *self.dirty.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn clear_dirty(&self, participant_id: &str) {
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(participant_id);
    }

    /// (participants, producers, consumers) currently registered
    pub fn counts(&self) -> (usize, usize, usize) {
        let registry = self.registry();
        (
            registry.participant_count(),
            registry.producer_count(),
            registry.consumer_count(),
        )
    }

    /// Pushes a message to a joined participant; unknown ids are ignored
    pub(crate) fn notify(&self, participant_id: &str, message: ServerMessage) {
        let sender = self.registry().participant(participant_id).map(|p| p.sender.clone());
        if let Some(sender) = sender {
            send_outbound(&sender, participant_id, &Outbound::push(message));
        }
    }
}

/// Serialize an outbound frame and queue it without blocking.
/// Full or closed channels drop the frame; the client is slow or gone.
pub(crate) fn send_outbound(sender: &mpsc::Sender<Arc<String>>, participant_id: &str, frame: &Outbound) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("Failed to serialize message: {}", e);
            return false;
        }
    };
    send_raw(sender, participant_id, json)
}

pub(crate) fn send_raw(sender: &mpsc::Sender<Arc<String>>, participant_id: &str, json: Arc<String>) -> bool {
    match sender.try_send(json) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for participant {}, dropping message", participant_id);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for participant {} (disconnected)", participant_id);
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_map_to_world_errors() {
        let e: WorldError = MediaError::Closed("transport-1".into()).into();
        assert!(e.is_benign());
        let e: WorldError = MediaError::Negotiation("bad dtls".into()).into();
        assert!(matches!(e, WorldError::Negotiation(_)));
        assert!(!e.is_benign());
        let e: WorldError = MediaError::TransportCreation("no ports".into()).into();
        assert!(matches!(e, WorldError::TransportCreation(_)));
    }

    #[test]
    fn test_send_outbound_drops_on_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let frame = Outbound::push(ServerMessage::Ok);
        assert!(send_outbound(&tx, "a", &frame));
        assert!(!send_outbound(&tx, "a", &frame));
        assert_eq!(rx.try_recv().unwrap().as_str(), r#"{"type":"ok"}"#);
        drop(rx);
        assert!(!send_outbound(&tx, "a", &frame));
    }
}
