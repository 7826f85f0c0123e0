#![forbid(unsafe_code)]

// Transport facade - orchestrator intents in, provider calls out, provider events back.

use crate::media::{
    ConsumerHandle, DtlsState, MediaKind, MediaProvider, ProducerHandle, ProviderEvent, TransportHandle,
    TransportRole,
};
use crate::world::{World, WorldResult};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Holds the provider and nothing else: no registry identity lives here
#[derive(Clone)]
pub struct TransportFacade {
    provider: Arc<dyn MediaProvider>,
}

impl TransportFacade {
    pub fn new(provider: Arc<dyn MediaProvider>) -> Self {
        Self { provider }
    }

    pub fn rtp_capabilities(&self) -> Value {
        self.provider.rtp_capabilities()
    }

    pub async fn create_transport(&self, role: TransportRole) -> WorldResult<TransportHandle> {
        let handle = self.provider.create_transport(role).await?;
        debug!("Provider created {} transport {}", role.as_str(), handle.id);
        Ok(handle)
    }

    pub async fn connect(&self, transport_id: &str, dtls_parameters: Value) -> WorldResult<()> {
        self.provider.connect(transport_id, dtls_parameters).await?;
        Ok(())
    }

    pub async fn produce(&self, transport_id: &str, kind: MediaKind, rtp_parameters: Value) -> WorldResult<ProducerHandle> {
        Ok(self.provider.produce(transport_id, kind, rtp_parameters).await?)
    }

    pub fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        self.provider.can_consume(producer_id, rtp_capabilities)
    }

    pub async fn consume(&self, transport_id: &str, producer_id: &str, rtp_capabilities: Value) -> WorldResult<ConsumerHandle> {
        Ok(self.provider.consume(transport_id, producer_id, rtp_capabilities).await?)
    }

    pub async fn resume(&self, consumer_id: &str) -> WorldResult<()> {
        Ok(self.provider.resume(consumer_id).await?)
    }

    pub async fn pause(&self, consumer_id: &str) -> WorldResult<()> {
        Ok(self.provider.pause(consumer_id).await?)
    }

    pub async fn close(&self, handle_id: &str) {
        self.provider.close(handle_id).await;
    }

    /// Closes handles in order; used for cascades (consumers, then producers, then transports)
    pub async fn close_all(&self, handle_ids: &[String]) {
        for id in handle_ids {
            self.provider.close(id).await;
        }
    }
}

/// Feeds provider lifecycle events back into the world until the channel closes
pub fn spawn_event_pump(world: Arc<World>, mut events: mpsc::UnboundedReceiver<ProviderEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle_event(&world, event).await;
        }
        debug!("Provider event channel closed");
    })
}

async fn handle_event(world: &World, event: ProviderEvent) {
    match event {
        ProviderEvent::TransportClosed { transport_id } => {
            world.close_transport(&transport_id).await;
        }
        ProviderEvent::ProducerClosed { producer_id } => {
            world.close_producer(&producer_id).await;
        }
        ProviderEvent::DtlsStateChanged { transport_id, state: DtlsState::Closed } => {
            info!("DTLS closed on transport {}, closing it", transport_id);
            world.close_transport(&transport_id).await;
        }
        ProviderEvent::DtlsStateChanged { transport_id, state: DtlsState::Failed } => {
            warn!("DTLS failed on transport {}", transport_id);
        }
        ProviderEvent::DtlsStateChanged { transport_id, state } => {
            debug!("DTLS state {:?} on transport {}", state, transport_id);
        }
    }
}
