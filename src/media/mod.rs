#![forbid(unsafe_code)]

// Media module - the media relay the orchestrator drives.
// The core only talks to `MediaProvider`; the mediasoup-backed implementation
// lives behind the `mediasoup` feature.

pub mod types;

#[cfg(feature = "mediasoup")]
pub mod config;
#[cfg(feature = "mediasoup")]
pub mod transport_manager;
#[cfg(feature = "mediasoup")]
pub mod worker_manager;

#[cfg(test)]
pub(crate) mod fake;

pub use types::{
    ConsumerHandle, DtlsState, MediaError, MediaKind, MediaResult, ProducerHandle, ProviderEvent,
    TransportHandle, TransportRole,
};

#[cfg(feature = "mediasoup")]
pub use config::MediaConfig;
#[cfg(feature = "mediasoup")]
pub use transport_manager::TransportManager;
#[cfg(feature = "mediasoup")]
pub use worker_manager::WorkerManager;

use async_trait::async_trait;
use serde_json::Value;

/// Capability set the orchestrator consumes from a media relay (SFU).
///
/// Every parameter blob (DTLS parameters, RTP parameters, RTP capabilities) is
/// passed through untouched; only the implementation interprets it. Lifecycle
/// events flow back through the `ProviderEvent` channel handed to the
/// implementation at construction time.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// RTP capabilities of the router clients must load their device with
    fn rtp_capabilities(&self) -> Value;

    async fn create_transport(&self, role: TransportRole) -> MediaResult<TransportHandle>;

    async fn connect(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<ProducerHandle>;

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    /// Creates a consumer in the paused state
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerHandle>;

    async fn resume(&self, consumer_id: &str) -> MediaResult<()>;

    async fn pause(&self, consumer_id: &str) -> MediaResult<()>;

    /// Closes a transport, producer or consumer. Unknown ids are ignored.
    async fn close(&self, handle_id: &str);
}

#[cfg(feature = "mediasoup")]
pub use server::MediaServer;

#[cfg(feature = "mediasoup")]
mod server {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing::info;

    /// mediasoup-backed `MediaProvider`: one worker, one router for the world.
    pub struct MediaServer {
        worker_manager: Arc<WorkerManager>,
        transport_manager: Arc<TransportManager>,
    }

    impl MediaServer {
        /// Creates the worker and the world router.
        ///
        /// # Errors
        /// Returns an error if a worker or the router cannot be created
        pub async fn new(
            config: MediaConfig,
            events: mpsc::UnboundedSender<ProviderEvent>,
        ) -> anyhow::Result<Self> {
            info!("Initializing MediaServer (RTC ports {}-{})", config.worker_config.rtc_min_port, config.worker_config.rtc_max_port);

            let config = Arc::new(config);
            let worker_manager = Arc::new(WorkerManager::new(config.clone()).await?);
            let router = worker_manager.create_router(&config.router_config).await?;
            let transport_manager = Arc::new(TransportManager::new(
                router,
                config.webrtc_transport_config.clone(),
                events,
            ));

            Ok(Self { worker_manager, transport_manager })
        }

        /// Closes every handle, then the workers
        pub async fn shutdown(&self) {
            info!("Shutting down MediaServer");
            self.transport_manager.close_all();
            self.worker_manager.shutdown().await;
            info!("MediaServer shutdown complete");
        }
    }

    #[async_trait]
    impl MediaProvider for MediaServer {
        fn rtp_capabilities(&self) -> Value {
            self.transport_manager.rtp_capabilities()
        }

        async fn create_transport(&self, role: TransportRole) -> MediaResult<TransportHandle> {
            self.transport_manager.create_transport(role).await
        }

        async fn connect(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
            self.transport_manager.connect_transport(transport_id, dtls_parameters).await
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            rtp_parameters: Value,
        ) -> MediaResult<ProducerHandle> {
            self.transport_manager.create_producer(transport_id, kind, rtp_parameters).await
        }

        fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
            self.transport_manager.can_consume(producer_id, rtp_capabilities)
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer_id: &str,
            rtp_capabilities: Value,
        ) -> MediaResult<ConsumerHandle> {
            self.transport_manager
                .create_consumer(transport_id, producer_id, rtp_capabilities)
                .await
        }

        async fn resume(&self, consumer_id: &str) -> MediaResult<()> {
            self.transport_manager.resume_consumer(consumer_id).await
        }

        async fn pause(&self, consumer_id: &str) -> MediaResult<()> {
            self.transport_manager.pause_consumer(consumer_id).await
        }

        async fn close(&self, handle_id: &str) {
            self.transport_manager.close(handle_id);
        }
    }
}
