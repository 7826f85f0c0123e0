#![forbid(unsafe_code)]

// Handle store for mediasoup transports, producers and consumers.
// Maps the opaque string ids the orchestrator sees onto live mediasoup objects
// and forwards their lifecycle callbacks as `ProviderEvent`s.

use crate::media::config::WebRtcTransportConfig;
use crate::media::types::{
    ConsumerHandle, DtlsState, MediaError, MediaKind, MediaResult, ProducerHandle, ProviderEvent,
    TransportHandle, TransportRole,
};
use mediasoup::prelude::*;
use mediasoup::prelude::MediaKind as RtpMediaKind;
use mediasoup::types::data_structures::DtlsState as RtcDtlsState;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport parameters handed to the client
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransportInfo<'a> {
    id: String,
    role: TransportRole,
    ice_parameters: &'a IceParameters,
    ice_candidates: &'a Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
}

/// Consumer parameters handed to the client
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerInfo<'a> {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: &'a RtpParameters,
}

/// Owns every mediasoup object created for the world.
///
/// Each map sits behind a std::sync::RwLock held only for lookups and inserts,
/// never across an await: objects are cloned out before any IPC call.
pub struct TransportManager {
    router: Router,
    transport_config: WebRtcTransportConfig,
    transports: StdRwLock<HashMap<String, WebRtcTransport>>,
    producers: StdRwLock<HashMap<String, Producer>>,
    consumers: StdRwLock<HashMap<String, Consumer>>,
    events: mpsc::UnboundedSender<ProviderEvent>,
}

impl TransportManager {
    pub fn new(
        router: Router,
        transport_config: WebRtcTransportConfig,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Self {
        Self {
            router,
            transport_config,
            transports: StdRwLock::new(HashMap::new()),
            producers: StdRwLock::new(HashMap::new()),
            consumers: StdRwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn rtp_capabilities(&self) -> Value {
        serde_json::to_value(self.router.rtp_capabilities()).unwrap_or(Value::Null)
    }

    fn transport(&self, transport_id: &str) -> MediaResult<WebRtcTransport> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| MediaError::HandleNotFound(format!("transport {transport_id}")))
    }

    fn consumer(&self, consumer_id: &str) -> MediaResult<Consumer> {
        let consumers = self.consumers.read().unwrap_or_else(|e| e.into_inner());
        consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| MediaError::HandleNotFound(format!("consumer {consumer_id}")))
    }

    /// Creates a WebRTC transport on the world router
    pub async fn create_transport(&self, role: TransportRole) -> MediaResult<TransportHandle> {
        let transport = self
            .router
            .create_webrtc_transport(self.transport_config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportCreation(format!("{} transport: {e}", role.as_str())))?;

        let id = transport.id().to_string();
        let params = serde_json::to_value(TransportInfo {
            id: id.clone(),
            role,
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        })?;

        self.setup_transport_handlers(&transport, role);
        self.transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), transport);

        info!("Created {} transport {}", role.as_str(), id);
        Ok(TransportHandle { id, role, params })
    }

    /// Connects a transport with the client's DTLS parameters
    pub async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let transport = self.transport(transport_id)?;
        let dtls_parameters: DtlsParameters = serde_json::from_value(dtls_parameters)?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Negotiation(format!("connect transport {transport_id}: {e}")))?;

        debug!("Connected transport {}", transport_id);
        Ok(())
    }

    /// Creates a producer on a send transport
    pub async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<ProducerHandle> {
        let transport = self.transport(transport_id)?;
        let rtp_parameters: RtpParameters = serde_json::from_value(rtp_parameters)?;

        let producer = transport
            .produce(ProducerOptions::new(to_mediasoup_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::Negotiation(format!("produce on {transport_id}: {e}")))?;

        let id = producer.id().to_string();
        self.setup_producer_handlers(&producer);
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), producer);

        info!("Created {:?} producer {} on transport {}", kind, id, transport_id);
        Ok(ProducerHandle { id, kind })
    }

    pub fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        let Ok(rtp_capabilities) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        self.router.can_consume(&producer_id, &rtp_capabilities)
    }

    /// Creates a paused consumer on a receive transport
    pub async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerHandle> {
        let transport = self.transport(transport_id)?;
        let typed_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::HandleNotFound(format!("producer {producer_id}")))?;
        let rtp_capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)?;

        let mut options = ConsumerOptions::new(typed_producer_id, rtp_capabilities);
        options.paused = true;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Negotiation(format!("consume {producer_id}: {e}")))?;

        let id = consumer.id().to_string();
        let kind = from_mediasoup_kind(consumer.kind());
        let params = serde_json::to_value(ConsumerInfo {
            id: id.clone(),
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: consumer.rtp_parameters(),
        })?;

        self.setup_consumer_handlers(&consumer);
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), consumer);

        debug!("Created consumer {} for producer {} on transport {}", id, producer_id, transport_id);
        Ok(ConsumerHandle {
            id,
            producer_id: producer_id.to_string(),
            kind,
            params,
        })
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.consumer(consumer_id)?
            .resume()
            .await
            .map_err(|e| MediaError::Negotiation(format!("resume consumer {consumer_id}: {e}")))
    }

    pub async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.consumer(consumer_id)?
            .pause()
            .await
            .map_err(|e| MediaError::Negotiation(format!("pause consumer {consumer_id}: {e}")))
    }

    /// Drops the object registered under `handle_id`; mediasoup closes it on drop
    pub fn close(&self, handle_id: &str) {
        let consumer = self.consumers.write().unwrap_or_else(|e| e.into_inner()).remove(handle_id);
        if consumer.is_some() {
            debug!("Closed consumer {}", handle_id);
            return;
        }
        let producer = self.producers.write().unwrap_or_else(|e| e.into_inner()).remove(handle_id);
        if producer.is_some() {
            debug!("Closed producer {}", handle_id);
            return;
        }
        let transport = self.transports.write().unwrap_or_else(|e| e.into_inner()).remove(handle_id);
        if transport.is_some() {
            debug!("Closed transport {}", handle_id);
        }
    }

    /// Closes every consumer, producer and transport
    pub fn close_all(&self) {
        info!("Closing all media handles");
        self.consumers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.producers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.transports.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Handlers are detached so they persist for the transport's lifetime.
    fn setup_transport_handlers(&self, transport: &WebRtcTransport, role: TransportRole) {
        let transport_id = transport.id().to_string();

        transport
            .on_close({
                let events = self.events.clone();
                let transport_id = transport_id.clone();
                Box::new(move || {
                    debug!("Transport {} ({}) closed", transport_id, role.as_str());
                    let _ = events.send(ProviderEvent::TransportClosed {
                        transport_id: transport_id.clone(),
                    });
                })
            })
            .detach();

        transport
            .on_dtls_state_change({
                let events = self.events.clone();
                move |dtls_state| {
                    let state = from_mediasoup_dtls(dtls_state);
                    info!("DTLS state: {:?} for {} transport {}", state, role.as_str(), transport_id);
                    let _ = events.send(ProviderEvent::DtlsStateChanged {
                        transport_id: transport_id.clone(),
                        state,
                    });
                }
            })
            .detach();
    }

    fn setup_producer_handlers(&self, producer: &Producer) {
        let producer_id = producer.id().to_string();

        producer
            .on_close({
                let events = self.events.clone();
                move || {
                    debug!("Producer {} closed", producer_id);
                    let _ = events.send(ProviderEvent::ProducerClosed {
                        producer_id: producer_id.clone(),
                    });
                }
            })
            .detach();
    }

    fn setup_consumer_handlers(&self, consumer: &Consumer) {
        let consumer_id = consumer.id().to_string();

        consumer
            .on_producer_close({
                let consumer_id = consumer_id.clone();
                move || {
                    debug!("Producer of consumer {} closed", consumer_id);
                }
            })
            .detach();

        consumer
            .on_transport_close(move || {
                warn!("Transport of consumer {} closed", consumer_id);
            })
            .detach();
    }
}

fn to_mediasoup_kind(kind: MediaKind) -> RtpMediaKind {
    match kind {
        MediaKind::Audio => RtpMediaKind::Audio,
        MediaKind::Video => RtpMediaKind::Video,
    }
}

fn from_mediasoup_kind(kind: RtpMediaKind) -> MediaKind {
    match kind {
        RtpMediaKind::Audio => MediaKind::Audio,
        RtpMediaKind::Video => MediaKind::Video,
    }
}

fn from_mediasoup_dtls(state: RtcDtlsState) -> DtlsState {
    match state {
        RtcDtlsState::New => DtlsState::New,
        RtcDtlsState::Connecting => DtlsState::Connecting,
        RtcDtlsState::Connected => DtlsState::Connected,
        RtcDtlsState::Failed => DtlsState::Failed,
        RtcDtlsState::Closed => DtlsState::Closed,
    }
}
