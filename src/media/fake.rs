#![forbid(unsafe_code)]

// In-memory MediaProvider used by unit tests.
// Records every call, can reject capability checks or production, and can hold
// consume calls behind a gate so cancellation races are deterministic.

use super::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    live: HashSet<String>,
    closed: Vec<String>,
    incompatible: HashSet<String>,
    /// Producers whose consume the relay refuses after the capability check
    rejected_consumes: HashSet<String>,
    reject_produce: bool,
    reject_connect: bool,
}

pub(crate) struct FakeProvider {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
    consume_gate: Mutex<Option<Arc<Semaphore>>>,
    events: mpsc::UnboundedSender<ProviderEvent>,
}

impl FakeProvider {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            next_id: AtomicU64::new(1),
            consume_gate: Mutex::new(None),
            events,
        });
        (provider, rx)
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// Number of recorded calls starting with `prefix`
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub(crate) fn is_live(&self, handle_id: &str) -> bool {
        self.state.lock().unwrap().live.contains(handle_id)
    }

    pub(crate) fn was_closed(&self, handle_id: &str) -> bool {
        self.state.lock().unwrap().closed.iter().any(|c| c == handle_id)
    }

    pub(crate) fn live_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Makes `can_consume` answer false for this producer
    pub(crate) fn mark_incompatible(&self, producer_id: &str) {
        self.state.lock().unwrap().incompatible.insert(producer_id.to_string());
    }

    /// Fail every future consume of `producer_id` with a negotiation error
    pub(crate) fn reject_consume(&self, producer_id: &str) {
        self.state.lock().unwrap().rejected_consumes.insert(producer_id.to_string());
    }

    pub(crate) fn reject_produce(&self) {
        self.state.lock().unwrap().reject_produce = true;
    }

    pub(crate) fn reject_connect(&self) {
        self.state.lock().unwrap().reject_connect = true;
    }

    /// Blocks every subsequent consume until `release_consumes` hands out permits
    pub(crate) fn gate_consumes(&self) {
        *self.consume_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_consumes(&self, permits: usize) {
        if let Some(gate) = self.consume_gate.lock().unwrap().as_ref() {
            gate.add_permits(permits);
        }
    }

    /// Simulates the relay reporting a lifecycle event on its own
    pub(crate) fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MediaProvider for FakeProvider {
    fn rtp_capabilities(&self) -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus" }], "headerExtensions": [] })
    }

    async fn create_transport(&self, role: TransportRole) -> MediaResult<TransportHandle> {
        let id = self.next("transport");
        self.record(format!("create_transport:{}", role.as_str()));
        self.state.lock().unwrap().live.insert(id.clone());
        Ok(TransportHandle {
            params: json!({ "id": id, "role": role }),
            id,
            role,
        })
    }

    async fn connect(&self, transport_id: &str, _dtls_parameters: Value) -> MediaResult<()> {
        self.record(format!("connect:{transport_id}"));
        let state = self.state.lock().unwrap();
        if state.reject_connect {
            return Err(MediaError::Negotiation("dtls fingerprint mismatch".into()));
        }
        if !state.live.contains(transport_id) {
            return Err(MediaError::HandleNotFound(transport_id.to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> MediaResult<ProducerHandle> {
        self.record(format!("produce:{transport_id}"));
        if self.state.lock().unwrap().reject_produce {
            return Err(MediaError::Negotiation("unsupported codec".into()));
        }
        let id = self.next("producer");
        self.state.lock().unwrap().live.insert(id.clone());
        Ok(ProducerHandle { id, kind })
    }

    fn can_consume(&self, producer_id: &str, _rtp_capabilities: &Value) -> bool {
        self.record(format!("can_consume:{producer_id}"));
        !self.state.lock().unwrap().incompatible.contains(producer_id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: Value,
    ) -> MediaResult<ConsumerHandle> {
        self.record(format!("consume:{producer_id}"));
        let gate = self.consume_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.state.lock().unwrap().rejected_consumes.contains(producer_id) {
            return Err(MediaError::Negotiation(format!("consumer for {producer_id} rejected")));
        }
        if !self.is_live(transport_id) {
            return Err(MediaError::Closed(transport_id.to_string()));
        }
        let id = self.next("consumer");
        self.state.lock().unwrap().live.insert(id.clone());
        Ok(ConsumerHandle {
            params: json!({ "id": id, "producerId": producer_id, "kind": "audio" }),
            id,
            producer_id: producer_id.to_string(),
            kind: MediaKind::Audio,
        })
    }

    async fn resume(&self, consumer_id: &str) -> MediaResult<()> {
        self.record(format!("resume:{consumer_id}"));
        if self.is_live(consumer_id) {
            Ok(())
        } else {
            Err(MediaError::HandleNotFound(consumer_id.to_string()))
        }
    }

    async fn pause(&self, consumer_id: &str) -> MediaResult<()> {
        self.record(format!("pause:{consumer_id}"));
        if self.is_live(consumer_id) {
            Ok(())
        } else {
            Err(MediaError::HandleNotFound(consumer_id.to_string()))
        }
    }

    async fn close(&self, handle_id: &str) {
        self.record(format!("close:{handle_id}"));
        let mut state = self.state.lock().unwrap();
        if state.live.remove(handle_id) {
            state.closed.push(handle_id.to_string());
        }
    }
}
