#![forbid(unsafe_code)]

// Session controller - per-connection requests routed into the registry and reconciliation.

use crate::media::{MediaKind, TransportRole};
use crate::signaling::protocol::ParticipantInfo;
use crate::world::proximity;
use crate::world::registry::{ConsumerState, Participant, PairState, Position, Producer};
use crate::world::{World, WorldError, WorldResult};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

impl World {
    fn require_joined(&self, participant_id: &str) -> WorldResult<()> {
        if self.registry().participant(participant_id).is_some() {
            Ok(())
        } else {
            Err(WorldError::NotJoined)
        }
    }

    /// Adds the participant at the spawn point.
    ///
    /// Joining again on the same connection only renames; it creates nothing and
    /// makes no provider call beyond reading the router capabilities.
    pub fn join(
        &self,
        participant_id: &str,
        display_name: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> WorldResult<(Value, ParticipantInfo)> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(WorldError::InvalidRequest("displayName must not be empty".to_string()));
        }

        let info = {
            let mut registry = self.registry();
            match registry.participant_mut(participant_id) {
                Some(existing) => {
                    debug!("Participant {} joined again as {}", participant_id, display_name);
                    existing.display_name = display_name.to_string();
                    participant_info(existing)
                }
                None => {
                    let participant = Participant::new(
                        participant_id.to_string(),
                        display_name.to_string(),
                        self.config().spawn,
                        sender,
                    );
                    let info = participant_info(&participant);
                    registry.add_participant(participant);
                    self.metrics().inc_joins();
                    info!("Participant {} ({}) joined", participant_id, display_name);
                    info
                }
            }
        };
        self.mark_dirty(participant_id);
        Ok((self.facade().rtp_capabilities(), info))
    }

    /// Last write wins; reconciliation follows on the next scheduler tick
    pub fn update_position(&self, participant_id: &str, x: f64, y: f64) -> WorldResult<()> {
        if !x.is_finite() || !y.is_finite() {
            return Err(WorldError::InvalidRequest("position must be finite".to_string()));
        }
        self.registry()
            .set_position(participant_id, Position::new(x, y))
            .map_err(|_| WorldError::NotJoined)?;
        self.mark_dirty(participant_id);
        Ok(())
    }

    pub fn rtp_capabilities(&self) -> Value {
        self.facade().rtp_capabilities()
    }

    /// Stores device capabilities; from now on reconciliation consumes on the client's behalf
    pub fn set_rtp_capabilities(&self, participant_id: &str, rtp_capabilities: Value) -> WorldResult<()> {
        {
            let mut registry = self.registry();
            let participant = registry.participant_mut(participant_id).ok_or(WorldError::NotJoined)?;
            participant.rtp_capabilities = Some(rtp_capabilities);
        }
        self.mark_dirty(participant_id);
        Ok(())
    }

    /// Get-or-create; returns the transport parameters for the client
    pub async fn create_transport(&self, participant_id: &str, role: TransportRole) -> WorldResult<Value> {
        self.require_joined(participant_id)?;
        let transport = self.ensure_transport(participant_id, role).await?;
        Ok(transport.params)
    }

    pub async fn connect_transport(&self, participant_id: &str, transport_id: &str, dtls_parameters: Value) -> WorldResult<()> {
        self.require_joined(participant_id)?;
        let owned = self
            .registry()
            .transport(transport_id)
            .is_some_and(|t| t.owner_id == participant_id);
        if !owned {
            return Err(WorldError::not_found("transport", transport_id));
        }
        self.facade().connect(transport_id, dtls_parameters).await?;
        debug!("Participant {} connected transport {}", participant_id, transport_id);
        Ok(())
    }

    /// Produces on the participant's send transport and hooks up nearby subscribers.
    ///
    /// Returns the producer id and whether any other participant is producing.
    pub async fn produce(&self, participant_id: &str, kind: MediaKind, rtp_parameters: Value) -> WorldResult<(String, bool)> {
        self.require_joined(participant_id)?;
        let transport = self.ensure_transport(participant_id, TransportRole::Send).await?;
        let handle = self.facade().produce(&transport.id, kind, rtp_parameters).await?;

        let registered = {
            let mut registry = self.registry();
            let added = registry.add_producer(Producer {
                id: handle.id.clone(),
                owner_id: participant_id.to_string(),
                kind,
                transport_id: transport.id.clone(),
            });
            added.map(|()| !registry.list_producers(participant_id).is_empty())
        };
        let producers_exist = match registered {
            Ok(exist) => exist,
            Err(e) => {
                // owner or transport went away while the provider was working
                self.facade().close(&handle.id).await;
                return Err(e);
            }
        };

        self.metrics().inc_producers_created();
        info!("Participant {} produced {:?} {}", participant_id, kind, handle.id);
        self.on_producer_created(participant_id).await;
        Ok((handle.id, producers_exist))
    }

    /// Client-driven consume.
    ///
    /// Returns the stored params when the pair is already consumed, claims an
    /// announced pair, or opens a new one for a visible producer. The first
    /// capabilities seen are remembered for server-driven consumption.
    pub async fn consume(&self, participant_id: &str, producer_id: &str, rtp_capabilities: Value) -> WorldResult<Value> {
        let ticket = {
            let mut registry = self.registry();
            let participant = registry.participant_mut(participant_id).ok_or(WorldError::NotJoined)?;
            if participant.rtp_capabilities.is_none() {
                participant.rtp_capabilities = Some(rtp_capabilities.clone());
            }

            if let Some(existing) = registry.find_consumer(participant_id, producer_id) {
                return Ok(existing.params.clone());
            }
            if registry.producer(producer_id).is_none() {
                return Err(WorldError::not_found("producer", producer_id));
            }

            let reservation = registry.reservation(participant_id, producer_id).map(|r| r.state);
            if reservation.is_some_and(|state| state.is_pending()) {
                return Err(WorldError::InvalidRequest(format!(
                    "consume already in progress for producer {producer_id}"
                )));
            }
            let max = self.config().max_consumers;
            if registry.subscription_load(participant_id) >= max {
                return Err(WorldError::ConsumerLimit(max));
            }

            let claimed = match reservation {
                Some(_) => registry.claim(participant_id, producer_id),
                None => {
                    let desired = proximity::desired_producers(&registry, participant_id, &self.config().proximity);
                    if !desired.contains(producer_id) {
                        return Err(WorldError::InvalidRequest(format!("producer {producer_id} is out of range")));
                    }
                    registry.reserve(participant_id, producer_id, PairState::PendingTransport)
                }
            };
            claimed.ok_or_else(|| WorldError::not_found("producer", producer_id))?
        };

        let consumer = self
            .subscribe_pair(participant_id, producer_id, ticket, rtp_capabilities)
            .await?;
        Ok(consumer.params)
    }

    /// Resumes an owned consumer; returns its producer id
    pub async fn resume_consumer(&self, participant_id: &str, consumer_id: &str) -> WorldResult<String> {
        let producer_id = self.owned_consumer(participant_id, consumer_id)?;
        self.facade().resume(consumer_id).await?;
        self.registry().set_consumer_state(consumer_id, ConsumerState::Active)?;
        debug!("Consumer {} resumed for {}", consumer_id, participant_id);
        Ok(producer_id)
    }

    /// Pauses an owned consumer; returns its producer id
    pub async fn pause_consumer(&self, participant_id: &str, consumer_id: &str) -> WorldResult<String> {
        let producer_id = self.owned_consumer(participant_id, consumer_id)?;
        self.facade().pause(consumer_id).await?;
        self.registry().set_consumer_state(consumer_id, ConsumerState::Paused)?;
        debug!("Consumer {} paused for {}", consumer_id, participant_id);
        Ok(producer_id)
    }

    fn owned_consumer(&self, participant_id: &str, consumer_id: &str) -> WorldResult<String> {
        self.require_joined(participant_id)?;
        self.registry()
            .consumer(consumer_id)
            .filter(|c| c.subscriber_id == participant_id && c.state != ConsumerState::Closed)
            .map(|c| c.producer_id.clone())
            .ok_or_else(|| WorldError::not_found("consumer", consumer_id))
    }

    /// Explicit close of one of the participant's own producers
    pub async fn close_own_producer(&self, participant_id: &str, producer_id: &str) -> WorldResult<()> {
        self.require_joined(participant_id)?;
        let owned = self
            .registry()
            .producer(producer_id)
            .is_some_and(|p| p.owner_id == participant_id);
        if !owned {
            return Err(WorldError::not_found("producer", producer_id));
        }
        self.close_producer(producer_id).await;
        Ok(())
    }

    /// Removes the participant and everything referencing it in one critical section,
    /// then closes the handles. Unknown ids are a no-op.
    pub async fn disconnect(&self, participant_id: &str) {
        let removal = self.registry().remove_participant(participant_id);
        self.clear_dirty(participant_id);
        if removal.participant.is_none() {
            return;
        }

        let consumer_ids: Vec<String> = removal.consumers.iter().map(|c| c.id.clone()).collect();
        self.facade().close_all(&consumer_ids).await;
        let producer_ids: Vec<String> = removal.producers.iter().map(|p| p.id.clone()).collect();
        self.facade().close_all(&producer_ids).await;
        let transport_ids: Vec<String> = removal.transports.iter().map(|t| t.id.clone()).collect();
        self.facade().close_all(&transport_ids).await;

        self.metrics().inc_disconnects();
        self.finish_cascade(&removal.consumers);
        self.refill(&removal.consumers, Some(participant_id)).await;
        info!(
            "Participant {} left ({} transports, {} producers, {} consumers closed)",
            participant_id,
            removal.transports.len(),
            removal.producers.len(),
            removal.consumers.len()
        );
    }

    /// Disconnects everyone
    pub async fn shutdown(&self) {
        let ids = self.registry().participant_ids();
        info!("Shutting down world ({} participants)", ids.len());
        for id in &ids {
            self.disconnect(id).await;
        }
    }
}

fn participant_info(participant: &Participant) -> ParticipantInfo {
    ParticipantInfo {
        id: participant.id.clone(),
        name: participant.display_name.clone(),
        x: participant.position.x,
        y: participant.position.y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::testing::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_join_places_at_spawn_and_is_idempotent() {
        let (world, provider) = world();
        let client = Client::new("a");
        let (caps, info) = world.join("a", "  Ada ", client.tx.clone()).unwrap();
        assert_eq!(caps["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(info, ParticipantInfo { id: "a".into(), name: "Ada".into(), x: 100.0, y: 100.0 });

        let (_, again) = world.join("a", "Ada L", client.tx.clone()).unwrap();
        assert_eq!(again.name, "Ada L");
        assert_eq!(world.counts(), (1, 0, 0));
        assert_eq!(world.metrics().joins(), 1);
        assert_eq!(provider.total_calls(), 0);

        assert!(matches!(world.join("b", " ", client.tx).unwrap_err(), WorldError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_requests_before_join_are_rejected() {
        let (world, provider) = world();
        assert!(matches!(world.update_position("a", 1.0, 1.0), Err(WorldError::NotJoined)));
        assert!(matches!(
            world.create_transport("a", TransportRole::Send).await,
            Err(WorldError::NotJoined)
        ));
        assert!(matches!(
            world.produce("a", MediaKind::Audio, json!({})).await,
            Err(WorldError::NotJoined)
        ));
        assert!(matches!(world.consume("a", "p", caps()).await, Err(WorldError::NotJoined)));
        assert_eq!(provider.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_position_rejected() {
        let (world, _provider) = world();
        let _a = join_at(&world, "a", 3.0, 4.0).await;
        assert!(world.update_position("a", f64::NAN, 0.0).is_err());
        assert_eq!(world.registry().participant("a").unwrap().position, Position::new(3.0, 4.0));
    }

    #[tokio::test]
    async fn test_disconnect_scenario() {
        let (world, provider) = world();
        let _a = join_capable_at(&world, "a", 0.0, 0.0).await;
        let mut b = join_capable_at(&world, "b", 5.0, 5.0).await;
        let pa = produce_audio(&world, "a").await;
        let pb = produce_audio(&world, "b").await;
        assert!(world.registry().find_consumer("a", &pb).is_some());
        assert!(world.registry().find_consumer("b", &pa).is_some());
        b.drain();

        world.disconnect("a").await;

        assert!(world.registry().is_unreferenced("a"));
        assert_eq!(world.counts(), (1, 1, 0));
        let frames = b.drain();
        let removed = of_type(&frames, "producerRemoved");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0]["producerId"], pa.as_str());
        assert!(provider.was_closed(&pa));
        // b keeps its send and receive transports, a's two are gone
        assert_eq!(provider.live_count("transport"), 2);
        assert_eq!(provider.live_count("consumer"), 0);
        assert_eq!(world.metrics().disconnects(), 1);

        // second disconnect is a no-op
        let calls = provider.total_calls();
        world.disconnect("a").await;
        assert_eq!(provider.total_calls(), calls);
    }

    #[tokio::test]
    async fn test_cleanup_completeness_with_many_peers() {
        let (world, provider) = world();
        let ids = ["a", "b", "c", "d", "e"];
        for (i, id) in ids.iter().enumerate() {
            join_capable_at(&world, id, i as f64, 0.0).await;
            produce_audio(&world, id).await;
        }
        // earlier joiners were hooked up by produce, later ones need their own pass
        world.reconcile_all().await;
        assert_eq!(world.registry().consumer_count(), 20);

        world.disconnect("c").await;
        assert!(world.registry().is_unreferenced("c"));
        assert_eq!(world.registry().consumer_count(), 12);

        world.shutdown().await;
        assert_eq!(world.counts(), (0, 0, 0));
        for id in ids {
            assert!(world.registry().is_unreferenced(id));
        }
        assert_eq!(provider.live_count("transport"), 0);
        assert_eq!(provider.live_count("producer"), 0);
        assert_eq!(provider.live_count("consumer"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_refills_freed_slot() {
        let config = crate::world::WorldConfig {
            max_consumers: 1,
            ..crate::world::WorldConfig::default()
        };
        let (world, _provider) = world_with(config);
        let _a = join_capable_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 1.0, 0.0).await;
        let _c = join_at(&world, "c", 0.0, 1.0).await;
        let pb = produce_audio(&world, "b").await;
        let pc = produce_audio(&world, "c").await;
        assert!(world.registry().find_consumer("a", &pb).is_some());

        world.disconnect("b").await;

        assert!(world.registry().find_consumer("a", &pc).is_some());
        assert_eq!(world.registry().consumers_of("a").len(), 1);
    }

    #[tokio::test]
    async fn test_cascades_run_on_spawned_tasks() {
        let (world, provider) = world();
        let _a = join_capable_at(&world, "a", 0.0, 0.0).await;
        let _b = join_capable_at(&world, "b", 1.0, 0.0).await;
        let pb = produce_audio(&world, "b").await;
        let send = world.registry().find_send_transport("b").unwrap().id.clone();
        let recv = world.registry().find_receive_transport("a").unwrap().id.clone();

        let w = world.clone();
        tokio::spawn(async move { w.close_producer(&pb).await }).await.unwrap();
        let w = world.clone();
        tokio::spawn(async move { w.close_transport(&recv).await }).await.unwrap();
        let w = world.clone();
        tokio::spawn(async move { w.disconnect("b").await }).await.unwrap();

        assert!(world.registry().is_unreferenced("b"));
        assert!(provider.was_closed(&send));
        assert_eq!(provider.live_count("consumer"), 0);
    }

    #[tokio::test]
    async fn test_consume_capability_mismatch_returns_error() {
        let (world, provider) = world();
        let _a = join_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 5.0, 5.0).await;
        let pb = produce_audio(&world, "b").await;
        provider.mark_incompatible(&pb);

        let err = world.consume("a", &pb, caps()).await.unwrap_err();
        assert!(matches!(err, WorldError::CapabilityMismatch { ref producer_id } if producer_id == &pb));
        assert!(world.registry().find_consumer("a", &pb).is_none());
        assert_eq!(world.registry().consumer_count(), 0);
        assert_eq!(provider.count("consume:"), 0);
    }

    #[tokio::test]
    async fn test_client_driven_consume_is_idempotent() {
        let (world, provider) = world();
        let mut a = join_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 5.0, 5.0).await;
        let pb = produce_audio(&world, "b").await;
        assert_eq!(of_type(&a.drain(), "newlyVisible").len(), 1);

        let first = world.consume("a", &pb, caps()).await.unwrap();
        let second = world.consume("a", &pb, caps()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first["producerId"], pb.as_str());
        assert_eq!(provider.count("consume:"), 1);
        assert_eq!(world.registry().find_consumer("a", &pb).unwrap().state, ConsumerState::Pending);
        // the receive transport was pushed so the client can connect it
        assert_eq!(of_type(&a.drain(), "transportCreated").len(), 1);
        assert!(world.registry().participant("a").unwrap().rtp_capabilities.is_some());
    }

    #[tokio::test]
    async fn test_consume_out_of_range_or_unknown() {
        let (world, _provider) = world();
        let _a = join_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 500.0, 0.0).await;
        let pb = produce_audio(&world, "b").await;

        assert!(matches!(world.consume("a", &pb, caps()).await, Err(WorldError::InvalidRequest(_))));
        let err = world.consume("a", "producer-404", caps()).await.unwrap_err();
        assert!(err.is_benign());
    }

    #[tokio::test]
    async fn test_resume_and_pause() {
        let (world, provider) = world();
        let mut a = join_capable_at(&world, "a", 0.0, 0.0).await;
        let _b = join_capable_at(&world, "b", 1.0, 1.0).await;
        let pb = produce_audio(&world, "b").await;
        let consumer_id = world.registry().find_consumer("a", &pb).unwrap().id.clone();
        a.drain();

        assert_eq!(world.resume_consumer("a", &consumer_id).await.unwrap(), pb);
        assert_eq!(world.registry().consumer(&consumer_id).unwrap().state, ConsumerState::Active);
        assert_eq!(world.pause_consumer("a", &consumer_id).await.unwrap(), pb);
        assert_eq!(world.registry().consumer(&consumer_id).unwrap().state, ConsumerState::Paused);

        // b cannot touch a's consumer
        let err = world.resume_consumer("b", &consumer_id).await.unwrap_err();
        assert!(err.is_benign());
        assert_eq!(provider.count("resume:"), 1);
    }

    #[tokio::test]
    async fn test_connect_transport() {
        let (world, provider) = world();
        let _a = join_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 0.0, 0.0).await;
        let params = world.create_transport("a", TransportRole::Send).await.unwrap();
        let transport_id = params["id"].as_str().unwrap().to_string();

        world.connect_transport("a", &transport_id, json!({})).await.unwrap();
        assert!(world.connect_transport("b", &transport_id, json!({})).await.unwrap_err().is_benign());

        provider.reject_connect();
        let err = world.connect_transport("a", &transport_id, json!({})).await.unwrap_err();
        assert!(matches!(err, WorldError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_create_transport_is_get_or_create() {
        let (world, provider) = world();
        let _a = join_at(&world, "a", 0.0, 0.0).await;
        let first = world.create_transport("a", TransportRole::Receive).await.unwrap();
        let second = world.create_transport("a", TransportRole::Receive).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.count("create_transport:"), 1);
    }

    #[tokio::test]
    async fn test_produce_reports_other_producers() {
        let (world, provider) = world();
        let _a = join_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 900.0, 0.0).await;

        let (_, exist) = world.produce("a", MediaKind::Audio, json!({})).await.unwrap();
        assert!(!exist);
        let (_, exist) = world.produce("a", MediaKind::Video, json!({})).await.unwrap();
        assert!(!exist);
        let (_, exist) = world.produce("b", MediaKind::Audio, json!({})).await.unwrap();
        assert!(exist);
        assert_eq!(world.metrics().producers_created(), 3);

        provider.reject_produce();
        let err = world.produce("a", MediaKind::Audio, json!({})).await.unwrap_err();
        assert!(matches!(err, WorldError::Negotiation(_)));
        assert_eq!(world.registry().producer_count(), 3);
    }

    #[tokio::test]
    async fn test_close_own_producer_only() {
        let (world, _provider) = world();
        let _a = join_at(&world, "a", 0.0, 0.0).await;
        let _b = join_at(&world, "b", 0.0, 0.0).await;
        let pa = produce_audio(&world, "a").await;

        assert!(world.close_own_producer("b", &pa).await.unwrap_err().is_benign());
        assert!(world.registry().producer(&pa).is_some());
        world.close_own_producer("a", &pa).await.unwrap();
        assert!(world.registry().producer(&pa).is_none());
        // the announcement to b goes with it
        assert!(world.registry().reservation("b", &pa).is_none());
    }
}
