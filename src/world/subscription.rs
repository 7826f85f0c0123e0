#![forbid(unsafe_code)]

// Subscription manager - converges each subscriber's consumers onto its visible producers.
//
// Per (subscriber, producer) pair:
//   none -> PendingTransport -> PendingConsumer -> consumer registered (Pending/Active/Paused)
// A pair without capabilities on file goes none -> Announced and waits for the client's
// consume request, which claims the same reservation. Every transition that needs the
// provider drops the registry lock first and commits with the reservation ticket; a
// reservation removed in between (disconnect, producer or transport closed, proximity
// lost) turns the commit into a close of the fresh handle.

use crate::media::TransportRole;
use crate::signaling::protocol::{Outbound, ServerMessage};
use crate::world::proximity;
use crate::world::registry::{Consumer, ConsumerState, PairState, Transport};
use crate::world::{send_outbound, World, WorldError, WorldResult};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What one reconcile pass decided under the lock
#[derive(Default)]
struct Plan {
    close: Vec<Consumer>,
    /// Reservations dropped because the producer left the visible set
    withdrawn: Vec<String>,
    announce: Vec<String>,
    subscribe: Vec<(String, u64)>,
    rtp_capabilities: Option<Value>,
}

impl World {
    /// Makes the subscriber's consumer set match its desired producer set.
    ///
    /// Idempotent: a second pass with no state change issues no provider calls.
    /// A failure on one pair never stops the others.
    pub async fn reconcile(&self, subscriber_id: &str) {
        let Some(plan) = self.plan(subscriber_id) else {
            return;
        };
        self.metrics().inc_reconciliations();

        for consumer in &plan.close {
            self.facade().close(&consumer.id).await;
            self.metrics().inc_consumers_closed();
            debug!(
                "Proximity lost: closed consumer {} ({} -> {})",
                consumer.id, consumer.producer_id, subscriber_id
            );
            self.notify(
                subscriber_id,
                ServerMessage::ProducerRemoved { producer_id: consumer.producer_id.clone() },
            );
        }
        for producer_id in plan.withdrawn {
            self.notify(subscriber_id, ServerMessage::ProducerRemoved { producer_id });
        }

        if !plan.announce.is_empty() {
            debug!("Announcing {} producers to {}", plan.announce.len(), subscriber_id);
            self.notify(subscriber_id, ServerMessage::NewlyVisible { producer_ids: plan.announce });
        }

        let Some(rtp_capabilities) = plan.rtp_capabilities else {
            return;
        };
        let pending = plan.subscribe.iter().map(|(producer_id, ticket)| {
            self.subscribe_and_push(subscriber_id, producer_id, *ticket, rtp_capabilities.clone())
        });
        join_all(pending).await;
    }

    /// Diffs desired against actual and claims every new pair, all in one critical section
    fn plan(&self, subscriber_id: &str) -> Option<Plan> {
        let mut registry = self.registry();
        let participant = registry.participant(subscriber_id)?;
        let rtp_capabilities = participant.rtp_capabilities.clone();
        let desired = proximity::desired_producers(&registry, subscriber_id, &self.config().proximity);
        let mut plan = Plan {
            rtp_capabilities: rtp_capabilities.clone(),
            ..Plan::default()
        };

        let stale: Vec<String> = registry
            .consumers_of(subscriber_id)
            .into_iter()
            .filter(|c| c.state != ConsumerState::Closed && !desired.contains(&c.producer_id))
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in stale {
            if let Some(consumer) = registry.remove_consumer(&consumer_id) {
                plan.close.push(consumer);
            }
        }

        for (producer_id, reservation) in registry.reservations_of(subscriber_id) {
            if desired.contains(&producer_id) {
                continue;
            }
            registry.release(subscriber_id, &producer_id, None);
            if reservation.state == PairState::Announced {
                plan.withdrawn.push(producer_id);
            }
        }

        let mut wanted: Vec<&String> = desired.iter().collect();
        wanted.sort();
        let mut load = registry.subscription_load(subscriber_id);
        for producer_id in wanted {
            if registry.find_consumer(subscriber_id, producer_id).is_some()
                || registry.reservation(subscriber_id, producer_id).is_some()
            {
                continue;
            }
            if rtp_capabilities.is_none() {
                if registry.reserve(subscriber_id, producer_id, PairState::Announced).is_some() {
                    plan.announce.push(producer_id.clone());
                }
                continue;
            }
            if load >= self.config().max_consumers {
                debug!(
                    "Consumer limit {} reached for {}, skipping producer {}",
                    self.config().max_consumers, subscriber_id, producer_id
                );
                continue;
            }
            if let Some(ticket) = registry.reserve(subscriber_id, producer_id, PairState::PendingTransport) {
                plan.subscribe.push((producer_id.clone(), ticket));
                load += 1;
            }
        }

        Some(plan)
    }

    /// Server-driven half of a pair: create the consumer and push its params
    async fn subscribe_and_push(&self, subscriber_id: &str, producer_id: &str, ticket: u64, rtp_capabilities: Value) {
        match self.subscribe_pair(subscriber_id, producer_id, ticket, rtp_capabilities).await {
            Ok(consumer) => self.push_consumer_created(subscriber_id, consumer),
            Err(WorldError::CapabilityMismatch { .. }) => {
                info!("Skipping producer {} for {}: capabilities do not match", producer_id, subscriber_id);
            }
            Err(e) if e.is_benign() => {
                debug!("Subscription {} -> {} abandoned: {}", producer_id, subscriber_id, e);
            }
            Err(e) => {
                warn!("Failed to subscribe {} to {}: {}", subscriber_id, producer_id, e);
                self.notify(
                    subscriber_id,
                    ServerMessage::Error { message: format!("Failed to consume producer {producer_id}: {e}") },
                );
            }
        }
    }

    /// Pushes `consumerCreated` only while the consumer is still registered.
    ///
    /// Check and send share one critical section, so a cascade that closes the
    /// consumer either queues its `producerRemoved` after this frame or suppresses it.
    pub(crate) fn push_consumer_created(&self, subscriber_id: &str, consumer: Consumer) {
        let registry = self.registry();
        let live = registry
            .consumer(&consumer.id)
            .is_some_and(|c| c.state != ConsumerState::Closed);
        if !live {
            debug!("Consumer {} closed before it was announced to {}", consumer.id, subscriber_id);
            return;
        }
        if let Some(participant) = registry.participant(subscriber_id) {
            send_outbound(
                &participant.sender,
                subscriber_id,
                &Outbound::push(ServerMessage::ConsumerCreated { consumer_params: consumer.params }),
            );
        }
    }

    /// Drives a claimed pair to a registered consumer.
    ///
    /// On failure the reservation is released so a later pass may retry it, except
    /// for a capability mismatch, which parks the pair as `Skipped` until it leaves
    /// the visible set.
    pub(crate) async fn subscribe_pair(
        &self,
        subscriber_id: &str,
        producer_id: &str,
        ticket: u64,
        rtp_capabilities: Value,
    ) -> WorldResult<Consumer> {
        let result = self.try_subscribe_pair(subscriber_id, producer_id, ticket, rtp_capabilities).await;
        match &result {
            Ok(_) => {}
            Err(WorldError::CapabilityMismatch { .. }) => {
                self.registry().skip(subscriber_id, producer_id, ticket);
            }
            Err(_) => {
                self.registry().release(subscriber_id, producer_id, Some(ticket));
            }
        }
        result
    }

    async fn try_subscribe_pair(
        &self,
        subscriber_id: &str,
        producer_id: &str,
        ticket: u64,
        rtp_capabilities: Value,
    ) -> WorldResult<Consumer> {
        if !self.facade().can_consume(producer_id, &rtp_capabilities) {
            self.metrics().inc_capability_mismatches();
            return Err(WorldError::CapabilityMismatch { producer_id: producer_id.to_string() });
        }

        let transport = self.ensure_transport(subscriber_id, TransportRole::Receive).await?;
        if !self.registry().advance_reservation(subscriber_id, producer_id, ticket, &transport.id) {
            return Err(WorldError::not_found("reservation", producer_id));
        }

        let handle = self.facade().consume(&transport.id, producer_id, rtp_capabilities).await?;
        let consumer = Consumer {
            id: handle.id,
            subscriber_id: subscriber_id.to_string(),
            producer_id: producer_id.to_string(),
            transport_id: transport.id,
            kind: handle.kind,
            state: ConsumerState::Pending,
            params: handle.params,
        };

        let committed = self.registry().commit_consumer(ticket, consumer.clone());
        if let Err(orphan) = committed {
            debug!("Consumer {} completed after its pair was cancelled, closing", orphan.id);
            self.facade().close(&orphan.id).await;
            return Err(WorldError::not_found("reservation", producer_id));
        }

        self.metrics().inc_consumers_created();
        debug!("Consumer {} created: {} -> {}", consumer.id, producer_id, subscriber_id);
        Ok(consumer)
    }

    /// Returns the participant's transport for `role`, creating it on first need.
    ///
    /// The only creation point for transports. Two racing callers may both create
    /// one; the loser closes its own and adopts the winner's. A receive transport
    /// created here is pushed to the client so it can connect it.
    pub(crate) async fn ensure_transport(&self, participant_id: &str, role: TransportRole) -> WorldResult<Transport> {
        {
            let registry = self.registry();
            if registry.participant(participant_id).is_none() {
                return Err(WorldError::not_found("participant", participant_id));
            }
            if let Some(existing) = registry.find_transport(participant_id, role) {
                return Ok(existing.clone());
            }
        }

        let handle = self.facade().create_transport(role).await?;
        let transport = Transport {
            id: handle.id,
            owner_id: participant_id.to_string(),
            role,
            params: handle.params,
        };

        let outcome = {
            let mut registry = self.registry();
            match registry.add_transport(transport.clone()) {
                Ok(()) => Ok(None),
                Err(WorldError::Duplicate { .. }) => registry
                    .find_transport(participant_id, role)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| WorldError::not_found("transport", &transport.id)),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(None) => {
                info!("Created {} transport {} for {}", role.as_str(), transport.id, participant_id);
                if role == TransportRole::Receive {
                    self.notify(
                        participant_id,
                        ServerMessage::TransportCreated { transport_params: transport.params.clone() },
                    );
                }
                Ok(transport)
            }
            Ok(Some(winner)) => {
                self.facade().close(&transport.id).await;
                Ok(winner)
            }
            Err(e) => {
                self.facade().close(&transport.id).await;
                Err(e)
            }
        }
    }

    /// Push-style hookup: everyone within range of a new producer's owner reconciles now
    pub async fn on_producer_created(&self, owner_id: &str) {
        let neighbours = {
            let registry = self.registry();
            proximity::neighbours(&registry, owner_id, self.config().proximity.enter)
        };
        join_all(neighbours.iter().map(|id| self.reconcile(id))).await;
    }

    /// Reconciles every participant, e.g. after positions moved
    pub async fn reconcile_all(&self) {
        let ids = self.registry().participant_ids();
        join_all(ids.iter().map(|id| self.reconcile(id))).await;
    }

    /// Closes a producer and every consumer of it, notifying each subscriber
    pub async fn close_producer(&self, producer_id: &str) {
        let removed = self.registry().remove_producer(producer_id);
        let Some((producer, consumers)) = removed else {
            return;
        };
        let consumer_ids: Vec<String> = consumers.iter().map(|c| c.id.clone()).collect();
        self.facade().close_all(&consumer_ids).await;
        self.facade().close(&producer.id).await;
        info!("Closed producer {} of {} ({} consumers)", producer.id, producer.owner_id, consumers.len());
        self.finish_cascade(&consumers);
        self.refill(&consumers, None).await;
    }

    /// Closes a transport with its producers or consumers and cancels pending consumes on it
    pub async fn close_transport(&self, transport_id: &str) {
        let removed = self.registry().remove_transport(transport_id);
        let Some((transport, producers, consumers)) = removed else {
            return;
        };
        let consumer_ids: Vec<String> = consumers.iter().map(|c| c.id.clone()).collect();
        self.facade().close_all(&consumer_ids).await;
        let producer_ids: Vec<String> = producers.iter().map(|p| p.id.clone()).collect();
        self.facade().close_all(&producer_ids).await;
        self.facade().close(&transport.id).await;
        info!(
            "Closed {} transport {} of {} ({} producers, {} consumers)",
            transport.role.as_str(),
            transport.id,
            transport.owner_id,
            producers.len(),
            consumers.len()
        );
        self.finish_cascade(&consumers);
        // the owner's own consumers went with its receive transport; everyone else may refill
        self.refill(&consumers, Some(&transport.owner_id)).await;
    }

    /// Reconciles every subscriber that lost consumers in a cascade, so slots freed
    /// under the consumer cap are handed to the next visible producer
    pub(crate) async fn refill(&self, consumers: &[Consumer], except: Option<&str>) {
        let mut subscribers: Vec<String> = consumers
            .iter()
            .map(|c| c.subscriber_id.clone())
            .filter(|id| Some(id.as_str()) != except)
            .collect();
        subscribers.sort();
        subscribers.dedup();
        join_all(subscribers.iter().map(|id| self.reconcile(id))).await;
    }

    pub(crate) fn finish_cascade(&self, consumers: &[Consumer]) {
        let mut told = HashSet::new();
        for consumer in consumers {
            self.metrics().inc_consumers_closed();
            if told.insert((consumer.subscriber_id.as_str(), consumer.producer_id.as_str())) {
                self.notify(
                    &consumer.subscriber_id,
                    ServerMessage::ProducerRemoved { producer_id: consumer.producer_id.clone() },
                );
            }
        }
    }
}
