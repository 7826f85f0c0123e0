#![forbid(unsafe_code)]

// Registry - authoritative in-memory store of participants and their media entities.
//
// Plain data: every method takes &self/&mut self and never awaits. `World` keeps the
// single instance behind one mutex, which is what makes each method atomic with
// respect to concurrent connection tasks.

use crate::media::{MediaKind, TransportRole};
use crate::world::{WorldError, WorldResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// (subscriber id, producer id)
pub type PairKey = (String, String);

/// Position in the shared 2D world
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A connected, joined client
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub position: Position,
    /// Device RTP capabilities, learned from the client's first consume request
    pub rtp_capabilities: Option<Value>,
    pub sender: mpsc::Sender<Arc<String>>,
    pub transports: HashSet<String>,
    pub producers: HashSet<String>,
    pub consumers: HashSet<String>,
}

impl Participant {
    pub fn new(id: String, display_name: String, position: Position, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            display_name,
            position,
            rtp_capabilities: None,
            sender,
            transports: HashSet::new(),
            producers: HashSet::new(),
            consumers: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    pub id: String,
    pub owner_id: String,
    pub role: TransportRole,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub owner_id: String,
    pub kind: MediaKind,
    pub transport_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created paused, waiting for the client to resume it
    Pending,
    Active,
    Paused,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub subscriber_id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub state: ConsumerState,
    pub params: Value,
}

/// In-flight stage of a (subscriber, producer) pair that has no Consumer yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Told the client the producer is visible; waiting for its consume request
    Announced,
    PendingTransport,
    PendingConsumer,
    /// `canConsume` said no; not retried until the pair leaves the visible set
    Skipped,
}

impl PairState {
    /// A provider call is in flight for the pair
    pub fn is_pending(&self) -> bool {
        matches!(self, PairState::PendingTransport | PairState::PendingConsumer)
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub ticket: u64,
    pub state: PairState,
    pub transport_id: Option<String>,
}

/// Everything a participant removal took out of the registry
#[derive(Debug, Default)]
pub struct Removal {
    pub participant: Option<Participant>,
    pub transports: Vec<Transport>,
    pub producers: Vec<Producer>,
    /// Consumers closed anywhere in the system, both owned and subscribed to the removed producers
    pub consumers: Vec<Consumer>,
}

impl Removal {
    /// (subscriber, producer) pairs whose subscriber is still present and must be told
    pub fn dropped_subscriptions(&self) -> impl Iterator<Item = &Consumer> {
        let gone = self.participant.as_ref().map(|p| p.id.as_str());
        self.consumers
            .iter()
            .filter(move |c| Some(c.subscriber_id.as_str()) != gone)
    }
}

#[derive(Default)]
pub struct Registry {
    participants: HashMap<String, Participant>,
    transports: HashMap<String, Transport>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    pairs: HashMap<PairKey, String>,
    reservations: HashMap<PairKey, Reservation>,
    next_ticket: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- participants ---

    /// Returns false (and changes nothing) when the id is already present
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.participants.contains_key(&participant.id) {
            return false;
        }
        self.participants.insert(participant.id.clone(), participant);
        true
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.keys().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn set_position(&mut self, id: &str, position: Position) -> WorldResult<()> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| WorldError::not_found("participant", id))?;
        participant.position = position;
        Ok(())
    }

    /// Removes a participant and everything that references it.
    ///
    /// Closes its transports, its producers (and every consumer of them, wherever
    /// the subscriber is), its own consumers, and drops every reservation it is
    /// part of. Removing an unknown id is a no-op.
    pub fn remove_participant(&mut self, id: &str) -> Removal {
        let Some(participant) = self.participants.remove(id) else {
            return Removal::default();
        };
        let mut removal = Removal::default();

        for producer_id in &participant.producers {
            if let Some((producer, consumers)) = self.take_producer(producer_id) {
                removal.producers.push(producer);
                removal.consumers.extend(consumers);
            }
        }
        for consumer_id in &participant.consumers {
            if let Some(consumer) = self.take_consumer(consumer_id) {
                removal.consumers.push(consumer);
            }
        }
        for transport_id in &participant.transports {
            if let Some(transport) = self.transports.remove(transport_id) {
                removal.transports.push(transport);
            }
        }

        let owned: HashSet<&String> = participant.producers.iter().collect();
        self.reservations
            .retain(|(subscriber, producer), _| subscriber != id && !owned.contains(producer));

        removal.participant = Some(participant);
        removal
    }

    // --- transports ---

    /// Registers a transport; each participant holds at most one per role
    pub fn add_transport(&mut self, transport: Transport) -> WorldResult<()> {
        if let Some(existing) = self.find_transport(&transport.owner_id, transport.role) {
            return Err(WorldError::Duplicate {
                kind: "transport",
                id: existing.id.clone(),
            });
        }
        let owner = self
            .participants
            .get_mut(&transport.owner_id)
            .ok_or_else(|| WorldError::not_found("participant", &transport.owner_id))?;
        owner.transports.insert(transport.id.clone());
        self.transports.insert(transport.id.clone(), transport);
        Ok(())
    }

    pub fn transport(&self, id: &str) -> Option<&Transport> {
        self.transports.get(id)
    }

    pub fn find_transport(&self, owner_id: &str, role: TransportRole) -> Option<&Transport> {
        let owner = self.participants.get(owner_id)?;
        owner
            .transports
            .iter()
            .filter_map(|id| self.transports.get(id))
            .find(|t| t.role == role)
    }

    pub fn find_send_transport(&self, owner_id: &str) -> Option<&Transport> {
        self.find_transport(owner_id, TransportRole::Send)
    }

    pub fn find_receive_transport(&self, owner_id: &str) -> Option<&Transport> {
        self.find_transport(owner_id, TransportRole::Receive)
    }

    /// Removes a transport with everything riding on it: producers (and their
    /// consumers) for a send transport, consumers and in-flight consume
    /// reservations for a receive transport.
    pub fn remove_transport(&mut self, id: &str) -> Option<(Transport, Vec<Producer>, Vec<Consumer>)> {
        let transport = self.transports.remove(id)?;
        if let Some(owner) = self.participants.get_mut(&transport.owner_id) {
            owner.transports.remove(id);
        }

        let mut producers = Vec::new();
        let mut consumers = Vec::new();

        let producer_ids: Vec<String> = self
            .producers
            .values()
            .filter(|p| p.transport_id == id)
            .map(|p| p.id.clone())
            .collect();
        for producer_id in producer_ids {
            if let Some((producer, cascaded)) = self.take_producer(&producer_id) {
                producers.push(producer);
                consumers.extend(cascaded);
            }
        }

        let consumer_ids: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumer_ids {
            if let Some(consumer) = self.take_consumer(&consumer_id) {
                consumers.push(consumer);
            }
        }

        self.reservations
            .retain(|_, r| r.transport_id.as_deref() != Some(id));

        Some((transport, producers, consumers))
    }

    // --- producers ---

    pub fn add_producer(&mut self, producer: Producer) -> WorldResult<()> {
        if !self.transports.contains_key(&producer.transport_id) {
            return Err(WorldError::not_found("transport", &producer.transport_id));
        }
        let owner = self
            .participants
            .get_mut(&producer.owner_id)
            .ok_or_else(|| WorldError::not_found("participant", &producer.owner_id))?;
        owner.producers.insert(producer.id.clone());
        self.producers.insert(producer.id.clone(), producer);
        Ok(())
    }

    pub fn producer(&self, id: &str) -> Option<&Producer> {
        self.producers.get(id)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Every producer not owned by `owner_id`
    pub fn list_producers(&self, excluding_owner: &str) -> Vec<&Producer> {
        self.producers
            .values()
            .filter(|p| p.owner_id != excluding_owner)
            .collect()
    }

    /// Removes a producer and closes every consumer referencing it
    pub fn remove_producer(&mut self, id: &str) -> Option<(Producer, Vec<Consumer>)> {
        self.take_producer(id)
    }

    fn take_producer(&mut self, id: &str) -> Option<(Producer, Vec<Consumer>)> {
        let producer = self.producers.remove(id)?;
        if let Some(owner) = self.participants.get_mut(&producer.owner_id) {
            owner.producers.remove(id);
        }

        let consumer_ids: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.producer_id == id)
            .map(|c| c.id.clone())
            .collect();
        let consumers = consumer_ids
            .iter()
            .filter_map(|cid| self.take_consumer(cid))
            .collect();

        self.reservations.retain(|(_, producer), _| producer != id);
        Some((producer, consumers))
    }

    // --- consumers ---

    /// Registers a consumer; at most one per (subscriber, producer) pair
    pub fn add_consumer(&mut self, consumer: Consumer) -> WorldResult<()> {
        let key = (consumer.subscriber_id.clone(), consumer.producer_id.clone());
        if let Some(existing) = self.pairs.get(&key) {
            return Err(WorldError::Duplicate {
                kind: "consumer",
                id: existing.clone(),
            });
        }
        if !self.producers.contains_key(&consumer.producer_id) {
            return Err(WorldError::not_found("producer", &consumer.producer_id));
        }
        if !self.transports.contains_key(&consumer.transport_id) {
            return Err(WorldError::not_found("transport", &consumer.transport_id));
        }
        let subscriber = self
            .participants
            .get_mut(&consumer.subscriber_id)
            .ok_or_else(|| WorldError::not_found("participant", &consumer.subscriber_id))?;
        subscriber.consumers.insert(consumer.id.clone());
        self.pairs.insert(key, consumer.id.clone());
        self.consumers.insert(consumer.id.clone(), consumer);
        Ok(())
    }

    pub fn consumer(&self, id: &str) -> Option<&Consumer> {
        self.consumers.get(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn set_consumer_state(&mut self, id: &str, state: ConsumerState) -> WorldResult<()> {
        let consumer = self
            .consumers
            .get_mut(id)
            .ok_or_else(|| WorldError::not_found("consumer", id))?;
        consumer.state = state;
        Ok(())
    }

    pub fn find_consumer(&self, subscriber_id: &str, producer_id: &str) -> Option<&Consumer> {
        let key = (subscriber_id.to_string(), producer_id.to_string());
        self.pairs.get(&key).and_then(|id| self.consumers.get(id))
    }

    pub fn consumers_of(&self, subscriber_id: &str) -> Vec<&Consumer> {
        self.participants
            .get(subscriber_id)
            .map(|p| p.consumers.iter().filter_map(|id| self.consumers.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn remove_consumer(&mut self, id: &str) -> Option<Consumer> {
        self.take_consumer(id)
    }

    fn take_consumer(&mut self, id: &str) -> Option<Consumer> {
        let mut consumer = self.consumers.remove(id)?;
        if let Some(subscriber) = self.participants.get_mut(&consumer.subscriber_id) {
            subscriber.consumers.remove(id);
        }
        self.pairs
            .remove(&(consumer.subscriber_id.clone(), consumer.producer_id.clone()));
        consumer.state = ConsumerState::Closed;
        Some(consumer)
    }

    // --- pair reservations ---

    /// Claims a pair for a new consumer. Returns `None` when the pair already has a
    /// consumer or an in-flight reservation, or either side is gone.
    pub fn reserve(&mut self, subscriber_id: &str, producer_id: &str, state: PairState) -> Option<u64> {
        let key = (subscriber_id.to_string(), producer_id.to_string());
        if self.pairs.contains_key(&key) || self.reservations.contains_key(&key) {
            return None;
        }
        if !self.participants.contains_key(subscriber_id) || !self.producers.contains_key(producer_id) {
            return None;
        }
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.reservations.insert(
            key,
            Reservation {
                ticket,
                state,
                transport_id: None,
            },
        );
        Some(ticket)
    }

    /// Turns an `Announced` or `Skipped` reservation into a fresh `PendingTransport` one
    pub fn claim(&mut self, subscriber_id: &str, producer_id: &str) -> Option<u64> {
        let key = (subscriber_id.to_string(), producer_id.to_string());
        let reservation = self.reservations.get_mut(&key)?;
        if reservation.state.is_pending() {
            return None;
        }
        self.next_ticket += 1;
        reservation.ticket = self.next_ticket;
        reservation.state = PairState::PendingTransport;
        Some(reservation.ticket)
    }

    pub fn reservation(&self, subscriber_id: &str, producer_id: &str) -> Option<&Reservation> {
        self.reservations
            .get(&(subscriber_id.to_string(), producer_id.to_string()))
    }

    /// Reservations held by a subscriber, by producer id
    pub fn reservations_of(&self, subscriber_id: &str) -> Vec<(String, Reservation)> {
        self.reservations
            .iter()
            .filter(|((subscriber, _), _)| subscriber == subscriber_id)
            .map(|((_, producer), r)| (producer.clone(), r.clone()))
            .collect()
    }

    /// Moves a reservation to `PendingConsumer` on the given receive transport.
    /// False when the ticket is no longer current (cancelled meanwhile).
    pub fn advance_reservation(&mut self, subscriber_id: &str, producer_id: &str, ticket: u64, transport_id: &str) -> bool {
        let key = (subscriber_id.to_string(), producer_id.to_string());
        if !self.transports.contains_key(transport_id) {
            return false;
        }
        match self.reservations.get_mut(&key) {
            Some(r) if r.ticket == ticket => {
                r.state = PairState::PendingConsumer;
                r.transport_id = Some(transport_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drops a reservation if `ticket` still owns it (or unconditionally for `None`)
    pub fn release(&mut self, subscriber_id: &str, producer_id: &str, ticket: Option<u64>) -> bool {
        let key = (subscriber_id.to_string(), producer_id.to_string());
        match self.reservations.get(&key) {
            Some(r) if ticket.map_or(true, |t| t == r.ticket) => {
                self.reservations.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Parks a reservation as `Skipped` if `ticket` still owns it
    pub fn skip(&mut self, subscriber_id: &str, producer_id: &str, ticket: u64) -> bool {
        let key = (subscriber_id.to_string(), producer_id.to_string());
        match self.reservations.get_mut(&key) {
            Some(r) if r.ticket == ticket => {
                r.state = PairState::Skipped;
                r.transport_id = None;
                true
            }
            _ => false,
        }
    }

    /// Consumers plus in-flight reservations held by a subscriber
    pub fn subscription_load(&self, subscriber_id: &str) -> usize {
        let consumers = self
            .participants
            .get(subscriber_id)
            .map_or(0, |p| p.consumers.len());
        let pending = self
            .reservations
            .iter()
            .filter(|((subscriber, _), r)| subscriber == subscriber_id && r.state.is_pending())
            .count();
        consumers + pending
    }

    /// Registers the consumer produced by a reservation, consuming the reservation.
    ///
    /// Hands the consumer back when the reservation was cancelled in the meantime
    /// (subscriber left, producer closed, transport closed, proximity lost); the
    /// caller must then close it at the provider.
    pub fn commit_consumer(&mut self, ticket: u64, consumer: Consumer) -> Result<(), Consumer> {
        let key = (consumer.subscriber_id.clone(), consumer.producer_id.clone());
        let current = matches!(
            self.reservations.get(&key),
            Some(r) if r.ticket == ticket && r.transport_id.as_deref() == Some(consumer.transport_id.as_str())
        );
        if !current {
            return Err(consumer);
        }
        self.reservations.remove(&key);
        match self.add_consumer(consumer.clone()) {
            Ok(()) => Ok(()),
            Err(_) => Err(consumer),
        }
    }

    /// True when no entity anywhere references `participant_id`
    pub fn is_unreferenced(&self, participant_id: &str) -> bool {
        !self.participants.contains_key(participant_id)
            && self.transports.values().all(|t| t.owner_id != participant_id)
            && self.producers.values().all(|p| p.owner_id != participant_id)
            && self.consumers.values().all(|c| c.subscriber_id != participant_id)
            && self.reservations.keys().all(|(s, _)| s != participant_id)
    }

    /// Non-closed consumers per (subscriber, producer) pair, for invariant checks
    pub fn pair_counts(&self) -> HashMap<PairKey, usize> {
        let mut counts = HashMap::new();
        for consumer in self.consumers.values() {
            if consumer.state != ConsumerState::Closed {
                *counts
                    .entry((consumer.subscriber_id.clone(), consumer.producer_id.clone()))
                    .or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn participant(id: &str, x: f64, y: f64) -> Participant {
        let (tx, _rx) = mpsc::channel(8);
        Participant::new(id.to_string(), id.to_uppercase(), Position::new(x, y), tx)
    }

    fn transport(id: &str, owner: &str, role: TransportRole) -> Transport {
        Transport {
            id: id.to_string(),
            owner_id: owner.to_string(),
            role,
            params: json!({}),
        }
    }

    fn producer(id: &str, owner: &str, transport_id: &str) -> Producer {
        Producer {
            id: id.to_string(),
            owner_id: owner.to_string(),
            kind: MediaKind::Audio,
            transport_id: transport_id.to_string(),
        }
    }

    fn consumer(id: &str, subscriber: &str, producer_id: &str, transport_id: &str) -> Consumer {
        Consumer {
            id: id.to_string(),
            subscriber_id: subscriber.to_string(),
            producer_id: producer_id.to_string(),
            transport_id: transport_id.to_string(),
            kind: MediaKind::Audio,
            state: ConsumerState::Pending,
            params: json!({}),
        }
    }

    /// a and b each send one producer and consume the other's
    fn two_way() -> Registry {
        let mut r = Registry::new();
        r.add_participant(participant("a", 0.0, 0.0));
        r.add_participant(participant("b", 5.0, 5.0));
        r.add_transport(transport("ta-send", "a", TransportRole::Send)).unwrap();
        r.add_transport(transport("ta-recv", "a", TransportRole::Receive)).unwrap();
        r.add_transport(transport("tb-send", "b", TransportRole::Send)).unwrap();
        r.add_transport(transport("tb-recv", "b", TransportRole::Receive)).unwrap();
        r.add_producer(producer("pa", "a", "ta-send")).unwrap();
        r.add_producer(producer("pb", "b", "tb-send")).unwrap();
        r.add_consumer(consumer("ca", "a", "pb", "ta-recv")).unwrap();
        r.add_consumer(consumer("cb", "b", "pa", "tb-recv")).unwrap();
        r
    }

    #[test]
    fn test_add_participant_is_idempotent() {
        let mut r = Registry::new();
        assert!(r.add_participant(participant("a", 0.0, 0.0)));
        assert!(!r.add_participant(participant("a", 9.0, 9.0)));
        assert_eq!(r.participant_count(), 1);
        assert_eq!(r.participant("a").unwrap().position, Position::new(0.0, 0.0));
    }

    #[test]
    fn test_one_transport_per_role() {
        let mut r = Registry::new();
        r.add_participant(participant("a", 0.0, 0.0));
        r.add_transport(transport("t1", "a", TransportRole::Receive)).unwrap();
        let err = r.add_transport(transport("t2", "a", TransportRole::Receive)).unwrap_err();
        assert!(matches!(err, WorldError::Duplicate { id, .. } if id == "t1"));
        r.add_transport(transport("t3", "a", TransportRole::Send)).unwrap();
        assert_eq!(r.find_receive_transport("a").unwrap().id, "t1");
        assert_eq!(r.find_send_transport("a").unwrap().id, "t3");
    }

    #[test]
    fn test_duplicate_consumer_rejected() {
        let mut r = two_way();
        let err = r.add_consumer(consumer("ca2", "a", "pb", "ta-recv")).unwrap_err();
        assert!(matches!(err, WorldError::Duplicate { .. }));
        assert_eq!(r.find_consumer("a", "pb").unwrap().id, "ca");
    }

    #[test]
    fn test_list_producers_excludes_owner() {
        let r = two_way();
        let listed: Vec<&str> = r.list_producers("a").iter().map(|p| p.id.as_str()).collect();
        assert_eq!(listed, vec!["pb"]);
    }

    #[test]
    fn test_remove_participant_cascades() {
        let mut r = two_way();
        let removal = r.remove_participant("a");

        assert_eq!(removal.transports.len(), 2);
        assert_eq!(removal.producers.len(), 1);
        let mut closed: Vec<&str> = removal.consumers.iter().map(|c| c.id.as_str()).collect();
        closed.sort();
        assert_eq!(closed, vec!["ca", "cb"]);
        assert!(removal.consumers.iter().all(|c| c.state == ConsumerState::Closed));

        let notified: Vec<(&str, &str)> = removal
            .dropped_subscriptions()
            .map(|c| (c.subscriber_id.as_str(), c.producer_id.as_str()))
            .collect();
        assert_eq!(notified, vec![("b", "pa")]);

        assert!(r.is_unreferenced("a"));
        assert!(r.participant("b").unwrap().consumers.is_empty());
        assert!(r.producer("pb").is_some());
    }

    #[test]
    fn test_remove_unknown_participant_is_noop() {
        let mut r = two_way();
        let removal = r.remove_participant("nobody");
        assert!(removal.participant.is_none());
        assert_eq!(r.participant_count(), 2);
        assert_eq!(r.consumer_count(), 2);
    }

    #[test]
    fn test_remove_receive_transport_closes_consumers_and_reservations() {
        let mut r = two_way();
        r.add_participant(participant("c", 1.0, 1.0));
        r.add_transport(transport("tc-send", "c", TransportRole::Send)).unwrap();
        r.add_producer(producer("pc", "c", "tc-send")).unwrap();
        let ticket = r.reserve("a", "pc", PairState::PendingTransport).unwrap();
        assert!(r.advance_reservation("a", "pc", ticket, "ta-recv"));

        let (_, producers, consumers) = r.remove_transport("ta-recv").unwrap();
        assert!(producers.is_empty());
        assert_eq!(consumers.len(), 1);
        assert!(r.reservation("a", "pc").is_none());
        assert!(r.find_consumer("a", "pb").is_none());
    }

    #[test]
    fn test_reservation_blocks_second_claim() {
        let mut r = two_way();
        r.add_participant(participant("c", 1.0, 1.0));
        r.add_transport(transport("tc-send", "c", TransportRole::Send)).unwrap();
        r.add_producer(producer("pc", "c", "tc-send")).unwrap();

        let ticket = r.reserve("a", "pc", PairState::PendingTransport);
        assert!(ticket.is_some());
        assert!(r.reserve("a", "pc", PairState::PendingTransport).is_none());
        // already consuming
        assert!(r.reserve("a", "pb", PairState::PendingTransport).is_none());
        // unknown producer
        assert!(r.reserve("a", "missing", PairState::PendingTransport).is_none());
    }

    #[test]
    fn test_commit_after_cancellation_hands_consumer_back() {
        let mut r = two_way();
        r.add_participant(participant("c", 1.0, 1.0));
        r.add_transport(transport("tc-send", "c", TransportRole::Send)).unwrap();
        r.add_producer(producer("pc", "c", "tc-send")).unwrap();

        let ticket = r.reserve("a", "pc", PairState::PendingTransport).unwrap();
        assert!(r.advance_reservation("a", "pc", ticket, "ta-recv"));
        r.remove_participant("a");

        let rejected = r.commit_consumer(ticket, consumer("late", "a", "pc", "ta-recv"));
        assert_eq!(rejected.unwrap_err().id, "late");
        assert!(r.consumer("late").is_none());
    }

    #[test]
    fn test_stale_ticket_cannot_commit() {
        let mut r = two_way();
        r.add_participant(participant("c", 1.0, 1.0));
        r.add_transport(transport("tc-send", "c", TransportRole::Send)).unwrap();
        r.add_producer(producer("pc", "c", "tc-send")).unwrap();

        let first = r.reserve("a", "pc", PairState::PendingTransport).unwrap();
        assert!(r.release("a", "pc", Some(first)));
        let second = r.reserve("a", "pc", PairState::PendingTransport).unwrap();
        assert!(r.advance_reservation("a", "pc", second, "ta-recv"));

        assert!(!r.release("a", "pc", Some(first)));
        assert!(r.commit_consumer(first, consumer("old", "a", "pc", "ta-recv")).is_err());
        assert!(r.commit_consumer(second, consumer("new", "a", "pc", "ta-recv")).is_ok());
        assert_eq!(r.find_consumer("a", "pc").unwrap().id, "new");
    }

    #[test]
    fn test_claim_skipped_and_load() {
        let mut r = two_way();
        r.add_participant(participant("c", 1.0, 1.0));
        r.add_transport(transport("tc-send", "c", TransportRole::Send)).unwrap();
        r.add_producer(producer("pc", "c", "tc-send")).unwrap();

        let ticket = r.reserve("a", "pc", PairState::PendingTransport).unwrap();
        assert_eq!(r.subscription_load("a"), 2);
        assert!(r.skip("a", "pc", ticket));
        assert_eq!(r.subscription_load("a"), 1);
        assert!(r.reserve("a", "pc", PairState::PendingTransport).is_none());
        assert!(r.claim("a", "pc").is_some());
        assert_eq!(r.subscription_load("a"), 2);
    }

    #[test]
    fn test_claim_announced() {
        let mut r = two_way();
        r.add_participant(participant("c", 1.0, 1.0));
        r.add_transport(transport("tc-send", "c", TransportRole::Send)).unwrap();
        r.add_producer(producer("pc", "c", "tc-send")).unwrap();

        let announced = r.reserve("a", "pc", PairState::Announced).unwrap();
        let claimed = r.claim("a", "pc").unwrap();
        assert_ne!(announced, claimed);
        assert_eq!(r.reservation("a", "pc").unwrap().state, PairState::PendingTransport);
        assert!(r.claim("a", "pc").is_none());
    }

    #[test]
    fn test_remove_producer_cascades_to_consumers() {
        let mut r = two_way();
        let (producer, consumers) = r.remove_producer("pb").unwrap();
        assert_eq!(producer.owner_id, "b");
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].subscriber_id, "a");
        assert!(r.participant("b").unwrap().producers.is_empty());
        assert!(r.remove_producer("pb").is_none());
    }
}
