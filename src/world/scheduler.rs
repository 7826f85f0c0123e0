#![forbid(unsafe_code)]

// Scheduler - debounced reconciliation and the periodic position broadcast.
//
// Both loops run on their own interval so position fan-out and subscription work
// never share a cadence.

use crate::signaling::protocol::{Outbound, ParticipantInfo, ServerMessage};
use crate::world::{send_raw, World};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

impl World {
    /// Runs one debounced pass: if anyone moved since the last pass, every
    /// participant is reconciled once. Returns whether a pass ran.
    pub async fn reconcile_dirty(&self) -> bool {
        let movers = self.take_dirty();
        if movers.is_empty() {
            return false;
        }
        // distance is symmetric, so a move changes the mover's set and everyone else's
        debug!("Reconciling after {} position changes", movers.len());
        self.reconcile_all().await;
        true
    }

    /// Snapshot of every participant's position, pushed to everyone
    pub fn broadcast_positions(&self) {
        let (participants, senders) = {
            let registry = self.registry();
            let participants: Vec<ParticipantInfo> = registry
                .participants()
                .map(|p| ParticipantInfo {
                    id: p.id.clone(),
                    name: p.display_name.clone(),
                    x: p.position.x,
                    y: p.position.y,
                })
                .collect();
            let senders: Vec<_> = registry
                .participants()
                .map(|p| (p.id.clone(), p.sender.clone()))
                .collect();
            (participants, senders)
        };
        if senders.is_empty() {
            return;
        }

        let frame = Outbound::push(ServerMessage::ParticipantsUpdate { participants });
        let json = match serde_json::to_string(&frame) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize participants update: {}", e);
                return;
            }
        };
        for (id, sender) in &senders {
            send_raw(sender, id, json.clone());
        }
    }
}

/// Reconciles dirty participants every `period`
pub fn spawn_reconcile_loop(world: Arc<World>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            world.reconcile_dirty().await;
        }
    })
}

/// Broadcasts `participantsUpdate` every `period`
pub fn spawn_broadcast_loop(world: Arc<World>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            world.broadcast_positions();
        }
    })
}
