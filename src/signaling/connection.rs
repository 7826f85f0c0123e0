#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, Inbound, Outbound, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::world::{send_outbound, World, WorldResult};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale, drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout: close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-connection token bucket, integer microsecond math
struct TokenBucket {
    tokens_us: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(now: Instant) -> Self {
        Self { tokens_us: MAX_TOKENS_US, last_refill: now }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        // Refill: RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);
        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// Serialize an outbound frame and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, participant_id: &str, request_id: Option<u64>, msg: ServerMessage) {
    send_outbound(sender, participant_id, &Outbound::reply(request_id, msg));
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    world: Arc<World>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let participant_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", participant_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Spawn task to send messages to client
    let participant_id_clone = participant_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for participant: {}", participant_id_clone);
    });

    send_json(&tx, &participant_id, None, ServerMessage::Connected {
        own_id: participant_id.clone(),
    });

    let mut bucket = TokenBucket::new(Instant::now());
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for participant {}", participant_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                if bucket.try_take(Instant::now()) {
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for participant {}", participant_id);
                        send_json(&tx, &participant_id, None, ServerMessage::Error {
                            message: format!("Rate limit exceeded: max {} messages/second", RATE_LIMIT_REFILL_RATE),
                        });
                    }
                    continue;
                }

                let inbound = match serde_json::from_str::<Inbound>(&text) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        metrics.inc_errors();
                        send_json(&tx, &participant_id, None, ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                        continue;
                    }
                };
                let request_id = inbound.request_id;

                if let Err(message) = inbound.message.validate() {
                    metrics.inc_errors();
                    send_json(&tx, &participant_id, request_id, ServerMessage::Error { message });
                    continue;
                }

                let start = Instant::now();
                let result = handle_client_message(&world, &participant_id, &tx, inbound.message).await;
                metrics.observe_message_handling(start.elapsed());

                match result {
                    Ok(reply) => {
                        if should_reply(request_id, &reply) {
                            send_json(&tx, &participant_id, request_id, reply);
                        }
                    }
                    Err(e) => {
                        if e.is_benign() {
                            debug!("Request from {} hit a closed entity: {}", participant_id, e);
                        } else {
                            error!("Error handling message from {}: {}", participant_id, e);
                        }
                        metrics.inc_errors();
                        // If channel is closed, send task has exited
                        if tx.is_closed() {
                            break;
                        }
                        send_json(&tx, &participant_id, request_id, ServerMessage::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", participant_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", participant_id);
            }
        }
    }

    // Cleanup wins over anything still in flight for this participant
    world.disconnect(&participant_id).await;

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for participant: {}", participant_id);
}

/// Plain acknowledgments are only worth a frame when the client asked for one
fn should_reply(request_id: Option<u64>, reply: &ServerMessage) -> bool {
    request_id.is_some() || !matches!(reply, ServerMessage::Ok)
}

/// Routes one validated client message into the world and builds the reply
async fn handle_client_message(
    world: &World,
    participant_id: &str,
    tx: &mpsc::Sender<Arc<String>>,
    message: ClientMessage,
) -> WorldResult<ServerMessage> {
    match message {
        ClientMessage::Join { display_name } => {
            let (rtp_capabilities, participant) = world.join(participant_id, &display_name, tx.clone())?;
            Ok(ServerMessage::Joined {
                own_id: participant_id.to_string(),
                rtp_capabilities,
                participant,
            })
        }

        ClientMessage::UpdatePosition { x, y } => {
            world.update_position(participant_id, x, y)?;
            Ok(ServerMessage::Ok)
        }

        ClientMessage::GetRtpCapabilities => Ok(ServerMessage::RtpCapabilities {
            rtp_capabilities: world.rtp_capabilities(),
        }),

        ClientMessage::SetRtpCapabilities { rtp_capabilities } => {
            world.set_rtp_capabilities(participant_id, rtp_capabilities)?;
            Ok(ServerMessage::Ok)
        }

        ClientMessage::CreateTransport { role } => {
            let transport_params = world.create_transport(participant_id, role).await?;
            Ok(ServerMessage::TransportCreated { transport_params })
        }

        ClientMessage::ConnectTransport { transport_id, dtls_parameters } => {
            world.connect_transport(participant_id, &transport_id, dtls_parameters).await?;
            Ok(ServerMessage::TransportConnected { transport_id })
        }

        ClientMessage::Produce { kind, rtp_parameters } => {
            let (producer_id, producers_exist) = world.produce(participant_id, kind, rtp_parameters).await?;
            Ok(ServerMessage::ProducerCreated { producer_id, producers_exist })
        }

        ClientMessage::Consume { producer_id, rtp_capabilities } => {
            let consumer_params = world.consume(participant_id, &producer_id, rtp_capabilities).await?;
            Ok(ServerMessage::ConsumerCreated { consumer_params })
        }

        ClientMessage::ResumeConsumer { consumer_id } => {
            let producer_id = world.resume_consumer(participant_id, &consumer_id).await?;
            Ok(ServerMessage::ConsumerResumed { producer_id })
        }

        ClientMessage::PauseConsumer { consumer_id } => {
            let producer_id = world.pause_consumer(participant_id, &consumer_id).await?;
            Ok(ServerMessage::ConsumerPaused { producer_id })
        }

        ClientMessage::CloseProducer { producer_id } => {
            world.close_own_producer(participant_id, &producer_id).await?;
            Ok(ServerMessage::Ok)
        }
    }
}
