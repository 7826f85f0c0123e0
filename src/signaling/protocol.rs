#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::media::{MediaKind, TransportRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest accepted display name, in characters
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Inbound frame: a client message plus the optional id its reply must echo
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Outbound frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Outbound {
    /// Unsolicited push
    pub fn push(message: ServerMessage) -> Self {
        Self { request_id: None, message }
    }

    pub fn reply(request_id: Option<u64>, message: ServerMessage) -> Self {
        Self { request_id, message }
    }
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter the world
    #[serde(rename_all = "camelCase")]
    Join {
        display_name: String,
    },
    UpdatePosition {
        x: f64,
        y: f64,
    },
    /// Get RTP capabilities from server
    GetRtpCapabilities,
    /// Device capabilities, enabling server-driven consumption
    #[serde(rename_all = "camelCase")]
    SetRtpCapabilities {
        rtp_capabilities: Value,
    },
    /// Get or create the transport for a direction
    CreateTransport {
        role: TransportRole,
    },
    /// Connect transport with DTLS parameters
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    /// Produce media (audio/video) on the send transport
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: Value,
    },
    /// Consume a visible producer
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        producer_id: String,
    },
}

impl ClientMessage {
    /// Boundary checks on payload values serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ClientMessage::Join { display_name } => {
                let chars = display_name.trim().chars().count();
                if chars == 0 || chars > MAX_DISPLAY_NAME_CHARS {
                    return Err(format!(
                        "displayName must be 1-{MAX_DISPLAY_NAME_CHARS} characters"
                    ));
                }
                Ok(())
            }
            ClientMessage::UpdatePosition { x, y } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err("position must be finite".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Greeting sent on accept, before any join
    #[serde(rename_all = "camelCase")]
    Connected {
        own_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Joined {
        own_id: String,
        rtp_capabilities: Value,
        participant: ParticipantInfo,
    },
    #[serde(rename_all = "camelCase")]
    RtpCapabilities {
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_params: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected {
        transport_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerCreated {
        producer_id: String,
        /// Whether any other participant is producing
        producers_exist: bool,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer_params: Value,
    },
    Ok,
    Error {
        message: String,
    },
    /// Periodic snapshot of every participant's position
    ParticipantsUpdate {
        participants: Vec<ParticipantInfo>,
    },
    /// Producers that came into range; the client answers with `consume`
    #[serde(rename_all = "camelCase")]
    NewlyVisible {
        producer_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ProducerRemoved {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused {
        producer_id: String,
    },
}

/// Participant as seen by other clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
}
