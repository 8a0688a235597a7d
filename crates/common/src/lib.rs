// ================
// crates/common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between Huddle clients and the server.
//! This module defines the WebSocket protocol messages and supporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ephemeral transport session identifier, distinct from human identity.
/// Assigned by the server when a WebSocket connection is accepted.
pub type SessionId = String;

/// Mint a fresh session id for a newly accepted connection.
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

/// Meeting code type (uppercase alphanumeric, 6-10 characters)
pub type MeetingCode = String;

/// One participant as seen by every meeting member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Session id keying this participant
    pub session_id: SessionId,
    /// Display name
    pub name: String,
    /// Whether this participant created the meeting
    pub is_host: bool,
    /// Microphone muted
    pub is_muted: bool,
    /// Camera enabled
    pub camera_enabled: bool,
}

/// The authoritative roster of non-left participants, returned by
/// membership operations and carried on roster broadcasts.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RosterSnapshot {
    pub participants: Vec<ParticipantInfo>,
    pub participant_count: usize,
}

impl RosterSnapshot {
    pub fn new(participants: Vec<ParticipantInfo>) -> Self {
        let participant_count = participants.len();
        Self {
            participants,
            participant_count,
        }
    }

    /// Look up a roster entry by session id.
    pub fn get(&self, session_id: &str) -> Option<&ParticipantInfo> {
        self.participants
            .iter()
            .find(|p| p.session_id == session_id)
    }
}

/// Kind of a relayed negotiation message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Messages sent from client to server on a meeting's inbound address.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join the meeting this connection is scoped to
    Join {
        #[serde(rename = "participantName")]
        participant_name: String,
    },
    /// Leave the meeting (also implied by socket close)
    Leave,
    /// Connection-negotiation offer toward one counterpart
    Offer {
        #[serde(rename = "targetSessionId")]
        target_session_id: Option<SessionId>,
        payload: Value,
    },
    /// Answer to a previously received offer
    Answer {
        #[serde(rename = "targetSessionId")]
        target_session_id: Option<SessionId>,
        payload: Value,
    },
    /// One network-reachability candidate
    IceCandidate {
        #[serde(rename = "targetSessionId")]
        target_session_id: Option<SessionId>,
        payload: Value,
    },
    /// Partial media-state update; unspecified fields stay unchanged
    MediaState {
        #[serde(rename = "isMuted")]
        is_muted: Option<bool>,
        #[serde(rename = "cameraEnabled")]
        camera_enabled: Option<bool>,
    },
    /// In-meeting chat line
    Chat { message: String },
}

/// Events fanned out on a meeting's broadcast topics, plus per-connection
/// acks and errors.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First frame on every accepted connection: tells the client its
    /// server-assigned session id.
    Welcome {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// Roster delta: someone joined
    ParticipantJoined {
        participant: ParticipantInfo,
        participants: Vec<ParticipantInfo>,
        #[serde(rename = "participantCount")]
        participant_count: usize,
        timestamp: DateTime<Utc>,
    },
    /// Roster delta: someone left
    ParticipantLeft {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        participants: Vec<ParticipantInfo>,
        #[serde(rename = "participantCount")]
        participant_count: usize,
        timestamp: DateTime<Utc>,
    },
    /// Relayed offer, stamped with sender and time
    Offer {
        #[serde(rename = "fromSessionId")]
        from_session_id: SessionId,
        #[serde(rename = "targetSessionId")]
        target_session_id: Option<SessionId>,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    /// Relayed answer
    Answer {
        #[serde(rename = "fromSessionId")]
        from_session_id: SessionId,
        #[serde(rename = "targetSessionId")]
        target_session_id: Option<SessionId>,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    /// Relayed ICE candidate
    IceCandidate {
        #[serde(rename = "fromSessionId")]
        from_session_id: SessionId,
        #[serde(rename = "targetSessionId")]
        target_session_id: Option<SessionId>,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    /// A participant changed mute/camera state
    MediaStateChanged {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "participantName")]
        participant_name: String,
        #[serde(rename = "isMuted")]
        is_muted: Option<bool>,
        #[serde(rename = "cameraEnabled")]
        camera_enabled: Option<bool>,
        timestamp: DateTime<Utc>,
    },
    /// Control event: the creator ended the meeting
    MeetingEnded {
        #[serde(rename = "endedBy")]
        ended_by: String,
        timestamp: DateTime<Utc>,
    },
    /// Chat line relayed to the meeting
    Chat {
        #[serde(rename = "senderName")]
        sender_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Out-of-band error channel; sent only to the offending
    /// connection, never broadcast, never closes the socket
    Error { code: String, message: String },
}

impl ServerEvent {
    /// Sender session for signaling events, if any.
    pub fn from_session(&self) -> Option<&SessionId> {
        match self {
            ServerEvent::Offer {
                from_session_id, ..
            }
            | ServerEvent::Answer {
                from_session_id, ..
            }
            | ServerEvent::IceCandidate {
                from_session_id, ..
            } => Some(from_session_id),
            _ => None,
        }
    }

    /// Target session for signaling events. `None` means either a
    /// broadcast signal or a non-signaling event.
    pub fn target_session(&self) -> Option<&SessionId> {
        match self {
            ServerEvent::Offer {
                target_session_id, ..
            }
            | ServerEvent::Answer {
                target_session_id, ..
            }
            | ServerEvent::IceCandidate {
                target_session_id, ..
            } => target_session_id.as_ref(),
            _ => None,
        }
    }
}
