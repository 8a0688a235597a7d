// ============================
// crates/backend-lib/src/relay.rs
// ============================
//! Stateless signaling relay.
//!
//! Stamps sender id and timestamp onto offer/answer/ice-candidate
//! messages and fans them out on the meeting's broadcast channel,
//! without interpreting the payload. The channel is per meeting, so a
//! relayed message can never cross meeting boundaries; non-addressees
//! discard frames whose target does not match. Dispatch happens on the
//! sender's connection task, so messages from one sender stay in send
//! order while different senders proceed in parallel.
use crate::membership::MeetingHandle;
use crate::validation;
use chrono::Utc;
use huddle_common::{ServerEvent, SessionId, SignalKind};
use metrics::counter;
use serde_json::Value;
use tracing::debug;

/// Stamp and forward one negotiation message. Returns the forwarded
/// event as delivered to subscribers.
pub fn relay_signal(
    handle: &MeetingHandle,
    from_session_id: &SessionId,
    kind: SignalKind,
    target_session_id: Option<SessionId>,
    payload: Value,
) -> ServerEvent {
    let timestamp = Utc::now();
    let event = match kind {
        SignalKind::Offer => ServerEvent::Offer {
            from_session_id: from_session_id.clone(),
            target_session_id,
            payload,
            timestamp,
        },
        SignalKind::Answer => ServerEvent::Answer {
            from_session_id: from_session_id.clone(),
            target_session_id,
            payload,
            timestamp,
        },
        SignalKind::IceCandidate => ServerEvent::IceCandidate {
            from_session_id: from_session_id.clone(),
            target_session_id,
            payload,
            timestamp,
        },
    };

    debug!(
        from = %from_session_id,
        target = ?event.target_session(),
        kind = ?kind,
        "relaying signal"
    );
    counter!("relay.signals").increment(1);

    // Subscriber lag or zero receivers is not the sender's problem.
    let _ = handle.events_tx.send(event.clone());
    event
}

/// Relay a chat line to the whole meeting. Empty or over-long messages
/// are a validation error and are not forwarded.
pub fn relay_chat(
    handle: &MeetingHandle,
    sender_name: &str,
    message: &str,
    max_length: usize,
) -> Result<ServerEvent, crate::error::AppError> {
    let message = validation::validate_chat_message(message, max_length)?;

    let event = ServerEvent::Chat {
        sender_name: sender_name.to_string(),
        message,
        timestamp: Utc::now(),
    };
    counter!("relay.chat").increment(1);
    let _ = handle.events_tx.send(event.clone());
    Ok(event)
}
