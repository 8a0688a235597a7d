// ============================
// crates/backend-lib/src/meeting.rs
// ============================
//! Meeting domain model, code generation and actor coordination.
use crate::membership::{spawn_membership_actor, MeetingHandle};
use crate::store::{MeetingStore, ParticipantStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_common::{MeetingCode, ParticipantInfo, SessionId};
use metrics::{counter, gauge};
use rand::Rng;
use std::sync::Arc;

const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_CODE_ATTEMPTS: usize = 10;

/// A meeting room. Once `ended_at` is set the meeting is immutable and
/// no longer joinable.
#[derive(Debug, Clone)]
pub struct Meeting {
    pub code: MeetingCode,
    pub created_by: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Meeting {
    pub fn new(code: MeetingCode, created_by: String, title: Option<String>) -> Self {
        Self {
            code,
            created_by,
            title,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// A meeting is active until its creator ends it.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// One participant-session in a meeting. Soft-deleted by setting
/// `left_at`; the field is never cleared once set.
#[derive(Debug, Clone)]
pub struct Participant {
    pub session_id: SessionId,
    pub meeting_code: MeetingCode,
    pub name: String,
    pub is_host: bool,
    pub is_muted: bool,
    pub camera_enabled: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn to_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            session_id: self.session_id.clone(),
            name: self.name.clone(),
            is_host: self.is_host,
            is_muted: self.is_muted,
            camera_enabled: self.camera_enabled,
        }
    }
}

/// Generate a random uppercase alphanumeric meeting code.
pub fn generate_code(length: usize) -> MeetingCode {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Generate a code that is not already taken in the store. After too
/// many collisions the code is lengthened by two characters, matching
/// the behavior users already rely on for short codes.
pub async fn generate_unique_code(
    store: &dyn MeetingStore,
    length: usize,
) -> Result<MeetingCode, crate::error::AppError> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = generate_code(length);
        if store.get_by_code(&code).await?.is_none() {
            return Ok(code);
        }
    }
    Ok(generate_code(length + 2))
}

/// Manager for all meetings with a live actor
pub struct MeetingManager {
    meetings: DashMap<MeetingCode, MeetingHandle>,
    meeting_store: Arc<dyn MeetingStore>,
    participant_store: Arc<dyn ParticipantStore>,
    broadcast_capacity: usize,
}

impl MeetingManager {
    pub fn new(
        meeting_store: Arc<dyn MeetingStore>,
        participant_store: Arc<dyn ParticipantStore>,
        broadcast_capacity: usize,
    ) -> Self {
        MeetingManager {
            meetings: DashMap::new(),
            meeting_store,
            participant_store,
            broadcast_capacity,
        }
    }

    /// Get the handle for a meeting, spawning its actor on first use.
    pub fn get_or_spawn(&self, code: &str) -> MeetingHandle {
        if let Some(handle) = self.meetings.get(code) {
            return handle.value().clone();
        }

        let handle = spawn_membership_actor(
            code.to_string(),
            self.meeting_store.clone(),
            self.participant_store.clone(),
            self.broadcast_capacity,
        );
        self.meetings.insert(code.to_string(), handle.clone());

        counter!("meeting.actor.spawned").increment(1);
        gauge!("meeting.actor.active").set(self.meetings.len() as f64);

        handle
    }

    /// Drop a meeting's actor handle (after the meeting ends).
    pub fn remove(&self, code: &str) {
        if self.meetings.remove(code).is_some() {
            counter!("meeting.actor.removed").increment(1);
            gauge!("meeting.actor.active").set(self.meetings.len() as f64);
        }
    }
}
