// ============================
// crates/backend-lib/src/store.rs
// ============================
//! Persistence collaborator interfaces and the in-memory backing used
//! by the server. Schema details live behind these traits; participants
//! are soft-deleted via `left_at` rather than removed.
use crate::error::AppError;
use crate::meeting::{Meeting, Participant};
use async_trait::async_trait;
use chrono::Utc;
use huddle_common::{MeetingCode, SessionId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Trait for meeting persistence
#[async_trait]
pub trait MeetingStore: Send + Sync {
    /// Look up a meeting by its (normalized) code
    async fn get_by_code(&self, code: &str) -> Result<Option<Meeting>, AppError>;

    /// Store a newly created meeting
    async fn insert(&self, meeting: Meeting) -> Result<(), AppError>;

    /// Set the end time, but only when `requester` is the creator and
    /// the meeting has not already ended. Returns whether it ended.
    async fn end_if_owner(&self, code: &str, requester: &str) -> Result<bool, AppError>;
}

/// Trait for participant persistence
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    /// Insert a participant for `(meeting, session)` or return the
    /// existing active one — joins are idempotent by session id.
    async fn upsert_by_session(
        &self,
        meeting_code: &str,
        name: &str,
        session_id: &str,
    ) -> Result<Participant, AppError>;

    /// Soft-remove a participant. No-op when the session is unknown or
    /// already left; `left_at` is never cleared once set.
    async fn mark_left(&self, session_id: &str) -> Result<(), AppError>;

    /// All non-left participants of a meeting, in join order.
    async fn active_roster(&self, meeting_code: &str) -> Result<Vec<Participant>, AppError>;

    /// Partial media-state update; `None` fields stay unchanged.
    /// Returns the updated participant, or `None` when the session is
    /// unknown (silent no-op).
    async fn set_media_state(
        &self,
        session_id: &str,
        is_muted: Option<bool>,
        camera_enabled: Option<bool>,
    ) -> Result<Option<Participant>, AppError>;
}

/// In-memory implementation backing the server. A database-backed
/// implementation can replace this behind the same traits.
#[derive(Default)]
pub struct InMemoryStore {
    meetings: RwLock<HashMap<MeetingCode, Meeting>>,
    participants: RwLock<HashMap<SessionId, Participant>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeetingStore for InMemoryStore {
    async fn get_by_code(&self, code: &str) -> Result<Option<Meeting>, AppError> {
        Ok(self.meetings.read().get(code).cloned())
    }

    async fn insert(&self, meeting: Meeting) -> Result<(), AppError> {
        self.meetings
            .write()
            .insert(meeting.code.clone(), meeting);
        Ok(())
    }

    async fn end_if_owner(&self, code: &str, requester: &str) -> Result<bool, AppError> {
        let mut meetings = self.meetings.write();
        let Some(meeting) = meetings.get_mut(code) else {
            return Ok(false);
        };
        if meeting.created_by != requester || !meeting.is_active() {
            return Ok(false);
        }
        meeting.ended_at = Some(Utc::now());
        Ok(true)
    }
}

#[async_trait]
impl ParticipantStore for InMemoryStore {
    async fn upsert_by_session(
        &self,
        meeting_code: &str,
        name: &str,
        session_id: &str,
    ) -> Result<Participant, AppError> {
        // Host flag is computed once here, at join time, by exact match
        // against the meeting creator.
        let is_host = self
            .meetings
            .read()
            .get(meeting_code)
            .map(|m| m.created_by == name)
            .unwrap_or(false);

        let mut participants = self.participants.write();
        if let Some(existing) = participants.get(session_id) {
            if existing.is_active() {
                return Ok(existing.clone());
            }
        }

        let participant = Participant {
            session_id: session_id.to_string(),
            meeting_code: meeting_code.to_string(),
            name: name.to_string(),
            is_host,
            is_muted: false,
            camera_enabled: true,
            joined_at: Utc::now(),
            left_at: None,
        };
        participants.insert(session_id.to_string(), participant.clone());
        Ok(participant)
    }

    async fn mark_left(&self, session_id: &str) -> Result<(), AppError> {
        let mut participants = self.participants.write();
        if let Some(p) = participants.get_mut(session_id) {
            if p.left_at.is_none() {
                p.left_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn active_roster(&self, meeting_code: &str) -> Result<Vec<Participant>, AppError> {
        let participants = self.participants.read();
        let mut roster: Vec<Participant> = participants
            .values()
            .filter(|p| p.meeting_code == meeting_code && p.is_active())
            .cloned()
            .collect();
        roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(roster)
    }

    async fn set_media_state(
        &self,
        session_id: &str,
        is_muted: Option<bool>,
        camera_enabled: Option<bool>,
    ) -> Result<Option<Participant>, AppError> {
        let mut participants = self.participants.write();
        let Some(p) = participants.get_mut(session_id) else {
            return Ok(None);
        };
        if let Some(muted) = is_muted {
            p.is_muted = muted;
        }
        if let Some(camera) = camera_enabled {
            p.camera_enabled = camera;
        }
        Ok(Some(p.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_meeting(code: &str, creator: &str) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.meetings.write().insert(
            code.to_string(),
            Meeting::new(code.to_string(), creator.to_string(), None),
        );
        store
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_session() {
        let store = store_with_meeting("ABC123", "alice");

        let first = store
            .upsert_by_session("ABC123", "bob", "s-bob")
            .await
            .unwrap();
        let second = store
            .upsert_by_session("ABC123", "bob", "s-bob")
            .await
            .unwrap();

        assert_eq!(first.joined_at, second.joined_at);
        assert_eq!(store.active_roster("ABC123").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_host_flag_by_exact_creator_match() {
        let store = store_with_meeting("ABC123", "alice");

        let alice = store
            .upsert_by_session("ABC123", "alice", "s-alice")
            .await
            .unwrap();
        let imposter = store
            .upsert_by_session("ABC123", "Alice", "s-imposter")
            .await
            .unwrap();

        assert!(alice.is_host);
        assert!(!imposter.is_host);
    }

    #[tokio::test]
    async fn test_mark_left_keeps_first_leave_time() {
        let store = store_with_meeting("ABC123", "alice");
        store
            .upsert_by_session("ABC123", "bob", "s-bob")
            .await
            .unwrap();

        store.mark_left("s-bob").await.unwrap();
        let first_left = store.participants.read().get("s-bob").unwrap().left_at;

        store.mark_left("s-bob").await.unwrap();
        let second_left = store.participants.read().get("s-bob").unwrap().left_at;

        assert!(first_left.is_some());
        assert_eq!(first_left, second_left);
        // unknown session is a no-op, not an error
        store.mark_left("s-ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_roster_excludes_left_participants() {
        let store = store_with_meeting("ABC123", "alice");
        store
            .upsert_by_session("ABC123", "alice", "s-alice")
            .await
            .unwrap();
        store
            .upsert_by_session("ABC123", "bob", "s-bob")
            .await
            .unwrap();

        store.mark_left("s-bob").await.unwrap();
        let roster = store.active_roster("ABC123").await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "alice");
        assert!(roster.iter().all(|p| p.left_at.is_none()));
    }

    #[tokio::test]
    async fn test_media_state_partial_update() {
        let store = store_with_meeting("ABC123", "alice");
        store
            .upsert_by_session("ABC123", "bob", "s-bob")
            .await
            .unwrap();

        let updated = store
            .set_media_state("s-bob", Some(true), None)
            .await
            .unwrap()
            .unwrap();
        assert!(updated.is_muted);
        assert!(updated.camera_enabled); // unchanged

        let updated = store
            .set_media_state("s-bob", None, Some(false))
            .await
            .unwrap()
            .unwrap();
        assert!(updated.is_muted); // unchanged
        assert!(!updated.camera_enabled);

        // unknown session is a silent no-op
        assert!(store
            .set_media_state("s-ghost", Some(true), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_end_if_owner() {
        let store = store_with_meeting("ABC123", "alice");

        assert!(!store.end_if_owner("ABC123", "bob").await.unwrap());
        assert!(store
            .get_by_code("ABC123")
            .await
            .unwrap()
            .unwrap()
            .is_active());

        assert!(store.end_if_owner("ABC123", "alice").await.unwrap());
        assert!(!store
            .get_by_code("ABC123")
            .await
            .unwrap()
            .unwrap()
            .is_active());

        // already ended: immutable, second end is refused
        assert!(!store.end_if_owner("ABC123", "alice").await.unwrap());
        assert!(!store.end_if_owner("NOPE99", "alice").await.unwrap());
    }
}
