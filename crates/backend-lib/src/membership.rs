// ============================
// crates/backend-lib/src/membership.rs
// ============================
//! Per-meeting membership actor.
//!
//! All roster-mutating operations for one meeting flow through a single
//! actor task, so concurrent join/leave/media-state calls on the same
//! meeting serialize correctly while different meetings run in
//! parallel. Roster deltas and control events fan out on the handle's
//! broadcast channel.
use crate::error::AppError;
use crate::store::{MeetingStore, ParticipantStore};
use chrono::Utc;
use huddle_common::{ParticipantInfo, RosterSnapshot, ServerEvent, SessionId};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Message sent *into* the actor
#[derive(Debug)]
pub enum MembershipMsg {
    Join {
        session_id: SessionId,
        display_name: String,
        resp_tx: mpsc::UnboundedSender<Result<RosterSnapshot, AppError>>,
    },
    Leave {
        session_id: SessionId,
        resp_tx: mpsc::UnboundedSender<Result<RosterSnapshot, AppError>>,
    },
    SetMediaState {
        session_id: SessionId,
        is_muted: Option<bool>,
        camera_enabled: Option<bool>,
        resp_tx: mpsc::UnboundedSender<Result<Option<ServerEvent>, AppError>>,
    },
    End {
        requester: String,
        resp_tx: mpsc::UnboundedSender<Result<bool, AppError>>,
    },
}

/// Handle that other components keep: command channel + broadcast sender
#[derive(Clone)]
pub struct MeetingHandle {
    pub cmd_tx: mpsc::UnboundedSender<MembershipMsg>,
    pub events_tx: broadcast::Sender<ServerEvent>,
}

impl MeetingHandle {
    /// Subscribe to this meeting's broadcast topics.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    /// Whether two handles point at the same actor.
    pub fn same_channel(&self, other: &MeetingHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    pub async fn join(
        &self,
        session_id: SessionId,
        display_name: String,
    ) -> Result<RosterSnapshot, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(MembershipMsg::Join {
            session_id,
            display_name,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("Membership actor gone".to_string()))?
    }

    pub async fn leave(&self, session_id: SessionId) -> Result<RosterSnapshot, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(MembershipMsg::Leave {
            session_id,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("Membership actor gone".to_string()))?
    }

    pub async fn set_media_state(
        &self,
        session_id: SessionId,
        is_muted: Option<bool>,
        camera_enabled: Option<bool>,
    ) -> Result<Option<ServerEvent>, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(MembershipMsg::SetMediaState {
            session_id,
            is_muted,
            camera_enabled,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("Membership actor gone".to_string()))?
    }

    /// End the meeting. Succeeds only for the creator; returns false
    /// (not an error) otherwise.
    pub async fn end(&self, requester: String) -> Result<bool, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(MembershipMsg::End { requester, resp_tx })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("Membership actor gone".to_string()))?
    }
}

pub struct MembershipActor {
    meeting_code: String,
    meetings: Arc<dyn MeetingStore>,
    participants: Arc<dyn ParticipantStore>,
    events_tx: broadcast::Sender<ServerEvent>,
}

impl MembershipActor {
    pub fn new(
        meeting_code: String,
        meetings: Arc<dyn MeetingStore>,
        participants: Arc<dyn ParticipantStore>,
        events_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        MembershipActor {
            meeting_code,
            meetings,
            participants,
            events_tx,
        }
    }

    async fn roster(&self) -> Result<Vec<ParticipantInfo>, AppError> {
        Ok(self
            .participants
            .active_roster(&self.meeting_code)
            .await?
            .iter()
            .map(|p| p.to_info())
            .collect())
    }

    /// Join the meeting. Fails `MeetingNotFound` when the code is
    /// unknown or the meeting has ended; otherwise idempotent by
    /// session id.
    pub async fn handle_join(
        &mut self,
        session_id: &str,
        display_name: &str,
    ) -> Result<RosterSnapshot, AppError> {
        let meeting = self
            .meetings
            .get_by_code(&self.meeting_code)
            .await?
            .filter(|m| m.is_active())
            .ok_or(AppError::MeetingNotFound)?;

        let participant = self
            .participants
            .upsert_by_session(&meeting.code, display_name, session_id)
            .await?;

        let roster = self.roster().await?;
        info!(
            meeting = %self.meeting_code,
            participant = %display_name,
            count = roster.len(),
            "participant joined"
        );
        counter!("meeting.joins").increment(1);

        let _ = self.events_tx.send(ServerEvent::ParticipantJoined {
            participant: participant.to_info(),
            participants: roster.clone(),
            participant_count: roster.len(),
            timestamp: Utc::now(),
        });

        Ok(RosterSnapshot::new(roster))
    }

    /// Mark the participant left. No-op (not an error) when the session
    /// is unknown or already left.
    pub async fn handle_leave(&mut self, session_id: &str) -> Result<RosterSnapshot, AppError> {
        self.participants.mark_left(session_id).await?;

        let roster = self.roster().await?;
        info!(
            meeting = %self.meeting_code,
            session = %session_id,
            count = roster.len(),
            "participant left"
        );
        counter!("meeting.leaves").increment(1);

        let _ = self.events_tx.send(ServerEvent::ParticipantLeft {
            session_id: session_id.to_string(),
            participants: roster.clone(),
            participant_count: roster.len(),
            timestamp: Utc::now(),
        });

        Ok(RosterSnapshot::new(roster))
    }

    /// Partial media-state update; silent no-op for unknown sessions.
    pub async fn handle_media_state(
        &mut self,
        session_id: &str,
        is_muted: Option<bool>,
        camera_enabled: Option<bool>,
    ) -> Result<Option<ServerEvent>, AppError> {
        let Some(participant) = self
            .participants
            .set_media_state(session_id, is_muted, camera_enabled)
            .await?
        else {
            debug!(session = %session_id, "media state for unknown session ignored");
            return Ok(None);
        };

        let event = ServerEvent::MediaStateChanged {
            session_id: session_id.to_string(),
            participant_name: participant.name.clone(),
            is_muted,
            camera_enabled,
            timestamp: Utc::now(),
        };
        let _ = self.events_tx.send(event.clone());
        Ok(Some(event))
    }

    /// End the meeting; creator only, at most once.
    pub async fn handle_end(&mut self, requester: &str) -> Result<bool, AppError> {
        let ended = self
            .meetings
            .end_if_owner(&self.meeting_code, requester)
            .await?;
        if !ended {
            warn!(
                meeting = %self.meeting_code,
                requester = %requester,
                "end meeting denied"
            );
            return Ok(false);
        }

        info!(meeting = %self.meeting_code, ended_by = %requester, "meeting ended");
        counter!("meeting.ended").increment(1);

        let _ = self.events_tx.send(ServerEvent::MeetingEnded {
            ended_by: requester.to_string(),
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MembershipMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                MembershipMsg::Join {
                    session_id,
                    display_name,
                    resp_tx,
                } => {
                    let result = self.handle_join(&session_id, &display_name).await;
                    let _ = resp_tx.send(result);
                },
                MembershipMsg::Leave {
                    session_id,
                    resp_tx,
                } => {
                    let result = self.handle_leave(&session_id).await;
                    let _ = resp_tx.send(result);
                },
                MembershipMsg::SetMediaState {
                    session_id,
                    is_muted,
                    camera_enabled,
                    resp_tx,
                } => {
                    let result = self
                        .handle_media_state(&session_id, is_muted, camera_enabled)
                        .await;
                    let _ = resp_tx.send(result);
                },
                MembershipMsg::End { requester, resp_tx } => {
                    let result = self.handle_end(&requester).await;
                    let _ = resp_tx.send(result);
                },
            }
        }
    }
}

/// Spawn a membership actor for a meeting and return its handle
pub fn spawn_membership_actor(
    meeting_code: String,
    meetings: Arc<dyn MeetingStore>,
    participants: Arc<dyn ParticipantStore>,
    broadcast_capacity: usize,
) -> MeetingHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(broadcast_capacity);
    let actor = MembershipActor::new(meeting_code, meetings, participants, events_tx.clone());

    tokio::spawn(actor.run(cmd_rx));

    MeetingHandle { cmd_tx, events_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meeting::Meeting;
    use crate::store::InMemoryStore;

    async fn setup(code: &str, creator: &str) -> (MeetingHandle, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert(Meeting::new(code.to_string(), creator.to_string(), None))
            .await
            .unwrap();
        let handle =
            spawn_membership_actor(code.to_string(), store.clone(), store.clone(), 64);
        (handle, store)
    }

    #[tokio::test]
    async fn test_join_unknown_meeting() {
        let store = Arc::new(InMemoryStore::new());
        let handle =
            spawn_membership_actor("NOPE99".to_string(), store.clone(), store, 64);

        let result = handle.join("s-1".to_string(), "alice".to_string()).await;
        assert!(matches!(result, Err(AppError::MeetingNotFound)));
    }

    #[tokio::test]
    async fn test_join_is_idempotent_by_session() {
        let (handle, _store) = setup("ABC123", "alice").await;

        let first = handle
            .join("s-bob".to_string(), "bob".to_string())
            .await
            .unwrap();
        let second = handle
            .join("s-bob".to_string(), "bob".to_string())
            .await
            .unwrap();

        assert_eq!(first.participant_count, 1);
        assert_eq!(second.participant_count, 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (handle, _store) = setup("ABC123", "alice").await;
        handle
            .join("s-alice".to_string(), "alice".to_string())
            .await
            .unwrap();
        handle
            .join("s-bob".to_string(), "bob".to_string())
            .await
            .unwrap();

        let first = handle.leave("s-bob".to_string()).await.unwrap();
        let second = handle.leave("s-bob".to_string()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.participant_count, 1);
        // unknown session: no-op, not an error
        handle.leave("s-ghost".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_after_end_fails() {
        let (handle, _store) = setup("ABC123", "alice").await;
        assert!(handle.end("alice".to_string()).await.unwrap());

        let result = handle.join("s-late".to_string(), "bob".to_string()).await;
        assert!(matches!(result, Err(AppError::MeetingNotFound)));
    }

    #[tokio::test]
    async fn test_media_state_broadcast() {
        let (handle, _store) = setup("ABC123", "alice").await;
        handle
            .join("s-bob".to_string(), "bob".to_string())
            .await
            .unwrap();
        let mut events = handle.subscribe();

        let event = handle
            .set_media_state("s-bob".to_string(), Some(true), None)
            .await
            .unwrap()
            .expect("known session produces an event");
        match event {
            ServerEvent::MediaStateChanged {
                session_id,
                participant_name,
                is_muted,
                camera_enabled,
                ..
            } => {
                assert_eq!(session_id, "s-bob");
                assert_eq!(participant_name, "bob");
                assert_eq!(is_muted, Some(true));
                assert_eq!(camera_enabled, None);
            },
            other => panic!("Expected MediaStateChanged, got {other:?}"),
        }

        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::MediaStateChanged { .. }
        ));

        // unknown session is a silent no-op
        assert!(handle
            .set_media_state("s-ghost".to_string(), Some(true), None)
            .await
            .unwrap()
            .is_none());
    }

    /// The end-to-end membership scenario: bob joins alice's meeting,
    /// leaves, fails to end it, then alice ends it.
    #[tokio::test]
    async fn test_meeting_lifecycle_scenario() {
        let (handle, store) = setup("ABC123", "alice").await;
        let mut events = handle.subscribe();

        handle
            .join("s-alice".to_string(), "alice".to_string())
            .await
            .unwrap();
        let roster = handle
            .join("s-bob".to_string(), "bob".to_string())
            .await
            .unwrap();
        assert_eq!(roster.participant_count, 2);
        assert!(roster.get("s-alice").unwrap().is_host);
        assert!(!roster.get("s-bob").unwrap().is_host);

        let roster = handle.leave("s-bob".to_string()).await.unwrap();
        assert_eq!(roster.participant_count, 1);
        assert_eq!(roster.participants[0].name, "alice");

        // non-creator end: denied, no state change
        assert!(!handle.end("bob".to_string()).await.unwrap());
        assert!(store
            .get_by_code("ABC123")
            .await
            .unwrap()
            .unwrap()
            .is_active());

        // creator end: succeeds and broadcasts the control event
        assert!(handle.end("alice".to_string()).await.unwrap());

        let mut saw_ended = false;
        while let Ok(event) = events.try_recv() {
            if let ServerEvent::MeetingEnded { ended_by, .. } = event {
                assert_eq!(ended_by, "alice");
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }
}
