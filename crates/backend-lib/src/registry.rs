// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Session registry: maps ephemeral transport session ids to the
//! meeting they joined and the identity they joined as, so leave and
//! media-state paths (and disconnect cleanup) need no meeting code.
use crate::error::AppError;
use dashmap::DashMap;
use huddle_common::{MeetingCode, SessionId};

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub meeting_code: MeetingCode,
    pub display_name: String,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to a meeting. Rebinding to the same meeting is
    /// fine (idempotent joins); a session belongs to exactly one
    /// meeting, so binding to a different one is refused.
    pub fn bind(
        &self,
        session_id: &str,
        meeting_code: &str,
        display_name: &str,
    ) -> Result<(), AppError> {
        if let Some(existing) = self.sessions.get(session_id) {
            if existing.meeting_code != meeting_code {
                return Err(AppError::Validation(format!(
                    "session already bound to meeting {}",
                    existing.meeting_code
                )));
            }
        }
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                meeting_code: meeting_code.to_string(),
                display_name: display_name.to_string(),
            },
        );
        Ok(())
    }

    pub fn lookup(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Remove a session. The id is dead afterwards; a fresh join gets a
    /// new id.
    pub fn unbind(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.remove(session_id).map(|(_, entry)| entry)
    }
}
