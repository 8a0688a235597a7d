// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Huddle backend library: meeting signaling over WebSockets.
//!
//! The server keeps one actor per live meeting (roster mutations are
//! serialized per meeting, meetings run independently), relays
//! negotiation signals on a per-meeting broadcast channel and exposes
//! a small HTTP API for creating and ending meetings.

pub mod config;
pub mod error;
pub mod meeting;
pub mod membership;
pub mod registry;
pub mod relay;
pub mod store;
pub mod validation;
pub mod ws_router;

use crate::config::Settings;
use crate::meeting::MeetingManager;
use crate::registry::SessionRegistry;
use crate::store::{InMemoryStore, MeetingStore, ParticipantStore};
use std::sync::Arc;

/// Shared application state handed to every router handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub meeting_store: Arc<dyn MeetingStore>,
    pub participant_store: Arc<dyn ParticipantStore>,
    pub meetings: Arc<MeetingManager>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    /// State backed by the in-memory stores.
    pub fn new(settings: Settings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_stores(settings, store.clone(), store)
    }

    /// State over caller-provided store implementations.
    pub fn with_stores(
        settings: Settings,
        meeting_store: Arc<dyn MeetingStore>,
        participant_store: Arc<dyn ParticipantStore>,
    ) -> Self {
        let meetings = Arc::new(MeetingManager::new(
            meeting_store.clone(),
            participant_store.clone(),
            settings.broadcast_capacity,
        ));
        Self {
            settings: Arc::new(settings),
            meeting_store,
            participant_store,
            meetings,
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}
