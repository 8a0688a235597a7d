// ============================
// crates/client/src/peer.rs
// ============================
//! Per-counterpart negotiation engine.
//!
//! One `CounterpartLink` per remote session, driven entirely by the
//! coordinator's event loop (no lock needed). The state machine is
//! `Idle -> OfferSent -> Negotiating -> Connected -> Closed`; early
//! ICE candidates queue FIFO until the remote description is applied.

use crate::media::MediaTrack;
use crate::transport::SignalTransport;
use crate::ClientError;
use async_trait::async_trait;
use huddle_common::{ClientMessage, SessionId};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connection-level state reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Terminal states tear the counterpart down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

/// One platform peer connection. Implementations wrap whatever the
/// platform provides (a browser RTCPeerConnection, a native stack).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<Value, ClientError>;
    async fn create_answer(&self) -> Result<Value, ClientError>;
    async fn set_remote_description(&self, description: Value) -> Result<(), ClientError>;
    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), ClientError>;
    async fn attach_track(&self, track: &MediaTrack) -> Result<(), ClientError>;
    /// Swap the outgoing video track; `None` removes it.
    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), ClientError>;
    async fn close(&self);
}

/// Factory for peer connections, one per counterpart. The returned
/// receiver reports connection-state transitions.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote: &SessionId,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerState>), ClientError>;
}

/// Negotiation progress for one counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Link exists, no offer exchanged yet
    Idle,
    /// We sent an offer and wait for the answer
    OfferSent,
    /// Remote description applied, candidates flowing
    Negotiating,
    /// Media-level connection established
    Connected,
    /// Torn down; the link is dead
    Closed,
}

impl NegotiationState {
    /// Whether the remote description has been applied. Candidates
    /// queue until this holds.
    fn remote_set(self) -> bool {
        matches!(
            self,
            NegotiationState::Negotiating | NegotiationState::Connected
        )
    }
}

/// Negotiation state machine for one (local, remote) pair.
pub struct CounterpartLink {
    pub remote: SessionId,
    pub display_name: String,
    pub state: NegotiationState,
    /// Stale-completion guard: deferred work carries the generation it
    /// was scheduled under and is dropped when they no longer match.
    pub generation: u64,
    pending_ice: VecDeque<Value>,
    conn: Arc<dyn PeerConnection>,
}

impl CounterpartLink {
    pub fn new(
        remote: SessionId,
        display_name: String,
        conn: Arc<dyn PeerConnection>,
        generation: u64,
    ) -> Self {
        Self {
            remote,
            display_name,
            state: NegotiationState::Idle,
            generation,
            pending_ice: VecDeque::new(),
            conn,
        }
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.conn
    }

    /// Create and send an offer toward this counterpart. Only valid
    /// from `Idle`; a repeat request is a no-op.
    pub async fn start_offer(
        &mut self,
        transport: &dyn SignalTransport,
    ) -> Result<(), ClientError> {
        if self.state != NegotiationState::Idle {
            debug!(remote = %self.remote, state = ?self.state, "offer already in flight");
            return Ok(());
        }

        let offer = self.conn.create_offer().await?;
        transport
            .send(ClientMessage::Offer {
                target_session_id: Some(self.remote.clone()),
                payload: offer,
            })
            .await?;
        self.state = NegotiationState::OfferSent;
        Ok(())
    }

    /// Apply an incoming offer and reply with an answer. On glare (we
    /// already sent an offer of our own) the remote offer wins: apply
    /// it and answer; our unanswered offer is abandoned.
    pub async fn handle_offer(
        &mut self,
        payload: Value,
        transport: &dyn SignalTransport,
    ) -> Result<(), ClientError> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        if self.state == NegotiationState::OfferSent {
            debug!(remote = %self.remote, "offer glare, applying remote offer");
        }

        self.conn.set_remote_description(payload).await?;
        self.state = NegotiationState::Negotiating;
        self.flush_ice().await;

        let answer = self.conn.create_answer().await?;
        transport
            .send(ClientMessage::Answer {
                target_session_id: Some(self.remote.clone()),
                payload: answer,
            })
            .await?;
        Ok(())
    }

    /// Apply the answer to our offer. Answers arriving in any other
    /// state (duplicate, or after glare abandoned our offer) are
    /// ignored.
    pub async fn handle_answer(&mut self, payload: Value) -> Result<(), ClientError> {
        if self.state != NegotiationState::OfferSent {
            debug!(remote = %self.remote, state = ?self.state, "ignoring answer");
            return Ok(());
        }

        self.conn.set_remote_description(payload).await?;
        self.state = NegotiationState::Negotiating;
        self.flush_ice().await;
        Ok(())
    }

    /// Apply or queue one ICE candidate. Candidates arriving before
    /// the remote description queue FIFO; a candidate that fails to
    /// apply is logged and skipped, never fatal.
    pub async fn handle_ice(&mut self, candidate: Value) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if !self.state.remote_set() {
            self.pending_ice.push_back(candidate);
            return;
        }
        if let Err(err) = self.conn.add_ice_candidate(candidate).await {
            warn!(remote = %self.remote, %err, "skipping bad ice candidate");
        }
    }

    async fn flush_ice(&mut self) {
        while let Some(candidate) = self.pending_ice.pop_front() {
            if let Err(err) = self.conn.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote, %err, "skipping bad ice candidate");
            }
        }
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn mark_connected(&mut self) {
        if self.state != NegotiationState::Closed {
            self.state = NegotiationState::Connected;
        }
    }

    /// Tear the link down. Idempotent: repeated terminal notifications
    /// close the platform connection once.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_ice.clear();
        self.conn.close().await;
    }
}
