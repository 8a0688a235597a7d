// ============================
// crates/client/src/coordinator.rs
// ============================
//! Meeting coordinator: one event loop per joined meeting.
//!
//! Everything flows through `run`'s select loop — server events on one
//! channel, internal commands on the other — so counterpart state
//! never needs a lock. Deferred work (staggered offers, peer-state
//! watchers) re-enters through the command channel and is re-checked
//! against the current epoch/generation before it takes effect.

use crate::media::{LocalMedia, MediaDevices, TrackKind};
use crate::peer::{CounterpartLink, NegotiationState, PeerConnector, PeerState};
use crate::transport::SignalTransport;
use crate::ClientError;
use huddle_common::{ClientMessage, RosterSnapshot, ServerEvent, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EARLY_ICE_LIMIT: usize = 32;

/// Internal commands. External callers go through `CoordinatorHandle`;
/// deferred work the coordinator scheduled for itself re-enters here
/// too, tagged with the epoch or generation it was scheduled under.
#[derive(Debug)]
pub enum CoordinatorCmd {
    /// Deferred offer toward one counterpart
    SendOffer { remote: SessionId, epoch: u64 },
    /// Connection-state report from a peer watcher task
    PeerStateChanged {
        remote: SessionId,
        generation: u64,
        state: PeerState,
    },
    SetMuted(bool),
    SetCamera(bool),
    StartScreenShare,
    StopScreenShare,
    Shutdown,
}

/// Events surfaced to the embedding application (the UI layer).
#[derive(Debug, Clone)]
pub enum UserEvent {
    /// Our own join was acknowledged
    Joined { roster: RosterSnapshot },
    /// Someone else joined or left
    RosterUpdated { roster: RosterSnapshot },
    PeerConnected { session_id: SessionId },
    PeerClosed { session_id: SessionId },
    MediaStateChanged {
        session_id: SessionId,
        participant_name: String,
        is_muted: Option<bool>,
        camera_enabled: Option<bool>,
    },
    /// Surfaced at most once per coordinator
    MeetingEnded { ended_by: String },
    Chat { sender_name: String, message: String },
    Error { code: String, message: String },
}

/// Cloneable handle for driving a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    cmd_tx: mpsc::Sender<CoordinatorCmd>,
}

impl CoordinatorHandle {
    pub async fn set_muted(&self, muted: bool) {
        let _ = self.cmd_tx.send(CoordinatorCmd::SetMuted(muted)).await;
    }

    pub async fn set_camera(&self, enabled: bool) {
        let _ = self.cmd_tx.send(CoordinatorCmd::SetCamera(enabled)).await;
    }

    pub async fn start_screen_share(&self) {
        let _ = self.cmd_tx.send(CoordinatorCmd::StartScreenShare).await;
    }

    pub async fn stop_screen_share(&self) {
        let _ = self.cmd_tx.send(CoordinatorCmd::StopScreenShare).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(CoordinatorCmd::Shutdown).await;
    }
}

/// Coordinates one participant's view of one meeting.
pub struct MeetingCoordinator {
    meeting_code: String,
    display_name: String,
    local_session: Option<SessionId>,
    joined: bool,
    links: HashMap<SessionId, CounterpartLink>,
    /// Candidates that arrived before the offer that creates their
    /// link; drained into the link once it exists
    early_ice: HashMap<SessionId, Vec<serde_json::Value>>,
    /// Display names by session, from roster broadcasts
    names: HashMap<SessionId, String>,
    transport: Arc<dyn SignalTransport>,
    connector: Arc<dyn PeerConnector>,
    devices: Arc<dyn MediaDevices>,
    local_media: LocalMedia,
    screen_track: Option<crate::media::MediaTrack>,
    muted: bool,
    camera_enabled: bool,
    /// Bumped on every full teardown; scheduled offers carry the epoch
    /// they were created under and are dropped on mismatch
    epoch: u64,
    next_generation: u64,
    ended_surfaced: bool,
    offer_stagger: Duration,
    cmd_tx: mpsc::Sender<CoordinatorCmd>,
    user_tx: mpsc::UnboundedSender<UserEvent>,
}

impl MeetingCoordinator {
    pub fn new(
        meeting_code: String,
        display_name: String,
        transport: Arc<dyn SignalTransport>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
        offer_stagger: Duration,
    ) -> (
        Self,
        CoordinatorHandle,
        mpsc::Receiver<CoordinatorCmd>,
        mpsc::UnboundedReceiver<UserEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            meeting_code,
            display_name,
            local_session: None,
            joined: false,
            links: HashMap::new(),
            early_ice: HashMap::new(),
            names: HashMap::new(),
            transport,
            connector,
            devices,
            local_media: LocalMedia::default(),
            screen_track: None,
            muted: false,
            camera_enabled: true,
            epoch: 0,
            next_generation: 0,
            ended_surfaced: false,
            offer_stagger,
            cmd_tx: cmd_tx.clone(),
            user_tx,
        };
        (coordinator, CoordinatorHandle { cmd_tx }, cmd_rx, user_rx)
    }

    pub fn local_session(&self) -> Option<&SessionId> {
        self.local_session.as_ref()
    }

    pub fn counterpart_count(&self) -> usize {
        self.links.len()
    }

    pub fn counterpart_state(&self, remote: &str) -> Option<NegotiationState> {
        self.links.get(remote).map(|l| l.state)
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn camera_enabled(&self) -> bool {
        self.camera_enabled
    }

    /// Capture local media and join the meeting. A capture failure is
    /// degraded, not fatal: the join proceeds without tracks and the
    /// participant starts muted with the camera off.
    pub async fn join(&mut self) -> Result<(), ClientError> {
        let capture_failed = match self.devices.capture().await {
            Ok(media) => {
                self.local_media = media;
                false
            },
            Err(err) => {
                warn!(%err, "media capture failed, joining without local tracks");
                true
            },
        };

        info!(meeting = %self.meeting_code, name = %self.display_name, "joining");
        self.transport
            .send(ClientMessage::Join {
                participant_name: self.display_name.clone(),
            })
            .await?;

        if capture_failed {
            self.muted = true;
            self.camera_enabled = false;
            self.transport
                .send(ClientMessage::MediaState {
                    is_muted: Some(true),
                    camera_enabled: Some(false),
                })
                .await?;
        }
        Ok(())
    }

    /// Drive the coordinator until shutdown, meeting end has emptied
    /// the channels, or the transport drops.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ServerEvent>,
        mut cmds: mpsc::Receiver<CoordinatorCmd>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => {
                        // transport gone: full local teardown, a
                        // reconnect is a brand new join
                        debug!(meeting = %self.meeting_code, "transport closed");
                        self.teardown_all().await;
                        break;
                    },
                },
                cmd = cmds.recv() => match cmd {
                    Some(CoordinatorCmd::Shutdown) | None => {
                        let _ = self.transport.send(ClientMessage::Leave).await;
                        self.teardown_all().await;
                        break;
                    },
                    Some(cmd) => self.handle_cmd(cmd).await,
                },
            }
        }
    }

    /// Dispatch one server event.
    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Welcome { session_id } => {
                debug!(session = %session_id, "session assigned");
                self.local_session = Some(session_id);
            },
            ServerEvent::ParticipantJoined {
                participant,
                participants,
                ..
            } => {
                let roster = RosterSnapshot::new(participants);
                self.remember_names(&roster);

                let is_self =
                    self.local_session.as_deref() == Some(participant.session_id.as_str());
                if is_self {
                    self.joined = true;
                    let _ = self.user_tx.send(UserEvent::Joined { roster });
                } else {
                    // Fixed initiation direction: the member already in
                    // the meeting offers toward the newcomer. The
                    // newcomer only answers.
                    if self.joined {
                        self.schedule_offer(participant.session_id.clone());
                    }
                    let _ = self.user_tx.send(UserEvent::RosterUpdated { roster });
                }
            },
            ServerEvent::ParticipantLeft {
                session_id,
                participants,
                ..
            } => {
                let roster = RosterSnapshot::new(participants);
                self.remember_names(&roster);
                // forget the departed session so a deferred offer
                // toward it is dropped instead of resurrecting it
                self.names.remove(&session_id);
                self.teardown_counterpart(&session_id).await;
                let _ = self.user_tx.send(UserEvent::RosterUpdated { roster });
            },
            ServerEvent::Offer {
                from_session_id,
                target_session_id,
                payload,
                ..
            } => {
                if !self.addressed_to_me(&from_session_id, target_session_id.as_ref()) {
                    return;
                }
                if let Err(err) = self.ensure_link(&from_session_id).await {
                    warn!(remote = %from_session_id, %err, "cannot build counterpart link");
                    return;
                }
                let transport = self.transport.clone();
                if let Some(link) = self.links.get_mut(&from_session_id) {
                    if let Err(err) = link.handle_offer(payload, transport.as_ref()).await {
                        warn!(remote = %from_session_id, %err, "offer handling failed");
                    }
                }
            },
            ServerEvent::Answer {
                from_session_id,
                target_session_id,
                payload,
                ..
            } => {
                if !self.addressed_to_me(&from_session_id, target_session_id.as_ref()) {
                    return;
                }
                match self.links.get_mut(&from_session_id) {
                    Some(link) => {
                        if let Err(err) = link.handle_answer(payload).await {
                            warn!(remote = %from_session_id, %err, "answer handling failed");
                        }
                    },
                    None => debug!(remote = %from_session_id, "answer without link, discarding"),
                }
            },
            ServerEvent::IceCandidate {
                from_session_id,
                target_session_id,
                payload,
                ..
            } => {
                if !self.addressed_to_me(&from_session_id, target_session_id.as_ref()) {
                    return;
                }
                match self.links.get_mut(&from_session_id) {
                    Some(link) => link.handle_ice(payload).await,
                    None => {
                        // candidate raced ahead of the offer; park it
                        // until the offer builds the link
                        let queue = self.early_ice.entry(from_session_id.clone()).or_default();
                        if queue.len() < EARLY_ICE_LIMIT {
                            queue.push(payload);
                        } else {
                            debug!(remote = %from_session_id, "early candidate buffer full");
                        }
                    },
                }
            },
            ServerEvent::MediaStateChanged {
                session_id,
                participant_name,
                is_muted,
                camera_enabled,
                ..
            } => {
                let _ = self.user_tx.send(UserEvent::MediaStateChanged {
                    session_id,
                    participant_name,
                    is_muted,
                    camera_enabled,
                });
            },
            ServerEvent::MeetingEnded { ended_by, .. } => {
                self.teardown_all().await;
                if !self.ended_surfaced {
                    self.ended_surfaced = true;
                    let _ = self.user_tx.send(UserEvent::MeetingEnded { ended_by });
                }
            },
            ServerEvent::Chat {
                sender_name,
                message,
                ..
            } => {
                let _ = self.user_tx.send(UserEvent::Chat {
                    sender_name,
                    message,
                });
            },
            ServerEvent::Error { code, message } => {
                warn!(%code, %message, "server reported an error");
                let _ = self.user_tx.send(UserEvent::Error { code, message });
            },
        }
    }

    /// Dispatch one internal command.
    pub async fn handle_cmd(&mut self, cmd: CoordinatorCmd) {
        match cmd {
            CoordinatorCmd::SendOffer { remote, epoch } => {
                if epoch != self.epoch {
                    debug!(remote = %remote, "dropping stale scheduled offer");
                    return;
                }
                if !self.joined {
                    return;
                }
                // the counterpart may have left during the stagger
                if !self.names.contains_key(&remote) {
                    debug!(remote = %remote, "dropping offer toward departed session");
                    return;
                }
                if let Err(err) = self.ensure_link(&remote).await {
                    warn!(remote = %remote, %err, "cannot build counterpart link");
                    return;
                }
                let transport = self.transport.clone();
                if let Some(link) = self.links.get_mut(&remote) {
                    if let Err(err) = link.start_offer(transport.as_ref()).await {
                        warn!(remote = %remote, %err, "offer failed");
                    }
                }
            },
            CoordinatorCmd::PeerStateChanged {
                remote,
                generation,
                state,
            } => {
                let Some(link) = self.links.get(&remote) else {
                    return;
                };
                if link.generation != generation {
                    debug!(remote = %remote, "dropping stale peer-state report");
                    return;
                }
                if state == PeerState::Connected {
                    if let Some(link) = self.links.get_mut(&remote) {
                        link.mark_connected();
                    }
                    let _ = self.user_tx.send(UserEvent::PeerConnected {
                        session_id: remote,
                    });
                } else if state.is_terminal() {
                    self.teardown_counterpart(&remote).await;
                }
            },
            CoordinatorCmd::SetMuted(muted) => {
                self.muted = muted;
                let _ = self
                    .transport
                    .send(ClientMessage::MediaState {
                        is_muted: Some(muted),
                        camera_enabled: None,
                    })
                    .await;
            },
            CoordinatorCmd::SetCamera(enabled) => {
                self.camera_enabled = enabled;
                let _ = self
                    .transport
                    .send(ClientMessage::MediaState {
                        is_muted: None,
                        camera_enabled: Some(enabled),
                    })
                    .await;
            },
            CoordinatorCmd::StartScreenShare => match self.devices.capture_screen().await {
                Ok(track) => {
                    self.screen_track = Some(track.clone());
                    // per-counterpart: one failing link does not stop
                    // the others
                    for link in self.links.values() {
                        if let Err(err) =
                            link.connection().replace_video_track(Some(&track)).await
                        {
                            warn!(remote = %link.remote, %err, "screen share swap failed");
                        }
                    }
                },
                Err(err) => {
                    let _ = self.user_tx.send(UserEvent::Error {
                        code: "MEDIA_ACCESS_DENIED".to_string(),
                        message: err.to_string(),
                    });
                },
            },
            CoordinatorCmd::StopScreenShare => {
                if self.screen_track.take().is_some() {
                    let camera = self.local_media.video.clone();
                    for link in self.links.values() {
                        if let Err(err) =
                            link.connection().replace_video_track(camera.as_ref()).await
                        {
                            warn!(remote = %link.remote, %err, "camera restore failed");
                        }
                    }
                }
            },
            CoordinatorCmd::Shutdown => {
                // run() intercepts Shutdown; reaching here (direct
                // dispatch in tests) tears down the same way
                self.teardown_all().await;
            },
        }
    }

    /// Signals count only when they come from someone else and are
    /// addressed to us (or broadcast without a target).
    fn addressed_to_me(&self, from: &SessionId, target: Option<&SessionId>) -> bool {
        let Some(local) = &self.local_session else {
            return false;
        };
        if from == local {
            return false;
        }
        match target {
            Some(target) => target == local,
            None => true,
        }
    }

    fn remember_names(&mut self, roster: &RosterSnapshot) {
        for p in &roster.participants {
            self.names
                .insert(p.session_id.clone(), p.name.clone());
        }
    }

    /// Defer one offer toward `remote`, staggered so a burst of joins
    /// does not fire every negotiation at once.
    fn schedule_offer(&self, remote: SessionId) {
        let cmd_tx = self.cmd_tx.clone();
        let epoch = self.epoch;
        let stagger = self.offer_stagger;
        tokio::spawn(async move {
            if !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            let _ = cmd_tx.send(CoordinatorCmd::SendOffer { remote, epoch }).await;
        });
    }

    /// Build the counterpart link if it does not exist: platform
    /// connection, local tracks, peer-state watcher.
    async fn ensure_link(&mut self, remote: &SessionId) -> Result<(), ClientError> {
        if self.links.contains_key(remote) {
            return Ok(());
        }

        let (conn, mut state_rx) = self.connector.connect(remote).await?;

        for track in self.local_media.tracks() {
            // while sharing, the screen track stands in for the camera
            if track.kind == TrackKind::Video && self.screen_track.is_some() {
                continue;
            }
            if let Err(err) = conn.attach_track(&track).await {
                warn!(remote = %remote, %err, "track attach failed");
            }
        }
        if let Some(screen) = &self.screen_track {
            if let Err(err) = conn.attach_track(screen).await {
                warn!(remote = %remote, %err, "screen track attach failed");
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let display_name = self.names.get(remote).cloned().unwrap_or_default();
        let mut link = CounterpartLink::new(remote.clone(), display_name, conn, generation);

        // candidates that beat the offer here move into the link's own
        // queue and apply once the remote description is set
        for candidate in self.early_ice.remove(remote).unwrap_or_default() {
            link.handle_ice(candidate).await;
        }
        self.links.insert(remote.clone(), link);

        let cmd_tx = self.cmd_tx.clone();
        let watched = remote.clone();
        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                let report = CoordinatorCmd::PeerStateChanged {
                    remote: watched.clone(),
                    generation,
                    state,
                };
                if cmd_tx.send(report).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Tear one counterpart down. Exactly once: removal from the map
    /// makes repeated terminal notifications no-ops.
    async fn teardown_counterpart(&mut self, remote: &str) {
        self.early_ice.remove(remote);
        if let Some(mut link) = self.links.remove(remote) {
            link.close().await;
            let _ = self.user_tx.send(UserEvent::PeerClosed {
                session_id: link.remote.clone(),
            });
        }
    }

    async fn teardown_all(&mut self) {
        // invalidate every scheduled offer
        self.epoch += 1;
        self.early_ice.clear();
        let remotes: Vec<SessionId> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.teardown_counterpart(&remote).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::peer::tests::{MockPeerConnection, MockTransport};
    use crate::peer::PeerConnection;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }

    struct MockConnector {
        connections: Mutex<Vec<(SessionId, Arc<MockPeerConnection>)>>,
        state_txs: Mutex<Vec<mpsc::Sender<PeerState>>>,
    }

    impl MockConnector {
        fn new() -> Self {
            Self {
                connections: Mutex::new(Vec::new()),
                state_txs: Mutex::new(Vec::new()),
            }
        }

        fn connection_for(&self, remote: &str) -> Option<Arc<MockPeerConnection>> {
            self.connections
                .lock()
                .iter()
                .find(|(r, _)| r == remote)
                .map(|(_, c)| c.clone())
        }

        fn connect_count(&self) -> usize {
            self.connections.lock().len()
        }
    }

    #[async_trait]
    impl PeerConnector for MockConnector {
        async fn connect(
            &self,
            remote: &SessionId,
        ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerState>), ClientError> {
            let conn = Arc::new(MockPeerConnection::new());
            let (tx, rx) = mpsc::channel(8);
            self.connections.lock().push((remote.clone(), conn.clone()));
            self.state_txs.lock().push(tx);
            Ok((conn, rx))
        }
    }

    struct OkDevices;

    #[async_trait]
    impl MediaDevices for OkDevices {
        async fn capture(&self) -> Result<LocalMedia, ClientError> {
            Ok(LocalMedia {
                audio: Some(MediaTrack::new(TrackKind::Audio)),
                video: Some(MediaTrack::new(TrackKind::Video)),
            })
        }

        async fn capture_screen(&self) -> Result<MediaTrack, ClientError> {
            Ok(MediaTrack::new(TrackKind::Video))
        }
    }

    struct DeniedDevices;

    #[async_trait]
    impl MediaDevices for DeniedDevices {
        async fn capture(&self) -> Result<LocalMedia, ClientError> {
            Err(ClientError::MediaAccessDenied("permission denied".to_string()))
        }

        async fn capture_screen(&self) -> Result<MediaTrack, ClientError> {
            Err(ClientError::MediaAccessDenied("permission denied".to_string()))
        }
    }

    struct Fixture {
        coordinator: MeetingCoordinator,
        transport: Arc<MockTransport>,
        connector: Arc<MockConnector>,
        cmd_rx: mpsc::Receiver<CoordinatorCmd>,
        user_rx: mpsc::UnboundedReceiver<UserEvent>,
    }

    fn fixture_with(devices: Arc<dyn MediaDevices>) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let connector = Arc::new(MockConnector::new());
        let (coordinator, _handle, cmd_rx, user_rx) = MeetingCoordinator::new(
            "ABC123".to_string(),
            "alice".to_string(),
            transport.clone(),
            connector.clone(),
            devices,
            Duration::ZERO,
        );
        Fixture {
            coordinator,
            transport,
            connector,
            cmd_rx,
            user_rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(OkDevices))
    }

    fn info(session: &str, name: &str) -> huddle_common::ParticipantInfo {
        huddle_common::ParticipantInfo {
            session_id: session.to_string(),
            name: name.to_string(),
            is_host: false,
            is_muted: false,
            camera_enabled: true,
        }
    }

    fn joined_event(session: &str, name: &str, roster: Vec<huddle_common::ParticipantInfo>) -> ServerEvent {
        let count = roster.len();
        ServerEvent::ParticipantJoined {
            participant: info(session, name),
            participants: roster,
            participant_count: count,
            timestamp: now(),
        }
    }

    async fn welcome_and_self_join(fx: &mut Fixture, session: &str) {
        fx.coordinator
            .handle_server_event(ServerEvent::Welcome {
                session_id: session.to_string(),
            })
            .await;
        fx.coordinator
            .handle_server_event(joined_event(session, "alice", vec![info(session, "alice")]))
            .await;
    }

    fn drain_user_events(rx: &mut mpsc::UnboundedReceiver<UserEvent>) -> Vec<UserEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_existing_member_offers_toward_newcomer() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;
        assert!(matches!(fx.cmd_rx.try_recv(), Err(_)), "self-join must not offer");

        fx.coordinator
            .handle_server_event(joined_event(
                "s2",
                "bob",
                vec![info("s1", "alice"), info("s2", "bob")],
            ))
            .await;

        let cmd = fx.cmd_rx.recv().await.expect("scheduled offer");
        let CoordinatorCmd::SendOffer { remote, epoch } = cmd else {
            panic!("expected SendOffer");
        };
        assert_eq!(remote, "s2");
        fx.coordinator
            .handle_cmd(CoordinatorCmd::SendOffer { remote, epoch })
            .await;

        assert_eq!(fx.connector.connect_count(), 1);
        let offers: Vec<_> = fx
            .transport
            .sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Offer {
                    target_session_id, ..
                } => Some(target_session_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(offers, vec![Some("s2".to_string())]);
        assert_eq!(
            fx.coordinator.counterpart_state("s2"),
            Some(NegotiationState::OfferSent)
        );
    }

    #[tokio::test]
    async fn test_newcomer_does_not_offer_on_self_join() {
        let mut fx = fixture();
        fx.coordinator
            .handle_server_event(ServerEvent::Welcome {
                session_id: "s2".to_string(),
            })
            .await;
        // bob joins a meeting where alice is already present
        fx.coordinator
            .handle_server_event(joined_event(
                "s2",
                "bob",
                vec![info("s1", "alice"), info("s2", "bob")],
            ))
            .await;

        tokio::task::yield_now().await;
        assert!(fx.cmd_rx.try_recv().is_err());
        assert!(fx.transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_echoed_and_misaddressed_signals_are_discarded() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;

        // echo of our own offer
        fx.coordinator
            .handle_server_event(ServerEvent::Offer {
                from_session_id: "s1".to_string(),
                target_session_id: Some("s2".to_string()),
                payload: serde_json::json!({"sdp": "x"}),
                timestamp: now(),
            })
            .await;
        // addressed to someone else
        fx.coordinator
            .handle_server_event(ServerEvent::Offer {
                from_session_id: "s2".to_string(),
                target_session_id: Some("s3".to_string()),
                payload: serde_json::json!({"sdp": "x"}),
                timestamp: now(),
            })
            .await;
        assert_eq!(fx.coordinator.counterpart_count(), 0);

        // properly addressed: link is built and an answer goes out
        fx.coordinator
            .handle_server_event(ServerEvent::Offer {
                from_session_id: "s2".to_string(),
                target_session_id: Some("s1".to_string()),
                payload: serde_json::json!({"sdp": "x"}),
                timestamp: now(),
            })
            .await;
        assert_eq!(fx.coordinator.counterpart_count(), 1);
        assert_eq!(fx.transport.sent_types(), vec!["answer"]);
    }

    /// A candidate racing ahead of its offer is buffered, not lost,
    /// and applies once the offer has set the remote description.
    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered_then_applied() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;

        fx.coordinator
            .handle_server_event(ServerEvent::IceCandidate {
                from_session_id: "s2".to_string(),
                target_session_id: Some("s1".to_string()),
                payload: serde_json::json!({"candidate": "early"}),
                timestamp: now(),
            })
            .await;
        // no link yet, nothing connected
        assert_eq!(fx.coordinator.counterpart_count(), 0);
        assert_eq!(fx.connector.connect_count(), 0);

        fx.coordinator
            .handle_server_event(ServerEvent::Offer {
                from_session_id: "s2".to_string(),
                target_session_id: Some("s1".to_string()),
                payload: serde_json::json!({"sdp": "x"}),
                timestamp: now(),
            })
            .await;

        let conn = fx.connector.connection_for("s2").unwrap();
        assert_eq!(
            *conn.applied_candidates.lock(),
            vec![serde_json::json!({"candidate": "early"})]
        );
    }

    /// A counterpart that joins and leaves within the stagger window
    /// must not receive the deferred offer, and no link may be built
    /// toward it afterwards.
    #[tokio::test]
    async fn test_offer_toward_departed_session_is_dropped() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;

        fx.coordinator
            .handle_server_event(joined_event(
                "s2",
                "bob",
                vec![info("s1", "alice"), info("s2", "bob")],
            ))
            .await;
        let cmd = fx.cmd_rx.recv().await.expect("scheduled offer");

        // bob leaves before the stagger fires
        fx.coordinator
            .handle_server_event(ServerEvent::ParticipantLeft {
                session_id: "s2".to_string(),
                participants: vec![info("s1", "alice")],
                participant_count: 1,
                timestamp: now(),
            })
            .await;

        fx.coordinator.handle_cmd(cmd).await;
        assert_eq!(fx.coordinator.counterpart_count(), 0);
        assert_eq!(fx.connector.connect_count(), 0);
        assert!(fx
            .transport
            .sent
            .lock()
            .iter()
            .all(|m| !matches!(m, ClientMessage::Offer { .. })));
    }

    #[tokio::test]
    async fn test_meeting_end_drops_stale_offer_and_surfaces_once() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;
        fx.coordinator
            .handle_server_event(joined_event(
                "s2",
                "bob",
                vec![info("s1", "alice"), info("s2", "bob")],
            ))
            .await;
        let cmd = fx.cmd_rx.recv().await.expect("scheduled offer");

        fx.coordinator
            .handle_server_event(ServerEvent::MeetingEnded {
                ended_by: "alice".to_string(),
                timestamp: now(),
            })
            .await;

        // the offer was scheduled under the old epoch
        fx.coordinator.handle_cmd(cmd).await;
        assert_eq!(fx.connector.connect_count(), 0);

        // a duplicate end event is not surfaced again
        fx.coordinator
            .handle_server_event(ServerEvent::MeetingEnded {
                ended_by: "alice".to_string(),
                timestamp: now(),
            })
            .await;
        let ended = drain_user_events(&mut fx.user_rx)
            .into_iter()
            .filter(|e| matches!(e, UserEvent::MeetingEnded { .. }))
            .count();
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_terminal_peer_state_tears_down_once() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;
        fx.coordinator
            .handle_server_event(ServerEvent::Offer {
                from_session_id: "s2".to_string(),
                target_session_id: Some("s1".to_string()),
                payload: serde_json::json!({"sdp": "x"}),
                timestamp: now(),
            })
            .await;
        let conn = fx.connector.connection_for("s2").expect("link built");
        drain_user_events(&mut fx.user_rx);

        for _ in 0..3 {
            fx.coordinator
                .handle_cmd(CoordinatorCmd::PeerStateChanged {
                    remote: "s2".to_string(),
                    generation: 0,
                    state: PeerState::Failed,
                })
                .await;
        }

        assert_eq!(*conn.close_count.lock(), 1);
        let closed = drain_user_events(&mut fx.user_rx)
            .into_iter()
            .filter(|e| matches!(e, UserEvent::PeerClosed { .. }))
            .count();
        assert_eq!(closed, 1);
        assert_eq!(fx.coordinator.counterpart_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_report_is_ignored() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;

        async fn offer(fx: &mut Fixture) {
            fx.coordinator
                .handle_server_event(ServerEvent::Offer {
                    from_session_id: "s2".to_string(),
                    target_session_id: Some("s1".to_string()),
                    payload: serde_json::json!({"sdp": "x"}),
                    timestamp: Utc::now(),
                })
                .await;
        }
        offer(&mut fx).await;
        fx.coordinator
            .handle_cmd(CoordinatorCmd::PeerStateChanged {
                remote: "s2".to_string(),
                generation: 0,
                state: PeerState::Failed,
            })
            .await;
        assert_eq!(fx.coordinator.counterpart_count(), 0);

        // second link to the same counterpart gets generation 1; a
        // late report from the first connection must not kill it
        offer(&mut fx).await;
        fx.coordinator
            .handle_cmd(CoordinatorCmd::PeerStateChanged {
                remote: "s2".to_string(),
                generation: 0,
                state: PeerState::Failed,
            })
            .await;
        assert_eq!(fx.coordinator.counterpart_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_capture_joins_muted_with_camera_off() {
        let mut fx = fixture_with(Arc::new(DeniedDevices));
        fx.coordinator.join().await.unwrap();

        let sent = fx.transport.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], ClientMessage::Join { participant_name } if participant_name == "alice"));
        assert!(matches!(
            &sent[1],
            ClientMessage::MediaState {
                is_muted: Some(true),
                camera_enabled: Some(false),
            }
        ));
        assert!(fx.coordinator.is_muted());
        assert!(!fx.coordinator.camera_enabled());
    }

    #[tokio::test]
    async fn test_screen_share_swaps_every_counterpart() {
        let mut fx = fixture();
        fx.coordinator.join().await.unwrap();
        welcome_and_self_join(&mut fx, "s1").await;

        for remote in ["s2", "s3"] {
            fx.coordinator
                .handle_server_event(ServerEvent::Offer {
                    from_session_id: remote.to_string(),
                    target_session_id: Some("s1".to_string()),
                    payload: serde_json::json!({"sdp": "x"}),
                    timestamp: now(),
                })
                .await;
        }

        fx.coordinator.handle_cmd(CoordinatorCmd::StartScreenShare).await;
        fx.coordinator.handle_cmd(CoordinatorCmd::StopScreenShare).await;

        for remote in ["s2", "s3"] {
            let conn = fx.connector.connection_for(remote).unwrap();
            let replaces = conn
                .calls
                .lock()
                .iter()
                .filter(|c| c.starts_with("replace_video"))
                .count();
            assert_eq!(replaces, 2, "start and stop for {remote}");
        }
    }

    #[tokio::test]
    async fn test_transport_loss_closes_every_link() {
        let mut fx = fixture();
        welcome_and_self_join(&mut fx, "s1").await;
        fx.coordinator
            .handle_server_event(ServerEvent::Offer {
                from_session_id: "s2".to_string(),
                target_session_id: Some("s1".to_string()),
                payload: serde_json::json!({"sdp": "x"}),
                timestamp: now(),
            })
            .await;
        let conn = fx.connector.connection_for("s2").unwrap();

        let (events_tx, events_rx) = mpsc::channel::<ServerEvent>(8);
        let task = tokio::spawn(fx.coordinator.run(events_rx, fx.cmd_rx));
        drop(events_tx);
        task.await.unwrap();

        assert_eq!(*conn.close_count.lock(), 1);
    }
}
