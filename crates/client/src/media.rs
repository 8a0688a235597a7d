// ============================
// crates/client/src/media.rs
// ============================
//! Local media handles and the capture seam.

use crate::ClientError;
use async_trait::async_trait;

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one captured track. The actual frames live behind the
/// platform layer; the coordinator only routes handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
        }
    }
}

/// Tracks captured for the local participant. Either may be absent:
/// a denied capture degrades to an empty set, it never blocks a join.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl LocalMedia {
    /// All present tracks, audio first.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Capture devices as the platform exposes them.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture microphone and camera. Denial surfaces as
    /// `MediaAccessDenied`; callers join without local tracks.
    async fn capture(&self) -> Result<LocalMedia, ClientError>;

    /// Capture a screen-share video track.
    async fn capture_screen(&self) -> Result<MediaTrack, ClientError>;
}
