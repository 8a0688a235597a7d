// ============================
// crates/client/src/lib.rs
// ============================
//! Huddle client library: meeting coordination and peer negotiation.
//!
//! The coordinator drives one event loop per meeting; the negotiation
//! engine keeps one state machine per counterpart. Platform concerns
//! (the actual peer connection and media capture) sit behind traits so
//! the choreography is testable without a media stack.

pub mod coordinator;
pub mod media;
pub mod peer;
pub mod transport;

pub use coordinator::{CoordinatorHandle, MeetingCoordinator, UserEvent};
pub use media::{LocalMedia, MediaDevices, MediaTrack, TrackKind};
pub use peer::{CounterpartLink, NegotiationState, PeerConnection, PeerConnector, PeerState};
pub use transport::SignalTransport;

use thiserror::Error;

/// Client-side error taxonomy. Everything here is locally recoverable:
/// a failed candidate or a denied capture never takes the session down.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Media capture was refused or unavailable
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    /// The signaling transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A negotiation step failed for one counterpart
    #[error("negotiation error: {0}")]
    Negotiation(String),
}
