// ============================
// crates/client/src/transport.rs
// ============================
//! Signaling transport seam.

use crate::ClientError;
use async_trait::async_trait;
use huddle_common::ClientMessage;

/// Outbound half of the signaling connection. Server events arrive on
/// an `mpsc::Receiver<ServerEvent>` handed to the coordinator's run
/// loop; when that channel closes the transport is gone and the
/// coordinator tears everything down.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), ClientError>;
}
