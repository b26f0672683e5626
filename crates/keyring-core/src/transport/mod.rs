//! Transports that carry requests to a signer.
//!
//! A transport only moves frames. It never tracks which requests are
//! outstanding; that is the job of [`crate::session::TransportSession`],
//! which assigns every request a fresh [`CorrelationId`] and matches
//! replies back to it.
//!
//! Two delivery styles are supported:
//!
//! - **Direct** transports answer inside [`Transport::send`] and return
//!   [`Delivery::Completed`]. See [`direct::DirectTransport`].
//! - **Bridged** transports post the frame to another context and return
//!   [`Delivery::Deferred`]. Replies arrive later as [`InboundMessage`]s on
//!   the channel from [`Transport::take_inbound`] and are decoded by
//!   [`Transport::accept`]. See [`bridge::BridgeTransport`].
//!
//! ```text
//! ┌──────────────────────┐  Frame   ┌──────────────┐        ┌────────┐
//! │   TransportSession   │ ───────▶ │  Transport   │ ─────▶ │ Signer │
//! │  (correlation map,   │          │ direct or    │        │        │
//! │   single flight,     │ ◀─────── │ bridged      │ ◀───── │        │
//! │   timeouts)          │  Reply   └──────────────┘        └────────┘
//! └──────────────────────┘
//! ```

use core::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod bridge;
pub mod direct;
pub mod protocol;
pub mod software;

pub use protocol::{
    DeviceRequest, DeviceResponse, DeviceState, FirmwareVersion, TransportState, action,
    reply_action,
};

/// Identifier that ties a reply to its request. Never reused within a session.
pub type CorrelationId = u64;

/// A request on its way to the signer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Correlation id assigned by the session.
    pub id: CorrelationId,
    /// The request.
    pub request: DeviceRequest,
}

/// A decoded reply.
#[derive(Debug)]
pub struct Reply {
    /// Correlation id of the request being answered.
    pub id: CorrelationId,
    /// Reply tag, the request action with a `-reply` suffix.
    pub action: String,
    /// The signer's answer or its failure.
    pub outcome: Result<DeviceResponse>,
}

impl Reply {
    /// Builds the reply to `request_action`.
    #[must_use]
    pub fn to_request(id: CorrelationId, request_action: &str, outcome: Result<DeviceResponse>) -> Self {
        Self {
            id,
            action: reply_action(request_action),
            outcome,
        }
    }
}

/// How [`Transport::send`] delivered a frame.
#[derive(Debug)]
pub enum Delivery {
    /// The signer already answered.
    Completed(Reply),
    /// The answer will arrive as an [`InboundMessage`].
    Deferred,
}

/// A raw message received from another execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Origin the message claims to come from.
    pub origin: String,
    /// Message body.
    pub data: Value,
}

/// Carries frames to a signer.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Short transport name for logs.
    fn kind(&self) -> &'static str;

    /// Sends a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be handed to the signer.
    async fn send(&self, frame: Frame) -> Result<Delivery>;

    /// Takes the inbound message channel. Only bridged transports have one,
    /// and it can be taken once.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        None
    }

    /// Decodes an inbound message into a reply, or `None` to ignore it.
    fn accept(&self, message: InboundMessage) -> Option<Reply> {
        let _ = message;
        None
    }

    /// Exports state that allows [`Transport::restore_state`] to skip a handshake.
    fn export_state(&self) -> Option<TransportState> {
        None
    }

    /// Rehydrates device state without I/O, if the transport supports it.
    fn restore_state(&self, state: &TransportState) -> Option<DeviceState> {
        let _ = state;
        None
    }

    /// Releases transport resources.
    async fn close(&self) {}
}
