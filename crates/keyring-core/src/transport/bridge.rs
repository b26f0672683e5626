//! Transport for signers that live in another execution context.
//!
//! Browser extensions typically reach a hardware wallet through an iframe
//! or an offscreen document. Requests are posted as
//! `{target, action, params, messageId}` and the other side answers with
//! `{action: "<action>-reply", success, payload, messageId}`.
//!
//! The bridge itself is abstracted as a [`BridgePort`]. Messages the host
//! receives from the other context are fed into the [`InboundSender`]
//! returned by [`BridgeTransport::new`]; only messages from the configured
//! origin are considered.
//!
//! Until the other side reports readiness ([`BridgeTransport::mark_ready`])
//! outgoing messages wait in a FIFO outbox.

use core::fmt;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::protocol::REPLY_SUFFIX;
use super::{CorrelationId, Delivery, DeviceResponse, Frame, InboundMessage, Reply, Transport, action};
use crate::error::{Error, Result};

/// Default `target` of posted messages.
pub const DEFAULT_TARGET: &str = "HW-KEYRING-BRIDGE";

/// A message posted to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    /// Recipient tag the other side filters on.
    pub target: String,
    /// Request action.
    pub action: String,
    /// Request parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation id, absent for fire-and-forget messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<CorrelationId>,
}

/// A reply posted back by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeReply {
    /// Reply tag, `<action>-reply`.
    pub action: String,
    /// Whether the request succeeded.
    pub success: bool,
    /// Response payload, or `{ "error": ... }` on failure.
    #[serde(default)]
    pub payload: Value,
    /// Correlation id of the request being answered.
    #[serde(default)]
    pub message_id: Option<CorrelationId>,
}

impl BridgeReply {
    /// Builds the reply to `request` from a device outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if the response cannot be encoded.
    pub fn answer(request: &BridgeMessage, outcome: Result<DeviceResponse>) -> Result<Self> {
        let (success, payload) = match outcome {
            Ok(response) => (true, response.to_payload()?),
            Err(err) => (false, serde_json::json!({ "error": err.to_string() })),
        };
        Ok(Self {
            action: format!("{}{REPLY_SUFFIX}", request.action),
            success,
            payload,
            message_id: request.message_id,
        })
    }
}

/// Posts messages into the other execution context.
pub trait BridgePort: Send + Sync + fmt::Debug {
    /// Posts one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the other context is unreachable.
    fn post(&self, message: &BridgeMessage) -> Result<()>;
}

/// Sender half the host feeds received messages into.
pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;

#[derive(Debug, Default)]
struct Outbox {
    ready: bool,
    queued: VecDeque<BridgeMessage>,
}

/// [`Transport`] that posts frames through a [`BridgePort`].
pub struct BridgeTransport<P> {
    port: P,
    origin: String,
    target: String,
    outbox: Mutex<Outbox>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl<P: BridgePort> BridgeTransport<P> {
    /// Creates a transport that trusts messages from `origin`.
    ///
    /// The transport starts not ready; call [`BridgeTransport::mark_ready`]
    /// once the other side has loaded.
    pub fn new(port: P, origin: impl Into<String>) -> (Self, InboundSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            port,
            origin: origin.into(),
            target: DEFAULT_TARGET.to_string(),
            outbox: Mutex::new(Outbox::default()),
            inbound: Mutex::new(Some(rx)),
        };
        (transport, tx)
    }

    /// Overrides the `target` tag of posted messages.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Marks the other side ready and flushes queued messages in order.
    ///
    /// Returns the number of messages flushed.
    ///
    /// # Errors
    ///
    /// Returns the port error of the first message that failed to post;
    /// it and every later message stay queued.
    pub fn mark_ready(&self) -> Result<usize> {
        let mut outbox = self.outbox.lock();
        outbox.ready = true;
        let mut flushed = 0;
        while let Some(message) = outbox.queued.front() {
            if let Err(err) = self.port.post(message) {
                warn!(error = %err, "bridge flush interrupted");
                return Err(err);
            }
            outbox.queued.pop_front();
            flushed += 1;
        }
        info!(flushed, "bridge ready");
        Ok(flushed)
    }

    /// Whether the other side reported readiness.
    pub fn is_ready(&self) -> bool {
        self.outbox.lock().ready
    }

    /// Number of messages waiting for readiness.
    pub fn queued(&self) -> usize {
        self.outbox.lock().queued.len()
    }

    /// The bridge port.
    pub const fn port(&self) -> &P {
        &self.port
    }

    fn enqueue(&self, message: BridgeMessage) -> Result<()> {
        let mut outbox = self.outbox.lock();
        if outbox.ready {
            self.port.post(&message)
        } else {
            debug!(action = %message.action, "bridge not ready, queueing");
            outbox.queued.push_back(message);
            Ok(())
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for BridgeTransport<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("port", &self.port)
            .field("origin", &self.origin)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<P: BridgePort> Transport for BridgeTransport<P> {
    fn kind(&self) -> &'static str {
        "bridge"
    }

    #[instrument(level = "debug", skip(self, frame), fields(id = frame.id, action = frame.request.action()))]
    async fn send(&self, frame: Frame) -> Result<Delivery> {
        let message = BridgeMessage {
            target: self.target.clone(),
            action: frame.request.action().to_string(),
            params: frame.request.params()?,
            message_id: Some(frame.id),
        };
        self.enqueue(message)?;
        Ok(Delivery::Deferred)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inbound.lock().take()
    }

    fn accept(&self, message: InboundMessage) -> Option<Reply> {
        if message.origin != self.origin {
            debug!(origin = %message.origin, "ignoring message from foreign origin");
            return None;
        }
        let reply: BridgeReply = match serde_json::from_value(message.data) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(error = %err, "ignoring message that is not a bridge reply");
                return None;
            }
        };
        let Some(request_action) = reply.action.strip_suffix(REPLY_SUFFIX) else {
            debug!(action = %reply.action, "ignoring message without reply tag");
            return None;
        };
        let Some(id) = reply.message_id else {
            debug!(action = %reply.action, "ignoring unsolicited reply");
            return None;
        };

        let outcome = if reply.success {
            DeviceResponse::from_payload(request_action, reply.payload)
        } else {
            let reason = reply
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("bridge reported failure")
                .to_string();
            Err(Error::TransportRejected(reason))
        };
        Some(Reply {
            id,
            action: reply.action.clone(),
            outcome,
        })
    }

    async fn close(&self) {
        let mut outbox = self.outbox.lock();
        let dropped = outbox.queued.len();
        outbox.queued.clear();
        if outbox.ready {
            let message = BridgeMessage {
                target: self.target.clone(),
                action: action::CLOSE_BRIDGE.to_string(),
                params: Value::Null,
                message_id: None,
            };
            if let Err(err) = self.port.post(&message) {
                warn!(error = %err, "failed to post close-bridge");
            }
        }
        info!(dropped, "bridge closed");
    }
}
