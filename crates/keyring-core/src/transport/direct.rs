//! Transport for signers reachable by a direct call.
//!
//! USB HID devices, local relays and in-process signers all look the same
//! from here: a [`DeviceClient`] that takes a request and eventually
//! returns the answer.

use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{Delivery, DeviceRequest, DeviceResponse, DeviceState, Frame, Reply, Transport, TransportState};
use crate::error::Result;

/// A signer that answers requests directly.
#[async_trait]
pub trait DeviceClient: Send + Sync + fmt::Debug {
    /// Executes one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the signer rejects or cannot process the request.
    async fn call(&self, request: DeviceRequest) -> Result<DeviceResponse>;

    /// See [`Transport::export_state`].
    fn export_state(&self) -> Option<TransportState> {
        None
    }

    /// See [`Transport::restore_state`].
    fn restore_state(&self, state: &TransportState) -> Option<DeviceState> {
        let _ = state;
        None
    }

    /// See [`Transport::close`].
    async fn close(&self) {}
}

#[async_trait]
impl<T: DeviceClient + ?Sized> DeviceClient for Arc<T> {
    async fn call(&self, request: DeviceRequest) -> Result<DeviceResponse> {
        (**self).call(request).await
    }

    fn export_state(&self) -> Option<TransportState> {
        (**self).export_state()
    }

    fn restore_state(&self, state: &TransportState) -> Option<DeviceState> {
        (**self).restore_state(state)
    }

    async fn close(&self) {
        (**self).close().await;
    }
}

/// [`Transport`] over a [`DeviceClient`]; every frame completes inside `send`.
pub struct DirectTransport<C> {
    client: C,
}

impl<C: DeviceClient> DirectTransport<C> {
    /// Wraps a client.
    pub const fn new(client: C) -> Self {
        Self { client }
    }

    /// The wrapped client.
    pub const fn client(&self) -> &C {
        &self.client
    }
}

impl<C: fmt::Debug> fmt::Debug for DirectTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectTransport")
            .field("client", &self.client)
            .finish()
    }
}

#[async_trait]
impl<C: DeviceClient> Transport for DirectTransport<C> {
    fn kind(&self) -> &'static str {
        "direct"
    }

    #[instrument(level = "debug", skip(self, frame), fields(id = frame.id, action = frame.request.action()))]
    async fn send(&self, frame: Frame) -> Result<Delivery> {
        let action = frame.request.action();
        let outcome = self.client.call(frame.request).await;
        debug!(ok = outcome.is_ok(), "direct call returned");
        Ok(Delivery::Completed(Reply::to_request(frame.id, action, outcome)))
    }

    fn export_state(&self) -> Option<TransportState> {
        self.client.export_state()
    }

    fn restore_state(&self, state: &TransportState) -> Option<DeviceState> {
        self.client.restore_state(state)
    }

    async fn close(&self) {
        self.client.close().await;
    }
}
