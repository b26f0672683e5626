//! The transport session.
//!
//! [`TransportSession`] owns one logical connection to a signer. It is the
//! only place that tracks outstanding requests: every request gets a fresh
//! [`CorrelationId`], a deadline and a one-shot channel, and replies are
//! matched back purely by id, so bridged transports may deliver them in any
//! order.
//!
//! Hardware signers cannot multiplex, so logical operations are serialized.
//! An operation starts with [`TransportSession::begin`], which returns a
//! [`Flight`]; only a flight can issue requests, and at most one flight
//! exists per session at a time. Whether a second caller waits or fails
//! with [`Error::Busy`] is set by [`BusyPolicy`].
//!
//! # Lifecycle
//!
//! ```text
//!   ┌──────────────┐ connect / connect_bypassable ┌─────────────┐
//!   │ disconnected │ ───────────────────────────▶ │  connected  │──┐ resync
//!   └──────────────┘ ◀─────────────────────────── └─────────────┘◀─┘
//!                     disconnect / send failure
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use crate::config::BusyPolicy;
use crate::error::{Error, Result};
use crate::pairing::Credentials;
use crate::store::OwnerId;
use crate::transport::protocol::ConnectParams;
use crate::transport::{
    CorrelationId, Delivery, DeviceRequest, DeviceResponse, DeviceState, FirmwareVersion, Frame,
    Reply, Transport, TransportState, reply_action,
};

/// Opaque handle of an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Numeric value, for logs.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Runtime state of a connection. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Connection handle.
    pub handle: SessionHandle,
    /// Wallet the signer is currently pointed at, as last observed.
    pub active_owner: Option<OwnerId>,
    /// Firmware version reported by the signer.
    pub firmware: FirmwareVersion,
    /// `false` when the state was rehydrated from a cache, or marked stale,
    /// and has not been confirmed with the signer since.
    pub fully_synced: bool,
}

struct PendingRequest {
    action: &'static str,
    deadline: Instant,
    tx: oneshot::Sender<Result<DeviceResponse>>,
}

/// Correlation map from request ids to their waiters.
#[derive(Default)]
struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Correlator {
    fn register(
        &self,
        action: &'static str,
        timeout: Duration,
    ) -> (CorrelationId, oneshot::Receiver<Result<DeviceResponse>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let mut pending = self.pending.lock();
        pending.retain(|stale_id, entry| {
            let live = entry.deadline > now && !entry.tx.is_closed();
            if !live {
                debug!(id = stale_id, action = entry.action, "sweeping expired request");
            }
            live
        });
        pending.insert(
            id,
            PendingRequest {
                action,
                deadline: now + timeout,
                tx,
            },
        );
        (id, rx)
    }

    /// Routes a reply to its waiter. Returns `false` if it was dropped.
    fn resolve(&self, reply: Reply) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.remove(&reply.id) else {
            debug!(id = reply.id, action = %reply.action, "dropping reply for unknown or expired request");
            return false;
        };
        if reply.action != reply_action(entry.action) {
            debug!(
                id = reply.id,
                expected = entry.action,
                got = %reply.action,
                "dropping reply with mismatched action"
            );
            pending.insert(reply.id, entry);
            return false;
        }
        drop(pending);

        if entry.tx.send(reply.outcome).is_err() {
            debug!(id = reply.id, "waiter went away before the reply arrived");
            return false;
        }
        true
    }

    fn cancel(&self, id: CorrelationId) {
        self.pending.lock().remove(&id);
    }

    /// Drops every waiter; they observe [`Error::Disconnected`].
    fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(Error::Disconnected));
        }
        count
    }

    fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

/// One logical connection to a signer.
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    policy: BusyPolicy,
    request_timeout: Duration,
    flight: AsyncMutex<()>,
    correlator: Arc<Correlator>,
    state: Mutex<Option<Session>>,
    next_handle: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("transport", &self.transport.kind())
            .field("policy", &self.policy)
            .field("state", &*self.state.lock())
            .field("outstanding", &self.correlator.outstanding())
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    /// Creates a disconnected session over `transport`.
    ///
    /// `request_timeout` bounds the handshake and identity queries issued by
    /// the session itself.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: BusyPolicy, request_timeout: Duration) -> Self {
        Self {
            transport,
            policy,
            request_timeout,
            flight: AsyncMutex::new(()),
            correlator: Arc::new(Correlator::default()),
            state: Mutex::new(None),
            next_handle: AtomicU64::new(0),
            pump: Mutex::new(None),
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Starts a logical operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] under [`BusyPolicy::FailFast`] if another
    /// operation is in flight.
    pub async fn begin(&self) -> Result<Flight<'_>> {
        let guard = match self.policy {
            BusyPolicy::Queue => self.flight.lock().await,
            BusyPolicy::FailFast => self.flight.try_lock().map_err(|_| Error::Busy)?,
        };
        Ok(Flight {
            session: self,
            _guard: guard,
        })
    }

    /// Snapshot of the current connection, if any.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.state.lock().clone()
    }

    /// Returns `true` while connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Last observed active wallet.
    #[must_use]
    pub fn active_owner(&self) -> Option<OwnerId> {
        self.state.lock().as_ref().and_then(|s| s.active_owner.clone())
    }

    /// Firmware of the connected signer.
    #[must_use]
    pub fn firmware(&self) -> Option<FirmwareVersion> {
        self.state.lock().as_ref().map(|s| s.firmware)
    }

    /// Returns `true` if the next identity check should consult the signer first.
    #[must_use]
    pub fn needs_full_sync(&self) -> bool {
        self.state.lock().as_ref().is_some_and(|s| !s.fully_synced)
    }

    /// Marks the cached identity as untrusted; the next identity check resyncs.
    pub fn mark_stale(&self) {
        if let Some(session) = self.state.lock().as_mut() {
            session.fully_synced = false;
        }
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.correlator.outstanding()
    }

    /// Device state the transport can rehydrate from later. Never does I/O.
    #[must_use]
    pub fn export_state(&self) -> Option<TransportState> {
        self.transport.export_state()
    }

    /// Tears the connection down.
    ///
    /// Does not wait for the current flight: outstanding requests fail with
    /// [`Error::Disconnected`] and any late reply is dropped. Safe to call
    /// while disconnected.
    pub async fn disconnect(&self) {
        let cancelled = self.correlator.cancel_all();
        let previous = self.state.lock().take();
        if previous.is_some() || cancelled > 0 {
            info!(cancelled, transport = self.transport.kind(), "session disconnected");
        }
        self.transport.close().await;
    }

    fn ensure_pump(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let Some(mut inbound) = self.transport.take_inbound() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let correlator = Arc::clone(&self.correlator);
        debug!(transport = transport.kind(), "starting inbound pump");
        *pump = Some(tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Some(reply) = transport.accept(message) {
                    correlator.resolve(reply);
                }
            }
            debug!("inbound channel closed");
        }));
    }

    fn install(&self, device: DeviceState, fully_synced: bool) -> Session {
        let mut state = self.state.lock();
        let handle = match state.as_ref() {
            Some(existing) => existing.handle,
            None => SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1),
        };
        let session = Session {
            handle,
            active_owner: device.active_owner,
            firmware: device.firmware,
            fully_synced,
        };
        *state = Some(session.clone());
        session
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Exclusive right to talk to the signer for one logical operation.
pub struct Flight<'a> {
    session: &'a TransportSession,
    _guard: AsyncMutexGuard<'a, ()>,
}

impl fmt::Debug for Flight<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flight").field("session", self.session).finish()
    }
}

impl<'a> Flight<'a> {
    /// The session this flight belongs to.
    #[must_use]
    pub const fn session(&self) -> &'a TransportSession {
        self.session
    }

    /// Sends one correlated request and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no reply arrives within `timeout`
    /// - [`Error::Disconnected`] if the session is torn down meanwhile
    /// - the signer's own error, typically [`Error::TransportRejected`]
    pub async fn request(&self, request: DeviceRequest, timeout: Duration) -> Result<DeviceResponse> {
        let session = self.session;
        let action = request.action();
        let (id, mut rx) = session.correlator.register(action, timeout);
        session.ensure_pump();
        debug!(id, action, transport = session.transport.kind(), "sending request");

        // A cancellation resolves `rx` while a direct send may still be
        // waiting on the device; the send is dropped in that case.
        let exchange = async {
            tokio::select! {
                biased;
                cancelled = &mut rx => return cancelled.unwrap_or(Err(Error::Disconnected)),
                sent = session.transport.send(Frame { id, request }) => match sent {
                    Ok(Delivery::Completed(reply)) => {
                        session.correlator.resolve(reply);
                    }
                    Ok(Delivery::Deferred) => {}
                    Err(err) => {
                        warn!(id, action, error = %err, "transport failed to send, dropping session");
                        session.state.lock().take();
                        return Err(err);
                    }
                },
            }
            rx.await.unwrap_or(Err(Error::Disconnected))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => {
                session.correlator.cancel(id);
                outcome
            }
            Err(_) => {
                session.correlator.cancel(id);
                debug!(id, action, "request timed out");
                Err(Error::Timeout {
                    action: action.to_string(),
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Establishes the connection, or returns the existing one.
    ///
    /// With `force_resync` an existing connection is renegotiated, which is
    /// what a device or card swap requires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the signer refuses or answers
    /// with something other than its state, and [`Error::Timeout`] if it
    /// does not answer.
    pub async fn connect(&self, credentials: Option<&Credentials>, force_resync: bool) -> Result<Session> {
        if !force_resync && let Some(existing) = self.session.current() {
            return Ok(existing);
        }

        let request = DeviceRequest::Connect(ConnectParams {
            credentials: credentials.cloned(),
        });
        let device = match self.request(request, self.session.request_timeout).await {
            Ok(DeviceResponse::Connected(device)) => device,
            Ok(other) => {
                return Err(Error::ConnectionFailed(format!(
                    "signer answered connect with {}",
                    other.kind()
                )));
            }
            Err(Error::TransportRejected(reason)) => return Err(Error::ConnectionFailed(reason)),
            Err(Error::Disconnected) => {
                return Err(Error::ConnectionFailed("session closed during handshake".to_string()));
            }
            Err(err) => return Err(err),
        };

        let session = self.session.install(device, true);
        info!(
            handle = session.handle.get(),
            firmware = %session.firmware,
            owner = ?session.active_owner,
            "connected to signer"
        );
        Ok(session)
    }

    /// Connects, preferring to rehydrate from `cached` without a handshake.
    ///
    /// Returns the session and whether an existing or cached state was
    /// reused. A rehydrated session is not fully synced, so the identity
    /// guard will confirm the wallet with the signer before trusting a
    /// mismatch. Only safe on the signing path: discovery must always
    /// reflect the attached device.
    ///
    /// # Errors
    ///
    /// See [`Flight::connect`].
    pub async fn connect_bypassable(
        &self,
        cached: Option<&TransportState>,
        credentials: Option<&Credentials>,
    ) -> Result<(Session, bool)> {
        if let Some(existing) = self.session.current() {
            return Ok((existing, true));
        }
        if let Some(device) = cached.and_then(|state| self.session.transport.restore_state(state)) {
            let session = self.session.install(device, false);
            debug!(handle = session.handle.get(), "session rehydrated from cached state");
            return Ok((session, true));
        }
        Ok((self.connect(credentials, false).await?, false))
    }

    /// Asks the signer which wallet is active and records the answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if not connected, the request's
    /// error, or [`Error::UnexpectedResponse`].
    pub async fn resync(&self) -> Result<Option<OwnerId>> {
        if !self.session.is_connected() {
            return Err(Error::Disconnected);
        }
        let owner = match self
            .request(DeviceRequest::FetchActiveWallet, self.session.request_timeout)
            .await?
        {
            DeviceResponse::ActiveWallet(owner) => owner,
            other => {
                return Err(Error::UnexpectedResponse(format!(
                    "expected active wallet, got {}",
                    other.kind()
                )));
            }
        };

        if let Some(session) = self.session.state.lock().as_mut() {
            session.active_owner.clone_from(&owner);
            session.fully_synced = true;
        }
        debug!(owner = ?owner, "active wallet resynced");
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::direct::{DeviceClient, DirectTransport};
    use crate::transport::software::{Faults, SoftwareDevice, state_blob};

    fn session_over(device: Arc<SoftwareDevice>, policy: BusyPolicy) -> TransportSession {
        TransportSession::new(
            Arc::new(DirectTransport::new(device)),
            policy,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = session_over(Arc::clone(&device), BusyPolicy::Queue);
        let flight = session.begin().await.unwrap();

        let first = flight.connect(None, false).await.unwrap();
        let second = flight.connect(None, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(device.requests(), vec!["connect"]);

        device.set_active(Some(OwnerId::new("b")));
        let forced = flight.connect(None, true).await.unwrap();
        assert_eq!(forced.handle, first.handle);
        assert_eq!(forced.active_owner, Some(OwnerId::new("b")));
    }

    #[tokio::test]
    async fn rejected_handshake_is_connection_failure() {
        let device = Arc::new(
            SoftwareDevice::new(OwnerId::new("a")).with_pairing(Credentials::new("dev", "pw")),
        );
        let session = session_over(device, BusyPolicy::Queue);
        let flight = session.begin().await.unwrap();
        let err = flight.connect(None, false).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn rehydrated_session_is_not_fully_synced() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = session_over(Arc::clone(&device), BusyPolicy::Queue);
        let flight = session.begin().await.unwrap();

        let cached = state_blob(Some(&OwnerId::new("a")), FirmwareVersion::new(0, 15, 0));
        let (rehydrated, reused) = flight.connect_bypassable(Some(&cached), None).await.unwrap();
        assert!(reused);
        assert!(!rehydrated.fully_synced);
        assert!(device.requests().is_empty());

        flight.resync().await.unwrap();
        assert!(!session.needs_full_sync());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_pending_request() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        device.set_faults(Faults {
            delay: Some(Duration::from_secs(10)),
            ..Faults::default()
        });
        let session = session_over(device, BusyPolicy::Queue);
        let flight = session.begin().await.unwrap();

        let err = flight
            .request(DeviceRequest::FetchActiveWallet, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { millis: 50, .. }));
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn fail_fast_rejects_second_flight() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = session_over(device, BusyPolicy::FailFast);
        let _flight = session.begin().await.unwrap();
        assert!(matches!(session.begin().await, Err(Error::Busy)));
    }

    #[derive(Debug)]
    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        fn kind(&self) -> &'static str {
            "silent"
        }

        async fn send(&self, _frame: Frame) -> Result<Delivery> {
            Ok(Delivery::Deferred)
        }
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_requests() {
        let session = Arc::new(TransportSession::new(
            Arc::new(Silent),
            BusyPolicy::Queue,
            Duration::from_secs(5),
        ));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let flight = session.begin().await?;
                flight
                    .request(DeviceRequest::FetchActiveWallet, Duration::from_secs(30))
                    .await
            })
        };
        while session.outstanding() == 0 {
            tokio::task::yield_now().await;
        }
        session.disconnect().await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_interrupts_a_direct_call_in_progress() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        device.set_faults(Faults {
            delay: Some(Duration::from_secs(30)),
            ..Faults::default()
        });
        let session = Arc::new(session_over(Arc::clone(&device), BusyPolicy::Queue));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let flight = session.begin().await?;
                flight
                    .request(DeviceRequest::FetchActiveWallet, Duration::from_secs(60))
                    .await
            })
        };
        while device.requests().is_empty() {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        session.disconnect().await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::Disconnected)));
        assert_eq!(started.elapsed(), Duration::ZERO);

        let _flight = session.begin().await.unwrap();
        assert_eq!(session.outstanding(), 0);
    }

    #[test]
    fn correlator_drops_unknown_and_mismatched_replies() {
        let correlator = Correlator::default();
        let (id, mut rx) = correlator.register("get-addresses", Duration::from_secs(5));

        let unknown = Reply::to_request(id + 100, "get-addresses", Ok(DeviceResponse::Addresses(vec![])));
        assert!(!correlator.resolve(unknown));

        let mismatched = Reply::to_request(id, "sign-message", Ok(DeviceResponse::Addresses(vec![])));
        assert!(!correlator.resolve(mismatched));
        assert_eq!(correlator.outstanding(), 1);

        let matching = Reply::to_request(id, "get-addresses", Ok(DeviceResponse::Addresses(vec![])));
        assert!(correlator.resolve(matching));
        assert!(matches!(rx.try_recv(), Ok(Ok(DeviceResponse::Addresses(_)))));

        let late = Reply::to_request(id, "get-addresses", Ok(DeviceResponse::Addresses(vec![])));
        assert!(!correlator.resolve(late));
    }

    #[test]
    fn correlation_ids_are_fresh() {
        let correlator = Correlator::default();
        let (a, _rx_a) = correlator.register("connect", Duration::from_secs(1));
        correlator.cancel(a);
        let (b, _rx_b) = correlator.register("connect", Duration::from_secs(1));
        assert_ne!(a, b);
    }

    #[derive(Debug)]
    struct Wrong;

    #[async_trait]
    impl DeviceClient for Wrong {
        async fn call(&self, _request: DeviceRequest) -> Result<DeviceResponse> {
            Ok(DeviceResponse::Addresses(vec![]))
        }
    }

    #[tokio::test]
    async fn wrong_handshake_answer_is_connection_failure() {
        let session = TransportSession::new(
            Arc::new(DirectTransport::new(Wrong)),
            BusyPolicy::Queue,
            Duration::from_secs(1),
        );
        let flight = session.begin().await.unwrap();
        assert!(matches!(
            flight.connect(None, false).await,
            Err(Error::ConnectionFailed(_))
        ));
    }
}
