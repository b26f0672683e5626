//! Fixtures shared by the integration tests: a software signer reachable
//! directly or through a loopback bridge.

#![allow(dead_code)]

use std::sync::Arc;

use hw_keyring_core::transport::bridge::{
    BridgeMessage, BridgePort, BridgeReply, BridgeTransport, InboundSender,
};
use hw_keyring_core::transport::direct::{DeviceClient, DirectTransport};
use hw_keyring_core::transport::software::SoftwareDevice;
use hw_keyring_core::transport::{DeviceRequest, InboundMessage, Transport};
use hw_keyring_core::{Error, HardwareKeyring, KeyringConfig, OwnerId, Result};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Origin the bridged signer answers from.
pub const BRIDGE_ORIGIN: &str = "https://connect.example.com";

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn owner(id: &str) -> OwnerId {
    OwnerId::new(id)
}

/// How the keyring reaches the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Direct,
    Bridge,
}

/// The other side of a bridge: answers every posted request from a
/// [`SoftwareDevice`] on a spawned task.
#[derive(Debug)]
pub struct Loopback {
    device: Arc<SoftwareDevice>,
    inbound: Mutex<Option<InboundSender>>,
    reply_origin: Mutex<String>,
    posted: Mutex<Vec<BridgeMessage>>,
}

impl Loopback {
    pub fn new(device: Arc<SoftwareDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            inbound: Mutex::new(None),
            reply_origin: Mutex::new(BRIDGE_ORIGIN.to_string()),
            posted: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, inbound: InboundSender) {
        *self.inbound.lock() = Some(inbound);
    }

    /// Makes replies claim another origin.
    pub fn answer_from(&self, origin: &str) {
        *self.reply_origin.lock() = origin.to_string();
    }

    pub fn posted(&self) -> Vec<BridgeMessage> {
        self.posted.lock().clone()
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackPort(pub Arc<Loopback>);

impl BridgePort for LoopbackPort {
    fn post(&self, message: &BridgeMessage) -> Result<()> {
        let loopback = &self.0;
        loopback.posted.lock().push(message.clone());
        if message.message_id.is_none() {
            return Ok(());
        }

        let inbound = loopback
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| Error::ConnectionFailed("loopback not attached".to_string()))?;
        let origin = loopback.reply_origin.lock().clone();
        let device = Arc::clone(&loopback.device);
        let message = message.clone();

        tokio::spawn(async move {
            let outcome = match DeviceRequest::from_parts(&message.action, message.params.clone()) {
                Ok(request) => device.call(request).await,
                Err(err) => Err(err),
            };
            let reply = BridgeReply::answer(&message, outcome).expect("encodable reply");
            let _ = inbound.send(InboundMessage {
                origin,
                data: serde_json::to_value(reply).expect("serializable reply"),
            });
        });
        Ok(())
    }
}

/// A keyring wired to a software signer.
#[derive(Debug)]
pub struct Harness {
    pub device: Arc<SoftwareDevice>,
    pub keyring: HardwareKeyring,
    pub loopback: Option<Arc<Loopback>>,
    pub bridge: Option<Arc<BridgeTransport<LoopbackPort>>>,
}

impl Harness {
    pub fn new(wire: Wire, device: SoftwareDevice, config: KeyringConfig) -> Self {
        Self::build(wire, Arc::new(device), config, true)
    }

    /// Like [`Harness::new`], but a bridge is left waiting for readiness.
    pub fn unready(device: SoftwareDevice, config: KeyringConfig) -> Self {
        Self::build(Wire::Bridge, Arc::new(device), config, false)
    }

    /// Another keyring over the same signer, as after a restart.
    pub fn restart(&self, wire: Wire, config: KeyringConfig) -> Self {
        Self::build(wire, Arc::clone(&self.device), config, true)
    }

    fn build(wire: Wire, device: Arc<SoftwareDevice>, config: KeyringConfig, ready: bool) -> Self {
        init_tracing();
        let (transport, loopback, bridge): (Arc<dyn Transport>, _, _) = match wire {
            Wire::Direct => (
                Arc::new(DirectTransport::new(Arc::clone(&device))),
                None,
                None,
            ),
            Wire::Bridge => {
                let loopback = Loopback::new(Arc::clone(&device));
                let (transport, inbound) =
                    BridgeTransport::new(LoopbackPort(Arc::clone(&loopback)), BRIDGE_ORIGIN);
                loopback.attach(inbound);
                if ready {
                    transport.mark_ready().expect("nothing queued yet");
                }
                let transport = Arc::new(transport);
                (
                    Arc::clone(&transport) as Arc<dyn Transport>,
                    Some(loopback),
                    Some(transport),
                )
            }
        };
        Self {
            keyring: HardwareKeyring::new(config, transport).expect("valid config"),
            device,
            loopback,
            bridge,
        }
    }
}

/// Yields until `condition` holds.
pub async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
