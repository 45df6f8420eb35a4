// D-Bus method channel and status signal

//! D-Bus bridge
//!
//! Exposes [`TunnelController`] as `dev.wgbridge.Tunnels1` at
//! `/dev/wgbridge/Tunnels` and re-emits the status stream as the
//! `StatusChanged` signal. The CLI talks to a running service through
//! [`TunnelsProxy`].

use crate::controller::TunnelController;
use crate::error::{BridgeError, ErrorKind};
use crate::status::Subscription;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface, proxy, Connection};

/// Well-known bus name
pub const BUS_NAME: &str = "dev.wgbridge.Tunnels";
/// Object path of the tunnel service
pub const OBJECT_PATH: &str = "/dev/wgbridge/Tunnels";

/// Connect to the system or session bus
pub async fn connect(bus: &str) -> Result<Connection> {
    let connection = match bus {
        "session" => Connection::session().await,
        _ => Connection::system().await,
    };
    connection.with_context(|| format!("Failed to connect to {} D-Bus", bus))
}

/// Render a facade error as a D-Bus error
pub fn to_dbus_error(err: BridgeError) -> fdo::Error {
    match err.kind() {
        ErrorKind::PermissionDenied => fdo::Error::AccessDenied(err.to_string()),
        ErrorKind::ParseError | ErrorKind::InvalidArgument => {
            fdo::Error::InvalidArgs(format!("{}: {}", err.code(), err))
        }
        _ => fdo::Error::Failed(format!("{}: {}", err.code(), err)),
    }
}

/// D-Bus object wrapping the controller
pub struct TunnelService {
    controller: Arc<TunnelController>,
}

impl TunnelService {
    /// Wrap a controller
    pub fn new(controller: Arc<TunnelController>) -> Self {
        Self { controller }
    }
}

#[interface(name = "dev.wgbridge.Tunnels1")]
impl TunnelService {
    /// Bring a tunnel up from wg-quick configuration text
    async fn start(&self, name: &str, config: &str) -> fdo::Result<()> {
        log::debug!("D-Bus Start({})", name);
        self.controller
            .start(name, config)
            .await
            .map(|_| ())
            .map_err(to_dbus_error)
    }

    /// Bring a tunnel down
    async fn stop(&self, name: &str) -> fdo::Result<()> {
        log::debug!("D-Bus Stop({})", name);
        self.controller
            .stop(name)
            .await
            .map(|_| ())
            .map_err(to_dbus_error)
    }

    /// Current (name, state, rx, tx, handshake) of a tunnel
    async fn status(&self, name: &str) -> fdo::Result<(String, String, u64, u64, u64)> {
        self.controller
            .status(name)
            .await
            .map(|status| status.to_fields())
            .map_err(to_dbus_error)
    }

    /// Tunnels referenced since the service started
    async fn tunnels(&self) -> Vec<String> {
        self.controller.known_tunnels()
    }

    /// Backend in use ("kernel" or "userspace")
    async fn backend(&self) -> fdo::Result<String> {
        self.controller
            .backend_kind()
            .await
            .map(|kind| kind.to_string())
            .map_err(to_dbus_error)
    }

    /// Emitted for every published tunnel status
    #[zbus(signal)]
    async fn status_changed(
        signal_emitter: &SignalEmitter<'_>,
        name: &str,
        state: &str,
        rx_bytes: u64,
        tx_bytes: u64,
        handshake: u64,
    ) -> zbus::Result<()>;
}

/// Client side of `dev.wgbridge.Tunnels1`
#[proxy(
    interface = "dev.wgbridge.Tunnels1",
    default_service = "dev.wgbridge.Tunnels",
    default_path = "/dev/wgbridge/Tunnels"
)]
pub trait Tunnels {
    /// Bring a tunnel up
    fn start(&self, name: &str, config: &str) -> zbus::Result<()>;

    /// Bring a tunnel down
    fn stop(&self, name: &str) -> zbus::Result<()>;

    /// Current (name, state, rx, tx, handshake) of a tunnel
    fn status(&self, name: &str) -> zbus::Result<(String, String, u64, u64, u64)>;

    /// Known tunnels
    fn tunnels(&self) -> zbus::Result<Vec<String>>;

    /// Backend in use
    fn backend(&self) -> zbus::Result<String>;

    /// Status updates
    #[zbus(signal)]
    fn status_changed(
        &self,
        name: String,
        state: String,
        rx_bytes: u64,
        tx_bytes: u64,
        handshake: u64,
    ) -> zbus::Result<()>;
}

/// A registered service; dropping it releases the bus connection
pub struct BridgeServer {
    connection: Connection,
    forwarder: JoinHandle<()>,
}

impl BridgeServer {
    /// The bus connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Stop forwarding status signals
    pub fn stop(self) {
        self.forwarder.abort();
        log::info!("D-Bus service stopped");
    }
}

/// Register the service and claim the bus name
pub async fn serve(controller: Arc<TunnelController>, bus: &str) -> Result<BridgeServer> {
    let connection = connect(bus).await?;

    let subscription = controller.subscribe();
    connection
        .object_server()
        .at(OBJECT_PATH, TunnelService::new(controller))
        .await
        .context("Failed to register D-Bus object")?;
    connection
        .request_name(BUS_NAME)
        .await
        .with_context(|| format!("Failed to acquire bus name {}", BUS_NAME))?;

    log::info!("D-Bus service {} ready at {}", BUS_NAME, OBJECT_PATH);

    let forwarder = tokio::spawn(forward_status(connection.clone(), subscription));
    Ok(BridgeServer {
        connection,
        forwarder,
    })
}

/// Emit `StatusChanged` for every status on the stream
async fn forward_status(connection: Connection, mut subscription: Subscription) {
    let iface_ref = match connection
        .object_server()
        .interface::<_, TunnelService>(OBJECT_PATH)
        .await
    {
        Ok(iface_ref) => iface_ref,
        Err(e) => {
            log::error!("Tunnel service not registered, status signals disabled: {}", e);
            return;
        }
    };

    while let Some(status) = subscription.next().await {
        let (name, state, rx, tx, handshake) = status.to_fields();
        if let Err(e) = TunnelService::status_changed(
            iface_ref.signal_emitter(),
            &name,
            &state,
            rx,
            tx,
            handshake,
        )
        .await
        {
            log::warn!("Failed to emit StatusChanged for {}: {}", name, e);
        }
    }
    log::debug!("Status stream ended, signal forwarding stopped");
}
