// Userspace backend

//! Userspace WireGuard (e.g. wireguard-go)
//!
//! The implementation process owns the interface and exposes the UAPI
//! socket under `/var/run/wireguard`. Keys and peers are applied through
//! that socket; addresses, MTU and routes are set with `ip`.

use super::{
    link_exists, read_device_statistics, run_checked, run_detached, TunnelBackend, IP_COMMAND,
};
use crate::registry::TunnelHandle;
use crate::types::{BackendKind, RawStatistics, TunnelState};
use crate::wg_config::{PeerSection, WgConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

const SOCKET_DIR: &str = "/var/run/wireguard";
const SOCKET_WAIT_ATTEMPTS: u32 = 40;
const SOCKET_WAIT_STEP: Duration = Duration::from_millis(50);
const DEFAULT_MTU: u16 = 1420;

/// Backend for a userspace WireGuard implementation
#[derive(Debug, Clone)]
pub struct UserspaceBackend {
    implementation: PathBuf,
    socket_dir: PathBuf,
    ip: String,
}

impl UserspaceBackend {
    /// Create a backend spawning `implementation` for each interface
    pub fn new(implementation: impl AsRef<Path>) -> Self {
        Self {
            implementation: implementation.as_ref().to_path_buf(),
            socket_dir: PathBuf::from(SOCKET_DIR),
            ip: IP_COMMAND.to_string(),
        }
    }

    /// Configure links with a different `ip` program
    pub fn with_ip_command(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", name))
    }

    async fn is_up(&self, name: &str) -> Result<bool> {
        if !self.socket_path(name).exists() {
            return Ok(false);
        }
        link_exists(&self.ip, name).await
    }

    /// Start the implementation for `name` unless it already runs
    async fn ensure_interface(&self, name: &str) -> Result<()> {
        let socket = self.socket_path(name);
        if socket.exists() {
            return Ok(());
        }

        let program = self.implementation.to_string_lossy();
        log::info!("Starting {} for interface {}", program, name);
        run_detached(&program, &[name]).await?;

        for _ in 0..SOCKET_WAIT_ATTEMPTS {
            if socket.exists() {
                return Ok(());
            }
            tokio::time::sleep(SOCKET_WAIT_STEP).await;
        }
        anyhow::bail!("{} did not create {}", program, socket.display())
    }

    async fn apply_device(&self, name: &str, config: &WgConfig) -> Result<()> {
        let iface: InterfaceName = name
            .parse()
            .with_context(|| format!("Invalid interface name: {}", name))?;
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            device_update(&config)?
                .apply(&iface, Backend::Userspace)
                .context("Failed to apply device configuration")
        })
        .await
        .context("Device update task panicked")?
    }

    async fn configure_link(&self, name: &str, config: &WgConfig) -> Result<()> {
        for (addr, prefix) in &config.interface.addresses {
            let cidr = format!("{}/{}", addr, prefix);
            run_checked(
                &self.ip,
                &["address", "add", cidr.as_str(), "dev", name],
                Some("File exists"),
            )
            .await?;
        }

        let mtu = config.interface.mtu.unwrap_or(DEFAULT_MTU).to_string();
        run_checked(
            &self.ip,
            &["link", "set", "dev", name, "mtu", mtu.as_str(), "up"],
            None,
        )
        .await?;

        for peer in &config.peers {
            for (addr, prefix) in &peer.allowed_ips {
                if *prefix == 0 {
                    log::warn!(
                        "Skipping default route {}/0 on {}: full-tunnel routing is not managed",
                        addr,
                        name
                    );
                    continue;
                }
                let cidr = format!("{}/{}", addr, prefix);
                run_checked(
                    &self.ip,
                    &["route", "replace", cidr.as_str(), "dev", name],
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn bring_up(&self, name: &str, config: Option<&WgConfig>) -> Result<()> {
        let config = config.with_context(|| format!("No configuration for tunnel {}", name))?;

        log::info!("Bringing up userspace WireGuard interface: {}", name);
        self.ensure_interface(name).await?;
        self.apply_device(name, config).await?;
        self.configure_link(name, config).await?;
        log::info!("WireGuard interface {} is up", name);
        Ok(())
    }

    async fn bring_down(&self, name: &str) -> Result<()> {
        log::info!("Bringing down userspace WireGuard interface: {}", name);
        // The implementation exits once its link is gone
        run_checked(
            &self.ip,
            &["link", "delete", "dev", name],
            Some("Cannot find device"),
        )
        .await?;
        log::info!("WireGuard interface {} is down", name);
        Ok(())
    }
}

#[async_trait]
impl TunnelBackend for UserspaceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Userspace
    }

    async fn set_state(
        &self,
        tunnel: &TunnelHandle,
        desired: TunnelState,
        config: Option<&WgConfig>,
    ) -> Result<TunnelState> {
        let name = tunnel.name();
        let current = self.get_state(tunnel).await?;
        let target = desired.resolve(current);

        if target == TunnelState::Up {
            if current == TunnelState::Up {
                self.bring_down(name).await?;
                tunnel.on_state_change(TunnelState::Down);
            }
            self.bring_up(name, config).await?;
        } else {
            if current == TunnelState::Down && !link_exists(&self.ip, name).await? {
                log::debug!("Tunnel {} already down", name);
                return Ok(TunnelState::Down);
            }
            self.bring_down(name).await?;
        }

        tunnel.on_state_change(target);
        Ok(target)
    }

    async fn get_state(&self, tunnel: &TunnelHandle) -> Result<TunnelState> {
        if self.is_up(tunnel.name()).await? {
            Ok(TunnelState::Up)
        } else {
            Ok(TunnelState::Down)
        }
    }

    async fn get_statistics(&self, tunnel: &TunnelHandle) -> Result<RawStatistics> {
        if !self.is_up(tunnel.name()).await? {
            return Ok(RawStatistics::default());
        }
        read_device_statistics(tunnel.name(), Backend::Userspace).await
    }
}

fn parse_key(value: &str, what: &str) -> Result<Key> {
    Key::from_base64(value).map_err(|_| anyhow!("Invalid {}", what))
}

/// Resolve `host:port`, taking the first address
fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    endpoint
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve endpoint {}", endpoint))?
        .next()
        .with_context(|| format!("Endpoint {} has no addresses", endpoint))
}

fn peer_builder(peer: &PeerSection) -> Result<PeerConfigBuilder> {
    let public_key = parse_key(&peer.public_key, "peer public key")?;
    let mut builder = PeerConfigBuilder::new(&public_key).replace_allowed_ips();

    if let Some(psk) = &peer.preshared_key {
        builder = builder.set_preshared_key(parse_key(psk, "preshared key")?);
    }
    if let Some(endpoint) = &peer.endpoint {
        builder = builder.set_endpoint(resolve_endpoint(endpoint)?);
    }
    if let Some(interval) = peer.persistent_keepalive {
        builder = builder.set_persistent_keepalive_interval(interval);
    }
    for (addr, prefix) in &peer.allowed_ips {
        builder = builder.add_allowed_ip(*addr, *prefix);
    }

    Ok(builder)
}

/// Full replacement of keys and peers
fn device_update(config: &WgConfig) -> Result<DeviceUpdate> {
    let private_key = parse_key(&config.interface.private_key, "private key")?;
    let mut update = DeviceUpdate::new()
        .set_private_key(private_key)
        .replace_peers();

    if let Some(port) = config.interface.listen_port {
        update = update.set_listen_port(port);
    }
    if let Some(mark) = config.interface.fwmark {
        update = update.set_fwmark(mark);
    }

    let peers = config
        .peers
        .iter()
        .map(peer_builder)
        .collect::<Result<Vec<_>>>()?;
    Ok(update.add_peers(&peers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::VALID_CONFIG;

    #[test]
    fn test_socket_path() {
        let backend = UserspaceBackend::new("/usr/bin/wireguard-go");
        assert_eq!(
            backend.socket_path("home"),
            PathBuf::from("/var/run/wireguard/home.sock")
        );
    }

    #[test]
    fn test_resolve_literal_endpoints() {
        assert_eq!(
            resolve_endpoint("203.0.113.1:51820").unwrap(),
            "203.0.113.1:51820".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_endpoint("[2001:db8::1]:51820").unwrap(),
            "[2001:db8::1]:51820".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_device_update_from_config() {
        let config = WgConfig::parse(VALID_CONFIG).unwrap();
        assert!(device_update(&config).is_ok());
    }

    #[test]
    fn test_peer_builder_rejects_bad_preshared_key() {
        let config = WgConfig::parse(VALID_CONFIG).unwrap();
        let mut peer = config.peers[0].clone();
        peer.preshared_key = Some("not-a-key".to_string());
        assert!(peer_builder(&peer).is_err());
    }

    #[tokio::test]
    async fn test_stop_fails_when_link_cannot_be_queried() {
        let backend =
            UserspaceBackend::new("/usr/bin/wireguard-go").with_ip_command("/nonexistent/ip");
        let (registry, _events) = crate::registry::TunnelRegistry::with_channel();
        let tunnel = registry.resolve("wgb-test0");

        assert!(backend
            .set_state(&tunnel, TunnelState::Down, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bring_up_requires_config() {
        let backend = UserspaceBackend::new("/usr/bin/wireguard-go");
        let err = backend.bring_up("home", None).await.unwrap_err();
        assert!(err.to_string().contains("No configuration"));
    }
}
