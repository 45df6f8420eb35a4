// Tunnel backends and backend selection

//! Backend adapter
//!
//! A [`TunnelBackend`] drives tunnels through one WireGuard implementation.
//! [`select_backend`] picks the implementation once per process from what
//! the [`HostEnvironment`] advertises: the kernel module when it is loaded
//! and a privileged shell is available, otherwise the userspace
//! implementation.

pub mod kernel;
pub mod userspace;

use crate::error::BridgeError;
use crate::registry::TunnelHandle;
use crate::types::{
    BackendConfig, BackendKind, BackendPreference, PeerStatistics, RawStatistics, TunnelState,
};
use crate::wg_config::WgConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use wireguard_control::{Backend, Device, InterfaceName};

pub use kernel::KernelBackend;
pub use userspace::UserspaceBackend;

/// Engine that establishes and tears down tunnels
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Which implementation this is
    fn kind(&self) -> BackendKind;

    /// Drive the tunnel to `desired` (`Toggling` flips the current state) and
    /// return the resulting state. Implementations call
    /// [`TunnelHandle::on_state_change`] after every transition they make.
    async fn set_state(
        &self,
        tunnel: &TunnelHandle,
        desired: TunnelState,
        config: Option<&WgConfig>,
    ) -> Result<TunnelState>;

    /// Current operational state
    async fn get_state(&self, tunnel: &TunnelHandle) -> Result<TunnelState>;

    /// Per-peer counters; empty for a tunnel that is down
    async fn get_statistics(&self, tunnel: &TunnelHandle) -> Result<RawStatistics>;
}

/// What the host offers for running tunnels
pub trait HostEnvironment: Send + Sync {
    /// The WireGuard kernel module is available
    fn has_kernel_support(&self) -> bool;

    /// Obtain a shell able to run wg-quick with root privileges
    fn acquire_privileged_shell(&self) -> Result<()>;

    /// Construct the kernel backend
    fn kernel_backend(&self) -> Result<Arc<dyn TunnelBackend>>;

    /// Construct the userspace backend
    fn userspace_backend(&self) -> Result<Arc<dyn TunnelBackend>>;
}

/// Pick the backend for this process.
///
/// With [`BackendPreference::Auto`], a failing privileged-shell probe only
/// disables the kernel path; the error is logged and selection falls back
/// to userspace. Only when no backend can be constructed does selection
/// fail.
pub fn select_backend(
    host: &dyn HostEnvironment,
    preference: BackendPreference,
) -> Result<Arc<dyn TunnelBackend>, BridgeError> {
    let backend = match preference {
        BackendPreference::Auto => match try_kernel(host) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                log::info!("Kernel backend unavailable ({:#}), using userspace", e);
                host.userspace_backend()
            }
        },
        BackendPreference::Kernel => try_kernel(host),
        BackendPreference::Userspace => host.userspace_backend(),
    };

    match backend {
        Ok(backend) => {
            log::info!("Using {} WireGuard backend", backend.kind());
            Ok(backend)
        }
        Err(e) => {
            log::error!("No usable WireGuard backend: {:#}", e);
            Err(BridgeError::Initialization(format!("{:#}", e)))
        }
    }
}

fn try_kernel(host: &dyn HostEnvironment) -> Result<Arc<dyn TunnelBackend>> {
    if !host.has_kernel_support() {
        anyhow::bail!("WireGuard kernel module not available");
    }
    host.acquire_privileged_shell()
        .context("Privileged shell unavailable")?;
    host.kernel_backend()
}

/// The running Linux host
#[derive(Debug, Clone)]
pub struct SystemHost {
    config: BackendConfig,
}

impl SystemHost {
    /// Probe the host using the given backend settings
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl HostEnvironment for SystemHost {
    fn has_kernel_support(&self) -> bool {
        Path::new("/sys/module/wireguard").exists()
    }

    fn acquire_privileged_shell(&self) -> Result<()> {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            anyhow::bail!("not running as root (euid {})", euid);
        }
        find_in_path("wg-quick").context("wg-quick not found in PATH")?;
        Ok(())
    }

    fn kernel_backend(&self) -> Result<Arc<dyn TunnelBackend>> {
        Ok(Arc::new(KernelBackend::new(&self.config.config_dir)))
    }

    fn userspace_backend(&self) -> Result<Arc<dyn TunnelBackend>> {
        let implementation = &self.config.userspace_implementation;
        let path = find_in_path(implementation)
            .with_context(|| format!("{} not found in PATH", implementation))?;
        log::debug!("Userspace implementation: {}", path.display());
        Ok(Arc::new(UserspaceBackend::new(path)))
    }
}

/// Locate an executable on PATH
fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Program used for link queries and configuration
pub(crate) const IP_COMMAND: &str = "ip";

/// Whether a network interface exists.
///
/// A non-zero exit of `ip link show` means the link is absent; failing to
/// run `ip` at all is an error.
pub(crate) async fn link_exists(ip: &str, name: &str) -> Result<bool> {
    let output = Command::new(ip)
        .args(["link", "show", name])
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to query link {} with {}", name, ip))?;

    Ok(output.status.success())
}

/// Run a command and fail on a non-zero exit, unless stderr contains `tolerated`
pub(crate) async fn run_checked(
    program: &str,
    args: &[&str],
    tolerated: Option<&str>,
) -> Result<Output> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute {} {}", program, args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        match tolerated {
            Some(pattern) if stderr.contains(pattern) => {
                log::debug!("{} {}: {}", program, args.join(" "), stderr.trim());
            }
            _ => anyhow::bail!("{} {} failed: {}", program, args.join(" "), stderr.trim()),
        }
    }

    Ok(output)
}

/// Run a program that may leave a daemon behind, waiting only for its exit.
///
/// Output is discarded: a forked child holding inherited pipes would keep
/// `output()` waiting for as long as the daemon lives.
pub(crate) async fn run_detached(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("Failed to execute {} {}", program, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("{} {} failed: {}", program, args.join(" "), status);
    }
    Ok(())
}

/// Read peer counters of a WireGuard device
pub(crate) async fn read_device_statistics(name: &str, backend: Backend) -> Result<RawStatistics> {
    let iface: InterfaceName = name
        .parse()
        .with_context(|| format!("Invalid interface name: {}", name))?;

    tokio::task::spawn_blocking(move || {
        let device =
            Device::get(&iface, backend).context("Failed to get WireGuard device info")?;
        Ok::<RawStatistics, anyhow::Error>(device_statistics(&device))
    })
    .await
    .context("Device query task panicked")?
}

fn device_statistics(device: &Device) -> RawStatistics {
    RawStatistics {
        peers: device
            .peers
            .iter()
            .map(|peer| PeerStatistics {
                public_key: peer.config.public_key.to_base64(),
                rx_bytes: peer.stats.rx_bytes,
                tx_bytes: peer.stats.tx_bytes,
                last_handshake_millis: epoch_millis(peer.stats.last_handshake_time),
            })
            .collect(),
    }
}

/// Milliseconds since the epoch, 0 for never
fn epoch_millis(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
