// Shared types between backends, the status hub and the bridge

//! Shared data structures
//!
//! Tunnel state and status snapshots, the raw per-peer statistics a backend
//! reports, and the TOML configuration structures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelState {
    /// Interface is up and configured
    #[serde(rename = "UP")]
    Up,
    /// Interface does not exist
    #[serde(rename = "DOWN")]
    Down,
    /// Transition in progress; as a request, flips the current state
    #[serde(rename = "TOGGLE")]
    Toggling,
}

impl TunnelState {
    /// Wire name used on the event channel
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Up => "UP",
            TunnelState::Down => "DOWN",
            TunnelState::Toggling => "TOGGLE",
        }
    }

    /// Resolve a requested state against the current one (`Toggling` flips)
    pub fn resolve(self, current: TunnelState) -> TunnelState {
        match self {
            TunnelState::Toggling => match current {
                TunnelState::Up => TunnelState::Down,
                _ => TunnelState::Up,
            },
            desired => desired,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated status snapshot of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    /// Tunnel name
    pub name: String,
    /// Operational state
    pub state: TunnelState,
    /// Bytes received, summed over peers
    pub rx_bytes: u64,
    /// Bytes transmitted, summed over peers
    pub tx_bytes: u64,
    /// Latest handshake across all peers, epoch millis (0 if never)
    pub latest_handshake_millis: u64,
}

impl TunnelStatus {
    /// Status of a tunnel with no traffic and no handshake
    pub fn empty(name: &str, state: TunnelState) -> Self {
        Self {
            name: name.to_string(),
            state,
            rx_bytes: 0,
            tx_bytes: 0,
            latest_handshake_millis: 0,
        }
    }

    /// Flat (name, state, rx, tx, handshake) rendering for channel payloads
    pub fn to_fields(&self) -> (String, String, u64, u64, u64) {
        (
            self.name.clone(),
            self.state.as_str().to_string(),
            self.rx_bytes,
            self.tx_bytes,
            self.latest_handshake_millis,
        )
    }
}

/// Per-peer counters as reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    /// Peer public key, base64
    pub public_key: String,
    /// Bytes received from this peer
    pub rx_bytes: u64,
    /// Bytes transmitted to this peer
    pub tx_bytes: u64,
    /// Last handshake, epoch millis (0 if never)
    pub last_handshake_millis: u64,
}

/// Raw statistics for a tunnel; empty when the tunnel is down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStatistics {
    /// One entry per configured peer
    pub peers: Vec<PeerStatistics>,
}

/// Which backend drives tunnels in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Kernel module via wg-quick
    Kernel,
    /// Userspace implementation via the UAPI socket
    Userspace,
}

impl BackendKind {
    /// True for the kernel-module backend
    pub fn is_kernel(&self) -> bool {
        matches!(self, BackendKind::Kernel)
    }

    /// True for the userspace backend
    pub fn is_userspace(&self) -> bool {
        matches!(self, BackendKind::Userspace)
    }

    /// Kernel tunnels need no platform VPN consent, userspace ones do
    pub fn requires_permission(&self) -> bool {
        self.is_userspace()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Kernel => f.write_str("kernel"),
            BackendKind::Userspace => f.write_str("userspace"),
        }
    }
}

/// Operator preference for backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Kernel if available, otherwise userspace
    #[default]
    Auto,
    /// Kernel only, no fallback
    Kernel,
    /// Userspace only
    Userspace,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// General options
    #[serde(default)]
    pub general: GeneralConfig,
    /// Backend selection and paths
    #[serde(default)]
    pub backend: BackendConfig,
    /// State monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// D-Bus bridge and state files
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// env_logger filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Selection preference
    #[serde(default)]
    pub prefer: BackendPreference,
    /// Directory wg-quick reads tunnel configs from
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    /// Userspace WireGuard implementation command
    #[serde(default = "default_userspace_implementation")]
    pub userspace_implementation: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            prefer: BackendPreference::Auto,
            config_dir: default_config_dir(),
            userspace_implementation: default_userspace_implementation(),
        }
    }
}

/// State monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Poll interval in milliseconds; 0 disables polling
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Also republish counter/handshake changes of UP tunnels
    #[serde(default)]
    pub publish_stats: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            publish_stats: false,
        }
    }
}

/// D-Bus bridge configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    /// "system" or "session"
    #[serde(default = "default_bus")]
    pub bus: String,
    /// Directory for per-tunnel state files; empty disables them
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Accept PreUp/PostUp/PreDown/PostDown hooks in tunnel configs.
    /// wg-quick runs them as root on behalf of whoever may call `Start`.
    #[serde(default)]
    pub allow_hooks: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bus: default_bus(),
            state_dir: default_state_dir(),
            allow_hooks: false,
        }
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_config_dir() -> String {
    "/etc/wireguard".to_string()
}

fn default_userspace_implementation() -> String {
    "wireguard-go".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_bus() -> String {
    "system".to_string()
}

fn default_state_dir() -> String {
    "/run/wg-bridge".to_string()
}
