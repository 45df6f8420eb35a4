// Kernel-module backend

//! Kernel WireGuard via wg-quick
//!
//! The configuration text is written to `<config_dir>/<name>.conf` and
//! handed to `wg-quick`. Statistics come from netlink through
//! `wireguard-control`.

use super::{link_exists, read_device_statistics, run_checked, TunnelBackend, IP_COMMAND};
use crate::registry::TunnelHandle;
use crate::types::{BackendKind, RawStatistics, TunnelState};
use crate::wg_config::WgConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use wireguard_control::Backend;

/// Backend for the WireGuard kernel module
#[derive(Debug, Clone)]
pub struct KernelBackend {
    config_dir: PathBuf,
    ip: String,
}

impl KernelBackend {
    /// Create a backend writing tunnel configs into `config_dir`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            ip: IP_COMMAND.to_string(),
        }
    }

    /// Query links with a different `ip` program
    pub fn with_ip_command(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Where the config for `name` lives
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", name))
    }

    /// Write the config with owner-only permissions
    async fn write_config(&self, name: &str, config: &WgConfig) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.config_dir.display()))?;

        let path = self.config_path(name);
        tokio::fs::write(&path, config.text())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

        log::debug!("Wrote tunnel config {}", path.display());
        Ok(path)
    }

    async fn bring_up(&self, name: &str, config: Option<&WgConfig>) -> Result<()> {
        let path = match config {
            Some(config) => self.write_config(name, config).await?,
            None => {
                let path = self.config_path(name);
                if !path.exists() {
                    anyhow::bail!("No configuration for tunnel {}", name);
                }
                path
            }
        };

        log::info!("Bringing up WireGuard interface: {}", name);
        let path = path.to_string_lossy().into_owned();
        run_checked("wg-quick", &["up", path.as_str()], None).await?;
        log::info!("WireGuard interface {} is up", name);
        Ok(())
    }

    async fn bring_down(&self, name: &str) -> Result<()> {
        log::info!("Bringing down WireGuard interface: {}", name);

        let path = self.config_path(name);
        let target = if path.exists() {
            path.to_string_lossy().into_owned()
        } else {
            name.to_string()
        };

        // Don't fail if interface is already down
        run_checked(
            "wg-quick",
            &["down", target.as_str()],
            Some("is not a WireGuard interface"),
        )
        .await?;

        log::info!("WireGuard interface {} is down", name);
        Ok(())
    }
}

#[async_trait]
impl TunnelBackend for KernelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kernel
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
                // wg-quick cannot reconfigure a running interface
                self.bring_down(name).await?;
                tunnel.on_state_change(TunnelState::Down);
            }
            self.bring_up(name, config).await?;
        } else {
            if current == TunnelState::Down {
                log::debug!("Tunnel {} already down", name);
                return Ok(TunnelState::Down);
            }
            self.bring_down(name).await?;
        }

        tunnel.on_state_change(target);
        Ok(target)
    }

    async fn get_state(&self, tunnel: &TunnelHandle) -> Result<TunnelState> {
        if link_exists(&self.ip, tunnel.name()).await? {
            Ok(TunnelState::Up)
        } else {
            Ok(TunnelState::Down)
        }
    }

    async fn get_statistics(&self, tunnel: &TunnelHandle) -> Result<RawStatistics> {
        if !link_exists(&self.ip, tunnel.name()).await? {
            return Ok(RawStatistics::default());
        }
        read_device_statistics(tunnel.name(), Backend::Kernel).await
    }
}
