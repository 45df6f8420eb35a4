// Control facade

//! Tunnel control facade
//!
//! [`TunnelController`] is the context object every caller goes through:
//! it owns the tunnel registry, the status hub and the permission flag, and
//! selects the backend lazily on first use. Each operation runs the same
//! checks in the same order before touching the backend:
//!
//! 1. backend initialization (memoized, success or failure)
//! 2. permission flag
//! 3. tunnel name
//! 4. configuration text (start only)
//!
//! and then takes the tunnel's operation lock, so start, stop and status
//! on one tunnel never interleave.

use crate::aggregator::aggregate;
use crate::backend::{select_backend, HostEnvironment, TunnelBackend};
use crate::config::validate_tunnel_name;
use crate::error::{BridgeError, BridgeResult};
use crate::monitor::StateMonitor;
use crate::permission::{PermissionFlow, PermissionGate};
use crate::registry::{StateEvent, TunnelRegistry};
use crate::status::{StatusHub, StatusPublisher, Subscription};
use crate::types::{BackendKind, BackendPreference, Config, TunnelState, TunnelStatus};
use crate::wg_config::WgConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Backend selection preference
    pub preference: BackendPreference,
    /// State monitor interval; `None` disables the monitor
    pub poll_interval: Option<Duration>,
    /// Let the monitor republish counter changes of UP tunnels
    pub publish_stats: bool,
    /// Accept wg-quick hook commands in tunnel configs
    pub allow_hooks: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            preference: BackendPreference::Auto,
            poll_interval: Some(Duration::from_secs(1)),
            publish_stats: false,
            allow_hooks: false,
        }
    }
}

impl ControllerOptions {
    /// Derive options from the configuration file
    pub fn from_config(config: &Config) -> Self {
        let interval = config.monitor.poll_interval_ms;
        Self {
            preference: config.backend.prefer,
            poll_interval: (interval > 0).then(|| Duration::from_millis(interval)),
            publish_stats: config.monitor.publish_stats,
            allow_hooks: config.bridge.allow_hooks,
        }
    }
}

/// Entry point for tunnel control
pub struct TunnelController {
    host: Arc<dyn HostEnvironment>,
    permission: Arc<dyn PermissionFlow>,
    options: ControllerOptions,
    backend: OnceCell<Result<Arc<dyn TunnelBackend>, String>>,
    registry: Arc<TunnelRegistry>,
    hub: Arc<StatusHub>,
    gate: PermissionGate,
    events: Mutex<Option<mpsc::UnboundedReceiver<StateEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelController {
    /// Create a controller; nothing is probed until the first operation
    pub fn new(
        host: Arc<dyn HostEnvironment>,
        permission: Arc<dyn PermissionFlow>,
        options: ControllerOptions,
    ) -> Self {
        let (registry, events) = TunnelRegistry::with_channel();
        Self {
            host,
            permission,
            options,
            backend: OnceCell::new(),
            registry: Arc::new(registry),
            hub: Arc::new(StatusHub::new()),
            gate: PermissionGate::new(),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The selected backend, selecting it on first call
    async fn backend(&self) -> BridgeResult<Arc<dyn TunnelBackend>> {
        let selected = self
            .backend
            .get_or_init(|| async {
                match select_backend(self.host.as_ref(), self.options.preference) {
                    Ok(backend) => {
                        self.spawn_tasks(backend.clone());
                        Ok(backend)
                    }
                    Err(BridgeError::Initialization(reason)) => Err(reason),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        match selected {
            Ok(backend) => Ok(backend.clone()),
            Err(reason) => Err(BridgeError::Initialization(reason.clone())),
        }
    }

    fn spawn_tasks(&self, backend: Arc<dyn TunnelBackend>) {
        let Some(events) = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(
            StatusPublisher::new(backend.clone(), self.registry.clone(), self.hub.clone())
                .spawn(events),
        );

        if let Some(interval) = self.options.poll_interval {
            tasks.push(
                StateMonitor::new(backend, self.registry.clone(), self.hub.clone(), interval)
                    .with_stats(self.options.publish_stats)
                    .spawn(),
            );
        }
    }

    /// Backend plus permission check, in that order
    async fn authorize(&self) -> BridgeResult<Arc<dyn TunnelBackend>> {
        let backend = self.backend().await?;
        if !self
            .gate
            .check(backend.kind(), self.permission.as_ref())
            .await
        {
            return Err(BridgeError::PermissionDenied(
                "VPN permission has not been granted".to_string(),
            ));
        }
        Ok(backend)
    }

    fn validate_name(name: &str) -> BridgeResult<()> {
        validate_tunnel_name(name).map_err(|e| BridgeError::InvalidArgument(format!("{:#}", e)))
    }

    /// Bring `name` up with the given wg-quick configuration text.
    ///
    /// If the backend fails, the tunnel is driven back down before the
    /// original error is returned; a failing cleanup is only logged.
    pub async fn start(&self, name: &str, config_text: &str) -> BridgeResult<TunnelState> {
        let backend = self.authorize().await?;
        Self::validate_name(name)?;
        let config = WgConfig::parse(config_text).map_err(|e| {
            log::warn!("Rejected configuration for {}: {}", name, e);
            BridgeError::from(e)
        })?;
        if let Some((hook, _)) = config.interface.hooks.first() {
            if !self.options.allow_hooks {
                log::warn!("Rejected configuration for {}: {} hook", name, hook);
                return Err(BridgeError::InvalidArgument(format!(
                    "{} hooks are disabled",
                    hook
                )));
            }
        }

        let handle = self.registry.resolve(name);
        let _guard = handle.lock().await;

        log::info!("Starting tunnel {}", name);
        match backend
            .set_state(&handle, TunnelState::Up, Some(&config))
            .await
        {
            Ok(state) => Ok(state),
            Err(e) => {
                log::error!("Failed to start tunnel {}: {:#}", name, e);
                if let Err(cleanup) = backend.set_state(&handle, TunnelState::Down, None).await {
                    log::warn!("Cleanup after failed start of {} failed: {:#}", name, cleanup);
                }
                Err(BridgeError::start(name, &e))
            }
        }
    }

    /// Bring `name` down; stopping a tunnel that is not up succeeds
    pub async fn stop(&self, name: &str) -> BridgeResult<TunnelState> {
        let backend = self.authorize().await?;
        Self::validate_name(name)?;

        let handle = self.registry.resolve(name);
        let _guard = handle.lock().await;

        log::info!("Stopping tunnel {}", name);
        backend
            .set_state(&handle, TunnelState::Down, None)
            .await
            .map_err(|e| {
                log::error!("Failed to stop tunnel {}: {:#}", name, e);
                BridgeError::stop(name, &e)
            })
    }

    /// Current status of `name`, read from the backend. The published
    /// status table is not touched.
    pub async fn status(&self, name: &str) -> BridgeResult<TunnelStatus> {
        let backend = self.authorize().await?;
        Self::validate_name(name)?;

        let handle = self.registry.resolve(name);
        let _guard = handle.lock().await;

        let state = backend
            .get_state(&handle)
            .await
            .map_err(|e| BridgeError::query(name, &e))?;
        let raw = backend
            .get_statistics(&handle)
            .await
            .map_err(|e| BridgeError::query(name, &e))?;

        Ok(aggregate(name, state, &raw))
    }

    /// Subscribe to the status stream. The current table is replayed first.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Run the platform consent flow once. Backends that need no permission
    /// are granted without asking.
    pub async fn prime_permission(&self) -> BridgeResult<()> {
        let backend = self.backend().await?;
        if self
            .gate
            .prime(backend.kind(), self.permission.as_ref())
            .await
        {
            Ok(())
        } else {
            Err(BridgeError::PermissionDenied(
                "VPN permission was not granted".to_string(),
            ))
        }
    }

    /// Kind of the selected backend
    pub async fn backend_kind(&self) -> BridgeResult<BackendKind> {
        Ok(self.backend().await?.kind())
    }

    /// True if tunnels run in the userspace implementation
    pub async fn is_userspace_backend(&self) -> BridgeResult<bool> {
        Ok(self.backend_kind().await?.is_userspace())
    }

    /// True if tunnels run in the kernel module
    pub async fn is_kernel_backend(&self) -> BridgeResult<bool> {
        Ok(self.backend_kind().await?.is_kernel())
    }

    /// Names of all tunnels referenced so far
    pub fn known_tunnels(&self) -> Vec<String> {
        self.registry.names()
    }

    /// The tunnel registry
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// The status hub
    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }

    /// End all subscriptions and stop background tasks. Tunnels keep running.
    pub fn shutdown(&self) {
        self.hub.close();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        log::info!("Tunnel controller shut down");
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}
