// Test doubles shared by the unit tests

use crate::backend::{HostEnvironment, TunnelBackend};
use crate::permission::PermissionFlow;
use crate::registry::TunnelHandle;
use crate::types::{BackendKind, PeerStatistics, RawStatistics, TunnelState};
use crate::wg_config::WgConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const VALID_CONFIG: &str = "[Interface]
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
Address = 10.0.0.2/32
ListenPort = 51820

[Peer]
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
AllowedIPs = 10.0.0.0/24
Endpoint = 203.0.113.1:51820
PersistentKeepalive = 25
";

pub(crate) const MALFORMED_CONFIG: &str = "[Interface]
PrivateKey = not-a-key
";

/// In-memory backend
pub(crate) struct MockBackend {
    kind: BackendKind,
    states: Mutex<HashMap<String, TunnelState>>,
    stats: Mutex<HashMap<String, RawStatistics>>,
    set_state_calls: AtomicUsize,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_stats: AtomicBool,
}

impl MockBackend {
    pub(crate) fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            states: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            set_state_calls: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_stats: AtomicBool::new(false),
        }
    }

    /// Replace the peer counters of `name` with (rx, tx, handshake) triples
    pub(crate) fn set_peer_stats(&self, name: &str, peers: &[(u64, u64, u64)]) {
        let raw = RawStatistics {
            peers: peers
                .iter()
                .enumerate()
                .map(|(i, (rx, tx, hs))| PeerStatistics {
                    public_key: format!("peer{}", i),
                    rx_bytes: *rx,
                    tx_bytes: *tx,
                    last_handshake_millis: *hs,
                })
                .collect(),
        };
        self.stats.lock().unwrap().insert(name.to_string(), raw);
    }

    /// Change state behind the bridge's back (no callback)
    pub(crate) fn force_state(&self, name: &str, state: TunnelState) {
        self.states.lock().unwrap().insert(name.to_string(), state);
        if state == TunnelState::Down {
            self.stats.lock().unwrap().remove(name);
        }
    }

    pub(crate) fn state_of(&self, name: &str) -> TunnelState {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(TunnelState::Down)
    }

    pub(crate) fn set_state_calls(&self) -> usize {
        self.set_state_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn set_state(
        &self,
        tunnel: &TunnelHandle,
        desired: TunnelState,
        _config: Option<&WgConfig>,
    ) -> Result<TunnelState> {
        self.set_state_calls.fetch_add(1, Ordering::SeqCst);

        let current = self.state_of(tunnel.name());
        let target = desired.resolve(current);
        if target == TunnelState::Up && self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("simulated start failure");
        }
        if target == TunnelState::Down && self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("simulated stop failure");
        }
        if target == current {
            return Ok(current);
        }

        self.force_state(tunnel.name(), target);
        tunnel.on_state_change(target);
        Ok(target)
    }

    async fn get_state(&self, tunnel: &TunnelHandle) -> Result<TunnelState> {
        Ok(self.state_of(tunnel.name()))
    }

    async fn get_statistics(&self, tunnel: &TunnelHandle) -> Result<RawStatistics> {
        if self.fail_stats.load(Ordering::SeqCst) {
            anyhow::bail!("simulated statistics failure");
        }
        if self.state_of(tunnel.name()) == TunnelState::Down {
            return Ok(RawStatistics::default());
        }
        Ok(self
            .stats
            .lock()
            .unwrap()
            .get(tunnel.name())
            .cloned()
            .unwrap_or_default())
    }
}

/// Host with scripted probe outcomes
pub(crate) struct MockHost {
    kernel_support: bool,
    shell_ok: bool,
    userspace_ok: bool,
    backend: Option<Arc<dyn TunnelBackend>>,
    shell_attempts: AtomicUsize,
    constructions: AtomicUsize,
}

impl MockHost {
    pub(crate) fn new(kernel_support: bool, shell_ok: bool, userspace_ok: bool) -> Self {
        Self {
            kernel_support,
            shell_ok,
            userspace_ok,
            backend: None,
            shell_attempts: AtomicUsize::new(0),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Host whose selection yields `backend`
    pub(crate) fn serving(backend: Arc<dyn TunnelBackend>) -> Self {
        let kernel = backend.kind().is_kernel();
        Self {
            backend: Some(backend),
            ..Self::new(kernel, kernel, !kernel)
        }
    }

    pub(crate) fn shell_attempts(&self) -> usize {
        self.shell_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn build(&self, kind: BackendKind) -> Arc<dyn TunnelBackend> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        match &self.backend {
            Some(backend) => backend.clone(),
            None => Arc::new(MockBackend::new(kind)),
        }
    }
}

impl HostEnvironment for MockHost {
    fn has_kernel_support(&self) -> bool {
        self.kernel_support
    }

    fn acquire_privileged_shell(&self) -> Result<()> {
        self.shell_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shell_ok {
            anyhow::bail!("su: permission denied");
        }
        Ok(())
    }

    fn kernel_backend(&self) -> Result<Arc<dyn TunnelBackend>> {
        Ok(self.build(BackendKind::Kernel))
    }

    fn userspace_backend(&self) -> Result<Arc<dyn TunnelBackend>> {
        if !self.userspace_ok {
            anyhow::bail!("userspace implementation missing");
        }
        Ok(self.build(BackendKind::Userspace))
    }
}

/// Scripted consent flow
pub(crate) struct MockPermission {
    granted: AtomicBool,
    grant_on_request: bool,
    requests: AtomicUsize,
}

impl MockPermission {
    fn with(granted: bool, grant_on_request: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            grant_on_request,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn granted() -> Self {
        Self::with(true, true)
    }

    pub(crate) fn denied() -> Self {
        Self::with(false, false)
    }

    pub(crate) fn grant_on_request() -> Self {
        Self::with(false, true)
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionFlow for MockPermission {
    async fn has_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_permission(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.grant_on_request {
            self.granted.store(true, Ordering::SeqCst);
        }
        self.granted.load(Ordering::SeqCst)
    }
}
