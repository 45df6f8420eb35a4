// Backend state monitor

//! Detects tunnel state changes made outside the bridge
//!
//! Neither wg-quick nor the userspace implementation tell anyone when an
//! interface disappears, so the monitor polls: each tick it compares the
//! backend state of every known tunnel with the published one and fires
//! the tunnel's state-change callback on a mismatch.

use crate::backend::TunnelBackend;
use crate::registry::TunnelRegistry;
use crate::status::StatusHub;
use crate::types::TunnelState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodic backend state watcher
pub struct StateMonitor {
    backend: Arc<dyn TunnelBackend>,
    registry: Arc<TunnelRegistry>,
    hub: Arc<StatusHub>,
    interval: Duration,
    publish_stats: bool,
}

impl StateMonitor {
    /// Create a monitor polling every `interval`
    pub fn new(
        backend: Arc<dyn TunnelBackend>,
        registry: Arc<TunnelRegistry>,
        hub: Arc<StatusHub>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            hub,
            interval,
            publish_stats: false,
        }
    }

    /// Also republish counter and handshake changes of UP tunnels
    pub fn with_stats(mut self, publish_stats: bool) -> Self {
        self.publish_stats = publish_stats;
        self
    }

    /// Run on a background task until aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!(
                "Starting state monitor (interval {}ms)",
                self.interval.as_millis()
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                self.poll().await;
            }
        })
    }

    /// One pass over all known tunnels
    pub async fn poll(&self) {
        for handle in self.registry.handles() {
            // A start/stop in flight will report its own transition
            let Some(_guard) = handle.try_lock() else {
                continue;
            };

            let name = handle.name();
            let state = match self.backend.get_state(&handle).await {
                Ok(state) => state,
                Err(e) => {
                    log::debug!("Failed to poll state of {}: {:#}", name, e);
                    continue;
                }
            };

            match self.hub.get(name).map(|status| status.state) {
                Some(published) if published != state => {
                    log::info!(
                        "Tunnel {} went {} outside of the bridge (was {})",
                        name,
                        state,
                        published
                    );
                    handle.on_state_change(state);
                }
                None if state == TunnelState::Up => {
                    log::info!("Found running tunnel {}", name);
                    handle.on_state_change(state);
                }
                _ => {
                    if self.publish_stats && state == TunnelState::Up {
                        self.registry.request_refresh(name);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StateEvent;
    use crate::testing::MockBackend;
    use crate::types::{BackendKind, TunnelStatus};

    fn setup(
        publish_stats: bool,
    ) -> (
        Arc<MockBackend>,
        Arc<TunnelRegistry>,
        Arc<StatusHub>,
        tokio::sync::mpsc::UnboundedReceiver<StateEvent>,
        StateMonitor,
    ) {
        let backend = Arc::new(MockBackend::new(BackendKind::Kernel));
        let (registry, events) = TunnelRegistry::with_channel();
        let registry = Arc::new(registry);
        let hub = Arc::new(StatusHub::new());
        let monitor = StateMonitor::new(
            backend.clone(),
            registry.clone(),
            hub.clone(),
            Duration::from_millis(100),
        )
        .with_stats(publish_stats);
        (backend, registry, hub, events, monitor)
    }

    #[tokio::test]
    async fn test_detects_out_of_band_disconnect() {
        let (backend, registry, hub, mut events, monitor) = setup(false);
        registry.resolve("home");
        hub.publish(TunnelStatus::empty("home", TunnelState::Up));
        backend.force_state("home", TunnelState::Down);

        monitor.poll().await;

        assert_eq!(
            events.try_recv().unwrap(),
            StateEvent::Changed {
                name: "home".into(),
                state: TunnelState::Down
            }
        );
    }

    #[tokio::test]
    async fn test_quiet_when_states_agree() {
        let (backend, registry, hub, mut events, monitor) = setup(false);
        registry.resolve("home");
        backend.force_state("home", TunnelState::Up);
        hub.publish(TunnelStatus::empty("home", TunnelState::Up));

        monitor.poll().await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reports_unpublished_running_tunnel() {
        let (backend, registry, _hub, mut events, monitor) = setup(false);
        registry.resolve("home");
        backend.force_state("home", TunnelState::Up);

        monitor.poll().await;

        assert!(matches!(
            events.try_recv().unwrap(),
            StateEvent::Changed {
                state: TunnelState::Up,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requests_refresh_when_publishing_stats() {
        let (backend, registry, hub, mut events, monitor) = setup(true);
        registry.resolve("home");
        backend.force_state("home", TunnelState::Up);
        hub.publish(TunnelStatus::empty("home", TunnelState::Up));

        monitor.poll().await;

        assert_eq!(
            events.try_recv().unwrap(),
            StateEvent::Refresh {
                name: "home".into()
            }
        );
    }

    #[tokio::test]
    async fn test_skips_tunnels_with_operation_in_flight() {
        let (backend, registry, hub, mut events, monitor) = setup(false);
        let handle = registry.resolve("home");
        hub.publish(TunnelStatus::empty("home", TunnelState::Up));
        backend.force_state("home", TunnelState::Down);

        let _guard = handle.lock().await;
        monitor.poll().await;

        assert!(events.try_recv().is_err());
    }
}
