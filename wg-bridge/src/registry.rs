// Tunnel registry

//! Name → handle registry
//!
//! The registry is the single source of truth for known tunnels. Handles are
//! created on first reference and live as long as the registry. Each handle
//! carries a [`StateListener`] that backends invoke on state transitions;
//! the listener only forwards the event to the status publisher, which is
//! the single writer of the status table.

use crate::types::TunnelState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, MutexGuard};

/// Events consumed by the status publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A backend reported a state transition
    Changed {
        /// Tunnel name
        name: String,
        /// New state
        state: TunnelState,
    },
    /// Re-read state and statistics, publish only if something changed
    Refresh {
        /// Tunnel name
        name: String,
    },
}

/// State-change callback bound to one tunnel
#[derive(Debug, Clone)]
pub struct StateListener {
    name: Arc<str>,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl StateListener {
    fn send(&self, event: StateEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Status publisher stopped, dropping event for {}", self.name);
        }
    }

    /// Forward a state transition to the publisher
    pub fn on_state_change(&self, state: TunnelState) {
        log::info!("Tunnel {} state changed to: {}", self.name, state);
        self.send(StateEvent::Changed {
            name: self.name.to_string(),
            state,
        });
    }

    fn request_refresh(&self) {
        self.send(StateEvent::Refresh {
            name: self.name.to_string(),
        });
    }
}

/// A named tunnel known to the registry
#[derive(Debug)]
pub struct TunnelHandle {
    name: Arc<str>,
    listener: StateListener,
    op_lock: tokio::sync::Mutex<()>,
}

impl TunnelHandle {
    fn new(name: &str, events: mpsc::UnboundedSender<StateEvent>) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            listener: StateListener {
                name: name.clone(),
                events,
            },
            name,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Tunnel name (also the interface name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called by backends whenever this tunnel's state changes
    pub fn on_state_change(&self, state: TunnelState) {
        self.listener.on_state_change(state);
    }

    /// The listener bound to this handle
    pub fn listener(&self) -> &StateListener {
        &self.listener
    }

    /// Serialize facade operations on this tunnel
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    /// The lock, unless an operation holds it
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.op_lock.try_lock().ok()
    }
}

/// Registry of tunnel handles, keyed by name
#[derive(Debug)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, Arc<TunnelHandle>>>,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl TunnelRegistry {
    /// Create a registry whose handles report to `events`
    pub fn new(events: mpsc::UnboundedSender<StateEvent>) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Create a registry together with the receiving end of its event channel
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<StateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn tunnels(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TunnelHandle>>> {
        // Entries are only ever inserted, so a poisoned map is still consistent
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the handle for `name`, creating it on first reference.
    /// At most one handle ever exists per name.
    pub fn resolve(&self, name: &str) -> Arc<TunnelHandle> {
        let mut tunnels = self.tunnels();
        if let Some(handle) = tunnels.get(name) {
            return handle.clone();
        }

        log::debug!("Registering tunnel handle: {}", name);
        let handle = Arc::new(TunnelHandle::new(name, self.events.clone()));
        tunnels.insert(name.to_string(), handle.clone());
        handle
    }

    /// Look up an existing handle without creating one
    pub fn get(&self, name: &str) -> Option<Arc<TunnelHandle>> {
        self.tunnels().get(name).cloned()
    }

    /// Names of all known tunnels, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tunnels().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of all handles
    pub fn handles(&self) -> Vec<Arc<TunnelHandle>> {
        self.tunnels().values().cloned().collect()
    }

    /// Number of known tunnels
    pub fn len(&self) -> usize {
        self.tunnels().len()
    }

    /// True if no tunnel was ever referenced
    pub fn is_empty(&self) -> bool {
        self.tunnels().is_empty()
    }

    /// Ask the publisher to re-read a known tunnel
    pub(crate) fn request_refresh(&self, name: &str) {
        if let Some(handle) = self.get(name) {
            handle.listener.request_refresh();
        }
    }
}
