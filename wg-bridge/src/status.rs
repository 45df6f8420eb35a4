// Status table and status stream

//! Status table, broadcast hub and publisher
//!
//! [`StatusHub`] owns the process-wide status table (an immutable map
//! replaced on every update) and the broadcast channel subscribers read
//! from. [`StatusPublisher`] is the only writer: it drains state-change
//! events from the registry, fetches statistics from the backend,
//! aggregates them and publishes the result.

use crate::aggregator::aggregate;
use crate::backend::TunnelBackend;
use crate::registry::{StateEvent, TunnelRegistry};
use crate::types::{TunnelState, TunnelStatus};
use futures_util::stream::{self, Stream};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Buffered updates per subscriber before it starts lagging
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Immutable view of the status table
pub type StatusSnapshot = Arc<BTreeMap<String, TunnelStatus>>;

/// Keep counters and handshake from going backwards while a tunnel stays
/// up. A pass through DOWN is a backend restart and resets them.
///
/// A restart between two reads is recognized without a DOWN in between:
/// lower counters together with a handshake that is newer, or gone where
/// there was one, can only come from a recreated interface. Lower counters
/// with an older or equal handshake are a stale read and keep the floor.
fn merge_monotonic(previous: Option<&TunnelStatus>, mut next: TunnelStatus) -> TunnelStatus {
    let Some(prev) = previous else {
        return next;
    };
    if prev.state == TunnelState::Down || next.state == TunnelState::Down {
        return next;
    }

    let regressed = next.rx_bytes < prev.rx_bytes || next.tx_bytes < prev.tx_bytes;
    if regressed && is_restart(prev, &next) {
        log::info!("Counters of {} restarted", next.name);
        return next;
    }
    if regressed {
        log::debug!(
            "Ignoring stale counters for {} (rx {} < {} or tx {} < {})",
            next.name,
            next.rx_bytes,
            prev.rx_bytes,
            next.tx_bytes,
            prev.tx_bytes
        );
    }

    next.rx_bytes = next.rx_bytes.max(prev.rx_bytes);
    next.tx_bytes = next.tx_bytes.max(prev.tx_bytes);
    next.latest_handshake_millis = next
        .latest_handshake_millis
        .max(prev.latest_handshake_millis);
    next
}

fn is_restart(prev: &TunnelStatus, next: &TunnelStatus) -> bool {
    let lost_handshake = prev.latest_handshake_millis > 0 && next.latest_handshake_millis == 0;
    lost_handshake || next.latest_handshake_millis > prev.latest_handshake_millis
}

/// Process-wide status table plus its update stream
#[derive(Debug)]
pub struct StatusHub {
    table: RwLock<StatusSnapshot>,
    updates: Mutex<Option<broadcast::Sender<TunnelStatus>>>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    /// Create an empty, open hub
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            table: RwLock::new(Arc::new(BTreeMap::new())),
            updates: Mutex::new(Some(tx)),
        }
    }

    /// Current table
    pub fn snapshot(&self) -> StatusSnapshot {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Latest published status of one tunnel
    pub fn get(&self, name: &str) -> Option<TunnelStatus> {
        self.snapshot().get(name).cloned()
    }

    /// Store and broadcast a status; returns what was stored
    pub fn publish(&self, status: TunnelStatus) -> TunnelStatus {
        self.publish_inner(status, false).0
    }

    /// Like [`publish`](Self::publish) but skips updates that change nothing.
    /// Returns true if the status was published.
    pub fn publish_if_changed(&self, status: TunnelStatus) -> bool {
        self.publish_inner(status, true).1
    }

    fn publish_inner(&self, status: TunnelStatus, only_if_changed: bool) -> (TunnelStatus, bool) {
        // Held across the broadcast so subscribe() sees table and stream consistently
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());

        let previous = table.get(&status.name);
        let merged = merge_monotonic(previous, status);
        if only_if_changed && previous == Some(&merged) {
            return (merged, false);
        }

        let mut next = BTreeMap::clone(&table);
        next.insert(merged.name.clone(), merged.clone());
        *table = Arc::new(next);

        log::debug!(
            "Publishing status {}: state={} rx={} tx={} handshake={}",
            merged.name,
            merged.state,
            merged.rx_bytes,
            merged.tx_bytes,
            merged.latest_handshake_millis
        );

        if let Some(tx) = self.updates.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            // Err only means nobody is subscribed
            let _ = tx.send(merged.clone());
        }

        (merged, true)
    }

    /// Subscribe to status updates. The subscription first yields every
    /// entry of the current table, then each published status.
    pub fn subscribe(&self) -> Subscription {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let updates = self.updates.lock().unwrap_or_else(|e| e.into_inner());

        match updates.as_ref() {
            Some(tx) => Subscription {
                pending: table.values().cloned().collect(),
                rx: Some(tx.subscribe()),
            },
            None => Subscription::closed(),
        }
    }

    /// End all subscriptions; later subscriptions end immediately
    pub fn close(&self) {
        let _table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if self
            .updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            log::debug!("Status stream closed");
        }
    }

    /// True after [`close`](Self::close)
    pub fn is_closed(&self) -> bool {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// A cancellable view of the status stream; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    pending: VecDeque<TunnelStatus>,
    rx: Option<broadcast::Receiver<TunnelStatus>>,
}

impl Subscription {
    fn closed() -> Self {
        Self {
            pending: VecDeque::new(),
            rx: None,
        }
    }

    /// Next status, or None once the stream is closed
    pub async fn next(&mut self) -> Option<TunnelStatus> {
        if let Some(status) = self.pending.pop_front() {
            return Some(status);
        }

        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Status subscriber lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = TunnelStatus> {
        stream::unfold(self, |mut sub| async move {
            let status = sub.next().await?;
            Some((status, sub))
        })
    }
}

/// Single writer of the status table
pub struct StatusPublisher {
    backend: Arc<dyn TunnelBackend>,
    registry: Arc<TunnelRegistry>,
    hub: Arc<StatusHub>,
}

impl StatusPublisher {
    /// Create a publisher for the given backend
    pub fn new(
        backend: Arc<dyn TunnelBackend>,
        registry: Arc<TunnelRegistry>,
        hub: Arc<StatusHub>,
    ) -> Self {
        Self {
            backend,
            registry,
            hub,
        }
    }

    /// Run on a background task until the event channel closes
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<StateEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
            log::debug!("Status publisher stopped");
        })
    }

    /// Process one event
    pub async fn handle(&self, event: StateEvent) {
        match event {
            StateEvent::Changed { name, state } => {
                let Some(handle) = self.registry.get(&name) else {
                    log::warn!("State change for unknown tunnel {}", name);
                    return;
                };

                match self.backend.get_statistics(&handle).await {
                    Ok(raw) => {
                        self.hub.publish(aggregate(&name, state, &raw));
                    }
                    Err(e) => {
                        log::error!("Failed to read statistics for {}: {:#}", name, e);
                    }
                }
            }
            StateEvent::Refresh { name } => {
                let Some(handle) = self.registry.get(&name) else {
                    return;
                };

                let state = match self.backend.get_state(&handle).await {
                    Ok(state) => state,
                    Err(e) => {
                        log::warn!("Failed to read state for {}: {:#}", name, e);
                        return;
                    }
                };
                match self.backend.get_statistics(&handle).await {
                    Ok(raw) => {
                        self.hub.publish_if_changed(aggregate(&name, state, &raw));
                    }
                    Err(e) => {
                        log::warn!("Failed to read statistics for {}: {:#}", name, e);
                    }
                }
            }
        }
    }
}
