// Status aggregation

//! Tunnel-level status from per-peer statistics
//!
//! Traffic counters are summed over all peers and the tunnel handshake time
//! is the most recent handshake of any peer. The computation is a pure
//! function so the query path and the state-change callback path produce
//! identical snapshots for identical backend data.

use crate::types::{RawStatistics, TunnelState, TunnelStatus};

/// Aggregate raw per-peer statistics into a tunnel status snapshot
pub fn aggregate(name: &str, state: TunnelState, raw: &RawStatistics) -> TunnelStatus {
    let (rx_bytes, tx_bytes, latest_handshake_millis) = raw.peers.iter().fold(
        (0u64, 0u64, 0u64),
        |(rx, tx, handshake), peer| {
            (
                rx.saturating_add(peer.rx_bytes),
                tx.saturating_add(peer.tx_bytes),
                handshake.max(peer.last_handshake_millis),
            )
        },
    );

    TunnelStatus {
        name: name.to_string(),
        state,
        rx_bytes,
        tx_bytes,
        latest_handshake_millis,
    }
}
