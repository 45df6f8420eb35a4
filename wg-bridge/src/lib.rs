// WireGuard tunnel control bridge library
// Shared modules for the service, the CLI and tests

#![warn(missing_docs)]

//! WireGuard tunnel control bridge
//!
//! This library exposes start, stop, status and a live status stream for
//! named WireGuard tunnels, driving either the kernel module (wg-quick) or
//! a userspace implementation.
//!
//! # Main Components
//!
//! - [`controller`]: Control facade, the entry point for all operations
//! - [`backend`]: Backend trait, kernel/userspace backends and selection
//! - [`registry`]: Name to tunnel handle registry
//! - [`aggregator`]: Per-peer statistics to tunnel status
//! - [`status`]: Status table, status stream and publisher
//! - [`permission`]: Platform VPN permission
//! - [`monitor`]: Detection of out-of-band state changes
//! - [`dbus`]: D-Bus service and client proxy
//! - [`wg_config`]: wg-quick configuration parser
//! - [`config`]: Configuration file parsing and validation
//! - [`state_file`]: Status files for external tools
//! - [`types`]: Shared data structures
//! - [`error`]: Error taxonomy

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod controller;
pub mod dbus;
pub mod error;
pub mod monitor;
pub mod permission;
pub mod registry;
pub mod state_file;
pub mod status;
pub mod types;
pub mod wg_config;

#[cfg(test)]
pub(crate) mod testing;
