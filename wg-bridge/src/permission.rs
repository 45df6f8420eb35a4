// Platform VPN permission

//! Platform permission flow and the process-wide permission flag
//!
//! Userspace tunnels need the platform's VPN grant; kernel tunnels are set
//! up through the privileged shell and need none. On Linux the grant is
//! "running as root". The flag is granted at most once and never revoked.

use crate::types::BackendKind;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Platform consent flow
#[async_trait]
pub trait PermissionFlow: Send + Sync {
    /// Probe the current grant without prompting
    async fn has_permission(&self) -> bool;

    /// Run the consent flow; true if the grant was obtained
    async fn request_permission(&self) -> bool;
}

/// Linux grant: the process runs with effective uid 0
#[derive(Debug, Default, Clone, Copy)]
pub struct EffectiveUserPermission;

#[async_trait]
impl PermissionFlow for EffectiveUserPermission {
    async fn has_permission(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    async fn request_permission(&self) -> bool {
        // There is no interactive consent on Linux
        let granted = self.has_permission().await;
        if !granted {
            log::warn!("VPN permission requires root, running as uid {}", unsafe {
                libc::geteuid()
            });
        }
        granted
    }
}

/// Process-wide permission flag
#[derive(Debug, Default)]
pub struct PermissionGate {
    granted: AtomicBool,
}

impl PermissionGate {
    /// Create a gate that is not yet granted
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the flag
    pub fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    /// Set the flag; there is no way back
    pub fn grant(&self) {
        if !self.granted.swap(true, Ordering::AcqRel) {
            log::info!("VPN permission granted");
        }
    }

    /// Attach-time priming: skip consent for backends that don't need it,
    /// otherwise run the consent flow once.
    pub async fn prime(&self, kind: BackendKind, flow: &dyn PermissionFlow) -> bool {
        if self.is_granted() {
            return true;
        }

        if !kind.requires_permission() {
            log::debug!("{} backend needs no VPN permission", kind);
            self.grant();
            return true;
        }

        if flow.has_permission().await || flow.request_permission().await {
            self.grant();
            return true;
        }

        false
    }

    /// Per-operation check. Never prompts; a grant obtained outside the
    /// process is picked up by the probe.
    pub async fn check(&self, kind: BackendKind, flow: &dyn PermissionFlow) -> bool {
        if self.is_granted() {
            return true;
        }

        if !kind.requires_permission() || flow.has_permission().await {
            self.grant();
            return true;
        }

        false
    }
}
