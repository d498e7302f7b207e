// ABOUTME: Boot gate deciding whether sandbox startup must wait for explicit consent
// ABOUTME: Queues boot requests while blocked and boots the sandbox exactly once

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info};
use tutorbox_config::BootPolicy;

use crate::error::{Result, SandboxError};
use crate::providers::{BootOptions, Provider, Sandbox};

/// Hosts reporting less memory than this are considered at risk.
pub const MIN_SAFE_MEMORY_GB: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootStatus {
    Unknown,
    Blocked,
    Unblocked,
}

/// What the host tells us about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostProfile {
    /// Touch-first platform (phones, tablets)
    pub touch_first: bool,
    pub device_memory_gb: Option<f32>,
}

impl HostProfile {
    pub fn desktop() -> Self {
        Self::default()
    }

    pub fn mobile(device_memory_gb: Option<f32>) -> Self {
        Self {
            touch_first: true,
            device_memory_gb,
        }
    }

    /// Touch-first with little or unknown memory
    pub fn is_constrained(&self) -> bool {
        self.touch_first
            && self
                .device_memory_gb
                .map_or(true, |memory| memory < MIN_SAFE_MEMORY_GB)
    }
}

pub struct BootGate {
    provider: Arc<dyn Provider>,
    policy: BootPolicy,
    profile: HostProfile,
    options: BootOptions,
    status: watch::Sender<BootStatus>,
    sandbox: OnceCell<Arc<dyn Sandbox>>,
}

impl std::fmt::Debug for BootGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootGate")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .field("status", &*self.status.borrow())
            .field("booted", &self.sandbox.initialized())
            .finish()
    }
}

impl BootGate {
    pub fn new(provider: Arc<dyn Provider>, policy: BootPolicy, profile: HostProfile) -> Self {
        let (status, _) = watch::channel(BootStatus::Unknown);
        Self {
            provider,
            policy,
            profile,
            options: BootOptions::default(),
            status,
            sandbox: OnceCell::new(),
        }
    }

    pub fn status(&self) -> BootStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootStatus> {
        self.status.subscribe()
    }

    /// `None` until the policy has been evaluated.
    pub fn is_blocked(&self) -> Option<bool> {
        match self.status() {
            BootStatus::Unknown => None,
            BootStatus::Blocked => Some(true),
            BootStatus::Unblocked => Some(false),
        }
    }

    /// Evaluate the policy. Only the first call has an effect.
    pub fn decide(&self) -> BootStatus {
        let decision = match self.policy {
            BootPolicy::Blocked => BootStatus::Blocked,
            BootPolicy::Unblocked => BootStatus::Unblocked,
            BootPolicy::Auto if self.profile.is_constrained() => BootStatus::Blocked,
            BootPolicy::Auto => BootStatus::Unblocked,
        };

        let changed = self.status.send_if_modified(|status| {
            if *status == BootStatus::Unknown {
                *status = decision;
                true
            } else {
                false
            }
        });

        if changed && decision == BootStatus::Blocked {
            info!(provider = self.provider.name(), "Sandbox boot deferred until unblocked");
        }
        self.status()
    }

    /// Permanently allow booting and release every waiting request. Idempotent.
    pub fn unblock(&self) {
        let changed = self.status.send_if_modified(|status| {
            if *status == BootStatus::Unblocked {
                false
            } else {
                *status = BootStatus::Unblocked;
                true
            }
        });
        if changed {
            info!(provider = self.provider.name(), "Sandbox boot unblocked");
        }
    }

    /// Wait until booting is allowed, then boot the sandbox once. Every caller
    /// receives the same handle.
    pub async fn request_boot(&self) -> Result<Arc<dyn Sandbox>> {
        if let Some(sandbox) = self.sandbox.get() {
            return Ok(sandbox.clone());
        }

        if self.decide() != BootStatus::Unblocked {
            debug!("Boot request waiting for unblock");
        }

        let mut status = self.status.subscribe();
        status
            .wait_for(|status| *status == BootStatus::Unblocked)
            .await
            .map_err(|_| SandboxError::GateClosed)?;

        self.sandbox
            .get_or_try_init(|| async {
                info!(provider = self.provider.name(), "Booting sandbox");
                self.provider.boot(&self.options).await
            })
            .await
            .cloned()
    }

    /// The sandbox, if it has booted.
    pub fn sandbox(&self) -> Option<Arc<dyn Sandbox>> {
        self.sandbox.get().cloned()
    }
}
