//! VIP Arbiter
//!
//! Observes whether this node holds the floating address. Failover itself is
//! the failover daemon's job; the arbiter only samples local state and
//! debounces it so a flap during an active transition is not reported.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::VipConfig;
use crate::control::FailoverState;
use crate::error::{Result, StackjoinError};
use crate::poll::{self, PollSpec, Probe};
use crate::types::{NodeId, VipLease};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VipEvent {
    /// Debounced local ownership changed (or was first established)
    OwnershipChanged { owned: bool },
}

/// Turns raw samples into a stable value that only changes once a new
/// reading has held for the whole debounce window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    debounce: Duration,
    stable: Option<bool>,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            stable: None,
            candidate: None,
        }
    }

    pub fn stable(&self) -> Option<bool> {
        self.stable
    }

    /// Feed one sample; returns the new stable value when it changes.
    pub fn observe(&mut self, raw: bool, at: Instant) -> Option<bool> {
        if self.stable == Some(raw) {
            self.candidate = None;
            return None;
        }

        let since = match self.candidate {
            Some((value, since)) if value == raw => since,
            _ => {
                self.candidate = Some((raw, at));
                at
            }
        };

        if at.duration_since(since) >= self.debounce {
            self.stable = Some(raw);
            self.candidate = None;
            Some(raw)
        } else {
            None
        }
    }
}

pub struct VipArbiter {
    node: NodeId,
    address: IpAddr,
    failover: Arc<dyn FailoverState>,
    debounce: Duration,
    sample_interval: Duration,
    lease: RwLock<VipLease>,
    events: broadcast::Sender<VipEvent>,
}

impl VipArbiter {
    pub fn new(
        node: NodeId,
        address: IpAddr,
        failover: Arc<dyn FailoverState>,
        debounce: Duration,
        sample_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node,
            address,
            failover,
            debounce,
            sample_interval,
            lease: RwLock::new(VipLease::unowned(address)),
            events,
        }
    }

    pub fn from_config(node: NodeId, address: IpAddr, failover: Arc<dyn FailoverState>, config: &VipConfig) -> Self {
        Self::new(node, address, failover, config.debounce(), config.sample_interval())
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VipEvent> {
        self.events.subscribe()
    }

    /// Last settled observation
    pub fn lease(&self) -> VipLease {
        self.lease.read().clone()
    }

    /// Owner as seen from this node: ourselves or unknown
    pub async fn current_owner(&self) -> Result<Option<NodeId>> {
        let owned = self.is_locally_owned().await?;
        Ok(owned.then(|| self.node.clone()))
    }

    /// Sample until the reading holds for the debounce window.
    ///
    /// Errors if the address keeps flapping past a few debounce windows.
    pub async fn is_locally_owned(&self) -> Result<bool> {
        let ceiling = self.debounce * 4 + self.sample_interval;
        let spec = PollSpec::new(self.sample_interval, ceiling);
        let debouncer = Mutex::new(Debouncer::new(self.debounce));
        let description = format!("ownership of {}", self.address);

        let result = poll::poll_until(&description, spec, || {
            let debouncer = &debouncer;
            async move {
                let raw = self.sample().await?;
                let probe = match debouncer.lock().observe(raw, Instant::now()) {
                    Some(owned) => Probe::Ready(owned),
                    None => Probe::Pending(raw),
                };
                Ok::<_, StackjoinError>(probe)
            }
        })
        .await;

        match result {
            Ok(owned) => {
                self.record(owned);
                Ok(owned)
            }
            Err(timeout) => Err(StackjoinError::failover(format!(
                "ownership of {} did not settle within {:?} ({} samples)",
                self.address, timeout.elapsed, timeout.probes
            ))),
        }
    }

    /// Sample in the background and publish debounced ownership changes
    /// until `cancel` fires.
    pub fn spawn_watch(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let arbiter = Arc::clone(self);
        tokio::spawn(async move { arbiter.watch(cancel).await })
    }

    async fn watch(&self, cancel: CancellationToken) {
        let mut debouncer = Debouncer::new(self.debounce);
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(node = %self.node, address = %self.address, "Watching floating address");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(node = %self.node, "VIP watch stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let raw = match self.sample().await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(node = %self.node, error = %e, "Failed to sample floating address");
                    continue;
                }
            };

            if let Some(owned) = debouncer.observe(raw, Instant::now()) {
                self.record(owned);
                info!(node = %self.node, address = %self.address, owned, "VIP ownership changed");
                // No subscribers is fine
                let _ = self.events.send(VipEvent::OwnershipChanged { owned });
            }
        }
    }

    async fn sample(&self) -> Result<bool> {
        self.failover.holds_address(self.address).await
    }

    fn record(&self, owned: bool) {
        *self.lease.write() = VipLease {
            address: self.address,
            owner: owned.then(|| self.node.clone()),
            observed_at: Utc::now(),
        };
    }
}
