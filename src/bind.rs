//! Endpoint Bind Coordinator
//!
//! The API server listens on every interface, so on the node holding the
//! floating address it already serves the API port there. The local load
//! balancer must then stay off that port. [`decide`] is the pure rule and
//! [`EndpointBindCoordinator`] applies it, reacting to [`VipEvent`]s.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BindConfig, ClusterConfig};
use crate::control::LoadBalancerControl;
use crate::poll::{self, Attempt, Backoff, RetryBudget};
use crate::vip::{VipArbiter, VipEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindDecision {
    pub should_local_load_balancer_bind_api_port: bool,
}

/// | VIP owned | API server binds all interfaces | load balancer binds |
/// |-----------|---------------------------------|---------------------|
/// | yes       | yes                             | no                  |
/// | yes       | no                              | yes                 |
/// | no        | either                          | no                  |
pub fn decide(vip_owned: bool, api_server_binds_all_interfaces: bool) -> BindDecision {
    BindDecision {
        should_local_load_balancer_bind_api_port: vip_owned && !api_server_binds_all_interfaces,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("applying {decision:?} failed after {attempts} attempt(s): {message}")]
pub struct BindApplyError {
    pub decision: BindDecision,
    pub attempts: u32,
    pub message: String,
}

pub struct EndpointBindCoordinator {
    load_balancer: Arc<dyn LoadBalancerControl>,
    api_server_binds_all_interfaces: bool,
    budget: RetryBudget,
    last_applied: Mutex<Option<BindDecision>>,
}

impl EndpointBindCoordinator {
    pub fn new(
        load_balancer: Arc<dyn LoadBalancerControl>,
        api_server_binds_all_interfaces: bool,
        budget: RetryBudget,
    ) -> Self {
        Self {
            load_balancer,
            api_server_binds_all_interfaces,
            budget,
            last_applied: Mutex::new(None),
        }
    }

    pub fn from_config(
        load_balancer: Arc<dyn LoadBalancerControl>,
        cluster: &ClusterConfig,
        bind: &BindConfig,
    ) -> Self {
        Self::new(
            load_balancer,
            cluster.api_server_binds_all_interfaces,
            RetryBudget::new(bind.apply_attempts, Backoff::Fixed(bind.apply_backoff())),
        )
    }

    pub fn decide(&self, vip_owned: bool) -> BindDecision {
        decide(vip_owned, self.api_server_binds_all_interfaces)
    }

    pub fn last_applied(&self) -> Option<BindDecision> {
        *self.last_applied.lock()
    }

    /// Drive the load balancer to match `decision`. Safe to repeat.
    pub async fn apply(&self, decision: BindDecision) -> Result<(), BindApplyError> {
        let bind = decision.should_local_load_balancer_bind_api_port;
        let description = if bind { "enable load balancer" } else { "disable load balancer" };

        let result = poll::retry_bounded(description, self.budget, |_| async move {
            let outcome = if bind {
                self.load_balancer.enable_and_bind().await
            } else {
                self.load_balancer.disable_and_unbind().await
            };
            match outcome {
                Ok(()) => Attempt::Done(()),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
        .await;

        match result {
            Ok(()) => {
                let previous = self.last_applied.lock().replace(decision);
                if previous != Some(decision) {
                    info!(bind, "Load balancer bind state applied");
                } else {
                    debug!(bind, "Load balancer bind state unchanged");
                }
                Ok(())
            }
            Err(failure) => Err(BindApplyError {
                decision,
                attempts: failure.attempts,
                message: failure.error,
            }),
        }
    }

    pub async fn reconcile(&self, vip_owned: bool) -> Result<BindDecision, BindApplyError> {
        let decision = self.decide(vip_owned);
        self.apply(decision).await?;
        Ok(decision)
    }

    /// Reconcile on every ownership event from `arbiter` until `cancel`
    /// fires. Failures are logged and retried on the next event.
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        arbiter: Arc<VipArbiter>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut events = arbiter.subscribe();
        tokio::spawn(async move {
            loop {
                let owned = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(VipEvent::OwnershipChanged { owned }) => owned,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Missed VIP events, using last settled lease");
                            arbiter.lease().owner.is_some()
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                if let Err(e) = coordinator.reconcile(owned).await {
                    warn!(error = %e, "Bind reconcile failed");
                }
            }
            debug!("Bind reconciler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeFailover, FakeLoadBalancer};
    use crate::types::NodeId;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn coordinator(lb: &Arc<FakeLoadBalancer>, binds_all: bool) -> Arc<EndpointBindCoordinator> {
        Arc::new(EndpointBindCoordinator::new(
            lb.clone(),
            binds_all,
            RetryBudget::new(3, Backoff::Fixed(Duration::from_secs(2))),
        ))
    }

    #[test]
    fn test_decision_table() {
        assert!(!decide(true, true).should_local_load_balancer_bind_api_port);
        assert!(decide(true, false).should_local_load_balancer_bind_api_port);
        assert!(!decide(false, true).should_local_load_balancer_bind_api_port);
        assert!(!decide(false, false).should_local_load_balancer_bind_api_port);
    }

    proptest! {
        #[test]
        fn prop_decide_is_pure(owned: bool, binds_all: bool, repeats in 1usize..8) {
            let first = decide(owned, binds_all);
            for _ in 0..repeats {
                prop_assert_eq!(decide(owned, binds_all), first);
            }
            prop_assert_eq!(first.should_local_load_balancer_bind_api_port, owned && !binds_all);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_twice_is_idempotent() {
        let lb = FakeLoadBalancer::new(false);
        let coordinator = coordinator(&lb, false);
        let decision = coordinator.decide(true);

        coordinator.apply(decision).await.unwrap();
        coordinator.apply(decision).await.unwrap();
        assert!(lb.active());
        assert_eq!(coordinator.last_applied(), Some(decision));
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_with_all_interface_api_server_disables_load_balancer() {
        let lb = FakeLoadBalancer::new(true);
        let coordinator = coordinator(&lb, true);

        let decision = coordinator.reconcile(true).await.unwrap();
        assert!(!decision.should_local_load_balancer_bind_api_port);
        assert!(!lb.active());
        assert_eq!(lb.disable_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_retries_then_succeeds() {
        let lb = FakeLoadBalancer::new(false);
        lb.fail_next(2);
        let coordinator = coordinator(&lb, false);

        coordinator.reconcile(true).await.unwrap();
        assert_eq!(lb.enable_calls(), 3);
        assert!(lb.active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_is_bounded() {
        let lb = FakeLoadBalancer::new(false);
        lb.fail_next(10);
        let coordinator = coordinator(&lb, false);

        let err = coordinator.reconcile(true).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(lb.enable_calls(), 3);
        assert_eq!(coordinator.last_applied(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_follows_vip_events() {
        let failover = FakeFailover::new(false);
        let arbiter = Arc::new(VipArbiter::new(
            NodeId::from("cp-1"),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            failover.clone(),
            Duration::from_secs(3),
            Duration::from_secs(1),
        ));
        let lb = FakeLoadBalancer::new(false);
        let coordinator = coordinator(&lb, false);
        let cancel = CancellationToken::new();

        let reconciler = coordinator.spawn_reconciler(arbiter.clone(), cancel.clone());
        let watch = arbiter.spawn_watch(cancel.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lb.disable_calls(), 1);
        assert!(!lb.active());

        failover.set_held(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(lb.active());
        assert_eq!(lb.enable_calls(), 1);

        cancel.cancel();
        reconciler.await.unwrap();
        watch.await.unwrap();
    }
}
