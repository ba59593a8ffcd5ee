use futures::future::join_all;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use stackjoin::bind::EndpointBindCoordinator;
use stackjoin::control::{PromoteOutcome, RejectReason};
use stackjoin::credentials::{ca_cert_hash, CredentialLedger};
use stackjoin::membership::MembershipTracker;
use stackjoin::orchestrator::{JoinAttempt, JoinOrchestrator, OrchestratorSettings};
use stackjoin::poll::{Backoff, RetryBudget};
use stackjoin::test_utils::{FakeCluster, FakeFailover, FakeLoadBalancer, FakeStore, LearnerSync};
use stackjoin::types::{NodeId, NodeRegistry};
use stackjoin::vip::VipArbiter;

const JOINERS: u8 = 12;

#[tokio::test(start_paused = true)]
async fn test_many_concurrent_joins_under_promotion_contention() {
    let store = FakeStore::with_voters(&["cp-0"]);
    store.set_default_sync(LearnerSync::After(4));
    store.script_promotions(
        (0..JOINERS).map(|_| PromoteOutcome::Rejected(RejectReason::ChangeInProgress)),
    );
    let control = FakeCluster::new(store.clone());
    let registry = NodeRegistry::new();
    let ledger = CredentialLedger::new(chrono::Duration::hours(24), chrono::Duration::hours(2), ca_cert_hash(b"ca"));
    let window = ledger.issue();

    let orchestrators: Vec<_> = (1..=JOINERS)
        .map(|i| {
            let node = NodeId::new(format!("cp-{}", i));
            let arbiter = Arc::new(VipArbiter::new(
                node.clone(),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
                FakeFailover::new(false),
                Duration::from_secs(3),
                Duration::from_secs(1),
            ));
            let binder = Arc::new(EndpointBindCoordinator::new(
                FakeLoadBalancer::new(false),
                true,
                RetryBudget::new(3, Backoff::Fixed(Duration::from_secs(2))),
            ));
            let tracker = MembershipTracker::new(
                store.clone(),
                Duration::from_secs(5),
                RetryBudget::new(10, Backoff::Linear(Duration::from_secs(15))),
            );
            let settings = OrchestratorSettings {
                endpoint: "192.168.1.100:6443".to_string(),
                health_timeout: Duration::from_secs(30),
                reachability: RetryBudget::new(3, Backoff::Fixed(Duration::from_secs(5))),
                learner_ceiling: Duration::from_secs(300),
            };
            let orchestrator =
                JoinOrchestrator::new(control.clone(), tracker, arbiter, binder, registry.clone(), settings);
            let attempt = JoinAttempt {
                node,
                advertise_address: IpAddr::V4(Ipv4Addr::new(10, 0, 1, i)),
                window: window.clone(),
                now: chrono::Utc::now(),
            };
            (orchestrator, attempt)
        })
        .collect();

    let cancel = CancellationToken::new();
    let reports = join_all(
        orchestrators
            .iter()
            .map(|(orchestrator, attempt)| orchestrator.run(attempt.clone(), &cancel)),
    )
    .await;

    assert!(reports.iter().all(|r| r.is_success()));
    assert_eq!(store.members_snapshot().len(), JOINERS as usize + 1);
    assert!(store.members_snapshot().iter().all(|m| !m.is_learner));
    assert_eq!(store.promote_calls(), 2 * JOINERS as usize);
    assert_eq!(store.remove_calls(), 0);
    assert_eq!(registry.len(), JOINERS as usize);
}
