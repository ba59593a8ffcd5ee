//! Join Orchestrator
//!
//! The state machine a joining node runs, strictly in this order:
//!
//! ```text
//! Idle -> CredentialCheck -> AwaitingClusterReachable -> Joining
//!      -> AwaitingLearnerSync -> Promoting -> Reconciling -> Done
//! ```
//!
//! Any stage can end the attempt in `Failed { stage, reason }`. Each stage
//! retries only within its own budget, and the join call itself is never
//! retried since it is not idempotent at the consensus store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bind::{BindDecision, EndpointBindCoordinator};
use crate::config::Config;
use crate::control::{ClusterControl, LearnerProgress, RejectReason};
use crate::credentials::{CredentialKind, CredentialLedger, CredentialWindow, Expired};
use crate::error::Result;
use crate::membership::MembershipTracker;
use crate::poll::{self, Attempt, Backoff, RetryBudget};
use crate::types::{MemberId, NodeId, NodeRegistry, NodeRole};
use crate::vip::VipArbiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinStage {
    Idle,
    CredentialCheck,
    AwaitingClusterReachable,
    Joining,
    AwaitingLearnerSync,
    Promoting,
    Reconciling,
    Done,
}

impl JoinStage {
    /// From `Joining` on, a learner may exist in the consensus store
    pub fn may_have_mutated_cluster(&self) -> bool {
        *self >= JoinStage::Joining
    }
}

impl fmt::Display for JoinStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinStage::Idle => "idle",
            JoinStage::CredentialCheck => "credential-check",
            JoinStage::AwaitingClusterReachable => "awaiting-cluster-reachable",
            JoinStage::Joining => "joining",
            JoinStage::AwaitingLearnerSync => "awaiting-learner-sync",
            JoinStage::Promoting => "promoting",
            JoinStage::Reconciling => "reconciling",
            JoinStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why an attempt failed. Each variant has its own recovery procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FailureReason {
    #[error("credential expired: {0}")]
    CredentialExpired(Expired),

    #[error("cluster unreachable after {attempts} attempt(s): {last_error}")]
    ClusterUnreachable { attempts: u32, last_error: String },

    #[error("join call failed: {message}")]
    JoinFailed { message: String },

    #[error("learner {member_id} not in sync after {elapsed:?} (last progress: {last_progress:?})")]
    LearnerSyncTimeout {
        member_id: MemberId,
        elapsed: Duration,
        last_progress: Option<LearnerProgress>,
    },

    #[error("promotion of {member_id} rejected after {attempts} attempt(s): {last_reason}")]
    PromotionRejected {
        member_id: MemberId,
        attempts: u32,
        last_reason: RejectReason,
    },

    #[error("load balancer bind apply failed after {attempts} attempt(s): {message}")]
    BindApplyFailed { attempts: u32, message: String },

    #[error("cancelled (cleanup required: {cleanup_required})")]
    Cancelled {
        cleanup_required: bool,
        member_id: Option<MemberId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{stage} failed: {reason}")]
pub struct Failed {
    pub stage: JoinStage,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum JoinOutcome {
    Done {
        member_id: MemberId,
        promote_attempts: u32,
        bind: BindDecision,
    },
    Failed(Failed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub stage: JoinStage,
    pub at: DateTime<Utc>,
}

/// Operator-facing result of one join attempt
#[derive(Debug, Clone, Serialize)]
pub struct JoinReport {
    pub attempt_id: Uuid,
    pub node: NodeId,
    pub outcome: JoinOutcome,
    pub transitions: Vec<Transition>,
    pub member_id: Option<MemberId>,
}

impl JoinReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JoinOutcome::Done { .. })
    }

    pub fn failure(&self) -> Option<&Failed> {
        match &self.outcome {
            JoinOutcome::Failed(failed) => Some(failed),
            JoinOutcome::Done { .. } => None,
        }
    }

    pub fn stages(&self) -> Vec<JoinStage> {
        self.transitions.iter().map(|t| t.stage).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// What the operator should do next
    pub fn recovery_hint(&self) -> String {
        let Some(failed) = self.failure() else {
            return "none: node is a voting member".to_string();
        };
        let orphan = |id: Option<MemberId>| match id {
            Some(id) => format!("remove member {} (stackjoin remove-member {})", id, id),
            None => format!("check `stackjoin members` for a learner named {} and remove it", self.node),
        };

        match &failed.reason {
            FailureReason::CredentialExpired(Expired { which: CredentialKind::Token, .. }) => {
                "bootstrap token expired: issue a new credential window on the founding node, then retry".to_string()
            }
            FailureReason::CredentialExpired(Expired { which: CredentialKind::CertKey, .. }) => {
                "certificate key expired: re-upload control-plane certificates (stackjoin refresh-cert-key) and retry with the same token".to_string()
            }
            FailureReason::ClusterUnreachable { .. } => {
                "cluster API not reachable through the floating address: check the VIP holder and network path, then retry".to_string()
            }
            FailureReason::JoinFailed { .. } => format!(
                "join may have left an orphaned learner: {}, then start a fresh attempt",
                orphan(self.member_id)
            ),
            FailureReason::LearnerSyncTimeout { member_id, .. } => format!(
                "learner did not catch up: check disk and network on this node, {}, then retry",
                orphan(Some(*member_id))
            ),
            FailureReason::PromotionRejected { member_id, .. } => format!(
                "consensus store rejected promotion: investigate cluster health; learner {} is still present, promote it manually or remove it",
                member_id
            ),
            FailureReason::BindApplyFailed { .. } => {
                "node is a voting member; fix the local load balancer unit and run `stackjoin reconcile`".to_string()
            }
            FailureReason::Cancelled { cleanup_required: false, .. } => {
                "cancelled before joining: nothing to clean up".to_string()
            }
            FailureReason::Cancelled { cleanup_required: true, member_id } => {
                format!("cancelled after the join call: {} before retrying", orphan(*member_id))
            }
        }
    }
}

/// Explicit inputs for one attempt
#[derive(Debug, Clone)]
pub struct JoinAttempt {
    pub node: NodeId,
    pub advertise_address: IpAddr,
    pub window: CredentialWindow,
    /// Time the credential window is checked against
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// `<vip>:<port>` handed to the join call
    pub endpoint: String,
    pub health_timeout: Duration,
    pub reachability: RetryBudget,
    pub learner_ceiling: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.control_plane_endpoint(),
            health_timeout: config.reachability.timeout(),
            reachability: RetryBudget::new(
                config.reachability.attempts,
                Backoff::Fixed(config.reachability.backoff()),
            ),
            learner_ceiling: config.membership.learner_ceiling(),
        }
    }
}

pub struct JoinOrchestrator {
    cluster: Arc<dyn ClusterControl>,
    tracker: MembershipTracker,
    arbiter: Arc<VipArbiter>,
    binder: Arc<EndpointBindCoordinator>,
    registry: NodeRegistry,
    settings: OrchestratorSettings,
}

/// Bookkeeping for a single run
struct AttemptLog {
    stage: JoinStage,
    transitions: Vec<Transition>,
    member_id: Option<MemberId>,
}

impl AttemptLog {
    fn new() -> Self {
        Self {
            stage: JoinStage::Idle,
            transitions: vec![Transition { stage: JoinStage::Idle, at: Utc::now() }],
            member_id: None,
        }
    }

    fn enter(&mut self, stage: JoinStage, node: &NodeId) {
        info!(node = %node, from = %self.stage, stage = %stage, "Join stage");
        self.stage = stage;
        self.transitions.push(Transition { stage, at: Utc::now() });
    }

    fn fail(&self, reason: FailureReason) -> Failed {
        Failed { stage: self.stage, reason }
    }
}

impl JoinOrchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterControl>,
        tracker: MembershipTracker,
        arbiter: Arc<VipArbiter>,
        binder: Arc<EndpointBindCoordinator>,
        registry: NodeRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cluster,
            tracker,
            arbiter,
            binder,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Run one attempt to a terminal state. Never panics and never retries
    /// the join call.
    pub async fn run(&self, attempt: JoinAttempt, cancel: &CancellationToken) -> JoinReport {
        let attempt_id = Uuid::new_v4();
        let node = attempt.node.clone();
        let mut log = AttemptLog::new();
        info!(node = %node, %attempt_id, endpoint = %self.settings.endpoint, "Starting join attempt");

        self.registry.register(node.clone(), attempt.advertise_address);
        let outcome = match self.drive(&attempt, cancel, &mut log).await {
            Ok(done) => {
                log.enter(JoinStage::Done, &node);
                info!(node = %node, %attempt_id, "Join attempt finished");
                done
            }
            Err(failed) => {
                error!(node = %node, %attempt_id, stage = %failed.stage, reason = %failed.reason, "Join attempt failed");
                JoinOutcome::Failed(failed)
            }
        };

        JoinReport {
            attempt_id,
            node,
            outcome,
            transitions: log.transitions,
            member_id: log.member_id,
        }
    }

    async fn drive(
        &self,
        attempt: &JoinAttempt,
        cancel: &CancellationToken,
        log: &mut AttemptLog,
    ) -> std::result::Result<JoinOutcome, Failed> {
        let node = &attempt.node;

        log.enter(JoinStage::CredentialCheck, node);
        self.check_cancelled(cancel, log)?;
        let valid = CredentialLedger::validate(&attempt.window, attempt.now)
            .map_err(|expired| log.fail(FailureReason::CredentialExpired(expired)))?;
        info!(
            node = %node,
            token_remaining_secs = valid.token_remaining.num_seconds(),
            cert_key_remaining_secs = valid.cert_key_remaining.num_seconds(),
            "Credentials valid"
        );

        log.enter(JoinStage::AwaitingClusterReachable, node);
        if let Err(failed) = self.cancellable(cancel, log, self.await_reachable()).await {
            if matches!(failed.reason, FailureReason::ClusterUnreachable { .. }) {
                self.set_role(node, NodeRole::Unreachable);
            }
            return Err(failed);
        }

        log.enter(JoinStage::Joining, node);
        let request = attempt
            .window
            .join_request(node.clone(), attempt.advertise_address, self.settings.endpoint.clone());
        let member_id = self
            .cancellable(cancel, log, async {
                self.cluster.join(&request).await.map_err(|e| FailureReason::JoinFailed {
                    message: e.to_string(),
                })
            })
            .await?;
        log.member_id = Some(member_id);
        self.set_role(node, NodeRole::Learner);
        info!(node = %node, member_id = %member_id, "Joined as learner");

        log.enter(JoinStage::AwaitingLearnerSync, node);
        let ceiling = self.settings.learner_ceiling;
        let ready = self
            .cancellable(cancel, log, async {
                self.tracker
                    .await_learner_progress(member_id, ceiling)
                    .await
                    .map_err(|timed_out| FailureReason::LearnerSyncTimeout {
                        member_id: timed_out.member_id,
                        elapsed: timed_out.elapsed,
                        last_progress: timed_out.last_progress,
                    })
            })
            .await?;

        log.enter(JoinStage::Promoting, node);
        let promoted = self
            .cancellable(cancel, log, async {
                self.tracker
                    .promote_with_retry(ready, ceiling)
                    .await
                    .map_err(|rejected| FailureReason::PromotionRejected {
                        member_id: rejected.member_id,
                        attempts: rejected.attempts,
                        last_reason: rejected.reason,
                    })
            })
            .await?;
        self.set_role(node, NodeRole::VotingMember);
        info!(node = %node, member_id = %member_id, attempts = promoted.attempts, "Promoted to voting member");

        log.enter(JoinStage::Reconciling, node);
        let bind = self.cancellable(cancel, log, self.reconcile()).await?;

        Ok(JoinOutcome::Done {
            member_id,
            promote_attempts: promoted.attempts,
            bind,
        })
    }

    async fn await_reachable(&self) -> std::result::Result<(), FailureReason> {
        let timeout = self.settings.health_timeout;
        let result = poll::retry_bounded("cluster reachability", self.settings.reachability, |attempt| async move {
            match tokio::time::timeout(timeout, self.cluster.healthz()).await {
                Ok(Ok(true)) => Attempt::Done(()),
                Ok(Ok(false)) => Attempt::Retry("API server reported unhealthy".to_string()),
                Ok(Err(e)) => Attempt::Retry(e.to_string()),
                Err(_) => {
                    warn!(attempt, timeout_secs = timeout.as_secs(), "Health probe timed out");
                    Attempt::Retry(format!("health probe timed out after {:?}", timeout))
                }
            }
        })
        .await;

        result.map_err(|failure| FailureReason::ClusterUnreachable {
            attempts: failure.attempts,
            last_error: failure.error,
        })
    }

    async fn reconcile(&self) -> std::result::Result<BindDecision, FailureReason> {
        let owned = self
            .arbiter
            .is_locally_owned()
            .await
            .map_err(|e| FailureReason::BindApplyFailed {
                attempts: 0,
                message: e.to_string(),
            })?;
        self.binder
            .reconcile(owned)
            .await
            .map_err(|e| FailureReason::BindApplyFailed {
                attempts: e.attempts,
                message: e.message,
            })
    }

    fn check_cancelled(&self, cancel: &CancellationToken, log: &AttemptLog) -> std::result::Result<(), Failed> {
        if cancel.is_cancelled() {
            return Err(self.cancelled(log));
        }
        Ok(())
    }

    fn cancelled(&self, log: &AttemptLog) -> Failed {
        warn!(stage = %log.stage, member_id = ?log.member_id, "Join attempt cancelled");
        log.fail(FailureReason::Cancelled {
            cleanup_required: log.stage.may_have_mutated_cluster(),
            member_id: log.member_id,
        })
    }

    /// Run one stage's work, giving up at the next await point once
    /// `cancel` fires.
    async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        log: &AttemptLog,
        work: impl Future<Output = std::result::Result<T, FailureReason>>,
    ) -> std::result::Result<T, Failed> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.cancelled(log)),
            result = work => result.map_err(|reason| log.fail(reason)),
        }
    }

    fn set_role(&self, node: &NodeId, role: NodeRole) {
        if let Err(e) = self.registry.set_role(node, role) {
            warn!(node = %node, error = %e, "Failed to record node role");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ca_cert_hash;
    use crate::test_utils::{FakeCluster, FakeFailover, FakeLoadBalancer, FakeStore};
    use std::net::Ipv4Addr;

    struct Harness {
        store: Arc<FakeStore>,
        cluster: Arc<FakeCluster>,
        lb: Arc<FakeLoadBalancer>,
        orchestrator: JoinOrchestrator,
    }

    fn harness() -> Harness {
        let store = FakeStore::with_voters(&["cp-1"]);
        let cluster = FakeCluster::new(store.clone());
        let lb = FakeLoadBalancer::new(true);
        let node = NodeId::from("cp-2");
        let arbiter = Arc::new(VipArbiter::new(
            node,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            FakeFailover::new(false),
            Duration::from_secs(3),
            Duration::from_secs(1),
        ));
        let binder = Arc::new(EndpointBindCoordinator::new(
            lb.clone(),
            true,
            RetryBudget::new(3, Backoff::Fixed(Duration::from_secs(2))),
        ));
        let tracker = MembershipTracker::new(
            store.clone(),
            Duration::from_secs(5),
            RetryBudget::new(5, Backoff::Linear(Duration::from_secs(15))),
        );
        let settings = OrchestratorSettings {
            endpoint: "192.168.1.100:6443".to_string(),
            health_timeout: Duration::from_secs(30),
            reachability: RetryBudget::new(3, Backoff::Fixed(Duration::from_secs(5))),
            learner_ceiling: Duration::from_secs(300),
        };
        let orchestrator = JoinOrchestrator::new(
            cluster.clone(),
            tracker,
            arbiter,
            binder,
            NodeRegistry::new(),
            settings,
        );
        Harness { store, cluster, lb, orchestrator }
    }

    fn attempt(hours_after_issue: i64) -> JoinAttempt {
        let issued = Utc::now();
        let ledger = CredentialLedger::new(chrono::Duration::hours(24), chrono::Duration::hours(2), ca_cert_hash(b"ca"));
        JoinAttempt {
            node: NodeId::from("cp-2"),
            advertise_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 12)),
            window: ledger.issue_at(issued),
            now: issued + chrono::Duration::hours(hours_after_issue),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_visits_every_stage_in_order() {
        let h = harness();
        let report = h.orchestrator.run(attempt(1), &CancellationToken::new()).await;

        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(
            report.stages(),
            vec![
                JoinStage::Idle,
                JoinStage::CredentialCheck,
                JoinStage::AwaitingClusterReachable,
                JoinStage::Joining,
                JoinStage::AwaitingLearnerSync,
                JoinStage::Promoting,
                JoinStage::Reconciling,
                JoinStage::Done,
            ]
        );
        assert_eq!(
            h.orchestrator.registry().role(&NodeId::from("cp-2")),
            Some(NodeRole::VotingMember)
        );
        assert!(!h.lb.active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_cluster_is_bounded() {
        let h = harness();
        h.cluster.script_health([false; 10]);

        let report = h.orchestrator.run(attempt(1), &CancellationToken::new()).await;
        let failed = report.failure().unwrap();
        assert_eq!(failed.stage, JoinStage::AwaitingClusterReachable);
        assert!(matches!(failed.reason, FailureReason::ClusterUnreachable { attempts: 3, .. }));
        assert_eq!(h.cluster.health_calls(), 3);
        assert_eq!(h.cluster.join_calls(), 0);
        assert_eq!(
            h.orchestrator.registry().role(&NodeId::from("cp-2")),
            Some(NodeRole::Unreachable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_join_needs_no_cleanup() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.orchestrator.run(attempt(1), &cancel).await;
        let failed = report.failure().unwrap();
        assert_eq!(failed.stage, JoinStage::CredentialCheck);
        assert_eq!(
            failed.reason,
            FailureReason::Cancelled { cleanup_required: false, member_id: None }
        );
        assert_eq!(h.cluster.join_calls(), 0);
    }

    #[test]
    fn test_report_json_names_stage_and_kind() {
        let report = JoinReport {
            attempt_id: Uuid::nil(),
            node: NodeId::from("cp-3"),
            outcome: JoinOutcome::Failed(Failed {
                stage: JoinStage::Joining,
                reason: FailureReason::JoinFailed { message: "boom".to_string() },
            }),
            transitions: vec![],
            member_id: None,
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["stage"], "joining");
        assert_eq!(json["outcome"]["reason"]["kind"], "join-failed");
        assert!(report.recovery_hint().contains("orphaned learner"));
    }

    #[test]
    fn test_recovery_hints_are_distinct() {
        let hint = |reason: FailureReason| {
            JoinReport {
                attempt_id: Uuid::nil(),
                node: NodeId::from("cp-3"),
                outcome: JoinOutcome::Failed(Failed { stage: JoinStage::Idle, reason }),
                transitions: vec![],
                member_id: None,
            }
            .recovery_hint()
        };
        let expired_at = Utc::now();
        let hints = [
            hint(FailureReason::CredentialExpired(Expired { which: CredentialKind::Token, expired_at })),
            hint(FailureReason::CredentialExpired(Expired { which: CredentialKind::CertKey, expired_at })),
            hint(FailureReason::ClusterUnreachable { attempts: 3, last_error: String::new() }),
            hint(FailureReason::JoinFailed { message: String::new() }),
            hint(FailureReason::LearnerSyncTimeout {
                member_id: MemberId(1),
                elapsed: Duration::from_secs(300),
                last_progress: None,
            }),
            hint(FailureReason::PromotionRejected {
                member_id: MemberId(1),
                attempts: 5,
                last_reason: RejectReason::NoLeader,
            }),
            hint(FailureReason::BindApplyFailed { attempts: 3, message: String::new() }),
            hint(FailureReason::Cancelled { cleanup_required: false, member_id: None }),
            hint(FailureReason::Cancelled { cleanup_required: true, member_id: Some(MemberId(1)) }),
        ];
        let unique: std::collections::HashSet<_> = hints.iter().collect();
        assert_eq!(unique.len(), hints.len());
    }
}
