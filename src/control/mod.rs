//! External collaborators
//!
//! The coordinator never talks to kubeadm, etcd, keepalived or haproxy
//! directly. It calls these traits, and the adapters in the submodules
//! implement them on a real host:
//! - [`ClusterControl`]: join call and API health (kubeadm + HTTPS `/healthz`)
//! - [`ConsensusStore`]: membership queries and mutations (etcdctl)
//! - [`FailoverState`]: local view of the floating address (interface addresses)
//! - [`LoadBalancerControl`]: local load balancer service (systemd unit)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::credentials::JoinRequest;
use crate::error::Result;
use crate::types::{MemberId, MemberRecord};

mod command;
pub mod etcdctl;
pub mod interfaces;
pub mod kubeadm;
pub mod systemd;

pub use etcdctl::EtcdctlStore;
pub use interfaces::InterfaceFailoverState;
pub use kubeadm::KubeadmControl;
pub use systemd::SystemdLoadBalancer;

#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Join this node to the control plane as a consensus learner.
    ///
    /// Not idempotent: a second call after a partial failure can leave an
    /// orphaned learner behind.
    async fn join(&self, request: &JoinRequest) -> Result<MemberId>;

    /// API server health as seen through the floating address
    async fn healthz(&self) -> Result<bool>;
}

/// Replication position of a learner relative to the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerProgress {
    pub learner_index: u64,
    /// `None` while the store has no leader
    pub leader_index: Option<u64>,
}

/// Raft entries a learner may trail the leader by and still count as caught up
pub const CATCH_UP_SLACK: u64 = 5;

impl LearnerProgress {
    /// The two indexes come from separate status reads while the leader keeps
    /// writing, so a healthy learner is usually a few entries behind the leader
    /// read that follows it. Up to [`CATCH_UP_SLACK`] entries of lag is accepted.
    pub fn caught_up(&self) -> bool {
        matches!(self.lag(), Some(lag) if lag <= CATCH_UP_SLACK)
    }

    pub fn lag(&self) -> Option<u64> {
        self.leader_index.map(|leader| leader.saturating_sub(self.learner_index))
    }
}

/// Why the consensus store refused a promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum RejectReason {
    /// Learner is not in sync with the leader yet
    LearnerNotReady,
    /// Another membership change or an election is in flight
    ChangeInProgress,
    NoLeader,
    MemberNotFound,
    Other(String),
}

impl RejectReason {
    /// Whether waiting and trying again can change the answer
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RejectReason::MemberNotFound)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::LearnerNotReady => f.write_str("learner not in sync with leader"),
            RejectReason::ChangeInProgress => f.write_str("another membership change in progress"),
            RejectReason::NoLeader => f.write_str("no leader"),
            RejectReason::MemberNotFound => f.write_str("member not found"),
            RejectReason::Other(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    Promoted,
    Rejected(RejectReason),
}

#[async_trait]
pub trait ConsensusStore: Send + Sync {
    async fn list_members(&self) -> Result<Vec<MemberRecord>>;

    async fn promote(&self, member: MemberId) -> Result<PromoteOutcome>;

    async fn remove_member(&self, member: MemberId) -> Result<()>;

    async fn replication_progress(&self, member: MemberId) -> Result<LearnerProgress>;
}

#[async_trait]
pub trait FailoverState: Send + Sync {
    /// Whether `address` is currently configured on a local interface
    async fn holds_address(&self, address: IpAddr) -> Result<bool>;
}

/// Must be idempotent: every call may repeat the previous one
#[async_trait]
pub trait LoadBalancerControl: Send + Sync {
    async fn enable_and_bind(&self) -> Result<()>;

    async fn disable_and_unbind(&self) -> Result<()>;

    async fn is_active(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learner_progress() {
        let behind = LearnerProgress { learner_index: 90, leader_index: Some(100) };
        assert!(!behind.caught_up());
        assert_eq!(behind.lag(), Some(10));

        let synced = LearnerProgress { learner_index: 100, leader_index: Some(100) };
        assert!(synced.caught_up());

        let ahead = LearnerProgress { learner_index: 104, leader_index: Some(100) };
        assert!(ahead.caught_up());

        let leaderless = LearnerProgress { learner_index: 100, leader_index: None };
        assert!(!leaderless.caught_up());
        assert_eq!(leaderless.lag(), None);
    }

    #[test]
    fn test_learner_within_slack_is_caught_up() {
        let trailing = LearnerProgress { learner_index: 100 - CATCH_UP_SLACK, leader_index: Some(100) };
        assert!(trailing.caught_up());

        let lagging = LearnerProgress { learner_index: 100 - CATCH_UP_SLACK - 1, leader_index: Some(100) };
        assert!(!lagging.caught_up());
    }

    #[test]
    fn test_reject_reason_retryable() {
        assert!(RejectReason::ChangeInProgress.is_retryable());
        assert!(RejectReason::LearnerNotReady.is_retryable());
        assert!(!RejectReason::MemberNotFound.is_retryable());
    }
}
