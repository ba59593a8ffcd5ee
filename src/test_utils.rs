//! In-memory collaborators for tests and benches.
//!
//! Each fake records the calls it receives so tests can assert on ordering
//! (for example, that a promote only ever follows a caught-up progress read).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::control::{
    ClusterControl, ConsensusStore, FailoverState, LearnerProgress, LoadBalancerControl,
    PromoteOutcome, RejectReason,
};
use crate::credentials::JoinRequest;
use crate::error::{Result, StackjoinError};
use crate::types::{MemberId, MemberRecord, NodeId};

pub const LEADER_INDEX: u64 = 1_000;

/// How a learner's replication progresses across polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnerSync {
    /// Caught up after this many more progress reads
    After(u32),
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ListMembers,
    Progress { member: MemberId, caught_up: bool },
    Promote(MemberId),
    Remove(MemberId),
}

#[derive(Default)]
struct StoreState {
    members: BTreeMap<MemberId, MemberRecord>,
    sync: BTreeMap<MemberId, LearnerSync>,
    promote_script: VecDeque<PromoteOutcome>,
    calls: Vec<StoreCall>,
    default_sync: Option<LearnerSync>,
}

/// Scripted consensus store
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl FakeStore {
    pub fn with_voters(names: &[&str]) -> Arc<Self> {
        let store = Self {
            next_id: AtomicU64::new(0x1000),
            ..Default::default()
        };
        for name in names {
            store.insert_member(NodeId::from(*name), false);
        }
        Arc::new(store)
    }

    /// Learners added from now on sync according to `sync`
    pub fn set_default_sync(&self, sync: LearnerSync) {
        self.state.lock().default_sync = Some(sync);
    }

    pub fn set_sync(&self, member: MemberId, sync: LearnerSync) {
        self.state.lock().sync.insert(member, sync);
    }

    /// Outcomes returned by successive promote calls; afterwards promote succeeds
    pub fn script_promotions(&self, outcomes: impl IntoIterator<Item = PromoteOutcome>) {
        self.state.lock().promote_script.extend(outcomes);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn insert_member(&self, node: NodeId, is_learner: bool) -> MemberId {
        let member_id = MemberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock();
        if is_learner {
            let sync = state.default_sync.unwrap_or(LearnerSync::After(0));
            state.sync.insert(member_id, sync);
        }
        state.members.insert(
            member_id,
            MemberRecord {
                member_id,
                node_id: node,
                is_learner,
                raft_progress_known: !is_learner,
            },
        );
        member_id
    }

    pub fn members_snapshot(&self) -> Vec<MemberRecord> {
        self.state.lock().members.values().cloned().collect()
    }

    pub fn learners_for(&self, node: &NodeId) -> Vec<MemberRecord> {
        self.state
            .lock()
            .members
            .values()
            .filter(|m| &m.node_id == node && m.is_learner)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn promote_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Promote(_)))
            .count()
    }

    pub fn remove_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Remove(_)))
            .count()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StackjoinError::store("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConsensusStore for FakeStore {
    async fn list_members(&self) -> Result<Vec<MemberRecord>> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::ListMembers);
        Ok(state.members.values().cloned().collect())
    }

    async fn promote(&self, member: MemberId) -> Result<PromoteOutcome> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Promote(member));
        if !state.members.contains_key(&member) {
            return Ok(PromoteOutcome::Rejected(RejectReason::MemberNotFound));
        }
        let outcome = state
            .promote_script
            .pop_front()
            .unwrap_or(PromoteOutcome::Promoted);
        if outcome == PromoteOutcome::Promoted {
            if let Some(record) = state.members.get_mut(&member) {
                record.is_learner = false;
                record.raft_progress_known = true;
            }
        }
        Ok(outcome)
    }

    async fn remove_member(&self, member: MemberId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Remove(member));
        state.sync.remove(&member);
        state
            .members
            .remove(&member)
            .map(|_| ())
            .ok_or_else(|| StackjoinError::store(format!("member {} not found", member)))
    }

    async fn replication_progress(&self, member: MemberId) -> Result<LearnerProgress> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.members.contains_key(&member) {
            return Err(StackjoinError::store(format!("member {} not found", member)));
        }
        let sync = state.sync.get(&member).copied().unwrap_or(LearnerSync::After(0));
        let (progress, next) = match sync {
            LearnerSync::After(0) => (
                LearnerProgress { learner_index: LEADER_INDEX, leader_index: Some(LEADER_INDEX) },
                LearnerSync::After(0),
            ),
            LearnerSync::After(n) => (
                LearnerProgress {
                    learner_index: LEADER_INDEX.saturating_sub(u64::from(n) * 10),
                    leader_index: Some(LEADER_INDEX),
                },
                LearnerSync::After(n - 1),
            ),
            LearnerSync::Never => (
                LearnerProgress { learner_index: LEADER_INDEX / 2, leader_index: Some(LEADER_INDEX) },
                LearnerSync::Never,
            ),
        };
        state.sync.insert(member, next);
        if let Some(record) = state.members.get_mut(&member) {
            record.raft_progress_known = progress.caught_up() || !record.is_learner;
        }
        state.calls.push(StoreCall::Progress {
            member,
            caught_up: progress.caught_up(),
        });
        Ok(progress)
    }
}

/// Cluster control that adds a learner to a [`FakeStore`] on join
pub struct FakeCluster {
    store: Arc<FakeStore>,
    health: Mutex<VecDeque<bool>>,
    join_failure: Mutex<Option<JoinFailure>>,
    join_calls: AtomicU32,
    health_calls: AtomicU32,
    joined: Mutex<Vec<NodeId>>,
}

/// Scripted failure for the next join call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// Fails before anything reaches the consensus store
    Clean,
    /// Creates the learner, then fails
    Partial,
}

impl FakeCluster {
    pub fn new(store: Arc<FakeStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            health: Mutex::new(VecDeque::new()),
            join_failure: Mutex::new(None),
            join_calls: AtomicU32::new(0),
            health_calls: AtomicU32::new(0),
            joined: Mutex::new(Vec::new()),
        })
    }

    /// Results for successive health probes; afterwards probes report healthy
    pub fn script_health(&self, results: impl IntoIterator<Item = bool>) {
        self.health.lock().extend(results);
    }

    pub fn fail_next_join(&self, failure: JoinFailure) {
        *self.join_failure.lock() = Some(failure);
    }

    pub fn join_calls(&self) -> u32 {
        self.join_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> u32 {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn joined_nodes(&self) -> Vec<NodeId> {
        self.joined.lock().clone()
    }
}

#[async_trait]
impl ClusterControl for FakeCluster {
    async fn join(&self, request: &JoinRequest) -> Result<MemberId> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.join_failure.lock().take();
        match failure {
            Some(JoinFailure::Clean) => Err(StackjoinError::command(
                "kubeadm join --control-plane",
                "error execution phase preflight: couldn't validate the identity of the API Server",
            )),
            Some(JoinFailure::Partial) => {
                self.store.insert_member(request.node.clone(), true);
                Err(StackjoinError::command(
                    "kubeadm join --control-plane",
                    "error execution phase control-plane-join/etcd: context deadline exceeded",
                ))
            }
            None => {
                let member = self.store.insert_member(request.node.clone(), true);
                self.joined.lock().push(request.node.clone());
                Ok(member)
            }
        }
    }

    async fn healthz(&self) -> Result<bool> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.health.lock().pop_front().unwrap_or(true))
    }
}

/// Failover state whose answers can be flipped or scripted per sample
#[derive(Default)]
pub struct FakeFailover {
    held: AtomicBool,
    script: Mutex<VecDeque<bool>>,
    addresses: Mutex<HashSet<IpAddr>>,
    samples: AtomicU32,
}

impl FakeFailover {
    pub fn new(held: bool) -> Arc<Self> {
        Arc::new(Self {
            held: AtomicBool::new(held),
            ..Default::default()
        })
    }

    pub fn set_held(&self, held: bool) {
        self.held.store(held, Ordering::SeqCst);
    }

    /// Answers for the next samples, before falling back to the steady value
    pub fn script(&self, samples: impl IntoIterator<Item = bool>) {
        self.script.lock().extend(samples);
    }

    pub fn samples(&self) -> u32 {
        self.samples.load(Ordering::SeqCst)
    }

    /// Restrict answers to these addresses; any other address reads as not held
    pub fn only_for(&self, address: IpAddr) {
        self.addresses.lock().insert(address);
    }
}

#[async_trait]
impl FailoverState for FakeFailover {
    async fn holds_address(&self, address: IpAddr) -> Result<bool> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        {
            let addresses = self.addresses.lock();
            if !addresses.is_empty() && !addresses.contains(&address) {
                return Ok(false);
            }
        }
        if let Some(next) = self.script.lock().pop_front() {
            return Ok(next);
        }
        Ok(self.held.load(Ordering::SeqCst))
    }
}

/// Load balancer with an observable bound/unbound state
#[derive(Default)]
pub struct FakeLoadBalancer {
    active: AtomicBool,
    enable_calls: AtomicU32,
    disable_calls: AtomicU32,
    failures_left: AtomicU32,
}

impl FakeLoadBalancer {
    pub fn new(active: bool) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(active),
            ..Default::default()
        })
    }

    /// The next `n` enable/disable calls fail
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn enable_calls(&self) -> u32 {
        self.enable_calls.load(Ordering::SeqCst)
    }

    pub fn disable_calls(&self) -> u32 {
        self.disable_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StackjoinError::load_balancer("unit haproxy.service failed to start"));
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerControl for FakeLoadBalancer {
    async fn enable_and_bind(&self) -> Result<()> {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_and_unbind(&self) -> Result<()> {
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.active())
    }
}
