//! Cluster Types
//!
//! Core types shared by the coordinator components:
//! - Node identity and join-lifecycle roles
//! - Consensus store member records
//! - Floating address lease observations
//! - Registry of nodes with recorded join intent

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{StackjoinError, Result};

/// Stable node identity (the node's hostname)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Consensus store member identifier. Rendered in hex, the way etcd prints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = StackjoinError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches("0x");
        u64::from_str_radix(trimmed, 16)
            .map(MemberId)
            .map_err(|e| StackjoinError::store(format!("invalid member id '{}': {}", s, e)))
    }
}

/// Node roles across the join lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Operator registered intent to join; nothing mutated externally yet
    Joining,
    /// Replicates consensus state but does not count toward quorum
    Learner,
    /// Full voting member of the consensus store
    VotingMember,
    /// Could not reach the cluster during the last attempt
    Unreachable,
}

/// Node information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: IpAddr,
    pub role: NodeRole,
}

impl Node {
    pub fn joining(id: NodeId, addr: IpAddr) -> Self {
        Self {
            id,
            addr,
            role: NodeRole::Joining,
        }
    }
}

/// One entry of the consensus store's membership list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: MemberId,
    pub node_id: NodeId,
    pub is_learner: bool,
    /// Learner has caught up enough with the leader to vote
    pub raft_progress_known: bool,
}

/// Observation of who holds the floating address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipLease {
    pub address: IpAddr,
    pub owner: Option<NodeId>,
    pub observed_at: DateTime<Utc>,
}

impl VipLease {
    pub fn unowned(address: IpAddr) -> Self {
        Self {
            address,
            owner: None,
            observed_at: Utc::now(),
        }
    }

    pub fn is_held_by(&self, node: &NodeId) -> bool {
        self.owner.as_ref() == Some(node)
    }
}

/// Nodes with recorded join intent.
///
/// Entries are only ever removed through [`NodeRegistry::remove`].
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<NodeId, Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record intent to join. Re-registering an existing node resets it to `Joining`.
    pub fn register(&self, id: NodeId, addr: IpAddr) -> Node {
        let node = Node::joining(id.clone(), addr);
        if self.nodes.insert(id.clone(), node.clone()).is_some() {
            debug!(node = %id, "Node re-registered for a fresh join attempt");
        } else {
            info!(node = %id, %addr, "Registered join intent");
        }
        node
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub fn role(&self, id: &NodeId) -> Option<NodeRole> {
        self.nodes.get(id).map(|n| n.role)
    }

    /// Move a registered node to `role`, returning its previous role
    pub fn set_role(&self, id: &NodeId, role: NodeRole) -> Result<NodeRole> {
        let mut entry = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StackjoinError::cluster(format!("node {} is not registered", id)))?;
        let previous = entry.role;
        entry.role = role;
        if previous != role {
            debug!(node = %id, ?previous, ?role, "Node role changed");
        }
        Ok(previous)
    }

    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(id).map(|(_, node)| node);
        if removed.is_some() {
            info!(node = %id, "Node removed from registry");
        }
        removed
    }

    pub fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
