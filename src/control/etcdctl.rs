//! Consensus store adapter backed by `etcdctl` JSON output.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::command::{run, run_checked};
use super::{ConsensusStore, LearnerProgress, PromoteOutcome, RejectReason};
use crate::config::EtcdConfig;
use crate::error::{Result, StackjoinError};
use crate::types::{MemberId, MemberRecord, NodeId};

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<EtcdMember>,
}

#[derive(Debug, Deserialize)]
struct EtcdMember {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "isLearner", default)]
    is_learner: bool,
}

#[derive(Debug, Deserialize)]
struct EndpointStatus {
    #[serde(rename = "Status")]
    status: StatusBody,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    header: StatusHeader,
    #[serde(default)]
    leader: u64,
    #[serde(rename = "raftIndex", default)]
    raft_index: u64,
}

#[derive(Debug, Deserialize)]
struct StatusHeader {
    member_id: u64,
}

/// Map `etcdctl member promote` stderr onto a rejection reason
pub fn classify_promote_error(stderr: &str) -> RejectReason {
    let msg = stderr.to_ascii_lowercase();
    if msg.contains("in sync with leader") {
        RejectReason::LearnerNotReady
    } else if msg.contains("member not found") {
        RejectReason::MemberNotFound
    } else if msg.contains("no leader") {
        RejectReason::NoLeader
    } else if msg.contains("unhealthy cluster")
        || msg.contains("too many requests")
        || msg.contains("re-configuration failed")
        || msg.contains("leader changed")
    {
        RejectReason::ChangeInProgress
    } else {
        RejectReason::Other(stderr.trim().to_string())
    }
}

fn progress_for(statuses: &[EndpointStatus], member: MemberId) -> Option<LearnerProgress> {
    let own = statuses.iter().find(|s| s.status.header.member_id == member.0)?;
    let leader_id = own.status.leader;
    let leader_index = statuses
        .iter()
        .find(|s| leader_id != 0 && s.status.header.member_id == leader_id)
        .map(|s| s.status.raft_index);
    Some(LearnerProgress {
        learner_index: own.status.raft_index,
        leader_index,
    })
}

#[derive(Debug, Clone)]
pub struct EtcdctlStore {
    etcdctl: PathBuf,
    endpoints: Vec<String>,
    cacert: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl EtcdctlStore {
    pub fn new(config: &EtcdConfig) -> Self {
        Self {
            etcdctl: config.etcdctl_path.clone(),
            endpoints: config.endpoints.clone(),
            cacert: config.cacert.clone(),
            cert: config.cert.clone(),
            key: config.key.clone(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            format!("--endpoints={}", self.endpoints.join(",")),
            format!("--cacert={}", self.cacert.display()),
            format!("--cert={}", self.cert.display()),
            format!("--key={}", self.key.display()),
            "--write-out=json".to_string(),
        ]
    }

    async fn etcdctl(&self, extra: &[&str]) -> Result<String> {
        let mut args = self.base_args();
        args.extend(extra.iter().map(|s| s.to_string()));
        let label = format!("etcdctl {}", extra.join(" "));
        run_checked(&self.etcdctl, &args, &label).await
    }

    async fn cluster_status(&self) -> Result<Vec<EndpointStatus>> {
        let out = self.etcdctl(&["endpoint", "status", "--cluster"]).await?;
        Ok(serde_json::from_str(&out)?)
    }
}

#[async_trait]
impl ConsensusStore for EtcdctlStore {
    async fn list_members(&self) -> Result<Vec<MemberRecord>> {
        let out = self.etcdctl(&["member", "list"]).await?;
        let response: MemberListResponse = serde_json::from_str(&out)?;

        // Learner progress is best effort; an unreachable learner simply reads as unsynced
        let statuses = match self.cluster_status().await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Could not read endpoint status, learner progress unknown");
                Vec::new()
            }
        };

        let members = response
            .members
            .into_iter()
            .map(|m| {
                let member_id = MemberId(m.id);
                let raft_progress_known = !m.is_learner
                    || progress_for(&statuses, member_id)
                        .map(|p| p.caught_up())
                        .unwrap_or(false);
                MemberRecord {
                    member_id,
                    node_id: NodeId::new(m.name),
                    is_learner: m.is_learner,
                    raft_progress_known,
                }
            })
            .collect();
        Ok(members)
    }

    async fn promote(&self, member: MemberId) -> Result<PromoteOutcome> {
        let mut args = self.base_args();
        let id = member.to_string();
        args.extend(["member".to_string(), "promote".to_string(), id]);
        let output = run(&self.etcdctl, &args, "etcdctl member promote").await?;

        if output.success {
            info!(member_id = %member, "Learner promoted to voting member");
            Ok(PromoteOutcome::Promoted)
        } else {
            let reason = classify_promote_error(&output.stderr);
            debug!(member_id = %member, %reason, "Promotion rejected");
            Ok(PromoteOutcome::Rejected(reason))
        }
    }

    async fn remove_member(&self, member: MemberId) -> Result<()> {
        let id = member.to_string();
        self.etcdctl(&["member", "remove", &id]).await?;
        info!(member_id = %member, "Member removed");
        Ok(())
    }

    async fn replication_progress(&self, member: MemberId) -> Result<LearnerProgress> {
        let statuses = self.cluster_status().await?;
        progress_for(&statuses, member).ok_or_else(|| {
            StackjoinError::store(format!("no endpoint status reported for member {}", member))
        })
    }
}
