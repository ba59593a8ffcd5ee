//! Cluster control adapter: `kubeadm join` plus an HTTPS health probe
//! against the API server behind the floating address.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::command::run_checked_within;
use super::{ClusterControl, ConsensusStore};
use crate::config::Config;
use crate::credentials::JoinRequest;
use crate::error::{Result, StackjoinError};
use crate::types::{MemberId, MemberRecord, NodeId};

pub struct KubeadmControl {
    kubeadm: PathBuf,
    join_timeout: Duration,
    healthz_url: String,
    health_timeout: Duration,
    http: reqwest::Client,
    store: Arc<dyn ConsensusStore>,
}

impl KubeadmControl {
    /// `store` resolves the member id kubeadm does not report
    pub fn new(config: &Config, store: Arc<dyn ConsensusStore>) -> Result<Self> {
        let health_timeout = config.reachability.timeout();
        let http = Self::http_client(&config.cluster.ca_cert_path, health_timeout)?;
        Ok(Self {
            kubeadm: config.cluster.kubeadm_path.clone(),
            join_timeout: config.cluster.join_timeout(),
            healthz_url: format!("https://{}/healthz", config.control_plane_endpoint()),
            health_timeout,
            http,
            store,
        })
    }

    /// Per-request limit on `/healthz`, taken from `reachability.timeout_secs`
    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }

    fn http_client(ca_cert_path: &Path, timeout: Duration) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().timeout(timeout);
        let builder = match std::fs::read(ca_cert_path) {
            Ok(pem) => {
                let cert = reqwest::Certificate::from_pem(&pem)?;
                builder.add_root_certificate(cert)
            }
            Err(e) => {
                // A joining node has no cluster CA yet; /healthz carries no secrets
                debug!(path = %ca_cert_path.display(), error = %e, "Cluster CA not readable, skipping verification");
                builder.danger_accept_invalid_certs(true)
            }
        };
        Ok(builder.build()?)
    }

    pub fn join_args(request: &JoinRequest) -> Vec<String> {
        vec![
            "join".to_string(),
            request.endpoint.clone(),
            "--token".to_string(),
            request.token.expose(),
            "--discovery-token-ca-cert-hash".to_string(),
            request.ca_cert_hash.clone(),
            "--control-plane".to_string(),
            "--certificate-key".to_string(),
            request.cert_key.expose().to_string(),
            "--apiserver-advertise-address".to_string(),
            request.advertise_address.to_string(),
            "--node-name".to_string(),
            request.node.to_string(),
        ]
    }
}

/// The member `kubeadm join` created for `node`: the one named `node` that
/// was not in `before`. A stale learner left under the same name by an
/// abandoned attempt is never picked.
pub fn new_member_for(node: &NodeId, before: &HashSet<MemberId>, after: &[MemberRecord]) -> Result<MemberId> {
    let named: Vec<&MemberRecord> = after.iter().filter(|m| &m.node_id == node).collect();
    let fresh: Vec<MemberId> = named
        .iter()
        .map(|m| m.member_id)
        .filter(|id| !before.contains(id))
        .collect();

    match fresh.as_slice() {
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = named.iter().map(|m| m.member_id.to_string()).collect();
            Err(StackjoinError::cluster(format!(
                "kubeadm join finished with {} new consensus members named {} (members with that name: [{}])",
                fresh.len(),
                node,
                ids.join(", ")
            )))
        }
    }
}

#[async_trait]
impl ClusterControl for KubeadmControl {
    async fn join(&self, request: &JoinRequest) -> Result<MemberId> {
        let before: HashSet<MemberId> = self
            .store
            .list_members()
            .await?
            .into_iter()
            .map(|m| m.member_id)
            .collect();

        info!(node = %request.node, endpoint = %request.endpoint, "Running kubeadm join");
        run_checked_within(
            &self.kubeadm,
            Self::join_args(request),
            "kubeadm join --control-plane",
            self.join_timeout,
        )
        .await?;

        let after = self.store.list_members().await?;
        new_member_for(&request.node, &before, &after)
    }

    async fn healthz(&self) -> Result<bool> {
        let response = self.http.get(&self.healthz_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.healthz_url, %status, "API server reported unhealthy");
            return Ok(false);
        }
        let body = response.text().await?;
        Ok(body.trim() == "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ca_cert_hash, CredentialLedger};
    use crate::test_utils::FakeStore;
    use std::net::{IpAddr, Ipv4Addr};

    fn request_for(node: &str) -> JoinRequest {
        let ledger = CredentialLedger::new(chrono::Duration::hours(24), chrono::Duration::hours(2), ca_cert_hash(b"ca"));
        ledger.issue().join_request(
            NodeId::from(node),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 12)),
            "192.168.1.100:6443",
        )
    }

    fn record(id: u64, node: &str, is_learner: bool) -> MemberRecord {
        MemberRecord {
            member_id: MemberId(id),
            node_id: NodeId::from(node),
            is_learner,
            raft_progress_known: !is_learner,
        }
    }

    #[test]
    fn test_new_member_skips_stale_learner_with_same_name() {
        let node = NodeId::from("cp-2");
        let before: HashSet<MemberId> = [MemberId(1), MemberId(0xdead)].into_iter().collect();
        let after = vec![record(1, "cp-1", false), record(0xdead, "cp-2", true), record(0xbeef, "cp-2", true)];

        assert_eq!(new_member_for(&node, &before, &after).unwrap(), MemberId(0xbeef));
    }

    #[test]
    fn test_new_member_requires_exactly_one() {
        let node = NodeId::from("cp-2");
        let before: HashSet<MemberId> = [MemberId(0xdead)].into_iter().collect();

        let none = new_member_for(&node, &before, &[record(0xdead, "cp-2", true)]).unwrap_err();
        assert!(matches!(none, StackjoinError::Cluster(_)));
        assert!(none.to_string().contains(&MemberId(0xdead).to_string()));

        let two = vec![record(0xdead, "cp-2", true), record(2, "cp-2", true), record(3, "cp-2", true)];
        let err = new_member_for(&node, &before, &two).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&MemberId(2).to_string()));
        assert!(message.contains(&MemberId(3).to_string()));
    }

    #[tokio::test]
    async fn test_join_does_not_adopt_existing_learner() {
        let store = FakeStore::with_voters(&["cp-1"]);
        let stale = store.insert_member(NodeId::from("cp-2"), true);

        let mut config = Config::default();
        config.cluster.kubeadm_path = PathBuf::from("true");
        config.cluster.ca_cert_path = PathBuf::from("/nonexistent/ca.crt");
        let control = KubeadmControl::new(&config, store.clone()).unwrap();

        let err = control.join(&request_for("cp-2")).await.unwrap_err();
        assert!(matches!(err, StackjoinError::Cluster(_)));
        assert!(err.to_string().contains(&stale.to_string()));
    }

    #[test]
    fn test_health_timeout_follows_config() {
        let mut config = Config::default();
        config.reachability.timeout_secs = 45;
        config.cluster.ca_cert_path = PathBuf::from("/nonexistent/ca.crt");
        let control = KubeadmControl::new(&config, FakeStore::with_voters(&["cp-1"])).unwrap();
        assert_eq!(control.health_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_join_args_carry_structured_credentials() {
        let ledger = CredentialLedger::new(chrono::Duration::hours(24), chrono::Duration::hours(2), ca_cert_hash(b"ca"));
        let window = ledger.issue();
        let request = window.join_request(
            NodeId::from("cp-2"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 12)),
            "192.168.1.100:6443",
        );

        let args = KubeadmControl::join_args(&request);
        assert_eq!(args[0], "join");
        assert_eq!(args[1], "192.168.1.100:6443");
        let flag = |name: &str| {
            let pos = args.iter().position(|a| a == name).unwrap();
            args[pos + 1].clone()
        };
        assert_eq!(flag("--token"), window.token.expose());
        assert_eq!(flag("--certificate-key"), window.cert_key.expose());
        assert_eq!(flag("--discovery-token-ca-cert-hash"), window.ca_cert_hash);
        assert_eq!(flag("--node-name"), "cp-2");
        assert!(args.contains(&"--control-plane".to_string()));
    }
}
