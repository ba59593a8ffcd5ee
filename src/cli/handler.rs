use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bind::{self, EndpointBindCoordinator};
use crate::config::Config;
use crate::control::{
    ConsensusStore, EtcdctlStore, InterfaceFailoverState, KubeadmControl, SystemdLoadBalancer,
};
use crate::credentials::{ca_cert_hash, CredentialLedger, CredentialWindow};
use crate::error::{Result, StackjoinError};
use crate::membership::MembershipTracker;
use crate::orchestrator::{JoinAttempt, JoinOrchestrator, OrchestratorSettings};
use crate::types::{MemberId, NodeId, NodeRegistry};
use crate::vip::VipArbiter;

use super::Commands;

pub struct CliHandler {
    config: Config,
}

impl CliHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `command`. `Ok(false)` means the command ran but reports failure.
    pub async fn execute(&self, command: Commands, cancel: CancellationToken) -> Result<bool> {
        match command {
            Commands::Issue { ca_spki, ca_cert_hash: hash, out } => {
                self.issue(ca_spki.as_deref(), hash, out.as_deref())?;
                Ok(true)
            }
            Commands::Validate { window, at } => self.validate(&window, at.unwrap_or_else(Utc::now)),
            Commands::RefreshCertKey { window, out } => {
                self.refresh_cert_key(&window, out.as_deref())?;
                Ok(true)
            }
            Commands::Join { window, node, address } => self.join(&window, node, address, cancel).await,
            Commands::Members => {
                self.members().await?;
                Ok(true)
            }
            Commands::RemoveMember { member_id } => {
                self.remove_member(member_id).await?;
                Ok(true)
            }
            Commands::VipStatus => {
                self.vip_status().await?;
                Ok(true)
            }
            Commands::Decide { vip_owned, api_server_binds_all_interfaces } => {
                let binds_all = api_server_binds_all_interfaces
                    .unwrap_or(self.config.cluster.api_server_binds_all_interfaces);
                let decision = bind::decide(vip_owned, binds_all);
                println!("{}", serde_json::to_string_pretty(&decision)?);
                Ok(true)
            }
            Commands::Reconcile { watch } => self.reconcile(watch, cancel).await,
        }
    }

    fn ledger(&self, hash: String) -> CredentialLedger {
        CredentialLedger::from_config(&self.config.credentials, hash)
    }

    pub fn issue(&self, ca_spki: Option<&Path>, ca_hash: Option<String>, out: Option<&Path>) -> Result<()> {
        let hash = match (ca_spki, ca_hash) {
            (Some(path), _) => ca_cert_hash(&fs::read(path)?),
            (None, Some(hash)) => hash,
            (None, None) => return Err(StackjoinError::config("either --ca-spki or --ca-cert-hash is required")),
        };
        let window = self.ledger(hash).issue();
        write_window(&window, out)
    }

    pub fn validate(&self, path: &Path, at: chrono::DateTime<Utc>) -> Result<bool> {
        let window = read_window(path)?;
        match CredentialLedger::validate(&window, at) {
            Ok(valid) => {
                println!(
                    "valid: token expires in {}m, certificate key expires in {}m",
                    valid.token_remaining.num_minutes(),
                    valid.cert_key_remaining.num_minutes()
                );
                Ok(true)
            }
            Err(expired) => {
                println!("expired: {}", expired);
                Ok(false)
            }
        }
    }

    pub fn refresh_cert_key(&self, path: &Path, out: Option<&Path>) -> Result<()> {
        let window = read_window(path)?;
        let now = Utc::now();
        if now > window.token_expiry {
            return Err(StackjoinError::config(
                "bootstrap token already expired; issue a new window instead",
            ));
        }
        let refreshed = self.ledger(window.ca_cert_hash.clone()).refresh_cert_key(&window, now);
        write_window(&refreshed, out)
    }

    pub async fn join(
        &self,
        window_path: &Path,
        node: Option<String>,
        address: Option<IpAddr>,
        cancel: CancellationToken,
    ) -> Result<bool> {
        let window = read_window(window_path)?;
        let node = match node {
            Some(name) => NodeId::new(name),
            None => self.node_id()?,
        };
        let advertise_address = address
            .or(self.config.node.address)
            .ok_or_else(|| StackjoinError::config("an advertise address is required (--address or node.address)"))?;

        let store: Arc<dyn ConsensusStore> = Arc::new(EtcdctlStore::new(&self.config.etcd));
        let cluster = Arc::new(KubeadmControl::new(&self.config, store.clone())?);
        let tracker = MembershipTracker::from_config(store, &self.config.membership);
        let arbiter = Arc::new(self.arbiter(node.clone()));
        let binder = Arc::new(self.binder());

        let orchestrator = JoinOrchestrator::new(
            cluster,
            tracker,
            arbiter,
            binder,
            NodeRegistry::new(),
            OrchestratorSettings::from_config(&self.config),
        );

        let attempt = JoinAttempt {
            node,
            advertise_address,
            window,
            now: Utc::now(),
        };
        let report = orchestrator.run(attempt, &cancel).await;
        println!("{}", report.to_json()?);
        if !report.is_success() {
            eprintln!("recovery: {}", report.recovery_hint());
        }
        Ok(report.is_success())
    }

    pub async fn members(&self) -> Result<()> {
        let store = EtcdctlStore::new(&self.config.etcd);
        let members = store.list_members().await?;
        println!("{:<18} {:<24} {:<8} {}", "ID", "NAME", "LEARNER", "IN SYNC");
        for m in members {
            println!(
                "{:<18} {:<24} {:<8} {}",
                m.member_id.to_string(),
                m.node_id.as_str(),
                m.is_learner,
                m.raft_progress_known
            );
        }
        Ok(())
    }

    pub async fn remove_member(&self, member_id: MemberId) -> Result<()> {
        let store: Arc<dyn ConsensusStore> = Arc::new(EtcdctlStore::new(&self.config.etcd));
        let tracker = MembershipTracker::from_config(store, &self.config.membership);
        tracker.remove(member_id).await?;
        println!("removed member {}", member_id);
        Ok(())
    }

    pub async fn vip_status(&self) -> Result<()> {
        let arbiter = self.arbiter(self.node_id()?);
        let owned = arbiter.is_locally_owned().await?;
        println!("{}", serde_json::to_string_pretty(&arbiter.lease())?);
        info!(address = %arbiter.address(), owned, "VIP status");
        Ok(())
    }

    pub async fn reconcile(&self, watch: bool, cancel: CancellationToken) -> Result<bool> {
        let arbiter = Arc::new(self.arbiter(self.node_id()?));
        let binder = Arc::new(self.binder());

        if !watch {
            let owned = tokio::select! {
                _ = cancel.cancelled() => return Err(StackjoinError::Cancelled),
                owned = arbiter.is_locally_owned() => owned?,
            };
            return match binder.reconcile(owned).await {
                Ok(decision) => {
                    println!("{}", serde_json::to_string_pretty(&decision)?);
                    Ok(true)
                }
                Err(e) => {
                    warn!(error = %e, "Reconcile failed");
                    eprintln!("{}", e);
                    Ok(false)
                }
            };
        }

        let reconciler = binder.spawn_reconciler(arbiter.clone(), cancel.clone());
        let watcher = arbiter.spawn_watch(cancel.clone());
        cancel.cancelled().await;
        for task in [reconciler, watcher] {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        Ok(true)
    }

    fn node_id(&self) -> Result<NodeId> {
        if !self.config.node.name.trim().is_empty() {
            return Ok(NodeId::new(self.config.node.name.trim()));
        }
        let hostname = nix::unistd::gethostname()
            .map_err(|e| StackjoinError::config(format!("node.name unset and hostname unavailable: {}", e)))?;
        Ok(NodeId::new(hostname.to_string_lossy()))
    }

    fn arbiter(&self, node: NodeId) -> VipArbiter {
        VipArbiter::from_config(
            node,
            self.config.cluster.vip,
            Arc::new(InterfaceFailoverState::new()),
            &self.config.vip,
        )
    }

    fn binder(&self) -> EndpointBindCoordinator {
        EndpointBindCoordinator::from_config(
            Arc::new(SystemdLoadBalancer::new(self.config.bind.unit.clone())),
            &self.config.cluster,
            &self.config.bind,
        )
    }
}

pub fn read_window(path: &Path) -> Result<CredentialWindow> {
    let content = fs::read_to_string(path)
        .map_err(|e| StackjoinError::config(format!("Failed to read window {}: {}", path.display(), e)))?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Windows carry secrets, so files are created owner-only
pub fn write_window(window: &CredentialWindow, out: Option<&Path>) -> Result<()> {
    let yaml = serde_yaml::to_string(window)?;
    match out {
        Some(path) => {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(yaml.as_bytes())?;
            info!(path = %path.display(), token_id = %window.token.id(), "Wrote credential window");
        }
        None => print!("{}", yaml),
    }
    Ok(())
}
