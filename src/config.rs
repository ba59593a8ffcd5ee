use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};
use log::debug;
use crate::error::StackjoinError;

/// Upper bound on the promotion retry budget accepted from configuration
pub const MAX_PROMOTE_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub vip: VipConfig,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Node name; the CLI fills in the hostname when empty
    #[serde(default)]
    pub name: String,
    /// Address advertised for the API server and etcd peer traffic
    #[serde(default)]
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Floating address fronting the API server
    #[serde(default = "default_vip")]
    pub vip: IpAddr,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// kube-apiserver listens on 0.0.0.0, so it already serves the VIP when held
    #[serde(default = "default_true")]
    pub api_server_binds_all_interfaces: bool,
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(default = "default_kubeadm_path")]
    pub kubeadm_path: PathBuf,
    /// Upper bound on one `kubeadm join` run
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_cert_key_ttl_secs")]
    pub cert_key_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,
    #[serde(default = "default_health_backoff_secs")]
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_learner_ceiling_secs")]
    pub learner_ceiling_secs: u64,
    #[serde(default = "default_learner_poll_interval_secs")]
    pub learner_poll_interval_secs: u64,
    #[serde(default = "default_promote_attempts")]
    pub promote_attempts: u32,
    /// Linear backoff step: attempt N waits N * this before retrying
    #[serde(default = "default_promote_backoff_secs")]
    pub promote_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VipConfig {
    #[serde(default = "default_vip_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_vip_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    #[serde(default = "default_bind_apply_attempts")]
    pub apply_attempts: u32,
    #[serde(default = "default_bind_apply_backoff_secs")]
    pub apply_backoff_secs: u64,
    /// systemd unit of the local load balancer
    #[serde(default = "default_load_balancer_unit")]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_etcdctl_path")]
    pub etcdctl_path: PathBuf,
    #[serde(default = "default_etcd_cacert")]
    pub cacert: PathBuf,
    #[serde(default = "default_etcd_cert")]
    pub cert: PathBuf,
    #[serde(default = "default_etcd_key")]
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rotated JSON logs; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Number of rotated log files to keep
    #[serde(default = "default_log_files")]
    pub max_files: usize,
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            vip: default_vip(),
            api_port: default_api_port(),
            api_server_binds_all_interfaces: default_true(),
            ca_cert_path: default_ca_cert_path(),
            kubeadm_path: default_kubeadm_path(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            cert_key_ttl_secs: default_cert_key_ttl_secs(),
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_health_timeout_secs(),
            attempts: default_health_attempts(),
            backoff_secs: default_health_backoff_secs(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            learner_ceiling_secs: default_learner_ceiling_secs(),
            learner_poll_interval_secs: default_learner_poll_interval_secs(),
            promote_attempts: default_promote_attempts(),
            promote_backoff_secs: default_promote_backoff_secs(),
        }
    }
}

impl Default for VipConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_vip_debounce_secs(),
            sample_interval_ms: default_vip_sample_interval_ms(),
        }
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            apply_attempts: default_bind_apply_attempts(),
            apply_backoff_secs: default_bind_apply_backoff_secs(),
            unit: default_load_balancer_unit(),
        }
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            etcdctl_path: default_etcdctl_path(),
            cacert: default_etcd_cacert(),
            cert: default_etcd_cert(),
            key: default_etcd_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            max_files: default_log_files(),
            console: default_true(),
        }
    }
}

// Default value functions
fn default_vip() -> IpAddr { IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)) }
fn default_api_port() -> u16 { 6443 }
fn default_true() -> bool { true }
fn default_ca_cert_path() -> PathBuf { PathBuf::from("/etc/kubernetes/pki/ca.crt") }
fn default_kubeadm_path() -> PathBuf { PathBuf::from("kubeadm") }
fn default_join_timeout_secs() -> u64 { 600 }
fn default_token_ttl_secs() -> u64 { 24 * 3600 }
fn default_cert_key_ttl_secs() -> u64 { 2 * 3600 }
fn default_health_timeout_secs() -> u64 { 30 }
fn default_health_attempts() -> u32 { 3 }
fn default_health_backoff_secs() -> u64 { 5 }
fn default_learner_ceiling_secs() -> u64 { 300 }
fn default_learner_poll_interval_secs() -> u64 { 5 }
fn default_promote_attempts() -> u32 { 5 }
fn default_promote_backoff_secs() -> u64 { 15 }
fn default_vip_debounce_secs() -> u64 { 3 }
fn default_vip_sample_interval_ms() -> u64 { 1000 }
fn default_bind_apply_attempts() -> u32 { 3 }
fn default_bind_apply_backoff_secs() -> u64 { 2 }
fn default_load_balancer_unit() -> String { "haproxy".to_string() }
fn default_etcd_endpoints() -> Vec<String> { vec!["https://127.0.0.1:2379".to_string()] }
fn default_etcdctl_path() -> PathBuf { PathBuf::from("etcdctl") }
fn default_etcd_cacert() -> PathBuf { PathBuf::from("/etc/kubernetes/pki/etcd/ca.crt") }
fn default_etcd_cert() -> PathBuf { PathBuf::from("/etc/kubernetes/pki/etcd/healthcheck-client.crt") }
fn default_etcd_key() -> PathBuf { PathBuf::from("/etc/kubernetes/pki/etcd/healthcheck-client.key") }
fn default_log_level() -> String { "info".to_string() }
fn default_log_files() -> usize { 7 }

impl ClusterConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl ReachabilityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl MembershipConfig {
    pub fn learner_ceiling(&self) -> Duration {
        Duration::from_secs(self.learner_ceiling_secs)
    }

    pub fn learner_poll_interval(&self) -> Duration {
        Duration::from_secs(self.learner_poll_interval_secs)
    }

    pub fn promote_backoff(&self) -> Duration {
        Duration::from_secs(self.promote_backoff_secs)
    }
}

impl VipConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl BindConfig {
    pub fn apply_backoff(&self) -> Duration {
        Duration::from_secs(self.apply_backoff_secs)
    }
}

impl CredentialConfig {
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_ttl_secs as i64)
    }

    pub fn cert_key_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cert_key_ttl_secs as i64)
    }
}

impl Config {
    /// Load configuration, trying `explicit` first and then the usual locations.
    /// Falls back to defaults when no file exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self, StackjoinError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let config_paths = [
            // Current directory
            PathBuf::from("stackjoin.yml"),
            // User's config directory
            dirs::config_dir()
                .map(|p| p.join("stackjoin/config.yml"))
                .unwrap_or_default(),
            // System-wide config
            PathBuf::from("/etc/stackjoin/config.yml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from_file(path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, StackjoinError> {
        let content = fs::read_to_string(path)
            .map_err(|e| StackjoinError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| StackjoinError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), StackjoinError> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| StackjoinError::Config(format!("Failed to serialize config: {}", e)))?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| StackjoinError::Config(format!("Failed to create config directory: {}", e)))?;
            }
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)
            .map_err(|e| StackjoinError::Config(format!("Failed to write config: {}", e)))?;

        fs::rename(&temp_path, path)
            .map_err(|e| StackjoinError::Config(format!("Failed to save config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), StackjoinError> {
        if self.node.name.trim().is_empty() {
            return Err(StackjoinError::config("node.name must not be empty"));
        }

        if self.credentials.cert_key_ttl_secs == 0 || self.credentials.token_ttl_secs == 0 {
            return Err(StackjoinError::config("credential TTLs must be non-zero"));
        }
        if self.credentials.cert_key_ttl_secs >= self.credentials.token_ttl_secs {
            return Err(StackjoinError::config(
                "credentials.cert_key_ttl_secs must be shorter than token_ttl_secs",
            ));
        }

        if self.cluster.join_timeout_secs == 0 {
            return Err(StackjoinError::config("cluster.join_timeout_secs must be non-zero"));
        }

        if self.reachability.attempts == 0 {
            return Err(StackjoinError::config("reachability.attempts must be at least 1"));
        }
        if self.reachability.timeout_secs == 0 {
            return Err(StackjoinError::config("reachability.timeout_secs must be non-zero"));
        }

        let membership = &self.membership;
        if membership.learner_poll_interval_secs == 0 {
            return Err(StackjoinError::config("membership.learner_poll_interval_secs must be non-zero"));
        }
        if membership.learner_ceiling_secs < membership.learner_poll_interval_secs {
            return Err(StackjoinError::config(
                "membership.learner_ceiling_secs must not be shorter than the poll interval",
            ));
        }
        if membership.promote_attempts == 0 || membership.promote_attempts > MAX_PROMOTE_ATTEMPTS {
            return Err(StackjoinError::config(format!(
                "membership.promote_attempts must be between 1 and {}",
                MAX_PROMOTE_ATTEMPTS
            )));
        }

        if self.vip.sample_interval_ms == 0 {
            return Err(StackjoinError::config("vip.sample_interval_ms must be non-zero"));
        }
        if self.vip.debounce() < self.vip.sample_interval() {
            return Err(StackjoinError::config(
                "vip.debounce_secs must not be shorter than the sample interval",
            ));
        }

        if self.bind.apply_attempts == 0 {
            return Err(StackjoinError::config("bind.apply_attempts must be at least 1"));
        }
        if self.etcd.endpoints.is_empty() {
            return Err(StackjoinError::config("etcd.endpoints must list at least one endpoint"));
        }

        Ok(())
    }

    /// `<vip>:<port>`, the endpoint joining nodes talk to
    pub fn control_plane_endpoint(&self) -> String {
        match self.cluster.vip {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.cluster.api_port),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.cluster.api_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn named() -> Config {
        let mut config = Config::default();
        config.node.name = "cp-2".to_string();
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = named();
        config.validate().unwrap();
        assert_eq!(config.credentials.token_ttl_secs, 86400);
        assert_eq!(config.credentials.cert_key_ttl_secs, 7200);
        assert_eq!(config.membership.promote_attempts, 5);
        assert_eq!(config.control_plane_endpoint(), "192.168.1.100:6443");
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "node:\n  name: cp-3\ncluster:\n  vip: 10.0.0.50\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.node.name, "cp-3");
        assert_eq!(config.cluster.vip.to_string(), "10.0.0.50");
        assert_eq!(config.cluster.api_port, 6443);
        assert!(config.cluster.api_server_binds_all_interfaces);
        assert_eq!(config.bind.unit, "haproxy");
        assert_eq!(config.cluster.join_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/stackjoin.yml");
        let mut config = named();
        config.membership.promote_attempts = 3;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.node.name, "cp-2");
        assert_eq!(loaded.membership.promote_attempts, 3);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config = named();
        config.credentials.cert_key_ttl_secs = config.credentials.token_ttl_secs;
        assert!(config.validate().is_err());

        config = named();
        config.membership.learner_ceiling_secs = 1;
        assert!(config.validate().is_err());

        config = named();
        config.membership.promote_attempts = MAX_PROMOTE_ATTEMPTS + 1;
        assert!(config.validate().is_err());

        config = named();
        config.reachability.attempts = 0;
        assert!(config.validate().is_err());

        config = named();
        config.vip.debounce_secs = 0;
        assert!(config.validate().is_err());

        config = named();
        config.cluster.join_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.yml")));
        assert!(matches!(result, Err(StackjoinError::Config(_))));
    }
}
