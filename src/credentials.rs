//! Credential Ledger
//!
//! Issues and validates the credential window a joining control-plane node
//! presents: a long-lived bootstrap token and a short-lived certificate-upload
//! key, each with its own expiry. Windows are immutable values; regenerating
//! either secret produces a new window.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::CredentialConfig;
use crate::error::{Result, StackjoinError};
use crate::types::NodeId;

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;
const CERT_KEY_BYTES: usize = 32;

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn random_token_part(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.random_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Bootstrap token in `<id>.<secret>` form
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        Self {
            id: random_token_part(&mut rng, TOKEN_ID_LEN),
            secret: random_token_part(&mut rng, TOKEN_SECRET_LEN),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full `<id>.<secret>` value, for handing to the join call only
    pub fn expose(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BootstrapToken({}.<redacted>)", self.id)
    }
}

impl FromStr for BootstrapToken {
    type Err = StackjoinError;

    fn from_str(s: &str) -> Result<Self> {
        let valid_part = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| TOKEN_CHARSET.contains(&b))
        };
        match s.split_once('.') {
            Some((id, secret)) if valid_part(id, TOKEN_ID_LEN) && valid_part(secret, TOKEN_SECRET_LEN) => {
                Ok(Self {
                    id: id.to_string(),
                    secret: secret.to_string(),
                })
            }
            _ => Err(StackjoinError::config(
                "bootstrap token must match [a-z0-9]{6}.[a-z0-9]{16}",
            )),
        }
    }
}

impl TryFrom<String> for BootstrapToken {
    type Error = StackjoinError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<BootstrapToken> for String {
    fn from(token: BootstrapToken) -> Self {
        token.expose()
    }
}

/// Hex-encoded key used to decrypt control-plane certificates uploaded to the cluster
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CertificateKey(String);

impl CertificateKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CERT_KEY_BYTES];
        rand::rng().fill(&mut bytes);
        Self(to_hex(&bytes))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertificateKey(<redacted>)")
    }
}

impl TryFrom<String> for CertificateKey {
    type Error = StackjoinError;

    fn try_from(s: String) -> Result<Self> {
        if s.len() == CERT_KEY_BYTES * 2 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(StackjoinError::config(format!(
                "certificate key must be {} hex characters",
                CERT_KEY_BYTES * 2
            )))
        }
    }
}

impl From<CertificateKey> for String {
    fn from(key: CertificateKey) -> Self {
        key.0
    }
}

/// `sha256:<hex>` pin over the cluster CA's DER-encoded SubjectPublicKeyInfo
pub fn ca_cert_hash(spki_der: &[u8]) -> String {
    format!("sha256:{}", to_hex(&Sha256::digest(spki_der)))
}

/// Which half of a window has lapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    /// The whole window must be re-issued
    Token,
    /// Only the certificate upload needs redoing
    CertKey,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Token => f.write_str("bootstrap token"),
            CredentialKind::CertKey => f.write_str("certificate key"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{which} expired at {expired_at}")]
pub struct Expired {
    pub which: CredentialKind,
    pub expired_at: DateTime<Utc>,
}

/// Remaining lifetimes of a window that passed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Valid {
    pub token_remaining: Duration,
    pub cert_key_remaining: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialWindow {
    pub token: BootstrapToken,
    pub token_expiry: DateTime<Utc>,
    pub cert_key: CertificateKey,
    pub cert_key_expiry: DateTime<Utc>,
    pub ca_cert_hash: String,
    pub issued_at: DateTime<Utc>,
}

/// Everything the cluster control API needs to join one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub node: NodeId,
    pub advertise_address: IpAddr,
    /// `<vip>:<port>` of the control plane
    pub endpoint: String,
    pub token: BootstrapToken,
    pub ca_cert_hash: String,
    pub cert_key: CertificateKey,
}

impl CredentialWindow {
    pub fn join_request(&self, node: NodeId, advertise_address: IpAddr, endpoint: impl Into<String>) -> JoinRequest {
        JoinRequest {
            node,
            advertise_address,
            endpoint: endpoint.into(),
            token: self.token.clone(),
            ca_cert_hash: self.ca_cert_hash.clone(),
            cert_key: self.cert_key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialLedger {
    token_ttl: Duration,
    cert_key_ttl: Duration,
    ca_cert_hash: String,
}

impl CredentialLedger {
    pub fn new(token_ttl: Duration, cert_key_ttl: Duration, ca_cert_hash: impl Into<String>) -> Self {
        Self {
            token_ttl,
            cert_key_ttl,
            ca_cert_hash: ca_cert_hash.into(),
        }
    }

    pub fn from_config(config: &CredentialConfig, ca_cert_hash: impl Into<String>) -> Self {
        Self::new(config.token_ttl(), config.cert_key_ttl(), ca_cert_hash)
    }

    pub fn issue(&self) -> CredentialWindow {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> CredentialWindow {
        let window = CredentialWindow {
            token: BootstrapToken::generate(),
            token_expiry: now + self.token_ttl,
            cert_key: CertificateKey::generate(),
            cert_key_expiry: now + self.cert_key_ttl,
            ca_cert_hash: self.ca_cert_hash.clone(),
            issued_at: now,
        };
        info!(
            token_id = %window.token.id(),
            token_expiry = %window.token_expiry,
            cert_key_expiry = %window.cert_key_expiry,
            "Issued credential window"
        );
        window
    }

    /// New window keeping `window`'s token but with a fresh certificate key.
    /// The cert key expiry never outlives the token.
    pub fn refresh_cert_key(&self, window: &CredentialWindow, now: DateTime<Utc>) -> CredentialWindow {
        let refreshed = CredentialWindow {
            token: window.token.clone(),
            token_expiry: window.token_expiry,
            cert_key: CertificateKey::generate(),
            cert_key_expiry: (now + self.cert_key_ttl).min(window.token_expiry),
            ca_cert_hash: window.ca_cert_hash.clone(),
            issued_at: now,
        };
        info!(token_id = %refreshed.token.id(), cert_key_expiry = %refreshed.cert_key_expiry, "Refreshed certificate key");
        refreshed
    }

    /// Pure check of `window` against `now`. A lapsed token wins over a lapsed
    /// cert key since it forces the more expensive recovery.
    pub fn validate(window: &CredentialWindow, now: DateTime<Utc>) -> std::result::Result<Valid, Expired> {
        if now > window.token_expiry {
            debug!(token_id = %window.token.id(), "Bootstrap token expired");
            return Err(Expired {
                which: CredentialKind::Token,
                expired_at: window.token_expiry,
            });
        }
        if now > window.cert_key_expiry {
            debug!(token_id = %window.token.id(), "Certificate key expired");
            return Err(Expired {
                which: CredentialKind::CertKey,
                expired_at: window.cert_key_expiry,
            });
        }
        Ok(Valid {
            token_remaining: window.token_expiry - now,
            cert_key_remaining: window.cert_key_expiry - now,
        })
    }
}
