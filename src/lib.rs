//! Control-plane join and VIP ownership coordination for stacked-etcd
//! Kubernetes clusters.

pub mod bind;
pub mod cli;
pub mod config;
pub mod control;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod membership;
pub mod orchestrator;
pub mod poll;
pub mod test_utils;
pub mod types;
pub mod vip;

// Re-export common types
pub use bind::{decide, BindDecision, EndpointBindCoordinator};
pub use config::Config;
pub use credentials::{CredentialLedger, CredentialWindow};
pub use error::{Result, StackjoinError};
pub use membership::MembershipTracker;
pub use orchestrator::{JoinOrchestrator, JoinReport, JoinStage};
pub use vip::{VipArbiter, VipEvent};
