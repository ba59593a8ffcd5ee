//! Command-line interface
//!
//! Founding-node commands (`issue`, `refresh-cert-key`), joining-node
//! commands (`validate`, `join`) and day-two commands (`members`,
//! `remove-member`, `vip-status`, `decide`, `reconcile`).

use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::types::MemberId;

mod handler;

pub use handler::CliHandler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./stackjoin.yml, then the user and system config dirs)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Issue a new credential window on the founding node
    Issue {
        /// DER-encoded SubjectPublicKeyInfo of the cluster CA
        #[arg(long, required_unless_present = "ca_cert_hash", conflicts_with = "ca_cert_hash")]
        ca_spki: Option<PathBuf>,
        /// Precomputed discovery hash (`sha256:<hex>`)
        #[arg(long)]
        ca_cert_hash: Option<String>,
        /// Write the window here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Check a credential window against the clock
    Validate {
        window: PathBuf,
        /// Check against this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Issue a fresh certificate key for an existing window, keeping its token
    RefreshCertKey {
        window: PathBuf,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Join this node to the control plane
    Join {
        window: PathBuf,
        /// Node name (defaults to config, then hostname)
        #[arg(long)]
        node: Option<String>,
        /// Address to advertise (defaults to config)
        #[arg(long)]
        address: Option<IpAddr>,
    },
    /// List consensus store members
    Members,
    /// Remove a consensus store member (cleanup of an abandoned join)
    RemoveMember {
        /// Member id in hex, as printed by `members`
        member_id: MemberId,
    },
    /// Show whether this node holds the floating address
    VipStatus,
    /// Print the load balancer bind decision for the given inputs
    Decide {
        #[arg(long, action = ArgAction::Set)]
        vip_owned: bool,
        /// Defaults to the configured API server bind behaviour
        #[arg(long, action = ArgAction::Set)]
        api_server_binds_all_interfaces: Option<bool>,
    },
    /// Bring the local load balancer in line with VIP ownership
    Reconcile {
        /// Keep running and reconcile on every ownership change
        #[arg(long)]
        watch: bool,
    },
}
