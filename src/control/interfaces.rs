//! Failover daemon state read from local interface addresses.
//!
//! keepalived adds the floating address to an interface on the MASTER node and
//! removes it on BACKUP nodes, so address presence is the ownership signal.

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use tracing::trace;

use super::FailoverState;
use crate::error::{Result, StackjoinError};

#[derive(Debug, Clone, Default)]
pub struct InterfaceFailoverState;

impl InterfaceFailoverState {
    pub fn new() -> Self {
        Self
    }

    /// All addresses currently configured on local interfaces
    pub fn local_addresses() -> Result<Vec<(String, IpAddr)>> {
        let addrs = getifaddrs()
            .map_err(|e| StackjoinError::failover(format!("getifaddrs failed: {}", e)))?;

        let mut found = Vec::new();
        for ifaddr in addrs {
            let Some(storage) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = storage.as_sockaddr_in() {
                found.push((ifaddr.interface_name.clone(), IpAddr::V4(*SocketAddrV4::from(*sin).ip())));
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                found.push((ifaddr.interface_name.clone(), IpAddr::V6(*SocketAddrV6::from(*sin6).ip())));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl FailoverState for InterfaceFailoverState {
    async fn holds_address(&self, address: IpAddr) -> Result<bool> {
        // getifaddrs blocks; keep it off the runtime threads
        let addresses = tokio::task::spawn_blocking(Self::local_addresses)
            .await
            .map_err(|e| StackjoinError::failover(format!("interface scan task failed: {}", e)))??;
        let held = addresses
            .into_iter()
            .any(|(_, ip)| ip == address);
        trace!(%address, held, "Checked local interfaces for floating address");
        Ok(held)
    }
}
