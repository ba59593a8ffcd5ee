//! Local load balancer control through `systemctl`.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::command::{run, run_checked};
use super::LoadBalancerControl;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SystemdLoadBalancer {
    systemctl: PathBuf,
    unit: String,
}

impl SystemdLoadBalancer {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            systemctl: PathBuf::from("systemctl"),
            unit: unit.into(),
        }
    }

    async fn query(&self, verb: &str) -> Result<bool> {
        let label = format!("systemctl {} {}", verb, self.unit);
        let output = run(&self.systemctl, [verb, "--quiet", self.unit.as_str()], &label).await?;
        Ok(output.success)
    }
}

#[async_trait]
impl LoadBalancerControl for SystemdLoadBalancer {
    async fn enable_and_bind(&self) -> Result<()> {
        if self.query("is-active").await? && self.query("is-enabled").await? {
            debug!(unit = %self.unit, "Load balancer already enabled and running");
            return Ok(());
        }
        let label = format!("systemctl enable --now {}", self.unit);
        run_checked(&self.systemctl, ["enable", "--now", self.unit.as_str()], &label).await?;
        info!(unit = %self.unit, "Load balancer enabled");
        Ok(())
    }

    async fn disable_and_unbind(&self) -> Result<()> {
        if !self.query("is-active").await? && !self.query("is-enabled").await? {
            debug!(unit = %self.unit, "Load balancer already disabled");
            return Ok(());
        }
        let label = format!("systemctl disable --now {}", self.unit);
        run_checked(&self.systemctl, ["disable", "--now", self.unit.as_str()], &label).await?;
        info!(unit = %self.unit, "Load balancer disabled");
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        self.query("is-active").await
    }
}
