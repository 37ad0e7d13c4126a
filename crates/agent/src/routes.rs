//! Route installer (§4.5): wraps the `ip` command directly rather than
//! pulling in a netlink crate — correctness of the underlying OS calls
//! is a deployment concern per the spec, not a core algorithm, and
//! `manhpham90vn-tunnel` has no routing code of its own to generalize
//! from, so this follows the spec's own prescription verbatim.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::error::{AgentError, Result};

#[async_trait]
pub trait RouteInstaller: Send + Sync {
    async fn add(&self, dest_cidr: &str, gateway: Option<&str>, iface: &str) -> Result<()>;
    async fn del(&self, dest_cidr: &str) -> Result<()>;
    async fn add_default(&self, gateway: Option<&str>, iface: &str) -> Result<()>;
    async fn del_default(&self) -> Result<()>;
    /// Removes every route this installer has added, in reverse order
    /// (§4.4 step 8: "`Cleanup` all installed routes in reverse order").
    async fn cleanup_all(&self) -> Result<()>;
}

/// Real implementation: shells out to `ip route`. Installed routes are
/// tracked so `cleanup_all` can reverse them without the caller having
/// to remember what it asked for.
pub struct IpRouteInstaller {
    installed: Mutex<Vec<InstalledRoute>>,
}

#[derive(Clone)]
enum InstalledRoute {
    Route(String),
    Default,
}

impl IpRouteInstaller {
    pub fn new() -> Self {
        Self { installed: Mutex::new(Vec::new()) }
    }

    async fn run_ip(args: &[&str]) -> Result<()> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::Route(format!("spawning ip {args:?}: {e}")))?;
        if !output.status.success() {
            return Err(AgentError::Route(format!(
                "ip {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

impl Default for IpRouteInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteInstaller for IpRouteInstaller {
    async fn add(&self, dest_cidr: &str, gateway: Option<&str>, iface: &str) -> Result<()> {
        let mut args = vec!["route", "add", dest_cidr, "dev", iface];
        if let Some(gw) = gateway {
            args.push("via");
            args.push(gw);
        }
        Self::run_ip(&args).await?;
        self.installed.lock().unwrap().push(InstalledRoute::Route(dest_cidr.to_string()));
        Ok(())
    }

    async fn del(&self, dest_cidr: &str) -> Result<()> {
        Self::run_ip(&["route", "del", dest_cidr]).await
    }

    async fn add_default(&self, gateway: Option<&str>, iface: &str) -> Result<()> {
        let mut args = vec!["route", "add", "default", "dev", iface];
        if let Some(gw) = gateway {
            args.push("via");
            args.push(gw);
        }
        Self::run_ip(&args).await?;
        self.installed.lock().unwrap().push(InstalledRoute::Default);
        Ok(())
    }

    async fn del_default(&self) -> Result<()> {
        Self::run_ip(&["route", "del", "default"]).await
    }

    async fn cleanup_all(&self) -> Result<()> {
        let routes: Vec<InstalledRoute> = self.installed.lock().unwrap().drain(..).collect();
        for route in routes.into_iter().rev() {
            let result = match &route {
                InstalledRoute::Route(cidr) => self.del(cidr).await,
                InstalledRoute::Default => self.del_default().await,
            };
            if let Err(e) = result {
                warn!(error = %e, "route cleanup step failed, continuing");
            }
        }
        Ok(())
    }
}

/// In-memory double for tests: records every call instead of shelling
/// out, so the runtime's route-installation steps (§4.4 step 4) can be
/// asserted on directly.
#[derive(Default)]
pub struct RecordingRouteInstaller {
    pub added: Mutex<Vec<String>>,
    pub default_added: Mutex<bool>,
    pub cleanup_calls: Mutex<u32>,
}

impl RecordingRouteInstaller {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteInstaller for RecordingRouteInstaller {
    async fn add(&self, dest_cidr: &str, _gateway: Option<&str>, _iface: &str) -> Result<()> {
        self.added.lock().unwrap().push(dest_cidr.to_string());
        Ok(())
    }

    async fn del(&self, dest_cidr: &str) -> Result<()> {
        self.added.lock().unwrap().retain(|r| r != dest_cidr);
        Ok(())
    }

    async fn add_default(&self, _gateway: Option<&str>, _iface: &str) -> Result<()> {
        *self.default_added.lock().unwrap() = true;
        Ok(())
    }

    async fn del_default(&self) -> Result<()> {
        *self.default_added.lock().unwrap() = false;
        Ok(())
    }

    async fn cleanup_all(&self) -> Result<()> {
        *self.cleanup_calls.lock().unwrap() += 1;
        self.added.lock().unwrap().clear();
        *self.default_added.lock().unwrap() = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_clears_recorded_routes() {
        let installer = RecordingRouteInstaller::new();
        installer.add("10.1.0.0/24", None, "tun0").await.unwrap();
        installer.add_default(Some("10.200.0.1"), "tun0").await.unwrap();
        assert_eq!(installer.added.lock().unwrap().len(), 1);

        installer.cleanup_all().await.unwrap();
        assert!(installer.added.lock().unwrap().is_empty());
        assert!(!*installer.default_added.lock().unwrap());
        assert_eq!(*installer.cleanup_calls.lock().unwrap(), 1);
    }
}
