//! Per-mode network orchestration and the allowlist background refresher.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acl::{self, AclManager};
use crate::dns::{self, DnsResolver, IpCache};
use crate::error::AclError;
use crate::hypervisor::HypervisorDriver;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
const NIC_DEVICE: &str = "eth0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Open,
    Restricted {
        allow_local_network_access: bool,
    },
    Allowlist {
        domains: Vec<String>,
        allow_local_network_access: bool,
    },
}

pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub refresh_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Open,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

pub struct NetworkManager {
    container_name: String,
    driver: HypervisorDriver,
    acl: AclManager,
    base_dir: PathBuf,
    config: NetworkConfig,
    refresher: Option<(CancellationToken, JoinHandle<()>)>,
}

impl NetworkManager {
    pub fn new(container_name: String, driver: HypervisorDriver, base_dir: PathBuf, config: NetworkConfig) -> Self {
        let acl = AclManager::new(driver.clone());
        Self {
            container_name,
            driver,
            acl,
            base_dir,
            config,
            refresher: None,
        }
    }

    fn cache_path(&self) -> PathBuf {
        dns::cache_path(&self.base_dir, &self.container_name)
    }

    fn gateway_ip(&self) -> Result<String, AclError> {
        let show = self.driver.exec_capture(&["network", "show", "coi-bridge"])?;
        let address = acl::parse_yaml_like_field(&show, "ipv4.address")
            .ok_or_else(|| AclError::Hypervisor(crate::error::HypervisorError::Parse(
                "network show did not contain ipv4.address".to_string(),
            )))?;
        acl::gateway_from_ipv4_address(&address)
            .ok_or_else(|| AclError::Hypervisor(crate::error::HypervisorError::Parse(
                "malformed ipv4.address".to_string(),
            )))
    }

    /// Must run strictly before container start, per the ordering guarantee
    /// in the concurrency model: device attachment and ACL installation
    /// both precede `start`.
    pub async fn setup(&mut self) -> Result<(), AclError> {
        match self.config.mode.clone() {
            NetworkMode::Open => {
                info!(container = %self.container_name, "network mode: open, no ACL installed");
                Ok(())
            }
            NetworkMode::Restricted { allow_local_network_access } => {
                info!(container = %self.container_name, "network mode: restricted");
                let gateway = self.gateway_ip()?;
                let rules = acl::build_restricted_rules(&gateway, allow_local_network_access);
                self.acl.create(&self.container_name, &rules)?;
                self.acl.apply_to_container(&self.container_name, NIC_DEVICE)?;
                self.attempt_ovn_host_route();
                Ok(())
            }
            NetworkMode::Allowlist { domains, allow_local_network_access } => {
                info!(container = %self.container_name, domain_count = domains.len(), "network mode: allowlist");
                if domains.is_empty() {
                    return Err(AclError::Hypervisor(crate::error::HypervisorError::Parse(
                        "allowlist mode requires at least one allowed domain".to_string(),
                    )));
                }

                let gateway = self.gateway_ip()?;
                let mut cache = IpCache::load(&self.cache_path());
                let resolver = DnsResolver::new()
                    .map_err(|e| AclError::Hypervisor(crate::error::HypervisorError::Parse(e.to_string())))?;
                let mut resolved = resolver
                    .resolve_all(&domains, &cache)
                    .await
                    .map_err(|e| AclError::Hypervisor(crate::error::HypervisorError::Parse(e.to_string())))?;
                resolved.insert(dns::GATEWAY_KEY.to_string(), vec![gateway.clone()]);

                let rules = acl::build_allowlist_rules(&gateway, allow_local_network_access, &resolved);
                self.acl.create(&self.container_name, &rules)?;
                self.acl.apply_to_container(&self.container_name, NIC_DEVICE)?;

                dns::update_cache(&mut cache, resolved);
                if let Err(e) = cache.save(&self.cache_path()) {
                    warn!(error = %e, "failed to persist IP cache");
                }

                self.attempt_ovn_host_route();
                self.start_refresher(domains, allow_local_network_access, gateway);
                Ok(())
            }
        }
    }

    fn start_refresher(&mut self, domains: Vec<String>, allow_local_network_access: bool, gateway: String) {
        let token = CancellationToken::new();
        let child_token = token.clone();
        let container_name = self.container_name.clone();
        let driver = self.driver.clone();
        let cache_path = self.cache_path();
        let interval = self.config.refresh_interval;

        let handle = tokio::spawn(async move {
            let acl = AclManager::new(driver);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = child_token.cancelled() => {
                        info!(container = %container_name, "refresher cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = refresh_once(&acl, &container_name, &domains, allow_local_network_access, &gateway, &cache_path).await {
                            error!(container = %container_name, error = %e, "allowlist refresh failed");
                        }
                    }
                }
            }
        });

        self.refresher = Some((token, handle));
    }

    fn attempt_ovn_host_route(&self) {
        // Best-effort convenience: if this fails, log the exact command so
        // the user can run it manually. Never fatal.
        match self.driver.exec_capture(&["network", "show", "coi-bridge"]) {
            Ok(show) => {
                if acl::parse_yaml_like_field(&show, "type").as_deref() != Some("ovn") {
                    return;
                }
                let subnet = acl::parse_yaml_like_field(&show, "ipv4.address").unwrap_or_default();
                let cmd = format!("ip route add {} via <uplink-ip>", subnet);
                if self
                    .driver
                    .exec_silent(&["network", "show", "coi-uplink"])
                    .is_err()
                {
                    warn!(
                        "could not add OVN host route automatically; run manually if host->container access is needed: `{}`",
                        cmd
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "could not determine network type for OVN host-route convenience");
            }
        }
    }

    /// Cancel the refresher (if any) and wait for it to actually exit, then
    /// delete the ACL. Deletion errors are logged, not propagated — cleanup
    /// is always best-effort.
    pub async fn teardown(&mut self) {
        if let Some((token, handle)) = self.refresher.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "refresher task panicked during teardown");
            }
        }

        if matches!(self.config.mode, NetworkMode::Open) {
            return;
        }

        if let Err(e) = self.acl.delete(&self.container_name) {
            warn!(container = %self.container_name, error = %e, "ACL teardown failed (non-fatal)");
        }
    }
}

async fn refresh_once(
    acl: &AclManager,
    container_name: &str,
    domains: &[String],
    allow_local_network_access: bool,
    gateway: &str,
    cache_path: &Path,
) -> anyhow::Result<()> {
    let mut cache = IpCache::load(cache_path);
    let resolver = DnsResolver::new()?;
    let mut resolved = resolver.resolve_all(domains, &cache).await?;
    resolved.insert(dns::GATEWAY_KEY.to_string(), vec![gateway.to_string()]);

    if dns::ips_unchanged(&resolved, &cache) {
        return Ok(());
    }

    let rules = acl::build_allowlist_rules(gateway, allow_local_network_access, &resolved);
    acl.recreate_with_new_ips(container_name, NIC_DEVICE, &rules)?;

    dns::update_cache(&mut cache, resolved);
    cache.save(cache_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_is_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.mode, NetworkMode::Open);
    }
}
