//! DNS resolution with persistent caching.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::DnsError;

/// Reserved key under which the gateway IP is stashed in the domain map so
/// it participates in ACL assembly without being logged as a "domain".
pub const GATEWAY_KEY: &str = "__internal_gateway__";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpCache {
    pub domains: BTreeMap<String, Vec<String>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl IpCache {
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Persist atomically: write to a temp file in the same directory, then
    /// rename over the destination.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsResolver {
    pub fn new() -> Result<Self, DnsError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, DnsError> {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(Self { resolver, timeout })
    }

    /// Resolve each domain to its IPv4 set. On a per-domain failure, fall
    /// back to the cached list if present; log and skip otherwise. If *no*
    /// domain resolves and the cache is entirely empty, the call fails.
    pub async fn resolve_all(
        &self,
        domains: &[String],
        cache: &IpCache,
    ) -> Result<HashMap<String, Vec<String>>, DnsError> {
        let mut resolved = HashMap::new();
        let mut any_success = false;

        for domain in domains {
            match tokio::time::timeout(self.timeout, self.resolver.lookup_ip(domain.as_str())).await {
                Ok(Ok(lookup)) => {
                    let ips: Vec<String> = lookup
                        .iter()
                        .filter_map(|ip| match ip {
                            std::net::IpAddr::V4(v4) => Some(v4.to_string()),
                            std::net::IpAddr::V6(_) => None,
                        })
                        .collect();
                    if !ips.is_empty() {
                        any_success = true;
                        resolved.insert(domain.clone(), ips);
                        continue;
                    }
                    warn!(domain, "resolved zero IPv4 addresses");
                }
                Ok(Err(e)) => {
                    debug!(domain, error = %e, "resolution failed");
                }
                Err(_) => {
                    debug!(domain, "resolution timed out");
                }
            }

            if let Some(cached) = cache.domains.get(domain) {
                warn!(domain, "falling back to cached IPs after resolution failure");
                resolved.insert(domain.clone(), cached.clone());
            } else {
                warn!(domain, "resolution failed and no cache entry available, skipping");
            }
        }

        if !any_success && cache.domains.is_empty() {
            return Err(DnsError::NoneResolvedNoCache);
        }

        Ok(resolved)
    }

    /// Parse-only helper exposed for the gateway IP, which callers source
    /// from the hypervisor's network config rather than a lookup.
    pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
        s.parse().ok()
    }
}

/// True iff `new` has the same key set as `cache.domains` and, for each key,
/// the same value set after sorting. Used to short-circuit ACL recreation.
pub fn ips_unchanged(new: &HashMap<String, Vec<String>>, cache: &IpCache) -> bool {
    let new_keys: BTreeSet<&String> = new.keys().collect();
    let cache_keys: BTreeSet<&String> = cache.domains.keys().collect();
    if new_keys != cache_keys {
        return false;
    }

    for (domain, ips) in new {
        let mut a: Vec<&String> = ips.iter().collect();
        a.sort();
        let mut b: Vec<&String> = cache.domains.get(domain).map(|v| v.iter().collect()).unwrap_or_default();
        b.sort();
        if a != b {
            return false;
        }
    }
    true
}

pub fn update_cache(cache: &mut IpCache, new: HashMap<String, Vec<String>>) {
    cache.domains = new.into_iter().collect();
    cache.last_update = Some(Utc::now());
}

pub fn cache_path(base: &Path, container_name: &str) -> PathBuf {
    base.join("network-cache").join(format!("{}.json", container_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn cache_from(pairs: &[(&str, &[&str])]) -> IpCache {
        IpCache {
            domains: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
            last_update: None,
        }
    }

    #[test]
    fn ips_unchanged_true_for_identical_maps() {
        let cache = cache_from(&[("api.example.com", &["1.2.3.4"])]);
        let new = map(&[("api.example.com", &["1.2.3.4"])]);
        assert!(ips_unchanged(&new, &cache));
    }

    #[test]
    fn ips_unchanged_ignores_ordering() {
        let cache = cache_from(&[("api.example.com", &["1.2.3.4", "5.6.7.8"])]);
        let new = map(&[("api.example.com", &["5.6.7.8", "1.2.3.4"])]);
        assert!(ips_unchanged(&new, &cache));
    }

    #[test]
    fn ips_unchanged_false_on_new_domain() {
        let cache = cache_from(&[("api.example.com", &["1.2.3.4"])]);
        let new = map(&[
            ("api.example.com", &["1.2.3.4"]),
            ("cdn.example.com", &["5.6.7.8"]),
        ]);
        assert!(!ips_unchanged(&new, &cache));
    }

    #[test]
    fn ips_unchanged_false_on_changed_ip() {
        let cache = cache_from(&[("api.example.com", &["1.2.3.4"])]);
        let new = map(&[("api.example.com", &["9.9.9.9"])]);
        assert!(!ips_unchanged(&new, &cache));
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = IpCache::default();
        update_cache(&mut cache, map(&[("api.example.com", &["1.2.3.4"])]));
        cache.save(&path).unwrap();

        let loaded = IpCache::load(&path);
        assert_eq!(loaded.domains, cache.domains);
    }

    #[test]
    fn load_missing_file_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IpCache::load(&dir.path().join("does-not-exist.json"));
        assert!(cache.domains.is_empty());
    }
}
