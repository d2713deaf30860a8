//! Egress/ingress ACL construction and lifecycle.
//!
//! The hypervisor's ACL engine evaluates rules in insertion order, so the
//! order this module builds rules in is load-bearing, not cosmetic — see
//! the rule-ordering invariant in the network-isolation design.

use tracing::{debug, info, warn};

use crate::error::{AclError, HypervisorError};
use crate::hypervisor::HypervisorDriver;

const RFC1918_RANGES: &[&str] = &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];
const LINK_LOCAL_RANGE: &str = "169.254.0.0/16";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Reject,
}

impl RuleAction {
    fn as_str(self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Egress,
    Ingress,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Egress => "egress",
            Direction::Ingress => "ingress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub direction: Direction,
    pub action: RuleAction,
    pub destination: Option<String>,
}

impl AclRule {
    pub fn to_spec(&self) -> String {
        match &self.destination {
            Some(dest) => format!(
                "{} action={} destination={}",
                self.direction.as_str(),
                self.action.as_str(),
                dest
            ),
            None => format!("{} action={}", self.direction.as_str(), self.action.as_str()),
        }
    }
}

fn allow_gateway_or_local(gateway_ip: &str, allow_local_network_access: bool) -> AclRule {
    let destination = if allow_local_network_access {
        None // allow-to-local-networks: no destination restriction beyond direction+action
    } else {
        Some(format!("{}/32", gateway_ip))
    };
    AclRule {
        direction: Direction::Egress,
        action: RuleAction::Allow,
        destination,
    }
}

fn reject_private_ranges() -> Vec<AclRule> {
    RFC1918_RANGES
        .iter()
        .chain(std::iter::once(&LINK_LOCAL_RANGE))
        .map(|cidr| AclRule {
            direction: Direction::Egress,
            action: RuleAction::Reject,
            destination: Some(cidr.to_string()),
        })
        .collect()
}

/// Restricted mode: allow internet, block RFC1918/link-local. Order is
/// allow-to-gateway, then the rejects, then a catch-all allow — rejects
/// must precede the catch-all or they'd be shadowed by it.
pub fn build_restricted_rules(gateway_ip: &str, allow_local_network_access: bool) -> Vec<AclRule> {
    let mut rules = vec![allow_gateway_or_local(gateway_ip, allow_local_network_access)];
    rules.extend(reject_private_ranges());
    rules.push(AclRule {
        direction: Direction::Egress,
        action: RuleAction::Allow,
        destination: None,
    });
    rules
}

/// Allowlist mode: allow-to-gateway, then one dedup'd+sorted allow per
/// resolved IP, then the RFC1918/link-local rejects. No explicit
/// `0.0.0.0/0` reject — OVN's implicit default-deny on an attached ACL
/// covers it, and an explicit reject would interfere with hypervisor
/// routing internals.
pub fn build_allowlist_rules(
    gateway_ip: &str,
    allow_local_network_access: bool,
    resolved_ips: &std::collections::HashMap<String, Vec<String>>,
) -> Vec<AclRule> {
    let mut rules = vec![allow_gateway_or_local(gateway_ip, allow_local_network_access)];

    let mut unique_ips: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for (domain, ips) in resolved_ips {
        if domain == crate::dns::GATEWAY_KEY {
            continue;
        }
        for ip in ips {
            unique_ips.insert(ip.clone());
        }
    }

    for ip in &unique_ips {
        rules.push(AclRule {
            direction: Direction::Egress,
            action: RuleAction::Allow,
            destination: Some(format!("{}/32", ip)),
        });
    }

    rules.extend(reject_private_ranges());
    rules
}

pub fn ingress_allow_rule() -> AclRule {
    AclRule {
        direction: Direction::Ingress,
        action: RuleAction::Allow,
        destination: None,
    }
}

/// Thin wrapper over the hypervisor's ACL subcommands.
pub struct AclManager {
    driver: HypervisorDriver,
}

impl AclManager {
    pub fn new(driver: HypervisorDriver) -> Self {
        Self { driver }
    }

    fn acl_name(container_name: &str) -> String {
        format!("coi-{}", container_name)
    }

    pub fn create(&self, container_name: &str, rules: &[AclRule]) -> Result<(), AclError> {
        let acl_name = Self::acl_name(container_name);
        info!(acl_name, rule_count = rules.len(), "creating ACL");
        self.driver.exec_silent(&["network", "acl", "create", &acl_name])?;

        let mut all_rules: Vec<&AclRule> = rules.iter().collect();
        let ingress = ingress_allow_rule();
        all_rules.push(&ingress);

        for rule in all_rules {
            let spec = rule.to_spec();
            debug!(acl_name, rule = %spec, "adding ACL rule");
            self.driver
                .exec_silent(&["network", "acl", "rule", "add", &acl_name, &spec])?;
        }
        Ok(())
    }

    pub fn delete(&self, container_name: &str) -> Result<(), AclError> {
        let acl_name = Self::acl_name(container_name);
        match self.driver.exec_silent(&["network", "acl", "delete", &acl_name]) {
            Ok(()) => Ok(()),
            Err(HypervisorError::Exit(e)) => {
                warn!(acl_name, code = e.code, "ACL delete failed (treated as not-found, best-effort)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// First override the container's NIC device to its own scope (copying
    /// all profile attributes), then set `security.acls` — a profile-level
    /// device can't be mutated directly.
    pub fn apply_to_container(&self, container_name: &str, nic_device: &str) -> Result<(), AclError> {
        if !self.network_is_ovn(container_name, nic_device)? {
            return Err(AclError::NotSupported);
        }

        let acl_name = Self::acl_name(container_name);
        self.driver.exec_silent(&[
            "config",
            "device",
            "override",
            container_name,
            nic_device,
        ])?;
        let acls_prop = format!("security.acls={}", acl_name);
        self.driver
            .exec_silent(&["config", "device", "set", container_name, nic_device, &acls_prop])?;
        Ok(())
    }

    /// Delete and recreate, then re-attach. Lock-free with respect to the
    /// container — the hypervisor applies the new rule set atomically on
    /// attach, though there's a brief window with no ACL attached at all
    /// between delete and recreate (accepted non-atomicity, see design notes).
    pub fn recreate_with_new_ips(
        &self,
        container_name: &str,
        nic_device: &str,
        rules: &[AclRule],
    ) -> Result<(), AclError> {
        self.delete(container_name)?;
        self.create(container_name, rules)?;
        self.apply_to_container(container_name, nic_device)?;
        Ok(())
    }

    fn network_is_ovn(&self, container_name: &str, nic_device: &str) -> Result<bool, AclError> {
        let network_name = self.device_network_name(container_name, nic_device)?;
        let show = self
            .driver
            .exec_capture(&["network", "show", &network_name])?;
        Ok(parse_yaml_like_field(&show, "type")
            .map(|v| v.eq_ignore_ascii_case("ovn"))
            .unwrap_or(false))
    }

    fn device_network_name(&self, container_name: &str, nic_device: &str) -> Result<String, AclError> {
        let show = self
            .driver
            .exec_capture(&["config", "device", "show", container_name])?;
        // devices are rendered as `<device>:\n  network: <name>\n  ...`
        let mut in_device = false;
        for line in show.lines() {
            let trimmed = line.trim_start();
            if !line.starts_with(' ') {
                in_device = trimmed.trim_end_matches(':') == nic_device;
                continue;
            }
            if in_device {
                if let Some(name) = trimmed.strip_prefix("network:").map(|v| v.trim().to_string()) {
                    return Ok(name);
                }
            }
        }
        Err(AclError::Hypervisor(HypervisorError::Parse(format!(
            "no network found for device {nic_device} on {container_name}"
        ))))
    }
}

/// Extract `key: value` from the hypervisor's line-based YAML-like `*show`
/// output. Only top-level (unindented) keys are considered.
pub fn parse_yaml_like_field(raw: &str, key: &str) -> Option<String> {
    for line in raw.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        if let Some(rest) = line.strip_prefix(&format!("{}:", key)) {
            let value = rest.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Extract the gateway IP (the non-CIDR portion) from a network's
/// `ipv4.address` field, e.g. `"10.128.178.1/24"` -> `"10.128.178.1"`.
pub fn gateway_from_ipv4_address(ipv4_address: &str) -> Option<String> {
    ipv4_address.split('/').next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn restricted_rule_ordering_matches_scenario() {
        let rules = build_restricted_rules("10.128.178.1", false);
        let specs: Vec<String> = rules.iter().map(|r| r.to_spec()).collect();
        assert_eq!(
            specs,
            vec![
                "egress action=allow destination=10.128.178.1/32",
                "egress action=reject destination=10.0.0.0/8",
                "egress action=reject destination=172.16.0.0/12",
                "egress action=reject destination=192.168.0.0/16",
                "egress action=reject destination=169.254.0.0/16",
                "egress action=allow",
            ]
        );
    }

    #[test]
    fn restricted_reject_precedes_catch_all_allow() {
        let rules = build_restricted_rules("10.0.0.1", false);
        let first_reject = rules.iter().position(|r| r.action == RuleAction::Reject).unwrap();
        let catch_all = rules
            .iter()
            .position(|r| r.action == RuleAction::Allow && r.destination.is_none())
            .unwrap();
        assert!(first_reject < catch_all);
    }

    #[test]
    fn allowlist_dedup_and_ordering_matches_scenario() {
        let mut resolved = HashMap::new();
        resolved.insert("api.example.com".to_string(), vec!["1.2.3.4".to_string()]);
        resolved.insert(
            "cdn.example.com".to_string(),
            vec!["1.2.3.4".to_string(), "5.6.7.8".to_string()],
        );
        resolved.insert(crate::dns::GATEWAY_KEY.to_string(), vec!["10.0.0.1".to_string()]);

        let rules = build_allowlist_rules("10.0.0.1", false, &resolved);
        let specs: Vec<String> = rules.iter().map(|r| r.to_spec()).collect();

        let allow_ip_count = specs
            .iter()
            .filter(|s| s.starts_with("egress action=allow destination=") && s.ends_with("/32"))
            .filter(|s| *s != "egress action=allow destination=10.0.0.1/32")
            .count();
        assert_eq!(allow_ip_count, 2);
        assert!(specs.contains(&"egress action=allow destination=1.2.3.4/32".to_string()));
        assert!(specs.contains(&"egress action=allow destination=5.6.7.8/32".to_string()));
        assert!(specs.contains(&"egress action=allow destination=10.0.0.1/32".to_string()));

        let first_allow_ip = specs
            .iter()
            .position(|s| s.starts_with("egress action=allow destination="))
            .unwrap();
        let first_reject = specs.iter().position(|s| s.contains("reject")).unwrap();
        assert!(first_allow_ip < first_reject);

        assert!(!specs.iter().any(|s| s.contains("0.0.0.0/0")));
    }

    #[test]
    fn allowlist_never_contains_explicit_catch_all_reject() {
        let resolved = HashMap::new();
        let rules = build_allowlist_rules("10.0.0.1", false, &resolved);
        assert!(!rules
            .iter()
            .any(|r| r.action == RuleAction::Reject && r.destination.as_deref() == Some("0.0.0.0/0")));
    }

    #[test]
    fn gateway_extraction_strips_cidr() {
        assert_eq!(
            gateway_from_ipv4_address("10.128.178.1/24"),
            Some("10.128.178.1".to_string())
        );
    }

    #[test]
    fn parse_yaml_like_field_reads_top_level_key() {
        let raw = "name: ovntest\ntype: ovn\nconfig:\n  ipv4.address: 10.0.0.1/24\n";
        assert_eq!(parse_yaml_like_field(raw, "type"), Some("ovn".to_string()));
        assert_eq!(parse_yaml_like_field(raw, "name"), Some("ovntest".to_string()));
    }
}
