//! Network and Firewall Hardening
//!
//! Published templates get the firewall flag on their primary NIC and a
//! restrictive entity-level firewall. Clones inherit both. Repair is
//! idempotent: nothing is written when the entity already matches.

use crate::domain::{FirewallOptions, HypervisorApiRef, Vmid, VmOptions};
use crate::error::Result;
use tracing::{debug, info};

/// Desired firewall posture for published templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardeningPolicy {
    /// Inbound policy (`DROP`, `REJECT` or `ACCEPT`)
    pub policy_in: String,
    /// Outbound policy
    pub policy_out: String,
}

impl Default for HardeningPolicy {
    fn default() -> Self {
        Self {
            policy_in: "DROP".to_string(),
            policy_out: "ACCEPT".to_string(),
        }
    }
}

impl HardeningPolicy {
    /// Firewall options the entity should end up with
    pub fn firewall_options(&self) -> FirewallOptions {
        FirewallOptions {
            enable: true,
            dhcp: true,
            macfilter: true,
            policy_in: self.policy_in.clone(),
            policy_out: self.policy_out.clone(),
        }
    }
}

/// `net0` value with `firewall=1`, or `None` if it already has it
pub fn net_with_firewall(net: &str) -> Option<String> {
    let mut parts: Vec<String> = net
        .split(',')
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();

    match parts.iter_mut().find(|p| p.starts_with("firewall=")) {
        Some(p) if p == "firewall=1" => None,
        Some(p) => {
            *p = "firewall=1".to_string();
            Some(parts.join(","))
        }
        None => {
            parts.push("firewall=1".to_string());
            Some(parts.join(","))
        }
    }
}

/// Bring `vmid` in line with `policy`. Returns whether anything changed.
pub async fn ensure_hardening(
    api: &HypervisorApiRef,
    vmid: Vmid,
    policy: &HardeningPolicy,
) -> Result<bool> {
    let mut changed = false;

    let config = api.config(vmid).await?;
    if let Some(net) = config.get("net0") {
        if let Some(fixed) = net_with_firewall(net) {
            let options: VmOptions = vec![("net0".to_string(), fixed)];
            api.configure(vmid, &options).await?;
            changed = true;
        }
    } else {
        debug!(vmid, "Entity has no net0, skipping NIC firewall flag");
    }

    let desired = policy.firewall_options();
    let current = api.firewall_options(vmid).await?;
    if current != desired {
        api.set_firewall_options(vmid, &desired).await?;
        changed = true;
    }

    if changed {
        info!(vmid, "Applied firewall hardening");
    } else {
        debug!(vmid, "Firewall hardening already in place");
    }
    Ok(changed)
}
