//! Proxmox VE Adapter
//!
//! Implements [`HypervisorApi`] by driving the node-local `qm` and `pvesh`
//! command-line tools. Read queries use `pvesh ... --output-format json`;
//! mutations use `qm`.

use super::process::{args, run_bounded, run_checked, RunOutcome};
use crate::domain::{
    ClusterResource, FirewallOptions, HypervisorApi, RemoteEntity, StorageInfo, StorageVolume,
    Vmid, VmOptions,
};
use crate::error::{Error, RemoteFailureKind, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Proxmox VE adapter
#[derive(Debug, Clone)]
pub struct PveConfig {
    /// `qm` binary
    pub qm: String,
    /// `pvesh` binary
    pub pvesh: String,
    /// Bound on read-only queries
    pub query_timeout: Duration,
    /// Bound on mutations (disk import can be slow)
    pub operation_timeout: Duration,
}

impl Default for PveConfig {
    fn default() -> Self {
        Self {
            qm: "qm".to_string(),
            pvesh: "pvesh".to_string(),
            query_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// Failure Classification
// =============================================================================

/// Classify a CLI failure from its diagnostic text.
///
/// The CLI reports no structured error codes, so this is the fallback that
/// turns its messages into a [`RemoteFailureKind`].
pub fn classify_failure(diagnostics: &str) -> RemoteFailureKind {
    let lower = diagnostics.to_ascii_lowercase();
    if lower.contains("already exists") {
        RemoteFailureKind::AlreadyExists
    } else if entity_missing(&lower) {
        RemoteFailureKind::NotFound
    } else {
        RemoteFailureKind::Other
    }
}

/// Only a missing VM config means the entity is gone; a missing volume or
/// storage is a different failure.
fn entity_missing(lower: &str) -> bool {
    (lower.contains("configuration file") && lower.contains("does not exist"))
        || lower.contains("no such vm")
}

/// Local node name: `hostname --short`, falling back to `/etc/hostname`
pub async fn detect_node() -> Result<String> {
    let from_cmd = run_checked("hostname", &args(["--short"]), Duration::from_secs(5))
        .await
        .map(|s| s.trim().to_string());

    match from_cmd {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => {
            let raw = tokio::fs::read_to_string("/etc/hostname").await.map_err(|e| {
                Error::Configuration(format!("cannot determine node name: {}", e))
            })?;
            let name = raw.trim().split('.').next().unwrap_or_default().to_string();
            if name.is_empty() {
                return Err(Error::Configuration("node name is empty".into()));
            }
            Ok(name)
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

fn flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        serde_json::Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

fn de_vmid<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vmid>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| Vmid::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct QemuEntry {
    #[serde(default, deserialize_with = "de_vmid")]
    vmid: Option<Vmid>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    template: bool,
}

#[derive(Debug, Deserialize)]
struct ResourceEntry {
    #[serde(default, deserialize_with = "de_vmid")]
    vmid: Option<Vmid>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageEntry {
    storage: String,
    #[serde(default, deserialize_with = "flag")]
    active: bool,
    #[serde(default, deserialize_with = "flag")]
    enabled: bool,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct VolumeEntry {
    volid: String,
    #[serde(default, deserialize_with = "de_vmid")]
    vmid: Option<Vmid>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirewallEntry {
    #[serde(default, deserialize_with = "flag")]
    enable: bool,
    #[serde(default)]
    dhcp: Option<serde_json::Value>,
    #[serde(default)]
    macfilter: Option<serde_json::Value>,
    #[serde(default)]
    policy_in: Option<String>,
    #[serde(default)]
    policy_out: Option<String>,
}

impl From<StorageEntry> for StorageInfo {
    fn from(e: StorageEntry) -> Self {
        Self {
            storage: e.storage,
            active: e.active,
            enabled: e.enabled,
            content: e
                .content
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }
}

fn truthy_or(v: Option<serde_json::Value>, default: bool) -> bool {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::String(s)) => s == "1",
        _ => default,
    }
}

impl From<FirewallEntry> for FirewallOptions {
    fn from(e: FirewallEntry) -> Self {
        let defaults = FirewallOptions::default();
        Self {
            enable: e.enable,
            dhcp: truthy_or(e.dhcp, defaults.dhcp),
            macfilter: truthy_or(e.macfilter, defaults.macfilter),
            policy_in: e.policy_in.unwrap_or(defaults.policy_in),
            policy_out: e.policy_out.unwrap_or(defaults.policy_out),
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// [`HypervisorApi`] over the Proxmox VE command-line tools
pub struct PveCli {
    config: PveConfig,
    node: String,
}

impl PveCli {
    pub fn new(config: PveConfig, node: impl Into<String>) -> Self {
        Self {
            config,
            node: node.into(),
        }
    }

    /// Adapter for `node`, or for the local node when `None`
    pub async fn detect(config: PveConfig, node: Option<String>) -> Result<Self> {
        let node = match node {
            Some(n) => n,
            None => detect_node().await?,
        };
        info!("Operating on Proxmox node: {}", node);
        Ok(Self::new(config, node))
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, path: &str, extra: &[&str]) -> Result<T> {
        let mut argv = args(["get", path]);
        argv.extend(extra.iter().map(|s| s.to_string()));
        argv.extend(args(["--output-format", "json"]));

        let query_err = |reason: String| Error::RemoteQuery {
            operation: operation.to_string(),
            reason,
        };

        match run_bounded(&self.config.pvesh, &argv, self.config.query_timeout).await? {
            RunOutcome::Finished(out) if out.success() => {
                serde_json::from_str(&out.stdout).map_err(|e| query_err(format!("bad JSON: {}", e)))
            }
            RunOutcome::Finished(out) => Err(query_err(out.diagnostics())),
            RunOutcome::TimedOut => Err(query_err(format!(
                "timed out after {}s",
                self.config.query_timeout.as_secs()
            ))),
        }
    }

    /// Run a mutating command, mapping failures to [`Error::RemoteOperation`]
    async fn mutate(&self, operation: &str, vmid: Vmid, program: &str, argv: Vec<String>) -> Result<String> {
        let fail = |kind, reason: String| Error::RemoteOperation {
            operation: operation.to_string(),
            vmid,
            kind,
            reason,
        };

        match run_bounded(program, &argv, self.config.operation_timeout).await? {
            RunOutcome::Finished(out) if out.success() => Ok(out.stdout),
            RunOutcome::Finished(out) => {
                let diagnostics = out.diagnostics();
                Err(fail(classify_failure(&diagnostics), diagnostics))
            }
            RunOutcome::TimedOut => Err(fail(
                RemoteFailureKind::Other,
                format!("timed out after {}s", self.config.operation_timeout.as_secs()),
            )),
        }
    }

    async fn qm(&self, operation: &str, vmid: Vmid, sub: &str, options: &VmOptions) -> Result<()> {
        let mut argv = args([sub.to_string(), vmid.to_string()]);
        for (key, value) in options {
            argv.push(format!("--{}", key));
            argv.push(value.clone());
        }
        self.mutate(operation, vmid, &self.config.qm, argv).await?;
        Ok(())
    }

    async fn node_get_json<T: DeserializeOwned>(&self, operation: &str, vmid: Vmid, suffix: &str) -> Result<T> {
        let path = format!("/nodes/{}/qemu/{}/{}", self.node, vmid, suffix);
        let argv = args(["get".to_string(), path, "--output-format".into(), "json".into()]);
        let stdout = self.mutate(operation, vmid, &self.config.pvesh, argv).await?;
        serde_json::from_str(&stdout).map_err(|e| Error::RemoteOperation {
            operation: operation.to_string(),
            vmid,
            kind: RemoteFailureKind::Other,
            reason: format!("bad JSON: {}", e),
        })
    }
}

#[async_trait]
impl HypervisorApi for PveCli {
    fn node(&self) -> &str {
        &self.node
    }

    async fn list_entities(&self) -> Result<Vec<RemoteEntity>> {
        let path = format!("/nodes/{}/qemu", self.node);
        let entries: Vec<QemuEntry> = self.get_json("list entities", &path, &[]).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                Some(RemoteEntity {
                    vmid: e.vmid?,
                    name: e.name?,
                    template: e.template,
                })
            })
            .collect())
    }

    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>> {
        let entries: Vec<ResourceEntry> = self
            .get_json("cluster resources", "/cluster/resources", &["--type", "vm"])
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                Some(ClusterResource {
                    vmid: e.vmid?,
                    name: e.name,
                    node: e.node,
                })
            })
            .collect())
    }

    async fn list_storages(&self) -> Result<Vec<StorageInfo>> {
        let path = format!("/nodes/{}/storage", self.node);
        let entries: Vec<StorageEntry> = self.get_json("list storages", &path, &[]).await?;
        Ok(entries.into_iter().map(StorageInfo::from).collect())
    }

    async fn storage_content(&self, storage: &str) -> Result<Vec<StorageVolume>> {
        let path = format!("/nodes/{}/storage/{}/content", self.node, storage);
        let entries: Vec<VolumeEntry> = self.get_json("storage content", &path, &[]).await?;
        Ok(entries
            .into_iter()
            .map(|e| StorageVolume {
                volid: e.volid,
                vmid: e.vmid,
                parent: e.parent,
                content: e.content,
                format: e.format,
            })
            .collect())
    }

    async fn create(&self, vmid: Vmid, options: &VmOptions) -> Result<()> {
        debug!(vmid, "qm create");
        self.qm("create", vmid, "create", options).await
    }

    async fn configure(&self, vmid: Vmid, options: &VmOptions) -> Result<()> {
        self.qm("configure", vmid, "set", options).await
    }

    async fn config(&self, vmid: Vmid) -> Result<BTreeMap<String, String>> {
        let raw: BTreeMap<String, serde_json::Value> =
            self.node_get_json("config", vmid, "config").await?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect())
    }

    async fn set_description(&self, vmid: Vmid, description: &str) -> Result<()> {
        let options = vec![("description".to_string(), description.to_string())];
        self.qm("description", vmid, "set", &options).await
    }

    async fn destroy(&self, vmid: Vmid) -> Result<()> {
        self.qm("destroy", vmid, "destroy", &Vec::new()).await
    }

    async fn mark_template(&self, vmid: Vmid) -> Result<()> {
        self.qm("template", vmid, "template", &Vec::new()).await
    }

    async fn firewall_options(&self, vmid: Vmid) -> Result<FirewallOptions> {
        let entry: FirewallEntry = self
            .node_get_json("firewall options", vmid, "firewall/options")
            .await?;
        Ok(entry.into())
    }

    async fn set_firewall_options(&self, vmid: Vmid, options: &FirewallOptions) -> Result<()> {
        let bit = |b: bool| (if b { "1" } else { "0" }).to_string();
        let argv = args([
            "set".to_string(),
            format!("/nodes/{}/qemu/{}/firewall/options", self.node, vmid),
            "--enable".into(),
            bit(options.enable),
            "--dhcp".into(),
            bit(options.dhcp),
            "--macfilter".into(),
            bit(options.macfilter),
            "--policy_in".into(),
            options.policy_in.clone(),
            "--policy_out".into(),
            options.policy_out.clone(),
        ]);
        self.mutate("firewall options", vmid, &self.config.pvesh, argv)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("Configuration file 'nodes/pve/qemu-server/9000.conf' does not exist"),
            RemoteFailureKind::NotFound
        );
        assert_eq!(
            classify_failure("unable to create VM 9000 - VM 9000 already exists on node 'pve2'"),
            RemoteFailureKind::AlreadyExists
        );
        assert_eq!(classify_failure("storage is full"), RemoteFailureKind::Other);
        assert_eq!(classify_failure("no such VM ('9000')"), RemoteFailureKind::NotFound);
    }

    #[test]
    fn test_missing_volume_is_not_missing_entity() {
        assert_eq!(
            classify_failure("lvremove 'pve/vm-9000-disk-0' error: no such logical volume pve/vm-9000-disk-0"),
            RemoteFailureKind::Other
        );
        assert_eq!(
            classify_failure("storage 'local-zfs' does not exist"),
            RemoteFailureKind::Other
        );
        assert_eq!(
            classify_failure("zfs error: cannot open 'rpool/data/base-9000-disk-0': dataset does not exist"),
            RemoteFailureKind::Other
        );
    }

    #[test]
    fn test_parse_wire_types() {
        let entries: Vec<QemuEntry> = serde_json::from_str(
            r#"[{"vmid": 9000, "name": "web", "template": 1, "status": "stopped"},
                {"vmid": "101", "name": "app", "status": "running"}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].vmid, Some(9000));
        assert!(entries[0].template);
        assert_eq!(entries[1].vmid, Some(101));
        assert!(!entries[1].template);

        let fw: FirewallOptions = serde_json::from_str::<FirewallEntry>(r#"{"enable": 1, "policy_in": "DROP"}"#)
            .unwrap()
            .into();
        assert!(fw.enable);
        assert!(fw.dhcp);
        assert_eq!(fw.policy_in, "DROP");
        assert_eq!(fw.policy_out, "ACCEPT");
    }

    #[test]
    fn test_parse_storages() {
        let entries: Vec<StorageEntry> = serde_json::from_str(
            r#"[{"storage":"local","active":1,"enabled":1,"content":"iso,vztmpl"},
                {"storage":"local-zfs","active":1,"enabled":1,"content":"images, rootdir"},
                {"storage":"nfs","active":0,"content":"images"}]"#,
        )
        .unwrap();
        let storages: Vec<StorageInfo> = entries.into_iter().map(StorageInfo::from).collect();

        assert!(!storages[0].accepts_vm_images());
        assert_eq!(storages[1].content, vec!["images", "rootdir"]);
        assert!(storages[1].accepts_vm_images());
        assert!(!storages[2].enabled);
    }

    #[tokio::test]
    async fn test_query_failure_is_remote_query() {
        let api = PveCli::new(
            PveConfig {
                pvesh: "false".into(),
                ..Default::default()
            },
            "pve1",
        );

        let err = api.list_entities().await.unwrap_err();
        assert_matches!(err, Error::RemoteQuery { .. });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_mutation_failure_is_remote_operation() {
        let api = PveCli::new(
            PveConfig {
                qm: "false".into(),
                ..Default::default()
            },
            "pve1",
        );
        let err = api.destroy(9000).await.unwrap_err();
        assert_matches!(err, Error::RemoteOperation { vmid: 9000, .. });
        assert_eq!(err.remote_kind(), Some(RemoteFailureKind::Other));
    }
}
