//! In-memory fakes of every port, for tests.

use crate::domain::{
    ByteFetcher, ClusterResource, CustomizeOp, CustomizeStatus, DiskCustomizer, DiskResizer,
    FirewallOptions, HypervisorApi, RemoteEntity, StorageInfo, StorageVolume, Vmid, VmOptions,
};
use crate::error::{Error, RemoteFailureKind, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Hypervisor
// =============================================================================

#[derive(Debug, Clone)]
struct FakeEntity {
    name: String,
    template: bool,
    config: BTreeMap<String, String>,
    description: Option<String>,
    firewall: FirewallOptions,
}

#[derive(Debug, Default)]
struct HypervisorState {
    entities: BTreeMap<Vmid, FakeEntity>,
    /// Non-template VMs elsewhere in the cluster
    foreign: BTreeMap<Vmid, String>,
    /// Taken identifiers that cluster listing does not show yet
    hidden: BTreeSet<Vmid>,
    storages: Vec<StorageInfo>,
    volumes: BTreeMap<String, Vec<StorageVolume>>,
    fail_queries: bool,
    fail_ops: BTreeSet<String>,
    calls: Vec<String>,
}

/// In-memory hypervisor
#[derive(Debug)]
pub struct FakeHypervisor {
    node: String,
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new(node: &str) -> Self {
        let state = HypervisorState {
            storages: vec![StorageInfo {
                storage: "local-zfs".into(),
                active: true,
                enabled: true,
                content: vec!["images".into(), "rootdir".into()],
            }],
            ..Default::default()
        };
        Self {
            node: node.to_string(),
            state: Mutex::new(state),
        }
    }

    pub fn add_foreign_vm(&self, vmid: Vmid, name: &str) {
        self.state.lock().foreign.insert(vmid, name.to_string());
    }

    pub fn reserve_hidden(&self, vmid: Vmid) {
        self.state.lock().hidden.insert(vmid);
    }

    /// Seed an already published template
    pub fn add_template(&self, vmid: Vmid, name: &str) {
        let mut config = BTreeMap::new();
        config.insert("name".to_string(), name.to_string());
        config.insert("net0".to_string(), "virtio,bridge=vmbr0".to_string());
        self.state.lock().entities.insert(
            vmid,
            FakeEntity {
                name: name.to_string(),
                template: true,
                config,
                description: None,
                firewall: FirewallOptions::default(),
            },
        );
    }

    pub fn add_storage(&self, storage: StorageInfo) {
        self.state.lock().storages.push(storage);
    }

    pub fn add_volume(&self, storage: &str, volume: StorageVolume) {
        self.state
            .lock()
            .volumes
            .entry(storage.to_string())
            .or_default()
            .push(volume);
    }

    /// Seed a linked clone of template `vmid` on `storage`
    pub fn add_linked_clone(&self, storage: &str, vmid: Vmid, clone_vmid: Vmid) {
        let base = format!("base-{}-disk-0", vmid);
        self.add_volume(
            storage,
            StorageVolume {
                volid: format!("{}:{}", storage, base),
                vmid: Some(vmid),
                parent: None,
                content: "images".into(),
                format: Some("raw".into()),
            },
        );
        self.add_volume(
            storage,
            StorageVolume {
                volid: format!("{}:vm-{}-disk-0", storage, clone_vmid),
                vmid: Some(clone_vmid),
                parent: Some(format!("{}@__base__", base)),
                content: "images".into(),
                format: Some("raw".into()),
            },
        );
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    /// Make an operation fail: `create`, `destroy`, `template`,
    /// `description`, `firewall`, or any option key passed to configure
    pub fn fail_operation(&self, op: &str) {
        self.state.lock().fail_ops.insert(op.to_string());
    }

    pub fn exists(&self, vmid: Vmid) -> bool {
        let state = self.state.lock();
        state.entities.contains_key(&vmid)
            || state.foreign.contains_key(&vmid)
            || state.hidden.contains(&vmid)
    }

    pub fn is_template(&self, vmid: Vmid) -> bool {
        self.state
            .lock()
            .entities
            .get(&vmid)
            .map(|e| e.template)
            .unwrap_or(false)
    }

    pub fn description(&self, vmid: Vmid) -> Option<String> {
        self.state
            .lock()
            .entities
            .get(&vmid)
            .and_then(|e| e.description.clone())
    }

    /// Mutating calls in order, e.g. `create 9000`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn query(&self, operation: &str) -> Result<parking_lot::MutexGuard<'_, HypervisorState>> {
        let state = self.state.lock();
        if state.fail_queries {
            return Err(Error::RemoteQuery {
                operation: operation.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(state)
    }

    fn mutate(
        &self,
        operation: &str,
        vmid: Vmid,
        keys: &[&str],
    ) -> Result<parking_lot::MutexGuard<'_, HypervisorState>> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", operation, vmid));
        if state.fail_ops.contains(operation) || keys.iter().any(|k| state.fail_ops.contains(*k)) {
            return Err(remote_error(operation, vmid, RemoteFailureKind::Other, "injected failure"));
        }
        Ok(state)
    }
}

fn remote_error(operation: &str, vmid: Vmid, kind: RemoteFailureKind, reason: &str) -> Error {
    Error::RemoteOperation {
        operation: operation.to_string(),
        vmid,
        kind,
        reason: reason.to_string(),
    }
}

fn missing(operation: &str, vmid: Vmid) -> Error {
    remote_error(
        operation,
        vmid,
        RemoteFailureKind::NotFound,
        &format!("Configuration file 'nodes/pve/qemu-server/{}.conf' does not exist", vmid),
    )
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    fn node(&self) -> &str {
        &self.node
    }

    async fn list_entities(&self) -> Result<Vec<RemoteEntity>> {
        let state = self.query("list entities")?;
        let mut out: Vec<RemoteEntity> = state
            .entities
            .iter()
            .map(|(vmid, e)| RemoteEntity {
                name: e.name.clone(),
                vmid: *vmid,
                template: e.template,
            })
            .collect();
        out.extend(state.foreign.iter().map(|(vmid, name)| RemoteEntity {
            name: name.clone(),
            vmid: *vmid,
            template: false,
        }));
        Ok(out)
    }

    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>> {
        let state = self.query("cluster resources")?;
        let own = state.entities.iter().map(|(vmid, e)| ClusterResource {
            vmid: *vmid,
            name: Some(e.name.clone()),
            node: Some(self.node.clone()),
        });
        let foreign = state.foreign.iter().map(|(vmid, name)| ClusterResource {
            vmid: *vmid,
            name: Some(name.clone()),
            node: Some("elsewhere".into()),
        });
        Ok(own.chain(foreign).collect())
    }

    async fn list_storages(&self) -> Result<Vec<StorageInfo>> {
        let state = self.query("list storages")?;
        Ok(state.storages.clone())
    }

    async fn storage_content(&self, storage: &str) -> Result<Vec<StorageVolume>> {
        let state = self.query("storage content")?;
        Ok(state.volumes.get(storage).cloned().unwrap_or_default())
    }

    async fn create(&self, vmid: Vmid, options: &VmOptions) -> Result<()> {
        let keys: Vec<&str> = options.iter().map(|(k, _)| k.as_str()).collect();
        let mut state = self.mutate("create", vmid, &keys)?;
        if state.entities.contains_key(&vmid)
            || state.foreign.contains_key(&vmid)
            || state.hidden.contains(&vmid)
        {
            return Err(remote_error(
                "create",
                vmid,
                RemoteFailureKind::AlreadyExists,
                &format!("unable to create VM {}: config file already exists", vmid),
            ));
        }

        let config: BTreeMap<String, String> = options.iter().cloned().collect();
        let name = config.get("name").cloned().unwrap_or_default();
        state.entities.insert(
            vmid,
            FakeEntity {
                name,
                template: false,
                config,
                description: None,
                firewall: FirewallOptions::default(),
            },
        );
        Ok(())
    }

    async fn configure(&self, vmid: Vmid, options: &VmOptions) -> Result<()> {
        let keys: Vec<&str> = options.iter().map(|(k, _)| k.as_str()).collect();
        let mut state = self.mutate("configure", vmid, &keys)?;
        let entity = state
            .entities
            .get_mut(&vmid)
            .ok_or_else(|| missing("configure", vmid))?;
        entity.config.extend(options.iter().cloned());
        Ok(())
    }

    async fn config(&self, vmid: Vmid) -> Result<BTreeMap<String, String>> {
        let state = self.state.lock();
        state
            .entities
            .get(&vmid)
            .map(|e| e.config.clone())
            .ok_or_else(|| missing("config", vmid))
    }

    async fn set_description(&self, vmid: Vmid, description: &str) -> Result<()> {
        let mut state = self.mutate("description", vmid, &[])?;
        let entity = state
            .entities
            .get_mut(&vmid)
            .ok_or_else(|| missing("description", vmid))?;
        entity.description = Some(description.to_string());
        Ok(())
    }

    async fn destroy(&self, vmid: Vmid) -> Result<()> {
        let mut state = self.mutate("destroy", vmid, &[])?;
        state
            .entities
            .remove(&vmid)
            .ok_or_else(|| missing("destroy", vmid))?;
        for volumes in state.volumes.values_mut() {
            volumes.retain(|v| v.vmid != Some(vmid));
        }
        Ok(())
    }

    async fn mark_template(&self, vmid: Vmid) -> Result<()> {
        let mut state = self.mutate("template", vmid, &[])?;
        let entity = state
            .entities
            .get_mut(&vmid)
            .ok_or_else(|| missing("template", vmid))?;
        entity.template = true;
        Ok(())
    }

    async fn firewall_options(&self, vmid: Vmid) -> Result<FirewallOptions> {
        let state = self.state.lock();
        state
            .entities
            .get(&vmid)
            .map(|e| e.firewall.clone())
            .ok_or_else(|| missing("firewall", vmid))
    }

    async fn set_firewall_options(&self, vmid: Vmid, options: &FirewallOptions) -> Result<()> {
        let mut state = self.mutate("firewall", vmid, &[])?;
        let entity = state
            .entities
            .get_mut(&vmid)
            .ok_or_else(|| missing("firewall", vmid))?;
        entity.firewall = options.clone();
        Ok(())
    }
}

// =============================================================================
// Fetcher
// =============================================================================

#[derive(Debug, Default)]
struct FetcherState {
    fetches: usize,
    fail_status: Option<u16>,
}

/// Fetcher that writes a fixed payload
#[derive(Debug, Default)]
pub struct FakeFetcher {
    state: Mutex<FetcherState>,
}

impl FakeFetcher {
    pub const PAYLOAD: &'static [u8] = b"fresh source image";

    pub fn fail_with_status(&self, status: u16) {
        self.state.lock().fail_status = Some(status);
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().fetches
    }
}

#[async_trait]
impl ByteFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path, _timeout: Duration) -> Result<u64> {
        let fail = {
            let mut state = self.state.lock();
            state.fetches += 1;
            state.fail_status
        };
        if let Some(status) = fail {
            return Err(Error::Fetch {
                source_ref: url.to_string(),
                reason: format!("HTTP status {}", status),
            });
        }
        tokio::fs::write(dest, Self::PAYLOAD).await?;
        Ok(Self::PAYLOAD.len() as u64)
    }

    async fn fetch_local(&self, source: &Path, dest: &Path) -> Result<u64> {
        self.state.lock().fetches += 1;
        if !source.is_file() {
            return Err(Error::SourceNotFound {
                path: source.display().to_string(),
            });
        }
        Ok(tokio::fs::copy(source, dest).await?)
    }
}

// =============================================================================
// Disk Tools
// =============================================================================

#[derive(Debug, Default)]
struct CustomizerState {
    runs: usize,
    outcome: Option<CustomizeStatus>,
    last_ops: Vec<CustomizeOp>,
}

/// Customizer that records its operations
#[derive(Debug, Default)]
pub struct FakeCustomizer {
    state: Mutex<CustomizerState>,
}

impl FakeCustomizer {
    pub fn time_out(&self) {
        self.state.lock().outcome = Some(CustomizeStatus::TimedOut);
    }

    pub fn exit_with(&self, code: i32, diagnostics: &str) {
        self.state.lock().outcome = Some(CustomizeStatus::Exited {
            code: Some(code),
            diagnostics: diagnostics.to_string(),
        });
    }

    pub fn runs(&self) -> usize {
        self.state.lock().runs
    }

    pub fn last_ops(&self) -> Vec<CustomizeOp> {
        self.state.lock().last_ops.clone()
    }
}

#[async_trait]
impl DiskCustomizer for FakeCustomizer {
    async fn customize(
        &self,
        image: &Path,
        ops: &[CustomizeOp],
        _timeout: Duration,
    ) -> Result<CustomizeStatus> {
        if !image.is_file() {
            return Err(Error::Tool {
                tool: "fake-customizer".into(),
                reason: format!("{} missing", image.display()),
            });
        }
        let mut state = self.state.lock();
        state.runs += 1;
        state.last_ops = ops.to_vec();
        Ok(state.outcome.clone().unwrap_or(CustomizeStatus::Exited {
            code: Some(0),
            diagnostics: String::new(),
        }))
    }
}

#[derive(Debug)]
struct ResizerState {
    size: u64,
    grown: Vec<u64>,
}

/// Resizer with a settable virtual size
#[derive(Debug)]
pub struct FakeResizer {
    state: Mutex<ResizerState>,
}

impl Default for FakeResizer {
    fn default() -> Self {
        Self {
            state: Mutex::new(ResizerState {
                size: 2 * 1024 * 1024 * 1024,
                grown: Vec::new(),
            }),
        }
    }
}

impl FakeResizer {
    pub fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    pub fn grown_to(&self) -> Vec<u64> {
        self.state.lock().grown.clone()
    }
}

#[async_trait]
impl DiskResizer for FakeResizer {
    async fn virtual_size(&self, _image: &Path) -> Result<u64> {
        Ok(self.state.lock().size)
    }

    async fn grow(&self, _image: &Path, target_bytes: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.grown.push(target_bytes);
        state.size = target_bytes;
        Ok(())
    }
}
