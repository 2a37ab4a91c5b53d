//! Reconciliation Engine
//!
//! Drives one invocation: sync the metadata sidecar with the hypervisor,
//! classify every selected template, enforce the linked-clone veto for
//! every overwrite, then build and publish templates one at a time.
//!
//! Per-template failures are recorded in the [`RunContext`] and the run
//! moves on; errors whose [`ErrorScope`] is `Run` abort everything.

use super::context::{Outcome, Phase, RunContext, StatusRow};
use super::plan::{classify, Action, RunMode};
use super::sync::sync_records;
use crate::build::{BuildPipeline, Workspace};
use crate::catalog::{Catalog, TemplateSpec};
use crate::domain::Vmid;
use crate::error::{Error, ErrorScope, Result};
use crate::metadata::{MetadataStore, Records};
use crate::remote::RemoteInventory;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// Configuration
// =============================================================================

/// Which catalog templates a run touches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Restrict the run to these names; empty means all
    pub only: Vec<String>,
    pub except: Vec<String>,
}

impl Selection {
    /// Split a comma-separated list, trimming and dropping empties
    pub fn parse_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn includes(&self, name: &str) -> bool {
        (self.only.is_empty() || self.only.iter().any(|n| n == name))
            && !self.except.iter().any(|n| n == name)
    }

    /// Reject names that are not in the catalog
    pub fn validate(&self, available: &[&str]) -> Result<()> {
        let unknown: Vec<&str> = self
            .only
            .iter()
            .chain(self.except.iter())
            .map(String::as_str)
            .filter(|n| !available.contains(n))
            .collect();

        if unknown.is_empty() {
            return Ok(());
        }
        Err(Error::Configuration(format!(
            "unknown template(s): {}; available: {}",
            unknown.join(", "),
            available.join(", ")
        )))
    }
}

/// Configuration for the reconciliation engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Image cache and metadata sidecar live here
    pub template_dir: PathBuf,
    /// Root for per-run scratch directories
    pub temp_dir: PathBuf,
    pub selection: Selection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("/var/lib/cloudbuilder/templates"),
            temp_dir: PathBuf::from("/var/lib/cloudbuilder/tmp"),
            selection: Selection::default(),
        }
    }
}

// =============================================================================
// Failures
// =============================================================================

/// A per-template error tagged with the phase it happened in
#[derive(Debug)]
struct Failure {
    phase: Phase,
    error: Error,
}

trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> std::result::Result<T, Failure>;
}

impl<T> InPhase<T> for Result<T> {
    fn in_phase(self, phase: Phase) -> std::result::Result<T, Failure> {
        self.map_err(|error| Failure { phase, error })
    }
}

/// Synced state the engine plans against
struct Prepared<'a> {
    records: Records,
    remote: BTreeMap<String, Vmid>,
    plans: Vec<(&'a TemplateSpec, Action)>,
}

// =============================================================================
// Engine
// =============================================================================

/// Reconciles the catalog, the local cache, and the hypervisor
pub struct Reconciler {
    config: EngineConfig,
    store: MetadataStore,
    pipeline: BuildPipeline,
    inventory: RemoteInventory,
}

impl Reconciler {
    pub fn new(config: EngineConfig, pipeline: BuildPipeline, inventory: RemoteInventory) -> Self {
        let store = MetadataStore::new(&config.template_dir);
        Self {
            config,
            store,
            pipeline,
            inventory,
        }
    }

    /// Run one full reconciliation over `catalog`
    pub async fn run(&self, catalog: &Catalog, ctx: &mut RunContext) -> Result<()> {
        info!(
            mode = ?ctx.mode,
            build_only = ctx.build_only,
            "Starting reconciliation"
        );

        let Prepared {
            mut records,
            remote,
            plans,
        } = self.prepare(catalog, ctx.mode).await?;

        for (name, e) in &catalog.rejected {
            if self.config.selection.includes(name) {
                ctx.fail(name, None, Phase::Resolve, e.to_string());
            }
        }

        if !ctx.build_only {
            self.check_linked_dependents(&plans, &remote).await?;
        }

        let workspace = Workspace::create(&self.config.temp_dir)?;

        for (spec, action) in plans {
            let span = info_span!("template", name = %spec.name);
            let result = self
                .process(spec, action, &mut records, &workspace, ctx.build_only)
                .instrument(span)
                .await;

            match result {
                Ok(outcome) => ctx.record(&spec.name, Some(action), outcome),
                Err(Failure { phase, error }) if error.scope() == ErrorScope::Template => {
                    error!(
                        template = %spec.name,
                        phase = %phase,
                        error = %error,
                        "Template failed"
                    );
                    ctx.fail(&spec.name, Some(action), phase, error.to_string());
                }
                Err(Failure { phase, error }) => {
                    error!(template = %spec.name, phase = %phase, error = %error, "Aborting run");
                    return Err(error);
                }
            }
        }

        info!(
            "Reconciliation finished in {:.1}s: {}",
            ctx.elapsed().as_secs_f64(),
            ctx.summary()
        );
        Ok(())
    }

    /// Sync metadata and compute the planned action for every template.
    /// Performs no mutation besides saving the synced sidecar.
    pub async fn status(&self, catalog: &Catalog, mode: RunMode) -> Result<Vec<StatusRow>> {
        let prepared = self.prepare(catalog, mode).await?;

        let mut rows = Vec::with_capacity(prepared.plans.len());
        for (spec, action) in &prepared.plans {
            rows.push(StatusRow {
                name: spec.name.clone(),
                cached: self.pipeline.cache().contains(&spec.name).await,
                record: prepared.records.get(&spec.name).cloned().unwrap_or_default(),
                remote_vmid: prepared.remote.get(&spec.name).copied(),
                planned: *action,
            });
        }
        Ok(rows)
    }

    async fn prepare<'a>(&self, catalog: &'a Catalog, mode: RunMode) -> Result<Prepared<'a>> {
        let mut available = catalog.names();
        available.extend(catalog.rejected.iter().map(|(n, _)| n.as_str()));
        self.config.selection.validate(&available)?;

        let selected: Vec<&TemplateSpec> = catalog
            .templates
            .iter()
            .filter(|t| self.config.selection.includes(&t.name))
            .collect();
        debug!(selected = selected.len(), total = catalog.templates.len(), "Selected templates");

        let mut records = self.store.load().await;
        for spec in &catalog.templates {
            records.entry(spec.name.clone()).or_default();
        }

        let remote = self.inventory.list_templates().await;
        let (records, repairs) = sync_records(&records, &remote);
        for repair in &repairs {
            info!("Repaired metadata: {}", repair);
        }
        self.store.save(&records).await?;

        let mut plans = Vec::with_capacity(selected.len());
        for spec in selected {
            let built = records.get(&spec.name).map(|r| r.is_built()).unwrap_or(false);
            let local = built && self.pipeline.cache().contains(&spec.name).await;
            let action = classify(local, remote.contains_key(&spec.name), mode);
            debug!(template = %spec.name, local, action = %action, "Planned");
            plans.push((spec, action));
        }

        Ok(Prepared {
            records,
            remote,
            plans,
        })
    }

    /// Abort before touching anything if an overwrite target has linked clones
    async fn check_linked_dependents(
        &self,
        plans: &[(&TemplateSpec, Action)],
        remote: &BTreeMap<String, Vmid>,
    ) -> Result<()> {
        let mut vetoed = Vec::new();

        for (spec, action) in plans.iter().filter(|(_, a)| a.is_overwrite()) {
            let Some(&vmid) = remote.get(&spec.name) else {
                continue;
            };
            if self.inventory.has_linked_dependents(vmid).await? {
                error!(
                    template = %spec.name,
                    vmid,
                    action = %action,
                    "Template has linked clones and cannot be replaced"
                );
                vetoed.push(spec.name.clone());
            }
        }

        if vetoed.is_empty() {
            Ok(())
        } else {
            Err(Error::LinkedDependentVeto { templates: vetoed })
        }
    }

    async fn process(
        &self,
        spec: &TemplateSpec,
        action: Action,
        records: &mut Records,
        workspace: &Workspace,
        build_only: bool,
    ) -> std::result::Result<Outcome, Failure> {
        let mut record = records.get(&spec.name).cloned().unwrap_or_default();
        info!(action = %action, "Processing template {}", spec.name);

        let (mode, overwrite) = match action {
            Action::Keep => {
                if !build_only {
                    if let Some(vmid) = record.vmid {
                        if let Err(e) = self.inventory.ensure_hardening(vmid).await {
                            warn!(vmid, error = %e, "Cannot verify hardening");
                        }
                    }
                }
                return Ok(Outcome::Unchanged);
            }
            Action::PublishCached if build_only => {
                debug!("Cached image present, nothing to build");
                return Ok(Outcome::Unchanged);
            }
            Action::PublishCached => {
                let image = self.pipeline.cache().path_for(&spec.name);
                let vmid = self
                    .inventory
                    .publish(spec, &record, &image, record.vmid)
                    .await
                    .in_phase(Phase::Publish)?;
                record.vmid = Some(vmid);
                records.insert(spec.name.clone(), record);
                self.store.save(records).await.in_phase(Phase::Persist)?;
                return Ok(Outcome::Published { vmid });
            }
            Action::Build { mode, overwrite } => (mode, overwrite),
        };

        let scratch = workspace.scratch(&spec.name).in_phase(Phase::Build)?;
        let image = self
            .pipeline
            .build(spec, &mut record, mode, &scratch)
            .await
            .in_phase(Phase::Build)?;
        records.insert(spec.name.clone(), record.clone());
        self.store.save(records).await.in_phase(Phase::Persist)?;

        if build_only {
            info!("Build-only run, not publishing {}", spec.name);
            return Ok(Outcome::Built);
        }

        if overwrite {
            if let Some(vmid) = record.vmid {
                // Clones may have appeared while building
                if self
                    .inventory
                    .has_linked_dependents(vmid)
                    .await
                    .in_phase(Phase::Remove)?
                {
                    return Err(Failure {
                        phase: Phase::Remove,
                        error: Error::LinkedDependentVeto {
                            templates: vec![spec.name.clone()],
                        },
                    });
                }
            }
            self.inventory
                .remove(&spec.name, &record)
                .await
                .in_phase(Phase::Remove)?;
        }

        let vmid = self
            .inventory
            .publish(spec, &record, &image, record.vmid)
            .await
            .in_phase(Phase::Publish)?;
        record.vmid = Some(vmid);
        records.insert(spec.name.clone(), record);
        self.store.save(records).await.in_phase(Phase::Persist)?;

        Ok(Outcome::Published { vmid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildConfig, BuildMode};
    use crate::cache::ImageCache;
    use crate::catalog::{parse_document, resolve_document};
    use crate::domain::{HypervisorApi, HypervisorApiRef, Vmid};
    use crate::metadata::{now, TemplateRecord};
    use crate::remote::{IdentifierAllocator, PublishConfig, RetryConfig, MAX_VMID};
    use crate::testing::{FakeCustomizer, FakeFetcher, FakeHypervisor, FakeResizer};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tempfile::TempDir;

    const CATALOG: &str = r#"{
        "web": {
            "image_url": "https://images.example.org/debian-12.qcow2",
            "install_packages": ["nginx"]
        },
        "db": {
            "image_url": "https://images.example.org/debian-12.qcow2",
            "install_packages": ["postgresql"]
        }
    }"#;

    struct Fixture {
        dir: TempDir,
        hypervisor: Arc<FakeHypervisor>,
        fetcher: Arc<FakeFetcher>,
        customizer: Arc<FakeCustomizer>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("templates")).unwrap();
            Self {
                dir,
                hypervisor: Arc::new(FakeHypervisor::new("pve1")),
                fetcher: Arc::new(FakeFetcher::default()),
                customizer: Arc::new(FakeCustomizer::default()),
            }
        }

        fn template_dir(&self) -> PathBuf {
            self.dir.path().join("templates")
        }

        fn cache(&self) -> ImageCache {
            ImageCache::new(self.template_dir())
        }

        fn store(&self) -> MetadataStore {
            MetadataStore::new(self.template_dir())
        }

        fn reconciler(&self, selection: Selection) -> Reconciler {
            self.reconciler_with_floor(selection, 9000)
        }

        fn reconciler_with_floor(&self, selection: Selection, floor: Vmid) -> Reconciler {
            let api: HypervisorApiRef = self.hypervisor.clone();
            let allocator = Arc::new(IdentifierAllocator::new(api.clone(), floor));
            let inventory = RemoteInventory::new(
                api,
                allocator,
                PublishConfig {
                    storage: "local-zfs".into(),
                    ..Default::default()
                },
                RetryConfig::none(),
            );
            let pipeline = BuildPipeline::new(
                BuildConfig {
                    base_dir: self.dir.path().to_path_buf(),
                    ..Default::default()
                },
                self.cache(),
                self.fetcher.clone(),
                self.customizer.clone(),
                Arc::new(FakeResizer::default()),
            );
            Reconciler::new(
                EngineConfig {
                    template_dir: self.template_dir(),
                    temp_dir: self.dir.path().join("tmp"),
                    selection,
                },
                pipeline,
                inventory,
            )
        }

        /// A built, cached image for `name`
        async fn seed_cached(&self, name: &str, record: TemplateRecord) {
            std::fs::write(self.cache().path_for(name), b"cached image").unwrap();
            let mut records = self.store().load().await;
            records.insert(name.to_string(), record);
            self.store().save(&records).await.unwrap();
        }
    }

    fn catalog(raw: &str) -> Catalog {
        resolve_document(&parse_document(raw, false).unwrap())
    }

    fn only(names: &str) -> Selection {
        Selection {
            only: Selection::parse_list(names),
            except: vec![],
        }
    }

    #[test]
    fn test_selection() {
        assert_eq!(Selection::parse_list(" web, ,db,"), vec!["web", "db"]);

        let sel = Selection {
            only: vec![],
            except: vec!["db".into()],
        };
        assert!(sel.includes("web"));
        assert!(!sel.includes("db"));

        let err = only("web,nope").validate(&["web", "db"]).unwrap_err();
        assert_matches!(err, Error::Configuration(ref msg) if msg.contains("nope") && msg.contains("available: web, db"));
    }

    #[tokio::test]
    async fn test_new_template_is_built_and_published() {
        let fx = Fixture::new();
        fx.hypervisor.add_foreign_vm(100, "workload");
        let mut ctx = RunContext::new(RunMode::Default, false);

        fx.reconciler(only("web"))
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap();

        let records = fx.store().load().await;
        let web = &records["web"];
        assert!(web.build_date.is_some());
        assert!(web.last_update.is_none());
        assert_eq!(web.vmid, Some(9000));
        assert!(fx.hypervisor.is_template(9000));
        assert!(fx.cache().contains("web").await);

        assert_eq!(ctx.summary().succeeded, 1);
        assert_matches!(ctx.reports()[0].outcome, Outcome::Published { vmid: 9000 });
        assert_eq!(ctx.exit_code(false), 0);
    }

    #[tokio::test]
    async fn test_update_republishes_with_same_identifier() {
        let fx = Fixture::new();
        let built = now() - chrono::Duration::days(3);
        fx.hypervisor.add_template(9000, "web");
        fx.seed_cached(
            "web",
            TemplateRecord {
                build_date: Some(built),
                last_update: None,
                vmid: Some(9000),
            },
        )
        .await;

        let mut ctx = RunContext::new(RunMode::Update, false);
        fx.reconciler(only("web"))
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap();

        assert_eq!(fx.fetcher.fetches(), 0);
        let records = fx.store().load().await;
        assert_eq!(records["web"].build_date, Some(built));
        assert!(records["web"].last_update.is_some());
        assert_eq!(records["web"].vmid, Some(9000));

        let calls = fx.hypervisor.calls();
        let destroy = calls.iter().position(|c| c == "destroy 9000").unwrap();
        let create = calls.iter().position(|c| c == "create 9000").unwrap();
        assert!(destroy < create);
        assert!(fx.hypervisor.is_template(9000));
        assert_eq!(
            ctx.reports()[0].action,
            Some(Action::Build {
                mode: BuildMode::Update,
                overwrite: true
            })
        );
    }

    #[tokio::test]
    async fn test_linked_clone_vetoes_whole_run() {
        let fx = Fixture::new();
        fx.hypervisor.add_template(9000, "web");
        fx.hypervisor.add_linked_clone("local-zfs", 9000, 101);

        let mut ctx = RunContext::new(RunMode::Rebuild, false);
        let err = fx
            .reconciler(Selection::default())
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap_err();

        assert_matches!(err, Error::LinkedDependentVeto { ref templates } if templates == &vec!["web".to_string()]);
        assert!(err.is_fatal());
        assert_eq!(fx.fetcher.fetches(), 0);
        assert!(fx.hypervisor.exists(9000));
        assert!(fx.hypervisor.calls().is_empty());
        assert_eq!(ctx.exit_code(true), 1);
    }

    #[tokio::test]
    async fn test_identifier_exhaustion_aborts_run() {
        let fx = Fixture::new();
        fx.hypervisor.add_foreign_vm(MAX_VMID, "edge");

        let mut ctx = RunContext::new(RunMode::Default, false);
        let err = fx
            .reconciler_with_floor(Selection::default(), MAX_VMID)
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap_err();

        assert_matches!(err, Error::IdentifierExhausted { floor: MAX_VMID });
        // "db" comes after "web" and is never reached
        assert_eq!(fx.fetcher.fetches(), 1);
        assert!(ctx.reports().is_empty());
        assert!(!fx.hypervisor.calls().iter().any(|c| c.starts_with("create")));
        assert_eq!(ctx.exit_code(true), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_cached_image() {
        let fx = Fixture::new();
        fx.seed_cached(
            "web",
            TemplateRecord {
                build_date: Some(now()),
                ..Default::default()
            },
        )
        .await;
        fx.fetcher.fail_with_status(503);

        let mut ctx = RunContext::new(RunMode::Rebuild, false);
        fx.reconciler(only("web"))
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap();

        assert_eq!(fx.fetcher.fetches(), 1);
        assert!(!ctx.has_failures());
        assert_matches!(ctx.reports()[0].outcome, Outcome::Published { .. });
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_template() {
        let fx = Fixture::new();
        let raw = r#"{
            "-bad": { "image_url": "https://images.example.org/x.qcow2" },
            "broken": {
                "image_url": "https://images.example.org/x.qcow2",
                "copy_files": { "/nonexistent/motd": "/etc/" }
            },
            "web": { "image_url": "https://images.example.org/web.qcow2" }
        }"#;

        let mut ctx = RunContext::new(RunMode::Default, false);
        fx.reconciler(Selection::default())
            .run(&catalog(raw), &mut ctx)
            .await
            .unwrap();

        let failures: Vec<_> = ctx.failures().map(|(n, p, _)| (n, p)).collect();
        assert_eq!(
            failures,
            vec![("-bad", Phase::Resolve), ("broken", Phase::Build)]
        );
        assert_eq!(ctx.summary().succeeded, 1);
        assert!(fx.store().load().await["web"].vmid.is_some());
        assert_eq!(ctx.exit_code(false), 1);
    }

    #[tokio::test]
    async fn test_build_only_never_mutates_remote() {
        let fx = Fixture::new();
        fx.hypervisor.add_template(9000, "db");
        fx.hypervisor.add_linked_clone("local-zfs", 9000, 101);

        let mut ctx = RunContext::new(RunMode::Rebuild, true);
        fx.reconciler(Selection::default())
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap();

        assert!(fx.hypervisor.calls().is_empty());
        assert!(ctx.reports().iter().all(|r| r.outcome == Outcome::Built));
        let records = fx.store().load().await;
        assert!(records["web"].is_built());
        assert_eq!(records["db"].vmid, Some(9000));
    }

    #[tokio::test]
    async fn test_up_to_date_template_gets_hardening_repair() {
        let fx = Fixture::new();
        fx.hypervisor.add_template(9000, "web");
        fx.seed_cached(
            "web",
            TemplateRecord {
                build_date: Some(now()),
                ..Default::default()
            },
        )
        .await;

        let mut ctx = RunContext::new(RunMode::Default, false);
        fx.reconciler(only("web"))
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap();

        assert_eq!(ctx.reports()[0].outcome, Outcome::Unchanged);
        assert_eq!(fx.fetcher.fetches(), 0);
        assert!(fx.hypervisor.firewall_options(9000).await.unwrap().enable);
        assert!(fx.hypervisor.config(9000).await.unwrap()["net0"].contains("firewall=1"));
        // Sync adopted the remote identifier
        assert_eq!(fx.store().load().await["web"].vmid, Some(9000));
    }

    #[tokio::test]
    async fn test_cached_image_is_published_without_rebuild() {
        let fx = Fixture::new();
        fx.seed_cached(
            "web",
            TemplateRecord {
                build_date: Some(now()),
                last_update: None,
                vmid: Some(9300),
            },
        )
        .await;

        let mut ctx = RunContext::new(RunMode::Default, false);
        fx.reconciler(only("web"))
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap();

        assert_eq!(fx.fetcher.fetches(), 0);
        assert_eq!(fx.customizer.runs(), 0);
        // Stale identifier was cleared by sync, so a fresh one is allocated
        assert_matches!(ctx.reports()[0].outcome, Outcome::Published { vmid: 9000 });
    }

    #[tokio::test]
    async fn test_status_reports_plan_without_mutation() {
        let fx = Fixture::new();
        fx.hypervisor.add_template(9000, "db");

        let rows = fx
            .reconciler(Selection::default())
            .status(&catalog(CATALOG), RunMode::Default)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        let db = rows.iter().find(|r| r.name == "db").unwrap();
        assert_eq!(db.remote_vmid, Some(9000));
        assert!(db.planned.is_overwrite());
        assert!(fx.hypervisor.calls().is_empty());
        assert_eq!(fx.fetcher.fetches(), 0);
    }

    #[tokio::test]
    async fn test_unknown_selection_is_configuration_error() {
        let fx = Fixture::new();
        let mut ctx = RunContext::new(RunMode::Default, false);
        let err = fx
            .reconciler(only("mail"))
            .run(&catalog(CATALOG), &mut ctx)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
        assert!(ctx.reports().is_empty());
    }
}
