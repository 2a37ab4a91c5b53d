//! cloudbuilder
//!
//! Builds customized VM templates from cloud images and reconciles them with
//! the templates published on a Proxmox VE node.
//!
//! One invocation is one reconciliation run: load the catalog, sync the
//! metadata sidecar with the hypervisor, then build and publish whatever is
//! missing or out of date.

use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloudbuilder::build::{BuildConfig, BuildPipeline, Workspace};
use cloudbuilder::cache::ImageCache;
use cloudbuilder::catalog;
use cloudbuilder::engine::{status_table, EngineConfig, Reconciler, RunContext, RunMode, Selection};
use cloudbuilder::platform::{HttpFetcher, HttpFetcherConfig, PveCli, PveConfig, QemuImg, VirtCustomize};
use cloudbuilder::remote::{
    select_storage, HardeningPolicy, IdentifierAllocator, PublishConfig, RemoteInventory,
    RetryConfig,
};
use cloudbuilder::{Error, HypervisorApiRef, Result};

/// Exit status after SIGINT / SIGTERM
const EXIT_INTERRUPTED: i32 = 130;

// =============================================================================
// CLI Arguments
// =============================================================================

/// cloudbuilder - build cloud-image VM templates and publish them to Proxmox VE
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Template catalog (JSON or YAML)
    #[arg(short, long, env = "CLOUDBUILDER_CONFIG", default_value = "templates.json")]
    config: PathBuf,

    /// Image cache and metadata directory
    #[arg(long, env = "CLOUDBUILDER_TEMPLATE_DIR", default_value = "/var/lib/cloudbuilder/templates")]
    template_dir: PathBuf,

    /// Root for scratch directories
    #[arg(long, env = "CLOUDBUILDER_TEMP_DIR", default_value = "/var/lib/cloudbuilder/tmp")]
    temp_dir: PathBuf,

    /// Storage to import disks into (auto-selected when omitted)
    #[arg(long, env = "CLOUDBUILDER_STORAGE")]
    storage: Option<String>,

    /// Proxmox node name (detected from the hostname when omitted)
    #[arg(long, env = "CLOUDBUILDER_NODE")]
    node: Option<String>,

    /// Lowest identifier handed out to new templates
    #[arg(long, env = "CLOUDBUILDER_MIN_VMID", default_value = "9000")]
    min_vmid: u32,

    /// Update cached images in place and republish
    #[arg(long, conflicts_with = "rebuild")]
    update: bool,

    /// Rebuild every template from its source image and republish
    #[arg(long)]
    rebuild: bool,

    /// Build the local cache only; never modify the hypervisor
    #[arg(long, env = "CLOUDBUILDER_BUILD_ONLY")]
    build_only: bool,

    /// Print the status table and exit
    #[arg(long, conflicts_with_all = ["update", "rebuild", "build_only"])]
    status: bool,

    /// Comma-separated templates to process
    #[arg(long)]
    only: Option<String>,

    /// Comma-separated templates to skip
    #[arg(long)]
    except: Option<String>,

    /// Download timeout in seconds
    #[arg(long, env = "CLOUDBUILDER_DOWNLOAD_TIMEOUT", default_value = "600")]
    download_timeout: u64,

    /// Customization timeout in seconds
    #[arg(long, env = "CLOUDBUILDER_CUSTOMIZE_TIMEOUT", default_value = "600")]
    customize_timeout: u64,

    /// Bridge for the template NIC
    #[arg(long, env = "CLOUDBUILDER_BRIDGE", default_value = "vmbr0")]
    bridge: String,

    /// Template memory in MiB
    #[arg(long, env = "CLOUDBUILDER_MEMORY", default_value = "1024")]
    memory: u32,

    /// Template CPU cores
    #[arg(long, env = "CLOUDBUILDER_CORES", default_value = "1")]
    cores: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CLOUDBUILDER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "CLOUDBUILDER_LOG_JSON")]
    log_json: bool,

    /// Also append logs to this file
    #[arg(long, env = "CLOUDBUILDER_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn mode(&self) -> RunMode {
        if self.rebuild {
            RunMode::Rebuild
        } else if self.update {
            RunMode::Update
        } else {
            RunMode::Default
        }
    }

    fn selection(&self) -> Selection {
        Selection {
            only: self.only.as_deref().map(Selection::parse_list).unwrap_or_default(),
            except: self.except.as_deref().map(Selection::parse_list).unwrap_or_default(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("cloudbuilder: {}", e);
        std::process::exit(1);
    }

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let mode = args.mode();
    info!("Starting cloudbuilder {}", cloudbuilder::VERSION);
    info!("  Catalog: {}", args.config.display());
    info!("  Template dir: {}", args.template_dir.display());
    info!("  Mode: {:?}", mode);

    let catalog = catalog::load(&args.config).await?;

    let cache = ImageCache::new(&args.template_dir);
    cache.init().await?;
    cache.clean_partials()?;
    Workspace::sweep_stale(&args.temp_dir)?;

    let pve = PveCli::detect(PveConfig::default(), args.node.clone()).await?;
    let api: HypervisorApiRef = Arc::new(pve);

    let storage = match select_storage(&api, args.storage.as_deref()).await {
        Ok(storage) => storage,
        // Nothing is imported in these modes
        Err(e) if args.build_only || args.status => {
            warn!(error = %e, "Storage selection failed");
            args.storage.clone().unwrap_or_else(|| PublishConfig::default().storage)
        }
        Err(e) => return Err(e),
    };
    info!("  Storage: {}", storage);

    let allocator = Arc::new(IdentifierAllocator::new(api.clone(), args.min_vmid));
    info!("  Identifier floor: {}", allocator.floor());
    let inventory = RemoteInventory::new(
        api,
        allocator,
        PublishConfig {
            storage,
            bridge: args.bridge.clone(),
            memory_mib: args.memory,
            cores: args.cores,
            hardening: HardeningPolicy::default(),
        },
        RetryConfig::default(),
    );

    let pipeline = BuildPipeline::new(
        BuildConfig {
            download_timeout: Duration::from_secs(args.download_timeout),
            customize_timeout: Duration::from_secs(args.customize_timeout),
            base_dir: catalog_dir(&args.config),
        },
        cache,
        Arc::new(HttpFetcher::new(HttpFetcherConfig::default())?),
        Arc::new(VirtCustomize::default()),
        Arc::new(QemuImg::default()),
    );

    let reconciler = Reconciler::new(
        EngineConfig {
            template_dir: args.template_dir.clone(),
            temp_dir: args.temp_dir.clone(),
            selection: args.selection(),
        },
        pipeline,
        inventory,
    );

    if args.status {
        let rows = reconciler.status(&catalog, mode).await?;
        println!("{}", status_table(&rows));
        return Ok(0);
    }

    let mut ctx = RunContext::new(mode, args.build_only);
    let result = tokio::select! {
        result = reconciler.run(&catalog, &mut ctx) => result,
        _ = shutdown_signal() => {
            warn!("Interrupted, cleaning up scratch files");
            return Ok(EXIT_INTERRUPTED);
        }
    };

    report(&ctx, result.as_ref().err());
    Ok(ctx.exit_code(result.is_err()))
}

fn catalog_dir(config: &Path) -> PathBuf {
    match config.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn report(ctx: &RunContext, aborted: Option<&Error>) {
    for (name, phase, message) in ctx.failures() {
        error!(template = %name, phase = %phase, "{}", message);
    }
    if let Some(e) = aborted {
        error!("Run aborted: {}", e);
    }
    info!("Summary: {}", ctx.summary());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    let file = match &args.log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Configuration(format!("cannot open log file {}: {}", path.display(), e))
                })?,
        ),
        None => None,
    };

    // The file copy is always plain text
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .with(file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f))))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .with(file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f))))
            .init();
    }
    Ok(())
}
