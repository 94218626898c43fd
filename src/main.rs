use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use ffu_builder::collaborators::{CommandCollaborators, HttpFetcher};
use ffu_builder::config::{loader, BuildConfiguration};
use ffu_builder::log_collector::{LogRecord, ProgressTail};
use ffu_builder::system::ToolRunner;
use ffu_builder::{
    cancel_pair, ArtifactCache, Collaborators, LogCollector, Orchestrator, ProcessRegistry, ProgressChannel,
    ProgressEvent, RecoveryController, RetentionPolicy,
};

#[derive(Parser)]
#[command(name = "ffu-builder", version, about = "Cached, cancellable OS image build pipeline")]
struct Cli {
    /// Config file (.toml or .json); defaults to ~/.config/ffu-builder/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override a config value, e.g. --set vm.memory_mb=4096 (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full build pipeline
    Build,
    /// Clean up after an interrupted run
    Sweep,
    /// Inspect or prune the base image cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the progress file
    Tail {
        /// Keep following the file until interrupted
        #[arg(short, long)]
        follow: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    List,
    Prune {
        /// Keep at most this many newest entries
        #[arg(long)]
        keep: Option<usize>,
        /// Remove entries older than this many days
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match loader::resolve(cli.config.as_deref(), &cli.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[Main] Configuration error: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("[Main] ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: BuildConfiguration) -> anyhow::Result<u8> {
    if let Command::Tail { follow } = cli.command {
        tail(&config.paths.log_file(), follow).await?;
        return Ok(0);
    }

    // Console mirror of the progress file
    let (ui_tx, mut ui_rx) = mpsc::channel::<ProgressEvent>(1024);
    let collector = LogCollector::new(config.paths.log_file(), Some(ui_tx))
        .with_context(|| format!("Failed to open progress file {}", config.paths.log_file().display()))?;
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if let Err(e) = collector.init_global_logger(level) {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    let printer = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            match event {
                ProgressEvent::Progress { percent, message } => eprintln!("[{:>3}%] {}", percent, message),
                ProgressEvent::Log(message) => eprintln!("       {}", message),
                ProgressEvent::ItemStatus { id, status } => eprintln!("       {} -> {}", id, status),
            }
        }
    });

    let code = match cli.command {
        Command::Build => build(config, Arc::new(collector.clone())).await,
        Command::Sweep => {
            sweep(&config, Arc::new(collector.clone())).await;
            0
        }
        Command::Cache { action } => cache(&config, action)?,
        Command::Tail { .. } => 0,
    };

    if let Err(e) = collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Failed to wait for log collector to empty: {}", e);
    }
    drop(collector);
    printer.abort();
    Ok(code)
}

struct Runtime {
    collaborators: Collaborators,
    controller: RecoveryController,
    registry: ProcessRegistry,
    cancel: ffu_builder::CancelSignal,
}

fn runtime(config: &BuildConfiguration, progress: Arc<dyn ProgressChannel>) -> Runtime {
    let registry = ProcessRegistry::default();
    let (trigger, cancel) = cancel_pair();

    let runner = ToolRunner::new(progress.clone(), registry.clone(), cancel.clone());
    let update_sources = config
        .updates
        .packages
        .iter()
        .filter_map(|p| p.source.clone().map(|source| (p.file.clone(), source)));
    let collaborators = CommandCollaborators::from_config(config, runner).into_bundle(
        Arc::new(HttpFetcher::from_entries(&config.drivers).with_cancel(cancel.clone())),
        Arc::new(HttpFetcher::from_entries(&config.apps).with_cancel(cancel.clone())),
        Arc::new(HttpFetcher::new(update_sources).with_cancel(cancel.clone())),
    );

    let controller =
        RecoveryController::for_config(config, progress, registry.clone(), trigger, collaborators.vm.clone());
    Runtime {
        collaborators,
        controller,
        registry,
        cancel,
    }
}

async fn build(config: BuildConfiguration, progress: Arc<dyn ProgressChannel>) -> u8 {
    let Runtime {
        collaborators,
        controller,
        registry,
        cancel,
    } = runtime(&config, progress.clone());

    controller.sweep_stale_run(&config.paths.marker_file()).await;

    let orchestrator = Orchestrator::new(Arc::new(config), collaborators, progress, registry, cancel);
    let mut handle = tokio::spawn(async move { orchestrator.run().await });

    let finished = tokio::select! {
        joined = &mut handle => Some(joined.ok()),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            eprintln!("[Main] Interrupted, cancelling build...");
            controller.cancel(handle).await
        }
    };

    match result {
        Some(Ok(artifact)) => {
            eprintln!("[Main] Build complete: {}", artifact.display());
            0
        }
        Some(Err(e)) => {
            eprintln!("[Main] {}", e);
            e.exit_code() as u8
        }
        None => {
            eprintln!("[Main] Build task ended abnormally");
            1
        }
    }
}

async fn sweep(config: &BuildConfiguration, progress: Arc<dyn ProgressChannel>) {
    let runtime = runtime(config, progress);
    if !runtime.controller.sweep_stale_run(&config.paths.marker_file()).await {
        eprintln!("[Main] No interrupted run found");
    }
}

fn cache(config: &BuildConfiguration, action: CacheAction) -> anyhow::Result<u8> {
    let cache = ArtifactCache::new(config.paths.cache_dir());
    match action {
        CacheAction::List => {
            let entries = cache.entries();
            if entries.is_empty() {
                println!("Cache at {} is empty", cache.root().display());
            }
            for manifest in entries {
                println!(
                    "{}  {}  {}",
                    manifest.created_at.format("%Y-%m-%d %H:%M"),
                    manifest.artifact_file_name,
                    manifest.fingerprint
                );
            }
        }
        CacheAction::Prune { keep, max_age_days } => {
            let policy = RetentionPolicy {
                keep_latest: keep.or(config.cache.retain_latest),
                max_age_days,
            };
            let removed = cache.prune(policy).context("Failed to prune cache")?;
            println!("Removed {} cache entr{}", removed.len(), if removed.len() == 1 { "y" } else { "ies" });
        }
    }
    Ok(0)
}

async fn tail(path: &std::path::Path, follow: bool) -> anyhow::Result<()> {
    let mut tail = ProgressTail::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    loop {
        for record in tail.poll()? {
            match record {
                LogRecord::Progress { percent, message } => println!("[{:>3}%] {}", percent, message),
                LogRecord::Text(text) => println!("{}", text),
            }
        }
        if !follow {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = tokio::signal::ctrl_c() => {
                tail.close();
                return Ok(());
            }
        }
    }
}
