use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use clap::Parser;
use clipseek::{
    ComparabilityPolicy,
    EmbeddingProvider,
    Error,
    LoadMode,
    Result,
    ScanCoordinator,
    ScanOptions,
    TimeoutProvider,
    VectorStore,
    Vocabulary,
    cli::{
        Cli,
        Command,
        CorruptPolicy,
        IndexArgs,
        ModelArgs,
        PolicyArg,
        ScanArgs,
        SearchArgs,
        SnapshotArgs,
        StatusArgs,
    },
    clip::ClipProvider,
    materialize::materialize,
    search::{self, SearchParams},
    target::Query,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("CLIPSEEK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Search(args) => cmd_search(&args, cli.quiet),
        Command::Index(args) => cmd_index(&args, cli.quiet),
        Command::Status(args) => cmd_status(&args),
        Command::Completions(args) => {
            args.generate();
            Ok(())
        }
    }
}

fn cmd_search(args: &SearchArgs, quiet: bool) -> Result<()> {
    let start = Instant::now();

    // Cheap argument checks first, before the model is loaded.
    let query = Query::new(args.text.clone(), args.image.clone())?;
    if args.results == 0 {
        return Err(Error::Input("--results must be at least 1".into()));
    }
    let folder = &args.snapshot.folder;
    ensure_folder(folder)?;
    let policy = match args.policy {
        PolicyArg::Softmax => ComparabilityPolicy::softmax(args.temperature)?,
        PolicyArg::Cosine => ComparabilityPolicy::Cosine,
    };
    let vocabulary = match &args.vocabulary {
        Some(path) => Vocabulary::from_file(path)?,
        None => Vocabulary::cifar100(),
    };

    let mut store = open_store(&args.snapshot, &args.scan)?;
    let provider = load_provider(&args.model, &args.scan)?;
    let params = SearchParams {
        query,
        prefix: args.format.clone(),
        results: args.results,
        policy,
    };
    let target = search::build_target(&params, provider.as_ref(), &vocabulary)?;

    let cancel = interrupt_flag();
    let coordinator = ScanCoordinator::new(
        provider.as_ref(),
        scan_options(&args.scan, quiet || args.json),
    )
    .with_cancel(&cancel);
    let outcome =
        search::search_folder(&params, &target, folder, &coordinator, &mut store)?;

    if args.copy {
        if cancel.load(Ordering::SeqCst) {
            warn!("interrupted, not copying results");
        } else {
            let copied = materialize(
                &outcome.results,
                folder,
                &args.copy_folder,
                args.copy_remove,
            )?;
            info!(
                count = copied.len(),
                dir = %args.copy_folder.display(),
                "copied results"
            );
        }
    }

    let elapsed = start.elapsed();
    if args.json {
        search::format_json(&outcome, &params, elapsed)?;
    } else {
        search::format_human(&outcome, elapsed);
    }
    Ok(())
}

#[derive(Serialize)]
struct IndexReport<'a> {
    snapshot: &'a Path,
    space_version: &'a str,
    entries: usize,
    elapsed_secs: f64,
    #[serde(flatten)]
    scan: &'a clipseek::ScanReport,
}

fn cmd_index(args: &IndexArgs, quiet: bool) -> Result<()> {
    let start = Instant::now();
    let folder = &args.snapshot.folder;
    ensure_folder(folder)?;

    let mut store = open_store(&args.snapshot, &args.scan)?;
    let provider = load_provider(&args.model, &args.scan)?;
    let cancel = interrupt_flag();
    let coordinator = ScanCoordinator::new(
        provider.as_ref(),
        scan_options(&args.scan, quiet || args.json),
    )
    .with_cancel(&cancel);

    let outcome = coordinator.scan(folder, &mut store)?;
    let report = IndexReport {
        snapshot: store.path(),
        space_version: provider.space_version(),
        entries: store.len(),
        elapsed_secs: start.elapsed().as_secs_f64(),
        scan: &outcome.report,
    };

    if args.json {
        println!("{}", to_json(&report)?);
    } else {
        let scan = report.scan;
        println!("Snapshot: {}", report.snapshot.display());
        println!("Images: {}", scan.files);
        println!(
            "{} cached, {} embedded, {} skipped",
            scan.hits, scan.misses, scan.skipped
        );
        if scan.flush_failures > 0 {
            println!("Failed saves: {}", scan.flush_failures);
        }
        if scan.interrupted {
            println!("Interrupted before the end of the folder");
        }
        println!("Entries: {}", report.entries);
        println!("Processing time: {:.3}s", report.elapsed_secs);
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusReport<'a> {
    snapshot: &'a Path,
    exists: bool,
    entries: usize,
    versions: std::collections::BTreeMap<String, usize>,
}

fn cmd_status(args: &StatusArgs) -> Result<()> {
    let path = args.snapshot.snapshot_path();

    let exists = path.exists();

    let (entries, versions) = if exists {
        let store = VectorStore::load(&path, LoadMode::Resume)?;
        (store.len(), store.version_counts())
    } else {
        (0, Default::default())
    };
    let report = StatusReport {
        snapshot: &path,
        exists,
        entries,
        versions,
    };

    if args.json {
        println!("{}", to_json(&report)?);
    } else if !report.exists {
        println!("No feature cache at {}", path.display());
    } else {
        println!("Snapshot: {}", path.display());
        println!("Entries: {}", report.entries);
        for (version, count) in &report.versions {
            println!("  {version}: {count}");
        }
    }
    Ok(())
}

fn ensure_folder(folder: &Path) -> Result<()> {
    if !folder.is_dir() {
        return Err(Error::Input(format!(
            "folder not found: {}",
            folder.display()
        )));
    }
    Ok(())
}

/// Open the cache, falling back to an empty one when allowed.
fn open_store(snapshot: &SnapshotArgs, scan: &ScanArgs) -> Result<VectorStore> {
    let path = snapshot.snapshot_path();
    if scan.initiate {
        info!(path = %path.display(), "starting a new feature cache");
        return VectorStore::load(&path, LoadMode::Fresh);
    }

    match VectorStore::load(&path, LoadMode::Resume) {
        Err(e @ Error::StoreCorrupt { .. })
            if scan.on_corrupt == CorruptPolicy::Fresh =>
        {
            warn!(error = %e, "discarding unreadable feature cache");
            VectorStore::load(&path, LoadMode::Fresh)
        }
        other => other,
    }
}

fn load_provider(
    model: &ModelArgs,
    scan: &ScanArgs,
) -> Result<Arc<dyn EmbeddingProvider>> {
    let device = model.device.resolve()?;
    let clip: Arc<dyn EmbeddingProvider> =
        Arc::new(ClipProvider::load(&model.model, &model.revision, device)?);

    Ok(match scan.timeout_secs {
        Some(secs) => Arc::new(TimeoutProvider::new(
            clip,
            Duration::from_secs(secs),
        )),
        None => clip,
    })
}

fn scan_options(scan: &ScanArgs, silent: bool) -> ScanOptions {
    ScanOptions {
        save_every: scan.save_every,
        jobs: scan.jobs,
        progress: !(silent || scan.no_progress),
    }
}

/// Set a flag on the first SIGINT/SIGTERM; exit on the second.
///
/// Installed right before a scan, once the model and the query are ready.
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);

    let spawned = std::thread::Builder::new()
        .name("clipseek-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "cannot install interrupt handler");
                    return;
                }
            };
            runtime.block_on(async {
                shutdown_signal().await;
                warn!("interrupt received, finishing current work and saving");
                handler_flag.store(true, Ordering::SeqCst);
                shutdown_signal().await;
                std::process::exit(130);
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot spawn interrupt handler");
    }
    flag
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
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

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Config(format!("cannot encode report: {e}")))
}
