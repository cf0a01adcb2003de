//! Run command - start the proxy

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wshield_core::lists::{FilePersistence, ListFetcher, SourceFetcher};
use wshield_core::threat::NoThreatFeed;
use wshield_core::{
    Config, FeedChangeListener, FilterEngine, ListChangeListener, ListStore, MemoryThreatFeed,
    ProxyEvent, RateLimiter, TelemetrySink, ThreatFeed, VerdictCache,
};
use wshield_proxy::{ConnectionRegistry, ProxyServer};

/// How long background tasks get to notice shutdown
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Profile to use when no config file is given (relaxed, balanced, strict)
    #[arg(short = 'p', long)]
    pub profile: Option<String>,

    /// Listen address override
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port override
    #[arg(long)]
    pub port: Option<u16>,

    /// Data directory override
    #[arg(short = 'd', long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Serve persisted lists only; skip source and threat feed downloads
    #[arg(long)]
    pub no_refresh: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute the run command
pub fn execute(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    config.validate().context("Configuration validation failed")?;
    info!(
        profile = ?config.profile,
        listen = %config.proxy.listen_addr(),
        "Loaded configuration"
    );

    if args.dry_run {
        print_summary(&config);
        println!("{} Configuration is valid (dry run)", "✓".green());
        return Ok(());
    }

    let data_dir = super::data_dir(&config, args.data_dir.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("webshield-worker")
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(serve(config, data_dir, !args.no_refresh))
}

fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = super::load_config(args.config.as_deref(), args.profile.as_deref())?;

    if let Some(ref host) = args.host {
        config.proxy.host = host.clone();
    }
    if let Some(port) = args.port {
        config.proxy.port = port;
    }

    Ok(config)
}

async fn serve(config: Config, data_dir: PathBuf, refresh: bool) -> Result<()> {
    let fetcher: Arc<dyn ListFetcher> =
        Arc::new(SourceFetcher::new().context("Failed to build list fetcher")?);
    let persistence = FilePersistence::new(&data_dir)
        .with_context(|| format!("Failed to open data dir {}", data_dir.display()))?;

    let lists = Arc::new(ListStore::new(
        config.lists.clone(),
        Arc::clone(&fetcher),
        Arc::new(persistence),
    ));
    let version = lists.init().context("Failed to load persisted lists")?;
    info!(version, data_dir = %data_dir.display(), "Lists loaded");

    let feed = config
        .threat
        .enabled
        .then(|| Arc::new(MemoryThreatFeed::new(config.threat.clone(), Arc::clone(&fetcher))));
    let threat: Arc<dyn ThreatFeed> = match feed {
        Some(ref feed) => Arc::clone(feed) as Arc<dyn ThreatFeed>,
        None => Arc::new(NoThreatFeed),
    };

    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let cache = Arc::new(VerdictCache::from_config(&config.cache));
    let engine = Arc::new(FilterEngine::new(
        &config,
        Arc::clone(&lists),
        Arc::clone(&limiter),
        threat,
        Arc::clone(&cache),
    ));
    engine.attach();
    if let Some(ref feed) = feed {
        feed.subscribe(Arc::clone(&engine) as Arc<dyn FeedChangeListener>);
    }

    let registry = Arc::new(ConnectionRegistry::new());
    lists.subscribe(Arc::clone(&registry) as Arc<dyn ListChangeListener>);
    let telemetry = Arc::new(TelemetrySink::new(config.telemetry.channel_capacity));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if refresh {
        tasks.push(Arc::clone(&lists).spawn_refresh_task(shutdown_rx.clone(), true));
        if let Some(feed) = feed {
            tasks.push(feed.spawn_refresh_task(shutdown_rx.clone(), true));
        }
    } else {
        warn!("List refresh disabled, serving persisted lists only");
    }
    tasks.push(Arc::clone(&limiter).spawn_gc_task(
        Duration::from_secs(config.rate_limit.gc_interval_secs),
        shutdown_rx.clone(),
    ));
    tasks.push(Arc::clone(&cache).spawn_sweep_task(
        Duration::from_secs(config.cache.sweep_interval_secs),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_event_logger(telemetry.subscribe(), shutdown_rx));

    let handle = ProxyServer::start(
        config.proxy.clone(),
        Arc::clone(&engine),
        registry,
        Arc::clone(&telemetry),
    )
    .await
    .context("Failed to start proxy")?;

    info!(addr = %handle.local_addr, "WebShield listening");
    println!(
        "Proxy listening on {} - press Ctrl-C to stop",
        handle.local_addr.to_string().cyan()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt signal")?;
    info!("Received interrupt signal, shutting down...");

    handle.shutdown();
    handle.wait().await.context("Proxy did not stop cleanly")?;

    // Receivers only see a change, so ignore the no-receiver case
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    let counters = telemetry.counters();
    let stats = engine.stats();
    info!(
        allowed = counters.allowed,
        blocked = counters.blocked,
        evaluated = stats.evaluated,
        cache_hits = stats.cache_hits,
        "WebShield stopped"
    );

    Ok(())
}

/// Drain the event stream into debug logs
fn spawn_event_logger(
    mut events: broadcast::Receiver<ProxyEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => debug!(
                        kind = ?event.kind,
                        domain = %event.domain,
                        method = %event.method,
                        reason = event.reason.as_deref().unwrap_or(""),
                        duration_ms = event.duration_ms,
                        "Proxy event"
                    ),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Event logger lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn print_summary(config: &Config) {
    println!("{}", "─".repeat(50).bright_black());
    println!("Listen:          {}", config.proxy.listen_addr().cyan());
    println!(
        "Profile:         {}",
        config.profile.map(|p| p.to_string()).unwrap_or_else(|| "custom".into())
    );
    println!("Sources:         {}", config.lists.sources.iter().filter(|s| s.enabled).count());
    println!("Threat feed:     {}", on_off(config.threat.enabled));
    println!("Rate limit:      {}", on_off(config.rate_limit.enabled));
    println!("Direct IPs:      {}", blocked_allowed(config.security.block_direct_ips));
    println!("HTTPS only:      {}", on_off(config.security.force_https));
    println!("{}", "─".repeat(50).bright_black());
}

fn on_off(enabled: bool) -> colored::ColoredString {
    if enabled {
        "on".green()
    } else {
        "off".dimmed()
    }
}

fn blocked_allowed(blocked: bool) -> colored::ColoredString {
    if blocked {
        "blocked".yellow()
    } else {
        "allowed".green()
    }
}
