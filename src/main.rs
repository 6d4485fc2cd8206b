//! Mapwalker runner
//!
//! Loads accounts, spawn table, cell grid and route, spreads the route over
//! the workers, and runs until Ctrl-C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mapwalker::{
    config::Args,
    context::ScanContext,
    egress::{EgressControl, EgressTable},
    geo::Coordinate,
    identity::AccountPool,
    notify::WebhookNotifier,
    rpc::http::HttpSessionFactory,
    spawns::SpawnRegistry,
    store::{writer::EntityLog, MemoryStore},
    worker::Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mapwalker={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Mapwalker");
    info!("======================================");
    info!("Gateway: {}", args.gateway_url);
    info!("Workers: {}", args.workers);
    info!("Proxies: {}", args.proxies.len());
    info!("Encounter mode: {:?}", args.encounter);
    info!("Bootstrap: {}", args.bootstrap);
    info!("======================================");

    let settings = args.settings();
    let accounts = Arc::new(
        AccountPool::load(&args.accounts)
            .with_context(|| format!("loading accounts from {}", args.accounts.display()))?,
    );
    let route = load_route(&args.route)?;
    info!("Route: {} points", route.len());

    let spawns = Arc::new(match &args.spawns {
        Some(path) => SpawnRegistry::load(path)
            .with_context(|| format!("loading spawn table from {}", path.display()))?,
        None => SpawnRegistry::default(),
    });

    let log = EntityLog::open(&args.sightings_log)
        .with_context(|| format!("opening {}", args.sightings_log.display()))?;
    let store = Arc::new(MemoryStore::with_log(log));

    let egress = EgressTable::new(
        args.proxies.clone(),
        egress_control(&args)?,
        settings.circuit_cooldown(),
        settings.circuit_failure_limit,
    );

    let sessions = Arc::new(HttpSessionFactory::new(args.gateway_url.clone()));
    let mut ctx = ScanContext::new(settings, Arc::clone(&accounts), sessions)
        .with_store(store.clone())
        .with_spawns(spawns.clone())
        .with_egress(egress);
    if let Some(url) = &args.notify_webhook {
        info!("Notifying {} species via webhook", args.notify_species.len());
        let notifier = WebhookNotifier::new(url.clone(), args.notify_species.iter().copied())
            .context("building webhook notifier")?;
        ctx = ctx.with_notifier(Arc::new(notifier));
    }
    let ctx = Arc::new(ctx);
    if let Err(e) = ctx.load_cell_grid(&args.cells) {
        warn!("Ignoring cell grid: {}", e);
    }

    let mut workers = Vec::with_capacity(args.workers);
    for id in 0..args.workers {
        match accounts.try_take() {
            Some(identity) => workers.push(Arc::new(Worker::new(id, Arc::clone(&ctx), identity))),
            None => {
                warn!("Only {} accounts available, starting {} workers", id, id);
                break;
            }
        }
    }
    if workers.is_empty() {
        anyhow::bail!("no usable accounts in {}", args.accounts.display());
    }

    let slices = split_route(&route, workers.len());
    let mut handles = Vec::with_capacity(workers.len());
    for (worker, slice) in workers.iter().zip(slices) {
        let worker = Arc::clone(worker);
        let bootstrap = args.bootstrap;
        handles.push(tokio::spawn(async move { worker.run(slice, bootstrap).await }));
    }

    let status_workers = workers.clone();
    let status_ctx = Arc::clone(&ctx);
    let status_interval = Duration::from_secs(args.status_interval.max(1));
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            ticker.tick().await;
            let metrics = status_ctx.metrics.snapshot();
            info!(
                seen = metrics.seen,
                captchas = metrics.captchas,
                sent = metrics.sent,
                ready = status_ctx.accounts.ready_len(),
                benched = status_ctx.accounts.benched_len(),
                "Status"
            );
            for worker in &status_workers {
                info!("{}", worker.status_line());
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    status_task.abort();
    for worker in &workers {
        worker.kill();
    }
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Worker task failed: {}", e);
        }
    }

    if args.bootstrap {
        info!("Recorded {} spawn candidates", spawns.candidate_count());
    }
    info!(
        sightings = store.sightings_len(),
        mysteries = store.mysteries_len(),
        forts = store.forts_len(),
        "Store totals"
    );
    ctx.teardown(&args.cells, &args.accounts)?;
    info!("Shutdown complete");
    Ok(())
}

fn load_route(path: &Path) -> anyhow::Result<Vec<Coordinate>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading route from {}", path.display()))?;
    let points: Vec<[f64; 2]> = serde_json::from_str(&content)
        .with_context(|| format!("parsing route {}", path.display()))?;
    Ok(points
        .into_iter()
        .map(|[lat, lon]| Coordinate::new(lat, lon))
        .collect())
}

/// Deal route points round-robin so neighbouring points go to different workers
fn split_route(route: &[Coordinate], workers: usize) -> Vec<Vec<Coordinate>> {
    let mut slices = vec![Vec::new(); workers];
    for (i, point) in route.iter().enumerate() {
        slices[i % workers].push(*point);
    }
    slices
}

#[cfg(unix)]
fn egress_control(args: &Args) -> anyhow::Result<Option<Arc<dyn EgressControl>>> {
    use mapwalker::egress::ControlSockets;

    if args.control_sockets.is_empty() {
        return Ok(None);
    }
    let sockets = ControlSockets::parse_pairs(&args.control_sockets).map_err(anyhow::Error::msg)?;
    info!("Circuit rotation enabled for {} proxies", sockets.len());
    Ok(Some(Arc::new(ControlSockets::new(
        sockets,
        args.control_password.clone(),
    ))))
}

#[cfg(not(unix))]
fn egress_control(args: &Args) -> anyhow::Result<Option<Arc<dyn EgressControl>>> {
    if !args.control_sockets.is_empty() {
        warn!("Control sockets are only supported on unix, ignoring");
    }
    Ok(None)
}
