//! pixel-relay — tracking pixel ingestion and CRM reconciliation service.
//!
//! Main entry point that wires the stores, ingest pipeline, scheduler, and
//! HTTP server together.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use pixel_api::{build_router, start_metrics, AppState, TaskSpawner};
use pixel_core::clock::{SharedClock, SystemClock};
use pixel_core::config::AppConfig;
use pixel_crm::{CircuitBreaker, CircuitBreakerConfig, CrmAdapter, HttpTransport};
use pixel_identity::IdentityService;
use pixel_ingest::{EventWriter, IngestPipeline, RateLimiter};
use pixel_kv::{KvStore, MemoryKv, RedisKv};
use pixel_scheduler::{DeferredJobQueue, Scheduler};
use pixel_store::Store;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pixel-relay")]
#[command(about = "Tracking pixel ingestion and CRM reconciliation service")]
#[command(version)]
struct Cli {
    /// HTTP port (overrides config)
    #[arg(long, env = "PIXEL_RELAY__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// SQLite database path (overrides config)
    #[arg(long, env = "PIXEL_RELAY__DATABASE__PATH")]
    db_path: Option<String>,

    /// Redis URL (overrides config)
    #[arg(long, env = "PIXEL_RELAY__REDIS__URL")]
    redis_url: Option<String>,

    /// Use the in-process KV store instead of Redis (single-node dev)
    #[arg(long, default_value_t = false)]
    memory_kv: bool,

    /// Serve HTTP only; skip the scheduler loop (cron-driven deployments)
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        AppConfig::default()
    });
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("pixel_relay={},tower_http=info", config.log_level).into()
            }),
        )
        .json()
        .init();

    info!(
        environment = %config.environment,
        http_port = config.api.http_port,
        db_path = %config.database.path,
        "pixel-relay starting up"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(Store::open(&config.database.path)?);

    let kv: Arc<dyn KvStore> = if cli.memory_kv {
        warn!("using in-process KV store; deferred jobs will not survive restarts");
        Arc::new(MemoryKv::new())
    } else {
        Arc::new(connect_with_retry("Redis", || RedisKv::new(&config.redis)).await?)
    };

    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::default(),
        clock.clone(),
    ));
    let adapter = match &config.pipedrive.api_key {
        Some(_) => {
            let transport = Arc::new(HttpTransport::new(&config.pipedrive)?);
            Some(Arc::new(CrmAdapter::new(transport, breaker.clone())))
        }
        None => {
            warn!("PIPEDRIVE_API_KEY not set; CRM reconciliation disabled");
            None
        }
    };

    // Verify the mapped custom-field keys against the live schema before
    // the first sync runs.
    if let Some(adapter) = adapter.clone() {
        tokio::spawn(async move {
            match adapter.verify_field_keys().await {
                Ok(missing) if missing.is_empty() => {
                    info!("CRM field mapping verified against live schema")
                }
                Ok(missing) => warn!(missing = ?missing, "CRM field mapping has unknown keys"),
                Err(e) => warn!(error = %e, "CRM field mapping verification failed"),
            }
        });
    }

    let queue = Arc::new(DeferredJobQueue::new(kv.clone(), clock.clone()));
    let identity = IdentityService::new(store.clone(), clock.clone());
    let writer = EventWriter::new(store.clone(), clock.clone());
    let limiter = RateLimiter::new(kv.clone(), clock.clone());
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        identity,
        writer,
        limiter,
        clock.clone(),
        config.ingest.tracking_limit_per_min,
    ));

    let spawner = TaskSpawner::new();
    let state = AppState {
        pipeline,
        store: store.clone(),
        queue: queue.clone(),
        spawner: spawner.clone(),
        newsletter: config.newsletter.clone(),
        http: reqwest::Client::new(),
        production: config.is_production(),
        start_time: Instant::now(),
    };

    if let Err(e) = start_metrics(&config.api.host, config.api.metrics_port) {
        error!(error = %e, "failed to start metrics exporter");
    }

    // Scheduler loop: the in-process stand-in for the platform cron.
    if let (false, Some(adapter)) = (cli.no_scheduler, adapter) {
        let scheduler = Arc::new(Scheduler::new(
            store,
            queue,
            adapter,
            clock,
            config.scheduler.clone(),
        ));
        let interval_secs = config.scheduler.tick_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            // The immediate first tick would race startup; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                scheduler.run_tick().await;
            }
        });
        info!(interval_secs, "scheduler loop started");
    }

    let app = build_router(state, config.ingest.max_body_bytes);
    let addr = std::net::SocketAddr::new(config.api.host.parse()?, config.api.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Handler-spawned work (CRM enqueues, newsletter calls) must land
    // before the process exits.
    spawner.drain().await;
    info!("pixel-relay shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}

/// Connect to an external service with a short backoff ladder.
async fn connect_with_retry<T, F, Fut>(service_name: &str, connect_fn: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let delays = [
        std::time::Duration::from_secs(0),
        std::time::Duration::from_secs(2),
        std::time::Duration::from_secs(4),
    ];
    let mut last_err = None;
    for (attempt, delay) in delays.iter().enumerate() {
        if attempt > 0 {
            warn!(service = service_name, attempt, "retrying connection after {}s", delay.as_secs());
            tokio::time::sleep(*delay).await;
        }
        match connect_fn().await {
            Ok(conn) => {
                info!(service = service_name, "connected");
                return Ok(conn);
            }
            Err(e) => {
                error!(service = service_name, attempt, error = %e, "connection failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{service_name} connection failed")))
}
