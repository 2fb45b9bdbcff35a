/*
activity-stream - single-binary main.rs
This binary starts the Rocket HTTP server and runs the outgoing feed
ingester inside the same process. Either half can be switched off for
deployments that split the roles.
*/

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use activity_stream::auth::Credential;
use activity_stream::elasticsearch::{EsClient, EsEndpoint};
use activity_stream::feeds::Feed;
use activity_stream::ingest::{self, IngestContext, EXCEPTION_INTERVAL};
use activity_stream::kv::KvStore;
use activity_stream::lock;
use activity_stream::metrics::{self, Metrics, METRICS_INTERVAL};
use activity_stream::server::{self, AppState};

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_QUIESCENCE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "activity-stream", about = "Activity ingestion and search gateway")]
struct Args {
    /// Disable the outgoing ingester (serve HTTP only)
    #[arg(long)]
    no_worker: bool,

    /// Run the outgoing ingester only (do not bind the HTTP server)
    #[arg(long)]
    worker_only: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    debug!("examining environment...");
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(error = format!("{:#}", error), "failed to load configuration");
            return Err(error);
        }
    };
    debug!("examining environment: done");

    // Held for the lifetime of the process; events stop flowing if the
    // guard is dropped.
    let _sentry_guard = config.sentry.as_ref().map(|sentry_config| {
        sentry::init((
            sentry_config.dsn.clone(),
            sentry::ClientOptions {
                environment: Some(sentry_config.environment.clone().into()),
                ..Default::default()
            },
        ))
    });

    let port: u16 = config.port.parse().context("PORT must be a port number")?;
    let http = reqwest::Client::builder()
        .timeout(OUTBOUND_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let kv = KvStore::connect(&config.redis_uri).await?;
    let es = EsClient::new(http.clone(), EsEndpoint::from_config(&config.elasticsearch));
    let feeds: Vec<Feed> = config.feeds.iter().map(Feed::from_config).collect();
    let credentials: Vec<Credential> = config
        .incoming_access_key_pairs
        .iter()
        .map(Credential::from_config)
        .collect();

    let shutdown = Arc::new(Notify::new());
    let ctx = Arc::new(IngestContext {
        es: es.clone(),
        kv: kv.clone(),
        http,
        feeds: feeds.clone(),
        metrics: Metrics::new(),
    });

    // Worker-only mode: no HTTP server, run the ingester until a signal
    // arrives or it fails fatally (lost lock).
    if args.worker_only {
        info!("starting in worker-only mode");
        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting the ingester down");
                shutdown.notify_waiters();
                Ok(())
            }
            result = run_worker(ctx, shutdown.clone()) => result,
        };
        tokio::time::sleep(SHUTDOWN_QUIESCENCE).await;
        info!("shutdown complete");
        return result;
    }

    let mut worker_handle = None;
    if !args.no_worker {
        info!("spawning outgoing ingester");
        let worker_ctx = ctx.clone();
        let worker_shutdown = shutdown.clone();
        worker_handle = Some(tokio::spawn(async move {
            run_worker(worker_ctx, worker_shutdown).await
        }));
    } else {
        info!("outgoing ingester disabled (--no-worker)");
    }

    let state = AppState {
        started_at: Instant::now(),
        kv,
        es,
        credentials,
        ip_whitelist: config.incoming_ip_whitelist.clone(),
        feeds,
    };

    // Serve until Rocket shuts down; a fatal ingester error (lost lock)
    // also ends the process, non-zero.
    let result = match worker_handle.as_mut() {
        Some(handle) => {
            tokio::select! {
                result = server::launch_rocket(state, port) => result,
                joined = handle => {
                    match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(error)) => {
                            error!(error = format!("{:#}", error), "ingester failed fatally");
                            Err(error)
                        }
                        Err(join_error) => Err(anyhow::anyhow!("ingester panicked: {}", join_error)),
                    }
                }
            }
        }
        None => server::launch_rocket(state, port).await,
    };

    info!("HTTP server stopped; notifying ingester to shut down");
    shutdown.notify_waiters();

    if let Some(handle) = worker_handle.take() {
        if !handle.is_finished() {
            match tokio::time::timeout(Duration::from_secs(20), handle).await {
                Ok(Ok(Ok(()))) => info!("ingester exited cleanly"),
                Ok(Ok(Err(error))) => error!(error = format!("{:#}", error), "ingester returned an error"),
                Ok(Err(join_error)) => error!(error = %join_error, "ingester task panicked"),
                Err(_) => info!("timed out waiting for the ingester to exit; continuing shutdown"),
            }
        }
    }

    tokio::time::sleep(SHUTDOWN_QUIESCENCE).await;
    info!("shutdown complete");
    result
}

/// The outgoing half: acquire the cross-process lock, then run the feed
/// supervisor and the metrics poller until shutdown. Only returns an
/// error for fatal conditions; supervised tasks restart themselves.
async fn run_worker(ctx: Arc<IngestContext>, shutdown: Arc<Notify>) -> Result<()> {
    lock::acquire(&ctx.kv).await?;
    info!("ingestion lock acquired");

    let supervisor = {
        let ctx = ctx.clone();
        ingest::repeat_until_cancelled("polling feeds", EXCEPTION_INTERVAL, move || {
            ingest::ingest_feeds(ctx.clone())
        })
    };
    let metrics_poller = {
        let ctx = ctx.clone();
        ingest::repeat_until_cancelled("polling metrics", METRICS_INTERVAL, move || {
            metrics::poll_metrics(ctx.clone())
        })
    };

    tokio::select! {
        result = lock::extend_forever(&ctx.kv) => result,
        _ = supervisor => Ok(()),
        _ = metrics_poller => Ok(()),
        _ = shutdown.notified() => {
            info!("ingester: shutdown requested");
            Ok(())
        }
    }
}
