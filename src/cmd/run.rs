//! `inference-router run`: start the router.
//!
//! Wires the config store, policy cache, backend registry, admission
//! controller and usage pipeline together, performs the initial policy
//! load, starts the three background loops (policy watch, health probes,
//! usage flusher) and serves HTTP until SIGTERM / Ctrl+C. On shutdown the
//! loops are cancelled and the usage queue is flushed one last time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::budget::{AllowAllBudget, BudgetOracle, HttpBudgetOracle};
use crate::admission::rate_limiter::{MemoryRateLimitStore, RateLimit, RateLimitStore};
use crate::admission::AdmissionController;
use crate::cli::RunArgs;
use crate::error::RouterError;
use crate::logging;
use crate::policy::cache::PolicyCache;
use crate::policy::source::{PolicySource, PolicySourceSettings};
use crate::policy::stores::file_source::FileStore;
use crate::policy::PolicyStore;
use crate::registry::BackendRegistry;
use crate::routing::backend_client::{BackendTransport, HyperTransport};
use crate::routing::health_monitor::HealthMonitor;
use crate::routing::Dispatcher;
use crate::server::{self, AppState, HttpClient, Stats};
use crate::usage::buffer::{FlushSettings, UsageBuffer};
use crate::usage::publisher::{HttpPublisher, TracingPublisher, UsagePublisher};

pub async fn execute(args: RunArgs) -> Result<(), RouterError> {
    let log_format = logging::resolve_format(args.pretty, args.json);
    logging::init(&args.log_level, log_format);

    #[cfg(feature = "sentry-integration")]
    let _sentry_guard = args
        .sentry_dsn
        .as_ref()
        .map(|dsn| crate::sentry_integration::init(dsn, args.sentry_environment.as_deref()));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let client = server::build_http_client();
    let backend_timeout = Duration::from_millis(args.backend_timeout_ms);

    let registry = Arc::new(BackendRegistry::from_list(
        &args.backend_endpoints,
        backend_timeout,
    )?);

    let store = resolve_policy_store(&args).await?;
    let cache = PolicyCache::open(&args.config_cache_path).await?;
    let policy_source = Arc::new(PolicySource::new(
        store,
        cache,
        PolicySourceSettings {
            watch_enabled: args.config_watch_enabled,
            store_timeout: Duration::from_millis(args.config_store_timeout_ms),
            ..PolicySourceSettings::default()
        },
    ));
    let origin = policy_source.load().await?;

    let admission = Arc::new(AdmissionController::new(
        resolve_rate_limit_store(&args).await,
        RateLimit {
            rate_per_sec: args.rate_limit_default_rps,
            burst: args.rate_limit_burst_size,
        },
        resolve_budget_oracle(&args, &client)?,
        Duration::from_millis(args.budget_service_timeout_ms),
    ));

    let usage = Arc::new(
        UsageBuffer::open(
            &args.usage_buffer_dir,
            resolve_usage_publisher(&args, &client).await?,
            FlushSettings {
                interval: Duration::from_millis(args.usage_flush_interval_ms.max(1)),
                batch_size: args.usage_batch_size.max(1),
                ..FlushSettings::default()
            },
        )
        .await?,
    );

    let health = Arc::new(HealthMonitor::new(args.unhealthy_threshold));
    let transport: Arc<dyn BackendTransport> = Arc::new(HyperTransport::new(client));

    let dispatcher = Arc::new(Dispatcher::new(
        policy_source.policies(),
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&admission),
        Arc::clone(&transport),
        Arc::clone(&usage),
        args.cost_per_1k_tokens,
    ));

    let cancel = CancellationToken::new();
    let loops: Vec<(&'static str, JoinHandle<()>)> = vec![
        (
            "policy watch",
            tokio::spawn(Arc::clone(&policy_source).watch(cancel.child_token())),
        ),
        (
            "health monitor",
            tokio::spawn(Arc::clone(&health).run(
                Arc::clone(&registry),
                transport,
                Duration::from_secs(args.health_check_interval_secs.max(1)),
                cancel.child_token(),
            )),
        ),
        (
            "usage flusher",
            tokio::spawn(Arc::clone(&usage).run(cancel.child_token())),
        ),
    ];

    let state = Arc::new(AppState {
        dispatcher,
        policy_source: Arc::clone(&policy_source),
        registry: Arc::clone(&registry),
        health,
        admission,
        usage: Arc::clone(&usage),
        start_time: Instant::now(),
        stats: Stats::new(),
    });

    let router = server::build_router(state, args.max_body);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(
        addr = %addr,
        policies = policy_source.policies().len(),
        origin = %origin,
        store = policy_source.store_name().unwrap_or("none"),
        backends = registry.len(),
        pending_usage = usage.pending(),
        "inference-router started"
    );

    // Stop the loops as soon as the signal arrives; in-flight requests drain.
    let shutdown = cancel.clone();
    let graceful_shutdown = async move {
        server::shutdown_signal().await;
        shutdown.cancel();
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(graceful_shutdown)
        .await?;

    cancel.cancel();
    for (name, handle) in loops {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "background task failed");
        }
    }

    match usage.flush().await {
        Ok(published) => tracing::info!(published, "final usage flush complete"),
        Err(e) => tracing::error!(
            error = %e,
            pending = usage.pending(),
            "final usage flush failed, records stay queued for the next start"
        ),
    }
    policy_source.cache().close().await;

    tracing::info!("inference-router stopped");
    Ok(())
}

async fn resolve_policy_store(args: &RunArgs) -> Result<Option<Arc<dyn PolicyStore>>, RouterError> {
    #[cfg(feature = "etcd")]
    if let Some(ref endpoint) = args.config_store_endpoint {
        let endpoints: Vec<String> = endpoint
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect();
        match crate::policy::stores::etcd::EtcdStore::connect(
            &endpoints,
            Duration::from_millis(args.config_store_timeout_ms),
        )
        .await
        {
            Ok(store) => return Ok(Some(Arc::new(store))),
            Err(e) => {
                // Served from the cache; the watch loop needs a client to recover.
                tracing::error!(
                    error = %e,
                    "could not create etcd client, running without a config store"
                );
                return Ok(None);
            }
        }
    }

    if let Some(ref path) = args.policy_file {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(RouterError::PolicyFileNotFound { path: path.clone() });
        }
        tracing::info!(path = %path.display(), "using policy seed file as config store");
        return Ok(Some(Arc::new(FileStore::new(
            path.clone(),
            Duration::from_secs(args.policy_poll_interval.max(1)),
        ))));
    }

    tracing::warn!("no config store configured, policies come from the cache only");
    Ok(None)
}

#[allow(clippy::unused_async)]
async fn resolve_rate_limit_store(args: &RunArgs) -> Arc<dyn RateLimitStore> {
    #[cfg(feature = "redis")]
    if let Some(ref url) = args.rate_limit_redis_url {
        match crate::admission::rate_limiter::RedisRateLimitStore::connect(url).await {
            Ok(store) => return Arc::new(store),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "redis rate-limit store unreachable, using a process-local store"
                );
            }
        }
    }
    #[cfg(not(feature = "redis"))]
    let _ = args;

    Arc::new(MemoryRateLimitStore::new())
}

fn resolve_budget_oracle(
    args: &RunArgs,
    client: &HttpClient,
) -> Result<Arc<dyn BudgetOracle>, RouterError> {
    match args.budget_service_endpoint {
        Some(ref endpoint) => Ok(Arc::new(HttpBudgetOracle::new(client.clone(), endpoint)?)),
        None => {
            tracing::info!("no budget service configured, budgets are not enforced");
            Ok(Arc::new(AllowAllBudget))
        }
    }
}

#[allow(clippy::unused_async)]
async fn resolve_usage_publisher(
    args: &RunArgs,
    client: &HttpClient,
) -> Result<Arc<dyn UsagePublisher>, RouterError> {
    if let Some(ref url) = args.usage_publish_url {
        return Ok(Arc::new(HttpPublisher::new(client.clone(), url.clone())));
    }

    #[cfg(feature = "redis")]
    if let Some(ref stream) = args.usage_redis_stream {
        let publisher = crate::usage::publisher::RedisStreamPublisher::connect(
            &args.usage_redis_url,
            stream.clone(),
        )
        .await?;
        return Ok(Arc::new(publisher));
    }

    tracing::info!("no usage pipeline configured, usage records go to the log");
    Ok(Arc::new(TracingPublisher::new()))
}
