use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use selfserve_domain::{Config, ConfigSeverity, TransportStrategy};
use selfserve_gateway::api;
use selfserve_gateway::api::auth::CredentialResolver;
use selfserve_gateway::api::chat::DedupeStore;
use selfserve_gateway::cors::build_cors_layer;
use selfserve_gateway::dispatcher::{self, handlers::HandlerSet, DispatcherState};
use selfserve_gateway::state::AppState;
use selfserve_gateway::turn_queue::TurnQueueMap;
use selfserve_gateway::worker::{self, runtime::HttpAgentRuntime, WorkerState};
use selfserve_store::Store;
use selfserve_transport::BuiltTransport;

#[derive(Parser)]
#[command(name = "selfserve", about = "Self-service assistant control plane")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SELFSERVE_CONFIG", default_value = "selfserve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the request router (default).
    Router,
    /// Serve the agent worker.
    Worker,
    /// Serve the integration dispatcher.
    Dispatcher,
    /// Serve all three services in one process (direct-HTTP only).
    All,
    /// Validate the configuration and exit.
    ConfigValidate,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Router) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_router(config, shutdown_token()).await
        }
        Some(Command::Worker) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_worker(config, shutdown_token()).await
        }
        Some(Command::Dispatcher) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_dispatcher(config, shutdown_token()).await
        }
        Some(Command::All) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            if config.transport.strategy != TransportStrategy::DirectHttp {
                anyhow::bail!("`all` runs the services in-process and needs transport.strategy = \"direct_http\"");
            }
            let shutdown = shutdown_token();
            let worker = tokio::spawn(run_worker(config.clone(), shutdown.clone()));
            let dispatcher = tokio::spawn(run_dispatcher(config.clone(), shutdown.clone()));
            let router = tokio::spawn(run_router(config, shutdown));
            for task in [worker, dispatcher, router] {
                task.await??;
            }
            Ok(())
        }
        Some(Command::ConfigValidate) => {
            let config = Config::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("selfserve {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,selfserve_gateway=debug")),
        )
        .json()
        .init();
}

/// Load config and enforce validation errors before anything opens.
fn load_config(path: &PathBuf) -> anyhow::Result<Arc<Config>> {
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    Ok(Arc::new(config))
}

/// A token cancelled on SIGINT/SIGTERM; every service loop and axum
/// listener hangs off it for a symmetric shutdown.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            trigger.cancel();
        }
    });
    token
}

async fn serve(
    app: axum::Router,
    host: &str,
    port: u16,
    service: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, service, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("axum server error")?;

    tracing::info!(service, "stopped");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request router service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_router(config: Arc<Config>, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("request router starting");

    // ── Store (asserts migration version) ───────────────────────────
    let store = Arc::new(
        Store::open(
            &config.store.path,
            config.store.busy_timeout_ms,
            config.integrations.defaults(),
        )
        .context("opening store")?,
    );

    // ── Transport ────────────────────────────────────────────────────
    let built = selfserve_transport::build(&config, "selfserve.router")
        .await
        .context("building transport")?;
    if let BuiltTransport::Broker(ref broker) = built {
        broker.spawn_response_listener(shutdown.clone());
    }

    // ── Credential resolver ──────────────────────────────────────────
    let resolver = Arc::new(CredentialResolver::from_config(&config.auth));

    // ── Chat dedupe + per-thread queues ──────────────────────────────
    let dedupe = Arc::new(DedupeStore::new(std::time::Duration::from_secs(
        config.chat.dedupe_ttl_secs,
    )));
    let turn_queues = Arc::new(TurnQueueMap::new());

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        transport: built.as_dyn(),
        resolver,
        dedupe,
        turn_queues: turn_queues.clone(),
    };

    // ── Session idle sweep ───────────────────────────────────────────
    {
        let store = store.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                config.sessions.sweep_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let idle = chrono::Duration::minutes(config.sessions.idle_ttl_minutes as i64);
                let retention = chrono::Duration::hours(config.sessions.retention_hours as i64);
                match store.sweep_idle(idle, retention) {
                    Ok((0, 0)) => {}
                    Ok((inactive, closed)) => {
                        tracing::info!(inactive, closed, "session sweep")
                    }
                    Err(e) => tracing::warn!(error = %e, "session sweep failed"),
                }
                // Locks left behind by a crashed replica: anything
                // older than twice the response deadline is dead.
                let stale =
                    chrono::Duration::seconds(2 * config.router.response_timeout_secs as i64);
                if let Err(e) = store.release_stale_turns(stale) {
                    tracing::warn!(error = %e, "stale turn reclaim failed");
                }
            }
        });
    }

    // ── Turn queue pruning ───────────────────────────────────────────
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                turn_queues.prune_quiet();
            }
        });
    }

    // ── HTTP stack ───────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.router.cors);
    let app = api::router(state)
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.router.max_concurrent,
        ));

    let app = match config.router.rate_limit {
        Some(ref rl) => {
            use tower_governor::governor::GovernorConfigBuilder;
            use tower_governor::GovernorLayer;

            let gov_config = GovernorConfigBuilder::default()
                .per_second(rl.requests_per_second)
                .burst_size(rl.burst_size)
                .finish()
                .context("rate_limit: requests_per_second and burst_size must be > 0")?;

            tracing::info!(
                requests_per_second = rl.requests_per_second,
                burst_size = rl.burst_size,
                "per-IP rate limiting enabled"
            );
            app.layer(GovernorLayer {
                config: Arc::new(gov_config),
            })
        }
        None => app,
    };

    serve(app, &config.router.host, config.router.port, "router", shutdown).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent worker service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_worker(config: Arc<Config>, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("agent worker starting");

    let store = Arc::new(
        Store::open(
            &config.store.path,
            config.store.busy_timeout_ms,
            config.integrations.defaults(),
        )
        .context("opening store")?,
    );

    let built = selfserve_transport::build(&config, "selfserve.worker")
        .await
        .context("building transport")?;

    let runtime = Arc::new(HttpAgentRuntime::new(&config.runtime).context("runtime client")?);
    tracing::info!(base_url = %config.runtime.base_url, "agent runtime client ready");

    let state = WorkerState {
        config: config.clone(),
        store,
        transport: built.as_dyn(),
        runtime,
    };

    worker::start_consumers(&state, &built, shutdown.clone());

    let app = worker::http_app(state);
    serve(app, &config.worker.host, config.worker.port, "worker", shutdown).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Integration dispatcher service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_dispatcher(config: Arc<Config>, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("integration dispatcher starting");

    let handlers = Arc::new(HandlerSet::from_config(&config).context("building handlers")?);

    // Email auto-enable predicate: enabled iff the SMTP relay answers.
    let mut defaults = config.integrations.defaults();
    if config.integrations.email.enabled && config.integrations.email.auto_enable {
        let reachable = handlers.email_reachable().await;
        if !reachable {
            tracing::warn!("SMTP relay unreachable, disabling the email integration default");
            for default in &mut defaults {
                if default.kind == selfserve_domain::IntegrationKind::Email {
                    default.enabled = false;
                }
            }
        }
    }

    let store = Arc::new(
        Store::open(&config.store.path, config.store.busy_timeout_ms, defaults)
            .context("opening store")?,
    );

    let built = selfserve_transport::build(&config, "selfserve.dispatcher")
        .await
        .context("building transport")?;

    let instance_id = config
        .dispatcher
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("dispatcher-{}", uuid::Uuid::new_v4()));
    tracing::info!(instance_id = %instance_id, "event claims will use this identity");

    let state = DispatcherState {
        config: config.clone(),
        store,
        handlers,
        instance_id: Arc::new(instance_id),
    };

    dispatcher::start_consumers(&state, &built, shutdown.clone());
    dispatcher::start_retry_runner(state.clone(), shutdown.clone());

    let app = dispatcher::http_app(state);
    serve(
        app,
        &config.dispatcher.host,
        config.dispatcher.port,
        "dispatcher",
        shutdown,
    )
    .await
}

