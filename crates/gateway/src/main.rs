use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use palaver_bus::EventBus;
use palaver_domain::config::{Config, ConfigSeverity};
use palaver_gateway::api;
use palaver_gateway::cli::{Cli, Command, ConfigCommand};
use palaver_gateway::config_service::ConfigService;
use palaver_gateway::connections::ConnectionRegistry;
use palaver_gateway::rate_limit::UserRateLimiter;
use palaver_gateway::runtime::confirm::ConfirmationStore;
use palaver_gateway::runtime::scheduler::Scheduler;
use palaver_gateway::runtime::{ConfirmAction, TurnRuntime, WorkCtx, WorkItem, WorkKind};
use palaver_gateway::state::AppState;
use palaver_memory::{GraphStore, InMemoryGraphStore, MemoryService, Neo4jStore};
use palaver_providers::OpenAiChatClient;
use palaver_store::{SessionStore, UserLogWriter, UserStore};
use palaver_tools::ToolRegistry;

/// How long a finished reply waits for a reconnecting client.
const RECENT_RESULT_TTL: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            match run_server(cli.config_dir).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Startup failures (bad config, port bind) exit 1;
                    // anything after the listener is up is a runtime
                    // fatal and exits 2.
                    tracing::error!(error = %e, "gateway failed");
                    let code = if e.is::<StartupError>() { 1 } else { 2 };
                    std::process::exit(code);
                }
            }
        }
        Some(Command::Doctor) => {
            let (config, _service) = palaver_gateway::cli::load_config(cli.config_dir)?;
            if !palaver_gateway::cli::doctor::run(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(args)) => {
            let (config, service) = palaver_gateway::cli::load_config(cli.config_dir)?;
            match args.command {
                ConfigCommand::Validate => {
                    let issues = config.validate();
                    for issue in &issues {
                        println!("{issue}");
                    }
                    if issues
                        .iter()
                        .any(|i| i.severity == ConfigSeverity::Error)
                    {
                        std::process::exit(1);
                    }
                    println!("configuration is valid");
                    Ok(())
                }
                ConfigCommand::Show => {
                    let snapshot = service.snapshot();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&service.redacted(&snapshot))?
                    );
                    Ok(())
                }
            }
        }
        Some(Command::Version) => {
            println!("palaver {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Marker wrapped around errors raised before the listener was bound.
#[derive(Debug)]
struct StartupError(anyhow::Error);

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "startup: {}", self.0)
    }
}

impl std::error::Error for StartupError {}

fn startup(e: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(StartupError(e))
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config_dir: std::path::PathBuf) -> anyhow::Result<()> {
    tracing::info!("palaver gateway starting");

    // ── Event bus ────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    register_bus_observers(&bus);

    // ── Config service (defaults + file + env) ───────────────────────
    let config_service = Arc::new(
        ConfigService::load(config_dir, bus.clone())
            .map_err(|e| startup(anyhow::anyhow!(e)))?,
    );
    let config = config_service.snapshot().config.clone();

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        return Err(startup(anyhow::anyhow!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        )));
    }

    // ── Stores ───────────────────────────────────────────────────────
    let token_ttl = match config.server.token_ttl_hours {
        0 => None,
        hours => Some(Duration::from_secs(hours * 3600)),
    };
    let users = Arc::new(
        UserStore::new(&config.storage.data_dir, token_ttl)
            .context("initializing user store")
            .map_err(startup)?,
    );
    let sessions = Arc::new(
        SessionStore::new(&config.storage.data_dir)
            .context("initializing session store")
            .map_err(startup)?,
    );
    let logs = Arc::new(UserLogWriter::new(config.storage.logs_dir.clone()));
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        users = users.user_count(),
        "stores ready"
    );

    // ── LLM provider ─────────────────────────────────────────────────
    let provider = Arc::new(
        OpenAiChatClient::new(&config.api)
            .context("building LLM client")
            .map_err(startup)?,
    );
    tracing::info!(base_url = %config.api.base_url, model = %config.api.model, "LLM client ready");

    // ── Memory ───────────────────────────────────────────────────────
    let graph_store: Arc<dyn GraphStore> = if config.memory.enabled && config.memory.neo4j.enabled {
        tracing::info!(uri = %config.memory.neo4j.uri, "memory: neo4j store");
        Arc::new(
            Neo4jStore::new(&config.memory.neo4j)
                .context("building neo4j client")
                .map_err(startup)?,
        )
    } else {
        tracing::info!(enabled = config.memory.enabled, "memory: in-memory store");
        Arc::new(InMemoryGraphStore::new())
    };
    let memory = MemoryService::start(config.memory.clone(), graph_store, bus.clone());

    // ── Tools ────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::with_builtins());
    tracing::info!(tools = tools.len(), "tool registry ready");

    // ── Runtime assembly ─────────────────────────────────────────────
    let confirmations = Arc::new(ConfirmationStore::new());
    let connections = Arc::new(ConnectionRegistry::new(RECENT_RESULT_TTL, bus.clone()));
    let rt = Arc::new(TurnRuntime {
        bus: bus.clone(),
        users: users.clone(),
        sessions: sessions.clone(),
        logs,
        memory: memory.clone(),
        tools,
        provider,
        config: config_service.clone(),
        confirmations: confirmations.clone(),
        connections: connections.clone(),
    });
    let scheduler = Scheduler::new(config.scheduler.clone(), rt.clone());
    let limiter = Arc::new(UserRateLimiter::new(&config.server.rate_limit));
    let state = AppState {
        rt: rt.clone(),
        scheduler: scheduler.clone(),
        limiter: limiter.clone(),
        started_at: std::time::Instant::now(),
    };
    tracing::info!(workers = config.scheduler.workers, "scheduler ready");

    // ── Background sweeps ────────────────────────────────────────────
    spawn_confirmation_sweep(rt.clone(), scheduler.clone());
    {
        let connections = connections.clone();
        let users = users.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                connections.sweep_recent();
                limiter.sweep();
                users.sweep_expired_tokens();
            }
        });
    }
    {
        // Memory maintenance tick: cluster → summarize → decay.
        let memory = memory.clone();
        let users = users.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(memory.maintenance_interval());
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                let ids = users.user_ids();
                let report = memory.maintain(&ids).await;
                tracing::debug!(
                    users = ids.len(),
                    clusters = report.clusters,
                    summaries = report.summaries,
                    decayed = report.decayed,
                    "memory maintenance tick"
                );
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config);
    let router = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ));
    let app = if let Some(ip_limit) = &config.server.ip_rate_limit {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(ip_limit.requests_per_second)
            .burst_size(ip_limit.burst_size)
            .finish()
            .context("server.ip_rate_limit values must be > 0")
            .map_err(startup)?;
        tracing::info!(
            requests_per_second = ip_limit.requests_per_second,
            burst_size = ip_limit.burst_size,
            "per-IP rate limiting enabled"
        );
        router
            .layer(GovernorLayer {
                config: Arc::new(gov_config),
            })
            .with_state(state)
    } else {
        router.with_state(state)
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))
        .map_err(startup)?;
    tracing::info!(addr = %addr, "palaver listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // ── Drain ────────────────────────────────────────────────────────
    tracing::info!("shutdown requested — draining in-flight turns");
    scheduler.begin_shutdown();
    let drain = Duration::from_secs(config.server.shutdown_drain_secs);
    if scheduler.drain(drain).await {
        tracing::info!("drained cleanly");
    } else {
        tracing::warn!(deadline_secs = drain.as_secs(), "drain deadline hit — aborting remaining turns");
    }
    bus.close();
    Ok(())
}

/// Sideband observer: lifecycle and audit events land in the process
/// log as structured lines. Stream-level events (per-token text) stay
/// off this subscription — their consumers are the SSE channels.
fn register_bus_observers(bus: &Arc<EventBus>) {
    use palaver_domain::events::{Event, EventKind};

    let observer: Arc<dyn palaver_bus::EventHandler> = Arc::new(|event: Event| async move {
        tracing::info!(
            event = event.kind().as_str(),
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            payload = %serde_json::to_string(&event.payload).unwrap_or_default(),
            "gateway event"
        );
        Ok::<(), palaver_domain::Error>(())
    });

    for kind in [
        EventKind::ConversationStart,
        EventKind::ConversationComplete,
        EventKind::ConversationError,
        EventKind::ConfigChanged,
        EventKind::MemorySaved,
        EventKind::MemoryClusterDone,
        EventKind::MemorySummaryDone,
        EventKind::ConnectionBound,
        EventKind::ConnectionClosed,
    ] {
        bus.subscribe(kind, "event-log", observer.clone());
    }
}

/// Re-enqueue expired confirmations as rejections (TTL expiry behaves
/// exactly like the user pressing reject).
fn spawn_confirmation_sweep(rt: Arc<TurnRuntime>, scheduler: Arc<Scheduler>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            for pending in rt.confirmations.take_expired() {
                tracing::info!(
                    call_id = %pending.call_id,
                    tool = %pending.tool_name,
                    "confirmation expired — treating as reject"
                );
                let ctx = WorkCtx {
                    user_id: pending.user_id.clone(),
                    session_id: pending.session_id.clone(),
                    request_id: format!("confirm-ttl-{}", pending.call_id),
                    snapshot: pending.state.snapshot.clone(),
                    frames: pending.state.frames.clone(),
                    frames_sent: pending.state.frames_sent.clone(),
                    cancel: scheduler.work_token(),
                };
                let item = WorkItem {
                    ctx,
                    kind: WorkKind::Resume {
                        state: pending.state,
                        action: ConfirmAction::Reject,
                    },
                };
                if let Err(e) = scheduler.enqueue_resume(item).await {
                    tracing::warn!(error = %e, "failed to enqueue expired-confirmation reject");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// CORS from the configured origin list. A trailing `:*` matches any
/// port on that host; a literal `"*"` allows everything.
fn build_cors_layer(config: &Config) -> CorsLayer {
    use axum::http::header;

    let origins = &config.server.cors.allowed_origins;
    if origins.len() == 1 && origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut port_wildcards: Vec<String> = Vec::new();
    for origin in origins {
        if let Some(prefix) = origin.strip_suffix('*') {
            port_wildcards.push(prefix.to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if port_wildcards.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            let origin_str = origin.to_str().unwrap_or("");
            // The remainder after the prefix must be digits only, so
            // "http://localhost:3000.evil.com" cannot sneak through.
            port_wildcards.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
