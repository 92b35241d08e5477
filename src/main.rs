mod auth;
mod backend;
mod config;
mod dns;
mod metrics;
mod parser;
mod protocol;
mod router;
mod session;
mod target;
mod tls;
mod users;
mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use router::ServiceGraph;
use session::{Session, SessionContext, SessionRegistry};
use users::UserManager;
use worker::WorkerSet;

/// Global session counter; the low 32 bits double as the wire thread id.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Graceful shutdown timeout (wait for sessions to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often worker pools drop aged-out connections.
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Arc::new(load_config_or_bail()?);

    // Static routing graph; rejects cycles and dangling targets.
    let graph = Arc::new(ServiceGraph::build(&config)?);
    info!(
        services = config.services.len(),
        servers = config.servers.len(),
        "routing graph built"
    );

    // The user-account manager feeds every worker's cache.
    let service = config.listener_service();
    let user_manager = UserManager::new(
        config.user_manager.clone(),
        service.user.clone(),
        service.password.clone(),
        graph.servers().to_vec(),
    );
    tokio::spawn(user_manager.clone().run());

    let workers = Arc::new(WorkerSet::new(
        config.listener.worker_threads,
        &config.pool,
        &user_manager,
    ));
    info!(workers = workers.len(), "routing workers ready");

    let registry = SessionRegistry::new();

    let tls = match (&config.listener.ssl_cert, &config.listener.ssl_key) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(Path::new(cert), Path::new(key))?),
        _ => None,
    };

    let ctx = SessionContext::new(&config, graph.clone(), registry.clone(), tls);

    let addr = format!(
        "{}:{}",
        config.listener.listen_addr, config.listener.listen_port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, service = %ctx.service.name, "hermes listening");

    // Metrics endpoint on the offset port.
    let metrics_addr = format!(
        "{}:{}",
        config.listener.listen_addr,
        config.listener.listen_port + config.listener.metrics_port_offset
    );
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "metrics server failed");
        }
    });

    // Periodic pool maintenance.
    {
        let workers = workers.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POOL_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                workers.evict_expired_connections();
            }
        });
    }

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let session_id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let worker = workers.pick();
                let ctx = ctx.clone();

                info!(session_id = session_id, peer = %peer_addr, "new connection");
                metrics::metrics().record_connection_accepted();

                sessions.spawn(async move {
                    let session = Session::new(session_id, ctx, worker);
                    if let Err(e) = session.run(stream, peer_addr).await {
                        warn!(session_id = session_id, error = %e, "session ended with error");
                    } else {
                        info!(session_id = session_id, "session ended");
                    }
                    metrics::metrics().record_connection_closed();
                });
            }
        }
    }

    user_manager.stop();

    // Graceful shutdown: wait for active sessions to complete.
    let active_count = sessions.len();
    if active_count > 0 {
        info!(
            active_sessions = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "waiting for active sessions"
        );

        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        loop {
            if sessions.is_empty() {
                info!("all sessions completed");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = sessions.len(), "shutdown timeout, aborting sessions");
                    sessions.abort_all();
                    break;
                }
                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "session task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("hermes shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_config_or_bail() -> anyhow::Result<Config> {
    let mut config_paths = vec![
        "config/hermes.toml".to_string(),
        "hermes.toml".to_string(),
    ];
    if let Some(path) = std::env::args().nth(1) {
        config_paths.insert(0, path);
    }

    for path in &config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = %path, "loaded configuration");
                return Ok(config);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "failed to load config");
            }
        }
    }

    anyhow::bail!("no usable configuration found (tried {config_paths:?})")
}
