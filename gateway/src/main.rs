//! Gateway entry point: an HTTP reverse proxy in front of ClickHouse
//! clusters.
//!
//! The gateway authenticates incoming clients against its own user table,
//! maps them to backend cluster users, picks a healthy node, rewrites
//! credentials and configured URL params, enforces per-user limits, and
//! optionally serves responses from a shared on-disk cache. Timed-out and
//! cancelled queries are killed on the backend so nothing keeps running
//! behind a dead client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context as _, Result};
use axum::Router;
use axum_server::tls_openssl::OpenSSLConfig;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::Config;
use gateway::handlers::{self, ListenerState, Scheme};
use gateway::metrics::Metrics;
use gateway::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = Config::load_file(&args.config)
        .with_context(|| format!("error while loading config {:?}", args.config))?;

    init_tracing(&cfg);
    info!(config = %args.config.display(), "configuration loaded");

    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .context("failed to build HTTP client")?;

    let app = Arc::new(AppState::new(
        args.config.clone(),
        http_client,
        Metrics::new(),
    ));
    app.apply_config(&cfg)
        .context("error while applying config")?;
    mark_config_success(&app);

    spawn_reload_handler(app.clone())?;

    let router = |scheme| {
        Router::new()
            .fallback(handlers::serve_http)
            .with_state(ListenerState {
                app: app.clone(),
                scheme,
            })
    };

    if let Some(https) = &cfg.server.https {
        let tls = OpenSSLConfig::from_pem_file(&https.cert_file, &https.key_file)
            .map_err(|e| anyhow::anyhow!("cannot load TLS config: {e}"))?;
        let addr: std::net::SocketAddr = normalize_listen_addr(&https.listen_addr)
            .parse()
            .with_context(|| format!("cannot parse https listen addr {:?}", https.listen_addr))?;
        let https_router = router(Scheme::Https);
        info!(addr = %addr, "serving https");
        tokio::spawn(async move {
            if let Err(e) = axum_server::bind_openssl(addr, tls)
                .serve(https_router.into_make_service())
                .await
            {
                error!(error = %e, "HTTPS server error");
            }
        });
    }

    let listen_addr = normalize_listen_addr(&cfg.server.http.listen_addr);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("cannot listen for {:?}", cfg.server.http.listen_addr))?;
    info!(addr = %listen_addr, "serving http");
    axum::serve(listener, router(Scheme::Http).into_make_service())
        .await
        .context("HTTP server error")?;
    Ok(())
}

/// Accepts the conventional `:9090` shorthand for all-interfaces binds.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// `RUST_LOG` wins; otherwise the config's `log_debug` picks the level.
fn init_tracing(cfg: &Config) {
    let default_level = if cfg.log_debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// SIGHUP reloads the configuration. A failed reload is logged and the
/// running snapshot stays untouched.
fn spawn_reload_handler(app: Arc<AppState>) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("cannot install SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            hangup.recv().await;
            info!(config = %app.config_path.display(), "SIGHUP received, reloading config");
            match Config::load_file(&app.config_path) {
                Ok(cfg) => match app.apply_config(&cfg) {
                    Ok(()) => {
                        mark_config_success(&app);
                        info!("config reloaded");
                    }
                    Err(e) => {
                        app.metrics.config_success.set(0);
                        error!(error = %e, "error while applying config");
                    }
                },
                Err(e) => {
                    app.metrics.config_success.set(0);
                    error!(error = %e, "error while reloading config");
                }
            }
        }
    });
    Ok(())
}

fn mark_config_success(app: &Arc<AppState>) {
    app.metrics.config_success.set(1);
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    app.metrics.config_success_time.set(now);
}
