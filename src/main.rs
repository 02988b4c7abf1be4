#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portway
//!
//! Reverse-tunnel edge server. A user-operated agent behind NAT dials out a
//! persistent WebSocket; portway publishes the agent's local HTTP/WebSocket
//! service under `<subdomain>.<base-domain>` and shuttles request/response
//! and WebSocket frames over that one connection.
//!
//! ## API surface
//!
//! | Method | Path                          | Auth  | Description                      |
//! |--------|-------------------------------|-------|----------------------------------|
//! | POST   | `/api/v1/auth/signup`         | No    | Create account, issue tokens     |
//! | POST   | `/api/v1/auth/login`          | No    | Issue tokens                     |
//! | POST   | `/api/v1/auth/refresh`        | No    | Rotate refresh token             |
//! | POST   | `/api/v1/auth/agent-auth`     | No*   | Exchange browser → agent token   |
//! | GET    | `/api/v1/profile`             | Yes   | Current user                     |
//! | GET    | `/api/v1/tunnels`             | Yes   | List tunnels (live-aware)        |
//! | POST   | `/api/v1/tunnels`             | Yes   | Create tunnel                    |
//! | DELETE | `/api/v1/tunnels/{id}`        | Yes   | Delete tunnel, tear down session |
//! | POST   | `/api/v1/tunnels/{id}/stop`   | Yes   | Terminate or reconcile           |
//! | GET    | `/api/v1/tunnel/connect`      | Yes   | Agent WebSocket upgrade          |
//! | GET    | `/health`                     | No    | Liveness probe                   |
//! | *      | any other host                | —     | Subdomain proxy                  |
//!
//! *`agent-auth` carries the browser token in its body.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! db.rs            — Postgres pool, startup migrations
//! auth.rs          — JWT issue/verify, middleware, constant-time comparison
//! registry.rs      — tunnels-table façade
//! naming.rs        — subdomain policy + reserved list
//! templates.rs     — embedded proxy error pages
//! proxy.rs         — host→subdomain dispatch, WS bridging
//! routes/          — health, identity, tunnel management
//! tunnel/
//!   mod.rs         — frame codec
//!   pending.rs     — correlation-id → one-shot slot table
//!   session.rs     — per-agent session, forwarding, dispatch
//!   active.rs      — live-session map (single session per tunnel)
//!   connect.rs     — agent upgrade, heartbeat loop, teardown
//! ```

use std::net::SocketAddr;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use portway::{auth, config::Config, db, proxy, routes, state::AppState, tunnel};

/// Reverse-tunnel edge server.
#[derive(Parser)]
#[command(name = "portway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the edge server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("portway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Base domain: {}", config.proxy.base_domain);
    info!("Listening on {}", config.server.listen);

    if config.auth.jwt_secret == "change-me" {
        warn!("Using default JWT secret — set PORTWAY_JWT_SECRET or update config");
    }

    let pool = match db::connect(&config.database.url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = db::run_migrations(&pool).await {
        error!("Failed to run migrations: {e}");
        std::process::exit(1);
    }

    let state = AppState::new(config, pool);

    let public_routes = Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/v1/auth/signup", post(routes::auth::signup))
        .route("/api/v1/auth/login", post(routes::auth::login))
        .route("/api/v1/auth/refresh", post(routes::auth::refresh))
        .route("/api/v1/auth/agent-auth", post(routes::auth::agent_auth));

    let protected_routes = Router::new()
        .route("/api/v1/profile", get(routes::auth::profile))
        .route(
            "/api/v1/tunnels",
            get(routes::tunnels::list).post(routes::tunnels::create),
        )
        .route("/api/v1/tunnels/{id}", delete(routes::tunnels::delete))
        .route("/api/v1/tunnels/{id}/stop", post(routes::tunnels::stop))
        .route("/api/v1/tunnel/connect", get(tunnel::connect::connect))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .fallback(proxy::handle_subdomain)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        }
    };

    info!("Server ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    info!("Shutting down...");
}

/// Resolves when the process is asked to stop: SIGINT anywhere, SIGTERM on
/// unix (what container runtimes send).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
}
