//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::registry::{TunnelRegistry, TunnelStore};
use crate::tunnel::active::ActiveTunnels;

/// Shared application state for the portway server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Postgres pool for the identity tables.
    pub db: PgPool,
    /// Tunnel storage behind the [`TunnelStore`] seam.
    pub registry: Arc<dyn TunnelStore>,
    /// Live agent sessions keyed by tunnel id. The truth for liveness.
    pub active: ActiveTunnels,
}

impl AppState {
    /// Production wiring: tunnel storage lives in the same Postgres pool.
    pub fn new(config: Config, db: PgPool) -> Self {
        let registry = Arc::new(TunnelRegistry::new(db.clone()));
        Self::with_store(config, db, registry)
    }

    /// Wire an explicit tunnel store (tests swap in an in-memory one).
    pub fn with_store(config: Config, db: PgPool, registry: Arc<dyn TunnelStore>) -> Self {
        Self {
            config: Arc::new(config),
            db,
            registry,
            active: ActiveTunnels::new(),
        }
    }
}
