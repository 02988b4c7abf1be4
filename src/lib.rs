#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! portway library — the reverse-tunnel edge server's building blocks:
//!
//! - `tunnel` — wire codec, pending-exchange table, per-agent sessions, the
//!   active-session map, and the agent control channel
//! - `proxy` — subdomain front-end and browser-side WebSocket bridging
//! - `registry` — façade over the persisted tunnel table
//! - `auth` — token issuing/verification and the auth middleware
//! - `routes` — management API handlers
//! - `naming` — subdomain policy
//! - `templates` — proxy error pages
//! - `config` / `db` / `state` / `error` — ambient plumbing

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod naming;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod state;
pub mod templates;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::ApiError;
pub use registry::{TunnelRegistry, TunnelStore};
pub use state::AppState;
pub use tunnel::active::ActiveTunnels;
