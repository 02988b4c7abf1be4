//! HTTP route handlers for the management API.
//!
//! Each sub-module corresponds to an endpoint group. Everything except
//! [`health`] and the public auth endpoints requires a valid token via the
//! [`crate::auth::require_auth`] middleware.

pub mod auth;
pub mod health;
pub mod tunnels;
