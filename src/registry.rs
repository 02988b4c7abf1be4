//! Tunnel registry — narrow façade over tunnel storage.
//!
//! The proxy, control channel, and management routes consume only the
//! [`TunnelStore`] operations. Liveness truth lives in
//! [`crate::tunnel::active::ActiveTunnels`]; the persisted `is_active` flag
//! is best-effort and corrected on divergence. [`TunnelRegistry`] is the
//! Postgres implementation; tests swap in an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::auth::constant_time_eq;

/// A user-owned mapping from a public subdomain to a private local port.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Tunnel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub local_port: i32,
    pub auth_token: String,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub connected_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The storage operations the core consumes. Errors are transient storage
/// failures; callers surface them per the taxonomy in [`crate::error`].
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, sqlx::Error>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tunnel>, sqlx::Error>;
    /// Constant-time check of a tunnel's connect credential.
    async fn verify_auth(&self, id: Uuid, token: &str) -> Result<bool, sqlx::Error>;
    async fn mark_active(&self, id: Uuid, ip: &str) -> Result<(), sqlx::Error>;
    async fn mark_inactive(&self, id: Uuid) -> Result<(), sqlx::Error>;
    async fn touch_last_seen(&self, id: Uuid) -> Result<(), sqlx::Error>;
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Tunnel>, sqlx::Error>;
    /// Insert a tunnel with a fresh id and auth token.
    async fn create(
        &self,
        user_id: Uuid,
        name: &str,
        subdomain: &str,
        local_port: i32,
    ) -> Result<Tunnel, sqlx::Error>;
    /// Owner-scoped delete. Returns whether a row was removed.
    async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error>;
    async fn exists_subdomain(&self, subdomain: &str) -> Result<bool, sqlx::Error>;
}

const TUNNEL_COLUMNS: &str = "id, user_id, name, subdomain, local_port, auth_token, \
     is_active, last_seen, connected_ip, created_at, updated_at";

/// Postgres-backed [`TunnelStore`]. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct TunnelRegistry {
    pool: PgPool,
}

impl TunnelRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TunnelStore for TunnelRegistry {
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>(&format!(
            "SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE subdomain = $1"
        ))
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>(&format!(
            "SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn verify_auth(&self, id: Uuid, token: &str) -> Result<bool, sqlx::Error> {
        let stored: Option<(String,)> =
            sqlx::query_as("SELECT auth_token FROM tunnels WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(stored.is_some_and(|(t,)| constant_time_eq(t.as_bytes(), token.as_bytes())))
    }

    async fn mark_active(&self, id: Uuid, ip: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tunnels SET is_active = true, last_seen = NOW(), connected_ip = $1, \
             updated_at = NOW() WHERE id = $2",
        )
        .bind(ip)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    async fn mark_inactive(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tunnels SET is_active = false, last_seen = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    async fn touch_last_seen(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tunnels SET last_seen = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>(&format!(
            "SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn create(
        &self,
        user_id: Uuid,
        name: &str,
        subdomain: &str,
        local_port: i32,
    ) -> Result<Tunnel, sqlx::Error> {
        let id = Uuid::new_v4();
        let auth_token = Uuid::new_v4().to_string();
        // The unique constraint on `subdomain` backstops the pre-insert
        // existence check.
        sqlx::query_as::<_, Tunnel>(&format!(
            "INSERT INTO tunnels (id, user_id, name, subdomain, local_port, auth_token) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {TUNNEL_COLUMNS}"
        ))
        .bind(id)
        .bind(user_id)
        .bind(name)
        .bind(subdomain)
        .bind(local_port)
        .bind(auth_token)
        .fetch_one(&self.pool)
        .await
    }

    async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tunnels WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists_subdomain(&self, subdomain: &str) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tunnels WHERE subdomain = $1)")
                .bind(subdomain)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

/// In-memory [`TunnelStore`] for route-level tests.
#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryTunnelStore {
        tunnels: Mutex<HashMap<Uuid, Tunnel>>,
    }

    impl MemoryTunnelStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert a tunnel row owned by a fresh user and return it.
        pub fn seed(&self, subdomain: &str, is_active: bool) -> Tunnel {
            let now = Utc::now();
            let tunnel = Tunnel {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                name: subdomain.to_string(),
                subdomain: subdomain.to_string(),
                local_port: 3000,
                auth_token: Uuid::new_v4().to_string(),
                is_active,
                last_seen: None,
                connected_ip: None,
                created_at: now,
                updated_at: now,
            };
            self.tunnels
                .lock()
                .expect("store lock")
                .insert(tunnel.id, tunnel.clone());
            tunnel
        }
    }

    #[async_trait]
    impl TunnelStore for MemoryTunnelStore {
        async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, sqlx::Error> {
            Ok(self
                .tunnels
                .lock()
                .expect("store lock")
                .values()
                .find(|t| t.subdomain == subdomain)
                .cloned())
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Tunnel>, sqlx::Error> {
            Ok(self.tunnels.lock().expect("store lock").get(&id).cloned())
        }

        async fn verify_auth(&self, id: Uuid, token: &str) -> Result<bool, sqlx::Error> {
            Ok(self
                .tunnels
                .lock()
                .expect("store lock")
                .get(&id)
                .is_some_and(|t| constant_time_eq(t.auth_token.as_bytes(), token.as_bytes())))
        }

        async fn mark_active(&self, id: Uuid, ip: &str) -> Result<(), sqlx::Error> {
            if let Some(t) = self.tunnels.lock().expect("store lock").get_mut(&id) {
                t.is_active = true;
                t.last_seen = Some(Utc::now());
                t.connected_ip = Some(ip.to_string());
            }
            Ok(())
        }

        async fn mark_inactive(&self, id: Uuid) -> Result<(), sqlx::Error> {
            if let Some(t) = self.tunnels.lock().expect("store lock").get_mut(&id) {
                t.is_active = false;
                t.last_seen = Some(Utc::now());
            }
            Ok(())
        }

        async fn touch_last_seen(&self, id: Uuid) -> Result<(), sqlx::Error> {
            if let Some(t) = self.tunnels.lock().expect("store lock").get_mut(&id) {
                t.last_seen = Some(Utc::now());
            }
            Ok(())
        }

        async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Tunnel>, sqlx::Error> {
            let mut tunnels: Vec<Tunnel> = self
                .tunnels
                .lock()
                .expect("store lock")
                .values()
                .filter(|t| t.user_id == user_id)
                .cloned()
                .collect();
            tunnels.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(tunnels)
        }

        async fn create(
            &self,
            user_id: Uuid,
            name: &str,
            subdomain: &str,
            local_port: i32,
        ) -> Result<Tunnel, sqlx::Error> {
            let now = Utc::now();
            let tunnel = Tunnel {
                id: Uuid::new_v4(),
                user_id,
                name: name.to_string(),
                subdomain: subdomain.to_string(),
                local_port,
                auth_token: Uuid::new_v4().to_string(),
                is_active: false,
                last_seen: None,
                connected_ip: None,
                created_at: now,
                updated_at: now,
            };
            self.tunnels
                .lock()
                .expect("store lock")
                .insert(tunnel.id, tunnel.clone());
            Ok(tunnel)
        }

        async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error> {
            let mut tunnels = self.tunnels.lock().expect("store lock");
            if tunnels.get(&id).is_some_and(|t| t.user_id == user_id) {
                tunnels.remove(&id);
                return Ok(true);
            }
            Ok(false)
        }

        async fn exists_subdomain(&self, subdomain: &str) -> Result<bool, sqlx::Error> {
            Ok(self
                .tunnels
                .lock()
                .expect("store lock")
                .values()
                .any(|t| t.subdomain == subdomain))
        }
    }
}
