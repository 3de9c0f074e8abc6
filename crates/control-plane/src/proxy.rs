//! Reverse proxy routing. [`ProxyManager`] keeps the routing table the
//! control plane wants and pushes it to a [`ProxyBackend`] in one write.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::ServingRoute;
use crate::telemetry;

pub mod caddy;
pub mod domain;
pub mod memory;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("domain {domain} is already routed for {owner}")]
    Conflict { domain: String, owner: String },
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("proxy admin API error: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn dial(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One routed domain and the application that claimed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub upstream: Upstream,
    pub owner: String,
}

pub type RoutingTable = BTreeMap<String, RouteEntry>;

/// Owner prefix of routes registered by extension steps; reconciliation
/// leaves them in place.
pub const EXTENSION_OWNER_PREFIX: &str = "extension:";

/// Stores routes in the actual proxy.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Routes currently managed by the control plane.
    async fn load(&self) -> Result<RoutingTable, ProxyError>;

    /// Replaces every managed route with `routes` in one commit.
    async fn apply(&self, routes: &RoutingTable) -> Result<(), ProxyError>;
}

/// Serializes every routing change behind one lock.
pub struct ProxyManager {
    backend: Arc<dyn ProxyBackend>,
    table: Mutex<Option<RoutingTable>>,
}

impl ProxyManager {
    #[must_use]
    pub fn new(backend: Arc<dyn ProxyBackend>) -> Self {
        Self {
            backend,
            table: Mutex::new(None),
        }
    }

    async fn commit(&self, table: &mut Option<RoutingTable>, next: RoutingTable) -> Result<(), ProxyError> {
        if table.as_ref() == Some(&next) {
            return Ok(());
        }
        let result = self.backend.apply(&next).await;
        telemetry::proxy_reloaded(result.is_ok());
        result?;
        *table = Some(next);
        Ok(())
    }

    async fn current(&self, table: &mut Option<RoutingTable>) -> Result<RoutingTable, ProxyError> {
        if let Some(existing) = table {
            return Ok(existing.clone());
        }
        let loaded = self.backend.load().await?;
        *table = Some(loaded.clone());
        Ok(loaded)
    }

    /// Routes `domain` to `upstream` for `owner`. Repeating the same call
    /// changes nothing.
    ///
    /// # Errors
    /// `Conflict` when another owner holds the domain, `Backend` when the
    /// proxy rejects the change.
    pub async fn add(&self, domain: &str, upstream: Upstream, owner: &str) -> Result<(), ProxyError> {
        let domain = domain::normalize(domain)?;
        let mut table = self.table.lock().await;
        let mut next = self.current(&mut table).await?;

        if let Some(existing) = next.get(&domain) {
            if existing.owner != owner {
                return Err(ProxyError::Conflict {
                    domain,
                    owner: existing.owner.clone(),
                });
            }
        }
        next.insert(
            domain.clone(),
            RouteEntry {
                upstream: upstream.clone(),
                owner: owner.to_string(),
            },
        );
        self.commit(&mut table, next).await?;
        info!(%domain, upstream = %upstream.dial(), owner, "proxy route set");
        Ok(())
    }

    /// Removes a route. Removing an absent route succeeds.
    ///
    /// # Errors
    /// Returns `Backend` when the proxy rejects the change.
    pub async fn remove(&self, domain: &str) -> Result<(), ProxyError> {
        let domain = domain::normalize(domain)?;
        let mut table = self.table.lock().await;
        let mut next = self.current(&mut table).await?;
        if next.remove(&domain).is_none() {
            return Ok(());
        }
        self.commit(&mut table, next).await?;
        info!(%domain, "proxy route removed");
        Ok(())
    }

    /// Removes every route owned by `owner`.
    ///
    /// # Errors
    /// Returns `Backend` when the proxy rejects the change.
    pub async fn remove_owner(&self, owner: &str) -> Result<(), ProxyError> {
        let mut table = self.table.lock().await;
        let mut next = self.current(&mut table).await?;
        next.retain(|_, entry| entry.owner != owner);
        self.commit(&mut table, next).await
    }

    /// Removes the routes of `owner` other than `keep`, so a renamed domain
    /// stops pointing at a container that is about to be retired.
    ///
    /// # Errors
    /// Returns `Backend` when the proxy rejects the change.
    pub async fn prune_owner(&self, owner: &str, keep: Option<&str>) -> Result<(), ProxyError> {
        let keep = keep.map(domain::normalize).transpose()?;
        let mut table = self.table.lock().await;
        let mut next = self.current(&mut table).await?;
        next.retain(|domain, entry| entry.owner != owner || keep.as_deref() == Some(domain.as_str()));
        self.commit(&mut table, next).await
    }

    /// Puts `domain` back to an earlier registration, whoever owns it now.
    ///
    /// # Errors
    /// Returns `Backend` when the proxy rejects the change.
    pub async fn restore(&self, domain: &str, previous: Option<RouteEntry>) -> Result<(), ProxyError> {
        let domain = domain::normalize(domain)?;
        let mut table = self.table.lock().await;
        let mut next = self.current(&mut table).await?;
        match previous {
            Some(entry) => next.insert(domain.clone(), entry),
            None => next.remove(&domain),
        };
        self.commit(&mut table, next).await?;
        info!(%domain, "proxy route restored");
        Ok(())
    }

    /// Re-reads the proxy and re-commits the cached table.
    ///
    /// # Errors
    /// Returns `Backend` when the proxy is unreachable.
    pub async fn reload(&self) -> Result<(), ProxyError> {
        let mut table = self.table.lock().await;
        let desired = self.current(&mut table).await?;
        let actual = self.backend.load().await?;
        if actual != desired {
            let result = self.backend.apply(&desired).await;
            telemetry::proxy_reloaded(result.is_ok());
            result?;
        }
        Ok(())
    }

    /// Makes the proxy route exactly the serving deployments. Routes of
    /// applications that no longer serve are dropped; their certificates are
    /// left for the proxy to expire.
    ///
    /// # Errors
    /// `Conflict` when two applications claim one domain; nothing is applied
    /// in that case.
    pub async fn reconcile(&self, serving: &[ServingRoute]) -> Result<(), ProxyError> {
        let mut desired = RoutingTable::new();
        for route in serving {
            let domain = match domain::normalize(&route.domain) {
                Ok(domain) => domain,
                Err(error) => {
                    warn!(application_id = %route.application_id, %error, "skipping route with invalid domain");
                    continue;
                }
            };
            if let Some(existing) = desired.get(&domain) {
                if existing.owner != route.application_id {
                    return Err(ProxyError::Conflict {
                        domain,
                        owner: existing.owner.clone(),
                    });
                }
            }
            desired.insert(
                domain,
                RouteEntry {
                    upstream: Upstream::new(route.container_name.clone(), route.port),
                    owner: route.application_id.clone(),
                },
            );
        }

        let mut table = self.table.lock().await;
        let actual = self.backend.load().await?;
        for (domain, entry) in &actual {
            if entry.owner.starts_with(EXTENSION_OWNER_PREFIX) && !desired.contains_key(domain) {
                desired.insert(domain.clone(), entry.clone());
            }
        }
        *table = Some(actual);
        let count = desired.len();
        self.commit(&mut table, desired).await?;
        info!(routes = count, "proxy reconciled");
        Ok(())
    }

    /// # Errors
    /// Returns `Backend` when the table has to be loaded and the proxy is
    /// unreachable.
    pub async fn snapshot(&self) -> Result<RoutingTable, ProxyError> {
        let mut table = self.table.lock().await;
        self.current(&mut table).await
    }
}
