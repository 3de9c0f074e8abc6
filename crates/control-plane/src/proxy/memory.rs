use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ProxyBackend, ProxyError, RoutingTable};

/// Routing table held in process. Used when no proxy admin API is
/// configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryProxy {
    routes: Mutex<RoutingTable>,
    applies: AtomicUsize,
    fail_next: AtomicBool,
}

impl MemoryProxy {
    #[must_use]
    pub fn routes(&self) -> RoutingTable {
        self.routes
            .lock()
            .map(|routes| routes.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn fail_next_apply(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyBackend for MemoryProxy {
    async fn load(&self) -> Result<RoutingTable, ProxyError> {
        Ok(self.routes())
    }

    async fn apply(&self, routes: &RoutingTable) -> Result<(), ProxyError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProxyError::Backend("injected failure".to_string()));
        }
        let mut current = self
            .routes
            .lock()
            .map_err(|_| ProxyError::Backend("routing table poisoned".to_string()))?;
        current.clone_from(routes);
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
