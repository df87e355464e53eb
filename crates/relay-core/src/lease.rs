use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_types::EngineError;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

struct LeaseEntry {
    owner: u64,
    expires_at: Instant,
}

/// Run-scoped leases enforcing the single-writer-per-run invariant. A second
/// executor instance cannot acquire a live lease; a holder that lets its
/// lease lapse must abandon the run without further mutation.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    inner: Arc<Mutex<HashMap<String, LeaseEntry>>>,
    ttl: Duration,
}

impl LeaseRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn acquire(&self, run_id: &str) -> Result<LeaseGuard, EngineError> {
        let owner = NEXT_OWNER.fetch_add(1, Ordering::SeqCst);
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("lease registry poisoned".to_string()))?;
        let now = Instant::now();
        if let Some(entry) = inner.get(run_id) {
            if entry.expires_at > now {
                return Err(EngineError::LeaseHeld(run_id.to_string()));
            }
        }
        inner.insert(
            run_id.to_string(),
            LeaseEntry {
                owner,
                expires_at: now + self.ttl,
            },
        );
        Ok(LeaseGuard {
            registry: self.clone(),
            run_id: run_id.to_string(),
            owner,
        })
    }

    fn renew(&self, run_id: &str, owner: u64) -> Result<(), EngineError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("lease registry poisoned".to_string()))?;
        match inner.get_mut(run_id) {
            Some(entry) if entry.owner == owner && entry.expires_at > Instant::now() => {
                entry.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            _ => Err(EngineError::LeaseLost(run_id.to_string())),
        }
    }

    fn release(&self, run_id: &str, owner: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.get(run_id).is_some_and(|entry| entry.owner == owner) {
                inner.remove(run_id);
            }
        }
    }
}

pub struct LeaseGuard {
    registry: LeaseRegistry,
    run_id: String,
    owner: u64,
}

impl LeaseGuard {
    /// Renew at persistence points; an error means another owner took over
    /// and this executor must stop mutating the run.
    pub fn renew(&self) -> Result<(), EngineError> {
        self.registry.renew(&self.run_id, self.owner)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.run_id, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_lease_lives() {
        let registry = LeaseRegistry::new(Duration::from_secs(30));
        let guard = registry.acquire("run-1").expect("first acquire");
        assert!(matches!(
            registry.acquire("run-1"),
            Err(EngineError::LeaseHeld(_))
        ));
        guard.renew().expect("holder renews");
        drop(guard);
        registry.acquire("run-1").expect("free after release");
    }

    #[test]
    fn expired_lease_is_taken_over_and_old_owner_loses() {
        let registry = LeaseRegistry::new(Duration::from_millis(0));
        let stale = registry.acquire("run-1").expect("first acquire");
        let _fresh = registry.acquire("run-1").expect("takeover after expiry");
        assert!(matches!(stale.renew(), Err(EngineError::LeaseLost(_))));
    }
}
