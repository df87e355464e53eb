use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-run cancellation tokens. The executor checks its token at every safe
/// point; `CancelRun` fires it from outside.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(run_id.to_string(), token.clone());
        token
    }

    pub async fn get(&self, run_id: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(run_id).cloned()
    }

    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.read().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, run_id: &str) {
        self.tokens.write().await.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_the_issued_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("run-1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("run-1").await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel("run-2").await);
    }
}
