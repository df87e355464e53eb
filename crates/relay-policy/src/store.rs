use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use relay_types::EngineError;

use crate::document::PolicyDocument;

/// Versioned policy store. Activation is an atomic swap: new submissions see
/// the new version, in-flight runs keep their captured snapshot. Older
/// versions are retained for audit.
#[derive(Clone, Default)]
pub struct PolicyStore {
    inner: Arc<RwLock<HashMap<String, TenantPolicies>>>,
}

#[derive(Default)]
struct TenantPolicies {
    active: Option<Arc<PolicyDocument>>,
    history: Vec<Arc<PolicyDocument>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn activate(&self, tenant: &str, doc: PolicyDocument) -> Result<(), EngineError> {
        doc.validate()?;
        let doc = Arc::new(doc);
        let mut inner = self.inner.write().await;
        let entry = inner.entry(tenant.to_string()).or_default();
        entry.history.push(doc.clone());
        entry.active = Some(doc.clone());
        info!(tenant, policy = %doc.name, version = %doc.version, "policy activated");
        Ok(())
    }

    pub async fn active(&self, tenant: &str) -> Option<Arc<PolicyDocument>> {
        self.inner.read().await.get(tenant)?.active.clone()
    }

    pub async fn version(
        &self,
        tenant: &str,
        name: &str,
        version: &str,
    ) -> Option<Arc<PolicyDocument>> {
        self.inner
            .read()
            .await
            .get(tenant)?
            .history
            .iter()
            .find(|doc| doc.name == name && doc.version == version)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(version: &str) -> PolicyDocument {
        PolicyDocument::parse(&format!(
            "name: base\nversion: \"{version}\"\nroles: [Admin]\n"
        ))
        .expect("valid policy")
    }

    #[tokio::test]
    async fn activation_swaps_and_retains_history() {
        let store = PolicyStore::new();
        store.activate("acme", doc("1")).await.expect("activate v1");
        store.activate("acme", doc("2")).await.expect("activate v2");

        assert_eq!(store.active("acme").await.expect("active").version, "2");
        assert!(store.version("acme", "base", "1").await.is_some());
        assert!(store.active("other").await.is_none());
    }
}
