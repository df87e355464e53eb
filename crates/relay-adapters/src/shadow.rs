use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::registry::{InvokeOutcome, InvokeUsage};

/// One intended invocation captured during a shadow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub step_index: usize,
    pub tool: String,
    pub args: Value,
    pub ts: DateTime<Utc>,
}

/// No-op shim used in shadow mode: records what would have been invoked and
/// synthesizes an outcome. Never touches an effector.
#[derive(Clone, Default)]
pub struct ShadowShim {
    intents: Arc<Mutex<Vec<Intent>>>,
}

impl ShadowShim {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, step_index: usize, tool: &str, args: &Value) -> InvokeOutcome {
        self.intents.lock().await.push(Intent {
            step_index,
            tool: tool.to_string(),
            args: args.clone(),
            ts: Utc::now(),
        });
        InvokeOutcome {
            output: json!({"shadow": true, "tool": tool, "args": args}),
            usage: InvokeUsage::default(),
        }
    }

    pub async fn intents(&self) -> Vec<Intent> {
        self.intents.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_intents_in_order() {
        let shim = ShadowShim::new();
        shim.record(0, "tracker.create_issue", &json!({"title": "X"}))
            .await;
        shim.record(1, "pager.page", &json!({"summary": "S"})).await;
        let intents = shim.intents().await;
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].tool, "tracker.create_issue");
        assert_eq!(intents[1].step_index, 1);
    }
}
