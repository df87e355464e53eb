use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use relay_types::{Approval, EngineError, Run, RunEvent, RunEventKind, Step};

/// Dedup bracket for a non-idempotent adapter call: written before the call,
/// confirmed after. An unconfirmed record found on restart means the outcome
/// is unknown until the adapter's idempotency API resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub token: String,
    pub run_id: String,
    pub step_index: usize,
    pub tool: String,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

/// Persisted projection of runs, steps, approvals and the per-run event feed.
/// Writes to a single run are serialized by the executor's lease; the store
/// only has to be internally consistent and read-your-writes.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), EngineError>;
    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, EngineError>;
    async fn save_run(&self, run: &Run) -> Result<(), EngineError>;
    async fn find_run_by_idempotency_key(
        &self,
        tenant: &str,
        key: &str,
    ) -> Result<Option<Run>, EngineError>;

    async fn save_step(&self, step: &Step) -> Result<(), EngineError>;
    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, EngineError>;

    async fn save_approval(&self, approval: &Approval) -> Result<(), EngineError>;
    async fn load_approval(&self, approval_id: &str) -> Result<Option<Approval>, EngineError>;
    async fn list_approvals(&self, run_id: &str) -> Result<Vec<Approval>, EngineError>;

    /// Append to the run's event feed, assigning the next dense seq.
    async fn append_run_event(
        &self,
        run_id: &str,
        kind: RunEventKind,
        payload: Value,
    ) -> Result<RunEvent, EngineError>;
    async fn list_run_events(
        &self,
        run_id: &str,
        from_seq: u64,
    ) -> Result<Vec<RunEvent>, EngineError>;

    async fn put_dedup(&self, record: &DedupRecord) -> Result<(), EngineError>;
    async fn get_dedup(&self, token: &str) -> Result<Option<DedupRecord>, EngineError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    runs: HashMap<String, Run>,
    steps: HashMap<String, BTreeMap<usize, Step>>,
    approvals: HashMap<String, Approval>,
    events: HashMap<String, Vec<RunEvent>>,
    dedup: HashMap<String, DedupRecord>,
}

impl StoreState {
    fn create_run(&mut self, run: &Run) -> Result<(), EngineError> {
        if self.runs.contains_key(&run.id) {
            return Err(EngineError::DuplicateRun(run.id.clone()));
        }
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn find_by_idempotency_key(&self, tenant: &str, key: &str) -> Option<Run> {
        self.runs
            .values()
            .find(|run| run.tenant == tenant && run.idempotency_key.as_deref() == Some(key))
            .cloned()
    }

    fn append_event(&mut self, run_id: &str, kind: RunEventKind, payload: Value) -> RunEvent {
        let feed = self.events.entry(run_id.to_string()).or_default();
        let event = RunEvent {
            run_id: run_id.to_string(),
            seq: feed.len() as u64,
            kind,
            ts: Utc::now(),
            payload,
        };
        feed.push(event.clone());
        event
    }
}

#[derive(Default)]
pub struct MemoryRunStore {
    state: RwLock<StoreState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), EngineError> {
        self.state.write().await.create_run(run)
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<(), EngineError> {
        self.state
            .write()
            .await
            .runs
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn find_run_by_idempotency_key(
        &self,
        tenant: &str,
        key: &str,
    ) -> Result<Option<Run>, EngineError> {
        Ok(self.state.read().await.find_by_idempotency_key(tenant, key))
    }

    async fn save_step(&self, step: &Step) -> Result<(), EngineError> {
        self.state
            .write()
            .await
            .steps
            .entry(step.run_id.clone())
            .or_default()
            .insert(step.index, step.clone());
        Ok(())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, EngineError> {
        Ok(self
            .state
            .read()
            .await
            .steps
            .get(run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_approval(&self, approval: &Approval) -> Result<(), EngineError> {
        self.state
            .write()
            .await
            .approvals
            .insert(approval.id.clone(), approval.clone());
        Ok(())
    }

    async fn load_approval(&self, approval_id: &str) -> Result<Option<Approval>, EngineError> {
        Ok(self.state.read().await.approvals.get(approval_id).cloned())
    }

    async fn list_approvals(&self, run_id: &str) -> Result<Vec<Approval>, EngineError> {
        let mut approvals: Vec<Approval> = self
            .state
            .read()
            .await
            .approvals
            .values()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect();
        approvals.sort_by_key(|a| a.step_index);
        Ok(approvals)
    }

    async fn append_run_event(
        &self,
        run_id: &str,
        kind: RunEventKind,
        payload: Value,
    ) -> Result<RunEvent, EngineError> {
        Ok(self.state.write().await.append_event(run_id, kind, payload))
    }

    async fn list_run_events(
        &self,
        run_id: &str,
        from_seq: u64,
    ) -> Result<Vec<RunEvent>, EngineError> {
        Ok(self
            .state
            .read()
            .await
            .events
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_dedup(&self, record: &DedupRecord) -> Result<(), EngineError> {
        self.state
            .write()
            .await
            .dedup
            .insert(record.token.clone(), record.clone());
        Ok(())
    }

    async fn get_dedup(&self, token: &str) -> Result<Option<DedupRecord>, EngineError> {
        Ok(self.state.read().await.dedup.get(token).cloned())
    }
}

/// JSON-file-backed store: full state loaded at startup, flushed with an
/// atomic replace after every acknowledged write.
pub struct FileRunStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl FileRunStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, EngineError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let path = base.join("runstore.json");
        let state = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(err) => return Err(EngineError::Store(err.to_string())),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    async fn flush(&self, state: &StoreState) -> Result<(), EngineError> {
        let raw =
            serde_json::to_string(state).map_err(|err| EngineError::Store(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .await
            .map_err(|err| EngineError::Store(err.to_string()))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| EngineError::Store(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state.create_run(run)?;
        self.flush(&state).await
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state.runs.insert(run.id.clone(), run.clone());
        self.flush(&state).await
    }

    async fn find_run_by_idempotency_key(
        &self,
        tenant: &str,
        key: &str,
    ) -> Result<Option<Run>, EngineError> {
        Ok(self.state.read().await.find_by_idempotency_key(tenant, key))
    }

    async fn save_step(&self, step: &Step) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state
            .steps
            .entry(step.run_id.clone())
            .or_default()
            .insert(step.index, step.clone());
        self.flush(&state).await
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, EngineError> {
        Ok(self
            .state
            .read()
            .await
            .steps
            .get(run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_approval(&self, approval: &Approval) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state
            .approvals
            .insert(approval.id.clone(), approval.clone());
        self.flush(&state).await
    }

    async fn load_approval(&self, approval_id: &str) -> Result<Option<Approval>, EngineError> {
        Ok(self.state.read().await.approvals.get(approval_id).cloned())
    }

    async fn list_approvals(&self, run_id: &str) -> Result<Vec<Approval>, EngineError> {
        let mut approvals: Vec<Approval> = self
            .state
            .read()
            .await
            .approvals
            .values()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect();
        approvals.sort_by_key(|a| a.step_index);
        Ok(approvals)
    }

    async fn append_run_event(
        &self,
        run_id: &str,
        kind: RunEventKind,
        payload: Value,
    ) -> Result<RunEvent, EngineError> {
        let mut state = self.state.write().await;
        let event = state.append_event(run_id, kind, payload);
        self.flush(&state).await?;
        Ok(event)
    }

    async fn list_run_events(
        &self,
        run_id: &str,
        from_seq: u64,
    ) -> Result<Vec<RunEvent>, EngineError> {
        Ok(self
            .state
            .read()
            .await
            .events
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_dedup(&self, record: &DedupRecord) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state.dedup.insert(record.token.clone(), record.clone());
        self.flush(&state).await
    }

    async fn get_dedup(&self, token: &str) -> Result<Option<DedupRecord>, EngineError> {
        Ok(self.state.read().await.dedup.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{RunMetrics, RunMode, RunStatus, RunbookDoc, Subject};
    use serde_json::json;

    fn run(id: &str) -> Run {
        Run {
            id: id.to_string(),
            tenant: "acme".to_string(),
            caller: Subject::new("ada", &["Admin"]),
            runbook: RunbookDoc::parse("name: rb\nsteps: []\n").expect("runbook"),
            mode: RunMode::Execute,
            status: RunStatus::Pending,
            context: json!({}),
            created_at: Utc::now(),
            completed_at: None,
            metrics: RunMetrics::default(),
            policy_name: "base".to_string(),
            policy_version: "1".to_string(),
            policy_snapshot: json!({}),
            plan: None,
            shadow: None,
            error: None,
            idempotency_key: Some("key-1".to_string()),
        }
    }

    #[tokio::test]
    async fn duplicate_run_id_is_rejected() {
        let store = MemoryRunStore::new();
        store.create_run(&run("run-1")).await.expect("create");
        assert!(matches!(
            store.create_run(&run("run-1")).await,
            Err(EngineError::DuplicateRun(_))
        ));
    }

    #[tokio::test]
    async fn idempotency_key_lookup_is_tenant_scoped() {
        let store = MemoryRunStore::new();
        store.create_run(&run("run-1")).await.expect("create");
        assert!(store
            .find_run_by_idempotency_key("acme", "key-1")
            .await
            .expect("lookup")
            .is_some());
        assert!(store
            .find_run_by_idempotency_key("umbrella", "key-1")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn event_feed_assigns_dense_cursors() {
        let store = MemoryRunStore::new();
        for _ in 0..3 {
            store
                .append_run_event("run-1", RunEventKind::StepStarted, json!({}))
                .await
                .expect("append");
        }
        let all = store.list_run_events("run-1", 0).await.expect("list");
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        let tail = store.list_run_events("run-1", 2).await.expect("list");
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FileRunStore::new(dir.path()).await.expect("open");
            store.create_run(&run("run-1")).await.expect("create");
            let mut step = Step::new("run-1", 0, "a");
            step.tool = Some("tracker.create_issue".to_string());
            store.save_step(&step).await.expect("save step");
        }
        let store = FileRunStore::new(dir.path()).await.expect("reopen");
        assert!(store.load_run("run-1").await.expect("load").is_some());
        let steps = store.list_steps("run-1").await.expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tool.as_deref(), Some("tracker.create_issue"));
    }
}
