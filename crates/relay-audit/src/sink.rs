use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use relay_types::EngineError;

use crate::event::AuditEvent;

/// Durable backing for a tenant chain. Append order is the log's concern;
/// a sink only persists what it is handed.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), EngineError>;
    async fn load(&self, tenant: &str) -> Result<Vec<AuditEvent>, EngineError>;
}

#[derive(Default)]
pub struct MemorySink {
    events: RwLock<HashMap<String, Vec<AuditEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, event: &AuditEvent) -> Result<(), EngineError> {
        self.events
            .write()
            .await
            .entry(event.tenant.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load(&self, tenant: &str) -> Result<Vec<AuditEvent>, EngineError> {
        Ok(self
            .events
            .read()
            .await
            .get(tenant)
            .cloned()
            .unwrap_or_default())
    }
}

/// One JSONL file per tenant under `dir`. Events are appended as single
/// lines; a partial trailing line from a crash is skipped on load.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, tenant: &str) -> PathBuf {
        let safe: String = tenant
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.audit.jsonl"))
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), EngineError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| EngineError::Audit(err.to_string()))?;
        let mut line =
            serde_json::to_string(event).map_err(|err| EngineError::Audit(err.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&event.tenant))
            .await
            .map_err(|err| EngineError::Audit(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| EngineError::Audit(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| EngineError::Audit(err.to_string()))?;
        Ok(())
    }

    async fn load(&self, tenant: &str) -> Result<Vec<AuditEvent>, EngineError> {
        let path = self.path_for(tenant);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(EngineError::Audit(err.to_string())),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        Ok(events)
    }
}
