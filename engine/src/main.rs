use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use relay_adapters::sim::{sim_registry, SimWorld};
use relay_agents::{LlmPlanner, LlmReviewer, LlmToolcaller, ProviderRegistry};
use relay_audit::{AuditLog, FileSink, Redactor};
use relay_core::{
    AgentSet, Engine, EngineConfig, EnvOverrides, ExecutorConfig, FileRunStore, SubmitRunRequest,
};
use relay_observability::{default_telemetry, init_process_logging, ProcessKind};
use relay_policy::PolicyDocument;
use relay_types::{RunMode, RunbookDoc, Subject};

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "Headless runbook automation engine")]
struct Cli {
    #[arg(long, env = "RELAY_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Long-lived process: watch a spool directory for submission documents.
    Serve {
        #[arg(long)]
        spool: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        poll_seconds: u64,
        /// Policy document activated for tenants that have none yet.
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Submit one runbook and follow it to a terminal status.
    Submit {
        runbook: PathBuf,
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long, default_value = "execute")]
        mode: String,
        #[arg(long, default_value = "operator")]
        caller: String,
        #[arg(long, value_delimiter = ',', default_value = "Admin")]
        roles: Vec<String>,
        /// JSON object merged into the run context.
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        policy: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct SubmissionDoc {
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    caller: Option<CallerDoc>,
    #[serde(default)]
    context: Value,
    runbook: RunbookDoc,
}

#[derive(Debug, Deserialize)]
struct CallerDoc {
    id: String,
    #[serde(default)]
    roles: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let config = load_config(cli.config.as_deref(), &state_dir).await?;

    let logs_dir = config
        .logs_dir
        .clone()
        .unwrap_or_else(|| state_dir.join("logs"));
    let (_guard, log_info) =
        init_process_logging(ProcessKind::Engine, &logs_dir, config.log_retention_days)?;
    info!(logs_dir = %log_info.logs_dir, "relay-engine starting");

    let engine = build_engine(&state_dir, &config).await?;

    match cli.command {
        Command::Serve {
            spool,
            poll_seconds,
            policy,
        } => {
            let fallback_policy = match policy {
                Some(path) => Some(load_policy(&path).await?),
                None => None,
            };
            let spool = spool.unwrap_or_else(|| state_dir.join("spool"));
            fs::create_dir_all(&spool).await?;
            info!(spool = %spool.display(), "watching spool directory");
            serve_spool(engine, spool, poll_seconds, fallback_policy).await
        }
        Command::Submit {
            runbook,
            tenant,
            mode,
            caller,
            roles,
            context,
            policy,
        } => {
            let policy = load_policy(&policy).await?;
            engine.policy_store().activate(&tenant, policy).await?;

            let raw = fs::read_to_string(&runbook)
                .await
                .with_context(|| format!("failed to read {}", runbook.display()))?;
            let runbook = RunbookDoc::parse(&raw)?;
            let context = match context {
                Some(raw) => serde_json::from_str(&raw).context("invalid --context JSON")?,
                None => Value::Object(Default::default()),
            };
            let role_refs: Vec<&str> = roles.iter().map(String::as_str).collect();

            let run_id = engine
                .submit_run(SubmitRunRequest {
                    tenant,
                    runbook,
                    mode: parse_mode(&mode)?,
                    context,
                    caller: Subject::new(caller, &role_refs),
                    idempotency_key: None,
                })
                .await?;
            let run = engine.run_to_completion(&run_id).await?;
            let view = engine.get_run(&run.id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
    }
}

async fn serve_spool(
    engine: Engine,
    spool: PathBuf,
    poll_seconds: u64,
    fallback_policy: Option<PolicyDocument>,
) -> anyhow::Result<()> {
    let mut in_flight: Vec<(PathBuf, tokio::task::JoinHandle<()>)> = Vec::new();
    loop {
        in_flight.retain(|(_, handle)| !handle.is_finished());

        let mut entries = fs::read_dir(&spool).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|v| v.to_str()) else {
                continue;
            };
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            if in_flight.iter().any(|(p, _)| p == &path) {
                continue;
            }
            match submit_spool_file(&engine, &path, fallback_policy.as_ref()).await {
                Ok(run_id) => {
                    let handle = follow_run(engine.clone(), path.clone(), run_id);
                    in_flight.push((path, handle));
                }
                Err(err) => {
                    error!(file = %path.display(), "rejected submission: {err:#}");
                    let _ = fs::rename(&path, path.with_extension("rejected")).await;
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(poll_seconds.max(1))).await;
    }
}

async fn submit_spool_file(
    engine: &Engine,
    path: &Path,
    fallback_policy: Option<&PolicyDocument>,
) -> anyhow::Result<String> {
    let raw = fs::read_to_string(path).await?;
    let doc: SubmissionDoc = serde_yaml::from_str(&raw).context("malformed submission")?;
    let tenant = doc.tenant.unwrap_or_else(|| "default".to_string());

    if engine.policy_store().active(&tenant).await.is_none() {
        let Some(policy) = fallback_policy else {
            anyhow::bail!("no active policy for tenant `{tenant}` and no --policy fallback");
        };
        engine
            .policy_store()
            .activate(&tenant, policy.clone())
            .await?;
    }

    let caller = doc
        .caller
        .map(|c| Subject {
            id: c.id,
            roles: c.roles,
        })
        .unwrap_or_else(|| Subject::new("spool", &["Admin"]));
    let mode = parse_mode(doc.mode.as_deref().unwrap_or("execute"))?;

    let run_id = engine
        .submit_run(SubmitRunRequest {
            tenant,
            runbook: doc.runbook,
            mode,
            context: doc.context,
            caller,
            idempotency_key: path.file_name().and_then(|n| n.to_str()).map(String::from),
        })
        .await?;
    info!(file = %path.display(), run_id, "spool submission accepted");
    Ok(run_id)
}

fn follow_run(engine: Engine, path: PathBuf, run_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = engine.run_to_completion(&run_id).await;
        match result {
            Ok(run) => {
                info!(run_id, status = ?run.status, "run finished");
                if let Ok(view) = engine.get_run(&run_id).await {
                    let summary = serde_json::to_string_pretty(&view).unwrap_or_default();
                    let _ = fs::write(path.with_extension("result.json"), summary).await;
                }
                let _ = fs::rename(&path, path.with_extension("done")).await;
            }
            Err(err) => {
                error!(run_id, "run aborted: {err}");
                let _ = fs::rename(&path, path.with_extension("aborted")).await;
            }
        }
    })
}

async fn build_engine(state_dir: &Path, config: &EngineConfig) -> anyhow::Result<Engine> {
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(|| state_dir.to_path_buf());
    let store = Arc::new(FileRunStore::new(data_dir.join("store")).await?);
    let salt = load_or_create_salt(&data_dir, config.redaction_salt.clone()).await?;
    let redactor = Redactor::new(salt);
    let audit = Arc::new(AuditLog::new(
        Arc::new(FileSink::new(data_dir.join("audit"))),
        redactor.clone(),
    ));

    let world = SimWorld::new();
    let adapters = sim_registry(world)?;

    let (agents, executor_config) = if config.llm_agents {
        let providers = ProviderRegistry::new(config.agents.clone());
        let agents = AgentSet {
            planner: Arc::new(LlmPlanner::new(providers.clone())),
            toolcaller: Arc::new(LlmToolcaller::new(providers.clone())),
            reviewer: Arc::new(LlmReviewer::new(providers)),
        };
        let executor_config = ExecutorConfig {
            step_token_estimate: 8_000,
            step_cost_estimate_usd: 0.05,
            ..ExecutorConfig::default()
        };
        (agents, executor_config)
    } else {
        (AgentSet::stub(), ExecutorConfig::default())
    };

    let env = EnvOverrides::from_env();
    if env.dry_run_forced {
        warn!("DRY_RUN_FORCED is set: execute runs will be downgraded to dry-run");
    }

    Ok(Engine::new(
        store,
        audit,
        redactor,
        adapters,
        relay_policy::PolicyStore::new(),
        agents,
        default_telemetry(),
        executor_config,
        env,
    ))
}

async fn load_config(flag: Option<&Path>, state_dir: &Path) -> anyhow::Result<EngineConfig> {
    let path = flag
        .map(Path::to_path_buf)
        .unwrap_or_else(|| state_dir.join("config.yaml"));
    match fs::read_to_string(&path).await {
        Ok(raw) => EngineConfig::parse(&raw)
            .with_context(|| format!("invalid config {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn load_policy(path: &Path) -> anyhow::Result<PolicyDocument> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(PolicyDocument::parse(&raw)?)
}

/// The audit salt must survive restarts or redaction markers stop being
/// comparable across the chain.
async fn load_or_create_salt(
    data_dir: &Path,
    configured: Option<String>,
) -> anyhow::Result<String> {
    if let Some(salt) = configured {
        return Ok(salt);
    }
    let path = data_dir.join("redaction-salt");
    match fs::read_to_string(&path).await {
        Ok(salt) if !salt.trim().is_empty() => Ok(salt.trim().to_string()),
        _ => {
            fs::create_dir_all(data_dir).await?;
            let salt = Uuid::new_v4().to_string();
            fs::write(&path, &salt).await?;
            Ok(salt)
        }
    }
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    PathBuf::from(".relay")
}

fn parse_mode(raw: &str) -> anyhow::Result<RunMode> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "execute" => Ok(RunMode::Execute),
        "dry_run" => Ok(RunMode::DryRun),
        "shadow" => Ok(RunMode::Shadow),
        other => anyhow::bail!("unknown mode `{other}`; expected execute, dry-run, or shadow"),
    }
}
