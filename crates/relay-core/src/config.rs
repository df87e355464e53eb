use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use relay_agents::AgentsConfig;
use relay_policy::DefaultAction;

/// Inputs the core consumes from the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOverrides {
    /// `POLICY_DEFAULT_ACTION`: what happens to tools unknown to any policy
    /// rule. Defaults to block.
    pub default_action: DefaultAction,
    /// `DRY_RUN_FORCED`: silently downgrade every execute run to dry-run.
    /// Downgrades are audit-logged.
    pub dry_run_forced: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let default_action = std::env::var("POLICY_DEFAULT_ACTION")
            .ok()
            .and_then(|raw| DefaultAction::parse(&raw))
            .unwrap_or_default();
        let dry_run_forced = std::env::var("DRY_RUN_FORCED")
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            default_action,
            dry_run_forced,
        }
    }
}

/// Tunables for the run executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per adapter call; only transient/timeout failures retry.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Upper estimates for one step's LLM spend, fed to budget gating.
    /// Zero when every agent role runs in stub mode.
    pub step_token_estimate: u64,
    pub step_cost_estimate_usd: f64,
    pub lease_ttl_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 10_000,
            step_token_estimate: 0,
            step_cost_estimate_usd: 0.0,
            lease_ttl_ms: 30_000,
        }
    }
}

/// Engine-level configuration loaded by the long-lived binary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub log_retention_days: u64,
    /// Salt for audit redaction markers; generated once per deployment.
    #[serde(default)]
    pub redaction_salt: Option<String>,
    #[serde(default)]
    pub agents: AgentsConfig,
    /// Run the planner/toolcaller/reviewer in LLM mode instead of stub mode.
    #[serde(default)]
    pub llm_agents: bool,
}

fn default_retention_days() -> u64 {
    14
}

impl EngineConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config = EngineConfig::parse("{}").expect("empty config");
        assert_eq!(config.log_retention_days, 14);
        assert!(!config.llm_agents);
        let config = EngineConfig::parse("data_dir: /var/lib/relay\nllm_agents: true\n")
            .expect("config");
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/relay")));
        assert!(config.llm_agents);
    }
}
