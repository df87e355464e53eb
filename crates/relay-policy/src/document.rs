use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::EngineError;

/// Named, versioned policy document. Exactly one version is active per tenant
/// at any instant; runs capture a full copy at submit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// role -> tool-glob patterns. `*` is allowed in the trailing segment only.
    #[serde(default)]
    pub tool_allowlist: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub budgets: Budgets,
    #[serde(default)]
    pub approval_rules: Vec<ApprovalRule>,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default)]
    pub block_behavior: BlockBehavior,
    #[serde(default)]
    pub approval: ApprovalSettings,
    /// Permit retrying a step whose prior outcome could not be reconciled
    /// after a crash.
    #[serde(default)]
    pub retry_unknown_outcomes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockBehavior {
    #[default]
    FailFast,
    SkipStep,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Budgets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_run_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_run: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wall_ms_per_run: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub tool_glob: String,
    /// Roles allowed to decide the approval. Empty means any subject.
    #[serde(default)]
    pub requires_roles: Vec<String>,
    #[serde(default = "default_quorum")]
    pub quorum: u32,
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: u64,
}

fn default_quorum() -> u32 {
    1
}

fn default_expiry_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    /// Four-eyes rule: the decider must be a distinct subject from the caller.
    #[serde(default = "default_true")]
    pub four_eyes: bool,
    #[serde(default = "default_expiry_seconds")]
    pub default_expiry_seconds: u64,
}

fn default_true() -> bool {
    true
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            four_eyes: true,
            default_expiry_seconds: default_expiry_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precondition {
    pub name: String,
    pub expression: Predicate,
}

/// Declarative predicate over `run.context` and step args. `path` is dotted
/// and rooted at `context.` or `args.`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub path: String,
    pub op: PredicateOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    In,
    NotIn,
    Matches,
    Lt,
    Le,
    Gt,
    Ge,
}

impl PolicyDocument {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let doc: PolicyDocument = serde_yaml::from_str(raw)
            .map_err(|err| EngineError::Validation(format!("malformed policy: {err}")))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn from_snapshot(snapshot: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(snapshot.clone())
            .map_err(|err| EngineError::Validation(format!("malformed policy snapshot: {err}")))
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(EngineError::Validation(
                "policy requires name and version".to_string(),
            ));
        }
        for (role, globs) in &self.tool_allowlist {
            if !self.roles.contains(role) {
                return Err(EngineError::Validation(format!(
                    "allowlist references undeclared role `{role}`"
                )));
            }
            for glob in globs {
                if !is_valid_tool_glob(glob) {
                    return Err(EngineError::Validation(format!(
                        "invalid tool glob `{glob}` for role `{role}`"
                    )));
                }
            }
        }
        for rule in &self.approval_rules {
            if !is_valid_tool_glob(&rule.tool_glob) {
                return Err(EngineError::Validation(format!(
                    "invalid approval tool glob `{}`",
                    rule.tool_glob
                )));
            }
            if rule.quorum != 1 {
                return Err(EngineError::Validation(format!(
                    "approval quorum {} unsupported; exactly one decider is required",
                    rule.quorum
                )));
            }
            if rule.expiry_seconds == 0 {
                return Err(EngineError::Validation(
                    "approval expiry_seconds must be positive".to_string(),
                ));
            }
        }
        for pre in &self.preconditions {
            let root_ok =
                pre.expression.path.starts_with("context.") || pre.expression.path.starts_with("args.");
            if !root_ok {
                return Err(EngineError::Validation(format!(
                    "precondition `{}` path must be rooted at context. or args.",
                    pre.name
                )));
            }
        }
        Ok(())
    }

    /// Every glob any role carries, plus approval-rule globs: the set of
    /// tools this policy knows about at all.
    pub fn mentions_tool(&self, tool: &str) -> bool {
        self.tool_allowlist
            .values()
            .flatten()
            .chain(self.approval_rules.iter().map(|r| &r.tool_glob))
            .any(|glob| tool_glob_matches(glob, tool))
    }

    pub fn allowed_for_roles(&self, roles: &[String], tool: &str) -> bool {
        roles
            .iter()
            .filter_map(|role| self.tool_allowlist.get(role))
            .flatten()
            .any(|glob| tool_glob_matches(glob, tool))
    }

    pub fn approval_rule_for(&self, tool: &str) -> Option<&ApprovalRule> {
        self.approval_rules
            .iter()
            .find(|rule| tool_glob_matches(&rule.tool_glob, tool))
    }
}

/// `*` alone, or a dotted id whose trailing segment may be `*`.
pub fn is_valid_tool_glob(glob: &str) -> bool {
    if glob == "*" {
        return true;
    }
    let segments: Vec<&str> = glob.split('.').collect();
    if segments.len() < 2 {
        return false;
    }
    segments.iter().enumerate().all(|(i, seg)| {
        if *seg == "*" {
            return i == segments.len() - 1;
        }
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    })
}

pub fn tool_glob_matches(glob: &str, tool: &str) -> bool {
    if glob == "*" {
        return true;
    }
    if let Some(prefix) = glob.strip_suffix(".*") {
        return tool
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    glob == tool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_shapes() {
        assert!(is_valid_tool_glob("*"));
        assert!(is_valid_tool_glob("tracker.*"));
        assert!(is_valid_tool_glob("tracker.create_issue"));
        assert!(!is_valid_tool_glob("tracker"));
        assert!(!is_valid_tool_glob("*.create_issue"));
        assert!(!is_valid_tool_glob("tracker.*.close"));
    }

    #[test]
    fn trailing_wildcard_matches_whole_suffix() {
        assert!(tool_glob_matches("tracker.*", "tracker.create_issue"));
        assert!(tool_glob_matches("tracker.*", "tracker.issue.close"));
        assert!(!tool_glob_matches("tracker.*", "trackers.create_issue"));
        assert!(!tool_glob_matches("tracker.*", "tracker"));
        assert!(tool_glob_matches("*", "anything.at_all"));
        assert!(tool_glob_matches("pager.page", "pager.page"));
        assert!(!tool_glob_matches("pager.page", "pager.ack"));
    }

    #[test]
    fn parse_rejects_undeclared_role() {
        let raw = r#"
name: base
version: "1"
roles: [Admin]
tool_allowlist:
  Viewer: ["tracker.*"]
"#;
        assert!(PolicyDocument::parse(raw).is_err());
    }

    #[test]
    fn parse_rejects_multi_decider_quorum() {
        let raw = r#"
name: base
version: "1"
roles: [Admin]
approval_rules:
  - tool_glob: "cluster.*"
    quorum: 2
"#;
        assert!(PolicyDocument::parse(raw).is_err());
    }

    #[test]
    fn snapshot_round_trips() {
        let raw = r#"
name: base
version: "7"
roles: [Admin, Viewer]
tool_allowlist:
  Admin: ["*"]
  Viewer: ["tracker.read_issue"]
budgets:
  max_cost_per_run_usd: 2.5
"#;
        let doc = PolicyDocument::parse(raw).expect("valid policy");
        let restored = PolicyDocument::from_snapshot(&doc.snapshot()).expect("round trip");
        assert_eq!(restored.version, "7");
        assert_eq!(restored.budgets.max_cost_per_run_usd, Some(2.5));
    }
}
