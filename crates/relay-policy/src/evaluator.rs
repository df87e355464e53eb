use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use relay_adapters::{AdapterRegistry, ToolClass};
use relay_types::{RunMetrics, Subject};

use crate::document::{PolicyDocument, Predicate, PredicateOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    RequireApproval,
}

impl PolicyAction {
    fn rank(self) -> u8 {
        match self {
            PolicyAction::Allow => 0,
            PolicyAction::RequireApproval => 1,
            PolicyAction::Block => 2,
        }
    }

    /// Blocks beat approvals; approvals beat allows.
    pub fn strictest(self, other: PolicyAction) -> PolicyAction {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reasons: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            reasons: Vec::new(),
        }
    }
}

/// Action taken for tools no policy rule mentions at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultAction {
    #[default]
    Block,
    Allow,
}

impl DefaultAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "block" => Some(DefaultAction::Block),
            "allow" => Some(DefaultAction::Allow),
            _ => None,
        }
    }
}

/// Bounded upper estimate of what the step under review may consume, used
/// for budget gating before the spend happens.
#[derive(Debug, Clone, Default)]
pub struct StepEstimate {
    pub tokens: u64,
    pub cost_usd: f64,
    pub wall_ms: u64,
}

#[derive(Debug)]
pub struct EvalRequest<'a> {
    pub subject: &'a Subject,
    pub tool: &'a str,
    pub args: &'a Value,
    pub run_context: &'a Value,
    pub totals: &'a RunMetrics,
    pub estimate: &'a StepEstimate,
}

/// Deterministic decision procedure. All rules fire and accumulate reasons in
/// order; the strictest fired action wins.
pub fn evaluate(
    policy: &PolicyDocument,
    registry: &AdapterRegistry,
    req: &EvalRequest<'_>,
    default_action: DefaultAction,
) -> PolicyDecision {
    let mut action = PolicyAction::Allow;
    let mut reasons = Vec::new();

    // 1. Role allowlist.
    if !policy.allowed_for_roles(&req.subject.roles, req.tool) {
        let unknown_everywhere = !policy.mentions_tool(req.tool);
        if !(unknown_everywhere && default_action == DefaultAction::Allow) {
            action = action.strictest(PolicyAction::Block);
            reasons.push("tool_not_allowed".to_string());
        }
    }

    // 2. Adapter schema.
    if let Some(pointer) = registry.first_schema_violation(req.tool, req.args) {
        action = action.strictest(PolicyAction::Block);
        let pointer = if pointer.is_empty() {
            "/".to_string()
        } else {
            pointer
        };
        reasons.push(format!("schema_violation:{pointer}"));
    }

    // 3. Preconditions.
    for pre in &policy.preconditions {
        if !predicate_holds(&pre.expression, req.run_context, req.args) {
            action = action.strictest(PolicyAction::Block);
            reasons.push(format!("precondition_failed:{}", pre.name));
        }
    }

    // 4. Budget caps against running totals plus this step's upper estimate.
    if let Some(cap) = policy.budgets.max_cost_per_run_usd {
        if req.totals.cost_usd + req.estimate.cost_usd > cap {
            action = action.strictest(PolicyAction::Block);
            reasons.push("budget_exceeded:cost_usd".to_string());
        }
    }
    if let Some(cap) = policy.budgets.max_tokens_per_run {
        if req.totals.tokens_in + req.totals.tokens_out + req.estimate.tokens > cap {
            action = action.strictest(PolicyAction::Block);
            reasons.push("budget_exceeded:tokens".to_string());
        }
    }
    if let Some(cap) = policy.budgets.max_wall_ms_per_run {
        if req.totals.wall_ms + req.estimate.wall_ms > cap {
            action = action.strictest(PolicyAction::Block);
            reasons.push("budget_exceeded:wall_ms".to_string());
        }
    }

    // 5. Destructive classification or a sensitive-tool approval rule.
    let destructive = registry
        .spec(req.tool)
        .map(|spec| spec.classification == ToolClass::Destructive)
        .unwrap_or(false);
    if destructive {
        action = action.strictest(PolicyAction::RequireApproval);
        reasons.push("approval_required:destructive".to_string());
    }
    if let Some(rule) = policy.approval_rule_for(req.tool) {
        action = action.strictest(PolicyAction::RequireApproval);
        reasons.push(format!("approval_required:{}", rule.tool_glob));
    }

    debug!(
        tool = req.tool,
        subject = %req.subject.id,
        ?action,
        reasons = reasons.len(),
        "policy evaluated"
    );
    PolicyDecision { action, reasons }
}

fn predicate_holds(pred: &Predicate, context: &Value, args: &Value) -> bool {
    let actual = resolve_path(&pred.path, context, args);
    match pred.op {
        PredicateOp::Eq => actual == Some(&pred.value),
        PredicateOp::Ne => actual != Some(&pred.value),
        PredicateOp::In => match (&pred.value, actual) {
            (Value::Array(set), Some(actual)) => set.contains(actual),
            _ => false,
        },
        PredicateOp::NotIn => match (&pred.value, actual) {
            (Value::Array(set), Some(actual)) => !set.contains(actual),
            (Value::Array(_), None) => true,
            _ => false,
        },
        PredicateOp::Matches => match (actual.and_then(|v| v.as_str()), pred.value.as_str()) {
            (Some(actual), Some(pattern)) => Regex::new(pattern)
                .map(|re| re.is_match(actual))
                .unwrap_or(false),
            _ => false,
        },
        PredicateOp::Lt | PredicateOp::Le | PredicateOp::Gt | PredicateOp::Ge => {
            let (Some(actual), Some(expected)) =
                (actual.and_then(Value::as_f64), pred.value.as_f64())
            else {
                return false;
            };
            match pred.op {
                PredicateOp::Lt => actual < expected,
                PredicateOp::Le => actual <= expected,
                PredicateOp::Gt => actual > expected,
                PredicateOp::Ge => actual >= expected,
                _ => unreachable!(),
            }
        }
    }
}

fn resolve_path<'a>(path: &str, context: &'a Value, args: &'a Value) -> Option<&'a Value> {
    let (root, rest) = path.split_once('.')?;
    let mut current = match root {
        "context" => context,
        "args" => args,
        _ => return None,
    };
    for segment in rest.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_adapters::sim::{sim_registry, SimWorld};
    use serde_json::json;

    fn policy(raw: &str) -> PolicyDocument {
        PolicyDocument::parse(raw).expect("valid policy")
    }

    fn base_policy() -> PolicyDocument {
        policy(
            r#"
name: base
version: "1"
roles: [Admin, Viewer]
tool_allowlist:
  Admin: ["tracker.*", "cluster.*", "pager.*"]
  Viewer: ["tracker.read_issue"]
budgets:
  max_cost_per_run_usd: 1.0
  max_tokens_per_run: 1000
preconditions:
  - name: staging_only
    expression: {path: "context.env", op: eq, value: staging}
"#,
        )
    }

    fn registry() -> AdapterRegistry {
        sim_registry(SimWorld::new()).expect("registry")
    }

    fn eval(
        policy: &PolicyDocument,
        registry: &AdapterRegistry,
        subject: &Subject,
        tool: &str,
        args: Value,
        context: Value,
        totals: RunMetrics,
    ) -> PolicyDecision {
        evaluate(
            policy,
            registry,
            &EvalRequest {
                subject,
                tool,
                args: &args,
                run_context: &context,
                totals: &totals,
                estimate: &StepEstimate::default(),
            },
            DefaultAction::Block,
        )
    }

    #[test]
    fn admin_write_is_allowed() {
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("ada", &["Admin"]),
            "tracker.create_issue",
            json!({"title": "X"}),
            json!({"env": "staging"}),
            RunMetrics::default(),
        );
        assert_eq!(decision.action, PolicyAction::Allow);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn viewer_write_blocks_on_allowlist() {
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("vic", &["Viewer"]),
            "tracker.create_issue",
            json!({"title": "X"}),
            json!({"env": "staging"}),
            RunMetrics::default(),
        );
        assert_eq!(decision.action, PolicyAction::Block);
        assert_eq!(decision.reasons[0], "tool_not_allowed");
    }

    #[test]
    fn schema_violation_carries_pointer() {
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("ada", &["Admin"]),
            "tracker.create_issue",
            json!({"title": 42}),
            json!({"env": "staging"}),
            RunMetrics::default(),
        );
        assert_eq!(decision.action, PolicyAction::Block);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r.starts_with("schema_violation:") && r.contains("/title")));
    }

    #[test]
    fn failed_precondition_blocks_with_name() {
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("ada", &["Admin"]),
            "tracker.create_issue",
            json!({"title": "X"}),
            json!({"env": "prod"}),
            RunMetrics::default(),
        );
        assert_eq!(decision.action, PolicyAction::Block);
        assert!(decision
            .reasons
            .contains(&"precondition_failed:staging_only".to_string()));
    }

    #[test]
    fn budget_cap_blocks_per_metric() {
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("ada", &["Admin"]),
            "tracker.create_issue",
            json!({"title": "X"}),
            json!({"env": "staging"}),
            RunMetrics {
                tokens_in: 600,
                tokens_out: 500,
                cost_usd: 0.2,
                wall_ms: 10,
            },
        );
        assert_eq!(decision.action, PolicyAction::Block);
        assert!(decision
            .reasons
            .contains(&"budget_exceeded:tokens".to_string()));
        assert!(!decision
            .reasons
            .contains(&"budget_exceeded:cost_usd".to_string()));
    }

    #[test]
    fn destructive_tool_requires_approval() {
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("ada", &["Admin"]),
            "cluster.restart_service",
            json!({"service": "checkout"}),
            json!({"env": "staging"}),
            RunMetrics::default(),
        );
        assert_eq!(decision.action, PolicyAction::RequireApproval);
        assert_eq!(decision.reasons, vec!["approval_required:destructive"]);
    }

    #[test]
    fn block_beats_approval() {
        // Viewer asking for a destructive tool: both rules fire, block wins,
        // both reasons are kept in firing order.
        let decision = eval(
            &base_policy(),
            &registry(),
            &Subject::new("vic", &["Viewer"]),
            "cluster.restart_service",
            json!({"service": "checkout"}),
            json!({"env": "staging"}),
            RunMetrics::default(),
        );
        assert_eq!(decision.action, PolicyAction::Block);
        assert_eq!(decision.reasons[0], "tool_not_allowed");
        assert!(decision
            .reasons
            .contains(&"approval_required:destructive".to_string()));
    }

    #[test]
    fn unknown_tool_honors_default_action() {
        let doc = base_policy();
        let registry = registry();
        let subject = Subject::new("ada", &["Admin"]);
        let args = json!({});
        let context = json!({"env": "staging"});
        let totals = RunMetrics::default();
        let req = EvalRequest {
            subject: &subject,
            tool: "mailer.send",
            args: &args,
            run_context: &context,
            totals: &totals,
            estimate: &StepEstimate::default(),
        };
        let blocked = evaluate(&doc, &registry, &req, DefaultAction::Block);
        assert_eq!(blocked.action, PolicyAction::Block);
        let allowed = evaluate(&doc, &registry, &req, DefaultAction::Allow);
        assert_eq!(allowed.action, PolicyAction::Allow);
    }

    #[test]
    fn numeric_and_set_predicates() {
        let context = json!({"replicas": 3, "region": "eu-1"});
        let args = json!({});
        let holds = |path: &str, op: PredicateOp, value: Value| {
            predicate_holds(
                &Predicate {
                    path: path.to_string(),
                    op,
                    value,
                },
                &context,
                &args,
            )
        };
        assert!(holds("context.replicas", PredicateOp::Le, json!(3)));
        assert!(!holds("context.replicas", PredicateOp::Gt, json!(3)));
        assert!(holds(
            "context.region",
            PredicateOp::In,
            json!(["eu-1", "eu-2"])
        ));
        assert!(holds(
            "context.region",
            PredicateOp::Matches,
            json!("^eu-")
        ));
        assert!(holds("context.missing", PredicateOp::NotIn, json!(["x"])));
    }
}
