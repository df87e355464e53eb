//! Shadow comparator: scores an agent-produced step list against a reference
//! list. Pure scoring; it never calls adapters.

use serde_json::Value;

use relay_types::{PlannedStep, ShadowReport};

pub fn score(agent: &[PlannedStep], reference: &[PlannedStep]) -> ShadowReport {
    let ref_len = reference.len().max(1);
    let agent_len = agent.len().max(1);

    let matched = reference
        .iter()
        .enumerate()
        .filter(|(i, r)| {
            agent.get(*i).is_some_and(|a| {
                a.tool.is_some() && a.tool == r.tool && args_subset(&r.args, &a.args)
            })
        })
        .count();

    let missing = reference
        .iter()
        .filter(|r| !agent.iter().any(|a| a.tool.is_some() && a.tool == r.tool))
        .count();

    let hallucinated = agent
        .iter()
        .filter(|a| !reference.iter().any(|r| r.tool.is_some() && r.tool == a.tool))
        .count();

    ShadowReport {
        match_rate: matched as f64 / ref_len as f64,
        missing_rate: missing as f64 / ref_len as f64,
        hallucination_rate: hallucinated as f64 / agent_len as f64,
        agent_steps: agent.len(),
        reference_steps: reference.len(),
    }
}

/// Every expected key must exist in actual with an equal value; strings may
/// instead template-match.
pub fn args_subset(expected: &Value, actual: &Value) -> bool {
    let (Some(expected), Some(actual)) = (expected.as_object(), actual.as_object()) else {
        // A non-object expectation degenerates to equality.
        return expected == actual;
    };
    expected.iter().all(|(key, want)| match actual.get(key) {
        Some(have) => match (want.as_str(), have.as_str()) {
            (Some(want), Some(have)) => template_matches(want, have),
            _ => want == have,
        },
        None => false,
    })
}

/// Literal equality, or template matching when the expected string carries
/// `{placeholder}` segments: literals around placeholders must appear in
/// order, anchored at both ends.
fn template_matches(expected: &str, actual: &str) -> bool {
    if !expected.contains('{') {
        return expected == actual;
    }
    let mut literals = Vec::new();
    let mut rest = expected;
    loop {
        match rest.find('{') {
            Some(open) => {
                literals.push(&rest[..open]);
                match rest[open..].find('}') {
                    Some(close) => rest = &rest[open + close + 1..],
                    None => return expected == actual,
                }
            }
            None => {
                literals.push(rest);
                break;
            }
        }
    }

    let mut remaining = actual;
    for (i, literal) in literals.iter().enumerate() {
        if literal.is_empty() {
            continue;
        }
        match remaining.find(literal) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                remaining = &remaining[pos + literal.len()..];
            }
            None => return false,
        }
    }
    if let Some(last) = literals.last() {
        if !last.is_empty() && !actual.ends_with(last) {
            return false;
        }
    }
    true
}
