use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use braid_core::types::SessionState;

/// Where an edge leads: another node, or the end of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    End,
}

/// Shorthand for [`Target::End`].
pub const END: Target = Target::End;

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Node(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self::Node(name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(name) => f.write_str(name),
            Self::End => f.write_str("END"),
        }
    }
}

pub type Predicate = Arc<dyn Fn(&SessionState) -> bool + Send + Sync>;

/// A routing predicate evaluated against the state after a node's delta.
#[derive(Clone)]
pub enum Condition {
    /// A scratch key is set to something other than null or an empty array.
    ScratchPresent(String),
    /// A simple expression over scratch values, see [`evaluate_condition`].
    Expr(String),
    /// Arbitrary predicate. Shows up as `custom` in the topology.
    Custom(Predicate),
}

impl Condition {
    pub fn scratch_present(key: impl Into<String>) -> Self {
        Self::ScratchPresent(key.into())
    }

    pub fn expr(expr: impl Into<String>) -> Self {
        Self::Expr(expr.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&SessionState) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn evaluate(&self, state: &SessionState) -> bool {
        match self {
            Self::ScratchPresent(key) => match state.scratch.get(key) {
                None | Some(serde_json::Value::Null) => false,
                Some(serde_json::Value::Array(items)) => !items.is_empty(),
                Some(_) => true,
            },
            Self::Expr(expr) => evaluate_condition(expr, &state.scratch),
            Self::Custom(predicate) => predicate(state),
        }
    }

    /// Human-readable form used when serializing a graph.
    pub fn describe(&self) -> String {
        match self {
            Self::ScratchPresent(key) => format!("{} exists", key),
            Self::Expr(expr) => expr.clone(),
            Self::Custom(_) => "custom".to_string(),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.describe())
    }
}

/// The outgoing routing rule of one node.
#[derive(Debug, Clone)]
pub enum Edge {
    Static(Target),
    Conditional {
        branches: Vec<(Condition, Target)>,
        default: Option<Target>,
    },
}

/// Evaluate a simple conditional expression against scratch data.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
/// - `key exists`: key is present and not null
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, scratch: &BTreeMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    if let Some(key) = expr.strip_suffix(" exists") {
        return scratch.get(key.trim()).is_some_and(|v| !v.is_null());
    }

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return scratch
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return scratch
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return scratch
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_condition_equals() {
        let s = scratch(&[("status", serde_json::json!("success"))]);
        assert!(evaluate_condition(r#"status == "success""#, &s));
        assert!(!evaluate_condition(r#"status == "failure""#, &s));
    }

    #[test]
    fn test_condition_not_equals() {
        let s = scratch(&[("status", serde_json::json!("success"))]);
        assert!(evaluate_condition(r#"status != "failure""#, &s));
        assert!(!evaluate_condition(r#"status != "success""#, &s));
    }

    #[test]
    fn test_condition_contains() {
        let s = scratch(&[("output", serde_json::json!("The file was created."))]);
        assert!(evaluate_condition(r#"output contains "created""#, &s));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &s));
    }

    #[test]
    fn test_condition_exists_and_invalid() {
        let s = scratch(&[("summary", serde_json::json!("x")), ("gone", serde_json::Value::Null)]);
        assert!(evaluate_condition("summary exists", &s));
        assert!(!evaluate_condition("gone exists", &s));
        assert!(!evaluate_condition("missing exists", &s));
        assert!(!evaluate_condition("this is not valid", &s));
    }

    #[test]
    fn test_scratch_present() {
        let cond = Condition::scratch_present("tool_requests");
        let mut state = SessionState::default();
        assert!(!cond.evaluate(&state));
        state
            .scratch
            .insert("tool_requests".into(), serde_json::json!([]));
        assert!(!cond.evaluate(&state));
        state
            .scratch
            .insert("tool_requests".into(), serde_json::json!([{"name": "add"}]));
        assert!(cond.evaluate(&state));
        assert_eq!(cond.describe(), "tool_requests exists");
    }

    #[test]
    fn test_custom_predicate() {
        let cond = Condition::custom(|s: &SessionState| s.turns.len() > 1);
        assert!(!cond.evaluate(&SessionState::default()));
        assert_eq!(cond.describe(), "custom");
    }

    #[test]
    fn test_target_conversions() {
        assert_eq!(Target::from("llm"), Target::Node("llm".into()));
        assert_eq!(END.to_string(), "END");
    }
}
