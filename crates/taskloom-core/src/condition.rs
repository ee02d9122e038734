//! Predicates evaluated against a prerequisite's result.

use crate::task::{ResultStatus, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A condition attached to a dependency or a graph edge.
///
/// Paths are JSON pointers (`/build/ok`) into the prerequisite's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Always satisfied.
    Always,
    /// The prerequisite's result status equals `status`.
    StatusIs {
        /// Expected status.
        status: ResultStatus,
    },
    /// The value at `pointer` equals `value`.
    FieldEquals {
        /// JSON pointer into the payload.
        pointer: String,
        /// Expected value.
        value: Value,
    },
    /// The payload has a value at `pointer`.
    FieldExists {
        /// JSON pointer into the payload.
        pointer: String,
    },
    /// The value at `pointer` is truthy (non-null, non-false, non-zero, non-empty).
    FieldTruthy {
        /// JSON pointer into the payload.
        pointer: String,
    },
    /// Negation.
    Not {
        /// Inner condition.
        condition: Box<Condition>,
    },
    /// Every inner condition holds.
    All {
        /// Inner conditions.
        conditions: Vec<Condition>,
    },
    /// At least one inner condition holds.
    Any {
        /// Inner conditions.
        conditions: Vec<Condition>,
    },
}

impl Condition {
    /// Evaluate against a completed prerequisite's result.
    pub fn evaluate(&self, result: &TaskResult) -> bool {
        match self {
            Condition::Always => true,
            Condition::StatusIs { status } => result.status == *status,
            Condition::FieldEquals { pointer, value } => {
                result.payload.pointer(pointer) == Some(value)
            }
            Condition::FieldExists { pointer } => result.payload.pointer(pointer).is_some(),
            Condition::FieldTruthy { pointer } => {
                result.payload.pointer(pointer).is_some_and(is_truthy)
            }
            Condition::Not { condition } => !condition.evaluate(result),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(result)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(result)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(payload: Value) -> TaskResult {
        TaskResult::success(payload)
    }

    #[test]
    fn test_field_conditions() {
        let r = result(json!({"build": {"ok": true, "warnings": 0, "target": "x86"}}));
        assert!(Condition::FieldExists {
            pointer: "/build/target".into()
        }
        .evaluate(&r));
        assert!(Condition::FieldTruthy {
            pointer: "/build/ok".into()
        }
        .evaluate(&r));
        assert!(!Condition::FieldTruthy {
            pointer: "/build/warnings".into()
        }
        .evaluate(&r));
        assert!(Condition::FieldEquals {
            pointer: "/build/target".into(),
            value: json!("x86"),
        }
        .evaluate(&r));
        assert!(!Condition::FieldExists {
            pointer: "/missing".into()
        }
        .evaluate(&r));
    }

    #[test]
    fn test_combinators() {
        let r = result(json!({"a": 1, "b": 0}));
        let a = Condition::FieldTruthy { pointer: "/a".into() };
        let b = Condition::FieldTruthy { pointer: "/b".into() };
        assert!(Condition::Any {
            conditions: vec![a.clone(), b.clone()]
        }
        .evaluate(&r));
        assert!(!Condition::All {
            conditions: vec![a.clone(), b.clone()]
        }
        .evaluate(&r));
        assert!(Condition::Not {
            condition: Box::new(b)
        }
        .evaluate(&r));
    }

    #[test]
    fn test_status_condition() {
        let mut r = result(json!(null));
        assert!(Condition::StatusIs {
            status: ResultStatus::Success
        }
        .evaluate(&r));
        r.status = ResultStatus::Partial;
        assert!(!Condition::StatusIs {
            status: ResultStatus::Success
        }
        .evaluate(&r));
    }

    #[test]
    fn test_condition_toml_shape() {
        let json = r#"{"op":"field_equals","pointer":"/env","value":"prod"}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(
            cond,
            Condition::FieldEquals {
                pointer: "/env".into(),
                value: json!("prod")
            }
        );
    }
}
