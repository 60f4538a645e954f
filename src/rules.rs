//! Sync rules evaluator (C4): pure, side-effect-free bucket-filter matching.

use crate::model::{ClaimValue, Claims, RowDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub tables: Vec<String>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRules {
    pub version: u32,
    pub buckets: Vec<Bucket>,
}

impl SyncRules {
    /// No buckets configured means allow all, not deny all.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Resolves a filter's configured value against claims. `claim:<name>`
/// references are substituted; every other value is a literal.
fn resolve_value<'a>(value: &'a Value, claims: &'a Claims) -> Option<Value> {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix("claim:") {
                match name {
                    "sub" => Some(Value::String(claims.client_id.clone())),
                    "gw" => Some(Value::String(claims.gateway_id.clone())),
                    _ => claims.get(name).map(|c| match c {
                        ClaimValue::Single(v) => Value::String(v.clone()),
                        ClaimValue::List(v) => {
                            Value::Array(v.iter().cloned().map(Value::String).collect())
                        }
                    }),
                }
            } else {
                Some(value.clone())
            }
        }
        other => Some(other.clone()),
    }
}

fn compare_numeric(a: &Value, b: &Value, op: FilterOp) -> bool {
    let (a, b) = match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    match op {
        FilterOp::Gt => a > b,
        FilterOp::Gte => a >= b,
        FilterOp::Lt => a < b,
        FilterOp::Lte => a <= b,
        _ => unreachable!(),
    }
}

fn filter_matches(filter: &Filter, delta: &RowDelta, claims: &Claims) -> bool {
    // Missing columns fail the predicate (fail-closed), including on DELETE
    // where no columns are carried at all.
    let Some(column_value) = delta.column(&filter.column) else {
        return false;
    };
    let Some(resolved) = resolve_value(&filter.value, claims) else {
        return false;
    };

    match filter.op {
        FilterOp::Eq => column_value == &resolved,
        FilterOp::Neq => column_value != &resolved,
        FilterOp::In => match &resolved {
            Value::Array(items) => items.contains(column_value),
            other => column_value == other,
        },
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            compare_numeric(column_value, &resolved, filter.op)
        }
    }
}

fn bucket_matches(bucket: &Bucket, delta: &RowDelta, claims: &Claims) -> bool {
    bucket.tables.iter().any(|t| t == &delta.table)
        && bucket.filters.iter().all(|f| filter_matches(f, delta, claims))
}

/// `true` iff some bucket in `rules` matches `delta` under `claims`. Pure and
/// deterministic: same inputs always produce the same verdict.
pub fn is_allowed(delta: &RowDelta, claims: &Claims, rules: &SyncRules) -> bool {
    if rules.is_empty() {
        return true;
    }
    rules.buckets.iter().any(|b| bucket_matches(b, delta, claims))
}

/// Filters a delta slice down to those visible under `claims`, preserving
/// order.
pub fn filter_deltas(deltas: Vec<RowDelta>, claims: &Claims, rules: &SyncRules) -> Vec<RowDelta> {
    if rules.is_empty() {
        return deltas;
    }
    deltas
        .into_iter()
        .filter(|d| is_allowed(d, claims, rules))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::HlcTimestamp;
    use crate::model::Op;
    use std::collections::BTreeMap;

    fn delta(table: &str, owner: &str) -> RowDelta {
        RowDelta {
            delta_id: "d1".to_string(),
            table: table.to_string(),
            row_id: "row-1".to_string(),
            client_id: "c1".to_string(),
            op: Op::Insert,
            columns: vec![("owner".to_string(), serde_json::json!(owner))],
            hlc: HlcTimestamp::from(1),
        }
    }

    fn claims(sub: &str) -> Claims {
        Claims {
            client_id: sub.to_string(),
            gateway_id: "gw-1".to_string(),
            role: crate::model::Role::Client,
            custom: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_rules_allow_all() {
        let rules = SyncRules::default();
        assert!(is_allowed(&delta("todos", "a"), &claims("a"), &rules));
    }

    #[test]
    fn owner_claim_filter_matches_only_self() {
        let rules = SyncRules {
            version: 1,
            buckets: vec![Bucket {
                name: "mine".to_string(),
                tables: vec!["todos".to_string()],
                filters: vec![Filter {
                    column: "owner".to_string(),
                    op: FilterOp::Eq,
                    value: serde_json::json!("claim:sub"),
                }],
            }],
        };
        assert!(!is_allowed(&delta("todos", "b"), &claims("a"), &rules));
        assert!(is_allowed(&delta("todos", "a"), &claims("a"), &rules));
    }

    #[test]
    fn missing_column_fails_closed() {
        let rules = SyncRules {
            version: 1,
            buckets: vec![Bucket {
                name: "b".to_string(),
                tables: vec!["todos".to_string()],
                filters: vec![Filter {
                    column: "nonexistent".to_string(),
                    op: FilterOp::Eq,
                    value: serde_json::json!("x"),
                }],
            }],
        };
        assert!(!is_allowed(&delta("todos", "a"), &claims("a"), &rules));
    }

    #[test]
    fn table_not_in_bucket_is_rejected() {
        let rules = SyncRules {
            version: 1,
            buckets: vec![Bucket {
                name: "b".to_string(),
                tables: vec!["other".to_string()],
                filters: vec![],
            }],
        };
        assert!(!is_allowed(&delta("todos", "a"), &claims("a"), &rules));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rules = SyncRules {
            version: 1,
            buckets: vec![Bucket {
                name: "b".to_string(),
                tables: vec!["todos".to_string()],
                filters: vec![Filter {
                    column: "owner".to_string(),
                    op: FilterOp::Eq,
                    value: serde_json::json!("claim:sub"),
                }],
            }],
        };
        let d = delta("todos", "a");
        let c = claims("a");
        let first = is_allowed(&d, &c, &rules);
        for _ in 0..10 {
            assert_eq!(is_allowed(&d, &c, &rules), first);
        }
    }
}
