use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Comparator recognised by a rule. `Unknown` absorbs any value the wire
/// format doesn't recognise so that `evaluate()` can fail closed (false)
/// instead of rejecting the whole policy at deserialize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Comparator {
    GreaterThan,
    LessThan,
    Equals,
    #[serde(other)]
    Unknown,
}

/// Combinator applied across a strategy's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOperator {
    #[default]
    AnyOf,
    AllOf,
}

/// A single (metric, comparator, target) check, optionally carrying labels
/// for the labeling strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub metric_name: String,
    pub operator: Comparator,
    pub target: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// One strategy's declared rule set within a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    pub policy_name: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    pub rules: Vec<RuleSpec>,
}

/// The four strategy slots a policy may populate. Matches the CRD's
/// `spec.strategies` object one field per strategy type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStrategies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduleonmetric: Option<StrategySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dontschedule: Option<StrategySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deschedule: Option<StrategySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeling: Option<StrategySpec>,
}

/// Identifies one of the four strategy kinds. Lowercase to match the CRD's
/// field names verbatim (the wire format uses `scheduleonmetric` etc, not
/// camelCase multi-word names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    Scheduleonmetric,
    Dontschedule,
    Deschedule,
    Labeling,
}

impl StrategyType {
    pub const ALL: [StrategyType; 4] = [
        StrategyType::Scheduleonmetric,
        StrategyType::Dontschedule,
        StrategyType::Deschedule,
        StrategyType::Labeling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Scheduleonmetric => "scheduleonmetric",
            StrategyType::Dontschedule => "dontschedule",
            StrategyType::Deschedule => "deschedule",
            StrategyType::Labeling => "labeling",
        }
    }
}

impl PolicyStrategies {
    fn slot(&self, kind: StrategyType) -> Option<&StrategySpec> {
        match kind {
            StrategyType::Scheduleonmetric => self.scheduleonmetric.as_ref(),
            StrategyType::Dontschedule => self.dontschedule.as_ref(),
            StrategyType::Deschedule => self.deschedule.as_ref(),
            StrategyType::Labeling => self.labeling.as_ref(),
        }
    }

    /// Iterates the strategy slots that are actually populated.
    pub fn iter(&self) -> impl Iterator<Item = (StrategyType, &StrategySpec)> {
        StrategyType::ALL
            .into_iter()
            .filter_map(move |kind| self.slot(kind).map(|spec| (kind, spec)))
    }

    pub fn metric_names(&self) -> HashSet<String> {
        self.iter()
            .flat_map(|(_, spec)| spec.rules.iter().map(|r| r.metric_name.clone()))
            .collect()
    }
}

/// Namespaced identity of a policy, used as the cache/registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        PolicyKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The in-memory form of a policy, independent of how it arrived (from the
/// orchestrator API in production, or a literal value in tests).
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub key: PolicyKey,
    pub strategies: PolicyStrategies,
}

impl Policy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, strategies: PolicyStrategies) -> Self {
        Policy {
            key: PolicyKey::new(namespace, name),
            strategies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(metric: &str, op: Comparator, target: i64) -> RuleSpec {
        RuleSpec {
            metric_name: metric.to_string(),
            operator: op,
            target,
            labels: vec![],
        }
    }

    #[test]
    fn unknown_comparator_round_trips_as_unknown() {
        let value: Comparator = serde_json::from_str("\"Frobnicate\"").unwrap();
        assert_eq!(value, Comparator::Unknown);
    }

    #[test]
    fn metric_names_collects_across_all_populated_strategies() {
        let strategies = PolicyStrategies {
            dontschedule: Some(StrategySpec {
                policy_name: "p1".into(),
                logical_operator: LogicalOperator::AnyOf,
                rules: vec![rule("cpu_busy", Comparator::GreaterThan, 80)],
            }),
            labeling: Some(StrategySpec {
                policy_name: "p1".into(),
                logical_operator: LogicalOperator::AllOf,
                rules: vec![rule("mem_free", Comparator::LessThan, 10)],
            }),
            ..Default::default()
        };
        let names = strategies.metric_names();
        assert_eq!(names.len(), 2);
        assert!(names.contains("cpu_busy"));
        assert!(names.contains("mem_free"));
    }

    #[test]
    fn iter_skips_unpopulated_slots() {
        let strategies = PolicyStrategies {
            deschedule: Some(StrategySpec {
                policy_name: "p1".into(),
                logical_operator: LogicalOperator::AnyOf,
                rules: vec![],
            }),
            ..Default::default()
        };
        let kinds: Vec<StrategyType> = strategies.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![StrategyType::Deschedule]);
    }

    #[test]
    fn policy_key_display_is_namespace_slash_name() {
        let key = PolicyKey::new("default", "filter1");
        assert_eq!(key.to_string(), "default/filter1");
    }
}
