use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use tracing::warn;

use crate::cache::CacheHandle;
use crate::domain::policy::{Comparator, LogicalOperator, RuleSpec, StrategySpec, StrategyType};
use crate::domain::rule;
use crate::error::TasError;

const LABEL_NAMESPACE: &str = "telemetry.aware.scheduling";
const FIELD_MANAGER: &str = "tas-scheduler";

/// The four strategy kinds, as a tagged enum dispatched via `match` (§9:
/// tagged-variant enumeration in place of a trait-object interface).
#[derive(Debug, Clone)]
pub enum Strategy {
    ScheduleOnMetric {
        policy_name: String,
        rule: RuleSpec,
    },
    DontSchedule {
        policy_name: String,
        operator: LogicalOperator,
        rules: Vec<RuleSpec>,
    },
    Deschedule {
        policy_name: String,
        operator: LogicalOperator,
        rules: Vec<RuleSpec>,
    },
    Labeling {
        policy_name: String,
        operator: LogicalOperator,
        rules: Vec<RuleSpec>,
    },
}

impl Strategy {
    /// Builds the runtime strategy for one policy's declared slot. Per the
    /// resolved open question, a `scheduleonmetric` spec with more than one
    /// rule uses only the first and warns about the rest.
    pub fn from_spec(kind: StrategyType, spec: &StrategySpec) -> Self {
        match kind {
            StrategyType::Scheduleonmetric => {
                if spec.rules.len() > 1 {
                    warn!(
                        policy = %spec.policy_name,
                        rule_count = spec.rules.len(),
                        "scheduleonmetric declares more than one rule; only the first is used"
                    );
                }
                let rule = spec.rules.first().cloned().unwrap_or(RuleSpec {
                    metric_name: String::new(),
                    operator: Comparator::Unknown,
                    target: 0,
                    labels: vec![],
                });
                Strategy::ScheduleOnMetric {
                    policy_name: spec.policy_name.clone(),
                    rule,
                }
            }
            StrategyType::Dontschedule => Strategy::DontSchedule {
                policy_name: spec.policy_name.clone(),
                operator: spec.logical_operator,
                rules: spec.rules.clone(),
            },
            StrategyType::Deschedule => Strategy::Deschedule {
                policy_name: spec.policy_name.clone(),
                operator: spec.logical_operator,
                rules: spec.rules.clone(),
            },
            StrategyType::Labeling => Strategy::Labeling {
                policy_name: spec.policy_name.clone(),
                operator: spec.logical_operator,
                rules: spec.rules.clone(),
            },
        }
    }

    pub fn strategy_type(&self) -> StrategyType {
        match self {
            Strategy::ScheduleOnMetric { .. } => StrategyType::Scheduleonmetric,
            Strategy::DontSchedule { .. } => StrategyType::Dontschedule,
            Strategy::Deschedule { .. } => StrategyType::Deschedule,
            Strategy::Labeling { .. } => StrategyType::Labeling,
        }
    }

    pub fn policy_name(&self) -> &str {
        match self {
            Strategy::ScheduleOnMetric { policy_name, .. }
            | Strategy::DontSchedule { policy_name, .. }
            | Strategy::Deschedule { policy_name, .. }
            | Strategy::Labeling { policy_name, .. } => policy_name,
        }
    }

    /// Two strategies are equal iff same policy name, same type, same rule
    /// count, and pairwise equal rules — exactly §3's definition. The
    /// logical operator is deliberately not part of equality.
    pub fn equals(&self, other: &Strategy) -> bool {
        match (self, other) {
            (
                Strategy::ScheduleOnMetric { policy_name: p1, rule: r1 },
                Strategy::ScheduleOnMetric { policy_name: p2, rule: r2 },
            ) => p1 == p2 && r1 == r2,
            (
                Strategy::DontSchedule { policy_name: p1, rules: r1, .. },
                Strategy::DontSchedule { policy_name: p2, rules: r2, .. },
            ) => p1 == p2 && r1 == r2,
            (
                Strategy::Deschedule { policy_name: p1, rules: r1, .. },
                Strategy::Deschedule { policy_name: p2, rules: r2, .. },
            ) => p1 == p2 && r1 == r2,
            (
                Strategy::Labeling { policy_name: p1, rules: r1, .. },
                Strategy::Labeling { policy_name: p2, rules: r2, .. },
            ) => p1 == p2 && r1 == r2,
            _ => false,
        }
    }

    /// Computes the set of violating node ids against the current cache
    /// snapshot. A no-op for `ScheduleOnMetric` (it never excludes nodes)
    /// and for `Labeling` (label application has its own per-label
    /// combination logic inside `enforce`, not a single violation set).
    pub async fn violated(&self, cache: &CacheHandle) -> Result<HashSet<String>, TasError> {
        match self {
            Strategy::ScheduleOnMetric { .. } | Strategy::Labeling { .. } => Ok(HashSet::new()),
            Strategy::DontSchedule { operator, rules, .. } | Strategy::Deschedule { operator, rules, .. } => {
                violating_nodes(cache, *operator, rules).await
            }
        }
    }

    /// Side-effecting enforcement action, invoked once per enforcement
    /// tick (C6). Returns the number of node labels changed.
    pub async fn enforce(&self, cache: &CacheHandle, client: &kube::Client) -> Result<u32, TasError> {
        match self {
            Strategy::ScheduleOnMetric { .. } | Strategy::DontSchedule { .. } => Ok(0),
            Strategy::Deschedule { policy_name, operator, rules } => {
                enforce_deschedule(cache, client, policy_name, *operator, rules).await
            }
            Strategy::Labeling { policy_name, operator, rules } => {
                enforce_labeling(cache, client, policy_name, *operator, rules).await
            }
        }
    }

    /// Invoked by `Registry::remove_strategy` once a strategy has actually
    /// been removed: erases whatever `enforce` wrote onto the cluster.
    pub async fn cleanup(&self, client: &kube::Client) -> Result<(), TasError> {
        match self {
            Strategy::ScheduleOnMetric { .. } | Strategy::DontSchedule { .. } => Ok(()),
            Strategy::Deschedule { policy_name, .. } => {
                let nodes: kube::Api<Node> = kube::Api::all(client.clone());
                for node in list_nodes(&nodes).await? {
                    let name = node_name(&node);
                    if node_has_label(&node, policy_name) {
                        patch_node_label(&nodes, &name, policy_name, None).await?;
                    }
                }
                Ok(())
            }
            Strategy::Labeling { policy_name, .. } => {
                let prefix = format!("{LABEL_NAMESPACE}.{policy_name}/");
                let nodes: kube::Api<Node> = kube::Api::all(client.clone());
                for node in list_nodes(&nodes).await? {
                    let name = node_name(&node);
                    let keys: Vec<String> = node
                        .metadata
                        .labels
                        .as_ref()
                        .map(|l| l.keys().filter(|k| k.starts_with(&prefix)).cloned().collect())
                        .unwrap_or_default();
                    for key in keys {
                        patch_node_label(&nodes, &name, &key, None).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

async fn list_nodes(api: &kube::Api<Node>) -> Result<Vec<Node>, TasError> {
    Ok(api.list(&Default::default()).await?.items)
}

fn node_name(node: &Node) -> String {
    node.metadata.name.clone().unwrap_or_default()
}

fn node_has_label(node: &Node, key: &str) -> bool {
    node.metadata
        .labels
        .as_ref()
        .map(|l| l.contains_key(key))
        .unwrap_or(false)
}

async fn patch_node_label(api: &kube::Api<Node>, name: &str, key: &str, value: Option<&str>) -> Result<(), TasError> {
    let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Per-rule (seen, holds) sets against the current cache, used by both the
/// don't-schedule/deschedule violation computation and the labeling
/// enforcement logic below — they share the same "does rule R hold for
/// node N" primitive.
async fn per_rule_state(
    cache: &CacheHandle,
    rules: &[RuleSpec],
) -> Result<(Vec<HashSet<String>>, Vec<HashSet<String>>), TasError> {
    let mut seen = Vec::with_capacity(rules.len());
    let mut holds = Vec::with_capacity(rules.len());

    for r in rules {
        let snapshot = cache.read_metric_or_empty(&r.metric_name).await?;
        let mut rule_seen = HashSet::new();
        let mut rule_holds = HashSet::new();
        for (node, sample) in snapshot.iter() {
            rule_seen.insert(node.clone());
            if rule::evaluate_rule(sample.value, r) {
                rule_holds.insert(node.clone());
            }
        }
        seen.push(rule_seen);
        holds.push(rule_holds);
    }
    Ok((seen, holds))
}

async fn violating_nodes(
    cache: &CacheHandle,
    operator: LogicalOperator,
    rules: &[RuleSpec],
) -> Result<HashSet<String>, TasError> {
    let (seen, holds) = per_rule_state(cache, rules).await?;
    let all_nodes: HashSet<String> = seen.iter().flatten().cloned().collect();

    let violating = all_nodes
        .into_iter()
        .filter(|node| match operator {
            LogicalOperator::AnyOf => holds.iter().any(|h| h.contains(node)),
            LogicalOperator::AllOf => (0..rules.len()).all(|i| seen[i].contains(node) && holds[i].contains(node)),
        })
        .collect();
    Ok(violating)
}

async fn enforce_deschedule(
    cache: &CacheHandle,
    client: &kube::Client,
    policy_name: &str,
    operator: LogicalOperator,
    rules: &[RuleSpec],
) -> Result<u32, TasError> {
    let violating = violating_nodes(cache, operator, rules).await?;
    let nodes: kube::Api<Node> = kube::Api::all(client.clone());
    let mut changed = 0;
    for node in list_nodes(&nodes).await? {
        let name = node_name(&node);
        let has_label = node_has_label(&node, policy_name);
        let should_have = violating.contains(&name);
        if should_have && !has_label {
            patch_node_label(&nodes, &name, policy_name, Some("violating")).await?;
            changed += 1;
        } else if !should_have && has_label {
            patch_node_label(&nodes, &name, policy_name, None).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Parses `"key=value"` entries, skipping malformed ones (no `=`, empty key
/// or value) with a warning.
fn parse_label_pairs(raw: &[String], policy_name: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for item in raw {
        match item.split_once('=') {
            Some((k, v)) if !k.is_empty() && !v.is_empty() => pairs.push((k.to_string(), v.to_string())),
            _ => warn!(policy = policy_name, expression = %item, "skipping malformed label expression"),
        }
    }
    pairs
}

async fn enforce_labeling(
    cache: &CacheHandle,
    client: &kube::Client,
    policy_name: &str,
    operator: LogicalOperator,
    rules: &[RuleSpec],
) -> Result<u32, TasError> {
    let (seen, holds) = per_rule_state(cache, rules).await?;
    let per_rule_labels: Vec<Vec<(String, String)>> = rules
        .iter()
        .map(|r| parse_label_pairs(&r.labels, policy_name))
        .collect();

    // Which rule indices (in declaration order) contribute to each label key.
    let mut key_to_rules: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, pairs) in per_rule_labels.iter().enumerate() {
        for (k, _) in pairs {
            key_to_rules.entry(k.clone()).or_default().push(i);
        }
    }

    let nodes_api: kube::Api<Node> = kube::Api::all(client.clone());
    let mut changed = 0;
    for node in list_nodes(&nodes_api).await? {
        let name = node_name(&node);
        let existing = node.metadata.labels.clone().unwrap_or_default();

        for (key, rule_idxs) in &key_to_rules {
            let full_key = format!("{LABEL_NAMESPACE}.{policy_name}/{key}");
            let applies = match operator {
                LogicalOperator::AnyOf => rule_idxs.iter().any(|&i| holds[i].contains(&name)),
                LogicalOperator::AllOf => rule_idxs.iter().all(|&i| seen[i].contains(&name) && holds[i].contains(&name)),
            };

            let desired_value = if applies {
                // Last-declared-wins among the rules that actually hold for this node.
                rule_idxs
                    .iter()
                    .rev()
                    .find(|&&i| holds[i].contains(&name))
                    .and_then(|&i| per_rule_labels[i].iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
            } else {
                None
            };

            match (&desired_value, existing.get(&full_key)) {
                (Some(v), Some(current)) if v == current => {}
                (Some(v), _) => {
                    patch_node_label(&nodes_api, &name, &full_key, Some(v)).await?;
                    changed += 1;
                }
                (None, Some(_)) => {
                    patch_node_label(&nodes_api, &name, &full_key, None).await?;
                    changed += 1;
                }
                (None, None) => {}
            }
        }
    }
    Ok(changed)
}
