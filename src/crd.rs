use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::domain::policy::{Policy, PolicyStrategies};

/// `TasPolicy` is the custom resource applied to the cluster to declare
/// telemetry-aware scheduling behaviour: up to four strategy slots
/// (scheduleonmetric/dontschedule/deschedule/labeling), each optional.
///
/// Omitted slots are simply not evaluated — there is no enforcement mode
/// toggle, unlike the governance policies this type replaces; every
/// declared strategy is always active.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "telemetry.intel.com",
    version = "v1alpha1",
    kind = "TasPolicy",
    plural = "taspolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TasPolicySpec {
    #[serde(default)]
    pub strategies: PolicyStrategies,
}

/// Recovers the in-memory `Policy` from a resource fetched or watched off
/// the orchestrator API. A resource without a namespace falls back to the
/// empty string rather than panicking — `PolicyKey` carries no invariant
/// requiring a non-empty one.
impl From<TasPolicy> for Policy {
    fn from(resource: TasPolicy) -> Self {
        let namespace = resource.metadata.namespace.clone().unwrap_or_default();
        let name = resource.metadata.name.clone().unwrap_or_default();
        Policy::new(namespace, name, resource.spec.strategies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{Comparator, LogicalOperator, RuleSpec, StrategySpec};
    use kube::CustomResourceExt;

    #[test]
    fn crd_yaml_carries_the_expected_group_and_plural() {
        let crd = TasPolicy::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("telemetry.intel.com"));
        assert!(yaml.contains("taspolicies"));
    }

    #[test]
    fn crd_is_namespaced() {
        let crd = TasPolicy::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = TasPolicySpec {
            strategies: PolicyStrategies {
                dontschedule: Some(StrategySpec {
                    policy_name: "filter1".to_string(),
                    logical_operator: LogicalOperator::AnyOf,
                    rules: vec![RuleSpec {
                        metric_name: "filter1_metric".to_string(),
                        operator: Comparator::LessThan,
                        target: 20,
                        labels: vec![],
                    }],
                }),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&spec).unwrap();
        let round_tripped: TasPolicySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped, spec);
    }

    #[test]
    fn empty_strategies_omit_fields_when_serialized() {
        let spec = TasPolicySpec {
            strategies: PolicyStrategies::default(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        let strategies = json.get("strategies").unwrap();
        assert!(strategies.get("dontschedule").is_none());
        assert!(strategies.get("labeling").is_none());
    }

    #[test]
    fn resource_converts_into_domain_policy() {
        let mut resource = TasPolicy::new(
            "filter1",
            TasPolicySpec {
                strategies: PolicyStrategies::default(),
            },
        );
        resource.metadata.namespace = Some("default".to_string());
        let policy: Policy = resource.into();
        assert_eq!(policy.key.namespace, "default");
        assert_eq!(policy.key.name, "filter1");
    }
}
