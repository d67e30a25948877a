use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::cache::CacheHandle;
use crate::domain::policy::StrategyType;
use crate::domain::strategy::Strategy;
use crate::error::TasError;

struct Inner {
    buckets: HashMap<StrategyType, Vec<Strategy>>,
}

/// Strategy registry (C2): a short critical section guarding a
/// `HashMap<StrategyType, Vec<Strategy>>`, per §9's "shared-mutable map
/// protected by locks" alternative to the cache's actor design — register
/// and remove are already atomic single-map operations, so a queue adds
/// nothing here.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Arc::new(Mutex::new(Inner {
                buckets: HashMap::new(),
            })),
        }
    }

    /// Introduces an empty bucket for `kind` if one doesn't already exist.
    pub async fn register_strategy_type(&self, kind: StrategyType) {
        let mut inner = self.inner.lock().await;
        inner.buckets.entry(kind).or_default();
    }

    /// Idempotent w.r.t. `Strategy::equals` (I2): adding an equal strategy
    /// twice leaves the registry unchanged.
    pub async fn add_strategy(&self, strategy: Strategy) {
        let mut inner = self.inner.lock().await;
        let bucket = inner.buckets.entry(strategy.strategy_type()).or_default();
        if !bucket.iter().any(|s| s.equals(&strategy)) {
            bucket.push(strategy);
        }
    }

    /// Removes `strategy` by equality, returning whether it was present.
    /// Callers that need the `Cleanup` side effect (I3) call
    /// `Strategy::cleanup` themselves once this returns `true` — kept as a
    /// separate step so removal never needs a cluster client just to
    /// report "nothing to remove".
    pub async fn remove_strategy(&self, strategy: &Strategy) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.buckets.get_mut(&strategy.strategy_type()) {
            Some(bucket) => {
                let before = bucket.len();
                bucket.retain(|s| !s.equals(strategy));
                before != bucket.len()
            }
            None => false,
        }
    }

    pub async fn registered_strategy_types(&self) -> Vec<StrategyType> {
        self.inner.lock().await.buckets.keys().copied().collect()
    }

    pub async fn strategies_for_type(&self, kind: StrategyType) -> Vec<Strategy> {
        self.inner
            .lock()
            .await
            .buckets
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn strategies_for_policy(&self, policy_name: &str) -> Vec<Strategy> {
        self.inner
            .lock()
            .await
            .buckets
            .values()
            .flatten()
            .filter(|s| s.policy_name() == policy_name)
            .cloned()
            .collect()
    }

    /// `EnforceRegisteredStrategies`: snapshots every bucket (holding the
    /// lock only long enough to clone the strategy list), then drives each
    /// strategy's `Enforce` outside the lock so a single slow or failing
    /// strategy can't block registration or other enforcement.
    pub async fn enforce_all(&self, cache: &CacheHandle, client: &kube::Client) -> Vec<(StrategyType, Result<u32, TasError>)> {
        let snapshot: Vec<(StrategyType, Vec<Strategy>)> = {
            let inner = self.inner.lock().await;
            inner.buckets.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        let mut results = Vec::new();
        for (kind, strategies) in snapshot {
            for strategy in strategies {
                let outcome = strategy.enforce(cache, client).await;
                if let Err(ref e) = outcome {
                    warn!(
                        strategy_type = kind.as_str(),
                        policy = strategy.policy_name(),
                        error = %e,
                        "strategy enforcement failed"
                    );
                }
                results.push((kind, outcome));
            }
        }
        results
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{Comparator, LogicalOperator, RuleSpec, StrategySpec};
    use crate::domain::strategy::Strategy;

    fn rule(metric: &str) -> RuleSpec {
        RuleSpec {
            metric_name: metric.to_string(),
            operator: Comparator::GreaterThan,
            target: 0,
            labels: vec![],
        }
    }

    fn dont_schedule(policy: &str, metric: &str) -> Strategy {
        Strategy::from_spec(
            crate::domain::policy::StrategyType::Dontschedule,
            &StrategySpec {
                policy_name: policy.to_string(),
                logical_operator: LogicalOperator::AnyOf,
                rules: vec![rule(metric)],
            },
        )
    }

    #[tokio::test]
    async fn add_strategy_is_idempotent() {
        let registry = Registry::new();
        let s = dont_schedule("p1", "m1");
        registry.add_strategy(s.clone()).await;
        registry.add_strategy(s).await;
        let bucket = registry
            .strategies_for_type(crate::domain::policy::StrategyType::Dontschedule)
            .await;
        assert_eq!(bucket.len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_strategy_is_a_no_op() {
        let registry = Registry::new();
        let s = dont_schedule("p1", "m1");
        assert!(!registry.remove_strategy(&s).await);
    }

    #[tokio::test]
    async fn remove_present_strategy_returns_true_and_drops_it() {
        let registry = Registry::new();
        let s = dont_schedule("p1", "m1");
        registry.add_strategy(s.clone()).await;
        assert!(registry.remove_strategy(&s).await);
        let bucket = registry
            .strategies_for_type(crate::domain::policy::StrategyType::Dontschedule)
            .await;
        assert!(bucket.is_empty());
    }

    #[tokio::test]
    async fn distinct_policies_coexist_in_the_same_bucket() {
        let registry = Registry::new();
        registry.add_strategy(dont_schedule("p1", "m1")).await;
        registry.add_strategy(dont_schedule("p2", "m1")).await;
        let bucket = registry
            .strategies_for_type(crate::domain::policy::StrategyType::Dontschedule)
            .await;
        assert_eq!(bucket.len(), 2);
    }

    #[tokio::test]
    async fn strategies_for_policy_filters_across_buckets() {
        let registry = Registry::new();
        registry.add_strategy(dont_schedule("p1", "m1")).await;
        registry
            .add_strategy(Strategy::from_spec(
                crate::domain::policy::StrategyType::Labeling,
                &StrategySpec {
                    policy_name: "p1".to_string(),
                    logical_operator: LogicalOperator::AnyOf,
                    rules: vec![],
                },
            ))
            .await;
        let found = registry.strategies_for_policy("p1").await;
        assert_eq!(found.len(), 2);
    }
}
