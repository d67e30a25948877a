use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube_runtime::watcher::{self, Config, Event};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::CacheHandle;
use crate::crd::TasPolicy;
use crate::domain::policy::Policy;
use crate::domain::strategy::Strategy;
use crate::error::TasError;
use crate::registry::Registry;

/// One change to a policy resource, independent of transport. Mirrors the
/// shape of `kube_runtime::watcher::Event` (Applied/Deleted/Restarted)
/// rather than `onAdd`/`onUpdate`/`onDelete` directly, because the
/// orchestrator's watch API itself does not distinguish add from update —
/// both surface as `Applied`. The controller's own handler (`on_apply`)
/// recovers add/update semantics by diffing against the cache's previous
/// copy of the policy.
#[derive(Debug, Clone)]
pub enum PolicyEvent {
    Applied(Policy),
    Deleted(Policy),
    Restarted(Vec<Policy>),
}

/// Abstracts "subscribe to policy resource changes" (§9) so the controller
/// loop can be driven by a real orchestrator watch in production and by a
/// synthetic, in-memory stream in tests.
pub trait PolicyWatch: Send + Sync {
    fn watch(&self) -> BoxStream<'static, Result<PolicyEvent, TasError>>;
}

/// Production implementation: wraps `kube_runtime::watcher` over the
/// `TasPolicy` custom resource, grounded on `commands/watch.rs`'s
/// `watch_loop` (`watcher(api, Config::default())` + `StreamExt`
/// consumption).
pub struct KubePolicyWatch {
    api: kube::Api<TasPolicy>,
}

impl KubePolicyWatch {
    pub fn new(client: kube::Client) -> Self {
        KubePolicyWatch {
            api: kube::Api::all(client),
        }
    }
}

impl PolicyWatch for KubePolicyWatch {
    fn watch(&self) -> BoxStream<'static, Result<PolicyEvent, TasError>> {
        watcher(self.api.clone(), Config::default())
            .map(|result| match result {
                Ok(Event::Applied(policy)) => Ok(PolicyEvent::Applied(policy.into())),
                Ok(Event::Deleted(policy)) => Ok(PolicyEvent::Deleted(policy.into())),
                Ok(Event::Restarted(policies)) => {
                    Ok(PolicyEvent::Restarted(policies.into_iter().map(Into::into).collect()))
                }
                Err(e) => Err(TasError::TransportError(e.to_string())),
            })
            .boxed()
    }
}

/// A synthetic, pre-recorded stream for tests: fed a fixed sequence of
/// events at construction time, exactly mirroring what an end-to-end
/// scenario test needs without standing up a real watch connection.
pub struct StaticPolicyWatch {
    events: Vec<Result<PolicyEvent, TasError>>,
}

impl StaticPolicyWatch {
    pub fn new(events: Vec<PolicyEvent>) -> Self {
        StaticPolicyWatch {
            events: events.into_iter().map(Ok).collect(),
        }
    }
}

impl PolicyWatch for StaticPolicyWatch {
    fn watch(&self) -> BoxStream<'static, Result<PolicyEvent, TasError>> {
        futures::stream::iter(self.events.clone()).boxed()
    }
}

impl Clone for PolicyEvent {
    fn clone(&self) -> Self {
        match self {
            PolicyEvent::Applied(p) => PolicyEvent::Applied(p.clone()),
            PolicyEvent::Deleted(p) => PolicyEvent::Deleted(p.clone()),
            PolicyEvent::Restarted(ps) => PolicyEvent::Restarted(ps.clone()),
        }
    }
}

/// Drives the controller forever: consumes `watch`'s event stream and
/// applies each event to `cache`/`registry`, terminating on `shutdown`.
/// `ready` flips to `true` once the watch stream has been established and
/// has yielded its first event (an initial `Restarted` listing, in
/// practice), for the extender's `/readyz` probe.
pub async fn run(
    watch: &dyn PolicyWatch,
    cache: CacheHandle,
    registry: Registry,
    client: kube::Client,
    ready: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut stream = watch.watch();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("policy controller shutting down");
                return;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        handle_event(event, &cache, &registry, &client).await;
                        ready.store(true, Ordering::Relaxed);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "policy watch stream error");
                        ready.store(true, Ordering::Relaxed);
                    }
                    None => {
                        info!("policy watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_event(event: PolicyEvent, cache: &CacheHandle, registry: &Registry, client: &kube::Client) {
    match event {
        PolicyEvent::Applied(policy) => on_apply(policy, cache, registry, client).await,
        PolicyEvent::Deleted(policy) => on_delete(policy, cache, registry, client).await,
        PolicyEvent::Restarted(policies) => {
            for policy in policies {
                on_apply(policy, cache, registry, client).await;
            }
        }
    }
}

/// Handles both `onAdd` and `onUpdate` uniformly: any strategy slot present
/// in the cache's previous copy of this policy is removed first (a no-op
/// when there was no previous copy, i.e. this is really an add), then every
/// slot in the new spec is (re-)registered. Because `Registry::add_strategy`
/// and `Registry::remove_strategy` are each individually atomic, a
/// concurrent enforcement tick can only ever observe the fully-old or
/// fully-new strategy for a given slot, never a half-updated one.
pub async fn on_apply(policy: Policy, cache: &CacheHandle, registry: &Registry, client: &kube::Client) {
    if let Ok(previous) = cache.read_policy(&policy.key).await {
        for (kind, spec) in previous.strategies.iter() {
            let old = Strategy::from_spec(kind, spec);
            if registry.remove_strategy(&old).await {
                if let Err(e) = old.cleanup(client).await {
                    warn!(policy = %policy.key, error = %e, "cleanup failed while superseding strategy");
                }
            }
        }
    }

    if let Err(e) = cache.write_policy(policy.clone()).await {
        warn!(policy = %policy.key, error = %e, "failed to write policy to cache");
        return;
    }

    for (kind, spec) in policy.strategies.iter() {
        registry.register_strategy_type(kind).await;
        registry.add_strategy(Strategy::from_spec(kind, spec)).await;
        for rule in &spec.rules {
            if let Err(e) = cache.write_metric(rule.metric_name.clone(), None).await {
                warn!(policy = %policy.key, metric = %rule.metric_name, error = %e, "failed to register metric name");
            }
        }
    }
}

/// `onDelete`: removes every strategy the policy registered (running
/// `Cleanup` for each), drops the policy from the cache, then deletes only
/// the metrics no other remaining policy still references — metrics are
/// kept until their last referencing policy disappears (§3).
pub async fn on_delete(policy: Policy, cache: &CacheHandle, registry: &Registry, client: &kube::Client) {
    for (kind, spec) in policy.strategies.iter() {
        let strategy = Strategy::from_spec(kind, spec);
        if registry.remove_strategy(&strategy).await {
            if let Err(e) = strategy.cleanup(client).await {
                warn!(policy = %policy.key, error = %e, "cleanup failed during policy deletion");
            }
        }
    }

    if let Err(e) = cache.delete_policy(&policy.key).await {
        warn!(policy = %policy.key, error = %e, "failed to delete policy from cache");
    }

    let remaining = cache.policies().await.unwrap_or_default();
    let still_referenced: HashSet<String> = remaining.iter().flat_map(|p| p.strategies.metric_names()).collect();
    for metric in policy.strategies.metric_names() {
        if !still_referenced.contains(&metric) {
            let _ = cache.delete_metric(&metric).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{Comparator, LogicalOperator, PolicyStrategies, RuleSpec, StrategySpec, StrategyType};

    fn rule(metric: &str) -> RuleSpec {
        RuleSpec {
            metric_name: metric.to_string(),
            operator: Comparator::GreaterThan,
            target: 0,
            labels: vec![],
        }
    }

    fn labeling_policy(name: &str, metric: &str) -> Policy {
        Policy::new(
            "default",
            name,
            PolicyStrategies {
                labeling: Some(StrategySpec {
                    policy_name: name.to_string(),
                    logical_operator: LogicalOperator::AnyOf,
                    rules: vec![rule(metric)],
                }),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    #[ignore = "requires a reachable cluster to construct a kube::Client"]
    async fn on_apply_registers_strategy_and_metric() {
        let cache = CacheHandle::spawn();
        let registry = Registry::new();
        let client = kube::Client::try_default().await.expect("cluster reachable");

        let policy = labeling_policy("lab1", "m1");
        on_apply(policy.clone(), &cache, &registry, &client).await;

        let cached = cache.read_policy(&policy.key).await.unwrap();
        assert_eq!(cached.key, policy.key);

        let strategies = registry.strategies_for_type(StrategyType::Labeling).await;
        assert_eq!(strategies.len(), 1);

        // Metric name was registered (present, even with no snapshot yet).
        let names = cache.metric_names().await.unwrap();
        assert!(names.contains(&"m1".to_string()));
    }

    #[tokio::test]
    #[ignore = "requires a reachable cluster to construct a kube::Client"]
    async fn on_delete_drops_metric_only_after_last_referencing_policy_goes() {
        let cache = CacheHandle::spawn();
        let registry = Registry::new();
        let client = kube::Client::try_default().await.expect("cluster reachable");

        let p1 = labeling_policy("lab1", "shared_metric");
        let p2 = labeling_policy("lab2", "shared_metric");
        on_apply(p1.clone(), &cache, &registry, &client).await;
        on_apply(p2.clone(), &cache, &registry, &client).await;

        on_delete(p1, &cache, &registry, &client).await;
        // p2 still references shared_metric, so it must survive.
        assert!(cache.metric_names().await.unwrap().contains(&"shared_metric".to_string()));

        on_delete(p2, &cache, &registry, &client).await;
        assert!(!cache.metric_names().await.unwrap().contains(&"shared_metric".to_string()));
    }
}
