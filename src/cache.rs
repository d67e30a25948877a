use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::domain::metrics::MetricSnapshot;
use crate::domain::policy::{Policy, PolicyKey};
use crate::error::TasError;
use crate::telemetry::TelemetrySource;

/// Requests understood by the cache actor. All mutation and all reads are
/// funnelled through this single enum so the underlying maps are only ever
/// touched by the actor's own task — see `run()`. This is the "serialised
/// request queue" design §9 calls for in place of a `Mutex<HashMap>`.
enum Command {
    WriteMetric {
        name: String,
        snapshot: Option<MetricSnapshot>,
        reply: oneshot::Sender<Result<(), TasError>>,
    },
    ReadMetric {
        name: String,
        reply: oneshot::Sender<Result<MetricSnapshot, TasError>>,
    },
    DeleteMetric {
        name: String,
        reply: oneshot::Sender<()>,
    },
    MetricNames {
        reply: oneshot::Sender<Vec<String>>,
    },
    WritePolicy {
        policy: Policy,
        reply: oneshot::Sender<()>,
    },
    ReadPolicy {
        key: PolicyKey,
        reply: oneshot::Sender<Result<Policy, TasError>>,
    },
    DeletePolicy {
        key: PolicyKey,
        reply: oneshot::Sender<()>,
    },
    Policies {
        reply: oneshot::Sender<Vec<Policy>>,
    },
}

struct State {
    metrics: HashMap<String, MetricSnapshot>,
    policies: HashMap<PolicyKey, Policy>,
}

/// A cheaply-cloneable client for the cache actor. All operations are
/// linearised by the actor's single consumer loop (I1).
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<Command>,
}

fn actor_gone() -> TasError {
    TasError::Internal("cache actor is no longer running".to_string())
}

impl CacheHandle {
    /// Spawns the actor task and returns a handle to it. The task runs
    /// until every `CacheHandle` clone (and the channel) is dropped.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(256);
        tokio::spawn(async move {
            let mut state = State {
                metrics: HashMap::new(),
                policies: HashMap::new(),
            };
            while let Some(cmd) = rx.recv().await {
                handle(&mut state, cmd);
            }
            debug!("cache actor shutting down: all handles dropped");
        });
        CacheHandle { tx }
    }

    pub async fn write_metric(&self, name: impl Into<String>, snapshot: Option<MetricSnapshot>) -> Result<(), TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::WriteMetric {
                name: name.into(),
                snapshot,
                reply,
            })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn read_metric(&self, name: &str) -> Result<MetricSnapshot, TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ReadMetric {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Like `read_metric` but treats a miss as an empty snapshot instead of
    /// a `NotFound` error — the shape strategy evaluation wants, since a
    /// missing metric simply contributes no nodes to a rule.
    pub async fn read_metric_or_empty(&self, name: &str) -> Result<MetricSnapshot, TasError> {
        match self.read_metric(name).await {
            Ok(snap) => Ok(snap),
            Err(TasError::NotFound(_)) => Ok(MetricSnapshot::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_metric(&self, name: &str) -> Result<(), TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::DeleteMetric {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    pub async fn metric_names(&self) -> Result<Vec<String>, TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::MetricNames { reply })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    pub async fn write_policy(&self, policy: Policy) -> Result<(), TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::WritePolicy { policy, reply })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    pub async fn read_policy(&self, key: &PolicyKey) -> Result<Policy, TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ReadPolicy {
                key: key.clone(),
                reply,
            })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn delete_policy(&self, key: &PolicyKey) -> Result<(), TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::DeletePolicy {
                key: key.clone(),
                reply,
            })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    pub async fn policies(&self) -> Result<Vec<Policy>, TasError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Policies { reply })
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }
}

fn handle(state: &mut State, cmd: Command) {
    match cmd {
        Command::WriteMetric { name, snapshot, reply } => {
            let result = if name.is_empty() {
                Err(TasError::InvalidArgument("metric name must not be empty".to_string()))
            } else {
                match snapshot {
                    Some(s) => {
                        state.metrics.insert(name, s);
                    }
                    None => {
                        state.metrics.entry(name).or_default();
                    }
                }
                Ok(())
            };
            let _ = reply.send(result);
        }
        Command::ReadMetric { name, reply } => {
            let result = state
                .metrics
                .get(&name)
                .cloned()
                .ok_or_else(|| TasError::NotFound(format!("metric '{name}'")));
            let _ = reply.send(result);
        }
        Command::DeleteMetric { name, reply } => {
            state.metrics.remove(&name);
            let _ = reply.send(());
        }
        Command::MetricNames { reply } => {
            let _ = reply.send(state.metrics.keys().cloned().collect());
        }
        Command::WritePolicy { policy, reply } => {
            state.policies.insert(policy.key.clone(), policy);
            let _ = reply.send(());
        }
        Command::ReadPolicy { key, reply } => {
            let result = state
                .policies
                .get(&key)
                .cloned()
                .ok_or_else(|| TasError::NotFound(format!("policy '{key}'")));
            let _ = reply.send(result);
        }
        Command::DeletePolicy { key, reply } => {
            state.policies.remove(&key);
            let _ = reply.send(());
        }
        Command::Policies { reply } => {
            let _ = reply.send(state.policies.values().cloned().collect());
        }
    }
}

/// Runs `PeriodicUpdate` forever: on every tick, re-pull every metric
/// currently registered in the cache from `source`, leaving the previous
/// snapshot in place on a per-metric failure. Terminates when `shutdown`
/// fires. `seed` lets a freshly started process register metric names up
/// front so the first tick already has something to refresh, rather than
/// waiting a full interval before pulling anything. `ready` flips to `true`
/// once the first refresh pass (possibly a no-op, if nothing is seeded yet)
/// has completed, for the extender's `/readyz` probe.
pub async fn periodic_update(
    cache: CacheHandle,
    source: impl TelemetrySource,
    interval: Duration,
    seed: HashSet<String>,
    ready: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    for name in seed {
        if let Err(e) = cache.write_metric(name.clone(), None).await {
            warn!(metric = %name, error = %e, "failed to seed metric name");
        }
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; consume it up front

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("periodic metric update loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                let names = match cache.metric_names().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "failed to enumerate metric names for refresh");
                        ready.store(true, Ordering::Relaxed);
                        continue;
                    }
                };
                for name in names {
                    match source.get_node_metric(&name).await {
                        Ok(snapshot) => {
                            if let Err(e) = cache.write_metric(name.clone(), Some(snapshot)).await {
                                warn!(metric = %name, error = %e, "failed to write refreshed metric");
                            }
                        }
                        Err(e) => {
                            debug!(metric = %name, error = %e, "metric refresh failed, keeping prior snapshot");
                        }
                    }
                }
                ready.store(true, Ordering::Relaxed);
            }
        }
    }
}
