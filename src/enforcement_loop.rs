use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::CacheHandle;
use crate::registry::Registry;

/// Runs C6 forever: on every tick of `interval`, enforces every registered
/// strategy via `Registry::enforce_all` (itself responsible for isolating
/// and logging per-strategy failures — §4.6's "a failing strategy does not
/// cancel the tick or suppress others"). Terminates when `shutdown` fires.
/// Grounded on `commands/watch.rs`'s `lease_renewal_loop` ticker idiom.
pub async fn run(
    cache: CacheHandle,
    registry: Registry,
    client: kube::Client,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; consume it up front

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("enforcement loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                let results = registry.enforce_all(&cache, &client).await;
                debug!(ticks = results.len(), "enforcement tick completed");
            }
        }
    }
}
