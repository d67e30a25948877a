use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::Client;
use tokio::sync::broadcast;
use tracing::info;

use tas_scheduler::cache::{self, CacheHandle};
use tas_scheduler::controller::{self, KubePolicyWatch};
use tas_scheduler::enforcement_loop;
use tas_scheduler::extender::{self, ExtenderState, Readiness, TlsConfig};
use tas_scheduler::registry::Registry;
use tas_scheduler::telemetry::CustomMetricsSource;

pub struct RunArgs {
    pub addr: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub client_ca: String,
    pub refresh_interval_secs: u64,
    pub enforce_interval_secs: u64,
}

/// The production entrypoint: stands up one cache, one registry, a policy
/// controller, a cache-refresh loop, an enforcement loop and the HTTPS
/// scheduler extender, all sharing a single graceful-shutdown broadcast
/// channel, grounded on `commands/webhook.rs`'s `serve()` banner/shutdown
/// shape.
pub async fn run(args: RunArgs) -> Result<()> {
    println!("Starting tas-scheduler...\n");
    info!("tas_scheduler_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let addr: SocketAddr = args.addr.parse().context("Invalid address format")?;

    println!("  HTTPS extender .............. https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /scheduler/filter ........ Filter verb");
    println!("    POST /scheduler/prioritize .... Prioritize verb");
    println!("    POST /scheduler/bind .......... Bind verb (always declines)");
    println!("    GET  /healthz ................. Liveness probe");
    println!("    GET  /readyz .................. Readiness probe");
    println!("    GET  /metrics ................. Prometheus metrics");
    println!();
    println!("tas-scheduler running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let cache = CacheHandle::spawn();
    let registry = Registry::new();
    let readiness = Readiness::new();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let telemetry_source = CustomMetricsSource::new(client.clone());
    let cache_ready = readiness.cache_refreshed.clone();
    let cache_for_refresh = cache.clone();
    let cache_shutdown = shutdown_tx.subscribe();
    let refresh_handle = tokio::spawn(cache::periodic_update(
        cache_for_refresh,
        telemetry_source,
        Duration::from_secs(args.refresh_interval_secs),
        HashSet::new(),
        cache_ready,
        cache_shutdown,
    ));

    let watch = KubePolicyWatch::new(client.clone());
    let controller_ready = readiness.controller_synced.clone();
    let cache_for_controller = cache.clone();
    let registry_for_controller = registry.clone();
    let client_for_controller = client.clone();
    let controller_shutdown = shutdown_tx.subscribe();
    let controller_handle = tokio::spawn(async move {
        controller::run(
            &watch,
            cache_for_controller,
            registry_for_controller,
            client_for_controller,
            controller_ready,
            controller_shutdown,
        )
        .await;
    });

    let cache_for_enforcement = cache.clone();
    let registry_for_enforcement = registry.clone();
    let client_for_enforcement = client.clone();
    let enforcement_shutdown = shutdown_tx.subscribe();
    let enforcement_handle = tokio::spawn(enforcement_loop::run(
        cache_for_enforcement,
        registry_for_enforcement,
        client_for_enforcement,
        Duration::from_secs(args.enforce_interval_secs),
        enforcement_shutdown,
    ));

    let extender_state = ExtenderState {
        cache: cache.clone(),
        readiness,
    };
    let tls = TlsConfig {
        server_cert: args.tls_cert,
        server_key: args.tls_key,
        client_ca_bundle: args.client_ca,
    };
    let extender_shutdown = shutdown_tx.subscribe();
    let extender_handle = tokio::spawn(async move { extender::serve(extender_state, addr, &tls, extender_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping tas-scheduler...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = refresh_handle.await;
    let _ = controller_handle.await;
    let _ = enforcement_handle.await;
    if let Err(e) = extender_handle.await? {
        println!("extender server error: {e}");
    }

    info!("tas_scheduler_stopped");
    println!("tas-scheduler stopped.");
    Ok(())
}
