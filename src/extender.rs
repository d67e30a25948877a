//! C7: the HTTPS scheduler extender service. Serves the orchestrator
//! scheduler's `filter`/`prioritize`/`bind` verbs over HTTP/JSON, consulting
//! the metric/policy cache (C1) and the strategy logic (C4) synchronously
//! per request. Grounded on `commands/webhook.rs`'s `build_webhook_router`/
//! `start_https_server` shape; the mutual-TLS requirement goes beyond that
//! file's server-only TLS, so the `rustls::ServerConfig` here is hand-built.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{Node, NodeList, Pod};
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::CacheHandle;
use crate::domain::policy::{PolicyKey, StrategyType};
use crate::domain::rule;
use crate::domain::strategy::Strategy;
use crate::error::TasError;

const BODY_LIMIT_BYTES: usize = 1024 * 1024 * 1024;
const POD_POLICY_LABEL: &str = "telemetry-policy";

/* ============================= PROMETHEUS ============================= */

static EXTENDER_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static EXTENDER_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("extender_requests_total", "Total scheduler extender requests"),
        &["verb", "outcome"],
    )
    .expect("metric definition is valid");
    EXTENDER_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static EXTENDER_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "extender_request_duration_seconds",
            "Duration of scheduler extender request processing in seconds",
        ),
        &["verb"],
    )
    .expect("metric definition is valid");
    EXTENDER_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Forces the lazy metrics to register themselves so `/metrics` is never
/// empty before the first request of each kind arrives.
fn force_metric_registration() {
    LazyLock::force(&EXTENDER_REQUESTS);
    LazyLock::force(&EXTENDER_DURATION);
}

/* ============================= READINESS ============================= */

/// Flipped by the cache-refresh and controller loops once each has
/// completed its first pass. `/readyz` reports 503 until both are true.
#[derive(Clone)]
pub struct Readiness {
    pub cache_refreshed: Arc<AtomicBool>,
    pub controller_synced: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new() -> Self {
        Readiness {
            cache_refreshed: Arc::new(AtomicBool::new(false)),
            controller_synced: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_ready(&self) -> bool {
        self.cache_refreshed.load(Ordering::Relaxed) && self.controller_synced.load(Ordering::Relaxed)
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ExtenderState {
    pub cache: CacheHandle,
    pub readiness: Readiness,
}

/* ============================= CONFIG ============================= */

pub struct TlsConfig {
    pub server_cert: String,
    pub server_key: String,
    pub client_ca_bundle: String,
}

/* ============================= WIRE TYPES ============================= */

/// Request body shared by `filter` and `prioritize`, matching the
/// orchestrator extender contract's capitalised field names (§6).
#[derive(Debug, Deserialize)]
pub struct ExtenderArgs {
    #[serde(rename = "Pod")]
    pub pod: Pod,
    #[serde(rename = "Nodes", default)]
    pub nodes: Option<NodeList>,
    #[serde(rename = "NodeNames", default)]
    pub node_names: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Default)]
pub struct FilterResult {
    #[serde(rename = "Nodes", skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,
    #[serde(rename = "NodeNames", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    #[serde(rename = "FailedNodes")]
    pub failed_nodes: HashMap<String, String>,
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HostPriority {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Score")]
    pub score: i64,
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: ExtenderState) -> Router {
    force_metric_registration();
    Router::new()
        .route("/scheduler/filter", post(filter_handler))
        .route("/scheduler/prioritize", post(prioritize_handler))
        .route("/scheduler/bind", post(bind_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(middleware::from_fn(body_size_guard))
        .layer(middleware::from_fn(content_type_guard))
        .with_state(state)
}

/// First stage of §4.7's explicit pass/fail middleware pipeline: every
/// request must declare `Content-Type: application/json`, or the pipeline
/// terminates with 415 before the body is ever parsed. `.layer()` wraps the
/// whole router (routing and method dispatch included), and layers added
/// later wrap outer, so this is the last layer added in `build_router` —
/// it runs before `body_size_guard` and before the router's own method
/// dispatch, regardless of whether the request's method would ultimately
/// match a route.
async fn content_type_guard(request: Request, next: Next) -> Response {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    if !is_json {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }
    next.run(request).await
}

/// Second stage of the pipeline: body size (413), checked eagerly from a
/// declared `Content-Length` before the router dispatches on method — this
/// is what actually puts body-size ahead of method in the pipeline order
/// (SPEC_FULL.md §4.7). `DefaultBodyLimit` alone isn't enough for that: it
/// only enforces the cap when a handler's `Json` extractor reads the body,
/// i.e. after method dispatch already succeeded, so a wrong-method request
/// would never see 413 from it. A request with no `Content-Length` (e.g.
/// chunked transfer) falls through to `DefaultBodyLimit`'s read-time check.
async fn body_size_guard(request: Request, next: Next) -> Response {
    let too_large = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len > BODY_LIMIT_BYTES)
        .unwrap_or(false);

    if too_large {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body exceeds the 1 GiB limit",
        )
            .into_response();
    }
    next.run(request).await
}

async fn readyz_handler(State(state): State<ExtenderState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = EXTENDER_REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= FILTER ============================= */

fn candidate_node_ids(args: &ExtenderArgs) -> Vec<String> {
    if let Some(names) = &args.node_names {
        return names.clone();
    }
    args.nodes
        .as_ref()
        .map(|list| list.items.iter().filter_map(node_name).collect())
        .unwrap_or_default()
}

fn node_name(node: &Node) -> Option<String> {
    node.metadata.name.clone()
}

fn pod_policy_name(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(POD_POLICY_LABEL))
        .map(|s| s.as_str())
}

/// Filter algorithm, §4.7: missing pod label → 400; unknown policy → pass
/// candidates through unchanged (the extender falls back, rather than
/// erroring, because a pod that isn't policy-aware must still schedule);
/// no registered don't-schedule strategy → unchanged (the resolved open
/// question); otherwise partition by `Strategy::violated`.
async fn filter_handler(
    State(state): State<ExtenderState>,
    Json(args): Json<ExtenderArgs>,
) -> Response {
    let _timer = EXTENDER_DURATION.with_label_values(&["filter"]).start_timer();

    let Some(policy_name) = pod_policy_name(&args.pod) else {
        EXTENDER_REQUESTS.with_label_values(&["filter", "invalid_argument"]).inc();
        return TasError::InvalidArgument(format!("pod carries no '{POD_POLICY_LABEL}' label")).into_response();
    };
    let namespace = args.pod.metadata.namespace.clone().unwrap_or_default();

    let policy = match state.cache.read_policy(&PolicyKey::new(namespace, policy_name)).await {
        Ok(p) => p,
        Err(_) => {
            EXTENDER_REQUESTS.with_label_values(&["filter", "unknown_policy"]).inc();
            return Json(unchanged_filter_result(&args)).into_response();
        }
    };

    let Some(spec) = &policy.strategies.dontschedule else {
        EXTENDER_REQUESTS.with_label_values(&["filter", "no_dontschedule"]).inc();
        return Json(unchanged_filter_result(&args)).into_response();
    };
    let strategy = Strategy::from_spec(StrategyType::Dontschedule, spec);

    let violated = match strategy.violated(&state.cache).await {
        Ok(v) => v,
        Err(e) => {
            warn!(policy = policy_name, error = %e, "failed to evaluate dontschedule violation");
            EXTENDER_REQUESTS.with_label_values(&["filter", "error"]).inc();
            return Json(unchanged_filter_result(&args)).into_response();
        }
    };

    let candidates = candidate_node_ids(&args);
    let mut failed_nodes = HashMap::new();
    let mut kept = Vec::new();
    for node in candidates {
        if violated.contains(&node) {
            failed_nodes.insert(node, format!("Node violates {policy_name}"));
        } else {
            kept.push(node);
        }
    }

    EXTENDER_REQUESTS.with_label_values(&["filter", "ok"]).inc();
    Json(FilterResult {
        nodes: args.nodes.as_ref().map(|list| NodeList {
            items: list.items.iter().filter(|n| node_name(n).map(|name| !failed_nodes.contains_key(&name)).unwrap_or(false)).cloned().collect(),
            metadata: list.metadata.clone(),
        }),
        node_names: args.node_names.as_ref().map(|_| kept),
        failed_nodes,
        error: String::new(),
    })
    .into_response()
}

fn unchanged_filter_result(args: &ExtenderArgs) -> FilterResult {
    FilterResult {
        nodes: args.nodes.clone(),
        node_names: args.node_names.clone(),
        failed_nodes: HashMap::new(),
        error: String::new(),
    }
}

/* ============================= PRIORITIZE ============================= */

/// Prioritize algorithm, §4.7: any lookup/decode failure yields an empty
/// priority list rather than an error response, so the default scheduler
/// treats every candidate as equally preferable (safe no-op).
async fn prioritize_handler(
    State(state): State<ExtenderState>,
    Json(args): Json<ExtenderArgs>,
) -> Response {
    let _timer = EXTENDER_DURATION.with_label_values(&["prioritize"]).start_timer();

    let result = prioritize(&state, &args).await;
    let outcome = if result.is_empty() { "empty" } else { "ok" };
    EXTENDER_REQUESTS.with_label_values(&["prioritize", outcome]).inc();
    Json(result).into_response()
}

async fn prioritize(state: &ExtenderState, args: &ExtenderArgs) -> Vec<HostPriority> {
    let Some(policy_name) = pod_policy_name(&args.pod) else {
        return Vec::new();
    };
    let namespace = args.pod.metadata.namespace.clone().unwrap_or_default();

    let Ok(policy) = state.cache.read_policy(&PolicyKey::new(namespace, policy_name)).await else {
        return Vec::new();
    };
    let Some(spec) = &policy.strategies.scheduleonmetric else {
        return Vec::new();
    };
    let strategy = Strategy::from_spec(StrategyType::Scheduleonmetric, spec);
    let Strategy::ScheduleOnMetric { rule: r, .. } = strategy else {
        return Vec::new();
    };

    let Ok(snapshot) = state.cache.read_metric_or_empty(&r.metric_name).await else {
        return Vec::new();
    };

    let candidates: std::collections::HashSet<String> = candidate_node_ids(args).into_iter().collect();
    let values: HashMap<String, rust_decimal::Decimal> = snapshot
        .into_iter()
        .filter(|(node, _)| candidates.contains(node))
        .map(|(node, sample)| (node, sample.value))
        .collect();

    let ordered = rule::ordered_by_comparator(&values, r.operator);
    rule::scores_from_order(&ordered)
        .into_iter()
        .map(|(host, score)| HostPriority { host, score })
        .collect()
}

/// `bind` must exist per the extender contract but this system never binds
/// pods itself; it always declines, letting the default scheduler bind.
async fn bind_handler() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

/* ============================= TLS / SERVE ============================= */

/// Builds a `rustls::ServerConfig` requiring client certificates signed by
/// `client_ca_bundle`, restricted to TLS 1.2 with
/// ECDHE-ECDSA-AES-256-GCM-SHA384 and the P-256/P-384 curves the `ring`
/// crypto provider exposes (§4.7; `ring` does not implement P-521, so that
/// curve cannot be offered — recorded in DESIGN.md).
fn build_server_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    let cert_chain = load_certs(&tls.server_cert)?;
    let key = load_private_key(&tls.server_key)?;
    let client_roots = load_root_store(&tls.client_ca_bundle)?;

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(client_roots))
        .build()
        .context("failed to build client certificate verifier")?;

    use rustls::crypto::SupportedKxGroup;

    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites.retain(|suite| {
        suite.suite() == rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    });
    provider.kx_groups.retain(|group| {
        group.name() == rustls::NamedGroup::secp256r1 || group.name() == rustls::NamedGroup::secp384r1
    });

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12])
        .context("failed to restrict protocol versions to TLS 1.2")?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)
        .context("failed to load server certificate/key into TLS config")?;

    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(Path::new(path)).with_context(|| format!("failed to open certificate file '{path}'"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in '{path}'"))
}

fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path)).with_context(|| format!("failed to open key file '{path}'"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key in '{path}'"))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in '{path}'"))
}

fn load_root_store(path: &str) -> Result<rustls::RootCertStore> {
    let mut store = rustls::RootCertStore::empty();
    for cert in load_certs(path)? {
        store.add(cert).context("failed to add CA certificate to client root store")?;
    }
    Ok(store)
}

/// Serves the extender until `shutdown` fires, grounded on
/// `commands/webhook.rs`'s `start_https_server` (graceful-shutdown handle
/// pattern), generalized to a hand-built `rustls::ServerConfig` for mTLS.
pub async fn serve(
    state: ExtenderState,
    addr: SocketAddr,
    tls: &TlsConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_router(state);
    let server_config = build_server_config(tls)?;
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(server_config));

    info!(addr = %addr, "scheduler extender listening");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
