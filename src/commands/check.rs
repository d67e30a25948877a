use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};

use tas_scheduler::crd::TasPolicy;

/// Cluster connectivity and RBAC smoke test: kubeconfig loads, the cluster
/// is reachable, and the process can list/watch `TasPolicy` resources and
/// patch node labels, the two permissions the controller and enforcement
/// loop need at runtime.
pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    print!("  List TasPolicy permission .... ");
    let policies: Api<TasPolicy> = Api::all(client.clone());
    match policies.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    print!("  List nodes permission ........ ");
    let nodes: Api<Node> = Api::all(client.clone());
    let probe_node = match nodes.list(&ListParams::default().limit(1)).await {
        Ok(list) => {
            println!("OK ({} node(s) visible)", list.items.len());
            list.items.into_iter().next()
        }
        Err(e) => {
            println!("FAIL ({})", e);
            None
        }
    };

    print!("  Patch node label permission .. ");
    match probe_node.as_ref().and_then(|n| n.metadata.name.clone()) {
        Some(name) => {
            // A no-op merge patch: same empty labels object, so it never
            // actually mutates the node, only proves the verb is allowed.
            let patch = serde_json::json!({ "metadata": { "labels": {} } });
            match nodes
                .patch(&name, &PatchParams::apply("tas-scheduler-check"), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => println!("OK"),
                Err(e) => println!("FAIL ({})", e),
            }
        }
        None => println!("SKIPPED (no node available to probe)"),
    }

    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}
