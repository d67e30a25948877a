use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub fn make_test_node(name: &str, labels: &[(&str, &str)]) -> Node {
    let mut label_map = BTreeMap::new();
    for (k, v) in labels {
        label_map.insert(k.to_string(), v.to_string());
    }
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(label_map),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: None,
    }
}

pub fn make_test_pod(name: &str, namespace: &str, policy_name: &str) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert("telemetry-policy".to_string(), policy_name.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: None,
    }
}
