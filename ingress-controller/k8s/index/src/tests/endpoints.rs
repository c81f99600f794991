use super::*;
use ingress_controller_core::ClusterDiscovery;
use ingress_controller_k8s_api::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, IntOrString,
};
use ingress_controller_xds::{CacheMetrics, EndpointCache};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;

fn service_targeting(name: Option<&str>, port: i32, target: IntOrString) -> Object {
    k8s::Service {
        metadata: meta("app", "backend"),
        spec: Some(k8s::ServiceSpec {
            ports: Some(vec![k8s::ServicePort {
                name: name.map(str::to_string),
                port,
                target_port: Some(target),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
    .into()
}

/// The Endpoints object the API derives for a single-port service: the port
/// carries the service port's name and the resolved container port.
fn endpoints(port_name: Option<&str>, container_port: i32) -> Endpoints {
    Endpoints {
        metadata: meta("app", "backend"),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.1".to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                name: port_name.map(str::to_string),
                port: container_port,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

fn eds_names(output: &BuildOutput) -> Vec<String> {
    output
        .graph
        .clusters
        .values()
        .filter_map(|cluster| match &cluster.discovery {
            ClusterDiscovery::Eds { service_name } => Some(service_name.clone()),
            _ => None,
        })
        .collect()
}

fn assignment_names(endpoints: Endpoints) -> Vec<String> {
    let mut cache = EndpointCache::new(&CacheMetrics::default());
    cache.apply(endpoints);
    cache
        .cache()
        .snapshot()
        .names()
        .map(str::to_string)
        .collect()
}

fn routed_to_port(port: serde_json::Value) -> Object {
    proxy(
        "app",
        "web",
        json!({
            "virtualhost": { "fqdn": "x.example.com" },
            "routes": [{
                "conditions": [{ "prefix": "/" }],
                "services": [{ "name": "backend", "port": port }],
            }],
        }),
    )
}

#[test]
fn unnamed_port_with_named_target_matches_its_endpoints() {
    let output = build([
        service_targeting(None, 80, IntOrString::String("http".to_string())),
        routed_to_port(json!(80)),
    ]);
    assert_eq!(eds_names(&output), vec!["app/backend"]);
    assert_eq!(assignment_names(endpoints(None, 8080)), eds_names(&output));
}

#[test]
fn unnamed_port_with_numeric_target_matches_its_endpoints() {
    let output = build([
        service_targeting(None, 80, IntOrString::Int(8080)),
        routed_to_port(json!(80)),
    ]);
    assert_eq!(assignment_names(endpoints(None, 8080)), eds_names(&output));
}

#[test]
fn named_port_matches_its_endpoints() {
    let output = build([
        service_targeting(Some("web"), 80, IntOrString::String("http".to_string())),
        routed_to_port(json!(80)),
    ]);
    assert_eq!(eds_names(&output), vec!["app/backend/web"]);
    assert_eq!(assignment_names(endpoints(Some("web"), 8080)), eds_names(&output));
}
