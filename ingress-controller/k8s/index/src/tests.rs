mod endpoints;

use crate::{BuildOutput, Builder, Config, Object, ObjectStore};
use ingress_controller_core::{
    graph::{Forward, Route, RouteAction},
    ObjectKey, RoutingGraph, StatusResult, VirtualHost,
};
use ingress_controller_k8s_api::{
    self as k8s, extension_service::ExtensionServiceSpec, httpproxy::HttpProxySpec, ByteString,
    ExtensionService, HttpProxy, ObjectMeta,
};
use maplit::btreemap;
use serde_json::json;

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn service(ns: &str, name: &str, ports: &[(Option<&str>, i32)]) -> Object {
    k8s::Service {
        metadata: meta(ns, name),
        spec: Some(k8s::ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| k8s::ServicePort {
                        name: port_name.map(str::to_string),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
    .into()
}

fn tls_secret(ns: &str, name: &str) -> Object {
    k8s::Secret {
        metadata: meta(ns, name),
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(btreemap! {
            "tls.crt".to_string() => ByteString(b"cert".to_vec()),
            "tls.key".to_string() => ByteString(b"key".to_vec()),
        }),
        ..Default::default()
    }
    .into()
}

fn ca_secret(ns: &str, name: &str) -> Object {
    k8s::Secret {
        metadata: meta(ns, name),
        type_: Some("Opaque".to_string()),
        data: Some(btreemap! {
            "ca.crt".to_string() => ByteString(b"ca".to_vec()),
        }),
        ..Default::default()
    }
    .into()
}

fn proxy(ns: &str, name: &str, spec: serde_json::Value) -> Object {
    HttpProxy {
        metadata: meta(ns, name),
        spec: serde_json::from_value::<HttpProxySpec>(spec).expect("spec must be valid"),
        status: None,
    }
    .into()
}

fn proxy_created_at(ns: &str, name: &str, created: &str, spec: serde_json::Value) -> Object {
    let mut metadata = meta(ns, name);
    metadata.creation_timestamp =
        Some(serde_json::from_value(json!(created)).expect("timestamp must be valid"));
    HttpProxy {
        metadata,
        spec: serde_json::from_value::<HttpProxySpec>(spec).expect("spec must be valid"),
        status: None,
    }
    .into()
}

fn extension_service(ns: &str, name: &str, spec: serde_json::Value) -> Object {
    ExtensionService {
        metadata: meta(ns, name),
        spec: serde_json::from_value::<ExtensionServiceSpec>(spec).expect("spec must be valid"),
        status: None,
    }
    .into()
}

fn build(objects: impl IntoIterator<Item = Object>) -> BuildOutput {
    build_with(Config::default(), objects)
}

fn build_with(config: Config, objects: impl IntoIterator<Item = Object>) -> BuildOutput {
    let mut store = ObjectStore::new(None);
    for object in objects {
        store.insert(object);
    }
    Builder::new(config).build(&store.snapshot())
}

fn status<'o>(output: &'o BuildOutput, key: &ObjectKey) -> &'o StatusResult {
    output
        .statuses
        .get(key)
        .unwrap_or_else(|| panic!("no status recorded for {key}"))
}

fn vhost<'g>(graph: &'g RoutingGraph, listener: &str, fqdn: &str) -> Option<&'g VirtualHost> {
    graph
        .listener(listener)?
        .virtual_hosts
        .iter()
        .find(|vh| vh.fqdn == fqdn)
}

fn forward(route: &Route) -> &Forward {
    match &route.action {
        RouteAction::Forward(forward) => forward,
        action => panic!("expected a forwarding route, got {action:?}"),
    }
}

fn cluster_names(route: &Route) -> Vec<&str> {
    forward(route)
        .clusters
        .iter()
        .map(|c| c.name.as_str())
        .collect()
}
