//! Builders for Kubernetes objects used across unit tests

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub fn address(ip: &str, pod: Option<&str>) -> EndpointAddress {
    EndpointAddress {
        ip: ip.to_string(),
        target_ref: pod.map(|name| ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn subset(ports: &[i32], addresses: Vec<EndpointAddress>) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(addresses),
        ports: Some(
            ports
                .iter()
                .map(|port| EndpointPort {
                    port: *port,
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn endpoints(namespace: &str, name: &str, subsets: Vec<EndpointSubset>) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(subsets),
    }
}

pub fn service(namespace: &str, name: &str, annotations: &[(&str, &str)]) -> Service {
    let annotations: BTreeMap<String, String> = annotations
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}
