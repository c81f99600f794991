#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod delegation;
pub mod extension_service;
pub mod httpproxy;
mod status;

pub use self::{
    delegation::{CertificateDelegation, TlsCertificateDelegation, TlsCertificateDelegationSpec},
    extension_service::{ExtensionService, ExtensionServiceSpec, ExtensionServiceStatus},
    httpproxy::{HttpProxy, HttpProxySpec, HttpProxyStatus},
    status::{DetailedCondition, SubCondition},
};
pub use k8s_openapi::{
    api::{
        core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service, ServicePort,
            ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{ObjectMeta, Time},
        util::intstr::IntOrString,
    },
    ByteString,
};
pub use kube::{
    api::{Api, Patch, PatchParams},
    Client, Error, Resource, ResourceExt,
};

/// The API group of the custom resources served by this controller.
pub const API_GROUP: &str = "projectcontour.io";

/// The annotations that select an ingress class.
pub const INGRESS_CLASS_ANNOTATIONS: [&str; 2] =
    ["projectcontour.io/ingress.class", "kubernetes.io/ingress.class"];

/// The ingress class accepted when none is configured.
pub const DEFAULT_INGRESS_CLASS: &str = "contour";
