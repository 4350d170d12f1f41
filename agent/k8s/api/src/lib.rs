#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;

pub use self::policy::{
    policy_labels, KnetNetworkPolicy, KnetNetworkPolicySpec, KnetNetworkPolicyStatus,
    PolicyNodeStatus,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Endpoints, LoadBalancerIngress, Namespace, Node, NodeSpec, NodeStatus, Pod, PodSpec,
            PodStatus, Service, ServicePort, ServiceSpec,
        },
        networking::v1::{Ingress, IngressSpec, IngressStatus, NetworkPolicy},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::{
        self,
        pkg::{
            apis::meta::v1::{LabelSelector, Time},
            util::intstr::IntOrString,
        },
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    core::WatchEvent,
    error::ErrorResponse,
    Client, CustomResourceExt, Error,
};

/// Annotation through which a node publishes the address of its agent
/// interface.
pub const AGENT_HOST_IP_ANNOTATION: &str = "knet.io/agent-host-ip";
