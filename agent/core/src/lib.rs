//! Core types for the knet agent's cluster-state reconciliation engine.
//!
//! The engine watches orchestrator resources and reconciles them into four
//! local subsystems: the policy repository (external, behind
//! [`PolicyEngine`]), the load-balancer service table, the IP-to-identity
//! cache and the node/tunneling table. This crate holds the domain types
//! shared by those subsystems and the traits through which the engine talks
//! to the rest of the agent:
//!
//! - [`PolicyEngine`] — the agent's policy repository.
//! - [`Datapath`] — the service/reverse-NAT programming surface.
//! - [`EndpointManager`] — the agent's local workload endpoints.
//!
//! Everything here is orchestrator-agnostic; the Kubernetes-specific
//! reconciliation lives in the `k8s` crates.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod endpoint;
mod ipcache;
pub mod labels;
mod lb;
mod node;
pub mod policy;

pub use self::{
    config::Config,
    endpoint::{Endpoint, EndpointManager},
    ipcache::{Identity, IpIdentity, IpIdentityCache, Source},
    labels::{Label, LabelSet, Selector},
    lb::{
        Backend, Datapath, EndpointsInfo, FrontendAddr, FrontendAddrId, FrontendPort, L4Addr,
        L4Proto, ServiceId, ServiceInfo, ServiceKey,
    },
    node::{NodeEntry, NodeIdentity, NodeRecord, NodeTable, RouteTypes},
    policy::{PolicyEngine, Rule, RuleTranslator},
};
pub use ipnet::IpNet;
