//! `toServices` rule translation.
//!
//! Egress rules may reference services instead of addresses. Before such a
//! rule is enforceable, the reference is materialized into the concrete
//! backend addresses of the service, either when the rule is imported
//! (against the current tables) or when the service's endpoints change
//! (against the policy repository).

use anyhow::Result;
use knet_agent_core::policy::{Cidr, ServiceMatch};
use knet_agent_core::{EndpointsInfo, Rule, RuleTranslator, ServiceKey};
use std::collections::BTreeMap;

use crate::lb::LbTables;

/// Rewrites rules that reference one service, inserting (or, on revert,
/// removing) its backend addresses.
pub(crate) struct ServiceTranslator {
    key: ServiceKey,
    endpoints: EndpointsInfo,
    revert: bool,
    labels: BTreeMap<String, String>,
}

// === impl ServiceTranslator ===

impl ServiceTranslator {
    pub(crate) fn new(
        key: ServiceKey,
        endpoints: EndpointsInfo,
        revert: bool,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            key,
            endpoints,
            revert,
            labels,
        }
    }

    fn selects(&self, m: &ServiceMatch) -> bool {
        service_matches(m, &self.key, &self.labels)
    }
}

impl RuleTranslator for ServiceTranslator {
    fn translate(&self, rule: &mut Rule) -> Result<()> {
        for egress in &mut rule.egress {
            if !egress.to_services.iter().any(|m| self.selects(m)) {
                continue;
            }
            if self.revert {
                remove_backend_cidrs(&self.endpoints, &mut egress.to_cidrs);
            } else {
                insert_backend_cidrs(&self.endpoints, &mut egress.to_cidrs);
            }
        }
        Ok(())
    }
}

fn service_matches(m: &ServiceMatch, key: &ServiceKey, labels: &BTreeMap<String, String>) -> bool {
    if let Some(named) = &m.k8s_service {
        return named.service_name == key.name && named.namespace == key.namespace;
    }
    if let Some(by_selector) = &m.k8s_service_selector {
        return by_selector.namespace == key.namespace && by_selector.selector.matches(labels);
    }
    false
}

fn insert_backend_cidrs(endpoints: &EndpointsInfo, cidrs: &mut Vec<Cidr>) {
    for ip in &endpoints.backend_ips {
        let cidr = Cidr::from(*ip);
        if !cidrs.contains(&cidr) {
            cidrs.push(cidr);
        }
    }
}

fn remove_backend_cidrs(endpoints: &EndpointsInfo, cidrs: &mut Vec<Cidr>) {
    cidrs.retain(|cidr| !endpoints.backend_ips.iter().any(|ip| *cidr == Cidr::from(*ip)));
}

/// Rewrites freshly parsed rules against the current service/endpoints
/// tables; run under the load-balancer lock during policy import.
pub(crate) fn preprocess_rules(rules: &mut [Rule], tables: &LbTables) -> Result<()> {
    for (key, svc) in tables.services.iter() {
        let Some(eps) = tables.endpoints.get(key) else {
            continue;
        };
        let translator =
            ServiceTranslator::new(key.clone(), eps.clone(), false, svc.labels.clone());
        for rule in rules.iter_mut() {
            translator.translate(rule)?;
        }
    }
    Ok(())
}
