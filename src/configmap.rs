use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::crd::{AnyPolicy, ContextAwareResource, PolicyServer};
use crate::errors::ReconcileError;

/* ============================= CONSTANTS ============================= */

pub const POLICIES_KEY: &str = "policies.yml";
pub const SOURCES_KEY: &str = "sources.yml";

/* ============================= TYPES ============================= */

/// Origin of a namespaced policy, preserved so the policy server can report
/// results against the source object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

/// One entry of the `policies.yml` map handed to the policy server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    pub url: String,

    pub allowed_to_mutate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaced_name: Option<NamespacedName>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_aware_resources: Vec<ContextAwareResource>,
}

/// A per-registry certificate authority, `sources.yml` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

/// The `sources.yml` document: registry trust configuration.
/// Empty collections are omitted so an unconfigured server gets `{}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourcesDocument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_sources: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_authorities: BTreeMap<String, Vec<DataSource>>,
}

/* ============================= ASSEMBLY ============================= */

/// Serialize the policy map for a server. `BTreeMap` keys keep the output
/// canonical, so byte equality is meaningful for unchanged content.
pub fn policies_document(policies: &[AnyPolicy]) -> Result<String, ReconcileError> {
    let mut map: BTreeMap<String, PolicyEntry> = BTreeMap::new();
    for policy in policies {
        let spec = policy.spec();
        map.insert(
            policy.unique_name(),
            PolicyEntry {
                url: spec.module.clone(),
                allowed_to_mutate: spec.mutating,
                settings: spec.settings.clone(),
                namespaced_name: policy.namespace().map(|namespace| NamespacedName {
                    namespace,
                    name: policy.name(),
                }),
                context_aware_resources: spec.context_aware_resources.clone().unwrap_or_default(),
            },
        );
    }
    serde_json::to_string(&map)
        .map_err(|e| ReconcileError::InvalidConfig(format!("policy map serialization: {e}")))
}

pub fn sources_document(server: &PolicyServer) -> Result<String, ReconcileError> {
    let doc = SourcesDocument {
        insecure_sources: server.spec.insecure_sources.clone().unwrap_or_default(),
        source_authorities: server
            .spec
            .source_authorities
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(host, pems)| {
                let authorities = pems
                    .into_iter()
                    .map(|pem| DataSource {
                        kind: "Data".to_string(),
                        data: pem,
                    })
                    .collect();
                (host, authorities)
            })
            .collect(),
    };
    serde_json::to_string(&doc)
        .map_err(|e| ReconcileError::InvalidConfig(format!("sources serialization: {e}")))
}

/// Whether the server has any registry trust configuration worth mounting.
pub fn has_sources(server: &PolicyServer) -> bool {
    server
        .spec
        .insecure_sources
        .as_ref()
        .is_some_and(|s| !s.is_empty())
        || server
            .spec
            .source_authorities
            .as_ref()
            .is_some_and(|s| !s.is_empty())
}

/// Write the desired data into the server's ConfigMap.
pub fn fill_config_map(
    cm: &mut ConfigMap,
    namespace: &str,
    server: &PolicyServer,
    policies: &[AnyPolicy],
) -> Result<(), ReconcileError> {
    cm.metadata.name = Some(server.resource_name());
    cm.metadata.namespace = Some(namespace.to_string());
    if let Some(owner) = server.controller_owner_ref(&()) {
        let owners = cm.metadata.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner);
        }
    }

    let data = cm.data.get_or_insert_with(BTreeMap::new);
    let policies_json = policies_document(policies)?;
    let sources_json = sources_document(server)?;

    // Only replace a data key when its parsed content differs; the API
    // server is free to hand back reordered JSON.
    if !json_equal(data.get(POLICIES_KEY), &policies_json) {
        data.insert(POLICIES_KEY.to_string(), policies_json);
    }
    if !json_equal(data.get(SOURCES_KEY), &sources_json) {
        data.insert(SOURCES_KEY.to_string(), sources_json);
    }
    Ok(())
}

pub fn build_config_map(
    namespace: &str,
    server: &PolicyServer,
    policies: &[AnyPolicy],
) -> Result<ConfigMap, ReconcileError> {
    let mut cm = ConfigMap::default();
    fill_config_map(&mut cm, namespace, server, policies)?;
    Ok(cm)
}

/* ============================= COMPARISON ============================= */

/// Structural equality of two JSON strings. Key order never counts.
fn json_equal(existing: Option<&String>, desired: &str) -> bool {
    let Some(existing) = existing else {
        return false;
    };
    let Ok(a) = serde_json::from_str::<serde_json::Value>(existing) else {
        return false;
    };
    let Ok(b) = serde_json::from_str::<serde_json::Value>(desired) else {
        return false;
    };
    a == b
}

/// Whether the stored ConfigMap content differs from the desired content,
/// comparing parsed structures rather than raw strings.
pub fn should_update(existing: &ConfigMap, desired: &ConfigMap) -> bool {
    let empty = BTreeMap::new();
    let existing_data = existing.data.as_ref().unwrap_or(&empty);
    let desired_data = desired.data.as_ref().unwrap_or(&empty);

    for key in [POLICIES_KEY, SOURCES_KEY] {
        let desired_value = desired_data.get(key).map(String::as_str).unwrap_or("{}");
        if !json_equal(existing_data.get(key), desired_value) {
            return true;
        }
    }
    false
}

/* ============================= TESTS ============================= */
