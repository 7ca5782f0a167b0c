use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use kube::core::TypeMeta;
use serde::{Deserialize, Serialize};

/* ============================= CONSTANTS ============================= */

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kubewarden";
pub const RUN_UID_LABEL: &str = "kubewarden.io/audit-scanner-run-uid";

const WGPOLICY_GROUP: &str = "wgpolicyk8s.io";
const WGPOLICY_VERSION: &str = "v1alpha2";
const OPENREPORTS_GROUP: &str = "openreports.io";
const OPENREPORTS_VERSION: &str = "v1alpha1";

/* ============================= SHARED PIECES ============================= */

/// Outcome of evaluating one policy against one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Pass,
    Fail,
    Warn,
    Error,
    Skip,
}

/// One row of a report's results list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportResult {
    pub source: String,

    pub policy: String,

    pub result: AuditOutcome,

    pub scored: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, String>>,
}

impl ReportResult {
    pub fn new(policy: impl Into<String>, result: AuditOutcome, message: Option<String>) -> Self {
        Self {
            source: MANAGED_BY_VALUE.to_string(),
            policy: policy.into(),
            result,
            scored: true,
            message,
            properties: None,
        }
    }
}

/// Aggregate counters over a report's results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSummary {
    #[serde(default)]
    pub pass: i64,
    #[serde(default)]
    pub fail: i64,
    #[serde(default)]
    pub warn: i64,
    #[serde(default)]
    pub error: i64,
    #[serde(default)]
    pub skip: i64,
}

pub fn summarize(results: &[ReportResult]) -> ReportSummary {
    let mut summary = ReportSummary::default();
    for r in results {
        match r.result {
            AuditOutcome::Pass => summary.pass += 1,
            AuditOutcome::Fail => summary.fail += 1,
            AuditOutcome::Warn => summary.warn += 1,
            AuditOutcome::Error => summary.error += 1,
            AuditOutcome::Skip => summary.skip += 1,
        }
    }
    summary
}

/// Identity of the object a report is about. The report is named after the
/// UID and owned by the object, so it is garbage-collected with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
}

fn report_labels(run_uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (RUN_UID_LABEL.to_string(), run_uid.to_string()),
    ])
}

fn scanned_owner(scanned: &ScannedResource) -> OwnerReference {
    OwnerReference {
        api_version: scanned.api_version.clone(),
        kind: scanned.kind.clone(),
        name: scanned.name.clone(),
        uid: scanned.uid.clone(),
        controller: None,
        block_owner_deletion: None,
    }
}

/// Metadata every report shares: named by the scanned object's UID, labeled
/// with the run UID, owned by the scanned object.
pub fn report_metadata(scanned: &ScannedResource, run_uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(scanned.uid.clone()),
        namespace: scanned.namespace.clone(),
        labels: Some(report_labels(run_uid)),
        owner_references: Some(vec![scanned_owner(scanned)]),
        ..Default::default()
    }
}

/// Apply the shared report fields onto any report object's parts.
fn fill_common(
    metadata: &mut ObjectMeta,
    results_slot: &mut Vec<ReportResult>,
    summary_slot: &mut ReportSummary,
    scanned: &ScannedResource,
    run_uid: &str,
    results: Vec<ReportResult>,
) {
    let desired = report_metadata(scanned, run_uid);
    metadata.name = desired.name;
    metadata.namespace = desired.namespace;
    metadata.labels = desired.labels;
    metadata.owner_references = desired.owner_references;
    *summary_slot = summarize(&results);
    *results_slot = results;
}

/* ============================= WGPOLICY FAMILY ============================= */

macro_rules! report_kind {
    ($type:ident, $kind:literal, $group:expr, $version:expr, $plural:literal, $scope:ty) => {
        #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
        pub struct $type {
            #[serde(flatten)]
            pub types: Option<TypeMeta>,
            pub metadata: ObjectMeta,
            #[serde(default, skip_serializing_if = "Vec::is_empty")]
            pub results: Vec<ReportResult>,
            #[serde(default)]
            pub summary: ReportSummary,
        }

        impl Resource for $type {
            type DynamicType = ();
            type Scope = $scope;

            fn kind(_: &()) -> Cow<'_, str> {
                $kind.into()
            }
            fn group(_: &()) -> Cow<'_, str> {
                $group.into()
            }
            fn version(_: &()) -> Cow<'_, str> {
                $version.into()
            }
            fn plural(_: &()) -> Cow<'_, str> {
                $plural.into()
            }
            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }

        impl $type {
            /// Overwrite this object with the desired state for a scan run.
            /// Shaped as a mutator so it slots into `create_or_patch`.
            pub fn fill(
                &mut self,
                scanned: &ScannedResource,
                run_uid: &str,
                results: Vec<ReportResult>,
            ) {
                self.types = Some(TypeMeta {
                    api_version: format!("{}/{}", $group, $version),
                    kind: $kind.to_string(),
                });
                fill_common(
                    &mut self.metadata,
                    &mut self.results,
                    &mut self.summary,
                    scanned,
                    run_uid,
                    results,
                );
            }

            pub fn build(
                scanned: &ScannedResource,
                run_uid: &str,
                results: Vec<ReportResult>,
            ) -> Self {
                let mut report = Self::default();
                report.fill(scanned, run_uid, results);
                report
            }
        }
    };
}

// Legacy family, still the default the scanner writes.
report_kind!(
    PolicyReport,
    "PolicyReport",
    WGPOLICY_GROUP,
    WGPOLICY_VERSION,
    "policyreports",
    k8s_openapi::NamespaceResourceScope
);
report_kind!(
    ClusterPolicyReport,
    "ClusterPolicyReport",
    WGPOLICY_GROUP,
    WGPOLICY_VERSION,
    "clusterpolicyreports",
    k8s_openapi::ClusterResourceScope
);

/* ============================= OPENREPORTS FAMILY ============================= */

// Kinds are `Report` and `ClusterReport` on the wire; the Rust names carry
// the group to avoid clashing with everything else called "report".
report_kind!(
    OpenReport,
    "Report",
    OPENREPORTS_GROUP,
    OPENREPORTS_VERSION,
    "reports",
    k8s_openapi::NamespaceResourceScope
);
report_kind!(
    ClusterOpenReport,
    "ClusterReport",
    OPENREPORTS_GROUP,
    OPENREPORTS_VERSION,
    "clusterreports",
    k8s_openapi::ClusterResourceScope
);

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned_pod() -> ScannedResource {
        ScannedResource {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: "web-abc".to_string(),
            namespace: Some("team-a".to_string()),
            uid: "c3a9e1d2-1111-2222-3333-444455556666".to_string(),
        }
    }

    fn scanned_namespace() -> ScannedResource {
        ScannedResource {
            api_version: "v1".to_string(),
            kind: "Namespace".to_string(),
            name: "ns1".to_string(),
            namespace: None,
            uid: "ns1-uid".to_string(),
        }
    }

    // ── resource plumbing ──

    #[test]
    fn test_wgpolicy_resource_coordinates() {
        assert_eq!(PolicyReport::kind(&()), "PolicyReport");
        assert_eq!(PolicyReport::group(&()), "wgpolicyk8s.io");
        assert_eq!(PolicyReport::version(&()), "v1alpha2");
        assert_eq!(PolicyReport::plural(&()), "policyreports");
        assert_eq!(ClusterPolicyReport::plural(&()), "clusterpolicyreports");
    }

    #[test]
    fn test_openreports_resource_coordinates() {
        assert_eq!(OpenReport::kind(&()), "Report");
        assert_eq!(OpenReport::group(&()), "openreports.io");
        assert_eq!(ClusterOpenReport::kind(&()), "ClusterReport");
        assert_eq!(ClusterOpenReport::plural(&()), "clusterreports");
    }

    // ── metadata contract ──

    #[test]
    fn test_report_named_by_scanned_uid() {
        let report = PolicyReport::build(&scanned_pod(), "run-1", vec![]);
        assert_eq!(
            report.metadata.name.as_deref(),
            Some("c3a9e1d2-1111-2222-3333-444455556666")
        );
        assert_eq!(report.metadata.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_report_labels() {
        let report = PolicyReport::build(&scanned_pod(), "run-1", vec![]);
        let labels = report.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), "kubewarden");
        assert_eq!(labels.get(RUN_UID_LABEL).unwrap(), "run-1");
    }

    #[test]
    fn test_report_owned_by_scanned_resource() {
        let report = ClusterPolicyReport::build(&scanned_namespace(), "run-1", vec![]);
        let owners = report.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Namespace");
        assert_eq!(owners[0].name, "ns1");
        assert_eq!(owners[0].uid, "ns1-uid");
    }

    #[test]
    fn test_cluster_report_has_no_namespace() {
        let report = ClusterPolicyReport::build(&scanned_namespace(), "run-1", vec![]);
        assert!(report.metadata.namespace.is_none());
    }

    // ── summary ──

    #[test]
    fn test_summary_counts() {
        let results = vec![
            ReportResult::new("clusterwide-a", AuditOutcome::Pass, None),
            ReportResult::new("clusterwide-b", AuditOutcome::Pass, None),
            ReportResult::new("clusterwide-c", AuditOutcome::Fail, Some("denied".into())),
            ReportResult::new("clusterwide-d", AuditOutcome::Error, Some("boom".into())),
            ReportResult::new("clusterwide-e", AuditOutcome::Skip, None),
        ];
        let summary = summarize(&results);
        assert_eq!(summary.pass, 2);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.skip, 1);
        assert_eq!(summary.warn, 0);
    }

    #[test]
    fn test_build_computes_summary() {
        let report = PolicyReport::build(
            &scanned_pod(),
            "run-1",
            vec![ReportResult::new(
                "namespaced-team-a-p1",
                AuditOutcome::Pass,
                None,
            )],
        );
        assert_eq!(report.summary.pass, 1);
        assert_eq!(report.results.len(), 1);
    }

    // ── serialization ──

    #[test]
    fn test_report_serializes_type_meta() {
        let report = PolicyReport::build(&scanned_pod(), "run-1", vec![]);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["apiVersion"], "wgpolicyk8s.io/v1alpha2");
        assert_eq!(v["kind"], "PolicyReport");
    }

    #[test]
    fn test_report_deserializes_without_type_meta() {
        // Items inside list responses drop apiVersion/kind.
        let json = r#"{
            "metadata": {"name": "some-uid"},
            "summary": {"pass": 1}
        }"#;
        let report: PolicyReport = serde_json::from_str(json).unwrap();
        assert!(report.types.is_none());
        assert_eq!(report.summary.pass, 1);
        assert!(report.results.is_empty());
    }

    #[test]
    fn test_result_row_shape() {
        let row = ReportResult::new(
            "clusterwide-p1",
            AuditOutcome::Fail,
            Some("pod rejected".into()),
        );
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["source"], "kubewarden");
        assert_eq!(v["policy"], "clusterwide-p1");
        assert_eq!(v["result"], "fail");
        assert_eq!(v["message"], "pod rejected");
        assert_eq!(v["scored"], true);
    }

    // ── fill is idempotent ──

    #[test]
    fn test_fill_idempotent() {
        let results = vec![ReportResult::new("p", AuditOutcome::Pass, None)];
        let mut once = PolicyReport::default();
        once.fill(&scanned_pod(), "run-1", results.clone());
        let mut twice = once.clone();
        twice.fill(&scanned_pod(), "run-1", results);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fill_replaces_previous_run() {
        let mut report = PolicyReport::build(
            &scanned_pod(),
            "run-1",
            vec![ReportResult::new("p", AuditOutcome::Fail, None)],
        );
        report.fill(
            &scanned_pod(),
            "run-2",
            vec![ReportResult::new("p", AuditOutcome::Pass, None)],
        );
        assert_eq!(
            report.metadata.labels.as_ref().unwrap().get(RUN_UID_LABEL).unwrap(),
            "run-2"
        );
        assert_eq!(report.summary.pass, 1);
        assert_eq!(report.summary.fail, 0);
    }
}
