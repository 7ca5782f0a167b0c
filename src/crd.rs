use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= CONSTANTS ============================= */

/// Finalizer shared by PolicyServer and both policy kinds.
pub const FINALIZER: &str = "kubewarden";

/// API group of every custom kind the operator owns.
pub const API_GROUP: &str = "policies.kubewarden.io";

/* ============================= POLICY MODE ============================= */

/// Execution mode of a policy.
///
/// `monitor` evaluates but never rejects; `protect` enforces. The transition
/// `monitor` → `protect` is allowed, the reverse is rejected at admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Protect,
    Monitor,
}

/// Failure policy applied by the API server when a policy server is
/// unreachable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    Ignore,
    #[default]
    Fail,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Ignore => "Ignore",
            FailurePolicy::Fail => "Fail",
        }
    }
}

/// A Kubernetes resource a context-aware policy is allowed to read at
/// evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextAwareResource {
    pub api_version: String,
    pub kind: String,
}

/* ============================= POLICY SPEC ============================= */

fn default_true() -> bool {
    true
}

/// Fields shared by AdmissionPolicy and ClusterAdmissionPolicy.
///
/// `settings` is carried as opaque JSON: the operator never interprets it,
/// it only hands it to the policy server verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Name of the PolicyServer that should host this policy. An empty value
    /// leaves the policy unscheduled.
    #[serde(default)]
    pub policy_server: String,

    /// Module URI (file://, http://, https:// or registry://).
    pub module: String,

    /// Opaque policy configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,

    /// Admission rules this policy subscribes to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleWithOperations>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    #[serde(default)]
    pub mode: PolicyMode,

    /// Whether the policy is allowed to mutate incoming objects.
    #[serde(default)]
    pub mutating: bool,

    /// Webhook match policy (`Exact` or `Equivalent`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,

    /// Webhook side-effect class, defaults to `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,

    /// Webhook timeout in seconds, 1 to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    /// Whether the audit scanner evaluates this policy against live
    /// resources.
    #[serde(default = "default_true")]
    pub background_audit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_aware_resources: Option<Vec<ContextAwareResource>>,
}

impl PolicySpec {
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }

    pub fn timeout_seconds(&self) -> i32 {
        self.timeout_seconds.unwrap_or(10)
    }

    pub fn side_effects(&self) -> &str {
        self.side_effects.as_deref().unwrap_or("None")
    }
}

/* ============================= POLICY STATUS ============================= */

/// Scheduling state of a policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatusPhase {
    /// No target policy server named in the spec.
    #[default]
    Unscheduled,
    /// Bound to a policy server that does not exist yet.
    Scheduled,
    /// The policy server exists but has not served the policy yet.
    Pending,
    /// Served and wired into a webhook configuration.
    Active,
}

/// Mode the policy is currently being served in, as observed from the
/// policy server's configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyModeStatus {
    Protect,
    Monitor,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub policy_status: PolicyStatusPhase,

    #[serde(default)]
    pub policy_mode: PolicyModeStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/* ============================= ADMISSION POLICY ============================= */

/// A namespaced admission policy. Its webhook is pinned to the policy's own
/// namespace and its rule scope is forced to `Namespaced`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicy",
    plural = "admissionpolicies",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,
}

/* ============================= CLUSTER ADMISSION POLICY ============================= */

/// A cluster-scoped admission policy. May carry a namespace selector to
/// restrict which namespaces its webhook applies to.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicy",
    plural = "clusteradmissionpolicies",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdmissionPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

/* ============================= ANY POLICY ============================= */

/// Either policy kind, with uniform access to the shared fields.
///
/// The unique name is the stable key used across the policy server
/// configuration, the webhook configuration and audit reports.
#[derive(Debug, Clone)]
pub enum AnyPolicy {
    Namespaced(AdmissionPolicy),
    Cluster(ClusterAdmissionPolicy),
}

impl AnyPolicy {
    /// Globally unique, cross-object policy key.
    pub fn unique_name(&self) -> String {
        match self {
            AnyPolicy::Namespaced(p) => format!(
                "namespaced-{}-{}",
                p.namespace().unwrap_or_default(),
                p.name_any()
            ),
            AnyPolicy::Cluster(p) => format!("clusterwide-{}", p.name_any()),
        }
    }

    pub fn spec(&self) -> &PolicySpec {
        match self {
            AnyPolicy::Namespaced(p) => &p.spec.policy,
            AnyPolicy::Cluster(p) => &p.spec.policy,
        }
    }

    pub fn status(&self) -> Option<&PolicyStatus> {
        match self {
            AnyPolicy::Namespaced(p) => p.status.as_ref(),
            AnyPolicy::Cluster(p) => p.status.as_ref(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            AnyPolicy::Namespaced(p) => p.name_any(),
            AnyPolicy::Cluster(p) => p.name_any(),
        }
    }

    /// The policy's own namespace; `None` for cluster-scoped policies.
    pub fn namespace(&self) -> Option<String> {
        match self {
            AnyPolicy::Namespaced(p) => p.namespace(),
            AnyPolicy::Cluster(_) => None,
        }
    }

    pub fn is_namespaced(&self) -> bool {
        matches!(self, AnyPolicy::Namespaced(_))
    }

    pub fn is_mutating(&self) -> bool {
        self.spec().mutating
    }

    /// User-provided namespace selector. Only meaningful for cluster-scoped
    /// policies; namespaced policies pin their own namespace instead.
    pub fn namespace_selector(&self) -> Option<&LabelSelector> {
        match self {
            AnyPolicy::Namespaced(_) => None,
            AnyPolicy::Cluster(p) => p.spec.namespace_selector.as_ref(),
        }
    }

    pub fn deletion_in_progress(&self) -> bool {
        match self {
            AnyPolicy::Namespaced(p) => p.metadata.deletion_timestamp.is_some(),
            AnyPolicy::Cluster(p) => p.metadata.deletion_timestamp.is_some(),
        }
    }

    /// Whether this policy participates in background audits: flagged for it
    /// and currently active.
    pub fn auditable(&self) -> bool {
        self.spec().background_audit
            && self
                .status()
                .map(|s| s.policy_status == PolicyStatusPhase::Active)
                .unwrap_or(false)
    }
}

/* ============================= POLICY SERVER ============================= */

/// Desired state of a policy-server fleet.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "PolicyServer",
    plural = "policyservers",
    status = "PolicyServerStatus",
    shortname = "ps"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerSpec {
    /// Container image running the policy server.
    pub image: String,

    /// Number of replicas backing the service.
    pub replicas: i32,

    /// Extra annotations for the server pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Environment overrides appended to the baseline variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Name of a `kubernetes.io/dockerconfigjson` secret used to pull
    /// policy modules from private registries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    /// Registry hosts reachable without TLS verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_sources: Option<Vec<String>>,

    /// Per-registry PEM certificate authorities, keyed by host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_authorities: Option<BTreeMap<String, Vec<String>>>,

    /// Name of a ConfigMap holding a Sigstore verification configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_config: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, Quantity>>,

    /// PodDisruptionBudget minimum. Mutually exclusive with
    /// `maxUnavailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,

    /// PodDisruptionBudget maximum. Mutually exclusive with
    /// `minAvailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PolicyServer {
    /// Name shared by the Deployment, Service, ConfigMap and leaf secret
    /// owned by this server.
    pub fn resource_name(&self) -> String {
        format!("policy-server-{}", self.name_any())
    }

    /// Value of the `app` label carried by the server pods.
    pub fn app_label(&self) -> String {
        format!("kubewarden-policy-server-{}", self.name_any())
    }

    /// DNS names the serving certificate must cover.
    pub fn cert_sans(&self, deployments_namespace: &str) -> Vec<String> {
        vec![
            format!("{}.{}.svc", self.resource_name(), deployments_namespace),
            format!(
                "{}.{}.svc.cluster.local",
                self.resource_name(),
                deployments_namespace
            ),
        ]
    }
}

/* ============================= CONDITIONS ============================= */

/// Build a typed condition with the transition time set to now.
pub fn condition(type_: &str, status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(chrono::Utc::now()),
        observed_generation: None,
    }
}

/// Insert or replace a condition by type, keeping the previous transition
/// time when the status did not change.
pub fn upsert_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status == new.status {
            existing.reason = new.reason;
            existing.message = new.message;
        } else {
            *existing = new;
        }
    } else {
        conditions.push(new);
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResourceExt;

    fn namespaced_policy(name: &str, namespace: &str, server: &str) -> AdmissionPolicy {
        AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicySpec {
                policy: PolicySpec {
                    policy_server: server.to_string(),
                    module: "registry://example/p:v1".to_string(),
                    ..Default::default()
                },
            },
            status: None,
        }
    }

    fn cluster_policy(name: &str, server: &str) -> ClusterAdmissionPolicy {
        ClusterAdmissionPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ClusterAdmissionPolicySpec {
                policy: PolicySpec {
                    policy_server: server.to_string(),
                    module: "registry://example/p:v1".to_string(),
                    ..Default::default()
                },
                namespace_selector: None,
            },
            status: None,
        }
    }

    // ── CRD generation ──

    #[test]
    fn test_policy_server_crd() {
        let crd = PolicyServer::crd();
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "PolicyServer");
        assert_eq!(crd.spec.names.plural, "policyservers");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn test_admission_policy_crd_is_namespaced() {
        let crd = AdmissionPolicy::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.plural, "admissionpolicies");
    }

    #[test]
    fn test_cluster_admission_policy_crd_is_cluster_scoped() {
        let crd = ClusterAdmissionPolicy::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "clusteradmissionpolicies");
    }

    // ── unique names ──

    #[test]
    fn test_unique_name_cluster() {
        let p = AnyPolicy::Cluster(cluster_policy("p1", "default"));
        assert_eq!(p.unique_name(), "clusterwide-p1");
    }

    #[test]
    fn test_unique_name_namespaced() {
        let p = AnyPolicy::Namespaced(namespaced_policy("p1", "team-a", "default"));
        assert_eq!(p.unique_name(), "namespaced-team-a-p1");
    }

    #[test]
    fn test_unique_names_do_not_collide_across_scopes() {
        let cluster = AnyPolicy::Cluster(cluster_policy("p1", "default"));
        let namespaced = AnyPolicy::Namespaced(namespaced_policy("p1", "ns", "default"));
        assert_ne!(cluster.unique_name(), namespaced.unique_name());
    }

    // ── spec defaults ──

    #[test]
    fn test_policy_spec_defaults() {
        let json = r#"{"module":"registry://example/p:v1"}"#;
        let spec: PolicySpec = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(spec.policy_server, "");
        assert_eq!(spec.mode, PolicyMode::Protect);
        assert!(!spec.mutating);
        assert!(spec.background_audit);
        assert_eq!(spec.timeout_seconds(), 10);
        assert_eq!(spec.failure_policy(), FailurePolicy::Fail);
        assert_eq!(spec.side_effects(), "None");
    }

    #[test]
    fn test_policy_spec_flatten_roundtrip() {
        let json = r#"{
            "policyServer": "default",
            "module": "registry://example/p:v1",
            "mutating": true,
            "mode": "monitor",
            "timeoutSeconds": 5,
            "backgroundAudit": false
        }"#;
        let spec: ClusterAdmissionPolicySpec =
            serde_json::from_str(json).expect("should deserialize");
        assert_eq!(spec.policy.policy_server, "default");
        assert!(spec.policy.mutating);
        assert_eq!(spec.policy.mode, PolicyMode::Monitor);
        assert_eq!(spec.policy.timeout_seconds(), 5);
        assert!(!spec.policy.background_audit);

        let back = serde_json::to_value(&spec).expect("should serialize");
        assert_eq!(back["policyServer"], "default");
        assert_eq!(back["mode"], "monitor");
    }

    #[test]
    fn test_settings_preserved_as_opaque_json() {
        let json = r#"{
            "module": "registry://example/p:v1",
            "settings": {"allowed": ["a", "b"], "nested": {"x": 1}}
        }"#;
        let spec: PolicySpec = serde_json::from_str(json).expect("should deserialize");
        let settings = spec.settings.expect("settings present");
        assert_eq!(settings["allowed"][1], "b");
        assert_eq!(settings["nested"]["x"], 1);
    }

    // ── policy server helpers ──

    #[test]
    fn test_policy_server_resource_name() {
        let ps = PolicyServer {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                ..Default::default()
            },
            spec: PolicyServerSpec::default(),
            status: None,
        };
        assert_eq!(ps.resource_name(), "policy-server-default");
        assert_eq!(ps.app_label(), "kubewarden-policy-server-default");
        assert_eq!(
            ps.cert_sans("kubewarden"),
            vec![
                "policy-server-default.kubewarden.svc".to_string(),
                "policy-server-default.kubewarden.svc.cluster.local".to_string(),
            ]
        );
    }

    // ── status phases ──

    #[test]
    fn test_status_phase_serialization() {
        assert_eq!(
            serde_json::to_string(&PolicyStatusPhase::Unscheduled).unwrap(),
            r#""unscheduled""#
        );
        assert_eq!(
            serde_json::to_string(&PolicyStatusPhase::Active).unwrap(),
            r#""active""#
        );
        let phase: PolicyStatusPhase = serde_json::from_str(r#""pending""#).unwrap();
        assert_eq!(phase, PolicyStatusPhase::Pending);
    }

    #[test]
    fn test_auditable_requires_active_status() {
        let mut p = cluster_policy("p1", "default");
        assert!(!AnyPolicy::Cluster(p.clone()).auditable());

        p.status = Some(PolicyStatus {
            policy_status: PolicyStatusPhase::Active,
            ..Default::default()
        });
        assert!(AnyPolicy::Cluster(p.clone()).auditable());

        p.spec.policy.background_audit = false;
        assert!(!AnyPolicy::Cluster(p).auditable());
    }

    // ── conditions ──

    #[test]
    fn test_upsert_condition_replaces_by_type() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            condition("ConfigMapReconciled", true, "ReconciliationSucceeded", ""),
        );
        upsert_condition(
            &mut conditions,
            condition("DeploymentReconciled", false, "ReconciliationFailed", "boom"),
        );
        assert_eq!(conditions.len(), 2);

        upsert_condition(
            &mut conditions,
            condition("DeploymentReconciled", true, "ReconciliationSucceeded", ""),
        );
        assert_eq!(conditions.len(), 2);
        let deployment = conditions
            .iter()
            .find(|c| c.type_ == "DeploymentReconciled")
            .unwrap();
        assert_eq!(deployment.status, "True");
    }

    #[test]
    fn test_upsert_condition_keeps_transition_time_when_unchanged() {
        let mut conditions = Vec::new();
        let first = condition("PolicyActive", true, "PolicyActive", "ok");
        let original_time = first.last_transition_time.clone();
        upsert_condition(&mut conditions, first);

        upsert_condition(
            &mut conditions,
            condition("PolicyActive", true, "PolicyActive", "still ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].message, "still ok");
    }
}
