use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::ApiResource;
use kube::discovery::{ApiCapabilities, Discovery, Scope};
use kube::{Client, ResourceExt};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::crd::{AdmissionPolicy, AnyPolicy, ClusterAdmissionPolicy};
use crate::errors::ReconcileError;
use crate::matcher::{
    AuditPlan, TargetResource, plan_audit, policy_matches_namespace, policy_matches_object,
};
use crate::report_store::ReportStore;
use crate::reports::{AuditOutcome, ReportResult, ScannedResource};

/* ============================= CONFIG ============================= */

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS material for talking to policy servers.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Extra root CA appended to the system roots, PEM file.
    pub extra_ca: Option<PathBuf>,
    /// Client certificate for mutual TLS; requires `client_key`.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure: bool,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub kubewarden_namespace: String,
    /// Overrides the in-cluster service URL for every policy server.
    pub policy_server_url: Option<String>,
    pub parallel_namespaces: usize,
    pub parallel_resources: usize,
    pub parallel_policies: usize,
    pub page_size: u32,
    pub ignore_namespaces: Vec<String>,
    pub tls: TlsOptions,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            kubewarden_namespace: "kubewarden".to_string(),
            policy_server_url: None,
            parallel_namespaces: 1,
            parallel_resources: 100,
            parallel_policies: 5,
            page_size: 100,
            ignore_namespaces: Vec::new(),
            tls: TlsOptions::default(),
        }
    }
}

/* ============================= HTTP CLIENT ============================= */

/// Build the HTTPS client used against policy servers: system roots plus an
/// optional extra CA, optional mutual-TLS identity, optional insecure mode.
pub fn build_http_client(tls: &TlsOptions) -> Result<reqwest::Client, ReconcileError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(HTTP_TIMEOUT);

    if let Some(path) = &tls.extra_ca {
        let pem = std::fs::read(path).map_err(|e| {
            ReconcileError::InvalidConfig(format!("cannot read extra CA '{}': {e}", path.display()))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| ReconcileError::InvalidConfig(format!("invalid extra CA: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let mut identity = std::fs::read(cert_path).map_err(|e| {
                ReconcileError::InvalidConfig(format!(
                    "cannot read client cert '{}': {e}",
                    cert_path.display()
                ))
            })?;
            let key = std::fs::read(key_path).map_err(|e| {
                ReconcileError::InvalidConfig(format!(
                    "cannot read client key '{}': {e}",
                    key_path.display()
                ))
            })?;
            identity.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&identity)
                .map_err(|e| ReconcileError::InvalidConfig(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(ReconcileError::InvalidConfig(
                "client certificate and key must be provided together".to_string(),
            ));
        }
    }

    if tls.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| ReconcileError::InvalidConfig(format!("HTTP client construction: {e}")))
}

/* ============================= SCANNER ============================= */

/// Three-level bounded fan-out over namespaces, resources and policies.
///
/// Cancellation is level-triggered through a watch channel: pending work is
/// not dispatched once the flag flips, in-flight evaluations finish.
pub struct Scanner {
    client: Client,
    config: ScannerConfig,
    store: ReportStore,
    cancel: watch::Receiver<bool>,
    http_clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl Scanner {
    pub fn new(
        client: Client,
        config: ScannerConfig,
        store: ReportStore,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            config,
            store,
            cancel,
            http_clients: Mutex::new(HashMap::new()),
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// One HTTPS client per policy server, built lazily.
    fn http_client_for(&self, server: &str) -> Result<reqwest::Client, ReconcileError> {
        let mut clients = self.http_clients.lock().expect("client cache poisoned");
        if let Some(existing) = clients.get(server) {
            return Ok(existing.clone());
        }
        let built = build_http_client(&self.config.tls)?;
        clients.insert(server.to_string(), built.clone());
        Ok(built)
    }

    /// Base URL of the policy server hosting the given policy.
    fn base_url_for(&self, policy: &AnyPolicy) -> String {
        match &self.config.policy_server_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://policy-server-{}.{}.svc:443",
                policy.spec().policy_server,
                self.config.kubewarden_namespace
            ),
        }
    }

    /* ── policy selection ── */

    async fn auditable_policies(&self) -> Result<Vec<AnyPolicy>, ReconcileError> {
        let mut policies = Vec::new();

        let cluster: Api<ClusterAdmissionPolicy> = Api::all(self.client.clone());
        for p in cluster.list(&Default::default()).await? {
            let p = AnyPolicy::Cluster(p);
            if p.auditable() {
                policies.push(p);
            }
        }
        let namespaced: Api<AdmissionPolicy> = Api::all(self.client.clone());
        for p in namespaced.list(&Default::default()).await? {
            let p = AnyPolicy::Namespaced(p);
            if p.auditable() {
                policies.push(p);
            }
        }
        Ok(policies)
    }

    /* ── entry points ── */

    /// Scan every namespace (minus the ignore list), then cluster-wide
    /// resources, then sweep reports from previous runs.
    pub async fn scan_all_namespaces(&self, run_uid: &str) -> Result<(), ReconcileError> {
        info!(run_uid, "scan_all_namespaces_started");
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let all = namespaces.list(&Default::default()).await?;

        let names: Vec<String> = all
            .items
            .iter()
            .filter_map(|ns| ns.metadata.name.clone())
            .filter(|name| !self.config.ignore_namespaces.contains(name))
            .collect();

        futures::stream::iter(names)
            .map(|name| async move {
                if self.cancelled() {
                    return;
                }
                // A failing namespace never aborts the whole run.
                if let Err(e) = self.scan_namespace_inner(&name, run_uid).await {
                    warn!(namespace = %name, error = %e, "namespace_scan_failed");
                }
            })
            .buffer_unordered(self.config.parallel_namespaces.max(1))
            .collect::<Vec<_>>()
            .await;

        self.scan_cluster_inner(run_uid).await?;

        self.store.sweep_stale(run_uid).await?;
        info!(run_uid, "scan_all_namespaces_finished");
        Ok(())
    }

    /// Scan a single namespace and sweep stale reports within it.
    pub async fn scan_namespace(&self, namespace: &str, run_uid: &str) -> Result<(), ReconcileError> {
        info!(run_uid, namespace, "scan_namespace_started");
        self.scan_namespace_inner(namespace, run_uid).await?;
        self.store
            .sweep_stale_in_namespace(namespace, run_uid)
            .await?;
        info!(run_uid, namespace, "scan_namespace_finished");
        Ok(())
    }

    /// Scan cluster-wide resources only, then sweep stale cluster reports.
    pub async fn scan_cluster_wide(&self, run_uid: &str) -> Result<(), ReconcileError> {
        info!(run_uid, "scan_cluster_wide_started");
        self.scan_cluster_inner(run_uid).await?;
        self.store.sweep_stale_cluster(run_uid).await?;
        info!(run_uid, "scan_cluster_wide_finished");
        Ok(())
    }

    /* ── scan cores ── */

    async fn scan_namespace_inner(
        &self,
        namespace: &str,
        run_uid: &str,
    ) -> Result<(), ReconcileError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns_object = namespaces.get(namespace).await?;
        let ns_labels = ns_object.metadata.labels.clone().unwrap_or_default();

        let policies: Vec<AnyPolicy> = self
            .auditable_policies()
            .await?
            .into_iter()
            .filter(|p| policy_matches_namespace(p, namespace, &ns_labels))
            .collect();
        if policies.is_empty() {
            return Ok(());
        }

        let plan = plan_audit(&policies);
        let discovery = Discovery::new(self.client.clone()).run().await?;
        self.scan_plan(&plan, &discovery, Some(namespace), run_uid)
            .await
    }

    async fn scan_cluster_inner(&self, run_uid: &str) -> Result<(), ReconcileError> {
        // Namespace selectors only scope namespaced admission; every active
        // cluster policy participates in the cluster-wide scan.
        let policies: Vec<AnyPolicy> = self
            .auditable_policies()
            .await?
            .into_iter()
            .filter(|p| !p.is_namespaced())
            .collect();
        if policies.is_empty() {
            return Ok(());
        }

        let plan = plan_audit(&policies);
        let discovery = Discovery::new(self.client.clone()).run().await?;
        self.scan_plan(&plan, &discovery, None, run_uid).await
    }

    /// Walk a plan's targets: resolve each GVR, page through its objects
    /// and audit them. Policies whose GVR cannot be resolved produce an
    /// `error` row on every report of the scan scope, without any network
    /// call.
    async fn scan_plan(
        &self,
        plan: &AuditPlan,
        discovery: &Discovery,
        namespace: Option<&str>,
        run_uid: &str,
    ) -> Result<(), ReconcileError> {
        let mut resolved: Vec<(&TargetResource, Vec<AnyPolicy>, ApiResource)> = Vec::new();
        let mut unknown: Vec<AnyPolicy> = Vec::new();

        for (target, policies) in &plan.targets {
            match resolve_target(discovery, target) {
                Some((ar, caps)) => {
                    let scope_matches = match namespace {
                        Some(_) => matches!(caps.scope, Scope::Namespaced),
                        None => matches!(caps.scope, Scope::Cluster),
                    };
                    if scope_matches {
                        resolved.push((target, policies.clone(), ar));
                    }
                }
                None => {
                    warn!(
                        group = %target.group,
                        version = %target.version,
                        resource = %target.resource,
                        "unknown_gvr"
                    );
                    unknown.extend(policies.iter().cloned());
                }
            }
        }

        // Rows appended to every report of this scope.
        let mut extra_rows: Vec<ReportResult> = Vec::new();
        for policy in &unknown {
            extra_rows.push(ReportResult::new(
                policy.unique_name(),
                AuditOutcome::Error,
                Some("policy targets an unknown resource kind".to_string()),
            ));
        }
        for policy in &plan.skipped {
            extra_rows.push(ReportResult::new(
                policy.unique_name(),
                AuditOutcome::Skip,
                Some("policy rules use a resource wildcard".to_string()),
            ));
        }

        for (target, policies, ar) in resolved {
            if self.cancelled() {
                break;
            }
            self.scan_target(target, &policies, &ar, &extra_rows, namespace, run_uid)
                .await;
        }
        Ok(())
    }

    async fn scan_target(
        &self,
        target: &TargetResource,
        policies: &[AnyPolicy],
        ar: &ApiResource,
        extra_rows: &[ReportResult],
        namespace: Option<&str>,
        run_uid: &str,
    ) {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        };

        let mut continue_token: Option<String> = None;
        loop {
            if self.cancelled() {
                return;
            }
            let mut params = ListParams::default().limit(self.config.page_size);
            if let Some(token) = &continue_token {
                params = params.continue_token(token);
            }

            let page = match api.list(&params).await {
                Ok(page) => page,
                Err(e) => {
                    // Listing failures surface as error rows instead of
                    // aborting the scope.
                    warn!(resource = %target.resource, error = %e, "resource_list_failed");
                    return;
                }
            };

            continue_token = page.metadata.continue_.clone().filter(|c| !c.is_empty());

            futures::stream::iter(page.items)
                .map(|object| async move {
                    if self.cancelled() {
                        return;
                    }
                    self.audit_resource(target, ar, object, policies, extra_rows, run_uid)
                        .await;
                })
                .buffer_unordered(self.config.parallel_resources.max(1))
                .collect::<Vec<_>>()
                .await;

            if continue_token.is_none() {
                break;
            }
        }
    }

    async fn audit_resource(
        &self,
        target: &TargetResource,
        ar: &ApiResource,
        object: DynamicObject,
        policies: &[AnyPolicy],
        extra_rows: &[ReportResult],
        run_uid: &str,
    ) {
        let Some(uid) = object.metadata.uid.clone() else {
            return;
        };
        let labels = object.metadata.labels.clone().unwrap_or_default();

        // Admission semantics: when the audited object is itself a
        // Namespace, a policy's namespace selector is matched against the
        // object's own labels.
        let is_namespace_kind = target.group.is_empty() && target.resource == "namespaces";

        let applicable: Vec<&AnyPolicy> = policies
            .iter()
            .filter(|p| policy_matches_object(p, &labels))
            .filter(|p| {
                !is_namespace_kind
                    || crate::matcher::selector_matches(p.namespace_selector(), &labels)
            })
            .collect();
        if applicable.is_empty() && extra_rows.is_empty() {
            return;
        }

        let mut results: Vec<ReportResult> = futures::stream::iter(applicable)
            .map(|policy| {
                let object = &object;
                async move {
                    if self.cancelled() {
                        return None;
                    }
                    Some(self.evaluate_policy(policy, target, ar, object).await)
                }
            })
            .buffer_unordered(self.config.parallel_policies.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        results.extend_from_slice(extra_rows);
        if results.is_empty() {
            return;
        }
        results.sort_by(|a, b| a.policy.cmp(&b.policy));

        let scanned = ScannedResource {
            api_version: target.api_version(),
            kind: ar.kind.clone(),
            name: object.name_any(),
            namespace: object.metadata.namespace.clone(),
            uid,
        };

        if let Err(e) = self.store.save(&scanned, results, run_uid).await {
            warn!(resource = %scanned.name, error = %e, "report_save_failed");
        }
    }

    /* ── evaluation ── */

    async fn evaluate_policy(
        &self,
        policy: &AnyPolicy,
        target: &TargetResource,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> ReportResult {
        let unique_name = policy.unique_name();

        let http = match self.http_client_for(&policy.spec().policy_server) {
            Ok(http) => http,
            Err(e) => {
                return ReportResult::new(unique_name, AuditOutcome::Error, Some(e.to_string()));
            }
        };

        let url = format!("{}/validate/{unique_name}", self.base_url_for(policy));
        let request = build_admission_request(target, ar, object);

        let response = match http.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                return ReportResult::new(
                    unique_name,
                    AuditOutcome::Error,
                    Some(format!("request failed: {e}")),
                );
            }
        };
        if !response.status().is_success() {
            return ReportResult::new(
                unique_name,
                AuditOutcome::Error,
                Some(format!("policy server returned HTTP {}", response.status())),
            );
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return ReportResult::new(
                    unique_name,
                    AuditOutcome::Error,
                    Some(format!("malformed admission response: {e}")),
                );
            }
        };
        parse_admission_response(unique_name, &body)
    }
}

/* ============================= PURE HELPERS ============================= */

fn resolve_target(
    discovery: &Discovery,
    target: &TargetResource,
) -> Option<(ApiResource, ApiCapabilities)> {
    let group = discovery
        .groups()
        .find(|g| g.name() == target.group)?;
    group
        .versioned_resources(&target.version)
        .into_iter()
        .find(|(ar, _)| ar.plural == target.resource)
}

/// Synthetic admission review: the resource as if it were being created.
fn build_admission_request(
    target: &TargetResource,
    ar: &ApiResource,
    object: &DynamicObject,
) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": uuid::Uuid::new_v4().to_string(),
            "kind": {
                "group": target.group,
                "version": target.version,
                "kind": ar.kind,
            },
            "resource": {
                "group": target.group,
                "version": target.version,
                "resource": target.resource,
            },
            "operation": "CREATE",
            "name": object.metadata.name.clone().unwrap_or_default(),
            "namespace": object.metadata.namespace.clone(),
            "object": object,
        }
    })
}

/// Interpret a policy server's admission review reply.
fn parse_admission_response(policy: String, body: &serde_json::Value) -> ReportResult {
    match body["response"]["allowed"].as_bool() {
        Some(true) => ReportResult::new(policy, AuditOutcome::Pass, None),
        Some(false) => {
            let message = body["response"]["result"]["message"]
                .as_str()
                .map(str::to_string);
            ReportResult::new(policy, AuditOutcome::Fail, message)
        }
        None => ReportResult::new(
            policy,
            AuditOutcome::Error,
            Some("admission response carries no verdict".to_string()),
        ),
    }
}

/* ============================= TESTS ============================= */
