use std::fmt::Debug;
use std::str::FromStr;

use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::errors::ReconcileError;
use crate::reports::{
    ClusterOpenReport, ClusterPolicyReport, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OpenReport,
    PolicyReport, RUN_UID_LABEL, ReportResult, ScannedResource,
};
use crate::secrets::create_or_patch;

/* ============================= KIND SELECTION ============================= */

/// Which report CRD family a scan run writes. Selected once at startup,
/// never mixed within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportKind {
    /// Legacy `wgpolicyk8s.io/v1alpha2` family.
    #[default]
    PolicyReport,
    /// `openreports.io/v1alpha1` family.
    OpenReport,
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policyreport" => Ok(ReportKind::PolicyReport),
            "openreport" => Ok(ReportKind::OpenReport),
            other => Err(format!(
                "unknown report kind '{other}', expected 'policyreport' or 'openreport'"
            )),
        }
    }
}

/* ============================= STORE ============================= */

/// Transactional-by-sweep report persistence.
///
/// Reports are created-or-patched under the scanned object's UID while a
/// run progresses; at the end `sweep_stale` removes every managed report
/// whose run-uid label differs from the current run. Together the two steps
/// guarantee that exactly the resources scanned in this run have live
/// reports once the run completes.
pub struct ReportStore {
    client: Client,
    kind: ReportKind,
    /// Skip all writes (`--disable-store`).
    persist: bool,
    /// Additionally print each report as JSON (`--output-scan`).
    print: bool,
}

impl ReportStore {
    pub fn new(client: Client, kind: ReportKind, persist: bool, print: bool) -> Self {
        Self {
            client,
            kind,
            persist,
            print,
        }
    }

    /// Persist one scanned resource's evaluation results.
    pub async fn save(
        &self,
        scanned: &ScannedResource,
        results: Vec<ReportResult>,
        run_uid: &str,
    ) -> Result<(), ReconcileError> {
        match (self.kind, &scanned.namespace) {
            (ReportKind::PolicyReport, Some(namespace)) => {
                let api: Api<PolicyReport> = Api::namespaced(self.client.clone(), namespace);
                self.save_with(&api, scanned, results, run_uid, PolicyReport::fill)
                    .await
            }
            (ReportKind::PolicyReport, None) => {
                let api: Api<ClusterPolicyReport> = Api::all(self.client.clone());
                self.save_with(&api, scanned, results, run_uid, ClusterPolicyReport::fill)
                    .await
            }
            (ReportKind::OpenReport, Some(namespace)) => {
                let api: Api<OpenReport> = Api::namespaced(self.client.clone(), namespace);
                self.save_with(&api, scanned, results, run_uid, OpenReport::fill)
                    .await
            }
            (ReportKind::OpenReport, None) => {
                let api: Api<ClusterOpenReport> = Api::all(self.client.clone());
                self.save_with(&api, scanned, results, run_uid, ClusterOpenReport::fill)
                    .await
            }
        }
    }

    async fn save_with<K>(
        &self,
        api: &Api<K>,
        scanned: &ScannedResource,
        results: Vec<ReportResult>,
        run_uid: &str,
        fill: fn(&mut K, &ScannedResource, &str, Vec<ReportResult>),
    ) -> Result<(), ReconcileError>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + Debug
            + Default
            + PartialEq
            + Serialize
            + DeserializeOwned,
    {
        if self.print {
            let mut rendered = K::default();
            fill(&mut rendered, scanned, run_uid, results.clone());
            println!(
                "{}",
                serde_json::to_string(&rendered).unwrap_or_else(|e| format!("<unrenderable: {e}>"))
            );
        }
        if !self.persist {
            return Ok(());
        }

        create_or_patch(api, &scanned.uid, |report| {
            fill(report, scanned, run_uid, results.clone())
        })
        .await?;
        Ok(())
    }

    /// Remove every managed report from previous runs, both scopes.
    pub async fn sweep_stale(&self, run_uid: &str) -> Result<(), ReconcileError> {
        if !self.persist {
            return Ok(());
        }
        match self.kind {
            ReportKind::PolicyReport => {
                self.sweep_namespaced::<PolicyReport>(run_uid).await?;
            }
            ReportKind::OpenReport => {
                self.sweep_namespaced::<OpenReport>(run_uid).await?;
            }
        }
        self.sweep_stale_cluster(run_uid).await
    }

    /// Remove stale cluster-scoped reports only. The cluster-only scan mode
    /// never touches namespaced reports.
    pub async fn sweep_stale_cluster(&self, run_uid: &str) -> Result<(), ReconcileError> {
        if !self.persist {
            return Ok(());
        }
        match self.kind {
            ReportKind::PolicyReport => self.sweep_cluster::<ClusterPolicyReport>(run_uid).await,
            ReportKind::OpenReport => self.sweep_cluster::<ClusterOpenReport>(run_uid).await,
        }
    }

    /// Remove stale managed reports within a single namespace. Used by the
    /// single-namespace scan mode, which must not touch other namespaces.
    pub async fn sweep_stale_in_namespace(
        &self,
        namespace: &str,
        run_uid: &str,
    ) -> Result<(), ReconcileError> {
        if !self.persist {
            return Ok(());
        }
        match self.kind {
            ReportKind::PolicyReport => {
                let api: Api<PolicyReport> = Api::namespaced(self.client.clone(), namespace);
                api.delete_collection(
                    &DeleteParams::default(),
                    &ListParams::default().labels(&stale_selector(run_uid)),
                )
                .await?;
            }
            ReportKind::OpenReport => {
                let api: Api<OpenReport> = Api::namespaced(self.client.clone(), namespace);
                api.delete_collection(
                    &DeleteParams::default(),
                    &ListParams::default().labels(&stale_selector(run_uid)),
                )
                .await?;
            }
        }
        info!(run_uid, namespace, "stale_reports_swept");
        Ok(())
    }

    async fn sweep_cluster<K>(&self, run_uid: &str) -> Result<(), ReconcileError>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::ClusterResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::all(self.client.clone());
        api.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&stale_selector(run_uid)),
        )
        .await?;
        info!(run_uid, kind = %K::kind(&()), "stale_reports_swept");
        Ok(())
    }

    /// Collection deletes are per-namespace for namespaced kinds, so stale
    /// namespaced reports are listed across the cluster and removed one by
    /// one.
    async fn sweep_namespaced<K>(&self, run_uid: &str) -> Result<(), ReconcileError>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let stale = api
            .list(&ListParams::default().labels(&stale_selector(run_uid)))
            .await?;

        for report in stale {
            let Some(namespace) = report.namespace() else {
                continue;
            };
            let scoped: Api<K> = Api::namespaced(self.client.clone(), &namespace);
            match scoped.delete(&report.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if crate::errors::is_404(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(run_uid, kind = %K::kind(&()), "stale_reports_swept");
        Ok(())
    }
}

/// Selector matching managed reports from any run but this one.
fn stale_selector(run_uid: &str) -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{RUN_UID_LABEL}!={run_uid}")
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_kind_parsing() {
        assert_eq!(
            "policyreport".parse::<ReportKind>().unwrap(),
            ReportKind::PolicyReport
        );
        assert_eq!(
            "openreport".parse::<ReportKind>().unwrap(),
            ReportKind::OpenReport
        );
        assert!("yaml".parse::<ReportKind>().is_err());
    }

    #[test]
    fn test_report_kind_default_is_legacy_family() {
        assert_eq!(ReportKind::default(), ReportKind::PolicyReport);
    }

    #[test]
    fn test_stale_selector_excludes_current_run() {
        let selector = stale_selector("run-42");
        assert_eq!(
            selector,
            "app.kubernetes.io/managed-by=kubewarden,kubewarden.io/audit-scanner-run-uid!=run-42"
        );
    }
}
