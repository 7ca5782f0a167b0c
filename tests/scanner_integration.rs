mod common;

use std::collections::BTreeMap;

use common::{
    activate, as_any, make_cluster_policy, make_namespaced_policy, make_rule,
    with_namespace_selector,
};

use kubewarden_operator::crd::AnyPolicy;
use kubewarden_operator::matcher::{
    plan_audit, policy_matches_namespace, policy_matches_object,
};
use kubewarden_operator::reports::{
    AuditOutcome, ClusterPolicyReport, MANAGED_BY_LABEL, RUN_UID_LABEL, ReportResult,
    ScannedResource, summarize,
};

// ══════════════════════════════════════════════════════════════════
// Audit scanner integration tests (no cluster required)
//
// Drives the policy-selection and report-assembly pipeline the way a
// cluster scan would: policies → plan → namespace/object filters →
// result rows → report objects, without network calls.
// ══════════════════════════════════════════════════════════════════

/// The three policies of the canonical cluster-scan scenario: one matching
/// every namespace, one matching `env=test` namespaces, one referencing a
/// resource kind the cluster does not serve.
fn scenario_policies() -> Vec<AnyPolicy> {
    let mut match_all = make_cluster_policy(
        "match-all",
        "default",
        vec![make_rule(&[""], &["v1"], &["namespaces"], &["CREATE"])],
    );
    activate(&mut match_all);

    let mut env_test = make_cluster_policy(
        "env-test",
        "default",
        vec![make_rule(&[""], &["v1"], &["namespaces"], &["CREATE"])],
    );
    activate(&mut env_test);
    let env_test = with_namespace_selector(env_test, "env", "test");

    let mut unknown = make_cluster_policy(
        "unknown-gvr",
        "default",
        vec![make_rule(&["example.io"], &["v1"], &["foo"], &["CREATE"])],
    );
    activate(&mut unknown);

    vec![as_any(match_all), as_any(env_test), as_any(unknown)]
}

/// Assemble the report rows for one scanned namespace the way the scan
/// loop does: evaluations for matching policies (assumed to pass here)
/// plus error rows for unresolvable policies.
fn assemble_namespace_report(
    policies: &[AnyPolicy],
    ns_name: &str,
    ns_labels: &BTreeMap<String, String>,
    ns_uid: &str,
    run_uid: &str,
) -> ClusterPolicyReport {
    let plan = plan_audit(
        &policies
            .iter()
            .filter(|p| policy_matches_namespace(p, ns_name, ns_labels))
            .cloned()
            .collect::<Vec<_>>(),
    );

    let known_gvrs = ["namespaces"];
    let mut rows = Vec::new();
    for (target, target_policies) in &plan.targets {
        for policy in target_policies {
            if !policy_matches_object(policy, ns_labels) {
                continue;
            }
            if known_gvrs.contains(&target.resource.as_str()) {
                rows.push(ReportResult::new(
                    policy.unique_name(),
                    AuditOutcome::Pass,
                    None,
                ));
            } else {
                rows.push(ReportResult::new(
                    policy.unique_name(),
                    AuditOutcome::Error,
                    Some("policy targets an unknown resource kind".to_string()),
                ));
            }
        }
    }
    rows.sort_by(|a, b| a.policy.cmp(&b.policy));

    let scanned = ScannedResource {
        api_version: "v1".to_string(),
        kind: "Namespace".to_string(),
        name: ns_name.to_string(),
        namespace: None,
        uid: ns_uid.to_string(),
    };
    ClusterPolicyReport::build(&scanned, run_uid, rows)
}

// ── cluster scan over two namespaces ──

#[test]
fn test_unlabelled_namespace_report() {
    let report = assemble_namespace_report(
        &scenario_policies(),
        "ns1",
        &BTreeMap::new(),
        "ns1-uid",
        "run-1",
    );

    // The selector policy does not match, leaving one pass and one error.
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.summary.pass, 1);
    assert_eq!(report.summary.fail, 0);
    assert_eq!(report.summary.error, 1);
    assert_eq!(report.summary.skip, 0);
    assert_eq!(report.metadata.name.as_deref(), Some("ns1-uid"));
}

#[test]
fn test_labelled_namespace_report() {
    let labels = BTreeMap::from([("env".to_string(), "test".to_string())]);
    let report =
        assemble_namespace_report(&scenario_policies(), "ns2", &labels, "ns2-uid", "run-1");

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.summary.pass, 2);
    assert_eq!(report.summary.error, 1);
    assert_eq!(report.summary.skip, 0);
}

#[test]
fn test_reports_share_run_uid() {
    let policies = scenario_policies();
    let ns1 = assemble_namespace_report(&policies, "ns1", &BTreeMap::new(), "ns1-uid", "run-7");
    let labels = BTreeMap::from([("env".to_string(), "test".to_string())]);
    let ns2 = assemble_namespace_report(&policies, "ns2", &labels, "ns2-uid", "run-7");

    for report in [&ns1, &ns2] {
        let report_labels = report.metadata.labels.as_ref().unwrap();
        assert_eq!(report_labels.get(MANAGED_BY_LABEL).unwrap(), "kubewarden");
        assert_eq!(report_labels.get(RUN_UID_LABEL).unwrap(), "run-7");
    }
}

#[test]
fn test_reports_owned_by_scanned_namespace() {
    let report = assemble_namespace_report(
        &scenario_policies(),
        "ns1",
        &BTreeMap::new(),
        "ns1-uid",
        "run-1",
    );
    let owner = &report.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.kind, "Namespace");
    assert_eq!(owner.uid, "ns1-uid");
}

// ── policy selection rules ──

#[test]
fn test_inactive_policies_are_not_auditable() {
    let policy = as_any(make_cluster_policy(
        "p",
        "default",
        vec![make_rule(&[""], &["v1"], &["pods"], &["CREATE"])],
    ));
    assert!(!policy.auditable());
}

#[test]
fn test_background_audit_opt_out_respected() {
    let mut policy = make_cluster_policy(
        "p",
        "default",
        vec![make_rule(&[""], &["v1"], &["pods"], &["CREATE"])],
    );
    activate(&mut policy);
    policy.spec.policy.background_audit = false;
    assert!(!as_any(policy).auditable());
}

#[test]
fn test_namespaced_policy_audits_only_its_namespace() {
    let policy = AnyPolicy::Namespaced(make_namespaced_policy(
        "p",
        "team-a",
        "default",
        vec![make_rule(&[""], &["v1"], &["pods"], &["CREATE"])],
    ));
    assert!(policy_matches_namespace(&policy, "team-a", &BTreeMap::new()));
    assert!(!policy_matches_namespace(&policy, "team-b", &BTreeMap::new()));
}

#[test]
fn test_wildcard_policies_counted_as_skip() {
    let mut wildcard = make_cluster_policy(
        "wildcard",
        "default",
        vec![make_rule(&[""], &["v1"], &["*"], &["CREATE"])],
    );
    activate(&mut wildcard);

    let plan = plan_audit(&[as_any(wildcard)]);
    assert!(plan.targets.is_empty());
    assert_eq!(plan.skipped.len(), 1);

    let rows = vec![ReportResult::new(
        plan.skipped[0].unique_name(),
        AuditOutcome::Skip,
        Some("policy rules use a resource wildcard".to_string()),
    )];
    let summary = summarize(&rows);
    assert_eq!(summary.skip, 1);
    assert_eq!(summary.pass, 0);
}

// ── verdict bookkeeping ──

#[test]
fn test_failed_evaluations_preserve_messages() {
    let rows = vec![
        ReportResult::new("clusterwide-a", AuditOutcome::Pass, None),
        ReportResult::new(
            "clusterwide-b",
            AuditOutcome::Fail,
            Some("privileged containers are not allowed".to_string()),
        ),
    ];
    let summary = summarize(&rows);
    assert_eq!(summary.pass, 1);
    assert_eq!(summary.fail, 1);
    assert_eq!(
        rows[1].message.as_deref(),
        Some("privileged containers are not allowed")
    );
}
