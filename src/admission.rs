use crate::crd::{PolicyMode, PolicyServerSpec, PolicySpec};

/* ============================= TYPES ============================= */

/// Result of validating one of the operator's own custom resources.
#[derive(Debug, Clone)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
}

impl AdmissionVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
        }
    }
}

/* ============================= POLICY SERVER ============================= */

/// Validate a PolicyServer create or update.
pub fn validate_policy_server(
    _old: Option<&PolicyServerSpec>,
    new: &PolicyServerSpec,
) -> AdmissionVerdict {
    if new.min_available.is_some() && new.max_unavailable.is_some() {
        return AdmissionVerdict::deny(
            "minAvailable and maxUnavailable cannot both be set",
        );
    }
    if new.replicas < 0 {
        return AdmissionVerdict::deny("replicas must not be negative");
    }
    AdmissionVerdict::allow()
}

/* ============================= POLICIES ============================= */

const ALLOWED_MODULE_SCHEMES: &[&str] = &["file", "http", "https", "registry"];

/// Validate an AdmissionPolicy or ClusterAdmissionPolicy create or update.
///
/// Mode changes are monotone: `monitor` may be promoted to `protect`, the
/// reverse would silently stop enforcing and is rejected.
pub fn validate_policy(old: Option<&PolicySpec>, new: &PolicySpec) -> AdmissionVerdict {
    if let Some(timeout) = new.timeout_seconds {
        if !(1..=30).contains(&timeout) {
            return AdmissionVerdict::deny(format!(
                "timeoutSeconds must be between 1 and 30, got {timeout}"
            ));
        }
    }

    let scheme_ok = new
        .module
        .split_once("://")
        .map(|(scheme, _)| ALLOWED_MODULE_SCHEMES.contains(&scheme))
        .unwrap_or(false);
    if !scheme_ok {
        return AdmissionVerdict::deny(format!(
            "module '{}' must use one of the schemes: file, http, https, registry",
            new.module
        ));
    }

    if let Some(old) = old {
        if old.mode == PolicyMode::Protect && new.mode == PolicyMode::Monitor {
            return AdmissionVerdict::deny(
                "field cannot transition from protect to monitor; recreate the policy instead",
            );
        }
    }

    AdmissionVerdict::allow()
}

/* ============================= RESPONSE ============================= */

/// Serialize an admission review response envelope.
pub fn build_admission_response(uid: &str, verdict: &AdmissionVerdict) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": verdict.allowed
        }
    });

    if let Some(message) = &verdict.message {
        response["response"]["status"] = serde_json::json!({
            "message": message
        });
    }

    response.to_string()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use super::*;

    fn valid_policy() -> PolicySpec {
        PolicySpec {
            policy_server: "default".to_string(),
            module: "registry://example/p1:v1".to_string(),
            ..Default::default()
        }
    }

    // ── policy server validation ──

    #[test]
    fn test_server_spec_without_pdb_allowed() {
        let spec = PolicyServerSpec {
            image: "policy-server:v1".to_string(),
            replicas: 1,
            ..Default::default()
        };
        assert!(validate_policy_server(None, &spec).allowed);
    }

    #[test]
    fn test_server_spec_single_pdb_bound_allowed() {
        let spec = PolicyServerSpec {
            image: "policy-server:v1".to_string(),
            replicas: 1,
            max_unavailable: Some(IntOrString::Int(2)),
            ..Default::default()
        };
        assert!(validate_policy_server(None, &spec).allowed);
    }

    #[test]
    fn test_server_spec_both_pdb_bounds_denied() {
        let spec = PolicyServerSpec {
            image: "policy-server:v1".to_string(),
            replicas: 1,
            min_available: Some(IntOrString::Int(1)),
            max_unavailable: Some(IntOrString::Int(2)),
            ..Default::default()
        };
        let verdict = validate_policy_server(None, &spec);
        assert!(!verdict.allowed);
        assert!(verdict.message.unwrap().contains("cannot both be set"));
    }

    #[test]
    fn test_server_spec_negative_replicas_denied() {
        let spec = PolicyServerSpec {
            image: "policy-server:v1".to_string(),
            replicas: -1,
            ..Default::default()
        };
        assert!(!validate_policy_server(None, &spec).allowed);
    }

    // ── policy validation ──

    #[test]
    fn test_policy_valid() {
        assert!(validate_policy(None, &valid_policy()).allowed);
    }

    #[test]
    fn test_policy_timeout_bounds() {
        let mut spec = valid_policy();
        spec.timeout_seconds = Some(30);
        assert!(validate_policy(None, &spec).allowed);

        spec.timeout_seconds = Some(0);
        assert!(!validate_policy(None, &spec).allowed);

        spec.timeout_seconds = Some(31);
        let verdict = validate_policy(None, &spec);
        assert!(!verdict.allowed);
        assert!(verdict.message.unwrap().contains("between 1 and 30"));
    }

    #[test]
    fn test_policy_module_schemes() {
        for scheme in ["file", "http", "https", "registry"] {
            let mut spec = valid_policy();
            spec.module = format!("{scheme}://example/p1");
            assert!(validate_policy(None, &spec).allowed, "{scheme} should pass");
        }

        let mut spec = valid_policy();
        spec.module = "oci://example/p1".to_string();
        assert!(!validate_policy(None, &spec).allowed);

        spec.module = "no-scheme".to_string();
        assert!(!validate_policy(None, &spec).allowed);
    }

    // ── monotone mode ──

    #[test]
    fn test_monitor_to_protect_allowed() {
        let mut old = valid_policy();
        old.mode = PolicyMode::Monitor;
        let mut new = valid_policy();
        new.mode = PolicyMode::Protect;
        assert!(validate_policy(Some(&old), &new).allowed);
    }

    #[test]
    fn test_protect_to_monitor_denied() {
        let mut old = valid_policy();
        old.mode = PolicyMode::Protect;
        let mut new = valid_policy();
        new.mode = PolicyMode::Monitor;
        let verdict = validate_policy(Some(&old), &new);
        assert!(!verdict.allowed);
        assert!(verdict.message.unwrap().contains("protect to monitor"));
    }

    #[test]
    fn test_create_in_monitor_mode_allowed() {
        let mut spec = valid_policy();
        spec.mode = PolicyMode::Monitor;
        assert!(validate_policy(None, &spec).allowed);
    }

    #[test]
    fn test_unchanged_mode_allowed() {
        let old = valid_policy();
        let new = valid_policy();
        assert!(validate_policy(Some(&old), &new).allowed);
    }

    // ── response envelope ──

    #[test]
    fn test_response_allowed() {
        let resp = build_admission_response("uid-1", &AdmissionVerdict::allow());
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["uid"], "uid-1");
        assert_eq!(v["response"]["allowed"], true);
        assert!(v["response"]["status"].is_null());
    }

    #[test]
    fn test_response_denied_carries_message() {
        let resp = build_admission_response("uid-2", &AdmissionVerdict::deny("nope"));
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["allowed"], false);
        assert_eq!(v["response"]["status"]["message"], "nope");
        assert_eq!(v["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(v["kind"], "AdmissionReview");
    }
}
