use k8s_openapi::api::core::v1::ConfigMap;

use crate::configmap::POLICIES_KEY;
use crate::crd::{PolicyMode, PolicyModeStatus, PolicyStatusPhase};

/* ============================= OBSERVATIONS ============================= */

/// What a reconcile pass has observed about a policy's surroundings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyObservation {
    /// `spec.policyServer` is non-empty.
    pub server_named: bool,
    /// The named PolicyServer object exists.
    pub server_found: bool,
    /// The server's Deployment exists.
    pub deployment_found: bool,
    /// The Deployment is converged and the webhook configuration is in
    /// place.
    pub served: bool,
}

/* ============================= STATE MACHINE ============================= */

/// Compute the next status phase.
///
/// Transitions only ever move forward; once a policy reached `active` it is
/// never downgraded by a reconcile whose preconditions still hold.
pub fn next_phase(current: PolicyStatusPhase, obs: PolicyObservation) -> PolicyStatusPhase {
    if current == PolicyStatusPhase::Active && obs.server_named && obs.server_found {
        return PolicyStatusPhase::Active;
    }

    if !obs.server_named {
        return PolicyStatusPhase::Unscheduled;
    }
    if !obs.server_found {
        return PolicyStatusPhase::Scheduled;
    }
    if obs.served {
        return PolicyStatusPhase::Active;
    }
    if obs.deployment_found {
        return PolicyStatusPhase::Pending;
    }
    // Server exists but its Deployment has not been created yet.
    PolicyStatusPhase::Scheduled
}

/* ============================= OBSERVED MODE ============================= */

/// Mode the policy is currently served in, derived from the server's
/// ConfigMap: only a policy present in the policy map has a known mode.
pub fn observed_mode(
    config_map: Option<&ConfigMap>,
    unique_name: &str,
    spec_mode: PolicyMode,
) -> PolicyModeStatus {
    let Some(cm) = config_map else {
        return PolicyModeStatus::Unknown;
    };
    let Some(raw) = cm.data.as_ref().and_then(|d| d.get(POLICIES_KEY)) else {
        return PolicyModeStatus::Unknown;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) else {
        return PolicyModeStatus::Unknown;
    };
    if parsed.get(unique_name).is_none() {
        return PolicyModeStatus::Unknown;
    }
    match spec_mode {
        PolicyMode::Protect => PolicyModeStatus::Protect,
        PolicyMode::Monitor => PolicyModeStatus::Monitor,
    }
}

/* ============================= CONDITION TYPES ============================= */

pub const CONDITION_POLICY_ACTIVE: &str = "PolicyActive";
pub const CONDITION_UNIQUELY_REACHABLE: &str = "PolicyUniquelyReachable";

pub const REASON_SUCCEEDED: &str = "ReconciliationSucceeded";
pub const REASON_FAILED: &str = "ReconciliationFailed";

/* ============================= TESTS ============================= */
