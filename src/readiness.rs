use k8s_openapi::api::apps::v1::Deployment;

use crate::errors::ReconcileError;

/* ============================= CLASSIFIER ============================= */

/// Decide whether a Deployment rollout has converged to its spec.
///
/// Converged means the controller has observed the latest generation and,
/// for that generation, every replica is updated, no old pods linger and
/// every updated replica is available. A rollout stuck past its progress
/// deadline is a hard failure, not a retryable not-ready.
pub fn deployment_ready(deployment: &Deployment) -> Result<(), ReconcileError> {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or_default();
    let spec_replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let Some(status) = deployment.status.as_ref() else {
        return Err(ReconcileError::PolicyServerNotReady(format!(
            "deployment '{name}' has no status yet"
        )));
    };

    if let Some(conditions) = &status.conditions {
        for c in conditions {
            if c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded") {
                return Err(ReconcileError::RolloutStalled(format!(
                    "deployment '{name}' exceeded its progress deadline"
                )));
            }
        }
    }

    if status.observed_generation.unwrap_or_default() < generation {
        return Err(ReconcileError::PolicyServerNotReady(format!(
            "deployment '{name}' has not observed generation {generation} yet"
        )));
    }

    let updated = status.updated_replicas.unwrap_or_default();
    let replicas = status.replicas.unwrap_or_default();
    let available = status.available_replicas.unwrap_or_default();

    if updated < spec_replicas {
        return Err(ReconcileError::PolicyServerNotReady(format!(
            "deployment '{name}': {updated}/{spec_replicas} replicas updated"
        )));
    }
    if replicas > updated {
        return Err(ReconcileError::PolicyServerNotReady(format!(
            "deployment '{name}': {} old replicas pending termination",
            replicas - updated
        )));
    }
    if available < updated {
        return Err(ReconcileError::PolicyServerNotReady(format!(
            "deployment '{name}': {available}/{updated} updated replicas available"
        )));
    }

    Ok(())
}

/// Whether only current-generation pods back the service: the latest
/// replica set has fully rolled over.
pub fn uniquely_reachable(deployment: &Deployment) -> bool {
    deployment_ready(deployment).is_ok()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn deployment(
        generation: i64,
        observed: i64,
        spec_replicas: i32,
        updated: i32,
        replicas: i32,
        available: i32,
    ) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("policy-server-default".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(spec_replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                updated_replicas: Some(updated),
                replicas: Some(replicas),
                available_replicas: Some(available),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_converged_deployment_is_ready() {
        assert!(deployment_ready(&deployment(3, 3, 2, 2, 2, 2)).is_ok());
    }

    #[test]
    fn test_newer_observed_generation_is_ready() {
        assert!(deployment_ready(&deployment(3, 4, 1, 1, 1, 1)).is_ok());
    }

    #[test]
    fn test_stale_generation_not_ready() {
        let err = deployment_ready(&deployment(4, 3, 1, 1, 1, 1)).unwrap_err();
        assert!(matches!(err, ReconcileError::PolicyServerNotReady(_)));
        assert!(err.to_string().contains("generation"));
    }

    #[test]
    fn test_partial_update_not_ready() {
        let err = deployment_ready(&deployment(1, 1, 3, 1, 3, 1)).unwrap_err();
        assert!(matches!(err, ReconcileError::PolicyServerNotReady(_)));
        assert!(err.to_string().contains("1/3 replicas updated"));
    }

    #[test]
    fn test_old_pods_pending_termination_not_ready() {
        let err = deployment_ready(&deployment(1, 1, 2, 2, 3, 2)).unwrap_err();
        assert!(err.to_string().contains("old replicas pending termination"));
    }

    #[test]
    fn test_unavailable_replicas_not_ready() {
        let err = deployment_ready(&deployment(1, 1, 2, 2, 2, 1)).unwrap_err();
        assert!(err.to_string().contains("1/2 updated replicas available"));
    }

    #[test]
    fn test_missing_status_not_ready() {
        let mut d = deployment(1, 1, 1, 1, 1, 1);
        d.status = None;
        let err = deployment_ready(&d).unwrap_err();
        assert!(matches!(err, ReconcileError::PolicyServerNotReady(_)));
    }

    #[test]
    fn test_progress_deadline_exceeded_is_terminal() {
        let mut d = deployment(1, 1, 1, 0, 0, 0);
        d.status.as_mut().unwrap().conditions = Some(vec![
            k8s_openapi::api::apps::v1::DeploymentCondition {
                type_: "Progressing".to_string(),
                status: "False".to_string(),
                reason: Some("ProgressDeadlineExceeded".to_string()),
                ..Default::default()
            },
        ]);
        let err = deployment_ready(&d).unwrap_err();
        assert!(matches!(err, ReconcileError::RolloutStalled(_)));
    }

    #[test]
    fn test_uniquely_reachable_tracks_readiness() {
        assert!(uniquely_reachable(&deployment(1, 1, 2, 2, 2, 2)));
        assert!(!uniquely_reachable(&deployment(1, 1, 2, 1, 2, 1)));
    }
}
