use thiserror::Error;

/* ============================= ERROR KINDS ============================= */

/// Errors produced while driving the cluster toward the desired state.
///
/// The variants are split by how the orchestrator reacts to them:
/// `PolicyServerNotReady` turns into a timed requeue, `InvalidSecret` and
/// `InvalidConfig` are terminal for the current spec, everything else is
/// surfaced as a failure condition and retried by the controller runtime.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The policy server Deployment has not converged to its spec yet.
    #[error("policy server not ready: {0}")]
    PolicyServerNotReady(String),

    /// The Deployment rollout is stalled and will not make progress.
    #[error("rollout stalled: {0}")]
    RolloutStalled(String),

    /// A secret exists but does not carry usable material.
    #[error("invalid secret '{name}': {reason}")]
    InvalidSecret { name: String, reason: String },

    /// The object's spec references something unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Optimistic-concurrency conflict that survived the retry budget.
    #[error("conflict updating '{0}' after retries")]
    Conflict(String),

    /// Certificate generation or parsing failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Any other Kubernetes API error.
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl ReconcileError {
    pub fn invalid_secret(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSecret {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for errors the caller should absorb when deleting objects.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(e) if is_404(e))
    }

    /// True when the error only means "try again shortly".
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PolicyServerNotReady(_) | Self::Conflict(_))
    }
}

/// Whether a kube error is an API 404.
pub fn is_404(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an API 409 conflict.
pub fn is_409(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        })
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_404(&api_error(404)));
        assert!(!is_404(&api_error(409)));
        assert!(ReconcileError::Kube(api_error(404)).is_not_found());
        assert!(!ReconcileError::Kube(api_error(500)).is_not_found());
    }

    #[test]
    fn test_conflict_detection() {
        assert!(is_409(&api_error(409)));
        assert!(!is_409(&api_error(404)));
    }

    #[test]
    fn test_retryable_split() {
        assert!(ReconcileError::PolicyServerNotReady("rollout".into()).is_retryable());
        assert!(ReconcileError::Conflict("secret".into()).is_retryable());
        assert!(!ReconcileError::InvalidConfig("bad".into()).is_retryable());
        assert!(!ReconcileError::invalid_secret("s", "missing tls.crt").is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let e = ReconcileError::invalid_secret("kubewarden-root-ca", "missing key 'tls.crt'");
        assert_eq!(
            e.to_string(),
            "invalid secret 'kubewarden-root-ca': missing key 'tls.crt'"
        );

        let e = ReconcileError::PolicyServerNotReady("2/3 replicas updated".into());
        assert!(e.to_string().contains("not ready"));
    }
}
