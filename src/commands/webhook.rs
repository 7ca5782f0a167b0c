use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::sync::broadcast;
use tracing::info;

use kubewarden_operator::admission::{
    AdmissionVerdict, build_admission_response, validate_policy, validate_policy_server,
};
use kubewarden_operator::ca::CertificateAuthority;
use kubewarden_operator::cascade::{SERVING_CERT_TIMEOUT, wait_for_serving_cert};
use kubewarden_operator::crd::{AdmissionPolicy, ClusterAdmissionPolicy, PolicyServer};

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, cert_dir: &Path, loglevel: &str) -> Result<()> {
    kubewarden_operator::init_tracing(loglevel);
    println!("Starting CRD validation webhook...\n");
    info!("webhook_starting");

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    // The serving certificate is mounted by the kubelet; hold readiness
    // until both files are visible.
    print!("  Serving certificate ......... ");
    wait_for_serving_cert(cert_dir.to_path_buf(), SERVING_CERT_TIMEOUT)
        .await
        .context("Serving certificate never became available")?;
    println!("loaded ({})", cert_dir.display());

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate/policyserver");
    println!("    POST /validate/clusteradmissionpolicy");
    println!("    POST /validate/admissionpolicy");
    println!("    GET  /healthz");
    println!("    GET  /readyz");
    println!();
    println!("Validation webhook running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
        cert_dir.join("tls.crt"),
        cert_dir.join("tls.key"),
    )
    .await
    .context("Failed to load TLS configuration")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    let app = build_webhook_router();
    let server =
        tokio::spawn(
            async move { axum_server::bind_rustls(addr, rustls_config).handle(handle).serve(app.into_make_service()).await },
        );

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = server.await?;

    info!("webhook_stopped");
    println!("Webhook stopped.");
    Ok(())
}

/* ============================= ROUTER ============================= */

pub(crate) fn build_webhook_router() -> Router {
    Router::new()
        .route("/validate/policyserver", post(policy_server_handler))
        .route(
            "/validate/clusteradmissionpolicy",
            post(cluster_policy_handler),
        )
        .route("/validate/admissionpolicy", post(admission_policy_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "READY") }))
}

/* ============================= HANDLERS ============================= */

/// Pull uid, object and oldObject out of an AdmissionReview envelope.
fn review_parts(body: &str) -> Option<(String, serde_json::Value, serde_json::Value)> {
    let review: serde_json::Value = serde_json::from_str(body).ok()?;
    let uid = review["request"]["uid"].as_str().unwrap_or("").to_string();
    let object = review["request"]["object"].clone();
    let old_object = review["request"]["oldObject"].clone();
    Some((uid, object, old_object))
}

fn allow(uid: &str) -> (StatusCode, String) {
    (
        StatusCode::OK,
        build_admission_response(
            uid,
            &AdmissionVerdict {
                allowed: true,
                message: None,
            },
        ),
    )
}

async fn policy_server_handler(body: String) -> impl IntoResponse {
    let Some((uid, object, old_object)) = review_parts(&body) else {
        info!("invalid_admission_review");
        return (StatusCode::BAD_REQUEST, build_admission_response("", &AdmissionVerdict { allowed: true, message: None }));
    };

    // Unparseable objects are allowed through rather than blocking the API
    // server on a broken webhook.
    let Ok(server) = serde_json::from_value::<PolicyServer>(object) else {
        info!("policy_server_parse_failed_failopen");
        return allow(&uid);
    };
    let old = serde_json::from_value::<PolicyServer>(old_object).ok();

    let verdict = validate_policy_server(old.as_ref().map(|s| &s.spec), &server.spec);
    if !verdict.allowed {
        info!(message = ?verdict.message, "policy_server_rejected");
    }
    (StatusCode::OK, build_admission_response(&uid, &verdict))
}

async fn cluster_policy_handler(body: String) -> impl IntoResponse {
    let Some((uid, object, old_object)) = review_parts(&body) else {
        return (StatusCode::BAD_REQUEST, build_admission_response("", &AdmissionVerdict { allowed: true, message: None }));
    };

    let Ok(policy) = serde_json::from_value::<ClusterAdmissionPolicy>(object) else {
        info!("cluster_policy_parse_failed_failopen");
        return allow(&uid);
    };
    let old = serde_json::from_value::<ClusterAdmissionPolicy>(old_object).ok();

    let verdict = validate_policy(
        old.as_ref().map(|p| &p.spec.policy),
        &policy.spec.policy,
    );
    if !verdict.allowed {
        info!(message = ?verdict.message, "cluster_policy_rejected");
    }
    (StatusCode::OK, build_admission_response(&uid, &verdict))
}

async fn admission_policy_handler(body: String) -> impl IntoResponse {
    let Some((uid, object, old_object)) = review_parts(&body) else {
        return (StatusCode::BAD_REQUEST, build_admission_response("", &AdmissionVerdict { allowed: true, message: None }));
    };

    let Ok(policy) = serde_json::from_value::<AdmissionPolicy>(object) else {
        info!("admission_policy_parse_failed_failopen");
        return allow(&uid);
    };
    let old = serde_json::from_value::<AdmissionPolicy>(old_object).ok();

    let verdict = validate_policy(
        old.as_ref().map(|p| &p.spec.policy),
        &policy.spec.policy,
    );
    if !verdict.allowed {
        info!(message = ?verdict.message, "admission_policy_rejected");
    }
    (StatusCode::OK, build_admission_response(&uid, &verdict))
}

/* ============================= CERT GENERATION ============================= */

/// Generate a development CA plus serving certificate for running the
/// webhook outside a cluster.
pub fn cert_generate(service_name: &str, namespace: &str, output_dir: &Path) -> Result<()> {
    println!("Generating webhook certificates...\n");

    let ca = CertificateAuthority::generate().context("CA generation failed")?;
    let sans = vec![
        format!("{service_name}.{namespace}.svc"),
        format!("{service_name}.{namespace}.svc.cluster.local"),
    ];
    let leaf = ca.generate_leaf(&sans).context("Leaf generation failed")?;

    if !output_dir.exists() {
        std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;
    }
    let ca_path = output_dir.join("ca.crt");
    let cert_path = output_dir.join("tls.crt");
    let key_path = output_dir.join("tls.key");

    std::fs::write(&ca_path, &ca.cert_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &leaf.cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &leaf.key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Serving certificate ......... {}", cert_path.display());
    println!("  Serving key ................. {}", key_path.display());
    println!("  SANs:");
    for san in &sans {
        println!("    - {san}");
    }
    println!();
    println!("Certificates generated successfully.");
    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    async fn post_review(path: &str, review: serde_json::Value) -> serde_json::Value {
        let app = build_webhook_router();
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::from(review.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn review(object: serde_json::Value, old_object: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "review-uid-1",
                "object": object,
                "oldObject": old_object,
            }
        })
    }

    fn policy_server(min: Option<i32>, max: Option<i32>) -> serde_json::Value {
        let mut spec = serde_json::json!({
            "image": "policy-server:v1",
            "replicas": 1
        });
        if let Some(min) = min {
            spec["minAvailable"] = min.into();
        }
        if let Some(max) = max {
            spec["maxUnavailable"] = max.into();
        }
        serde_json::json!({
            "apiVersion": "policies.kubewarden.io/v1",
            "kind": "PolicyServer",
            "metadata": {"name": "default"},
            "spec": spec
        })
    }

    fn cluster_policy(mode: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "policies.kubewarden.io/v1",
            "kind": "ClusterAdmissionPolicy",
            "metadata": {"name": "p1"},
            "spec": {
                "policyServer": "default",
                "module": "registry://example/p1:v1",
                "mode": mode
            }
        })
    }

    // ── policy server ──

    #[tokio::test]
    async fn test_policy_server_allowed() {
        let resp = post_review(
            "/validate/policyserver",
            review(policy_server(None, Some(2)), serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp["response"]["allowed"], true);
        assert_eq!(resp["response"]["uid"], "review-uid-1");
    }

    #[tokio::test]
    async fn test_policy_server_both_pdb_bounds_denied() {
        let resp = post_review(
            "/validate/policyserver",
            review(policy_server(Some(1), Some(2)), serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp["response"]["allowed"], false);
        assert!(
            resp["response"]["status"]["message"]
                .as_str()
                .unwrap()
                .contains("cannot both be set")
        );
    }

    // ── monotone mode ──

    #[tokio::test]
    async fn test_protect_to_monitor_denied() {
        let resp = post_review(
            "/validate/clusteradmissionpolicy",
            review(cluster_policy("monitor"), cluster_policy("protect")),
        )
        .await;
        assert_eq!(resp["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn test_monitor_to_protect_allowed() {
        let resp = post_review(
            "/validate/clusteradmissionpolicy",
            review(cluster_policy("protect"), cluster_policy("monitor")),
        )
        .await;
        assert_eq!(resp["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn test_namespaced_policy_validated_too() {
        let object = serde_json::json!({
            "apiVersion": "policies.kubewarden.io/v1",
            "kind": "AdmissionPolicy",
            "metadata": {"name": "p1", "namespace": "team-a"},
            "spec": {
                "policyServer": "default",
                "module": "oci://bad-scheme/p1",
            }
        });
        let resp = post_review(
            "/validate/admissionpolicy",
            review(object, serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp["response"]["allowed"], false);
    }

    // ── fail open ──

    #[tokio::test]
    async fn test_unparseable_object_fails_open() {
        let resp = post_review(
            "/validate/policyserver",
            review(serde_json::json!({"not": "a policy server"}), serde_json::Value::Null),
        )
        .await;
        assert_eq!(resp["response"]["allowed"], true);
    }

    // ── health ──

    #[tokio::test]
    async fn test_healthz() {
        let app = build_webhook_router();
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
