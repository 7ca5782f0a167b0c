use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use anyhow::{Context as _, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use kubewarden_operator::cascade;
use kubewarden_operator::crd::{AdmissionPolicy, ClusterAdmissionPolicy, PolicyServer};
use kubewarden_operator::reconciler::{self, Context};
use kubewarden_operator::secrets::ROOT_CA_SECRET_NAME;
use kubewarden_operator::service::metrics_port_from_env;

use crate::cli::ControllerArgs;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kubewarden_reconcile_total",
            "Total reconciliation cycles per controller",
        ),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kubewarden_reconcile_errors_total",
            "Total reconciliation errors per controller",
        ),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static CA_ROTATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kubewarden_ca_events_total",
            "Root CA secret events handled, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

pub(crate) struct ControllerState {
    pub(crate) ready: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run(args: ControllerArgs) -> Result<()> {
    kubewarden_operator::init_tracing(&args.loglevel);
    println!("Starting kubewarden operator...\n");

    let client = kube::Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let metrics_port = metrics_port_from_env();
    let ctx = Arc::new(Context {
        client: client.clone(),
        deployments_namespace: args.deployments_namespace.clone(),
        exclude_deployments_namespace: args
            .always_accept_admission_reviews_on_deployments_namespace,
        metrics_port,
    });

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&CA_ROTATIONS);

    let addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("Invalid metrics address")?;

    println!("  Deployments namespace ....... {}", args.deployments_namespace);
    println!("  Watched kinds ............... PolicyServer, ClusterAdmissionPolicy, AdmissionPolicy, Secret");
    match metrics_port {
        Some(port) => println!("  Policy server metrics ....... port {port}"),
        None => println!("  Policy server metrics ....... disabled"),
    }
    println!("  Health and metrics .......... http://{addr}");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("controller_started");

    let state = Arc::new(Mutex::new(ControllerState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { serve_health(http_state, http_shutdown, addr).await });

    // Policy server controller: owns everything it creates, so changes to
    // owned objects re-trigger the server's reconcile.
    let ns = args.deployments_namespace.clone();
    let server_state = state.clone();
    let server_controller = Controller::new(
        Api::<PolicyServer>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(
        Api::<Deployment>::namespaced(client.clone(), &ns),
        watcher::Config::default(),
    )
    .owns(
        Api::<Service>::namespaced(client.clone(), &ns),
        watcher::Config::default(),
    )
    .owns(
        Api::<ConfigMap>::namespaced(client.clone(), &ns),
        watcher::Config::default(),
    )
    .owns(
        Api::<Secret>::namespaced(client.clone(), &ns),
        watcher::Config::default(),
    )
    .owns(
        Api::<PodDisruptionBudget>::namespaced(client.clone(), &ns),
        watcher::Config::default(),
    )
    .run(
        |server, ctx| async move {
            RECONCILE_TOTAL.with_label_values(&["policy-server"]).inc();
            reconciler::reconcile_policy_server(server, ctx).await
        },
        |server, error, ctx| {
            RECONCILE_ERRORS.with_label_values(&["policy-server"]).inc();
            reconciler::policy_server_error_policy(server, error, ctx)
        },
        ctx.clone(),
    )
    .for_each(move |result| {
        let state = server_state.clone();
        async move {
            {
                let mut s = state.lock().await;
                if !s.ready {
                    s.ready = true;
                }
            }
            if let Err(e) = result {
                warn!(error = %e, "policy_server_dispatch_error");
            }
        }
    });

    let cluster_policy_controller = Controller::new(
        Api::<ClusterAdmissionPolicy>::all(client.clone()),
        watcher::Config::default(),
    )
    .run(
        |policy, ctx| async move {
            RECONCILE_TOTAL.with_label_values(&["cluster-policy"]).inc();
            reconciler::reconcile_cluster_policy(policy, ctx).await
        },
        |policy, error, ctx| {
            RECONCILE_ERRORS.with_label_values(&["cluster-policy"]).inc();
            reconciler::cluster_policy_error_policy(policy, error, ctx)
        },
        ctx.clone(),
    )
    .for_each(|result| async move {
        if let Err(e) = result {
            warn!(error = %e, "cluster_policy_dispatch_error");
        }
    });

    let admission_policy_controller = Controller::new(
        Api::<AdmissionPolicy>::all(client.clone()),
        watcher::Config::default(),
    )
    .run(
        |policy, ctx| async move {
            RECONCILE_TOTAL.with_label_values(&["admission-policy"]).inc();
            reconciler::reconcile_admission_policy(policy, ctx).await
        },
        |policy, error, ctx| {
            RECONCILE_ERRORS.with_label_values(&["admission-policy"]).inc();
            reconciler::admission_policy_error_policy(policy, error, ctx)
        },
        ctx.clone(),
    )
    .for_each(|result| async move {
        if let Err(e) = result {
            warn!(error = %e, "admission_policy_dispatch_error");
        }
    });

    let ca_ctx = ctx.clone();
    let ca_client = client.clone();
    let ca_namespace = args.deployments_namespace.clone();
    let ca_controller = async move {
        // Seed once so a fresh cluster gets its root CA without waiting for
        // a watch event.
        handle_ca_event(&ca_ctx).await;

        let secrets: Api<Secret> = Api::namespaced(ca_client, &ca_namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={ROOT_CA_SECRET_NAME}"));
        let mut stream = watcher::watcher(secrets, config).boxed();
        loop {
            match stream.next().await {
                Some(Ok(_event)) => handle_ca_event(&ca_ctx).await,
                Some(Err(e)) => {
                    warn!(error = %e, "ca_watch_error");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
                None => break,
            }
        }
    };

    // Dropping the futures is the only way to stop kube controllers, so the
    // whole bundle races against Ctrl+C.
    tokio::select! {
        _ = server_controller => {
            info!("policy_server_controller_stream_ended");
        }
        _ = cluster_policy_controller => {
            info!("cluster_policy_controller_stream_ended");
        }
        _ = admission_policy_controller => {
            info!("admission_policy_controller_stream_ended");
        }
        _ = ca_controller => {
            info!("ca_controller_stream_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("controller_stopped");
    println!("Operator stopped.");
    Ok(())
}

async fn handle_ca_event(ctx: &Context) {
    match cascade::reconcile_root_ca(ctx).await {
        Ok(()) => CA_ROTATIONS.with_label_values(&["ok"]).inc(),
        Err(e) => {
            CA_ROTATIONS.with_label_values(&["error"]).inc();
            warn!(error = %e, "ca_reconcile_failed");
        }
    }
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_health_router(state: Arc<Mutex<ControllerState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn serve_health(
    state: Arc<Mutex<ControllerState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_health_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind health endpoint")?;

    info!(addr = %addr, "health_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ControllerState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
