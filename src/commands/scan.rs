use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use kubewarden_operator::report_store::{ReportKind, ReportStore};
use kubewarden_operator::scanner::{Scanner, ScannerConfig, TlsOptions};

use crate::cli::AuditScannerArgs;

/* ============================= ENTRY ============================= */

pub async fn run(args: AuditScannerArgs) -> Result<()> {
    kubewarden_operator::init_tracing(&args.loglevel);
    println!("Starting audit scan...\n");

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

    let report_kind: ReportKind = args
        .report_kind
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let run_uid = Uuid::new_v4().to_string();

    let mode = if args.cluster {
        "cluster-wide".to_string()
    } else if let Some(namespace) = &args.namespace {
        format!("namespace '{namespace}'")
    } else {
        "all namespaces".to_string()
    };

    println!("  Scan run UID ................ {run_uid}");
    println!("  Mode ........................ {mode}");
    println!("  Report kind ................. {}", args.report_kind);
    println!(
        "  Parallelism ................. {} namespaces × {} resources × {} policies",
        args.parallel_namespaces, args.parallel_resources, args.parallel_policies
    );
    if args.disable_store {
        println!("  Store ....................... disabled");
    }
    println!();

    info!(run_uid, "audit_scan_started");

    let store = ReportStore::new(
        client.clone(),
        report_kind,
        !args.disable_store,
        args.output_scan || args.disable_store,
    );

    let config = ScannerConfig {
        kubewarden_namespace: args.kubewarden_namespace,
        policy_server_url: args.policy_server_url,
        parallel_namespaces: args.parallel_namespaces,
        parallel_resources: args.parallel_resources,
        parallel_policies: args.parallel_policies,
        page_size: args.page_size,
        ignore_namespaces: args.ignore_namespaces,
        tls: TlsOptions {
            extra_ca: args.extra_ca,
            client_cert: args.client_cert,
            client_key: args.client_key,
            insecure: args.insecure_ssl,
        },
    };

    // Ctrl+C stops dispatching new work; in-flight evaluations finish.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = cancel_tx.send(true);
    });

    let scanner = Scanner::new(client, config, store, cancel_rx);

    if args.cluster {
        scanner.scan_cluster_wide(&run_uid).await?;
    } else if let Some(namespace) = &args.namespace {
        scanner.scan_namespace(namespace, &run_uid).await?;
    } else {
        scanner.scan_all_namespaces(&run_uid).await?;
    }

    info!(run_uid, "audit_scan_finished");
    println!("Audit scan finished (run {run_uid}).");
    Ok(())
}
