use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kubewarden-operator")]
#[command(about = "Kubernetes operator for the Kubewarden admission-policy fleet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the reconciliation controllers
    Controller(ControllerArgs),

    /// Run one audit scan over the cluster and persist policy reports
    AuditScanner(AuditScannerArgs),

    /// Manage the operator's CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Manage the CRD validation webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
}

#[derive(Args)]
pub struct ControllerArgs {
    /// Namespace holding every operator-managed workload
    #[arg(long, default_value = "kubewarden")]
    pub deployments_namespace: String,

    /// Keep the deployments namespace out of every policy webhook
    #[arg(long)]
    pub always_accept_admission_reviews_on_deployments_namespace: bool,

    /// Address of the health and metrics endpoint
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub loglevel: String,
}

#[derive(Args)]
pub struct AuditScannerArgs {
    /// Scan a single namespace
    #[arg(long, conflicts_with = "cluster")]
    pub namespace: Option<String>,

    /// Scan cluster-wide resources only
    #[arg(long)]
    pub cluster: bool,

    /// Namespace the policy servers run in
    #[arg(long, default_value = "kubewarden")]
    pub kubewarden_namespace: String,

    /// Override the policy-server base URL (e.g. for port-forwards)
    #[arg(long)]
    pub policy_server_url: Option<String>,

    /// Extra root CA file (PEM) trusted in addition to the system roots
    #[arg(long)]
    pub extra_ca: Option<std::path::PathBuf>,

    /// Client certificate (PEM) for mutual TLS
    #[arg(long, requires = "client_key")]
    pub client_cert: Option<std::path::PathBuf>,

    /// Client key (PEM) for mutual TLS
    #[arg(long, requires = "client_cert")]
    pub client_key: Option<std::path::PathBuf>,

    /// Skip TLS verification of policy servers
    #[arg(long)]
    pub insecure_ssl: bool,

    /// Print every report as JSON while scanning
    #[arg(long)]
    pub output_scan: bool,

    /// Namespaces to leave out of the scan (repeatable)
    #[arg(long = "ignore-namespaces")]
    pub ignore_namespaces: Vec<String>,

    /// Namespaces scanned concurrently
    #[arg(long, default_value_t = 1)]
    pub parallel_namespaces: usize,

    /// Resources scanned concurrently within a namespace
    #[arg(long, default_value_t = 100)]
    pub parallel_resources: usize,

    /// Policies evaluated concurrently per resource
    #[arg(long, default_value_t = 5)]
    pub parallel_policies: usize,

    /// Page size for resource listing
    #[arg(long, default_value_t = 100)]
    pub page_size: u32,

    /// Report CRD family to write
    #[arg(long, default_value = "policyreport", value_parser = ["policyreport", "openreport"])]
    pub report_kind: String,

    /// Evaluate policies without writing reports
    #[arg(long)]
    pub disable_store: bool,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub loglevel: String,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD manifests to stdout
    Generate,

    /// Install or update the CRDs in the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the CRD validation webhook HTTPS server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        /// Directory holding tls.crt and tls.key
        #[arg(long, default_value = "/pki/webhook")]
        cert_dir: std::path::PathBuf,
        #[arg(long, default_value = "info")]
        loglevel: String,
    },
    /// Generate a CA and serving certificate for development
    CertGenerate {
        #[arg(long, default_value = "kubewarden-controller")]
        service_name: String,
        #[arg(long, default_value = "kubewarden")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: std::path::PathBuf,
    },
}

/* ============================= TESTS ============================= */
