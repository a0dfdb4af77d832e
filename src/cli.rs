use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-rbac-watch")]
#[command(about = "Least-privilege RBAC inference from Kubernetes audit streams")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the AuditSource and PolicyReport CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the audit-observing operator
    Run(RunArgs),
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

/// Process-level configuration; every flag is environment-variable backed
/// for in-cluster deployment. Log level comes from RUST_LOG.
#[derive(Args)]
pub struct RunArgs {
    /// Metrics bind address
    #[arg(long, env = "RBACWATCH_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    /// Liveness/readiness bind address; equal to the metrics address means
    /// one shared server
    #[arg(long, env = "RBACWATCH_HEALTH_ADDR", default_value = "0.0.0.0:9090")]
    pub health_addr: String,

    /// Enable Lease-based leader election
    #[arg(long, env = "RBACWATCH_LEADER_ELECT", default_value_t = false)]
    pub leader_elect: bool,

    /// Namespace holding the election lease
    #[arg(long, env = "RBACWATCH_LEASE_NAMESPACE", default_value = "default")]
    pub lease_namespace: String,

    /// Name of the election lease
    #[arg(long, env = "RBACWATCH_LEASE_NAME", default_value = "kube-rbac-watch-leader")]
    pub lease_name: String,

    /// Upper bound on flush cycles running at once across pipelines
    #[arg(long, env = "RBACWATCH_CONCURRENT_FLUSHES", default_value_t = 4)]
    pub concurrent_flushes: usize,

    /// Periodic reconcile interval in seconds
    #[arg(long, env = "RBACWATCH_RESYNC_SECONDS", default_value_t = 300)]
    pub resync_seconds: u64,

    /// Attempts before giving up on initial cluster connectivity
    #[arg(long, env = "RBACWATCH_STARTUP_RETRIES", default_value_t = 5)]
    pub startup_retries: u32,
}

impl From<RunArgs> for kube_rbac_watch::controller::OperatorConfig {
    fn from(args: RunArgs) -> Self {
        kube_rbac_watch::controller::OperatorConfig {
            metrics_addr: args.metrics_addr,
            health_addr: args.health_addr,
            leader_elect: args.leader_elect,
            lease_namespace: args.lease_namespace,
            lease_name: args.lease_name,
            concurrent_flushes: args.concurrent_flushes,
            requeue_seconds: args.resync_seconds,
            startup_retries: args.startup_retries,
        }
    }
}
