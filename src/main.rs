//! APIM gateway - REST management of NGINX Ingress Controller resources

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::ResourceExt;
use tracing::info;

use apim_api::cluster::DEFAULT_PAGE_SIZE;
use apim_api::{start_server, KubeClusterApi, ServerConfig};
use apim_common::client::create_client;
use apim_common::crd::crds_yaml;
use apim_common::policy_list::{parse_policy_list, PolicyList};
use apim_common::retry::Backoff;
use apim_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use apim_common::DEFAULT_POLICY_NAMESPACE;

/// Attempts per list page unless `--list-attempts` says otherwise
const DEFAULT_LIST_ATTEMPTS: u32 = 5;

/// APIM gateway - manage NGINX Ingress policies, servers, upstreams and certificates
#[derive(Parser, Debug)]
#[command(name = "apim", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway (default mode)
    Serve(ServeArgs),

    /// Print the Policy and VirtualServer CRD manifests and exit
    Crd,

    /// Schema-check a captured PolicyList JSON document
    ///
    /// Accepts the API server's PolicyList or the gateway's
    /// `{"data": PolicyList}` wrapper.
    Validate {
        /// Path to the JSON file
        file: PathBuf,
    },
}

/// Serve mode arguments
#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "APIM_ADDR", default_value = "0.0.0.0:8000")]
    addr: SocketAddr,

    /// Namespace IP access control policies are managed in
    #[arg(long, env = "APIM_POLICY_NAMESPACE", default_value = DEFAULT_POLICY_NAMESPACE)]
    policy_namespace: String,

    /// Kubeconfig file to use instead of in-cluster / inferred configuration
    ///
    /// Inference already honors `KUBECONFIG`, including colon-separated lists.
    #[arg(long, env = "APIM_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Items requested per page when listing from the API server
    #[arg(long, env = "APIM_LIST_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE,
          value_parser = clap::value_parser!(u32).range(1..))]
    list_page_size: u32,

    /// Attempts per list page before a transient API server error is returned
    #[arg(long, env = "APIM_LIST_ATTEMPTS", default_value_t = DEFAULT_LIST_ATTEMPTS,
          value_parser = clap::value_parser!(u32).range(1..))]
    list_attempts: u32,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty_logs: bool,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            policy_namespace: DEFAULT_POLICY_NAMESPACE.to_string(),
            kubeconfig: None,
            list_page_size: DEFAULT_PAGE_SIZE,
            list_attempts: DEFAULT_LIST_ATTEMPTS,
            pretty_logs: false,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            let yaml = crds_yaml().map_err(|e| anyhow::anyhow!("Failed to render CRDs: {}", e))?;
            print!("{yaml}");
            Ok(())
        }
        Some(Commands::Validate { file }) => {
            let list = validate_file(&file).await?;
            print!("{}", summarize(&list));
            Ok(())
        }
        Some(Commands::Serve(args)) => run_server(args).await,
        None => run_server(ServeArgs::default()).await,
    }
}

/// Run the gateway until ctrl-c
async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        format: if args.pretty_logs {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        },
        ..Default::default()
    })?;

    let client = create_client(args.kubeconfig.as_deref()).await?;
    let cluster = Arc::new(
        KubeClusterApi::new(client)
            .with_page_size(args.list_page_size)
            .with_backoff(Backoff::with_attempts(args.list_attempts)),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        kubeconfig = ?args.kubeconfig,
        list_page_size = args.list_page_size,
        list_attempts = args.list_attempts,
        "APIM gateway initializing"
    );

    let config = ServerConfig {
        addr: args.addr,
        policy_namespace: args.policy_namespace,
    };
    start_server(config, cluster).await?;
    Ok(())
}

/// Read and schema-check a PolicyList capture
async fn validate_file(path: &Path) -> anyhow::Result<PolicyList> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    parse_policy_list(&content)
        .map_err(|e| anyhow::anyhow!("{} is not a valid PolicyList: {}", path.display(), e))
}

/// One line per policy plus a trailer
fn summarize(list: &PolicyList) -> String {
    let mut out = String::new();
    for policy in &list.items {
        let kind = policy
            .ip_rule_kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{}/{}\t{}\t{:?}\t{}\t{}\n",
            policy.namespace().unwrap_or_default(),
            policy.name_any(),
            kind,
            policy.state(),
            policy.apply_range(),
            policy.ip_sources().join(","),
        ));
    }
    out.push_str(&format!(
        "{} policies ({} valid), resourceVersion {}",
        list.items.len(),
        list.valid_items().count(),
        list.resource_version().unwrap_or("-"),
    ));
    if list.has_more() {
        out.push_str(", more pages available");
    }
    out.push('\n');
    out
}
