use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cluster::{DEFAULT_HOST_LIMIT, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_TARGET_TIMEOUT_SECS};

#[derive(Parser, Debug)]
#[command(name = "flipbit")]
#[command(about = "Spread cluster services across load balancer addresses and nodes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file with FLIPBIT_* / K8S_* settings
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Validate configuration, print it and exit
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the cluster and publish service assignments to load balancers
    Core(CoreArgs),

    /// Serve the update endpoint and maintain proxy stream configuration
    Nginx(NginxArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CoreArgs {
    /// Comma separated load balancer update URLs
    #[arg(long, env = "FLIPBIT_LB_URLS", value_name = "URLS")]
    pub lb_urls: Option<String>,

    /// Per load balancer request timeout in seconds
    #[arg(long, env = "FLIPBIT_LB_TIMEOUT", default_value_t = DEFAULT_TARGET_TIMEOUT_SECS)]
    pub lb_timeout: u64,

    /// Only publish services labelled `<label>=true`
    #[arg(long, env = "FLIPBIT_SERVICE_LABEL", value_name = "LABEL")]
    pub service_label: Option<String>,

    /// Only use nodes labelled `<label>=true`
    #[arg(long, env = "FLIPBIT_NODE_LABEL", value_name = "LABEL")]
    pub node_label: Option<String>,

    /// Maximum number of hosts per service
    #[arg(long, env = "FLIPBIT_HOST_LIMIT", default_value_t = DEFAULT_HOST_LIMIT)]
    pub host_limit: usize,

    /// Seconds between poll cycles
    #[arg(long, env = "FLIPBIT_POLL_INTERVAL", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub interval: u64,

    #[arg(long, env = "K8S_BEARER_TOKEN", hide_env_values = true)]
    pub k8s_bearer_token: Option<String>,

    #[arg(long, env = "K8S_API_SERVER", value_name = "URL")]
    pub k8s_api_server: Option<String>,

    /// PEM encoded CA bundle for the API server
    #[arg(long, env = "K8S_CA_DATA", hide_env_values = true)]
    pub k8s_ca_data: Option<String>,

    #[arg(long, env = "K8S_USERNAME")]
    pub k8s_username: Option<String>,

    #[arg(long, env = "K8S_PASSWORD", hide_env_values = true)]
    pub k8s_password: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct NginxArgs {
    /// Port for the update endpoint
    #[arg(short, long, env = "FLIPBIT_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Bind address for the update endpoint
    #[arg(long, env = "FLIPBIT_BIND_ADDR", value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_addr: IpAddr,

    /// Comma separated virtual addresses the proxy can listen on
    #[arg(long, env = "FLIPBIT_LB_ADDRESSES", value_name = "ADDRS")]
    pub addresses: Option<String>,

    /// Directory holding the generated stream configuration
    #[arg(long, env = "FLIPBIT_STREAM_DIRECTORY", value_name = "DIR")]
    pub stream_directory: Option<PathBuf>,
}

// ============================================================================
// Startup environment
// ============================================================================

/// Load `path` into the process environment. Must run before logging is
/// set up so a `RUST_LOG` in the file takes effect.
pub fn load_env_file(path: &Path) -> Result<PathBuf, dotenvy::Error> {
    dotenvy::from_path(path).map(|()| path.to_path_buf())
}

/// `RUST_LOG` if set, otherwise the level picked by `-v`
pub fn log_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

use crate::config::{CoreConfig, NginxConfig};

/// Format the validated core configuration for `--dry-run`
pub fn format_core_dry_run(config: &CoreConfig) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "flipbit v{} - Dry Run Mode (core)\n\n",
        env!("CARGO_PKG_VERSION")
    ));

    output.push_str(&format!("Load balancers ({}):\n", config.targets.len()));
    for target in &config.targets {
        output.push_str(&format!(
            "  - {} (timeout {}s)\n",
            target.url,
            target.timeout.as_secs()
        ));
    }
    output.push('\n');

    output.push_str(&format!(
        "Cluster: {} ({})\n",
        config.auth.mode(),
        config.auth.api_server().unwrap_or("service account")
    ));
    output.push_str(&format!(
        "  Service filter: {}\n",
        label_filter(config.filters.service_label.as_deref())
    ));
    output.push_str(&format!(
        "  Node filter: {}\n",
        label_filter(config.filters.node_label.as_deref())
    ));
    output.push_str(&format!("  Hosts per service: {}\n", config.selector.limit()));
    output.push_str(&format!("  Poll interval: {}s\n", config.interval.as_secs()));

    output.push_str("\nValidation: PASSED\n");
    output
}

/// Format the validated nginx configuration for `--dry-run`
pub fn format_nginx_dry_run(config: &NginxConfig) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "flipbit v{} - Dry Run Mode (nginx)\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Listening on: {}\n", config.listen));
    output.push_str(&format!(
        "Stream directory: {}\n\n",
        config.stream_directory.display()
    ));

    output.push_str(&format!("Virtual addresses ({}):\n", config.addresses.len()));
    if config.addresses.is_empty() {
        output.push_str("  (none - every service will be rejected)\n");
    }
    for address in &config.addresses {
        output.push_str(&format!("  - {}\n", address));
    }

    output.push_str("\nValidation: PASSED\n");
    output
}

fn label_filter(label: Option<&str>) -> String {
    match label {
        Some(label) => format!("{}=true", label),
        None => "(all)".to_string(),
    }
}
