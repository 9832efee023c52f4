//! Validated runtime configuration
//!
//! The CLI layer only collects raw flag and environment values. Everything
//! here turns them into typed settings and rejects bad input before any
//! loop or listener starts.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::cli::{CoreArgs, NginxArgs};
use crate::cluster::{HostSelector, LabelFilters, LoadBalancerTarget, PollerConfig};

/// Errors in startup configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No load balancer URLs configured (set --lb-urls or FLIPBIT_LB_URLS)")]
    NoTargets,

    #[error("Invalid load balancer URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid virtual address '{0}'")]
    InvalidAddress(String),

    #[error("No stream directory configured (set --stream-directory or FLIPBIT_STREAM_DIRECTORY)")]
    NoStreamDirectory,

    #[error("Stream directory {} does not exist or is not a directory", .0.display())]
    MissingDirectory(PathBuf),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{field} is required when using {mode} authentication")]
    MissingCredential {
        mode: &'static str,
        field: &'static str,
    },
}

/// How the publisher reaches the cluster API
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterAuth {
    /// Service account mounted into the pod
    InCluster,
    Token {
        api_server: String,
        token: String,
        ca_data: Option<String>,
    },
    Basic {
        api_server: String,
        username: String,
        password: String,
        ca_data: Option<String>,
    },
}

impl ClusterAuth {
    /// Pick the connection mode: token, then basic auth, then in-cluster
    pub fn resolve(
        token: Option<&str>,
        api_server: Option<&str>,
        ca_data: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let api_server = non_empty(api_server);
        let ca_data = non_empty(ca_data).map(str::to_string);

        if let Some(token) = non_empty(token) {
            let api_server = api_server.ok_or(ConfigError::MissingCredential {
                mode: "token",
                field: "K8S_API_SERVER",
            })?;
            return Ok(Self::Token {
                api_server: api_server.to_string(),
                token: token.to_string(),
                ca_data,
            });
        }

        if let Some(username) = non_empty(username) {
            let password = non_empty(password).ok_or(ConfigError::MissingCredential {
                mode: "basic",
                field: "K8S_PASSWORD",
            })?;
            let api_server = api_server.ok_or(ConfigError::MissingCredential {
                mode: "basic",
                field: "K8S_API_SERVER",
            })?;
            return Ok(Self::Basic {
                api_server: api_server.to_string(),
                username: username.to_string(),
                password: password.to_string(),
                ca_data,
            });
        }

        Ok(Self::InCluster)
    }

    pub fn api_server(&self) -> Option<&str> {
        match self {
            Self::InCluster => None,
            Self::Token { api_server, .. } | Self::Basic { api_server, .. } => Some(api_server),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::InCluster => "in-cluster",
            Self::Token { .. } => "token",
            Self::Basic { .. } => "basic",
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for ClusterAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InCluster => f.write_str("InCluster"),
            Self::Token { api_server, .. } => f
                .debug_struct("Token")
                .field("api_server", api_server)
                .finish_non_exhaustive(),
            Self::Basic {
                api_server,
                username,
                ..
            } => f
                .debug_struct("Basic")
                .field("api_server", api_server)
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Settings for `flipbit core`
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub targets: Vec<LoadBalancerTarget>,
    pub filters: LabelFilters,
    pub selector: HostSelector,
    pub interval: Duration,
    pub auth: ClusterAuth,
}

impl CoreConfig {
    pub fn from_args(args: &CoreArgs) -> Result<Self, ConfigError> {
        if args.lb_timeout == 0 {
            return Err(ConfigError::Zero("Load balancer timeout"));
        }
        if args.interval == 0 {
            return Err(ConfigError::Zero("Poll interval"));
        }
        if args.host_limit == 0 {
            return Err(ConfigError::Zero("Host limit"));
        }

        let targets = parse_targets(args.lb_urls.as_deref().unwrap_or(""), args.lb_timeout)?;
        let auth = ClusterAuth::resolve(
            args.k8s_bearer_token.as_deref(),
            args.k8s_api_server.as_deref(),
            args.k8s_ca_data.as_deref(),
            args.k8s_username.as_deref(),
            args.k8s_password.as_deref(),
        )?;

        Ok(Self {
            targets,
            filters: LabelFilters {
                service_label: non_empty(args.service_label.as_deref()).map(str::to_string),
                node_label: non_empty(args.node_label.as_deref()).map(str::to_string),
            },
            selector: HostSelector::new(args.host_limit),
            interval: Duration::from_secs(args.interval),
            auth,
        })
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: self.interval,
            selector: self.selector,
            targets: self.targets.clone(),
        }
    }
}

/// Settings for `flipbit nginx`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxConfig {
    pub listen: SocketAddr,
    pub addresses: Vec<IpAddr>,
    pub stream_directory: PathBuf,
}

/// Split a comma separated list, dropping blanks
pub fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse target URLs; only http and https are accepted
pub fn parse_targets(list: &str, timeout_secs: u64) -> Result<Vec<LoadBalancerTarget>, ConfigError> {
    let mut targets = Vec::new();
    for raw in split_list(list) {
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        targets.push(LoadBalancerTarget::new(raw, timeout_secs));
    }

    if targets.is_empty() {
        return Err(ConfigError::NoTargets);
    }
    Ok(targets)
}

/// Parse the virtual address pool, keeping the first occurrence of repeats
pub fn parse_addresses(list: &str) -> Result<Vec<IpAddr>, ConfigError> {
    let mut addresses = Vec::new();
    for raw in split_list(list) {
        let address: IpAddr = raw
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(raw.to_string()))?;
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
    Ok(addresses)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

impl NginxConfig {
    /// Validate arguments; the stream directory must already exist
    pub fn from_args(args: &NginxArgs) -> Result<Self, ConfigError> {
        let stream_directory = args
            .stream_directory
            .clone()
            .ok_or(ConfigError::NoStreamDirectory)?;
        check_directory(&stream_directory)?;

        Ok(Self {
            listen: SocketAddr::new(args.bind_addr, args.port),
            addresses: parse_addresses(args.addresses.as_deref().unwrap_or(""))?,
            stream_directory,
        })
    }
}

fn check_directory(path: &Path) -> Result<(), ConfigError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::MissingDirectory(path.to_path_buf()))
    }
}
