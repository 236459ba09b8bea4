//! Configuration module
//!
//! The middleware configuration (default backend, routing rules, debug flag)
//! plus the standalone server's file- and CLI-based configuration surface.
//! Rule fields use camelCase wire names.

use crate::error::ForkliftError;
use clap::Parser;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Middleware configuration: where unmatched traffic goes and the rule list
/// that competes for everything else.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Backend receiving requests no rule claims. Required.
    pub default_backend: String,
    /// Routing rules, evaluated in definition order within a priority tier.
    pub rules: Vec<RoutingRule>,
    /// Stamp `X-Selected-Backend` on responses and log routing decisions.
    pub debug: bool,
}

/// A declarative match + action pair.
///
/// Empty string fields mean "not set"; a rule with neither path, prefix,
/// method nor conditions matches every request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingRule {
    /// Exact request path to match.
    pub path: String,
    /// Path prefix to match. May be combined with `path`; both must hold.
    pub path_prefix: String,
    /// HTTP method to match, uppercase.
    pub method: String,
    /// All conditions must hold (AND).
    pub conditions: Vec<RuleCondition>,
    /// Destination base URL (scheme + authority).
    pub backend: String,
    /// Share of traffic in [0, 100]. Zero means the rule is unconditional
    /// when it matches.
    pub percentage: f64,
    /// Higher priority wins when multiple rules compete.
    pub priority: i32,
    /// Replacement for `path_prefix` in the forwarded path.
    pub path_prefix_rewrite: String,
    /// Groups rules that share a stickiness bucket.
    pub affinity_token: String,
}

/// A sub-predicate inside a rule, inspecting one request attribute.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleCondition {
    /// One of `header`, `query`, `cookie`, `form` (case-insensitive).
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Header / cookie / form field name (all types except `query`).
    pub parameter: String,
    /// Query parameter name (type `query`).
    pub query_param: String,
    /// One of `eq`/`equals`, `contains`, `prefix`, `suffix`, `gt`.
    pub operator: String,
    /// Expected value; parsed as a number only for `gt`.
    pub value: String,
}

impl Config {
    /// Validate the construction invariants.
    pub fn validate(&self) -> Result<(), ForkliftError> {
        if self.default_backend.is_empty() {
            return Err(ForkliftError::MissingDefaultBackend);
        }
        validate_backend_url(&self.default_backend)?;

        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| ForkliftError::Config(format!("rule {}: {}", index, e)))?;
        }

        Ok(())
    }
}

impl RoutingRule {
    /// Validate a single rule.
    pub fn validate(&self) -> Result<(), ForkliftError> {
        if !(0.0..=100.0).contains(&self.percentage) {
            return Err(ForkliftError::InvalidPercentage {
                value: self.percentage,
            });
        }
        if self.backend.is_empty() {
            return Err(ForkliftError::Config("backend cannot be empty".to_string()));
        }
        validate_backend_url(&self.backend)?;
        if !self.path_prefix_rewrite.is_empty() && self.path_prefix.is_empty() {
            return Err(ForkliftError::Config(
                "pathPrefixRewrite requires pathPrefix".to_string(),
            ));
        }
        Ok(())
    }
}

/// A backend must be an absolute URI with scheme and authority, otherwise
/// every outbound request built against it would fail.
fn validate_backend_url(url: &str) -> Result<(), ForkliftError> {
    let uri: Uri = url.parse().map_err(|e| ForkliftError::BackendUrl {
        url: url.to_string(),
        reason: format!("{}", e),
    })?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ForkliftError::BackendUrl {
            url: url.to_string(),
            reason: "scheme and authority are required".to_string(),
        });
    }
    Ok(())
}

/// Top-level configuration for the standalone server binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Listening address and port
    #[serde(default)]
    pub listen: ListenConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Middleware routing configuration
    pub routing: Config,
}

/// Listen configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "forklift")]
#[command(about = "Session-sticky A/B testing and canary routing reverse proxy")]
#[command(version)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "forklift.yaml")]
    pub config: PathBuf,

    /// Override listen address
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Override listen port
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Override log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable debug routing output (X-Selected-Backend header)
    #[arg(long)]
    pub debug: bool,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ForkliftError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForkliftError::Config(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: AppConfig = serde_yaml::from_str(&content).map_err(|e| {
            ForkliftError::Config(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from command-line arguments, applying overrides on
    /// top of the file.
    pub fn from_args(args: Args) -> Result<Self, ForkliftError> {
        let mut config = Self::from_file(&args.config)?;

        if let Some(address) = args.listen_address {
            config.listen.address = address;
        }
        if let Some(port) = args.listen_port {
            config.listen.port = port;
        }
        if let Some(level) = args.log_level {
            config.logging.level = level;
        }
        if args.debug {
            config.routing.debug = true;
        }

        config.validate()?;

        Ok(config)
    }

    /// Get the socket address to listen on.
    pub fn socket_addr(&self) -> Result<SocketAddr, ForkliftError> {
        let addr = format!("{}:{}", self.listen.address, self.listen.port);
        Ok(addr.parse()?)
    }

    /// Validate the full configuration.
    pub fn validate(&self) -> Result<(), ForkliftError> {
        let addr = format!("{}:{}", self.listen.address, self.listen.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| ForkliftError::Config(format!("invalid listen address: {}", e)))?;

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ForkliftError::Config(format!(
                    "invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        self.routing.validate()
    }
}
