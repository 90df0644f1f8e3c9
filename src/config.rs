//! Configuration module for the Fluent Forward exporter.
//!
//! Configuration is loaded from `FLUENT_FORWARD_*` environment variables,
//! falling back to defaults that match a local Fluentd / Fluent Bit
//! listening on the standard forward port.

use std::collections::BTreeMap;
use std::env;
use std::net::ToSocketAddrs;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::SendMode;
use crate::translator::{
    KubernetesMetadata, TranslatorConfig, DEFAULT_KUBERNETES_KEY, MESSAGE_LABEL, SEVERITY_LABEL,
    TIME_LABEL,
};

/// Default collector address
const DEFAULT_ENDPOINT: &str = "localhost:24224";

/// Default routing tag
const DEFAULT_TAG: &str = "tag";

/// Default connect timeout in seconds
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Maximum connect timeout in seconds
const MAX_CONNECTION_TIMEOUT_SECS: u64 = 300;

/// Hostname announced in the handshake when none can be determined
const FALLBACK_HOSTNAME: &str = "localhost";

/// Labels enabled when `FLUENT_FORWARD_DEFAULT_LABELS` is unset
const DEFAULT_LABELS: &[&str] = &[
    SEVERITY_LABEL,
    MESSAGE_LABEL,
    TIME_LABEL,
    "exporter",
    "job",
    "instance",
];

/// Error type for configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable holds an unusable value
    #[error("Configuration error for {env_var}: {message}")]
    Env { env_var: String, message: String },

    /// The assembled configuration is inconsistent
    #[error("Configuration error: {0}")]
    Invalid(String),

    /// The endpoint is malformed or does not resolve
    #[error("exporter has an invalid TCP endpoint: {0}")]
    InvalidEndpoint(String),

    /// TLS is enabled with certificate verification but no context was supplied
    #[error("TLS is enabled with certificate verification but no TLS context was provided")]
    MissingTlsContext,

    /// TLS client configuration could not be built
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Transport security settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Wrap the connection in TLS
    pub enabled: bool,

    /// Accept any server certificate
    pub insecure_skip_verify: bool,

    /// Name to verify the server certificate against; defaults to the endpoint host
    pub server_name: Option<String>,
}

/// Configuration for the Fluent Forward exporter.
///
/// All settings can be configured via environment variables:
/// - `FLUENT_FORWARD_ENDPOINT`: collector `host:port` (default: localhost:24224)
/// - `FLUENT_FORWARD_TAG`: routing tag (default: tag)
/// - `FLUENT_FORWARD_SHARED_KEY`: enables the shared-key handshake
/// - `FLUENT_FORWARD_REQUIRE_ACK`, `FLUENT_FORWARD_COMPRESS_GZIP`: delivery modes
/// - `FLUENT_FORWARD_DEFAULT_LABELS`: e.g. `time,severity=true,job=false`
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Collector address as `host:port`
    pub endpoint: String,

    /// Resolve the endpoint during validation
    pub validate_tcp_resolution: bool,

    /// Timeout for establishing the connection
    pub connection_timeout: Duration,

    /// Transport security
    pub tls: TlsSettings,

    /// Shared key for the authentication handshake
    pub shared_key: Option<String>,

    /// Hostname announced during the handshake
    pub self_hostname: String,

    /// Wait for the server to acknowledge every message
    pub require_ack: bool,

    /// Routing tag sent with every message
    pub tag: String,

    /// Send messages in gzip-compressed PackedForward mode
    pub compress_gzip: bool,

    /// Labels to include in every record
    pub default_labels_enabled: BTreeMap<String, bool>,

    /// Kubernetes metadata enrichment
    pub kubernetes_metadata: Option<KubernetesMetadata>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable holds a value that cannot be parsed.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fluent_forward_exporter::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Endpoint: {}", config.endpoint);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let endpoint = lookup("FLUENT_FORWARD_ENDPOINT")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.endpoint);

        let connection_timeout = match lookup("FLUENT_FORWARD_CONNECTION_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(parse_timeout(
                "FLUENT_FORWARD_CONNECTION_TIMEOUT_SECS",
                &value,
            )?),
            None => defaults.connection_timeout,
        };

        let tls = TlsSettings {
            enabled: parse_bool(&lookup, "FLUENT_FORWARD_TLS_ENABLED")?.unwrap_or(false),
            insecure_skip_verify: parse_bool(&lookup, "FLUENT_FORWARD_TLS_INSECURE_SKIP_VERIFY")?
                .unwrap_or(false),
            server_name: lookup("FLUENT_FORWARD_TLS_SERVER_NAME").filter(|v| !v.is_empty()),
        };

        let default_labels_enabled = match lookup("FLUENT_FORWARD_DEFAULT_LABELS") {
            Some(value) => parse_labels("FLUENT_FORWARD_DEFAULT_LABELS", &value)?,
            None => defaults.default_labels_enabled,
        };

        let kubernetes_metadata = match lookup("FLUENT_FORWARD_K8S_METADATA_KEY") {
            Some(key) => Some(KubernetesMetadata {
                key: if key.trim().is_empty() {
                    DEFAULT_KUBERNETES_KEY.to_string()
                } else {
                    key.trim().to_string()
                },
                include_pod_labels: parse_bool(&lookup, "FLUENT_FORWARD_K8S_INCLUDE_POD_LABELS")?
                    .unwrap_or(false),
            }),
            None => None,
        };

        Ok(Self {
            endpoint,
            validate_tcp_resolution: parse_bool(&lookup, "FLUENT_FORWARD_VALIDATE_TCP_RESOLUTION")?
                .unwrap_or(false),
            connection_timeout,
            tls,
            shared_key: lookup("FLUENT_FORWARD_SHARED_KEY").filter(|v| !v.is_empty()),
            self_hostname: lookup("FLUENT_FORWARD_SELF_HOSTNAME")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.self_hostname),
            require_ack: parse_bool(&lookup, "FLUENT_FORWARD_REQUIRE_ACK")?.unwrap_or(false),
            tag: lookup("FLUENT_FORWARD_TAG").unwrap_or(defaults.tag),
            compress_gzip: parse_bool(&lookup, "FLUENT_FORWARD_COMPRESS_GZIP")?.unwrap_or(false),
            default_labels_enabled,
            kubernetes_metadata,
        })
    }

    /// Check the configuration before an exporter is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tag.trim().is_empty() {
            return Err(ConfigError::Invalid("tag must not be empty".to_string()));
        }

        if self.connection_timeout.is_zero()
            || self.connection_timeout > Duration::from_secs(MAX_CONNECTION_TIMEOUT_SECS)
        {
            return Err(ConfigError::Invalid(format!(
                "connection timeout must be between 1 and {}s",
                MAX_CONNECTION_TIMEOUT_SECS
            )));
        }

        let Some((host, port)) = self.endpoint.rsplit_once(':') else {
            return Err(ConfigError::InvalidEndpoint(format!(
                "address {}: missing port",
                self.endpoint
            )));
        };
        if host.is_empty() || host.contains('/') || port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidEndpoint(format!(
                "address {}: expected host:port",
                self.endpoint
            )));
        }

        if self.validate_tcp_resolution {
            // Fail now rather than when the exporter first connects.
            let resolved = self
                .endpoint
                .to_socket_addrs()
                .map_err(|e| ConfigError::InvalidEndpoint(format!("address {}: {}", self.endpoint, e)))?;
            if resolved.count() == 0 {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "address {}: no addresses found",
                    self.endpoint
                )));
            }
        }

        Ok(())
    }

    /// Host part of the endpoint, without brackets for IPv6 literals.
    pub fn endpoint_host(&self) -> &str {
        self.endpoint
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.endpoint)
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    /// Transmission mode fixed by the compression flag.
    pub fn send_mode(&self) -> SendMode {
        SendMode::from_compression(self.compress_gzip)
    }

    /// Settings for the record translator.
    pub fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            default_labels_enabled: self.default_labels_enabled.clone(),
            kubernetes_metadata: self.kubernetes_metadata.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            validate_tcp_resolution: false,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            tls: TlsSettings::default(),
            shared_key: None,
            self_hostname: default_hostname(),
            require_ack: false,
            tag: DEFAULT_TAG.to_string(),
            compress_gzip: false,
            default_labels_enabled: DEFAULT_LABELS
                .iter()
                .map(|label| (label.to_string(), true))
                .collect(),
            kubernetes_metadata: None,
        }
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

fn parse_bool<F>(lookup: &F, env_var: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(env_var) {
        Some(value) => parse_bool_value(&value)
            .map(Some)
            .ok_or_else(|| ConfigError::Env {
                env_var: env_var.to_string(),
                message: format!("'{}' is not a valid boolean", value),
            }),
        None => Ok(None),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_timeout(env_var: &str, value: &str) -> Result<u64, ConfigError> {
    let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Env {
        env_var: env_var.to_string(),
        message: format!("'{}' is not a valid number", value),
    })?;

    if secs == 0 {
        return Err(ConfigError::Env {
            env_var: env_var.to_string(),
            message: "timeout must be greater than 0".to_string(),
        });
    }

    if secs > MAX_CONNECTION_TIMEOUT_SECS {
        return Err(ConfigError::Env {
            env_var: env_var.to_string(),
            message: format!(
                "timeout {} exceeds maximum ({}s)",
                secs, MAX_CONNECTION_TIMEOUT_SECS
            ),
        });
    }

    Ok(secs)
}

/// Parse `name[=bool],...` into a label map. A bare name means enabled.
fn parse_labels(env_var: &str, value: &str) -> Result<BTreeMap<String, bool>, ConfigError> {
    let mut labels = BTreeMap::new();

    for item in value.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (name, enabled) = match item.split_once('=') {
            Some((name, flag)) => {
                let enabled = parse_bool_value(flag).ok_or_else(|| ConfigError::Env {
                    env_var: env_var.to_string(),
                    message: format!("'{}' is not a valid boolean for label {}", flag, name.trim()),
                })?;
                (name.trim(), enabled)
            }
            None => (item, true),
        };

        if name.is_empty() {
            return Err(ConfigError::Env {
                env_var: env_var.to_string(),
                message: format!("empty label name in '{}'", item),
            });
        }

        labels.insert(name.to_string(), enabled);
    }

    Ok(labels)
}
