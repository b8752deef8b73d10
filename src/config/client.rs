//! Client-side settings — remote endpoint, tracked resources, local layers

use super::transport::{RabbitMqOptions, RedisConnection};
use crate::error::{ConfigServiceError, Result};
use crate::parser::{parser_for_path, ParserRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Settings for a client that merges local files with remote resources
///
/// Layers are merged in order: every local file (as listed), then every
/// remote resource (as listed). Later layers win on key collisions.
///
/// # HCL Example
///
/// ```hcl
/// service_uri = "http://config.internal:8088"
///
/// local_files = [
///   { path = "appsettings.json" },
///   { path = "appsettings.local.ini", optional = true, reload_on_change = true },
/// ]
///
/// resources = [
///   { name = "shared.json" },
///   { name = "billing/limits.ini", parser = "ini", optional = true },
/// ]
///
/// redis = "cache.internal:6379"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteClientSettings {
    /// Base URI of the fetch endpoint; resources are fetched from `<service_uri>/<name>`
    #[serde(default)]
    pub service_uri: String,

    /// Per-request timeout for remote fetches in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Local file layers, merged first
    #[serde(default)]
    pub local_files: Vec<LocalFileConfig>,

    /// Remote resource layers, merged after local files
    #[serde(default)]
    pub resources: Vec<RemoteResourceConfig>,

    /// Redis subscriber settings
    #[serde(default)]
    pub redis: Option<RedisConnection>,

    /// RabbitMQ subscriber settings
    #[serde(default)]
    pub rabbitmq: Option<RabbitMqOptions>,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RemoteClientSettings {
    fn default() -> Self {
        Self {
            service_uri: String::new(),
            request_timeout_secs: default_request_timeout(),
            local_files: Vec::new(),
            resources: Vec::new(),
            redis: None,
            rabbitmq: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A local configuration file layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileConfig {
    /// File path
    pub path: PathBuf,
    /// Tolerate a missing file (empty layer)
    #[serde(default)]
    pub optional: bool,
    /// Reload the layer when the file changes on disk
    #[serde(default)]
    pub reload_on_change: bool,
    /// Parser name; defaults by extension
    #[serde(default)]
    pub parser: Option<String>,
}

impl LocalFileConfig {
    /// Required, non-watched file using the extension's default parser
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            optional: false,
            reload_on_change: false,
            parser: None,
        }
    }

    /// Parser name used for this file
    pub fn parser_name(&self) -> &str {
        self.parser
            .as_deref()
            .unwrap_or_else(|| parser_for_path(&self.path))
    }

    /// Layer identifier
    pub fn layer_id(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// A remote resource layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResourceConfig {
    /// Resource name, also the notification topic
    pub name: String,
    /// Tolerate a missing resource (empty layer)
    #[serde(default)]
    pub optional: bool,
    /// Re-fetch when a change notification arrives (default: true)
    #[serde(default = "default_true")]
    pub reload_on_change: bool,
    /// Parser name (default: json)
    #[serde(default)]
    pub parser: Option<String>,
}

impl RemoteResourceConfig {
    /// Required, live-reloaded resource parsed as JSON
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            reload_on_change: true,
            parser: None,
        }
    }

    /// Parser name used for this resource
    pub fn parser_name(&self) -> &str {
        self.parser.as_deref().unwrap_or(ParserRegistry::DEFAULT)
    }

    /// Layer identifier
    pub fn layer_id(&self) -> String {
        format!("remote:{}", self.name)
    }
}

impl RemoteClientSettings {
    /// Load settings from an HCL file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConfigServiceError::Config(format!(
                "Failed to read client settings {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse settings from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content).map_err(|e| {
            ConfigServiceError::Config(format!("Failed to parse client settings: {}", e))
        })
    }

    /// Validate settings before any network activity
    pub fn validate(&self) -> Result<()> {
        if self.service_uri.trim().is_empty() {
            return Err(ConfigServiceError::Config(
                "service_uri is required".to_string(),
            ));
        }
        let url = reqwest::Url::parse(&self.service_uri).map_err(|e| {
            ConfigServiceError::Config(format!(
                "Invalid service_uri '{}': {}",
                self.service_uri, e
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigServiceError::Config(format!(
                "service_uri '{}' must use http or https",
                self.service_uri
            )));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigServiceError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        for file in &self.local_files {
            if file.path.as_os_str().is_empty() {
                return Err(ConfigServiceError::Config(
                    "Local file path cannot be empty".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err(ConfigServiceError::Config(
                    "Remote resource name cannot be empty".to_string(),
                ));
            }
            if resource.name.starts_with('/') {
                return Err(ConfigServiceError::Config(format!(
                    "Remote resource name '{}' must be relative",
                    resource.name
                )));
            }
            if !names.insert(resource.name.as_str()) {
                return Err(ConfigServiceError::Config(format!(
                    "Remote resource '{}' is listed twice",
                    resource.name
                )));
            }
        }

        if let Some(ref redis) = self.redis {
            redis.validate()?;
        }
        if let Some(ref rabbitmq) = self.rabbitmq {
            rabbitmq.validate()?;
        }

        Ok(())
    }

    /// Check that every layer names a registered parser
    pub fn validate_parsers(&self, parsers: &ParserRegistry) -> Result<()> {
        let requested = self
            .local_files
            .iter()
            .map(|f| (f.layer_id(), f.parser_name().to_string()))
            .chain(
                self.resources
                    .iter()
                    .map(|r| (r.layer_id(), r.parser_name().to_string())),
            );

        for (layer, parser) in requested {
            if !parsers.contains(&parser) {
                return Err(ConfigServiceError::Config(format!(
                    "Layer '{}' uses unknown parser '{}' (registered: {})",
                    layer,
                    parser,
                    parsers.names().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Whether any subscriber transport is configured
    pub fn has_transport(&self) -> bool {
        self.redis.is_some() || self.rabbitmq.is_some()
    }
}
