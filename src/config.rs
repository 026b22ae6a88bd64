//! Application configuration and parsing.

use std::net::SocketAddr;

use anyhow::Context;

use crate::error::AnyError;

/// Application configuration.
///
/// Loaded from a JSON file whose path is given by the
/// `WORKSPACE_CONTROL_PLANE_CONFIG` environment variable.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct Config {
    /// Address the public/internal HTTP API binds to.
    pub server_address: SocketAddr,
    /// Address the `/metrics` exporter binds to, if enabled.
    pub prometheus_address: Option<SocketAddr>,

    /// Region tag applied to this control-plane replica's servers.
    pub region: String,

    pub heartbeat: HeartbeatConfig,
    pub metering: MeteringConfig,
    pub file_sync: FileSyncConfig,

    /// Constant-time-compared shared secret for `/internal/*` endpoints.
    pub internal_service_token: String,

    /// Root under which per-workspace directories are created on a host.
    pub workspace_path_base: String,

    pub default_workspace_images: DefaultWorkspaceImages,

    /// Base URL of the object store used for File Sync (S3-compatible).
    pub object_store: ObjectStoreConfig,

    /// Base URL of the Admin/Billing collaborator for §6.1 endpoints.
    pub admin_base_url: String,

    /// Redis connection URL backing the Workspace Store and Coordination
    /// leases.
    pub redis_url: String,

    pub placement: PlacementConfig,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct HeartbeatConfig {
    #[serde(default = "HeartbeatConfig::default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "HeartbeatConfig::default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "HeartbeatConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "HeartbeatConfig::default_stale_threshold")]
    pub stale_threshold_seconds: i64,
    #[serde(default = "HeartbeatConfig::default_workspace_check_multiplier")]
    pub workspace_check_interval_multiplier: u32,
}

impl HeartbeatConfig {
    fn default_interval() -> u64 {
        30
    }
    fn default_timeout() -> u64 {
        10
    }
    fn default_failure_threshold() -> u32 {
        3
    }
    fn default_stale_threshold() -> i64 {
        120
    }
    fn default_workspace_check_multiplier() -> u32 {
        2
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_seconds: Self::default_interval(),
            timeout_seconds: Self::default_timeout(),
            failure_threshold: Self::default_failure_threshold(),
            stale_threshold_seconds: Self::default_stale_threshold(),
            workspace_check_interval_multiplier: Self::default_workspace_check_multiplier(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct MeteringConfig {
    #[serde(default = "MeteringConfig::default_granularity")]
    pub granularity_seconds: i64,
}

impl MeteringConfig {
    fn default_granularity() -> i64 {
        600
    }
}

impl Default for MeteringConfig {
    fn default() -> Self {
        MeteringConfig {
            granularity_seconds: Self::default_granularity(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct FileSyncConfig {
    #[serde(default = "FileSyncConfig::default_interval", with = "humantime_serde")]
    pub background_interval: std::time::Duration,
    #[serde(default = "FileSyncConfig::default_error_rate_threshold")]
    pub restore_error_rate_threshold: f64,
}

impl FileSyncConfig {
    fn default_interval() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }
    fn default_error_rate_threshold() -> f64 {
        0.10
    }
}

impl Default for FileSyncConfig {
    fn default() -> Self {
        FileSyncConfig {
            background_interval: Self::default_interval(),
            restore_error_rate_threshold: Self::default_error_rate_threshold(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct DefaultWorkspaceImages {
    pub amd64: String,
    pub arm64: String,
    pub gpu: Option<String>,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub prefix: String,
    pub endpoint_url: Option<String>,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct PlacementConfig {
    #[serde(default = "PlacementConfig::default_max_retries")]
    pub max_retries: u32,
}

impl PlacementConfig {
    fn default_max_retries() -> u32 {
        3
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        PlacementConfig {
            max_retries: Self::default_max_retries(),
        }
    }
}

impl Config {
    /// Load application configuration. Respects the
    /// `WORKSPACE_CONTROL_PLANE_CONFIG` environment variable.
    pub fn load_from_env() -> Result<Self, AnyError> {
        let path = std::env::var("WORKSPACE_CONTROL_PLANE_CONFIG")
            .context("Missing required env var WORKSPACE_CONTROL_PLANE_CONFIG")?;
        let content = std::fs::read(&path).context("Could not read config file")?;
        let config: Config =
            serde_json::from_slice(&content).context("Could not deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AnyError> {
        anyhow::ensure!(
            (5..=300).contains(&self.heartbeat.interval_seconds),
            "heartbeat.interval_seconds must be within [5, 300]"
        );
        anyhow::ensure!(
            !self.internal_service_token.is_empty(),
            "internal_service_token must not be empty"
        );
        Ok(())
    }

    /// Constant-time comparison of a bearer token presented on an
    /// `/internal/*` request against the configured shared secret.
    pub fn verify_internal_token(&self, presented: &str) -> bool {
        let expected = self.internal_service_token.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in expected.iter().zip(presented.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> serde_json::Value {
        serde_json::json!({
            "server_address": "0.0.0.0:8080",
            "prometheus_address": null,
            "region": "us-east-1",
            "heartbeat": {},
            "metering": {},
            "file_sync": {},
            "internal_service_token": "s3cret",
            "workspace_path_base": "/var/lib/workspaces",
            "default_workspace_images": { "amd64": "img:amd64", "arm64": "img:arm64" },
            "object_store": { "bucket": "workspaces", "prefix": "ws", "endpoint_url": null },
            "admin_base_url": "http://admin.internal",
            "redis_url": "redis://127.0.0.1/",
            "placement": {}
        })
    }

    #[test]
    fn deserializes_with_component_defaults_applied() {
        let config: Config = serde_json::from_value(minimal_config_json()).unwrap();
        assert_eq!(config.heartbeat.interval_seconds, 30);
        assert_eq!(config.heartbeat.failure_threshold, 3);
        assert_eq!(config.placement.max_retries, 3);
    }

    #[test]
    fn verify_internal_token_is_exact_match_only() {
        let config: Config = serde_json::from_value(minimal_config_json()).unwrap();
        assert!(config.verify_internal_token("s3cret"));
        assert!(!config.verify_internal_token("s3cre"));
        assert!(!config.verify_internal_token("wrong-token"));
    }
}
