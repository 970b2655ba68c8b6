/*!
 * Configuration for the runner process.
 */

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Local,
    Docker,
    Desktop,
}

impl DeploymentMode {
    fn parse(s: &str) -> Self {
        match s {
            "docker" => DeploymentMode::Docker,
            "desktop" => DeploymentMode::Desktop,
            _ => DeploymentMode::Local,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Record store base URL
    pub base_url: String,

    /// Owner ID for token issuance
    pub owner_id: String,

    /// Agent ID for this runner process
    pub agent_id: String,

    /// Default workspace tag scope, e.g. `workspace:agents`
    pub workspace: String,

    /// Affects startup timing and store discovery
    pub deployment_mode: DeploymentMode,

    /// Directory holding the `.bootstrapped` marker
    pub runtime_root: PathBuf,

    /// Per-handler execution timeout
    pub handler_timeout_secs: u64,

    /// Default event-bridge wait deadline
    pub wait_timeout_secs: u64,

    /// Graceful-drain deadline on shutdown
    pub drain_timeout_secs: u64,

    /// Max auth-retry attempts per request
    pub max_retries: u32,

    /// Proactive token refresh interval
    pub token_refresh_secs: u64,

    /// Soft cap on the processing-status table
    pub processing_table_cap: usize,

    /// Per-consumer context rebuild queue bound (newest wins)
    pub rebuild_queue_cap: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            base_url: std::env::var("RCRT_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            owner_id: std::env::var("OWNER_ID")
                .unwrap_or_else(|_| "00000000-0000-0000-0000-000000000001".to_string()),
            agent_id: std::env::var("AGENT_ID")
                .unwrap_or_else(|_| "rcrt-runner".to_string()),
            workspace: std::env::var("WORKSPACE")
                .unwrap_or_else(|_| "workspace:agents".to_string()),
            deployment_mode: DeploymentMode::parse(
                &std::env::var("DEPLOYMENT_MODE").unwrap_or_default(),
            ),
            runtime_root: std::env::var("RUNTIME_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            handler_timeout_secs: env_parse("HANDLER_TIMEOUT_SECS", 120),
            wait_timeout_secs: env_parse("WAIT_TIMEOUT_SECS", 60),
            drain_timeout_secs: env_parse("DRAIN_TIMEOUT_SECS", 30),
            max_retries: env_parse("MAX_RETRIES", 3),
            token_refresh_secs: env_parse("TOKEN_REFRESH_SECS", 600),
            processing_table_cap: env_parse("PROCESSING_TABLE_CAP", 1000),
            rebuild_queue_cap: env_parse("REBUILD_QUEUE_CAP", 8),
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_mode_parses_known_values() {
        assert_eq!(DeploymentMode::parse("docker"), DeploymentMode::Docker);
        assert_eq!(DeploymentMode::parse("desktop"), DeploymentMode::Desktop);
        assert_eq!(DeploymentMode::parse("local"), DeploymentMode::Local);
        assert_eq!(DeploymentMode::parse(""), DeploymentMode::Local);
    }
}
