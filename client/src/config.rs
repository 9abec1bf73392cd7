//! Configuration file parser for DoTunnel
//!
//! Supports dotunnel.yml with relay location, handshake path shape,
//! reconnect timing and debug output.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Placeholder replaced by the proxy name in templates
const NAME_PLACEHOLDER: &str = "{name}";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotunnelConfig {
    /// Relay server base URL
    #[serde(default = "default_relay")]
    pub relay: String,

    /// Handshake path, e.g. `/{name}` or `/register/{name}`
    #[serde(default = "default_register_path")]
    pub register_path: String,

    /// Public URL shown once the tunnel is up
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Host of the local service
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Delay before reconnecting after an oversize close
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Time allowed for in-flight sends after the close frame
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Extra handshake attempts on retryable failures
    #[serde(default)]
    pub handshake_retries: u32,

    /// Verbose output
    #[serde(default)]
    pub debug: bool,
}

impl Default for DotunnelConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            register_path: default_register_path(),
            public_url: default_public_url(),
            local_host: default_local_host(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            handshake_retries: 0,
            debug: false,
        }
    }
}

fn default_relay() -> String {
    "wss://proxy.ayooub.me".to_string()
}

fn default_register_path() -> String {
    "/{name}".to_string()
}

fn default_public_url() -> String {
    "https://{name}-prxy.ayooub.me".to_string()
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

impl DotunnelConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DotunnelConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            anyhow::bail!("Relay URL must use ws:// or wss://, got '{}'", self.relay);
        }
        if !self.register_path.starts_with('/') || !self.register_path.contains(NAME_PLACEHOLDER) {
            anyhow::bail!(
                "register_path must start with '/' and contain {}, got '{}'",
                NAME_PLACEHOLDER,
                self.register_path
            );
        }
        if !self.public_url.contains(NAME_PLACEHOLDER) {
            anyhow::bail!("public_url must contain {}", NAME_PLACEHOLDER);
        }
        if self.reconnect_delay_ms == 0 || self.shutdown_grace_ms == 0 {
            anyhow::bail!("reconnect_delay_ms and shutdown_grace_ms must be non-zero");
        }
        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = [
            "dotunnel.yml",
            "dotunnel.yaml",
            ".dotunnel.yml",
            ".dotunnel.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }

    /// Handshake URL for a proxy name
    pub fn relay_url(&self, proxy_name: &str) -> String {
        format!(
            "{}{}",
            self.relay.trim_end_matches('/'),
            self.register_path.replace(NAME_PLACEHOLDER, proxy_name)
        )
    }

    pub fn public_url(&self, proxy_name: &str) -> String {
        self.public_url.replace(NAME_PLACEHOLDER, proxy_name)
    }

    pub fn local_base(&self, port: u16) -> String {
        format!("http://{}:{}", self.local_host, port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Proxy names become a DNS label on the relay side
pub fn validate_proxy_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        anyhow::bail!("Proxy name must be 1-63 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        anyhow::bail!("Proxy name may only contain lowercase letters, digits and '-'");
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("Proxy name cannot start or end with '-'");
    }
    Ok(())
}
