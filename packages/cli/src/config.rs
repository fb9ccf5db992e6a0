//! Configuration module
//!
//! Loads CLI configuration from a TOML file; every section falls back to
//! usable defaults so a missing file is not an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use boardlink_client::{BoardUploadSpec, DaemonConfig};
use serde::{Deserialize, Serialize};

/// Main configuration structure for the BoardLink CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent discovery settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Device registration backend
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Provisioning upload parameters
    #[serde(default)]
    pub provision: ProvisionConfig,
}

/// Agent discovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Probe `https://localhost` before `http://127.0.0.1`
    #[serde(default)]
    pub secure_host_first: bool,
}

/// Device registration backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Endpoint receiving the CSR
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Bearer token for the endpoint
    #[serde(default)]
    pub token: Option<String>,
}

/// Provisioning upload parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Image extension of the compiled provisioning sketch
    #[serde(default = "default_ext")]
    pub ext: String,

    /// Flashing commandline for the provisioning upload
    #[serde(default = "default_commandline")]
    pub commandline: String,

    /// Commandline signature
    #[serde(default)]
    pub signature: String,

    #[serde(default = "default_true")]
    pub wait_for_upload_port: bool,

    #[serde(default = "default_true")]
    pub use_1200bps_touch: bool,
}

// Default value functions
fn default_registry_url() -> String {
    "https://api.boardlink.dev/v1/devices".to_string()
}

fn default_ext() -> String {
    ".bin".to_string()
}

fn default_commandline() -> String {
    r#""{runtime.tools.bossac.path}/bossac" -i -d --port={serial.port.file} -U true -i -e -w -v "{build.path}/{build.project_name}.bin" -R"#
        .to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            token: None,
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            ext: default_ext(),
            commandline: default_commandline(),
            signature: String::new(),
            wait_for_upload_port: default_true(),
            use_1200bps_touch: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location, or fall
    /// back to defaults when no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("boardlink").join("config.toml"))
    }

    /// Daemon construction parameters derived from this configuration.
    pub fn daemon_config(&self) -> DaemonConfig {
        if self.agent.secure_host_first {
            DaemonConfig::secure_host_first()
        } else {
            DaemonConfig::default()
        }
    }

    /// Upload parameters for the provisioning sketch.
    pub fn upload_spec(&self) -> BoardUploadSpec {
        BoardUploadSpec {
            ext: self.provision.ext.clone(),
            commandline: self.provision.commandline.clone(),
            signature: self.provision.signature.clone(),
            wait_for_upload_port: self.provision.wait_for_upload_port,
            use_1200bps_touch: self.provision.use_1200bps_touch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.agent.secure_host_first);
        assert_eq!(config.registry.url, "https://api.boardlink.dev/v1/devices");
        assert_eq!(config.provision.ext, ".bin");
        assert!(config.provision.wait_for_upload_port);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_content = r#"
            [registry]
            url = "https://example.test/devices"
            token = "secret"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.registry.url, "https://example.test/devices");
        assert_eq!(config.registry.token.as_deref(), Some("secret"));
        // Untouched sections keep their defaults.
        assert_eq!(config.provision.ext, ".bin");
    }
}
