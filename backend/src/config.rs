//! Server configuration: defaults, environment variable overrides
//! (`FLEET_<SECTION>_<KEY>`), and an encrypted-at-rest local config file
//! for secrets (envelope key, cluster secret, API key).

use directories::ProjectDirs;
use fleet_core::crypto;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub cluster_secret: Option<String>,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_max_requests: usize,
    #[serde(default = "default_rate_window")]
    pub rate_limit_window_seconds: i64,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_history_size() -> usize {
    1000
}
fn default_rate_limit() -> usize {
    100
}
fn default_rate_window() -> i64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            use_tls: true,
            cert_dir: None,
            api_key: None,
            encryption_key: None,
            cluster_secret: None,
            history_size: default_history_size(),
            rate_limit_max_requests: default_rate_limit(),
            rate_limit_window_seconds: default_rate_window(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Restricts a just-written secrets file to owner-only read/write (`0600`).
/// Encrypted config and TLS private keys hold credentials an unrelated
/// local user has no business reading even at rest.
#[cfg(unix)]
pub fn restrict_to_owner(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn restrict_to_owner(_path: &std::path::Path) -> anyhow::Result<()> {
    Ok(())
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "fleet-server")
}

pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".fleet-data"))
}

impl Config {
    pub fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p)?;
                serde_json::from_str(&contents)?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLEET_SERVER_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("FLEET_SERVER_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("FLEET_SERVER_USE_TLS") {
            self.use_tls = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("FLEET_AUTH_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("FLEET_CRYPTO_ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Ok(v) = std::env::var("FLEET_CLUSTER_SECRET") {
            self.cluster_secret = Some(v);
        }
        if let Ok(v) = std::env::var("FLEET_STORE_HISTORY_SIZE") {
            if let Ok(n) = v.parse() {
                self.history_size = n;
            }
        }
    }

    /// Encrypt this config's secret fields and write them alongside a
    /// random salt file, both at `data_dir()`. The password-derived key
    /// never touches disk.
    pub fn save_encrypted(&self, password: &str) -> anyhow::Result<()> {
        let dir = data_dir();
        std::fs::create_dir_all(&dir)?;

        let (key_b64, salt_b64) = crypto::derive_key_from_password(password, None);
        let secrets = serde_json::json!({
            "api_key": self.api_key,
            "encryption_key": self.encryption_key,
            "cluster_secret": self.cluster_secret,
        });
        let envelope = crypto::encrypt_payload(&key_b64, &secrets)?;

        let secrets_path = dir.join("fleet-config.json.encrypted");
        let salt_path = dir.join("fleet-config.salt");
        std::fs::write(&secrets_path, serde_json::to_string(&envelope)?)?;
        std::fs::write(&salt_path, salt_b64)?;
        restrict_to_owner(&secrets_path)?;
        restrict_to_owner(&salt_path)?;
        Ok(())
    }

    pub fn load_encrypted(&mut self, password: &str) -> anyhow::Result<()> {
        let dir = data_dir();
        let salt_b64 = std::fs::read_to_string(dir.join("fleet-config.salt"))?;
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let salt = STANDARD.decode(salt_b64.trim())?;
        let (key_b64, _) = crypto::derive_key_from_password(password, Some(&salt));

        let envelope_json = std::fs::read_to_string(dir.join("fleet-config.json.encrypted"))?;
        let envelope = serde_json::from_str(&envelope_json)?;
        let secrets = crypto::decrypt_payload(&key_b64, &envelope)?;

        self.api_key = secrets.get("api_key").and_then(|v| v.as_str()).map(str::to_string);
        self.encryption_key = secrets.get("encryption_key").and_then(|v| v.as_str()).map(str::to_string);
        self.cluster_secret = secrets.get("cluster_secret").and_then(|v| v.as_str()).map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.port, 8443);
        assert!(config.use_tls);
    }

    #[test]
    fn env_override_changes_port() {
        std::env::set_var("FLEET_SERVER_PORT", "9999");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.port, 9999);
        std::env::remove_var("FLEET_SERVER_PORT");
    }
}
