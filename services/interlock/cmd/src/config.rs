//! Configuration handling for the interlock probe.
//!
//! Settings come from a YAML file, then `INTERLOCK_*` environment variables,
//! then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use interlock_session::SessionConfig;
use interlock_wakeup::WakeupKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockConfig {
    /// Loopback address the probe listens on
    pub listen_addr: String,
    /// Server name the client verifies
    pub server_name: String,
    /// Handshake timeout in milliseconds (0 = wait forever)
    pub handshake_timeout_ms: u64,
    /// Read/write timeout in milliseconds (0 = wait forever)
    pub io_timeout_ms: u64,
    /// Delay before the interrupt probe closes the session
    pub interrupt_after_ms: u64,
    /// Payload sent by the echo probe
    pub echo_payload: String,
    /// Session settings
    pub session: SessionConfig,
    /// Certificate files; generated when empty
    pub tls: TlsFiles,
}

/// PEM files for the probe's certificates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsFiles {
    /// Server certificate chain
    pub cert_file: Option<PathBuf>,
    /// Server private key
    pub key_file: Option<PathBuf>,
    /// CA used by the client to verify the server
    pub ca_file: Option<PathBuf>,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            server_name: "localhost".to_string(),
            handshake_timeout_ms: 500,
            io_timeout_ms: 0,
            interrupt_after_ms: 50,
            echo_payload: "interlock echo".to_string(),
            session: SessionConfig::default(),
            tls: TlsFiles::default(),
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    interlock: Option<InterlockConfig>,
}

impl InterlockConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.interlock.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final interlock configuration: listen={}, handshake_timeout={}ms, io_timeout={}ms, wakeup={}",
            config.listen_addr,
            config.handshake_timeout_ms,
            config.io_timeout_ms,
            config.session.wakeup
        );
        Ok(config)
    }

    /// Apply `INTERLOCK_*` overrides from `lookup`
    pub fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("INTERLOCK_LISTEN_ADDR") {
            info!("Listen address overridden by environment: {}", addr);
            self.listen_addr = addr;
        }

        if let Some(name) = lookup("INTERLOCK_SERVER_NAME") {
            self.server_name = name;
        }

        if let Some(value) = lookup("INTERLOCK_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = value
                .parse()
                .with_context(|| format!("Invalid INTERLOCK_HANDSHAKE_TIMEOUT_MS: {}", value))?;
            info!("Handshake timeout overridden by environment: {}ms", self.handshake_timeout_ms);
        }

        if let Some(value) = lookup("INTERLOCK_IO_TIMEOUT_MS") {
            self.io_timeout_ms = value
                .parse()
                .with_context(|| format!("Invalid INTERLOCK_IO_TIMEOUT_MS: {}", value))?;
        }

        if let Some(value) = lookup("INTERLOCK_INTERRUPT_AFTER_MS") {
            self.interrupt_after_ms = value
                .parse()
                .with_context(|| format!("Invalid INTERLOCK_INTERRUPT_AFTER_MS: {}", value))?;
        }

        if let Some(value) = lookup("INTERLOCK_WAKEUP") {
            self.session.wakeup = value.parse::<WakeupKind>()?;
            info!("Wakeup channel overridden by environment: {}", self.session.wakeup);
        }

        if let Some(value) = lookup("INTERLOCK_ALPN") {
            self.session.alpn_protocols = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = InterlockConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert_eq!(config.handshake_timeout_ms, 500);
        assert_eq!(config.io_timeout_ms, 0);
        assert_eq!(config.session.wakeup, WakeupKind::Auto);
        assert!(config.tls.cert_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
interlock:
  listen_addr: "127.0.0.1:9443"
  handshake_timeout_ms: 750
  session:
    wakeup: pipe
    alpn_protocols: ["interlock/1"]
  tls:
    ca_file: /etc/interlock/ca.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = InterlockConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9443");
        assert_eq!(config.handshake_timeout_ms, 750);
        assert_eq!(config.interrupt_after_ms, 50);
        assert_eq!(config.session.wakeup, WakeupKind::Pipe);
        assert_eq!(config.session.alpn_protocols, vec!["interlock/1".to_string()]);
        assert_eq!(
            config.tls.ca_file.as_deref(),
            Some(Path::new("/etc/interlock/ca.pem"))
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = InterlockConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server_name, "localhost");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"interlock: [not, a, map").unwrap();
        assert!(InterlockConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("INTERLOCK_HANDSHAKE_TIMEOUT_MS", "0"),
            ("INTERLOCK_WAKEUP", "pipe"),
            ("INTERLOCK_ALPN", "h2, http/1.1,"),
        ]
        .into_iter()
        .collect();

        let mut config = InterlockConfig::default();
        config
            .apply_environment_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.handshake_timeout_ms, 0);
        assert_eq!(config.session.wakeup, WakeupKind::Pipe);
        assert_eq!(config.session.alpn_protocols, vec!["h2", "http/1.1"]);

        let mut config = InterlockConfig::default();
        let err = config
            .apply_environment_overrides(|key| {
                (key == "INTERLOCK_IO_TIMEOUT_MS").then(|| "soon".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("INTERLOCK_IO_TIMEOUT_MS"));
    }
}
