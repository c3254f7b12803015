//! Configuration: TOML file with environment overrides.
//!
//! Every field has a serde default, so a missing or partial config file
//! yields a runnable local setup. Secrets (webhook secret, generator token)
//! are usually injected through the environment rather than committed to a
//! config file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdeaworksConfig {
    pub server: ServerSettings,
    pub generator: GeneratorSettings,
    pub records: RecordsSettings,
    pub webhook: WebhookSettings,
    pub reconcile: ReconcileSettings,
    pub sweeper: SweeperSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub db_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: "ideaworks.db".to_string(),
        }
    }
}

/// Credentials for outbound generator invocations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum GeneratorAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub endpoint: String,
    pub auth: GeneratorAuth,
    pub request_timeout_secs: u64,
    pub token_ttl_secs: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9090/generate".to_string(),
            auth: GeneratorAuth::None,
            request_timeout_secs: 30,
            token_ttl_secs: 3600,
        }
    }
}

/// Base URL of the external record store polled for generation results.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordsSettings {
    pub endpoint: String,
}

impl Default for RecordsSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9090/records".to_string(),
        }
    }
}

/// Inbound webhook authentication. With no secret and no basic credentials
/// configured, webhook requests are rejected outright.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    pub basic_user: Option<String>,
    pub basic_pass: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Minimum seconds after generation start before polling hits the
    /// external record store, giving the generator time to register the
    /// record.
    pub poll_dwell_secs: u64,
    /// Seconds in `generating` after which a document counts as stuck.
    pub generation_timeout_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            poll_dwell_secs: 10,
            generation_timeout_secs: 120,
        }
    }
}

/// Terminal status the sweeper assigns to timed-out work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepOutcome {
    #[default]
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub interval_secs: u64,
    pub promote_to: SweepOutcome,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            promote_to: SweepOutcome::Completed,
        }
    }
}

impl IdeaworksConfig {
    /// Load from a TOML file (all fields optional), then apply environment
    /// overrides. A missing file yields pure defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("IDEAWORKS_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = std::env::var("IDEAWORKS_DB_PATH") {
            self.server.db_path = path;
        }
        if let Ok(endpoint) = std::env::var("IDEAWORKS_GENERATOR_ENDPOINT") {
            self.generator.endpoint = endpoint;
        }
        if let Ok(token) = std::env::var("IDEAWORKS_GENERATOR_TOKEN") {
            self.generator.auth = GeneratorAuth::Bearer { token };
        }
        if let Ok(endpoint) = std::env::var("IDEAWORKS_RECORDS_ENDPOINT") {
            self.records.endpoint = endpoint;
        }
        if let Ok(secret) = std::env::var("IDEAWORKS_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = IdeaworksConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reconcile.poll_dwell_secs, 10);
        assert_eq!(config.reconcile.generation_timeout_secs, 120);
        assert_eq!(config.sweeper.interval_secs, 30);
        assert_eq!(config.sweeper.promote_to, SweepOutcome::Completed);
        assert!(matches!(config.generator.auth, GeneratorAuth::None));
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: IdeaworksConfig = toml::from_str(
            r#"
            [server]
            port = 3000

            [generator]
            endpoint = "https://gen.example.com/v1/generate"

            [generator.auth]
            scheme = "basic"
            username = "svc"
            password = "hunter2"

            [sweeper]
            promote_to = "failed"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.db_path, "ideaworks.db");
        assert_eq!(config.generator.endpoint, "https://gen.example.com/v1/generate");
        assert!(matches!(
            config.generator.auth,
            GeneratorAuth::Basic { ref username, .. } if username == "svc"
        ));
        assert_eq!(config.sweeper.promote_to, SweepOutcome::Failed);
        assert_eq!(config.sweeper.interval_secs, 30);
    }

    #[test]
    fn test_bearer_auth_from_toml() {
        let config: IdeaworksConfig = toml::from_str(
            r#"
            [generator.auth]
            scheme = "bearer"
            token = "tok-123"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.generator.auth,
            GeneratorAuth::Bearer { ref token } if token == "tok-123"
        ));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = IdeaworksConfig::load(Some(Path::new("/nonexistent/ideaworks.toml"))).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[webhook]\nsecret = \"shh\"").unwrap();
        let config = IdeaworksConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.webhook.secret.as_deref(), Some("shh"));
    }
}
