// Environment-driven configuration. Section defaults suit local
// development; every field has an env override.
use serde::Serialize;
use std::env;
use tracing::info;

#[derive(Debug, Clone, Serialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub frontend_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            base_url: "http://localhost:3000".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "./data/clawlink.db".to_string(),
        }
    }
}

/// `jwt_secret` signs owner browser sessions; the agent-facing core never
/// reads it but refuses to misplace it in logs.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
}

impl Serialize for AuthConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("AuthConfig", 1)?;
        state.serialize_field("jwt_secret_set", &self.jwt_secret.is_some())?;
        state.end()
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationConfig {
    pub twitter_bearer_token: Option<String>,
}

impl VerificationConfig {
    pub fn dev_mode(&self) -> bool {
        self.twitter_bearer_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .is_none()
    }
}

impl Serialize for VerificationConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("VerificationConfig", 1)?;
        state.serialize_field("dev_mode", &self.dev_mode())?;
        state.end()
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(url) = env_string("DATABASE_URL") {
            config.storage.database_url = url;
        }
        if let Some(host) = env_string("HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_string("PORT").and_then(|value| value.parse::<u16>().ok()) {
            config.server.port = port;
        }
        config.server.base_url = env_string("BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", config.server.port));
        config.server.frontend_url =
            env_string("FRONTEND_URL").unwrap_or_else(|| config.server.base_url.clone());
        config.auth.jwt_secret = env_string("JWT_SECRET");
        config.verification.twitter_bearer_token = env_string("TWITTER_BEARER_TOKEN");
        config
    }

    /// Startup banner. The dev-mode verification switch is security
    /// relevant and always logged.
    pub fn log_summary(&self) {
        info!(
            database_url = %self.storage.database_url,
            base_url = %self.server.base_url,
            "configuration loaded"
        );
        if self.verification.dev_mode() {
            info!("claim verification: DEV MODE (no TWITTER_BEARER_TOKEN; claims auto-approve)");
        } else {
            info!("claim verification: external provider configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_development() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.database_url, "./data/clawlink.db");
        assert!(config.verification.dev_mode());
    }

    #[test]
    fn secrets_do_not_serialize() {
        let mut config = Config::default();
        config.auth.jwt_secret = Some("super-secret".to_string());
        config.verification.twitter_bearer_token = Some("token".to_string());
        let rendered = serde_json::to_string(&config).expect("serialize config");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("token\""));
        assert!(rendered.contains("jwt_secret_set"));
    }
}
