use crate::error::AwcpError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub security: SecurityConfig,
    pub monitor: MonitorConfig,
    pub api: ApiConfig,
}

/// Master key material for the communication fabric's secure envelope.
/// When `master_key_hex` is absent, `enable_security` generates a random
/// key for the process lifetime instead of a persisted one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub master_key_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub sample_interval_secs: u64,
    pub default_warning_threshold: f64,
    pub default_critical_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let master_key_b64 = match env::var("AWCP_SECURITY_KEY") {
            Ok(key) => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&key)
                    .map_err(|_| {
                        AwcpError::Configuration("AWCP_SECURITY_KEY must be valid base64".to_string())
                    })?;
                if bytes.len() != crate::constants::SECURITY_KEY_LEN {
                    return Err(AwcpError::Configuration(format!(
                        "AWCP_SECURITY_KEY must decode to {} bytes, got {}",
                        crate::constants::SECURITY_KEY_LEN,
                        bytes.len()
                    )));
                }
                Some(key)
            }
            Err(_) => None,
        };

        let sample_interval_secs = env::var("AWCP_SAMPLE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::constants::DEFAULT_SAMPLE_INTERVAL_SECS);

        let default_warning_threshold = env::var("AWCP_DEFAULT_WARNING_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.8);
        let default_critical_threshold = env::var("AWCP_DEFAULT_CRITICAL_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.95);
        if default_warning_threshold <= 0.0
            || default_warning_threshold >= default_critical_threshold
            || default_critical_threshold > 1.0
        {
            return Err(AwcpError::Configuration(
                "default thresholds must satisfy 0 < warning < critical <= 1".to_string(),
            ));
        }

        let api_key = env::var("API_KEY").ok();
        match &api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(AwcpError::Configuration("API_KEY cannot be blank".to_string()));
            }
            Some(key) if key.len() < 32 => {
                return Err(AwcpError::Configuration(
                    "API_KEY must be at least 32 characters".to_string(),
                ));
            }
            Some(_) => tracing::info!("API authentication configured with a provided key"),
            None => tracing::warn!("API_KEY not set; the API will run without authentication"),
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            enable_auth: api_key.is_some(),
            api_key,
            allowed_origins,
        };

        Ok(Config {
            security: SecurityConfig {
                master_key_base64: master_key_b64,
            },
            monitor: MonitorConfig {
                sample_interval_secs,
                default_warning_threshold,
                default_critical_threshold,
            },
            api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rejects_malformed_security_key() {
        std::env::set_var("AWCP_SECURITY_KEY", "not-valid-base64!!");
        std::env::remove_var("API_KEY");
        let err = Config::load().unwrap_err();
        std::env::remove_var("AWCP_SECURITY_KEY");
        assert!(matches!(err, AwcpError::Configuration(_)));
    }

    #[test]
    #[serial]
    fn rejects_short_api_key() {
        std::env::remove_var("AWCP_SECURITY_KEY");
        std::env::set_var("API_KEY", "short");
        let err = Config::load().unwrap_err();
        std::env::remove_var("API_KEY");
        assert!(matches!(err, AwcpError::Configuration(_)));
    }
}
