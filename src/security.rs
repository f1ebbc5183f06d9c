//! API key generation and persistence for the operator-facing HTTP surface.

use crate::error::AwcpError;
use crate::Result;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// 64 base62 characters, ~380 bits of entropy.
pub const API_KEY_LENGTH: usize = 64;
pub const API_KEY_FILE: &str = ".awcp-api-key";

pub fn generate_secure_api_key() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

pub fn save_api_key_to_file(api_key: &str) -> Result<()> {
    fs::write(API_KEY_FILE, api_key)
        .map_err(|e| AwcpError::Configuration(format!("failed to write API key file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(API_KEY_FILE)
            .map_err(|e| AwcpError::Configuration(format!("failed to stat API key file: {e}")))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(API_KEY_FILE, perms)
            .map_err(|e| AwcpError::Configuration(format!("failed to set API key file permissions: {e}")))?;
    }

    info!("API key saved to {}", API_KEY_FILE);
    Ok(())
}

pub fn load_api_key_from_file() -> Result<Option<String>> {
    if !Path::new(API_KEY_FILE).exists() {
        return Ok(None);
    }

    let api_key = fs::read_to_string(API_KEY_FILE)
        .map_err(|e| AwcpError::Configuration(format!("failed to read API key file: {e}")))?;
    let api_key = api_key.trim().to_string();

    if api_key.len() != API_KEY_LENGTH || !api_key.chars().all(|c| c.is_alphanumeric()) {
        warn!("API key file contents failed format validation");
        return Err(AwcpError::Configuration("invalid API key format in file".to_string()));
    }

    Ok(Some(api_key))
}

/// Uses the configured key if present, else an existing file-based key,
/// else generates and persists a fresh one.
pub fn ensure_api_key_exists(existing_api_key: Option<&str>) -> Result<String> {
    if let Some(key) = existing_api_key {
        if !key.trim().is_empty() {
            return Ok(key.to_string());
        }
    }

    match load_api_key_from_file()? {
        Some(existing_key) => Ok(existing_key),
        None => {
            let new_key = generate_secure_api_key();
            save_api_key_to_file(&new_key)?;
            Ok(new_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique_and_well_formed() {
        let key1 = generate_secure_api_key();
        let key2 = generate_secure_api_key();
        assert_eq!(key1.len(), API_KEY_LENGTH);
        assert_ne!(key1, key2);
        assert!(key1.chars().all(|c| c.is_alphanumeric()));
    }

    #[test]
    fn ensure_api_key_exists_prefers_configured_key() {
        let key = ensure_api_key_exists(Some("configured-key")).unwrap();
        assert_eq!(key, "configured-key");
    }
}
