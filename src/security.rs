//! Secure token generation, used both to bootstrap the hub's own admin key
//! on first run and to issue bearer tokens for newly identified agents.
use crate::HubError;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// 64 base62 chars is ~380 bits of entropy, comfortably above the 256-bit
/// floor most security reviewers expect from a bearer credential.
pub const TOKEN_LENGTH: usize = 64;

/// Gitignored, project-local fallback for the admin key when none is set
/// via `HUB_ADMIN_API_KEY`.
pub const ADMIN_KEY_FILE: &str = ".agentcom-admin-key";

pub fn generate_secure_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

pub fn save_token_to_file(token: &str, path: &str) -> Result<(), HubError> {
    info!("saving token to {}", path);
    fs::write(path, token).map_err(|e| HubError::Configuration(format!("failed to write token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .map_err(|e| HubError::Configuration(format!("failed to stat token file: {e}")))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)
            .map_err(|e| HubError::Configuration(format!("failed to chmod token file: {e}")))?;
    }

    Ok(())
}

pub fn load_token_from_file(path: &str) -> Result<Option<String>, HubError> {
    if !Path::new(path).exists() {
        return Ok(None);
    }

    let token = fs::read_to_string(path)
        .map_err(|e| HubError::Configuration(format!("failed to read token file: {e}")))?
        .trim()
        .to_string();

    if token.len() != TOKEN_LENGTH || !token.chars().all(|c| c.is_alphanumeric()) {
        warn!("token file {} contains a malformed token", path);
        return Err(HubError::Configuration("invalid token format in file".to_string()));
    }

    Ok(Some(token))
}

/// Returns the admin key from `existing`, falling back to one already
/// persisted at `ADMIN_KEY_FILE`, generating and persisting a new one only
/// if neither is present.
pub fn ensure_admin_key_exists(existing: Option<&str>) -> Result<String, HubError> {
    if let Some(key) = existing {
        if !key.trim().is_empty() {
            return Ok(key.to_string());
        }
    }

    match load_token_from_file(ADMIN_KEY_FILE)? {
        Some(key) => Ok(key),
        None => {
            let key = generate_secure_token();
            save_token_to_file(&key, ADMIN_KEY_FILE)?;
            info!("generated new admin key at {}", ADMIN_KEY_FILE);
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_expected_length_and_charset() {
        let a = generate_secure_token();
        let b = generate_secure_token();
        assert_eq!(a.len(), TOKEN_LENGTH);
        assert_eq!(b.len(), TOKEN_LENGTH);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_alphanumeric()));
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token").to_str().unwrap().to_string();
        let token = generate_secure_token();
        save_token_to_file(&token, &path).unwrap();
        let loaded = load_token_from_file(&path).unwrap();
        assert_eq!(loaded, Some(token));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing").to_str().unwrap().to_string();
        assert_eq!(load_token_from_file(&path).unwrap(), None);
    }

    #[test]
    fn ensure_admin_key_prefers_existing_value() {
        let key = ensure_admin_key_exists(Some("an-existing-key-value")).unwrap();
        assert_eq!(key, "an-existing-key-value");
    }

    #[test]
    fn malformed_token_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token").to_str().unwrap().to_string();
        fs::write(&path, "too-short").unwrap();
        assert!(load_token_from_file(&path).is_err());
    }
}
