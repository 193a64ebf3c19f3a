use std::path::Path;
use std::sync::Arc;

use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use secrecy::ExposeSecret;

use crate::config::paths;
use crate::error::SshError;

use super::ssh::HiddenAuth;

/// Resolved authentication for a hidden connection
pub enum ResolvedAuth {
    /// Password authentication with zeroized secret string
    Password(secrecy::SecretString),
    /// Public key authentication with loaded key
    PublicKey(PrivateKeyWithHashAlg),
    /// SSH agent authentication (keys managed by agent)
    Agent,
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAuth::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
            ResolvedAuth::PublicKey(_) => f.debug_tuple("PublicKey").field(&"[KEY]").finish(),
            ResolvedAuth::Agent => f.debug_struct("Agent").finish(),
        }
    }
}

impl ResolvedAuth {
    /// Resolve the credentials the host application registered for a target.
    pub async fn resolve(auth: &HiddenAuth) -> Result<Self, SshError> {
        match auth {
            HiddenAuth::Password(password) => Ok(ResolvedAuth::Password(
                secrecy::SecretString::from(password.expose_secret()),
            )),
            HiddenAuth::PublicKey {
                key_path,
                passphrase,
            } => {
                let path = key_path
                    .clone()
                    .or_else(find_default_key)
                    .ok_or_else(|| SshError::KeyFile("No SSH key found".to_string()))?;

                let expanded_path = paths::expand_tilde(&path.to_string_lossy());
                let passphrase = passphrase.as_ref().map(|p| p.expose_secret());
                load_key_file(&expanded_path, passphrase).await
            }
            HiddenAuth::Agent => Ok(ResolvedAuth::Agent),
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            ResolvedAuth::Password(_) => "password",
            ResolvedAuth::PublicKey(_) => "publickey",
            ResolvedAuth::Agent => "agent",
        }
    }
}

/// Find the first available default SSH key
fn find_default_key() -> Option<std::path::PathBuf> {
    paths::default_identity_files()
        .into_iter()
        .find(|path| path.exists())
}

/// Load an SSH private key from file
async fn load_key_file(path: &Path, passphrase: Option<&str>) -> Result<ResolvedAuth, SshError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        SshError::KeyFile(format!("Cannot read key file {}: {}", path.display(), e))
    })?;

    let first_line = content.lines().next().unwrap_or("");
    if first_line.starts_with("ssh-") || first_line.starts_with("ecdsa-") {
        return Err(SshError::KeyFile(format!(
            "File {} contains a PUBLIC key, not a private key",
            path.display()
        )));
    }

    if !first_line.starts_with("-----BEGIN") {
        return Err(SshError::KeyFile(format!(
            "File {} does not appear to be a valid SSH private key",
            path.display()
        )));
    }

    let key = russh::keys::load_secret_key(path, passphrase).map_err(|e| {
        let normalized = e.to_string().to_lowercase();
        let is_passphrase_error = normalized.contains("encrypted")
            || normalized.contains("passphrase")
            || normalized.contains("cryptographic");
        if is_passphrase_error && passphrase.is_none() {
            SshError::KeyFile(format!("Key {} requires a passphrase", path.display()))
        } else if is_passphrase_error {
            SshError::KeyFile(format!("Wrong passphrase for key {}", path.display()))
        } else {
            SshError::KeyFile(format!("Failed to load key {}: {}", path.display(), e))
        }
    })?;

    // Only RSA keys need an explicit hash algorithm
    let hash_alg = if key.algorithm().is_rsa() {
        Some(HashAlg::Sha512)
    } else {
        None
    };
    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

    Ok(ResolvedAuth::PublicKey(key_with_hash))
}
