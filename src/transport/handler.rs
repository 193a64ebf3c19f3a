use std::future::Future;
use std::sync::Arc;

use russh::client::{DisconnectReason, Handler};
use russh::keys::{HashAlg, PublicKey};

use crate::error::SshError;
use crate::security_log;

use super::CloseNotifier;

/// russh handler for hidden connections.
///
/// Hidden sessions never prompt: the primary session has already verified the
/// host, so the server key must match the fingerprint it accepted.
pub struct HiddenHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
    close_notifier: Arc<CloseNotifier>,
}

impl HiddenHandler {
    pub fn new(
        host: String,
        port: u16,
        pinned_fingerprint: Option<String>,
        close_notifier: Arc<CloseNotifier>,
    ) -> Self {
        Self {
            host,
            port,
            pinned_fingerprint,
            close_notifier,
        }
    }

    pub fn fingerprint(key: &PublicKey) -> String {
        key.fingerprint(HashAlg::Sha256).to_string()
    }
}

/// Compare fingerprints, tolerating a missing `SHA256:` prefix on either side.
pub fn fingerprints_match(expected: &str, actual: &str) -> bool {
    fn strip(value: &str) -> &str {
        let value = value.trim();
        value.strip_prefix("SHA256:").unwrap_or(value)
    }
    let expected = strip(expected);
    !expected.is_empty() && expected == strip(actual)
}

impl Handler for HiddenHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let actual = Self::fingerprint(server_public_key);
        let pinned = self.pinned_fingerprint.clone();
        let host = self.host.clone();
        let port = self.port;

        async move {
            match pinned {
                Some(expected) if fingerprints_match(&expected, &actual) => {
                    tracing::debug!("Hidden session host key verified for {}:{}", host, port);
                    Ok(true)
                }
                Some(expected) => {
                    security_log::log_host_key_mismatch(&host, port, &expected, &actual);
                    Err(SshError::HostKeyVerification(format!(
                        "Host key for {}:{} does not match the pinned fingerprint",
                        host, port
                    )))
                }
                None => Err(SshError::HostKeyVerification(format!(
                    "No pinned host key for {}:{}",
                    host, port
                ))),
            }
        }
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        if self.close_notifier.fire() {
            tracing::debug!("Hidden session to {}:{} closed by remote", self.host, self.port);
        }
        match reason {
            DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            DisconnectReason::Error(e) => Err(e),
        }
    }
}
