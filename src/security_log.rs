//! Security event logging for audit trails.
//!
//! Hidden sessions authenticate on their own, outside any user-visible
//! terminal, so every connect, authentication and disconnect is recorded with
//! `target: "security"` to allow filtering in production environments.
//!
//! # Example
//!
//! Filter security events only:
//! ```bash
//! RUST_LOG=security=info portal-monitor user@host SHA256:...
//! ```

use tracing::{info, warn};

/// Log an SSH authentication attempt for a hidden session.
pub fn log_auth_attempt(host: &str, port: u16, username: &str, method: &str) {
    info!(
        target: "security",
        event = "hidden_auth_attempt",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        "Hidden session authentication attempt"
    );
}

/// Log a successful SSH authentication.
pub fn log_auth_success(host: &str, port: u16, username: &str, method: &str) {
    info!(
        target: "security",
        event = "hidden_auth_success",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        "Hidden session authentication succeeded"
    );
}

/// Log a failed SSH authentication attempt.
pub fn log_auth_failure(host: &str, port: u16, username: &str, method: &str, reason: &str) {
    warn!(
        target: "security",
        event = "hidden_auth_failure",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        reason = %reason,
        "Hidden session authentication failed"
    );
}

/// Log an established hidden connection.
pub fn log_hidden_connect(host: &str, port: u16, username: &str) {
    info!(
        target: "security",
        event = "hidden_connect",
        host = %host,
        port = port,
        username = %username,
        "Hidden SSH connection established"
    );
}

/// Log a hidden connection being torn down.
pub fn log_hidden_disconnect(host: &str, port: u16) {
    info!(
        target: "security",
        event = "hidden_disconnect",
        host = %host,
        port = port,
        "Hidden SSH connection closed"
    );
}

/// Log a server key that does not match the fingerprint pinned by the
/// primary session.
pub fn log_host_key_mismatch(host: &str, port: u16, expected: &str, actual: &str) {
    warn!(
        target: "security",
        event = "host_key_mismatch",
        host = %host,
        port = port,
        expected = %expected,
        actual = %actual,
        "Hidden session host key does not match the primary session"
    );
}
