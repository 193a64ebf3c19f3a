//! russh-backed [`Transport`] for hidden sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use russh::client::{self, Config, Handle};
use russh::keys::HashAlg;
use russh::{ChannelMsg, Disconnect};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::SshSettings;
use crate::error::{MonitorError, SshError};
use crate::role::TargetId;
use crate::security_log;

use super::auth::ResolvedAuth;
use super::handler::HiddenHandler;
use super::{CloseCallback, CloseNotifier, CommandResult, Connection, Transport};

/// Credentials a hidden session authenticates with.
pub enum HiddenAuth {
    Password(SecretString),
    PublicKey {
        key_path: Option<PathBuf>,
        passphrase: Option<SecretString>,
    },
    Agent,
}

impl std::fmt::Debug for HiddenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HiddenAuth::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
            HiddenAuth::PublicKey { key_path, .. } => f
                .debug_struct("PublicKey")
                .field("key_path", key_path)
                .finish(),
            HiddenAuth::Agent => f.debug_struct("Agent").finish(),
        }
    }
}

/// Connection details for a target, registered by the host application once
/// its primary session is up.
#[derive(Debug)]
pub struct HiddenHost {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: HiddenAuth,
    /// SHA-256 fingerprint the primary session accepted.
    pub host_key_fingerprint: Option<String>,
}

/// Opens hidden SSH connections to registered targets
pub struct SshTransport {
    config: Arc<Config>,
    connection_timeout: Duration,
    hosts: RwLock<HashMap<TargetId, Arc<HiddenHost>>>,
}

impl SshTransport {
    pub fn new(settings: &SshSettings) -> Self {
        // Treat 0 as "no keepalive" to avoid immediate timeout
        let keepalive = if settings.keepalive_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(settings.keepalive_interval_secs))
        };

        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            connection_timeout: Duration::from_secs(settings.connection_timeout_secs),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, target: TargetId, host: HiddenHost) {
        self.hosts.write().insert(target, Arc::new(host));
    }

    pub fn unregister(&self, target: &TargetId) -> bool {
        self.hosts.write().remove(target).is_some()
    }

    pub fn is_registered(&self, target: &TargetId) -> bool {
        self.hosts.read().contains_key(target)
    }

    async fn open(&self, target: &TargetId) -> Result<Arc<SshConnection>, SshError> {
        let host = self
            .hosts
            .read()
            .get(target)
            .cloned()
            .ok_or(SshError::UnknownTarget(*target))?;
        let addr = format!("{}:{}", host.hostname, host.port);

        let stream = timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SshError::Timeout(addr.clone()))?
            .map_err(|e| SshError::ConnectionFailed {
                host: host.hostname.clone(),
                port: host.port,
                reason: e.to_string(),
            })?;

        match timeout(self.connection_timeout, self.establish(&host, stream)).await {
            Ok(result) => result,
            Err(_) => Err(SshError::Timeout(addr)),
        }
    }

    async fn establish(
        &self,
        host: &HiddenHost,
        stream: TcpStream,
    ) -> Result<Arc<SshConnection>, SshError> {
        let close_notifier = Arc::new(CloseNotifier::new());
        let handler = HiddenHandler::new(
            host.hostname.clone(),
            host.port,
            host.host_key_fingerprint.clone(),
            close_notifier.clone(),
        );

        let mut handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: host.hostname.clone(),
                port: host.port,
                reason: e.to_string(),
            })?;

        let auth = ResolvedAuth::resolve(&host.auth).await?;
        authenticate(&mut handle, host, auth).await?;

        security_log::log_hidden_connect(&host.hostname, host.port, &host.username);

        Ok(Arc::new(SshConnection {
            handle: Mutex::new(handle),
            host: Arc::from(host.hostname.as_str()),
            port: host.port,
            close_notifier,
            closed: AtomicBool::new(false),
        }))
    }
}

impl Transport for SshTransport {
    fn connect<'a>(
        &'a self,
        target: &'a TargetId,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, MonitorError>> {
        async move {
            let connection = self.open(target).await?;
            Ok(connection as Arc<dyn Connection>)
        }
        .boxed()
    }
}

async fn authenticate(
    handle: &mut Handle<HiddenHandler>,
    host: &HiddenHost,
    auth: ResolvedAuth,
) -> Result<(), SshError> {
    let method_name = auth.method_name();
    let (hostname, port, username) = (host.hostname.as_str(), host.port, host.username.as_str());
    security_log::log_auth_attempt(hostname, port, username, method_name);

    let result = match auth {
        ResolvedAuth::Password(password) => handle
            .authenticate_password(username, password.expose_secret())
            .await
            .map(|r| r.success())
            .map_err(|e| SshError::AuthenticationFailed(e.to_string())),
        ResolvedAuth::PublicKey(key) => handle
            .authenticate_publickey(username, key)
            .await
            .map(|r| r.success())
            .map_err(|e| SshError::AuthenticationFailed(e.to_string())),
        ResolvedAuth::Agent => authenticate_with_agent(handle, username).await,
    };

    match result {
        Ok(true) => {
            security_log::log_auth_success(hostname, port, username, method_name);
            Ok(())
        }
        Ok(false) => {
            let reason = "Authentication rejected by server";
            security_log::log_auth_failure(hostname, port, username, method_name, reason);
            Err(SshError::AuthenticationFailed(reason.to_string()))
        }
        Err(e) => {
            security_log::log_auth_failure(hostname, port, username, method_name, &e.to_string());
            Err(e)
        }
    }
}

async fn authenticate_with_agent(
    handle: &mut Handle<HiddenHandler>,
    username: &str,
) -> Result<bool, SshError> {
    let agent_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
        SshError::Agent("SSH_AUTH_SOCK not set - is ssh-agent running?".to_string())
    })?;

    let stream = tokio::net::UnixStream::connect(&agent_path)
        .await
        .map_err(|e| SshError::Agent(format!("Failed to connect to SSH agent: {}", e)))?;

    let mut agent = russh::keys::agent::client::AgentClient::connect(stream);

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| SshError::Agent(format!("Failed to get identities: {}", e)))?;

    if identities.is_empty() {
        return Err(SshError::Agent(
            "No identities found in SSH agent".to_string(),
        ));
    }

    for identity in identities {
        let hash_alg = if identity.algorithm().is_rsa() {
            Some(HashAlg::Sha512)
        } else {
            None
        };

        match handle
            .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Agent key failed: {}", e);
                continue;
            }
        }
    }

    Ok(false)
}

/// One hidden SSH connection. Every command runs on its own exec channel.
pub struct SshConnection {
    handle: Mutex<Handle<HiddenHandler>>,
    host: Arc<str>,
    port: u16,
    close_notifier: Arc<CloseNotifier>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SshConnection {
    async fn run(&self, command: &str) -> Result<CommandResult, SshError> {
        let handle = self.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(format!("Failed to open channel: {}", e)))?;
        drop(handle);

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(format!("Failed to exec '{}': {}", command, e)))?;

        // EOF can precede exit-status; only Close ends the exchange.
        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout(&data),
                ChannelMsg::ExtendedData { data, .. } => output.stderr(&data),
                ChannelMsg::ExitStatus { exit_status } => output.exit_status(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    output.exit_signal(&format!("{:?}", signal_name))
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        output.finish(command)
    }
}

/// Output gathered from one exec channel.
#[derive(Debug, Default)]
struct ExecOutput {
    stdout: String,
    stderr: String,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
}

impl ExecOutput {
    fn stdout(&mut self, data: &[u8]) {
        self.stdout.push_str(&String::from_utf8_lossy(data));
    }

    fn stderr(&mut self, data: &[u8]) {
        self.stderr.push_str(&String::from_utf8_lossy(data));
    }

    fn exit_status(&mut self, status: u32) {
        self.exit_status = Some(status);
    }

    fn exit_signal(&mut self, signal: &str) {
        self.exit_signal = Some(signal.to_string());
    }

    fn finish(self, command: &str) -> Result<CommandResult, SshError> {
        let exit_code = match (self.exit_status, self.exit_signal) {
            (Some(status), _) => i32::try_from(status).unwrap_or(i32::MAX),
            // Shell convention for a signalled process.
            (None, Some(signal)) => {
                tracing::debug!("'{}' terminated by signal {}", command, signal);
                128
            }
            (None, None) => {
                return Err(SshError::Channel(format!(
                    "'{}' closed without an exit status",
                    command
                )));
            }
        };

        Ok(CommandResult {
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code,
        })
    }
}

impl Connection for SshConnection {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandResult, MonitorError>> {
        async move {
            if self.closed.load(Ordering::SeqCst) || self.close_notifier.has_fired() {
                return Err(MonitorError::Transport(format!(
                    "connection to {}:{} is closed",
                    self.host, self.port
                )));
            }
            self.run(command).await.map_err(MonitorError::from)
        }
        .boxed()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.close_notifier.register(callback);
    }

    fn close(&self) -> BoxFuture<'_, Result<(), MonitorError>> {
        async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            // A requested close is not an unexpected one.
            self.close_notifier.disarm();
            security_log::log_hidden_disconnect(&self.host, self.port);

            let handle = self.handle.lock().await;
            handle
                .disconnect(Disconnect::ByApplication, "hidden session closed", "en")
                .await
                .map_err(|e| MonitorError::Transport(e.to_string()))
        }
        .boxed()
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notifier.disarm();
        security_log::log_hidden_disconnect(&self.host, self.port);
        tracing::debug!(
            "Hidden connection to {}:{} dropped without close",
            self.host,
            self.port
        );
    }
}
