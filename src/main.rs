use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;

use portal_monitor::config::{FileToolCache, MonitorSettings, paths};
use portal_monitor::transport::{HiddenAuth, HiddenHost, SshTransport};
use portal_monitor::{HiddenSessions, HostContext, Role, ShutdownCoordinator, TargetId};

const USAGE: &str = "usage: portal-monitor <user@host[:port]> <sha256-fingerprint> [system|process|network ...]";

/// The command line is its own primary session: alive until Ctrl-C.
struct CliHost {
    running: AtomicBool,
}

impl HostContext for CliHost {
    fn is_primary_session_alive(&self, _target: &TargetId) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_receiver_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Destination {
    username: String,
    hostname: String,
    port: u16,
}

fn parse_destination(value: &str) -> Result<Destination> {
    let Some((username, rest)) = value.split_once('@') else {
        bail!("destination '{}' is missing a user name", value);
    };

    let (hostname, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        // [::1]:2222
        let Some((host, tail)) = bracketed.split_once(']') else {
            bail!("unterminated IPv6 address in '{}'", value);
        };
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().context("invalid port")?,
            None => 22,
        };
        (host.to_string(), port)
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().context("invalid port")?),
            None => (rest.to_string(), 22),
        }
    };

    if username.is_empty() || hostname.is_empty() {
        bail!("invalid destination '{}'", value);
    }

    Ok(Destination {
        username: username.to_string(),
        hostname,
        port,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = paths::ensure_log_dir().ok();
    let _guard = portal_monitor::logging::init_logging(log_dir);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(destination), Some(fingerprint)) = (args.first(), args.get(1)) else {
        bail!(USAGE);
    };
    let destination = parse_destination(destination)?;

    let settings = MonitorSettings::load().context("Failed to load monitor settings")?;

    let roles = if args.len() > 2 {
        args[2..]
            .iter()
            .map(|name| match Role::parse(name) {
                Some(role) if role != Role::Adhoc => Ok(role),
                _ => bail!("unknown monitor '{}'\n{}", name, USAGE),
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        Role::MONITORS
            .into_iter()
            .filter(|role| settings.roles.is_enabled(*role))
            .collect()
    };

    tracing::info!(
        "Starting portal-monitor for {}@{}:{}",
        destination.username,
        destination.hostname,
        destination.port
    );

    let transport = Arc::new(SshTransport::new(&settings.ssh));
    let target = TargetId::for_destination(
        &destination.username,
        &destination.hostname,
        destination.port,
    );
    transport.register(
        target,
        HiddenHost {
            hostname: destination.hostname,
            port: destination.port,
            username: destination.username,
            auth: HiddenAuth::Agent,
            host_key_fingerprint: Some(fingerprint.clone()),
        },
    );

    let store = Arc::new(FileToolCache::open_default().context("Failed to open tool cache")?);
    let host = Arc::new(CliHost {
        running: AtomicBool::new(true),
    });
    let (tx, mut rx) = mpsc::channel(settings.event_buffer.max(1));
    let sessions = Arc::new(HiddenSessions::new(
        transport,
        host.clone(),
        store,
        &settings,
        tx,
    ));

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });

    let mut started = 0;
    for role in &roles {
        match sessions.start_monitor(&target, *role).await {
            Ok(()) => started += 1,
            Err(e) => tracing::error!("Could not start {} monitor: {}", role, e),
        }
    }

    if started > 0 {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Interrupted, shutting down");
    }

    host.running.store(false, Ordering::SeqCst);
    let report = ShutdownCoordinator::new(sessions).run().await;
    printer.abort();
    tracing::info!(
        "Disposed {} target(s) in {:?}",
        report.targets,
        report.elapsed
    );

    if started == 0 {
        bail!("no monitor could be started");
    }
    Ok(())
}
