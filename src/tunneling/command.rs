use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{HostKeyPolicy, TunnelConfig};

use super::transport::{ExitKind, Transport, TransportError, TransportSession};

/// Runs the system `ssh` client as a pure remote-forwarding session.
pub(crate) struct CommandTransport;

/// Arguments for a no-command, fail-fast remote forward.
pub(crate) fn ssh_args(config: &TunnelConfig) -> Vec<String> {
    let forward = match &config.remote_bind_address {
        // ipv6 literals need brackets or ssh splits them on every colon
        Some(bind) if bind.contains(':') => format!(
            "[{bind}]:{}:127.0.0.1:{}",
            config.remote_port, config.local_port
        ),
        Some(bind) => format!(
            "{bind}:{}:127.0.0.1:{}",
            config.remote_port, config.local_port
        ),
        None => format!("{}:127.0.0.1:{}", config.remote_port, config.local_port),
    };
    let mut args: Vec<String> = vec![
        "-N".into(),
        "-T".into(),
        "-o".into(),
        "ExitOnForwardFailure=yes".into(),
        "-o".into(),
        format!("ServerAliveInterval={}", config.keepalive_interval),
        "-o".into(),
        format!("ServerAliveCountMax={}", config.keepalive_max_missed),
        "-o".into(),
        format!(
            "StrictHostKeyChecking={}",
            config.host_key_policy.ssh_option()
        ),
        "-o".into(),
        "BatchMode=yes".into(),
    ];
    if config.host_key_policy == HostKeyPolicy::Insecure {
        args.extend(["-o".to_string(), "UserKnownHostsFile=/dev/null".to_string()]);
    }
    args.extend(["-p".to_string(), config.remote_ssh_port.to_string()]);
    if let Some(identity) = &config.identity_file {
        args.extend(["-i".to_string(), identity.clone()]);
    }
    args.extend([
        "-R".to_string(),
        forward,
        format!("{}@{}", config.remote_user, config.remote_host),
    ]);
    args
}

#[async_trait]
impl Transport for CommandTransport {
    async fn connect(
        &self,
        config: &TunnelConfig,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let child = Command::new(&config.ssh_binary)
            .args(ssh_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                binary: config.ssh_binary.clone(),
                source,
            })?;
        debug!(tunnel = %config.name, pid = ?child.id(), "ssh spawned");
        // ssh gives no signal once the forward is up; a running process counts
        Ok(Box::new(CommandSession { child, exit: None }))
    }
}

struct CommandSession {
    child: Child,
    exit: Option<ExitKind>,
}

#[async_trait]
impl TransportSession for CommandSession {
    async fn wait(&mut self) -> ExitKind {
        if let Some(exit) = self.exit {
            return exit;
        }
        let exit = match self.child.wait().await {
            Ok(status) => ExitKind::from_code(status.code()),
            Err(e) => {
                warn!(error = %e, "cannot wait on ssh");
                ExitKind::Failed { code: None }
            }
        };
        self.exit = Some(exit);
        exit
    }

    async fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "ssh already gone");
        }
        self.exit = Some(ExitKind::Stopped);
    }
}
