use std::sync::Arc;

use async_trait::async_trait;
use russh::{
    Channel, Disconnect,
    client::{self, Handle},
    keys::{PrivateKey, PrivateKeyWithHashAlg, load_secret_key},
};
use tokio::sync::mpsc::{self, Receiver};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, EnvOrValue, TunnelConfig, expand_home},
    storage::Storage,
    tunneling::handler::ClientHandler,
};

use super::{
    manager::TunnelError,
    transport::{ExitKind, Transport, TransportError, TransportSession},
    tunnel_runner::TunnelRunner,
};

/// In-process ssh client asking the relay for a `tcpip-forward`.
pub(crate) struct NativeTransport {
    /// private key for connecting to the relay
    private_key: Arc<PrivateKey>,
    /// known relay fingerprints, absent when the policy skips verification
    storage: Option<Arc<dyn Storage>>,
}

impl NativeTransport {
    pub fn new(
        config: &TunnelConfig,
        storage: Option<Arc<dyn Storage>>,
    ) -> Result<NativeTransport, TunnelError> {
        let key_path = config
            .identity_file
            .as_deref()
            .ok_or(ConfigError::MissingParameter("identity_file"))?;
        let private_key = load_private_key(key_path, &config.identity_passphrase)?;
        Ok(NativeTransport {
            private_key: Arc::new(private_key),
            storage,
        })
    }
}

fn load_private_key(
    key_path: &str,
    passphrase: &Option<EnvOrValue>,
) -> Result<PrivateKey, TunnelError> {
    let passphrase = passphrase.as_ref().map(EnvOrValue::resolve).transpose()?;
    load_secret_key(expand_home(key_path), passphrase.as_deref())
        .map_err(|e| TunnelError::Transport(e.into()))
}

#[async_trait]
impl Transport for NativeTransport {
    async fn connect(
        &self,
        config: &TunnelConfig,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let (tx, rx) = mpsc::channel(32);
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(config.keepalive_interval()),
            keepalive_max: config.keepalive_max_missed as usize,
            ..Default::default()
        });
        let handler = ClientHandler::new(config, self.storage.clone(), tx);
        let mut session = client::connect(
            ssh_config,
            (config.remote_host.as_str(), config.remote_ssh_port),
            handler,
        )
        .await?;

        let hash_alg = session.best_supported_rsa_hash().await?.flatten();
        let auth_res = session
            .authenticate_publickey(
                config.remote_user.clone(),
                PrivateKeyWithHashAlg::new(self.private_key.clone(), hash_alg),
            )
            .await?;
        if !auth_res.success() {
            return Err(TransportError::AuthRejected(config.remote_user.clone()));
        }

        // asks the relay to open the port on its interface; fails fast when it can't
        let bind_address = config
            .remote_bind_address
            .clone()
            .unwrap_or_else(|| String::from("localhost"));
        if let Err(e) = session
            .tcpip_forward(bind_address, config.remote_port as u32)
            .await
        {
            debug!(error = %e, "tcpip-forward rejected");
            return Err(TransportError::ForwardRefused(config.remote_port));
        }
        info!(
            tunnel = %config.name,
            remote_port = config.remote_port,
            "relay accepted the forward"
        );
        Ok(Box::new(NativeSession {
            session,
            rx,
            exit: None,
        }))
    }
}

struct NativeSession {
    session: Handle<ClientHandler>,
    /// closes once the ssh session drops its handler
    rx: Receiver<(TunnelRunner, Channel<client::Msg>)>,
    exit: Option<ExitKind>,
}

#[async_trait]
impl TransportSession for NativeSession {
    async fn wait(&mut self) -> ExitKind {
        if let Some(exit) = self.exit {
            return exit;
        }
        while let Some((mut runner, channel)) = self.rx.recv().await {
            tokio::spawn(async move {
                debug!("new tunnel running: {}:{}", runner.addr(), runner.port());
                match runner.run(channel).await {
                    Ok((to_local, to_relay)) => {
                        debug!(to_local, to_relay, "forwarded connection closed")
                    }
                    Err(e) => warn!(error = %e, "forwarded connection failed"),
                }
            });
        }
        let exit = ExitKind::Failed { code: None };
        self.exit = Some(exit);
        exit
    }

    async fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
            .await
        {
            debug!(error = %e, "session already closed");
        }
        self.exit = Some(ExitKind::Stopped);
    }
}
