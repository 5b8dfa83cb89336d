use std::sync::Arc;

use crate::{
    config::{HostKeyPolicy, TunnelConfig},
    storage::Storage,
};

use super::{transport::TransportError, tunnel_runner::TunnelRunner};
use russh::{
    Channel,
    client::{self, Handler},
};
use tokio::sync::mpsc::Sender;
use tracing::{error, info, warn};

pub(super) const LOCAL_ADDRESS: &str = "127.0.0.1";

pub(super) struct ClientHandler {
    tx: Sender<(TunnelRunner, Channel<client::Msg>)>,
    to_port: u16,
    /// `host:port` of the relay, the key fingerprints are stored under it
    server_address: String,
    policy: HostKeyPolicy,
    storage: Option<Arc<dyn Storage>>,
}
impl ClientHandler {
    pub fn new(
        config: &TunnelConfig,
        storage: Option<Arc<dyn Storage>>,
        tx: Sender<(TunnelRunner, Channel<client::Msg>)>,
    ) -> Self {
        ClientHandler {
            tx,
            to_port: config.local_port,
            server_address: config.relay_address(),
            policy: config.host_key_policy,
            storage,
        }
    }
}
impl Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let server_fingerprint = server_public_key
            .fingerprint(Default::default())
            .to_string();
        info!(
            relay = %self.server_address,
            fingerprint = %server_fingerprint,
            "got server key"
        );

        if self.policy == HostKeyPolicy::Insecure {
            warn!(relay = %self.server_address, "accepting relay key without verification");
            return Ok(true);
        }
        let Some(storage) = &self.storage else {
            return Err(TransportError::StorageLayer(String::from(
                "no known hosts storage to verify the relay key against",
            )));
        };

        match storage.get_server_fingerprint(&self.server_address).await? {
            Some(stored_fingerprint) if stored_fingerprint == server_fingerprint => {
                info!(relay = %self.server_address, "host key matches the stored one");
                Ok(true)
            }
            Some(_) => {
                error!(relay = %self.server_address, "host key has changed!");
                Err(TransportError::NastyKey(self.server_address.clone()))
            }
            None if self.policy == HostKeyPolicy::Strict => {
                error!(relay = %self.server_address, "host key is not known");
                Err(TransportError::UnknownKey(self.server_address.clone()))
            }
            None => {
                // tofu: store the key!
                storage
                    .store_server_fingerprint(&self.server_address, &server_fingerprint)
                    .await?;
                Ok(true)
            }
        }
    }
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let tunnel_runner = TunnelRunner::new(LOCAL_ADDRESS, self.to_port);
        info!("incoming connection: {originator_address}:{originator_port}");
        // hand the runner back to the session that owns the tunnel
        if self.tx.send((tunnel_runner, channel)).await.is_err() {
            warn!("tunnel is closing, dropping forwarded connection");
        }
        Ok(())
    }
}
