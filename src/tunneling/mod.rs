use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    config::{TransportKind, TunnelConfig},
    storage::Storage,
};

pub(crate) mod command;
mod handler;
pub(crate) mod health;
pub(crate) mod manager;
pub(crate) mod session;
pub(crate) mod transport;
pub(crate) mod tunnel;
mod tunnel_runner;

use command::CommandTransport;
use manager::TunnelError;
use transport::Transport;
use tunnel::NativeTransport;

/// Resolves once a stop has been requested on `shutdown`.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender means the manager is gone, which is a stop as well
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

pub(crate) fn build_transport(
    config: &TunnelConfig,
    storage: Option<Arc<dyn Storage>>,
) -> Result<Arc<dyn Transport>, TunnelError> {
    match config.transport {
        TransportKind::Command => Ok(Arc::new(CommandTransport)),
        TransportKind::Native => Ok(Arc::new(NativeTransport::new(config, storage)?)),
    }
}
