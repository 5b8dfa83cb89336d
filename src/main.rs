use std::{io, sync::Arc};

use clap::Parser;
use cli::TetherCli;
use config::{HostKeyPolicy, TetherConfig, TransportKind};
use futures::future::join_all;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tunneling::{
    build_transport,
    health::HttpHealthProbe,
    manager::{TunnelError, TunnelManager},
};

mod cli;
mod config;
mod storage;
mod tunneling;

#[tokio::main]
pub async fn main() -> Result<(), TunnelError> {
    let cli = TetherCli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    let config = cli
        .resolve()
        .inspect_err(|e| error!(error = %e, "fatal configuration error"))?;
    let managers = build_managers(config)
        .await
        .inspect_err(|e| error!(error = %e, "cannot set up tunnels"))?;

    tokio::spawn(stop_on_signal(managers.clone()));
    for manager in &managers {
        tokio::spawn(log_transitions(manager.clone()));
    }

    let results = join_all(managers.iter().map(|manager| manager.start())).await;
    let mut outcome = Ok(());
    for (manager, result) in managers.iter().zip(results) {
        let session = manager.session();
        let healthy = manager
            .subscribe_health()
            .borrow()
            .as_ref()
            .map(|health| health.reachable);
        info!(
            tunnel = %manager.name(),
            attempts = session.attempt,
            last_exit = ?session.last_exit,
            last_health = ?healthy,
            "tunnel finished"
        );
        if let Err(e) = result {
            error!(tunnel = %manager.name(), error = %e, "tunnel stopped for good");
            outcome = Err(e);
        }
    }
    outcome
}

async fn build_managers(config: TetherConfig) -> Result<Vec<Arc<TunnelManager>>, TunnelError> {
    let needs_storage = config.tunnels.iter().any(|tunnel| {
        tunnel.transport == TransportKind::Native
            && tunnel.host_key_policy != HostKeyPolicy::Insecure
    });
    let storage = if needs_storage {
        Some(storage::get_storage(&config.storage).await?)
    } else {
        None
    };

    let probe = Arc::new(HttpHealthProbe);
    let mut managers = Vec::with_capacity(config.tunnels.len());
    for tunnel in config.tunnels {
        let transport = build_transport(&tunnel, storage.clone())?;
        info!(
            tunnel = %tunnel.name,
            transport = ?tunnel.transport,
            relay = %tunnel.relay_address(),
            remote_port = tunnel.remote_port,
            local_port = tunnel.local_port,
            "tunnel configured"
        );
        managers.push(Arc::new(TunnelManager::new(
            tunnel,
            transport,
            probe.clone(),
        )));
    }
    Ok(managers)
}

async fn log_transitions(manager: Arc<TunnelManager>) {
    let mut status = manager.subscribe();
    while status.changed().await.is_ok() {
        let session = status.borrow_and_update().clone();
        debug!(
            tunnel = %manager.name(),
            state = %session.state,
            attempt = session.attempt,
            failures = session.consecutive_failures,
            "tunnel state changed"
        );
        if session.is_terminated() {
            break;
        }
    }
}

async fn stop_on_signal(managers: Vec<Arc<TunnelManager>>) {
    shutdown_signal().await;
    for manager in &managers {
        manager.stop();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let terminate = async {
                    sigterm
                        .recv()
                        .await
                        .ok_or_else(|| io::Error::other("SIGTERM stream closed"))
                };
                tokio::select! {
                    _ = received(tokio::signal::ctrl_c(), "SIGINT") => {}
                    _ = received(terminate, "SIGTERM") => {}
                }
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                received(tokio::signal::ctrl_c(), "SIGINT").await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        received(tokio::signal::ctrl_c(), "Ctrl+C").await;
    }
}

/// Resolves once `signal` fires. A signal that cannot be listened for
/// never resolves, so it cannot take the tunnels down.
async fn received(signal: impl Future<Output = io::Result<()>>, name: &str) {
    match signal.await {
        Ok(()) => info!("received {name}, shutting down"),
        Err(e) => {
            error!(error = %e, "cannot listen for {name}");
            std::future::pending::<()>().await;
        }
    }
}
