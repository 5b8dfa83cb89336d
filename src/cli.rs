use clap::{Args, Parser};

use crate::config::{
    ConfigError, DEFAULT_PATH, HostKeyPolicy, StorageConfig, TetherConfig, TransportKind,
    TunnelConfig,
};

#[derive(Parser, Debug)]
#[command(version, about = "Tether keeps reverse SSH tunnels to a public relay alive", long_about = None)]
pub(crate) struct TetherCli {
    /// custom config file
    #[arg(short, long, env = "TETHER_CONFIG")]
    pub config: Option<String>,
    /// log filter used when RUST_LOG is not set
    #[arg(long, env = "TETHER_LOG", default_value = "info")]
    pub log: String,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
}

/// A single tunnel described on the command line or through the environment.
#[derive(Args, Debug, Default)]
pub(crate) struct TunnelArgs {
    #[arg(long, env = "TETHER_NAME")]
    pub name: Option<String>,
    #[arg(long, env = "TETHER_REMOTE_USER")]
    pub remote_user: Option<String>,
    #[arg(long, env = "TETHER_REMOTE_HOST")]
    pub remote_host: Option<String>,
    #[arg(long, env = "TETHER_SSH_PORT")]
    pub ssh_port: Option<u16>,
    #[arg(long, env = "TETHER_REMOTE_BIND_ADDRESS")]
    pub remote_bind_address: Option<String>,
    #[arg(long, env = "TETHER_REMOTE_PORT")]
    pub remote_port: Option<u16>,
    #[arg(long, env = "TETHER_LOCAL_PORT")]
    pub local_port: Option<u16>,
    /// seconds between a disconnect and the next attempt
    #[arg(long, env = "TETHER_RECONNECT_DELAY")]
    pub reconnect_delay: Option<u64>,
    #[arg(long, env = "TETHER_KEEPALIVE_INTERVAL")]
    pub keepalive_interval: Option<u64>,
    #[arg(long, env = "TETHER_KEEPALIVE_MAX_MISSED")]
    pub keepalive_max_missed: Option<u32>,
    #[arg(long, env = "TETHER_HEALTH_PATH")]
    pub health_path: Option<String>,
    #[arg(long, env = "TETHER_HEALTH_TIMEOUT_MS")]
    pub health_timeout_ms: Option<u64>,
    #[arg(long, env = "TETHER_HEALTH_INTERVAL")]
    pub health_interval: Option<u64>,
    #[arg(long, env = "TETHER_HOST_KEY_POLICY", value_enum)]
    pub host_key_policy: Option<HostKeyPolicy>,
    #[arg(long, env = "TETHER_TRANSPORT", value_enum)]
    pub transport: Option<TransportKind>,
    #[arg(long, env = "TETHER_SSH_BINARY")]
    pub ssh_binary: Option<String>,
    #[arg(long, env = "TETHER_IDENTITY_FILE")]
    pub identity_file: Option<String>,
    #[arg(long, env = "TETHER_MAX_CONSECUTIVE_FAILURES")]
    pub max_consecutive_failures: Option<u32>,
    #[arg(long, env = "TETHER_STOP_ON_CLEAN_EXIT")]
    pub stop_on_clean_exit: bool,
    /// sqlite file for relay fingerprints (native transport)
    #[arg(long, env = "TETHER_KNOWN_HOSTS")]
    pub known_hosts: Option<String>,
}

impl TunnelArgs {
    /// Whether any single-tunnel flag or variable was given.
    fn has_flags(&self) -> bool {
        self.name.is_some()
            || self.remote_user.is_some()
            || self.remote_host.is_some()
            || self.ssh_port.is_some()
            || self.remote_bind_address.is_some()
            || self.remote_port.is_some()
            || self.local_port.is_some()
            || self.reconnect_delay.is_some()
            || self.keepalive_interval.is_some()
            || self.keepalive_max_missed.is_some()
            || self.health_path.is_some()
            || self.health_timeout_ms.is_some()
            || self.health_interval.is_some()
            || self.host_key_policy.is_some()
            || self.transport.is_some()
            || self.ssh_binary.is_some()
            || self.identity_file.is_some()
            || self.max_consecutive_failures.is_some()
            || self.stop_on_clean_exit
            || self.known_hosts.is_some()
    }

    pub fn into_config(self) -> Result<TetherConfig, ConfigError> {
        let remote_user = self
            .remote_user
            .ok_or(ConfigError::MissingParameter("remote_user"))?;
        let remote_host = self
            .remote_host
            .ok_or(ConfigError::MissingParameter("remote_host"))?;
        let remote_port = self
            .remote_port
            .ok_or(ConfigError::MissingParameter("remote_port"))?;
        let local_port = self
            .local_port
            .ok_or(ConfigError::MissingParameter("local_port"))?;
        let name = self
            .name
            .unwrap_or_else(|| format!("{remote_host}:{remote_port}"));

        let mut tunnel = TunnelConfig::new(name, remote_user, remote_host, remote_port, local_port);
        if let Some(port) = self.ssh_port {
            tunnel.remote_ssh_port = port;
        }
        tunnel.remote_bind_address = self.remote_bind_address;
        if let Some(delay) = self.reconnect_delay {
            tunnel.reconnect_delay = delay;
        }
        if let Some(interval) = self.keepalive_interval {
            tunnel.keepalive_interval = interval;
        }
        if let Some(missed) = self.keepalive_max_missed {
            tunnel.keepalive_max_missed = missed;
        }
        if let Some(path) = self.health_path {
            tunnel.health_path = path;
        }
        if let Some(timeout) = self.health_timeout_ms {
            tunnel.health_timeout_ms = timeout;
        }
        if let Some(interval) = self.health_interval {
            tunnel.health_interval = interval;
        }
        if let Some(policy) = self.host_key_policy {
            tunnel.host_key_policy = policy;
        }
        if let Some(transport) = self.transport {
            tunnel.transport = transport;
        }
        if let Some(binary) = self.ssh_binary {
            tunnel.ssh_binary = binary;
        }
        tunnel.identity_file = self.identity_file;
        tunnel.max_consecutive_failures = self.max_consecutive_failures;
        tunnel.stop_on_clean_exit = self.stop_on_clean_exit;

        let storage = match self.known_hosts {
            Some(path) => StorageConfig { path },
            None => StorageConfig::default(),
        };
        let config = TetherConfig {
            storage,
            tunnels: vec![tunnel],
        };
        config.validate()?;
        Ok(config)
    }
}

impl TetherCli {
    /// Flags win when a relay host is given. Without any tunnel flag the
    /// config file is read; partial flags without a host are an error.
    pub fn resolve(self) -> Result<TetherConfig, ConfigError> {
        if self.tunnel.remote_host.is_some() {
            return self.tunnel.into_config();
        }
        if self.tunnel.has_flags() {
            return Err(ConfigError::MissingParameter("remote_host"));
        }
        TetherConfig::load(self.config.as_deref().unwrap_or(DEFAULT_PATH))
    }
}
