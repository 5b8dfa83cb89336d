use std::{collections::HashSet, env::VarError, path::PathBuf, time::Duration};

use serde::{
    Deserialize,
    de::{self, Visitor},
};
use thiserror::Error;

pub const DEFAULT_PATH: &str = "~/.config/tether.toml";
pub const DEFAULT_KNOWN_HOSTS_PATH: &str = "./data/known_hosts.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("invalid value for `{field}` in tunnel {tunnel:?}: {reason}")]
    InvalidValue {
        tunnel: String,
        field: &'static str,
        reason: String,
    },
    #[error("no tunnels configured")]
    NoTunnels,
    #[error("tunnel name {0:?} is used more than once")]
    DuplicateName(String),
    #[error("env variable error: {0}")]
    Env(String),
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TetherConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct StorageConfig {
    /// sqlite file holding the relay fingerprints trusted by the native transport
    #[serde(default = "default_known_hosts_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: default_known_hosts_path(),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub(crate) struct EnvOrValue {
    from_env: Option<String>,
    value: Option<String>,
}

impl EnvOrValue {
    pub fn resolve(&self) -> Result<String, ConfigError> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }
        let Some(var) = &self.from_env else {
            return Err(ConfigError::Env("neither `value` nor `from_env` set".into()));
        };
        std::env::var(var).map_err(|e| match e {
            VarError::NotPresent => ConfigError::Env(format!("{var} not found in the environment")),
            VarError::NotUnicode(_) => ConfigError::Env(format!("{var} is not unicode")),
        })
    }
}

/// How the relay's host identity is trusted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub(crate) enum HostKeyPolicy {
    /// trust on first use, refuse a changed key
    #[default]
    #[serde(alias = "accept-new", alias = "accept_new", alias = "ACCEPT_NEW")]
    AcceptNew,
    /// only keys that are already known
    #[serde(alias = "strict", alias = "STRICT")]
    Strict,
    /// accept whatever the relay presents
    #[serde(alias = "insecure", alias = "INSECURE")]
    Insecure,
}

impl HostKeyPolicy {
    /// value for ssh's `StrictHostKeyChecking` option
    pub fn ssh_option(self) -> &'static str {
        match self {
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Strict => "yes",
            HostKeyPolicy::Insecure => "no",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub(crate) enum TransportKind {
    /// shell out to the system `ssh` binary
    #[default]
    #[serde(alias = "command", alias = "COMMAND")]
    Command,
    /// in-process ssh client
    #[serde(alias = "native", alias = "NATIVE")]
    Native,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct TunnelConfig {
    pub name: String,
    /// the ssh user on the relay
    pub remote_user: String,
    /// public address of the relay
    pub remote_host: String,
    #[serde(default = "default_ssh_port")]
    pub remote_ssh_port: u16,
    /// which interface the forward should be bound to on the relay
    #[serde(default)]
    pub remote_bind_address: Option<String>,
    /// port opened on the relay
    pub remote_port: u16,
    /// port of the tunneled service on 127.0.0.1
    pub local_port: u16,
    /// seconds to wait between a disconnect and the next attempt
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_keepalive_max_missed")]
    pub keepalive_max_missed: u32,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval: u64,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub identity_passphrase: Option<EnvOrValue>,
    /// give up after this many disconnects in a row; retry forever when unset
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
    /// treat an exit status of 0 as a reason to stop retrying
    #[serde(default)]
    pub stop_on_clean_exit: bool,
}

fn default_known_hosts_path() -> String {
    DEFAULT_KNOWN_HOSTS_PATH.to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_keepalive_interval() -> u64 {
    60
}
fn default_keepalive_max_missed() -> u32 {
    3
}
fn default_health_path() -> String {
    String::from("/health")
}
fn default_health_timeout_ms() -> u64 {
    2000
}
fn default_health_interval() -> u64 {
    30
}
fn default_ssh_binary() -> String {
    String::from("ssh")
}

impl TunnelConfig {
    /// A tunnel with every optional setting at its default.
    pub fn new(
        name: impl Into<String>,
        remote_user: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
    ) -> Self {
        TunnelConfig {
            name: name.into(),
            remote_user: remote_user.into(),
            remote_host: remote_host.into(),
            remote_ssh_port: default_ssh_port(),
            remote_bind_address: None,
            remote_port,
            local_port,
            reconnect_delay: default_reconnect_delay(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_max_missed: default_keepalive_max_missed(),
            health_path: default_health_path(),
            health_timeout_ms: default_health_timeout_ms(),
            health_interval: default_health_interval(),
            host_key_policy: HostKeyPolicy::default(),
            transport: TransportKind::default(),
            ssh_binary: default_ssh_binary(),
            identity_file: None,
            identity_passphrase: None,
            max_consecutive_failures: None,
            stop_on_clean_exit: false,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval)
    }

    /// `host:port` of the relay's ssh daemon
    pub fn relay_address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_ssh_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidValue {
            tunnel: self.name.clone(),
            field,
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.remote_user.trim().is_empty() {
            return Err(invalid("remote_user", "must not be empty"));
        }
        if self.remote_host.trim().is_empty() {
            return Err(invalid("remote_host", "must not be empty"));
        }
        for (field, port) in [
            ("remote_ssh_port", self.remote_ssh_port),
            ("remote_port", self.remote_port),
            ("local_port", self.local_port),
        ] {
            if port == 0 {
                return Err(invalid(field, "ports must be between 1 and 65535"));
            }
        }
        if self.keepalive_interval == 0 {
            return Err(invalid("keepalive_interval", "must be at least 1 second"));
        }
        if self.keepalive_max_missed == 0 {
            return Err(invalid("keepalive_max_missed", "must be at least 1"));
        }
        if !self.health_path.starts_with('/') {
            return Err(invalid("health_path", "must start with `/`"));
        }
        if self.health_timeout_ms == 0 {
            return Err(invalid("health_timeout_ms", "must be greater than 0"));
        }
        if self.health_interval == 0 {
            return Err(invalid("health_interval", "must be at least 1 second"));
        }
        if self.max_consecutive_failures == Some(0) {
            return Err(invalid("max_consecutive_failures", "must be at least 1"));
        }
        if self.transport == TransportKind::Native && self.identity_file.is_none() {
            return Err(invalid(
                "identity_file",
                "the native transport needs a private key",
            ));
        }
        Ok(())
    }
}

impl TetherConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = expand_home(path);
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: TetherConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnels.is_empty() {
            return Err(ConfigError::NoTunnels);
        }
        let mut names = HashSet::new();
        for tunnel in &self.tunnels {
            tunnel.validate()?;
            if !names.insert(tunnel.name.as_str()) {
                return Err(ConfigError::DuplicateName(tunnel.name.clone()));
            }
        }
        Ok(())
    }
}

/// Expands a leading `~/` to `$HOME`.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

impl<'de> Deserialize<'de> for EnvOrValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EnvOrValueVisitor;
        impl<'de> Visitor<'de> for EnvOrValueVisitor {
            type Value = EnvOrValue;
            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map with `from_env` or `value` set")
            }
            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut from_env = None;
                let mut value = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "from_env" => from_env = Some(map.next_value()?),
                        "value" => value = Some(map.next_value()?),
                        _ => return Err(de::Error::unknown_field(&key, &["from_env", "value"])),
                    }
                }

                if from_env.is_none() && value.is_none() {
                    return Err(de::Error::custom(
                        "at least one between `from_env` or `value` must be provided",
                    ));
                }
                if value.is_some() {
                    from_env = None; // value takes precedence
                }
                Ok(EnvOrValue { value, from_env })
            }
        }
        deserializer.deserialize_map(EnvOrValueVisitor)
    }
}
