use std::fmt;

use chrono::{DateTime, Utc};

use super::transport::ExitKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Retrying,
    Terminated,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Disconnected => "disconnected",
            TunnelState::Retrying => "retrying",
            TunnelState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Mutable bookkeeping of one manager. Published as snapshots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TunnelSession {
    /// incremented right before each connection attempt
    pub attempt: u64,
    pub state: TunnelState,
    pub last_exit: Option<ExitKind>,
    pub last_started: Option<DateTime<Utc>>,
    /// disconnects in a row without a stable session in between
    pub consecutive_failures: u32,
}

impl TunnelSession {
    /// Moves to `Connecting` and returns the new attempt number.
    pub(crate) fn begin_attempt(&mut self, now: DateTime<Utc>) -> u64 {
        self.attempt += 1;
        self.state = TunnelState::Connecting;
        self.last_started = Some(now);
        self.attempt
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TunnelState::Terminated
    }
}
