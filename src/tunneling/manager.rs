use std::{sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Instant, sleep, timeout},
};
use tracing::{error, info, warn};

use crate::{config::ConfigError, config::TunnelConfig, storage::StorageError};

use super::{
    health::{self, HealthProbe, HealthProbeResult},
    session::{TunnelSession, TunnelState},
    stop_requested,
    transport::{ExitKind, Transport, TransportError},
};

/// How long a stopped transport gets to go away.
pub(crate) const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// A session that lived this long resets the consecutive failure count.
pub(crate) const STABLE_SESSION: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage layer error: {0}")]
    StorageLayer(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("tunnel {0} was already started")]
    AlreadyStarted(String),
    #[error("tunnel {name} gave up after {failures} consecutive failures")]
    GaveUp { name: String, failures: u32 },
}

/// Keeps one reverse tunnel alive: connect, block while connected, wait
/// `reconnect_delay`, repeat, until stopped.
pub(crate) struct TunnelManager {
    config: Arc<TunnelConfig>,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn HealthProbe>,
    shutdown: watch::Sender<bool>,
    status: watch::Sender<TunnelSession>,
    health: Arc<watch::Sender<Option<HealthProbeResult>>>,
}

impl TunnelManager {
    pub fn new(
        config: TunnelConfig,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (status, _) = watch::channel(TunnelSession::default());
        let (health, _) = watch::channel(None);
        TunnelManager {
            config: Arc::new(config),
            transport,
            probe,
            shutdown,
            status,
            health: Arc::new(health),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelSession> {
        self.status.subscribe()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<Option<HealthProbeResult>> {
        self.health.subscribe()
    }

    pub fn session(&self) -> TunnelSession {
        self.status.borrow().clone()
    }

    /// One bounded check of the local service. Never touches the session.
    pub async fn probe_local_health(&self) -> HealthProbeResult {
        self.probe.probe(&self.config).await
    }

    /// Requests shutdown. Safe to call any number of times, before or
    /// during `start`.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!(tunnel = %self.config.name, "stop requested");
        }
    }

    /// Runs the supervise loop. Returns `Ok` once stopped, `Err` when the
    /// manager was already started or the failure limit was reached.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let claimed = self.status.send_if_modified(|session| {
            if session.state == TunnelState::Idle {
                session.state = TunnelState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(TunnelError::AlreadyStarted(self.config.name.clone()));
        }

        let monitor = tokio::spawn(health::monitor(
            self.config.clone(),
            self.probe.clone(),
            self.health.clone(),
            self.shutdown.subscribe(),
        ));
        let mut shutdown = self.shutdown.subscribe();
        let result = self.supervise(&mut shutdown).await;
        monitor.abort();
        result
    }

    async fn supervise(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), TunnelError> {
        let name = &self.config.name;
        loop {
            if *shutdown.borrow() {
                self.terminate();
                return Ok(());
            }

            let started_at = Utc::now();
            let mut attempt = 0;
            self.status
                .send_modify(|session| attempt = session.begin_attempt(started_at));
            info!(
                tunnel = %name,
                attempt,
                started_at = %started_at.to_rfc3339(),
                remote = %format!("{}:{}", self.config.remote_host, self.config.remote_port),
                local_port = self.config.local_port,
                "starting tunnel attempt"
            );

            let began = Instant::now();
            let exit = self.run_attempt(shutdown).await;
            let uptime = began.elapsed();
            // an exit racing a stop request belongs to the stop
            let exit = if *shutdown.borrow() {
                ExitKind::Stopped
            } else {
                exit
            };

            if exit == ExitKind::Stopped
                || (exit == ExitKind::Clean && self.config.stop_on_clean_exit)
            {
                self.status.send_modify(|session| session.last_exit = Some(exit));
                self.terminate();
                return Ok(());
            }

            let mut failures = 0;
            self.status.send_modify(|session| {
                session.last_exit = Some(exit);
                session.state = TunnelState::Disconnected;
                if uptime >= STABLE_SESSION {
                    session.consecutive_failures = 0;
                }
                session.consecutive_failures += 1;
                failures = session.consecutive_failures;
            });

            if let Some(max) = self.config.max_consecutive_failures {
                if failures >= max {
                    error!(tunnel = %name, attempt, failures, "giving up on tunnel");
                    self.terminate();
                    return Err(TunnelError::GaveUp {
                        name: name.clone(),
                        failures,
                    });
                }
            }

            let delay = self.config.reconnect_delay();
            warn!(
                tunnel = %name,
                attempt,
                exit = %exit,
                delay_secs = delay.as_secs(),
                "tunnel disconnected, retrying"
            );
            self.set_state(TunnelState::Retrying);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop_requested(shutdown) => {
                    self.terminate();
                    return Ok(());
                }
            }
        }
    }

    /// One connect-and-block cycle. Never returns before the transport is gone.
    async fn run_attempt(&self, shutdown: &mut watch::Receiver<bool>) -> ExitKind {
        let name = &self.config.name;
        let connected = tokio::select! {
            result = self.transport.connect(&self.config) => result,
            _ = stop_requested(shutdown) => return ExitKind::Stopped,
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                warn!(tunnel = %name, error = %e, "cannot establish tunnel");
                return ExitKind::Failed { code: None };
            }
        };

        self.set_state(TunnelState::Connected);
        info!(tunnel = %name, relay = %self.config.relay_address(), "tunnel established");

        let exit = tokio::select! {
            exit = session.wait() => exit,
            _ = stop_requested(shutdown) => ExitKind::Stopped,
        };
        if exit == ExitKind::Stopped && timeout(TERMINATE_GRACE, session.terminate()).await.is_err()
        {
            warn!(tunnel = %name, "transport did not terminate in time");
        }
        exit
    }

    fn set_state(&self, state: TunnelState) {
        self.status.send_modify(|session| session.state = state);
    }

    fn terminate(&self) {
        let mut attempts = 0;
        self.status.send_modify(|session| {
            session.state = TunnelState::Terminated;
            attempts = session.attempt;
        });
        info!(tunnel = %self.config.name, attempts, "tunnel terminated");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::tunneling::{
        health::MockHealthProbe,
        transport::{MockTransport, TransportSession},
    };

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Refuse,
        Exit(i32),
        /// stays up for the given seconds, then exits
        ExitAfter(u64, i32),
        Hold,
    }

    /// Plays back a list of outcomes, then holds every later session open.
    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        connects: Mutex<Vec<Instant>>,
        terminated: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                steps: Mutex::new(steps.into_iter().collect()),
                connects: Mutex::new(Vec::new()),
                terminated: Arc::new(AtomicUsize::new(0)),
            })
        }
        fn connect_times(&self) -> Vec<Instant> {
            self.connects.lock().unwrap().clone()
        }
        fn terminations(&self) -> usize {
            self.terminated.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(
            &self,
            _config: &TunnelConfig,
        ) -> Result<Box<dyn TransportSession>, TransportError> {
            self.connects.lock().unwrap().push(Instant::now());
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Hold);
            let (exit, uptime) = match step {
                Step::Refuse => return Err(TransportError::ForwardRefused(3000)),
                Step::Exit(code) => (Some(ExitKind::from_code(Some(code))), None),
                Step::ExitAfter(secs, code) => (
                    Some(ExitKind::from_code(Some(code))),
                    Some(Duration::from_secs(secs)),
                ),
                Step::Hold => (None, None),
            };
            Ok(Box::new(ScriptedSession {
                exit,
                uptime,
                terminated: self.terminated.clone(),
            }))
        }
    }

    struct ScriptedSession {
        exit: Option<ExitKind>,
        uptime: Option<Duration>,
        terminated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportSession for ScriptedSession {
        async fn wait(&mut self) -> ExitKind {
            if let Some(uptime) = self.uptime.take() {
                sleep(uptime).await;
            }
            match self.exit {
                Some(exit) => exit,
                None => std::future::pending().await,
            }
        }
        async fn terminate(&mut self) {
            if self.exit.is_none() {
                self.terminated.fetch_add(1, Ordering::SeqCst);
                self.exit = Some(ExitKind::Stopped);
            }
        }
    }

    /// Never answers; only the manager's own task boundaries keep it harmless.
    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _config: &TunnelConfig) -> HealthProbeResult {
            std::future::pending().await
        }
    }

    fn healthy_probe() -> Arc<dyn HealthProbe> {
        let mut probe = MockHealthProbe::new();
        probe
            .expect_probe()
            .returning(|_| HealthProbeResult::healthy(200, Duration::from_millis(1)));
        Arc::new(probe)
    }

    fn relay_config(delay: u64) -> TunnelConfig {
        let mut config = TunnelConfig::new("chat", "tunnel", "relay.example.com", 3000, 3000);
        config.reconnect_delay = delay;
        config
    }

    fn spawn(manager: &Arc<TunnelManager>) -> JoinHandle<Result<(), TunnelError>> {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start().await })
    }

    async fn wait_for_connected(manager: &TunnelManager, attempt: u64) {
        let mut rx = manager.subscribe();
        rx.wait_for(|s| s.state == TunnelState::Connected && s.attempt == attempt)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_a_held_connection() {
        let transport = ScriptedTransport::new([Step::Exit(255), Step::Exit(255)]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(5),
            transport.clone(),
            healthy_probe(),
        ));
        let runner = spawn(&manager);

        wait_for_connected(&manager, 3).await;
        let times = transport.connect_times();
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] >= Duration::from_secs(5));
        assert!(times[2] - times[1] >= Duration::from_secs(5));

        let session = manager.session();
        assert_eq!(session.last_exit, Some(ExitKind::Failed { code: Some(255) }));
        assert_eq!(session.consecutive_failures, 2);
        assert!(session.last_started.is_some());

        manager.stop();
        runner.await.unwrap().unwrap();
        assert_eq!(transport.connect_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_never_connects() {
        let mut transport = MockTransport::new();
        transport.expect_connect().never();
        let manager = TunnelManager::new(relay_config(5), Arc::new(transport), healthy_probe());
        manager.stop();
        manager.start().await.unwrap();
        let session = manager.session();
        assert_eq!(session.state, TunnelState::Terminated);
        assert_eq!(session.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_connected_kills_the_transport() {
        let transport = ScriptedTransport::new([]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(5),
            transport.clone(),
            healthy_probe(),
        ));
        let runner = spawn(&manager);
        wait_for_connected(&manager, 1).await;

        manager.stop();
        manager.stop();
        timeout(Duration::from_secs(1), runner)
            .await
            .expect("stop should be prompt")
            .unwrap()
            .unwrap();

        let session = manager.session();
        assert_eq!(session.state, TunnelState::Terminated);
        assert_eq!(session.last_exit, Some(ExitKind::Stopped));
        assert_eq!(transport.terminations(), 1);
        assert_eq!(transport.connect_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_retry_delay() {
        let transport = ScriptedTransport::new([Step::Exit(1)]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(3600),
            transport.clone(),
            healthy_probe(),
        ));
        let runner = spawn(&manager);
        let mut rx = manager.subscribe();
        rx.wait_for(|s| s.state == TunnelState::Retrying)
            .await
            .unwrap();

        let stopped_at = Instant::now();
        manager.stop();
        runner.await.unwrap().unwrap();
        assert!(stopped_at.elapsed() < Duration::from_secs(1));
        assert!(manager.session().is_terminated());
        assert_eq!(transport.connect_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn autonomous_clean_exit_is_retried() {
        let transport = ScriptedTransport::new([Step::Exit(0), Step::Exit(0)]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(1),
            transport.clone(),
            healthy_probe(),
        ));
        let runner = spawn(&manager);
        wait_for_connected(&manager, 3).await;
        assert_eq!(manager.session().last_exit, Some(ExitKind::Clean));
        manager.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_ends_the_loop_when_configured() {
        let transport = ScriptedTransport::new([Step::Exit(0)]);
        let mut config = relay_config(1);
        config.stop_on_clean_exit = true;
        let manager = TunnelManager::new(config, transport.clone(), healthy_probe());
        manager.start().await.unwrap();
        let session = manager.session();
        assert_eq!(session.state, TunnelState::Terminated);
        assert_eq!(session.attempt, 1);
        assert_eq!(session.last_exit, Some(ExitKind::Clean));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_are_retried_forever() {
        let transport = ScriptedTransport::new(vec![Step::Refuse; 10]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(1),
            transport.clone(),
            healthy_probe(),
        ));
        let runner = spawn(&manager);
        wait_for_connected(&manager, 11).await;

        assert_eq!(transport.connect_times().len(), 11);
        let session = manager.session();
        assert_eq!(session.consecutive_failures, 10);
        assert_eq!(session.last_exit, Some(ExitKind::Failed { code: None }));
        manager.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_moves_one_step_per_cycle() {
        let transport = ScriptedTransport::new(vec![Step::Exit(255); 4]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(2),
            transport.clone(),
            healthy_probe(),
        ));
        let mut rx = manager.subscribe();
        let runner = spawn(&manager);

        let mut seen: Vec<u64> = Vec::new();
        while seen.last() != Some(&5) {
            rx.changed().await.unwrap();
            let session = rx.borrow_and_update().clone();
            assert!(!session.is_terminated());
            if session.attempt > 0 && seen.last() != Some(&session.attempt) {
                seen.push(session.attempt);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        manager.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_gives_up_after_the_limit() {
        let transport = ScriptedTransport::new(vec![Step::Exit(1); 5]);
        let mut config = relay_config(1);
        config.max_consecutive_failures = Some(3);
        let manager = TunnelManager::new(config, transport.clone(), healthy_probe());
        let result = manager.start().await;
        assert!(matches!(
            result,
            Err(TunnelError::GaveUp { failures: 3, .. })
        ));
        assert_eq!(manager.session().attempt, 3);
        assert!(manager.session().is_terminated());
        assert_eq!(transport.connect_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_does_not_count_as_uptime() {
        let transport = ScriptedTransport::new([Step::Exit(1), Step::Exit(1)]);
        let mut config = relay_config(120);
        config.max_consecutive_failures = Some(2);
        let manager = Arc::new(TunnelManager::new(config, transport, healthy_probe()));
        let runner = spawn(&manager);
        let result = timeout(Duration::from_secs(600), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(TunnelError::GaveUp { failures: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn long_sessions_reset_the_failure_count() {
        let transport = ScriptedTransport::new([
            Step::Exit(1),
            Step::ExitAfter(70, 1),
            Step::Exit(1),
        ]);
        let mut config = relay_config(1);
        config.max_consecutive_failures = Some(2);
        let manager = TunnelManager::new(config, transport.clone(), healthy_probe());
        let result = manager.start().await;
        assert!(matches!(
            result,
            Err(TunnelError::GaveUp { failures: 2, .. })
        ));
        assert_eq!(manager.session().attempt, 3);
        assert_eq!(transport.connect_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn health_failures_leave_the_session_alone() {
        let mut probe = MockHealthProbe::new();
        probe
            .expect_probe()
            .times(1..)
            .returning(|_| HealthProbeResult::unhealthy(None, "connection refused"));
        let mut config = relay_config(5);
        config.health_interval = 1;
        let transport = ScriptedTransport::new([]);
        let manager = Arc::new(TunnelManager::new(config, transport, Arc::new(probe)));
        let mut health = manager.subscribe_health();
        let runner = spawn(&manager);
        wait_for_connected(&manager, 1).await;

        sleep(Duration::from_secs(10)).await;
        health.wait_for(|h| h.is_some()).await.unwrap();
        assert_eq!(
            health.borrow().as_ref().map(|h| h.reachable),
            Some(false)
        );
        let session = manager.session();
        assert_eq!(session.state, TunnelState::Connected);
        assert_eq!(session.attempt, 1);
        assert_eq!(session.consecutive_failures, 0);
        assert_eq!(session.last_exit, None);

        manager.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_health_probe_does_not_delay_reconnects() {
        let transport = ScriptedTransport::new([Step::Exit(1)]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(5),
            transport.clone(),
            Arc::new(HangingProbe),
        ));
        let runner = spawn(&manager);
        wait_for_connected(&manager, 2).await;
        let times = transport.connect_times();
        assert!(times[1] - times[0] < Duration::from_secs(6));
        manager.stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_probe_is_isolated() {
        let mut probe = MockHealthProbe::new();
        probe
            .expect_probe()
            .times(1)
            .returning(|_| HealthProbeResult::unhealthy(Some(500), "status 500"));
        let mut transport = MockTransport::new();
        transport.expect_connect().never();
        let manager = TunnelManager::new(relay_config(5), Arc::new(transport), Arc::new(probe));

        let result = manager.probe_local_health().await;
        assert!(!result.reachable);
        assert_eq!(result.status, Some(500));
        assert_eq!(manager.session(), TunnelSession::default());
        assert!(manager.subscribe_health().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let transport = ScriptedTransport::new([]);
        let manager = Arc::new(TunnelManager::new(
            relay_config(5),
            transport,
            healthy_probe(),
        ));
        let runner = spawn(&manager);
        wait_for_connected(&manager, 1).await;
        assert!(matches!(
            manager.start().await,
            Err(TunnelError::AlreadyStarted(_))
        ));
        manager.stop();
        runner.await.unwrap().unwrap();
    }
}
