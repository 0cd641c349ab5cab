//! Persistent stream channel ownership: connect, bounded reconnect, health.
//!
//! One spawned manager task owns the TCP link and all connection state. Every
//! input (handle commands, inbound stream lines, health-poll results,
//! backoff expiry) is folded into that task, so buffer and state mutation
//! are serialized by construction. Observers read state through `watch`
//! channels and never touch the link.
//!
//! The streaming link and the health poll are independent failure domains:
//! a failed poll classifies the backend as unreachable but never counts
//! against the reconnect budget, and a dropped link never marks a healthy
//! backend unhealthy on its own.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::protocol::{BackendHealth, Request, Response, StreamRequest};
use crate::stream::PredictionStream;

/// Combined connectivity status, as shown to the operator.
///
/// `Disconnected`/`Connecting`/`Connected` track the streaming link;
/// `Healthy`/`Unhealthy`/`Unreachable` refine `Connected` with the latest
/// health-poll classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Healthy,
    Unhealthy,
    Unreachable,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Healthy => "healthy",
            ConnectionState::Unhealthy => "unhealthy",
            ConnectionState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// One health-poll result.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub classification: BackendHealth,
    /// Round-trip latency; absent when the poll timed out or failed.
    pub latency: Option<Duration>,
    pub device: Option<String>,
    pub model_loaded: Option<bool>,
}

/// Connection policy knobs. Defaults are the production values; tests
/// shorten them.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: String,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Reconnect attempts per disconnect episode. Exhaustion leaves the
    /// manager disconnected until an explicit `connect()`.
    pub max_reconnect_attempts: u32,
    pub health_interval: Duration,
    /// Health-check round-trip bound, independent of the backoff schedule.
    pub health_timeout: Duration,
    /// Round-trip bound for request/response calls and stream connects.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:9878".to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            health_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Build from `NEURODECK_*` environment overrides.
    ///
    /// Recognized: `NEURODECK_ENDPOINT`, `NEURODECK_HEALTH_INTERVAL_SECS`,
    /// `NEURODECK_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("NEURODECK_ENDPOINT") {
            let v = v.trim();
            if !v.is_empty() {
                cfg.endpoint = v.to_string();
            }
        }
        if let Ok(v) = std::env::var("NEURODECK_HEALTH_INTERVAL_SECS") {
            if let Ok(secs) = v.trim().parse::<u64>() {
                cfg.health_interval = Duration::from_secs(secs.max(1));
            }
        }
        if let Ok(v) = std::env::var("NEURODECK_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = v.trim().parse::<u64>() {
                cfg.request_timeout = Duration::from_secs(secs.max(1));
                cfg.health_timeout = cfg.request_timeout;
            }
        }
        cfg
    }

    /// Backoff delay for a 1-based attempt number: initial × 2^(n−1),
    /// capped. Non-decreasing by construction.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    StartStream { session_id: u64 },
    StopStream { session_id: u64 },
    Shutdown,
}

#[derive(Debug)]
enum Event {
    Command(Command),
    Health(HealthSample),
}

/// Cloneable handle to a spawned [`ConnectionManager`] task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<ConnectionState>,
    health_rx: watch::Receiver<Option<HealthSample>>,
}

impl ConnectionHandle {
    /// Establish (or re-establish, after exhausted reconnects) the stream
    /// channel.
    pub fn connect(&self) {
        let _ = self.tx.send(Event::Command(Command::Connect));
    }

    /// Subscribe the channel to predictions for `session_id`.
    pub fn start_stream(&self, session_id: u64) {
        let _ = self
            .tx
            .send(Event::Command(Command::StartStream { session_id }));
    }

    /// Cancel the subscription for `session_id`, including any in-flight
    /// reconnect attempt tied to it.
    pub fn stop_stream(&self, session_id: u64) {
        let _ = self
            .tx
            .send(Event::Command(Command::StopStream { session_id }));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Command(Command::Shutdown));
    }

    /// Current combined state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn health_watch(&self) -> watch::Receiver<Option<HealthSample>> {
        self.health_rx.clone()
    }
}

pub struct ConnectionManager;

impl ConnectionManager {
    /// Spawn the manager and its health-poll task. Must run inside a tokio
    /// runtime. The tasks exit when `shutdown()` is sent or every handle is
    /// dropped.
    pub fn spawn(
        cfg: ConnectionConfig,
        stream: Arc<RwLock<PredictionStream>>,
    ) -> ConnectionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (health_tx, health_rx) = watch::channel(None);

        let api = ApiClient::new(cfg.endpoint.clone(), cfg.request_timeout);
        tokio::spawn(health_poll_loop(
            api,
            cfg.health_interval,
            cfg.health_timeout,
            tx.clone(),
        ));

        let task = ManagerTask {
            cfg,
            rx,
            state_tx,
            health_tx,
            stream,
            link: None,
            phase: Phase::Down,
            active_session: None,
            last_health: None,
        };
        tokio::spawn(task.run());

        ConnectionHandle {
            tx,
            state_rx,
            health_rx,
        }
    }
}

/// Streaming-link phase, before health refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Down,
    Connecting,
    Up,
}

fn combined_state(phase: Phase, health: Option<BackendHealth>) -> ConnectionState {
    match phase {
        Phase::Down => ConnectionState::Disconnected,
        Phase::Connecting => ConnectionState::Connecting,
        Phase::Up => match health {
            None => ConnectionState::Connected,
            Some(BackendHealth::Healthy) => ConnectionState::Healthy,
            Some(BackendHealth::Degraded) => ConnectionState::Unhealthy,
            Some(BackendHealth::Unreachable) => ConnectionState::Unreachable,
        },
    }
}

struct Link {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

enum Step {
    Msg(Option<Event>),
    Line(io::Result<Option<String>>),
}

enum Wait {
    Elapsed,
    Cancelled,
    Shutdown,
}

struct ManagerTask {
    cfg: ConnectionConfig,
    rx: mpsc::UnboundedReceiver<Event>,
    state_tx: watch::Sender<ConnectionState>,
    health_tx: watch::Sender<Option<HealthSample>>,
    stream: Arc<RwLock<PredictionStream>>,
    link: Option<Link>,
    phase: Phase,
    active_session: Option<u64>,
    last_health: Option<BackendHealth>,
}

impl ManagerTask {
    async fn run(mut self) {
        info!(endpoint = %self.cfg.endpoint, "connection manager started");
        loop {
            let step = if let Some(link) = self.link.as_mut() {
                tokio::select! {
                    msg = self.rx.recv() => Step::Msg(msg),
                    line = link.reader.next_line() => Step::Line(line),
                }
            } else {
                Step::Msg(self.rx.recv().await)
            };

            let keep_running = match step {
                Step::Msg(None) => false,
                Step::Msg(Some(event)) => self.handle_event(event).await,
                Step::Line(Ok(Some(line))) => {
                    self.handle_line(&line).await;
                    true
                }
                Step::Line(Ok(None)) => self.handle_drop(None).await,
                Step::Line(Err(e)) => self.handle_drop(Some(e)).await,
            };
            if !keep_running {
                break;
            }
        }
        info!("connection manager stopped");
    }

    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Health(sample) => {
                self.apply_health(sample);
                true
            }
            Event::Command(cmd) => self.handle_command(cmd).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect => {
                if self.link.is_some() {
                    return true;
                }
                self.set_phase(Phase::Connecting);
                match self.open_link().await {
                    Ok(()) => {
                        self.resubscribe_active().await;
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "connect failed");
                        if self.active_session.is_some() {
                            return self.reconnect().await;
                        }
                        self.set_phase(Phase::Down);
                        true
                    }
                }
            }
            Command::StartStream { session_id } => {
                self.active_session = Some(session_id);
                if self.link.is_none() {
                    self.set_phase(Phase::Connecting);
                    if let Err(e) = self.open_link().await {
                        warn!(error = %e, "connect for new session failed");
                        return self.reconnect().await;
                    }
                }
                if let Err(e) = self
                    .write_stream_request(&StreamRequest::StartStream { session_id })
                    .await
                {
                    warn!(error = %e, "start-stream write failed");
                    self.link = None;
                    self.set_phase(Phase::Down);
                    return self.reconnect().await;
                }
                info!(session_id, "stream subscription opened");
                true
            }
            Command::StopStream { session_id } => {
                if self.active_session != Some(session_id) {
                    return true;
                }
                self.active_session = None;
                if self.link.is_some() {
                    if let Err(e) = self
                        .write_stream_request(&StreamRequest::StopStream { session_id })
                        .await
                    {
                        // Local stop already took effect; a dead link just
                        // means there is nothing left to unsubscribe from.
                        warn!(error = %e, "stop-stream write failed");
                        self.link = None;
                        self.set_phase(Phase::Down);
                    }
                }
                info!(session_id, "stream subscription closed");
                true
            }
            Command::Shutdown => {
                info!("shutdown requested");
                false
            }
        }
    }

    /// Inbound line on the stream channel: a prediction event or a control
    /// ack. Malformed payloads are logged and dropped; the pipeline
    /// continues.
    async fn handle_line(&mut self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping unparseable stream line");
                return;
            }
        };

        if value.get("predicted_class").is_some() {
            let Some(session_id) = self.active_session else {
                debug!("prediction arrived with no active session; dropped");
                return;
            };
            match self.stream.write().await.ingest(session_id, &value) {
                Ok(true) => {}
                Ok(false) => debug!(session_id, "late prediction for rebound buffer; dropped"),
                Err(e) => warn!(error = %e, "dropping malformed prediction event"),
            }
        } else if let Some(kind) = value.get("type").and_then(Value::as_str) {
            debug!(kind, "stream control message");
        } else {
            warn!("dropping unrecognized stream message");
        }
    }

    /// The stream link died underneath us. Publish Disconnected, then run
    /// the bounded reconnect policy if a session still needs the stream.
    async fn handle_drop(&mut self, err: Option<io::Error>) -> bool {
        match &err {
            Some(e) => warn!(error = %e, "stream channel read failed"),
            None => info!("stream channel closed by backend"),
        }
        self.link = None;
        self.set_phase(Phase::Down);
        if self.active_session.is_some() {
            self.reconnect().await
        } else {
            true
        }
    }

    /// Bounded exponential backoff: initial delay doubling up to the cap,
    /// at most `max_reconnect_attempts` tries per episode. Exhaustion is a
    /// persistent Disconnected; it never retries forever.
    async fn reconnect(&mut self) -> bool {
        for attempt in 1..=self.cfg.max_reconnect_attempts {
            let delay = self.cfg.backoff_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            match self.sleep_through_backoff(delay).await {
                Wait::Shutdown => return false,
                Wait::Cancelled => {
                    info!("reconnect cancelled by session stop");
                    self.set_phase(Phase::Down);
                    return true;
                }
                Wait::Elapsed => {}
            }

            self.set_phase(Phase::Connecting);
            match self.open_link().await {
                Ok(()) => {
                    self.resubscribe_active().await;
                    if self.link.is_some() {
                        info!(attempt, "stream channel restored");
                        return true;
                    }
                    // Resubscribe write failed; counts as a failed attempt.
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }

        error!(
            attempts = self.cfg.max_reconnect_attempts,
            "reconnect attempts exhausted; explicit connect required"
        );
        self.link = None;
        self.set_phase(Phase::Down);
        true
    }

    /// Re-issue the stream subscription for the active session, if any.
    /// On write failure the link is dropped and left for the caller to
    /// handle.
    async fn resubscribe_active(&mut self) {
        let Some(session_id) = self.active_session else {
            return;
        };
        match self
            .write_stream_request(&StreamRequest::StartStream { session_id })
            .await
        {
            Ok(()) => info!(session_id, "stream subscription restored"),
            Err(e) => {
                warn!(error = %e, "resubscribe write failed");
                self.link = None;
                self.set_phase(Phase::Down);
            }
        }
    }

    /// Sleep out a backoff delay while still draining the inbox. Stop and
    /// shutdown cancel the wait; an explicit connect cuts it short.
    async fn sleep_through_backoff(&mut self, delay: Duration) -> Wait {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wait::Elapsed,
                msg = self.rx.recv() => match msg {
                    None => return Wait::Shutdown,
                    Some(Event::Health(sample)) => self.apply_health(sample),
                    Some(Event::Command(Command::Shutdown)) => return Wait::Shutdown,
                    Some(Event::Command(Command::Connect)) => return Wait::Elapsed,
                    Some(Event::Command(Command::StopStream { session_id })) => {
                        if self.active_session == Some(session_id) {
                            self.active_session = None;
                            return Wait::Cancelled;
                        }
                    }
                    Some(Event::Command(Command::StartStream { session_id })) => {
                        // Retarget the pending subscription to the new session.
                        self.active_session = Some(session_id);
                    }
                },
            }
        }
    }

    async fn open_link(&mut self) -> io::Result<()> {
        let stream = time::timeout(
            self.cfg.request_timeout,
            TcpStream::connect(&self.cfg.endpoint),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stream connect timed out"))??;

        let (reader, writer) = stream.into_split();
        self.link = Some(Link {
            reader: BufReader::new(reader).lines(),
            writer,
        });
        // Health refreshes on the next poll; until then the link is just
        // Connected.
        self.last_health = None;
        self.set_phase(Phase::Up);
        info!(endpoint = %self.cfg.endpoint, "stream channel connected");
        Ok(())
    }

    async fn write_stream_request(&mut self, req: &StreamRequest) -> io::Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream channel is down",
            ));
        };
        let mut line = serde_json::to_string(req)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        link.writer.write_all(line.as_bytes()).await
    }

    fn apply_health(&mut self, sample: HealthSample) {
        self.last_health = Some(sample.classification);
        let _ = self.health_tx.send(Some(sample));
        self.publish();
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        let _ = self
            .state_tx
            .send(combined_state(self.phase, self.last_health));
    }
}

/// Fixed-interval health poll. Results are fed into the manager inbox so
/// state mutation stays on one task; failures classify the backend, never
/// the stream link.
async fn health_poll_loop(
    api: ApiClient,
    interval: Duration,
    timeout: Duration,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let started = Instant::now();
        let sample = match api.call_with_timeout(&Request::Health, timeout).await {
            Ok(Response::Health {
                status,
                device,
                model_loaded,
            }) => HealthSample {
                classification: status,
                latency: Some(started.elapsed()),
                device,
                model_loaded,
            },
            Ok(other) => {
                warn!(?other, "unexpected health response");
                HealthSample {
                    classification: BackendHealth::Degraded,
                    latency: Some(started.elapsed()),
                    device: None,
                    model_loaded: None,
                }
            }
            Err(e) => {
                debug!(error = %e, "health poll failed");
                HealthSample {
                    classification: BackendHealth::Unreachable,
                    latency: None,
                    device: None,
                    model_loaded: None,
                }
            }
        };
        if tx.send(Event::Health(sample)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let cfg = ConnectionConfig::default();
        let delays: Vec<u64> = (1..=cfg.max_reconnect_attempts)
            .map(|a| cfg.backoff_delay(a).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn backoff_never_overflows_on_large_attempts() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.backoff_delay(1000), cfg.max_backoff);
    }

    #[test]
    fn link_phase_wins_while_down() {
        assert_eq!(
            combined_state(Phase::Down, Some(BackendHealth::Healthy)),
            ConnectionState::Disconnected
        );
        assert_eq!(
            combined_state(Phase::Connecting, Some(BackendHealth::Unreachable)),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn health_refines_connected() {
        assert_eq!(combined_state(Phase::Up, None), ConnectionState::Connected);
        assert_eq!(
            combined_state(Phase::Up, Some(BackendHealth::Healthy)),
            ConnectionState::Healthy
        );
        assert_eq!(
            combined_state(Phase::Up, Some(BackendHealth::Degraded)),
            ConnectionState::Unhealthy
        );
        assert_eq!(
            combined_state(Phase::Up, Some(BackendHealth::Unreachable)),
            ConnectionState::Unreachable
        );
    }

    #[test]
    fn default_policy_matches_contract() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.initial_backoff, Duration::from_secs(1));
        assert_eq!(cfg.max_backoff, Duration::from_secs(5));
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.health_interval, Duration::from_secs(10));
        assert_eq!(cfg.health_timeout, Duration::from_secs(5));
    }
}
