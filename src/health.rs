//! Passive view over the connection manager's health signal.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;

use crate::connection::{ConnectionHandle, ConnectionState, HealthSample};

/// Latency samples retained for smoothing. Small on purpose; the monitor
/// never accumulates history.
const LATENCY_RING: usize = 8;

/// Thin consumer of [`ConnectionHandle`] watch channels: current combined
/// state, the latest health sample, and a smoothed latency over a tiny ring.
pub struct HealthMonitor {
    state_rx: watch::Receiver<ConnectionState>,
    health_rx: watch::Receiver<Option<HealthSample>>,
    latencies: VecDeque<Duration>,
}

impl HealthMonitor {
    pub fn new(conn: &ConnectionHandle) -> Self {
        Self {
            state_rx: conn.state_watch(),
            health_rx: conn.health_watch(),
            latencies: VecDeque::with_capacity(LATENCY_RING),
        }
    }

    /// Pull the newest sample into the ring, if one arrived since the last
    /// call.
    pub fn refresh(&mut self) {
        if !self
            .health_rx
            .has_changed()
            .unwrap_or(false)
        {
            return;
        }
        let sample = self.health_rx.borrow_and_update().clone();
        if let Some(latency) = sample.and_then(|s| s.latency) {
            self.latencies.push_back(latency);
            if self.latencies.len() > LATENCY_RING {
                self.latencies.pop_front();
            }
        }
    }

    /// Current combined connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Most recent health sample, if any poll has completed.
    pub fn sample(&self) -> Option<HealthSample> {
        self.health_rx.borrow().clone()
    }

    /// Latency of the most recent successful poll; absent when the last
    /// poll timed out or failed.
    pub fn latency(&self) -> Option<Duration> {
        self.health_rx.borrow().as_ref().and_then(|s| s.latency)
    }

    /// Mean over the retained ring, for a steadier display number.
    pub fn smoothed_latency(&mut self) -> Option<Duration> {
        self.refresh();
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }
}
