//! Neurodeck Monitor - Headless operator client
//!
//! Connects to a decoding backend, starts a session for the configured
//! subject, and logs streamed predictions and health transitions until
//! Ctrl-C, then ends the session and prints the backend's statistics.
//!
//! Configuration (environment):
//! - NEURODECK_ENDPOINT: backend address (default 127.0.0.1:9878)
//! - NEURODECK_SUBJECT:  subject name (default "operator")
//! - NEURODECK_AGE:      subject age (default 30)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time;
use tracing::{info, warn};

use neurodeck::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cfg = ConnectionConfig::from_env();
    info!(endpoint = %cfg.endpoint, "starting neurodeck monitor");

    let subject_name =
        std::env::var("NEURODECK_SUBJECT").unwrap_or_else(|_| "operator".to_string());
    let subject_age = std::env::var("NEURODECK_AGE")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(30);

    let stream = Arc::new(RwLock::new(PredictionStream::new()));
    let conn = ConnectionManager::spawn(cfg.clone(), Arc::clone(&stream));
    conn.connect();

    let api = ApiClient::new(cfg.endpoint.clone(), cfg.request_timeout);
    let mut controller = SessionController::new(api, conn.clone(), Arc::clone(&stream));
    let mut monitor = HealthMonitor::new(&conn);

    let session_id = match controller
        .start_session(SubjectInfo::new(subject_name, subject_age))
        .await
    {
        Ok(session) => session.id,
        Err(e) => {
            warn!(error = %e, "could not start a session; exiting");
            return Err(e.into());
        }
    };
    info!(session_id, "session live; press Ctrl-C to stop");

    let mut ticker = time::interval(Duration::from_secs(1));
    let mut last_state = monitor.state();
    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = monitor.state();
                if state != last_state {
                    info!(%state, "backend status changed");
                    last_state = state;
                }

                let guard = stream.read().await;
                if guard.len() > seen {
                    seen = guard.len();
                    if let Some(latest) = guard.latest() {
                        let latency = monitor
                            .smoothed_latency()
                            .map(|d| format!("{}ms", d.as_millis()))
                            .unwrap_or_else(|| "n/a".to_string());
                        info!(
                            class = latest.label(),
                            confidence = latest.confidence,
                            uncertainty = latest.uncertainty,
                            buffered = guard.len(),
                            latency = %latency,
                            "prediction"
                        );
                        if let Some(view) = project(latest) {
                            let top: Vec<&str> = view
                                .top_channels
                                .iter()
                                .map(|c| c.name.as_str())
                                .collect();
                            info!(channels = ?top, "top contributors");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("stopping session");
    match controller.stop_session().await {
        StopOutcome::Stopped { warning: None } => info!(session_id, "session ended"),
        StopOutcome::Stopped {
            warning: Some(warning),
        } => warn!(session_id, %warning, "session ended locally; backend did not acknowledge"),
        StopOutcome::NotActive => {}
    }

    match controller.session_stats().await {
        Ok(stats) => info!(
            total_trials = stats.total_trials,
            correct = stats.correct,
            accuracy = stats.accuracy,
            "session statistics"
        ),
        Err(e) => warn!(error = %e, "statistics unavailable"),
    }

    conn.shutdown();
    Ok(())
}
