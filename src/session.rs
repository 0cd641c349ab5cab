//! Session lifecycle orchestration.
//!
//! The controller owns the current [`Session`] and is the only writer of its
//! state. Subject validation happens before any network call; the stream
//! subscription is only opened once both backend calls succeeded, so a
//! failed start never leaves partial state behind.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::connection::ConnectionHandle;
use crate::error::{ClientError, StopOutcome};
use crate::protocol::{Request, Response, SessionStats};
use crate::stream::PredictionStream;

/// Operator-entered subject details for a session start.
#[derive(Debug, Clone)]
pub struct SubjectInfo {
    pub name: String,
    pub age: u32,
    pub condition: Option<String>,
}

impl SubjectInfo {
    pub fn new(name: impl Into<String>, age: u32) -> Self {
        Self {
            name: name.into(),
            age,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.name.trim().is_empty() {
            return Err(ClientError::Validation(
                "subject name must not be empty".to_string(),
            ));
        }
        if self.age == 0 {
            return Err(ClientError::Validation(
                "subject age must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state as surfaced to the dashboard. `Idle` means no session
/// has been started yet (or the last one was cleared by a new start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Ended,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub subject_id: u64,
    pub state: SessionState,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
}

pub struct SessionController {
    api: ApiClient,
    conn: ConnectionHandle,
    stream: Arc<RwLock<PredictionStream>>,
    current: Option<Session>,
}

impl SessionController {
    pub fn new(
        api: ApiClient,
        conn: ConnectionHandle,
        stream: Arc<RwLock<PredictionStream>>,
    ) -> Self {
        Self {
            api,
            conn,
            stream,
            current: None,
        }
    }

    /// The current session, active or ended. Kept until the next start so
    /// statistics stay queryable after stop.
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Lifecycle state: `Idle` until the first start, then the current
    /// session's state.
    pub fn state(&self) -> SessionState {
        self.current
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn predictions(&self) -> Arc<RwLock<PredictionStream>> {
        Arc::clone(&self.stream)
    }

    /// Create the subject, create the session bound to it, then open the
    /// stream, in that order, aborting cleanly at the first failure.
    ///
    /// Validation failures and a still-active session are rejected before
    /// anything is sent. A failed session-create after a successful
    /// subject-create leaves no stream subscription behind.
    pub async fn start_session(&mut self, subject: SubjectInfo) -> Result<&Session, ClientError> {
        subject.validate()?;
        if matches!(
            self.current,
            Some(Session {
                state: SessionState::Active,
                ..
            })
        ) {
            return Err(ClientError::Validation(
                "a session is already active".to_string(),
            ));
        }

        let request = Request::CreateSubject {
            name: subject.name.trim().to_string(),
            age: subject.age,
            condition: subject.condition.clone(),
        };
        let subject_id = match self.api.call(&request).await? {
            Response::SubjectCreated { user_id } => user_id,
            other => return Err(unexpected(other)),
        };

        let session_id = match self
            .api
            .call(&Request::StartSession {
                user_id: subject_id,
            })
            .await?
        {
            Response::SessionStarted { session_id, .. } => session_id,
            other => return Err(unexpected(other)),
        };

        // Both calls succeeded: rebind the buffer, then subscribe.
        self.stream.write().await.begin_session(session_id);
        self.conn.start_stream(session_id);
        info!(session_id, subject_id, "session started");

        Ok(self.current.insert(Session {
            id: session_id,
            subject_id,
            state: SessionState::Active,
            started_at: SystemTime::now(),
            ended_at: None,
        }))
    }

    /// End the active session. Idempotent: with nothing active this is a
    /// local no-op with no network side effects.
    ///
    /// The stream subscription (and any in-flight reconnect for it) is
    /// cancelled and the session marked Ended regardless of whether the
    /// backend acknowledges; a failed acknowledgement is returned as a
    /// warning.
    pub async fn stop_session(&mut self) -> StopOutcome {
        let session_id = match &self.current {
            Some(s) if s.state == SessionState::Active => s.id,
            _ => return StopOutcome::NotActive,
        };

        // Cancel first so a reconnect in flight cannot outlive the stop.
        self.conn.stop_stream(session_id);

        let warning = match self.api.call(&Request::EndSession { session_id }).await {
            Ok(_) => None,
            Err(e) => {
                warn!(session_id, error = %e, "end-session not acknowledged; stopped locally");
                Some(e)
            }
        };

        if let Some(session) = self.current.as_mut() {
            session.state = SessionState::Ended;
            session.ended_at = Some(SystemTime::now());
        }
        info!(session_id, "session stopped");
        StopOutcome::Stopped { warning }
    }

    /// Backend-computed statistics for the current session. Never derived
    /// client-side.
    pub async fn session_stats(&self) -> Result<SessionStats, ClientError> {
        let Some(session) = &self.current else {
            return Err(ClientError::Validation(
                "no session to query statistics for".to_string(),
            ));
        };
        match self
            .api
            .call(&Request::SessionStats {
                session_id: session.id,
            })
            .await?
        {
            Response::SessionStats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Backend(format!("unexpected response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionManager};

    fn controller_with_dead_backend() -> SessionController {
        // Bogus endpoint: any network attempt would surface as Transport.
        let cfg = ConnectionConfig::new("127.0.0.1:1");
        let stream = Arc::new(RwLock::new(PredictionStream::new()));
        let conn = ConnectionManager::spawn(cfg.clone(), Arc::clone(&stream));
        let api = ApiClient::new(cfg.endpoint, std::time::Duration::from_millis(200));
        SessionController::new(api, conn, stream)
    }

    #[tokio::test]
    async fn empty_name_fails_before_any_network_call() {
        let mut ctl = controller_with_dead_backend();
        let err = ctl.start_session(SubjectInfo::new("", 25)).await;
        // A Transport error here would mean a request went out.
        assert!(matches!(err, Err(ClientError::Validation(_))));
        assert!(ctl.current().is_none());
    }

    #[tokio::test]
    async fn zero_age_fails_before_any_network_call() {
        let mut ctl = controller_with_dead_backend();
        let err = ctl.start_session(SubjectInfo::new("S01", 0)).await;
        assert!(matches!(err, Err(ClientError::Validation(_))));
        assert!(ctl.current().is_none());
    }

    #[tokio::test]
    async fn whitespace_name_is_rejected() {
        let mut ctl = controller_with_dead_backend();
        let err = ctl.start_session(SubjectInfo::new("   ", 40)).await;
        assert!(matches!(err, Err(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn backend_failure_leaves_no_partial_state() {
        let mut ctl = controller_with_dead_backend();
        let err = ctl.start_session(SubjectInfo::new("S01", 25)).await;
        assert!(matches!(err, Err(ClientError::Transport(_))));
        assert!(ctl.current().is_none());
        assert!(ctl.predictions().read().await.session().is_none());
    }

    #[tokio::test]
    async fn stop_without_active_session_is_a_local_no_op() {
        let mut ctl = controller_with_dead_backend();
        assert_eq!(ctl.state(), SessionState::Idle);
        // Would return a Transport warning if it had tried the network.
        assert!(matches!(ctl.stop_session().await, StopOutcome::NotActive));
        assert_eq!(ctl.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stats_without_session_is_a_validation_error() {
        let ctl = controller_with_dead_backend();
        assert!(matches!(
            ctl.session_stats().await,
            Err(ClientError::Validation(_))
        ));
    }
}
