use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use duplexrs_pipe::pipe::DEFAULT_PIPE_CAPACITY;

use crate::monitor::MonitorConfig;
use crate::session::DuplexSession;
use crate::session_id::SessionId;

#[derive(Debug, thiserror::Error)]
#[error("no duplex session registered for id {0}")]
pub struct SessionNotFoundError(pub SessionId);

#[derive(Debug, thiserror::Error)]
#[error("a duplex session already exists for id {0}")]
pub struct DuplicateSessionError(pub SessionId);

/// Maps session ids to live sessions. The two HTTP legs of one session are
/// genuinely separate network exchanges that may land on different
/// connections and workers; this map is their rendezvous point.
pub struct SessionRegistry
{
    sessions: std::sync::Mutex<HashMap<SessionId, Arc<DuplexSession>>>,
    registered: Notify,

    monitor_config: MonitorConfig,
    pipe_capacity: usize,
}

impl SessionRegistry
{
    pub fn new(monitor_config: MonitorConfig, pipe_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new().into(),
            registered: Notify::new(),
            monitor_config,
            pipe_capacity,
        }
    }

    /// Registers a session under an id presented by the peer. The download
    /// leg calls this; a second registration for a live id fails rather than
    /// replacing the session.
    pub fn register(
        &self,
        session_id: SessionId,
        restricted: bool,
    ) -> anyhow::Result<Arc<DuplexSession>> {
        let session = match self.sessions.lock() {
            Ok(mut sessions) => {
                if sessions.contains_key(&session_id) {
                    return Err(DuplicateSessionError(session_id).into());
                }

                let session = Arc::new(DuplexSession::new(
                    session_id,
                    restricted,
                    self.monitor_config.clone(),
                    self.pipe_capacity,
                ));
                sessions.insert(session_id, session.clone());
                session
            }

            Err(err) => return Err(anyhow::Error::msg(err.to_string())),
        };

        log::info!(
            target: "duplexrs_networking::session_registry",
            "registered duplex session {}",
            session_id
        );

        self.registered.notify_waiters();

        Ok(session)
    }

    /// Mints a fresh id and registers a session under it, regenerating on
    /// the off chance the id is already taken.
    pub fn create_session(&self, restricted: bool) -> anyhow::Result<Arc<DuplexSession>> {
        let session = match self.sessions.lock() {
            Ok(mut sessions) => {
                let mut session_id = SessionId::generate();

                while sessions.contains_key(&session_id) {
                    session_id = SessionId::generate();
                }

                let session = Arc::new(DuplexSession::new(
                    session_id,
                    restricted,
                    self.monitor_config.clone(),
                    self.pipe_capacity,
                ));
                sessions.insert(session_id, session.clone());
                session
            }

            Err(err) => return Err(anyhow::Error::msg(err.to_string())),
        };

        self.registered.notify_waiters();

        Ok(session)
    }

    pub fn get_session(&self, session_id: SessionId) -> Option<Arc<DuplexSession>> {
        match self.sessions.lock() {
            Ok(sessions) => sessions.get(&session_id).cloned(),
            Err(_) => None,
        }
    }

    /// Bounded rendezvous for an upload leg that may have raced ahead of its
    /// download leg. Waits for the session to appear until the deadline,
    /// then fails with `SessionNotFoundError`; it never blocks indefinitely.
    pub async fn wait_for_session(
        &self,
        session_id: SessionId,
        wait: Duration,
    ) -> anyhow::Result<Arc<DuplexSession>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let mut registered = std::pin::pin!(self.registered.notified());
            registered.as_mut().enable();

            if let Some(session) = self.get_session(session_id) {
                return Ok(session);
            }

            if tokio::time::timeout_at(deadline, registered).await.is_err() {
                return Err(SessionNotFoundError(session_id).into());
            }
        }
    }

    pub fn end_session(&self, session: &Arc<DuplexSession>) -> anyhow::Result<()> {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                if sessions.remove(&session.session_id()).is_some() {
                    log::info!(
                        target: "duplexrs_networking::session_registry",
                        "unregistered duplex session {}",
                        session.session_id()
                    );
                }

                Ok(())
            }

            Err(err) => Err(anyhow::Error::msg(err.to_string())),
        }
    }

    pub fn shutdown_all(&self) -> anyhow::Result<()> {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                for session in sessions.values() {
                    session.abort();
                }

                sessions.clear();

                Ok(())
            }

            Err(err) => Err(anyhow::Error::msg(err.to_string())),
        }
    }

    pub fn session_count(&self) -> usize {
        match self.sessions.lock() {
            Ok(sessions) => sessions.len(),
            Err(_) => 0,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(MonitorConfig::default(), DEFAULT_PIPE_CAPACITY)
    }
}
