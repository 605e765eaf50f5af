use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use duplexrs_pipe::pipe::DEFAULT_PIPE_CAPACITY;

use crate::channel::ChannelFactory;
use crate::monitor::MonitorConfig;
use crate::session::SessionHook;
use crate::session_id::SessionId;
use crate::session_registry::SessionRegistry;

/// Request header carrying the opaque id that correlates the two legs.
pub const SESSION_HEADER: &str = "Session";

/// The slice of an HTTP request this core needs: the path and the headers.
/// The surrounding HTTP layer owns everything else.
pub struct RequestMeta {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.header(SESSION_HEADER)?.parse().ok()
    }
}

/// Status and headers handed back to the HTTP layer before the body streams.
#[derive(Debug, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Applied to every session's channel; narrows what the peer may invoke.
    pub restricted: bool,

    /// How long an upload leg may wait for its download leg to register the
    /// session before failing.
    pub upload_wait: Duration,

    pub monitor: MonitorConfig,
    pub pipe_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            restricted: false,
            upload_wait: Duration::from_secs(5),
            monitor: MonitorConfig::default(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Ties the session registry, the channel factory and the application hook
/// together behind the two operations the HTTP layer dispatches to.
pub struct DuplexChannelService {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ChannelFactory>,
    hook: Arc<dyn SessionHook>,
    config: ServiceConfig,
}

impl DuplexChannelService {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        hook: Arc<dyn SessionHook>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(
                config.monitor.clone(),
                config.pipe_capacity,
            )),
            factory,
            hook,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The server->client exchange. Creates the session, then blocks for its
    /// entire lifetime while the channel streams into `sink`; the response
    /// has no length known up front, hence the chunked marker.
    pub async fn handle_download<W>(
        &self,
        meta: &RequestMeta,
        head: &mut ResponseHead,
        sink: W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session_id = match meta.session_id() {
            Some(session_id) => session_id,
            None => return Err(anyhow::Error::msg("request carries no session id")),
        };

        head.set_status(200);
        head.add_header("Transfer-Encoding", "chunked");

        let session = self.registry.register(session_id, self.config.restricted)?;

        let result = session
            .download(self.factory.as_ref(), self.hook.as_ref(), sink)
            .await;

        // the session is gone once its download leg has returned
        if let Err(error) = self.registry.end_session(&session) {
            log::error!(
                target: "duplexrs_networking::service::handle_download",
                "failed to unregister session {}: {}",
                session_id, error
            );
        }

        result
    }

    /// The client->server exchange: feeds the request body into the session
    /// registered under the same id. Errors here are local to this exchange;
    /// they never tear the session down by themselves.
    pub async fn handle_upload<R>(
        &self,
        meta: &RequestMeta,
        head: &mut ResponseHead,
        body: R,
    ) -> anyhow::Result<u64>
    where
        R: AsyncRead + Send + Unpin,
    {
        let session_id = match meta.session_id() {
            Some(session_id) => session_id,
            None => return Err(anyhow::Error::msg("request carries no session id")),
        };

        let session = self
            .registry
            .wait_for_session(session_id, self.config.upload_wait)
            .await?;

        head.set_status(200);

        session.upload(body).await
    }
}
