use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Mutex, RwLock};

use duplexrs_pipe::pipe::{pipe, PipeCloser, PipeReader, PipeWriter};

use crate::channel::{Channel, ChannelFactory, ChannelMode, ChannelOptions};
use crate::monitor::{LivenessMonitor, MonitorConfig};
use crate::session_id::SessionId;

const UPLOAD_BUFFER_SIZE: usize = 8192;

/// Application entry point for an established duplex session. The download
/// leg keeps blocking after `run` returns, until the channel itself
/// terminates.
#[async_trait]
pub trait SessionHook: Send + Sync {
    async fn run(&self, channel: Arc<dyn Channel>) -> anyhow::Result<()>;
}

/// One full-duplex channel stitched together from two unidirectional HTTP
/// exchanges. The session owns the pipe bridging the upload leg to the
/// channel's inbound side; the channel is created once, on the download leg,
/// and never reassigned.
pub struct DuplexSession
{
    session_id: SessionId,
    restricted: bool,
    monitor_config: MonitorConfig,

    writer: Mutex<PipeWriter>,
    reader: Mutex<Option<PipeReader>>,
    closer: PipeCloser,

    channel: RwLock<Option<Arc<dyn Channel>>>,
}

impl std::fmt::Debug for DuplexSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSession")
            .field("session_id", &self.session_id)
            .field("restricted", &self.restricted)
            .finish_non_exhaustive()
    }
}

impl DuplexSession
{
    pub fn new(
        session_id: SessionId,
        restricted: bool,
        monitor_config: MonitorConfig,
        pipe_capacity: usize,
    ) -> Self {
        let (writer, reader, closer) = pipe(pipe_capacity);

        Self {
            session_id,
            restricted,
            monitor_config,
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            closer,
            channel: None.into(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Closes the pipe. The channel observes end-of-stream on its inbound
    /// side and winds itself down; that is the only cancellation path a
    /// session has.
    pub fn abort(&self) -> bool {
        self.closer.close()
    }

    /// The server->client half. Builds the channel over the pipe's read end
    /// and the response sink, starts liveness probing, runs the application
    /// hook, and then blocks until the channel has fully terminated. Callers
    /// must treat this as living for the whole session, not as a quick
    /// request handler.
    pub async fn download<W>(
        &self,
        factory: &dyn ChannelFactory,
        hook: &dyn SessionHook,
        sink: W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => {
                return Err(anyhow::Error::msg(
                    "download leg already ran for this session",
                ))
            }
        };

        let options = ChannelOptions {
            name: format!("HTTP full-duplex channel {}", self.session_id),
            mode: ChannelMode::Binary,
            restricted: self.restricted,
        };

        // a construction failure aborts here, before any monitor exists
        let channel = factory.connect(options, reader, Box::new(sink)).await?;

        *self.channel.write().await = Some(channel.clone());

        log::info!(
            target: "duplexrs_networking::session::download",
            "duplex session {} established its channel",
            self.session_id
        );

        let monitor = {
            let closer = self.closer.clone();
            let session_id = self.session_id;

            LivenessMonitor::start(channel.clone(), self.monitor_config.clone(), move || {
                log::info!(
                    target: "duplexrs_networking::session::download",
                    "duplex session {} lost its peer, tearing down",
                    session_id
                );

                closer.close();
            })
        };

        let result = match hook.run(channel.clone()).await {
            Ok(()) => channel.join().await,
            Err(error) => Err(error),
        };

        // cleanup is unconditional; a hook failure must not leave probes
        // running or the channel parked on a still-open pipe
        monitor.stop().await;
        self.closer.close();

        log::info!(
            target: "duplexrs_networking::session::download",
            "download leg for session {} finished",
            self.session_id
        );

        result
    }

    /// The client->server half: copies the request body into the pipe until
    /// the body is exhausted. Finishing normally does not close the pipe;
    /// closing authority stays with the monitor's dead-callback and the
    /// channel's own termination.
    pub async fn upload<R>(&self, body: R) -> anyhow::Result<u64>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut body = body;

        // one writer at a time; a concurrent upload for the same session
        // waits here rather than interleaving its bytes
        let mut writer = self.writer.lock().await;

        let mut buffer = vec![0_u8; UPLOAD_BUFFER_SIZE];
        let mut copied = 0_u64;

        loop {
            let read = body.read(&mut buffer).await?;

            if read == 0 {
                log::info!(
                    target: "duplexrs_networking::session::upload",
                    "upload leg for session {} delivered {} bytes",
                    self.session_id, copied
                );

                return Ok(copied);
            }

            writer.write(buffer[..read].to_vec()).await?;
            copied += read as u64;
        }
    }
}
