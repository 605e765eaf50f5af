use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use duplexrs_pipe::pipe::PipeReader;

use crate::channel::{
    Channel, ChannelConstructionError, ChannelFactory, ChannelMode, ChannelOptions, ProbeError,
};

const DRAIN_BUFFER_SIZE: usize = 8192;

/// How a mock channel answers liveness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDisposition {
    Ack,
    Silence,
    TransportFailure,
}

/// Scriptable stand-in for a real channel adapter. It drains the pipe's read
/// end into an inspectable buffer (optionally echoing everything back out on
/// the response sink) and terminates when that read end reaches end-of-stream,
/// which is exactly the abort contract the session relies on.
pub struct MockChannelFactory {
    echo: bool,
    fail_connect: bool,
    probe_disposition: ProbeDisposition,

    channels: RwLock<Vec<Arc<MockChannel>>>,
}

impl MockChannelFactory {
    pub fn new() -> Self {
        Self {
            echo: false,
            fail_connect: false,
            probe_disposition: ProbeDisposition::Ack,
            channels: Vec::new().into(),
        }
    }

    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn with_probe_disposition(mut self, disposition: ProbeDisposition) -> Self {
        self.probe_disposition = disposition;
        self
    }

    pub async fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.read().await.clone()
    }

    pub async fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.channels.read().await.last().cloned()
    }
}

impl Default for MockChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn connect(
        &self,
        options: ChannelOptions,
        inbound: PipeReader,
        outbound: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Arc<dyn Channel>, ChannelConstructionError> {
        if self.fail_connect {
            return Err(ChannelConstructionError {
                name: options.name,
                reason: "connect failure was scripted".to_string(),
            });
        }

        let channel =
            MockChannel::start(options, inbound, outbound, self.echo, self.probe_disposition)
                .await;

        self.channels.write().await.push(channel.clone());

        Ok(channel)
    }
}

pub struct MockChannel {
    name: String,
    mode: ChannelMode,
    restricted: bool,

    probe_disposition: std::sync::Mutex<ProbeDisposition>,
    probes_seen: AtomicU32,

    received: RwLock<Vec<u8>>,
    terminated: watch::Sender<bool>,

    drain_task: RwLock<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl MockChannel {
    async fn start(
        options: ChannelOptions,
        inbound: PipeReader,
        outbound: Box<dyn AsyncWrite + Send + Unpin>,
        echo: bool,
        probe_disposition: ProbeDisposition,
    ) -> Arc<Self> {
        let (terminated, _) = watch::channel(false);

        let channel = Arc::new(Self {
            name: options.name,
            mode: options.mode,
            restricted: options.restricted,
            probe_disposition: std::sync::Mutex::new(probe_disposition),
            probes_seen: AtomicU32::new(0),
            received: Vec::new().into(),
            terminated,
            drain_task: None.into(),
        });

        let drain_task = {
            let channel_clone = channel.clone();

            tokio::spawn(async move {
                let result = channel_clone.drain_inbound(inbound, outbound, echo).await;
                channel_clone.terminated.send_replace(true);
                result
            })
        };

        *channel.drain_task.write().await = Some(drain_task);

        channel
    }

    async fn drain_inbound(
        &self,
        mut inbound: PipeReader,
        mut outbound: Box<dyn AsyncWrite + Send + Unpin>,
        echo: bool,
    ) -> anyhow::Result<()> {
        let mut buffer = vec![0_u8; DRAIN_BUFFER_SIZE];

        loop {
            let read = inbound.read(&mut buffer).await?;

            if read == 0 {
                info!(
                    target: "duplexrs_networking::mock_channel",
                    "inbound stream for '{}' reached end of stream",
                    self.name
                );

                return Ok(());
            }

            self.received.write().await.extend_from_slice(&buffer[..read]);

            if echo {
                outbound.write_all(&buffer[..read]).await?;
                outbound.flush().await?;
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn set_probe_disposition(&self, disposition: ProbeDisposition) {
        if let Ok(mut current) = self.probe_disposition.lock() {
            *current = disposition;
        }
    }

    pub fn probes_seen(&self) -> u32 {
        self.probes_seen.load(Ordering::Acquire)
    }

    pub async fn received(&self) -> Vec<u8> {
        self.received.read().await.clone()
    }

    /// Non-blocking snapshot of the drained bytes, for polling loops in
    /// synchronous test closures.
    pub fn try_received(&self) -> Option<Vec<u8>> {
        self.received.try_read().ok().map(|received| received.clone())
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    pub async fn is_draining(&self) -> bool {
        self.drain_task
            .read()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn probe(&self, _timeout: Duration) -> Result<(), ProbeError> {
        self.probes_seen.fetch_add(1, Ordering::AcqRel);

        let disposition = match self.probe_disposition.lock() {
            Ok(disposition) => *disposition,
            Err(err) => return Err(ProbeError::Transport(err.to_string())),
        };

        match disposition {
            ProbeDisposition::Ack => Ok(()),
            ProbeDisposition::Silence => Err(ProbeError::Timeout),
            ProbeDisposition::TransportFailure => {
                Err(ProbeError::Transport("scripted transport failure".to_string()))
            }
        }
    }

    async fn join(&self) -> anyhow::Result<()> {
        let mut terminated = self.terminated.subscribe();

        while !*terminated.borrow_and_update() {
            terminated.changed().await?;
        }

        Ok(())
    }
}
