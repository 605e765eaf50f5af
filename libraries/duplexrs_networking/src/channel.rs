use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use duplexrs_pipe::pipe::PipeReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Binary,
    Text,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe was not acknowledged in time")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to construct channel '{name}': {reason}")]
pub struct ChannelConstructionError {
    pub name: String,
    pub reason: String,
}

pub struct ChannelOptions {
    pub name: String,
    pub mode: ChannelMode,

    /// Limits the capability set the channel exposes to the peer.
    pub restricted: bool,
}

/// The bidirectional messaging abstraction the session is built for. Its wire
/// framing is opaque here; the session only relies on the operations below,
/// plus one behavior: end-of-stream or an error on the inbound side makes the
/// channel wind itself down.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Sends a lightweight probe to the peer and waits for its
    /// acknowledgement.
    async fn probe(&self, timeout: Duration) -> Result<(), ProbeError>;

    /// Blocks until the channel has fully terminated.
    async fn join(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(
        &self,
        options: ChannelOptions,
        inbound: PipeReader,
        outbound: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Arc<dyn Channel>, ChannelConstructionError>;
}
