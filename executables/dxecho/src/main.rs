use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use duplexrs_networking::channel::Channel;
use duplexrs_networking::mock_channel::MockChannelFactory;
use duplexrs_networking::monitor::MonitorConfig;
use duplexrs_networking::service::{
    DuplexChannelService, RequestMeta, ResponseHead, ServiceConfig, SESSION_HEADER,
};
use duplexrs_networking::session::SessionHook;
use duplexrs_networking::session_id::SessionId;

/// Drives one complete duplex session in-process: a download exchange that
/// blocks for the session's lifetime, an upload exchange carrying the
/// payload, and an echo channel bridging the two.
#[derive(Parser)]
#[command(name = "dxecho", version, author)]
#[command(about = "Echoes a payload through a full-duplex HTTP-style session", long_about = None)]
pub struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase verbosity")]
    verbose: u8,

    #[arg(
        short,
        long,
        default_value = "hello, duplex world",
        help = "Payload to push through the session"
    )]
    payload: String,

    #[arg(
        long,
        value_name = "MILLIS",
        default_value_t = 250,
        help = "Liveness probe interval"
    )]
    probe_interval_ms: u64,
}

struct EchoHook;

#[async_trait::async_trait]
impl SessionHook for EchoHook {
    async fn run(&self, _channel: Arc<dyn Channel>) -> anyhow::Result<()> {
        log::info!(target: "dxecho", "duplex channel is up");
        Ok(())
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let factory = Arc::new(MockChannelFactory::new().with_echo());

    let config = ServiceConfig {
        monitor: MonitorConfig {
            interval: Duration::from_millis(cli.probe_interval_ms.max(1)),
            ..MonitorConfig::default()
        },
        ..ServiceConfig::default()
    };

    let service = Arc::new(DuplexChannelService::new(
        factory.clone(),
        Arc::new(EchoHook),
        config,
    ));

    let session_id = SessionId::generate();
    let (sink, mut client_view) = tokio::io::duplex(64 * 1024);

    // the download exchange blocks until the session ends, so it gets its
    // own task while this one plays the client
    let download_task = {
        let service = service.clone();
        let meta = RequestMeta::new("/duplex/download")
            .with_header(SESSION_HEADER, session_id.to_string());

        tokio::spawn(async move {
            let mut head = ResponseHead::new();
            let result = service.handle_download(&meta, &mut head, sink).await;
            (head, result)
        })
    };

    let payload = cli.payload.into_bytes();

    let upload_meta =
        RequestMeta::new("/duplex/upload").with_header(SESSION_HEADER, session_id.to_string());
    let mut upload_head = ResponseHead::new();
    let copied = service
        .handle_upload(&upload_meta, &mut upload_head, payload.as_slice())
        .await
        .context("upload leg failed")?;

    log::info!(target: "dxecho", "upload leg delivered {} bytes", copied);

    let mut echoed = vec![0_u8; payload.len()];
    tokio::io::AsyncReadExt::read_exact(&mut client_view, &mut echoed)
        .await
        .context("reading the echoed payload")?;

    println!("{}", String::from_utf8_lossy(&echoed));

    // hang up: closing the pipe terminates the channel and releases the
    // blocked download exchange
    match service.registry().get_session(session_id) {
        Some(session) => {
            session.abort();
        }
        None => return Err(anyhow::Error::msg("session disappeared before teardown")),
    }

    let (download_head, download_result) = download_task.await?;
    download_result.context("download leg failed")?;

    anyhow::ensure!(
        download_head.status == 200,
        "unexpected download status {}",
        download_head.status
    );

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    run(cli).await.context("run failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(vec!["dxecho"]);

        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.payload, "hello, duplex world");
        assert_eq!(cli.probe_interval_ms, 250);
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(vec![
            "dxecho",
            "-vv",
            "--payload",
            "ping",
            "--probe-interval-ms",
            "50",
        ]);

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.payload, "ping");
        assert_eq!(cli.probe_interval_ms, 50);
    }

    #[test(tokio::test)]
    async fn echoes_the_payload_end_to_end() -> anyhow::Result<()> {
        let cli = Cli::parse_from(vec!["dxecho", "--payload", "ping", "--probe-interval-ms", "50"]);

        run(cli).await?;

        Ok(())
    }
}
