use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, ValueEnum};
use serde::Serialize;

use httptap::capture::EngineKind;
use httptap::listener::{Listener, ListenerConfig, OverflowPolicy};
use httptap::message::TcpMessage;
use httptap::observability;
use httptap::protocol;

#[derive(Parser, Debug)]
#[command(name = "httptap", version, about = "httptap – passive HTTP traffic reassembly")]
struct Cli {
    /// Pcap capture file to replay through the listener
    #[arg(long)]
    input: PathBuf,

    /// Address the monitored service is reachable at
    #[arg(long, default_value = "0.0.0.0")]
    addr: String,

    /// Monitored service port
    #[arg(long, default_value_t = 80)]
    port: u16,

    /// Capture engine
    #[arg(long, value_enum, default_value = "pcap")]
    engine: EngineArg,

    /// Unfinished messages are emitted after this many milliseconds
    #[arg(long, default_value_t = 2000)]
    expiry_ms: u64,

    /// When the consumer lags, block packet intake or drop the oldest
    /// pending message
    #[arg(long, value_enum, default_value = "block")]
    overflow: OverflowArg,

    /// Output format for emitted messages
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Log one event per emitted message
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Pcap,
    RawSocket,
    AfPacket,
}

impl From<EngineArg> for EngineKind {
    fn from(value: EngineArg) -> Self {
        match value {
            EngineArg::Pcap => EngineKind::Pcap,
            EngineArg::RawSocket => EngineKind::RawSocket,
            EngineArg::AfPacket => EngineKind::AfPacket,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OverflowArg {
    Block,
    DropOldest,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// One emitted message as written to stdout in `--format json` mode.
#[derive(Serialize)]
struct MessageRecord {
    uuid: String,
    incoming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_ack: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    timestamp_us: u64,
    size: usize,
    payload: String,
}

impl MessageRecord {
    fn from_message(message: &TcpMessage) -> Self {
        let payload = message.bytes();
        let (method, path, status) = if message.is_incoming {
            (
                Some(String::from_utf8_lossy(protocol::method(&payload)).into_owned()),
                Some(String::from_utf8_lossy(protocol::path(&payload)).into_owned()),
                None,
            )
        } else {
            (
                None,
                None,
                Some(String::from_utf8_lossy(protocol::status(&payload)).into_owned()),
            )
        };
        Self {
            uuid: message.uuid().to_string(),
            incoming: message.is_incoming,
            request_ack: message.request_ack,
            method,
            path,
            status,
            timestamp_us: message.timestamp_us(),
            size: message.size(),
            payload: base64::engine::general_purpose::STANDARD.encode(&payload),
        }
    }
}

fn write_record(out: &mut impl Write, message: &TcpMessage, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let record = MessageRecord::from_message(message);
            serde_json::to_writer(&mut *out, &record)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            let payload = message.bytes();
            let summary = if message.is_incoming {
                format!(
                    "req  {} {} {}",
                    message.uuid(),
                    String::from_utf8_lossy(protocol::method(&payload)),
                    String::from_utf8_lossy(protocol::path(&payload)),
                )
            } else {
                format!(
                    "resp {} {}",
                    message.uuid(),
                    String::from_utf8_lossy(protocol::status(&payload)),
                )
            };
            writeln!(out, "{summary} ({} bytes)", message.size())?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing(cli.verbose);

    let expiry = Duration::from_millis(cli.expiry_ms);
    let config = ListenerConfig {
        addr: cli.addr.clone(),
        port: cli.port,
        engine: cli.engine.into(),
        expiry,
        overflow: match cli.overflow {
            OverflowArg::Block => OverflowPolicy::Block,
            OverflowArg::DropOldest => OverflowPolicy::DropOldest,
        },
        input: Some(cli.input.clone()),
    };

    let mut listener = Listener::open(config)?;
    let mut messages = listener
        .take_messages()
        .context("outbound channel already taken")?;

    let format = cli.format;
    let printer = tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(message) = messages.recv().await {
            let mut out = std::io::stdout().lock();
            if let Err(err) = write_record(&mut out, &message, format) {
                tracing::error!(error = %err, "failed to write record");
                break;
            }
            written += 1;
        }
        written
    });

    // Let the sweep flush messages without a decidable termination before
    // shutting down.
    listener.wait_engine().await?;
    tokio::time::sleep(expiry + Duration::from_millis(50)).await;
    listener.close().await?;

    let written = printer.await.context("printer task panicked")?;
    let stats = listener.stats();
    tracing::info!(
        written,
        received = stats
            .received_packets
            .load(std::sync::atomic::Ordering::Relaxed),
        dropped = stats
            .dropped_packets
            .load(std::sync::atomic::Ordering::Relaxed),
        "replay complete"
    );
    Ok(())
}
