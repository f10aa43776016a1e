//! Capture engines: the packet sources feeding the listener.
//!
//! An engine is an abstract capability with `start`, `next_packet` and
//! `close`; the listener never branches on the concrete kind. This crate
//! links one concrete engine, [`PcapFileEngine`], which replays a capture
//! file. The `raw_socket` and `af_packet` kinds name live privileged
//! backends that run out of process and hand packets over the listener's
//! inbound channel.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::message::TcpPacket;

pub mod decode;
pub mod pcap_file;

pub use pcap_file::PcapFileEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Pcap,
    RawSocket,
    AfPacket,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Pcap => "pcap",
            EngineKind::RawSocket => "raw_socket",
            EngineKind::AfPacket => "af_packet",
        };
        f.write_str(name)
    }
}

/// A push source of decoded TCP segments for one monitored port.
#[async_trait]
pub trait CaptureEngine: Send {
    fn name(&self) -> &'static str;

    /// Acquire the underlying source. Called once before the first
    /// `next_packet`.
    async fn start(&mut self) -> Result<()>;

    /// Next decoded segment, or `None` once the source is exhausted.
    /// Errors are fatal for the listener.
    async fn next_packet(&mut self) -> Result<Option<TcpPacket>>;

    /// Release the underlying source.
    async fn close(&mut self) -> Result<()>;
}

/// Construct the engine named by `kind`.
pub fn open_engine(
    kind: EngineKind,
    addr: &str,
    port: u16,
    input: Option<&Path>,
) -> Result<Box<dyn CaptureEngine>> {
    match kind {
        EngineKind::Pcap => {
            let path = input.context("the pcap engine requires a capture file path")?;
            Ok(Box::new(PcapFileEngine::new(path, port)?))
        }
        EngineKind::RawSocket | EngineKind::AfPacket => {
            bail!(
                "the {kind} engine for {addr}:{port} is a privileged external capture \
                 backend and is not linked into this build; feed its packets through \
                 the listener's inbound channel instead"
            )
        }
    }
}
