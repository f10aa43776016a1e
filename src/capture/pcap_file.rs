//! Capture engine replaying a legacy pcap file.
//!
//! Reads the file with the `pcap-parser` crate, decodes each frame and
//! yields the TCP segments involving the monitored port in capture order.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

use super::decode;
use super::CaptureEngine;
use crate::message::TcpPacket;

pub struct PcapFileEngine {
    path: PathBuf,
    port: u16,
    reader: Option<LegacyPcapReader<BufReader<File>>>,
}

impl PcapFileEngine {
    pub fn new(path: impl AsRef<Path>, port: u16) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::metadata(&path)
            .with_context(|| format!("pcap file not found: {}", path.display()))?;
        Ok(Self {
            path,
            port,
            reader: None,
        })
    }
}

#[async_trait]
impl CaptureEngine for PcapFileEngine {
    fn name(&self) -> &'static str {
        "pcap"
    }

    async fn start(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open pcap: {}", self.path.display()))?;
        let buf = BufReader::with_capacity(256 * 1024, file);
        let reader = LegacyPcapReader::new(65536, buf)
            .map_err(|e| anyhow!("failed to create pcap reader: {e:?}"))?;
        self.reader = Some(reader);
        Ok(())
    }

    async fn next_packet(&mut self) -> Result<Option<TcpPacket>> {
        let Some(reader) = self.reader.as_mut() else {
            bail!("pcap engine not started");
        };
        let mut stalled = false;
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    stalled = false;
                    let decoded = match block {
                        PcapBlockOwned::Legacy(pkt) => {
                            let ts_us = (pkt.ts_sec as u64) * 1_000_000 + pkt.ts_usec as u64;
                            decode::decode_frame(pkt.data, self.port, ts_us)
                        }
                        // File header and any non-legacy block.
                        _ => None,
                    };
                    reader.consume(offset);
                    if let Some(packet) = decoded {
                        return Ok(Some(packet));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    if stalled {
                        // Truncated capture; treat as end of file.
                        return Ok(None);
                    }
                    stalled = true;
                    reader
                        .refill()
                        .map_err(|e| anyhow!("pcap refill failed: {e:?}"))?;
                }
                Err(e) => return Err(anyhow!("pcap read error: {e:?}")),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
