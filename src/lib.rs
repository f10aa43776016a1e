//! httptap — passive TCP → HTTP/1.x message reassembly.
//!
//! The core of a traffic capture/replay tool: it ingests decoded TCP
//! segments for one monitored port and emits fully reassembled HTTP
//! request and response messages, each request/response pair correlated
//! by a shared UUID.
//!
//! ## Architecture
//!
//! ```text
//! capture engine → packet channel → Listener → message channel → consumer
//! ```
//!
//! - **capture:** packet sources (pcap file engine, frame decoding)
//! - **message:** per-message segment accumulator and completion rules
//! - **listener:** direction classification, request/response association,
//!   expiry sweep, dispatch loop
//! - **protocol:** pure HTTP/1.x byte helpers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use httptap::listener::{Listener, ListenerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ListenerConfig {
//!     port: 80,
//!     input: Some("capture.pcap".into()),
//!     ..ListenerConfig::default()
//! };
//! let mut listener = Listener::open(config)?;
//! while let Some(message) = listener.recv().await {
//!     println!("{} {} bytes", message.uuid(), message.size());
//! }
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod listener;
pub mod message;
pub mod observability;
pub mod protocol;
