/// Common fixtures for listener integration tests.
use std::time::Duration;

use httptap::listener::{Listener, ListenerConfig};
use httptap::message::{TcpMessage, TcpPacket};

/// Build a packet for a listener monitoring port 0: requests are destined
/// for the monitored port (peer source port 1), responses originate from
/// it (peer destination port 1).
pub fn build_packet(is_incoming: bool, ack: u32, seq: u32, data: &[u8]) -> TcpPacket {
    build_packet_for("", is_incoming, ack, seq, data)
}

/// Same as [`build_packet`] with an explicit peer address, for scenarios
/// spanning multiple connections.
pub fn build_packet_for(
    addr: &str,
    is_incoming: bool,
    ack: u32,
    seq: u32,
    data: &[u8],
) -> TcpPacket {
    let (src_port, dst_port) = if is_incoming { (1, 0) } else { (0, 1) };
    TcpPacket {
        addr: addr.to_string(),
        src_port,
        dst_port,
        seq,
        ack,
        data: data.to_vec(),
        timestamp_us: 0,
    }
}

pub fn test_listener(expiry_ms: u64) -> Listener {
    Listener::new(ListenerConfig {
        port: 0,
        expiry: Duration::from_millis(expiry_ms),
        ..ListenerConfig::default()
    })
}

/// Receive exactly `count` messages before the deadline.
pub async fn collect_messages(
    listener: &mut Listener,
    count: usize,
    deadline_ms: u64,
) -> Vec<TcpMessage> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    let mut messages = Vec::with_capacity(count);
    while messages.len() < count {
        let message = tokio::time::timeout_at(deadline, listener.recv())
            .await
            .expect("timed out waiting for reassembled messages")
            .expect("listener channel closed early");
        messages.push(message);
    }
    messages
}

/// Split collected messages into (requests, responses).
pub fn split_by_direction(messages: Vec<TcpMessage>) -> (Vec<TcpMessage>, Vec<TcpMessage>) {
    messages.into_iter().partition(|m| m.is_incoming)
}
