//! TCP packet record and HTTP message accumulator.
//!
//! A `TcpMessage` collects the segments of one logical HTTP/1.x message,
//! keeps them ordered by sequence number with 32-bit wraparound handling,
//! and decides when the message is complete. Completion rules differ for
//! requests and responses; a response is never complete until it has been
//! associated with the request it acknowledges.
//!
//! Reference: RFC 793 (TCP sequence space), RFC 7230 (message framing).

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::protocol;

/// Methods that never carry a request body.
const METHODS_WITHOUT_BODY: [&[u8]; 3] = [b"GET", b"OPTIONS", b"HEAD"];

/// Methods whose body length must be resolved before completion.
const METHODS_WITH_BODY: [&[u8]; 3] = [b"POST", b"PUT", b"PATCH"];

/// Literal closing a chunked transfer-encoded body.
const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// A decoded TCP segment as handed over by a capture engine.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    /// Peer IP as rendered by the capture engine; empty when unknown.
    pub addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// TCP payload. Packets with no payload are dropped by the listener.
    pub data: Vec<u8>,
    /// Capture timestamp in microseconds.
    pub timestamp_us: u64,
}

impl TcpPacket {
    /// Sequence number one past the payload, i.e. what the peer will ack.
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// Returns true when `a` is strictly before `b` in the TCP sequence space
/// (handles wrapping).
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_cmp(a: u32, b: u32) -> Ordering {
    if a == b {
        Ordering::Equal
    } else if seq_before(a, b) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Grouping key for the packets of one HTTP message. Requests carry the
/// monitored port as `dst_port`, responses the peer's port, so the two
/// key families never collide.
pub fn message_id(addr: &str, dst_port: u16, ack: u32) -> String {
    format!("{addr}{dst_port}{ack}")
}

/// Accumulator for one HTTP message.
#[derive(Debug, Clone)]
pub struct TcpMessage {
    id: String,
    pub is_incoming: bool,
    /// Sequence number of the first segment observed.
    pub start_seq: u32,
    /// The ack shared by this message's packets; identifies the reply
    /// direction.
    pub ack: u32,
    /// Set on responses once the matching request is known.
    pub request_ack: Option<u32>,
    packets: Vec<TcpPacket>,
    expiry: Duration,
    expire_at: Instant,
    uuid: Uuid,
}

impl TcpMessage {
    /// Empty accumulator expiring `expiry` from now. Requests derive their
    /// correlation UUID deterministically from the id; responses mint a
    /// fresh one that is replaced upon association.
    pub fn new(id: String, seq: u32, ack: u32, is_incoming: bool, expiry: Duration) -> Self {
        let uuid = if is_incoming {
            Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes())
        } else {
            Uuid::new_v4()
        };
        Self {
            id,
            is_incoming,
            start_seq: seq,
            ack,
            request_ack: None,
            packets: Vec::new(),
            expiry,
            expire_at: Instant::now() + expiry,
            uuid,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Correlation token shared by a request/response pair.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Capture timestamp of the earliest segment, microseconds.
    pub fn timestamp_us(&self) -> u64 {
        self.packets.first().map_or(0, |p| p.timestamp_us)
    }

    /// Peer address as reported by the capture engine; empty until the
    /// first segment is added.
    pub fn peer_addr(&self) -> &str {
        self.packets.first().map_or("", |p| p.addr.as_str())
    }

    pub fn packets(&self) -> &[TcpPacket] {
        &self.packets
    }

    /// Consume the accumulator, yielding its segments in sequence order.
    pub fn into_packets(self) -> Vec<TcpPacket> {
        self.packets
    }

    /// Inserts `packet` preserving ascending wrap-aware sequence order and
    /// refreshes the expiry deadline. A packet whose seq is already present
    /// is rejected; insertion is idempotent.
    pub fn add_packet(&mut self, packet: TcpPacket) -> bool {
        let idx = match self
            .packets
            .binary_search_by(|existing| seq_cmp(existing.seq, packet.seq))
        {
            Ok(_) => return false,
            Err(idx) => idx,
        };
        self.packets.insert(idx, packet);
        self.expire_at = Instant::now() + self.expiry;
        true
    }

    /// Adopt the paired request's identity. Unblocks `is_finished` for
    /// this response.
    pub fn associate(&mut self, request_ack: u32, request_uuid: Uuid) {
        self.request_ack = Some(request_ack);
        self.uuid = request_uuid;
    }

    /// Payloads concatenated in ascending sequence order.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for packet in &self.packets {
            out.extend_from_slice(&packet.data);
        }
        out
    }

    /// Total payload bytes across all segments.
    pub fn size(&self) -> usize {
        self.packets.iter().map(|p| p.data.len()).sum()
    }

    /// Payload bytes past the header block.
    pub fn body_size(&self) -> usize {
        let payload = self.bytes();
        payload.len() - protocol::header_length(&payload)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at <= now
    }

    /// Completion predicate. Messages that stay unfinished surface via the
    /// listener's expiry sweep instead.
    pub fn is_finished(&self) -> bool {
        let payload = self.bytes();
        if payload.is_empty() {
            return false;
        }
        if self.is_incoming {
            request_finished(&payload)
        } else {
            self.response_finished(&payload)
        }
    }

    fn response_finished(&self, payload: &[u8]) -> bool {
        // An unassociated response is never emitted on its own.
        if self.request_ack.is_none() {
            return false;
        }
        if !protocol::is_response(payload) {
            return false;
        }
        if is_chunked(payload) {
            // The chunk stream length is unknown up front; completion is
            // left to the expiry sweep.
            return false;
        }
        match protocol::header(payload, "Content-Length") {
            Some(raw) => match parse_length(raw) {
                Some(expected) => body_size_of(payload) == expected,
                None => false,
            },
            // Headers-only response such as `200 OK\r\n\r\n`.
            None => true,
        }
    }
}

fn request_finished(payload: &[u8]) -> bool {
    let method = protocol::method(payload);
    if METHODS_WITHOUT_BODY.contains(&method) {
        return true;
    }
    if !METHODS_WITH_BODY.contains(&method) {
        return false;
    }
    if is_chunked(payload) {
        return payload.ends_with(CHUNKED_TERMINATOR);
    }
    match protocol::header(payload, "Content-Length").and_then(parse_length) {
        Some(expected) => body_size_of(payload) == expected,
        None => false,
    }
}

fn is_chunked(payload: &[u8]) -> bool {
    protocol::header(payload, "Transfer-Encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case(b"chunked"))
}

fn parse_length(raw: &[u8]) -> Option<usize> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn body_size_of(payload: &[u8]) -> usize {
    payload.len() - protocol::header_length(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(is_incoming: bool, ack: u32, seq: u32, data: &[u8]) -> TcpPacket {
        // Monitored port 0: requests keep dst_port 0, responses src_port 0.
        let (src_port, dst_port) = if is_incoming { (1, 0) } else { (0, 1) };
        TcpPacket {
            addr: String::new(),
            src_port,
            dst_port,
            seq,
            ack,
            data: data.to_vec(),
            timestamp_us: 0,
        }
    }

    fn build_message(p: TcpPacket) -> TcpMessage {
        let id = message_id(&p.addr, p.dst_port, p.ack);
        let is_incoming = p.dst_port == 0;
        let mut msg = TcpMessage::new(id, p.seq, p.ack, is_incoming, Duration::from_millis(100));
        msg.add_packet(p);
        msg
    }

    #[test]
    fn test_packets_order() {
        let mut msg = build_message(packet(true, 1, 1, b"a"));
        msg.add_packet(packet(true, 1, 2, b"b"));
        assert_eq!(msg.bytes(), b"ab");

        // First packet arrives with the later seq.
        let mut msg = build_message(packet(true, 1, 2, b"b"));
        msg.add_packet(packet(true, 1, 1, b"a"));
        assert_eq!(msg.bytes(), b"ab");
    }

    #[test]
    fn test_duplicate_seq_ignored() {
        let mut msg = build_message(packet(true, 1, 1, b"a"));
        assert!(!msg.add_packet(packet(true, 1, 1, b"a")));
        assert_eq!(msg.bytes(), b"a");
        assert_eq!(msg.packets().len(), 1);
    }

    #[test]
    fn test_order_across_sequence_wrap() {
        let mut msg = build_message(packet(true, 1, u32::MAX - 1, b"a"));
        msg.add_packet(packet(true, 1, 1, b"c"));
        msg.add_packet(packet(true, 1, u32::MAX, b"b"));
        assert_eq!(msg.bytes(), b"abc");
    }

    #[test]
    fn test_bytes_stable_under_arrival_permutations() {
        let segments: [(u32, &[u8]); 4] = [(1, b"PO"), (3, b"ST "), (6, b"/ HT"), (10, b"TP/1.1")];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        for order in orders {
            let (seq, data) = segments[order[0]];
            let mut msg = build_message(packet(true, 1, seq, data));
            for &i in &order[1..] {
                let (seq, data) = segments[i];
                msg.add_packet(packet(true, 1, seq, data));
            }
            assert_eq!(msg.bytes(), b"POST / HTTP/1.1");
        }
    }

    #[test]
    fn test_size_and_body_size() {
        let mut msg = build_message(packet(
            true,
            1,
            1,
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\na",
        ));
        msg.add_packet(packet(true, 1, 2, b"b"));
        assert_eq!(msg.body_size(), 2);
        assert_eq!(msg.size(), 40);
    }

    #[test]
    fn test_bodyless_methods_finish_immediately() {
        for method in ["GET", "OPTIONS", "HEAD"] {
            let msg = build_message(packet(true, 1, 1, format!("{method} / HTTP/1.1").as_bytes()));
            assert!(msg.is_finished(), "{method} request should be finished");
        }
    }

    #[test]
    fn test_body_methods_finish_on_content_length() {
        for method in ["POST", "PUT", "PATCH"] {
            let msg = build_message(packet(
                true,
                1,
                1,
                format!("{method} / HTTP/1.1\r\nContent-Length: 1\r\n\r\na").as_bytes(),
            ));
            assert!(msg.is_finished(), "{method} with full body should finish");

            let msg = build_message(packet(
                true,
                1,
                1,
                format!("{method} / HTTP/1.1\r\nContent-Length: 2\r\n\r\na").as_bytes(),
            ));
            assert!(!msg.is_finished(), "{method} with short body should not finish");
        }
    }

    #[test]
    fn test_chunked_request_needs_terminator() {
        let mut msg = build_message(packet(
            true,
            1,
            1,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\n",
        ));
        assert!(!msg.is_finished());
        msg.add_packet(packet(true, 1, 2, b"0\r\n\r\n"));
        assert!(msg.is_finished());
    }

    #[test]
    fn test_unknown_method_never_finishes() {
        let msg = build_message(packet(true, 1, 1, b"UNKNOWN / HTTP/1.1\r\n\r\n"));
        assert!(!msg.is_finished());
    }

    #[test]
    fn test_response_requires_association() {
        let mut msg = build_message(packet(false, 1, 1, b"HTTP/1.1 200 OK\r\n\r\n"));
        assert!(!msg.is_finished());
        msg.request_ack = Some(1);
        assert!(msg.is_finished());
    }

    #[test]
    fn test_chunked_response_waits_for_expiry() {
        let mut msg = build_message(packet(
            false,
            1,
            1,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        ));
        msg.request_ack = Some(1);
        assert!(!msg.is_finished());
    }

    #[test]
    fn test_response_content_length() {
        let mut msg = build_message(packet(
            false,
            1,
            1,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        ));
        msg.request_ack = Some(1);
        assert!(msg.is_finished());

        let mut msg = build_message(packet(
            false,
            1,
            1,
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na",
        ));
        msg.request_ack = Some(1);
        assert!(msg.is_finished());

        let mut msg = build_message(packet(
            false,
            1,
            1,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\na",
        ));
        msg.request_ack = Some(1);
        assert!(!msg.is_finished());
    }

    #[test]
    fn test_non_http_response_payload_not_finished() {
        let mut msg = build_message(packet(false, 1, 1, b"garbage"));
        msg.request_ack = Some(1);
        assert!(!msg.is_finished());
    }

    #[test]
    fn test_request_uuid_is_deterministic() {
        let a = build_message(packet(true, 1, 1, b"GET / HTTP/1.1"));
        let b = build_message(packet(true, 1, 1, b"GET / HTTP/1.1"));
        assert_eq!(a.uuid(), b.uuid());
    }

    #[test]
    fn test_association_copies_request_uuid() {
        let req = build_message(packet(true, 1, 1, b"GET / HTTP/1.1"));
        let mut resp = build_message(packet(false, 15, 2, b"HTTP/1.1 200 OK"));
        assert_ne!(resp.uuid(), req.uuid());
        resp.associate(req.ack, req.uuid());
        assert_eq!(resp.uuid(), req.uuid());
        assert_eq!(resp.request_ack, Some(1));
    }

    #[test]
    fn test_empty_accumulator() {
        let msg = TcpMessage::new("id".into(), 1, 1, true, Duration::from_millis(5));
        assert!(msg.bytes().is_empty());
        assert!(!msg.is_finished());
        assert_eq!(msg.size(), 0);
    }

    #[test]
    fn test_expiry_refreshes_on_append() {
        let mut msg = build_message(packet(true, 1, 1, b"a"));
        let now = Instant::now();
        assert!(!msg.is_expired(now));
        assert!(msg.is_expired(now + Duration::from_millis(200)));
        msg.add_packet(packet(true, 1, 2, b"b"));
        assert!(!msg.is_expired(now + Duration::from_millis(90)));
    }
}
