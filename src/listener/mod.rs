//! Listener: the state machine tying captured TCP packets to HTTP messages.
//!
//! A single dispatch task owns all reassembly state and multiplexes over
//! the inbound packet channel, a periodic expiry sweep, and the outbound
//! message channel. Packets are grouped into messages keyed by
//! `(peer addr, dst port, ack)`; responses are paired with requests
//! through an index of expected acknowledgement numbers. Completed or
//! expired messages are emitted on the outbound channel with a
//! correlation UUID shared by each request/response pair.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{self, CaptureEngine, EngineKind};
use crate::message::{message_id, TcpMessage, TcpPacket};
use crate::protocol;

const PACKET_CHANNEL_CAPACITY: usize = 1024;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Outbox length past which the drop-oldest policy starts evicting.
const OUTBOX_HIGH_WATER: usize = 512;

/// What to do when the outbound channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for the consumer; packet intake backs up behind it.
    #[default]
    Block,
    /// Queue internally and evict the oldest pending message past a
    /// high-water mark.
    DropOldest,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address the monitored service is reachable at. Informational for
    /// the pcap file engine; live engines bind to it.
    pub addr: String,
    /// Monitored service port; fixes the request/response direction.
    pub port: u16,
    pub engine: EngineKind,
    /// How long an unfinished message may sit before the sweep emits it.
    pub expiry: Duration,
    pub overflow: OverflowPolicy,
    /// Capture file for the pcap engine.
    pub input: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            port: 0,
            engine: EngineKind::Pcap,
            expiry: Duration::from_secs(2),
            overflow: OverflowPolicy::Block,
            input: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub received_packets: AtomicU64,
    pub dropped_packets: AtomicU64,
    pub emitted_messages: AtomicU64,
    pub expired_messages: AtomicU64,
    pub orphan_responses: AtomicU64,
    pub dropped_messages: AtomicU64,
}

/// Sequence and acknowledgement numbers are only unique per connection;
/// every association index is scoped by the peer address alongside them.
type PeerKey = (String, u32);

/// Copied request identity used to associate a later response. A copy
/// survives the emission of the request message itself.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    ack: u32,
    uuid: Uuid,
    registered_at: Instant,
}

/// Handle to a running reassembly pipeline.
pub struct Listener {
    packet_tx: mpsc::Sender<TcpPacket>,
    messages_rx: Option<mpsc::Receiver<TcpMessage>>,
    shutdown: CancellationToken,
    dispatch: Option<JoinHandle<()>>,
    engine_task: Option<JoinHandle<Result<()>>>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Start the dispatch task. Packets are injected via [`Listener::packets`];
    /// no capture engine is attached.
    pub fn new(config: ListenerConfig) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (message_tx, messages_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let stats = Arc::new(ListenerStats::default());

        let state = DispatchState {
            port: config.port,
            expiry: config.expiry,
            overflow: config.overflow,
            messages: HashMap::new(),
            ack_aliases: HashMap::new(),
            seq_with_data: HashMap::new(),
            pending_responses: HashMap::new(),
            packet_rx,
            message_tx,
            outbox: VecDeque::new(),
            shutdown: shutdown.clone(),
            stats: stats.clone(),
        };
        let dispatch = tokio::spawn(state.run());

        Self {
            packet_tx,
            messages_rx: Some(messages_rx),
            shutdown,
            dispatch: Some(dispatch),
            engine_task: None,
            stats,
        }
    }

    /// Start the dispatch task and attach the capture engine named by the
    /// configuration.
    pub fn open(config: ListenerConfig) -> Result<Self> {
        let engine = capture::open_engine(
            config.engine,
            &config.addr,
            config.port,
            config.input.as_deref(),
        )?;
        let mut listener = Self::new(config);
        listener.attach_engine(engine);
        Ok(listener)
    }

    /// Sender half of the inbound packet channel.
    pub fn packets(&self) -> mpsc::Sender<TcpPacket> {
        self.packet_tx.clone()
    }

    /// Receive the next reassembled message.
    pub async fn recv(&mut self) -> Option<TcpMessage> {
        match self.messages_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take ownership of the outbound channel, e.g. to hand it to a
    /// dedicated consumer task.
    pub fn take_messages(&mut self) -> Option<mpsc::Receiver<TcpMessage>> {
        self.messages_rx.take()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    /// Pump packets from `engine` into the listener until it is exhausted,
    /// fails, or the listener shuts down. Engine failure is fatal for the
    /// listener: the quit signal fires and close semantics run.
    pub fn attach_engine(&mut self, mut engine: Box<dyn CaptureEngine>) {
        let tx = self.packet_tx.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            engine.start().await?;
            tracing::info!(engine = engine.name(), "capture engine started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = engine.next_packet() => match next {
                        Ok(Some(packet)) => {
                            if tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::error!(error = %err, "capture engine failed");
                            shutdown.cancel();
                            let _ = engine.close().await;
                            return Err(err);
                        }
                    },
                }
            }
            engine.close().await
        });
        self.engine_task = Some(task);
    }

    /// Wait for the attached engine to exhaust its source.
    pub async fn wait_engine(&mut self) -> Result<()> {
        match self.engine_task.take() {
            Some(task) => task.await.context("capture engine task panicked")?,
            None => Ok(()),
        }
    }

    /// Cooperative shutdown: the dispatch task finishes its current packet,
    /// drains the inbound channel, flushes remaining non-empty messages,
    /// and stops. The outbound channel stays readable until drained.
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.engine_task.take() {
            match task.await {
                Ok(result) => result?,
                Err(err) => return Err(anyhow!("capture engine task panicked: {err}")),
            }
        }
        if let Some(task) = self.dispatch.take() {
            task.await.context("dispatch task panicked")?;
        }
        Ok(())
    }
}

/// All reassembly state; owned exclusively by the dispatch task.
struct DispatchState {
    port: u16,
    expiry: Duration,
    overflow: OverflowPolicy,
    /// Live accumulators keyed by message id.
    messages: HashMap<String, TcpMessage>,
    /// (peer, body-packet ack) -> header-packet ack, for requests split
    /// across acknowledgement numbers by an interim `100 Continue`.
    ack_aliases: HashMap<PeerKey, u32>,
    /// (peer, expected seq of the first body packet) -> header-packet ack.
    seq_with_data: HashMap<PeerKey, u32>,
    /// (peer, expected response ack) -> request identity.
    pending_responses: HashMap<PeerKey, PendingRequest>,
    packet_rx: mpsc::Receiver<TcpPacket>,
    message_tx: mpsc::Sender<TcpMessage>,
    /// FIFO of emitted messages awaiting delivery under the drop-oldest
    /// policy.
    outbox: VecDeque<TcpMessage>,
    shutdown: CancellationToken,
    stats: Arc<ListenerStats>,
}

enum EmitReason {
    Finished,
    Expired,
}

impl DispatchState {
    async fn run(mut self) {
        let period = (self.expiry / 10).max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let outbox_tx = self.message_tx.clone();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe = self.packet_rx.recv() => match maybe {
                    Some(packet) => self.process_tcp_packet(packet).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_expired().await,
                permit = outbox_tx.reserve(), if !self.outbox.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(message) = self.outbox.pop_front() {
                            permit.send(message);
                        }
                    }
                    Err(_) => {
                        // Consumer is gone; nothing left to deliver to.
                        self.outbox.clear();
                        break;
                    }
                },
            }
        }

        self.drain_and_flush().await;
        tracing::info!(
            received = self.stats.received_packets.load(AtomicOrdering::Relaxed),
            dropped_packets = self.stats.dropped_packets.load(AtomicOrdering::Relaxed),
            emitted = self.stats.emitted_messages.load(AtomicOrdering::Relaxed),
            expired = self.stats.expired_messages.load(AtomicOrdering::Relaxed),
            orphans = self.stats.orphan_responses.load(AtomicOrdering::Relaxed),
            "listener stopped"
        );
    }

    async fn process_tcp_packet(&mut self, mut packet: TcpPacket) {
        self.stats.received_packets.fetch_add(1, AtomicOrdering::Relaxed);
        if packet.data.is_empty() {
            return;
        }

        let is_incoming = packet.dst_port == self.port;
        if !is_incoming && packet.src_port != self.port {
            self.stats.dropped_packets.fetch_add(1, AtomicOrdering::Relaxed);
            tracing::trace!(src = packet.src_port, dst = packet.dst_port, "foreign packet");
            return;
        }

        // What the peer will acknowledge: wire length, before any rewrite.
        let end_seq = packet.end_seq();
        let peer = packet.addr.clone();

        if is_incoming {
            // First body packet of a request whose headers went out under a
            // different ack: alias it back onto the header message.
            if let Some(original) = self.seq_with_data.remove(&(peer.clone(), packet.seq)) {
                if original != packet.ack {
                    self.ack_aliases.insert((peer.clone(), packet.ack), original);
                    self.merge_stranded(&packet, original);
                }
            }
            if let Some(&alias) = self.ack_aliases.get(&(peer.clone(), packet.ack)) {
                packet.ack = alias;
            }

            if let Some(value) = protocol::header(&packet.data, "Expect") {
                if value.eq_ignore_ascii_case(b"100-continue") {
                    self.seq_with_data.insert((peer.clone(), end_seq), packet.ack);
                    if let Some(span) = protocol::header_line_span(&packet.data, "Expect") {
                        packet.data.drain(span);
                    }
                }
            }
        }

        let id = message_id(&packet.addr, packet.dst_port, packet.ack);
        let response_request = if is_incoming {
            None
        } else {
            self.pending_responses
                .get(&(peer.clone(), packet.ack))
                .copied()
        };

        let message = match self.messages.entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut message =
                    TcpMessage::new(id.clone(), packet.seq, packet.ack, is_incoming, self.expiry);
                if let Some(request) = response_request {
                    message.associate(request.ack, request.uuid);
                }
                entry.insert(message)
            }
        };
        message.add_packet(packet);

        if is_incoming {
            let request = PendingRequest {
                ack: message.ack,
                uuid: message.uuid(),
                registered_at: Instant::now(),
            };
            self.pending_responses.insert((peer.clone(), end_seq), request);
            self.reconcile_responses(&peer, end_seq, request).await;
        }

        self.finish_if_complete(&id).await;
    }

    /// Out-of-order arrival may have buffered body packets under their own
    /// ack before the header packet established the alias; fold that
    /// stranded accumulator into the header message.
    fn merge_stranded(&mut self, packet: &TcpPacket, original_ack: u32) {
        let stranded_id = message_id(&packet.addr, packet.dst_port, packet.ack);
        let Some(stranded) = self.messages.remove(&stranded_id) else {
            return;
        };
        let stray_ack = stranded.ack;
        let stray_uuid = stranded.uuid();
        let target_id = message_id(&packet.addr, packet.dst_port, original_ack);
        let target = match self.messages.entry(target_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(TcpMessage::new(
                target_id,
                stranded.start_seq,
                original_ack,
                true,
                self.expiry,
            )),
        };
        for stray in stranded.into_packets() {
            target.add_packet(stray);
        }
        let target_ack = target.ack;
        let target_uuid = target.uuid();

        // Pending entries registered while the body packets posed as their
        // own request must follow them onto the merged message.
        for (key, request) in self.pending_responses.iter_mut() {
            if key.0 == packet.addr && request.ack == stray_ack && request.uuid == stray_uuid {
                request.ack = target_ack;
                request.uuid = target_uuid;
            }
        }
    }

    /// A request packet was observed; any buffered response acking its end
    /// belongs to it.
    async fn reconcile_responses(&mut self, peer: &str, expected_ack: u32, request: PendingRequest) {
        let matching: Vec<String> = self
            .messages
            .values()
            .filter(|m| {
                !m.is_incoming
                    && m.request_ack.is_none()
                    && m.ack == expected_ack
                    && m.peer_addr() == peer
            })
            .map(|m| m.id().to_string())
            .collect();
        for id in matching {
            if let Some(message) = self.messages.get_mut(&id) {
                message.associate(request.ack, request.uuid);
            }
            self.finish_if_complete(&id).await;
        }
    }

    async fn finish_if_complete(&mut self, id: &str) {
        let finished = self.messages.get(id).is_some_and(TcpMessage::is_finished);
        if !finished {
            return;
        }
        if let Some(message) = self.messages.remove(id) {
            self.emit(message, EmitReason::Finished).await;
        }
    }

    /// Emits every message whose deadline passed, complete or not, and
    /// prunes stale association indices.
    async fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .messages
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.id().to_string())
            .collect();
        for id in expired {
            if let Some(message) = self.messages.remove(&id) {
                self.stats.expired_messages.fetch_add(1, AtomicOrdering::Relaxed);
                self.emit(message, EmitReason::Expired).await;
            }
        }

        let retention = self.expiry * 2;
        self.pending_responses
            .retain(|_, request| now.duration_since(request.registered_at) < retention);
    }

    async fn emit(&mut self, message: TcpMessage, reason: EmitReason) {
        if message.size() == 0 {
            return;
        }
        if !message.is_incoming && message.request_ack.is_none() {
            self.stats.orphan_responses.fetch_add(1, AtomicOrdering::Relaxed);
        }
        if message.is_incoming {
            // The merging indices for this request are spent.
            let ack = message.ack;
            let peer = message.peer_addr().to_string();
            self.ack_aliases
                .retain(|key, original| key.0 != peer || *original != ack);
            self.seq_with_data
                .retain(|key, original| key.0 != peer || *original != ack);
        }
        self.stats.emitted_messages.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(
            uuid = %message.uuid(),
            incoming = message.is_incoming,
            size = message.size(),
            reason = match reason {
                EmitReason::Finished => "finished",
                EmitReason::Expired => "expired",
            },
            "message emitted"
        );

        match self.overflow {
            OverflowPolicy::Block => {
                if self.message_tx.send(message).await.is_err() {
                    // Consumer is gone; stop reassembling.
                    self.shutdown.cancel();
                }
            }
            OverflowPolicy::DropOldest => {
                self.outbox.push_back(message);
                while self.outbox.len() > OUTBOX_HIGH_WATER {
                    self.outbox.pop_front();
                    self.stats.dropped_messages.fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
        }
    }

    /// Shutdown path: finish queued packets, then flush every non-empty
    /// message best-effort.
    async fn drain_and_flush(&mut self) {
        while let Ok(packet) = self.packet_rx.try_recv() {
            self.process_tcp_packet(packet).await;
        }

        let remaining: Vec<String> = self.messages.keys().cloned().collect();
        for id in remaining {
            if let Some(message) = self.messages.remove(&id) {
                if message.size() == 0 {
                    continue;
                }
                if !message.is_incoming && message.request_ack.is_none() {
                    self.stats.orphan_responses.fetch_add(1, AtomicOrdering::Relaxed);
                }
                self.stats.emitted_messages.fetch_add(1, AtomicOrdering::Relaxed);
                self.outbox.push_back(message);
            }
        }
        while let Some(message) = self.outbox.pop_front() {
            if self.message_tx.try_send(message).is_err() {
                self.stats.dropped_messages.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
    }
}
