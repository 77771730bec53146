//! Per-call RTP transport
//!
//! One handler owns the UDP socket for a call. Two tasks run while it is
//! started:
//!
//! - the receive loop reads datagrams (100 ms read timeout), learns the
//!   remote address from the first packet when none was signalled, and
//!   pushes payloads onto the inbound queue, dropping when it is full;
//! - the send loop emits exactly one packet every 20 ms on an absolute
//!   schedule, taking queued outbound audio when there is some and codec
//!   silence otherwise.
//!
//! Once the remote address is known, packets leave through a second socket
//! bound to the same local port and `connect`ed to the peer. Without it the
//! kernel fills checksums for a wildcard-bound socket that some middleboxes
//! drop. If that socket cannot be created, sends fall back to `send_to` on the
//! receive socket.

use super::packet::RtpPacket;
use crate::infrastructure::media::codec::{Codec, PCMU};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const RTP_PACKET_INTERVAL: Duration = Duration::from_millis(20);
pub const RTP_READ_TIMEOUT: Duration = Duration::from_millis(100);
const PTIME_MS: u32 = 20;
const RTP_SOCKET_BUFFER_SIZE: usize = 65536;
const RTP_MAX_PACKET_SIZE: usize = 1500;
const AUDIO_IN_CAPACITY: usize = 100;
const AUDIO_OUT_CAPACITY: usize = 100;
const LOG_INTERVAL: u64 = 50;

#[derive(Debug, Clone)]
pub struct RtpHandlerConfig {
    /// Local bind address, never the advertised external IP
    pub local_ip: String,
    /// 0 lets the OS pick
    pub local_port: u16,
    pub codec: Codec,
}

impl RtpHandlerConfig {
    pub fn new(local_ip: impl Into<String>, local_port: u16) -> Self {
        Self {
            local_ip: local_ip.into(),
            local_port,
            codec: PCMU,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}

/// RTP statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RtpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    /// Interarrival jitter in RTP timestamp units (RFC 3550 A.8)
    pub jitter: f64,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_lost: AtomicU64,
    jitter_bits: AtomicU64,
}

pub struct RtpHandler {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    send_socket: RwLock<Option<Arc<UdpSocket>>>,
    remote_addr: RwLock<Option<SocketAddr>>,

    codec: RwLock<Codec>,
    codec_version: AtomicU64,

    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,

    audio_in_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    audio_in_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    audio_out_tx: mpsc::Sender<Bytes>,
    audio_out_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    running: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    counters: Counters,
}

impl RtpHandler {
    /// Bind the receive socket; nothing is sent until [`RtpHandler::start`]
    pub fn new(config: RtpHandlerConfig, parent: &CancellationToken) -> io::Result<Self> {
        let ip: IpAddr = config.local_ip.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid RTP bind address {}", config.local_ip),
            )
        })?;
        let socket = bind_reusable(SocketAddr::new(ip, config.local_port), None)?;
        let local_addr = socket.local_addr()?;

        let (audio_in_tx, audio_in_rx) = mpsc::channel(AUDIO_IN_CAPACITY);
        let (audio_out_tx, audio_out_rx) = mpsc::channel(AUDIO_OUT_CAPACITY);
        let mut rng = rand::thread_rng();

        info!(
            local = %local_addr,
            codec = config.codec.name,
            "RTP handler bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            send_socket: RwLock::new(None),
            remote_addr: RwLock::new(None),
            codec: RwLock::new(config.codec),
            codec_version: AtomicU64::new(0),
            ssrc: rng.gen(),
            sequence: AtomicU16::new(rng.gen()),
            timestamp: AtomicU32::new(rng.gen()),
            audio_in_tx: Mutex::new(Some(audio_in_tx)),
            audio_in_rx: Mutex::new(Some(audio_in_rx)),
            audio_out_tx,
            audio_out_rx: Mutex::new(Some(audio_out_rx)),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: parent.child_token(),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Send one silence packet right away, then spawn both loops
    pub async fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst)
            || self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }

        self.send_initial_silence().await;

        let audio_in = self.audio_in_tx.lock().await.take();
        let audio_out = self.audio_out_rx.lock().await.take();

        let mut tasks = self.tasks.lock().await;
        if let Some(tx) = audio_in {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move { this.receive_loop(tx).await }));
        }
        if let Some(rx) = audio_out {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move { this.send_loop(rx).await }));
        }

        info!(local = %self.local_addr, ssrc = format_args!("{:08x}", self.ssrc), "RTP started");
    }

    /// Stop both loops and close the audio queues; safe to call repeatedly
    pub async fn stop(&self) -> io::Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "RTP task ended abnormally");
            }
        }

        // Never started: close the queues here instead of in the loops
        self.audio_in_tx.lock().await.take();
        self.audio_out_rx.lock().await.take();
        self.send_socket.write().await.take();

        let stats = self.stats();
        info!(
            local = %self.local_addr,
            packets_sent = stats.packets_sent,
            packets_received = stats.packets_received,
            "RTP stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Point media at the peer and open the connected send socket
    pub async fn set_remote_addr(&self, ip: IpAddr, port: u16) {
        let remote = SocketAddr::new(ip, port);

        let mut send_socket = self.send_socket.write().await;
        send_socket.take();
        match connect_reusable(self.local_addr, remote) {
            Ok(sock) => {
                debug!(local = %self.local_addr, remote = %remote, "RTP connected send socket ready");
                *send_socket = Some(Arc::new(sock));
            }
            Err(e) => {
                warn!(
                    local = %self.local_addr,
                    remote = %remote,
                    error = %e,
                    "RTP connected send socket unavailable, using unconnected sends"
                );
            }
        }
        *self.remote_addr.write().await = Some(remote);

        info!(remote = %remote, connected = send_socket.is_some(), "RTP remote address set");
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.read().await
    }

    /// Bound receive address as `(ip, port)`
    pub fn local_addr(&self) -> (IpAddr, u16) {
        (self.local_addr.ip(), self.local_addr.port())
    }

    /// Switch codecs mid-call; the send loop picks it up on its next tick
    pub async fn set_codec(&self, codec: Codec) {
        *self.codec.write().await = codec;
        self.codec_version.fetch_add(1, Ordering::SeqCst);
        info!(codec = codec.name, payload_type = codec.payload_type, "RTP codec changed");
    }

    pub async fn codec(&self) -> Codec {
        *self.codec.read().await
    }

    /// Inbound payloads; can be taken once
    pub async fn take_audio_in(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.audio_in_rx.lock().await.take()
    }

    /// Outbound audio in the negotiated codec's encoding
    pub fn audio_out(&self) -> mpsc::Sender<Bytes> {
        self.audio_out_tx.clone()
    }

    pub fn stats(&self) -> RtpStats {
        let c = &self.counters;
        RtpStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_lost: c.packets_lost.load(Ordering::Relaxed),
            jitter: f64::from_bits(c.jitter_bits.load(Ordering::Relaxed)),
        }
    }

    /// Next packet in sequence; sequence advances by one, timestamp by the payload length
    fn next_packet(&self, payload_type: u8, payload: Bytes) -> RtpPacket {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = self
            .timestamp
            .fetch_add(payload.len() as u32, Ordering::SeqCst);
        RtpPacket::new(payload_type, sequence, timestamp, self.ssrc, payload)
    }

    async fn send_initial_silence(&self) {
        let Some(remote) = self.remote_addr().await else {
            warn!(local = %self.local_addr, "No RTP remote address yet, initial silence skipped");
            return;
        };

        let codec = self.codec().await;
        let payload = silence_chunk(&codec);
        let len = payload.len();
        let packet = self.next_packet(codec.payload_type, payload);
        match self.send_packet(&packet.serialize(), remote).await {
            Ok(_) => {
                self.record_sent(len);
                debug!(remote = %remote, seq = packet.sequence, "Initial RTP silence sent");
            }
            Err(e) => warn!(remote = %remote, error = %e, "Initial RTP silence failed"),
        }
    }

    async fn send_packet(&self, data: &[u8], remote: SocketAddr) -> io::Result<usize> {
        let connected = self.send_socket.read().await.clone();
        match connected {
            Some(sock) => sock.send(data).await,
            None => self.socket.send_to(data, remote).await,
        }
    }

    fn record_sent(&self, payload_len: usize) {
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    async fn receive_loop(self: Arc<Self>, audio_in: mpsc::Sender<Bytes>) {
        let mut buf = vec![0u8; RTP_MAX_PACKET_SIZE];
        let mut alt = vec![0u8; RTP_MAX_PACKET_SIZE];
        let mut tracker = ReceiveTracker::default();
        let mut dropped: u64 = 0;

        loop {
            let connected = self.send_socket.read().await.clone();

            let (n, source, on_connected) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = time::timeout(RTP_READ_TIMEOUT, self.socket.recv_from(&mut buf)) => match r {
                    Err(_) => continue,
                    Ok(Ok((n, source))) => (n, source, false),
                    Ok(Err(e)) => {
                        debug!(error = %e, "RTP receive error");
                        continue;
                    }
                },
                r = recv_connected(connected, &mut alt) => match r {
                    Ok((n, source)) => (n, source, true),
                    Err(e) => {
                        debug!(error = %e, "RTP connected receive error");
                        continue;
                    }
                },
            };

            if n < RtpPacket::HEADER_SIZE {
                debug!(size = n, source = %source, "RTP packet too small");
                continue;
            }
            let data = if on_connected { &alt[..n] } else { &buf[..n] };
            let packet = match RtpPacket::parse(data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, source = %source, "Dropping invalid RTP packet");
                    continue;
                }
            };

            if self.remote_addr().await.is_none() {
                info!(remote = %source, "RTP remote address learned from first packet");
                self.set_remote_addr(source.ip(), source.port()).await;
            }

            let counters = &self.counters;
            let received = counters.packets_received.fetch_add(1, Ordering::Relaxed) + 1;
            counters
                .bytes_received
                .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
            let clock_rate = self.codec().await.clock_rate;
            let (lost, jitter) = tracker.observe(&packet, Instant::now(), clock_rate);
            if lost > 0 {
                counters.packets_lost.fetch_add(lost, Ordering::Relaxed);
            }
            counters
                .jitter_bits
                .store(jitter.to_bits(), Ordering::Relaxed);

            if received % LOG_INTERVAL == 1 {
                debug!(
                    seq = packet.sequence,
                    payload = packet.payload.len(),
                    total_received = received,
                    "RTP received"
                );
            }

            match audio_in.try_send(packet.payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped % LOG_INTERVAL == 1 {
                        warn!(dropped, "RTP inbound queue full, dropping audio");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    async fn send_loop(self: Arc<Self>, mut audio_out: mpsc::Receiver<Bytes>) {
        let mut codec = self.codec().await;
        let mut version = self.codec_version.load(Ordering::SeqCst);
        let mut samples = codec.samples_per_packet(PTIME_MS);
        let mut silence = silence_chunk(&codec);
        let mut pending = BytesMut::new();
        // initial silence already went out, so the first tick is immediate
        let mut pacer = Pacer::new(Instant::now(), RTP_PACKET_INTERVAL);

        loop {
            let current = self.codec_version.load(Ordering::SeqCst);
            if current != version {
                version = current;
                codec = self.codec().await;
                samples = codec.samples_per_packet(PTIME_MS);
                silence = silence_chunk(&codec);
                // queued audio is kept and goes out under the new payload type
                debug!(codec = codec.name, samples, pending = pending.len(), "RTP send loop adopted new codec");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep_until(pacer.deadline()) => {}
            }
            pacer.advance(Instant::now());

            // audio stays queued until there is somewhere to send it
            let Some(remote) = self.remote_addr().await else {
                continue;
            };

            // pull only what one packet needs so a full queue pushes back
            while pending.len() < samples {
                match audio_out.try_recv() {
                    Ok(audio) => pending.extend_from_slice(&audio),
                    Err(_) => break,
                }
            }

            let had_audio = !pending.is_empty();
            let chunk = next_chunk(&mut pending, samples, &silence, codec.silence_byte());
            let len = chunk.len();
            let packet = self.next_packet(codec.payload_type, chunk);

            if let Err(e) = self.send_packet(&packet.serialize(), remote).await {
                if self.is_running() {
                    debug!(remote = %remote, error = %e, "RTP send failed");
                }
                continue;
            }
            self.record_sent(len);

            let sent = self.counters.packets_sent.load(Ordering::Relaxed);
            if sent % LOG_INTERVAL == 1 {
                debug!(
                    seq = packet.sequence,
                    total_sent = sent,
                    pending = pending.len(),
                    silence = !had_audio,
                    "RTP sent"
                );
            }
        }
    }
}

/// Absolute 20 ms schedule: each deadline derives from the previous one, and
/// a tick that is already late resynchronises instead of bursting to catch up.
#[derive(Debug)]
pub(crate) struct Pacer {
    next: Instant,
    interval: Duration,
}

impl Pacer {
    pub(crate) fn new(first: Instant, interval: Duration) -> Self {
        Self {
            next: first,
            interval,
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.next
    }

    /// Call after waking for the current deadline
    pub(crate) fn advance(&mut self, now: Instant) {
        self.next += self.interval;
        if now > self.next {
            self.next = now + self.interval;
        }
    }
}

/// Take one packet's worth from `pending`, padding a short tail with silence
pub(crate) fn next_chunk(
    pending: &mut BytesMut,
    size: usize,
    silence: &Bytes,
    silence_byte: u8,
) -> Bytes {
    if pending.len() >= size {
        return pending.split_to(size).freeze();
    }
    if pending.is_empty() {
        return silence.clone();
    }
    let mut chunk = BytesMut::with_capacity(size);
    chunk.extend_from_slice(pending);
    chunk.resize(size, silence_byte);
    pending.clear();
    chunk.freeze()
}

fn silence_chunk(codec: &Codec) -> Bytes {
    Bytes::from(vec![codec.silence_byte(); codec.samples_per_packet(PTIME_MS)])
}

#[derive(Default)]
struct ReceiveTracker {
    last_sequence: Option<u16>,
    last_transit: Option<f64>,
    jitter: f64,
    origin: Option<Instant>,
}

impl ReceiveTracker {
    /// Returns (newly lost packets, current jitter)
    fn observe(&mut self, packet: &RtpPacket, arrival: Instant, clock_rate: u32) -> (u64, f64) {
        let mut lost = 0;
        if let Some(last) = self.last_sequence {
            let gap = packet.sequence.wrapping_sub(last);
            if gap > 1 && gap < 0x8000 {
                lost = (gap - 1) as u64;
            }
            if gap == 0 || gap >= 0x8000 {
                // duplicate or reordered; keep the newest sequence
                return (0, self.jitter);
            }
        }
        self.last_sequence = Some(packet.sequence);

        let origin = *self.origin.get_or_insert(arrival);
        let arrival_units = arrival.duration_since(origin).as_secs_f64() * clock_rate as f64;
        let transit = arrival_units - packet.timestamp as f64;
        if let Some(previous) = self.last_transit {
            let d = (transit - previous).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);

        (lost, self.jitter)
    }
}

async fn recv_connected(
    sock: Option<Arc<UdpSocket>>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn bind_reusable(local: SocketAddr, remote: Option<SocketAddr>) -> io::Result<UdpSocket> {
    let domain = if local.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(RTP_SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(RTP_SOCKET_BUFFER_SIZE)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    if let Some(remote) = remote {
        socket.connect(&remote.into())?;
    }
    UdpSocket::from_std(socket.into())
}

fn connect_reusable(local: SocketAddr, remote: SocketAddr) -> io::Result<UdpSocket> {
    if local.is_ipv4() != remote.is_ipv4() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address family mismatch between RTP bind and remote",
        ));
    }
    bind_reusable(local, Some(remote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::codec::PCMA;

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv_packet(sock: &UdpSocket) -> RtpPacket {
        let mut buf = [0u8; 1500];
        let (n, _) = time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
            .await
            .expect("no RTP packet arrived")
            .unwrap();
        RtpPacket::parse(&buf[..n]).unwrap()
    }

    fn handler(codec: Codec) -> Arc<RtpHandler> {
        let config = RtpHandlerConfig::new("127.0.0.1", 0).with_codec(codec);
        Arc::new(RtpHandler::new(config, &CancellationToken::new()).unwrap())
    }

    #[test]
    fn test_partial_chunk_is_padded_to_packet_size() {
        let silence = silence_chunk(&PCMU);
        let mut pending = BytesMut::from(&[1u8, 2, 3][..]);

        let chunk = next_chunk(&mut pending, 160, &silence, 0xFF);

        assert_eq!(chunk.len(), 160);
        assert_eq!(&chunk[..3], &[1, 2, 3]);
        assert!(chunk[3..].iter().all(|b| *b == 0xFF));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_full_chunk_leaves_remainder_pending() {
        let silence = silence_chunk(&PCMA);
        let mut pending = BytesMut::from(&vec![7u8; 200][..]);

        let chunk = next_chunk(&mut pending, 160, &silence, 0xD5);
        assert_eq!(chunk.len(), 160);
        assert_eq!(pending.len(), 40);

        let chunk = next_chunk(&mut pending, 160, &silence, 0xD5);
        assert_eq!(&chunk[..40], &[7u8; 40][..]);
        assert!(chunk[40..].iter().all(|b| *b == 0xD5));

        let chunk = next_chunk(&mut pending, 160, &silence, 0xD5);
        assert_eq!(chunk, silence);
    }

    #[test]
    fn test_pacer_uses_absolute_deadlines() {
        let t0 = Instant::now();
        let mut pacer = Pacer::new(t0, RTP_PACKET_INTERVAL);
        assert_eq!(pacer.deadline(), t0);

        // waking slightly late does not shift the schedule
        pacer.advance(t0 + Duration::from_millis(3));
        assert_eq!(pacer.deadline(), t0 + Duration::from_millis(20));
        pacer.advance(t0 + Duration::from_millis(21));
        assert_eq!(pacer.deadline(), t0 + Duration::from_millis(40));

        // falling a whole tick behind resynchronises from now
        let late = t0 + Duration::from_millis(100);
        pacer.advance(late);
        assert_eq!(pacer.deadline(), late + RTP_PACKET_INTERVAL);
    }

    #[tokio::test]
    async fn test_sequence_and_timestamp_advance_per_packet() {
        let handler = handler(PCMU);
        let first = handler.next_packet(0, Bytes::from_static(&[0xFF; 160]));
        let second = handler.next_packet(0, Bytes::from_static(&[0xFF; 80]));
        let third = handler.next_packet(0, Bytes::from_static(&[0xFF; 160]));

        assert_eq!(second.sequence, first.sequence.wrapping_add(1));
        assert_eq!(third.sequence, second.sequence.wrapping_add(1));
        assert_eq!(second.timestamp, first.timestamp.wrapping_add(160));
        assert_eq!(third.timestamp, second.timestamp.wrapping_add(80));
        assert_eq!(first.ssrc, third.ssrc);
    }

    #[tokio::test]
    async fn test_start_sends_initial_pcmu_silence() {
        let peer = peer().await;
        let handler = handler(PCMU);
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;

        handler.start().await;
        let packet = recv_packet(&peer).await;

        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.payload.len(), 160);
        assert!(packet.payload.iter().all(|b| *b == 0xFF));
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pcma_silence_byte() {
        let peer = peer().await;
        let handler = handler(PCMA);
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;

        handler.start().await;
        let packet = recv_packet(&peer).await;

        assert_eq!(packet.payload_type, 8);
        assert!(packet.payload.iter().all(|b| *b == 0xD5));
        handler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_packet_per_tick_under_paused_clock() {
        let peer = peer().await;
        let handler = handler(PCMU);
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;

        handler.start().await;
        // ticks at 0, 20, ..., 200 ms plus the initial packet
        time::sleep(Duration::from_millis(210)).await;

        assert_eq!(handler.stats().packets_sent, 12);
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_out_backs_up_without_remote() {
        let handler = handler(PCMU);
        handler.start().await;
        let audio_out = handler.audio_out();

        let mut accepted = 0;
        for _ in 0..AUDIO_OUT_CAPACITY * 2 {
            if audio_out.try_send(Bytes::from(vec![0x11u8; 160])).is_ok() {
                accepted += 1;
            }
            time::sleep(Duration::from_millis(1)).await;
        }
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(accepted, AUDIO_OUT_CAPACITY);
        assert!(matches!(
            audio_out.try_send(Bytes::from_static(b"x")),
            Err(mpsc::error::TrySendError::Full(_))
        ));
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_loop_drains_queue_at_packet_rate() {
        let peer = peer().await;
        let handler = handler(PCMU);
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;
        let audio_out = handler.audio_out();
        for _ in 0..AUDIO_OUT_CAPACITY {
            audio_out.try_send(Bytes::from(vec![0x11u8; 160])).unwrap();
        }
        handler.start().await;

        // a few ticks drain only a few frames, the rest stay queued
        time::sleep(Duration::from_millis(100)).await;
        let free = audio_out.capacity();
        assert!(free >= 1 && free < AUDIO_OUT_CAPACITY / 2, "free slots: {}", free);
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_audio_survives_codec_change() {
        let peer = peer().await;
        let handler = handler(PCMU);
        handler.start().await;
        handler.audio_out().send(Bytes::from(vec![0x22u8; 160])).await.unwrap();
        // switch while the frame waits for a remote address
        handler.set_codec(PCMA).await;
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;

        let mut found = None;
        for _ in 0..10 {
            let packet = recv_packet(&peer).await;
            if packet.payload[0] == 0x22 {
                found = Some(packet);
                break;
            }
        }
        let packet = found.expect("queued audio dropped on codec change");
        assert_eq!(packet.payload_type, PCMA.payload_type);
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_audio_is_sent_then_padded() {
        let peer = peer().await;
        let handler = handler(PCMU);
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;

        handler.audio_out().send(Bytes::from(vec![0x11u8; 100])).await.unwrap();
        handler.start().await;

        let mut found = None;
        for _ in 0..10 {
            let packet = recv_packet(&peer).await;
            if packet.payload[0] == 0x11 {
                found = Some(packet);
                break;
            }
        }
        let packet = found.expect("queued audio never sent");
        assert_eq!(packet.payload.len(), 160);
        assert!(packet.payload[..100].iter().all(|b| *b == 0x11));
        assert!(packet.payload[100..].iter().all(|b| *b == 0xFF));
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_learns_remote_and_delivers_payload() {
        let peer = peer().await;
        let handler = handler(PCMU);
        let mut audio_in = handler.take_audio_in().await.unwrap();
        handler.start().await;
        assert!(handler.remote_addr().await.is_none());

        let (ip, port) = handler.local_addr();
        let target = SocketAddr::new(ip, port);
        let packet = RtpPacket::new(0, 10, 1600, 0xCAFE, Bytes::from_static(b"voice"));
        peer.send_to(&[0x80, 0, 0], target).await.unwrap(); // too short, ignored
        peer.send_to(&packet.serialize(), target).await.unwrap();

        let payload = time::timeout(Duration::from_secs(2), audio_in.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"voice");
        assert_eq!(handler.remote_addr().await, Some(peer.local_addr().unwrap()));

        // silence now flows back to the learned address
        let back = recv_packet(&peer).await;
        assert_eq!(back.payload_type, 0);
        assert_eq!(handler.stats().packets_received, 1);
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_codec_change_applies_to_following_packets() {
        let peer = peer().await;
        let handler = handler(PCMU);
        let remote = peer.local_addr().unwrap();
        handler.set_remote_addr(remote.ip(), remote.port()).await;
        handler.start().await;
        assert_eq!(recv_packet(&peer).await.payload_type, 0);

        handler.set_codec(PCMA).await;

        let mut switched = None;
        for _ in 0..10 {
            let packet = recv_packet(&peer).await;
            if packet.payload_type == 8 {
                switched = Some(packet);
                break;
            }
        }
        let packet = switched.expect("codec change not applied");
        assert_eq!(packet.payload.len(), 160);
        assert!(packet.payload.iter().all(|b| *b == 0xD5));
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_queues() {
        let handler = handler(PCMU);
        let mut audio_in = handler.take_audio_in().await.unwrap();
        handler.start().await;

        handler.stop().await.unwrap();
        handler.stop().await.unwrap();

        assert!(!handler.is_running());
        assert!(audio_in.recv().await.is_none());
        assert!(handler.audio_out().send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start_closes_queues() {
        let handler = handler(PCMU);
        let mut audio_in = handler.take_audio_in().await.unwrap();
        handler.stop().await.unwrap();
        assert!(audio_in.recv().await.is_none());

        // a stopped handler never starts
        handler.start().await;
        assert!(!handler.is_running());
    }

    #[test]
    fn test_loss_tracking() {
        let mut tracker = ReceiveTracker::default();
        let now = Instant::now();
        let p = |seq| RtpPacket::new(0, seq, seq as u32 * 160, 1, Bytes::new());

        assert_eq!(tracker.observe(&p(100), now, 8000).0, 0);
        assert_eq!(tracker.observe(&p(101), now, 8000).0, 0);
        assert_eq!(tracker.observe(&p(105), now, 8000).0, 3);
        assert_eq!(tracker.observe(&p(104), now, 8000).0, 0);
    }
}
