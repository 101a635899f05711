//! Per-destination sender: queue ownership, connection management,
//! batched writes, failure accounting and secondary offload
//!
//! Exactly one sender exists per unique server descriptor. The router
//! shares senders read-only; only the sender's own task mutates its
//! connection, and counters are atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::queue::Queue;
use crate::stream::{client_connector, compress_batch, server_name, TlsSettings, WireCompression};

/// Failure ticks after which peers treat this destination as gone for
/// good and start offloading (6 x 250 ms).
const FAIL_WAIT_TICKS: usize = 6;
/// Idle ticks before an unused TCP connection is closed (~3 s).
const DISCONNECT_WAIT_TICKS: u32 = 12;
/// Attempts for one batch write before the connection is condemned.
const WRITE_RETRIES: usize = 10;

/// How the destination is reached on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Tcp,
    Udp,
    Unix,
    File,
    /// Internal channel back into the dispatcher.
    Pipe,
}

impl ConnectionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Tcp => "tcp",
            ConnectionKind::Udp => "udp",
            ConnectionKind::Unix => "unix",
            ConnectionKind::File => "file",
            ConnectionKind::Pipe => "pipe",
        }
    }
}

/// Identity of a downstream server. Equality over all fields is the
/// dedup key when building the graph; the reload transplant matches on
/// the narrower (host, port, kind) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerDescriptor {
    pub kind: ConnectionKind,
    pub host: String,
    pub port: u16,
    pub instance: Option<String>,
}

impl std::fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConnectionKind::File | ConnectionKind::Unix | ConnectionKind::Pipe => {
                write!(f, "{}", self.host)
            }
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Tunables a sender is built with.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub queue_size: usize,
    pub batch_size: usize,
    pub max_stalls: usize,
    pub io_timeout: Duration,
    pub compression: WireCompression,
    pub tls: Option<TlsSettings>,
    /// Destination expects RFC 5424 syslog framing (set on the routes
    /// that format lines, carried here for bookkeeping).
    pub syslog: bool,
    /// Re-resolve the address on every reconnect.
    pub resolve: bool,
    /// Member of a failover cluster: offload only on failure, never on
    /// queue pressure, and keep secondary order.
    pub failover: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            queue_size: 25_000,
            batch_size: 2500,
            max_stalls: 4,
            io_timeout: Duration::from_millis(600),
            compression: WireCompression::Plain,
            tls: None,
            syslog: false,
            resolve: false,
            failover: false,
        }
    }
}

enum EgressConnection {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Udp(UdpSocket),
    Unix(UnixStream),
    File(tokio::fs::File),
    Pipe(mpsc::Sender<Box<[u8]>>),
}

/// The task-owned side of one destination.
pub struct Sender {
    desc: ServerDescriptor,
    conf: SenderConfig,
    queue: Queue,

    failure: AtomicUsize,
    stallseq: AtomicUsize,
    keep_running: AtomicBool,
    running: AtomicBool,

    sent: AtomicU64,
    dropped: AtomicU64,
    stalls: AtomicU64,
    ticks_us: AtomicU64,
    prev_sent: AtomicU64,
    prev_dropped: AtomicU64,
    prev_stalls: AtomicU64,
    prev_ticks_us: AtomicU64,

    secondaries: OnceLock<Vec<Arc<Sender>>>,
    feedback: OnceLock<mpsc::Sender<Box<[u8]>>>,
}

impl Sender {
    #[must_use]
    pub fn new(desc: ServerDescriptor, conf: SenderConfig) -> Arc<Self> {
        let queue = Queue::new(conf.queue_size);
        Arc::new(Self {
            desc,
            conf,
            queue,
            failure: AtomicUsize::new(0),
            stallseq: AtomicUsize::new(0),
            keep_running: AtomicBool::new(true),
            running: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            ticks_us: AtomicU64::new(0),
            prev_sent: AtomicU64::new(0),
            prev_dropped: AtomicU64::new(0),
            prev_stalls: AtomicU64::new(0),
            prev_ticks_us: AtomicU64::new(0),
            secondaries: OnceLock::new(),
            feedback: OnceLock::new(),
        })
    }

    /// Bare sender for unit tests: small queue, never spawned.
    #[must_use]
    pub fn for_tests(desc: ServerDescriptor) -> Arc<Self> {
        Self::new(
            desc,
            SenderConfig {
                queue_size: 16,
                batch_size: 4,
                ..SenderConfig::default()
            },
        )
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.desc
    }

    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.conf
    }

    /// Peers in the same any_of/failover cluster; set once at build.
    pub fn set_secondaries(&self, secondaries: Vec<Arc<Sender>>) {
        let _ = self.secondaries.set(secondaries);
    }

    /// Channel into the dispatcher, for `Pipe` destinations.
    pub fn set_feedback(&self, tx: mpsc::Sender<Box<[u8]>>) {
        let _ = self.feedback.set(tx);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.load(Ordering::Relaxed) > 0
    }

    /// Marks the destination failed without a connection attempt; used
    /// in tests and by the shutdown path to stop offload loops.
    pub fn mark_failed(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_failure(&self) {
        self.failure.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // counter observers, cumulative and since-last-call flavours

    pub fn metrics_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn metrics_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn metrics_stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn wall_time_us(&self) -> u64 {
        self.ticks_us.load(Ordering::Relaxed)
    }

    pub fn metrics_sent_sub(&self) -> u64 {
        sub_counter(&self.sent, &self.prev_sent)
    }

    pub fn metrics_dropped_sub(&self) -> u64 {
        sub_counter(&self.dropped, &self.prev_dropped)
    }

    pub fn metrics_stalls_sub(&self) -> u64 {
        sub_counter(&self.stalls, &self.prev_stalls)
    }

    pub fn wall_time_us_sub(&self) -> u64 {
        sub_counter(&self.ticks_us, &self.prev_ticks_us)
    }

    /// Takes over the in-flight queue and counters of a retiring sender
    /// for the same (host, port, kind) destination.
    pub fn transplant_from(&self, old: &Sender) {
        self.queue.swap(&old.queue);
        for (new, prev) in [
            (&self.sent, &old.sent),
            (&self.dropped, &old.dropped),
            (&self.stalls, &old.stalls),
            (&self.ticks_us, &old.ticks_us),
            (&self.prev_sent, &old.prev_sent),
            (&self.prev_dropped, &old.prev_dropped),
            (&self.prev_stalls, &old.prev_stalls),
            (&self.prev_ticks_us, &old.prev_ticks_us),
        ] {
            new.store(prev.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Offers `line` for delivery. On a stall (queue full but recovery
    /// looks possible) the line is handed back so the caller may retry;
    /// `force` refuses the stall option.
    pub fn send(&self, line: Box<[u8]>, force: bool) -> Result<(), Box<[u8]>> {
        if self.queue.free() == 0 {
            let mut failed = self.is_failed();
            if !force {
                if let Some(secondaries) = self.secondaries.get() {
                    // don't immediately drop if someone can back us up
                    if !secondaries.is_empty() && secondaries.iter().any(|s| !s.is_failed()) {
                        failed = false;
                    }
                }
            }
            if force || failed || self.stallseq.load(Ordering::Relaxed) >= self.conf.max_stalls {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                // the enqueue below pushes out the oldest entry
            } else {
                self.stallseq.fetch_add(1, Ordering::Relaxed);
                self.stalls.fetch_add(1, Ordering::Relaxed);
                return Err(line);
            }
        } else {
            self.stallseq.store(0, Ordering::Relaxed);
        }
        self.queue.enqueue(line);
        Ok(())
    }

    /// The sender task. Runs until stopped and the queue is drained.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut conn: Option<EgressConnection> = None;
        let mut idle: u32 = 0;

        loop {
            if self.queue.is_empty() {
                // idling: drop the TCP connection after a while so
                // mostly-quiet relays don't pin sockets open
                if matches!(self.desc.kind, ConnectionKind::Tcp | ConnectionKind::Unix)
                    && conn.is_some()
                {
                    idle += 1;
                    if idle > DISCONNECT_WAIT_TICKS {
                        conn = None;
                    }
                }
                if !self.keep_running.load(Ordering::SeqCst) {
                    break;
                }
                sleep(jitter_ms(200, 300)).await;
                if !self.is_failed() {
                    continue;
                }
            } else if self.should_offload() {
                let placed = self.offload_batch();
                if !self.keep_running.load(Ordering::SeqCst) && self.queue.is_empty() {
                    break;
                }
                if !placed {
                    // nowhere to put anything, take it easy for a bit
                    sleep(jitter_ms(200, 300)).await;
                }
            } else if self.is_failed() {
                if !self.keep_running.load(Ordering::SeqCst) && self.queue.is_empty() {
                    break;
                }
                sleep(jitter_ms(200, 300)).await;
                // decay so a recovered destination becomes eligible again
                if self.failure.load(Ordering::Relaxed) > FAIL_WAIT_TICKS {
                    self.failure.fetch_sub(1, Ordering::Relaxed);
                }
            }

            if self.queue.is_empty() {
                continue;
            }
            if !self.keep_running.load(Ordering::SeqCst) {
                let pending = self.queue.len();
                if pending > 0 {
                    info!(destination = %self.desc, pending, "shutting down, draining queue");
                }
            }

            let start = Instant::now();
            if conn.is_none() {
                conn = self.connect().await;
                if conn.is_none() {
                    self.bump_ticks(start);
                    if !self.keep_running.load(Ordering::SeqCst) && self.is_failed() {
                        // can't deliver and never will; drop what is left
                        let left = self.queue.len() as u64;
                        if left > 0 {
                            error!(destination = %self.desc, left, "dropping undeliverable metrics");
                            self.dropped.fetch_add(left, Ordering::Relaxed);
                        }
                        break;
                    }
                    continue;
                }
                idle = 0;
            }

            let batch = self.queue.dequeue_vector(self.conf.batch_size);
            if batch.is_empty() {
                self.bump_ticks(start);
                continue;
            }

            match self.write_batch(conn.as_mut().unwrap(), &batch).await {
                Ok(()) => {
                    if self.failure.swap(0, Ordering::Relaxed) > 0
                        && self.desc.kind == ConnectionKind::Tcp
                    {
                        info!(destination = %self.desc, "connection ok again");
                    }
                    self.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err((written, err)) => {
                    if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                        error!(destination = %self.desc, error = %err, "write failed");
                    }
                    conn = None;
                    self.sent.fetch_add(written as u64, Ordering::Relaxed);
                    // return what we did not get out, oldest first
                    for line in batch.into_iter().skip(written).rev() {
                        if self.queue.putback(line).is_err() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            self.bump_ticks(start);
        }

        self.running.store(false, Ordering::SeqCst);
        debug!(destination = %self.desc, "sender stopped");
    }

    fn bump_ticks(&self, start: Instant) {
        self.ticks_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    fn should_offload(&self) -> bool {
        let Some(secondaries) = self.secondaries.get() else {
            return false;
        };
        if secondaries.is_empty() {
            return false;
        }
        self.failure.load(Ordering::Relaxed) >= FAIL_WAIT_TICKS
            || (!self.conf.failover && self.queue.free() < self.conf.batch_size)
    }

    /// Moves one batch into the secondaries' queues. For any_of the
    /// candidate order is shuffled so the first live peer does not end
    /// up carrying every failed node's traffic. Returns whether any
    /// secondary could take data.
    fn offload_batch(&self) -> bool {
        let secondaries = self.secondaries.get().unwrap();
        let mut order: Vec<usize> = (0..secondaries.len()).collect();
        if !self.conf.failover {
            order.shuffle(&mut rand::rng());
        }

        let mut batch: Vec<Box<[u8]>> = Vec::new();
        let mut placed_anywhere = false;
        for &i in &order {
            let sec = &secondaries[i];
            if sec.is_failed() {
                continue;
            }
            if !self.conf.failover && sec.queue.free() < self.conf.batch_size {
                continue;
            }
            if !placed_anywhere {
                batch = self.queue.dequeue_vector(self.conf.batch_size);
                placed_anywhere = true;
            }
            while let Some(line) = batch.pop() {
                if let Err(line) = sec.queue.putback(line) {
                    batch.push(line);
                    break;
                }
            }
            if batch.is_empty() {
                break;
            }
        }
        // whatever found no home goes back to us, then overboard
        while let Some(line) = batch.pop() {
            if self.queue.putback(line).is_err() {
                self.dropped
                    .fetch_add(1 + batch.len() as u64, Ordering::Relaxed);
                batch.clear();
            }
        }
        if !placed_anywhere {
            debug!(destination = %self.desc, "no secondary could take offload");
        }
        placed_anywhere
    }

    async fn connect(&self) -> Option<EgressConnection> {
        match self.desc.kind {
            ConnectionKind::Pipe => {
                let tx = self.feedback.get()?;
                return Some(EgressConnection::Pipe(tx.clone()));
            }
            ConnectionKind::File => {
                match tokio::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&self.desc.host)
                    .await
                {
                    Ok(file) => return Some(EgressConnection::File(file)),
                    Err(e) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(file = %self.desc.host, error = %e, "failed to open file");
                        }
                        return None;
                    }
                }
            }
            ConnectionKind::Unix => match UnixStream::connect(&self.desc.host).await {
                Ok(stream) => return Some(EgressConnection::Unix(stream)),
                Err(e) => {
                    if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                        error!(socket = %self.desc.host, error = %e, "failed to connect");
                    }
                    return None;
                }
            },
            ConnectionKind::Udp => {
                let local = "0.0.0.0:0";
                let sock = match UdpSocket::bind(local).await {
                    Ok(s) => s,
                    Err(e) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(error = %e, "failed to create udp socket");
                        }
                        return None;
                    }
                };
                match sock
                    .connect((self.desc.host.as_str(), self.desc.port))
                    .await
                {
                    Ok(()) => return Some(EgressConnection::Udp(sock)),
                    Err(e) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(destination = %self.desc, error = %e, "failed to connect udp socket");
                        }
                        return None;
                    }
                }
            }
            ConnectionKind::Tcp => {}
        }

        // TCP, optionally TLS on top
        let connect_timeout = self.conf.io_timeout + jitter_ms(0, 100);
        let attempt = TcpStream::connect((self.desc.host.as_str(), self.desc.port));
        let stream = match timeout(connect_timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                    error!(destination = %self.desc, error = %e, "failed to connect");
                }
                return None;
            }
            Err(_) => {
                if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                    error!(destination = %self.desc, "failed to connect: operation timed out");
                }
                return None;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(destination = %self.desc, error = %e, "cannot set TCP_NODELAY");
        }
        #[cfg(target_os = "linux")]
        {
            let sock = socket2::SockRef::from(&stream);
            if let Err(e) = sock.set_tcp_user_timeout(Some(Duration::from_secs(10))) {
                debug!(destination = %self.desc, error = %e, "cannot set TCP_USER_TIMEOUT");
            }
        }

        match &self.conf.tls {
            None => Some(EgressConnection::Tcp(stream)),
            Some(settings) => {
                let connector = match client_connector(settings) {
                    Ok(c) => c,
                    Err(e) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(destination = %self.desc, error = %e, "TLS setup failed");
                        }
                        return None;
                    }
                };
                let name = match server_name(&self.desc.host) {
                    Ok(n) => n,
                    Err(e) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(destination = %self.desc, error = %e, "TLS setup failed");
                        }
                        return None;
                    }
                };
                match timeout(connect_timeout, connector.connect(name, stream)).await {
                    Ok(Ok(tls)) => Some(EgressConnection::Tls(Box::new(tls))),
                    Ok(Err(e)) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(destination = %self.desc, error = %e, "TLS handshake failed");
                        }
                        None
                    }
                    Err(_) => {
                        if self.failure.fetch_add(1, Ordering::Relaxed) == 0 {
                            error!(destination = %self.desc, "TLS handshake timed out");
                        }
                        None
                    }
                }
            }
        }
    }

    /// Writes `batch` out. On failure returns how many lines made it
    /// plus the error; stream kinds lose the whole compressed frame, so
    /// `written` is 0 or `batch.len()` for those.
    async fn write_batch(
        &self,
        conn: &mut EgressConnection,
        batch: &[Box<[u8]>],
    ) -> Result<(), (usize, std::io::Error)> {
        match conn {
            EgressConnection::Udp(sock) => {
                // datagram per line; no compression on UDP
                for (i, line) in batch.iter().enumerate() {
                    let mut attempt = 0;
                    loop {
                        match sock.send(line).await {
                            Ok(_) => break,
                            Err(e) if is_transient(&e) && attempt + 1 < WRITE_RETRIES => {
                                attempt += 1;
                                sleep(jitter_ms(50, 200)).await;
                            }
                            Err(e) => return Err((i, e)),
                        }
                    }
                }
                Ok(())
            }
            EgressConnection::Pipe(tx) => {
                for (i, line) in batch.iter().enumerate() {
                    tx.send(line.clone()).await.map_err(|_| {
                        (
                            i,
                            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"),
                        )
                    })?;
                }
                Ok(())
            }
            _ => {
                let mut plain = Vec::with_capacity(batch.iter().map(|l| l.len()).sum::<usize>());
                for line in batch {
                    plain.extend_from_slice(line);
                }
                let wire = compress_batch(self.conf.compression, &plain).map_err(|e| (0, e))?;
                let io_timeout = self.conf.io_timeout;
                let mut offset = 0usize;
                let mut attempt = 0;
                while offset < wire.len() {
                    let result = match conn {
                        EgressConnection::Tcp(s) => timed_write(s, &wire[offset..], io_timeout).await,
                        EgressConnection::Tls(s) => {
                            timed_write(s.as_mut(), &wire[offset..], io_timeout).await
                        }
                        EgressConnection::Unix(s) => {
                            timed_write(s, &wire[offset..], io_timeout).await
                        }
                        EgressConnection::File(f) => f.write(&wire[offset..]).await,
                        _ => unreachable!(),
                    };
                    match result {
                        Ok(0) => {
                            return Err((
                                0,
                                std::io::Error::new(
                                    std::io::ErrorKind::WriteZero,
                                    "connection closed",
                                ),
                            ))
                        }
                        Ok(n) => {
                            offset += n;
                            attempt = 0;
                        }
                        Err(e) if is_transient(&e) && attempt + 1 < WRITE_RETRIES => {
                            attempt += 1;
                            sleep(jitter_ms(50, 200)).await;
                        }
                        Err(e) => return Err((0, e)),
                    }
                }
                Ok(())
            }
        }
    }
}

/// One write call bounded by the I/O timeout. A timeout leaves it
/// unknowable whether bytes hit the wire, so it surfaces as a fatal
/// error and the caller abandons the connection.
async fn timed_write<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    io_timeout: Duration,
) -> std::io::Result<usize> {
    match timeout(io_timeout, writer.write(data)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "write timed out",
        )),
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

fn sub_counter(cur: &AtomicU64, prev: &AtomicU64) -> u64 {
    let now = cur.load(Ordering::Relaxed);
    let before = prev.swap(now, Ordering::Relaxed);
    now.saturating_sub(before)
}

fn jitter_ms(low: u64, high: u64) -> Duration {
    Duration::from_millis(rand::rng().random_range(low..high))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_desc(host: &str, port: u16) -> ServerDescriptor {
        ServerDescriptor {
            kind: ConnectionKind::Tcp,
            host: host.to_string(),
            port,
            instance: None,
        }
    }

    fn small_sender(queue_size: usize, max_stalls: usize) -> Arc<Sender> {
        Sender::new(
            tcp_desc("10.0.0.1", 2003),
            SenderConfig {
                queue_size,
                batch_size: 4,
                max_stalls,
                ..SenderConfig::default()
            },
        )
    }

    fn line(s: &str) -> Box<[u8]> {
        s.as_bytes().into()
    }

    #[test]
    fn descriptor_equality_includes_instance() {
        let a = tcp_desc("10.0.0.1", 2003);
        let mut b = tcp_desc("10.0.0.1", 2003);
        assert_eq!(a, b);
        b.instance = Some("x".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn send_accepts_until_full_then_stalls_then_drops() {
        let s = small_sender(8, 2);
        for i in 0..8 {
            assert!(s.send(line(&format!("m{i} 1 1\n")), false).is_ok());
        }
        // queue now full: stall twice, then drops convert
        assert!(s.send(line("x 1 1\n"), false).is_err());
        assert!(s.send(line("x 1 1\n"), false).is_err());
        assert_eq!(s.metrics_stalls(), 2);
        assert!(s.send(line("x 1 1\n"), false).is_ok());
        assert_eq!(s.metrics_dropped(), 1);
        assert_eq!(s.queue_len(), 8);
    }

    #[test]
    fn send_force_never_stalls() {
        let s = small_sender(8, 4);
        for i in 0..10 {
            assert!(s.send(line(&format!("m{i} 1 1\n")), true).is_ok());
        }
        assert_eq!(s.metrics_stalls(), 0);
        assert_eq!(s.metrics_dropped(), 2);
    }

    #[test]
    fn send_drops_immediately_when_failed() {
        let s = small_sender(8, 4);
        s.mark_failed();
        for i in 0..8 {
            assert!(s.send(line(&format!("m{i} 1 1\n")), false).is_ok());
        }
        assert!(s.send(line("x 1 1\n"), false).is_ok());
        assert_eq!(s.metrics_stalls(), 0);
        assert_eq!(s.metrics_dropped(), 1);
    }

    #[test]
    fn stall_sequence_resets_after_room_appears() {
        let s = small_sender(8, 2);
        for i in 0..8 {
            let _ = s.send(line(&format!("m{i} 1 1\n")), false);
        }
        assert!(s.send(line("x 1 1\n"), false).is_err());
        // consumer drains one entry
        s.queue().dequeue();
        assert!(s.send(line("x 1 1\n"), false).is_ok());
        // stallseq was reset, a new full-queue episode stalls again
        assert!(s.send(line("y 1 1\n"), false).is_err());
    }

    #[test]
    fn live_secondary_converts_drop_into_stall() {
        let s = small_sender(8, 4);
        let peer = small_sender(8, 4);
        s.set_secondaries(vec![peer.clone()]);
        s.mark_failed();
        for i in 0..8 {
            let _ = s.send(line(&format!("m{i} 1 1\n")), false);
        }
        // failed, but the live peer makes recovery plausible: stall
        assert!(s.send(line("x 1 1\n"), false).is_err());
        assert_eq!(s.metrics_stalls(), 1);
        peer.mark_failed();
        // all peers failed too: drop
        assert!(s.send(line("x 1 1\n"), false).is_ok());
        assert_eq!(s.metrics_dropped(), 1);
    }

    #[test]
    fn transplant_moves_queue_and_counters() {
        let old = small_sender(8, 4);
        old.send(line("a 1 1\n"), false).unwrap();
        old.send(line("b 1 1\n"), false).unwrap();
        old.sent.store(7, Ordering::Relaxed);
        let new = small_sender(8, 4);
        new.transplant_from(&old);
        assert_eq!(new.queue_len(), 2);
        assert_eq!(old.queue_len(), 0);
        assert_eq!(new.metrics_sent(), 7);
    }

    #[test]
    fn sub_counters_report_deltas() {
        let s = small_sender(8, 4);
        s.sent.store(5, Ordering::Relaxed);
        assert_eq!(s.metrics_sent_sub(), 5);
        s.sent.store(9, Ordering::Relaxed);
        assert_eq!(s.metrics_sent_sub(), 4);
        assert_eq!(s.metrics_sent_sub(), 0);
        assert_eq!(s.metrics_sent(), 9);
    }

    #[tokio::test]
    async fn pipe_sender_delivers_into_the_feedback_channel() {
        let sender = Sender::new(
            ServerDescriptor {
                kind: ConnectionKind::Pipe,
                host: "internal".to_string(),
                port: 0,
                instance: None,
            },
            SenderConfig {
                queue_size: 16,
                batch_size: 4,
                ..SenderConfig::default()
            },
        );
        let (tx, mut rx) = mpsc::channel(16);
        sender.set_feedback(tx);
        sender.send(line("looped.metric 1 100\n"), false).unwrap();

        let task = tokio::spawn(Arc::clone(&sender).run());
        let received = rx.recv().await.unwrap();
        assert_eq!(&*received, b"looped.metric 1 100\n");

        sender.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn run_drains_queue_to_tcp_listener() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = Sender::new(
            tcp_desc("127.0.0.1", addr.port()),
            SenderConfig {
                queue_size: 64,
                batch_size: 8,
                ..SenderConfig::default()
            },
        );
        sender.send(line("foo.bar 1 100\n"), false).unwrap();
        sender.send(line("foo.baz 2 100\n"), false).unwrap();

        let task = tokio::spawn(Arc::clone(&sender).run());
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while buf.len() < 28 {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&buf, b"foo.bar 1 100\nfoo.baz 2 100\n");

        sender.stop();
        task.await.unwrap();
        assert_eq!(sender.metrics_sent(), 2);
    }
}
