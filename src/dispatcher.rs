//! Ingress: listeners, connection tasks, and the one-pass metric
//! sanitiser
//!
//! Every accepted connection gets its own task that reads, splits and
//! cleans metric lines, runs them through the route table, and hands
//! the results to the destination senders. Backpressure propagates
//! naturally: while a destination stalls, the task stops reading and
//! the client's socket buffer fills up.
//!
//! Metric paths get sanitised because downstream whisper files are
//! named after them: separators collapse to a single dot, disallowed
//! bytes become underscores, and tags (after `;`) pass through
//! untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::router::Router;
use crate::stream::{IngressDecoder, WireCompression};

/// Connections with nothing to say for this long are closed.
const IDLE_DISCONNECT: Duration = Duration::from_secs(10 * 60);

/// Default characters accepted in metric names besides `[A-Za-z0-9]`.
/// `;` is absent, which enables tag passthrough.
pub const DEFAULT_ALLOWED_CHARS: &str = "-_:#";

/// Ingress counters, shared by all listener and connection tasks.
#[derive(Default)]
pub struct DispatchStats {
    metrics: AtomicU64,
    blackholes: AtomicU64,
    discards: AtomicU64,
    accepted: AtomicU64,
    closed: AtomicU64,
    prev_metrics: AtomicU64,
    prev_blackholes: AtomicU64,
    prev_discards: AtomicU64,
}

impl DispatchStats {
    pub fn metrics(&self) -> u64 {
        self.metrics.load(Ordering::Relaxed)
    }

    pub fn blackholes(&self) -> u64 {
        self.blackholes.load(Ordering::Relaxed)
    }

    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn metrics_sub(&self) -> u64 {
        sub(&self.metrics, &self.prev_metrics)
    }

    pub fn blackholes_sub(&self) -> u64 {
        sub(&self.blackholes, &self.prev_blackholes)
    }

    pub fn discards_sub(&self) -> u64 {
        sub(&self.discards, &self.prev_discards)
    }
}

fn sub(cur: &AtomicU64, prev: &AtomicU64) -> u64 {
    let now = cur.load(Ordering::Relaxed);
    let before = prev.swap(now, Ordering::Relaxed);
    now.saturating_sub(before)
}

/// Sanitiser settings, fixed at startup.
pub struct SanitiseConfig {
    pub max_line_length: usize,
    pub max_metric_length: usize,
    allowed: [bool; 256],
    tags_supported: bool,
}

impl SanitiseConfig {
    #[must_use]
    pub fn new(max_line_length: usize, max_metric_length: usize, allowed_chars: &str) -> Self {
        let mut allowed = [false; 256];
        for &b in allowed_chars.as_bytes() {
            allowed[b as usize] = true;
        }
        Self {
            max_line_length,
            max_metric_length,
            allowed,
            // tag support switches off when ';' is claimed as a plain
            // name character
            tags_supported: !allowed[b';' as usize],
        }
    }
}

impl Default for SanitiseConfig {
    fn default() -> Self {
        Self::new(32_768, 32_768, DEFAULT_ALLOWED_CHARS)
    }
}

/// Everything a connection task needs; cheap to clone.
#[derive(Clone)]
pub struct DispatchContext {
    pub router: watch::Receiver<Arc<Router>>,
    /// Reload hold: while true, client traffic pauses (aggregator
    /// feedback keeps flowing).
    pub hold: watch::Receiver<bool>,
    /// Flips to false on shutdown.
    pub running: watch::Receiver<bool>,
    pub stats: Arc<DispatchStats>,
    pub sanitise: Arc<SanitiseConfig>,
}

#[derive(Clone, Copy, PartialEq)]
enum TagState {
    Disabled,
    Searching,
    Inside,
}

/// Accumulates bytes into sanitised metric lines, carrying partial
/// lines across reads.
pub struct MetricAssembler {
    sanitise: Arc<SanitiseConfig>,
    metric: Vec<u8>,
    firstspace: Option<usize>,
    tags: TagState,
}

impl MetricAssembler {
    #[must_use]
    pub fn new(sanitise: Arc<SanitiseConfig>) -> Self {
        let tags = if sanitise.tags_supported {
            TagState::Searching
        } else {
            TagState::Disabled
        };
        Self {
            sanitise,
            metric: Vec::new(),
            firstspace: None,
            tags,
        }
    }

    fn reset(&mut self) {
        self.metric.clear();
        self.firstspace = None;
        self.tags = if self.sanitise.tags_supported {
            TagState::Searching
        } else {
            TagState::Disabled
        };
    }

    /// Feeds raw (already decompressed) bytes; complete sanitised lines
    /// are appended to `lines` as (line, firstspace) pairs, each line
    /// `\n`-terminated.
    pub fn feed(&mut self, buf: &[u8], lines: &mut Vec<(Vec<u8>, usize)>, stats: &DispatchStats) {
        for &byte in buf {
            match byte {
                b'\n' | b'\r' => {
                    let too_long = self.metric.len() > self.sanitise.max_line_length - 1
                        || self
                            .firstspace
                            .is_some_and(|fs| fs > self.sanitise.max_metric_length);
                    if self.metric.is_empty() || self.firstspace.is_none() || too_long {
                        // bare newline, garbage, or over the limits
                        stats.discards.fetch_add(1, Ordering::Relaxed);
                        self.reset();
                        continue;
                    }
                    stats.metrics.fetch_add(1, Ordering::Relaxed);
                    self.metric.push(b'\n');
                    lines.push((
                        std::mem::take(&mut self.metric),
                        self.firstspace.unwrap(),
                    ));
                    self.reset();
                }
                b' ' | b'\t' | b'.' if self.tags != TagState::Inside => {
                    if self.metric.is_empty() {
                        // don't let a leading separator start a name
                        continue;
                    }
                    let byte = if byte == b'\t' { b' ' } else { byte };
                    if byte == b' ' && self.firstspace.is_none() {
                        if self.metric.last() == Some(&b'.') {
                            // strip trailing separator off the name
                            self.metric.pop();
                        }
                        self.firstspace = Some(self.metric.len());
                        self.metric.push(b' ');
                    } else {
                        // collapse duplicates, never right after the
                        // name/value boundary
                        let last = self.metric.len() - 1;
                        if self.metric[last] != byte && Some(last) != self.firstspace {
                            self.metric.push(byte);
                        }
                    }
                }
                b';' if self.tags == TagState::Searching => {
                    // tags pass through verbatim from here on; the name
                    // range for matching ends where they start
                    self.tags = TagState::Inside;
                    self.firstspace = Some(self.metric.len());
                    self.metric.push(b';');
                }
                0 => {
                    self.metric.push(b'_');
                }
                _ => {
                    if self.firstspace.is_some()
                        || byte.is_ascii_alphanumeric()
                        || self.sanitise.allowed[byte as usize]
                    {
                        self.metric.push(byte);
                    } else {
                        self.metric.push(b'_');
                    }
                }
            }
        }
    }
}

/// Routes one sanitised line and delivers it, stalling the caller when
/// a destination queue is full. `force` skips stalling (aggregator and
/// collector feedback must never block).
pub async fn dispatch_line(
    router: &Router,
    stats: &DispatchStats,
    mut line: Vec<u8>,
    mut firstspace: usize,
    srcaddr: &str,
    force: bool,
) {
    let mut dests = Vec::new();
    let blackholed = router.route(&mut line, &mut firstspace, srcaddr, &mut dests);
    if blackholed {
        stats.blackholes.fetch_add(1, Ordering::Relaxed);
    }

    let mut deadline: Option<Instant> = None;
    let mut idx = 0;
    while idx < dests.len() {
        let forced = force || deadline.is_some_and(|d| Instant::now() >= d);
        let (sender, slot) = &mut dests[idx];
        let payload = std::mem::take(slot);
        match sender.send(payload, forced) {
            Ok(()) => idx += 1,
            Err(payload) => {
                *slot = payload;
                if deadline.is_none() {
                    // randomised so stalled connections don't retry in
                    // lockstep
                    let wait = rand::rng().random_range(250..1000);
                    deadline = Some(Instant::now() + Duration::from_millis(wait));
                }
                sleep(Duration::from_millis(30)).await;
            }
        }
    }
}

/// Parks while a reload holds client traffic.
async fn wait_for_release(hold: &mut watch::Receiver<bool>) {
    while *hold.borrow() {
        if hold.changed().await.is_err() {
            return;
        }
    }
}

/// One ingress connection: read, decode, split, route, deliver.
pub async fn run_connection<R>(
    mut stream: R,
    mut ctx: DispatchContext,
    compression: WireCompression,
    srcaddr: String,
    noexpire: bool,
) where
    R: AsyncRead + Unpin,
{
    ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
    let mut assembler = MetricAssembler::new(Arc::clone(&ctx.sanitise));
    let mut decoder = IngressDecoder::new(compression);
    let mut raw = vec![0u8; 8192];
    let mut decoded = Vec::new();
    let mut lines = Vec::new();

    loop {
        let read = async {
            if noexpire {
                Ok(stream.read(&mut raw).await)
            } else {
                timeout(IDLE_DISCONNECT, stream.read(&mut raw)).await
            }
        };
        let n = tokio::select! {
            result = read => match result {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(source = %srcaddr, error = %e, "read failed");
                    break;
                }
                Err(_) => {
                    debug!(source = %srcaddr, "idle disconnect");
                    break;
                }
            },
            _ = ctx.running.changed() => {
                if !*ctx.running.borrow() {
                    break;
                }
                continue;
            }
        };

        decoded.clear();
        if let Err(e) = decoder.feed(&raw[..n], &mut decoded) {
            warn!(source = %srcaddr, error = %e, "stream decode failed, closing");
            break;
        }

        if !noexpire {
            wait_for_release(&mut ctx.hold).await;
        }

        lines.clear();
        assembler.feed(&decoded, &mut lines, &ctx.stats);
        let router = ctx.router.borrow().clone();
        for (line, firstspace) in lines.drain(..) {
            dispatch_line(&router, &ctx.stats, line, firstspace, &srcaddr, noexpire).await;
        }
    }

    ctx.stats.closed.fetch_add(1, Ordering::Relaxed);
}

/// Accept loop for a TCP listener, optionally TLS-wrapped.
pub async fn run_tcp_listener(
    listener: TcpListener,
    ctx: DispatchContext,
    tls: Option<TlsAcceptor>,
    compression: WireCompression,
) {
    let mut running = ctx.running.clone();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let srcaddr = peer.ip().to_string();
        let ctx = ctx.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                None => run_connection(stream, ctx, compression, srcaddr, false).await,
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        run_connection(stream, ctx, compression, srcaddr, false).await;
                    }
                    Err(e) => {
                        warn!(source = %srcaddr, error = %e, "TLS accept failed");
                    }
                },
            }
        });
    }
    info!("listener stopped");
}

/// Accept loop for a UNIX stream listener.
pub async fn run_unix_listener(
    listener: UnixListener,
    ctx: DispatchContext,
    compression: WireCompression,
) {
    let mut running = ctx.running.clone();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
        };
        match accepted {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                tokio::spawn(run_connection(
                    stream,
                    ctx,
                    compression,
                    "unix".to_string(),
                    false,
                ));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

/// Datagram loop for a UDP socket. UDP peers never expire.
pub async fn run_udp_socket(
    socket: UdpSocket,
    mut ctx: DispatchContext,
    compression: WireCompression,
) {
    let mut assembler = MetricAssembler::new(Arc::clone(&ctx.sanitise));
    let mut raw = vec![0u8; 65_536];
    let mut lines = Vec::new();
    let mut running = ctx.running.clone();
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut raw) => received,
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
        };
        let (n, peer) = match received {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                continue;
            }
        };
        // datagrams decode independently
        let mut decoder = IngressDecoder::new(compression);
        let mut decoded = Vec::new();
        if let Err(e) = decoder.feed(&raw[..n], &mut decoded) {
            warn!(error = %e, "udp datagram decode failed");
            continue;
        }
        wait_for_release(&mut ctx.hold).await;
        lines.clear();
        assembler.feed(&decoded, &mut lines, &ctx.stats);
        let srcaddr = peer.ip().to_string();
        let router = ctx.router.borrow().clone();
        for (line, firstspace) in lines.drain(..) {
            dispatch_line(&router, &ctx.stats, line, firstspace, &srcaddr, false).await;
        }
    }
}

/// The feedback loop: lines emitted by aggregators and the collector
/// re-enter routing here. Never held, never expired, never stalled.
/// `stop` flips once the emitters have drained; buffered lines are
/// still delivered before the loop exits.
pub async fn run_feedback(
    mut rx: mpsc::Receiver<Box<[u8]>>,
    ctx: DispatchContext,
    mut stop: watch::Receiver<bool>,
) {
    let mut assembler = MetricAssembler::new(Arc::clone(&ctx.sanitise));
    let mut lines = Vec::new();
    let mut draining = false;
    loop {
        let emitted = if draining {
            match rx.try_recv() {
                Ok(line) => Some(line),
                Err(_) => None,
            }
        } else {
            tokio::select! {
                received = rx.recv() => received,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        draining = true;
                    }
                    continue;
                }
            }
        };
        let Some(emitted) = emitted else { break };
        lines.clear();
        assembler.feed(&emitted, &mut lines, &ctx.stats);
        let router = ctx.router.borrow().clone();
        for (line, firstspace) in lines.drain(..) {
            dispatch_line(&router, &ctx.stats, line, firstspace, "relay", true).await;
        }
    }
    debug!("feedback loop closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(input: &[u8]) -> (Vec<String>, u64, u64) {
        let stats = DispatchStats::default();
        let mut assembler = MetricAssembler::new(Arc::new(SanitiseConfig::default()));
        let mut lines = Vec::new();
        assembler.feed(input, &mut lines, &stats);
        let texts = lines
            .iter()
            .map(|(l, _)| String::from_utf8_lossy(l).into_owned())
            .collect();
        (texts, stats.metrics(), stats.discards())
    }

    #[test]
    fn plain_line_passes_through() {
        let (lines, metrics, discards) = assemble(b"foo.bar 1 100\n");
        assert_eq!(lines, vec!["foo.bar 1 100\n"]);
        assert_eq!(metrics, 1);
        assert_eq!(discards, 0);
    }

    #[test]
    fn firstspace_points_at_name_end() {
        let stats = DispatchStats::default();
        let mut assembler = MetricAssembler::new(Arc::new(SanitiseConfig::default()));
        let mut lines = Vec::new();
        assembler.feed(b"foo.bar 1 100\n", &mut lines, &stats);
        let (line, fs) = &lines[0];
        assert_eq!(&line[..*fs], b"foo.bar");
    }

    #[test]
    fn separators_collapse_to_single_dot() {
        let (lines, ..) = assemble(b"foo..bar...baz 1 100\n");
        assert_eq!(lines, vec!["foo.bar.baz 1 100\n"]);
    }

    #[test]
    fn tabs_become_name_boundary() {
        let (lines, ..) = assemble(b"foo.bar\t1\t100\n");
        assert_eq!(lines, vec!["foo.bar 1 100\n"]);
    }

    #[test]
    fn leading_separators_are_stripped() {
        let (lines, ..) = assemble(b"..foo.bar 1 100\n");
        assert_eq!(lines, vec!["foo.bar 1 100\n"]);
    }

    #[test]
    fn trailing_name_separator_is_stripped() {
        let (lines, ..) = assemble(b"foo.bar. 1 100\n");
        assert_eq!(lines, vec!["foo.bar 1 100\n"]);
    }

    #[test]
    fn forbidden_bytes_become_underscores() {
        let (lines, ..) = assemble(b"foo.b@r/baz 1 100\n");
        assert_eq!(lines, vec!["foo.b_r_baz 1 100\n"]);
    }

    #[test]
    fn allowed_extras_survive() {
        let (lines, ..) = assemble(b"host:port#x-y_z 1 100\n");
        assert_eq!(lines, vec!["host:port#x-y_z 1 100\n"]);
    }

    #[test]
    fn tags_pass_verbatim() {
        let (lines, ..) = assemble(b"cpu;host=web@1;dc=ams 1 100\n");
        assert_eq!(lines, vec!["cpu;host=web@1;dc=ams 1 100\n"]);
    }

    #[test]
    fn tag_start_marks_name_end() {
        let stats = DispatchStats::default();
        let mut assembler = MetricAssembler::new(Arc::new(SanitiseConfig::default()));
        let mut lines = Vec::new();
        assembler.feed(b"cpu.total;host=web 1 100\n", &mut lines, &stats);
        let (line, fs) = &lines[0];
        assert_eq!(&line[..*fs], b"cpu.total");
    }

    #[test]
    fn missing_value_is_discarded() {
        let (lines, metrics, discards) = assemble(b"loneliness\n");
        assert!(lines.is_empty());
        assert_eq!(metrics, 0);
        assert_eq!(discards, 1);
    }

    #[test]
    fn empty_lines_count_as_discards() {
        let (lines, _, discards) = assemble(b"\n\n");
        assert!(lines.is_empty());
        assert_eq!(discards, 2);
    }

    #[test]
    fn partial_lines_carry_across_reads() {
        let stats = DispatchStats::default();
        let mut assembler = MetricAssembler::new(Arc::new(SanitiseConfig::default()));
        let mut lines = Vec::new();
        assembler.feed(b"foo.ba", &mut lines, &stats);
        assert!(lines.is_empty());
        assembler.feed(b"r 1 100\nnext.one 2 ", &mut lines, &stats);
        assert_eq!(lines.len(), 1);
        assembler.feed(b"200\n", &mut lines, &stats);
        assert_eq!(lines.len(), 2);
        assert_eq!(String::from_utf8_lossy(&lines[1].0), "next.one 2 200\n");
    }

    #[test]
    fn line_at_the_bound_is_accepted_one_over_is_discarded() {
        let sanitise = Arc::new(SanitiseConfig::new(64, 64, DEFAULT_ALLOWED_CHARS));
        let stats = DispatchStats::default();
        let mut assembler = MetricAssembler::new(Arc::clone(&sanitise));
        let mut lines = Vec::new();

        // name + " 1 100" + "\n" == exactly 64 bytes
        let name = "m".repeat(64 - 7);
        assembler.feed(format!("{name} 1 100\n").as_bytes(), &mut lines, &stats);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0.len(), 64);
        assert_eq!(stats.discards(), 0);

        let name = "m".repeat(64 - 6);
        assembler.feed(format!("{name} 1 100\n").as_bytes(), &mut lines, &stats);
        assert_eq!(lines.len(), 1);
        assert_eq!(stats.discards(), 1);
    }

    #[test]
    fn crlf_terminates_once_and_discards_the_empty_rest() {
        let (lines, metrics, discards) = assemble(b"foo 1 100\r\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(metrics, 1);
        // the \n after \r looks like an empty line
        assert_eq!(discards, 1);
    }
}
