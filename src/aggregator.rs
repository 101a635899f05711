//! Time-bucketed metric aggregation
//!
//! Each aggregator owns a set of computes (sum, count, max, ...), each
//! compute a concurrent map of invocations keyed by the derived output
//! metric name. An invocation is a ring of interval-aligned buckets
//! covering `expire` seconds of the past plus a little future slack.
//! Dispatcher tasks call [`Aggregator::put_metric`] concurrently; one
//! expiry task per aggregator emits completed buckets through the
//! feedback channel, where the stub route re-enters them into normal
//! routing.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::route::{rewrite_metric, MatchSpans};

const BUCKET_OPEN: u8 = 0;
const BUCKET_EXPIRING: u8 = 1;

/// Where the emitted timestamp sits within the bucket window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsWhen {
    Start,
    Middle,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeKind {
    Sum,
    Count,
    Max,
    Min,
    Average,
    Median,
    Percentile,
    Variance,
    Stddev,
}

impl ComputeKind {
    /// Whether this computation needs every raw value kept around.
    #[must_use]
    pub fn needs_entries(&self) -> bool {
        matches!(
            self,
            ComputeKind::Median | ComputeKind::Percentile | ComputeKind::Variance | ComputeKind::Stddev
        )
    }
}

struct BucketData {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
    values: Vec<f64>,
}

struct Bucket {
    state: AtomicU8,
    start: AtomicI64,
    data: Mutex<BucketData>,
}

impl Bucket {
    fn new(start: i64) -> Self {
        Self {
            state: AtomicU8::new(BUCKET_OPEN),
            start: AtomicI64::new(start),
            data: Mutex::new(BucketData {
                count: 0,
                sum: 0.0,
                min: 0.0,
                max: 0.0,
                values: Vec::new(),
            }),
        }
    }
}

struct Invocation {
    /// Splayed expiry: `expire + [0, interval)` so invocations created
    /// in one burst do not all expire in the same tick.
    expire: i64,
    buckets: Vec<Bucket>,
}

/// One output metric derivation attached to an aggregator.
pub struct Compute {
    pub kind: ComputeKind,
    pub percentile: u8,
    /// Output name template; stub prefix included once assigned.
    pub metric: String,
    needs_entries: bool,
    invocations: DashMap<Vec<u8>, Invocation>,
}

impl Compute {
    #[must_use]
    pub fn new(kind: ComputeKind, percentile: u8, metric: String) -> Self {
        let percentile = if kind == ComputeKind::Median { 50 } else { percentile };
        Self {
            kind,
            percentile,
            metric,
            needs_entries: kind.needs_entries(),
            invocations: DashMap::new(),
        }
    }
}

pub struct Aggregator {
    pub interval: u64,
    pub expire: u64,
    pub tswhen: TsWhen,
    bucketcnt: usize,
    computes: Vec<Compute>,
    stub_prefix: Vec<u8>,

    keep_running: AtomicBool,
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    prev_received: AtomicU64,
    prev_sent: AtomicU64,
    prev_dropped: AtomicU64,
}

impl Aggregator {
    /// Builds an aggregator holding buckets matching `interval` and
    /// `expire`. `interval` must be shorter than `expire`.
    #[must_use]
    pub fn new(interval: u64, expire: u64, tswhen: TsWhen, computes: Vec<Compute>) -> Self {
        debug_assert!(interval > 0 && interval < expire);
        // past windows still within expiry, plus the current one, plus
        // one of future slack
        let bucketcnt = (expire as usize).div_ceil(interval as usize) + 2;
        Self {
            interval,
            expire,
            tswhen,
            bucketcnt,
            computes,
            stub_prefix: Vec::new(),
            keep_running: AtomicBool::new(true),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            prev_received: AtomicU64::new(0),
            prev_sent: AtomicU64::new(0),
            prev_dropped: AtomicU64::new(0),
        }
    }

    /// Prefixes every compute's output name with the stub token that
    /// routes emissions back through the table. Must be called before
    /// any metric is put.
    pub fn set_stub(&mut self, prefix: &[u8]) {
        self.stub_prefix = prefix.to_vec();
        for compute in &mut self.computes {
            let mut name = String::from_utf8_lossy(prefix).into_owned();
            name.push_str(&compute.metric);
            compute.metric = name;
        }
    }

    #[must_use]
    pub fn stub_prefix(&self) -> &[u8] {
        &self.stub_prefix
    }

    #[must_use]
    pub fn computes(&self) -> &[Compute] {
        &self.computes
    }

    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }

    pub fn metrics_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn metrics_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn metrics_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn metrics_received_sub(&self) -> u64 {
        sub_counter(&self.received, &self.prev_received)
    }

    pub fn metrics_sent_sub(&self) -> u64 {
        sub_counter(&self.sent, &self.prev_sent)
    }

    pub fn metrics_dropped_sub(&self) -> u64 {
        sub_counter(&self.dropped, &self.prev_dropped)
    }

    /// Absorbs one metric line into the matching buckets. `spans` are
    /// the capture spans of the route that matched; with no captures
    /// each compute's literal output name is used.
    pub fn put_metric(&self, line: &[u8], firstspace: usize, nmatch: usize, spans: &MatchSpans) {
        // no new values once shutdown has begun
        if !self.keep_running.load(Ordering::SeqCst) {
            return;
        }

        let Some((value, epoch)) = parse_value_epoch(&line[firstspace..]) else {
            debug!("aggregator: dropping incorrect metric");
            return;
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        for compute in &self.computes {
            let ometric: Vec<u8> = if nmatch == 0 {
                compute.metric.as_bytes().to_vec()
            } else {
                match rewrite_metric(line, firstspace, &compute.metric, spans) {
                    Some((rewritten, newfs)) => rewritten[..newfs].to_vec(),
                    None => continue,
                }
            };

            // cheap lookup first; creation takes the shard write lock
            if !compute.invocations.contains_key(&ometric) {
                compute
                    .invocations
                    .entry(ometric.clone())
                    .or_insert_with(|| self.new_invocation());
            }
            let Some(invocation) = compute.invocations.get(&ometric) else {
                continue;
            };

            let itime = epoch - invocation.buckets[0].start.load(Ordering::Relaxed);
            if itime < 0 {
                // too far in the past
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if itime >= (self.bucketcnt as i64) * (self.interval as i64) {
                debug!(epoch, "aggregator: dropping metric too far in the future");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let bucket = &invocation.buckets[(itime / self.interval as i64) as usize];
            if bucket.state.load(Ordering::SeqCst) == BUCKET_EXPIRING {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut data = bucket.data.lock().unwrap();
            if data.count == 0 {
                data.sum = value;
                data.min = value;
                data.max = value;
            } else {
                data.sum += value;
                if data.max < value {
                    data.max = value;
                }
                if data.min > value {
                    data.min = value;
                }
            }
            if compute.needs_entries {
                data.values.push(value);
            }
            data.count += 1;
        }
    }

    fn new_invocation(&self) -> Invocation {
        let interval = self.interval as i64;
        let expire = self.expire as i64;
        // start in the past, aligned to interval boundaries, so the
        // expiry conditions hold from the first put on
        let now = epoch_now();
        let start = ((now - expire) / interval) * interval;
        let splay = rand::rng().random_range(0..self.interval) as i64;
        Invocation {
            expire: expire + splay,
            buckets: (0..self.bucketcnt)
                .map(|i| Bucket::new(start + (i as i64) * interval))
                .collect(),
        }
    }

    /// The expiry task: emits completed buckets, rotates the rings, and
    /// reaps idle invocations. Terminates once stopped and drained.
    pub async fn run(self: Arc<Self>, feedback: mpsc::Sender<Box<[u8]>>) {
        loop {
            let mut work = 0usize;
            let shutting_down = !self.keep_running.load(Ordering::SeqCst);
            // during shutdown pretend to be far enough in the future
            // that every completed bucket expires now
            let now = epoch_now()
                + if shutting_down {
                    (self.expire - self.interval) as i64
                } else {
                    0
                };

            for compute in &self.computes {
                let mut emissions: Vec<Box<[u8]>> = Vec::new();

                for entry in compute.invocations.iter() {
                    let invocation = entry.value();
                    for bucket in &invocation.buckets {
                        let expire = if shutting_down {
                            self.expire as i64
                        } else {
                            invocation.expire
                        };
                        if bucket.start.load(Ordering::Relaxed) + expire >= now {
                            break;
                        }
                        if bucket
                            .state
                            .compare_exchange(
                                BUCKET_OPEN,
                                BUCKET_EXPIRING,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_err()
                        {
                            continue;
                        }
                        work += 1;
                        // empty buckets expire silently
                        let line = {
                            let data = bucket.data.lock().unwrap();
                            if data.count == 0 {
                                None
                            } else {
                                Some(self.format_metric(
                                    entry.key(),
                                    compute,
                                    &data,
                                    bucket.start.load(Ordering::Relaxed),
                                ))
                            }
                        };
                        emissions.extend(line);
                    }
                }

                // writes happen with no invocation references held
                for line in emissions {
                    match feedback.send(line).await {
                        Ok(()) => {
                            self.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            error!("aggregator: failed to write to feedback channel");
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }

                // rotate expired buckets to the tail and drop
                // invocations that have gone completely quiet
                compute.invocations.retain(|_, invocation| {
                    let interval = self.interval as i64;
                    let mut expired = 0;
                    while expired < invocation.buckets.len()
                        && invocation.buckets[expired].state.load(Ordering::SeqCst)
                            == BUCKET_EXPIRING
                    {
                        expired += 1;
                    }
                    if expired > 0 {
                        let n = invocation.buckets.len();
                        let last_start =
                            invocation.buckets[n - 1].start.load(Ordering::Relaxed);
                        invocation.buckets.rotate_left(expired);
                        for (recycled, i) in (n - expired..n).enumerate() {
                            let bucket = &invocation.buckets[i];
                            bucket.start.store(
                                last_start + (recycled as i64 + 1) * interval,
                                Ordering::Relaxed,
                            );
                            let mut data = bucket.data.lock().unwrap();
                            data.count = 0;
                            data.sum = 0.0;
                            data.min = 0.0;
                            data.max = 0.0;
                            data.values = Vec::new();
                            drop(data);
                            bucket.state.store(BUCKET_OPEN, Ordering::SeqCst);
                        }
                    }
                    invocation
                        .buckets
                        .iter()
                        .any(|b| b.data.lock().unwrap().count != 0)
                });
            }

            if work == 0 {
                if shutting_down {
                    break;
                }
                sleep(Duration::from_millis(250)).await;
            }
        }
        debug!("aggregator stopped");
    }

    fn format_metric(&self, name: &[u8], compute: &Compute, data: &BucketData, start: i64) -> Box<[u8]> {
        let ts = match self.tswhen {
            TsWhen::Start => start,
            TsWhen::Middle => start + (self.interval / 2) as i64,
            TsWhen::End => start + self.interval as i64,
        };

        let mut out = Vec::with_capacity(name.len() + 32);
        out.extend_from_slice(name);
        out.push(b' ');
        match compute.kind {
            ComputeKind::Count => {
                out.extend_from_slice(data.count.to_string().as_bytes());
            }
            ComputeKind::Sum => push_f64(&mut out, data.sum),
            ComputeKind::Max => push_f64(&mut out, data.max),
            ComputeKind::Min => push_f64(&mut out, data.min),
            ComputeKind::Average => push_f64(&mut out, data.sum / data.count as f64),
            ComputeKind::Median | ComputeKind::Percentile => {
                let mut values = data.values.clone();
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                // nearest rank
                let k = ((f64::from(compute.percentile) / 100.0) * data.count as f64 + 0.9)
                    as usize;
                let k = k.clamp(1, values.len());
                push_f64(&mut out, values[k - 1]);
            }
            ComputeKind::Variance | ComputeKind::Stddev => {
                let avg = data.sum / data.count as f64;
                let var = data
                    .values
                    .iter()
                    .map(|v| (v - avg) * (v - avg))
                    .sum::<f64>()
                    / data.count as f64;
                push_f64(
                    &mut out,
                    if compute.kind == ComputeKind::Variance {
                        var
                    } else {
                        var.sqrt()
                    },
                );
            }
        }
        out.push(b' ');
        out.extend_from_slice(ts.to_string().as_bytes());
        out.push(b'\n');
        out.into_boxed_slice()
    }
}

fn push_f64(out: &mut Vec<u8>, value: f64) {
    out.extend_from_slice(format!("{value}").as_bytes());
}

fn sub_counter(cur: &AtomicU64, prev: &AtomicU64) -> u64 {
    let now = cur.load(Ordering::Relaxed);
    let before = prev.swap(now, Ordering::Relaxed);
    now.saturating_sub(before)
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Parses ` value epoch` off the tail of a metric line.
fn parse_value_epoch(tail: &[u8]) -> Option<(f64, i64)> {
    let text = std::str::from_utf8(tail).ok()?;
    let mut fields = text.split_ascii_whitespace();
    let value: f64 = fields.next()?.parse().ok()?;
    let epoch: i64 = fields.next()?.parse().ok()?;
    if epoch < 0 {
        return None;
    }
    Some((value, epoch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_spans() -> MatchSpans {
        MatchSpans::default()
    }

    fn aggregator(computes: Vec<Compute>) -> Arc<Aggregator> {
        Arc::new(Aggregator::new(10, 60, TsWhen::End, computes))
    }

    fn put(aggr: &Aggregator, line: &str) {
        let firstspace = line.find(' ').unwrap();
        aggr.put_metric(line.as_bytes(), firstspace, 0, &no_spans());
    }

    fn bucket0_start(aggr: &Aggregator) -> i64 {
        let compute = &aggr.computes()[0];
        let entry = compute.invocations.iter().next().unwrap();
        entry.value().buckets[0].start.load(Ordering::Relaxed)
    }

    #[test]
    fn bucket_count_covers_expiry_plus_slack() {
        let a = aggregator(vec![Compute::new(ComputeKind::Sum, 0, "out".into())]);
        assert_eq!(a.bucketcnt, 8); // ceil(60/10) + 2
        let b = Aggregator::new(7, 60, TsWhen::Start, vec![]);
        assert_eq!(b.bucketcnt, 11); // ceil(60/7) = 9, + 2
    }

    #[test]
    fn values_accumulate_in_one_bucket() {
        let a = aggregator(vec![Compute::new(ComputeKind::Sum, 0, "out".into())]);
        let now = epoch_now();
        put(&a, &format!("sys.a 1 {now}\n"));
        put(&a, &format!("sys.a 2 {now}\n"));
        assert_eq!(a.metrics_received(), 2);
        assert_eq!(a.metrics_dropped(), 0);
        let compute = &a.computes()[0];
        assert_eq!(compute.invocations.len(), 1);
        let entry = compute.invocations.get(b"out".as_ref()).unwrap();
        let total: usize = entry
            .buckets
            .iter()
            .map(|b| b.data.lock().unwrap().count)
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn epoch_below_first_bucket_drops_too_old() {
        let a = aggregator(vec![Compute::new(ComputeKind::Sum, 0, "out".into())]);
        let now = epoch_now();
        put(&a, &format!("sys.a 1 {now}\n"));
        let start = bucket0_start(&a);
        // exactly at the boundary is accepted
        put(&a, &format!("sys.a 1 {start}\n"));
        assert_eq!(a.metrics_dropped(), 0);
        // one second before is too old
        put(&a, &format!("sys.a 1 {}\n", start - 1));
        assert_eq!(a.metrics_dropped(), 1);
    }

    #[test]
    fn epoch_beyond_ring_drops_too_new() {
        let a = aggregator(vec![Compute::new(ComputeKind::Sum, 0, "out".into())]);
        let now = epoch_now();
        put(&a, &format!("sys.a 1 {now}\n"));
        let start = bucket0_start(&a);
        let beyond = start + 8 * 10; // bucketcnt * interval
        put(&a, &format!("sys.a 1 {beyond}\n"));
        assert_eq!(a.metrics_dropped(), 1);
        put(&a, &format!("sys.a 1 {}\n", beyond - 1));
        assert_eq!(a.metrics_dropped(), 1);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let a = aggregator(vec![Compute::new(ComputeKind::Sum, 0, "out".into())]);
        a.put_metric(b"sys.a onlyvalue\n", 5, 0, &no_spans());
        a.put_metric(b"sys.a x y\n", 5, 0, &no_spans());
        assert_eq!(a.metrics_received(), 0);
    }

    #[test]
    fn percentile_nearest_rank() {
        let a = aggregator(vec![Compute::new(ComputeKind::Median, 0, "out".into())]);
        let now = epoch_now();
        for v in [5.0, 1.0, 3.0] {
            put(&a, &format!("sys.a {v} {now}\n"));
        }
        let compute = &a.computes()[0];
        let entry = compute.invocations.get(b"out".as_ref()).unwrap();
        let bucket = entry
            .buckets
            .iter()
            .find(|b| b.data.lock().unwrap().count == 3)
            .unwrap();
        let data = bucket.data.lock().unwrap();
        let line = a.format_metric(b"out", compute, &data, 100);
        assert_eq!(&*line, b"out 3 110\n");
    }

    #[test]
    fn emitted_timestamp_follows_tswhen() {
        for (tswhen, expect) in [
            (TsWhen::Start, "100"),
            (TsWhen::Middle, "105"),
            (TsWhen::End, "110"),
        ] {
            let a = Aggregator::new(
                10,
                60,
                tswhen,
                vec![Compute::new(ComputeKind::Sum, 0, "out".into())],
            );
            let data = BucketData {
                count: 1,
                sum: 4.0,
                min: 4.0,
                max: 4.0,
                values: Vec::new(),
            };
            let line = a.format_metric(b"out", &a.computes()[0], &data, 100);
            assert_eq!(
                String::from_utf8_lossy(&line),
                format!("out 4 {expect}\n")
            );
        }
    }

    #[tokio::test]
    async fn expiry_emits_and_reaps() {
        let computes = vec![Compute::new(ComputeKind::Sum, 0, "sums.out".into())];
        let a = Arc::new(Aggregator::new(1, 3, TsWhen::End, computes));
        let now = epoch_now();
        put(&a, &format!("sys.a 1 {}\n", now - 2));
        put(&a, &format!("sys.a 2 {}\n", now - 2));

        let (tx, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(Arc::clone(&a).run(tx));
        // shutdown drains every completed bucket
        a.stop();
        task.await.unwrap();

        let line = rx.recv().await.unwrap();
        let text = String::from_utf8_lossy(&line);
        assert!(text.starts_with("sums.out 3 "), "{text}");
        assert_eq!(a.metrics_sent(), 1);
        assert!(a.computes()[0].invocations.is_empty());
    }
}
