//! Embedded self-statistics: the relay measures itself and injects the
//! numbers into its own routing pipeline
//!
//! Every interval the collector snapshots the ingress counters, every
//! destination's counters and the aggregator totals, renders them as
//! ordinary metric lines under `carbon.relays.<hostname>` and sends
//! them down the feedback channel. When the statistics statement pins
//! destinations, lines carry the statstub prefix so only those
//! destinations see them.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::debug;

use crate::dispatcher::DispatchStats;
use crate::router::{statistics_stub_prefix, Router};

pub struct Collector {
    /// Seconds between submissions.
    pub interval: u64,
    /// `false` submits counters as deltas since the last interval.
    pub cumulative: bool,
    /// Metric namespace, `carbon.relays.<hostname>` by default.
    pub prefix: String,
    /// Set when the statistics statement routes output explicitly.
    pub use_stub: bool,
}

impl Collector {
    #[must_use]
    pub fn new(interval: u64, cumulative: bool, prefix: Option<String>, hostname: &str, use_stub: bool) -> Self {
        let prefix = prefix.unwrap_or_else(|| {
            format!("carbon.relays.{}", hostname.replace('.', "_"))
        });
        Self {
            interval,
            cumulative,
            prefix,
            use_stub,
        }
    }

    /// The collector task: runs until the shutdown watch flips.
    pub async fn run(
        self,
        router: watch::Receiver<Arc<Router>>,
        stats: Arc<DispatchStats>,
        feedback: mpsc::Sender<Box<[u8]>>,
        mut running: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(Duration::from_secs(self.interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the first
        // submission covers a full interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = running.changed() => {
                    if !*running.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let graph = router.borrow().clone();
            let lines = self.render(&graph, &stats);
            for line in lines {
                if feedback.send(line).await.is_err() {
                    return;
                }
            }
        }
        debug!("collector stopped");
    }

    /// Renders one submission's worth of metric lines.
    pub fn render(&self, router: &Router, stats: &DispatchStats) -> Vec<Box<[u8]>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let stub = if self.use_stub {
            statistics_stub_prefix()
        } else {
            ""
        };
        let mut out: Vec<Box<[u8]>> = Vec::new();
        let mut push = |name: &str, value: u64| {
            out.push(
                format!("{stub}{}.{name} {value} {now}\n", self.prefix)
                    .into_bytes()
                    .into_boxed_slice(),
            );
        };

        if self.cumulative {
            push("metricsReceived", stats.metrics());
            push("metricsBlackholed", stats.blackholes());
            push("metricsDiscarded", stats.discards());
        } else {
            push("metricsReceived", stats.metrics_sub());
            push("metricsBlackholed", stats.blackholes_sub());
            push("metricsDiscarded", stats.discards_sub());
        }

        let mut total_sent = 0u64;
        let mut total_queued = 0u64;
        let mut total_stalls = 0u64;
        let mut total_dropped = 0u64;
        for server in &router.servers {
            let (sent, stalls, dropped, ticks) = if self.cumulative {
                (
                    server.metrics_sent(),
                    server.metrics_stalls(),
                    server.metrics_dropped(),
                    server.wall_time_us(),
                )
            } else {
                (
                    server.metrics_sent_sub(),
                    server.metrics_stalls_sub(),
                    server.metrics_dropped_sub(),
                    server.wall_time_us_sub(),
                )
            };
            let queued = server.queue_len() as u64;
            total_sent += sent;
            total_queued += queued;
            total_stalls += stalls;
            total_dropped += dropped;

            let dest = server.descriptor().to_string();
            push(&format!("destinations.{dest}.sent"), sent);
            push(&format!("destinations.{dest}.queued"), queued);
            push(&format!("destinations.{dest}.stalls"), stalls);
            push(&format!("destinations.{dest}.dropped"), dropped);
            push(&format!("destinations.{dest}.wallTime_us"), ticks);
        }
        push("metricsSent", total_sent);
        push("metricsQueued", total_queued);
        push("metricsStalled", total_stalls);
        push("metricsDropped", total_dropped);

        if !router.aggregators.is_empty() {
            let (received, sent, dropped) = router.aggregators.iter().fold(
                (0u64, 0u64, 0u64),
                |(r, s, d), a| {
                    if self.cumulative {
                        (
                            r + a.metrics_received(),
                            s + a.metrics_sent(),
                            d + a.metrics_dropped(),
                        )
                    } else {
                        (
                            r + a.metrics_received_sub(),
                            s + a.metrics_sent_sub(),
                            d + a.metrics_dropped_sub(),
                        )
                    }
                },
            );
            push("aggregators.metricsReceived", received);
            push("aggregators.metricsSent", sent);
            push("aggregators.metricsDropped", dropped);
        }

        out
    }
}
