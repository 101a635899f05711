//! Cluster variants: named policies over downstream servers

use crate::aggregator::Aggregator;
use crate::hashring::Ring;
use crate::route::{Matcher, Route};
use crate::sender::Sender;
use std::sync::Arc;

/// What to do with a metric when validation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationAction {
    /// Log the offending line and keep routing.
    Log,
    /// Drop the line; stops the route when no destinations follow.
    Drop,
}

/// The policy a cluster applies to pick destinations.
pub enum ClusterKind {
    /// Every server receives a copy.
    Forward { servers: Vec<Arc<Sender>> },
    /// Like forward, but the servers are files; `with_source` prefixes
    /// each line with the submitting client's address.
    File {
        servers: Vec<Arc<Sender>>,
        with_source: bool,
    },
    /// One stable server per metric name (FNV-1a mod n); not failure
    /// aware, peers pick up the queue via secondary offload instead.
    AnyOf { servers: Vec<Arc<Sender>> },
    /// First non-failed server in declaration order.
    Failover { servers: Vec<Arc<Sender>> },
    /// Consistent-hash ring with a replication factor.
    ConsistentHash {
        ring: Ring,
        replicas: usize,
        dynamic: bool,
    },
    /// Metrics are absorbed into time buckets; the aggregator emits
    /// through its stub route, so destinations listed after this one
    /// belong to the stub and are not reachable from here.
    Aggregation { aggregator: Arc<Aggregator> },
    /// Rewrites the metric name in place; matching continues.
    Rewrite { replacement: String },
    /// Checks `value timestamp` against a second matcher.
    Validation {
        matcher: Matcher,
        action: ValidationAction,
    },
    /// Swallows matches, counted as blackholed.
    Blackhole,
    /// Synthetic cluster produced by the optimiser: nested routes that
    /// share a discriminating block.
    Group { routes: Vec<Route> },
    /// Strips the aggregator's synthetic prefix and reroutes.
    AggrStub { prefix: Vec<u8>, routes: Vec<Route> },
    /// Strips the collector's synthetic prefix and reroutes.
    StatStub { prefix: Vec<u8>, routes: Vec<Route> },
}

pub struct Cluster {
    pub name: String,
    pub kind: ClusterKind,
}
