//! # graphite-relay
//!
//! A high-throughput, line-oriented metric routing relay for the
//! Graphite ecosystem. Metric lines arrive over TCP, UDP or UNIX
//! sockets (optionally TLS and/or compressed), are sanitised and
//! classified against an ordered rule set, optionally rewritten or
//! aggregated into time buckets, and forwarded to downstream servers
//! picked by consistent hashing, replication, any-of load balancing or
//! ordered failover.
//!
//! The crate is organised around an immutable per-generation routing
//! graph: configuration parses into [`config::Config`], builds into a
//! [`router::Router`], and the [`relay::Relay`] owns the task
//! lifecycles around it. Hot reloads build a fresh graph and
//! transplant the per-destination queues so no in-flight metric is
//! lost.

pub mod aggregator;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod hashring;
pub mod queue;
pub mod relay;
pub mod route;
pub mod router;
pub mod sender;
pub mod stream;

pub use crate::error::RelayError;
pub use crate::relay::{Relay, RelayOptions};
