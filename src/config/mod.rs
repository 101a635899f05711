//! Configuration model
//!
//! The declarative form of a relay setup: clusters, routing rules,
//! aggregations, self-statistics and listeners. Parsed from the
//! configuration file by [`parser`], turned into a live graph by the
//! router. The model prints back to canonical configuration text, which
//! the test mode uses and which round-trips through the parser.

pub mod parser;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aggregator::{ComputeKind, TsWhen};
use crate::cluster::ValidationAction;
use crate::stream::WireCompression;

/// Transport protocol for one server or listener address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proto {
    Tcp,
    Udp,
    Unix,
}

impl Proto {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Unix => "unix",
        }
    }
}

/// Framing expected by a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SockType {
    #[default]
    Linemode,
    Syslog,
}

/// TLS declaration on a server or listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDecl {
    /// mTLS: verify the peer against `ca`, present `cert`.
    pub mutual: bool,
    pub cert: String,
    pub ca: Option<String>,
}

/// One downstream server inside a cluster declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDecl {
    pub host: String,
    pub port: u16,
    pub instance: Option<String>,
    pub proto: Proto,
    pub stype: SockType,
    #[serde(skip)]
    pub compression: WireCompression,
    pub tls: Option<TlsDecl>,
}

impl ServerDecl {
    #[must_use]
    pub fn plain(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            instance: None,
            proto: Proto::Tcp,
            stype: SockType::Linemode,
            compression: WireCompression::Plain,
            tls: None,
        }
    }
}

/// Cluster selection policy as declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPolicy {
    Forward,
    AnyOf { useall: bool },
    Failover,
    CarbonCh { replication: usize, dynamic: bool },
    Fnv1aCh { replication: usize, dynamic: bool },
    JumpFnv1aCh { replication: usize, dynamic: bool },
    File { with_ip: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDecl {
    pub name: String,
    pub policy: ClusterPolicy,
    pub servers: Vec<ServerDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDecl {
    /// `*` means match-all.
    pub patterns: Vec<String>,
    pub validate: Option<ValidateDecl>,
    /// `route using` masquerade template for `*_ch` destinations.
    pub route_using: Option<String>,
    pub send_to: Vec<String>,
    pub stop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateDecl {
    pub pattern: String,
    #[serde(skip, default = "default_validation_action")]
    pub action: ValidationAction,
}

fn default_validation_action() -> ValidationAction {
    ValidationAction::Log
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDecl {
    #[serde(skip, default = "default_compute_kind")]
    pub kind: ComputeKind,
    pub percentile: u8,
    pub write_to: String,
}

fn default_compute_kind() -> ComputeKind {
    ComputeKind::Sum
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDecl {
    pub patterns: Vec<String>,
    pub every: u64,
    pub expire_after: u64,
    #[serde(skip, default = "default_tswhen")]
    pub tswhen: TsWhen,
    pub computes: Vec<ComputeDecl>,
    pub send_to: Vec<String>,
    pub stop: bool,
}

fn default_tswhen() -> TsWhen {
    TsWhen::End
}

/// Routing rules keep their declaration order; matches, rewrites and
/// aggregates interleave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleDecl {
    Match(MatchDecl),
    Rewrite { pattern: String, replacement: String },
    Aggregate(AggregateDecl),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsDecl {
    pub interval: Option<u64>,
    /// Counters reset after each submission instead of accumulating.
    pub reset_after_interval: bool,
    pub prefix: Option<String>,
    pub send_to: Vec<String>,
    pub stop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddr {
    /// Interface address, socket path, or empty for the wildcard.
    pub address: String,
    pub port: Option<u16>,
    pub proto: Proto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenDecl {
    pub stype: SockType,
    #[serde(skip)]
    pub compression: WireCompression,
    pub tls: Option<ListenTlsDecl>,
    pub addrs: Vec<ListenAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenTlsDecl {
    pub cert: String,
    pub key: String,
    /// Require client certificates against this CA (mTLS).
    pub client_ca: Option<String>,
}

/// A parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub clusters: Vec<ClusterDecl>,
    pub rules: Vec<RuleDecl>,
    pub statistics: Option<StatisticsDecl>,
    pub listeners: Vec<ListenDecl>,
}

impl Config {
    pub fn cluster(&self, name: &str) -> Option<&ClusterDecl> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Patterns print quoted when they would not survive tokenisation bare.
fn quoted(pattern: &str) -> String {
    if pattern.contains(char::is_whitespace)
        || pattern.contains(';')
        || pattern.contains('#')
        || pattern.contains('"')
    {
        format!("\"{pattern}\"")
    } else {
        pattern.to_string()
    }
}

impl fmt::Display for ServerDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            // file clusters name paths, not sockets
            write!(f, "{}", self.host)?;
        } else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        if let Some(instance) = &self.instance {
            write!(f, "={instance}")?;
        }
        if self.proto == Proto::Udp {
            write!(f, " proto udp")?;
        }
        if self.stype == SockType::Syslog {
            write!(f, " type syslog")?;
        }
        if self.compression != WireCompression::Plain || self.tls.is_some() {
            write!(f, " transport {}", self.compression.as_str())?;
            if let Some(tls) = &self.tls {
                if tls.mutual {
                    write!(
                        f,
                        " mtls {} {}",
                        tls.cert,
                        tls.ca.as_deref().unwrap_or("")
                    )?;
                } else {
                    write!(f, " ssl {}", tls.cert)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClusterDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster {}\n    ", self.name)?;
        match &self.policy {
            ClusterPolicy::Forward => write!(f, "forward")?,
            ClusterPolicy::AnyOf { useall } => {
                write!(f, "any_of{}", if *useall { " useall" } else { "" })?;
            }
            ClusterPolicy::Failover => write!(f, "failover")?,
            ClusterPolicy::CarbonCh {
                replication,
                dynamic,
            } => {
                write!(
                    f,
                    "carbon_ch replication {replication}{}",
                    if *dynamic { " dynamic" } else { "" }
                )?;
            }
            ClusterPolicy::Fnv1aCh {
                replication,
                dynamic,
            } => {
                write!(
                    f,
                    "fnv1a_ch replication {replication}{}",
                    if *dynamic { " dynamic" } else { "" }
                )?;
            }
            ClusterPolicy::JumpFnv1aCh {
                replication,
                dynamic,
            } => {
                write!(
                    f,
                    "jump_fnv1a_ch replication {replication}{}",
                    if *dynamic { " dynamic" } else { "" }
                )?;
            }
            ClusterPolicy::File { with_ip } => {
                write!(f, "file{}", if *with_ip { " ip" } else { "" })?;
            }
        }
        for server in &self.servers {
            write!(f, "\n        {server}")?;
        }
        write!(f, "\n    ;")
    }
}

impl fmt::Display for RuleDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleDecl::Match(m) => {
                write!(f, "match")?;
                for p in &m.patterns {
                    write!(f, "\n        {}", quoted(p))?;
                }
                if let Some(v) = &m.validate {
                    write!(
                        f,
                        "\n    validate {} else {}",
                        quoted(&v.pattern),
                        match v.action {
                            ValidationAction::Log => "log",
                            ValidationAction::Drop => "drop",
                        }
                    )?;
                }
                if let Some(using) = &m.route_using {
                    write!(f, "\n    route using {using}")?;
                }
                if !m.send_to.is_empty() {
                    write!(f, "\n    send to")?;
                    for d in &m.send_to {
                        write!(f, " {d}")?;
                    }
                }
                if m.stop {
                    write!(f, "\n    stop")?;
                }
                write!(f, "\n    ;")
            }
            RuleDecl::Rewrite {
                pattern,
                replacement,
            } => {
                write!(
                    f,
                    "rewrite {}\n    into {}\n    ;",
                    quoted(pattern),
                    quoted(replacement)
                )
            }
            RuleDecl::Aggregate(a) => {
                write!(f, "aggregate")?;
                for p in &a.patterns {
                    write!(f, "\n        {}", quoted(p))?;
                }
                write!(f, "\n    every {} seconds", a.every)?;
                write!(f, "\n    expire after {} seconds", a.expire_after)?;
                write!(
                    f,
                    "\n    timestamp at {} of bucket",
                    match a.tswhen {
                        TsWhen::Start => "start",
                        TsWhen::Middle => "middle",
                        TsWhen::End => "end",
                    }
                )?;
                for c in &a.computes {
                    let kind = match c.kind {
                        ComputeKind::Sum => "sum".to_string(),
                        ComputeKind::Count => "count".to_string(),
                        ComputeKind::Max => "max".to_string(),
                        ComputeKind::Min => "min".to_string(),
                        ComputeKind::Average => "average".to_string(),
                        ComputeKind::Median => "median".to_string(),
                        ComputeKind::Percentile => format!("percentile{}", c.percentile),
                        ComputeKind::Variance => "variance".to_string(),
                        ComputeKind::Stddev => "stddev".to_string(),
                    };
                    write!(f, "\n    compute {kind} write to\n        {}", c.write_to)?;
                }
                if !a.send_to.is_empty() {
                    write!(f, "\n    send to")?;
                    for d in &a.send_to {
                        write!(f, " {d}")?;
                    }
                }
                if a.stop {
                    write!(f, "\n    stop")?;
                }
                write!(f, "\n    ;")
            }
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cluster in &self.clusters {
            writeln!(f, "{cluster}")?;
        }
        for listen in &self.listeners {
            write!(f, "listen\n    type linemode")?;
            if listen.compression != WireCompression::Plain || listen.tls.is_some() {
                write!(f, " transport {}", listen.compression.as_str())?;
                if let Some(tls) = &listen.tls {
                    match &tls.client_ca {
                        Some(ca) => write!(f, " mtls {} {} {ca}", tls.cert, tls.key)?,
                        None => write!(f, " ssl {} {}", tls.cert, tls.key)?,
                    }
                }
            }
            for addr in &listen.addrs {
                match addr.proto {
                    Proto::Unix => write!(f, "\n        {} proto unix", addr.address)?,
                    proto => write!(
                        f,
                        "\n        {}:{} proto {}",
                        addr.address,
                        addr.port.unwrap_or(2003),
                        proto.as_str()
                    )?,
                }
            }
            writeln!(f, "\n    ;")?;
        }
        for rule in &self.rules {
            writeln!(f, "{rule}")?;
        }
        if let Some(stats) = &self.statistics {
            write!(f, "statistics")?;
            if let Some(interval) = stats.interval {
                write!(f, "\n    submit every {interval} seconds")?;
            }
            if stats.reset_after_interval {
                write!(f, "\n    reset counters after interval")?;
            }
            if let Some(prefix) = &stats.prefix {
                write!(f, "\n    prefix with {prefix}")?;
            }
            if !stats.send_to.is_empty() {
                write!(f, "\n    send to")?;
                for d in &stats.send_to {
                    write!(f, " {d}")?;
                }
            }
            if stats.stop {
                write!(f, "\n    stop")?;
            }
            writeln!(f, "\n    ;")?;
        }
        Ok(())
    }
}
