//! The live routing graph: build from configuration, per-line
//! evaluation, and the pattern-group optimiser
//!
//! A router is immutable once built; reloads construct a fresh graph
//! and the relay swaps it in, transplanting sender queues (see
//! [`crate::relay`]). Route evaluators only ever borrow into the graph,
//! so evaluation runs lock-free on any number of tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::aggregator::{Aggregator, Compute};
use crate::cluster::{Cluster, ClusterKind, ValidationAction};
use crate::config::{ClusterPolicy, Config, Proto, RuleDecl, ServerDecl, SockType};
use crate::domain::{BatchSize, IoTimeoutMs, MaxStalls, QueueCapacity};
use crate::error::RelayError;
use crate::hashring::{fnv1a32, Ring, RingKind};
use crate::route::{rewrite_metric, trailing_block, Matcher, Route};
use crate::sender::{ConnectionKind, Sender, SenderConfig, ServerDescriptor};
use crate::stream::TlsSettings;

/// Minimum number of consecutive routes sharing a trailing block before
/// the optimiser wraps them in a group.
const GROUP_MIN_MEMBERS: usize = 3;

/// Runtime tunables the graph is built with; command-line flags mostly.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub queue_size: QueueCapacity,
    pub batch_size: BatchSize,
    pub max_stalls: MaxStalls,
    pub io_timeout: IoTimeoutMs,
    /// Route count from which the optimiser kicks in; negative turns it
    /// off entirely.
    pub optimiser_threshold: isize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            queue_size: QueueCapacity::default(),
            batch_size: BatchSize::default(),
            max_stalls: MaxStalls::default(),
            io_timeout: IoTimeoutMs::default(),
            optimiser_threshold: 50,
        }
    }
}

/// An immutable generation of the routing graph.
pub struct Router {
    pub routes: Vec<Route>,
    pub servers: Vec<Arc<Sender>>,
    pub aggregators: Vec<Arc<Aggregator>>,
    /// The declarative form this graph was built from; reload compares
    /// against it to detect no-op swaps.
    pub config: Config,
}

impl Router {
    /// Builds a graph from `config`. Senders are created but not
    /// spawned; the relay owns task lifecycles.
    pub fn build(config: Config, opts: &RouterOptions) -> Result<Self, RelayError> {
        let mut builder = Builder {
            opts,
            pool: HashMap::new(),
            blackhole: Arc::new(Cluster {
                name: "blackhole".to_string(),
                kind: ClusterKind::Blackhole,
            }),
            clusters: HashMap::new(),
            aggregators: Vec::new(),
        };

        for decl in &config.clusters {
            let cluster = builder.build_cluster(decl)?;
            builder.clusters.insert(decl.name.clone(), cluster);
        }

        let mut routes: Vec<Route> = Vec::new();
        let mut stub_routes: Vec<Route> = Vec::new();

        for rule in &config.rules {
            match rule {
                RuleDecl::Rewrite {
                    pattern,
                    replacement,
                } => {
                    routes.push(Route {
                        matcher: Matcher::from_pattern(pattern)?,
                        masquerade: None,
                        dests: vec![Arc::new(Cluster {
                            name: format!("rewrite:{replacement}"),
                            kind: ClusterKind::Rewrite {
                                replacement: replacement.clone(),
                            },
                        })],
                        stop: false,
                    });
                }
                RuleDecl::Match(m) => {
                    let mut dests: Vec<Arc<Cluster>> = Vec::new();
                    if let Some(v) = &m.validate {
                        dests.push(Arc::new(Cluster {
                            name: "validate".to_string(),
                            kind: ClusterKind::Validation {
                                matcher: Matcher::from_pattern(&v.pattern)?,
                                action: v.action,
                            },
                        }));
                    }
                    for name in &m.send_to {
                        dests.push(builder.dest(name)?);
                    }
                    for pattern in &m.patterns {
                        routes.push(Route {
                            matcher: Matcher::from_pattern(pattern)?,
                            masquerade: m.route_using.clone(),
                            dests: dests.clone(),
                            stop: m.stop,
                        });
                    }
                }
                RuleDecl::Aggregate(a) => {
                    let index = builder.aggregators.len();
                    let computes = a
                        .computes
                        .iter()
                        .map(|c| Compute::new(c.kind, c.percentile, c.write_to.clone()))
                        .collect();
                    let mut aggregator =
                        Aggregator::new(a.every, a.expire_after, a.tswhen, computes);

                    let mut dests: Vec<Arc<Cluster>> = Vec::new();
                    if !a.send_to.is_empty() {
                        // emissions carry a synthetic prefix; the stub
                        // route at the head of the table strips it and
                        // forwards to the chosen destinations, keeping
                        // them invisible to the rest of the table
                        let prefix = format!("_aggregator_stub_{index}__");
                        aggregator.set_stub(prefix.as_bytes());
                        let mut nested: Vec<Arc<Cluster>> = Vec::new();
                        for name in &a.send_to {
                            nested.push(builder.dest(name)?);
                        }
                        stub_routes.push(Route {
                            matcher: Matcher::from_pattern(&format!(
                                "^{}",
                                regex_escape(&prefix)
                            ))?,
                            masquerade: None,
                            dests: vec![Arc::new(Cluster {
                                name: prefix.clone(),
                                kind: ClusterKind::AggrStub {
                                    prefix: prefix.clone().into_bytes(),
                                    routes: vec![Route {
                                        matcher: Matcher::from_pattern("*")?,
                                        masquerade: None,
                                        dests: nested.clone(),
                                        stop: true,
                                    }],
                                },
                            })],
                            stop: true,
                        });
                        dests = nested;
                    }

                    let aggregator = Arc::new(aggregator);
                    builder.aggregators.push(Arc::clone(&aggregator));

                    let mut route_dests = vec![Arc::new(Cluster {
                        name: format!("aggregate#{index}"),
                        kind: ClusterKind::Aggregation {
                            aggregator: Arc::clone(&aggregator),
                        },
                    })];
                    route_dests.extend(dests);
                    for pattern in &a.patterns {
                        routes.push(Route {
                            matcher: Matcher::from_pattern(pattern)?,
                            masquerade: None,
                            dests: route_dests.clone(),
                            stop: a.stop,
                        });
                    }
                }
            }
        }

        // statistics stub, if the collector output is pinned somewhere
        if let Some(stats) = &config.statistics {
            if !stats.send_to.is_empty() {
                let prefix = statistics_stub_prefix();
                let mut nested: Vec<Arc<Cluster>> = Vec::new();
                for name in &stats.send_to {
                    nested.push(builder.dest(name)?);
                }
                stub_routes.push(Route {
                    matcher: Matcher::from_pattern(&format!("^{}", regex_escape(prefix)))?,
                    masquerade: None,
                    dests: vec![Arc::new(Cluster {
                        name: prefix.to_string(),
                        kind: ClusterKind::StatStub {
                            prefix: prefix.as_bytes().to_vec(),
                            routes: vec![Route {
                                matcher: Matcher::from_pattern("*")?,
                                masquerade: None,
                                dests: nested,
                                stop: true,
                            }],
                        },
                    })],
                    stop: true,
                });
            }
        }

        let mut all_routes = stub_routes;
        all_routes.extend(optimise(routes, opts.optimiser_threshold));

        let mut servers: Vec<Arc<Sender>> = builder.pool.into_values().collect();
        servers.sort_by(|a, b| {
            (a.descriptor().host.as_str(), a.descriptor().port)
                .cmp(&(b.descriptor().host.as_str(), b.descriptor().port))
        });

        Ok(Router {
            routes: all_routes,
            servers,
            aggregators: builder.aggregators,
            config,
        })
    }

    /// Classifies one sanitised line and collects (sender, formatted
    /// line) pairs. Returns `true` when the metric was blackholed:
    /// either explicitly or because nothing wanted it.
    pub fn route(
        &self,
        line: &mut Vec<u8>,
        firstspace: &mut usize,
        srcaddr: &str,
        out: &mut Vec<(Arc<Sender>, Box<[u8]>)>,
    ) -> bool {
        let mut blackholed = false;
        let (_, sent) = route_intern(&self.routes, line, firstspace, srcaddr, out, &mut blackholed);
        blackholed || !sent
    }

    /// Sender for the given (host, port, kind) triple, used by the
    /// reload transplant.
    pub fn find_server(&self, desc: &ServerDescriptor) -> Option<&Arc<Sender>> {
        self.servers.iter().find(|s| {
            let d = s.descriptor();
            d.host == desc.host && d.port == desc.port && d.kind == desc.kind
        })
    }
}

/// The statistics collector's stub prefix.
#[must_use]
pub fn statistics_stub_prefix() -> &'static str {
    "_statistics_stub__"
}

struct Builder<'a> {
    opts: &'a RouterOptions,
    pool: HashMap<ServerDescriptor, Arc<Sender>>,
    blackhole: Arc<Cluster>,
    clusters: HashMap<String, Arc<Cluster>>,
    aggregators: Vec<Arc<Aggregator>>,
}

impl Builder<'_> {
    fn dest(&self, name: &str) -> Result<Arc<Cluster>, RelayError> {
        if name == "blackhole" {
            return Ok(Arc::clone(&self.blackhole));
        }
        self.clusters
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::ConfigInvalid {
                message: format!("unknown cluster '{name}'"),
            })
    }

    fn sender(&mut self, decl: &ServerDecl, failover: bool, dynamic: bool) -> Arc<Sender> {
        let kind = match (decl.port, decl.proto) {
            (0, _) => ConnectionKind::File,
            (_, Proto::Udp) => ConnectionKind::Udp,
            (_, Proto::Unix) => ConnectionKind::Unix,
            (_, Proto::Tcp) => ConnectionKind::Tcp,
        };
        let desc = ServerDescriptor {
            kind,
            host: decl.host.clone(),
            port: decl.port,
            instance: decl.instance.clone(),
        };
        if let Some(existing) = self.pool.get(&desc) {
            return Arc::clone(existing);
        }
        let tls = decl.tls.as_ref().map(|t| {
            if t.mutual {
                TlsSettings {
                    ca_file: t.ca.clone(),
                    cert_file: Some(t.cert.clone()),
                    key_file: Some(t.cert.clone()),
                }
            } else {
                TlsSettings {
                    ca_file: Some(t.cert.clone()),
                    cert_file: None,
                    key_file: None,
                }
            }
        });
        let sender = Sender::new(
            desc.clone(),
            SenderConfig {
                queue_size: self.opts.queue_size.as_usize(),
                batch_size: self.opts.batch_size.as_usize(),
                max_stalls: self.opts.max_stalls.as_usize(),
                io_timeout: self.opts.io_timeout.as_duration(),
                compression: decl.compression,
                tls,
                syslog: decl.stype == SockType::Syslog,
                resolve: dynamic,
                failover,
            },
        );
        self.pool.insert(desc, Arc::clone(&sender));
        sender
    }

    fn build_cluster(&mut self, decl: &crate::config::ClusterDecl) -> Result<Arc<Cluster>, RelayError> {
        let kind = match &decl.policy {
            ClusterPolicy::Forward => ClusterKind::Forward {
                servers: decl
                    .servers
                    .iter()
                    .map(|s| self.sender(s, false, false))
                    .collect(),
            },
            ClusterPolicy::File { with_ip } => ClusterKind::File {
                servers: decl
                    .servers
                    .iter()
                    .map(|s| self.sender(s, false, false))
                    .collect(),
                with_source: *with_ip,
            },
            ClusterPolicy::AnyOf { useall } => {
                let decls = if *useall {
                    resolve_all(&decl.servers)
                } else {
                    decl.servers.clone()
                };
                let servers: Vec<Arc<Sender>> =
                    decls.iter().map(|s| self.sender(s, false, false)).collect();
                wire_secondaries(&servers);
                ClusterKind::AnyOf { servers }
            }
            ClusterPolicy::Failover => {
                let servers: Vec<Arc<Sender>> = decl
                    .servers
                    .iter()
                    .map(|s| self.sender(s, true, false))
                    .collect();
                wire_secondaries(&servers);
                ClusterKind::Failover { servers }
            }
            ClusterPolicy::CarbonCh {
                replication,
                dynamic,
            }
            | ClusterPolicy::Fnv1aCh {
                replication,
                dynamic,
            }
            | ClusterPolicy::JumpFnv1aCh {
                replication,
                dynamic,
            } => {
                let ring_kind = match &decl.policy {
                    ClusterPolicy::CarbonCh { .. } => RingKind::Carbon,
                    ClusterPolicy::Fnv1aCh { .. } => RingKind::Fnv1a,
                    _ => RingKind::JumpFnv1a,
                };
                let servers: Vec<Arc<Sender>> = decl
                    .servers
                    .iter()
                    .map(|s| self.sender(s, false, *dynamic))
                    .collect();
                ClusterKind::ConsistentHash {
                    ring: Ring::new(ring_kind, &servers),
                    replicas: *replication,
                    dynamic: *dynamic,
                }
            }
        };
        Ok(Arc::new(Cluster {
            name: decl.name.clone(),
            kind,
        }))
    }
}

/// Members of an any_of/failover cluster back each other up; the member
/// itself is excluded from its own list.
fn wire_secondaries(servers: &[Arc<Sender>]) {
    for (i, server) in servers.iter().enumerate() {
        let peers: Vec<Arc<Sender>> = servers
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, s)| Arc::clone(s))
            .collect();
        server.set_secondaries(peers);
    }
}

/// `useall`: expand each host to every address it resolves to.
fn resolve_all(decls: &[ServerDecl]) -> Vec<ServerDecl> {
    use std::net::ToSocketAddrs;
    let mut out = Vec::new();
    for decl in decls {
        match (decl.host.as_str(), decl.port).to_socket_addrs() {
            Ok(addrs) => {
                let mut seen = std::collections::HashSet::new();
                for addr in addrs {
                    if seen.insert(addr.ip()) {
                        let mut expanded = decl.clone();
                        expanded.host = addr.ip().to_string();
                        out.push(expanded);
                    }
                }
            }
            Err(e) => {
                warn!(host = %decl.host, error = %e, "cannot resolve, keeping name");
                out.push(decl.clone());
            }
        }
    }
    out
}

fn regex_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Wraps runs of ≥ [`GROUP_MIN_MEMBERS`] consecutive routes sharing a
/// trailing pattern block into a synthetic group guarded by a cheap
/// `contains` matcher. Matchall and rewrite rules never participate.
fn optimise(routes: Vec<Route>, threshold: isize) -> Vec<Route> {
    if threshold < 0 || routes.len() < threshold as usize {
        return routes;
    }

    let mut out: Vec<Route> = Vec::with_capacity(routes.len());
    let mut run: Vec<Route> = Vec::new();
    let mut run_block: Option<Vec<u8>> = None;

    let flush = |out: &mut Vec<Route>, run: &mut Vec<Route>, block: &Option<Vec<u8>>| {
        if run.len() >= GROUP_MIN_MEMBERS {
            let block = block.clone().unwrap();
            out.push(Route {
                matcher: Matcher::contains(&block),
                masquerade: None,
                dests: vec![Arc::new(Cluster {
                    name: String::from_utf8_lossy(&block).into_owned(),
                    kind: ClusterKind::Group {
                        routes: std::mem::take(run),
                    },
                })],
                stop: false,
            });
        } else {
            out.append(run);
        }
    };

    for route in routes {
        let groupable = route.matcher.kind() != crate::route::MatchKind::All
            && !route
                .dests
                .first()
                .is_some_and(|c| matches!(c.kind, ClusterKind::Rewrite { .. }));
        let block = if groupable {
            trailing_block(route.matcher.pattern())
        } else {
            None
        };

        match (&block, &run_block) {
            (Some(b), Some(rb)) if b == rb => {
                run.push(route);
            }
            _ => {
                flush(&mut out, &mut run, &run_block);
                match block {
                    Some(b) => {
                        run_block = Some(b);
                        run.push(route);
                    }
                    None => {
                        run_block = None;
                        out.push(route);
                    }
                }
            }
        }
    }
    flush(&mut out, &mut run, &run_block);
    out
}

/// Evaluates `routes` against the line. Returns (stop, sent).
fn route_intern(
    routes: &[Route],
    line: &mut Vec<u8>,
    firstspace: &mut usize,
    srcaddr: &str,
    out: &mut Vec<(Arc<Sender>, Box<[u8]>)>,
    blackholed: &mut bool,
) -> (bool, bool) {
    let mut stop = false;
    let mut sent = false;

    'routes: for route in routes {
        let Some(spans) = route.matcher.matches(&line[..*firstspace]) else {
            continue;
        };
        stop = route.stop;

        let dest_count = route.dests.len();
        for (di, cluster) in route.dests.iter().enumerate() {
            match &cluster.kind {
                ClusterKind::Blackhole => {
                    *blackholed = true;
                }
                ClusterKind::Forward { servers } => {
                    for server in servers {
                        push_dest(out, server, line, srcaddr, false);
                    }
                    sent = true;
                }
                ClusterKind::File {
                    servers,
                    with_source,
                } => {
                    for server in servers {
                        push_dest(out, server, line, srcaddr, *with_source);
                    }
                    sent = true;
                }
                ClusterKind::AnyOf { servers } => {
                    // stable per metric name; the bias of a plain mod
                    // is negligible against the 32-bit hash space
                    let idx = fnv1a32(&line[..*firstspace]) as usize % servers.len();
                    push_dest(out, &servers[idx], line, srcaddr, false);
                    sent = true;
                }
                ClusterKind::Failover { servers } => {
                    let server = servers
                        .iter()
                        .find(|s| !s.is_failed())
                        .unwrap_or(&servers[0]);
                    push_dest(out, server, line, srcaddr, false);
                    sent = true;
                }
                ClusterKind::ConsistentHash { ring, replicas, .. } => {
                    let nodes = match &route.masquerade {
                        Some(masq) => match rewrite_metric(line, *firstspace, masq, &spans) {
                            Some((keyline, keyfs)) => ring.get_nodes(&keyline[..keyfs], *replicas),
                            None => {
                                warn!(
                                    template = %masq,
                                    "failed to derive routing key, skipping"
                                );
                                break;
                            }
                        },
                        None => ring.get_nodes(&line[..*firstspace], *replicas),
                    };
                    for server in nodes {
                        push_dest(out, &server, line, srcaddr, false);
                    }
                    sent = true;
                }
                ClusterKind::Aggregation { aggregator } => {
                    aggregator.put_metric(line, *firstspace, route.matcher.nmatch(), &spans);
                    sent = true;
                    // remaining destinations belong to the stub route
                    break;
                }
                ClusterKind::Rewrite { replacement } => {
                    match rewrite_metric(line, *firstspace, replacement, &spans) {
                        Some((newline, newfs)) => {
                            *line = newline;
                            *firstspace = newfs;
                        }
                        None => {
                            warn!(template = %replacement, "failed to rewrite metric");
                        }
                    }
                    // subsequent routes see the new name
                }
                ClusterKind::Validation { matcher, action } => {
                    let start = (*firstspace + 1).min(line.len().saturating_sub(1));
                    let tail = &line[start..line.len().saturating_sub(1)];
                    if matcher.matches(tail).is_some() {
                        continue;
                    }
                    if *action == ValidationAction::Log {
                        warn!(
                            line = %String::from_utf8_lossy(&line[..line.len() - 1]),
                            "dropping metric due to validation error"
                        );
                        sent = true;
                    }
                    // a validate without destinations ends the table
                    stop |= di == dest_count - 1;
                    break;
                }
                ClusterKind::Group { routes } => {
                    let (gstop, gsent) =
                        route_intern(routes, line, firstspace, srcaddr, out, blackholed);
                    sent |= gsent;
                    stop = gstop;
                    if stop {
                        break 'routes;
                    }
                }
                ClusterKind::AggrStub { prefix, routes }
                | ClusterKind::StatStub { prefix, routes } => {
                    // strip the synthetic prefix and reroute
                    let mut stripped = line[prefix.len()..].to_vec();
                    let mut sfs = *firstspace - prefix.len();
                    let (_, ssent) =
                        route_intern(routes, &mut stripped, &mut sfs, srcaddr, out, blackholed);
                    sent |= ssent;
                }
            }
        }

        if stop {
            break;
        }
    }

    (stop, sent)
}

fn push_dest(
    out: &mut Vec<(Arc<Sender>, Box<[u8]>)>,
    server: &Arc<Sender>,
    line: &[u8],
    srcaddr: &str,
    with_source: bool,
) {
    let formatted: Box<[u8]> = if with_source {
        let mut v = Vec::with_capacity(srcaddr.len() + 1 + line.len());
        v.extend_from_slice(srcaddr.as_bytes());
        v.push(b' ');
        v.extend_from_slice(line);
        v.into_boxed_slice()
    } else if server.config().syslog {
        syslog_frame(line, srcaddr)
    } else {
        line.into()
    };
    out.push((Arc::clone(server), formatted));
}

/// RFC 5424 framing: PRI 30 (daemon.info), APP-NAME carbon-c-relay for
/// ecosystem compatibility, the metric line as MSG.
fn syslog_frame(line: &[u8], srcaddr: &str) -> Box<[u8]> {
    let ts = rfc3339_utc(SystemTime::now());
    let mut v = Vec::with_capacity(line.len() + srcaddr.len() + 48);
    v.extend_from_slice(b"<30>1 ");
    v.extend_from_slice(ts.as_bytes());
    v.push(b' ');
    v.extend_from_slice(srcaddr.as_bytes());
    v.extend_from_slice(b" carbon-c-relay - - - ");
    v.extend_from_slice(line);
    v.into_boxed_slice()
}

fn rfc3339_utc(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let (year, month, day) = civil_from_days(secs.div_euclid(86400));
    let tod = secs.rem_euclid(86400);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.000Z",
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

/// Days-since-epoch to (y, m, d); the classic civil-from-days
/// calculation over 400-year eras.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
