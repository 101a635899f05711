//! Relay lifecycle: wires listeners, senders, aggregators and the
//! collector together, hot-reloads the routing graph, and shuts the
//! whole thing down in dependency order
//!
//! Reload keeps traffic flowing: workers hold client reads while the
//! old aggregator drains through the feedback loop, sender queues are
//! transplanted into the successor graph by destination identity, and
//! only then is the new graph published.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::collector::Collector;
use crate::config::{parser, Config, ListenDecl, Proto};
use crate::dispatcher::{
    self, DispatchContext, DispatchStats, SanitiseConfig, DEFAULT_ALLOWED_CHARS,
};
use crate::domain::{
    BatchSize, IoTimeoutMs, MaxLineLength, MaxStalls, QueueCapacity, StatsInterval, WorkerCount,
};
use crate::error::RelayError;
use crate::router::{Router, RouterOptions};
use crate::sender::{ConnectionKind, Sender};
use crate::stream::{server_acceptor, WireCompression};

/// Capacity of the aggregator/collector feedback channel.
const FEEDBACK_DEPTH: usize = 4096;

/// Everything the command line can set.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub config_path: PathBuf,
    pub listen_interface: String,
    pub listen_port: u16,
    pub workers: WorkerCount,
    pub batch_size: BatchSize,
    pub queue_size: QueueCapacity,
    pub max_stalls: MaxStalls,
    pub io_timeout: IoTimeoutMs,
    pub stats_interval: StatsInterval,
    pub listen_backlog: u32,
    pub socket_buffer: Option<usize>,
    pub max_line_length: MaxLineLength,
    pub max_metric_length: usize,
    pub allowed_chars: String,
    pub hostname: String,
    /// Submit ever-growing counters instead of per-interval deltas.
    pub cumulative_stats: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/graphite-relay.conf"),
            listen_interface: String::new(),
            listen_port: 2003,
            workers: WorkerCount::try_new(num_cpus::get().clamp(1, 512)).unwrap(),
            batch_size: BatchSize::default(),
            queue_size: QueueCapacity::default(),
            max_stalls: MaxStalls::default(),
            io_timeout: IoTimeoutMs::default(),
            stats_interval: StatsInterval::default(),
            listen_backlog: 32,
            socket_buffer: None,
            max_line_length: MaxLineLength::default(),
            max_metric_length: MaxLineLength::default().as_usize(),
            allowed_chars: DEFAULT_ALLOWED_CHARS.to_string(),
            hostname: hostname_of(),
            cumulative_stats: true,
        }
    }
}

impl RelayOptions {
    #[must_use]
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            queue_size: self.queue_size,
            batch_size: self.batch_size,
            max_stalls: self.max_stalls,
            io_timeout: self.io_timeout,
            ..RouterOptions::default()
        }
    }
}

/// Best-effort hostname, mirroring what downstream dashboards expect.
#[must_use]
pub fn hostname_of() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub struct Relay {
    opts: RelayOptions,
    router_tx: watch::Sender<Arc<Router>>,
    hold_tx: watch::Sender<bool>,
    running_tx: watch::Sender<bool>,
    feedback_stop_tx: watch::Sender<bool>,
    stats: Arc<DispatchStats>,
    feedback_tx: mpsc::Sender<Box<[u8]>>,
    listener_tasks: Vec<JoinHandle<()>>,
    feedback_task: JoinHandle<()>,
    collector_task: Option<JoinHandle<()>>,
    sender_tasks: Vec<(Arc<Sender>, JoinHandle<()>)>,
    aggregator_tasks: Vec<(Arc<Aggregator>, JoinHandle<()>)>,
}

impl Relay {
    /// Parses the configuration, builds the first graph and brings all
    /// tasks up.
    pub async fn start(opts: RelayOptions) -> Result<Self, RelayError> {
        let config = parser::parse_file(&opts.config_path)?;
        let router = Arc::new(Router::build(config, &opts.router_options())?);

        let (router_tx, router_rx) = watch::channel(Arc::clone(&router));
        let (hold_tx, hold_rx) = watch::channel(false);
        let (running_tx, running_rx) = watch::channel(true);
        let (feedback_stop_tx, feedback_stop_rx) = watch::channel(false);
        let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_DEPTH);
        let stats = Arc::new(DispatchStats::default());
        let sanitise = Arc::new(SanitiseConfig::new(
            opts.max_line_length.as_usize(),
            opts.max_metric_length,
            &opts.allowed_chars,
        ));

        let ctx = DispatchContext {
            router: router_rx,
            hold: hold_rx,
            running: running_rx,
            stats: Arc::clone(&stats),
            sanitise,
        };

        let mut relay = Relay {
            opts,
            router_tx,
            hold_tx,
            running_tx,
            feedback_stop_tx,
            stats,
            feedback_tx: feedback_tx.clone(),
            listener_tasks: Vec::new(),
            feedback_task: tokio::spawn(dispatcher::run_feedback(
                feedback_rx,
                ctx.clone(),
                feedback_stop_rx,
            )),
            collector_task: None,
            sender_tasks: Vec::new(),
            aggregator_tasks: Vec::new(),
        };

        relay.spawn_listeners(&ctx).await?;
        relay.spawn_graph_tasks(&router);

        let stats_decl = router.config.statistics.clone();
        let interval = stats_decl
            .as_ref()
            .and_then(|s| s.interval)
            .unwrap_or(relay.opts.stats_interval.as_secs());
        let cumulative = relay.opts.cumulative_stats
            && !stats_decl
                .as_ref()
                .is_some_and(|s| s.reset_after_interval);
        let collector = Collector::new(
            interval,
            cumulative,
            stats_decl.as_ref().and_then(|s| s.prefix.clone()),
            &relay.opts.hostname,
            stats_decl.as_ref().is_some_and(|s| !s.send_to.is_empty()),
        );
        relay.collector_task = Some(tokio::spawn(collector.run(
            relay.router_tx.subscribe(),
            Arc::clone(&relay.stats),
            feedback_tx,
            relay.running_tx.subscribe(),
        )));

        info!(
            config = %relay.opts.config_path.display(),
            servers = router.servers.len(),
            routes = router.routes.len(),
            "relay started"
        );
        Ok(relay)
    }

    /// Binds the default listeners plus anything the configuration
    /// declares, then spawns their accept loops.
    async fn spawn_listeners(&mut self, ctx: &DispatchContext) -> Result<(), RelayError> {
        let iface = if self.opts.listen_interface.is_empty() {
            "0.0.0.0"
        } else {
            &self.opts.listen_interface
        };
        let default_addr = format!("{iface}:{}", self.opts.listen_port);

        let tcp = self.bind_tcp(&default_addr)?;
        self.listener_tasks.push(tokio::spawn(dispatcher::run_tcp_listener(
            tcp,
            ctx.clone(),
            None,
            WireCompression::Plain,
        )));

        let udp = UdpSocket::bind(&default_addr)
            .await
            .map_err(|e| RelayError::Bind {
                address: default_addr.clone(),
                source: e,
            })?;
        self.listener_tasks.push(tokio::spawn(dispatcher::run_udp_socket(
            udp,
            ctx.clone(),
            WireCompression::Plain,
        )));
        info!(address = %default_addr, "listening (tcp, udp)");

        let listeners: Vec<ListenDecl> =
            self.router_tx.borrow().config.listeners.clone();
        for decl in &listeners {
            let tls = match &decl.tls {
                Some(t) => Some(server_acceptor(
                    &t.cert,
                    &t.key,
                    t.client_ca.as_deref(),
                )?),
                None => None,
            };
            for addr in &decl.addrs {
                match addr.proto {
                    Proto::Tcp => {
                        let address = format!(
                            "{}:{}",
                            if addr.address.is_empty() {
                                "0.0.0.0"
                            } else {
                                &addr.address
                            },
                            addr.port.unwrap_or(self.opts.listen_port)
                        );
                        let listener = self.bind_tcp(&address)?;
                        self.listener_tasks
                            .push(tokio::spawn(dispatcher::run_tcp_listener(
                                listener,
                                ctx.clone(),
                                tls.clone(),
                                decl.compression,
                            )));
                        info!(address = %address, transport = decl.compression.as_str(), "listening (tcp)");
                    }
                    Proto::Udp => {
                        let address = format!(
                            "{}:{}",
                            if addr.address.is_empty() {
                                "0.0.0.0"
                            } else {
                                &addr.address
                            },
                            addr.port.unwrap_or(self.opts.listen_port)
                        );
                        let socket =
                            UdpSocket::bind(&address)
                                .await
                                .map_err(|e| RelayError::Bind {
                                    address: address.clone(),
                                    source: e,
                                })?;
                        self.listener_tasks
                            .push(tokio::spawn(dispatcher::run_udp_socket(
                                socket,
                                ctx.clone(),
                                decl.compression,
                            )));
                        info!(address = %address, "listening (udp)");
                    }
                    Proto::Unix => {
                        // a stale socket file blocks rebinding
                        let _ = std::fs::remove_file(&addr.address);
                        let listener =
                            UnixListener::bind(&addr.address).map_err(|e| RelayError::Bind {
                                address: addr.address.clone(),
                                source: e,
                            })?;
                        self.listener_tasks
                            .push(tokio::spawn(dispatcher::run_unix_listener(
                                listener,
                                ctx.clone(),
                                decl.compression,
                            )));
                        info!(path = %addr.address, "listening (unix)");
                    }
                }
            }
        }
        Ok(())
    }

    fn bind_tcp(&self, address: &str) -> Result<TcpListener, RelayError> {
        let addr: std::net::SocketAddr =
            address.parse().map_err(|e| RelayError::Bind {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")),
            })?;
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(|e| RelayError::Bind {
            address: address.to_string(),
            source: e,
        })?;
        let bind = |socket: &socket2::Socket| -> std::io::Result<()> {
            socket.set_reuse_address(true)?;
            if let Some(size) = self.opts.socket_buffer {
                socket.set_recv_buffer_size(size)?;
            }
            socket.set_nonblocking(true)?;
            socket.bind(&addr.into())?;
            socket.listen(self.opts.listen_backlog as i32)?;
            Ok(())
        };
        bind(&socket).map_err(|e| RelayError::Bind {
            address: address.to_string(),
            source: e,
        })?;
        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener).map_err(|e| RelayError::Bind {
            address: address.to_string(),
            source: e,
        })
    }

    /// Spawns sender and aggregator tasks for a freshly built graph.
    fn spawn_graph_tasks(&mut self, router: &Arc<Router>) {
        for server in &router.servers {
            if server.descriptor().kind == ConnectionKind::Pipe {
                server.set_feedback(self.feedback_tx.clone());
            }
            self.sender_tasks
                .push((Arc::clone(server), tokio::spawn(Arc::clone(server).run())));
        }
        for aggregator in &router.aggregators {
            self.aggregator_tasks.push((
                Arc::clone(aggregator),
                tokio::spawn(Arc::clone(aggregator).run(self.feedback_tx.clone())),
            ));
        }
    }

    /// Hot reload: parse, compare, rebuild, transplant, swap. A parse
    /// or build error leaves the running graph untouched.
    pub async fn reload(&mut self) -> Result<(), RelayError> {
        info!("reloading configuration");
        let config = match parser::parse_file(&self.opts.config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "reload failed, keeping current configuration");
                return Err(e);
            }
        };

        let current = self.router_tx.borrow().clone();
        if current.config == config {
            info!("configuration unchanged, not reloading");
            return Ok(());
        }

        let new_router = match Router::build(config, &self.opts.router_options()) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                error!(error = %e, "reload failed, keeping current configuration");
                return Err(e);
            }
        };

        // hold client traffic; the feedback loop keeps running so the
        // old aggregators can drain through their stub routes
        self.hold_tx.send_replace(true);

        let old_aggregators = std::mem::take(&mut self.aggregator_tasks);
        for (aggregator, _) in &old_aggregators {
            aggregator.stop();
        }
        for (_, task) in old_aggregators {
            let _ = task.await;
        }

        // hand over in-flight queues by destination identity
        let mut transplanted = 0;
        for server in &new_router.servers {
            if let Some(old) = current.find_server(server.descriptor()) {
                server.transplant_from(old);
                transplanted += 1;
            }
        }

        let old_senders = std::mem::take(&mut self.sender_tasks);
        self.spawn_graph_tasks(&new_router);

        // publish and release the workers
        self.router_tx.send_replace(Arc::clone(&new_router));
        self.hold_tx.send_replace(false);

        // old senders drain whatever was not transplanted and exit
        for (sender, _) in &old_senders {
            sender.stop();
        }
        for (sender, task) in old_senders {
            if task.await.is_err() {
                warn!(destination = %sender.descriptor(), "sender task panicked");
            }
        }

        info!(
            servers = new_router.servers.len(),
            transplanted, "reload complete"
        );
        Ok(())
    }

    /// Graceful shutdown: listeners, collector, aggregators, workers,
    /// senders, strictly in that order.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.running_tx.send_replace(false);

        for task in self.listener_tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(task) = self.collector_task.take() {
            let _ = task.await;
        }
        for (aggregator, _) in &self.aggregator_tasks {
            aggregator.stop();
        }
        for (_, task) in self.aggregator_tasks.drain(..) {
            let _ = task.await;
        }
        // tell the feedback loop to drain whatever is buffered and exit
        self.feedback_stop_tx.send_replace(true);
        let _ = self.feedback_task.await;

        for (sender, _) in &self.sender_tasks {
            sender.stop();
        }
        for (sender, task) in self.sender_tasks.drain(..) {
            if task.await.is_err() {
                warn!(destination = %sender.descriptor(), "sender task panicked");
            }
        }
        info!("shutdown complete");
    }

    /// Current ingress counters, mainly for tests and debugging.
    #[must_use]
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// The live graph generation.
    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        self.router_tx.borrow().clone()
    }

    #[must_use]
    pub fn config(&self) -> Config {
        self.router_tx.borrow().config.clone()
    }
}
