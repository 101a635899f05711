//! Hand-written parser for the relay configuration grammar
//!
//! Statements are keyword-led and terminated by `;`. Tokens are
//! whitespace-separated; double quotes protect patterns that contain
//! whitespace or would otherwise read as a keyword. `#` starts a
//! comment running to end of line. Errors carry the line and column of
//! the offending token.

use std::path::{Path, PathBuf};

use crate::aggregator::{ComputeKind, TsWhen};
use crate::cluster::ValidationAction;
use crate::error::RelayError;
use crate::stream::WireCompression;

use super::{
    AggregateDecl, ClusterDecl, ClusterPolicy, ComputeDecl, Config, ListenAddr, ListenDecl,
    ListenTlsDecl, MatchDecl, Proto, RuleDecl, ServerDecl, SockType, StatisticsDecl, TlsDecl,
    ValidateDecl,
};

#[derive(Debug, Clone)]
struct Token {
    text: String,
    quoted: bool,
    line: usize,
    col: usize,
}

struct Tokens {
    tokens: Vec<Token>,
    pos: usize,
}

fn err(token: Option<&Token>, message: impl Into<String>) -> RelayError {
    match token {
        Some(t) => RelayError::ConfigParse {
            line: t.line,
            column: t.col,
            message: message.into(),
        },
        None => RelayError::ConfigParse {
            line: 0,
            column: 0,
            message: format!("{} (unexpected end of input)", message.into()),
        },
    }
}

impl Tokens {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        if self.pos < self.tokens.len() {
            self.pos += 1;
            self.tokens.get(self.pos - 1)
        } else {
            None
        }
    }

    /// Next token, required.
    fn expect_any(&mut self, what: &str) -> Result<Token, RelayError> {
        match self.next() {
            Some(t) => Ok(t.clone()),
            None => Err(err(None, format!("expected {what}"))),
        }
    }

    /// Next token must be the (unquoted) keyword `kw`.
    fn expect_kw(&mut self, kw: &str) -> Result<(), RelayError> {
        let t = self.expect_any(&format!("'{kw}'"))?;
        if !t.quoted && t.text.eq_ignore_ascii_case(kw) {
            Ok(())
        } else {
            Err(err(Some(&t), format!("expected '{kw}', found '{}'", t.text)))
        }
    }

    /// Consumes the keyword if it is next.
    fn eat_kw(&mut self, kw: &str) -> bool {
        if let Some(t) = self.peek() {
            if !t.quoted && t.text.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn peek_is_kw(&self, kw: &str) -> bool {
        self.peek()
            .is_some_and(|t| !t.quoted && t.text.eq_ignore_ascii_case(kw))
    }

    fn expect_number(&mut self, what: &str) -> Result<u64, RelayError> {
        let t = self.expect_any(what)?;
        t.text
            .parse()
            .map_err(|_| err(Some(&t), format!("expected {what}, found '{}'", t.text)))
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let mut chars = line.char_indices().peekable();
        while let Some(&(col, c)) = chars.peek() {
            match c {
                '#' => break,
                ';' => {
                    tokens.push(Token {
                        text: ";".to_string(),
                        quoted: false,
                        line: lineno + 1,
                        col: col + 1,
                    });
                    chars.next();
                }
                '"' => {
                    chars.next();
                    let mut text = String::new();
                    for (_, c) in chars.by_ref() {
                        if c == '"' {
                            break;
                        }
                        text.push(c);
                    }
                    tokens.push(Token {
                        text,
                        quoted: true,
                        line: lineno + 1,
                        col: col + 1,
                    });
                }
                c if c.is_whitespace() => {
                    chars.next();
                }
                _ => {
                    let mut text = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_whitespace() || c == ';' || c == '#' || c == '"' {
                            break;
                        }
                        text.push(c);
                        chars.next();
                    }
                    tokens.push(Token {
                        text,
                        quoted: false,
                        line: lineno + 1,
                        col: col + 1,
                    });
                }
            }
        }
    }
    tokens
}

/// Parses the configuration file at `path`, following includes.
pub fn parse_file(path: &Path) -> Result<Config, RelayError> {
    let mut config = Config::default();
    parse_into(path, &mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Parses configuration text without include resolution, mainly for
/// tests and the canonical round-trip.
pub fn parse_string(text: &str) -> Result<Config, RelayError> {
    let mut config = Config::default();
    parse_text(text, Path::new("."), &mut config)?;
    validate(&config)?;
    Ok(config)
}

fn parse_into(path: &Path, config: &mut Config) -> Result<(), RelayError> {
    let text = std::fs::read_to_string(path).map_err(|e| RelayError::ConfigInvalid {
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_text(&text, base, config)
}

fn parse_text(text: &str, base: &Path, config: &mut Config) -> Result<(), RelayError> {
    let mut tokens = Tokens {
        tokens: tokenize(text),
        pos: 0,
    };

    while let Some(token) = tokens.peek().cloned() {
        let keyword = token.text.to_ascii_lowercase();
        match keyword.as_str() {
            "cluster" => {
                tokens.next();
                let cluster = parse_cluster(&mut tokens)?;
                config.clusters.push(cluster);
            }
            "match" => {
                tokens.next();
                let rule = parse_match(&mut tokens)?;
                config.rules.push(RuleDecl::Match(rule));
            }
            "rewrite" => {
                tokens.next();
                let pattern = tokens.expect_any("rewrite pattern")?.text;
                tokens.expect_kw("into")?;
                let replacement = tokens.expect_any("rewrite replacement")?.text;
                tokens.expect_kw(";")?;
                config.rules.push(RuleDecl::Rewrite {
                    pattern,
                    replacement,
                });
            }
            "aggregate" => {
                tokens.next();
                let rule = parse_aggregate(&mut tokens)?;
                config.rules.push(RuleDecl::Aggregate(rule));
            }
            "statistics" => {
                tokens.next();
                let stats = parse_statistics(&mut tokens)?;
                if config.statistics.is_some() {
                    return Err(err(Some(&token), "duplicate statistics statement"));
                }
                config.statistics = Some(stats);
            }
            "listen" => {
                tokens.next();
                let listen = parse_listen(&mut tokens)?;
                config.listeners.push(listen);
            }
            "include" => {
                tokens.next();
                let pattern = tokens.expect_any("include path")?;
                tokens.expect_kw(";")?;
                for path in glob_paths(base, &pattern.text) {
                    parse_into(&path, config)?;
                }
            }
            _ => {
                return Err(err(
                    Some(&token),
                    format!("unexpected token '{}'", token.text),
                ))
            }
        }
    }
    Ok(())
}

/// Minimal glob: a single `*` in the final path component.
fn glob_paths(base: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };
    let Some(name) = full.file_name().and_then(|n| n.to_str()) else {
        return vec![full];
    };
    let Some(star) = name.find('*') else {
        return vec![full];
    };
    let (prefix, suffix) = (&name[..star], &name[star + 1..]);
    let dir = full.parent().unwrap_or_else(|| Path::new("."));
    let mut out: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(prefix) && n.ends_with(suffix))
                })
                .collect()
        })
        .unwrap_or_default();
    out.sort();
    out
}

fn parse_cluster(tokens: &mut Tokens) -> Result<ClusterDecl, RelayError> {
    let name = tokens.expect_any("cluster name")?.text;
    let policy_token = tokens.expect_any("cluster type")?;
    let policy = match policy_token.text.to_ascii_lowercase().as_str() {
        "forward" => ClusterPolicy::Forward,
        "any_of" => ClusterPolicy::AnyOf {
            useall: tokens.eat_kw("useall"),
        },
        "failover" => ClusterPolicy::Failover,
        "carbon_ch" | "fnv1a_ch" | "jump_fnv1a_ch" => {
            let mut replication = 1;
            let mut dynamic = false;
            loop {
                if tokens.eat_kw("replication") {
                    replication = tokens.expect_number("replication count")? as usize;
                } else if tokens.eat_kw("dynamic") {
                    dynamic = true;
                } else {
                    break;
                }
            }
            match policy_token.text.to_ascii_lowercase().as_str() {
                "carbon_ch" => ClusterPolicy::CarbonCh {
                    replication,
                    dynamic,
                },
                "fnv1a_ch" => ClusterPolicy::Fnv1aCh {
                    replication,
                    dynamic,
                },
                _ => ClusterPolicy::JumpFnv1aCh {
                    replication,
                    dynamic,
                },
            }
        }
        "file" => ClusterPolicy::File {
            with_ip: tokens.eat_kw("ip"),
        },
        other => {
            return Err(err(
                Some(&policy_token),
                format!("unknown cluster type '{other}'"),
            ))
        }
    };

    let mut servers = Vec::new();
    loop {
        let token = tokens.expect_any("server address or ';'")?;
        if !token.quoted && token.text == ";" {
            break;
        }
        servers.push(parse_server(tokens, &token, &policy)?);
    }
    if servers.is_empty() {
        return Err(RelayError::ConfigInvalid {
            message: format!("cluster '{name}' has no servers"),
        });
    }
    Ok(ClusterDecl {
        name,
        policy,
        servers,
    })
}

fn parse_server(
    tokens: &mut Tokens,
    addr: &Token,
    policy: &ClusterPolicy,
) -> Result<ServerDecl, RelayError> {
    let mut server = if matches!(policy, ClusterPolicy::File { .. }) {
        // file clusters name paths, not sockets
        ServerDecl {
            host: addr.text.clone(),
            port: 0,
            instance: None,
            proto: Proto::Tcp,
            stype: SockType::Linemode,
            compression: WireCompression::Plain,
            tls: None,
        }
    } else {
        let (hostport, instance) = match addr.text.rsplit_once('=') {
            // '=' inside a v6 literal cannot happen; rsplit keeps
            // 'host:port=inst' intact
            Some((hp, inst)) if !inst.is_empty() => (hp, Some(inst.to_string())),
            _ => (addr.text.as_str(), None),
        };
        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| err(Some(addr), format!("invalid address '{}'", addr.text)))?;
        ServerDecl {
            host,
            port: port.unwrap_or(2003),
            instance,
            proto: Proto::Tcp,
            stype: SockType::Linemode,
            compression: WireCompression::Plain,
            tls: None,
        }
    };

    loop {
        if tokens.eat_kw("proto") {
            let t = tokens.expect_any("protocol")?;
            server.proto = match t.text.to_ascii_lowercase().as_str() {
                "tcp" => Proto::Tcp,
                "udp" => Proto::Udp,
                other => return Err(err(Some(&t), format!("unknown protocol '{other}'"))),
            };
        } else if tokens.eat_kw("type") {
            let t = tokens.expect_any("socket type")?;
            server.stype = match t.text.to_ascii_lowercase().as_str() {
                "linemode" => SockType::Linemode,
                "syslog" => SockType::Syslog,
                other => return Err(err(Some(&t), format!("unknown socket type '{other}'"))),
            };
        } else if tokens.eat_kw("transport") {
            let t = tokens.expect_any("transport")?;
            server.compression = parse_compression(&t)?;
            if tokens.eat_kw("ssl") {
                let cert = tokens.expect_any("certificate file")?.text;
                server.tls = Some(TlsDecl {
                    mutual: false,
                    cert,
                    ca: None,
                });
            } else if tokens.eat_kw("mtls") {
                let cert = tokens.expect_any("certificate file")?.text;
                let ca = tokens.expect_any("CA file")?.text;
                server.tls = Some(TlsDecl {
                    mutual: true,
                    cert,
                    ca: Some(ca),
                });
            }
        } else {
            break;
        }
    }
    Ok(server)
}

fn parse_compression(token: &Token) -> Result<WireCompression, RelayError> {
    match token.text.to_ascii_lowercase().as_str() {
        "plain" => Ok(WireCompression::Plain),
        "gzip" => Ok(WireCompression::Gzip),
        "lz4" => Ok(WireCompression::Lz4),
        "snappy" => Ok(WireCompression::Snappy),
        other => Err(err(Some(token), format!("unknown transport '{other}'"))),
    }
}

fn split_host_port(text: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = text.strip_prefix('[') {
        // bracketed IPv6
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        return Some((host.to_string(), port));
    }
    // a lone colon separates host and port; more means a bare v6
    if text.matches(':').count() == 1 {
        let (host, port) = text.split_once(':')?;
        return Some((host.to_string(), Some(port.parse().ok()?)));
    }
    Some((text.to_string(), None))
}

const MATCH_CLAUSES: [&str; 5] = ["validate", "route", "send", "stop", ";"];

fn parse_match(tokens: &mut Tokens) -> Result<MatchDecl, RelayError> {
    let mut decl = MatchDecl {
        patterns: Vec::new(),
        validate: None,
        route_using: None,
        send_to: Vec::new(),
        stop: false,
    };

    while let Some(t) = tokens.peek() {
        if !t.quoted && MATCH_CLAUSES.iter().any(|k| t.text.eq_ignore_ascii_case(k)) {
            break;
        }
        decl.patterns.push(tokens.expect_any("pattern")?.text);
    }
    if decl.patterns.is_empty() {
        return Err(err(tokens.peek(), "match needs at least one pattern"));
    }

    if tokens.eat_kw("validate") {
        let pattern = tokens.expect_any("validation pattern")?.text;
        tokens.expect_kw("else")?;
        let action_token = tokens.expect_any("'log' or 'drop'")?;
        let action = match action_token.text.to_ascii_lowercase().as_str() {
            "log" => ValidationAction::Log,
            "drop" => ValidationAction::Drop,
            other => {
                return Err(err(
                    Some(&action_token),
                    format!("expected 'log' or 'drop', found '{other}'"),
                ))
            }
        };
        decl.validate = Some(ValidateDecl { pattern, action });
    }
    if tokens.eat_kw("route") {
        tokens.expect_kw("using")?;
        decl.route_using = Some(tokens.expect_any("masquerade template")?.text);
    }
    if tokens.eat_kw("send") {
        tokens.expect_kw("to")?;
        while let Some(t) = tokens.peek() {
            if !t.quoted && (t.text == ";" || t.text.eq_ignore_ascii_case("stop")) {
                break;
            }
            decl.send_to.push(tokens.expect_any("destination")?.text);
        }
        if decl.send_to.is_empty() {
            return Err(err(tokens.peek(), "send to needs at least one destination"));
        }
    }
    decl.stop = tokens.eat_kw("stop");
    tokens.expect_kw(";")?;

    if decl.send_to.is_empty() && decl.validate.is_none() {
        return Err(RelayError::ConfigInvalid {
            message: format!(
                "match rule for '{}' has no destinations",
                decl.patterns.join(" ")
            ),
        });
    }
    Ok(decl)
}

fn parse_aggregate(tokens: &mut Tokens) -> Result<AggregateDecl, RelayError> {
    let mut decl = AggregateDecl {
        patterns: Vec::new(),
        every: 0,
        expire_after: 0,
        tswhen: TsWhen::End,
        computes: Vec::new(),
        send_to: Vec::new(),
        stop: false,
    };

    while let Some(t) = tokens.peek() {
        if !t.quoted && t.text.eq_ignore_ascii_case("every") {
            break;
        }
        decl.patterns.push(tokens.expect_any("pattern")?.text);
    }
    if decl.patterns.is_empty() {
        return Err(err(tokens.peek(), "aggregate needs at least one pattern"));
    }

    tokens.expect_kw("every")?;
    decl.every = tokens.expect_number("interval in seconds")?;
    tokens.expect_kw("seconds")?;
    tokens.expect_kw("expire")?;
    tokens.expect_kw("after")?;
    decl.expire_after = tokens.expect_number("expiry in seconds")?;
    tokens.expect_kw("seconds")?;

    if tokens.eat_kw("timestamp") {
        tokens.expect_kw("at")?;
        let t = tokens.expect_any("'start', 'middle' or 'end'")?;
        decl.tswhen = match t.text.to_ascii_lowercase().as_str() {
            "start" => TsWhen::Start,
            "middle" => TsWhen::Middle,
            "end" => TsWhen::End,
            other => {
                return Err(err(
                    Some(&t),
                    format!("expected 'start', 'middle' or 'end', found '{other}'"),
                ))
            }
        };
        tokens.expect_kw("of")?;
        tokens.expect_kw("bucket")?;
    }

    while tokens.eat_kw("compute") {
        let kind_token = tokens.expect_any("computation")?;
        let text = kind_token.text.to_ascii_lowercase();
        let (kind, percentile) = if let Some(p) = text.strip_prefix("percentile") {
            let percentile: u8 = p.parse().map_err(|_| {
                err(Some(&kind_token), format!("bad percentile '{text}'"))
            })?;
            if percentile == 0 || percentile > 100 {
                return Err(err(
                    Some(&kind_token),
                    format!("percentile {percentile} out of range"),
                ));
            }
            (ComputeKind::Percentile, percentile)
        } else {
            let kind = match text.as_str() {
                "sum" => ComputeKind::Sum,
                "count" | "cnt" => ComputeKind::Count,
                "max" => ComputeKind::Max,
                "min" => ComputeKind::Min,
                "average" | "avg" => ComputeKind::Average,
                "median" => ComputeKind::Median,
                "variance" => ComputeKind::Variance,
                "stddev" => ComputeKind::Stddev,
                other => {
                    return Err(err(
                        Some(&kind_token),
                        format!("unknown computation '{other}'"),
                    ))
                }
            };
            (kind, if kind == ComputeKind::Median { 50 } else { 0 })
        };
        tokens.expect_kw("write")?;
        tokens.expect_kw("to")?;
        let write_to = tokens.expect_any("output metric name")?.text;
        decl.computes.push(ComputeDecl {
            kind,
            percentile,
            write_to,
        });
    }
    if decl.computes.is_empty() {
        return Err(err(tokens.peek(), "aggregate needs at least one compute"));
    }

    if tokens.eat_kw("send") {
        tokens.expect_kw("to")?;
        while let Some(t) = tokens.peek() {
            if !t.quoted && (t.text == ";" || t.text.eq_ignore_ascii_case("stop")) {
                break;
            }
            decl.send_to.push(tokens.expect_any("destination")?.text);
        }
    }
    decl.stop = tokens.eat_kw("stop");
    tokens.expect_kw(";")?;

    if decl.every == 0 || decl.every >= decl.expire_after {
        return Err(RelayError::ConfigInvalid {
            message: format!(
                "aggregate interval {} must be positive and below expiry {}",
                decl.every, decl.expire_after
            ),
        });
    }
    Ok(decl)
}

fn parse_statistics(tokens: &mut Tokens) -> Result<StatisticsDecl, RelayError> {
    let mut decl = StatisticsDecl {
        interval: None,
        reset_after_interval: false,
        prefix: None,
        send_to: Vec::new(),
        stop: false,
    };
    if tokens.eat_kw("submit") {
        tokens.expect_kw("every")?;
        let interval = tokens.expect_number("interval in seconds")?;
        tokens.expect_kw("seconds")?;
        decl.interval = Some(interval);
    }
    if tokens.eat_kw("reset") {
        tokens.expect_kw("counters")?;
        tokens.expect_kw("after")?;
        tokens.expect_kw("interval")?;
        decl.reset_after_interval = true;
    }
    if tokens.eat_kw("prefix") {
        tokens.expect_kw("with")?;
        decl.prefix = Some(tokens.expect_any("prefix")?.text);
    }
    if tokens.eat_kw("send") {
        tokens.expect_kw("to")?;
        while let Some(t) = tokens.peek() {
            if !t.quoted && (t.text == ";" || t.text.eq_ignore_ascii_case("stop")) {
                break;
            }
            decl.send_to.push(tokens.expect_any("destination")?.text);
        }
    }
    decl.stop = tokens.eat_kw("stop");
    tokens.expect_kw(";")?;
    Ok(decl)
}

fn parse_listen(tokens: &mut Tokens) -> Result<ListenDecl, RelayError> {
    tokens.expect_kw("type")?;
    tokens.expect_kw("linemode")?;
    let mut decl = ListenDecl {
        stype: SockType::Linemode,
        compression: WireCompression::Plain,
        tls: None,
        addrs: Vec::new(),
    };

    if tokens.eat_kw("transport") {
        let t = tokens.expect_any("transport")?;
        decl.compression = parse_compression(&t)?;
        if tokens.eat_kw("ssl") {
            let cert = tokens.expect_any("certificate file")?.text;
            let key = tokens.expect_any("key file")?.text;
            decl.tls = Some(ListenTlsDecl {
                cert,
                key,
                client_ca: None,
            });
        } else if tokens.eat_kw("mtls") {
            let cert = tokens.expect_any("certificate file")?.text;
            let key = tokens.expect_any("key file")?.text;
            let ca = tokens.expect_any("client CA file")?.text;
            decl.tls = Some(ListenTlsDecl {
                cert,
                key,
                client_ca: Some(ca),
            });
        }
    }

    loop {
        let token = tokens.expect_any("listen address or ';'")?;
        if !token.quoted && token.text == ";" {
            break;
        }
        tokens.expect_kw("proto")?;
        let proto_token = tokens.expect_any("protocol")?;
        let proto = match proto_token.text.to_ascii_lowercase().as_str() {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            "unix" => Proto::Unix,
            other => {
                return Err(err(
                    Some(&proto_token),
                    format!("unknown protocol '{other}'"),
                ))
            }
        };
        let addr = if proto == Proto::Unix {
            ListenAddr {
                address: token.text.clone(),
                port: None,
                proto,
            }
        } else {
            let (host, port) = split_host_port(&token.text)
                .ok_or_else(|| err(Some(&token), format!("invalid address '{}'", token.text)))?;
            ListenAddr {
                address: host,
                port,
                proto,
            }
        };
        decl.addrs.push(addr);
    }
    if decl.addrs.is_empty() {
        return Err(RelayError::ConfigInvalid {
            message: "listen statement without addresses".to_string(),
        });
    }
    Ok(decl)
}

/// Cross-statement checks: destination references and replication
/// factors.
fn validate(config: &Config) -> Result<(), RelayError> {
    let check_dest = |name: &str| -> Result<(), RelayError> {
        if name == "blackhole" || config.cluster(name).is_some() {
            Ok(())
        } else {
            Err(RelayError::ConfigInvalid {
                message: format!("unknown cluster '{name}' in send to"),
            })
        }
    };

    for rule in &config.rules {
        match rule {
            RuleDecl::Match(m) => {
                for dest in &m.send_to {
                    check_dest(dest)?;
                }
            }
            RuleDecl::Aggregate(a) => {
                for dest in &a.send_to {
                    check_dest(dest)?;
                }
            }
            RuleDecl::Rewrite { .. } => {}
        }
    }
    if let Some(stats) = &config.statistics {
        for dest in &stats.send_to {
            check_dest(dest)?;
        }
    }

    for cluster in &config.clusters {
        let replication = match &cluster.policy {
            ClusterPolicy::CarbonCh { replication, .. }
            | ClusterPolicy::Fnv1aCh { replication, .. }
            | ClusterPolicy::JumpFnv1aCh { replication, .. } => *replication,
            _ => continue,
        };
        if replication > cluster.servers.len() {
            return Err(RelayError::ConfigInvalid {
                message: format!(
                    "cluster '{}': replication {} exceeds {} servers",
                    cluster.name,
                    replication,
                    cluster.servers.len()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_cluster_and_match() {
        let config = parse_string(
            "cluster default\n    forward 10.0.0.1:2003;\nmatch * send to default stop;\n",
        )
        .unwrap();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].servers[0].host, "10.0.0.1");
        assert_eq!(config.rules.len(), 1);
        let RuleDecl::Match(m) = &config.rules[0] else {
            panic!("expected match rule");
        };
        assert_eq!(m.patterns, vec!["*"]);
        assert!(m.stop);
    }

    #[test]
    fn parses_carbon_ch_with_replication_and_instances() {
        let config = parse_string(
            "cluster ch carbon_ch replication 2\n\
             10.0.0.1:2003=a 10.0.0.2:2003=b 10.0.0.3:2003=c;\n\
             match * send to ch;\n",
        )
        .unwrap();
        let c = &config.clusters[0];
        assert_eq!(
            c.policy,
            ClusterPolicy::CarbonCh {
                replication: 2,
                dynamic: false
            }
        );
        assert_eq!(c.servers[1].instance.as_deref(), Some("b"));
    }

    #[test]
    fn rejects_replication_above_server_count() {
        let result = parse_string(
            "cluster ch fnv1a_ch replication 4 10.0.0.1:2003 10.0.0.2:2003;\nmatch * send to ch;\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_destination() {
        let result = parse_string("match * send to nowhere;\n");
        assert!(matches!(result, Err(RelayError::ConfigInvalid { .. })));
    }

    #[test]
    fn parse_error_carries_position() {
        let result = parse_string("cluster x bogus_policy 10.0.0.1:2003;\n");
        match result {
            Err(RelayError::ConfigParse { line, column, .. }) => {
                assert_eq!(line, 1);
                assert!(column > 1);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn parses_aggregate_with_computes() {
        let config = parse_string(
            "cluster out forward 10.0.0.1:2003;\n\
             aggregate ^sys\\..*\n\
                 every 10 seconds\n\
                 expire after 60 seconds\n\
                 timestamp at end of bucket\n\
                 compute sum write to sums.\\0\n\
                 compute percentile95 write to p95.\\0\n\
                 send to out;\n",
        )
        .unwrap();
        let RuleDecl::Aggregate(a) = &config.rules[0] else {
            panic!("expected aggregate");
        };
        assert_eq!(a.every, 10);
        assert_eq!(a.expire_after, 60);
        assert_eq!(a.computes.len(), 2);
        assert_eq!(a.computes[1].kind, ComputeKind::Percentile);
        assert_eq!(a.computes[1].percentile, 95);
    }

    #[test]
    fn rejects_interval_at_or_above_expiry() {
        let result = parse_string(
            "cluster out forward 10.0.0.1:2003;\n\
             aggregate x every 60 seconds expire after 60 seconds \
             compute sum write to s send to out;\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn parses_validate_clause() {
        let config = parse_string(
            "cluster out forward 10.0.0.1:2003;\n\
             match * validate \"^[0-9.e+-]+ [0-9]+$\" else drop send to out;\n",
        )
        .unwrap();
        let RuleDecl::Match(m) = &config.rules[0] else {
            panic!();
        };
        let v = m.validate.as_ref().unwrap();
        assert_eq!(v.action, ValidationAction::Drop);
        assert!(v.pattern.contains(' '));
    }

    #[test]
    fn parses_listen_and_statistics() {
        let config = parse_string(
            "cluster out forward 10.0.0.1:2003;\n\
             listen type linemode 0.0.0.0:2103 proto tcp /tmp/relay.sock proto unix;\n\
             match * send to out;\n\
             statistics submit every 30 seconds prefix with relay send to out stop;\n",
        )
        .unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].addrs.len(), 2);
        assert_eq!(config.listeners[0].addrs[1].proto, Proto::Unix);
        let stats = config.statistics.as_ref().unwrap();
        assert_eq!(stats.interval, Some(30));
        assert_eq!(stats.prefix.as_deref(), Some("relay"));
        assert!(stats.stop);
    }

    #[test]
    fn comments_and_blackhole_are_accepted() {
        let config = parse_string(
            "# drop everything ending in .bad\nmatch \\.bad$ send to blackhole stop;\n",
        )
        .unwrap();
        let RuleDecl::Match(m) = &config.rules[0] else {
            panic!();
        };
        assert_eq!(m.send_to, vec!["blackhole"]);
    }

    #[test]
    fn canonical_form_round_trips() {
        let text = "cluster ch\n\
                    carbon_ch replication 2\n\
                    10.0.0.1:2003=a 10.0.0.2:2003=b 10.0.0.3:2003=c;\n\
                    cluster files file ip /var/log/metrics.log;\n\
                    rewrite ^prod\\.([^.]+)\\.(.*)$ into apps.\\1.\\2;\n\
                    match ^apps\\. send to ch stop;\n\
                    match * send to blackhole stop;\n";
        let config = parse_string(text).unwrap();
        let printed = config.to_string();
        let reparsed = parse_string(&printed).unwrap();
        assert_eq!(config, reparsed);
    }
}
