//! Consistent-hash rings for cluster member selection
//!
//! Three flavours share one selection interface: the carbon ring
//! (MD5-based, byte-compatible with the Python carbon hash), the
//! fnv1a ring, and the Lamping-Veach jump hash fed by FNV-1a-64.
//! Ring positions live in a 16-bit space; carbon and fnv1a place 100
//! replicas per member, jump places one entry per member and derives
//! replicas by re-hashing.

use md5::{Digest, Md5};

use crate::sender::Sender;
use std::sync::Arc;

/// Number of positions each server occupies on a carbon/fnv1a ring.
/// Hardwired in the carbon sources; required for compatible balancing.
const HASH_REPLICAS: usize = 100;

pub const FNV1A_32_OFFSET: u32 = 2_166_136_261;
pub const FNV1A_32_PRIME: u32 = 16_777_619;
const FNV1A_64_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV1A_64_PRIME: u64 = 1_099_511_628_211;

/// 32-bit FNV-1a over `key`.
#[must_use]
pub fn fnv1a32(key: &[u8]) -> u32 {
    let mut hash = FNV1A_32_OFFSET;
    for &b in key {
        hash = (hash ^ u32::from(b)).wrapping_mul(FNV1A_32_PRIME);
    }
    hash
}

/// 64-bit FNV-1a over `key`.
#[must_use]
pub fn fnv1a64(key: &[u8]) -> u64 {
    let mut hash = FNV1A_64_OFFSET;
    for &b in key {
        hash = (hash ^ u64::from(b)).wrapping_mul(FNV1A_64_PRIME);
    }
    hash
}

/// Position of `key` on a carbon ring: the top two bytes of its MD5 sum.
#[must_use]
pub fn carbon_hashpos(key: &[u8]) -> u16 {
    let digest = Md5::digest(key);
    (u16::from(digest[0]) << 8) + u16::from(digest[1])
}

/// Position of `key` on an fnv1a ring: FNV-1a-32 folded to 16 bits.
#[must_use]
pub fn fnv1a_hashpos(key: &[u8]) -> u16 {
    let hash = fnv1a32(key);
    ((hash >> 16) ^ (hash & 0xFFFF)) as u16
}

/// Lamping-Veach jump consistent hash: bucket for `key` in `[0, buckets)`.
#[must_use]
pub fn jump_bucketpos(mut key: u64, buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while (j as usize) < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * (f64::from(1u32 << 31) / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Carbon,
    Fnv1a,
    JumpFnv1a,
}

struct RingEntry {
    pos: u16,
    server: Arc<Sender>,
}

/// A sorted map from 16-bit positions to servers.
pub struct Ring {
    kind: RingKind,
    entries: Vec<RingEntry>,
}

impl Ring {
    /// Builds a ring over `servers` in declaration order.
    #[must_use]
    pub fn new(kind: RingKind, servers: &[Arc<Sender>]) -> Self {
        let mut entries = Vec::with_capacity(match kind {
            RingKind::JumpFnv1a => servers.len(),
            _ => servers.len() * HASH_REPLICAS,
        });

        for (defidx, server) in servers.iter().enumerate() {
            match kind {
                RingKind::Carbon => {
                    for i in 0..HASH_REPLICAS {
                        // Python tuple format, serialised; this is the
                        // hash input the original carbon uses
                        let key = match server.descriptor().instance.as_deref() {
                            Some(inst) => {
                                format!("('{}', '{}'):{}", server.descriptor().host, inst, i)
                            }
                            None => format!("('{}', None):{}", server.descriptor().host, i),
                        };
                        entries.push(RingEntry {
                            pos: carbon_hashpos(key.as_bytes()),
                            server: Arc::clone(server),
                        });
                    }
                }
                RingKind::Fnv1a => {
                    for i in 0..HASH_REPLICAS {
                        // take host and port into account so different
                        // ports on one host balance independently,
                        // unless an instance overrides the key entirely
                        let key = match server.descriptor().instance.as_deref() {
                            Some(inst) => format!("{i}-{inst}"),
                            None => format!(
                                "{}-{}:{}",
                                i,
                                server.descriptor().host,
                                server.descriptor().port
                            ),
                        };
                        entries.push(RingEntry {
                            pos: fnv1a_hashpos(key.as_bytes()),
                            server: Arc::clone(server),
                        });
                    }
                }
                RingKind::JumpFnv1a => {
                    entries.push(RingEntry {
                        pos: defidx as u16,
                        server: Arc::clone(server),
                    });
                }
            }
        }

        match kind {
            RingKind::JumpFnv1a => {
                // servers with an explicit instance come first (numeric
                // instances compare as numbers), the rest keep their
                // definition order
                entries.sort_by(|l, r| {
                    match (
                        l.server.descriptor().instance.as_deref(),
                        r.server.descriptor().instance.as_deref(),
                    ) {
                        (None, None) => l.pos.cmp(&r.pos),
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (Some(a), Some(b)) => match (a.parse::<i64>(), b.parse::<i64>()) {
                            (Ok(x), Ok(y)) => x.cmp(&y),
                            _ => a.cmp(b),
                        },
                    }
                });
            }
            RingKind::Carbon => {
                entries.sort_by(|l, r| {
                    l.pos
                        .cmp(&r.pos)
                        .then_with(|| l.server.descriptor().host.cmp(&r.server.descriptor().host))
                        .then_with(|| {
                            ord_option(
                                l.server.descriptor().instance.as_deref(),
                                r.server.descriptor().instance.as_deref(),
                            )
                        })
                });
                collapse_duplicates(&mut entries);
            }
            RingKind::Fnv1a => {
                entries.sort_by(|l, r| {
                    l.pos
                        .cmp(&r.pos)
                        .then_with(|| l.server.descriptor().host.cmp(&r.server.descriptor().host))
                        .then_with(|| l.server.descriptor().port.cmp(&r.server.descriptor().port))
                });
                collapse_duplicates(&mut entries);
            }
        }

        Self { kind, entries }
    }

    #[must_use]
    pub fn kind(&self) -> RingKind {
        self.kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Servers responsible for `key` (the metric-name range), `replicas`
    /// distinct entries in ring order.
    pub fn get_nodes(&self, key: &[u8], replicas: usize) -> Vec<Arc<Sender>> {
        let mut out: Vec<Arc<Sender>> = Vec::with_capacity(replicas);

        if self.kind == RingKind::JumpFnv1a {
            let mut hash = fnv1a64(key);
            let mut pool: Vec<&Arc<Sender>> = self.entries.iter().map(|e| &e.server).collect();
            while !pool.is_empty() && out.len() < replicas {
                let j = jump_bucketpos(hash, pool.len());
                out.push(Arc::clone(pool[j]));
                // xorshift-multiply the hash so the next round walks a
                // different sequence, then remove the chosen bucket to
                // guarantee a distinct server
                hash ^= hash >> 12;
                hash ^= hash << 25;
                hash ^= hash >> 27;
                hash = hash.wrapping_mul(2_685_821_657_736_338_717);
                pool.swap_remove(j);
            }
            return out;
        }

        let pos = match self.kind {
            RingKind::Carbon => carbon_hashpos(key),
            RingKind::Fnv1a => fnv1a_hashpos(key),
            RingKind::JumpFnv1a => unreachable!(),
        };

        // first entry with entry.pos >= pos, wrapping at the end
        let start = self.entries.partition_point(|e| e.pos < pos);
        let n = self.entries.len();
        let mut t = if start == n { 0 } else { start };
        let mut seen = 0usize;
        while out.len() < replicas && seen < n {
            let server = &self.entries[t].server;
            if !out.iter().any(|s| Arc::ptr_eq(s, server)) {
                out.push(Arc::clone(server));
            }
            t = (t + 1) % n;
            seen += 1;
        }
        out
    }
}

fn ord_option(l: Option<&str>, r: Option<&str>) -> std::cmp::Ordering {
    // entries without an instance sort after those with one
    match (l, r) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Overwrite successive duplicate positions with the first entry so a
/// binary search always lands on a deterministic server.
fn collapse_duplicates(entries: &mut [RingEntry]) {
    for i in 1..entries.len() {
        if entries[i].pos == entries[i - 1].pos {
            entries[i].server = Arc::clone(&entries[i - 1].server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{ConnectionKind, Sender, ServerDescriptor};

    fn server(host: &str, port: u16, instance: Option<&str>) -> Arc<Sender> {
        Sender::for_tests(ServerDescriptor {
            kind: ConnectionKind::Tcp,
            host: host.to_string(),
            port,
            instance: instance.map(str::to_string),
        })
    }

    #[test]
    fn fnv1a32_known_vector() {
        // FNV-1a of the empty input is the offset basis
        assert_eq!(fnv1a32(b""), FNV1A_32_OFFSET);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn carbon_hashpos_uses_top_md5_bytes() {
        // MD5("") = d41d8cd9..., top two bytes
        assert_eq!(carbon_hashpos(b""), 0xd41d);
    }

    #[test]
    fn jump_single_bucket_is_always_zero() {
        for key in [0u64, 1, 42, u64::MAX] {
            assert_eq!(jump_bucketpos(key, 1), 0);
        }
    }

    #[test]
    fn jump_stays_in_range() {
        for key in 0..2000u64 {
            let b = jump_bucketpos(key.wrapping_mul(0x9E37_79B9_7F4A_7C15), 7);
            assert!(b < 7);
        }
    }

    #[test]
    fn ring_selection_is_stable() {
        let servers = vec![
            server("10.0.0.1", 2003, None),
            server("10.0.0.2", 2003, None),
            server("10.0.0.3", 2003, None),
        ];
        let ring = Ring::new(RingKind::Carbon, &servers);
        let a = ring.get_nodes(b"foo.bar", 2);
        let b = ring.get_nodes(b"foo.bar", 2);
        assert_eq!(a.len(), 2);
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert!(Arc::ptr_eq(&a[1], &b[1]));
        assert!(!Arc::ptr_eq(&a[0], &a[1]));
    }

    #[test]
    fn ring_returns_distinct_replicas() {
        let servers = vec![
            server("10.0.0.1", 2003, None),
            server("10.0.0.2", 2003, None),
            server("10.0.0.3", 2003, None),
            server("10.0.0.4", 2003, None),
        ];
        for kind in [RingKind::Carbon, RingKind::Fnv1a, RingKind::JumpFnv1a] {
            let ring = Ring::new(kind, &servers);
            for name in ["sys.cpu.total", "app.req.count", "x"] {
                let picked = ring.get_nodes(name.as_bytes(), 3);
                assert_eq!(picked.len(), 3, "{kind:?} {name}");
                for i in 0..picked.len() {
                    for j in i + 1..picked.len() {
                        assert!(!Arc::ptr_eq(&picked[i], &picked[j]));
                    }
                }
            }
        }
    }

    #[test]
    fn jump_single_server_gets_everything() {
        let servers = vec![server("10.0.0.1", 2003, None)];
        let ring = Ring::new(RingKind::JumpFnv1a, &servers);
        for name in ["a", "b.c", "long.metric.name.here"] {
            let picked = ring.get_nodes(name.as_bytes(), 1);
            assert_eq!(picked.len(), 1);
            assert!(Arc::ptr_eq(&picked[0], &servers[0]));
        }
    }

    #[test]
    fn fnv1a_ring_distinguishes_ports() {
        let servers = vec![server("10.0.0.1", 2003, None), server("10.0.0.1", 2004, None)];
        let ring = Ring::new(RingKind::Fnv1a, &servers);
        // both servers must appear somewhere on the ring
        let mut hit = [false, false];
        for name in 0..200 {
            let picked = ring.get_nodes(format!("m.{name}").as_bytes(), 1);
            for (i, s) in servers.iter().enumerate() {
                if Arc::ptr_eq(&picked[0], s) {
                    hit[i] = true;
                }
            }
        }
        assert!(hit[0] && hit[1]);
    }

    #[test]
    fn instance_overrides_fnv1a_key() {
        // same host/port, different instances: ring positions differ
        let a = vec![server("10.0.0.1", 2003, Some("a"))];
        let b = vec![server("10.0.0.1", 2003, Some("b"))];
        let ra = Ring::new(RingKind::Fnv1a, &a);
        let rb = Ring::new(RingKind::Fnv1a, &b);
        let pa: Vec<u16> = ra.entries.iter().map(|e| e.pos).collect();
        let pb: Vec<u16> = rb.entries.iter().map(|e| e.pos).collect();
        assert_ne!(pa, pb);
    }
}
