//! Route table: pattern matching and metric-name rewriting
//!
//! Routes are evaluated in declaration order. Each rule carries a
//! matcher derived from its pattern at parse time, preferring the
//! cheapest kind that can do the job: most patterns people write are
//! plain prefixes or literals, and running a regex over every line at
//! several hundred thousand lines per second is money down the drain.
//! Only patterns with live metacharacters compile to a regex.

use regex::bytes::Regex;

use crate::cluster::Cluster;
use crate::error::RelayError;
use std::sync::Arc;

/// How a route decides whether a metric name is for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    All,
    Regex,
    Contains,
    StartsWith,
    EndsWith,
    Equals,
}

/// Capture spans into the metric name, index 0 being the whole match.
/// Unmatched optional groups are `None`.
#[derive(Debug, Clone, Default)]
pub struct MatchSpans(pub Vec<Option<(usize, usize)>>);

impl MatchSpans {
    #[must_use]
    pub fn whole(len: usize) -> Self {
        Self(vec![Some((0, len))])
    }
}

/// A compiled matcher plus the original pattern text.
#[derive(Debug)]
pub struct Matcher {
    kind: MatchKind,
    pattern: String,
    literal: Vec<u8>,
    regex: Option<Regex>,
    /// Number of capture spans produced on a match (incl. span 0).
    nmatch: usize,
}

impl Matcher {
    /// Derives the cheapest matcher able to honour `pattern`.
    pub fn from_pattern(pattern: &str) -> Result<Self, RelayError> {
        if pattern == "*" {
            return Ok(Self {
                kind: MatchKind::All,
                pattern: pattern.to_string(),
                literal: Vec::new(),
                regex: None,
                nmatch: 0,
            });
        }

        let bytes = pattern.as_bytes();
        let mut kind = MatchKind::Contains;
        let mut literal: Vec<u8> = Vec::with_capacity(bytes.len());
        let mut escape = false;
        let mut idx = 0;

        if bytes.first() == Some(&b'^') {
            idx = 1;
            kind = MatchKind::StartsWith;
        }

        let mut is_regex = false;
        while idx < bytes.len() {
            let c = bytes[idx];
            match c {
                b'\\' => {
                    if escape {
                        literal.push(c);
                    }
                    escape = !escape;
                }
                b'.' | b'^' | b'*' | b'+' => {
                    if !escape {
                        is_regex = true;
                    }
                    literal.push(c);
                    escape = false;
                }
                b'$' => {
                    if !escape && idx == bytes.len() - 1 {
                        kind = if kind == MatchKind::StartsWith {
                            MatchKind::Equals
                        } else {
                            MatchKind::EndsWith
                        };
                    } else {
                        is_regex = true;
                    }
                    escape = false;
                }
                _ => {
                    if !escape && (c == b'_' || c == b'-' || c.is_ascii_alphanumeric()) {
                        literal.push(c);
                    } else {
                        is_regex = true;
                    }
                    escape = false;
                }
            }
            if is_regex {
                break;
            }
            idx += 1;
        }

        if is_regex {
            let regex = Regex::new(pattern).map_err(|e| RelayError::Pattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            let nmatch = regex.captures_len();
            Ok(Self {
                kind: MatchKind::Regex,
                pattern: pattern.to_string(),
                literal: Vec::new(),
                regex: Some(regex),
                nmatch,
            })
        } else {
            Ok(Self {
                kind,
                pattern: pattern.to_string(),
                literal,
                regex: None,
                nmatch: 0,
            })
        }
    }

    /// A bare `contains` matcher, used for optimiser groups.
    #[must_use]
    pub fn contains(block: &[u8]) -> Self {
        Self {
            kind: MatchKind::Contains,
            pattern: String::from_utf8_lossy(block).into_owned(),
            literal: block.to_vec(),
            regex: None,
            nmatch: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn nmatch(&self) -> usize {
        self.nmatch
    }

    /// Tests `name` (the metric-name range only), returning capture
    /// spans on success.
    pub fn matches(&self, name: &[u8]) -> Option<MatchSpans> {
        match self.kind {
            MatchKind::All => Some(MatchSpans::whole(name.len())),
            MatchKind::Regex => {
                let caps = self.regex.as_ref().unwrap().captures(name)?;
                let spans = (0..caps.len())
                    .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                    .collect();
                Some(MatchSpans(spans))
            }
            MatchKind::Contains => {
                let at = find(name, &self.literal)?;
                Some(MatchSpans(vec![Some((at, at + self.literal.len()))]))
            }
            MatchKind::StartsWith => name
                .starts_with(&self.literal)
                .then(|| MatchSpans(vec![Some((0, self.literal.len()))])),
            MatchKind::EndsWith => name.ends_with(&self.literal).then(|| {
                let start = name.len() - self.literal.len();
                MatchSpans(vec![Some((start, name.len()))])
            }),
            MatchKind::Equals => {
                (name == &self.literal[..]).then(|| MatchSpans::whole(name.len()))
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// One rule in the route table.
pub struct Route {
    pub matcher: Matcher,
    /// `route using` template: alternate hash key for `*_ch` clusters.
    pub masquerade: Option<String>,
    pub dests: Vec<Arc<Cluster>>,
    pub stop: bool,
}

/// Expands `replacement` against the capture `spans` of `line`'s name
/// range and returns the rewritten line plus its new first-space
/// offset.
///
/// Backslash introduces a capture reference (`\0` is the whole match,
/// multi-digit accepted), `\_`/`\^` lowercase/uppercase the references
/// that follow them, `\.` additionally folds dots in referenced text to
/// underscores, and any other escaped character is that literal.
#[must_use]
pub fn rewrite_metric(
    line: &[u8],
    firstspace: usize,
    replacement: &str,
    spans: &MatchSpans,
) -> Option<(Vec<u8>, usize)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Case {
        Retain,
        Lower,
        Upper,
        RetainDot,
        LowerDot,
        UpperDot,
    }

    let whole = spans.0.first().copied().flatten()?;
    // spans may be stale if an earlier destination rewrote the line
    if whole.0 > whole.1 || whole.1 > firstspace || firstspace > line.len() {
        return None;
    }
    let mut out: Vec<u8> = Vec::with_capacity(line.len() + replacement.len());
    out.extend_from_slice(&line[..whole.0]);

    let mut escape = 0u8; // 1 = after backslash, 2 = collecting digits
    let mut rcase = Case::Retain;
    let mut reference: Option<usize> = None;

    let push_reference = |out: &mut Vec<u8>, reference: Option<usize>, rcase: Case| {
        let Some(reference) = reference else { return };
        if reference >= spans.0.len() {
            return;
        }
        let Some((start, end)) = spans.0[reference] else {
            return;
        };
        if start > end || end > line.len() {
            return;
        }
        for &b in &line[start..end] {
            let b = match rcase {
                Case::Retain => b,
                Case::Lower => b.to_ascii_lowercase(),
                Case::Upper => b.to_ascii_uppercase(),
                Case::RetainDot => {
                    if b == b'.' {
                        b'_'
                    } else {
                        b
                    }
                }
                Case::LowerDot => {
                    if b == b'.' {
                        b'_'
                    } else {
                        b.to_ascii_lowercase()
                    }
                }
                Case::UpperDot => {
                    if b == b'.' {
                        b'_'
                    } else {
                        b.to_ascii_uppercase()
                    }
                }
            };
            out.push(b);
        }
    };

    // a trailing NUL sentinel flushes a pending reference, as in the
    // classic two-pointer formulation
    for &c in replacement.as_bytes().iter().chain(std::iter::once(&0u8)) {
        if c == b'\\' && escape == 0 {
            escape = 1;
            rcase = Case::Retain;
            continue;
        }
        if escape == 1 && rcase == Case::Retain && c == b'_' {
            rcase = Case::Lower;
        } else if escape == 1 && rcase == Case::Retain && c == b'^' {
            rcase = Case::Upper;
        } else if escape == 1 && c == b'.' {
            rcase = match rcase {
                Case::Lower => Case::LowerDot,
                Case::Upper => Case::UpperDot,
                _ => Case::RetainDot,
            };
        } else if escape > 0 && c.is_ascii_digit() {
            escape = 2;
            reference = Some(reference.unwrap_or(0) * 10 + usize::from(c - b'0'));
        } else {
            if escape > 0 {
                push_reference(&mut out, reference, rcase);
                reference = None;
            }
            if c != b'\\' {
                escape = 0;
                rcase = Case::Retain;
                if c != 0 {
                    out.push(c);
                }
            }
        }
    }

    out.extend_from_slice(&line[whole.1..firstspace]);
    let new_firstspace = out.len();
    out.extend_from_slice(&line[firstspace..]);
    Some((out, new_firstspace))
}

/// Scans `pattern` for the trailing `[A-Za-z_]` block the optimiser
/// groups on, skipping over balanced parentheses. Returns `None` when
/// the pattern has no usable block or the block is shorter than three
/// characters.
#[must_use]
pub fn trailing_block(pattern: &str) -> Option<Vec<u8>> {
    let bytes = pattern.as_bytes();
    let is_block_char = |c: u8| c == b'_' || c.is_ascii_alphabetic();

    let mut i = bytes.len();
    let mut depth = 0i32;
    // strip characters that cannot belong to a block
    while i > 0 && (depth > 0 || !is_block_char(bytes[i - 1])) {
        let c = bytes[i - 1];
        if c == b')' || c == b'(' {
            // count preceding backslashes to see whether it is escaped
            let mut esc = false;
            let mut j = i - 1;
            while j > 0 && bytes[j - 1] == b'\\' {
                esc = !esc;
                j -= 1;
            }
            if !esc {
                depth += if c == b')' { 1 } else { -1 };
            }
            i = j;
            continue;
        }
        i -= 1;
    }
    if i == 0 {
        return None;
    }

    let end = i;
    let mut start = i;
    while start > 0 && is_block_char(bytes[start - 1]) {
        start -= 1;
    }
    let block = &bytes[start..end];
    if block.len() < 3 {
        return None;
    }
    Some(block.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans_for(pattern: &str, name: &[u8]) -> MatchSpans {
        Matcher::from_pattern(pattern).unwrap().matches(name).unwrap()
    }

    #[test]
    fn plain_pattern_becomes_contains() {
        let m = Matcher::from_pattern("cpu").unwrap();
        assert_eq!(m.kind(), MatchKind::Contains);
        assert!(m.matches(b"sys.cpu.total").is_some());
        assert!(m.matches(b"sys.mem.total").is_none());
    }

    #[test]
    fn anchors_collapse_to_cheap_matchers() {
        assert_eq!(
            Matcher::from_pattern("^sys").unwrap().kind(),
            MatchKind::StartsWith
        );
        assert_eq!(
            Matcher::from_pattern("total$").unwrap().kind(),
            MatchKind::EndsWith
        );
        assert_eq!(
            Matcher::from_pattern("^sys_total$").unwrap().kind(),
            MatchKind::Equals
        );
    }

    #[test]
    fn escaped_dot_stays_literal() {
        let m = Matcher::from_pattern("sys\\.cpu").unwrap();
        assert_eq!(m.kind(), MatchKind::Contains);
        assert!(m.matches(b"host.sys.cpu.idle").is_some());
        assert!(m.matches(b"host.sysXcpu.idle").is_none());
    }

    #[test]
    fn metacharacters_force_regex() {
        for pat in ["^sys\\..*", "a|b", "foo[0-9]", "x?y"] {
            assert_eq!(
                Matcher::from_pattern(pat).unwrap().kind(),
                MatchKind::Regex,
                "{pat}"
            );
        }
    }

    #[test]
    fn regex_captures_are_exposed() {
        let m = Matcher::from_pattern("^prod\\.([^.]+)\\.(.*)$").unwrap();
        let spans = m.matches(b"prod.web.cpu.idle").unwrap();
        assert_eq!(spans.0.len(), 3);
        assert_eq!(spans.0[1], Some((5, 8)));
    }

    #[test]
    fn rewrite_with_backreferences() {
        let line = b"prod.web.cpu 0.5 100\n";
        let spans = spans_for("^prod\\.([^.]+)\\.(.*)$", &line[..12]);
        let (out, fs) = rewrite_metric(line, 12, "apps.\\1.\\2", &spans).unwrap();
        assert_eq!(&out[..fs], b"apps.web.cpu");
        assert_eq!(&out[fs..], b" 0.5 100\n");
    }

    #[test]
    fn rewrite_identity_template_is_byte_identical() {
        let line = b"some.metric.name 1 2\n";
        let spans = spans_for("^some\\..*$", &line[..16]);
        let (out, fs) = rewrite_metric(line, 16, "\\0", &spans).unwrap();
        assert_eq!(out.as_slice(), line.as_ref());
        assert_eq!(fs, 16);
    }

    #[test]
    fn rewrite_whole_match_reference() {
        let line = b"sys.cpu 1 100\n";
        let spans = spans_for("^sys\\..*", &line[..7]);
        let (out, fs) = rewrite_metric(line, 7, "sums.\\0", &spans).unwrap();
        assert_eq!(&out[..fs], b"sums.sys.cpu");
    }

    #[test]
    fn rewrite_case_modifiers() {
        let line = b"MixedCase.Name 1 2\n";
        let spans = spans_for("^([^.]+)\\.([^.]+)$", &line[..14]);
        let (out, fs) = rewrite_metric(line, 14, "\\_\\1.\\^\\2", &spans).unwrap();
        assert_eq!(&out[..fs], b"mixedcase.NAME");
    }

    #[test]
    fn rewrite_dot_folding() {
        let line = b"a.b.c 1 2\n";
        let spans = spans_for("^(.*)$", &line[..5]);
        let (out, fs) = rewrite_metric(line, 5, "flat.\\.\\1", &spans).unwrap();
        assert_eq!(&out[..fs], b"flat.a_b_c");
    }

    #[test]
    fn rewrite_adjacent_references() {
        let line = b"ab 1 2\n";
        let spans = spans_for("^(a)(b)$", &line[..2]);
        let (out, fs) = rewrite_metric(line, 2, "\\2\\1", &spans).unwrap();
        assert_eq!(&out[..fs], b"ba");
    }

    #[test]
    fn rewrite_unknown_escape_is_literal() {
        let line = b"m 1 2\n";
        let spans = spans_for("^(m)$", &line[..1]);
        let (out, fs) = rewrite_metric(line, 1, "\\x\\1", &spans).unwrap();
        assert_eq!(&out[..fs], b"xm");
    }

    #[test]
    fn contains_match_keeps_surroundings_on_rewrite() {
        // a non-anchored match rewrites only the matched range
        let line = b"aa.cpu.bb 1 2\n";
        let m = Matcher::from_pattern("cpu").unwrap();
        let spans = m.matches(&line[..9]).unwrap();
        let (out, fs) = rewrite_metric(line, 9, "proc", &spans).unwrap();
        assert_eq!(&out[..fs], b"aa.proc.bb");
    }

    #[test]
    fn trailing_block_extraction() {
        assert_eq!(trailing_block("^sys\\..*\\.cpu$"), Some(b"cpu".to_vec()));
        assert_eq!(trailing_block("^.*servers$"), Some(b"servers".to_vec()));
        // block shorter than three characters is not selective enough
        assert_eq!(trailing_block("^.*\\.io$"), None);
        // parenthesised tails are skipped over
        assert_eq!(
            trailing_block("^collectd\\.([a-z]+)$"),
            Some(b"collectd".to_vec())
        );
        assert_eq!(trailing_block("^([0-9]+)$"), None);
    }
}
