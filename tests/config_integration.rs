//! Configuration file handling: includes, canonical round-trips, and
//! reload-grade validation errors.

use std::io::Write;

use graphite_relay::config::parser::{parse_file, parse_string};
use graphite_relay::config::RuleDecl;

#[test]
fn canonical_print_round_trips_a_full_config() {
    let text = "\
cluster metrics carbon_ch replication 2\n\
    10.0.0.1:2003=a 10.0.0.2:2003=b 10.0.0.3:2003=c;\n\
cluster spares any_of 10.1.0.1:2003 10.1.0.2:2003;\n\
cluster archive file ip /var/log/metrics.log;\n\
listen type linemode 0.0.0.0:2103 proto tcp /tmp/relay.sock proto unix;\n\
rewrite ^prod\\.([^.]+)\\.(.*)$ into apps.\\1.\\2;\n\
match ^apps\\. validate \"^[0-9.e+-]+ [0-9]+$\" else drop send to metrics stop;\n\
aggregate ^sys\\..* every 10 seconds expire after 60 seconds \
timestamp at middle of bucket \
compute sum write to sums.\\0 \
compute percentile95 write to p95.\\0 \
send to spares stop;\n\
match * send to archive blackhole stop;\n\
statistics submit every 30 seconds reset counters after interval \
prefix with relay.self send to spares stop;\n";

    let parsed = parse_string(text).unwrap();
    let printed = parsed.to_string();
    let reparsed = parse_string(&printed).unwrap();
    assert_eq!(parsed, reparsed);
    // and printing again is stable
    assert_eq!(printed, reparsed.to_string());
}

#[test]
fn include_pulls_in_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut clusters = std::fs::File::create(dir.path().join("clusters_a.conf")).unwrap();
    writeln!(clusters, "cluster a forward 10.0.0.1:2003;").unwrap();
    let mut more = std::fs::File::create(dir.path().join("clusters_b.conf")).unwrap();
    writeln!(more, "cluster b forward 10.0.0.2:2003;").unwrap();
    let mut unrelated = std::fs::File::create(dir.path().join("notes.txt")).unwrap();
    writeln!(unrelated, "this is not a config").unwrap();

    let main = dir.path().join("relay.conf");
    std::fs::write(
        &main,
        "include clusters_*.conf;\nmatch * send to a b;\n",
    )
    .unwrap();

    let config = parse_file(&main).unwrap();
    assert_eq!(config.clusters.len(), 2);
    let RuleDecl::Match(m) = &config.rules[0] else {
        panic!("expected match rule");
    };
    assert_eq!(m.send_to, vec!["a", "b"]);
}

#[test]
fn unknown_cluster_reference_is_rejected() {
    let err = parse_string("match * send to ghost;\n").unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
}

#[test]
fn syntax_error_reports_line_and_column() {
    let err =
        parse_string("cluster ok forward 10.0.0.1:2003;\nmatch * send to;\n").unwrap_err();
    let text = err.to_string();
    assert!(text.contains("line 2"), "{text}");
}
