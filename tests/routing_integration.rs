//! Routing scenarios: consistent hashing, failover, rewrites and
//! blackholes exercised through the full route-and-enqueue path.

use std::sync::Arc;

use graphite_relay::config::parser::parse_string;
use graphite_relay::router::{Router, RouterOptions};

fn build(text: &str) -> Router {
    Router::build(parse_string(text).unwrap(), &RouterOptions::default()).unwrap()
}

/// Routes `input` and enqueues the results on the destination queues,
/// as the dispatcher would.
fn route_and_enqueue(router: &Router, input: &str) -> bool {
    let mut line = input.as_bytes().to_vec();
    let mut firstspace = input.find(' ').unwrap();
    let mut dests = Vec::new();
    let blackholed = router.route(&mut line, &mut firstspace, "127.0.0.1", &mut dests);
    for (sender, payload) in dests {
        sender.send(payload, false).unwrap();
    }
    blackholed
}

fn queue_lens(router: &Router) -> Vec<(String, usize)> {
    router
        .servers
        .iter()
        .map(|s| (s.descriptor().to_string(), s.queue_len()))
        .collect()
}

#[test]
fn carbon_ch_replication_enqueues_on_exactly_two_servers() {
    let router = build(
        "cluster x carbon_ch replication 2\n\
         10.0.0.1:2003 10.0.0.2:2003 10.0.0.3:2003;\n\
         match * send to x;\n",
    );
    let blackholed = route_and_enqueue(&router, "foo.bar 1 100\n");
    assert!(!blackholed);

    let lens = queue_lens(&router);
    let total: usize = lens.iter().map(|(_, n)| n).sum();
    let touched = lens.iter().filter(|(_, n)| *n == 1).count();
    let untouched = lens.iter().filter(|(_, n)| *n == 0).count();
    assert_eq!(total, 2);
    assert_eq!(touched, 2);
    assert_eq!(untouched, 1);

    // the same name picks the same two servers again
    route_and_enqueue(&router, "foo.bar 2 200\n");
    let again = queue_lens(&router);
    for ((name, before), (_, after)) in lens.iter().zip(&again) {
        assert_eq!(*after, before * 2, "{name}");
    }
}

#[test]
fn carbon_ch_replica_sets_are_distinct_servers() {
    let router = build(
        "cluster x carbon_ch replication 3\n\
         10.0.0.1:2003 10.0.0.2:2003 10.0.0.3:2003 10.0.0.4:2003;\n\
         match * send to x;\n",
    );
    for name in ["a.b", "c.d.e", "f", "lots.of.path.components.here"] {
        route_and_enqueue(&router, &format!("{name} 1 100\n"));
    }
    // every routed metric put one copy on three distinct queues
    let total: usize = queue_lens(&router).iter().map(|(_, n)| n).sum();
    assert_eq!(total, 12);
}

#[test]
fn rewrite_is_visible_downstream() {
    let router = build(
        "cluster out forward 10.0.0.1:2003;\n\
         rewrite ^prod\\.([^.]+)\\.(.*)$ into apps.\\1.\\2;\n\
         match ^apps\\. send to out;\n",
    );
    route_and_enqueue(&router, "prod.web.cpu 0.5 100\n");
    let server = &router.servers[0];
    assert_eq!(server.queue_len(), 1);
    let line = server.queue().dequeue().unwrap();
    assert_eq!(&*line, b"apps.web.cpu 0.5 100\n");
}

#[test]
fn failover_follows_health_transitions() {
    let router = build(
        "cluster ha failover 10.0.0.1:2003 10.0.0.2:2003;\nmatch * send to ha;\n",
    );
    let primary = Arc::clone(&router.servers[0]);
    let standby = Arc::clone(&router.servers[1]);
    assert_eq!(primary.descriptor().to_string(), "10.0.0.1:2003");

    route_and_enqueue(&router, "m 1 100\n");
    assert_eq!((primary.queue_len(), standby.queue_len()), (1, 0));

    primary.mark_failed();
    route_and_enqueue(&router, "m 2 200\n");
    assert_eq!((primary.queue_len(), standby.queue_len()), (1, 1));

    primary.clear_failure();
    route_and_enqueue(&router, "m 3 300\n");
    assert_eq!((primary.queue_len(), standby.queue_len()), (2, 1));
}

#[test]
fn all_failed_failover_falls_back_to_first() {
    let router = build(
        "cluster ha failover 10.0.0.1:2003 10.0.0.2:2003;\nmatch * send to ha;\n",
    );
    for server in &router.servers {
        server.mark_failed();
    }
    route_and_enqueue(&router, "m 1 100\n");
    assert_eq!(router.servers[0].queue_len(), 1);
}

#[test]
fn any_of_covers_all_servers_and_sticks_per_name() {
    let router = build(
        "cluster lb any_of 10.0.0.1:2003 10.0.0.2:2003 10.0.0.3:2003;\n\
         match * send to lb;\n",
    );
    for i in 0..300 {
        route_and_enqueue(&router, &format!("metric.{i} 1 100\n"));
    }
    // hashing spreads names over every member
    for (name, len) in queue_lens(&router) {
        assert!(len > 0, "{name} got nothing");
    }
    // one failed member still receives its share (no failure skipping)
    let before = queue_lens(&router);
    router.servers[0].mark_failed();
    for i in 0..300 {
        route_and_enqueue(&router, &format!("metric.{i} 1 100\n"));
    }
    let after = queue_lens(&router);
    for ((name, b), (_, a)) in before.iter().zip(&after) {
        assert_eq!(*a, b * 2, "{name}");
    }
}

#[test]
fn jump_hash_single_server_takes_everything() {
    let router = build(
        "cluster j jump_fnv1a_ch replication 1 10.0.0.1:2003;\nmatch * send to j;\n",
    );
    for i in 0..50 {
        route_and_enqueue(&router, &format!("metric.{i} 1 100\n"));
    }
    assert_eq!(router.servers[0].queue_len(), 50);
}

#[test]
fn unrouted_and_blackholed_metrics_are_flagged() {
    let router = build(
        "cluster out forward 10.0.0.1:2003;\n\
         match ^keep\\. send to out stop;\n\
         match ^drop\\. send to blackhole stop;\n",
    );
    assert!(!route_and_enqueue(&router, "keep.me 1 100\n"));
    assert!(route_and_enqueue(&router, "drop.me 1 100\n"));
    assert!(route_and_enqueue(&router, "neither.nor 1 100\n"));
    assert_eq!(router.servers[0].queue_len(), 1);
}
