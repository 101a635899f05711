//! Aggregation end to end: metrics absorbed into buckets, expiry
//! emission through the stub route, and delivery to the configured
//! cluster.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use graphite_relay::config::parser::parse_string;
use graphite_relay::router::{Router, RouterOptions};
use tokio::sync::mpsc;

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn route_and_enqueue(router: &Router, input: &str) -> bool {
    let mut line = input.as_bytes().to_vec();
    let mut firstspace = input.find(' ').unwrap();
    let mut dests = Vec::new();
    let blackholed = router.route(&mut line, &mut firstspace, "127.0.0.1", &mut dests);
    for (sender, payload) in dests {
        sender.send(payload, true).unwrap();
    }
    blackholed
}

#[tokio::test]
async fn sums_are_emitted_per_metric_and_reach_the_cluster() {
    let router = Router::build(
        parse_string(
            "cluster fwd forward 10.9.9.9:2003;\n\
             aggregate ^sys\\..* every 1 seconds expire after 3 seconds \
             timestamp at end of bucket \
             compute sum write to sums.\\0 \
             send to fwd stop;\n",
        )
        .unwrap(),
        &RouterOptions::default(),
    )
    .unwrap();

    // three samples, two distinct metrics, all in a completed window
    let t = epoch_now() - 2;
    assert!(!route_and_enqueue(&router, &format!("sys.a 1 {t}\n")));
    assert!(!route_and_enqueue(&router, &format!("sys.a 2 {t}\n")));
    assert!(!route_and_enqueue(&router, &format!("sys.b 4 {t}\n")));

    let aggregator = Arc::clone(&router.aggregators[0]);
    assert_eq!(aggregator.metrics_received(), 3);
    assert_eq!(aggregator.metrics_dropped(), 0);

    // shutdown expiry drains every completed bucket
    let (tx, mut rx) = mpsc::channel(64);
    let expiry = tokio::spawn(Arc::clone(&aggregator).run(tx));
    aggregator.stop();
    expiry.await.unwrap();

    // emissions re-enter routing; the stub route must strip its prefix
    // and deliver to the forward cluster only
    let mut emitted = Vec::new();
    while let Ok(line) = rx.try_recv() {
        emitted.push(line);
    }
    assert_eq!(emitted.len(), 2);
    for line in emitted {
        let text = String::from_utf8_lossy(&line).into_owned();
        assert!(!route_and_enqueue(&router, &text));
    }

    let downstream = &router.servers[0];
    let mut got: Vec<String> = Vec::new();
    while let Some(line) = downstream.queue().dequeue() {
        got.push(String::from_utf8_lossy(&line).into_owned());
    }
    got.sort();
    assert_eq!(got.len(), 2);
    assert!(got[0].starts_with("sums.sys.a 3 "), "{}", got[0]);
    assert!(got[1].starts_with("sums.sys.b 4 "), "{}", got[1]);
}

#[tokio::test]
async fn empty_buckets_emit_nothing() {
    let router = Router::build(
        parse_string(
            "cluster fwd forward 10.9.9.9:2003;\n\
             aggregate ^idle\\..* every 1 seconds expire after 3 seconds \
             compute count write to counts.\\0 send to fwd stop;\n",
        )
        .unwrap(),
        &RouterOptions::default(),
    )
    .unwrap();

    // create the invocation, then only expire: one non-empty bucket
    let t = epoch_now() - 2;
    route_and_enqueue(&router, &format!("idle.x 1 {t}\n"));

    let aggregator = Arc::clone(&router.aggregators[0]);
    let (tx, mut rx) = mpsc::channel(64);
    let expiry = tokio::spawn(Arc::clone(&aggregator).run(tx));
    aggregator.stop();
    expiry.await.unwrap();

    let mut emitted = 0;
    while rx.try_recv().is_ok() {
        emitted += 1;
    }
    assert_eq!(emitted, 1);
}

#[tokio::test]
async fn ancient_and_future_epochs_are_dropped() {
    let router = Router::build(
        parse_string(
            "cluster fwd forward 10.9.9.9:2003;\n\
             aggregate ^sys\\..* every 10 seconds expire after 60 seconds \
             compute sum write to sums.\\0 send to fwd stop;\n",
        )
        .unwrap(),
        &RouterOptions::default(),
    )
    .unwrap();

    let aggregator = &router.aggregators[0];
    let now = epoch_now();
    route_and_enqueue(&router, &format!("sys.a 1 {now}\n"));
    assert_eq!(aggregator.metrics_dropped(), 0);
    route_and_enqueue(&router, &format!("sys.a 1 {}\n", now - 3600));
    assert_eq!(aggregator.metrics_dropped(), 1);
    route_and_enqueue(&router, &format!("sys.a 1 {}\n", now + 3600));
    assert_eq!(aggregator.metrics_dropped(), 2);
    assert_eq!(aggregator.metrics_received(), 3);
}
