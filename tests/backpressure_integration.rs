//! Stall/drop accounting under a blocked downstream, mirroring the
//! dispatcher's retry-then-force behaviour without its sleeps.

use graphite_relay::sender::{ConnectionKind, Sender, SenderConfig, ServerDescriptor};

fn blocked_sender(queue_size: usize, batch_size: usize, max_stalls: usize) -> std::sync::Arc<Sender> {
    // never spawned: the queue only fills, like a sender whose socket
    // blocks forever
    Sender::new(
        ServerDescriptor {
            kind: ConnectionKind::Tcp,
            host: "10.0.0.1".to_string(),
            port: 2003,
            instance: None,
        },
        SenderConfig {
            queue_size,
            batch_size,
            max_stalls,
            ..SenderConfig::default()
        },
    )
}

/// Delivers one line the way the dispatcher does: retry on stall until
/// the deadline would pass, then force.
fn deliver(sender: &Sender, line: &[u8], max_stalls: usize) {
    let mut payload: Box<[u8]> = line.into();
    for attempt in 0.. {
        match sender.send(payload, attempt > max_stalls) {
            Ok(()) => return,
            Err(returned) => payload = returned,
        }
    }
}

#[test]
fn thousand_lines_into_hundred_slots_drops_the_difference() {
    let sender = blocked_sender(100, 10, 4);
    for i in 0..1000 {
        deliver(&sender, format!("metric.{i} 1 100\n").as_bytes(), 4);
    }
    assert_eq!(sender.queue_len(), 100);
    assert_eq!(sender.metrics_dropped(), 900);
    // the queue holds the most recent lines; the oldest went overboard
    let newest = sender.queue().dequeue_vector(100);
    assert_eq!(&*newest[0], b"metric.900 1 100\n".as_ref());
    assert_eq!(&*newest[99], b"metric.999 1 100\n".as_ref());
}

#[test]
fn first_overflow_line_stalls_before_dropping() {
    let sender = blocked_sender(100, 10, 4);
    for i in 0..100 {
        sender
            .send(format!("m.{i} 1 1\n").as_bytes().into(), false)
            .unwrap();
    }
    assert_eq!(sender.metrics_stalls(), 0);

    // line 101: four stalls, then the conversion to a drop
    let mut payload: Box<[u8]> = b"m.100 1 1\n".as_ref().into();
    for expected in 1..=4u64 {
        payload = sender.send(payload, false).unwrap_err();
        assert_eq!(sender.metrics_stalls(), expected);
    }
    sender.send(payload, false).unwrap();
    assert_eq!(sender.metrics_dropped(), 1);
    assert_eq!(sender.queue_len(), 100);
}

#[test]
fn queue_length_never_exceeds_capacity() {
    let sender = blocked_sender(64, 8, 2);
    for i in 0..500 {
        deliver(&sender, format!("m.{i} 1 1\n").as_bytes(), 2);
        assert!(sender.queue_len() <= 64);
    }
}
