//! End-to-end pool scenarios over scripted transport and codec fakes.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use manifold_core::{ConnectionId, KafkaErrorCode, Limits, NodeId, Offset, PartitionId};
use manifold_fetch::{
    AttachSpec, ConnectionKind, ConnectionState, KafkaRequest, TIMESTAMP_EARLIEST,
    TIMESTAMP_LATEST,
};

use crate::harness::{
    fetch_error_response, fetch_response, keyed_record, list_offsets_response, progress_fn,
    record, Delivered, ProgressLog, RecordingSink, SinkLog, TestPool,
};

fn p0() -> PartitionId {
    PartitionId::new(0)
}

fn spec_at(topic: &str, offset: u64) -> AttachSpec {
    AttachSpec {
        topic: topic.to_string(),
        fetch_offsets: [(p0(), Offset::new(offset))].into_iter().collect(),
        ..AttachSpec::default()
    }
}

fn sink_log() -> Rc<RefCell<SinkLog>> {
    Rc::new(RefCell::new(SinkLog::default()))
}

fn progress_log() -> ProgressLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Two consumers of the same partition at different offsets: the live
/// connection serves the front, a historical connection backfills the
/// laggard, and the checkpoints merge once it catches up.
#[test]
fn test_fetch_pool_shared_partition_collapses_checkpoints() {
    let mut t = TestPool::new();
    let (log_a, prog_a) = (sink_log(), progress_log());
    let (log_b, prog_b) = (sink_log(), progress_log());

    t.pool
        .attach(
            spec_at("events", 100),
            Box::new(RecordingSink::new(Rc::clone(&log_a))),
            progress_fn(&prog_a),
            0,
        )
        .unwrap();
    t.complete_topic("events", &[NodeId::new(1)], false);
    t.pool
        .attach(
            spec_at("events", 150),
            Box::new(RecordingSink::new(Rc::clone(&log_b))),
            progress_fn(&prog_b),
            0,
        )
        .unwrap();

    let live = ConnectionId::new(1);
    let historical = ConnectionId::new(2);
    t.ready(live, 0);
    match t.last_request() {
        Some(KafkaRequest::Fetch(fetch)) => {
            assert_eq!(fetch.requested_offset("events", p0()), Some(Offset::new(150)));
        }
        other => panic!("expected live fetch, got {other:?}"),
    }
    t.ready(historical, 0);
    match t.last_request() {
        Some(KafkaRequest::Fetch(fetch)) => {
            assert_eq!(fetch.requested_offset("events", p0()), Some(Offset::new(100)));
        }
        other => panic!("expected historical fetch, got {other:?}"),
    }

    // The live batch only advances the consumer it covers.
    t.respond(
        live,
        fetch_response("events", p0(), 0, (150..152).map(|o| record(o, b"live")).collect()),
        0,
    );
    assert_eq!(log_a.borrow().received.len(), 0);
    assert_eq!(log_b.borrow().received.len(), 2);
    assert_eq!(
        *prog_b.borrow(),
        vec![(p0(), Offset::new(150), Offset::new(152))]
    );
    assert!(prog_a.borrow().is_empty());

    // The backfill carries the laggard to the merge point.
    t.respond(
        historical,
        fetch_response("events", p0(), 0, (100..152).map(|o| record(o, b"hist")).collect()),
        0,
    );
    assert_eq!(log_a.borrow().received.len(), 52);
    assert_eq!(log_b.borrow().received.len(), 2);
    assert_eq!(
        *prog_a.borrow(),
        vec![(p0(), Offset::new(100), Offset::new(152))]
    );

    let topic = t.pool.topic("events").unwrap();
    assert_eq!(topic.cursors.refs_at(p0(), Offset::new(152)), Some(2));
    assert!(!topic.cursors.needs_historical(p0()));
}

#[test]
fn test_fetch_pool_one_connection_per_broker_role() {
    let mut t = TestPool::new();
    let spec = AttachSpec {
        topic: "events".to_string(),
        fetch_offsets: (0..3).map(|p| (PartitionId::new(p), Offset::new(0))).collect(),
        ..AttachSpec::default()
    };
    t.pool
        .attach(spec, Box::new(RecordingSink::new(sink_log())), progress_fn(&progress_log()), 0)
        .unwrap();
    t.complete_topic(
        "events",
        &[NodeId::new(1), NodeId::new(1), NodeId::new(2)],
        false,
    );

    // Two leaders, every consumer at one offset: one live connection per
    // leader, no historical ones, one metadata connection.
    let count = |kind: ConnectionKind| t.pool.connections().filter(|c| c.kind == kind).count();
    assert_eq!(count(ConnectionKind::Live), 2);
    assert_eq!(count(ConnectionKind::Historical), 0);
    assert_eq!(count(ConnectionKind::Metadata), 1);
}

/// A fetch behind the log's retained range resolves the earliest offset
/// and clamps forward without reporting progress for the lost records.
#[test]
fn test_fetch_pool_out_of_range_clamps_silently() {
    let mut t = TestPool::new();
    let (log, prog) = (sink_log(), progress_log());
    t.pool
        .attach(
            spec_at("events", 50),
            Box::new(RecordingSink::new(Rc::clone(&log))),
            progress_fn(&prog),
            0,
        )
        .unwrap();
    t.complete_topic("events", &[NodeId::new(1)], false);

    let live = ConnectionId::new(1);
    t.ready(live, 0);
    t.respond(
        live,
        fetch_error_response("events", p0(), KafkaErrorCode::OffsetOutOfRange),
        0,
    );
    match t.last_request() {
        Some(KafkaRequest::ListOffsets(req)) => {
            assert_eq!(req.topics[0].partitions[0].timestamp, TIMESTAMP_EARLIEST);
        }
        other => panic!("expected earliest-offset query, got {other:?}"),
    }

    t.respond(live, list_offsets_response("events", p0(), TIMESTAMP_EARLIEST, 80), 0);

    assert!(prog.borrow().is_empty(), "clamp must not report progress");
    assert!(log.borrow().received.is_empty());
    let topic = t.pool.topic("events").unwrap();
    assert_eq!(topic.cursors.refs_at(p0(), Offset::new(80)), Some(1));
    match t.last_request() {
        Some(KafkaRequest::Fetch(fetch)) => {
            assert_eq!(fetch.requested_offset("events", p0()), Some(Offset::new(80)));
        }
        other => panic!("expected clamped fetch, got {other:?}"),
    }
}

/// An out-of-range fetch whose earliest offset never rises above the
/// bounced request means the log shrank underneath the consumer: the
/// topic was recreated, so consumers re-attach instead of retrying the
/// same fetch forever.
#[test]
fn test_fetch_pool_out_of_range_below_earliest_forces_reattach() {
    let mut t = TestPool::new();
    let (log, prog) = (sink_log(), progress_log());
    t.pool
        .attach(
            spec_at("events", 50),
            Box::new(RecordingSink::new(Rc::clone(&log))),
            progress_fn(&prog),
            0,
        )
        .unwrap();
    t.complete_topic("events", &[NodeId::new(1)], false);

    let live = ConnectionId::new(1);
    t.ready(live, 0);
    t.respond(
        live,
        fetch_error_response("events", p0(), KafkaErrorCode::OffsetOutOfRange),
        0,
    );
    match t.last_request() {
        Some(KafkaRequest::ListOffsets(req)) => {
            assert_eq!(req.topics[0].partitions[0].timestamp, TIMESTAMP_EARLIEST);
        }
        other => panic!("expected earliest-offset query, got {other:?}"),
    }

    // The recreated log starts over at zero, below the bounced fetch.
    t.respond(live, list_offsets_response("events", p0(), TIMESTAMP_EARLIEST, 0), 0);

    assert_eq!(log.borrow().detached, vec![true]);
    assert!(prog.borrow().is_empty());
    assert!(t.pool.topic("events").is_none());
    assert!(t.pool.catalog().get("events").is_none());
    assert_eq!(t.pool.attach_count(), 0);
    assert!(
        !matches!(t.last_request(), Some(KafkaRequest::Fetch(_))),
        "no fetch may be re-issued for the dropped topic"
    );
}

#[test]
fn test_fetch_pool_detach_stops_delivery() {
    let mut t = TestPool::new();
    let log = sink_log();
    let attach = t
        .pool
        .attach(
            spec_at("events", 0),
            Box::new(RecordingSink::new(Rc::clone(&log))),
            progress_fn(&progress_log()),
            0,
        )
        .unwrap();
    t.complete_topic("events", &[NodeId::new(1)], false);
    let live = ConnectionId::new(1);
    t.ready(live, 0);

    // Detach while the fetch is in flight; its response must be dropped.
    t.pool.detach(attach, 0).unwrap();
    assert!(t.pool.topic("events").is_none());
    assert!(t.pool.catalog().get("events").is_none());

    t.respond(
        live,
        fetch_response("events", p0(), 0, (0..3).map(|o| record(o, b"late")).collect()),
        0,
    );
    assert!(log.borrow().received.is_empty());
    assert_eq!(t.pool.attach_count(), 0);
    assert!(log.borrow().detached.is_empty());
}

/// A checkpoint past the broker's latest offset means the topic was
/// deleted and recreated; every consumer is told to re-attach at zero.
#[test]
fn test_fetch_pool_topic_recreation_forces_reattach() {
    let mut t = TestPool::new();
    let log_a = sink_log();
    let log_b = sink_log();
    t.pool
        .attach(
            spec_at("events", 100),
            Box::new(RecordingSink::new(Rc::clone(&log_a))),
            progress_fn(&progress_log()),
            0,
        )
        .unwrap();
    t.pool
        .attach(
            AttachSpec {
                topic: "events".to_string(),
                ..AttachSpec::default()
            },
            Box::new(RecordingSink::new(Rc::clone(&log_b))),
            progress_fn(&progress_log()),
            0,
        )
        .unwrap();
    t.complete_topic("events", &[NodeId::new(1)], false);

    let live = ConnectionId::new(1);
    t.ready(live, 0);
    match t.last_request() {
        Some(KafkaRequest::ListOffsets(req)) => {
            assert_eq!(req.topics[0].partitions[0].timestamp, TIMESTAMP_LATEST);
        }
        other => panic!("expected latest-offset query, got {other:?}"),
    }

    // Latest offset 10 sits behind the concrete checkpoint at 100.
    t.respond(live, list_offsets_response("events", p0(), TIMESTAMP_LATEST, 10), 0);

    assert_eq!(log_a.borrow().detached, vec![true]);
    assert_eq!(log_b.borrow().detached, vec![true]);
    assert!(t.pool.topic("events").is_none());
    assert!(t.pool.catalog().get("events").is_none());
    assert_eq!(t.pool.attach_count(), 0);
}

#[test]
fn test_fetch_pool_broker_failure_invalidates_and_retries() {
    let mut t = TestPool::new();
    t.pool
        .attach(
            spec_at("events", 100),
            Box::new(RecordingSink::new(sink_log())),
            progress_fn(&progress_log()),
            0,
        )
        .unwrap();
    t.complete_topic("events", &[NodeId::new(1)], false);
    let live = ConnectionId::new(1);
    t.ready(live, 0);

    t.pool.on_disconnected(live, 0);
    assert!(t.transport.borrow().aborted.contains(&live));
    // Leadership is stale; the metadata connection re-resolves it.
    match t.last_request() {
        Some(KafkaRequest::Metadata(req)) => assert_eq!(req.topics, vec!["events".to_string()]),
        other => panic!("expected metadata refresh, got {other:?}"),
    }
    t.respond(
        ConnectionId::new(0),
        crate::harness::metadata_response_with_brokers(
            "events",
            vec![manifold_metadata::BrokerMetadata::new(NodeId::new(1), "broker-1", 9092)],
            &[NodeId::new(1)],
        ),
        0,
    );

    // The fetch slot waits out its backoff before reconnecting.
    let connects_before = t
        .transport
        .borrow()
        .connects
        .iter()
        .filter(|&&id| id == live)
        .count();
    assert_eq!(connects_before, 1);
    t.pool.on_tick(25_000);
    let connects_after = t
        .transport
        .borrow()
        .connects
        .iter()
        .filter(|&&id| id == live)
        .count();
    assert_eq!(connects_after, 2);
    assert_eq!(t.pool.connection(live).unwrap().state, ConnectionState::Connecting);
}

/// A proactive route fetches at full partition budget with no consumer
/// windows to honor, so records land in the cache ahead of any attach.
#[test]
fn test_fetch_pool_proactive_route_fetches_without_consumers() {
    let mut t = TestPool::new();
    t.pool.add_route("events", 0);
    t.complete_topic("events", &[NodeId::new(1)], false);
    assert_eq!(t.pool.attach_count(), 0);

    let live = ConnectionId::new(1);
    t.ready(live, 0);
    match t.last_request() {
        Some(KafkaRequest::ListOffsets(req)) => {
            assert_eq!(req.topics[0].partitions[0].timestamp, TIMESTAMP_LATEST);
        }
        other => panic!("expected latest-offset query, got {other:?}"),
    }
    t.respond(live, list_offsets_response("events", p0(), TIMESTAMP_LATEST, 42), 0);

    match t.last_request() {
        Some(KafkaRequest::Fetch(fetch)) => {
            assert_eq!(fetch.requested_offset("events", p0()), Some(Offset::new(42)));
            assert_eq!(
                fetch.topics[0].partitions[0].partition_max_bytes,
                Limits::for_testing().fetch_partition_max_bytes
            );
        }
        other => panic!("expected proactive fetch, got {other:?}"),
    }

    t.respond(
        live,
        fetch_response("events", p0(), 0, (42..44).map(|o| record(o, b"x")).collect()),
        0,
    );
    let topic = t.pool.topic("events").unwrap();
    assert_eq!(topic.bootstrap_positions.get(&p0()), Some(&Offset::new(44)));
    assert_eq!(topic.cursors.refs_at(p0(), Offset::new(44)), Some(1));
}

/// Compacted-topic attaches replay the retained cache locally, then join
/// the shared fetch stream at its live edge.
#[test]
fn test_fetch_pool_compacted_attach_replays_cache() {
    let (mut t, cache) = TestPool::with_shared_cache();
    t.pool.add_route("logs", 0);
    t.complete_topic("logs", &[NodeId::new(1)], true);

    let live = ConnectionId::new(1);
    t.ready(live, 0);
    t.respond(
        live,
        fetch_response(
            "logs",
            p0(),
            0,
            vec![keyed_record(0, b"k1", b"a"), keyed_record(1, b"k2", b"b")],
        ),
        0,
    );
    assert_eq!(cache.0.borrow().entries.len(), 2);

    // An unfiltered attach replays both retained records and lands at
    // the cache's live edge.
    let log_c = sink_log();
    t.pool
        .attach(
            spec_at("logs", 0),
            Box::new(RecordingSink::new(Rc::clone(&log_c))),
            progress_fn(&progress_log()),
            0,
        )
        .unwrap();
    assert_eq!(
        log_c.borrow().received,
        vec![
            Delivered {
                partition: p0(),
                offset: Offset::new(0),
                value: Some(b"a".to_vec()),
            },
            Delivered {
                partition: p0(),
                offset: Offset::new(1),
                value: Some(b"b".to_vec()),
            },
        ]
    );

    // A keyed attach replays only its key's latest record.
    let log_d = sink_log();
    t.pool
        .attach(
            AttachSpec {
                key: Some(Bytes::from_static(b"k2")),
                ..spec_at("logs", 0)
            },
            Box::new(RecordingSink::new(Rc::clone(&log_d))),
            progress_fn(&progress_log()),
            0,
        )
        .unwrap();
    assert_eq!(log_d.borrow().received.len(), 1);
    assert_eq!(log_d.borrow().received[0].offset, Offset::new(1));

    let topic = t.pool.topic("logs").unwrap();
    assert_eq!(topic.cursors.refs_at(p0(), Offset::new(2)), Some(3));

    // A rewrite of k1 compacts the stale entry away and reaches only the
    // consumers whose filters match.
    t.respond(
        live,
        fetch_response("logs", p0(), 0, vec![keyed_record(2, b"k1", b"a2")]),
        0,
    );
    assert_eq!(cache.0.borrow().entries.len(), 2);
    assert!(cache.0.borrow().entries.contains_key(&(p0(), Offset::new(2))));
    assert!(!cache.0.borrow().entries.contains_key(&(p0(), Offset::new(0))));
    assert_eq!(log_c.borrow().received.len(), 3);
    assert_eq!(log_d.borrow().received.len(), 1);
    let topic = t.pool.topic("logs").unwrap();
    assert_eq!(topic.cursors.refs_at(p0(), Offset::new(3)), Some(3));
}
