//! Property tests over cursor bookkeeping, dispatch routing, and
//! reconnect backoff.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use manifold_core::{Headers, Offset, PartitionId};
use manifold_cursor::PartitionCursorSet;
use manifold_dispatch::{DispatchContext, DispatchTree, SinkRegistry};
use manifold_metadata::Backoff;
use proptest::prelude::*;

use crate::harness::{RecordingSink, SinkLog};

fn check_invariants(cursors: &PartitionCursorSet, partitions: u64) {
    for p in 0..partitions {
        let partition = PartitionId::new(p);
        let count = cursors.checkpoints_for(partition).count();
        assert_eq!(
            cursors.needs_historical(partition),
            count >= 2,
            "needs_historical out of sync at partition {p} with {count} checkpoints"
        );
    }
}

proptest! {
    #[test]
    fn prop_cursor_refs_conserved(
        ops in prop::collection::vec((0u64..4, 0u64..32, any::<bool>()), 1..32),
    ) {
        let mut cursors = PartitionCursorSet::new();
        let mut model: Vec<(PartitionId, Offset)> = Vec::new();

        for &(p, offset, live) in &ops {
            let partition = PartitionId::new(p);
            let requested = if live { Offset::LIVE } else { Offset::new(offset) };
            let outcome = cursors.attach(partition, requested, 1);
            model.push((partition, outcome.effective_offset));
            check_invariants(&cursors, 4);
        }

        for p in 0..4 {
            let partition = PartitionId::new(p);
            let held: u32 = cursors
                .checkpoints_for(partition)
                .map(|(_, refs)| refs)
                .sum();
            let expected =
                u32::try_from(model.iter().filter(|(mp, _)| *mp == partition).count()).unwrap();
            prop_assert_eq!(held, expected);
        }

        for (partition, offset) in model {
            cursors.detach(partition, offset, 1).unwrap();
            check_invariants(&cursors, 4);
        }
        prop_assert!(cursors.is_empty());
    }

    #[test]
    fn prop_cursor_advance_collapses_to_target(
        offsets in prop::collection::vec(0u64..100, 1..16),
    ) {
        let partition = PartitionId::new(0);
        let mut cursors = PartitionCursorSet::new();
        for &offset in &offsets {
            cursors.attach(partition, Offset::new(offset), 1);
        }
        let total: u32 = cursors
            .checkpoints_for(partition)
            .map(|(_, refs)| refs)
            .sum();

        let target = Offset::new(200);
        let snapshot: Vec<(Offset, u32)> = cursors.checkpoints_for(partition).collect();
        for (offset, refs) in snapshot {
            cursors.advance(partition, offset, target, refs).unwrap();
        }

        prop_assert_eq!(cursors.refs_at(partition, target), Some(total));
        prop_assert_eq!(cursors.checkpoints_for(partition).count(), 1);
        prop_assert!(!cursors.needs_historical(partition));
    }

    #[test]
    fn prop_backoff_monotone_bounded(min in 1u64..1000, extra in 0u64..10_000) {
        let max = min + extra;
        let backoff = Backoff::new(min, max);

        prop_assert_eq!(backoff.next(0), min.min(max));
        for retries in 0u32..70 {
            let delay = backoff.next(retries);
            prop_assert!(delay <= max);
            prop_assert!(delay >= backoff.next(retries.saturating_sub(1)));
        }
    }

    #[test]
    fn prop_dispatch_key_exact(
        k1 in prop::collection::vec(any::<u8>(), 1..8),
        k2 in prop::collection::vec(any::<u8>(), 1..8),
    ) {
        prop_assume!(k1 != k2);

        let mut registry = SinkRegistry::new();
        let mut tree = DispatchTree::new();
        let log_a = Rc::new(RefCell::new(SinkLog::default()));
        let log_b = Rc::new(RefCell::new(SinkLog::default()));
        let log_all = Rc::new(RefCell::new(SinkLog::default()));

        let a = registry.register(Box::new(RecordingSink::new(Rc::clone(&log_a))));
        let b = registry.register(Box::new(RecordingSink::new(Rc::clone(&log_b))));
        let all = registry.register(Box::new(RecordingSink::new(Rc::clone(&log_all))));
        tree.add(Some(&Bytes::from(k1.clone())), &[], a);
        tree.add(Some(&Bytes::from(k2)), &[], b);
        tree.add(None, &[], all);

        let headers = Headers::new();
        let ctx = DispatchContext {
            partition: PartitionId::new(0),
            request_offset: Offset::new(0),
            message_offset: Offset::new(0),
            timestamp: 0,
            trace_id: 0,
            key: Some(&k1),
            headers: &headers,
            value: Some(b"payload"),
        };
        let flags = tree.dispatch(&mut registry, &ctx);

        prop_assert!(flags.matched());
        prop_assert!(flags.delivered());
        prop_assert_eq!(log_a.borrow().received.len(), 1);
        prop_assert_eq!(log_b.borrow().received.len(), 0);
        prop_assert_eq!(log_all.borrow().received.len(), 1);
    }

    #[test]
    fn prop_dispatch_header_order_irrelevant(
        picks in prop::collection::vec((0usize..4, 0u8..3), 0..4),
    ) {
        // Distinct names only; a duplicated requirement is a different
        // filter, not a reordering.
        let mut filters: Vec<(Bytes, Bytes)> = Vec::new();
        for (name_index, value) in picks {
            let name = Bytes::from(format!("h{name_index}"));
            if filters.iter().any(|(n, _)| *n == name) {
                continue;
            }
            filters.push((name, Bytes::copy_from_slice(&[value])));
        }

        let mut registry = SinkRegistry::new();
        let mut tree = DispatchTree::new();
        let log_fwd = Rc::new(RefCell::new(SinkLog::default()));
        let log_rev = Rc::new(RefCell::new(SinkLog::default()));

        let fwd = registry.register(Box::new(RecordingSink::new(Rc::clone(&log_fwd))));
        let rev = registry.register(Box::new(RecordingSink::new(Rc::clone(&log_rev))));
        let mut reversed = filters.clone();
        reversed.reverse();
        tree.add(None, &filters, fwd);
        tree.add(None, &reversed, rev);

        let headers: Headers = reversed.iter().cloned().collect();
        let ctx = DispatchContext {
            partition: PartitionId::new(0),
            request_offset: Offset::new(0),
            message_offset: Offset::new(0),
            timestamp: 0,
            trace_id: 0,
            key: None,
            headers: &headers,
            value: Some(b"payload"),
        };
        tree.dispatch(&mut registry, &ctx);

        prop_assert_eq!(log_fwd.borrow().received.len(), 1);
        prop_assert_eq!(log_rev.borrow().received.len(), 1);
    }
}
