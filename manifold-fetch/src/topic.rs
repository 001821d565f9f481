//! Per-topic fetch state: cursors, dispatch tree, and cache.

use std::collections::{HashMap, HashSet};

use manifold_core::{AttachId, Offset, PartitionId};
use manifold_cursor::PartitionCursorSet;
use manifold_dispatch::{DispatchTree, SinkRegistry};

use crate::cache::TopicCache;

/// Everything the pool tracks for one fetched topic.
pub struct FetchTopic {
    /// Topic name.
    pub name: String,
    /// Ref-counted fetch positions across all consumers.
    pub cursors: PartitionCursorSet,
    /// Key/header routing to attached sinks.
    pub tree: DispatchTree,
    /// Retained record history.
    pub cache: Box<dyn TopicCache>,
    /// True when the topic's `cleanup.policy` contains `compact`.
    pub compacted: bool,
    /// True when a route keeps this topic fetching without consumers.
    pub proactive: bool,
    /// True once the proactive bootstrap attach has been placed.
    pub bootstrapped: bool,
    /// Where the proactive bootstrap reference currently sits, per
    /// partition. These cursors have no sink; the pool advances them at
    /// batch boundaries so a consumerless topic keeps fetching forward.
    pub bootstrap_positions: HashMap<PartitionId, Offset>,
    /// Consumers currently attached to this topic.
    pub attaches: HashSet<AttachId>,
}

impl FetchTopic {
    /// Creates an empty topic around a cache.
    #[must_use]
    pub fn new(name: impl Into<String>, cache: Box<dyn TopicCache>, compacted: bool) -> Self {
        Self {
            name: name.into(),
            cursors: PartitionCursorSet::new(),
            tree: DispatchTree::new(),
            cache,
            compacted,
            proactive: false,
            bootstrapped: false,
            bootstrap_positions: HashMap::new(),
            attaches: HashSet::new(),
        }
    }

    /// The partition byte budget the attached sinks can absorb.
    ///
    /// A proactive live fetch always uses the full budget: records land
    /// in the cache whether or not any consumer has window. Otherwise
    /// the smallest non-zero sink window bounds the request, and a sink
    /// at zero stalls the partition entirely.
    #[must_use]
    pub fn writable_bytes(&self, registry: &SinkRegistry, live: bool, partition_max: u32) -> u32 {
        if live && self.proactive {
            return partition_max;
        }

        let mut min = u32::MAX;
        let mut seen = false;
        for sink_id in self.tree.sink_ids() {
            let Some(sink) = registry.get(sink_id) else {
                continue;
            };
            let window = sink.window_bytes();
            if window == 0 {
                return 0;
            }
            min = min.min(window);
            seen = true;
        }
        if seen {
            min.min(partition_max)
        } else {
            0
        }
    }

    /// True when nothing keeps this topic alive.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.attaches.is_empty() && !self.proactive
    }
}
