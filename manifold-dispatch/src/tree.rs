//! The key/header dispatch tree.

use std::collections::HashMap;

use bytes::Bytes;
use manifold_core::{Offset, PartitionId, SinkId};
use tracing::debug;

use crate::flags::DispatchFlags;
use crate::sink::{DispatchContext, SinkProgress, SinkRegistry};

/// One leaf registration, reference-counted per (key, header-set) path.
#[derive(Debug)]
struct LeafEntry {
    sink: SinkId,
    refs: u32,
}

/// A header-chain node: leaves that stop here plus children keyed by
/// one (header name, header value) requirement.
#[derive(Debug, Default)]
struct Node {
    leaves: Vec<LeafEntry>,
    children: HashMap<Bytes, HashMap<Bytes, Node>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.leaves.is_empty() && self.children.is_empty()
    }

    fn add(&mut self, path: &[(Bytes, Bytes)], sink: SinkId) {
        if let Some(((name, value), rest)) = path.split_first() {
            self.children
                .entry(name.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .add(rest, sink);
        } else if let Some(leaf) = self.leaves.iter_mut().find(|l| l.sink == sink) {
            leaf.refs += 1;
        } else {
            self.leaves.push(LeafEntry { sink, refs: 1 });
        }
    }

    /// Removes one reference along `path`, pruning emptied nodes on the
    /// way back up. Returns true if the registration was found.
    fn remove(&mut self, path: &[(Bytes, Bytes)], sink: SinkId) -> bool {
        if let Some(((name, value), rest)) = path.split_first() {
            let Some(values) = self.children.get_mut(name) else {
                return false;
            };
            let Some(child) = values.get_mut(value) else {
                return false;
            };
            let found = child.remove(rest, sink);
            if found && child.is_empty() {
                values.remove(value);
                if values.is_empty() {
                    self.children.remove(name);
                }
            }
            found
        } else if let Some(pos) = self.leaves.iter().position(|l| l.sink == sink) {
            self.leaves[pos].refs -= 1;
            if self.leaves[pos].refs == 0 {
                self.leaves.swap_remove(pos);
            }
            true
        } else {
            false
        }
    }

    fn dispatch(&mut self, registry: &mut SinkRegistry, ctx: &DispatchContext<'_>) -> DispatchFlags {
        // A leaf reached means every filter on its path matched.
        let mut flags = DispatchFlags::EMPTY;
        for leaf in &self.leaves {
            // A leaf whose registry entry is already gone must not
            // report a match nobody received.
            if let Some(sink) = registry.get_mut(leaf.sink) {
                flags |= DispatchFlags::MATCHED;
                flags |= sink.dispatch(ctx);
            }
        }
        // One required header per level: descend for every record value
        // that satisfies it. A record value occurring twice dispatches
        // twice, same as the record carries it.
        for (name, values) in &mut self.children {
            for value in ctx.headers.values_of(name) {
                if let Some(child) = values.get_mut(value.as_ref()) {
                    flags |= child.dispatch(registry, ctx);
                }
            }
        }
        flags
    }

    fn for_each_leaf(&self, f: &mut impl FnMut(SinkId)) {
        for leaf in &self.leaves {
            f(leaf.sink);
        }
        for values in self.children.values() {
            for child in values.values() {
                child.for_each_leaf(f);
            }
        }
    }
}

/// Routes decoded records to matching sinks and broadcasts batch-boundary
/// events to every registered sink.
///
/// An unkeyed registration matches every record; a keyed one matches only
/// records whose key is byte-identical. Header requirements below either
/// are conjunctive: all required names must match, any record value under
/// a name suffices.
#[derive(Debug, Default)]
pub struct DispatchTree {
    unkeyed: Node,
    keyed: HashMap<Bytes, Node>,
}

impl DispatchTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` under the given filters.
    ///
    /// Headers are normalized to a canonical order so the same filter set
    /// always reference-counts the same path.
    pub fn add(&mut self, key: Option<&Bytes>, headers: &[(Bytes, Bytes)], sink: SinkId) {
        let path = canonical(headers);
        match key {
            Some(key) => self.keyed.entry(key.clone()).or_default().add(&path, sink),
            None => self.unkeyed.add(&path, sink),
        }
        debug!(sink = %sink, keyed = key.is_some(), headers = headers.len(), "dispatch add");
    }

    /// Removes one registration of `sink`. Returns true if it was found.
    pub fn remove(&mut self, key: Option<&[u8]>, headers: &[(Bytes, Bytes)], sink: SinkId) -> bool {
        let path = canonical(headers);
        let found = match key {
            Some(key) => {
                let Some(node) = self.keyed.get_mut(key) else {
                    return false;
                };
                let found = node.remove(&path, sink);
                if found && node.is_empty() {
                    self.keyed.remove(key);
                }
                found
            }
            None => self.unkeyed.remove(&path, sink),
        };
        debug!(sink = %sink, found, "dispatch remove");
        found
    }

    /// Offers one record to every matching sink; flags OR-combine.
    pub fn dispatch(
        &mut self,
        registry: &mut SinkRegistry,
        ctx: &DispatchContext<'_>,
    ) -> DispatchFlags {
        let mut flags = DispatchFlags::EMPTY;
        if !self.unkeyed.is_empty() {
            flags |= self.unkeyed.dispatch(registry, ctx);
        }
        if let Some(key) = ctx.key {
            if let Some(node) = self.keyed.get_mut(key) {
                flags |= node.dispatch(registry, ctx);
            }
        }
        flags
    }

    /// Finalizes a batch: every sink reports how far it truly advanced.
    pub fn flush(
        &mut self,
        registry: &mut SinkRegistry,
        partition: PartitionId,
        request_offset: Offset,
        last_offset: Offset,
    ) -> Vec<(SinkId, SinkProgress)> {
        let mut progress = Vec::new();
        self.for_each_sink(|sink_id| {
            if let Some(sink) = registry.get_mut(sink_id) {
                if let Some(p) = sink.flush(partition, request_offset, last_offset) {
                    progress.push((sink_id, p));
                }
            }
        });
        progress
    }

    /// Broadcasts a silent position rebase to every sink.
    pub fn adjust_offset(
        &mut self,
        registry: &mut SinkRegistry,
        partition: PartitionId,
        old_offset: Offset,
        new_offset: Offset,
    ) {
        self.for_each_sink(|sink_id| {
            if let Some(sink) = registry.get_mut(sink_id) {
                sink.adjust_offset(partition, old_offset, new_offset);
            }
        });
    }

    /// Returns every registered sink id, deduplicated.
    #[must_use]
    pub fn sink_ids(&self) -> Vec<SinkId> {
        let mut ids = Vec::new();
        self.for_each_sink(|id| {
            if !ids.contains(&id) {
                ids.push(id);
            }
        });
        ids
    }

    /// Drops every registration.
    pub fn clear(&mut self) {
        self.unkeyed = Node::default();
        self.keyed.clear();
    }

    /// Returns true if no sinks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unkeyed.is_empty() && self.keyed.is_empty()
    }

    fn for_each_sink(&self, mut f: impl FnMut(SinkId)) {
        self.unkeyed.for_each_leaf(&mut f);
        for node in self.keyed.values() {
            node.for_each_leaf(&mut f);
        }
    }
}

/// Sorts header requirements so equal filter sets share one tree path.
fn canonical(headers: &[(Bytes, Bytes)]) -> Vec<(Bytes, Bytes)> {
    let mut path = headers.to_vec();
    path.sort();
    path
}
