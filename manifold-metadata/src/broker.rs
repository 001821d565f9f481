//! Broker identity and connection-slot reuse decisions.

use std::collections::HashMap;

use manifold_core::NodeId;
use tracing::debug;

/// One broker's advertised endpoint. Value-equal: two observations with
/// the same node id, host, and port describe the same broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerMetadata {
    /// Cluster-assigned node id.
    pub node_id: NodeId,
    /// Advertised hostname.
    pub host: String,
    /// Advertised port.
    pub port: u16,
}

impl BrokerMetadata {
    /// Creates broker metadata.
    #[must_use]
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
        }
    }
}

/// What a metadata refresh told us about one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerChange {
    /// Same endpoint as before; existing connections stay valid.
    Unchanged,
    /// First sighting of this node id.
    Added,
    /// Same node id at a new endpoint. Connections bound to the previous
    /// endpoint must be closed and reinitialized, never duplicated.
    Moved {
        /// The endpoint this node was previously bound to.
        previous: BrokerMetadata,
    },
}

/// The set of brokers currently known, keyed by node id.
///
/// Metadata responses replace endpoints wholesale; the registry turns
/// each observation into a reuse decision for the connection layer.
#[derive(Debug, Default)]
pub struct BrokerRegistry {
    brokers: HashMap<NodeId, BrokerMetadata>,
}

impl BrokerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observed broker and reports what changed.
    pub fn observe(&mut self, broker: BrokerMetadata) -> BrokerChange {
        match self.brokers.get(&broker.node_id) {
            Some(existing) if *existing == broker => BrokerChange::Unchanged,
            Some(existing) => {
                let previous = existing.clone();
                debug!(
                    node_id = %broker.node_id,
                    old_host = %previous.host,
                    old_port = previous.port,
                    new_host = %broker.host,
                    new_port = broker.port,
                    "broker moved"
                );
                self.brokers.insert(broker.node_id, broker);
                BrokerChange::Moved { previous }
            }
            None => {
                debug!(node_id = %broker.node_id, host = %broker.host, port = broker.port, "broker added");
                self.brokers.insert(broker.node_id, broker);
                BrokerChange::Added
            }
        }
    }

    /// Looks up a broker's current endpoint.
    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<&BrokerMetadata> {
        self.brokers.get(&node_id)
    }

    /// Forgets a broker entirely.
    pub fn remove(&mut self, node_id: NodeId) -> Option<BrokerMetadata> {
        self.brokers.remove(&node_id)
    }

    /// Iterates known brokers in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &BrokerMetadata> {
        self.brokers.values()
    }

    /// Number of known brokers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    /// Returns true if no brokers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
