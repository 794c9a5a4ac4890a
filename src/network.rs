use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time;
use tracing::debug;

use crate::errors::{NodeError, NodeResult};
use crate::node::{NodeHandle, WeakNodeHandle};
use crate::types::{CheckQuery, Item, ItemId, ItemResult, NodeId};

/// Network collaborator consumed by the decision kernel and its elections:
/// peer addressing, the election ceiling `T_max`, a deferred-task scheduler,
/// and the peer RPC used to solicit votes and download item bodies.
pub trait Network: Send + Sync + 'static {
    fn node_ids(&self) -> Vec<NodeId>;

    fn size(&self) -> usize {
        self.node_ids().len()
    }

    /// Network-wide ceiling on election lifetime, also governing how long a
    /// finished election stays discoverable before its purge.
    fn max_elections_time(&self) -> Duration;

    /// Cadence at which an election polls its peers for votes.
    fn poll_interval(&self) -> Duration;

    /// Votes sufficient to finalize a decision.
    fn quorum(&self) -> usize {
        self.size() * 2 / 3 + 1
    }

    /// Run `task` after `delay` on the shared runtime. Ordering between
    /// tasks of equal delay is unspecified.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move {
            time::sleep(delay).await;
            task();
        });
    }

    /// Ask `target` for its view of an item, reporting our own.
    fn check_item(
        &self,
        caller: &NodeId,
        target: &NodeId,
        query: CheckQuery,
    ) -> NodeResult<ItemResult>;

    /// Request the item body from a peer that claims to hold it.
    fn fetch_item(
        &self,
        caller: &NodeId,
        target: &NodeId,
        item_id: &ItemId,
    ) -> NodeResult<Option<Item>>;

    /// Availability probe surfaced to clients: count of reachable nodes.
    fn check_state(&self, reporter: &NodeId) -> usize;
}

/// In-process network wiring nodes together. Used for single-node
/// deployments and for multi-node clusters in tests. Holds only weak
/// handles: nodes reference the network back, and the registry must not
/// extend their lifetime.
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, WeakNodeHandle>>,
    max_elections_time: Duration,
    poll_interval: Duration,
}

impl LocalNetwork {
    pub fn new(max_elections_time: Duration, poll_interval: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            max_elections_time,
            poll_interval,
        }
    }

    pub fn register(&self, handle: &NodeHandle) {
        let address = handle.address().clone();
        debug!(node = %address, "node joined local network");
        self.nodes.write().insert(address, handle.downgrade());
    }

    fn node(&self, id: &NodeId) -> NodeResult<NodeHandle> {
        self.nodes
            .read()
            .get(id)
            .and_then(WeakNodeHandle::upgrade)
            .ok_or_else(|| NodeError::Network(format!("unknown or stopped node {id}")))
    }
}

impl Network for LocalNetwork {
    fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, handle)| handle.upgrade().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn max_elections_time(&self) -> Duration {
        self.max_elections_time
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn check_item(
        &self,
        caller: &NodeId,
        target: &NodeId,
        query: CheckQuery,
    ) -> NodeResult<ItemResult> {
        self.node(target)?.check_item(
            Some(caller.clone()),
            query.item_id,
            query.state,
            query.have_copy,
        )
    }

    fn fetch_item(
        &self,
        _caller: &NodeId,
        target: &NodeId,
        item_id: &ItemId,
    ) -> NodeResult<Option<Item>> {
        Ok(self.node(target)?.get_item(item_id))
    }

    fn check_state(&self, _reporter: &NodeId) -> usize {
        // A registered in-process node is reachable as long as it is alive.
        self.nodes
            .read()
            .values()
            .filter(|handle| handle.upgrade().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedNetwork(usize);

    impl Network for FixedNetwork {
        fn node_ids(&self) -> Vec<NodeId> {
            (0..self.0).map(|i| format!("node-{i}")).collect()
        }

        fn max_elections_time(&self) -> Duration {
            Duration::from_secs(30)
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(500)
        }

        fn check_item(
            &self,
            _caller: &NodeId,
            _target: &NodeId,
            _query: CheckQuery,
        ) -> NodeResult<ItemResult> {
            Err(NodeError::Network("unreachable".into()))
        }

        fn fetch_item(
            &self,
            _caller: &NodeId,
            _target: &NodeId,
            _item_id: &ItemId,
        ) -> NodeResult<Option<Item>> {
            Ok(None)
        }

        fn check_state(&self, _reporter: &NodeId) -> usize {
            self.0
        }
    }

    #[test]
    fn quorum_is_two_thirds_plus_one() {
        assert_eq!(FixedNetwork(1).quorum(), 1);
        assert_eq!(FixedNetwork(2).quorum(), 2);
        assert_eq!(FixedNetwork(3).quorum(), 3);
        assert_eq!(FixedNetwork(4).quorum(), 3);
        assert_eq!(FixedNetwork(7).quorum(), 5);
        assert_eq!(FixedNetwork(10).quorum(), 7);
    }
}
