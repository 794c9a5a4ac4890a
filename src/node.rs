use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::crypto::NodeIdentity;
use crate::election::{DoneCallback, Election, ElectionContext};
use crate::errors::{NodeError, NodeResult};
use crate::ledger::Ledger;
use crate::network::Network;
use crate::storage::Storage;
use crate::types::{Item, ItemId, ItemInfo, ItemResult, ItemState, NodeId};

/// A node of the approval network: holds the durable ledger and the decision
/// kernel that routes every item query to either a ledger lookup or an
/// election.
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Cloneable handle carrying the full client and peer API of a node.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

/// Weak counterpart of [`NodeHandle`]. Registries that nodes themselves
/// reference (such as [`crate::network::LocalNetwork`]) hold these, so a
/// node's lifetime stays with its owner rather than with the network.
#[derive(Clone)]
pub struct WeakNodeHandle {
    inner: Weak<NodeInner>,
}

impl WeakNodeHandle {
    pub fn upgrade(&self) -> Option<NodeHandle> {
        self.inner.upgrade().map(|inner| NodeHandle { inner })
    }
}

struct NodeInner {
    id: NodeId,
    network: Arc<dyn Network>,
    ledger: Arc<Ledger>,
    elections: RwLock<HashMap<ItemId, Arc<Election>>>,
    check_lock: Mutex<()>,
    late_download: AtomicBool,
    default_state_expiry: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub address: NodeId,
    pub network_size: usize,
    pub elections_in_flight: usize,
    pub ledger_records: usize,
}

impl Node {
    pub fn new(config: NodeConfig, network: Arc<dyn Network>) -> NodeResult<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let identity = NodeIdentity::open(&config.key_path)?;
        let id = identity.address().clone();
        let ledger = if config.persist_ledger {
            let storage = Storage::open(&config.data_dir.join("db"))?;
            Ledger::open(storage)?
        } else {
            Ledger::in_memory()
        };
        info!(node = %id, persist = config.persist_ledger, "node initialized");
        Ok(Self::assemble(
            id,
            network,
            Arc::new(ledger),
            Duration::from_secs(config.default_state_expiry_secs),
        ))
    }

    /// Ephemeral node with an in-memory ledger; used by in-process clusters.
    pub fn in_memory(id: impl Into<NodeId>, network: Arc<dyn Network>) -> Self {
        Self::assemble(
            id.into(),
            network,
            Arc::new(Ledger::in_memory()),
            Duration::from_secs(crate::ledger::DEFAULT_STATE_EXPIRY_SECS),
        )
    }

    fn assemble(
        id: NodeId,
        network: Arc<dyn Network>,
        ledger: Arc<Ledger>,
        default_state_expiry: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id,
                network,
                ledger,
                elections: RwLock::new(HashMap::new()),
                check_lock: Mutex::new(()),
                late_download: AtomicBool::new(false),
                default_state_expiry,
            }),
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }
}

impl NodeHandle {
    pub fn address(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn downgrade(&self) -> WeakNodeHandle {
        WeakNodeHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.inner.network
    }

    /// Peer-to-peer entry point: answer a node's query about an item,
    /// registering its vote and source availability along the way. Starts an
    /// election when the item is neither settled nor being elected.
    pub fn check_item(
        &self,
        caller: Option<NodeId>,
        item_id: ItemId,
        caller_state: Option<ItemState>,
        caller_has_copy: bool,
    ) -> NodeResult<ItemResult> {
        let result = self.inner.process_check_item(
            caller.clone(),
            item_id.clone(),
            caller_state,
            caller_has_copy,
            None,
            None,
        )?;
        debug!(
            node = %self.inner.id,
            caller = ?caller,
            item = %item_id,
            state = ?result.state,
            "check_item"
        );
        Ok(result)
    }

    /// Body fetch for peers. A finished election may no longer hold the body
    /// even when the item was approved.
    pub fn get_item(&self, item_id: &ItemId) -> Option<Item> {
        self.inner
            .live_election(item_id)
            .and_then(|election| election.get_item())
    }

    /// Client entry: submit an item for approval. Returns immediately with
    /// the current snapshot; `on_done` fires once the fate is settled.
    pub fn register_item(
        &self,
        item: Item,
        on_done: Option<DoneCallback>,
    ) -> NodeResult<ItemInfo> {
        let item_id = item.id().clone();
        let result = self.inner.process_check_item(
            None,
            item_id,
            None,
            false,
            Some(item.clone()),
            on_done,
        )?;
        Ok(ItemInfo { result, item })
    }

    /// Client probe consulting only the ledger. Deliberately cheap: it never
    /// creates an election, and it returns `None` even when a live election
    /// exists for the id. In-flight items this client did not submit are
    /// invisible to it.
    pub fn check_item_id(&self, item_id: &ItemId) -> NodeResult<Option<ItemResult>> {
        Ok(self
            .inner
            .ledger
            .get_record(item_id)?
            .map(|record| ItemResult::new(&record, false)))
    }

    /// Waits for a live election to settle, otherwise falls back to the
    /// ledger. Must not be exposed to remote peers.
    pub async fn wait_for_item(&self, item_id: &ItemId) -> NodeResult<Option<ItemResult>> {
        match self.inner.live_election(item_id) {
            Some(election) => {
                election.wait_done().await;
                Ok(Some(election.result()))
            }
            None => self.check_item_id(item_id),
        }
    }

    /// Submit an item and block until the network settles it. Structural
    /// item defects surface here as errors instead of a negative decision.
    pub async fn register_item_and_wait(&self, item: Item) -> NodeResult<ItemResult> {
        item.verify()?;
        let item_id = item.id().clone();
        self.inner
            .process_check_item(None, item_id.clone(), None, false, Some(item), None)?;
        self.wait_for_item(&item_id)
            .await?
            .ok_or_else(|| NodeError::Election("item vanished before a decision was reached".into()))
    }

    /// Closes every live election and clears the map so later registrations
    /// start fresh. Scheduled purges are harmless afterwards. Does not wait
    /// for them.
    pub fn shutdown(&self) {
        let elections: Vec<Arc<Election>> = {
            let mut map = self.inner.elections.write();
            map.drain().map(|(_, election)| election).collect()
        };
        for election in &elections {
            election.close();
        }
        info!(node = %self.inner.id, closed = elections.len(), "node shut down");
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.inner.id.clone(),
            network_size: self.inner.network.size(),
            elections_in_flight: self.inner.elections.read().len(),
            ledger_records: self.inner.ledger.len(),
        }
    }

    /// Testing only: elections created after this call behave as if no
    /// source ever delivers the item body.
    pub fn emulate_late_download(&self) {
        self.inner.late_download.store(true, Ordering::Relaxed);
    }
}

impl NodeInner {
    fn live_election(&self, item_id: &ItemId) -> Option<Arc<Election>> {
        self.elections.read().get(item_id).cloned()
    }

    fn election_context(&self) -> ElectionContext {
        ElectionContext {
            node_id: self.id.clone(),
            network: Arc::clone(&self.network),
            ledger: Arc::clone(&self.ledger),
            default_state_expiry: self.default_state_expiry,
            late_download: self.late_download.load(Ordering::Relaxed),
        }
    }

    /// The decision kernel. Two-tier lookup (elections, then ledger), with
    /// election creation double-checked under `check_lock`. The lock covers
    /// only the check-and-insert; starting the election, scheduling its
    /// purge, and every callback run outside it.
    ///
    /// Panics if `item` is provided with an id other than `item_id`.
    fn process_check_item(
        self: &Arc<Self>,
        caller: Option<NodeId>,
        item_id: ItemId,
        caller_state: Option<ItemState>,
        caller_has_copy: bool,
        mut item: Option<Item>,
        mut on_done: Option<DoneCallback>,
    ) -> NodeResult<ItemResult> {
        let election = match self.live_election(&item_id) {
            Some(election) => election,
            None => {
                if let Some(record) = self.ledger.get_record(&item_id)? {
                    // Settled: the body is not retained past finalization.
                    let result = ItemResult::new(&record, false);
                    if let Some(callback) = on_done.take() {
                        callback(result.clone());
                    }
                    return Ok(result);
                }
                let (election, created) = {
                    let _guard = self.check_lock.lock();
                    // Someone may have created the election while we were
                    // crawling to this point.
                    let mut elections = self.elections.write();
                    match elections.get(&item_id) {
                        Some(existing) => (Arc::clone(existing), false),
                        None => {
                            if let Some(item) = item.as_ref() {
                                assert_eq!(
                                    item.id(),
                                    &item_id,
                                    "item body does not match the queried id",
                                );
                            }
                            let election =
                                Election::new(self.election_context(), item_id.clone(), item.take());
                            elections.insert(item_id.clone(), Arc::clone(&election));
                            (election, true)
                        }
                    }
                };
                if created {
                    // Starting includes the (possibly long) initial item
                    // check, so it happens with the lock released.
                    election.ensure_started();
                    self.schedule_purge(&election, item_id.clone());
                }
                election
            }
        };
        if let Some(caller) = caller {
            if caller_has_copy {
                election.add_source_node(caller.clone());
            }
            if let Some(state) = caller_state {
                match state {
                    ItemState::PendingPositive | ItemState::Approved => {
                        election.register_vote(caller, true)
                    }
                    ItemState::PendingNegative | ItemState::Declined | ItemState::Revoked => {
                        election.register_vote(caller, false)
                    }
                    _ => {}
                }
            }
        }
        if let Some(callback) = on_done.take() {
            election.on_done(callback);
        }
        Ok(election.result())
    }

    /// Finished elections stay discoverable for `max_elections_time` so late
    /// peer queries still observe the result, then the map entry is dropped.
    fn schedule_purge(self: &Arc<Self>, election: &Arc<Election>, item_id: ItemId) {
        let weak: Weak<NodeInner> = Arc::downgrade(self);
        let network = Arc::clone(&self.network);
        let retention = network.max_elections_time();
        election.on_done(Box::new(move |_result| {
            network.schedule(
                retention,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        if inner.elections.write().remove(&item_id).is_some() {
                            debug!(item = %item_id, "finished election purged");
                        }
                    }
                }),
            );
        }));
    }
}
