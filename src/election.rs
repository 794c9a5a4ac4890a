use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::network::Network;
use crate::types::{CheckQuery, Item, ItemId, ItemResult, ItemState, NodeId, StateRecord};

/// Observer invoked exactly once with the final election result.
pub type DoneCallback = Box<dyn FnOnce(ItemResult) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Deciding,
    Done,
}

/// Collaborators an election needs from its owning node, passed at
/// construction so the election never holds an owning edge back to the node.
pub(crate) struct ElectionContext {
    pub node_id: NodeId,
    pub network: Arc<dyn Network>,
    pub ledger: Arc<Ledger>,
    pub default_state_expiry: Duration,
    pub late_download: bool,
}

struct ElectionState {
    phase: Phase,
    item: Option<Item>,
    record: StateRecord,
    sources: HashSet<NodeId>,
    votes: HashMap<NodeId, bool>,
    positive: usize,
    negative: usize,
    observers: Vec<DoneCallback>,
}

/// Per-item voting state machine. The lifecycle worker checks a held body,
/// polls peers for votes, downloads a missing body from source nodes, and
/// bounds the whole process by the network's `max_elections_time`.
pub struct Election {
    item_id: ItemId,
    ctx: ElectionContext,
    state: Mutex<ElectionState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Election {
    pub(crate) fn new(ctx: ElectionContext, item_id: ItemId, item: Option<Item>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        let record = StateRecord::pending(item_id.clone());
        Arc::new(Self {
            item_id,
            ctx,
            state: Mutex::new(ElectionState {
                phase: Phase::Created,
                item,
                record,
                sources: HashSet::new(),
                votes: HashMap::new(),
                positive: 0,
                negative: 0,
                observers: Vec::new(),
            }),
            done_tx,
            done_rx,
        })
    }

    /// Idempotent transition out of `Created`: spawns the lifecycle worker.
    /// Callers must not hold the kernel's creation mutex here.
    pub fn ensure_started(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Created {
                return;
            }
            state.phase = Phase::Started;
        }
        let election = Arc::clone(self);
        tokio::spawn(async move {
            election.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        let deadline = time::Instant::now() + self.ctx.network.max_elections_time();
        self.check_held_item();
        // First peer poll happens one interval after start; the held-item
        // check above already ran.
        let poll = self.ctx.network.poll_interval();
        let mut ticker = time::interval_at(time::Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.try_fetch_item();
                    self.poll_peers();
                }
                _ = time::sleep_until(deadline) => {
                    self.expire();
                    return;
                }
                _ = self.wait_done() => {
                    return;
                }
            }
            if self.is_done() {
                return;
            }
        }
    }

    /// The node's own vote: integrity of the body it holds.
    fn check_held_item(&self) {
        let verdict = {
            let state = self.state.lock();
            state.item.as_ref().map(Item::verify)
        };
        match verdict {
            Some(Ok(())) => {
                self.set_lean(true);
                self.register_vote(self.ctx.node_id.clone(), true);
            }
            Some(Err(err)) => {
                warn!(item = %self.item_id, error = %err, "item failed check, voting negative");
                self.set_lean(false);
                self.register_vote(self.ctx.node_id.clone(), false);
            }
            None => {}
        }
    }

    /// Pending records lean positive or negative once the node has an
    /// opinion; that lean is what peers receive while the election runs.
    fn set_lean(&self, positive: bool) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Deciding | Phase::Done) {
            return;
        }
        if !state.record.state.is_terminal() {
            state.record.state = if positive {
                ItemState::PendingPositive
            } else {
                ItemState::PendingNegative
            };
        }
    }

    fn try_fetch_item(&self) {
        if self.ctx.late_download {
            // Testing switch: behave as if no source ever delivers.
            return;
        }
        let sources: Vec<NodeId> = {
            let state = self.state.lock();
            if state.item.is_some() || state.phase == Phase::Done {
                return;
            }
            state.sources.iter().cloned().collect()
        };
        for peer in sources {
            match self
                .ctx
                .network
                .fetch_item(&self.ctx.node_id, &peer, &self.item_id)
            {
                Ok(Some(item)) => {
                    if item.id() != &self.item_id {
                        warn!(item = %self.item_id, peer = %peer, "peer returned mismatched body");
                        continue;
                    }
                    match item.verify() {
                        Ok(()) => {
                            {
                                let mut state = self.state.lock();
                                if state.phase == Phase::Done || state.item.is_some() {
                                    return;
                                }
                                state.item = Some(item);
                            }
                            debug!(item = %self.item_id, peer = %peer, "item body downloaded");
                            self.set_lean(true);
                            self.register_vote(self.ctx.node_id.clone(), true);
                            return;
                        }
                        Err(err) => {
                            warn!(item = %self.item_id, error = %err, "downloaded item failed check");
                            self.set_lean(false);
                            self.register_vote(self.ctx.node_id.clone(), false);
                            return;
                        }
                    }
                }
                Ok(None) => {
                    debug!(item = %self.item_id, peer = %peer, "source no longer holds the body")
                }
                Err(err) => {
                    // Transient; the next tick retries until the deadline.
                    debug!(item = %self.item_id, peer = %peer, error = %err, "item fetch failed")
                }
            }
        }
    }

    fn poll_peers(&self) {
        let (own_state, have_copy) = {
            let state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            (state.record.state, state.item.is_some())
        };
        for peer in self.ctx.network.node_ids() {
            if peer == self.ctx.node_id {
                continue;
            }
            if self.is_done() {
                return;
            }
            // First-write-wins makes re-querying a voted peer pointless.
            if self.state.lock().votes.contains_key(&peer) {
                continue;
            }
            let query = CheckQuery {
                item_id: self.item_id.clone(),
                state: Some(own_state),
                have_copy,
            };
            match self.ctx.network.check_item(&self.ctx.node_id, &peer, query) {
                Ok(result) => {
                    if result.have_copy {
                        self.add_source_node(peer.clone());
                    }
                    match result.state {
                        ItemState::PendingPositive | ItemState::Approved => {
                            self.register_vote(peer, true)
                        }
                        ItemState::PendingNegative
                        | ItemState::Declined
                        | ItemState::Revoked => self.register_vote(peer, false),
                        _ => {}
                    }
                }
                Err(err) => {
                    debug!(item = %self.item_id, peer = %peer, error = %err, "peer check failed")
                }
            }
        }
    }

    /// Peers asserting they can furnish the body. Silently dropped once the
    /// election is done.
    pub fn add_source_node(&self, peer: NodeId) {
        let mut state = self.state.lock();
        if state.phase == Phase::Done {
            debug!(item = %self.item_id, peer = %peer, "source addition after done dropped");
            return;
        }
        state.sources.insert(peer);
    }

    /// Records a vote; subsequent votes from the same peer are ignored.
    /// Votes arriving after the election is done are silently dropped.
    pub fn register_vote(&self, peer: NodeId, positive: bool) {
        let decided = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Deciding | Phase::Done) {
                debug!(item = %self.item_id, peer = %peer, "vote after done dropped");
                return;
            }
            if state.votes.contains_key(&peer) {
                return;
            }
            state.votes.insert(peer, positive);
            if positive {
                state.positive += 1;
            } else {
                state.negative += 1;
            }
            let quorum = self.ctx.network.quorum();
            if state.positive >= quorum {
                Some(ItemState::Approved)
            } else if state.negative >= quorum {
                Some(ItemState::Declined)
            } else {
                None
            }
        };
        if let Some(outcome) = decided {
            self.finish(outcome);
        }
    }

    /// Registers an observer. Running: appended and invoked once after the
    /// decision. Already done: invoked synchronously with the final result.
    /// Observers are not de-duplicated.
    pub fn on_done(&self, callback: DoneCallback) {
        let result = {
            let mut state = self.state.lock();
            if state.phase != Phase::Done {
                state.observers.push(callback);
                return;
            }
            ItemResult::new(&state.record, state.item.is_some())
        };
        callback(result);
    }

    pub fn get_item(&self) -> Option<Item> {
        self.state.lock().item.clone()
    }

    pub fn get_record(&self) -> StateRecord {
        self.state.lock().record.clone()
    }

    /// Snapshot of the current record plus body availability.
    pub fn result(&self) -> ItemResult {
        let state = self.state.lock();
        ItemResult::new(&state.record, state.item.is_some())
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Waits until the election reaches its decision. Cancel-safe: dropping
    /// the future does not affect the election.
    pub async fn wait_done(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Forces the transition to done with the current record. Terminal
    /// records are persisted; a still-pending record is not. Idempotent.
    pub fn close(&self) {
        let current = self.state.lock().record.state;
        self.finish(current);
    }

    /// Timeout fallback: decide from the best available evidence.
    fn expire(&self) {
        let outcome = {
            let state = self.state.lock();
            if matches!(state.phase, Phase::Deciding | Phase::Done) {
                return;
            }
            if state.item.is_some() {
                if state.positive > state.negative {
                    ItemState::Approved
                } else {
                    ItemState::Declined
                }
            } else {
                ItemState::Undefined
            }
        };
        warn!(item = %self.item_id, ?outcome, "election timed out without quorum");
        self.finish(outcome);
    }

    /// Single finalization path: fixes the record, persists terminal
    /// outcomes, flips the done latch, and drains observers exactly once.
    fn finish(&self, final_state: ItemState) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Deciding | Phase::Done) {
                return;
            }
            state.phase = Phase::Deciding;
            state.record.state = final_state;
            if final_state == ItemState::Approved {
                state.record.expires_at =
                    Some(state.record.created_at + self.ctx.default_state_expiry.as_secs());
            }
        }
        let record = self.get_record();
        if record.state.is_terminal() {
            if let Err(err) = self.ctx.ledger.put_record(record) {
                warn!(item = %self.item_id, error = %err, "failed to persist election outcome");
            }
        }
        let (observers, result) = {
            let mut state = self.state.lock();
            state.phase = Phase::Done;
            let result = ItemResult::new(&state.record, state.item.is_some());
            (std::mem::take(&mut state.observers), result)
        };
        let _ = self.done_tx.send(true);
        info!(item = %self.item_id, state = ?result.state, "election finished");
        for observer in observers {
            observer(result.clone());
        }
    }
}
