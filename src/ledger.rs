use std::collections::HashMap;

use parking_lot::RwLock;

use crate::errors::{NodeError, NodeResult};
use crate::storage::Storage;
use crate::types::{ItemId, StateRecord};

/// Default lifetime of an approved record before it may be expired.
pub const DEFAULT_STATE_EXPIRY_SECS: u64 = 90 * 24 * 3600;

/// Durable map of finalized item states. Reads are served from memory; a
/// storage-backed ledger writes records through on every put.
///
/// Presence of a record is authoritative: the decision kernel treats it as
/// the settled, terminal fate of the item.
pub struct Ledger {
    records: RwLock<HashMap<ItemId, StateRecord>>,
    storage: Option<Storage>,
}

impl Ledger {
    /// Ephemeral ledger; state is lost on restart.
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            storage: None,
        }
    }

    /// Ledger backed by persistent storage; loads the full record set.
    pub fn open(storage: Storage) -> NodeResult<Self> {
        let mut records = HashMap::new();
        for record in storage.load_records()? {
            records.insert(record.item_id.clone(), record);
        }
        Ok(Self {
            records: RwLock::new(records),
            storage: Some(storage),
        })
    }

    /// Not-found is `Ok(None)`; only real I/O failures surface as errors.
    pub fn get_record(&self, item_id: &ItemId) -> NodeResult<Option<StateRecord>> {
        Ok(self.records.read().get(item_id).cloned())
    }

    /// Idempotent on `(item_id, state)`. Rejects non-terminal records: only
    /// elections reaching their decision may write here.
    pub fn put_record(&self, record: StateRecord) -> NodeResult<()> {
        if !record.state.is_terminal() {
            return Err(NodeError::Election(format!(
                "refusing to persist non-terminal state {:?}",
                record.state
            )));
        }
        {
            let records = self.records.read();
            if records
                .get(&record.item_id)
                .map(|existing| existing.state == record.state)
                .unwrap_or(false)
            {
                return Ok(());
            }
        }
        if let Some(storage) = &self.storage {
            storage.store_record(&record)?;
        }
        self.records.write().insert(record.item_id.clone(), record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{current_timestamp, ItemState};

    fn record(payload: &[u8], state: ItemState) -> StateRecord {
        StateRecord {
            item_id: ItemId::from_payload(payload),
            state,
            created_at: current_timestamp(),
            expires_at: None,
        }
    }

    #[test]
    fn put_then_get() {
        let ledger = Ledger::in_memory();
        let approved = record(b"item", ItemState::Approved);
        ledger.put_record(approved.clone()).unwrap();
        assert_eq!(
            ledger.get_record(&approved.item_id).unwrap(),
            Some(approved)
        );
    }

    #[test]
    fn missing_record_is_none() {
        let ledger = Ledger::in_memory();
        assert!(ledger
            .get_record(&ItemId::from_payload(b"missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn non_terminal_record_rejected() {
        let ledger = Ledger::in_memory();
        let err = ledger
            .put_record(record(b"pending", ItemState::Pending))
            .unwrap_err();
        assert!(matches!(err, NodeError::Election(_)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn put_is_idempotent_on_state() {
        let ledger = Ledger::in_memory();
        let approved = record(b"item", ItemState::Approved);
        ledger.put_record(approved.clone()).unwrap();
        ledger.put_record(approved.clone()).unwrap();
        assert_eq!(ledger.len(), 1);

        // A different terminal state replaces the record (revocation).
        let mut revoked = approved;
        revoked.state = ItemState::Revoked;
        ledger.put_record(revoked.clone()).unwrap();
        assert_eq!(
            ledger.get_record(&revoked.item_id).unwrap().unwrap().state,
            ItemState::Revoked
        );
    }

    #[test]
    fn open_loads_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        let approved = record(b"persisted", ItemState::Approved);
        {
            let storage = Storage::open(dir.path()).unwrap();
            let ledger = Ledger::open(storage).unwrap();
            ledger.put_record(approved.clone()).unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        let reopened = Ledger::open(storage).unwrap();
        assert_eq!(
            reopened.get_record(&approved.item_id).unwrap(),
            Some(approved)
        );
    }
}
