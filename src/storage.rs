use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options,
};

use crate::errors::{NodeError, NodeResult};
use crate::types::{ItemId, StateRecord};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_RECORDS: &str = "records";
const CF_METADATA: &str = "metadata";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// RocksDB persistence for finalized state records.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> NodeResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn records_cf(&self) -> NodeResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| NodeError::Config("missing records column family".into()))
    }

    fn metadata_cf(&self) -> NodeResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| NodeError::Config("missing metadata column family".into()))
    }

    fn ensure_schema_supported(&self) -> NodeResult<()> {
        match self.read_schema_version()? {
            Some(version) if version != STORAGE_SCHEMA_VERSION => Err(NodeError::Config(format!(
                "database schema version {version} is not the supported {STORAGE_SCHEMA_VERSION}"
            ))),
            Some(_) => Ok(()),
            None => {
                if self.is_empty()? {
                    self.write_schema_version(STORAGE_SCHEMA_VERSION)
                } else {
                    Err(NodeError::Config(
                        "database carries records but no schema version".into(),
                    ))
                }
            }
        }
    }

    fn is_empty(&self) -> NodeResult<bool> {
        let records_cf = self.records_cf()?;
        let mut iter = self.db.iterator_cf(&records_cf, IteratorMode::Start);
        Ok(iter.next().transpose()?.is_none())
    }

    fn read_schema_version(&self) -> NodeResult<Option<u32>> {
        let metadata_cf = self.metadata_cf()?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| NodeError::Config("invalid schema version encoding".into()))?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn write_schema_version(&self, version: u32) -> NodeResult<()> {
        let metadata_cf = self.metadata_cf()?;
        self.db
            .put_cf(&metadata_cf, SCHEMA_VERSION_KEY, version.to_be_bytes())?;
        Ok(())
    }

    pub fn schema_version(&self) -> NodeResult<u32> {
        Ok(self
            .read_schema_version()?
            .unwrap_or(STORAGE_SCHEMA_VERSION))
    }

    pub fn store_record(&self, record: &StateRecord) -> NodeResult<()> {
        let cf = self.records_cf()?;
        let data = bincode::serialize(record)?;
        self.db.put_cf(&cf, record.item_id.as_bytes(), data)?;
        Ok(())
    }

    pub fn read_record(&self, item_id: &ItemId) -> NodeResult<Option<StateRecord>> {
        let cf = self.records_cf()?;
        match self.db.get_cf(&cf, item_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn load_records(&self) -> NodeResult<Vec<StateRecord>> {
        let cf = self.records_cf()?;
        let mut iterator = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut records = Vec::new();
        while let Some(entry) = iterator.next() {
            let (_key, value) = entry?;
            records.push(bincode::deserialize::<StateRecord>(&value)?);
        }
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(records)
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{current_timestamp, ItemState};

    fn sample_record(payload: &[u8], state: ItemState) -> StateRecord {
        StateRecord {
            item_id: ItemId::from_payload(payload),
            state,
            created_at: current_timestamp(),
            expires_at: None,
        }
    }

    #[test]
    fn fresh_database_gets_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.schema_version().unwrap(), STORAGE_SCHEMA_VERSION);
    }

    #[test]
    fn record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let record = sample_record(b"stored item", ItemState::Approved);
        storage.store_record(&record).unwrap();
        let loaded = storage.read_record(&record.item_id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(storage
            .read_record(&ItemId::from_payload(b"absent"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn load_records_returns_everything_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .store_record(&sample_record(b"one", ItemState::Approved))
            .unwrap();
        storage
            .store_record(&sample_record(b"two", ItemState::Declined))
            .unwrap();
        assert_eq!(storage.load_records().unwrap().len(), 2);
    }
}
