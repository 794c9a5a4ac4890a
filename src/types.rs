use std::convert::TryFrom;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::payload_digest;
use crate::errors::{NodeError, NodeResult};

/// Network address of a node, derived from its public key.
pub type NodeId = String;

/// Upper bound on item payloads a node will accept or fetch.
pub const MAX_ITEM_BYTES: usize = 1024 * 1024;

/// Content-addressed item identifier: the BLAKE2s-256 digest of the payload.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId([u8; 32]);

impl ItemId {
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(payload_digest(payload))
    }

    pub fn from_hex(data: &str) -> NodeResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| NodeError::Config(format!("invalid item id encoding: {err}")))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::Config("item id must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<String> for ItemId {
    type Error = NodeError;

    fn try_from(value: String) -> NodeResult<Self> {
        Self::from_hex(&value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.to_hex()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", &self.to_hex()[..16])
    }
}

/// An arbitrary content-addressed object the network is asked to approve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    id: ItemId,
    #[serde(with = "hex")]
    payload: Vec<u8>,
}

impl Item {
    pub fn new(payload: Vec<u8>) -> Self {
        let id = ItemId::from_payload(&payload);
        Self { id, payload }
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Integrity check: the id must be the digest of the payload and the
    /// payload must fit the size cap. Deserialized items carry an untrusted
    /// id, so this runs before the body is trusted anywhere.
    pub fn verify(&self) -> NodeResult<()> {
        if self.payload.len() > MAX_ITEM_BYTES {
            return Err(NodeError::Election(format!(
                "item payload exceeds {MAX_ITEM_BYTES} bytes"
            )));
        }
        if ItemId::from_payload(&self.payload) != self.id {
            return Err(NodeError::Election(
                "item id does not match payload digest".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    PendingPositive,
    PendingNegative,
    Approved,
    Declined,
    Revoked,
    Undefined,
}

impl ItemState {
    /// Terminal states are the only ones the ledger persists.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Approved | ItemState::Declined | ItemState::Revoked
        )
    }
}

/// Finalized (or in-flight) state of an item. Persisted only when terminal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateRecord {
    pub item_id: ItemId,
    pub state: ItemState,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

impl StateRecord {
    pub fn pending(item_id: ItemId) -> Self {
        Self {
            item_id,
            state: ItemState::Pending,
            created_at: current_timestamp(),
            expires_at: None,
        }
    }
}

/// Read-only snapshot returned from the kernel. `have_copy` signals whether
/// the responding node can currently furnish the item body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemResult {
    pub state: ItemState,
    pub have_copy: bool,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

impl ItemResult {
    pub fn new(record: &StateRecord, have_copy: bool) -> Self {
        Self {
            state: record.state,
            have_copy,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// Returned only to the local client that submitted the item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemInfo {
    pub result: ItemResult,
    pub item: Item,
}

/// Peer-to-peer check query: the caller's current view of an item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckQuery {
    pub item_id: ItemId,
    pub state: Option<ItemState>,
    pub have_copy: bool,
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_is_payload_digest() {
        let item = Item::new(b"accord test item".to_vec());
        assert_eq!(item.id(), &ItemId::from_payload(b"accord test item"));
        item.verify().unwrap();
    }

    #[test]
    fn item_id_hex_round_trip() {
        let id = ItemId::from_payload(b"round trip");
        let decoded = ItemId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn item_id_rejects_bad_encoding() {
        assert!(matches!(
            ItemId::from_hex("not hex"),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            ItemId::from_hex("ff00"),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn tampered_item_fails_verification() {
        let honest = Item::new(b"payload".to_vec());
        let forged: Item = serde_json::from_str(&format!(
            "{{\"id\":\"{}\",\"payload\":\"{}\"}}",
            honest.id(),
            hex::encode(b"other payload")
        ))
        .unwrap();
        assert!(matches!(forged.verify(), Err(NodeError::Election(_))));
    }

    #[test]
    fn oversized_item_fails_verification() {
        let item = Item::new(vec![0u8; MAX_ITEM_BYTES + 1]);
        assert!(matches!(item.verify(), Err(NodeError::Election(_))));
    }

    #[test]
    fn terminal_states() {
        assert!(ItemState::Approved.is_terminal());
        assert!(ItemState::Declined.is_terminal());
        assert!(ItemState::Revoked.is_terminal());
        assert!(!ItemState::Pending.is_terminal());
        assert!(!ItemState::PendingPositive.is_terminal());
        assert!(!ItemState::PendingNegative.is_terminal());
        assert!(!ItemState::Undefined.is_terminal());
    }
}
