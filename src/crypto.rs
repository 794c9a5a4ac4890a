use std::fs;
use std::io;
use std::path::Path;

use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{NodeError, NodeResult};
use crate::types::NodeId;

/// Durable node identity: an Ed25519 keypair plus the address derived from
/// its public key. The identity file stores only the secret key; the public
/// half and the address are re-derived on every load, so the three can
/// never disagree.
pub struct NodeIdentity {
    keypair: Keypair,
    address: NodeId,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret_key: String,
}

impl NodeIdentity {
    /// Loads the identity at `path`, generating and persisting a fresh one
    /// when none exists yet.
    pub fn open(path: &Path) -> NodeResult<Self> {
        let keypair = match fs::read_to_string(path) {
            Ok(raw) => decode_keypair(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let keypair = Keypair::generate(&mut OsRng);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, encode_keypair(&keypair)?)?;
                let identity = Self::from_keypair(keypair);
                info!(address = %identity.address, ?path, "generated fresh node identity");
                return Ok(identity);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self::from_keypair(keypair))
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let address = hex::encode(payload_digest(keypair.public.as_bytes()));
        Self { keypair, address }
    }

    pub fn address(&self) -> &NodeId {
        &self.address
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

fn decode_keypair(raw: &str) -> NodeResult<Keypair> {
    let stored: StoredIdentity = toml::from_str(raw)
        .map_err(|err| NodeError::Config(format!("failed to decode identity: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| NodeError::Config(format!("invalid secret key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| NodeError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from(&secret);
    Ok(Keypair { secret, public })
}

fn encode_keypair(keypair: &Keypair) -> NodeResult<String> {
    let stored = StoredIdentity {
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    toml::to_string_pretty(&stored)
        .map_err(|err| NodeError::Config(format!("failed to encode identity: {err}")))
}

/// BLAKE2s-256 digest used for item ids and node addresses.
pub fn payload_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(data);
    hasher.finalize().into()
}
