use crate::types::PeerId;
use ethereum_types::H256;
use hmac::{Hmac, Mac};
use k256::ecdsa::VerifyingKey;
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(Keccak256::digest(data).as_ref())
}

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak256_concat(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256::from_slice(hasher.finalize().as_ref())
}

pub fn sha256(data: &[u8]) -> H256 {
    H256::from_slice(Sha256::digest(data).as_ref())
}

pub fn hmac_sha256(key: &[u8], input: &[&[u8]], auth_data: &[u8]) -> H256 {
    let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    for part in input {
        hmac.update(part);
    }
    hmac.update(auth_data);
    H256::from_slice(&hmac.finalize().into_bytes())
}

pub fn pk2id(pk: &VerifyingKey) -> PeerId {
    PeerId::from_slice(&pk.to_encoded_point(false).as_bytes()[1..])
}

pub fn id2pk(id: PeerId) -> Result<VerifyingKey, k256::ecdsa::Error> {
    let mut bytes = [4_u8; 65];
    bytes[1..].copy_from_slice(id.as_bytes());
    VerifyingKey::from_sec1_bytes(&bytes)
}

/// Seconds since the unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
