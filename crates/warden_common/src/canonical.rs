//! Canonical serialization shared by everything that is hashed or signed
//!
//! Canonical form = compact JSON with object keys sorted at every level.
//! `serde_json::Value` keeps maps ordered by key, so a round-trip through
//! `Value` fixes the ordering independently of struct field order.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonical bytes of any serializable value
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Canonical bytes with the named top-level fields removed
pub fn canonical_json_without<T: Serialize>(value: &T, excluded: &[&str]) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(value)?;
    if let Some(map) = value.as_object_mut() {
        for field in excluded {
            map.remove(*field);
        }
    }
    Ok(serde_json::to_vec(&value)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}
