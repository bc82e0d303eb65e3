//! Catalog keys and their canonical encoding.

use serde::Serialize;
use thiserror::Error;

/// Identity of a cacheable resource.
///
/// `encode` must be a total, deterministic and injective function of every
/// field that distinguishes one resource from another: two keys that encode
/// to the same string share one catalog entry, and keys that differ in any
/// such field must encode differently.
pub trait CatalogKey: Clone + Send + Sync {
    fn encode(&self) -> String;
}

/// Plain strings are already canonical.
impl CatalogKey for String {
    fn encode(&self) -> String {
        self.clone()
    }
}

/// Canonical JSON for a serializable key.
///
/// Struct fields serialize in declaration order and strings are escaped,
/// so nested encodings embedded as strings stay unambiguous. Fails only
/// for types that serde_json cannot represent (non-string map keys or a
/// custom `Serialize` error).
pub fn encode_json<T>(key: &T) -> Result<String, KeyError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_string(key).map_err(|e| KeyError::Encoding(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("angle must be finite")]
    NonFiniteAngle,
    #[error("key could not be encoded: {0}")]
    Encoding(String),
    #[error("malformed key encoding: {0}")]
    Malformed(String),
}
