//! Content-addressed object store for FILE evidence (§6 "Evidence storage").
//!
//! The engine never embeds file bytes in Truth rows — it stores a strict
//! pointer and defers ownership/custody to this collaborator.

use async_trait::async_trait;
use flowspec_core::error::Result;
use flowspec_core::models::CompanyId;

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<String>;
    async fn validate_ownership(&self, storage_key: &str, company_id: &CompanyId) -> Result<bool>;
}

/// In-memory fake used by engine tests, substituting a fake repository
/// behind the same trait.
#[derive(Debug, Default)]
pub struct InMemoryEvidenceStore {
    owners: parking_lot::RwLock<std::collections::HashMap<String, CompanyId>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn put(&self, bytes: &[u8]) -> Result<String> {
        let key = format!("mem-{:x}", md5_like(bytes));
        Ok(key)
    }

    async fn validate_ownership(&self, storage_key: &str, company_id: &CompanyId) -> Result<bool> {
        Ok(self
            .owners
            .read()
            .get(storage_key)
            .map(|owner| owner == company_id)
            .unwrap_or(true))
    }
}

/// Cheap non-cryptographic fingerprint so the fake store doesn't need a hash crate dependency.
fn md5_like(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_returns_a_stable_key_for_identical_bytes() {
        let store = InMemoryEvidenceStore::new();
        let a = store.put(b"hello").await.unwrap();
        let b = store.put(b"hello").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unknown_key_defaults_to_owned() {
        let store = InMemoryEvidenceStore::new();
        assert!(store.validate_ownership("nope", &"acme".to_string()).await.unwrap());
    }
}
