//! Persistence contracts for account metadata and nonce replay prevention.
//!
//! The inventory stores opaque per-principal records so that pins, tags,
//! and instance metadata survive restarts; the core treats the payload as a
//! blob. Nonces belong to the protocol layer and reach the core only as the
//! `NonceReused` error.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Error, PrincipalId, Result};

/// Inventory resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Module,
    Instance,
}

/// Per-principal, per-resource blob store.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn put(
        &self,
        pri: &PrincipalId,
        kind: ResourceKind,
        id: &str,
        blob: Vec<u8>,
    ) -> Result<()>;

    async fn get(&self, pri: &PrincipalId, kind: ResourceKind, id: &str)
        -> Result<Option<Vec<u8>>>;

    async fn delete(&self, pri: &PrincipalId, kind: ResourceKind, id: &str) -> Result<()>;

    /// Resource ids of one class owned by one principal.
    async fn list(&self, pri: &PrincipalId, kind: ResourceKind) -> Result<Vec<String>>;
}

/// In-memory inventory, the construction default.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    records: Mutex<HashMap<(PrincipalId, ResourceKind, String), Vec<u8>>>,
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn put(
        &self,
        pri: &PrincipalId,
        kind: ResourceKind,
        id: &str,
        blob: Vec<u8>,
    ) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((pri.clone(), kind, id.to_string()), blob);
        Ok(())
    }

    async fn get(
        &self,
        pri: &PrincipalId,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(pri.clone(), kind, id.to_string()))
            .cloned())
    }

    async fn delete(&self, pri: &PrincipalId, kind: ResourceKind, id: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(pri.clone(), kind, id.to_string()));
        Ok(())
    }

    async fn list(&self, pri: &PrincipalId, kind: ResourceKind) -> Result<Vec<String>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(p, k, _)| p == pri && *k == kind)
            .map(|(_, _, id)| id.clone())
            .collect())
    }
}

/// Replay prevention: a (scope, nonce) pair may be used once within its
/// expiry window.
#[async_trait]
pub trait NonceChecker: Send + Sync {
    async fn check_nonce(&self, scope: &str, nonce: &str, expiry: Duration) -> Result<()>;
}

/// In-memory nonce store. Expiry is not enforced by time here; entries live
/// for the process lifetime, which is strictly stricter than any window.
#[derive(Debug, Default)]
pub struct MemoryNonceChecker {
    seen: Mutex<HashSet<(String, String)>>,
}

#[async_trait]
impl NonceChecker for MemoryNonceChecker {
    async fn check_nonce(&self, scope: &str, nonce: &str, _expiry: Duration) -> Result<()> {
        let inserted = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((scope.to_string(), nonce.to_string()));
        if inserted {
            Ok(())
        } else {
            Err(Error::NonceReused)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inventory_scoped_by_principal() {
        let inv = MemoryInventory::default();
        let alice = PrincipalId::local("alice");
        let bob = PrincipalId::local("bob");

        inv.put(&alice, ResourceKind::Module, "m1", vec![1])
            .await
            .unwrap();
        assert_eq!(
            inv.get(&alice, ResourceKind::Module, "m1").await.unwrap(),
            Some(vec![1])
        );
        assert_eq!(inv.get(&bob, ResourceKind::Module, "m1").await.unwrap(), None);
        assert!(inv.list(&bob, ResourceKind::Module).await.unwrap().is_empty());

        inv.delete(&alice, ResourceKind::Module, "m1").await.unwrap();
        assert_eq!(inv.get(&alice, ResourceKind::Module, "m1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nonce_reuse_rejected() {
        let nonces = MemoryNonceChecker::default();
        let window = Duration::from_secs(60);
        nonces.check_nonce("s", "n1", window).await.unwrap();
        assert!(matches!(
            nonces.check_nonce("s", "n1", window).await,
            Err(Error::NonceReused)
        ));
        nonces.check_nonce("other", "n1", window).await.unwrap();
    }
}
