//! Prepaid package persistence: atomic decrement of `remaining_sessions`
//! on session completion.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::package::Package;
use crate::{Error, Result};

/// Durable persistence of prepaid packages with an atomic consume op —
/// the store-layer analogue of `UPDATE packages SET remaining_sessions =
/// remaining_sessions - 1 WHERE id = :id AND remaining_sessions > 0`.
#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn get(&self, id: i64) -> Option<Package>;

    /// Decrement `remaining_sessions` by one. Returns the updated
    /// package, or [`Error::Conflict`] if already exhausted — never goes
    /// negative.
    async fn consume_one(&self, id: i64) -> Result<Package>;
}

#[derive(Default)]
pub struct InMemoryPackageStore {
    packages: RwLock<HashMap<i64, Package>>,
}

impl InMemoryPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, package: Package) {
        self.packages.write().await.insert(package.id, package);
    }
}

#[async_trait]
impl PackageStore for InMemoryPackageStore {
    async fn get(&self, id: i64) -> Option<Package> {
        self.packages.read().await.get(&id).cloned()
    }

    async fn consume_one(&self, id: i64) -> Result<Package> {
        let mut packages = self.packages.write().await;
        let package = packages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("package {id}")))?;

        if !package.consume_one() {
            return Err(Error::Conflict(format!("package {id} has no remaining sessions")));
        }
        Ok(package.clone())
    }
}
