//! Allowlist Service
//!
//! Named CIDR lists used to include or exclude nodes from registry queries.

use crate::domain::ports::{Allowlist, AllowlistEntry, AllowlistId, EntryId, StorageRef};
use crate::error::{Error, Result};
use crate::net::Cidr;
use std::sync::Arc;
use tracing::info;

pub struct AllowlistService {
    storage: StorageRef,
}

impl AllowlistService {
    pub fn new(storage: StorageRef) -> Arc<Self> {
        Arc::new(Self { storage })
    }

    pub async fn create(&self, name: &str) -> Result<Allowlist> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("allowlist name must not be empty".into()));
        }
        let list = self.storage.create_allowlist(name).await?;
        info!(allowlist_id = %list.id, name = %list.name, "Created allowlist");
        Ok(list)
    }

    pub async fn get(&self, id: AllowlistId) -> Result<Allowlist> {
        self.storage.get_allowlist(id).await
    }

    pub async fn list(&self, after: Option<AllowlistId>, limit: usize) -> Result<Vec<Allowlist>> {
        self.storage.list_allowlists(after, limit).await
    }

    /// Delete a list and all of its entries
    pub async fn delete(&self, id: AllowlistId) -> Result<()> {
        self.storage.delete_allowlist(id).await?;
        info!(allowlist_id = %id, "Deleted allowlist");
        Ok(())
    }

    /// Add a `<addr>/<bits>` prefix to a list
    pub async fn add_entry(&self, list_id: AllowlistId, cidr: &str) -> Result<AllowlistEntry> {
        let cidr = Cidr::parse(cidr)?;
        let entry = self.storage.add_allowlist_entry(list_id, cidr).await?;
        info!(allowlist_id = %list_id, entry_id = %entry.id, cidr = %entry.cidr, "Added allowlist entry");
        Ok(entry)
    }

    pub async fn remove_entry(&self, list_id: AllowlistId, entry_id: EntryId) -> Result<()> {
        self.storage.remove_allowlist_entry(list_id, entry_id).await?;
        info!(allowlist_id = %list_id, entry_id = %entry_id, "Removed allowlist entry");
        Ok(())
    }

    pub async fn entries(&self, list_id: AllowlistId) -> Result<Vec<AllowlistEntry>> {
        self.storage.list_allowlist_entries(list_id).await
    }
}
