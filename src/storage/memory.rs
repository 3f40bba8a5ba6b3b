//! In-Memory Storage
//!
//! Process-local store using DashMap for source rows (per-row atomic
//! conditional updates) and ordered maps for nodes and allowlists.

use crate::domain::ports::{
    Allowlist, AllowlistEntry, AllowlistId, BatchFailure, BatchOutcome, EntryId, NewSource,
    NodeFilter, NodeObservation, NodeQuery, Source, SourceId, Storage,
};
use crate::error::{Error, Result};
use crate::net::{Cidr, NodeAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};

// =============================================================================
// Allowlist Tables
// =============================================================================

#[derive(Debug, Default)]
struct AllowlistTables {
    lists: BTreeMap<AllowlistId, Allowlist>,
    entries: BTreeMap<EntryId, AllowlistEntry>,
    next_list_id: i64,
    next_entry_id: i64,
}

impl AllowlistTables {
    fn cidrs_of(&self, list_id: AllowlistId) -> Result<Vec<Cidr>> {
        if !self.lists.contains_key(&list_id) {
            return Err(Error::not_found("Allowlist", list_id));
        }
        Ok(self
            .entries
            .values()
            .filter(|e| e.allowlist_id == list_id)
            .map(|e| e.cidr)
            .collect())
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory `Storage` backend
pub struct MemoryStore {
    /// Source rows by id
    sources: DashMap<SourceId, Source>,
    /// Unique name index
    source_names: DashMap<String, SourceId>,
    next_source_id: AtomicI64,
    allowlists: RwLock<AllowlistTables>,
    /// Observations grouped by address, each group ordered by (source, version)
    nodes: RwLock<BTreeMap<NodeAddress, Vec<NodeObservation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
            source_names: DashMap::new(),
            next_source_id: AtomicI64::new(1),
            allowlists: RwLock::new(AllowlistTables::default()),
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Total number of stored observation rows
    pub fn observation_count(&self) -> usize {
        self.nodes.read().values().map(Vec::len).sum()
    }

    fn update_source<F>(&self, id: SourceId, f: F) -> Result<Source>
    where
        F: FnOnce(&mut Source) -> Result<()>,
    {
        let mut entry = self
            .sources
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Source", id))?;
        f(entry.value_mut())?;
        Ok(entry.value().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_source(&self, source: NewSource) -> Result<Source> {
        match self.source_names.entry(source.name.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists("Source", source.name)),
            Entry::Vacant(slot) => {
                let id = SourceId(self.next_source_id.fetch_add(1, Ordering::Relaxed));
                let row = Source {
                    id,
                    name: source.name,
                    url: source.url,
                    period: source.period,
                    last_execution: None,
                    version: 0,
                    enabled: source.enabled,
                };
                self.sources.insert(id, row.clone());
                slot.insert(id);
                Ok(row)
            }
        }
    }

    async fn get_source(&self, id: SourceId) -> Result<Source> {
        self.sources
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::not_found("Source", id))
    }

    async fn list_sources(&self, after: Option<SourceId>, limit: usize) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .sources
            .iter()
            .filter(|r| after.map_or(true, |a| *r.key() > a))
            .map(|r| r.value().clone())
            .collect();
        sources.sort_by_key(|s| s.id);
        sources.truncate(limit);
        Ok(sources)
    }

    async fn list_eligible_sources(&self, now: DateTime<Utc>) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .sources
            .iter()
            .filter(|r| r.value().is_eligible(now))
            .map(|r| r.value().clone())
            .collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }

    async fn prepare_execution(&self, id: SourceId, now: DateTime<Utc>) -> Result<Source> {
        // The shard write lock held by get_mut makes check-and-set atomic
        self.update_source(id, |source| {
            if !source.is_eligible(now) {
                return Err(Error::ExecutionNotEligible { source_id: id.0 });
            }
            source.last_execution = Some(now);
            source.version += 1;
            Ok(())
        })
    }

    async fn start_source(&self, id: SourceId) -> Result<Source> {
        self.update_source(id, |source| {
            source.enabled = true;
            Ok(())
        })
    }

    async fn stop_source(&self, id: SourceId) -> Result<Source> {
        self.update_source(id, |source| {
            source.enabled = false;
            source.version += 1;
            Ok(())
        })
    }

    async fn batch_insert_nodes(&self, rows: Vec<NodeObservation>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut nodes = self.nodes.write();

        for (index, row) in rows.into_iter().enumerate() {
            if !self.sources.contains_key(&row.source_id) {
                outcome.failures.push(BatchFailure {
                    index,
                    error: Error::not_found("Source", row.source_id),
                });
                continue;
            }

            let group = nodes.entry(row.address).or_default();
            match group.binary_search_by_key(&(row.source_id, row.version), |o| {
                (o.source_id, o.version)
            }) {
                Ok(_) => outcome.failures.push(BatchFailure {
                    index,
                    error: Error::DuplicateObservation {
                        address: row.address.to_string(),
                        source_id: row.source_id.0,
                        version: row.version,
                    },
                }),
                Err(pos) => {
                    group.insert(pos, row);
                    outcome.inserted += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn list_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeObservation>> {
        let (cidrs, invert) = match query.filter {
            NodeFilter::InsideAllowlist(id) => (Some(self.allowlists.read().cidrs_of(id)?), false),
            NodeFilter::OutsideAllowlist(id) => (Some(self.allowlists.read().cidrs_of(id)?), true),
            NodeFilter::All | NodeFilter::Source(_) => (None, false),
        };
        let source_filter = match query.filter {
            NodeFilter::Source(id) => Some(id),
            _ => None,
        };

        let nodes = self.nodes.read();
        let lower = match query.after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };

        let mut rows = Vec::new();
        let mut addresses = 0;
        for (address, group) in nodes.range((lower, Bound::Unbounded)) {
            if addresses >= query.limit {
                break;
            }

            if let Some(cidrs) = &cidrs {
                let inside = cidrs.iter().any(|c| c.contains(address));
                if inside == invert {
                    continue;
                }
            }

            let before = rows.len();
            rows.extend(
                group
                    .iter()
                    .filter(|o| source_filter.map_or(true, |id| o.source_id == id))
                    .cloned(),
            );
            if rows.len() > before {
                addresses += 1;
            }
        }

        Ok(rows)
    }

    async fn create_allowlist(&self, name: &str) -> Result<Allowlist> {
        let mut tables = self.allowlists.write();
        if tables.lists.values().any(|l| l.name == name) {
            return Err(Error::already_exists("Allowlist", name));
        }
        tables.next_list_id += 1;
        let list = Allowlist {
            id: AllowlistId(tables.next_list_id),
            name: name.to_string(),
        };
        tables.lists.insert(list.id, list.clone());
        Ok(list)
    }

    async fn get_allowlist(&self, id: AllowlistId) -> Result<Allowlist> {
        self.allowlists
            .read()
            .lists
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Allowlist", id))
    }

    async fn list_allowlists(&self, after: Option<AllowlistId>, limit: usize) -> Result<Vec<Allowlist>> {
        let tables = self.allowlists.read();
        let lower = match after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        Ok(tables
            .lists
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn delete_allowlist(&self, id: AllowlistId) -> Result<()> {
        let mut tables = self.allowlists.write();
        if tables.lists.remove(&id).is_none() {
            return Err(Error::not_found("Allowlist", id));
        }
        tables.entries.retain(|_, e| e.allowlist_id != id);
        Ok(())
    }

    async fn add_allowlist_entry(&self, list_id: AllowlistId, cidr: Cidr) -> Result<AllowlistEntry> {
        let mut tables = self.allowlists.write();
        if !tables.lists.contains_key(&list_id) {
            return Err(Error::not_found("Allowlist", list_id));
        }
        tables.next_entry_id += 1;
        let entry = AllowlistEntry {
            id: EntryId(tables.next_entry_id),
            cidr,
            allowlist_id: list_id,
        };
        tables.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn remove_allowlist_entry(&self, list_id: AllowlistId, entry_id: EntryId) -> Result<()> {
        let mut tables = self.allowlists.write();
        match tables.entries.get(&entry_id) {
            Some(entry) if entry.allowlist_id == list_id => {
                tables.entries.remove(&entry_id);
                Ok(())
            }
            _ => Err(Error::not_found("Allowlist entry", entry_id)),
        }
    }

    async fn list_allowlist_entries(&self, list_id: AllowlistId) -> Result<Vec<AllowlistEntry>> {
        let tables = self.allowlists.read();
        if !tables.lists.contains_key(&list_id) {
            return Err(Error::not_found("Allowlist", list_id));
        }
        Ok(tables
            .entries
            .values()
            .filter(|e| e.allowlist_id == list_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract_tests;

    #[tokio::test]
    async fn test_memory_store_contract() {
        contract_tests::run_all(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_observation_count() {
        let store = MemoryStore::new();
        let source = store
            .create_source(contract_tests::new_source("feed"))
            .await
            .unwrap();
        let now = Utc::now();
        let rows = ["1.2.3.4", "5.6.7.8"]
            .iter()
            .map(|a| NodeObservation {
                address: NodeAddress::parse(a).unwrap(),
                source_id: source.id,
                version: 1,
                observed_at: now,
            })
            .collect();
        store.batch_insert_nodes(rows).await.unwrap();
        assert_eq!(store.observation_count(), 2);
    }
}
