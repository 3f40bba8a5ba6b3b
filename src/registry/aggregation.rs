//! Node Aggregation Engine
//!
//! Folds raw (address, source, version) observations into one entry per
//! address. Within an entry each contributing source appears once, carrying
//! its highest observed version, and sources are ordered by id.

use crate::domain::ports::{NodeFilter, NodeObservation, NodeQuery, SourceId, StorageRef};
use crate::error::{Error, Result};
use crate::net::NodeAddress;
use crate::registry::pagination::Paginated;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One source's contribution to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSourceEntry {
    pub source_id: SourceId,
    pub version: i64,
    pub last_execution: DateTime<Utc>,
}

/// A node with every source that reported it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedNode {
    pub ip_addr: NodeAddress,
    pub sources: Vec<NodeSourceEntry>,
}

/// Group observation rows into entries sorted by address
///
/// Input order does not matter.
pub fn group_rows<I>(rows: I) -> Vec<AggregatedNode>
where
    I: IntoIterator<Item = NodeObservation>,
{
    let mut groups: BTreeMap<NodeAddress, BTreeMap<SourceId, NodeSourceEntry>> = BTreeMap::new();

    for row in rows {
        let sources = groups.entry(row.address).or_default();
        let candidate = NodeSourceEntry {
            source_id: row.source_id,
            version: row.version,
            last_execution: row.observed_at,
        };
        match sources.get(&row.source_id) {
            Some(existing) if existing.version >= row.version => {}
            _ => {
                sources.insert(row.source_id, candidate);
            }
        }
    }

    groups
        .into_iter()
        .map(|(ip_addr, sources)| AggregatedNode {
            ip_addr,
            sources: sources.into_values().collect(),
        })
        .collect()
}

/// Parse an `after` cursor; the empty string means "from the start"
pub fn parse_cursor(raw: &str) -> Result<Option<NodeAddress>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    NodeAddress::parse(raw)
        .map(Some)
        .map_err(|_| Error::InvalidCursor {
            value: raw.to_string(),
        })
}

/// Read-side query engine over the node registry
pub struct NodeAggregator {
    storage: StorageRef,
}

impl NodeAggregator {
    pub fn new(storage: StorageRef) -> Arc<Self> {
        Arc::new(Self { storage })
    }

    /// One page of aggregated nodes strictly after `cursor`
    pub async fn query(
        &self,
        filter: NodeFilter,
        cursor: Option<NodeAddress>,
        limit: usize,
    ) -> Result<Paginated<AggregatedNode>> {
        if limit == 0 {
            return Err(Error::Validation("limit must be at least 1".into()));
        }

        match filter {
            NodeFilter::All => {}
            NodeFilter::Source(id) => {
                self.storage.get_source(id).await?;
            }
            NodeFilter::InsideAllowlist(id) | NodeFilter::OutsideAllowlist(id) => {
                self.storage.get_allowlist(id).await?;
            }
        }

        let rows = self
            .storage
            .list_nodes(&NodeQuery {
                filter,
                after: cursor,
                limit,
            })
            .await?;
        let row_count = rows.len();
        let entries = group_rows(rows);

        debug!(
            ?filter,
            rows = row_count,
            entries = entries.len(),
            "Aggregated node page"
        );
        Ok(Paginated::from_page(entries, limit, |e| e.ip_addr.to_string()))
    }
}
