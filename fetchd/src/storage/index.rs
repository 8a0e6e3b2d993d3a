//! In-memory index of download records.
//!
//! A pure cache over the record log: both lookup tables live behind one
//! lock so an upsert or removal lands in the id table and the owner table
//! atomically. The index performs no I/O; callers mirror every mutation to
//! the [`super::RecordLog`].

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::DownloadRecord;

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, DownloadRecord>,
    by_owner: HashMap<String, Vec<DownloadRecord>>,
}

/// Concurrent lookup of records by id and by owner.
#[derive(Default)]
pub struct RecordIndex {
    tables: RwLock<Tables>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from replayed records.
    pub fn from_records(records: impl IntoIterator<Item = DownloadRecord>) -> Self {
        let index = Self::new();
        for record in records {
            index.upsert(record);
        }
        index
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.tables.read().by_id.get(id).cloned()
    }

    /// Records belonging to the owner. Order is unspecified; callers sort
    /// by `created_at` when ordering matters.
    pub fn owner_records(&self, owner: &str) -> Vec<DownloadRecord> {
        self.tables
            .read()
            .by_owner
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_records(&self) -> Vec<DownloadRecord> {
        self.tables.read().by_id.values().cloned().collect()
    }

    /// Insert or replace a record in both tables.
    pub fn upsert(&self, record: DownloadRecord) {
        let mut tables = self.tables.write();
        {
            let list = tables
                .by_owner
                .entry(record.owner_username.clone())
                .or_default();
            match list.iter_mut().find(|r| r.id == record.id) {
                Some(slot) => *slot = record.clone(),
                None => list.push(record.clone()),
            }
        }
        tables.by_id.insert(record.id.clone(), record);
    }

    /// Remove a record from both tables.
    pub fn remove(&self, record: &DownloadRecord) {
        let mut tables = self.tables.write();
        tables.by_id.remove(&record.id);
        let emptied = match tables.by_owner.get_mut(&record.owner_username) {
            Some(list) => {
                list.retain(|r| r.id != record.id);
                list.is_empty()
            }
            None => false,
        };
        if emptied {
            tables.by_owner.remove(&record.owner_username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownloadStatus;

    fn record(id: &str, owner: &str) -> DownloadRecord {
        DownloadRecord::new(
            id.to_string(),
            format!("{id}.bin"),
            String::new(),
            format!("http://example.com/{id}"),
            owner.to_string(),
            -1,
        )
    }

    #[test]
    fn test_upsert_and_get() {
        let index = RecordIndex::new();
        index.upsert(record("a", "alice"));

        assert!(index.get("a").is_some());
        assert!(index.get("b").is_none());
    }

    #[test]
    fn test_upsert_replaces_in_owner_list() {
        let index = RecordIndex::new();
        let original = record("a", "alice");
        index.upsert(original.clone());
        index.upsert(original.with_status(DownloadStatus::Paused));

        let records = index.owner_records("alice");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DownloadStatus::Paused);
        assert_eq!(index.get("a").unwrap().status, DownloadStatus::Paused);
    }

    #[test]
    fn test_upsert_appends_new_records() {
        let index = RecordIndex::new();
        index.upsert(record("a", "alice"));
        index.upsert(record("b", "alice"));
        index.upsert(record("c", "bob"));

        assert_eq!(index.owner_records("alice").len(), 2);
        assert_eq!(index.owner_records("bob").len(), 1);
        assert!(index.owner_records("carol").is_empty());
    }

    #[test]
    fn test_remove_clears_both_tables() {
        let index = RecordIndex::new();
        let a = record("a", "alice");
        index.upsert(a.clone());
        index.upsert(record("b", "alice"));

        index.remove(&a);

        assert!(index.get("a").is_none());
        let remaining = index.owner_records("alice");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "b");
    }

    #[test]
    fn test_from_records_rebuilds_tables() {
        let index = RecordIndex::from_records(vec![record("a", "alice"), record("b", "bob")]);
        assert_eq!(index.all_records().len(), 2);
        assert_eq!(index.owner_records("alice").len(), 1);
    }
}
