//! Per-table item collections kept by a client installation.
//!
//! Items are ordered oldest first. Upserts replace in place, so a
//! re-delivered record never grows a collection.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::cdcrelay::record::{Action, ChangeRecord};
use crate::cdcrelay::types::TableName;

/// Key field used for tables without a configured natural key
pub const DEFAULT_NATURAL_KEY: &str = "id";

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: String,
    pub value: Map<String, Value>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub upserted: usize,
    pub deleted: usize,
    pub evicted: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct BoundedItemStore {
    cap: usize,
    natural_keys: HashMap<TableName, String>,
    tables: HashMap<TableName, Vec<Item>>,
}

impl BoundedItemStore {
    pub fn new(cap: usize, natural_keys: HashMap<TableName, String>) -> Self {
        Self {
            cap,
            natural_keys,
            tables: HashMap::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn natural_key_field(&self, table: &str) -> &str {
        self.natural_keys
            .get(table)
            .map(String::as_str)
            .unwrap_or(DEFAULT_NATURAL_KEY)
    }

    /// Apply one table's records in order, then evict the oldest items
    /// beyond the cap.
    pub fn apply(&mut self, table: &str, records: &[ChangeRecord]) -> ApplyReport {
        let key_field = self.natural_key_field(table).to_string();
        let items = self.tables.entry(table.to_string()).or_default();
        let mut report = ApplyReport::default();

        for record in records {
            let Some(key) = record.natural_key(&key_field) else {
                warn!("Skipping {} record without natural key `{}`", table, key_field);
                report.skipped += 1;
                continue;
            };

            let position = items.iter().position(|item| item.key == key);
            match (record.action, position) {
                (Action::Insert | Action::Update, Some(index)) => {
                    // Position is kept, so eviction follows first-seen order, not last update
                    items[index].value = record.record.clone();
                    report.upserted += 1;
                }
                (Action::Insert | Action::Update, None) => {
                    items.push(Item {
                        key,
                        value: record.record.clone(),
                    });
                    report.upserted += 1;
                }
                (Action::Delete, Some(index)) => {
                    items.remove(index);
                    report.deleted += 1;
                }
                (Action::Delete, None) => {
                    debug!("Delete for absent {} key {}", table, key);
                }
            }
        }

        if items.len() > self.cap {
            let excess = items.len() - self.cap;
            items.drain(..excess);
            report.evicted = excess;
            debug!("Evicted {} oldest {} items", excess, table);
        }

        report
    }

    pub fn items(&self, table: &str) -> &[Item] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, table: &str) -> usize {
        self.items(table).len()
    }

    /// Item values per table, oldest first
    pub fn snapshot(&self) -> BTreeMap<TableName, Vec<Map<String, Value>>> {
        self.tables
            .iter()
            .map(|(table, items)| (table.clone(), items.iter().map(|item| item.value.clone()).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(action: Action, value: Value) -> ChangeRecord {
        let Value::Object(map) = value else { panic!("record must be an object") };
        ChangeRecord::new(action, "trades", map)
    }

    fn store(cap: usize) -> BoundedItemStore {
        BoundedItemStore::new(cap, HashMap::from([("trades".to_string(), "symbol".to_string())]))
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut items = store(10);
        items.apply("trades", &[
            record(Action::Insert, json!({"symbol": "AAPL", "price": 1})),
            record(Action::Insert, json!({"symbol": "MSFT", "price": 2})),
        ]);
        let report = items.apply("trades", &[record(Action::Update, json!({"symbol": "AAPL", "price": 3}))]);

        assert_eq!(report.upserted, 1);
        assert_eq!(items.len("trades"), 2);
        assert_eq!(items.items("trades")[0].key, "AAPL");
        assert_eq!(items.items("trades")[0].value["price"], json!(3));
    }

    #[test]
    fn delete_of_absent_key_is_noop() {
        let mut items = store(10);
        items.apply("trades", &[record(Action::Insert, json!({"symbol": "AAPL"}))]);
        let report = items.apply("trades", &[
            record(Action::Delete, json!({"symbol": "TSLA"})),
            record(Action::Delete, json!({"symbol": "AAPL"})),
        ]);
        assert_eq!(report.deleted, 1);
        assert_eq!(items.len("trades"), 0);
    }

    #[test]
    fn oldest_items_are_evicted_first() {
        let mut items = store(2);
        let report = items.apply("trades", &[
            record(Action::Insert, json!({"symbol": "A"})),
            record(Action::Insert, json!({"symbol": "B"})),
            record(Action::Insert, json!({"symbol": "C"})),
        ]);
        assert_eq!(report.evicted, 1);
        let keys: Vec<&str> = items.items("trades").iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "C"]);
    }

    #[test]
    fn updated_item_keeps_its_eviction_slot() {
        let mut items = store(2);
        items.apply("trades", &[
            record(Action::Insert, json!({"symbol": "A", "price": 1})),
            record(Action::Insert, json!({"symbol": "B", "price": 1})),
            record(Action::Update, json!({"symbol": "A", "price": 2})),
        ]);
        let report = items.apply("trades", &[record(Action::Insert, json!({"symbol": "C"}))]);

        assert_eq!(report.evicted, 1);
        let keys: Vec<&str> = items.items("trades").iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "C"]);
    }

    #[test]
    fn numeric_ids_are_the_default_key() {
        let mut items = BoundedItemStore::new(5, HashMap::new());
        let Value::Object(map) = json!({"id": 7, "title": "x"}) else { unreachable!() };
        items.apply("rss_items", &[ChangeRecord::new(Action::Insert, "rss_items", map.clone())]);
        items.apply("rss_items", &[ChangeRecord::new(Action::Update, "rss_items", map)]);
        assert_eq!(items.len("rss_items"), 1);
        assert_eq!(items.items("rss_items")[0].key, "7");
    }

    #[test]
    fn records_without_key_are_skipped() {
        let mut items = store(5);
        let report = items.apply("trades", &[record(Action::Insert, json!({"price": 1}))]);
        assert_eq!(report.skipped, 1);
        assert_eq!(items.len("trades"), 0);
    }
}
