//! In-memory [`TableStore`] used by tests.
//!
//! Mirrors the remote store's filter semantics closely enough that component
//! tests exercise real query paths: `eq` is JSON equality, `gte` compares
//! RFC 3339 timestamps as instants and numbers numerically. `set_failing`
//! makes every call return a backend error so failure postures can be tested.

use super::{Comparison, Condition, Filter, Record, Sort, StoreError, TableStore};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct InMemoryTableStore {
    tables: Arc<Mutex<HashMap<String, Vec<Record>>>>,
    failing: Arc<AtomicBool>,
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        // Timestamps compare as instants, not byte-wise, so differing
        // offsets and fractional digits still order correctly.
        if let (Ok(lt), Ok(rt)) = (
            DateTime::parse_from_rfc3339(l),
            DateTime::parse_from_rfc3339(r),
        ) {
            return Some(lt.cmp(&rt));
        }
        return Some(l.cmp(r));
    }
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r);
    }
    None
}

fn matches(record: &Record, condition: &Condition) -> bool {
    let Some(value) = record.fields.get(&condition.field) else {
        return false;
    };
    match condition.comparison {
        Comparison::Eq => value == &condition.value,
        Comparison::Gte => {
            compare_values(value, &condition.value).is_some_and(|ord| ord != Ordering::Less)
        }
    }
}

impl InMemoryTableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Snapshot of a table's records in insertion order. Test helper.
    #[must_use]
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.lock()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Record>>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_failing(&self) -> Result<(), StoreError> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Backend {
                status: 503,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn list(
        &self,
        table: &str,
        filter: Option<&Filter>,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        self.check_failing()?;

        let mut records: Vec<Record> = self
            .lock()
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| {
                        filter.is_none_or(|f| f.conditions().iter().all(|c| matches(record, c)))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = sort {
            records.sort_by(|a, b| {
                let ordering = match (a.fields.get(&sort.field), b.fields.get(&sort.field)) {
                    (Some(left), Some(right)) => {
                        compare_values(left, right).unwrap_or(Ordering::Equal)
                    }
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(limit) = limit {
            records.truncate(limit);
        }

        Ok(records)
    }

    async fn create(&self, table: &str, fields: Value) -> Result<String, StoreError> {
        self.check_failing()?;

        let id = Uuid::now_v7().to_string();
        self.lock().entry(table.to_string()).or_default().push(Record {
            id: id.clone(),
            fields,
        });
        Ok(id)
    }

    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        self.check_failing()?;

        let mut tables = self.lock();
        let record = tables
            .get_mut(table)
            .and_then(|records| records.iter_mut().find(|record| record.id == id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;

        match (&mut record.fields, fields) {
            (Value::Object(existing), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    existing.insert(key, value);
                }
            }
            (slot, incoming) => *slot = incoming,
        }
        Ok(())
    }
}
