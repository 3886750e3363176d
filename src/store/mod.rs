//! Table-oriented HTTP store access.
//!
//! Operational state (audit events, rate-limit counters, credential records)
//! lives in an external record store exposed over HTTP. [`TableStore`] is the
//! seam: production uses [`http::HttpTableStore`], tests use
//! [`memory::InMemoryTableStore`] with fault injection.

pub mod http;
pub mod memory;

pub use http::HttpTableStore;
pub use memory::InMemoryTableStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Backend { status: u16, body: String },
    #[error("record not found: {table}/{id}")]
    NotFound { table: String, id: String },
    #[error("malformed store response: {0}")]
    Malformed(String),
    #[error("invalid store endpoint: {0}")]
    Endpoint(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gte,
}

impl Comparison {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Gte => "gte",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Condition {
    pub field: String,
    pub comparison: Comparison,
    pub value: Value,
}

/// Conjunction of field conditions. Every condition must hold for a record
/// to match.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            comparison: Comparison::Eq,
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            comparison: Comparison::Gte,
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    #[must_use]
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: false,
        }
    }

    #[must_use]
    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: Value,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// List records from `table`, optionally filtered, sorted, and limited.
    async fn list(
        &self,
        table: &str,
        filter: Option<&Filter>,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Create a record and return its backend-assigned id.
    async fn create(&self, table: &str, fields: Value) -> Result<String, StoreError>;

    /// Merge `fields` into an existing record.
    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<(), StoreError>;
}
