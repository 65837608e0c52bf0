use crate::error::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const FIELD_ID: &str = "id";
pub const FIELD_CREATOR_ID: &str = "creator_id";
pub const FIELD_DOCUMENT_ID: &str = "document_id";
pub const FIELD_TEXT_CONTENT: &str = "text_content";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Vector,
    FullText,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldType {
    Int64,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub is_primary: bool,
    pub indexing: bool,
}

impl Field {
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Int64,
            is_primary: true,
            indexing: false,
        }
    }

    pub fn int64(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Int64,
            is_primary: false,
            indexing: false,
        }
    }

    pub fn text(name: impl Into<String>, indexing: bool) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Text,
            is_primary: false,
            indexing,
        }
    }
}

/// One slice as written to a search backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreDocument {
    pub id: String,
    pub content: String,
    pub creator_id: i64,
    pub document_id: i64,
    /// Additional indexed fields, e.g. `col_{id}` values of a table row.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredDocument {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub document_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DslFilter {
    In {
        field: String,
        values: Vec<serde_json::Value>,
    },
    Eq {
        field: String,
        value: serde_json::Value,
    },
    And(Vec<DslFilter>),
}

impl DslFilter {
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Option<serde_json::Value>) -> bool {
        match self {
            Self::In { field, values } => lookup(field).is_some_and(|value| values.contains(&value)),
            Self::Eq { field, value } => lookup(field).is_some_and(|found| &found == value),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(lookup)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiMatch {
    pub fields: Vec<String>,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetrieveOptions {
    pub top_k: Option<usize>,
    pub min_score: Option<f64>,
    pub partition_key: Option<String>,
    pub partitions: Vec<String>,
    pub dsl: Option<DslFilter>,
    pub multi_match: Option<MultiMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreOptions {
    pub partition_key: Option<String>,
    pub partition: Option<String>,
    pub indexing_fields: Vec<String>,
}

#[async_trait]
pub trait SearchStoreManager: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn create_collection(&self, collection: &str, fields: &[Field]) -> Result<(), SearchError>;

    async fn drop_collection(&self, collection: &str) -> Result<(), SearchError>;

    async fn search_store(&self, collection: &str) -> Result<Arc<dyn SearchStore>, SearchError>;
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    async fn store(
        &self,
        documents: &[StoreDocument],
        options: &StoreOptions,
    ) -> Result<Vec<String>, SearchError>;

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredDocument>, SearchError>;

    async fn delete(&self, ids: &[String]) -> Result<(), SearchError>;
}

/// Fields every knowledge collection is created with.
pub fn base_fields() -> Vec<Field> {
    vec![
        Field::primary(FIELD_ID),
        Field::int64(FIELD_CREATOR_ID),
        Field::int64(FIELD_DOCUMENT_ID),
        Field::text(FIELD_TEXT_CONTENT, true),
    ]
}
