use crate::error::StorageError;
use crate::models::{CellValue, ColumnType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SqlDataType {
    BigInt,
    Double,
    Text,
    Boolean,
    Timestamp,
}

impl SqlDataType {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::BigInt => "BIGINT",
            Self::Double => "DOUBLE",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

impl From<ColumnType> for SqlDataType {
    fn from(value: ColumnType) -> Self {
        match value {
            ColumnType::Integer => Self::BigInt,
            ColumnType::Number => Self::Double,
            ColumnType::Boolean => Self::Boolean,
            ColumnType::Time => Self::Timestamp,
            ColumnType::Unknown | ColumnType::String | ColumnType::Image => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: SqlDataType,
    pub not_null: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: SqlDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            not_null: false,
            primary_key: false,
        }
    }

    pub fn primary_key(name: impl Into<String>, data_type: SqlDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            not_null: true,
            primary_key: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlterOperation {
    AddColumn(ColumnDef),
    ModifyColumn(ColumnDef),
    DropColumn(String),
    RenameColumn { from: String, to: String },
}

/// One relational row keyed by physical column name.
pub type Row = BTreeMap<String, CellValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { field: String, value: CellValue },
    In { field: String, values: Vec<CellValue> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectRequest {
    pub table: String,
    /// Empty selects every column.
    pub fields: Vec<String>,
    pub conditions: Vec<Condition>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl SelectRequest {
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl UpsertOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn create_table(&self, table: &TableDef) -> Result<(), StorageError>;

    async fn alter_table(&self, table: &str, operations: &[AlterOperation]) -> Result<(), StorageError>;

    async fn drop_table(&self, table: &str, if_exists: bool) -> Result<(), StorageError>;

    async fn insert_data(&self, table: &str, rows: &[Row]) -> Result<u64, StorageError>;

    /// Inserts or updates by `key`; rows identical to the stored one count as unchanged.
    async fn upsert_data(&self, table: &str, key: &str, rows: &[Row]) -> Result<UpsertOutcome, StorageError>;

    async fn select_data(&self, request: &SelectRequest) -> Result<ResultSet, StorageError>;

    async fn delete_data(&self, table: &str, conditions: &[Condition]) -> Result<u64, StorageError>;

    /// Runs raw SQL with positional `?` parameters. Reads return rows, writes an affected count.
    async fn execute_sql(&self, sql: &str, params: &[CellValue]) -> Result<ResultSet, StorageError>;
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_ident("col_1"), "\"col_1\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn column_types_map_to_sql_types() {
        assert_eq!(SqlDataType::from(ColumnType::Integer).as_sql(), "BIGINT");
        assert_eq!(SqlDataType::from(ColumnType::Image).as_sql(), "TEXT");
        assert_eq!(SqlDataType::from(ColumnType::Time), SqlDataType::Timestamp);
    }
}
