use crate::error::Result;
use crate::models::{ChatMessage, ColumnType, TableInfo, RESERVED_ID_COLUMN};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub description: String,
}

/// User-facing schema of one table document, as shown to the SQL generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualTableSchema {
    pub name: String,
    pub comment: String,
    pub columns: Vec<VirtualColumn>,
}

impl From<&TableInfo> for VirtualTableSchema {
    fn from(info: &TableInfo) -> Self {
        Self {
            name: info.virtual_table_name.clone(),
            comment: info.table_desc.clone(),
            columns: info
                .user_columns()
                .map(|column| VirtualColumn {
                    name: column.name.clone(),
                    column_type: column.column_type,
                    description: column.description.clone(),
                })
                .collect(),
        }
    }
}

/// Translates a conversation into one SQL statement over virtual table names.
#[async_trait]
pub trait Nl2Sql: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage], tables: &[VirtualTableSchema]) -> Result<String>;
}

/// Splices the reserved slice id column into the select list so hits map back to slices.
pub fn add_slice_id_column(sql: &str) -> String {
    let lower = sql.to_ascii_lowercase();
    let Some(select_at) = lower.find("select ") else {
        return sql.to_string();
    };
    let columns_start = select_at + "select ".len();
    let Some(from_offset) = lower[columns_start..].find(" from") else {
        return sql.to_string();
    };
    let columns_end = columns_start + from_offset;

    let columns = sql[columns_start..columns_end].trim();
    if columns == "*" {
        return sql.to_string();
    }

    format!(
        "{}{columns}, {RESERVED_ID_COLUMN}{}",
        &sql[..columns_start],
        &sql[columns_end..]
    )
}
