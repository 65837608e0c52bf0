use crate::error::StorageError;
use crate::models::CellValue;
use crate::rdb::{
    quote_ident, AlterOperation, Condition, RelationalStore, ResultSet, Row, SelectRequest,
    TableDef, UpsertOutcome,
};
use crate::sql_rewriter::{sql_operation, SqlOperation};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::debug;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Relational backend for knowledge tables on SQLite.
#[derive(Clone)]
pub struct SqliteRdb {
    pool: SqlitePool,
}

impl SqliteRdb {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        debug!(url, "connecting to sqlite");

        // Every connection to an in-memory url opens its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_cell<'q>(query: SqliteQuery<'q>, value: &CellValue) -> SqliteQuery<'q> {
    match value {
        CellValue::Null => query.bind(None::<String>),
        CellValue::Integer(value) => query.bind(*value),
        CellValue::Number(value) => query.bind(*value),
        CellValue::Boolean(value) => query.bind(*value),
        other => query.bind(other.to_display_string()),
    }
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[CellValue]) -> SqliteQuery<'q> {
    for value in values {
        query = bind_cell(query, value);
    }
    query
}

fn read_cell(row: &SqliteRow, index: usize) -> Result<CellValue, StorageError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(CellValue::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "INTEGER" | "BIGINT" | "INT8" => CellValue::Integer(row.try_get::<i64, _>(index)?),
        "REAL" | "DOUBLE" | "FLOAT" => CellValue::Number(row.try_get::<f64, _>(index)?),
        "BOOLEAN" => CellValue::Boolean(row.try_get::<bool, _>(index)?),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get(index)?;
            CellValue::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => CellValue::String(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}

fn read_rows(rows: &[SqliteRow]) -> Result<ResultSet, StorageError> {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|column| column.name().to_string()).collect())
        .unwrap_or_default();

    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Row::new();
        for (index, column) in row.columns().iter().enumerate() {
            values.insert(column.name().to_string(), read_cell(row, index)?);
        }
        result.push(values);
    }

    Ok(ResultSet {
        columns,
        rows: result,
        affected_rows: 0,
    })
}

/// Renders conditions as a `WHERE` clause with positional parameters.
fn where_clause(conditions: &[Condition]) -> (String, Vec<CellValue>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for condition in conditions {
        match condition {
            Condition::Eq { field, value } => {
                clauses.push(format!("{} = ?", quote_ident(field)));
                params.push(value.clone());
            }
            Condition::In { field, values } if values.is_empty() => {
                clauses.push(format!("{} IN (NULL)", quote_ident(field)));
            }
            Condition::In { field, values } => {
                let placeholders = vec!["?"; values.len()].join(", ");
                clauses.push(format!("{} IN ({placeholders})", quote_ident(field)));
                params.extend(values.iter().cloned());
            }
        }
    }
    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

fn same_value(stored: Option<&CellValue>, incoming: &CellValue) -> bool {
    match stored {
        Some(stored) => stored.to_display_string() == incoming.to_display_string(),
        None => incoming.is_empty(),
    }
}

fn is_read_statement(sql: &str) -> bool {
    match sql_operation(sql) {
        SqlOperation::Select => true,
        SqlOperation::Unknown => {
            let head = sql.trim_start().to_ascii_lowercase();
            head.starts_with("select") || head.starts_with("with")
        }
        _ => false,
    }
}

#[async_trait]
impl RelationalStore for SqliteRdb {
    async fn create_table(&self, table: &TableDef) -> Result<(), StorageError> {
        if table.columns.is_empty() {
            return Err(StorageError::InvalidRequest(format!(
                "table {} has no columns",
                table.name
            )));
        }

        let columns = table
            .columns
            .iter()
            .map(|column| {
                let mut definition =
                    format!("{} {}", quote_ident(&column.name), column.data_type.as_sql());
                if column.primary_key {
                    definition.push_str(" PRIMARY KEY");
                }
                if column.not_null {
                    definition.push_str(" NOT NULL");
                }
                definition
            })
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns})",
            quote_ident(&table.name)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn alter_table(&self, table: &str, operations: &[AlterOperation]) -> Result<(), StorageError> {
        let table_ident = quote_ident(table);
        let mut tx = self.pool.begin().await?;
        for operation in operations {
            let sql = match operation {
                AlterOperation::AddColumn(column) => format!(
                    "ALTER TABLE {table_ident} ADD COLUMN {} {}",
                    quote_ident(&column.name),
                    column.data_type.as_sql()
                ),
                AlterOperation::DropColumn(name) => {
                    format!("ALTER TABLE {table_ident} DROP COLUMN {}", quote_ident(name))
                }
                AlterOperation::RenameColumn { from, to } => format!(
                    "ALTER TABLE {table_ident} RENAME COLUMN {} TO {}",
                    quote_ident(from),
                    quote_ident(to)
                ),
                AlterOperation::ModifyColumn(column) => {
                    // sqlite columns are dynamically typed
                    debug!(table, column = %column.name, "skipping column type change");
                    continue;
                }
            };
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str, if_exists: bool) -> Result<(), StorageError> {
        let sql = if if_exists {
            format!("DROP TABLE IF EXISTS {}", quote_ident(table))
        } else {
            format!("DROP TABLE {}", quote_ident(table))
        };
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_data(&self, table: &str, rows: &[Row]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for row in rows {
            let names = row.keys().map(|name| quote_ident(name)).collect::<Vec<_>>();
            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                quote_ident(table),
                names.join(", ")
            );
            let values: Vec<CellValue> = row.values().cloned().collect();
            affected += bind_all(sqlx::query(&sql), &values)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn upsert_data(&self, table: &str, key: &str, rows: &[Row]) -> Result<UpsertOutcome, StorageError> {
        let table_ident = quote_ident(table);
        let key_ident = quote_ident(key);
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let key_value = row.get(key).ok_or_else(|| {
                StorageError::InvalidRequest(format!("row is missing key column {key}"))
            })?;

            let lookup = format!("SELECT * FROM {table_ident} WHERE {key_ident} = ?");
            let existing = bind_cell(sqlx::query(&lookup), key_value)
                .fetch_optional(&mut *tx)
                .await?;

            match existing {
                None => {
                    let names = row.keys().map(|name| quote_ident(name)).collect::<Vec<_>>();
                    let placeholders = vec!["?"; names.len()].join(", ");
                    let sql = format!(
                        "INSERT INTO {table_ident} ({}) VALUES ({placeholders})",
                        names.join(", ")
                    );
                    let values: Vec<CellValue> = row.values().cloned().collect();
                    bind_all(sqlx::query(&sql), &values).execute(&mut *tx).await?;
                    outcome.inserted += 1;
                }
                Some(stored) => {
                    let stored = read_rows(std::slice::from_ref(&stored))?
                        .rows
                        .pop()
                        .unwrap_or_default();
                    let changed: Vec<(&String, &CellValue)> = row
                        .iter()
                        .filter(|(name, value)| name.as_str() != key && !same_value(stored.get(*name), value))
                        .collect();
                    if changed.is_empty() {
                        outcome.unchanged += 1;
                        continue;
                    }

                    let assignments = changed
                        .iter()
                        .map(|(name, _)| format!("{} = ?", quote_ident(name)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!("UPDATE {table_ident} SET {assignments} WHERE {key_ident} = ?");
                    let mut values: Vec<CellValue> =
                        changed.iter().map(|(_, value)| (*value).clone()).collect();
                    values.push(key_value.clone());
                    bind_all(sqlx::query(&sql), &values).execute(&mut *tx).await?;
                    outcome.updated += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn select_data(&self, request: &SelectRequest) -> Result<ResultSet, StorageError> {
        let fields = if request.fields.is_empty() {
            "*".to_string()
        } else {
            request
                .fields
                .iter()
                .map(|field| quote_ident(field))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let (filter, params) = where_clause(&request.conditions);
        let mut sql = format!("SELECT {fields} FROM {}{filter}", quote_ident(&request.table));
        if let Some(order) = &request.order_by {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_ident(&order.field),
                if order.descending { "DESC" } else { "ASC" }
            ));
        }
        if let Some(limit) = request.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?;
        let mut result = read_rows(&rows)?;
        if result.columns.is_empty() {
            result.columns = request.fields.clone();
        }
        Ok(result)
    }

    async fn delete_data(&self, table: &str, conditions: &[Condition]) -> Result<u64, StorageError> {
        if conditions.is_empty() {
            return Err(StorageError::InvalidRequest(
                "refusing to delete without conditions".to_string(),
            ));
        }
        let (filter, params) = where_clause(conditions);
        let sql = format!("DELETE FROM {}{filter}", quote_ident(table));
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn execute_sql(&self, sql: &str, params: &[CellValue]) -> Result<ResultSet, StorageError> {
        if is_read_statement(sql) {
            let rows = bind_all(sqlx::query(sql), params)
                .fetch_all(&self.pool)
                .await?;
            return read_rows(&rows);
        }

        let result = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(ResultSet {
            affected_rows: result.rows_affected(),
            ..ResultSet::default()
        })
    }
}
