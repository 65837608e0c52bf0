use crate::error::{KnowledgeError, Result};
use crate::idgen::IdGenerator;
use crate::models::{
    CellValue, ColumnData, ColumnType, FileType, ParsingStrategy, TableColumn, TableInfo,
    TableSheet, RESERVED_ID_COLUMN,
};
use crate::parser::{ParseConfig, ParserManager};
use crate::rdb::{
    AlterOperation, ColumnDef, Condition, RelationalStore, ResultSet, Row, SelectRequest, SqlDataType,
    TableDef,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

pub fn physical_column_name(column_id: i64) -> String {
    format!("col_{column_id}")
}

pub fn physical_table_name(table_id: i64) -> String {
    format!("table_{table_id}")
}

/// Physical name of any column, including the reserved key column.
pub fn rdb_field_name(column: &TableColumn) -> String {
    if column.is_reserved() {
        RESERVED_ID_COLUMN.to_string()
    } else {
        physical_column_name(column.id)
    }
}

/// Widening rule used when source data meets a destination column type.
pub fn transform_column_type(src: ColumnType, dst: ColumnType) -> ColumnType {
    match (src, dst) {
        (ColumnType::Unknown, other) | (other, ColumnType::Unknown) => other,
        (left, right) if left == right => left,
        (ColumnType::Integer, ColumnType::Number) => ColumnType::Number,
        _ => ColumnType::String,
    }
}

fn reserved_column(id: i64) -> TableColumn {
    TableColumn {
        id,
        name: RESERVED_ID_COLUMN.to_string(),
        column_type: ColumnType::Integer,
        description: "primary key".to_string(),
        indexing: false,
        sequence: -1,
    }
}

fn column_def(column: &TableColumn) -> ColumnDef {
    if column.is_reserved() {
        ColumnDef::primary_key(RESERVED_ID_COLUMN, SqlDataType::BigInt)
    } else {
        ColumnDef::new(physical_column_name(column.id), SqlDataType::from(column.column_type))
    }
}

/// Assigns ids to new columns, appends the reserved key column and creates the physical table.
pub async fn create_physical_table(
    rdb: &dyn RelationalStore,
    idgen: &dyn IdGenerator,
    virtual_name: &str,
    description: &str,
    columns: &[TableColumn],
) -> Result<TableInfo> {
    if columns.iter().any(TableColumn::is_reserved) {
        return Err(KnowledgeError::InvalidParameter(format!(
            "column name {RESERVED_ID_COLUMN} is reserved"
        )));
    }
    if columns.is_empty() {
        return Err(KnowledgeError::InvalidParameter(
            "table needs at least one column".to_string(),
        ));
    }

    let mut table_columns: Vec<TableColumn> = columns
        .iter()
        .map(|column| {
            let mut column = column.clone();
            if column.id == 0 {
                column.id = idgen.gen_id();
            }
            column
        })
        .collect();
    table_columns.push(reserved_column(idgen.gen_id()));

    let info = TableInfo {
        virtual_table_name: virtual_name.to_string(),
        physical_table_name: physical_table_name(idgen.gen_id()),
        table_desc: description.to_string(),
        columns: table_columns,
    };

    rdb.create_table(&TableDef {
        name: info.physical_table_name.clone(),
        columns: info.columns.iter().map(column_def).collect(),
    })
    .await?;

    info!(
        table = %info.physical_table_name,
        virtual_table = virtual_name,
        columns = info.columns.len(),
        "physical table created"
    );
    Ok(info)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnDiff {
    pub add: Vec<TableColumn>,
    pub modify: Vec<TableColumn>,
    pub drop: Vec<TableColumn>,
}

impl ColumnDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.modify.is_empty() && self.drop.is_empty()
    }
}

/// Compares columns by id. Zero ids are additions, ids missing from `target` are drops and
/// the reserved key column is never part of the diff.
pub fn diff_columns(before: &[TableColumn], target: &[TableColumn]) -> Result<ColumnDiff> {
    let existing: HashMap<i64, &TableColumn> = before
        .iter()
        .filter(|column| !column.is_reserved())
        .map(|column| (column.id, column))
        .collect();

    let mut diff = ColumnDiff::default();
    let mut kept = HashSet::new();
    for column in target.iter().filter(|column| !column.is_reserved()) {
        if column.id == 0 {
            diff.add.push(column.clone());
            continue;
        }
        match existing.get(&column.id) {
            Some(previous) => {
                kept.insert(column.id);
                if *previous != column {
                    diff.modify.push(column.clone());
                }
            }
            None => {
                return Err(KnowledgeError::InvalidParameter(format!(
                    "column id {} does not exist in table",
                    column.id
                )))
            }
        }
    }

    diff.drop = before
        .iter()
        .filter(|column| !column.is_reserved() && !kept.contains(&column.id))
        .cloned()
        .collect();
    Ok(diff)
}

/// Applies `target` to the physical table and returns the updated table info.
pub async fn alter_table_schema(
    rdb: &dyn RelationalStore,
    idgen: &dyn IdGenerator,
    info: &TableInfo,
    target: &[TableColumn],
) -> Result<TableInfo> {
    let before: Vec<TableColumn> = info.user_columns().cloned().collect();
    let diff = diff_columns(&before, target)?;
    let previous_types: HashMap<i64, ColumnType> =
        before.iter().map(|column| (column.id, column.column_type)).collect();

    let mut columns = Vec::with_capacity(target.len() + 1);
    let mut operations = Vec::new();
    for column in target.iter().filter(|column| !column.is_reserved()) {
        let mut column = column.clone();
        if column.id == 0 {
            column.id = idgen.gen_id();
            operations.push(AlterOperation::AddColumn(column_def(&column)));
        } else if previous_types.get(&column.id) != Some(&column.column_type) {
            operations.push(AlterOperation::ModifyColumn(column_def(&column)));
        }
        columns.push(column);
    }
    for column in &diff.drop {
        operations.push(AlterOperation::DropColumn(physical_column_name(column.id)));
    }
    let reserved = info
        .id_column()
        .cloned()
        .unwrap_or_else(|| reserved_column(idgen.gen_id()));
    columns.push(reserved);

    if !operations.is_empty() {
        rdb.alter_table(&info.physical_table_name, &operations).await?;
    }
    info!(
        table = %info.physical_table_name,
        added = diff.add.len(),
        modified = diff.modify.len(),
        dropped = diff.drop.len(),
        "table schema altered"
    );

    Ok(TableInfo {
        columns,
        ..info.clone()
    })
}

/// Parsed header and rows of one table source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSheet {
    pub sheet: TableSheet,
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<ColumnData>>,
}

pub fn load_sheet(
    parsers: &dyn ParserManager,
    bytes: &[u8],
    file_type: FileType,
    parsing: &ParsingStrategy,
    columns: &[TableColumn],
) -> Result<RawSheet> {
    let config = ParseConfig {
        file_type,
        parsing: parsing.clone(),
        columns: columns.to_vec(),
        ..ParseConfig::new(file_type)
    };
    let output = parsers.get_parser(file_type)?.parse(bytes, &config)?;
    if output.columns.is_empty() {
        return Err(KnowledgeError::Parse("parse result is empty".to_string()));
    }

    let rows = output
        .chunks
        .into_iter()
        .map(|chunk| {
            chunk
                .columns
                .ok_or_else(|| KnowledgeError::System("table chunk carries no row data".to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RawSheet {
        sheet: TableSheet {
            sheet_id: parsing.sheet_id,
            sheet_name: String::new(),
            header_line_idx: parsing.header_line,
            start_line_idx: parsing.data_start_line,
            total_rows: rows.len(),
        },
        columns: output.columns,
        rows,
    })
}

/// Checks a source sheet against the stored schema, keyed by column name.
pub fn validate_table_schema(dst: &TableInfo, src: &RawSheet) -> BTreeMap<String, String> {
    let mut pending: HashMap<&str, &TableColumn> = dst
        .user_columns()
        .map(|column| (column.name.as_str(), column))
        .collect();
    let mut result = BTreeMap::new();

    for (index, src_column) in src.columns.iter().enumerate() {
        let Some(dst_column) = pending.remove(src_column.name.as_str()) else {
            continue;
        };

        if transform_column_type(src_column.column_type, dst_column.column_type) != dst_column.column_type {
            result.insert(
                dst_column.name.clone(),
                format!(
                    "column type invalid, expected={}, got={}",
                    dst_column.column_type.code(),
                    src_column.column_type.code()
                ),
            );
            continue;
        }

        if dst_column.indexing {
            let missing = src.rows.iter().any(|row| {
                row.get(index)
                    .map_or(true, |value| value.value.to_display_string().is_empty())
            });
            if missing {
                result.insert(
                    dst_column.name.clone(),
                    "column indexing requires value, but got none".to_string(),
                );
            }
        }
    }

    for column in pending.into_values() {
        result.insert(column.name.clone(), "column not found in provided data".to_string());
    }
    result
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableDataType {
    AllData,
    OnlySchema,
    OnlyPreview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableSchemaResponse {
    pub table_sheet: Option<TableSheet>,
    pub all_table_sheets: Vec<TableSheet>,
    pub table_meta: Vec<TableColumn>,
    pub preview_data: Vec<Vec<ColumnData>>,
}

fn retyped(data: &ColumnData, column: &TableColumn) -> ColumnData {
    ColumnData {
        column_id: column.id,
        column_name: column.name.clone(),
        column_type: column.column_type,
        value: CellValue::parse_as(&data.value.to_display_string(), column.column_type),
    }
}

/// Projects a parsed preview onto `prev_table_meta`. Without ids (first import) rows are
/// aligned by column sequence, otherwise by column id with empty values for missing columns.
pub fn format_table_schema_response(
    original: TableSchemaResponse,
    prev_table_meta: Option<&[TableColumn]>,
    data_type: TableDataType,
) -> TableSchemaResponse {
    let Some(meta) = prev_table_meta else {
        return match data_type {
            TableDataType::AllData => original,
            TableDataType::OnlyPreview => TableSchemaResponse {
                preview_data: original.preview_data,
                ..TableSchemaResponse::default()
            },
            TableDataType::OnlySchema => TableSchemaResponse {
                preview_data: Vec::new(),
                ..original
            },
        };
    };

    if data_type == TableDataType::OnlySchema {
        return TableSchemaResponse {
            table_sheet: original.table_sheet,
            all_table_sheets: original.all_table_sheets,
            table_meta: meta.to_vec(),
            preview_data: Vec::new(),
        };
    }

    let first_import = meta.iter().all(|column| column.id == 0);
    let preview_data = original
        .preview_data
        .iter()
        .map(|row| {
            if first_import {
                meta.iter()
                    .map(|column| {
                        usize::try_from(column.sequence)
                            .ok()
                            .and_then(|index| row.get(index))
                            .map(|data| retyped(data, column))
                            .unwrap_or_else(|| ColumnData::empty(column))
                    })
                    .collect()
            } else {
                let by_id: HashMap<i64, &ColumnData> =
                    row.iter().map(|data| (data.column_id, data)).collect();
                meta.iter()
                    .map(|column| match by_id.get(&column.id) {
                        Some(data) if column.id != 0 => (*data).clone(),
                        _ => ColumnData::empty(column),
                    })
                    .collect()
            }
        })
        .collect();

    match data_type {
        TableDataType::AllData => TableSchemaResponse {
            table_sheet: original.table_sheet,
            all_table_sheets: original.all_table_sheets,
            table_meta: meta.to_vec(),
            preview_data,
        },
        _ => TableSchemaResponse {
            table_sheet: original.table_sheet,
            all_table_sheets: Vec::new(),
            table_meta: meta.to_vec(),
            preview_data,
        },
    }
}

fn typed_cell(value: &CellValue, column_type: ColumnType) -> CellValue {
    match (column_type, value) {
        (_, CellValue::Null) => CellValue::Null,
        (ColumnType::Integer, CellValue::Integer(_))
        | (ColumnType::Number, CellValue::Number(_))
        | (ColumnType::Boolean, CellValue::Boolean(_))
        | (ColumnType::Time, CellValue::Time(_))
        | (ColumnType::String | ColumnType::Unknown, CellValue::String(_)) => value.clone(),
        (ColumnType::Number, CellValue::Integer(number)) => CellValue::Number(*number as f64),
        (ColumnType::Boolean, CellValue::Integer(number)) => CellValue::Boolean(*number != 0),
        _ => CellValue::parse_as(&value.to_display_string(), column_type),
    }
}

/// Converts relational rows back into typed column data in `columns` order.
pub fn parse_rdb_rows(columns: &[TableColumn], result: &ResultSet) -> Result<Vec<Vec<ColumnData>>> {
    let names: Vec<String> = columns.iter().map(rdb_field_name).collect();
    let mut parsed = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let mut values = Vec::with_capacity(columns.len());
        for (column, name) in columns.iter().zip(&names) {
            match row.get(name) {
                Some(value) => values.push(ColumnData {
                    column_id: column.id,
                    column_name: column.name.clone(),
                    column_type: column.column_type,
                    value: typed_cell(value, column.column_type),
                }),
                None if column.is_reserved() => values.push(ColumnData::empty(column)),
                None => {
                    return Err(KnowledgeError::System(format!(
                        "table is being altered, retry later, col={}",
                        column.name
                    )))
                }
            }
        }
        parsed.push(values);
    }
    Ok(parsed)
}

/// Loads the rows of `slice_ids` keyed by slice id, user columns only.
pub async fn select_slice_rows(
    rdb: &dyn RelationalStore,
    info: &TableInfo,
    slice_ids: &[i64],
) -> Result<HashMap<i64, Vec<ColumnData>>> {
    if slice_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let result = rdb
        .select_data(&SelectRequest {
            conditions: vec![Condition::In {
                field: RESERVED_ID_COLUMN.to_string(),
                values: slice_ids.iter().map(|id| CellValue::Integer(*id)).collect(),
            }],
            ..SelectRequest::all(info.physical_table_name.clone())
        })
        .await?;

    let mut rows = HashMap::with_capacity(result.rows.len());
    for values in parse_rdb_rows(&info.columns, &result)? {
        let mut slice_id = None;
        let mut user_values = Vec::with_capacity(values.len());
        for value in values {
            match value.value {
                CellValue::Integer(id) if value.column_name == RESERVED_ID_COLUMN => slice_id = Some(id),
                _ if value.column_name == RESERVED_ID_COLUMN => {}
                _ => user_values.push(value),
            }
        }
        if let Some(id) = slice_id {
            rows.insert(id, user_values);
        }
    }
    Ok(rows)
}

/// Relational row of one table slice keyed by physical column name.
pub fn rdb_row(slice_id: i64, values: &[ColumnData]) -> Row {
    let mut row = Row::new();
    row.insert(RESERVED_ID_COLUMN.to_string(), CellValue::Integer(slice_id));
    for value in values.iter().filter(|value| value.column_id != 0) {
        row.insert(physical_column_name(value.column_id), value.value.clone());
    }
    row
}

/// Text form of a table row for search backends: indexing values keyed by column name.
pub fn compact_row_content(info: &TableInfo, values: &[ColumnData]) -> String {
    let indexing: HashSet<i64> = info
        .user_columns()
        .filter(|column| column.indexing)
        .map(|column| column.id)
        .collect();
    let object: serde_json::Map<String, serde_json::Value> = values
        .iter()
        .filter(|value| indexing.contains(&value.column_id))
        .map(|value| (value.column_name.clone(), value.value.to_json()))
        .collect();
    serde_json::Value::Object(object).to_string()
}

/// Aligns a partial row with the table schema, keyed by column id.
pub fn align_row(info: &TableInfo, values: &[ColumnData]) -> Vec<ColumnData> {
    let by_id: HashMap<i64, &ColumnData> = values.iter().map(|value| (value.column_id, value)).collect();
    info.user_columns()
        .map(|column| match by_id.get(&column.id) {
            Some(value) => ColumnData {
                column_id: column.id,
                column_name: column.name.clone(),
                column_type: column.column_type,
                value: typed_cell(&value.value, column.column_type),
            },
            None => ColumnData::empty(column),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idgen::SnowflakeIdGenerator;
    use crate::parser::BuiltinParserManager;
    use crate::stores::SqliteRdb;

    fn column(id: i64, name: &str, column_type: ColumnType, indexing: bool, sequence: i64) -> TableColumn {
        TableColumn {
            id,
            name: name.to_string(),
            column_type,
            description: String::new(),
            indexing,
            sequence,
        }
    }

    fn data(name: &str, value: CellValue, column_type: ColumnType) -> ColumnData {
        ColumnData {
            column_id: 0,
            column_name: name.to_string(),
            column_type,
            value,
        }
    }

    #[test]
    fn widening_rule() {
        assert_eq!(transform_column_type(ColumnType::Unknown, ColumnType::Time), ColumnType::Time);
        assert_eq!(transform_column_type(ColumnType::Integer, ColumnType::Number), ColumnType::Number);
        assert_eq!(transform_column_type(ColumnType::Number, ColumnType::Integer), ColumnType::String);
        assert_eq!(transform_column_type(ColumnType::String, ColumnType::Integer), ColumnType::String);
        assert_eq!(transform_column_type(ColumnType::Boolean, ColumnType::String), ColumnType::String);
        assert_eq!(transform_column_type(ColumnType::Time, ColumnType::Boolean), ColumnType::String);
        assert_eq!(transform_column_type(ColumnType::Integer, ColumnType::Integer), ColumnType::Integer);
    }

    #[test]
    fn rename_is_a_single_modify() -> Result<(), Box<dyn std::error::Error>> {
        let before = vec![
            column(1, "region", ColumnType::String, true, 0),
            column(2, "units", ColumnType::Integer, false, 1),
            column(9, RESERVED_ID_COLUMN, ColumnType::Integer, false, -1),
        ];
        let target = vec![
            column(1, "area", ColumnType::String, true, 0),
            column(2, "units", ColumnType::Integer, false, 1),
        ];

        let diff = diff_columns(&before, &target)?;
        assert!(diff.add.is_empty());
        assert!(diff.drop.is_empty());
        assert_eq!(diff.modify.len(), 1);
        assert_eq!(diff.modify[0].name, "area");
        Ok(())
    }

    #[test]
    fn diff_classifies_add_and_drop_and_rejects_unknown_ids() -> Result<(), Box<dyn std::error::Error>> {
        let before = vec![
            column(1, "region", ColumnType::String, true, 0),
            column(2, "units", ColumnType::Integer, false, 1),
        ];
        let target = vec![
            column(1, "region", ColumnType::String, true, 0),
            column(0, "price", ColumnType::Number, false, 1),
        ];
        let diff = diff_columns(&before, &target)?;
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.drop.len(), 1);
        assert_eq!(diff.drop[0].id, 2);
        assert!(diff.modify.is_empty());

        let bogus = vec![column(77, "ghost", ColumnType::String, false, 0)];
        assert!(matches!(
            diff_columns(&before, &bogus),
            Err(KnowledgeError::InvalidParameter(_))
        ));
        Ok(())
    }

    #[test]
    fn validation_reports_each_failure_by_column_name() {
        let dst = TableInfo {
            columns: vec![
                column(1, "test_col_1", ColumnType::String, true, 0),
                column(2, "test_col_2", ColumnType::Integer, false, 1),
                column(3, "test_col_3", ColumnType::String, true, 2),
                column(4, RESERVED_ID_COLUMN, ColumnType::Integer, false, -1),
            ],
            ..TableInfo::default()
        };
        let src = RawSheet {
            sheet: TableSheet::default(),
            columns: vec![
                column(0, "test_col_3", ColumnType::String, true, 1),
                column(0, "test_col_2", ColumnType::String, false, 2),
                column(0, "another_field", ColumnType::String, false, 3),
            ],
            rows: vec![vec![
                data("test_col_3", CellValue::Null, ColumnType::String),
                data("test_col_2", CellValue::String("azaz".to_string()), ColumnType::String),
                data("another_field", CellValue::String("bye".to_string()), ColumnType::String),
            ]],
        };

        let result = validate_table_schema(&dst, &src);
        let expected = BTreeMap::from([
            ("test_col_1".to_string(), "column not found in provided data".to_string()),
            ("test_col_2".to_string(), "column type invalid, expected=2, got=1".to_string()),
            (
                "test_col_3".to_string(),
                "column indexing requires value, but got none".to_string(),
            ),
        ]);
        assert_eq!(result, expected);
    }

    #[test]
    fn preview_aligns_by_sequence_then_by_id() {
        let preview = vec![vec![
            ColumnData {
                column_id: 11,
                column_name: "a".to_string(),
                column_type: ColumnType::String,
                value: CellValue::String("x".to_string()),
            },
            ColumnData {
                column_id: 12,
                column_name: "b".to_string(),
                column_type: ColumnType::String,
                value: CellValue::String("7".to_string()),
            },
        ]];
        let original = TableSchemaResponse {
            preview_data: preview,
            ..TableSchemaResponse::default()
        };

        let first_import = vec![
            column(0, "renamed_b", ColumnType::Integer, false, 1),
            column(0, "c", ColumnType::String, false, 5),
        ];
        let formatted = format_table_schema_response(
            original.clone(),
            Some(&first_import),
            TableDataType::OnlyPreview,
        );
        assert_eq!(formatted.preview_data[0][0].value, CellValue::Integer(7));
        assert_eq!(formatted.preview_data[0][0].column_name, "renamed_b");
        assert_eq!(formatted.preview_data[0][1].value, CellValue::Null);

        let by_id = vec![
            column(12, "b", ColumnType::String, false, 0),
            column(13, "new", ColumnType::String, false, 1),
        ];
        let formatted =
            format_table_schema_response(original, Some(&by_id), TableDataType::AllData);
        assert_eq!(formatted.preview_data[0][0].value, CellValue::String("7".to_string()));
        assert_eq!(formatted.preview_data[0][1], ColumnData::empty(&by_id[1]));
        assert_eq!(formatted.table_meta.len(), 2);
    }

    #[test]
    fn only_schema_drops_preview() {
        let original = TableSchemaResponse {
            preview_data: vec![vec![]],
            table_meta: vec![column(1, "a", ColumnType::String, false, 0)],
            ..TableSchemaResponse::default()
        };
        let formatted = format_table_schema_response(original, None, TableDataType::OnlySchema);
        assert!(formatted.preview_data.is_empty());
        assert_eq!(formatted.table_meta.len(), 1);
    }

    #[test]
    fn compact_content_keeps_indexing_values_only() {
        let info = TableInfo {
            columns: vec![
                column(1, "city", ColumnType::String, true, 0),
                column(2, "units", ColumnType::Integer, false, 1),
            ],
            ..TableInfo::default()
        };
        let row = vec![
            ColumnData {
                column_id: 1,
                column_name: "city".to_string(),
                column_type: ColumnType::String,
                value: CellValue::String("Lisbon".to_string()),
            },
            ColumnData {
                column_id: 2,
                column_name: "units".to_string(),
                column_type: ColumnType::Integer,
                value: CellValue::Integer(4),
            },
        ];
        assert_eq!(compact_row_content(&info, &row), r#"{"city":"Lisbon"}"#);

        let relational = rdb_row(5, &row);
        assert_eq!(relational.get("col_2"), Some(&CellValue::Integer(4)));
        assert_eq!(relational.get(RESERVED_ID_COLUMN), Some(&CellValue::Integer(5)));
    }

    #[tokio::test]
    async fn physical_table_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
        let rdb = SqliteRdb::in_memory().await?;
        let idgen = SnowflakeIdGenerator::new();
        let info = create_physical_table(
            &rdb,
            &idgen,
            "sales",
            "",
            &[
                column(0, "region", ColumnType::String, true, 0),
                column(0, "units", ColumnType::Integer, false, 1),
            ],
        )
        .await?;
        assert_eq!(info.columns.len(), 3);
        assert_eq!(info.user_columns().count(), 2);
        assert!(info.physical_table_name.starts_with("table_"));

        let mut target: Vec<TableColumn> = info.user_columns().cloned().collect();
        target[0].name = "area".to_string();
        target.remove(1);
        target.push(column(0, "price", ColumnType::Number, false, 2));
        let altered = alter_table_schema(&rdb, &idgen, &info, &target).await?;
        assert_eq!(altered.user_columns().count(), 2);
        assert!(altered.id_column().is_some());

        let price = altered.user_column_by_name("price").ok_or("price column missing")?;
        let row = Row::from([
            (RESERVED_ID_COLUMN.to_string(), CellValue::Integer(1)),
            (physical_column_name(price.id), CellValue::Number(9.5)),
        ]);
        rdb.insert_data(&altered.physical_table_name, &[row]).await?;
        let result = rdb.select_data(&SelectRequest::all(&altered.physical_table_name)).await?;
        let columns: Vec<TableColumn> = altered.columns.clone();
        let parsed = parse_rdb_rows(&columns, &result)?;
        assert_eq!(parsed.len(), 1);
        let price_value = parsed[0]
            .iter()
            .find(|value| value.column_name == "price")
            .ok_or("price value missing")?;
        assert_eq!(price_value.value, CellValue::Number(9.5));
        Ok(())
    }

    #[tokio::test]
    async fn slice_rows_are_keyed_by_slice_id() -> Result<(), Box<dyn std::error::Error>> {
        let rdb = SqliteRdb::in_memory().await?;
        let idgen = SnowflakeIdGenerator::new();
        let info = create_physical_table(
            &rdb,
            &idgen,
            "stock",
            "",
            &[column(0, "item", ColumnType::String, true, 0)],
        )
        .await?;
        let item = info.user_column_by_name("item").ok_or("item column missing")?.clone();
        let rows: Vec<Row> = [(7, "bolt"), (8, "nut")]
            .into_iter()
            .map(|(id, name)| {
                rdb_row(
                    id,
                    &[ColumnData {
                        column_id: item.id,
                        column_name: item.name.clone(),
                        column_type: ColumnType::String,
                        value: CellValue::String(name.to_string()),
                    }],
                )
            })
            .collect();
        rdb.insert_data(&info.physical_table_name, &rows).await?;

        let loaded = select_slice_rows(&rdb, &info, &[8, 99]).await?;
        assert_eq!(loaded.len(), 1);
        let values = loaded.get(&8).ok_or("row 8 missing")?;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, CellValue::String("nut".to_string()));
        Ok(())
    }

    #[test]
    fn sheets_load_through_the_parser_manager() -> Result<(), Box<dyn std::error::Error>> {
        let sheet = load_sheet(
            &BuiltinParserManager::default(),
            b"name,age\nada,36\n",
            FileType::Csv,
            &ParsingStrategy::default(),
            &[],
        )?;
        assert_eq!(sheet.columns.len(), 2);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.sheet.total_rows, 1);
        Ok(())
    }
}
