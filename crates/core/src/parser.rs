use crate::chunking::chunk_text;
use crate::error::{KnowledgeError, Result};
use crate::models::{
    CellValue, ChunkingStrategy, ColumnData, ColumnType, FileType, FormatType, ParsingStrategy,
    TableColumn,
};
use crate::schema::transform_column_type;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ParseConfig {
    pub file_type: FileType,
    pub parsing: ParsingStrategy,
    pub chunking: ChunkingStrategy,
    /// Known schema of the target table; parsed columns take their ids from it by name.
    pub columns: Vec<TableColumn>,
}

impl ParseConfig {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            parsing: ParsingStrategy::default(),
            chunking: ChunkingStrategy::default_fixed(),
            columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub content: String,
    pub columns: Option<Vec<ColumnData>>,
}

impl ParsedChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            columns: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub chunks: Vec<ParsedChunk>,
    /// Header of a tabular source; empty for text and images.
    pub columns: Vec<TableColumn>,
    /// A table whose source carried a header but no data rows.
    pub columns_only: bool,
}

pub trait Parser: Send + Sync {
    fn parse(&self, bytes: &[u8], config: &ParseConfig) -> Result<ParseOutput>;
}

pub trait ParserManager: Send + Sync {
    fn get_parser(&self, file_type: FileType) -> Result<Arc<dyn Parser>>;
}

#[derive(Debug, Default)]
pub struct TextParser;

impl Parser for TextParser {
    fn parse(&self, bytes: &[u8], config: &ParseConfig) -> Result<ParseOutput> {
        let text = String::from_utf8_lossy(bytes);
        let strategy = config.chunking.clone().resolve();
        let chunks = chunk_text(&text, &strategy)
            .into_iter()
            .map(ParsedChunk::text)
            .collect();
        Ok(ParseOutput {
            chunks,
            ..ParseOutput::default()
        })
    }
}

#[derive(Debug, Default)]
pub struct CsvParser;

impl Parser for CsvParser {
    fn parse(&self, bytes: &[u8], config: &ParseConfig) -> Result<ParseOutput> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record?;
            records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let parsing = &config.parsing;
        let mut header = records.get(parsing.header_line).cloned().ok_or_else(|| {
            KnowledgeError::Parse(format!(
                "header line {} out of range, source has {} lines",
                parsing.header_line,
                records.len()
            ))
        })?;
        if let Some(first) = header.first_mut() {
            *first = first.trim_start_matches('\u{feff}').to_string();
        }

        let take = if parsing.row_count == 0 {
            usize::MAX
        } else {
            parsing.row_count
        };
        let rows: Vec<Vec<String>> = records
            .into_iter()
            .skip(parsing.data_start_line.max(parsing.header_line + 1))
            .take(take)
            .collect();

        Ok(build_table_output(header, rows, &config.columns))
    }
}

#[derive(Debug, Default)]
pub struct JsonTableParser;

impl Parser for JsonTableParser {
    fn parse(&self, bytes: &[u8], config: &ParseConfig) -> Result<ParseOutput> {
        let objects: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_slice(bytes)
                .map_err(|err| KnowledgeError::Parse(format!("expected a json array of objects: {err}")))?;

        let mut header: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }

        let take = if config.parsing.row_count == 0 {
            usize::MAX
        } else {
            config.parsing.row_count
        };
        let rows = objects
            .iter()
            .take(take)
            .map(|object| {
                header
                    .iter()
                    .map(|key| match object.get(key) {
                        None | Some(serde_json::Value::Null) => String::new(),
                        Some(serde_json::Value::String(value)) => value.clone(),
                        Some(other) => other.to_string(),
                    })
                    .collect()
            })
            .collect();

        Ok(build_table_output(header, rows, &config.columns))
    }
}

/// Images become one slice; the caption is filled in by a later manual edit.
#[derive(Debug, Default)]
pub struct ImageParser;

impl Parser for ImageParser {
    fn parse(&self, _bytes: &[u8], _config: &ParseConfig) -> Result<ParseOutput> {
        Ok(ParseOutput {
            chunks: vec![ParsedChunk::text(String::new())],
            ..ParseOutput::default()
        })
    }
}

/// Folds per-value types of one column; the order of integer and decimal values does not matter.
fn merge_value_type(seen: ColumnType, value: ColumnType) -> ColumnType {
    match (seen, value) {
        (ColumnType::Number, ColumnType::Integer) => ColumnType::Number,
        (seen, value) => transform_column_type(seen, value),
    }
}

fn build_table_output(
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    targets: &[TableColumn],
) -> ParseOutput {
    let columns: Vec<TableColumn> = header
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let name = name.trim();
            let inferred = rows
                .iter()
                .map(|row| CellValue::infer_type(row.get(index).map(String::as_str).unwrap_or("")))
                .fold(ColumnType::Unknown, merge_value_type);
            let inferred = if inferred == ColumnType::Unknown {
                ColumnType::String
            } else {
                inferred
            };
            let target = targets
                .iter()
                .find(|column| !column.is_reserved() && column.name == name);
            TableColumn {
                id: target.map(|column| column.id).unwrap_or(0),
                name: name.to_string(),
                column_type: inferred,
                description: target.map(|column| column.description.clone()).unwrap_or_default(),
                indexing: target.map(|column| column.indexing).unwrap_or(false),
                sequence: index as i64,
            }
        })
        .collect();

    let columns_only = rows.is_empty();
    let chunks = rows
        .iter()
        .map(|row| {
            let values = columns
                .iter()
                .enumerate()
                .map(|(index, column)| {
                    let column_type = targets
                        .iter()
                        .find(|target| target.id != 0 && target.id == column.id)
                        .map(|target| target.column_type)
                        .unwrap_or(column.column_type);
                    let raw = row.get(index).map(String::as_str).unwrap_or("");
                    ColumnData {
                        column_id: column.id,
                        column_name: column.name.clone(),
                        column_type,
                        value: CellValue::parse_as(raw, column_type),
                    }
                })
                .collect();
            ParsedChunk {
                content: String::new(),
                columns: Some(values),
            }
        })
        .collect();

    ParseOutput {
        chunks,
        columns,
        columns_only,
    }
}

pub struct BuiltinParserManager {
    text: Arc<dyn Parser>,
    csv: Arc<dyn Parser>,
    json: Arc<dyn Parser>,
    image: Arc<dyn Parser>,
}

impl Default for BuiltinParserManager {
    fn default() -> Self {
        Self {
            text: Arc::new(TextParser),
            csv: Arc::new(CsvParser),
            json: Arc::new(JsonTableParser),
            image: Arc::new(ImageParser),
        }
    }
}

impl ParserManager for BuiltinParserManager {
    fn get_parser(&self, file_type: FileType) -> Result<Arc<dyn Parser>> {
        let parser = match file_type {
            FileType::Txt | FileType::Markdown => &self.text,
            FileType::Csv => &self.csv,
            FileType::Json => &self.json,
            FileType::Png | FileType::Jpeg | FileType::Webp => &self.image,
        };
        Ok(Arc::clone(parser))
    }
}

pub fn discover_files(folder: &Path, format: Option<FormatType>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(FileType::from_extension)
            .is_some_and(|file_type| format.map_or(true, |format| file_type.format_type() == format));

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn csv_honours_header_and_start_lines() -> Result<(), Box<dyn std::error::Error>> {
        let source = "report title\nregion,units,price\nnorth,12,3.5\nsouth,,4\neast,7,1\n";
        let mut config = ParseConfig::new(FileType::Csv);
        config.parsing.header_line = 1;
        config.parsing.data_start_line = 2;
        config.parsing.row_count = 2;

        let output = CsvParser.parse(source.as_bytes(), &config)?;
        let types: Vec<_> = output.columns.iter().map(|column| column.column_type).collect();
        assert_eq!(types, vec![ColumnType::String, ColumnType::Integer, ColumnType::Number]);
        assert_eq!(output.chunks.len(), 2);

        let second = output.chunks[1].columns.clone().unwrap_or_default();
        assert_eq!(second[1].value, CellValue::Null);
        assert_eq!(second[2].value, CellValue::Number(4.0));
        Ok(())
    }

    #[test]
    fn mixed_integer_and_decimal_columns_infer_number() -> Result<(), Box<dyn std::error::Error>> {
        let source = "rising,falling\n4,3.5\n3.5,4\n";
        let output = CsvParser.parse(source.as_bytes(), &ParseConfig::new(FileType::Csv))?;
        let types: Vec<_> = output.columns.iter().map(|column| column.column_type).collect();
        assert_eq!(types, vec![ColumnType::Number, ColumnType::Number]);
        Ok(())
    }

    #[test]
    fn header_only_csv_is_columns_only() -> Result<(), Box<dyn std::error::Error>> {
        let output = CsvParser.parse(b"name,age\n", &ParseConfig::new(FileType::Csv))?;
        assert!(output.columns_only);
        assert!(output.chunks.is_empty());
        assert_eq!(output.columns.len(), 2);
        assert!(output.columns.iter().all(|column| column.column_type == ColumnType::String));
        Ok(())
    }

    #[test]
    fn target_columns_lend_their_ids() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = ParseConfig::new(FileType::Json);
        let mut known = TableColumn::new("name", ColumnType::String, true);
        known.id = 77;
        config.columns = vec![known];

        let output = JsonTableParser.parse(br#"[{"name": "ada", "age": 36}]"#, &config)?;
        let name = output
            .columns
            .iter()
            .find(|column| column.name == "name")
            .ok_or("missing name column")?;
        assert_eq!(name.id, 77);
        assert!(name.indexing);
        let age = output
            .columns
            .iter()
            .find(|column| column.name == "age")
            .ok_or("missing age column")?;
        assert_eq!(age.id, 0);
        assert_eq!(age.column_type, ColumnType::Integer);
        Ok(())
    }

    #[test]
    fn text_is_chunked_with_strategy() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = ParseConfig::new(FileType::Markdown);
        config.chunking = ChunkingStrategy::custom(12, "\n", 0);
        let output = TextParser.parse("first line\nsecond line".as_bytes(), &config)?;
        assert_eq!(output.chunks.len(), 2);
        assert!(output.columns.is_empty());
        Ok(())
    }

    #[test]
    fn discovery_filters_by_format() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("notes.md"), "# hi")?;
        fs::write(dir.path().join("sales.csv"), "a,b\n1,2\n")?;
        fs::write(dir.path().join("binary.bin"), [0u8, 1])?;

        assert_eq!(discover_files(dir.path(), None).len(), 2);
        let tables = discover_files(dir.path(), Some(FormatType::Table));
        assert_eq!(tables.len(), 1);
        assert!(tables[0].ends_with("sales.csv"));
        Ok(())
    }
}
