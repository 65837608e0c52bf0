use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical primary-key column of every knowledge table. Never part of a user-facing schema.
pub const RESERVED_ID_COLUMN: &str = "_knowledge_slice_id";

pub const DEFAULT_CHUNK_SIZE: usize = 800;
pub const DEFAULT_SEPARATOR: &str = "\n";
pub const DEFAULT_OVERLAP_PERCENT: usize = 10;
pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FormatType {
    Text,
    Table,
    Image,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KnowledgeStatus {
    Init,
    Enable,
    Disable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Knowledge {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub space_id: i64,
    pub app_id: i64,
    pub creator_id: i64,
    pub format_type: FormatType,
    pub status: KnowledgeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentSource {
    LocalUpload,
    CustomText,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    Init,
    Uploading,
    Chunking,
    Enable,
    Disable,
    Deleted,
    Failed,
}

impl DocumentStatus {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Disable | Self::Deleted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileType {
    Txt,
    Markdown,
    Csv,
    Json,
    Png,
    Jpeg,
    Webp,
}

impl FileType {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Markdown),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        name.rsplit_once('.')
            .and_then(|(_, extension)| Self::from_extension(extension))
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Markdown => "md",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }

    pub fn format_type(self) -> FormatType {
        match self {
            Self::Txt | Self::Markdown => FormatType::Text,
            Self::Csv | Self::Json => FormatType::Table,
            Self::Png | Self::Jpeg | Self::Webp => FormatType::Image,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum CaptionType {
    #[default]
    Manual,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsingStrategy {
    pub extract_image: bool,
    pub extract_table: bool,
    pub image_ocr: bool,
    pub filter_pages: Vec<u32>,
    pub sheet_id: u32,
    pub header_line: usize,
    pub data_start_line: usize,
    /// Zero means every data row.
    pub row_count: usize,
    pub caption_type: CaptionType,
}

impl Default for ParsingStrategy {
    fn default() -> Self {
        Self {
            extract_image: false,
            extract_table: false,
            image_ocr: false,
            filter_pages: Vec::new(),
            sheet_id: 0,
            header_line: 0,
            data_start_line: 1,
            row_count: 0,
            caption_type: CaptionType::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Default,
    Custom,
    LevelByHeading,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingStrategy {
    pub chunk_type: ChunkType,
    pub chunk_size: usize,
    pub separator: String,
    /// Overlap between neighbouring chunks as a percentage of `chunk_size`.
    pub overlap: usize,
    pub trim_space: bool,
    pub trim_url_and_email: bool,
    pub max_depth: usize,
    pub save_title: bool,
}

impl ChunkingStrategy {
    pub fn default_fixed() -> Self {
        Self {
            chunk_type: ChunkType::Custom,
            chunk_size: DEFAULT_CHUNK_SIZE,
            separator: DEFAULT_SEPARATOR.to_string(),
            overlap: DEFAULT_OVERLAP_PERCENT,
            trim_space: true,
            trim_url_and_email: false,
            max_depth: DEFAULT_MAX_DEPTH,
            save_title: false,
        }
    }

    pub fn custom(chunk_size: usize, separator: impl Into<String>, overlap: usize) -> Self {
        Self {
            chunk_size,
            separator: separator.into(),
            overlap,
            ..Self::default_fixed()
        }
    }

    pub fn resolve(self) -> Self {
        if self.chunk_type == ChunkType::Default {
            Self::default_fixed()
        } else {
            self
        }
    }
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self {
            chunk_type: ChunkType::Default,
            ..Self::default_fixed()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Unknown,
    String,
    Integer,
    Time,
    Number,
    Boolean,
    Image,
}

impl ColumnType {
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::String => 1,
            Self::Integer => 2,
            Self::Time => 3,
            Self::Number => 4,
            Self::Boolean => 5,
            Self::Image => 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum CellValue {
    Null,
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Time(DateTime<Utc>),
    Image(String),
}

const TIME_LAYOUTS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(value) | Self::Image(value) => value.is_empty(),
            _ => false,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(value) | Self::Image(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Time(value) => value.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(value) => serde_json::Value::from(*value),
            Self::Number(value) => serde_json::Value::from(*value),
            Self::Boolean(value) => serde_json::Value::from(*value),
            other => serde_json::Value::from(other.to_display_string()),
        }
    }

    pub fn infer_type(raw: &str) -> ColumnType {
        let raw = raw.trim();
        if raw.is_empty() {
            ColumnType::Unknown
        } else if raw.parse::<i64>().is_ok() {
            ColumnType::Integer
        } else if raw.parse::<f64>().is_ok() {
            ColumnType::Number
        } else if raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("false") {
            ColumnType::Boolean
        } else if parse_time(raw).is_some() {
            ColumnType::Time
        } else {
            ColumnType::String
        }
    }

    /// Converts raw source text into a value of `column_type`, falling back to a string.
    pub fn parse_as(raw: &str, column_type: ColumnType) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Null;
        }
        let parsed = match column_type {
            ColumnType::Integer => trimmed.parse().ok().map(Self::Integer),
            ColumnType::Number => trimmed.parse().ok().map(Self::Number),
            ColumnType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Self::Boolean(true)),
                "false" | "0" => Some(Self::Boolean(false)),
                _ => None,
            },
            ColumnType::Time => parse_time(trimmed).map(Self::Time),
            ColumnType::Image => Some(Self::Image(trimmed.to_string())),
            ColumnType::String | ColumnType::Unknown => None,
        };
        parsed.unwrap_or_else(|| Self::String(raw.to_string()))
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.with_timezone(&Utc));
    }
    for layout in TIME_LAYOUTS {
        if let Ok(value) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(value.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|value| value.and_utc())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnData {
    pub column_id: i64,
    pub column_name: String,
    pub column_type: ColumnType,
    pub value: CellValue,
}

impl ColumnData {
    pub fn empty(column: &TableColumn) -> Self {
        Self {
            column_id: column.id,
            column_name: column.name.clone(),
            column_type: column.column_type,
            value: CellValue::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableColumn {
    pub id: i64,
    pub name: String,
    pub column_type: ColumnType,
    pub description: String,
    pub indexing: bool,
    pub sequence: i64,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType, indexing: bool) -> Self {
        Self {
            id: 0,
            name: name.into(),
            column_type,
            description: String::new(),
            indexing,
            sequence: 0,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.name == RESERVED_ID_COLUMN
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableInfo {
    pub virtual_table_name: String,
    pub physical_table_name: String,
    pub table_desc: String,
    pub columns: Vec<TableColumn>,
}

impl TableInfo {
    /// Columns visible to callers; the reserved primary-key column is filtered out here and only here.
    pub fn user_columns(&self) -> impl Iterator<Item = &TableColumn> + '_ {
        self.columns.iter().filter(|column| !column.is_reserved())
    }

    pub fn id_column(&self) -> Option<&TableColumn> {
        self.columns.iter().find(|column| column.is_reserved())
    }

    pub fn user_column_by_name(&self, name: &str) -> Option<&TableColumn> {
        self.user_columns().find(|column| column.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableSheet {
    pub sheet_id: u32,
    pub sheet_name: String,
    pub header_line_idx: usize,
    pub start_line_idx: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: i64,
    pub knowledge_id: i64,
    pub name: String,
    pub file_type: FileType,
    pub format_type: FormatType,
    pub uri: String,
    pub url: String,
    pub source: DocumentSource,
    pub creator_id: i64,
    pub space_id: i64,
    pub parsing_strategy: ParsingStrategy,
    pub chunking_strategy: ChunkingStrategy,
    pub status: DocumentStatus,
    pub status_msg: String,
    pub table_info: Option<TableInfo>,
    pub is_append: bool,
    pub slice_count: i64,
    pub char_count: i64,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SliceStatus {
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slice {
    pub id: i64,
    pub knowledge_id: i64,
    pub document_id: i64,
    pub creator_id: i64,
    pub sequence: f64,
    pub content: String,
    /// Row values of a table slice; persisted rows keep them only in the relational backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_row: Option<Vec<ColumnData>>,
    pub status: SliceStatus,
    pub status_msg: String,
    pub hit: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReviewStatus {
    Processing,
    Enable,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub id: i64,
    pub knowledge_id: i64,
    pub name: String,
    pub uri: String,
    pub file_type: FileType,
    pub creator_id: i64,
    pub status: ReviewStatus,
    pub chunk_resp_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CopyTaskStatus {
    Create,
    InProgress,
    Success,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyDataTask {
    pub task_key: String,
    pub origin_id: i64,
    pub target_id: i64,
    pub status: CopyTaskStatus,
    pub error_msg: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SearchType {
    Semantic,
    FullText,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalStrategy {
    pub top_k: usize,
    pub min_score: Option<f64>,
    pub search_type: SearchType,
    pub enable_nl2sql: bool,
    pub enable_query_rewrite: bool,
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_score: None,
            search_type: SearchType::Hybrid,
            enable_nl2sql: false,
            enable_query_rewrite: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetrieveRequest {
    pub query: String,
    pub chat_history: Vec<ChatMessage>,
    pub knowledge_ids: Vec<i64>,
    pub document_ids: Vec<i64>,
    pub strategy: Option<RetrievalStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrieveSlice {
    pub slice: Slice,
    pub score: f64,
    pub knowledge_name: String,
    pub document_name: String,
    pub document_url: String,
    /// Caller-ready content: resolved image links for text, the row as JSON for tables.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetrieveResponse {
    pub slices: Vec<RetrieveSlice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_types_are_inferred_from_text() {
        assert_eq!(CellValue::infer_type(""), ColumnType::Unknown);
        assert_eq!(CellValue::infer_type("42"), ColumnType::Integer);
        assert_eq!(CellValue::infer_type("4.2"), ColumnType::Number);
        assert_eq!(CellValue::infer_type("TRUE"), ColumnType::Boolean);
        assert_eq!(CellValue::infer_type("2024-03-01 10:00:00"), ColumnType::Time);
        assert_eq!(CellValue::infer_type("pump"), ColumnType::String);
    }

    #[test]
    fn unparsable_values_fall_back_to_string() {
        assert_eq!(CellValue::parse_as("12", ColumnType::Integer), CellValue::Integer(12));
        assert_eq!(
            CellValue::parse_as("twelve", ColumnType::Integer),
            CellValue::String("twelve".to_string())
        );
        assert_eq!(CellValue::parse_as("  ", ColumnType::String), CellValue::Null);
    }

    #[test]
    fn user_columns_hide_the_reserved_column() {
        let info = TableInfo {
            virtual_table_name: "sales".to_string(),
            physical_table_name: "table_1".to_string(),
            table_desc: String::new(),
            columns: vec![
                TableColumn::new(RESERVED_ID_COLUMN, ColumnType::Integer, false),
                TableColumn::new("region", ColumnType::String, true),
            ],
        };
        let names: Vec<_> = info.user_columns().map(|column| column.name.as_str()).collect();
        assert_eq!(names, vec!["region"]);
        assert!(info.id_column().is_some());
    }

    #[test]
    fn default_chunk_strategy_resolves_to_fixed_size() {
        let resolved = ChunkingStrategy::default().resolve();
        assert_eq!(resolved.chunk_type, ChunkType::Custom);
        assert_eq!(resolved.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(resolved.overlap, DEFAULT_OVERLAP_PERCENT);
    }
}
