use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("invalid storage request: {0}")]
    InvalidRequest(String),

    #[error("event transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid table mapping: {0}")]
    InvalidMapping(String),

    #[error("sql parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("alias table name should not equal origin table name: {0}")]
    AliasConflict(String),

    #[error("sql contains no statement")]
    EmptyStatement,
}

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("non-retryable: {0}")]
    NonRetryable(String),

    #[error("system error: {0}")]
    System(String),

    #[error("document parse failed: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

impl KnowledgeError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Backend failures are worth a redelivery; everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Search(_) | Self::Storage(_))
    }
}

impl From<csv::Error> for KnowledgeError {
    fn from(value: csv::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

pub type Result<T, E = KnowledgeError> = std::result::Result<T, E>;
