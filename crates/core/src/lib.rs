pub mod backends;
pub mod chunking;
pub mod config;
pub mod datacopy;
pub mod embeddings;
pub mod error;
pub mod eventbus;
pub mod idgen;
pub mod indexer;
pub mod ingest;
pub mod meta;
pub mod models;
pub mod nl2sql;
pub mod objectstore;
pub mod orchestrator;
pub mod parser;
pub mod rdb;
pub mod rerank;
pub mod schema;
pub mod service;
pub mod sql_rewriter;
pub mod store;
pub mod stores;

pub use backends::Backends;
pub use chunking::{chunk_text, normalize_whitespace, split_by_heading, split_fixed};
pub use config::{ChunkingDefaults, EngineConfig, IndexingConfig, RetrievalConfig, StorageConfig};
pub use datacopy::{CopyKnowledgeRequest, CopyKnowledgeResponse, CopyStatus, KnowledgeCopier};
pub use embeddings::{Embedder, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{KnowledgeError, Result, RewriteError, SearchError, StorageError};
pub use eventbus::{ChannelEventBus, Event, EventBus};
pub use idgen::{IdGenerator, SnowflakeIdGenerator};
pub use indexer::{Indexer, ReviewChunk, ReviewChunks};
pub use ingest::{CreateDocumentRequest, DocProcessor, DocumentInput, ProcessorKind};
pub use meta::{MemoryMetaStore, MetaStore};
pub use models::*;
pub use nl2sql::{Nl2Sql, VirtualColumn, VirtualTableSchema};
pub use objectstore::{LocalObjectStorage, ObjectStorage};
pub use orchestrator::{QueryRewriter, Retriever};
pub use parser::{discover_files, BuiltinParserManager, Parser, ParserManager};
pub use rdb::RelationalStore;
pub use rerank::{Reranker, RrfReranker};
pub use schema::{TableDataType, TableSchemaResponse};
pub use service::{
    CreateDocumentReviewRequest, CreateKnowledgeRequest, CreateSliceRequest, DocumentReview, KnowledgeService,
    ResegmentRequest, ReviewInput, TableInfoResponse, TableSchemaRequest, TableSource, UpdateDocumentRequest,
    UpdateKnowledgeRequest, UpdateSliceRequest,
};
pub use sql_rewriter::{rewrite_sql, sql_operation, table_names, SqlOperation, TableMapping};
pub use store::{SearchStore, SearchStoreManager, StoreKind};
pub use stores::{MemorySearchStoreManager, OpenSearchStoreManager, QdrantStoreManager, SqliteRdb};
