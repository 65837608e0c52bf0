pub mod memory;
pub mod opensearch;
pub mod qdrant;
pub mod sqlite;

pub use memory::MemorySearchStoreManager;
pub use opensearch::OpenSearchStoreManager;
pub use qdrant::QdrantStoreManager;
pub use sqlite::SqliteRdb;
