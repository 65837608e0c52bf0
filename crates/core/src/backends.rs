use crate::eventbus::EventBus;
use crate::idgen::IdGenerator;
use crate::meta::MetaStore;
use crate::objectstore::ObjectStorage;
use crate::parser::ParserManager;
use crate::rdb::RelationalStore;
use crate::store::SearchStoreManager;
use std::sync::Arc;

/// Collaborators shared by ingestion, indexing and retrieval. Built once by the caller and
/// handed to every service constructor.
#[derive(Clone)]
pub struct Backends {
    pub meta: Arc<dyn MetaStore>,
    pub rdb: Arc<dyn RelationalStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub search_stores: Vec<Arc<dyn SearchStoreManager>>,
    pub parsers: Arc<dyn ParserManager>,
    pub idgen: Arc<dyn IdGenerator>,
    pub bus: Arc<dyn EventBus>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Backends;
    use crate::embeddings::HashingEmbedder;
    use crate::eventbus::ChannelEventBus;
    use crate::idgen::SnowflakeIdGenerator;
    use crate::meta::MemoryMetaStore;
    use crate::objectstore::LocalObjectStorage;
    use crate::parser::BuiltinParserManager;
    use crate::store::SearchStoreManager;
    use crate::stores::{MemorySearchStoreManager, SqliteRdb};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// In-process backends with handles to the concrete fakes.
    pub struct TestBackends {
        pub backends: Backends,
        pub meta: Arc<MemoryMetaStore>,
        pub rdb: Arc<SqliteRdb>,
        pub storage: Arc<LocalObjectStorage>,
        pub bus: Arc<ChannelEventBus>,
        pub full_text: Arc<MemorySearchStoreManager>,
        pub vector: Arc<MemorySearchStoreManager>,
        _root: TempDir,
    }

    impl TestBackends {
        pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
            let root = tempfile::tempdir()?;
            let meta = Arc::new(MemoryMetaStore::new());
            let rdb = Arc::new(SqliteRdb::in_memory().await?);
            let storage = Arc::new(LocalObjectStorage::new(root.path()));
            let bus = Arc::new(ChannelEventBus::new());
            let full_text = Arc::new(MemorySearchStoreManager::full_text());
            let vector = Arc::new(MemorySearchStoreManager::vector(Arc::new(HashingEmbedder::default())));
            let backends = Backends {
                meta: meta.clone(),
                rdb: rdb.clone(),
                storage: storage.clone(),
                search_stores: vec![
                    vector.clone() as Arc<dyn SearchStoreManager>,
                    full_text.clone(),
                ],
                parsers: Arc::new(BuiltinParserManager::default()),
                idgen: Arc::new(SnowflakeIdGenerator::new()),
                bus: bus.clone(),
            };
            Ok(Self {
                backends,
                meta,
                rdb,
                storage,
                bus,
                full_text,
                vector,
                _root: root,
            })
        }
    }
}
