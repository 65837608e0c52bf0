use crate::error::{KnowledgeError, StorageError};
use crate::models::{
    ChunkType, ChunkingStrategy, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_DEPTH, DEFAULT_OVERLAP_PERCENT,
    DEFAULT_SEPARATOR,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunking: ChunkingDefaults,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, KnowledgeError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, KnowledgeError> {
        let raw = std::fs::read_to_string(path).map_err(StorageError::from)?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingDefaults {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_overlap")]
    pub overlap_percent: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ChunkingDefaults {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            separator: default_separator(),
            overlap_percent: default_overlap(),
            max_depth: default_max_depth(),
        }
    }
}

impl ChunkingDefaults {
    /// Fixed-size policy a `Default` chunk request resolves to.
    pub fn strategy(&self) -> ChunkingStrategy {
        ChunkingStrategy {
            chunk_type: ChunkType::Custom,
            chunk_size: self.chunk_size,
            separator: self.separator.clone(),
            overlap: self.overlap_percent,
            max_depth: self.max_depth,
            ..ChunkingStrategy::default_fixed()
        }
    }

    pub fn resolve(&self, requested: &ChunkingStrategy) -> ChunkingStrategy {
        if requested.chunk_type == ChunkType::Default {
            self.strategy()
        } else {
            requested.clone()
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}
fn default_overlap() -> usize {
    DEFAULT_OVERLAP_PERCENT
}
fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_concurrency: default_search_concurrency(),
            default_top_k: default_top_k(),
            rrf_k: default_rrf_k(),
        }
    }
}

fn default_search_concurrency() -> usize {
    2
}
fn default_top_k() -> usize {
    3
}
fn default_rrf_k() -> f64 {
    60.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_id_batch_size")]
    pub slice_id_batch_size: usize,
    #[serde(default = "default_enable_compact_table")]
    pub enable_compact_table: bool,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    #[serde(default = "default_copy_concurrency")]
    pub copy_concurrency: usize,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            slice_id_batch_size: default_id_batch_size(),
            enable_compact_table: default_enable_compact_table(),
            collection_prefix: default_collection_prefix(),
            copy_concurrency: default_copy_concurrency(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

impl IndexingConfig {
    pub fn collection_name(&self, knowledge_id: i64) -> String {
        format!("{}{}", self.collection_prefix, knowledge_id)
    }
}

fn default_id_batch_size() -> usize {
    100
}
fn default_enable_compact_table() -> bool {
    true
}
fn default_collection_prefix() -> String {
    "knowledge_".to_string()
}
fn default_copy_concurrency() -> usize {
    10
}
fn default_max_redeliveries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_url")]
    pub sqlite_url: String,
    #[serde(default = "default_object_root")]
    pub object_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_url: default_sqlite_url(),
            object_root: default_object_root(),
        }
    }
}

fn default_sqlite_url() -> String {
    "sqlite::memory:".to_string()
}
fn default_object_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config = EngineConfig::from_toml_str("")?;
        assert_eq!(config.indexing.slice_id_batch_size, 100);
        assert!(config.indexing.enable_compact_table);
        assert_eq!(config.retrieval.search_concurrency, 2);
        assert_eq!(config.indexing.collection_name(7), "knowledge_7");
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config = EngineConfig::from_toml_str(
            r#"
            [indexing]
            enable_compact_table = false
            collection_prefix = "kb_"

            [retrieval]
            rrf_k = 10.0
            "#,
        )?;
        assert!(!config.indexing.enable_compact_table);
        assert_eq!(config.indexing.collection_name(3), "kb_3");
        assert_eq!(config.retrieval.rrf_k, 10.0);
        assert_eq!(config.chunking.chunk_size, DEFAULT_CHUNK_SIZE);
        Ok(())
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let result = EngineConfig::from_toml_str("[indexing\n");
        assert!(matches!(result, Err(KnowledgeError::Config(_))));
    }
}
