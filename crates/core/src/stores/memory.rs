use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::SearchError;
use crate::store::{
    Field, RetrieveOptions, ScoredDocument, SearchStore, SearchStoreManager, StoreDocument,
    StoreKind, StoreOptions, FIELD_CREATOR_ID, FIELD_DOCUMENT_ID, FIELD_ID, FIELD_TEXT_CONTENT,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process search backend. Vector mode scores by cosine similarity of embeddings,
/// full-text mode by the share of query terms found in the indexed fields.
pub struct MemorySearchStoreManager {
    kind: StoreKind,
    embedder: Option<Arc<dyn Embedder>>,
    collections: RwLock<HashMap<String, Arc<MemorySearchStore>>>,
}

impl MemorySearchStoreManager {
    pub fn vector(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            kind: StoreKind::Vector,
            embedder: Some(embedder),
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub fn full_text() -> Self {
        Self {
            kind: StoreKind::FullText,
            embedder: None,
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn new_store(&self, fields: &[Field]) -> Arc<MemorySearchStore> {
        Arc::new(MemorySearchStore {
            kind: self.kind,
            embedder: self.embedder.clone(),
            indexed_fields: fields
                .iter()
                .filter(|field| field.indexing)
                .map(|field| field.name.clone())
                .collect(),
            entries: RwLock::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl SearchStoreManager for MemorySearchStoreManager {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn create_collection(&self, collection: &str, fields: &[Field]) -> Result<(), SearchError> {
        let mut collections = self.collections.write().await;
        if !collections.contains_key(collection) {
            collections.insert(collection.to_string(), self.new_store(fields));
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), SearchError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn search_store(&self, collection: &str) -> Result<Arc<dyn SearchStore>, SearchError> {
        let mut collections = self.collections.write().await;
        let store = collections
            .entry(collection.to_string())
            .or_insert_with(|| self.new_store(&crate::store::base_fields()));
        Ok(Arc::clone(store) as Arc<dyn SearchStore>)
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    document: StoreDocument,
    partition: Option<(String, String)>,
    vector: Option<Vec<f32>>,
}

impl StoredEntry {
    fn field(&self, name: &str) -> Option<Value> {
        match name {
            FIELD_ID => Some(
                self.document
                    .id
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::from(self.document.id.clone())),
            ),
            FIELD_DOCUMENT_ID => Some(Value::from(self.document.document_id)),
            FIELD_CREATOR_ID => Some(Value::from(self.document.creator_id)),
            FIELD_TEXT_CONTENT => Some(Value::from(self.document.content.clone())),
            other => match &self.partition {
                Some((key, value)) if key == other => Some(Value::from(value.clone())),
                _ => self.document.extra.get(other).cloned(),
            },
        }
    }

    fn text_of(&self, name: &str) -> String {
        match self.field(name) {
            Some(Value::String(text)) => text,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

pub struct MemorySearchStore {
    kind: StoreKind,
    embedder: Option<Arc<dyn Embedder>>,
    indexed_fields: Vec<String>,
    entries: RwLock<BTreeMap<String, StoredEntry>>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn term_overlap(query_terms: &[String], text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let tokens: HashSet<String> = tokenize(text).into_iter().collect();
    let matched = query_terms.iter().filter(|term| tokens.contains(*term)).count();
    matched as f64 / query_terms.len() as f64
}

impl MemorySearchStore {
    fn embedder(&self) -> Result<&Arc<dyn Embedder>, SearchError> {
        self.embedder
            .as_ref()
            .ok_or_else(|| SearchError::Request("vector store has no embedder".to_string()))
    }

    fn admits(entry: &StoredEntry, options: &RetrieveOptions) -> bool {
        if let Some(key) = &options.partition_key {
            if !options.partitions.is_empty() {
                let in_partition = match &entry.partition {
                    Some((stored_key, value)) => {
                        stored_key == key && options.partitions.contains(value)
                    }
                    None => false,
                };
                if !in_partition {
                    return false;
                }
            }
        }
        match &options.dsl {
            Some(filter) => filter.matches(&|field| entry.field(field)),
            None => true,
        }
    }

    fn full_text_score(&self, entry: &StoredEntry, query: &str, options: &RetrieveOptions) -> f64 {
        let terms = tokenize(query);
        let mut score = term_overlap(&terms, &entry.document.content);
        for field in &self.indexed_fields {
            if field != FIELD_TEXT_CONTENT {
                score = score.max(term_overlap(&terms, &entry.text_of(field)));
            }
        }
        if let Some(multi_match) = &options.multi_match {
            let terms = tokenize(&multi_match.query);
            for field in &multi_match.fields {
                score = score.max(term_overlap(&terms, &entry.text_of(field)));
            }
        }
        score
    }
}

#[async_trait]
impl SearchStore for MemorySearchStore {
    async fn store(
        &self,
        documents: &[StoreDocument],
        options: &StoreOptions,
    ) -> Result<Vec<String>, SearchError> {
        let vectors = match self.kind {
            StoreKind::Vector => {
                let texts: Vec<String> = documents.iter().map(|doc| doc.content.clone()).collect();
                let vectors = self.embedder()?.embed_documents(&texts).await?;
                if vectors.len() != documents.len() {
                    return Err(SearchError::Request(format!(
                        "embedding count {} doesn't match document count {}",
                        vectors.len(),
                        documents.len()
                    )));
                }
                vectors.into_iter().map(Some).collect()
            }
            StoreKind::FullText => vec![None; documents.len()],
        };

        let partition = match (&options.partition_key, &options.partition) {
            (Some(key), Some(value)) => Some((key.clone(), value.clone())),
            _ => None,
        };

        let mut entries = self.entries.write().await;
        let mut ids = Vec::with_capacity(documents.len());
        for (document, vector) in documents.iter().zip(vectors) {
            ids.push(document.id.clone());
            entries.insert(
                document.id.clone(),
                StoredEntry {
                    document: document.clone(),
                    partition: partition.clone(),
                    vector,
                },
            );
        }
        Ok(ids)
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredDocument>, SearchError> {
        let query_vector = match self.kind {
            StoreKind::Vector => Some(self.embedder()?.embed_query(query).await?),
            StoreKind::FullText => None,
        };

        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredDocument> = entries
            .values()
            .filter(|entry| Self::admits(entry, options))
            .filter_map(|entry| {
                let score = match (&query_vector, &entry.vector) {
                    (Some(query), Some(vector)) => cosine_similarity(query, vector),
                    _ => self.full_text_score(entry, query, options),
                };
                if self.kind == StoreKind::FullText && score <= 0.0 {
                    return None;
                }
                if options.min_score.is_some_and(|min| score < min) {
                    return None;
                }
                Some(ScoredDocument {
                    id: entry.document.id.clone(),
                    content: entry.document.content.clone(),
                    score,
                    document_id: entry.document.document_id,
                })
            })
            .collect();

        scored.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.id.cmp(&right.id))
        });
        if let Some(top_k) = options.top_k {
            scored.truncate(top_k);
        }
        Ok(scored)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), SearchError> {
        let mut entries = self.entries.write().await;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }
}
