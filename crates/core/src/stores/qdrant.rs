use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::store::{
    DslFilter, Field, RetrieveOptions, ScoredDocument, SearchStore, SearchStoreManager,
    StoreDocument, StoreKind, StoreOptions, FIELD_CREATOR_ID, FIELD_DOCUMENT_ID,
    FIELD_TEXT_CONTENT,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Vector backend over the Qdrant REST API. Embeddings are computed client-side.
pub struct QdrantStoreManager {
    endpoint: String,
    client: Client,
    embedder: Arc<dyn Embedder>,
}

impl QdrantStoreManager {
    pub fn new(endpoint: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            embedder,
        }
    }
}

fn backend_error(status: StatusCode) -> SearchError {
    SearchError::BackendResponse {
        backend: "qdrant".to_string(),
        details: status.to_string(),
    }
}

#[async_trait]
impl SearchStoreManager for QdrantStoreManager {
    fn kind(&self) -> StoreKind {
        StoreKind::Vector
    }

    async fn create_collection(&self, collection: &str, _fields: &[Field]) -> Result<(), SearchError> {
        let url = format!("{}/collections/{}", self.endpoint, collection);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(&url)
            .json(&json!({
                "vectors": {
                    "size": self.embedder.dimensions(),
                    "distance": "Cosine"
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(format!("{}/collections/{}", self.endpoint, collection))
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(backend_error(response.status()))
    }

    async fn search_store(&self, collection: &str) -> Result<Arc<dyn SearchStore>, SearchError> {
        Ok(Arc::new(QdrantStore {
            endpoint: self.endpoint.clone(),
            collection: collection.to_string(),
            client: self.client.clone(),
            embedder: Arc::clone(&self.embedder),
        }))
    }
}

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    embedder: Arc<dyn Embedder>,
}

fn point_id(id: &str) -> Result<u64, SearchError> {
    id.parse::<u64>()
        .map_err(|_| SearchError::Request(format!("qdrant point id must be unsigned, got {id}")))
}

fn condition(filter: &DslFilter) -> Value {
    match filter {
        DslFilter::In { field, values } => json!({"key": field, "match": {"any": values}}),
        DslFilter::Eq { field, value } => json!({"key": field, "match": {"value": value}}),
        DslFilter::And(filters) => json!({
            "must": filters.iter().map(condition).collect::<Vec<_>>()
        }),
    }
}

fn build_filter(options: &RetrieveOptions) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(key) = &options.partition_key {
        if !options.partitions.is_empty() {
            must.push(json!({"key": key, "match": {"any": options.partitions}}));
        }
    }
    if let Some(dsl) = &options.dsl {
        must.push(condition(dsl));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

#[async_trait]
impl SearchStore for QdrantStore {
    async fn store(
        &self,
        documents: &[StoreDocument],
        options: &StoreOptions,
    ) -> Result<Vec<String>, SearchError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = documents.iter().map(|doc| doc.content.clone()).collect();
        let embeddings = self.embedder.embed_documents(&texts).await?;
        if documents.len() != embeddings.len() {
            return Err(SearchError::Request(format!(
                "embedding count {} doesn't match document count {}",
                embeddings.len(),
                documents.len()
            )));
        }

        let points = documents
            .iter()
            .zip(embeddings.iter())
            .map(|(document, embedding)| {
                let mut payload = Map::new();
                payload.insert(FIELD_TEXT_CONTENT.to_string(), json!(document.content));
                payload.insert(FIELD_CREATOR_ID.to_string(), json!(document.creator_id));
                payload.insert(FIELD_DOCUMENT_ID.to_string(), json!(document.document_id));
                for (name, value) in &document.extra {
                    payload.insert(name.clone(), value.clone());
                }
                if let (Some(key), Some(partition)) = (&options.partition_key, &options.partition)
                {
                    payload.insert(format!("{key}_partition"), json!(partition));
                }

                Ok(json!({
                    "id": point_id(&document.id)?,
                    "vector": embedding,
                    "payload": payload,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        Ok(documents.iter().map(|document| document.id.clone()).collect())
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredDocument>, SearchError> {
        let query_vector = self.embedder.embed_query(query).await?;

        let mut scoped = options.clone();
        if let Some(key) = &options.partition_key {
            scoped.partition_key = Some(format!("{key}_partition"));
        }

        let mut body = json!({
            "vector": query_vector,
            "limit": options.top_k.unwrap_or(10),
            "with_payload": true,
        });
        if let Some(filter) = build_filter(&scoped) {
            body["filter"] = filter;
        }
        if let Some(min_score) = options.min_score {
            body["score_threshold"] = json!(min_score);
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for hit in hits {
            let id = hit
                .pointer("/id")
                .and_then(Value::as_u64)
                .map(|id| id.to_string())
                .unwrap_or_default();
            let document_id = hit
                .pointer("/payload/document_id")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
            let content = hit
                .pointer("/payload/text_content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            result.push(ScoredDocument {
                id,
                content,
                score,
                document_id,
            });
        }

        Ok(result)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), SearchError> {
        if ids.is_empty() {
            return Ok(());
        }
        let points = ids
            .iter()
            .map(|id| point_id(id))
            .collect::<Result<Vec<_>, SearchError>>()?;

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(backend_error(response.status()))
    }
}
