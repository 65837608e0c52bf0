use crate::error::SearchError;
use crate::store::{
    DslFilter, Field, FieldType, RetrieveOptions, ScoredDocument, SearchStore, SearchStoreManager,
    StoreDocument, StoreKind, StoreOptions, FIELD_CREATOR_ID, FIELD_DOCUMENT_ID,
    FIELD_TEXT_CONTENT,
};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Full-text backend over the OpenSearch REST API, one index per collection.
pub struct OpenSearchStoreManager {
    client: Arc<Client>,
    endpoint: String,
}

impl OpenSearchStoreManager {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

fn backend_error(status: StatusCode) -> SearchError {
    SearchError::BackendResponse {
        backend: "opensearch".to_string(),
        details: status.to_string(),
    }
}

fn mapping_for(field: &Field) -> Value {
    match (field.field_type, field.indexing) {
        (FieldType::Int64, _) => json!({"type": "long"}),
        (FieldType::Text, true) => json!({"type": "text", "analyzer": "standard"}),
        (FieldType::Text, false) => json!({"type": "keyword"}),
    }
}

#[async_trait]
impl SearchStoreManager for OpenSearchStoreManager {
    fn kind(&self) -> StoreKind {
        StoreKind::FullText
    }

    async fn create_collection(&self, collection: &str, fields: &[Field]) -> Result<(), SearchError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, collection))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(backend_error(response.status()));
        }

        let mut properties = Map::new();
        for field in fields {
            properties.insert(field.name.clone(), mapping_for(field));
        }
        properties.insert(FIELD_DOCUMENT_ID.to_string(), json!({"type": "long"}));

        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, collection))
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0
                },
                "mappings": {
                    "dynamic": true,
                    "properties": properties
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Request(format!(
                "open-search index setup failed with {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.endpoint, collection))
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(backend_error(response.status()))
    }

    async fn search_store(&self, collection: &str) -> Result<Arc<dyn SearchStore>, SearchError> {
        Ok(Arc::new(OpenSearchStore {
            client: Arc::clone(&self.client),
            endpoint: self.endpoint.clone(),
            index_name: collection.to_string(),
        }))
    }
}

pub struct OpenSearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
}

fn filter_clause(filter: &DslFilter) -> Value {
    match filter {
        DslFilter::In { field, values } => json!({"terms": {field: values}}),
        DslFilter::Eq { field, value } => json!({"term": {field: value}}),
        DslFilter::And(filters) => json!({
            "bool": {"filter": filters.iter().map(filter_clause).collect::<Vec<_>>()}
        }),
    }
}

fn build_filters(options: &RetrieveOptions) -> Vec<Value> {
    let mut predicates = Vec::new();

    if let Some(key) = &options.partition_key {
        if !options.partitions.is_empty() {
            predicates.push(json!({"terms": {key: options.partitions}}));
        }
    }
    if let Some(dsl) = &options.dsl {
        predicates.push(filter_clause(dsl));
    }

    predicates
}

#[async_trait]
impl SearchStore for OpenSearchStore {
    async fn store(
        &self,
        documents: &[StoreDocument],
        options: &StoreOptions,
    ) -> Result<Vec<String>, SearchError> {
        let mut operations = Vec::new();

        for document in documents {
            operations.push(json!({
                "index": {
                    "_index": self.index_name,
                    "_id": document.id,
                }
            }));
            let mut source = Map::new();
            source.insert(FIELD_TEXT_CONTENT.to_string(), json!(document.content));
            source.insert(FIELD_CREATOR_ID.to_string(), json!(document.creator_id));
            source.insert(FIELD_DOCUMENT_ID.to_string(), json!(document.document_id));
            for (name, value) in &document.extra {
                source.insert(name.clone(), value.clone());
            }
            if let (Some(key), Some(partition)) = (&options.partition_key, &options.partition) {
                source
                    .entry(key.clone())
                    .or_insert_with(|| json!(partition));
            }
            operations.push(Value::Object(source));
        }

        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let payload: String = operations
            .into_iter()
            .map(|value| serde_json::to_string(&value))
            .collect::<Result<Vec<_>, serde_json::Error>>()?
            .join("\n")
            + "\n";

        let response = self
            .client
            .post(format!("{}/_bulk?refresh=true", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let body: Value = response.json().await?;
        if body.pointer("/errors").and_then(Value::as_bool).unwrap_or(false) {
            return Err(SearchError::BackendResponse {
                backend: "opensearch".to_string(),
                details: "bulk request reported item errors".to_string(),
            });
        }

        Ok(documents.iter().map(|document| document.id.clone()).collect())
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredDocument>, SearchError> {
        let mut should = vec![json!({"match": {FIELD_TEXT_CONTENT: query}})];
        if let Some(multi_match) = &options.multi_match {
            should.push(json!({
                "multi_match": {
                    "query": multi_match.query,
                    "fields": multi_match.fields
                }
            }));
        }

        let mut body = json!({
            "size": options.top_k.unwrap_or(10),
            "query": {
                "bool": {
                    "should": should,
                    "minimum_should_match": 1,
                    "filter": build_filters(options)
                }
            }
        });
        if let Some(min_score) = options.min_score {
            body["min_score"] = json!(min_score);
        }

        let response = self
            .client
            .post(format!("{}/{}/_search", self.endpoint, self.index_name))
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let response_json: Value = response.json().await?;
        let hits = response_json
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for raw in hits {
            let id = raw
                .pointer("/_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let score = raw.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0);
            let content = raw
                .pointer("/_source/text_content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let document_id = raw
                .pointer("/_source/document_id")
                .and_then(Value::as_i64)
                .unwrap_or_default();

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

        let response = self
            .client
            .post(format!(
                "{}/{}/_delete_by_query?refresh=true",
                self.endpoint, self.index_name
            ))
            .json(&json!({"query": {"ids": {"values": ids}}}))
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(backend_error(response.status()))
    }
}
