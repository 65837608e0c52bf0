use crate::backends::Backends;
use crate::config::EngineConfig;
use crate::error::{KnowledgeError, Result};
use crate::eventbus::Event;
use crate::models::{
    CellValue, ChunkingStrategy, ColumnData, Document, DocumentStatus, FormatType,
    KnowledgeStatus, Review, ReviewStatus, Slice, SliceStatus, TableInfo, RESERVED_ID_COLUMN,
};
use crate::parser::{ParseConfig, ParseOutput, ParsedChunk};
use crate::rdb::{Condition, SelectRequest};
use crate::schema::{align_row, compact_row_content, parse_rdb_rows, physical_column_name, rdb_row};
use crate::store::{base_fields, Field, StoreDocument, StoreOptions, FIELD_DOCUMENT_ID};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// One chunk of a document preview, as written to object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewChunk {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub chunk_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReviewChunks {
    pub chunks: Vec<ReviewChunk>,
}

/// Search-backend schema of a document's collection.
pub fn search_fields(document: &Document, enable_compact_table: bool) -> Vec<Field> {
    let mut fields = base_fields();
    if document.format_type == FormatType::Table && !enable_compact_table {
        if let Some(info) = &document.table_info {
            fields.extend(
                info.user_columns()
                    .filter(|column| column.indexing)
                    .map(|column| Field::text(physical_column_name(column.id), true)),
            );
        }
    }
    fields
}

/// Search-backend form of a slice. Table rows are either compacted into the content or spread
/// over one `col_{id}` field per indexing column.
pub fn store_document(document: &Document, slice: &Slice, enable_compact_table: bool) -> StoreDocument {
    let mut extra = BTreeMap::new();
    let content = match (&document.table_info, &slice.table_row) {
        (Some(info), Some(values)) if document.format_type == FormatType::Table => {
            if enable_compact_table {
                compact_row_content(info, values)
            } else {
                for value in values {
                    let indexing = info
                        .user_columns()
                        .any(|column| column.id == value.column_id && column.indexing);
                    if indexing {
                        extra.insert(
                            physical_column_name(value.column_id),
                            serde_json::Value::from(value.value.to_display_string()),
                        );
                    }
                }
                String::new()
            }
        }
        _ => slice.content.clone(),
    };

    StoreDocument {
        id: slice.id.to_string(),
        content,
        creator_id: slice.creator_id,
        document_id: slice.document_id,
        extra,
    }
}

fn table_info(document: &Document) -> Result<Option<&TableInfo>> {
    if document.format_type != FormatType::Table {
        return Ok(None);
    }
    document
        .table_info
        .as_ref()
        .map(Some)
        .ok_or_else(|| KnowledgeError::NonRetryable(format!("table document {} has no schema", document.id)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn review_text(chunk: &ParsedChunk) -> String {
    match &chunk.columns {
        Some(values) => {
            let object: serde_json::Map<String, serde_json::Value> = values
                .iter()
                .map(|value| (value.column_name.clone(), value.value.to_json()))
                .collect();
            serde_json::Value::Object(object).to_string()
        }
        None => chunk.content.clone(),
    }
}

/// Consumer side of the event transport: turns stored documents into searchable slices.
pub struct Indexer {
    backends: Backends,
    config: EngineConfig,
}

impl Indexer {
    pub fn new(backends: Backends, config: EngineConfig) -> Self {
        Self { backends, config }
    }

    /// Handles one transport message. Permanent failures are logged and acknowledged; only
    /// retryable failures come back as errors so the transport redelivers them.
    #[tracing::instrument(skip_all, fields(bytes = body.len()))]
    pub async fn handle_message(&self, body: &[u8]) -> Result<()> {
        let event = match Event::decode(body) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping undecodable event");
                return Ok(());
            }
        };

        let name = event.name();
        match self.handle_event(event).await {
            Ok(()) => {
                debug!(event = name, "event handled");
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                error!(event = name, error = %err, "event failed, retry requested");
                Err(err)
            }
            Err(err) => {
                warn!(event = name, error = %err, "event failed permanently, dropped");
                Ok(())
            }
        }
    }

    pub async fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            Event::IndexDocuments {
                knowledge_id,
                documents,
            } => self.index_documents(knowledge_id, documents).await,
            Event::IndexDocument { document, .. } => self.index_document(document).await,
            Event::IndexSlice { slice, document } => self.index_slice(slice, document).await,
            Event::DeleteKnowledgeData {
                knowledge_id,
                slice_ids,
            } => self.delete_knowledge_data(knowledge_id, &slice_ids).await,
            Event::DocumentReview { document, review } => self.document_review(document, review).await,
        }
    }

    /// Fans a batch out into one event per document, sharded by knowledge id.
    pub async fn index_documents(&self, knowledge_id: i64, documents: Vec<Document>) -> Result<()> {
        let sharding_key = knowledge_id.to_string();
        for document in documents {
            let body = Event::IndexDocument {
                knowledge_id,
                document,
            }
            .encode()?;
            self.backends.bus.send(body, &sharding_key).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(document_id = document.id, knowledge_id = document.knowledge_id))]
    pub async fn index_document(&self, document: Document) -> Result<()> {
        let document = self.writable_document(document).await?;
        let document_id = document.id;

        let outcome = AssertUnwindSafe(self.run_index_document(document))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(KnowledgeError::System(format!(
                "indexing panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };

        if let Err(err) = &result {
            error!(error = %err, "document indexing failed");
            // retryable failures are redelivered, so the document stays in progress
            let status = if err.is_retryable() {
                DocumentStatus::Chunking
            } else {
                DocumentStatus::Failed
            };
            if let Err(status_err) = self
                .backends
                .meta
                .update_document_status(document_id, status, &err.to_string())
                .await
            {
                error!(error = %status_err, "failed to record document failure");
            }
        }
        result
    }

    /// Re-reads the document and its knowledge. The event copy keeps the fields that describe
    /// this run (source uri, strategies, append flag); the stored copy supplies the schema.
    async fn writable_document(&self, mut document: Document) -> Result<Document> {
        let meta = &self.backends.meta;
        let knowledge = meta.get_knowledge(document.knowledge_id).await?.ok_or_else(|| {
            KnowledgeError::NonRetryable(format!("knowledge {} not found", document.knowledge_id))
        })?;
        let stored = meta
            .get_document(document.id)
            .await?
            .ok_or_else(|| KnowledgeError::NonRetryable(format!("document {} not found", document.id)))?;

        if knowledge.status == KnowledgeStatus::Disable || !stored.status.is_writable() {
            return Err(KnowledgeError::NonRetryable(format!(
                "document not writable, knowledge_id={}, document_id={}, status={:?}",
                knowledge.id, stored.id, stored.status
            )));
        }

        if stored.table_info.is_some() {
            document.table_info = stored.table_info;
        }
        Ok(document)
    }

    async fn run_index_document(&self, document: Document) -> Result<()> {
        let meta = &self.backends.meta;
        let collection = self.config.indexing.collection_name(document.knowledge_id);
        let info = table_info(&document)?;

        if !document.is_append {
            self.clear_document(&document, info, &collection).await?;
        }
        meta.update_document_status(document.id, DocumentStatus::Chunking, "")
            .await?;

        let bytes = self.backends.storage.get_object(&document.uri).await?;
        let output = self.parse(&document, &bytes)?;
        let chunks = if info.is_some() && output.columns_only {
            Vec::new()
        } else {
            output.chunks
        };

        if !chunks.is_empty() {
            let offset = if document.is_append {
                meta.last_sequence(document.id)
                    .await?
                    .map_or(0.0, |last| last + 1.0)
            } else {
                0.0
            };
            let ids = self.allocate_ids(chunks.len());
            let slices = build_slices(&document, info, chunks, &ids, offset);

            if let Some(info) = info {
                self.upsert_rows(info, &slices).await?;
            }
            meta.batch_create_slices(&slices).await?;

            if let Err(err) = self.store_slices(&document, &collection, &slices).await {
                if let Err(status_err) = meta
                    .batch_set_slice_status(&ids, SliceStatus::Failed, &err.to_string())
                    .await
                {
                    error!(error = %status_err, "failed to record slice failure");
                }
                return Err(err);
            }
            meta.batch_set_slice_status(&ids, SliceStatus::Done, "").await?;
            info!(slices = slices.len(), "slices indexed");
        }

        meta.update_document_status(document.id, DocumentStatus::Enable, "")
            .await?;
        meta.update_document_slice_info(document.id).await?;
        Ok(())
    }

    /// Removes the previous slices of a document from every backend before a rebuild.
    async fn clear_document(&self, document: &Document, info: Option<&TableInfo>, collection: &str) -> Result<()> {
        let ids = self.backends.meta.get_document_slice_ids(&[document.id]).await?;
        if ids.is_empty() {
            return Ok(());
        }

        self.backends.meta.delete_slices_by_document(document.id).await?;
        if let Some(info) = info {
            self.backends
                .rdb
                .delete_data(
                    &info.physical_table_name,
                    &[Condition::In {
                        field: RESERVED_ID_COLUMN.to_string(),
                        values: ids.iter().map(|id| CellValue::Integer(*id)).collect(),
                    }],
                )
                .await?;
        }
        self.delete_from_search_stores(collection, &ids).await?;
        debug!(removed = ids.len(), "previous slices cleared");
        Ok(())
    }

    fn chunking_for(&self, document: &Document) -> ChunkingStrategy {
        self.config.chunking.resolve(&document.chunking_strategy)
    }

    fn parse(&self, document: &Document, bytes: &[u8]) -> Result<ParseOutput> {
        let config = ParseConfig {
            file_type: document.file_type,
            parsing: document.parsing_strategy.clone(),
            chunking: self.chunking_for(document),
            columns: document
                .table_info
                .as_ref()
                .map(|info| info.columns.clone())
                .unwrap_or_default(),
        };
        self.backends
            .parsers
            .get_parser(document.file_type)?
            .parse(bytes, &config)
    }

    /// Ids come from the generator in fixed-size batches.
    fn allocate_ids(&self, count: usize) -> Vec<i64> {
        let batch = self.config.indexing.slice_id_batch_size.max(1);
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            let size = batch.min(count - ids.len());
            ids.extend(self.backends.idgen.gen_ids(size));
        }
        ids
    }

    async fn upsert_rows(&self, info: &TableInfo, slices: &[Slice]) -> Result<()> {
        let rows: Vec<_> = slices
            .iter()
            .filter_map(|slice| slice.table_row.as_deref().map(|values| rdb_row(slice.id, values)))
            .collect();
        if rows.is_empty() {
            return Ok(());
        }

        let outcome = self
            .backends
            .rdb
            .upsert_data(&info.physical_table_name, RESERVED_ID_COLUMN, &rows)
            .await?;
        if outcome.total() != rows.len() as u64 {
            return Err(KnowledgeError::System(format!(
                "upsert row count mismatch, expected={}, affected={}",
                rows.len(),
                outcome.total()
            )));
        }
        Ok(())
    }

    async fn store_slices(&self, document: &Document, collection: &str, slices: &[Slice]) -> Result<()> {
        let compact = self.config.indexing.enable_compact_table;
        let fields = search_fields(document, compact);
        let options = StoreOptions {
            partition_key: Some(FIELD_DOCUMENT_ID.to_string()),
            partition: Some(document.id.to_string()),
            indexing_fields: fields
                .iter()
                .filter(|field| field.indexing)
                .map(|field| field.name.clone())
                .collect(),
        };
        let documents: Vec<StoreDocument> = slices
            .iter()
            .map(|slice| store_document(document, slice, compact))
            .collect();
        let uncaptioned_image = document.format_type == FormatType::Image
            && documents.len() == 1
            && documents[0].content.is_empty();

        for manager in &self.backends.search_stores {
            manager.create_collection(collection, &fields).await?;
            if uncaptioned_image {
                continue;
            }
            let store = manager.search_store(collection).await?;
            store.store(&documents, &options).await?;
            debug!(kind = ?manager.kind(), count = documents.len(), "slices stored");
        }
        Ok(())
    }

    async fn delete_from_search_stores(&self, collection: &str, ids: &[i64]) -> Result<()> {
        let keys: Vec<String> = ids.iter().map(i64::to_string).collect();
        let deletes = self.backends.search_stores.iter().map(|manager| {
            let keys = &keys;
            async move {
                let store = manager.search_store(collection).await?;
                store.delete(keys).await
            }
        });
        futures::future::try_join_all(deletes).await?;
        Ok(())
    }

    /// Pushes one created or edited slice to every search backend.
    #[tracing::instrument(skip_all, fields(slice_id = slice.id))]
    pub async fn index_slice(&self, mut slice: Slice, document: Option<Document>) -> Result<()> {
        if slice.id == 0 {
            return Err(KnowledgeError::NonRetryable("slice id not set".to_string()));
        }
        let document = match document {
            Some(document) => document,
            None => self
                .backends
                .meta
                .get_document(slice.document_id)
                .await?
                .ok_or_else(|| KnowledgeError::not_found("document", slice.document_id))?,
        };
        if slice.document_id == 0 {
            slice.document_id = document.id;
        }
        if slice.knowledge_id == 0 {
            slice.knowledge_id = document.knowledge_id;
        }

        let meta = &self.backends.meta;
        if let Err(err) = self.run_index_slice(&document, &mut slice).await {
            if let Err(status_err) = meta
                .batch_set_slice_status(&[slice.id], SliceStatus::Failed, &err.to_string())
                .await
            {
                error!(error = %status_err, "failed to record slice failure");
            }
            return Err(err);
        }
        meta.batch_set_slice_status(&[slice.id], SliceStatus::Done, "").await?;
        meta.update_document_slice_info(slice.document_id).await?;
        Ok(())
    }

    async fn run_index_slice(&self, document: &Document, slice: &mut Slice) -> Result<()> {
        if let Some(info) = table_info(document)? {
            if slice.table_row.is_none() {
                slice.table_row = Some(self.load_table_row(info, slice.id).await?);
            }
        }
        let collection = self.config.indexing.collection_name(slice.knowledge_id);
        self.store_slices(document, &collection, std::slice::from_ref(slice))
            .await
    }

    async fn load_table_row(&self, info: &TableInfo, slice_id: i64) -> Result<Vec<ColumnData>> {
        let result = self
            .backends
            .rdb
            .select_data(&SelectRequest {
                conditions: vec![Condition::Eq {
                    field: RESERVED_ID_COLUMN.to_string(),
                    value: CellValue::Integer(slice_id),
                }],
                ..SelectRequest::all(info.physical_table_name.clone())
            })
            .await?;
        let columns: Vec<_> = info.user_columns().cloned().collect();
        parse_rdb_rows(&columns, &result)?
            .into_iter()
            .next()
            .ok_or_else(|| KnowledgeError::not_found("table row", slice_id))
    }

    #[tracing::instrument(skip(self, slice_ids), fields(count = slice_ids.len()))]
    pub async fn delete_knowledge_data(&self, knowledge_id: i64, slice_ids: &[i64]) -> Result<()> {
        if slice_ids.is_empty() {
            return Ok(());
        }
        let collection = self.config.indexing.collection_name(knowledge_id);
        self.delete_from_search_stores(&collection, slice_ids).await
    }

    /// Parses a review source and writes the preview chunks to object storage.
    #[tracing::instrument(skip_all, fields(review_id = review.id))]
    pub async fn document_review(&self, document: Document, review: Review) -> Result<()> {
        let meta = &self.backends.meta;
        let mut stored = meta
            .get_review(review.id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("review", review.id))?;
        if stored.status == ReviewStatus::Enable {
            debug!("review already prepared");
            return Ok(());
        }

        match self.write_review_chunks(&document, &stored).await {
            Ok(key) => {
                stored.status = ReviewStatus::Enable;
                stored.chunk_resp_uri = Some(key);
                meta.update_review(&stored).await
            }
            Err(err) => {
                if !err.is_retryable() {
                    stored.status = ReviewStatus::Failed;
                    meta.update_review(&stored).await?;
                }
                Err(err)
            }
        }
    }

    async fn write_review_chunks(&self, document: &Document, review: &Review) -> Result<String> {
        let bytes = self.backends.storage.get_object(&review.uri).await?;
        let output = self.parse(document, &bytes)?;
        let ids = self.allocate_ids(output.chunks.len());
        let chunks = output
            .chunks
            .iter()
            .zip(ids)
            .map(|(chunk, id)| ReviewChunk {
                id: id.to_string(),
                text: review_text(chunk),
                chunk_type: "text".to_string(),
            })
            .collect();
        let body = serde_json::to_vec(&ReviewChunks { chunks })?;

        let key = format!(
            "DocReview/{}_{}_{}.txt",
            review.creator_id,
            Utc::now().timestamp_millis(),
            review.id
        );
        self.backends.storage.put_object(&key, &body).await?;
        Ok(key)
    }
}

fn build_slices(
    document: &Document,
    info: Option<&TableInfo>,
    chunks: Vec<ParsedChunk>,
    ids: &[i64],
    offset: f64,
) -> Vec<Slice> {
    let now = Utc::now();
    chunks
        .into_iter()
        .zip(ids)
        .enumerate()
        .map(|(index, (chunk, id))| {
            let (content, table_row) = match (info, chunk.columns) {
                (Some(info), Some(values)) => (String::new(), Some(align_row(info, &values))),
                (_, _) => (chunk.content, None),
            };
            Slice {
                id: *id,
                knowledge_id: document.knowledge_id,
                document_id: document.id,
                creator_id: document.creator_id,
                sequence: offset + index as f64,
                content,
                table_row,
                status: SliceStatus::Processing,
                status_msg: String::new(),
                hit: 0,
                created_at: now,
                updated_at: now,
            }
        })
        .collect()
}
