use crate::backends::Backends;
use crate::config::EngineConfig;
use crate::datacopy::{CopyKnowledgeRequest, CopyKnowledgeResponse, KnowledgeCopier};
use crate::error::{KnowledgeError, Result};
use crate::eventbus::{ChannelEventBus, Event};
use crate::indexer::{Indexer, ReviewChunks};
use crate::ingest::{CreateDocumentRequest, DocProcessor};
use crate::meta::MetaStore;
use crate::models::{
    CaptionType, CellValue, ChunkingStrategy, ColumnData, Document, DocumentSource, DocumentStatus,
    FileType, FormatType, Knowledge, KnowledgeStatus, ParsingStrategy, RetrieveRequest, RetrieveResponse,
    Review, ReviewStatus, Slice, SliceStatus, TableColumn, TableInfo, RESERVED_ID_COLUMN,
};
use crate::nl2sql::Nl2Sql;
use crate::objectstore::ObjectStorage;
use crate::orchestrator::{QueryRewriter, Retriever};
use crate::rdb::{Condition, RelationalStore};
use crate::rerank::Reranker;
use crate::schema::{
    align_row, alter_table_schema, format_table_schema_response, load_sheet, rdb_row, select_slice_rows,
    validate_table_schema, RawSheet, TableDataType, TableSchemaResponse,
};
use crate::store::SearchStoreManager;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Rows returned by table previews.
pub const PREVIEW_ROW_COUNT: usize = 20;

#[derive(Debug, Clone)]
pub struct CreateKnowledgeRequest {
    pub name: String,
    pub description: String,
    pub space_id: i64,
    pub app_id: i64,
    pub creator_id: i64,
    pub format_type: FormatType,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateKnowledgeRequest {
    pub knowledge_id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<KnowledgeStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateDocumentRequest {
    pub document_id: i64,
    pub name: Option<String>,
    /// Target user columns of a table document; ids of kept columns must be preserved.
    pub table_columns: Option<Vec<TableColumn>>,
}

#[derive(Debug, Clone)]
pub struct ResegmentRequest {
    pub document_id: i64,
    pub parsing_strategy: Option<ParsingStrategy>,
    pub chunking_strategy: ChunkingStrategy,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSliceRequest {
    pub document_id: i64,
    pub creator_id: i64,
    /// 1-based position the new slice takes; zero or past-the-end appends where noted.
    pub position: usize,
    pub content: String,
    pub table_row: Option<Vec<ColumnData>>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSliceRequest {
    pub slice_id: i64,
    pub content: Option<String>,
    pub table_row: Option<Vec<ColumnData>>,
}

#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub name: String,
    pub file_type: FileType,
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct CreateDocumentReviewRequest {
    pub knowledge_id: i64,
    pub creator_id: i64,
    pub reviews: Vec<ReviewInput>,
    pub parsing_strategy: ParsingStrategy,
    pub chunking_strategy: ChunkingStrategy,
}

#[derive(Debug, Clone)]
pub struct DocumentReview {
    pub review: Review,
    /// Present once the preview has been prepared.
    pub chunks: Option<ReviewChunks>,
}

/// Table source: a stored document or raw object bytes.
#[derive(Debug, Clone)]
pub enum TableSource {
    Document(i64),
    Object { uri: String, file_type: FileType },
}

#[derive(Debug, Clone)]
pub struct TableSchemaRequest {
    pub source: TableSource,
    pub parsing_strategy: ParsingStrategy,
    pub data_type: TableDataType,
    /// Stored document whose schema the preview is projected onto.
    pub original_document_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfoResponse {
    pub columns: Vec<TableColumn>,
    pub preview: Vec<Vec<ColumnData>>,
}

/// Entry point for knowledge management, ingestion and retrieval.
pub struct KnowledgeService {
    backends: Backends,
    config: EngineConfig,
    indexer: Indexer,
    retriever: Retriever,
    copier: KnowledgeCopier,
}

impl KnowledgeService {
    pub fn new(backends: Backends, config: EngineConfig) -> Self {
        let indexer = Indexer::new(backends.clone(), config.clone());
        let retriever = Retriever::new(
            backends.meta.clone(),
            backends.rdb.clone(),
            backends.storage.clone(),
            backends.search_stores.clone(),
            &config,
        );
        let copier = KnowledgeCopier::new(backends.clone(), config.clone());
        Self {
            backends,
            config,
            indexer,
            retriever,
            copier,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.retriever = self.retriever.with_reranker(reranker);
        self
    }

    pub fn with_query_rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.retriever = self.retriever.with_query_rewriter(rewriter);
        self
    }

    pub fn with_nl2sql(mut self, nl2sql: Arc<dyn Nl2Sql>) -> Self {
        self.retriever = self.retriever.with_nl2sql(nl2sql);
        self
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs queued indexing events through the indexer until the queue is empty.
    pub async fn drain_events(&self, bus: &ChannelEventBus) -> Result<usize> {
        let indexer = &self.indexer;
        let delivered = bus
            .drain(self.config.indexing.max_redeliveries, |body| async move {
                indexer.handle_message(&body).await
            })
            .await?;
        Ok(delivered)
    }

    pub async fn create_knowledge(&self, request: CreateKnowledgeRequest) -> Result<Knowledge> {
        if request.name.trim().is_empty() {
            return Err(KnowledgeError::InvalidParameter("knowledge name is empty".to_string()));
        }
        if request.creator_id == 0 {
            return Err(KnowledgeError::InvalidParameter("creator id is empty".to_string()));
        }
        if request.space_id == 0 {
            return Err(KnowledgeError::InvalidParameter("space id is empty".to_string()));
        }

        let now = Utc::now();
        let knowledge = Knowledge {
            id: self.backends.idgen.gen_id(),
            name: request.name,
            description: request.description,
            space_id: request.space_id,
            app_id: request.app_id,
            creator_id: request.creator_id,
            format_type: request.format_type,
            status: KnowledgeStatus::Enable,
            created_at: now,
            updated_at: now,
        };
        self.backends.meta.create_knowledge(&knowledge).await?;
        info!(knowledge_id = knowledge.id, "knowledge created");
        Ok(knowledge)
    }

    pub async fn get_knowledge(&self, knowledge_id: i64) -> Result<Knowledge> {
        self.backends
            .meta
            .get_knowledge(knowledge_id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("knowledge", knowledge_id))
    }

    pub async fn update_knowledge(&self, request: UpdateKnowledgeRequest) -> Result<Knowledge> {
        let mut knowledge = self.get_knowledge(request.knowledge_id).await?;
        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(KnowledgeError::InvalidParameter("knowledge name is empty".to_string()));
            }
            knowledge.name = name;
        }
        if let Some(description) = request.description {
            knowledge.description = description;
        }
        if let Some(status) = request.status {
            knowledge.status = status;
        }
        knowledge.updated_at = Utc::now();
        self.backends.meta.update_knowledge(&knowledge).await?;
        Ok(knowledge)
    }

    pub async fn delete_knowledge(&self, knowledge_id: i64) -> Result<()> {
        self.get_knowledge(knowledge_id).await?;
        remove_knowledge(&self.backends, &self.config, knowledge_id).await?;
        info!(knowledge_id, "knowledge deleted");
        Ok(())
    }

    pub async fn create_document(&self, mut request: CreateDocumentRequest) -> Result<Vec<Document>> {
        if request.documents.is_empty() {
            return Err(KnowledgeError::InvalidParameter("no document to create".to_string()));
        }
        for document in &mut request.documents {
            if document.parsing_strategy.caption_type == CaptionType::Model {
                return Err(KnowledgeError::InvalidParameter(
                    "model image captions are not supported".to_string(),
                ));
            }
            document.chunking_strategy = self.config.chunking.resolve(&document.chunking_strategy);
            if document.uri.is_empty()
                && document.url.is_empty()
                && request.source != DocumentSource::CustomText
                && !document.is_append
            {
                return Err(KnowledgeError::InvalidParameter(format!(
                    "document {} has no source",
                    document.name
                )));
            }
        }
        let knowledge = self.get_knowledge(request.knowledge_id).await?;
        DocProcessor::new(&self.backends, &self.config, knowledge, request)
            .run()
            .await
    }

    pub async fn get_document(&self, document_id: i64) -> Result<Document> {
        self.backends
            .meta
            .get_document(document_id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("document", document_id))
    }

    pub async fn list_documents(&self, knowledge_id: i64) -> Result<Vec<Document>> {
        self.backends.meta.list_documents(knowledge_id).await
    }

    pub async fn update_document(&self, request: UpdateDocumentRequest) -> Result<Document> {
        let mut document = self.get_document(request.document_id).await?;
        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(KnowledgeError::InvalidParameter("document name is empty".to_string()));
            }
            if let Some(info) = document.table_info.as_mut() {
                info.virtual_table_name = name.clone();
            }
            document.name = name;
        }
        if let Some(columns) = request.table_columns {
            let info = document.table_info.as_ref().ok_or_else(|| {
                KnowledgeError::InvalidParameter(format!("document {} is not a table", document.id))
            })?;
            let altered = alter_table_schema(
                self.backends.rdb.as_ref(),
                self.backends.idgen.as_ref(),
                info,
                &columns,
            )
            .await?;
            document.table_info = Some(altered);
        }
        document.updated_at = Utc::now();
        self.backends.meta.update_document(&document).await?;
        Ok(document)
    }

    pub async fn delete_document(&self, document_id: i64) -> Result<()> {
        let document = self.get_document(document_id).await?;
        remove_document(&self.backends, &self.config, &document).await
    }

    pub async fn resegment_document(&self, request: ResegmentRequest) -> Result<Document> {
        let mut document = self.get_document(request.document_id).await?;
        if !document.status.is_writable() {
            return Err(KnowledgeError::InvalidParameter(format!(
                "document {} is not writable",
                document.id
            )));
        }
        if matches!(document.status, DocumentStatus::Chunking | DocumentStatus::Uploading) {
            return Err(KnowledgeError::InvalidParameter(format!(
                "document {} is being processed",
                document.id
            )));
        }
        if let Some(parsing) = request.parsing_strategy {
            document.parsing_strategy = parsing;
        }
        document.chunking_strategy = self.config.chunking.resolve(&request.chunking_strategy);
        document.is_append = false;
        document.status = DocumentStatus::Chunking;
        document.status_msg = String::new();
        document.updated_at = Utc::now();
        self.backends.meta.update_document(&document).await?;

        let body = Event::IndexDocument {
            knowledge_id: document.knowledge_id,
            document: document.clone(),
        }
        .encode()?;
        self.backends
            .bus
            .send(body, &document.knowledge_id.to_string())
            .await?;
        Ok(document)
    }

    /// Slices of a document ordered by sequence; table slices carry their row values.
    pub async fn list_slices(&self, document_id: i64) -> Result<Vec<Slice>> {
        let document = self.get_document(document_id).await?;
        let mut slices = self.backends.meta.list_slices(document_id).await?;
        if let Some(info) = table_of(&document) {
            let ids: Vec<i64> = slices.iter().map(|slice| slice.id).collect();
            let mut rows = select_slice_rows(self.backends.rdb.as_ref(), info, &ids).await?;
            for slice in &mut slices {
                slice.table_row = rows.remove(&slice.id);
            }
        }
        Ok(slices)
    }

    pub async fn create_slice(&self, request: CreateSliceRequest) -> Result<Slice> {
        let document = self.get_document(request.document_id).await?;
        if !document.status.is_writable() {
            return Err(KnowledgeError::InvalidParameter(format!(
                "document {} is not writable",
                document.id
            )));
        }
        let existing = self.backends.meta.list_slices(document.id).await?;

        let now = Utc::now();
        let mut slice = Slice {
            id: self.backends.idgen.gen_id(),
            knowledge_id: document.knowledge_id,
            document_id: document.id,
            creator_id: request.creator_id,
            sequence: 0.0,
            content: String::new(),
            table_row: None,
            status: SliceStatus::Processing,
            status_msg: String::new(),
            hit: 0,
            created_at: now,
            updated_at: now,
        };

        match table_of(&document) {
            Some(info) => {
                let values = request
                    .table_row
                    .ok_or_else(|| KnowledgeError::InvalidParameter("table slice needs a row".to_string()))?;
                let row = align_row(info, &values);
                slice.sequence = existing.last().map_or(1.0, |last| last.sequence + 1.0);
                self.backends
                    .rdb
                    .upsert_data(
                        &info.physical_table_name,
                        RESERVED_ID_COLUMN,
                        &[rdb_row(slice.id, &row)],
                    )
                    .await?;
                slice.table_row = Some(row);
            }
            None => {
                if request.content.trim().is_empty() {
                    return Err(KnowledgeError::InvalidParameter("slice content is empty".to_string()));
                }
                slice.sequence = insert_sequence(&existing, request.position)?;
                slice.content = request.content;
            }
        }

        self.backends
            .meta
            .batch_create_slices(std::slice::from_ref(&slice))
            .await?;
        let body = Event::IndexSlice {
            slice: slice.clone(),
            document: Some(document.clone()),
        }
        .encode()?;
        self.backends.bus.send(body, &document.id.to_string()).await?;
        Ok(slice)
    }

    pub async fn update_slice(&self, request: UpdateSliceRequest) -> Result<Slice> {
        let mut slice = self
            .backends
            .meta
            .get_slice(request.slice_id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("slice", request.slice_id))?;
        let document = self.get_document(slice.document_id).await?;

        match table_of(&document) {
            Some(info) => {
                let values = request
                    .table_row
                    .ok_or_else(|| KnowledgeError::InvalidParameter("table slice needs a row".to_string()))?;
                let row = align_row(info, &values);
                self.backends
                    .rdb
                    .upsert_data(
                        &info.physical_table_name,
                        RESERVED_ID_COLUMN,
                        &[rdb_row(slice.id, &row)],
                    )
                    .await?;
                slice.table_row = Some(row);
            }
            None => {
                let content = request
                    .content
                    .filter(|content| !content.trim().is_empty())
                    .ok_or_else(|| KnowledgeError::InvalidParameter("slice content is empty".to_string()))?;
                slice.content = content;
            }
        }
        slice.status = SliceStatus::Processing;
        slice.updated_at = Utc::now();
        self.backends.meta.update_slice(&slice).await?;

        let body = Event::IndexSlice {
            slice: slice.clone(),
            document: Some(document.clone()),
        }
        .encode()?;
        self.backends.bus.send(body, &document.id.to_string()).await?;
        Ok(slice)
    }

    pub async fn delete_slice(&self, slice_id: i64) -> Result<()> {
        let slice = self
            .backends
            .meta
            .get_slice(slice_id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("slice", slice_id))?;
        let document = self.get_document(slice.document_id).await?;
        if let Some(info) = table_of(&document) {
            self.backends
                .rdb
                .delete_data(
                    &info.physical_table_name,
                    &[Condition::Eq {
                        field: RESERVED_ID_COLUMN.to_string(),
                        value: CellValue::Integer(slice_id),
                    }],
                )
                .await?;
        }
        self.backends.meta.delete_slices(&[slice_id]).await?;
        self.backends
            .meta
            .update_document_slice_info(document.id)
            .await?;

        let body = Event::DeleteKnowledgeData {
            knowledge_id: document.knowledge_id,
            slice_ids: vec![slice_id],
        }
        .encode()?;
        self.backends.bus.send(body, &document.id.to_string()).await?;
        Ok(())
    }

    pub async fn create_document_review(&self, request: CreateDocumentReviewRequest) -> Result<Vec<Review>> {
        let knowledge = self.get_knowledge(request.knowledge_id).await?;
        if request.reviews.is_empty() {
            return Err(KnowledgeError::InvalidParameter("no document to review".to_string()));
        }
        let chunking = self.config.chunking.resolve(&request.chunking_strategy);
        let ids = self.backends.idgen.gen_ids(request.reviews.len());
        let sharding_key = knowledge.id.to_string();
        let now = Utc::now();

        let mut reviews = Vec::with_capacity(ids.len());
        for (input, id) in request.reviews.into_iter().zip(ids) {
            if input.uri.is_empty() {
                return Err(KnowledgeError::InvalidParameter(format!(
                    "review {} has no source",
                    input.name
                )));
            }
            let review = Review {
                id,
                knowledge_id: knowledge.id,
                name: input.name.clone(),
                uri: input.uri.clone(),
                file_type: input.file_type,
                creator_id: request.creator_id,
                status: ReviewStatus::Processing,
                chunk_resp_uri: None,
                created_at: now,
            };
            self.backends.meta.create_review(&review).await?;

            let document = Document {
                id: 0,
                knowledge_id: knowledge.id,
                name: input.name,
                file_type: input.file_type,
                format_type: input.file_type.format_type(),
                uri: input.uri,
                url: String::new(),
                source: DocumentSource::LocalUpload,
                creator_id: request.creator_id,
                space_id: knowledge.space_id,
                parsing_strategy: request.parsing_strategy.clone(),
                chunking_strategy: chunking.clone(),
                status: DocumentStatus::Init,
                status_msg: String::new(),
                table_info: None,
                is_append: false,
                slice_count: 0,
                char_count: 0,
                size: 0,
                created_at: now,
                updated_at: now,
            };
            let body = Event::DocumentReview {
                document,
                review: review.clone(),
            }
            .encode()?;
            self.backends.bus.send(body, &sharding_key).await?;
            reviews.push(review);
        }
        Ok(reviews)
    }

    pub async fn get_document_review(&self, review_id: i64) -> Result<DocumentReview> {
        let review = self
            .backends
            .meta
            .get_review(review_id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("review", review_id))?;
        let chunks = match (&review.status, &review.chunk_resp_uri) {
            (ReviewStatus::Enable, Some(uri)) => {
                let body = self.backends.storage.get_object(uri).await?;
                Some(serde_json::from_slice(&body)?)
            }
            _ => None,
        };
        Ok(DocumentReview { review, chunks })
    }

    /// Columns and the first rows of a table, either stored or parsed from its source.
    pub async fn get_document_table_info(&self, source: TableSource) -> Result<TableInfoResponse> {
        match source {
            TableSource::Document(document_id) => {
                let document = self.get_document(document_id).await?;
                let info = table_of(&document).ok_or_else(|| {
                    KnowledgeError::InvalidParameter(format!("document {document_id} is not a table"))
                })?;
                let slices = self.backends.meta.list_slices(document_id).await?;
                let ids: Vec<i64> = slices.iter().take(PREVIEW_ROW_COUNT).map(|slice| slice.id).collect();
                let mut rows = select_slice_rows(self.backends.rdb.as_ref(), info, &ids).await?;
                let preview = ids.iter().filter_map(|id| rows.remove(id)).collect();
                Ok(TableInfoResponse {
                    columns: info.user_columns().cloned().collect(),
                    preview,
                })
            }
            TableSource::Object { uri, file_type } => {
                let sheet = self
                    .load_object_sheet(&uri, file_type, &ParsingStrategy::default())
                    .await?;
                Ok(TableInfoResponse {
                    columns: sheet.columns,
                    preview: sheet.rows.into_iter().take(PREVIEW_ROW_COUNT).collect(),
                })
            }
        }
    }

    pub async fn get_table_schema(&self, request: TableSchemaRequest) -> Result<TableSchemaResponse> {
        let sheet = self
            .load_source_sheet(&request.source, &request.parsing_strategy)
            .await?;
        let original = TableSchemaResponse {
            table_sheet: Some(sheet.sheet.clone()),
            all_table_sheets: vec![sheet.sheet],
            table_meta: sheet.columns,
            preview_data: sheet.rows.into_iter().take(PREVIEW_ROW_COUNT).collect(),
        };

        let previous = match request.original_document_id {
            Some(document_id) => {
                let document = self.get_document(document_id).await?;
                table_of(&document).map(|info| info.user_columns().cloned().collect::<Vec<_>>())
            }
            None => None,
        };
        Ok(format_table_schema_response(
            original,
            previous.as_deref(),
            request.data_type,
        ))
    }

    /// Per-column problems of a new source against a stored table document; empty when valid.
    pub async fn validate_table_schema(
        &self,
        document_id: i64,
        source: TableSource,
        parsing: &ParsingStrategy,
    ) -> Result<BTreeMap<String, String>> {
        let document = self.get_document(document_id).await?;
        let info = table_of(&document).ok_or_else(|| {
            KnowledgeError::InvalidParameter(format!("document {document_id} is not a table"))
        })?;
        let sheet = self.load_source_sheet(&source, parsing).await?;
        Ok(validate_table_schema(info, &sheet))
    }

    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        self.retriever.retrieve(request).await
    }

    pub async fn copy_knowledge(&self, request: &CopyKnowledgeRequest) -> Result<CopyKnowledgeResponse> {
        self.copier.copy_knowledge(request).await
    }

    async fn load_source_sheet(&self, source: &TableSource, parsing: &ParsingStrategy) -> Result<RawSheet> {
        match source {
            TableSource::Document(document_id) => {
                let document = self.get_document(*document_id).await?;
                self.load_object_sheet(&document.uri, document.file_type, parsing)
                    .await
            }
            TableSource::Object { uri, file_type } => self.load_object_sheet(uri, *file_type, parsing).await,
        }
    }

    async fn load_object_sheet(&self, uri: &str, file_type: FileType, parsing: &ParsingStrategy) -> Result<RawSheet> {
        if file_type.format_type() != FormatType::Table {
            return Err(KnowledgeError::InvalidParameter(format!(
                "{file_type:?} is not a table format"
            )));
        }
        let bytes = self.backends.storage.get_object(uri).await?;
        load_sheet(self.backends.parsers.as_ref(), &bytes, file_type, parsing, &[])
    }
}

fn table_of(document: &Document) -> Option<&TableInfo> {
    if document.format_type == FormatType::Table {
        document.table_info.as_ref()
    } else {
        None
    }
}

/// Sequence for a slice inserted at 1-based `position` among `existing`, ordered by sequence.
fn insert_sequence(existing: &[Slice], position: usize) -> Result<f64> {
    let (Some(first), Some(last)) = (existing.first(), existing.last()) else {
        return if position <= 1 {
            Ok(1.0)
        } else {
            Err(KnowledgeError::InvalidParameter(format!(
                "position {position} out of range for an empty document"
            )))
        };
    };
    if position <= 1 {
        return Ok(first.sequence - 1.0);
    }
    if position > existing.len() {
        return Ok(last.sequence + 1.0);
    }

    let prev = existing[position - 2].sequence;
    let next = existing[position - 1].sequence;
    if prev.floor() + 1.0 < next {
        Ok(prev.floor() + 1.0)
    } else {
        Ok((prev + next) / 2.0)
    }
}

/// Drops a document's table, slices and metadata, then queues removal from the search backends.
pub(crate) async fn remove_document(backends: &Backends, config: &EngineConfig, document: &Document) -> Result<()> {
    if let Some(info) = table_of(document) {
        backends.rdb.drop_table(&info.physical_table_name, true).await?;
    }
    let slice_ids = backends.meta.delete_slices_by_document(document.id).await?;
    backends.meta.delete_document(document.id).await?;
    info!(
        document_id = document.id,
        slice_count = slice_ids.len(),
        collection = %config.indexing.collection_name(document.knowledge_id),
        "document deleted"
    );

    let body = Event::DeleteKnowledgeData {
        knowledge_id: document.knowledge_id,
        slice_ids,
    }
    .encode()?;
    backends.bus.send(body, &document.id.to_string()).await?;
    Ok(())
}

/// Cascading delete of a knowledge: physical tables, search collections, documents and slices.
pub(crate) async fn remove_knowledge(backends: &Backends, config: &EngineConfig, knowledge_id: i64) -> Result<()> {
    let documents = backends.meta.list_documents(knowledge_id).await?;
    for document in &documents {
        if let Some(info) = table_of(document) {
            if let Err(err) = backends.rdb.drop_table(&info.physical_table_name, true).await {
                warn!(document_id = document.id, error = %err, "failed to drop physical table");
            }
        }
    }

    let collection = config.indexing.collection_name(knowledge_id);
    for manager in &backends.search_stores {
        manager.drop_collection(&collection).await?;
    }

    for document in &documents {
        backends.meta.delete_slices_by_document(document.id).await?;
        backends.meta.delete_document(document.id).await?;
    }
    backends.meta.delete_knowledge(knowledge_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::TestBackends;
    use crate::ingest::DocumentInput;
    use crate::models::{ChunkType, ColumnType, RetrievalStrategy, SearchType};
    use crate::rdb::SelectRequest;
    use crate::schema::parse_rdb_rows;

    const MANUAL: &str = "# Boiler\nCheck the pressure valve every week.\n\n# Pump\nReplace the pump seal when it leaks.\n";

    async fn service_with_knowledge(
        format_type: FormatType,
    ) -> Result<(TestBackends, KnowledgeService, Knowledge), Box<dyn std::error::Error>> {
        let env = TestBackends::new().await?;
        let service = KnowledgeService::new(env.backends.clone(), EngineConfig::default());
        let knowledge = service
            .create_knowledge(CreateKnowledgeRequest {
                name: "plant".to_string(),
                description: String::new(),
                space_id: 1,
                app_id: 0,
                creator_id: 42,
                format_type,
            })
            .await?;
        Ok((env, service, knowledge))
    }

    async fn upload(
        env: &TestBackends,
        service: &KnowledgeService,
        knowledge: &Knowledge,
        name: &str,
        file_type: FileType,
        body: &[u8],
    ) -> Result<Document, Box<dyn std::error::Error>> {
        let key = format!("uploads/{name}");
        env.storage.put_object(&key, body).await?;
        let mut input = DocumentInput::new(name, file_type);
        input.uri = key;
        input.chunking_strategy = ChunkingStrategy::custom(1000, "\n", 0);
        let mut documents = service
            .create_document(CreateDocumentRequest {
                knowledge_id: knowledge.id,
                creator_id: 42,
                space_id: 1,
                source: DocumentSource::LocalUpload,
                documents: vec![input],
            })
            .await?;
        Ok(documents.remove(0))
    }

    fn text_slice(id: i64, sequence: f64) -> Slice {
        let now = Utc::now();
        Slice {
            id,
            knowledge_id: 1,
            document_id: 1,
            creator_id: 1,
            sequence,
            content: String::new(),
            table_row: None,
            status: SliceStatus::Done,
            status_msg: String::new(),
            hit: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_sequence_uses_neighbours() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(insert_sequence(&[], 0)?, 1.0);
        assert!(insert_sequence(&[], 3).is_err());

        let slices = vec![text_slice(1, 1.0), text_slice(2, 2.0), text_slice(3, 5.0)];
        assert_eq!(insert_sequence(&slices, 1)?, 0.0);
        assert_eq!(insert_sequence(&slices, 2)?, 1.5);
        assert_eq!(insert_sequence(&slices, 3)?, 3.0);
        assert_eq!(insert_sequence(&slices, 4)?, 6.0);
        Ok(())
    }

    #[tokio::test]
    async fn knowledge_requires_name_creator_and_space() -> Result<(), Box<dyn std::error::Error>> {
        let env = TestBackends::new().await?;
        let service = KnowledgeService::new(env.backends.clone(), EngineConfig::default());
        let err = service
            .create_knowledge(CreateKnowledgeRequest {
                name: " ".to_string(),
                description: String::new(),
                space_id: 1,
                app_id: 0,
                creator_id: 42,
                format_type: FormatType::Text,
            })
            .await
            .err()
            .ok_or("empty name accepted")?;
        assert!(matches!(err, KnowledgeError::InvalidParameter(_)));
        Ok(())
    }

    #[tokio::test]
    async fn markdown_upload_is_indexed_once() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Text).await?;
        let document = upload(&env, &service, &knowledge, "manual.md", FileType::Markdown, MANUAL.as_bytes()).await?;
        assert_eq!(document.status, DocumentStatus::Init);

        // batch event plus the per-document event it fans out to
        let delivered = service.drain_events(&env.bus).await?;
        assert_eq!(delivered, 2);

        let stored = service.get_document(document.id).await?;
        assert_eq!(stored.status, DocumentStatus::Enable);
        assert!(stored.slice_count > 0);
        assert_eq!(stored.size, MANUAL.len() as i64);

        let response = service
            .retrieve(&RetrieveRequest {
                query: "pump seal".to_string(),
                chat_history: Vec::new(),
                knowledge_ids: vec![knowledge.id],
                document_ids: Vec::new(),
                strategy: Some(RetrievalStrategy {
                    search_type: SearchType::FullText,
                    ..RetrievalStrategy::default()
                }),
            })
            .await?;
        assert!(!response.slices.is_empty());
        assert!(response.slices[0].content.contains("pump seal"));
        Ok(())
    }

    #[tokio::test]
    async fn slices_can_be_inserted_edited_and_deleted() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Text).await?;
        let document = upload(&env, &service, &knowledge, "notes.txt", FileType::Txt, b"first line\nsecond line").await?;
        service.drain_events(&env.bus).await?;
        let before = service.list_slices(document.id).await?;

        let inserted = service
            .create_slice(CreateSliceRequest {
                document_id: document.id,
                creator_id: 42,
                position: 1,
                content: "preface".to_string(),
                table_row: None,
            })
            .await?;
        assert_eq!(inserted.sequence, before[0].sequence - 1.0);
        service.drain_events(&env.bus).await?;
        let slices = service.list_slices(document.id).await?;
        assert_eq!(slices[0].id, inserted.id);
        assert_eq!(slices[0].status, SliceStatus::Done);

        service
            .update_slice(UpdateSliceRequest {
                slice_id: inserted.id,
                content: Some("foreword".to_string()),
                table_row: None,
            })
            .await?;
        service.drain_events(&env.bus).await?;
        let updated = env.meta.get_slice(inserted.id).await?.ok_or("slice missing")?;
        assert_eq!(updated.content, "foreword");

        service.delete_slice(inserted.id).await?;
        service.drain_events(&env.bus).await?;
        assert!(env.meta.get_slice(inserted.id).await?.is_none());
        assert_eq!(service.get_document(document.id).await?.slice_count, before.len() as i64);
        Ok(())
    }

    #[tokio::test]
    async fn table_slice_rows_live_in_the_physical_table() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Table).await?;
        let document = upload(&env, &service, &knowledge, "parts.csv", FileType::Csv, b"part,qty\nvalve,3\n").await?;
        service.drain_events(&env.bus).await?;

        let info = service
            .get_document(document.id)
            .await?
            .table_info
            .ok_or("table info missing")?;
        let part = info.user_column_by_name("part").ok_or("part column missing")?.clone();
        let slice = service
            .create_slice(CreateSliceRequest {
                document_id: document.id,
                creator_id: 42,
                position: 0,
                content: String::new(),
                table_row: Some(vec![ColumnData {
                    column_id: part.id,
                    column_name: part.name.clone(),
                    column_type: ColumnType::String,
                    value: CellValue::String("gasket".to_string()),
                }]),
            })
            .await?;
        service.drain_events(&env.bus).await?;

        let slices = service.list_slices(document.id).await?;
        assert_eq!(slices.len(), 2);
        let row = slices
            .iter()
            .find(|candidate| candidate.id == slice.id)
            .and_then(|candidate| candidate.table_row.clone())
            .ok_or("row missing")?;
        assert!(row
            .iter()
            .any(|value| value.value == CellValue::String("gasket".to_string())));

        service.delete_slice(slice.id).await?;
        let result = env
            .rdb
            .select_data(&SelectRequest::all(info.physical_table_name.clone()))
            .await?;
        assert_eq!(parse_rdb_rows(&info.columns, &result)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn table_schema_evolves_through_update_document() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Table).await?;
        let document = upload(&env, &service, &knowledge, "parts.csv", FileType::Csv, b"part,qty\nvalve,3\n").await?;

        let info = document.table_info.clone().ok_or("table info missing")?;
        let mut columns: Vec<TableColumn> = info.user_columns().cloned().collect();
        columns.push(TableColumn::new("supplier", ColumnType::String, false));
        let updated = service
            .update_document(UpdateDocumentRequest {
                document_id: document.id,
                name: Some("inventory".to_string()),
                table_columns: Some(columns),
            })
            .await?;

        let updated_info = updated.table_info.ok_or("table info missing")?;
        assert_eq!(updated_info.virtual_table_name, "inventory");
        assert_eq!(updated_info.user_columns().count(), 3);
        assert!(updated_info.id_column().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn table_source_is_validated_against_stored_schema() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Table).await?;
        let document = upload(&env, &service, &knowledge, "parts.csv", FileType::Csv, b"part,qty\nvalve,3\n").await?;

        env.storage.put_object("uploads/next.csv", b"part,qty\n,abc\n").await?;
        let problems = service
            .validate_table_schema(
                document.id,
                TableSource::Object {
                    uri: "uploads/next.csv".to_string(),
                    file_type: FileType::Csv,
                },
                &ParsingStrategy::default(),
            )
            .await?;
        assert_eq!(
            problems.get("qty").map(String::as_str),
            Some("column type invalid, expected=2, got=1")
        );

        let preview = service
            .get_document_table_info(TableSource::Object {
                uri: "uploads/parts.csv".to_string(),
                file_type: FileType::Csv,
            })
            .await?;
        assert_eq!(preview.columns.len(), 2);
        assert_eq!(preview.preview.len(), 1);

        let schema = service
            .get_table_schema(TableSchemaRequest {
                source: TableSource::Document(document.id),
                parsing_strategy: ParsingStrategy::default(),
                data_type: TableDataType::OnlySchema,
                original_document_id: None,
            })
            .await?;
        assert!(schema.preview_data.is_empty());
        assert_eq!(schema.table_meta.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn resegment_requeues_the_document() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Text).await?;
        let document = upload(&env, &service, &knowledge, "manual.md", FileType::Markdown, MANUAL.as_bytes()).await?;
        service.drain_events(&env.bus).await?;
        let first = service.get_document(document.id).await?.slice_count;

        let mut strategy = ChunkingStrategy::custom(1000, "\n", 0);
        strategy.chunk_type = ChunkType::LevelByHeading;
        strategy.max_depth = 1;
        let requeued = service
            .resegment_document(ResegmentRequest {
                document_id: document.id,
                parsing_strategy: None,
                chunking_strategy: strategy,
            })
            .await?;
        assert_eq!(requeued.status, DocumentStatus::Chunking);

        assert_eq!(service.drain_events(&env.bus).await?, 1);
        let stored = service.get_document(document.id).await?;
        assert_eq!(stored.status, DocumentStatus::Enable);
        assert_eq!(stored.slice_count, 2);
        assert!(first > 0);
        Ok(())
    }

    #[tokio::test]
    async fn review_preview_is_readable_after_indexing() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Text).await?;
        env.storage.put_object("uploads/draft.txt", b"alpha\nbeta").await?;
        let reviews = service
            .create_document_review(CreateDocumentReviewRequest {
                knowledge_id: knowledge.id,
                creator_id: 42,
                reviews: vec![ReviewInput {
                    name: "draft.txt".to_string(),
                    file_type: FileType::Txt,
                    uri: "uploads/draft.txt".to_string(),
                }],
                parsing_strategy: ParsingStrategy::default(),
                chunking_strategy: ChunkingStrategy::custom(1000, "\n", 0),
            })
            .await?;
        let pending = service.get_document_review(reviews[0].id).await?;
        assert!(pending.chunks.is_none());

        service.drain_events(&env.bus).await?;
        let ready = service.get_document_review(reviews[0].id).await?;
        assert_eq!(ready.review.status, ReviewStatus::Enable);
        let chunks = ready.chunks.ok_or("chunks missing")?;
        assert!(!chunks.chunks.is_empty());
        assert!(chunks.chunks.iter().all(|chunk| chunk.chunk_type == "text"));
        Ok(())
    }

    #[tokio::test]
    async fn deleting_knowledge_cascades() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Table).await?;
        let document = upload(&env, &service, &knowledge, "parts.csv", FileType::Csv, b"part,qty\nvalve,3\n").await?;
        service.drain_events(&env.bus).await?;
        let info = service
            .get_document(document.id)
            .await?
            .table_info
            .ok_or("table info missing")?;

        service.delete_knowledge(knowledge.id).await?;
        assert!(env.meta.get_knowledge(knowledge.id).await?.is_none());
        assert!(env.meta.get_document(document.id).await?.is_none());
        assert!(env.meta.list_slices(document.id).await?.is_empty());
        assert!(env
            .rdb
            .select_data(&SelectRequest::all(info.physical_table_name))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn deleted_document_is_removed_from_search() -> Result<(), Box<dyn std::error::Error>> {
        let (env, service, knowledge) = service_with_knowledge(FormatType::Text).await?;
        let document = upload(&env, &service, &knowledge, "manual.md", FileType::Markdown, MANUAL.as_bytes()).await?;
        service.drain_events(&env.bus).await?;

        service.delete_document(document.id).await?;
        assert_eq!(service.drain_events(&env.bus).await?, 1);
        let store = env
            .full_text
            .search_store(&service.config().indexing.collection_name(knowledge.id))
            .await?;
        let hits = store
            .retrieve("pump", &crate::store::RetrieveOptions::default())
            .await?;
        assert!(hits.is_empty());
        Ok(())
    }
}
