use crate::backends::Backends;
use crate::config::EngineConfig;
use crate::error::{KnowledgeError, Result, StorageError};
use crate::eventbus::Event;
use crate::models::{
    ChunkingStrategy, Document, DocumentSource, DocumentStatus, FileType, FormatType,
    Knowledge, ParsingStrategy, TableColumn, TableInfo,
};
use crate::schema::{create_physical_table, load_sheet};
use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Object key prefix for bytes materialized during ingestion.
pub const KNOWLEDGE_OBJECT_PREFIX: &str = "BizTypeKnowledge";

/// Caller input for one document of a create request.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// Existing document id; required for table append, ignored otherwise.
    pub id: i64,
    pub name: String,
    pub file_type: FileType,
    /// Object key of already-stored bytes.
    pub uri: String,
    /// Downloaded into object storage when `uri` is empty.
    pub url: String,
    /// Inline body of a custom-text document.
    pub raw_content: Option<String>,
    pub parsing_strategy: ParsingStrategy,
    pub chunking_strategy: ChunkingStrategy,
    /// Schema of a new table document; inferred from the source header when empty.
    pub table_columns: Vec<TableColumn>,
    pub table_desc: String,
    pub is_append: bool,
    /// Source byte length; measured from the stored object when zero.
    pub size: i64,
}

impl DocumentInput {
    pub fn new(name: impl Into<String>, file_type: FileType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            file_type,
            uri: String::new(),
            url: String::new(),
            raw_content: None,
            parsing_strategy: ParsingStrategy::default(),
            chunking_strategy: ChunkingStrategy::default(),
            table_columns: Vec::new(),
            table_desc: String::new(),
            is_append: false,
            size: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateDocumentRequest {
    pub knowledge_id: i64,
    pub creator_id: i64,
    pub space_id: i64,
    pub source: DocumentSource,
    pub documents: Vec<DocumentInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    PlainUpload,
    CustomText,
    TableUpload,
    TableAppend,
}

impl ProcessorKind {
    pub fn select(knowledge: &Knowledge, source: DocumentSource, is_append: bool) -> Self {
        match (knowledge.format_type, source, is_append) {
            (FormatType::Table, _, true) => Self::TableAppend,
            (FormatType::Table, _, false) => Self::TableUpload,
            (_, DocumentSource::CustomText, _) => Self::CustomText,
            _ => Self::PlainUpload,
        }
    }
}

/// Runs the four creation steps for one request: prepare source, build metadata, persist
/// metadata, emit the indexing job.
pub struct DocProcessor<'a> {
    kind: ProcessorKind,
    backends: &'a Backends,
    config: &'a EngineConfig,
    knowledge: Knowledge,
    request: CreateDocumentRequest,
    documents: Vec<Document>,
    created_tables: Vec<String>,
}

impl<'a> DocProcessor<'a> {
    pub fn new(
        backends: &'a Backends,
        config: &'a EngineConfig,
        knowledge: Knowledge,
        request: CreateDocumentRequest,
    ) -> Self {
        let is_append = request.documents.iter().any(|document| document.is_append);
        let kind = ProcessorKind::select(&knowledge, request.source, is_append);
        Self {
            kind,
            backends,
            config,
            knowledge,
            request,
            documents: Vec::new(),
            created_tables: Vec::new(),
        }
    }

    pub fn kind(&self) -> ProcessorKind {
        self.kind
    }

    #[tracing::instrument(skip_all, fields(knowledge_id = self.knowledge.id, kind = ?self.kind))]
    pub async fn run(mut self) -> Result<Vec<Document>> {
        self.before_create().await?;
        self.build_db_model().await?;
        self.insert_db_model().await?;
        self.indexing().await?;
        info!(documents = self.documents.len(), "documents created");
        Ok(self.documents)
    }

    /// Makes sure every document's bytes sit in object storage under a known key.
    pub async fn before_create(&mut self) -> Result<()> {
        let creator_id = self.request.creator_id;
        for input in &mut self.request.documents {
            match self.kind {
                ProcessorKind::CustomText => {
                    let content = input.raw_content.take().ok_or_else(|| {
                        KnowledgeError::InvalidParameter(format!("document {} has no content", input.name))
                    })?;
                    let key = object_key(creator_id, FileType::Txt);
                    self.backends.storage.put_object(&key, content.as_bytes()).await?;
                    input.size = content.len() as i64;
                    input.uri = key;
                    input.file_type = FileType::Txt;
                }
                _ if input.uri.is_empty() && !input.url.is_empty() => {
                    let bytes = download(&input.url).await?;
                    let key = object_key(creator_id, input.file_type);
                    self.backends.storage.put_object(&key, &bytes).await?;
                    debug!(url = %input.url, key = %key, "source downloaded");
                    input.size = bytes.len() as i64;
                    input.uri = key;
                }
                _ if input.uri.is_empty() => {
                    return Err(KnowledgeError::InvalidParameter(format!(
                        "document {} has neither uri nor url",
                        input.name
                    )))
                }
                _ => {}
            }
            if input.size <= 0 {
                input.size = self.backends.storage.object_size(&input.uri).await? as i64;
            }
        }
        Ok(())
    }

    /// Allocates ids and builds the document rows. New table documents get their physical
    /// table here.
    pub async fn build_db_model(&mut self) -> Result<()> {
        if self.kind == ProcessorKind::TableAppend {
            return self.build_append_model().await;
        }

        let inputs = std::mem::take(&mut self.request.documents);
        let ids = self.backends.idgen.gen_ids(inputs.len());
        for (input, id) in inputs.iter().zip(ids) {
            let mut document = self.new_document(id, input);
            if self.kind == ProcessorKind::TableUpload {
                match self.create_table(input).await {
                    Ok(info) => {
                        self.created_tables.push(info.physical_table_name.clone());
                        document.table_info = Some(info);
                    }
                    Err(err) => {
                        self.drop_created_tables().await;
                        return Err(err);
                    }
                }
            }
            self.documents.push(document);
        }
        self.request.documents = inputs;
        Ok(())
    }

    async fn build_append_model(&mut self) -> Result<()> {
        for input in &self.request.documents {
            let mut document = self
                .backends
                .meta
                .get_document(input.id)
                .await?
                .ok_or_else(|| KnowledgeError::not_found("document", input.id))?;
            if document.knowledge_id != self.knowledge.id || document.table_info.is_none() {
                return Err(KnowledgeError::InvalidParameter(format!(
                    "document {} is not a table of knowledge {}",
                    input.id, self.knowledge.id
                )));
            }
            document.uri = input.uri.clone();
            document.file_type = input.file_type;
            document.parsing_strategy = input.parsing_strategy.clone();
            document.is_append = true;
            self.documents.push(document);
        }
        Ok(())
    }

    fn new_document(&self, id: i64, input: &DocumentInput) -> Document {
        let now = Utc::now();
        Document {
            id,
            knowledge_id: self.knowledge.id,
            name: input.name.clone(),
            file_type: input.file_type,
            format_type: input.file_type.format_type(),
            uri: input.uri.clone(),
            url: input.url.clone(),
            source: self.request.source,
            creator_id: self.request.creator_id,
            space_id: self.request.space_id,
            parsing_strategy: input.parsing_strategy.clone(),
            chunking_strategy: self.config.chunking.resolve(&input.chunking_strategy),
            status: DocumentStatus::Init,
            status_msg: String::new(),
            table_info: None,
            is_append: false,
            slice_count: 0,
            char_count: 0,
            size: input.size,
            created_at: now,
            updated_at: now,
        }
    }

    async fn create_table(&self, input: &DocumentInput) -> Result<TableInfo> {
        let columns = if input.table_columns.is_empty() {
            self.infer_columns(input).await?
        } else {
            input.table_columns.clone()
        };
        create_physical_table(
            self.backends.rdb.as_ref(),
            self.backends.idgen.as_ref(),
            &input.name,
            &input.table_desc,
            &columns,
        )
        .await
    }

    async fn infer_columns(&self, input: &DocumentInput) -> Result<Vec<TableColumn>> {
        let bytes = self.backends.storage.get_object(&input.uri).await?;
        let sheet = load_sheet(
            self.backends.parsers.as_ref(),
            &bytes,
            input.file_type,
            &input.parsing_strategy,
            &[],
        )?;
        Ok(sheet
            .columns
            .into_iter()
            .map(|mut column| {
                column.indexing = true;
                column
            })
            .collect())
    }

    async fn drop_created_tables(&mut self) {
        for table in self.created_tables.drain(..) {
            if let Err(err) = self.backends.rdb.drop_table(&table, true).await {
                warn!(table = %table, error = %err, "failed to drop orphaned table");
            }
        }
    }

    /// Writes the document rows. Tables created by this request are dropped if that fails.
    pub async fn insert_db_model(&mut self) -> Result<()> {
        if self.kind == ProcessorKind::TableAppend {
            for document in &mut self.documents {
                self.backends
                    .meta
                    .update_document_status(document.id, DocumentStatus::Uploading, "")
                    .await?;
                document.status = DocumentStatus::Uploading;
            }
            return Ok(());
        }

        if let Err(err) = self.backends.meta.create_documents(&self.documents).await {
            self.drop_created_tables().await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn indexing(&self) -> Result<()> {
        let body = Event::IndexDocuments {
            knowledge_id: self.knowledge.id,
            documents: self.documents.clone(),
        }
        .encode()?;
        self.backends
            .bus
            .send(body, &self.knowledge.id.to_string())
            .await?;
        Ok(())
    }
}

fn object_key(creator_id: i64, file_type: FileType) -> String {
    format!(
        "{KNOWLEDGE_OBJECT_PREFIX}/{creator_id}_{}.{}",
        Uuid::new_v4(),
        file_type.extension()
    )
}

/// Fetches a source URL; `file://` URLs are read from the local disk.
pub async fn download(raw: &str) -> Result<Vec<u8>> {
    let url = Url::parse(raw)
        .map_err(|err| KnowledgeError::InvalidParameter(format!("invalid url {raw}: {err}")))?;
    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|_| KnowledgeError::InvalidParameter(format!("invalid file url {raw}")))?;
        return Ok(tokio::fs::read(path).await.map_err(StorageError::from)?);
    }

    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(StorageError::from)?;
    let bytes = response.bytes().await.map_err(StorageError::from)?;
    Ok(bytes.to_vec())
}
