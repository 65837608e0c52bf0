use crate::backends::Backends;
use crate::config::EngineConfig;
use crate::error::{KnowledgeError, Result};
use crate::indexer::{search_fields, store_document};
use crate::models::{
    ColumnData, CopyDataTask, CopyTaskStatus, Document, DocumentStatus, FormatType,
    Knowledge, KnowledgeStatus, Slice, SliceStatus, TableColumn, TableInfo, RESERVED_ID_COLUMN,
};
use crate::meta::MetaStore;
use crate::rdb::RelationalStore;
use crate::schema::{create_physical_table, rdb_row, select_slice_rows};
use crate::service::{remove_document, remove_knowledge};
use crate::store::{Field, SearchStoreManager, StoreDocument, StoreOptions, FIELD_DOCUMENT_ID};
use chrono::Utc;
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CopyStatus {
    Successful,
    Processing,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyKnowledgeRequest {
    /// Idempotency key; a replay with the same key and origin returns the existing task.
    pub task_key: String,
    pub knowledge_id: i64,
    pub target_space_id: i64,
    pub target_user_id: i64,
    pub target_app_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyKnowledgeResponse {
    pub origin_knowledge_id: i64,
    pub target_knowledge_id: i64,
    pub copy_status: CopyStatus,
    pub error_msg: String,
}

/// Duplicates a knowledge with its documents, slices, table rows and search entries.
pub struct KnowledgeCopier {
    backends: Backends,
    config: EngineConfig,
}

struct CopyContext {
    origin: Knowledge,
    task: CopyDataTask,
    target_space_id: i64,
    target_user_id: i64,
    target_app_id: i64,
    new_tables: Mutex<Vec<String>>,
}

struct DocumentCopy<'a> {
    origin: &'a Document,
    target: Document,
    column_map: HashMap<i64, i64>,
}

/// Union of the search fields of every document sharing one collection.
fn collection_fields<'a>(documents: impl Iterator<Item = &'a Document>, enable_compact_table: bool) -> Vec<Field> {
    let mut fields: Vec<Field> = Vec::new();
    for document in documents {
        for field in search_fields(document, enable_compact_table) {
            if !fields.iter().any(|known| known.name == field.name) {
                fields.push(field);
            }
        }
    }
    fields
}

impl KnowledgeCopier {
    pub fn new(backends: Backends, config: EngineConfig) -> Self {
        Self { backends, config }
    }

    #[tracing::instrument(skip_all, fields(origin = request.knowledge_id, task_key = %request.task_key))]
    pub async fn copy_knowledge(&self, request: &CopyKnowledgeRequest) -> Result<CopyKnowledgeResponse> {
        if request.task_key.is_empty() {
            return Err(KnowledgeError::InvalidParameter("task key is empty".to_string()));
        }
        if request.knowledge_id == 0 {
            return Err(KnowledgeError::InvalidParameter("knowledge id is empty".to_string()));
        }
        let origin = self
            .backends
            .meta
            .get_knowledge(request.knowledge_id)
            .await?
            .ok_or_else(|| KnowledgeError::not_found("knowledge", request.knowledge_id))?;

        let now = Utc::now();
        let candidate = CopyDataTask {
            task_key: request.task_key.clone(),
            origin_id: origin.id,
            target_id: self.backends.idgen.gen_id(),
            status: CopyTaskStatus::Create,
            error_msg: String::new(),
            created_at: now,
            updated_at: now,
        };
        let (task, created) = self
            .backends
            .meta
            .create_copy_task_if_absent(&candidate)
            .await?;
        if !created {
            info!(target_id = task.target_id, status = ?task.status, "copy task already exists");
        }

        let replayed = |copy_status: CopyStatus| CopyKnowledgeResponse {
            origin_knowledge_id: origin.id,
            target_knowledge_id: task.target_id,
            copy_status,
            error_msg: task.error_msg.clone(),
        };
        match task.status {
            CopyTaskStatus::Success => return Ok(replayed(CopyStatus::Successful)),
            CopyTaskStatus::InProgress => return Ok(replayed(CopyStatus::Processing)),
            CopyTaskStatus::Fail => return Ok(replayed(CopyStatus::Failed)),
            CopyTaskStatus::Create => {}
        }

        let context = CopyContext {
            origin,
            task,
            target_space_id: request.target_space_id,
            target_user_id: request.target_user_id,
            target_app_id: request.target_app_id,
            new_tables: Mutex::new(Vec::new()),
        };
        self.copy_do(context).await
    }

    async fn copy_do(&self, mut context: CopyContext) -> Result<CopyKnowledgeResponse> {
        let meta = &self.backends.meta;
        context.task.status = CopyTaskStatus::InProgress;
        meta.update_copy_task(&context.task).await?;

        let outcome = AssertUnwindSafe(self.run_copy(&context)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(KnowledgeError::System("knowledge copy panicked".to_string())),
        };

        match result {
            Ok(()) => {
                context.task.status = CopyTaskStatus::Success;
                if let Err(err) = meta.update_copy_task(&context.task).await {
                    warn!(error = %err, "failed to mark copy task successful");
                }
                info!(target_id = context.task.target_id, "knowledge copied");
                Ok(CopyKnowledgeResponse {
                    origin_knowledge_id: context.origin.id,
                    target_knowledge_id: context.task.target_id,
                    copy_status: CopyStatus::Successful,
                    error_msg: String::new(),
                })
            }
            Err(err) => {
                error!(error = %err, "knowledge copy failed, compensating");
                self.compensate(&mut context, &err).await;
                Err(err)
            }
        }
    }

    async fn compensate(&self, context: &mut CopyContext, cause: &KnowledgeError) {
        if let Err(err) = remove_knowledge(&self.backends, &self.config, context.task.target_id).await {
            error!(error = %err, "failed to delete partial target knowledge");
        }
        for table in context.new_tables.lock().await.drain(..) {
            if let Err(err) = self.backends.rdb.drop_table(&table, true).await {
                error!(table = %table, error = %err, "failed to drop copied table");
            }
        }
        context.task.status = CopyTaskStatus::Fail;
        context.task.error_msg = cause.to_string();
        if let Err(err) = self.backends.meta.update_copy_task(&context.task).await {
            error!(error = %err, "failed to mark copy task failed");
        }
    }

    async fn run_copy(&self, context: &CopyContext) -> Result<()> {
        let meta = &self.backends.meta;
        let target_id = context.task.target_id;
        let now = Utc::now();
        let target = Knowledge {
            id: target_id,
            name: context.origin.name.clone(),
            description: context.origin.description.clone(),
            space_id: context.target_space_id,
            app_id: context.target_app_id,
            creator_id: context.target_user_id,
            format_type: context.origin.format_type,
            status: KnowledgeStatus::Enable,
            created_at: now,
            updated_at: now,
        };
        if meta.get_knowledge(target_id).await?.is_some() {
            meta.update_knowledge(&target).await?;
        } else {
            meta.create_knowledge(&target).await?;
        }

        let documents: Vec<Document> = meta
            .list_documents(context.origin.id)
            .await?
            .into_iter()
            .filter(|document| matches!(document.status, DocumentStatus::Enable | DocumentStatus::Init))
            .collect();
        if documents.is_empty() {
            info!("origin knowledge has no document");
            return Ok(());
        }

        // leftovers of an earlier attempt under the same target id
        for stale in meta.list_documents(target_id).await? {
            remove_document(&self.backends, &self.config, &stale).await?;
        }

        let ids = self.backends.idgen.gen_ids(documents.len());
        let mut copies = Vec::with_capacity(documents.len());
        for (origin, new_id) in documents.iter().zip(ids) {
            copies.push(self.prepare_document(context, origin, new_id).await?);
        }

        let collection = self.config.indexing.collection_name(target_id);
        let fields = collection_fields(
            copies.iter().map(|copy| &copy.target),
            self.config.indexing.enable_compact_table,
        );
        for manager in &self.backends.search_stores {
            manager.create_collection(&collection, &fields).await?;
        }

        stream::iter(copies)
            .map(|copy| self.copy_document(context, copy))
            .buffer_unordered(self.config.indexing.copy_concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    /// Builds the target document row. Table documents get their new physical table here.
    async fn prepare_document<'a>(
        &self,
        context: &CopyContext,
        origin: &'a Document,
        new_id: i64,
    ) -> Result<DocumentCopy<'a>> {
        let now = Utc::now();
        let mut target = origin.clone();
        target.id = new_id;
        target.knowledge_id = context.task.target_id;
        target.creator_id = context.target_user_id;
        target.space_id = context.target_space_id;
        target.status = DocumentStatus::Chunking;
        target.status_msg = String::new();
        target.created_at = now;
        target.updated_at = now;

        let mut column_map = HashMap::new();
        if origin.format_type == FormatType::Table {
            let info = origin.table_info.as_ref().ok_or_else(|| {
                KnowledgeError::NonRetryable(format!("table document {} has no schema", origin.id))
            })?;
            let (copied, mapping) = self.copy_table(info).await?;
            context
                .new_tables
                .lock()
                .await
                .push(copied.physical_table_name.clone());
            target.table_info = Some(copied);
            column_map = mapping;
        }
        Ok(DocumentCopy {
            origin,
            target,
            column_map,
        })
    }

    async fn copy_document(&self, context: &CopyContext, copy: DocumentCopy<'_>) -> Result<()> {
        let DocumentCopy {
            origin,
            target,
            column_map,
        } = copy;
        let new_id = target.id;
        let meta = &self.backends.meta;
        meta.create_documents(&[target.clone()]).await?;
        let result = self.copy_slices(context, origin, &target, &column_map).await;
        let (status, message) = match &result {
            Ok(()) => (DocumentStatus::Enable, String::new()),
            Err(err) => (DocumentStatus::Failed, err.to_string()),
        };
        if let Err(err) = meta.update_document_status(new_id, status, &message).await {
            error!(document_id = new_id, error = %err, "failed to update copied document status");
        }
        if result.is_ok() {
            meta.update_document_slice_info(new_id).await?;
        }
        result
    }

    /// Creates a fresh physical table with the same user columns. Returns the new schema and
    /// the old-to-new column id map.
    async fn copy_table(&self, info: &TableInfo) -> Result<(TableInfo, HashMap<i64, i64>)> {
        let columns: Vec<TableColumn> = info
            .user_columns()
            .map(|column| TableColumn {
                id: 0,
                ..column.clone()
            })
            .collect();
        let copied = create_physical_table(
            self.backends.rdb.as_ref(),
            self.backends.idgen.as_ref(),
            &info.virtual_table_name,
            &info.table_desc,
            &columns,
        )
        .await?;
        let mapping = info
            .user_columns()
            .zip(copied.user_columns())
            .map(|(old, new)| (old.id, new.id))
            .collect();
        Ok((copied, mapping))
    }

    async fn copy_slices(
        &self,
        context: &CopyContext,
        origin: &Document,
        document: &Document,
        column_map: &HashMap<i64, i64>,
    ) -> Result<()> {
        let meta = &self.backends.meta;
        let compact = self.config.indexing.enable_compact_table;
        let collection = self.config.indexing.collection_name(document.knowledge_id);
        let options = StoreOptions {
            partition_key: Some(FIELD_DOCUMENT_ID.to_string()),
            partition: Some(document.id.to_string()),
            indexing_fields: search_fields(document, compact)
                .into_iter()
                .filter(|field| field.indexing)
                .map(|field| field.name)
                .collect(),
        };

        let slice_ids = meta.get_document_slice_ids(&[origin.id]).await?;
        for batch in slice_ids.chunks(self.config.indexing.slice_id_batch_size.max(1)) {
            let originals = meta.mget_slices(batch).await?;
            let rows = match &origin.table_info {
                Some(info) if origin.format_type == FormatType::Table => {
                    self.load_rows(info, batch, column_map).await?
                }
                _ => HashMap::new(),
            };

            let new_ids = self.backends.idgen.gen_ids(originals.len());
            let now = Utc::now();
            let copies: Vec<Slice> = originals
                .iter()
                .zip(new_ids)
                .map(|(slice, id)| Slice {
                    id,
                    knowledge_id: document.knowledge_id,
                    document_id: document.id,
                    creator_id: context.target_user_id,
                    sequence: slice.sequence,
                    content: slice.content.clone(),
                    table_row: rows.get(&slice.id).cloned(),
                    status: SliceStatus::Done,
                    status_msg: String::new(),
                    hit: 0,
                    created_at: now,
                    updated_at: now,
                })
                .collect();

            if let Some(info) = &document.table_info {
                let table_rows: Vec<_> = copies
                    .iter()
                    .filter_map(|slice| slice.table_row.as_deref().map(|values| rdb_row(slice.id, values)))
                    .collect();
                if !table_rows.is_empty() {
                    self.backends
                        .rdb
                        .upsert_data(&info.physical_table_name, RESERVED_ID_COLUMN, &table_rows)
                        .await?;
                }
            }

            let search_documents: Vec<StoreDocument> = copies
                .iter()
                .map(|slice| store_document(document, slice, compact))
                .collect();
            for manager in &self.backends.search_stores {
                let store = manager.search_store(&collection).await?;
                store.store(&search_documents, &options).await?;
            }
            meta.batch_create_slices(&copies).await?;
        }
        Ok(())
    }

    /// Rows of the origin table keyed by origin slice id, with column ids moved to the copy.
    async fn load_rows(
        &self,
        info: &TableInfo,
        slice_ids: &[i64],
        column_map: &HashMap<i64, i64>,
    ) -> Result<HashMap<i64, Vec<ColumnData>>> {
        let rows = select_slice_rows(self.backends.rdb.as_ref(), info, slice_ids).await?;
        Ok(rows
            .into_iter()
            .map(|(slice_id, values)| {
                let moved = values
                    .into_iter()
                    .filter_map(|value| {
                        column_map.get(&value.column_id).map(|column_id| ColumnData {
                            column_id: *column_id,
                            ..value
                        })
                    })
                    .collect();
                (slice_id, moved)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::TestBackends;
    use crate::meta::fixtures;
    use crate::models::{CellValue, ColumnType, FileType};
    use crate::rdb::SelectRequest;
    use crate::schema::parse_rdb_rows;
    use crate::store::RetrieveOptions;

    fn request(task_key: &str, knowledge_id: i64) -> CopyKnowledgeRequest {
        CopyKnowledgeRequest {
            task_key: task_key.to_string(),
            knowledge_id,
            target_space_id: 9,
            target_user_id: 77,
            target_app_id: 5,
        }
    }

    #[tokio::test]
    async fn replay_while_in_progress_returns_the_same_target() -> Result<(), Box<dyn std::error::Error>> {
        let env = TestBackends::new().await?;
        env.meta
            .create_knowledge(&fixtures::knowledge(1, FormatType::Text))
            .await?;
        let now = Utc::now();
        env.meta
            .create_copy_task_if_absent(&CopyDataTask {
                task_key: "copy-1".to_string(),
                origin_id: 1,
                target_id: 900,
                status: CopyTaskStatus::InProgress,
                error_msg: String::new(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        let copier = KnowledgeCopier::new(env.backends.clone(), EngineConfig::default());
        let response = copier.copy_knowledge(&request("copy-1", 1)).await?;

        assert_eq!(response.copy_status, CopyStatus::Processing);
        assert_eq!(response.target_knowledge_id, 900);
        assert!(env.meta.get_knowledge(900).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn text_knowledge_is_copied_with_slices() -> Result<(), Box<dyn std::error::Error>> {
        let env = TestBackends::new().await?;
        env.meta
            .create_knowledge(&fixtures::knowledge(1, FormatType::Text))
            .await?;
        let mut document = fixtures::document(10, 1, FileType::Txt);
        document.status = DocumentStatus::Enable;
        document.size = 34;
        env.meta.create_documents(&[document.clone()]).await?;
        env.meta
            .batch_create_slices(&[
                fixtures::slice(100, &document, 0.0, "boiler maintenance"),
                fixtures::slice(101, &document, 1.0, "valve inspection"),
            ])
            .await?;

        let copier = KnowledgeCopier::new(env.backends.clone(), EngineConfig::default());
        let first = copier.copy_knowledge(&request("copy-2", 1)).await?;
        assert_eq!(first.copy_status, CopyStatus::Successful);

        let target = env
            .meta
            .get_knowledge(first.target_knowledge_id)
            .await?
            .ok_or("target missing")?;
        assert_eq!(target.creator_id, 77);
        let copied = env.meta.list_documents(target.id).await?;
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].status, DocumentStatus::Enable);
        assert_eq!(copied[0].size, 34);
        let slices = env.meta.list_slices(copied[0].id).await?;
        let contents: Vec<_> = slices.iter().map(|slice| slice.content.as_str()).collect();
        assert_eq!(contents, vec!["boiler maintenance", "valve inspection"]);

        let store = env
            .full_text
            .search_store(&format!("knowledge_{}", target.id))
            .await?;
        let hits = store.retrieve("valve", &RetrieveOptions::default()).await?;
        assert_eq!(hits.len(), 1);

        let replay = copier.copy_knowledge(&request("copy-2", 1)).await?;
        assert_eq!(replay.copy_status, CopyStatus::Successful);
        assert_eq!(replay.target_knowledge_id, first.target_knowledge_id);
        assert_eq!(env.meta.list_documents(target.id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn table_rows_move_to_a_new_physical_table() -> Result<(), Box<dyn std::error::Error>> {
        let env = TestBackends::new().await?;
        env.meta
            .create_knowledge(&fixtures::knowledge(2, FormatType::Table))
            .await?;
        let info = create_physical_table(
            env.rdb.as_ref(),
            env.backends.idgen.as_ref(),
            "parts",
            "",
            &[TableColumn::new("part", ColumnType::String, true)],
        )
        .await?;
        let part = info.user_column_by_name("part").ok_or("column missing")?.clone();
        let mut document = fixtures::document(20, 2, FileType::Csv);
        document.status = DocumentStatus::Enable;
        document.table_info = Some(info.clone());
        env.meta.create_documents(&[document.clone()]).await?;
        let slice = fixtures::slice(200, &document, 0.0, "");
        env.meta.batch_create_slices(&[slice]).await?;
        env.rdb
            .upsert_data(
                &info.physical_table_name,
                RESERVED_ID_COLUMN,
                &[rdb_row(
                    200,
                    &[ColumnData {
                        column_id: part.id,
                        column_name: part.name.clone(),
                        column_type: ColumnType::String,
                        value: CellValue::String("valve".to_string()),
                    }],
                )],
            )
            .await?;

        let mut config = EngineConfig::default();
        config.indexing.enable_compact_table = false;
        let copier = KnowledgeCopier::new(env.backends.clone(), config);
        let response = copier.copy_knowledge(&request("copy-3", 2)).await?;

        let copied = env.meta.list_documents(response.target_knowledge_id).await?;
        let copied_info = copied[0].table_info.clone().ok_or("table info missing")?;
        assert_ne!(copied_info.physical_table_name, info.physical_table_name);
        let result = env
            .rdb
            .select_data(&SelectRequest::all(copied_info.physical_table_name.clone()))
            .await?;
        let rows = parse_rdb_rows(&copied_info.columns, &result)?;
        assert_eq!(rows.len(), 1);
        assert!(rows[0]
            .iter()
            .any(|value| value.value == CellValue::String("valve".to_string())));

        let store = env
            .full_text
            .search_store(&format!("knowledge_{}", response.target_knowledge_id))
            .await?;
        let hits = store.retrieve("valve", &RetrieveOptions::default()).await?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_copy_is_compensated() -> Result<(), Box<dyn std::error::Error>> {
        let env = TestBackends::new().await?;
        env.meta
            .create_knowledge(&fixtures::knowledge(3, FormatType::Table))
            .await?;
        let mut document = fixtures::document(30, 3, FileType::Csv);
        document.status = DocumentStatus::Enable;
        env.meta.create_documents(&[document]).await?;

        let copier = KnowledgeCopier::new(env.backends.clone(), EngineConfig::default());
        let err = copier
            .copy_knowledge(&request("copy-4", 3))
            .await
            .err()
            .ok_or("copy should fail")?;
        assert!(matches!(err, KnowledgeError::NonRetryable(_)));

        let replay = copier.copy_knowledge(&request("copy-4", 3)).await?;
        assert_eq!(replay.copy_status, CopyStatus::Failed);
        assert!(env.meta.get_knowledge(replay.target_knowledge_id).await?.is_none());
        Ok(())
    }
}
