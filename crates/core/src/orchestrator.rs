use crate::config::{EngineConfig, IndexingConfig, RetrievalConfig};
use crate::error::{KnowledgeError, Result};
use crate::meta::MetaStore;
use crate::models::{
    CellValue, ChatMessage, ColumnData, Document, DocumentStatus, FormatType, Knowledge,
    KnowledgeStatus, RetrievalStrategy, RetrieveRequest, RetrieveResponse, RetrieveSlice,
    SearchType, Slice, TableColumn, TableInfo, RESERVED_ID_COLUMN,
};
use crate::nl2sql::{add_slice_id_column, Nl2Sql, VirtualTableSchema};
use crate::objectstore::ObjectStorage;
use crate::rdb::{Condition, RelationalStore, SelectRequest};
use crate::rerank::{RankedHit, Reranker, RrfReranker};
use crate::schema::{parse_rdb_rows, physical_column_name, rdb_field_name};
use crate::sql_rewriter::{rewrite_sql, sql_operation, SqlOperation, TableMapping};
use crate::store::{
    DslFilter, MultiMatch, RetrieveOptions, ScoredDocument, SearchStoreManager, StoreKind,
    FIELD_DOCUMENT_ID,
};
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

const IMG_SRC: &str = "src";
const IMG_OBJECT_KEY: &str = "data-tos-key";

/// Condenses a conversation into one standalone search query.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Debug, Clone)]
struct KnowledgeScope {
    knowledge: Knowledge,
    document_ids: Vec<i64>,
    table_columns: Vec<TableColumn>,
}

/// Request state shared by every retrieval stage.
#[derive(Debug, Clone)]
pub struct RetrieveContext {
    pub origin_query: String,
    pub rewritten_query: Option<String>,
    /// Prior turns followed by the current query.
    pub chat_history: Vec<ChatMessage>,
    pub strategy: RetrievalStrategy,
    pub documents: Vec<Document>,
    scopes: BTreeMap<i64, KnowledgeScope>,
}

impl RetrieveContext {
    pub fn query(&self) -> &str {
        match &self.rewritten_query {
            Some(rewritten) if self.strategy.enable_query_rewrite => rewritten,
            _ => &self.origin_query,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelHits {
    vector: Vec<RankedHit>,
    full_text: Vec<RankedHit>,
    nl2sql: Vec<RankedHit>,
}

pub struct Retriever {
    meta: Arc<dyn MetaStore>,
    rdb: Arc<dyn RelationalStore>,
    storage: Arc<dyn ObjectStorage>,
    search_stores: Vec<Arc<dyn SearchStoreManager>>,
    reranker: Arc<dyn Reranker>,
    rewriter: Option<Arc<dyn QueryRewriter>>,
    nl2sql: Option<Arc<dyn Nl2Sql>>,
    retrieval: RetrievalConfig,
    indexing: IndexingConfig,
}

impl Retriever {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        rdb: Arc<dyn RelationalStore>,
        storage: Arc<dyn ObjectStorage>,
        search_stores: Vec<Arc<dyn SearchStoreManager>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            meta,
            rdb,
            storage,
            search_stores,
            reranker: Arc::new(RrfReranker::new(config.retrieval.rrf_k)),
            rewriter: None,
            nl2sql: None,
            retrieval: config.retrieval.clone(),
            indexing: config.indexing.clone(),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_query_rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_nl2sql(mut self, nl2sql: Arc<dyn Nl2Sql>) -> Self {
        self.nl2sql = Some(nl2sql);
        self
    }

    #[tracing::instrument(skip_all, fields(knowledge_ids = ?request.knowledge_ids))]
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        if request.query.trim().is_empty() {
            return Ok(RetrieveResponse::default());
        }
        let Some(mut ctx) = self.prepare_context(request).await? else {
            debug!("no enabled documents in scope");
            return Ok(RetrieveResponse::default());
        };

        self.rewrite_query(&mut ctx).await;
        let hits = self.run_channels(&ctx).await?;
        let ranked = self.rerank(&ctx, hits).await?;
        let slices = self.pack_results(&ranked).await?;

        info!(
            documents = ctx.documents.len(),
            slice_count = slices.len(),
            "retrieve finished"
        );
        Ok(RetrieveResponse { slices })
    }

    async fn prepare_context(&self, request: &RetrieveRequest) -> Result<Option<RetrieveContext>> {
        let mut strategy = request.strategy.clone().unwrap_or_else(|| RetrievalStrategy {
            top_k: self.retrieval.default_top_k,
            ..RetrievalStrategy::default()
        });
        if strategy.top_k == 0 {
            strategy.top_k = self.retrieval.default_top_k;
        }

        let requested: HashSet<i64> = request.document_ids.iter().copied().collect();
        let mut knowledge_ids = request.knowledge_ids.clone();
        if knowledge_ids.is_empty() && !requested.is_empty() {
            knowledge_ids = self
                .meta
                .mget_documents(&request.document_ids)
                .await?
                .iter()
                .map(|document| document.knowledge_id)
                .collect();
        }
        knowledge_ids.sort_unstable();
        knowledge_ids.dedup();

        let mut scopes = BTreeMap::new();
        let mut documents = Vec::new();
        for knowledge in self.meta.mget_knowledge(&knowledge_ids).await? {
            if knowledge.status != KnowledgeStatus::Enable {
                continue;
            }
            let enabled: Vec<Document> = self
                .meta
                .list_documents(knowledge.id)
                .await?
                .into_iter()
                .filter(|document| document.status == DocumentStatus::Enable)
                .filter(|document| requested.is_empty() || requested.contains(&document.id))
                .collect();
            if enabled.is_empty() {
                continue;
            }
            let table_columns = enabled
                .iter()
                .find_map(|document| document.table_info.as_ref())
                .map(|info| info.user_columns().cloned().collect())
                .unwrap_or_default();
            scopes.insert(
                knowledge.id,
                KnowledgeScope {
                    document_ids: enabled.iter().map(|document| document.id).collect(),
                    knowledge,
                    table_columns,
                },
            );
            documents.extend(enabled);
        }
        if documents.is_empty() {
            return Ok(None);
        }

        let mut chat_history = request.chat_history.clone();
        chat_history.push(ChatMessage::user(request.query.clone()));
        Ok(Some(RetrieveContext {
            origin_query: request.query.clone(),
            rewritten_query: None,
            chat_history,
            strategy,
            documents,
            scopes,
        }))
    }

    async fn rewrite_query(&self, ctx: &mut RetrieveContext) {
        if ctx.chat_history.len() < 2 || !ctx.strategy.enable_query_rewrite {
            return;
        }
        let Some(rewriter) = &self.rewriter else {
            return;
        };
        match rewriter.rewrite(&ctx.chat_history).await {
            Ok(rewritten) if !rewritten.trim().is_empty() => {
                debug!(rewritten = %rewritten, "query rewritten");
                ctx.rewritten_query = Some(rewritten);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "query rewrite failed, using the original query"),
        }
    }

    async fn run_channels(&self, ctx: &RetrieveContext) -> Result<ChannelHits> {
        let (vector, full_text, nl2sql) = tokio::try_join!(
            self.search_channel(ctx, StoreKind::Vector),
            self.search_channel(ctx, StoreKind::FullText),
            self.nl2sql_channel(ctx),
        )?;
        Ok(ChannelHits {
            vector,
            full_text,
            nl2sql,
        })
    }

    async fn search_channel(&self, ctx: &RetrieveContext, kind: StoreKind) -> Result<Vec<RankedHit>> {
        let skipped = match kind {
            StoreKind::Vector => ctx.strategy.search_type == SearchType::FullText,
            StoreKind::FullText => ctx.strategy.search_type == SearchType::Semantic,
        };
        if skipped {
            return Ok(Vec::new());
        }
        let Some(manager) = self.search_stores.iter().find(|manager| manager.kind() == kind) else {
            debug!(?kind, "no search store configured");
            return Ok(Vec::new());
        };

        let query = ctx.query();
        let lookups = ctx.scopes.values().map(|scope| {
            let collection = self.indexing.collection_name(scope.knowledge.id);
            let options = self.retrieve_options(ctx, scope, query);
            async move {
                let store = manager.search_store(&collection).await?;
                Ok::<_, KnowledgeError>(store.retrieve(query, &options).await?)
            }
        });
        let batches: Vec<Vec<ScoredDocument>> = stream::iter(lookups)
            .buffer_unordered(self.retrieval.search_concurrency.max(1))
            .try_collect()
            .await?;

        let mut found: Vec<ScoredDocument> = batches.into_iter().flatten().collect();
        found.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.id.cmp(&right.id))
        });
        found
            .iter()
            .map(|document| {
                Ok(RankedHit {
                    id: parse_slice_id(&document.id)?,
                    score: document.score,
                })
            })
            .collect()
    }

    fn retrieve_options(&self, ctx: &RetrieveContext, scope: &KnowledgeScope, query: &str) -> RetrieveOptions {
        let multi_match = (scope.knowledge.format_type == FormatType::Table
            && !self.indexing.enable_compact_table)
            .then(|| MultiMatch {
                fields: scope
                    .table_columns
                    .iter()
                    .filter(|column| column.indexing)
                    .map(|column| physical_column_name(column.id))
                    .collect(),
                query: query.to_string(),
            });
        RetrieveOptions {
            top_k: Some(ctx.strategy.top_k),
            min_score: None,
            partition_key: Some(FIELD_DOCUMENT_ID.to_string()),
            partitions: scope.document_ids.iter().map(ToString::to_string).collect(),
            dsl: Some(DslFilter::In {
                field: FIELD_DOCUMENT_ID.to_string(),
                values: scope
                    .document_ids
                    .iter()
                    .map(|id| serde_json::Value::from(*id))
                    .collect(),
            }),
            multi_match,
        }
    }

    /// Failures here never fail the request; the channel just contributes nothing.
    async fn nl2sql_channel(&self, ctx: &RetrieveContext) -> Result<Vec<RankedHit>> {
        if !ctx.strategy.enable_nl2sql {
            return Ok(Vec::new());
        }
        let Some(generator) = &self.nl2sql else {
            debug!("nl2sql requested but no generator configured");
            return Ok(Vec::new());
        };
        let tables: Vec<(&Document, &TableInfo)> = ctx
            .documents
            .iter()
            .filter(|document| document.format_type == FormatType::Table)
            .filter_map(|document| document.table_info.as_ref().map(|info| (document, info)))
            .collect();
        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let limit = tables.len();
        let outcome: Result<Vec<Vec<RankedHit>>> = stream::iter(
            tables
                .into_iter()
                .map(|(document, info)| self.nl2sql_exec(generator.as_ref(), ctx, document, info)),
        )
        .buffer_unordered(limit)
        .try_collect()
        .await;

        match outcome {
            Ok(batches) => Ok(batches.into_iter().flatten().collect()),
            Err(err) => {
                warn!(error = %err, "nl2sql channel failed, continuing without it");
                Ok(Vec::new())
            }
        }
    }

    async fn nl2sql_exec(
        &self,
        generator: &dyn Nl2Sql,
        ctx: &RetrieveContext,
        document: &Document,
        info: &TableInfo,
    ) -> Result<Vec<RankedHit>> {
        let generated = generator
            .generate(&ctx.chat_history, &[VirtualTableSchema::from(info)])
            .await?;
        let sql = add_slice_id_column(&generated);
        if sql_operation(&sql) != SqlOperation::Select {
            return Err(KnowledgeError::InvalidParameter(format!(
                "generated sql is not a query: {sql}"
            )));
        }
        let physical = rewrite_sql(&sql, &table_mapping(info))?;
        debug!(document_id = document.id, sql = %physical, "executing generated sql");

        let result = self.rdb.execute_sql(&physical, &[]).await?;
        result
            .rows
            .iter()
            .map(|row| match row.get(RESERVED_ID_COLUMN) {
                Some(CellValue::Integer(id)) => Ok(RankedHit { id: *id, score: 1.0 }),
                other => Err(KnowledgeError::System(format!(
                    "convert slice id failed, got {other:?}"
                ))),
            })
            .collect()
    }

    async fn rerank(&self, ctx: &RetrieveContext, hits: ChannelHits) -> Result<Vec<RankedHit>> {
        let mut channels = Vec::with_capacity(3);
        if ctx.strategy.enable_nl2sql {
            channels.push(hits.nl2sql);
        }
        match ctx.strategy.search_type {
            SearchType::Semantic => channels.push(hits.vector),
            SearchType::FullText => channels.push(hits.full_text),
            SearchType::Hybrid => {
                channels.push(hits.vector);
                channels.push(hits.full_text);
            }
        }

        let ranked = self
            .reranker
            .rerank(ctx.query(), &channels, usize::MAX)
            .await?;
        let min_score = ctx.strategy.min_score;
        Ok(ranked
            .into_iter()
            .filter(|hit| min_score.map_or(true, |min| hit.score >= min))
            .take(ctx.strategy.top_k)
            .collect())
    }

    /// Resolves ranked ids into caller-ready slices, keeping rank order.
    async fn pack_results(&self, ranked: &[RankedHit]) -> Result<Vec<RetrieveSlice>> {
        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = ranked.iter().map(|hit| hit.id).collect();
        let slices: HashMap<i64, Slice> = self
            .meta
            .mget_slices(&ids)
            .await?
            .into_iter()
            .map(|slice| (slice.id, slice))
            .collect();

        let document_ids = unique(slices.values().map(|slice| slice.document_id));
        let documents: HashMap<i64, Document> = self
            .meta
            .mget_documents(&document_ids)
            .await?
            .into_iter()
            .map(|document| (document.id, document))
            .collect();
        let knowledge_ids = unique(slices.values().map(|slice| slice.knowledge_id));
        let knowledge: HashMap<i64, Knowledge> = self
            .meta
            .mget_knowledge(&knowledge_ids)
            .await?
            .into_iter()
            .filter(|knowledge| knowledge.status == KnowledgeStatus::Enable)
            .map(|knowledge| (knowledge.id, knowledge))
            .collect();
        let table_rows = self.load_table_rows(&slices, &documents).await?;

        let mut results = Vec::with_capacity(ranked.len());
        for hit in ranked {
            let Some(slice) = slices.get(&hit.id) else {
                continue;
            };
            let (Some(document), Some(knowledge)) =
                (documents.get(&slice.document_id), knowledge.get(&slice.knowledge_id))
            else {
                continue;
            };

            let document_url = if document.uri.is_empty() {
                String::new()
            } else {
                self.storage.get_object_url(&document.uri).await?
            };

            let mut slice = slice.clone();
            let content = match document.format_type {
                FormatType::Text => self.format_slice_content(&slice.content).await,
                FormatType::Table => {
                    let row = table_rows.get(&slice.id).cloned();
                    let content = row.as_deref().map(row_json).unwrap_or_default();
                    slice.table_row = row;
                    content
                }
                FormatType::Image => {
                    let tagged = format!(
                        r#"<img src="" {IMG_OBJECT_KEY}="{}">{}"#,
                        document.uri, slice.content
                    );
                    self.format_slice_content(&tagged).await
                }
            };

            results.push(RetrieveSlice {
                slice,
                score: hit.score,
                knowledge_name: knowledge.name.clone(),
                document_name: document.name.clone(),
                document_url,
                content,
            });
        }

        if let Err(err) = self.meta.increment_hit_count(&ids).await {
            warn!(error = %err, "increment hit count failed");
        }
        Ok(results)
    }

    async fn load_table_rows(
        &self,
        slices: &HashMap<i64, Slice>,
        documents: &HashMap<i64, Document>,
    ) -> Result<HashMap<i64, Vec<ColumnData>>> {
        let mut by_document: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for slice in slices.values() {
            let is_table = documents
                .get(&slice.document_id)
                .is_some_and(|document| document.format_type == FormatType::Table);
            if is_table {
                by_document.entry(slice.document_id).or_default().push(slice.id);
            }
        }

        let mut rows = HashMap::new();
        for (document_id, mut slice_ids) in by_document {
            let Some(info) = documents
                .get(&document_id)
                .and_then(|document| document.table_info.as_ref())
            else {
                continue;
            };
            slice_ids.sort_unstable();
            let result = self
                .rdb
                .select_data(&SelectRequest {
                    table: info.physical_table_name.clone(),
                    fields: info.columns.iter().map(rdb_field_name).collect(),
                    conditions: vec![Condition::In {
                        field: RESERVED_ID_COLUMN.to_string(),
                        values: slice_ids.into_iter().map(CellValue::Integer).collect(),
                    }],
                    ..SelectRequest::default()
                })
                .await?;

            for values in parse_rdb_rows(&info.columns, &result)? {
                let slice_id = values
                    .iter()
                    .find(|value| value.column_name == RESERVED_ID_COLUMN)
                    .and_then(|value| match value.value {
                        CellValue::Integer(id) => Some(id),
                        _ => None,
                    });
                if let Some(slice_id) = slice_id {
                    let user_values = values
                        .into_iter()
                        .filter(|value| value.column_name != RESERVED_ID_COLUMN)
                        .collect();
                    rows.insert(slice_id, user_values);
                }
            }
        }
        Ok(rows)
    }

    /// Points every `<img data-tos-key=...>` tag at a resolvable object url.
    async fn format_slice_content(&self, content: &str) -> String {
        let tags = parse_img_tags(content);
        if tags.is_empty() {
            return content.to_string();
        }

        let mut output = content.to_string();
        for (range, mut attributes) in tags.into_iter().rev() {
            let object_key = attributes
                .iter()
                .find(|(name, value)| name == IMG_OBJECT_KEY && !value.is_empty())
                .map(|(_, value)| value.clone());
            if let Some(key) = object_key {
                match self.storage.get_object_url(&key).await {
                    Ok(url) => set_attribute(&mut attributes, IMG_SRC, url),
                    Err(err) => warn!(error = %err, key = %key, "resolve image url failed"),
                }
            }
            output.replace_range(range, &format_img_tag(&attributes));
        }
        output
    }
}

fn parse_slice_id(id: &str) -> Result<i64> {
    id.parse()
        .map_err(|_| KnowledgeError::System(format!("search store returned a non-numeric slice id: {id}")))
}

fn unique(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut ids: Vec<i64> = ids.collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Virtual table and column names of one table document mapped to their physical names.
fn table_mapping(info: &TableInfo) -> HashMap<String, TableMapping> {
    let mut columns: HashMap<String, String> = info
        .user_columns()
        .map(|column| (column.name.clone(), physical_column_name(column.id)))
        .collect();
    columns.insert(RESERVED_ID_COLUMN.to_string(), RESERVED_ID_COLUMN.to_string());
    HashMap::from([(
        info.virtual_table_name.clone(),
        TableMapping {
            new_table_name: Some(info.physical_table_name.clone()),
            columns,
        },
    )])
}

fn row_json(values: &[ColumnData]) -> String {
    let object: serde_json::Map<String, serde_json::Value> = values
        .iter()
        .map(|value| (value.column_name.clone(), value.value.to_json()))
        .collect();
    serde_json::Value::Object(object).to_string()
}

fn img_tag_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<img\s+([^>]*)>").ok()).as_ref()
}

fn img_attribute_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(\S+)=(?:"([^"]*)"|'([^']*)')"#).ok())
        .as_ref()
}

type ImgTag = (Range<usize>, Vec<(String, String)>);

fn parse_img_tags(content: &str) -> Vec<ImgTag> {
    let (Some(tag_pattern), Some(attribute_pattern)) = (img_tag_regex(), img_attribute_regex()) else {
        return Vec::new();
    };
    tag_pattern
        .captures_iter(content)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let attributes = attribute_pattern
                .captures_iter(captures.get(1)?.as_str())
                .filter_map(|attribute| {
                    let name = attribute.get(1)?.as_str().to_string();
                    let value = attribute
                        .get(2)
                        .or_else(|| attribute.get(3))
                        .map(|value| value.as_str().to_string())
                        .unwrap_or_default();
                    Some((name, value))
                })
                .collect();
            Some((whole.range(), attributes))
        })
        .collect()
}

fn set_attribute(attributes: &mut Vec<(String, String)>, name: &str, value: String) {
    match attributes.iter_mut().find(|(existing, _)| existing == name) {
        Some((_, current)) => *current = value,
        None => attributes.push((name.to_string(), value)),
    }
}

fn format_img_tag(attributes: &[(String, String)]) -> String {
    let mut tag = String::from("<img ");
    for (name, value) in attributes {
        tag.push_str(&format!("{name}=\"{value}\" "));
    }
    tag.push('>');
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::idgen::SnowflakeIdGenerator;
    use crate::meta::fixtures::{document, knowledge, slice};
    use crate::meta::MemoryMetaStore;
    use crate::models::{ColumnType, FileType};
    use crate::objectstore::LocalObjectStorage;
    use crate::schema::{create_physical_table, rdb_row};
    use crate::store::{StoreDocument, StoreOptions};
    use crate::stores::{MemorySearchStoreManager, SqliteRdb};
    use tempfile::tempdir;

    struct FixedNl2Sql(String);

    #[async_trait]
    impl Nl2Sql for FixedNl2Sql {
        async fn generate(&self, _messages: &[ChatMessage], _tables: &[VirtualTableSchema]) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingRewriter;

    #[async_trait]
    impl QueryRewriter for FailingRewriter {
        async fn rewrite(&self, _messages: &[ChatMessage]) -> Result<String> {
            Err(KnowledgeError::System("model unavailable".to_string()))
        }
    }

    struct Fixture {
        meta: Arc<MemoryMetaStore>,
        rdb: Arc<SqliteRdb>,
        storage: Arc<LocalObjectStorage>,
        vector: Arc<MemorySearchStoreManager>,
        full_text: Arc<MemorySearchStoreManager>,
        _root: tempfile::TempDir,
    }

    impl Fixture {
        async fn new() -> Result<Self, Box<dyn std::error::Error>> {
            let root = tempdir()?;
            Ok(Self {
                meta: Arc::new(MemoryMetaStore::new()),
                rdb: Arc::new(SqliteRdb::in_memory().await?),
                storage: Arc::new(LocalObjectStorage::new(root.path())),
                vector: Arc::new(MemorySearchStoreManager::vector(Arc::new(HashingEmbedder::default()))),
                full_text: Arc::new(MemorySearchStoreManager::full_text()),
                _root: root,
            })
        }

        fn retriever(&self) -> Retriever {
            Retriever::new(
                self.meta.clone(),
                self.rdb.clone(),
                self.storage.clone(),
                vec![
                    self.vector.clone() as Arc<dyn SearchStoreManager>,
                    self.full_text.clone(),
                ],
                &EngineConfig::default(),
            )
        }

        async fn index_text(&self, slices: &[Slice]) -> Result<(), Box<dyn std::error::Error>> {
            let documents: Vec<StoreDocument> = slices
                .iter()
                .map(|slice| StoreDocument {
                    id: slice.id.to_string(),
                    content: slice.content.clone(),
                    creator_id: slice.creator_id,
                    document_id: slice.document_id,
                    extra: Default::default(),
                })
                .collect();
            let options = StoreOptions {
                partition_key: Some(FIELD_DOCUMENT_ID.to_string()),
                partition: slices.first().map(|slice| slice.document_id.to_string()),
                indexing_fields: Vec::new(),
            };
            for manager in [&self.vector, &self.full_text] {
                manager
                    .search_store("knowledge_1")
                    .await?
                    .store(&documents, &options)
                    .await?;
            }
            Ok(())
        }

        async fn seed_text(&self) -> Result<(), Box<dyn std::error::Error>> {
            self.meta.create_knowledge(&knowledge(1, FormatType::Text)).await?;
            let mut doc = document(10, 1, FileType::Txt);
            doc.status = DocumentStatus::Enable;
            doc.uri = "docs/manual.txt".to_string();
            self.storage.put_object(&doc.uri, b"manual").await?;
            self.meta.create_documents(&[doc.clone()]).await?;
            let slices = vec![
                slice(100, &doc, 1.0, "hydraulic pump maintenance schedule"),
                slice(101, &doc, 2.0, "coffee brewing recipe"),
            ];
            self.meta.batch_create_slices(&slices).await?;
            self.index_text(&slices).await
        }
    }

    fn request(query: &str, strategy: RetrievalStrategy) -> RetrieveRequest {
        RetrieveRequest {
            query: query.to_string(),
            knowledge_ids: vec![1],
            strategy: Some(strategy),
            ..RetrieveRequest::default()
        }
    }

    #[tokio::test]
    async fn hybrid_retrieval_packs_sources_and_counts_hits() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        fixture.seed_text().await?;

        let strategy = RetrievalStrategy {
            top_k: 1,
            ..RetrievalStrategy::default()
        };
        let response = fixture
            .retriever()
            .retrieve(&request("pump maintenance", strategy))
            .await?;

        assert_eq!(response.slices.len(), 1);
        let hit = &response.slices[0];
        assert_eq!(hit.slice.id, 100);
        assert_eq!(hit.knowledge_name, "knowledge-1");
        assert!(hit.document_url.starts_with("file://"));
        assert_eq!(hit.content, "hydraulic pump maintenance schedule");

        let stored = fixture.meta.get_slice(100).await?.ok_or("slice missing")?;
        assert_eq!(stored.hit, 1);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_scope_returns_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        fixture.seed_text().await?;
        let mut disabled = knowledge(1, FormatType::Text);
        disabled.status = KnowledgeStatus::Disable;
        fixture.meta.update_knowledge(&disabled).await?;

        let response = fixture
            .retriever()
            .retrieve(&request("pump", RetrievalStrategy::default()))
            .await?;
        assert!(response.slices.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rewrite_failure_falls_back_to_the_original_query() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        fixture.seed_text().await?;

        let mut req = request(
            "coffee",
            RetrievalStrategy {
                search_type: SearchType::FullText,
                enable_query_rewrite: true,
                ..RetrievalStrategy::default()
            },
        );
        req.chat_history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];

        let response = fixture
            .retriever()
            .with_query_rewriter(Arc::new(FailingRewriter))
            .retrieve(&req)
            .await?;
        assert_eq!(response.slices.len(), 1);
        assert_eq!(response.slices[0].slice.id, 101);
        Ok(())
    }

    async fn seed_table(fixture: &Fixture) -> Result<(), Box<dyn std::error::Error>> {
        fixture.meta.create_knowledge(&knowledge(1, FormatType::Table)).await?;
        let info = create_physical_table(
            fixture.rdb.as_ref(),
            &SnowflakeIdGenerator::new(),
            "sales",
            "regional sales",
            &[
                TableColumn::new("region", ColumnType::String, true),
                TableColumn::new("amount", ColumnType::Integer, false),
            ],
        )
        .await?;

        let mut doc = document(20, 1, FileType::Csv);
        doc.status = DocumentStatus::Enable;
        doc.name = "sales".to_string();
        doc.table_info = Some(info.clone());
        fixture.meta.create_documents(&[doc.clone()]).await?;

        let rows = [(200, "north", 5), (201, "south", 40)];
        let mut slices = Vec::new();
        let mut rdb_rows = Vec::new();
        for (index, (id, region, amount)) in rows.into_iter().enumerate() {
            slices.push(slice(id, &doc, index as f64, ""));
            let values: Vec<ColumnData> = info
                .user_columns()
                .map(|column| ColumnData {
                    column_id: column.id,
                    column_name: column.name.clone(),
                    column_type: column.column_type,
                    value: if column.name == "region" {
                        CellValue::String(region.to_string())
                    } else {
                        CellValue::Integer(amount)
                    },
                })
                .collect();
            rdb_rows.push(rdb_row(id, &values));
        }
        fixture.meta.batch_create_slices(&slices).await?;
        fixture
            .rdb
            .insert_data(&info.physical_table_name, &rdb_rows)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn nl2sql_hits_are_resolved_to_table_rows() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        seed_table(&fixture).await?;

        let strategy = RetrievalStrategy {
            search_type: SearchType::Semantic,
            enable_nl2sql: true,
            ..RetrievalStrategy::default()
        };
        let response = fixture
            .retriever()
            .with_nl2sql(Arc::new(FixedNl2Sql(
                "SELECT region FROM sales WHERE amount > 10".to_string(),
            )))
            .retrieve(&request("which region sold more than 10", strategy))
            .await?;

        assert_eq!(response.slices.len(), 1);
        let hit = &response.slices[0];
        assert_eq!(hit.slice.id, 201);
        let row: serde_json::Value = serde_json::from_str(&hit.content)?;
        assert_eq!(row["region"], "south");
        assert_eq!(row["amount"], 40);
        assert_eq!(hit.slice.table_row.as_ref().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn unsafe_generated_sql_degrades_to_no_hits() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        seed_table(&fixture).await?;

        let strategy = RetrievalStrategy {
            search_type: SearchType::FullText,
            enable_nl2sql: true,
            ..RetrievalStrategy::default()
        };
        let response = fixture
            .retriever()
            .with_nl2sql(Arc::new(FixedNl2Sql("DROP TABLE sales".to_string())))
            .retrieve(&request("drop everything", strategy))
            .await?;
        assert!(response.slices.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn image_tags_point_at_object_urls() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        let content = fixture
            .retriever()
            .format_slice_content(r#"see <img src="" data-tos-key="img/a.png"> here"#)
            .await;
        assert!(content.starts_with("see <img src=\"file://"));
        assert!(content.ends_with("data-tos-key=\"img/a.png\" > here"));
        assert_eq!(parse_img_tags("no images").len(), 0);
        Ok(())
    }
}
