use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use knowledge_engine_core::schema::load_sheet;
use knowledge_engine_core::service::PREVIEW_ROW_COUNT;
use knowledge_engine_core::{
    discover_files, Backends, BuiltinParserManager, ChannelEventBus, ChatMessage, CreateDocumentRequest,
    CreateKnowledgeRequest, DocumentInput, DocumentSource, DocumentStatus, EngineConfig, FileType, FormatType,
    HashingEmbedder, IdGenerator, KnowledgeError, KnowledgeService, LocalObjectStorage, MemoryMetaStore,
    MemorySearchStoreManager, Nl2Sql, ObjectStorage, OpenSearchStoreManager, ParsingStrategy, QdrantStoreManager,
    RetrievalStrategy, RetrieveRequest, SearchStoreManager, SearchType, SnowflakeIdGenerator, SqliteRdb,
    VirtualTableSchema,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "knowledge-engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (TOML).
    #[arg(long, env = "KNOWLEDGE_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// OpenSearch base URL; the in-process full-text store is used when absent.
    #[arg(long, env = "KNOWLEDGE_ENGINE_OPENSEARCH_URL")]
    opensearch_url: Option<String>,

    /// Qdrant base URL; the in-process vector store is used when absent.
    #[arg(long, env = "KNOWLEDGE_ENGINE_QDRANT_URL")]
    qdrant_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest files, index them and answer one query with ranked slices.
    Ask {
        /// Files to ingest.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Folder scanned recursively for supported files.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Query text.
        #[arg(long)]
        query: String,
        #[arg(long, value_enum, default_value_t = StrategyArg::Hybrid)]
        strategy: StrategyArg,
        #[arg(long, default_value = "3")]
        top_k: usize,
        /// Enable the NL2SQL channel for table knowledge.
        #[arg(long, default_value_t = false)]
        nl2sql: bool,
        /// SQL over virtual table names used as the NL2SQL answer.
        #[arg(long, requires = "nl2sql")]
        sql: Option<String>,
    },
    /// Print the inferred columns and first rows of a CSV or JSON table.
    PreviewTable {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Semantic,
    Fulltext,
    Hybrid,
}

impl From<StrategyArg> for SearchType {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Semantic => SearchType::Semantic,
            StrategyArg::Fulltext => SearchType::FullText,
            StrategyArg::Hybrid => SearchType::Hybrid,
        }
    }
}

/// Answers every NL2SQL request with one caller-supplied statement.
struct FixedSql(String);

#[async_trait]
impl Nl2Sql for FixedSql {
    async fn generate(&self, _messages: &[ChatMessage], _tables: &[VirtualTableSchema]) -> Result<String, KnowledgeError> {
        Ok(self.0.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "knowledge-engine boot"
    );

    match cli.command {
        Command::Ask {
            files,
            dir,
            query,
            strategy,
            top_k,
            nl2sql,
            sql,
        } => {
            let mut paths = files;
            if let Some(dir) = dir {
                paths.extend(discover_files(&dir, None));
            }
            if paths.is_empty() {
                anyhow::bail!("no input files, pass --file or --dir");
            }
            ask(
                &config,
                cli.opensearch_url.as_deref(),
                cli.qdrant_url.as_deref(),
                &paths,
                AskOptions {
                    query,
                    search_type: strategy.into(),
                    top_k,
                    nl2sql,
                    sql,
                },
            )
            .await
        }
        Command::PreviewTable { file } => preview_table(&file).await,
    }
}

struct AskOptions {
    query: String,
    search_type: SearchType,
    top_k: usize,
    nl2sql: bool,
    sql: Option<String>,
}

async fn build_backends(
    config: &EngineConfig,
    opensearch_url: Option<&str>,
    qdrant_url: Option<&str>,
    bus: Arc<ChannelEventBus>,
    idgen: Arc<SnowflakeIdGenerator>,
) -> anyhow::Result<Backends> {
    let embedder = Arc::new(HashingEmbedder::default());
    let vector: Arc<dyn SearchStoreManager> = match qdrant_url {
        Some(url) => Arc::new(QdrantStoreManager::new(url, embedder)),
        None => Arc::new(MemorySearchStoreManager::vector(embedder)),
    };
    let full_text: Arc<dyn SearchStoreManager> = match opensearch_url {
        Some(url) => Arc::new(OpenSearchStoreManager::new(url)),
        None => Arc::new(MemorySearchStoreManager::full_text()),
    };

    Ok(Backends {
        meta: Arc::new(MemoryMetaStore::new()),
        rdb: Arc::new(SqliteRdb::connect(&config.storage.sqlite_url).await?),
        storage: Arc::new(LocalObjectStorage::new(&config.storage.object_root)),
        search_stores: vec![vector, full_text],
        parsers: Arc::new(BuiltinParserManager::default()),
        idgen,
        bus,
    })
}

async fn ask(
    config: &EngineConfig,
    opensearch_url: Option<&str>,
    qdrant_url: Option<&str>,
    paths: &[PathBuf],
    options: AskOptions,
) -> anyhow::Result<()> {
    let bus = Arc::new(ChannelEventBus::new());
    let idgen = Arc::new(SnowflakeIdGenerator::new());
    let backends = build_backends(config, opensearch_url, qdrant_url, bus.clone(), idgen.clone()).await?;
    let mut service = KnowledgeService::new(backends.clone(), config.clone());
    if let Some(sql) = options.sql {
        service = service.with_nl2sql(Arc::new(FixedSql(sql)));
    }

    let mut groups: BTreeMap<&'static str, (FormatType, Vec<(PathBuf, FileType)>)> = BTreeMap::new();
    for path in paths {
        let name = file_name(path);
        let Some(file_type) = FileType::from_file_name(&name) else {
            warn!(path = %path.display(), "unsupported file type, skipped");
            continue;
        };
        let format = file_type.format_type();
        groups
            .entry(format_label(format))
            .or_insert_with(|| (format, Vec::new()))
            .1
            .push((path.clone(), file_type));
    }

    let mut knowledge_ids = Vec::new();
    for (label, (format, files)) in groups {
        let knowledge = service
            .create_knowledge(CreateKnowledgeRequest {
                name: format!("cli-{label}"),
                description: String::new(),
                space_id: 1,
                app_id: 0,
                creator_id: 1,
                format_type: format,
            })
            .await?;
        knowledge_ids.push(knowledge.id);

        let mut inputs = Vec::with_capacity(files.len());
        for (path, file_type) in files {
            let name = file_name(&path);
            let key = format!("uploads/{}/{}", idgen.gen_id(), name);
            let bytes = tokio::fs::read(&path).await?;
            backends.storage.put_object(&key, &bytes).await?;
            let mut input = DocumentInput::new(name, file_type);
            input.uri = key;
            inputs.push(input);
        }
        // one document per request keeps table sources in separate physical tables
        for input in inputs {
            service
                .create_document(CreateDocumentRequest {
                    knowledge_id: knowledge.id,
                    creator_id: 1,
                    space_id: 1,
                    source: DocumentSource::LocalUpload,
                    documents: vec![input],
                })
                .await?;
        }
    }

    let delivered = service.drain_events(&bus).await?;
    info!(delivered, "indexing events drained");
    for knowledge_id in &knowledge_ids {
        for document in service.list_documents(*knowledge_id).await? {
            if document.status != DocumentStatus::Enable {
                warn!(
                    document = %document.name,
                    status = ?document.status,
                    message = %document.status_msg,
                    "document not indexed"
                );
            }
        }
    }

    let response = service
        .retrieve(&RetrieveRequest {
            query: options.query.clone(),
            chat_history: Vec::new(),
            knowledge_ids,
            document_ids: Vec::new(),
            strategy: Some(RetrievalStrategy {
                top_k: options.top_k,
                search_type: options.search_type,
                enable_nl2sql: options.nl2sql,
                ..RetrievalStrategy::default()
            }),
        })
        .await?;

    if response.slices.is_empty() {
        println!("no results for \"{}\"", options.query);
        return Ok(());
    }
    for (rank, hit) in response.slices.iter().enumerate() {
        println!(
            "{}. score={:.4} knowledge={} document={}",
            rank + 1,
            hit.score,
            hit.knowledge_name,
            hit.document_name
        );
        println!("   {}", preview(&hit.content, 240));
    }
    Ok(())
}

async fn preview_table(path: &Path) -> anyhow::Result<()> {
    let name = file_name(path);
    let file_type = FileType::from_file_name(&name)
        .filter(|file_type| file_type.format_type() == FormatType::Table)
        .ok_or_else(|| anyhow::anyhow!("{name} is not a csv or json table"))?;
    let bytes = tokio::fs::read(path).await?;
    let sheet = load_sheet(
        &BuiltinParserManager::default(),
        &bytes,
        file_type,
        &ParsingStrategy::default(),
        &[],
    )?;

    println!("rows: {}", sheet.sheet.total_rows);
    for column in &sheet.columns {
        println!("column {} {:?}", column.name, column.column_type);
    }
    for row in sheet.rows.iter().take(PREVIEW_ROW_COUNT) {
        let cells: Vec<String> = row.iter().map(|cell| cell.value.to_display_string()).collect();
        println!("{}", cells.join(" | "));
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn format_label(format: FormatType) -> &'static str {
    match format {
        FormatType::Text => "text",
        FormatType::Table => "table",
        FormatType::Image => "image",
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
