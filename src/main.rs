use std::sync::Arc;

use clap::Parser;
use ragweave::{
    CollectionId,
    CorpusStore,
    DataDir,
    EmbeddingProvider,
    EngineConfig,
    Error,
    HashingEmbedder,
    MemoryStore,
    RagComposer,
    Result,
    RetrievalEngine,
    StoreDb,
    ingestion::{DocumentSource, IngestionQueue, JobStatus, PlainTextExtractor},
    memory::MEMORY_MODEL_SETTING,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, CollectionAction, Command, MemoryAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("RAGWEAVE_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Everything a command needs, opened from the data directory.
struct Engine {
    config: EngineConfig,
    store: Arc<StoreDb>,
    corpus: Arc<CorpusStore>,
    memory: Arc<MemoryStore>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl Engine {
    fn open(data_dir: &DataDir) -> Result<Self> {
        let config = EngineConfig::load(&data_dir.config_file())?;
        let store = Arc::new(StoreDb::open(&data_dir.store_db())?);
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(HashingEmbedder::default());
        let corpus = Arc::new(CorpusStore::open(Arc::clone(&store))?);
        let memory = Arc::new(MemoryStore::open(
            Arc::clone(&store),
            Arc::clone(&provider),
            config.memory,
        )?);

        // Finish re-embedding that an earlier run left incomplete.
        if !corpus.stale_collections(provider.model_identifier()).is_empty() {
            corpus.reembed_stale(provider.as_ref());
        }
        if memory.needs_reembed() {
            memory.reembed(Arc::clone(&provider));
        }
        Ok(Self {
            config,
            store,
            corpus,
            memory,
            provider,
        })
    }

    fn retrieval(&self) -> RetrievalEngine {
        RetrievalEngine::new(
            Arc::clone(&self.corpus),
            Arc::clone(&self.provider),
            self.config.retrieval,
        )
    }

    /// Map collection names to ids; an empty list means all collections.
    fn scope(&self, names: &[String]) -> Result<Vec<CollectionId>> {
        names
            .iter()
            .map(|name| {
                self.corpus.find_by_name(name).map(|c| c.id).ok_or_else(|| {
                    Error::NotFound {
                        kind: "collection",
                        name: name.clone(),
                    }
                })
            })
            .collect()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let engine = Engine::open(&data_dir)?;

    match cli.command {
        Command::Ingest(args) => cmd_ingest(&engine, args)?,
        Command::Search(args) => cmd_search(&engine, &args)?,
        Command::Prompt(args) => {
            let scope = engine.scope(&args.collection)?;
            let composer = RagComposer::new(engine.config.composer)
                .with_retrieval(Arc::new(engine.retrieval()))
                .with_memory(Arc::clone(&engine.memory));
            let composed = composer.compose(&args.query, &scope);
            println!("{}", composed.prompt);
            eprintln!(
                "{} memories, {} chunks, {}/{} context chars",
                composed.memory_count,
                composed.chunk_count,
                composed.context_chars,
                engine.config.composer.budget_chars
            );
        }
        Command::Collection { action } => match action {
            CollectionAction::List { json } => collection_list(&engine, json)?,
            CollectionAction::Remove { name } => {
                let collection =
                    engine.corpus.find_by_name(&name).ok_or_else(|| {
                        Error::NotFound {
                            kind: "collection",
                            name: name.clone(),
                        }
                    })?;
                engine.corpus.remove_collection(collection.id);
                println!("Removed collection '{name}'");
            }
        },
        Command::Memory { action } => cmd_memory(&engine, action)?,
        Command::Reembed => {
            let chunks = engine.corpus.reembed_stale(engine.provider.as_ref());
            let memories = if engine.memory.needs_reembed() {
                engine.memory.reembed(Arc::clone(&engine.provider))
            } else {
                0
            };
            println!(
                "Re-embedded {chunks} chunks and {memories} memories with {}",
                engine.provider.model_identifier()
            );
        }
        Command::Status(args) => cmd_status(&engine, &data_dir, args.json)?,
    }

    // Writes that failed during the command get one last try.
    engine.corpus.flush()?;
    engine.memory.flush()?;
    Ok(())
}

fn cmd_ingest(engine: &Engine, args: cli::IngestArgs) -> Result<()> {
    if args.name.is_some() && args.paths.len() > 1 {
        return Err(Error::Config(
            "--name can only be used with a single path".into(),
        ));
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let failures = runtime.block_on(async {
        let queue = IngestionQueue::spawn(
            Arc::clone(&engine.corpus),
            Arc::clone(&engine.provider),
            Arc::new(PlainTextExtractor),
            engine.config.chunking,
        );

        let jobs: Vec<_> = args
            .paths
            .iter()
            .map(|path| {
                let id = queue.enqueue(
                    DocumentSource::File(path.clone()),
                    args.name.clone(),
                );
                (path, id)
            })
            .collect();

        let mut failures = 0usize;
        for (path, id) in jobs {
            match queue.wait(id).await {
                Some(JobStatus::Completed {
                    collection_id,
                    chunk_count,
                }) => {
                    println!(
                        "{}: {chunk_count} chunks -> {collection_id}",
                        path.display()
                    );
                }
                Some(JobStatus::Failed(reason)) => {
                    eprintln!("{}: {reason}", path.display());
                    failures += 1;
                }
                other => {
                    eprintln!("{}: {other:?}", path.display());
                    failures += 1;
                }
            }
        }
        queue.shutdown().await;
        failures
    });

    if failures > 0 {
        return Err(Error::Config(format!(
            "{failures} of {} documents failed to ingest",
            args.paths.len()
        )));
    }
    Ok(())
}

#[derive(Serialize)]
struct SearchHit<'a> {
    rank: usize,
    score: f32,
    collection: &'a str,
    location: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    strategy: ragweave::retrieval::RetrievalStrategy,
    results: Vec<SearchHit<'a>>,
}

fn cmd_search(engine: &Engine, args: &cli::SearchArgs) -> Result<()> {
    let scope = engine.scope(&args.collection)?;
    let outcome =
        engine
            .retrieval()
            .retrieve_scored(&args.query, args.count, &scope);

    let names: Vec<(CollectionId, String)> = engine
        .corpus
        .collections()
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();
    let name_of = |id: CollectionId| {
        names
            .iter()
            .find(|(cid, _)| *cid == id)
            .map_or("?", |(_, name)| name.as_str())
    };

    if args.json {
        let output = SearchOutput {
            query: &args.query,
            strategy: outcome.strategy,
            results: outcome
                .results
                .iter()
                .enumerate()
                .map(|(i, hit)| SearchHit {
                    rank: i + 1,
                    score: hit.score,
                    collection: name_of(hit.chunk.collection_id),
                    location: &hit.chunk.location_label,
                    content: &hit.chunk.content,
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if outcome.results.is_empty() {
        println!("No results.");
    } else {
        for (i, hit) in outcome.results.iter().enumerate() {
            println!(
                "{:>2}. {:.3}  {} [{}]",
                i + 1,
                hit.score,
                name_of(hit.chunk.collection_id),
                hit.chunk.location_label
            );
            let preview: String = hit.chunk.content.chars().take(160).collect();
            println!("    {}", preview.replace('\n', " "));
        }
    }
    Ok(())
}

fn collection_list(engine: &Engine, json: bool) -> Result<()> {
    let collections = engine.corpus.collections();

    if json {
        println!("{}", serde_json::to_string_pretty(&collections)?);
    } else if collections.is_empty() {
        println!("No collections.");
    } else {
        for c in &collections {
            let stamp = c.embedding_model_stamp.as_deref().unwrap_or("-");
            println!(
                "{}\t{}\t{} chunks\t{} bytes\t{stamp}",
                c.id, c.name, c.chunk_count, c.byte_size
            );
        }
    }
    Ok(())
}

fn cmd_memory(engine: &Engine, action: MemoryAction) -> Result<()> {
    match action {
        MemoryAction::Add { content, source } => {
            let id = engine.memory.insert(&content, &source)?;
            println!("Remembered {id}");
        }
        MemoryAction::List { json } => {
            let entries = engine.memory.list();
            if json {
                let entries: Vec<_> = entries.iter().map(|e| &**e).collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No memories.");
            } else {
                for e in &entries {
                    println!("{}\t{}\t{}", e.id, e.source_label, e.content);
                }
            }
        }
        MemoryAction::Remove { id } => {
            let prefix = id.trim_start_matches('#').to_ascii_lowercase();
            let matches: Vec<_> = engine
                .memory
                .list()
                .into_iter()
                .filter(|e| format!("{:016x}", e.id.raw()).starts_with(&prefix))
                .collect();
            match matches.as_slice() {
                [entry] => {
                    engine.memory.remove(entry.id);
                    println!("Forgot {}", entry.id);
                }
                [] => {
                    return Err(Error::NotFound {
                        kind: "memory",
                        name: id,
                    });
                }
                _ => {
                    return Err(Error::Config(format!(
                        "memory id '{id}' is ambiguous"
                    )));
                }
            }
        }
        MemoryAction::Search { query, count } => {
            let hits = engine.memory.retrieve(&query, count);
            if hits.is_empty() {
                println!("No matching memories.");
            }
            for hit in hits {
                println!(
                    "{:.3}\t{}\t{}",
                    hit.score, hit.entry.id, hit.entry.content
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Status<'a> {
    data_dir: String,
    embedding_model: &'a str,
    collections: usize,
    chunks: usize,
    memories: usize,
    stale_collections: usize,
    pending_writes: usize,
}

fn cmd_status(engine: &Engine, data_dir: &DataDir, json: bool) -> Result<()> {
    let model = engine.provider.model_identifier();
    let status = Status {
        data_dir: data_dir.root().display().to_string(),
        embedding_model: model,
        collections: engine.corpus.collections().len(),
        chunks: engine.corpus.chunk_count(),
        memories: engine.memory.len(),
        stale_collections: engine.corpus.stale_collections(model).len(),
        pending_writes: engine.corpus.pending_writes().len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Data directory: {}", status.data_dir);
        println!("Embedding model: {}", status.embedding_model);
        if let Some(stamp) = engine.store.get_setting(MEMORY_MODEL_SETTING)?
            && stamp != status.embedding_model
        {
            println!("Memory embeddings: {stamp} (stale)");
        }
        println!("Collections: {}", status.collections);
        println!("Chunks: {}", status.chunks);
        println!("Memories: {}", status.memories);
        if status.stale_collections > 0 {
            println!(
                "Stale collections: {} (run `ragweave reembed`)",
                status.stale_collections
            );
        }
    }
    Ok(())
}
