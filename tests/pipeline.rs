use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ragweave::{
    CompletionService,
    ContextConfig,
    Conversation,
    CorpusStore,
    EmbeddingProvider,
    MemoryConfig,
    MemoryStore,
    RagComposer,
    RetrievalConfig,
    RetrievalEngine,
    StoreDb,
    composer::ComposerConfig,
    ingestion::{DocumentSource, IngestionQueue, JobStatus, PlainTextExtractor},
    retrieval::RetrievalStrategy,
    session::{
        CompletionOptions,
        FACT_EXTRACTION_INSTRUCTIONS,
        SUMMARY_INSTRUCTIONS,
    },
};
use tokio::sync::mpsc;

const TOPICS: [&str; 4] = ["bread", "garden", "engine", "violin"];

/// One axis per topic word; text without any topic word has no vector.
struct TopicEmbedder {
    identifier: &'static str,
    available: bool,
}

impl TopicEmbedder {
    fn new(identifier: &'static str) -> Self {
        Self {
            identifier,
            available: true,
        }
    }
}

impl EmbeddingProvider for TopicEmbedder {
    fn is_available(&self) -> bool {
        self.available
    }

    fn dimension(&self) -> usize {
        TOPICS.len()
    }

    fn model_identifier(&self) -> &str {
        self.identifier
    }

    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = TOPICS
            .iter()
            .map(|t| lower.matches(t).count() as f32)
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return None;
        }
        v.iter_mut().for_each(|x| *x /= norm);
        Some(v)
    }
}

/// Canned replies for summaries, fact lists and turns.
#[derive(Default)]
struct ScriptedModel {
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    fn count(&self, instructions: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| i == instructions)
            .count()
    }

    fn last_turn_prompt(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(i, _)| {
                i != SUMMARY_INSTRUCTIONS && i != FACT_EXTRACTION_INSTRUCTIONS
            })
            .map(|(_, p)| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionService for ScriptedModel {
    async fn complete(
        &self,
        instructions: &str,
        prompt: &str,
        _options: CompletionOptions,
    ) -> ragweave::Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((instructions.to_string(), prompt.to_string()));
        Ok(match instructions {
            SUMMARY_INSTRUCTIONS => "We talked about baking bread.".into(),
            FACT_EXTRACTION_INSTRUCTIONS => "- bakes bread every sunday".into(),
            _ => "Sure.".into(),
        })
    }

    async fn stream(
        &self,
        instructions: &str,
        prompt: &str,
        options: CompletionOptions,
    ) -> ragweave::Result<mpsc::Receiver<ragweave::Result<String>>> {
        let reply = self.complete(instructions, prompt, options).await?;
        let (tx, rx) = mpsc::channel(1);
        tx.send(Ok(reply)).await.ok();
        Ok(rx)
    }
}

fn paragraph(topic: &str, sentences: usize) -> String {
    (0..sentences)
        .map(|i| format!("Note {i} is all about the {topic} and nothing else."))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn ingest(
    corpus: &Arc<CorpusStore>,
    provider: Arc<dyn EmbeddingProvider>,
    docs: &[(&str, String)],
) {
    let queue = IngestionQueue::spawn(
        Arc::clone(corpus),
        provider,
        Arc::new(PlainTextExtractor),
        Default::default(),
    );
    for (name, text) in docs {
        let id = queue.enqueue(
            DocumentSource::Text {
                name: name.to_string(),
                text: text.clone(),
            },
            None,
        );
        assert!(matches!(
            queue.wait(id).await,
            Some(JobStatus::Completed { .. })
        ));
    }
    queue.shutdown().await;
}

#[tokio::test]
async fn ingest_persist_reopen_and_retrieve() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("store.redb");
    let provider: Arc<dyn EmbeddingProvider> =
        Arc::new(TopicEmbedder::new("topics-v1"));

    {
        let store = Arc::new(StoreDb::open(&path).unwrap());
        let corpus = Arc::new(CorpusStore::open(store).unwrap());
        ingest(
            &corpus,
            Arc::clone(&provider),
            &[
                ("baking", paragraph("bread", 30)),
                ("yard", paragraph("garden", 30)),
            ],
        )
        .await;
    }

    let store = Arc::new(StoreDb::open(&path).unwrap());
    let corpus = Arc::new(CorpusStore::open(store).unwrap());
    assert_eq!(corpus.collections().len(), 2);

    let engine = RetrievalEngine::new(
        Arc::clone(&corpus),
        provider,
        RetrievalConfig::default(),
    );
    let outcome = engine.retrieve_scored("fresh bread", 3, &[]);
    assert_eq!(outcome.strategy, RetrievalStrategy::FullScan);
    assert!(!outcome.results.is_empty());
    assert!(outcome.results.iter().all(|r| r.chunk.content.contains("bread")));
    assert!(outcome.results.windows(2).all(|w| w[0].score >= w[1].score));

    // Scoped to the other collection, nothing about bread passes.
    let yard = corpus.find_by_name("yard").unwrap();
    assert!(engine.retrieve("fresh bread", 3, &[yard.id]).is_empty());
}

#[tokio::test]
async fn unavailable_provider_falls_back_to_keywords() {
    let corpus = Arc::new(CorpusStore::new());
    ingest(
        &corpus,
        Arc::new(TopicEmbedder {
            identifier: "topics-v1",
            available: false,
        }),
        &[("baking", paragraph("bread", 30))],
    )
    .await;

    let engine = RetrievalEngine::new(
        Arc::clone(&corpus),
        Arc::new(TopicEmbedder {
            identifier: "topics-v1",
            available: false,
        }),
        RetrievalConfig::default(),
    );
    let outcome = engine.retrieve_scored("bread", 2, &[]);
    assert_eq!(outcome.strategy, RetrievalStrategy::Keyword);
    assert!(!outcome.results.is_empty());
}

#[tokio::test]
async fn model_change_triggers_idempotent_reembed() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
    let corpus = Arc::new(CorpusStore::open(Arc::clone(&store)).unwrap());
    ingest(
        &corpus,
        Arc::new(TopicEmbedder::new("topics-v1")),
        &[("baking", paragraph("bread", 30))],
    )
    .await;

    let upgraded = TopicEmbedder::new("topics-v2");
    assert_eq!(corpus.stale_collections("topics-v2").len(), 1);
    let first = corpus.reembed_stale(&upgraded);
    assert!(first > 0);
    assert_eq!(corpus.reembed_stale(&upgraded), 0);

    let reopened = CorpusStore::open(store).unwrap();
    assert!(reopened.stale_collections("topics-v2").is_empty());
}

#[tokio::test]
async fn conversation_uses_context_and_rotates_into_memory() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(StoreDb::open(&tmp.path().join("store.redb")).unwrap());
    let provider: Arc<dyn EmbeddingProvider> =
        Arc::new(TopicEmbedder::new("topics-v1"));

    let corpus = Arc::new(CorpusStore::open(Arc::clone(&store)).unwrap());
    ingest(
        &corpus,
        Arc::clone(&provider),
        &[("baking", paragraph("bread", 30))],
    )
    .await;
    let memory = Arc::new(
        MemoryStore::open(
            Arc::clone(&store),
            Arc::clone(&provider),
            MemoryConfig::default(),
        )
        .unwrap(),
    );

    let composer = Arc::new(
        RagComposer::new(ComposerConfig::default())
            .with_retrieval(Arc::new(RetrievalEngine::new(
                corpus,
                Arc::clone(&provider),
                RetrievalConfig::default(),
            )))
            .with_memory(Arc::clone(&memory)),
    );

    let model = Arc::new(ScriptedModel::default());
    let mut conversation = Conversation::new(
        Arc::clone(&model) as Arc<dyn CompletionService>,
        "You are a kitchen assistant.",
        ContextConfig::default(),
    )
    .with_memory(Arc::clone(&memory))
    .with_composer(composer);

    let first = conversation.send("how do I bake bread?").await.unwrap();
    assert_eq!(first.reply, "Sure.");
    assert!(model.last_turn_prompt().contains("about the bread"));

    let budget = conversation.effective_max_turns();
    for _ in 1..budget {
        assert!(!conversation.send("more bread tips").await.unwrap().rotated);
    }
    let outcome = conversation.send("and rye bread?").await.unwrap();
    assert!(outcome.rotated);
    assert_eq!(model.count(SUMMARY_INSTRUCTIONS), 1);
    assert_eq!(model.count(FACT_EXTRACTION_INSTRUCTIONS), 1);
    assert_eq!(conversation.state().turn_count, 1);

    // The extracted fact was persisted.
    let reopened =
        MemoryStore::open(store, provider, MemoryConfig::default()).unwrap();
    let facts: Vec<String> =
        reopened.list().iter().map(|e| e.content.clone()).collect();
    assert_eq!(facts, vec!["bakes bread every sunday"]);
}
