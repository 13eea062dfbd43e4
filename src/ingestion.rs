//! Document extraction and the background ingestion queue.
//!
//! Jobs run one at a time on a Tokio task. Extraction, chunking and
//! embedding happen on the blocking pool; the finished collection is then
//! swapped into the [`CorpusStore`] in a single write.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    chunking::{ChunkingConfig, Section, chunk_sections},
    corpus::{Collection, CorpusStore},
    embedding::{EmbeddingProvider, embed_chunks},
    error::{Error, Result},
    ids::CollectionId,
};

const INTRODUCTION_LABEL: &str = "Introduction";

/// Finished jobs whose status is kept for [`IngestionQueue::status`].
const FINISHED_HISTORY: usize = 256;

/// Where a document's text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    File(PathBuf),
    /// Inline text, treated as a plain text document called `name`.
    Text { name: String, text: String },
}

impl DocumentSource {
    /// Default collection name: the file stem, or the inline name.
    pub fn display_name(&self) -> String {
        match self {
            Self::File(path) => path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("untitled")
                .to_string(),
            Self::Text { name, .. } => name.clone(),
        }
    }
}

/// Turns a document into labelled sections of text.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, source: &DocumentSource) -> Result<Vec<Section>>;
}

/// Extractor for markdown and plain text files.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, source: &DocumentSource) -> Result<Vec<Section>> {
        let (name, sections) = match source {
            DocumentSource::File(path) => {
                let name = file_name(path);
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase);
                let sections = match ext.as_deref() {
                    Some("md" | "markdown") => {
                        split_markdown(&std::fs::read_to_string(path)?)
                    }
                    Some("txt") => vec![Section::new(
                        name.clone(),
                        std::fs::read_to_string(path)?,
                    )],
                    _ => return Err(Error::UnsupportedFormat(name)),
                };
                (name, sections)
            }
            DocumentSource::Text { name, text } => {
                (name.clone(), vec![Section::new(name.clone(), text.clone())])
            }
        };

        let sections: Vec<Section> = sections
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect();
        if sections.is_empty() {
            return Err(Error::NoTextFound(name));
        }
        Ok(sections)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Heading text of an ATX heading line (`## Title ##`), if it is one.
fn atx_heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim_end())
}

/// Split markdown at ATX headings. Text before the first heading becomes
/// an "Introduction" section.
fn split_markdown(content: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut label = INTRODUCTION_LABEL.to_string();
    let mut body = String::new();
    let mut in_fence = false;

    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let heading = if in_fence { None } else { atx_heading(line) };
        match heading {
            Some(text) => {
                sections.push(Section::new(
                    std::mem::take(&mut label),
                    std::mem::take(&mut body),
                ));
                label = if text.is_empty() {
                    "Untitled section".to_string()
                } else {
                    text.to_string()
                };
            }
            None => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    sections.push(Section::new(label, body));
    sections
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed {
        collection_id: CollectionId,
        chunk_count: usize,
    },
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Processing)
    }
}

struct Job {
    id: JobId,
    source: DocumentSource,
    name: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    statuses: HashMap<JobId, JobStatus>,
    next_id: u64,
    shutting_down: bool,
}

impl QueueState {
    /// Record a terminal status, forgetting the oldest finished jobs
    /// beyond [`FINISHED_HISTORY`].
    fn finish(&mut self, id: JobId, status: JobStatus) {
        self.statuses.insert(id, status);
        let mut finished: Vec<JobId> = self
            .statuses
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        if finished.len() <= FINISHED_HISTORY {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - FINISHED_HISTORY;
        for old in &finished[..excess] {
            self.statuses.remove(old);
        }
    }

    /// Refuse new work and cancel everything still queued.
    fn stop(&mut self) -> Vec<JobId> {
        self.shutting_down = true;
        let dropped: Vec<JobId> =
            self.pending.drain(..).map(|job| job.id).collect();
        for id in &dropped {
            self.finish(*id, JobStatus::Cancelled);
        }
        dropped
    }
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Notify,
    job_finished: Notify,
    corpus: Arc<CorpusStore>,
    provider: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn DocumentExtractor>,
    chunking: ChunkingConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: JobId, status: JobStatus) {
        self.lock().finish(id, status);
        self.job_finished.notify_waiters();
    }

    fn stop(&self) {
        let dropped = self.lock().stop();
        if !dropped.is_empty() {
            info!(count = dropped.len(), "cancelled queued ingestion jobs");
        }
        self.work_ready.notify_one();
        self.job_finished.notify_waiters();
    }

    /// Extract, chunk, embed and store one document. Runs on the blocking
    /// pool.
    fn ingest(&self, source: &DocumentSource, name: &str) -> Result<Collection> {
        let sections = self.extractor.extract(source)?;
        let id = CollectionId::generate(name);
        let mut chunks = chunk_sections(&sections, id, &self.chunking, name)?;

        let embedded = embed_chunks(self.provider.as_ref(), &mut chunks);
        let stamp = if embedded > 0 {
            Some(self.provider.model_identifier().to_string())
        } else {
            if self.provider.is_available() {
                warn!(name, "no chunk could be embedded");
            }
            None
        };
        debug!(name, chunks = chunks.len(), embedded, "chunked document");

        Ok(self.corpus.insert_collection(id, name, chunks, stamp))
    }
}

/// Sequential background ingestion.
pub struct IngestionQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionQueue {
    /// Start the worker task. Must be called from within a Tokio runtime.
    pub fn spawn(
        corpus: Arc<CorpusStore>,
        provider: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn DocumentExtractor>,
        chunking: ChunkingConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            work_ready: Notify::new(),
            job_finished: Notify::new(),
            corpus,
            provider,
            extractor,
            chunking,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a document. `name` defaults to [`DocumentSource::display_name`].
    /// Re-using an existing collection name replaces that collection.
    pub fn enqueue(&self, source: DocumentSource, name: Option<String>) -> JobId {
        let name = name.unwrap_or_else(|| source.display_name());
        let id = {
            let mut state = self.shared.lock();
            let id = JobId(state.next_id);
            state.next_id += 1;
            if state.shutting_down {
                state.finish(id, JobStatus::Cancelled);
                return id;
            }
            state.statuses.insert(id, JobStatus::Queued);
            state.pending.push_back(Job { id, source, name });
            id
        };
        debug!(job = %id, "queued ingestion job");
        self.shared.work_ready.notify_one();
        id
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.shared.lock().statuses.get(&id).cloned()
    }

    /// Number of jobs waiting to start.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Cancel a job that has not started yet. Returns `false` if the job is
    /// unknown, running or finished.
    pub fn cancel(&self, id: JobId) -> bool {
        let cancelled = {
            let mut state = self.shared.lock();
            let before = state.pending.len();
            state.pending.retain(|job| job.id != id);
            let removed = state.pending.len() != before;
            if removed {
                state.finish(id, JobStatus::Cancelled);
            }
            removed
        };
        if cancelled {
            info!(job = %id, "ingestion job cancelled");
            self.shared.job_finished.notify_waiters();
        }
        cancelled
    }

    /// Wait until the job reaches a terminal state. Returns `None` for an
    /// unknown id, or one finished so long ago that it was forgotten.
    pub async fn wait(&self, id: JobId) -> Option<JobStatus> {
        loop {
            let finished = self.shared.job_finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();

            match self.status(id) {
                None => return None,
                Some(status) if status.is_terminal() => return Some(status),
                Some(_) => finished.await,
            }
        }
    }

    /// Stop after the in-flight job. Jobs still queued are cancelled.
    pub async fn shutdown(&self) {
        self.shared.stop();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "ingestion worker ended abnormally");
        }
    }
}

/// Dropping the queue stops the worker like [`IngestionQueue::shutdown`],
/// without waiting for the in-flight job.
impl Drop for IngestionQueue {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl fmt::Debug for IngestionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionQueue")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.lock();
            if state.shutting_down {
                break;
            }
            let job = state.pending.pop_front();
            if let Some(job) = &job {
                state.statuses.insert(job.id, JobStatus::Processing);
            }
            job
        };

        let Some(job) = next else {
            shared.work_ready.notified().await;
            continue;
        };

        info!(job = %job.id, name = %job.name, "ingestion started");
        let id = job.id;
        let task_shared = Arc::clone(&shared);
        let result = tokio::task::spawn_blocking(move || {
            task_shared.ingest(&job.source, &job.name)
        })
        .await;

        let status = match result {
            Ok(Ok(collection)) => {
                info!(
                    job = %id,
                    collection = %collection.id,
                    chunks = collection.chunk_count,
                    "ingestion completed"
                );
                JobStatus::Completed {
                    collection_id: collection.id,
                    chunk_count: collection.chunk_count,
                }
            }
            Ok(Err(e)) => {
                warn!(job = %id, error = %e, "ingestion failed");
                JobStatus::Failed(e.to_string())
            }
            Err(e) => {
                warn!(job = %id, error = %e, "ingestion task panicked");
                JobStatus::Failed(e.to_string())
            }
        };
        shared.finish(id, status);
    }
    debug!("ingestion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn paragraph(word: &str, sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("The {word} topic sentence number {i} goes on."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn queue(corpus: &Arc<CorpusStore>) -> IngestionQueue {
        IngestionQueue::spawn(
            Arc::clone(corpus),
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(PlainTextExtractor),
            ChunkingConfig::default(),
        )
    }

    #[test]
    fn markdown_splits_at_headings() {
        let md = "Preface text.\n\n# Setup\n\nInstall it.\n\n\
                  ## Usage ##\n\nRun it.\n";
        let sections = split_markdown(md);
        let labels: Vec<&str> =
            sections.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Introduction", "Setup", "Usage"]);
        assert!(sections[1].text.contains("Install it."));
    }

    #[test]
    fn hashes_inside_code_fences_are_not_headings() {
        let md = "# Script\n\n```sh\n# a shell comment\n```\n";
        let sections = split_markdown(md);
        assert_eq!(sections.len(), 2);
        assert!(sections[1].text.contains("# a shell comment"));
    }

    #[test]
    fn atx_heading_rules() {
        assert_eq!(atx_heading("# Title"), Some("Title"));
        assert_eq!(atx_heading("### Deep ###"), Some("Deep"));
        assert_eq!(atx_heading("#hashtag"), None);
        assert_eq!(atx_heading("####### seven"), None);
        assert_eq!(atx_heading("    # indented code"), None);
    }

    #[test]
    fn plain_text_is_one_section_named_after_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "# not a heading in txt\nbody").unwrap();

        let sections = PlainTextExtractor
            .extract(&DocumentSource::File(path))
            .unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].label, "notes.txt");
    }

    #[test]
    fn unsupported_and_empty_documents_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let pdf = tmp.path().join("paper.pdf");
        std::fs::write(&pdf, "%PDF-1.7").unwrap();
        let err = PlainTextExtractor
            .extract(&DocumentSource::File(pdf))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));

        let empty = DocumentSource::Text {
            name: "blank".into(),
            text: "  \n\n ".into(),
        };
        let err = PlainTextExtractor.extract(&empty).unwrap_err();
        assert!(matches!(err, Error::NoTextFound(_)));
    }

    #[tokio::test]
    async fn job_completes_and_stores_collection() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);

        let id = queue.enqueue(
            DocumentSource::Text {
                name: "baking".into(),
                text: paragraph("baking", 40),
            },
            None,
        );
        let status = queue.wait(id).await.unwrap();
        let JobStatus::Completed {
            collection_id,
            chunk_count,
        } = status
        else {
            panic!("unexpected status {status:?}");
        };

        let collection = corpus.collection(collection_id).unwrap();
        assert_eq!(collection.name, "baking");
        assert_eq!(collection.chunk_count, chunk_count);
        assert_eq!(
            collection.embedding_model_stamp.as_deref(),
            Some("hashing-bow-64")
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn failed_job_does_not_block_the_next() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);

        let bad = queue.enqueue(
            DocumentSource::File(PathBuf::from("/nonexistent/archive.zip")),
            None,
        );
        let good = queue.enqueue(
            DocumentSource::Text {
                name: "garden".into(),
                text: paragraph("garden", 40),
            },
            None,
        );

        assert!(matches!(queue.wait(bad).await, Some(JobStatus::Failed(_))));
        assert!(matches!(
            queue.wait(good).await,
            Some(JobStatus::Completed { .. })
        ));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn reingesting_a_name_replaces_the_collection() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);

        for word in ["first", "second"] {
            let id = queue.enqueue(
                DocumentSource::Text {
                    name: "notes".into(),
                    text: paragraph(word, 40),
                },
                None,
            );
            queue.wait(id).await;
        }

        let collections = corpus.collections();
        assert_eq!(collections.len(), 1);
        let chunks = corpus.chunks_of(collections[0].id);
        assert!(chunks.iter().all(|c| c.content.contains("second")));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_only_affects_queued_jobs() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);

        let ids: Vec<JobId> = (0..4)
            .map(|i| {
                queue.enqueue(
                    DocumentSource::Text {
                        name: format!("doc{i}"),
                        text: paragraph("cancel", 40),
                    },
                    None,
                )
            })
            .collect();
        let last = ids[3];
        let cancelled = queue.cancel(last);

        for id in &ids[..3] {
            assert!(matches!(
                queue.wait(*id).await,
                Some(JobStatus::Completed { .. })
            ));
        }
        if cancelled {
            assert_eq!(queue.status(last), Some(JobStatus::Cancelled));
        }
        // Finished jobs cannot be cancelled.
        assert!(!queue.cancel(ids[0]));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_has_no_status() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);
        assert_eq!(queue.wait(JobId(999)).await, None);
        queue.shutdown().await;
    }

    #[test]
    fn finished_history_is_bounded() {
        let mut state = QueueState::default();
        let total = FINISHED_HISTORY as u64 + 10;
        for raw in 0..total {
            state.finish(JobId(raw), JobStatus::Cancelled);
        }
        state.statuses.insert(JobId(total), JobStatus::Queued);

        assert_eq!(state.statuses.len(), FINISHED_HISTORY + 1);
        assert!(!state.statuses.contains_key(&JobId(0)));
        assert!(state.statuses.contains_key(&JobId(total - 1)));
    }

    #[tokio::test]
    async fn dropping_the_queue_stops_the_worker() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);
        let worker = queue
            .worker
            .lock()
            .unwrap()
            .take()
            .unwrap();

        drop(queue);
        tokio::time::timeout(std::time::Duration::from_secs(5), worker)
            .await
            .expect("worker still running")
            .unwrap();
    }

    #[test]
    fn markdown_faq_keeps_every_short_answer() {
        let answer = |topic: &str| {
            format!("Answer about {topic}, kept short on purpose.\n")
        };
        let md = format!(
            "# Shipping\n{}\n# Returns\n{}\n# Warranty\n{}\n# Contact\n{}",
            answer("parcels").repeat(2),
            answer("refunds").repeat(2),
            answer("repairs").repeat(2),
            answer("email").repeat(2),
        );
        let sections = split_markdown(&md);
        let chunks = chunk_sections(
            &sections,
            CollectionId::from_raw(7),
            &ChunkingConfig::default(),
            "faq.md",
        )
        .unwrap();

        let all: String = chunks.iter().map(|c| c.content.as_str()).collect();
        for topic in ["parcels", "refunds", "repairs", "email"] {
            assert!(all.contains(topic), "{topic} was lost");
        }
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_cancelled() {
        let corpus = Arc::new(CorpusStore::new());
        let queue = queue(&corpus);
        queue.shutdown().await;

        let id = queue.enqueue(
            DocumentSource::Text {
                name: "late".into(),
                text: paragraph("late", 40),
            },
            None,
        );
        assert_eq!(queue.wait(id).await, Some(JobStatus::Cancelled));
    }
}
