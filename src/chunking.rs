//! Paragraph-aware chunking with soft overlap.
//!
//! Text is split on blank lines and paragraphs are packed greedily into
//! chunks of roughly `target_chars` characters. When a chunk is cut, the
//! next one starts with the tail of the previous chunk so that a sentence
//! straddling the boundary is still readable in at least one chunk.
//!
//! All lengths are measured in characters, not bytes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ids::{ChunkId, CollectionId},
    tokenizer::{extract_keywords, tokenize},
};

/// Default size a chunk grows to before it is cut.
pub const DEFAULT_TARGET_CHARS: usize = 600;

/// Chunks shorter than this are never emitted on their own.
pub const DEFAULT_MIN_CHARS: usize = 150;

/// Tail of a cut chunk carried into the next one.
pub const DEFAULT_OVERLAP_CHARS: usize = 100;

/// Keywords stored per chunk.
pub const DEFAULT_KEYWORD_LIMIT: usize = 8;

/// Separator placed between paragraphs inside a chunk.
const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Chunking parameters.
///
/// # Examples
///
/// ```
/// use ragweave::chunking::{ChunkingConfig, DEFAULT_TARGET_CHARS};
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.target_chars, DEFAULT_TARGET_CHARS);
/// assert!(config.min_chars < config.target_chars);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_chars: usize,
    pub min_chars: usize,
    pub overlap_chars: usize,
    pub keyword_limit: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: DEFAULT_TARGET_CHARS,
            min_chars: DEFAULT_MIN_CHARS,
            overlap_chars: DEFAULT_OVERLAP_CHARS,
            keyword_limit: DEFAULT_KEYWORD_LIMIT,
        }
    }
}

/// A labelled span of extracted document text (a page, chapter, heading...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub label: String,
    pub text: String,
}

impl Section {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
        }
    }
}

/// A keyword-tagged segment of source text; the unit of retrieval.
///
/// Everything except `embedding` is fixed at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub collection_id: CollectionId,
    pub content: String,
    /// Lowercased top keywords of `content`.
    pub keywords: BTreeSet<String>,
    /// Where the chunk came from, e.g. "Page 3" or a heading.
    pub location_label: String,
    /// Position of the chunk within its document, across all sections.
    pub sequence_index: usize,
    /// Stored separately as a binary blob.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    fn new(
        collection_id: CollectionId,
        content: String,
        location_label: &str,
        sequence_index: usize,
        keyword_limit: usize,
    ) -> Self {
        let keywords =
            extract_keywords(&content, keyword_limit).into_iter().collect();
        Self {
            id: ChunkId::derive(collection_id, sequence_index),
            collection_id,
            content,
            keywords,
            location_label: location_label.to_string(),
            sequence_index,
            embedding: None,
        }
    }

    /// Keywords plus every content token; what keyword search matches on.
    pub fn token_set(&self) -> BTreeSet<String> {
        let mut tokens = tokenize(&self.content);
        tokens.extend(self.keywords.iter().cloned());
        tokens
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Append a trailing paragraph and refresh the keywords.
    fn absorb(&mut self, text: &str, keyword_limit: usize) {
        self.content.push_str(PARAGRAPH_SEPARATOR);
        self.content.push_str(text);
        self.keywords = extract_keywords(&self.content, keyword_limit)
            .into_iter()
            .collect();
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The last `n` characters of `s`.
fn char_suffix(s: &str, n: usize) -> &str {
    let total = char_len(s);
    if n >= total {
        return s;
    }
    let skip = total - n;
    match s.char_indices().nth(skip) {
        Some((byte_idx, _)) => &s[byte_idx..],
        None => "",
    }
}

/// Split text into paragraphs at blank lines.
fn paragraphs(text: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                result.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        result.push(current.join("\n").trim().to_string());
    }

    result.retain(|p| !p.is_empty());
    result
}

/// Break an oversized paragraph at sentence ends so no piece is much longer
/// than `target` characters. A single sentence longer than `target` stays
/// whole.
fn split_long_paragraph(paragraph: &str, target: usize) -> Vec<String> {
    if char_len(paragraph) <= target {
        return vec![paragraph.to_string()];
    }

    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        let at_sentence_end = matches!(c, '.' | '!' | '?' | '\n')
            && chars.peek().is_some_and(|(_, next)| next.is_whitespace());
        if at_sentence_end {
            let end = idx + c.len_utf8();
            sentences.push(paragraph[start..end].trim());
            start = end;
        }
    }
    sentences.push(paragraph[start..].trim());

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    for sentence in sentences.into_iter().filter(|s| !s.is_empty()) {
        if !current.is_empty()
            && char_len(&current) + 1 + char_len(sentence) > target
        {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Split one section of text into overlapping chunks.
///
/// `counter` is the running sequence index shared by every section of the
/// same document; it is advanced once per emitted chunk.
///
/// A trailing remainder shorter than `min_chars` is folded into the
/// previous chunk, or dropped when there is none.
///
/// # Examples
///
/// ```
/// use ragweave::chunking::{chunk_text, ChunkingConfig};
/// use ragweave::ids::CollectionId;
///
/// let config = ChunkingConfig::default();
/// let text = "Paragraph about retrieval engines and vectors. ".repeat(40);
/// let mut counter = 0;
/// let chunks = chunk_text(
///     &text,
///     "Page 1",
///     CollectionId::from_raw(1),
///     &config,
///     &mut counter,
/// );
/// assert!(!chunks.is_empty());
/// assert_eq!(counter, chunks.len());
/// ```
pub fn chunk_text(
    text: &str,
    location_label: &str,
    collection_id: CollectionId,
    config: &ChunkingConfig,
    counter: &mut usize,
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buffer = String::new();
    // Byte offset in `buffer` where material not yet in any chunk begins.
    let mut fresh_from = 0usize;

    let pieces = paragraphs(text)
        .into_iter()
        .flat_map(|p| split_long_paragraph(&p, config.target_chars));

    for paragraph in pieces {
        let buffer_chars = char_len(&buffer);
        let appended = buffer_chars
            + PARAGRAPH_SEPARATOR.len()
            + char_len(&paragraph);

        if !buffer.is_empty()
            && appended > config.target_chars
            && buffer_chars >= config.min_chars
        {
            let seed = char_suffix(&buffer, config.overlap_chars)
                .trim_start()
                .to_string();
            let emitted = std::mem::take(&mut buffer);
            chunks.push(Chunk::new(
                collection_id,
                emitted,
                location_label,
                *counter,
                config.keyword_limit,
            ));
            *counter += 1;

            buffer = seed;
            if !buffer.is_empty() {
                buffer.push_str(PARAGRAPH_SEPARATOR);
            }
            fresh_from = buffer.len();
            buffer.push_str(&paragraph);
        } else {
            if !buffer.is_empty() {
                buffer.push_str(PARAGRAPH_SEPARATOR);
            }
            buffer.push_str(&paragraph);
        }
    }

    if buffer.trim().is_empty() {
        return chunks;
    }

    if char_len(&buffer) >= config.min_chars {
        chunks.push(Chunk::new(
            collection_id,
            buffer,
            location_label,
            *counter,
            config.keyword_limit,
        ));
        *counter += 1;
    } else if let Some(previous) = chunks.last_mut() {
        // Only the part after the overlap seed is new to `previous`.
        let tail = buffer[fresh_from..].trim();
        if !tail.is_empty() {
            previous.absorb(tail, config.keyword_limit);
        }
    }

    chunks
}

/// Chunk every section of a document in order with one shared counter.
///
/// A section too short to form a chunk is carried into the next one and
/// the merged text keeps the label of the first. Whatever is still
/// carried after the last section is appended to the document's last
/// chunk.
///
/// Fails with [`Error::ChunkingProducedNothing`] if no section yields a
/// chunk, e.g. because the whole document is shorter than `min_chars`.
pub fn chunk_sections(
    sections: &[Section],
    collection_id: CollectionId,
    config: &ChunkingConfig,
    document_name: &str,
) -> Result<Vec<Chunk>> {
    let mut counter = 0usize;
    let mut chunks: Vec<Chunk> = Vec::new();
    // (label, text) of short sections not yet in any chunk.
    let mut carried: Option<(&str, String)> = None;

    for section in sections {
        let text = section.text.trim();
        if text.is_empty() {
            continue;
        }
        let (label, text) = match carried.take() {
            Some((label, mut held)) => {
                held.push_str(PARAGRAPH_SEPARATOR);
                held.push_str(text);
                (label, held)
            }
            None => (section.label.as_str(), text.to_string()),
        };

        let emitted =
            chunk_text(&text, label, collection_id, config, &mut counter);
        if emitted.is_empty() {
            carried = Some((label, text));
        } else {
            chunks.extend(emitted);
        }
    }

    if let Some((_, text)) = carried
        && let Some(last) = chunks.last_mut()
    {
        last.absorb(&text, config.keyword_limit);
    }

    if chunks.is_empty() {
        return Err(Error::ChunkingProducedNothing(document_name.to_string()));
    }
    Ok(chunks)
}
