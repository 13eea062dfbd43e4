//! Per-conversation context budget.
//!
//! A [`Conversation`] owns one [`CompletionSession`] and decides when the
//! session has grown too large. Before a send it may *rotate*: the recent
//! transcript is summarized through the completion service, optionally
//! mined for long-term memories, and the session is rebuilt with that
//! summary baked into its instructions.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::{
    composer::RagComposer,
    error::{Error, Result},
    ids::CollectionId,
    memory::MemoryStore,
};

/// Rough characters-per-token ratio used for all budget estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Instructions for the rotation summary request.
pub const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation below in a \
     few sentences. Keep names, decisions, open questions and facts the \
     user stated. Reply with the summary only.";

/// Instructions for the long-term fact extraction request.
pub const FACT_EXTRACTION_INSTRUCTIONS: &str = "List durable facts about the \
     user from the conversation below, one per line. Only include \
     preferences, personal details or ongoing projects worth remembering \
     later. Reply with NONE if there are none.";

const ROTATION_NOTICE: &str =
    "Earlier messages were summarized to keep the conversation within the \
     model's context window.";

const MEMORY_SOURCE_LABEL: &str = "conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Greedy decoding; the same input yields the same output.
    Deterministic,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOptions {
    pub sampling: Sampling,
    pub max_tokens: Option<usize>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            sampling: Sampling::Default,
            max_tokens: None,
        }
    }
}

impl CompletionOptions {
    pub fn deterministic(max_tokens: usize) -> Self {
        Self {
            sampling: Sampling::Deterministic,
            max_tokens: Some(max_tokens),
        }
    }
}

/// The language model, seen as an opaque text completion service.
///
/// Implementations report an over-long prompt as
/// [`Error::ContextWindowExceeded`] so the conversation can rotate and
/// retry.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        instructions: &str,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<String>;

    /// Stream the reply as incremental text deltas.
    async fn stream(
        &self,
        instructions: &str,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// A tool the model may hand work off to. Only its description counts
/// against the budget; it is never invoked from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedTool {
    pub name: String,
    pub trigger_description: String,
}

impl DelegatedTool {
    pub fn new(
        name: impl Into<String>,
        trigger_description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_description: trigger_description.into(),
        }
    }

    fn schema_chars(&self) -> usize {
        self.name.chars().count() + self.trigger_description.chars().count()
    }
}

/// The model-side session: standing instructions plus the transcript since
/// the last rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSession {
    pub instructions: String,
    pub transcript: Vec<ChatMessage>,
}

impl CompletionSession {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            transcript: Vec::new(),
        }
    }

    /// The prompt sent for a new user turn: the transcript so far followed
    /// by the new message.
    pub fn render(&self, user_turn: &str) -> String {
        if self.transcript.is_empty() {
            return user_turn.to_string();
        }
        let mut out = render_messages(&self.transcript);
        out.push_str("\n\nUser: ");
        out.push_str(user_turn);
        out
    }
}

fn render_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let speaker = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The last `n` characters of `s`.
fn char_tail(s: &str, n: usize) -> &str {
    let total = s.chars().count();
    if total <= n {
        return s;
    }
    match s.char_indices().nth(total - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Parse a fact-extraction reply into individual facts.
fn parse_facts(reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(|line| {
            let line = line.trim();
            let line = line.trim_start_matches(['-', '*', '•']).trim_start();
            // Numbered lists: "1." / "2)".
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            let rest = &line[digits..];
            if digits > 0
                && let Some(stripped) =
                    rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))
            {
                stripped.trim().to_string()
            } else {
                line.to_string()
            }
        })
        .filter(|fact| !fact.is_empty() && !fact.eq_ignore_ascii_case("none"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Turns allowed between rotations with no delegated tools.
    pub base_max_turns: usize,
    /// Lower bound on the turn budget.
    pub min_max_turns: usize,
    /// Turns taken off the budget when any delegated tool is active.
    pub tool_turn_penalty: usize,
    pub chars_per_token: usize,
    /// Size of the model's context window, in tokens.
    pub estimated_max_tokens: usize,
    /// Messages fed to the summarizer on rotation.
    pub summary_message_count: usize,
    pub summary_max_tokens: usize,
    /// Characters of transcript kept when summarization fails.
    pub digest_chars: usize,
    /// Rotate early once estimated usage reaches this fraction.
    pub rotate_at_usage: Option<f32>,
    pub extract_memories: bool,
    /// Token cap for normal replies; `None` leaves it to the service.
    pub reply_max_tokens: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            base_max_turns: 6,
            min_max_turns: 3,
            tool_turn_penalty: 1,
            chars_per_token: CHARS_PER_TOKEN,
            estimated_max_tokens: 4096,
            summary_message_count: 6,
            summary_max_tokens: 256,
            digest_chars: 600,
            rotate_at_usage: Some(0.9),
            extract_memories: true,
            reply_max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContextState {
    /// Completed exchanges since the last rotation.
    pub turn_count: usize,
    pub conversation_summary: Option<String>,
    /// In `[0, 1]`.
    pub estimated_usage_fraction: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub reply: String,
    /// Whether the session was rotated while handling this send.
    pub rotated: bool,
    pub notices: Vec<String>,
    pub usage_fraction: f32,
}

/// Cooperative cancellation for streaming sends.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One conversation and its context budget.
pub struct Conversation {
    service: Arc<dyn CompletionService>,
    config: ContextConfig,
    base_instructions: String,
    session: CompletionSession,
    state: SessionContextState,
    /// Everything shown to the user, including rotation notices.
    history: Vec<ChatMessage>,
    tools: Vec<DelegatedTool>,
    memory: Option<Arc<MemoryStore>>,
    composer: Option<Arc<RagComposer>>,
    scope: Vec<CollectionId>,
}

impl Conversation {
    pub fn new(
        service: Arc<dyn CompletionService>,
        base_instructions: impl Into<String>,
        config: ContextConfig,
    ) -> Self {
        let base_instructions = base_instructions.into();
        let mut conversation = Self {
            service,
            config,
            session: CompletionSession::new(base_instructions.clone()),
            base_instructions,
            state: SessionContextState::default(),
            history: Vec::new(),
            tools: Vec::new(),
            memory: None,
            composer: None,
            scope: Vec::new(),
        };
        conversation.state.estimated_usage_fraction =
            conversation.estimate_usage();
        conversation
    }

    /// Store for facts extracted on rotation.
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Run every user message through `composer` before completion.
    pub fn with_composer(mut self, composer: Arc<RagComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    /// Collections the composer searches; empty means all.
    pub fn set_scope(&mut self, scope: Vec<CollectionId>) {
        self.scope = scope;
    }

    pub fn set_tools(&mut self, tools: Vec<DelegatedTool>) {
        self.tools = tools;
        self.state.estimated_usage_fraction = self.estimate_usage();
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionContextState {
        &self.state
    }

    pub fn session(&self) -> &CompletionSession {
        &self.session
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Turns allowed before a rotation is forced.
    pub fn effective_max_turns(&self) -> usize {
        let penalty = if self.tools.is_empty() {
            0
        } else {
            self.config.tool_turn_penalty
        };
        self.config
            .base_max_turns
            .saturating_sub(penalty)
            .max(self.config.min_max_turns)
    }

    /// Estimated fraction of the context window in use.
    pub fn estimate_usage(&self) -> f32 {
        let instruction_chars = self.base_instructions.chars().count();
        let summary_chars = self
            .state
            .conversation_summary
            .as_deref()
            .map_or(0, |s| s.chars().count());
        let message_chars: usize =
            self.session.transcript.iter().map(ChatMessage::char_len).sum();
        let tool_chars: usize =
            self.tools.iter().map(DelegatedTool::schema_chars).sum();

        let chars = instruction_chars + summary_chars + message_chars + tool_chars;
        let tokens = chars as f32 / self.config.chars_per_token.max(1) as f32;
        let max = self.config.estimated_max_tokens.max(1) as f32;
        (tokens / max).clamp(0.0, 1.0)
    }

    fn should_rotate(&self) -> bool {
        if self.state.turn_count >= self.effective_max_turns() {
            return true;
        }
        self.state.turn_count > 0
            && self
                .config
                .rotate_at_usage
                .is_some_and(|limit| self.state.estimated_usage_fraction >= limit)
    }

    /// Send `message` and wait for the full reply.
    pub async fn send(&mut self, message: &str) -> Result<SendOutcome> {
        let mut notices = Vec::new();
        let mut rotated = false;
        if self.should_rotate() {
            notices.push(self.rotate().await);
            rotated = true;
        }

        let prompt = self.prepare_prompt(message);
        let reply = match self.complete_turn(&prompt).await {
            Err(Error::ContextWindowExceeded) => {
                warn!("context window exceeded, rotating and retrying");
                notices.push(self.rotate().await);
                rotated = true;
                self.complete_turn(&prompt).await?
            }
            other => other?,
        };

        self.record_turn(message, &reply);
        Ok(SendOutcome {
            reply,
            rotated,
            notices,
            usage_fraction: self.state.estimated_usage_fraction,
        })
    }

    /// Send `message` and stream the reply through `on_delta`.
    ///
    /// If `cancel` fires first, the partial reply is kept in the transcript,
    /// the turn still counts, and `Error::Cancelled` carries the partial
    /// text.
    pub async fn send_streaming<F>(
        &mut self,
        message: &str,
        cancel: &CancelFlag,
        mut on_delta: F,
    ) -> Result<SendOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let mut notices = Vec::new();
        let mut rotated = false;
        if self.should_rotate() {
            notices.push(self.rotate().await);
            rotated = true;
        }

        let prompt = self.prepare_prompt(message);
        let mut retried = false;
        let mut rx = match self.stream_turn(&prompt).await {
            Err(Error::ContextWindowExceeded) => {
                warn!("context window exceeded, rotating and retrying");
                notices.push(self.rotate().await);
                rotated = true;
                retried = true;
                self.stream_turn(&prompt).await?
            }
            other => other?,
        };

        let mut reply = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(chars = reply.len(), "streaming send cancelled");
                    self.record_turn(message, &reply);
                    return Err(Error::Cancelled { partial: reply });
                }
                item = rx.recv() => match item {
                    Some(Ok(delta)) => {
                        on_delta(&delta);
                        reply.push_str(&delta);
                    }
                    Some(Err(Error::ContextWindowExceeded))
                        if reply.is_empty() && !retried =>
                    {
                        warn!("context window exceeded, rotating and retrying");
                        notices.push(self.rotate().await);
                        rotated = true;
                        retried = true;
                        rx = self.stream_turn(&prompt).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        self.record_turn(message, &reply);
        Ok(SendOutcome {
            reply,
            rotated,
            notices,
            usage_fraction: self.state.estimated_usage_fraction,
        })
    }

    /// Summarize and rebuild the session now. Returns the notice shown to
    /// the user.
    pub async fn rotate(&mut self) -> String {
        let transcript = &self.session.transcript;
        let start = transcript
            .len()
            .saturating_sub(self.config.summary_message_count);
        let recent = render_messages(&transcript[start..]);
        let turns = self.state.turn_count;

        let summary = if recent.is_empty() {
            self.state.conversation_summary.clone().unwrap_or_default()
        } else {
            self.summarize(&recent).await
        };

        if !recent.is_empty() {
            self.extract_memories(&recent).await;
        }

        self.state.conversation_summary =
            (!summary.is_empty()).then_some(summary);
        self.state.turn_count = 0;
        self.session = CompletionSession::new(self.instructions_with_summary());
        self.state.estimated_usage_fraction = self.estimate_usage();

        info!(
            turns,
            usage = self.state.estimated_usage_fraction,
            "rotated completion session"
        );
        self.history
            .push(ChatMessage::new(Role::System, ROTATION_NOTICE));
        ROTATION_NOTICE.to_string()
    }

    async fn summarize(&self, recent: &str) -> String {
        let mut prompt = String::new();
        if let Some(previous) = &self.state.conversation_summary {
            prompt.push_str("Earlier summary: ");
            prompt.push_str(previous);
            prompt.push_str("\n\n");
        }
        prompt.push_str(recent);

        let options =
            CompletionOptions::deterministic(self.config.summary_max_tokens);
        match self
            .service
            .complete(SUMMARY_INSTRUCTIONS, &prompt, options)
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => {
                summary.trim().to_string()
            }
            Ok(_) => {
                warn!("summarizer returned nothing, using transcript digest");
                char_tail(recent, self.config.digest_chars).to_string()
            }
            Err(e) => {
                warn!(error = %e, "summarization failed, using transcript digest");
                char_tail(recent, self.config.digest_chars).to_string()
            }
        }
    }

    async fn extract_memories(&self, recent: &str) {
        if !self.config.extract_memories {
            return;
        }
        let Some(memory) = &self.memory else {
            return;
        };

        let options =
            CompletionOptions::deterministic(self.config.summary_max_tokens);
        let reply = match self
            .service
            .complete(FACT_EXTRACTION_INSTRUCTIONS, recent, options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "memory extraction failed");
                return;
            }
        };

        let facts = parse_facts(&reply);
        if facts.is_empty() {
            return;
        }

        // Inserts embed and commit; they run on the blocking pool.
        let memory = Arc::clone(memory);
        let stored = tokio::task::spawn_blocking(move || {
            facts
                .iter()
                .filter(|fact| match memory.insert(fact, MEMORY_SOURCE_LABEL) {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(error = %e, "skipping extracted fact");
                        false
                    }
                })
                .count()
        })
        .await;
        match stored {
            Ok(stored) => debug!(stored, "extracted memories"),
            Err(e) => warn!(error = %e, "storing extracted memories failed"),
        }
    }

    fn instructions_with_summary(&self) -> String {
        match &self.state.conversation_summary {
            Some(summary) => format!(
                "{}\n\nSummary of the conversation so far:\n{summary}",
                self.base_instructions
            ),
            None => self.base_instructions.clone(),
        }
    }

    fn prepare_prompt(&self, message: &str) -> String {
        match &self.composer {
            Some(composer) => composer.compose(message, &self.scope).prompt,
            None => message.to_string(),
        }
    }

    fn reply_options(&self) -> CompletionOptions {
        CompletionOptions {
            sampling: Sampling::Default,
            max_tokens: self.config.reply_max_tokens,
        }
    }

    async fn complete_turn(&self, prompt: &str) -> Result<String> {
        let rendered = self.session.render(prompt);
        self.service
            .complete(&self.session.instructions, &rendered, self.reply_options())
            .await
    }

    async fn stream_turn(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let rendered = self.session.render(prompt);
        self.service
            .stream(&self.session.instructions, &rendered, self.reply_options())
            .await
    }

    fn record_turn(&mut self, message: &str, reply: &str) {
        let user = ChatMessage::new(Role::User, message);
        let assistant = ChatMessage::new(Role::Assistant, reply);
        self.session.transcript.push(user.clone());
        self.session.transcript.push(assistant.clone());
        self.history.push(user);
        self.history.push(assistant);
        self.state.turn_count += 1;
        self.state.estimated_usage_fraction = self.estimate_usage();
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("state", &self.state)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}
