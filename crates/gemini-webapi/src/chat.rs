//! Multi-turn chat sessions.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::stream::{Stream, StreamExt};

use crate::client::GeminiClient;
use crate::constants::Model;
use crate::error::{GeminiError, Result};
use crate::generate::{Continuation, GenerateOptions, GenerateStream, continuation_for};
use crate::types::{Candidate, ChatSessionMetadata, ModelOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    /// No completed turn yet; the next request starts a conversation.
    New,
    /// At least one turn completed; requests continue the conversation.
    Active,
}

/// A conversation bound to one client.
///
/// Metadata is replaced wholesale by each completed turn's terminal frame.
/// Failed or cancelled turns leave it untouched.
#[derive(Debug, Clone)]
pub struct ChatSession {
    client: GeminiClient,
    options: GenerateOptions,
    metadata: ChatSessionMetadata,
    last_candidates: Vec<Candidate>,
    candidate_chosen: bool,
    turns: usize,
}

impl ChatSession {
    pub(crate) fn new(client: GeminiClient, model: Model, gem: Option<String>) -> Self {
        Self {
            client,
            options: GenerateOptions {
                model,
                gem,
                files: Vec::new(),
            },
            metadata: ChatSessionMetadata::default(),
            last_candidates: Vec::new(),
            candidate_chosen: false,
            turns: 0,
        }
    }

    /// Continue an existing conversation from saved metadata.
    pub fn resume(mut self, metadata: ChatSessionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn state(&self) -> ChatState {
        if self.turns > 0 || self.metadata.conversation_id.is_some() {
            ChatState::Active
        } else {
            ChatState::New
        }
    }

    pub fn metadata(&self) -> &ChatSessionMetadata {
        &self.metadata
    }

    pub fn model(&self) -> Model {
        self.options.model
    }

    pub fn gem(&self) -> Option<&str> {
        self.options.gem.as_deref()
    }

    /// Candidates of the last completed turn.
    pub fn candidates(&self) -> &[Candidate] {
        &self.last_candidates
    }

    /// Continuation fields the next request will carry.
    ///
    /// A candidate id replaces the turn's response id only after an explicit
    /// [`ChatSession::choose_candidate`].
    pub fn continuation(&self) -> Continuation {
        let chosen = self
            .last_candidates
            .get(self.metadata.chosen_index)
            .filter(|_| self.candidate_chosen)
            .and_then(|c| c.id.as_deref());
        continuation_for(&self.metadata, chosen)
    }

    /// Pick which candidate of the last turn the conversation continues from.
    pub fn choose_candidate(&mut self, index: usize) -> Result<&Candidate> {
        if index >= self.last_candidates.len() {
            return Err(GeminiError::InvalidRequest(format!(
                "candidate index {index} out of range ({} candidates)",
                self.last_candidates.len()
            )));
        }
        self.metadata.chosen_index = index;
        self.candidate_chosen = true;
        Ok(&self.last_candidates[index])
    }

    pub async fn send_message(&mut self, prompt: &str) -> Result<ModelOutput> {
        self.send_message_with_files(prompt, Vec::new()).await
    }

    pub async fn send_message_with_files(
        &mut self,
        prompt: &str,
        files: Vec<std::path::PathBuf>,
    ) -> Result<ModelOutput> {
        let options = GenerateOptions {
            files,
            ..self.options.clone()
        };
        let output = self
            .client
            .start_generate(prompt, &options, &self.continuation())
            .await?
            .collect_output()
            .await?;
        self.absorb(&output);
        Ok(output)
    }

    /// Stream one turn. Metadata is applied only if the stream completes.
    pub async fn send_message_stream(&mut self, prompt: &str) -> Result<ChatStream<'_>> {
        let inner = self
            .client
            .start_generate(prompt, &self.options, &self.continuation())
            .await?;
        Ok(ChatStream {
            session: self,
            inner,
            terminal: None,
        })
    }

    fn absorb(&mut self, terminal: &ModelOutput) {
        self.metadata = terminal.metadata.clone().unwrap_or_default();
        self.last_candidates = terminal.candidates.clone();
        self.candidate_chosen = false;
        self.turns += 1;
        tracing::debug!(turn = self.turns, metadata = %self.metadata, "chat turn completed");
    }
}

/// Output chunks of one streamed chat turn.
pub struct ChatStream<'a> {
    session: &'a mut ChatSession,
    inner: GenerateStream,
    terminal: Option<ModelOutput>,
}

impl ChatStream<'_> {
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Terminal output, once the turn completed.
    pub fn terminal(&self) -> Option<&ModelOutput> {
        self.terminal.as_ref()
    }
}

impl Stream for ChatStream<'_> {
    type Item = Result<ModelOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.inner.is_cancelled() {
            return Poll::Ready(None);
        }
        match ready!(this.inner.poll_next_unpin(cx)) {
            Some(item) => Poll::Ready(Some(item)),
            None => {
                if let Some(terminal) = this.inner.take_terminal() {
                    this.session.absorb(&terminal);
                    this.terminal = Some(terminal);
                }
                Poll::Ready(None)
            }
        }
    }
}
