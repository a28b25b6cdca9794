//! StreamGenerate: request payload, frame-to-output assembly and the
//! cancellable output stream.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::Model;
use crate::delta::DeltaReconciler;
use crate::error::{GeminiError, Result};
use crate::frame::{self, Snapshot};
use crate::session::Session;
use crate::stream::frame_stream;
use crate::types::{ChatSessionMetadata, ModelOutput};
use crate::upload::FileRef;

/// Per-call generation settings.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Model to generate with; sent in the body and the model header.
    pub model: Model,
    /// Gem id to apply as system prompt.
    pub gem: Option<String>,
    /// Local files to upload and attach.
    pub files: Vec<PathBuf>,
}

impl GenerateOptions {
    pub fn model(mut self, model: Model) -> Self {
        self.model = model;
        self
    }

    pub fn gem(mut self, gem: impl Into<String>) -> Self {
        self.gem = Some(gem.into());
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }
}

/// Continuation fields of the `chat` object. Empty on a first turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Serialize)]
struct Parameters<'a> {
    #[serde(rename = "_reqid")]
    reqid: String,
    rt: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bl: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<&'a str>,
}

#[derive(Serialize)]
struct Payload<'a> {
    input: (&'a str, u8, (), Option<&'a [FileRef]>, (), (), u8),
    parameters: Parameters<'a>,
    model: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gem: Option<&'a str>,
    chat: &'a Continuation,
}

/// JSON body of a StreamGenerate request.
pub fn build_payload(
    prompt: &str,
    options: &GenerateOptions,
    files: &[FileRef],
    request_id: u64,
    session: &Session,
    continuation: &Continuation,
) -> Result<String> {
    let payload = Payload {
        input: (
            prompt,
            0,
            (),
            (!files.is_empty()).then_some(files),
            (),
            (),
            0,
        ),
        parameters: Parameters {
            reqid: request_id.to_string(),
            rt: "c",
            bl: session.build_label.as_deref(),
            sid: session.session_id.as_deref(),
        },
        model: options.model.name(),
        gem: options.gem.as_deref(),
        chat: continuation,
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Folds generate frames into output chunks and the terminal output.
#[derive(Debug, Default)]
pub struct OutputAssembler {
    text: DeltaReconciler,
    thoughts: DeltaReconciler,
    last: Option<Snapshot>,
}

impl OutputAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one frame. Returns a chunk when the visible text changed.
    pub fn push_frame(&mut self, frame: &Value) -> Result<Option<ModelOutput>> {
        if let Some(code) = frame::error_code(frame) {
            return Err(GeminiError::from_error_code(code));
        }
        let Some(body) = frame::generate_body(frame) else {
            return Ok(None);
        };
        let snapshot = frame::parse_generate_body(&body);
        let (text, thoughts) = snapshot.primary();
        let text = self.text.reconcile(text, false);
        let thoughts = self.thoughts.reconcile(thoughts, false);
        self.last = Some(snapshot);

        if text.delta.is_empty() && thoughts.delta.is_empty() {
            return Ok(None);
        }
        Ok(Some(ModelOutput {
            text: text.text,
            text_delta: text.delta,
            thoughts: thoughts.text,
            thoughts_delta: thoughts.delta,
            ..Default::default()
        }))
    }

    /// Close the turn: re-read the last snapshot as final, returning any
    /// tail chunk the artifact stripping held back plus the terminal output.
    pub fn finish(mut self) -> Result<(Option<ModelOutput>, ModelOutput)> {
        let snapshot = self
            .last
            .take()
            .ok_or_else(|| GeminiError::api("response carried no candidates"))?;
        let (text, thoughts) = snapshot.primary();
        let text = self.text.reconcile(text, true);
        let thoughts = self.thoughts.reconcile(thoughts, true);

        let tail = (!text.delta.is_empty() || !thoughts.delta.is_empty()).then(|| ModelOutput {
            text: text.text.clone(),
            text_delta: text.delta,
            thoughts: thoughts.text.clone(),
            thoughts_delta: thoughts.delta,
            ..Default::default()
        });
        let images = snapshot
            .candidates
            .first()
            .map(|c| c.images.clone())
            .unwrap_or_default();
        let terminal = ModelOutput {
            text: text.text,
            thoughts: thoughts.text,
            images,
            candidates: snapshot.candidates,
            metadata: Some(snapshot.metadata),
            ..Default::default()
        };
        Ok((tail, terminal))
    }
}

/// Assemble a complete, already-decoded response.
pub fn assemble(frames: &[Value]) -> Result<ModelOutput> {
    let mut assembler = OutputAssembler::new();
    for frame in frames {
        assembler.push_frame(frame)?;
    }
    assembler.finish().map(|(_, terminal)| terminal)
}

#[derive(Debug)]
enum Event {
    Chunk(ModelOutput),
    Finished(ModelOutput),
    Failed(GeminiError),
}

/// Pull-based stream of output chunks for one generate call.
///
/// Each item carries the snapshot text plus the delta since the previous
/// item. The terminal output (candidates, images, continuation metadata) is
/// available from [`GenerateStream::terminal`] once the stream has ended
/// cleanly. Dropping or cancelling the stream tears down the transfer.
#[derive(Debug)]
pub struct GenerateStream {
    rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    terminal: Option<ModelOutput>,
    done: bool,
}

impl GenerateStream {
    /// Start decoding `bytes` on a background task.
    pub fn spawn<S>(bytes: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump(bytes, tx, cancel.clone()));
        Self {
            rx,
            cancel,
            terminal: None,
            done: false,
        }
    }

    /// Abort the transfer. Chunks already yielded stay valid; nothing
    /// further is yielded and no terminal output is recorded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Terminal output, once the stream completed without error.
    pub fn terminal(&self) -> Option<&ModelOutput> {
        self.terminal.as_ref()
    }

    pub fn take_terminal(&mut self) -> Option<ModelOutput> {
        self.terminal.take()
    }

    /// Drain the stream and return the terminal output.
    pub async fn collect_output(mut self) -> Result<ModelOutput> {
        while let Some(item) = self.next().await {
            item?;
        }
        self.terminal.take().ok_or_else(|| {
            if self.cancel.is_cancelled() {
                GeminiError::api("generation cancelled before completion")
            } else {
                GeminiError::api("stream ended without a terminal frame")
            }
        })
    }
}

impl Stream for GenerateStream {
    type Item = Result<ModelOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            self.done = true;
            self.terminal = None;
        }
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Event::Chunk(chunk))) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(Some(Event::Finished(terminal))) => self.terminal = Some(terminal),
                Poll::Ready(Some(Event::Failed(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => self.done = true,
            }
        }
    }
}

impl Drop for GenerateStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send(tx: &mpsc::Sender<Event>, cancel: &CancellationToken, event: Event) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

async fn pump<S>(bytes: S, tx: mpsc::Sender<Event>, cancel: CancellationToken)
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let mut frames = std::pin::pin!(frame_stream(bytes));
    let mut assembler = OutputAssembler::new();
    let mut seen = 0usize;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(frames = seen, "generate stream cancelled");
                return;
            }
            next = frames.next() => next,
        };
        let event = match next {
            Some(Ok(frame)) => {
                seen += 1;
                match assembler.push_frame(&frame) {
                    Ok(Some(chunk)) => Event::Chunk(chunk),
                    Ok(None) => continue,
                    Err(e) => Event::Failed(e),
                }
            }
            Some(Err(e)) => Event::Failed(e),
            None => break,
        };
        let failed = matches!(event, Event::Failed(_));
        if !send(&tx, &cancel, event).await || failed {
            return;
        }
    }

    tracing::debug!(frames = seen, "generate stream finished");
    match assembler.finish() {
        Ok((tail, terminal)) => {
            if let Some(tail) = tail {
                if !send(&tx, &cancel, Event::Chunk(tail)).await {
                    return;
                }
            }
            send(&tx, &cancel, Event::Finished(terminal)).await;
        }
        Err(e) => {
            send(&tx, &cancel, Event::Failed(e)).await;
        }
    }
}

/// Continuation seeded from session metadata and the chosen candidate.
pub fn continuation_for(
    metadata: &ChatSessionMetadata,
    chosen_response_id: Option<&str>,
) -> Continuation {
    Continuation {
        conversation_id: metadata.conversation_id.clone(),
        response_id: chosen_response_id
            .map(str::to_string)
            .or_else(|| metadata.response_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::fixtures::{generate_inner, outer};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn body_of(frames: &[Value]) -> Vec<Result<Bytes>> {
        let mut body = String::from(")]}'\n");
        for frame in frames {
            let text = frame.to_string();
            body.push_str(&format!("{}\n{}\n", text.len(), text));
        }
        vec![Ok(Bytes::from(body))]
    }

    #[test]
    fn payload_first_turn_omits_continuation() {
        let session = Session::default();
        let json = build_payload(
            "hi",
            &GenerateOptions::default(),
            &[],
            100_001,
            &session,
            &Continuation::default(),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!({
                "input": ["hi", 0, null, null, null, null, 0],
                "parameters": {"_reqid": "100001", "rt": "c"},
                "model": "unspecified",
                "chat": {}
            })
        );
    }

    #[test]
    fn payload_carries_session_gem_files_and_continuation() {
        let session = Session {
            session_id: Some("sid".to_string()),
            build_label: Some("bl".to_string()),
            access_token: None,
        };
        let files = [FileRef {
            upload_id: "u1".to_string(),
            file_name: "a.txt".to_string(),
        }];
        let options = GenerateOptions::default().model(Model::Pro).gem("g1");
        let continuation = Continuation {
            conversation_id: Some("c_1".to_string()),
            response_id: Some("r_1".to_string()),
        };
        let json = build_payload("q", &options, &files, 7, &session, &continuation).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["input"][3], json!([[["u1"], "a.txt"]]));
        assert_eq!(value["parameters"], json!({"_reqid": "7", "rt": "c", "bl": "bl", "sid": "sid"}));
        assert_eq!(value["model"], json!("gemini-3.0-pro"));
        assert_eq!(value["gem"], json!("g1"));
        assert_eq!(value["chat"], json!({"conversationId": "c_1", "responseId": "r_1"}));
    }

    #[test]
    fn assembler_emits_deltas_and_terminal_metadata() {
        let mut assembler = OutputAssembler::new();
        let first = assembler
            .push_frame(&outer(&generate_inner("c_1", "r_early", "rc_1", "Hello")))
            .unwrap()
            .unwrap();
        assert_eq!(first.text_delta, "Hello");
        let second = assembler
            .push_frame(&outer(&generate_inner("c_1", "r_final", "rc_1", "Hello world")))
            .unwrap()
            .unwrap();
        assert_eq!(second.text_delta, " world");
        assert_eq!(second.metadata, None);

        let (tail, terminal) = assembler.finish().unwrap();
        assert_eq!(tail, None);
        assert_eq!(terminal.text, "Hello world");
        assert_eq!(
            terminal.metadata,
            Some(ChatSessionMetadata {
                conversation_id: Some("c_1".to_string()),
                response_id: Some("r_final".to_string()),
                chosen_index: 0,
            })
        );
        assert_eq!(terminal.candidates[0].id.as_deref(), Some("rc_1"));
    }

    #[test]
    fn held_back_artifact_is_released_at_end() {
        let frames = [outer(&generate_inner("c", "r", "rc", "price is 5\\*"))];
        let mut assembler = OutputAssembler::new();
        let chunk = assembler.push_frame(&frames[0]).unwrap().unwrap();
        assert_eq!(chunk.text, "price is 5");
        let (tail, terminal) = assembler.finish().unwrap();
        assert_eq!(tail.unwrap().text_delta, "\\*");
        assert_eq!(terminal.text, "price is 5\\*");
    }

    #[test]
    fn error_code_frame_fails() {
        let frame = json!([[null, null, null, null, null, [null, null, [[null, [1037]]]]]]);
        let err = OutputAssembler::new().push_frame(&frame).unwrap_err();
        assert!(matches!(err, GeminiError::UsageLimitExceeded(_)));
    }

    #[test]
    fn no_candidates_is_api_error() {
        assert!(matches!(assemble(&[]), Err(GeminiError::Api { .. })));
    }

    #[tokio::test]
    async fn stream_yields_chunks_then_terminal() {
        let frames = [
            outer(&generate_inner("c_1", "r_1", "rc_1", "Hello")),
            outer(&generate_inner("c_1", "r_1", "rc_1", "Hello")),
            outer(&generate_inner("c_1", "r_2", "rc_1", "Hello world")),
        ];
        let mut stream = GenerateStream::spawn(
            futures::stream::iter(body_of(&frames)),
            CancellationToken::new(),
        );
        let mut deltas = Vec::new();
        while let Some(chunk) = stream.next().await {
            deltas.push(chunk.unwrap().text_delta);
        }
        assert_eq!(deltas, vec!["Hello".to_string(), " world".to_string()]);
        let terminal = stream.terminal().unwrap();
        assert_eq!(
            terminal.metadata.as_ref().and_then(|m| m.response_id.as_deref()),
            Some("r_2")
        );
    }

    #[tokio::test]
    async fn cancelled_stream_ends_without_terminal() {
        let cancel = CancellationToken::new();
        let pending = futures::stream::pending::<Result<Bytes>>();
        let mut stream = GenerateStream::spawn(pending, cancel.clone());
        cancel.cancel();
        assert!(stream.next().await.is_none());
        assert!(stream.terminal().is_none());
        assert!(stream.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_mid_stream_drops_buffered_chunks() {
        let frames = [
            outer(&generate_inner("c", "r", "rc", "a")),
            outer(&generate_inner("c", "r", "rc", "ab")),
            outer(&generate_inner("c", "r", "rc", "abc")),
            outer(&generate_inner("c", "r", "rc", "abcd")),
        ];
        let body = futures::stream::iter(body_of(&frames)).chain(futures::stream::pending());
        let mut stream = GenerateStream::spawn(body, CancellationToken::new());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text_delta, "a");
        // Let the pump park the next chunk in the channel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stream.cancel();

        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        assert!(stream.terminal().is_none());
        assert_eq!(first.text, "a");
    }

    #[tokio::test]
    async fn collect_output_returns_terminal() {
        let frames = [outer(&generate_inner("c", "r", "rc", "done"))];
        let stream = GenerateStream::spawn(
            futures::stream::iter(body_of(&frames)),
            CancellationToken::new(),
        );
        let output = stream.collect_output().await.unwrap();
        assert_eq!(output.text, "done");
        assert_eq!(output.candidates.len(), 1);
    }

    #[test]
    fn continuation_prefers_chosen_candidate() {
        let metadata = ChatSessionMetadata {
            conversation_id: Some("c".to_string()),
            response_id: Some("r".to_string()),
            chosen_index: 1,
        };
        assert_eq!(
            continuation_for(&metadata, Some("rc_2")).response_id.as_deref(),
            Some("rc_2")
        );
        assert_eq!(continuation_for(&metadata, None).response_id.as_deref(), Some("r"));
        assert_eq!(continuation_for(&ChatSessionMetadata::default(), None), Continuation::default());
    }
}
