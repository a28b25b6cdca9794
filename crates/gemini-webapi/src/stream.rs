//! Incremental decoder for the length-prefixed frame grammar.
//!
//! A body is a sequence of line pairs: a decimal length line followed by a
//! line holding one JSON array. Malformed pairs are skipped; they never end
//! the sequence.

use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length,
    Payload,
}

/// Push-based frame decoder. Feed bytes as they arrive and pull frames out.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    skipped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::Length,
            skipped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Lines dropped as malformed so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Next complete frame in the buffer, if any.
    pub fn next_frame(&mut self) -> Option<Value> {
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            if let Some(frame) = self.process_line(&line[..newline]) {
                return Some(frame);
            }
        }
        None
    }

    /// Drain a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Value> {
        if let Some(frame) = self.next_frame() {
            return Some(frame);
        }
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        self.process_line(&rest)
    }

    /// Decode a complete body.
    pub fn decode_all(body: &str) -> Vec<Value> {
        let mut decoder = Self::new();
        decoder.push(body.as_bytes());
        let mut frames = Vec::new();
        while let Some(frame) = decoder.finish() {
            frames.push(frame);
        }
        if decoder.skipped > 0 {
            tracing::debug!(skipped = decoder.skipped, "malformed frame lines skipped");
        }
        frames
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<Value> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if self.state == State::Payload {
            self.state = State::Length;
            match serde_json::from_str::<Value>(line) {
                Ok(value @ Value::Array(_)) => return Some(value),
                // Not a payload: maybe the next pair's length line.
                _ => self.skipped += 1,
            }
        }
        if line.parse::<usize>().is_ok() {
            self.state = State::Payload;
        } else {
            self.skipped += 1;
        }
        None
    }
}

/// Frames decoded from a byte stream as it arrives.
///
/// A transport error is yielded once and ends the sequence.
pub fn frame_stream<S>(bytes: S) -> impl Stream<Item = Result<Value>> + Send
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    futures::stream::unfold(
        (bytes.boxed(), FrameDecoder::new(), false),
        |(mut bytes, mut decoder, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(frame) = decoder.next_frame() {
                    return Some((Ok(frame), (bytes, decoder, false)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => return Some((Err(e), (bytes, decoder, true))),
                    None => {
                        return decoder
                            .finish()
                            .map(|frame| (Ok(frame), (bytes, decoder, true)));
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeminiError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_well_formed_pairs() {
        let body = ")]}'\n\n10\n[[\"a\",1]]\n7\n[[\"b\"]]\n";
        assert_eq!(
            FrameDecoder::decode_all(body),
            vec![json!([["a", 1]]), json!([["b"]])]
        );
    }

    #[test]
    fn malformed_pairs_are_skipped_in_order() {
        let body = concat!(
            "5\n[[1]]\n",
            "abc\n[[\"orphan\"]]\n",
            "9\n{not json\n",
            "5\n[[2]]\n",
            "4\n\"str\"\n",
            "5\n[[3]]"
        );
        let frames = FrameDecoder::decode_all(body);
        assert_eq!(frames, vec![json!([[1]]), json!([[2]]), json!([[3]])]);
    }

    #[test]
    fn payload_that_is_a_length_starts_the_next_pair() {
        let frames = FrameDecoder::decode_all("12\n5\n[[1]]\n");
        assert_eq!(frames, vec![json!([[1]])]);
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"6\n[[\"he");
        assert_eq!(decoder.next_frame(), None);
        decoder.push(b"y\"]]\n");
        assert_eq!(decoder.next_frame(), Some(json!([["hey"]])));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn frame_stream_is_incremental() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b")]}'\n5\n[[")),
            Ok(Bytes::from_static(b"1]]\n5\n[[2]]")),
        ];
        let frames: Vec<Value> = frame_stream(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec![json!([[1]]), json!([[2]])]);
    }

    #[tokio::test]
    async fn transport_error_ends_the_stream() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"5\n[[1]]\n")),
            Err(GeminiError::api("connection reset")),
            Ok(Bytes::from_static(b"5\n[[2]]\n")),
        ];
        let items: Vec<Result<Value>> = frame_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!([[1]]));
        assert!(items[1].is_err());
    }
}
