//! Batched RPC envelope (`batchexecute`).

use serde_json::{Value, json};

use crate::constants::BATCH_REQUEST_TYPE;
use crate::error::{GeminiError, Result};
use crate::frame;
use crate::stream::FrameDecoder;

/// Leading token the service prepends to JSON responses.
pub const ANTI_XSSI_PREFIX: &str = ")]}'";

/// One RPC inside a batch. The payload is already JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    /// RPC name, e.g. `CNgdBe`.
    pub rpc_id: String,
    pub payload: String,
    /// Local tag used to tell apart several calls to the same RPC.
    pub identifier: Option<String>,
}

impl RpcCall {
    pub fn new(rpc_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            payload: payload.into(),
            identifier: None,
        }
    }

    pub fn from_json(rpc_id: impl Into<String>, payload: &Value) -> Self {
        Self::new(rpc_id, payload.to_string())
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    fn tuple(&self) -> Value {
        json!([self.rpc_id, self.payload, null, BATCH_REQUEST_TYPE])
    }
}

/// Form body for a batch: every call under a single `f.req`.
pub fn encode_batch(calls: &[RpcCall], token: &str) -> String {
    let tuples = Value::Array(calls.iter().map(RpcCall::tuple).collect());
    format!(
        "f.req={}&at={}",
        urlencoding::encode(&tuples.to_string()),
        urlencoding::encode(token)
    )
}

/// Remove the anti-XSSI prefix line; a body without it is malformed.
pub fn strip_anti_xssi(body: &str) -> Result<&str> {
    body.trim_start()
        .strip_prefix(ANTI_XSSI_PREFIX)
        .ok_or_else(|| GeminiError::api("response is missing the anti-XSSI prefix"))
}

/// Decoded reply to one call of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub rpc_id: String,
    /// Identifier echoed by the service, or paired from the request order.
    pub identifier: Option<String>,
    /// Inner JSON text; absent when the service returned nothing for the call.
    pub body: Option<String>,
}

impl RpcResponse {
    pub fn json(&self) -> Result<Option<Value>> {
        self.body
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(GeminiError::from)
    }
}

/// Parse a batch response body into per-call replies.
pub fn decode_batch(body: &str) -> Result<Vec<RpcResponse>> {
    let frames = FrameDecoder::decode_all(strip_anti_xssi(body)?);
    let mut responses = Vec::new();
    for frame in &frames {
        if let Some(code) = frame::error_code(frame) {
            return Err(GeminiError::from_error_code(code));
        }
        responses.extend(frame::envelope_parts(frame).into_iter().filter_map(|part| {
            Some(RpcResponse {
                rpc_id: part.rpc_id?,
                identifier: part.identifier,
                body: part.body,
            })
        }));
    }
    tracing::debug!(frames = frames.len(), responses = responses.len(), "batch decoded");
    Ok(responses)
}

/// Fill in identifiers the service did not echo, matching calls of the
/// same RPC in request order.
pub fn pair_identifiers(calls: &[RpcCall], responses: &mut [RpcResponse]) {
    let mut used = vec![false; calls.len()];
    for response in responses.iter_mut() {
        let matched = calls.iter().enumerate().position(|(i, call)| {
            !used[i]
                && call.rpc_id == response.rpc_id
                && (response.identifier.is_none() || call.identifier == response.identifier)
        });
        if let Some(i) = matched {
            used[i] = true;
            if response.identifier.is_none() {
                response.identifier = calls[i].identifier.clone();
            }
        }
    }
}
