//! Gem registry RPCs: payloads and response parsing.

use serde_json::{Value, json};

use crate::constants::RpcId;
use crate::error::{GeminiError, Result};
use crate::frame;
use crate::rpc::{RpcCall, RpcResponse};
use crate::types::{Gem, GemJar};

pub const SYSTEM_IDENTIFIER: &str = "system";
pub const CUSTOM_IDENTIFIER: &str = "custom";

/// The two list calls: predefined gems (hidden ones too when asked) and
/// the account's own gems.
pub fn list_calls(include_hidden: bool, language: &str) -> [RpcCall; 2] {
    let system_kind = if include_hidden { 4 } else { 3 };
    [
        RpcCall::from_json(RpcId::LIST_GEMS, &json!([system_kind, [language], 0]))
            .with_identifier(SYSTEM_IDENTIFIER),
        RpcCall::from_json(RpcId::LIST_GEMS, &json!([2, [language], 0]))
            .with_identifier(CUSTOM_IDENTIFIER),
    ]
}

/// Build the registry from the list replies. Replies without a body are
/// treated as empty lists.
pub fn parse_list(responses: &[RpcResponse]) -> Result<GemJar> {
    let mut gems = Vec::new();
    for response in responses.iter().filter(|r| r.rpc_id == RpcId::LIST_GEMS) {
        let predefined = match response.identifier.as_deref() {
            Some(SYSTEM_IDENTIFIER) => true,
            Some(CUSTOM_IDENTIFIER) => false,
            _ => continue,
        };
        if let Some(body) = response.json()? {
            gems.extend(frame::parse_gem_list(&body, predefined));
        }
    }
    Ok(GemJar::new(gems))
}

fn gem_fields(name: &str, description: &str, prompt: &str) -> Vec<Value> {
    vec![
        json!(name),
        json!(description),
        json!(prompt),
        Value::Null,
        Value::Null,
        Value::Null,
        Value::Null,
        Value::Null,
        json!(0),
        Value::Null,
        json!(1),
        Value::Null,
        Value::Null,
        Value::Null,
        json!([]),
    ]
}

pub fn create_call(name: &str, prompt: &str, description: &str) -> RpcCall {
    let fields = gem_fields(name, description, prompt);
    RpcCall::from_json(RpcId::CREATE_GEM, &json!([fields]))
}

/// The server-assigned id of a newly created gem.
pub fn parse_created(responses: &[RpcResponse]) -> Result<String> {
    responses
        .iter()
        .find(|r| r.rpc_id == RpcId::CREATE_GEM)
        .map(RpcResponse::json)
        .transpose()?
        .flatten()
        .as_ref()
        .and_then(frame::created_gem_id)
        .ok_or_else(|| GeminiError::api("create gem reply carries no gem id"))
}

pub fn update_call(id: &str, name: &str, prompt: &str, description: &str) -> RpcCall {
    let mut fields = gem_fields(name, description, prompt);
    fields.push(json!(0));
    RpcCall::from_json(RpcId::UPDATE_GEM, &json!([id, fields]))
}

pub fn delete_call(id: &str) -> RpcCall {
    RpcCall::from_json(RpcId::DELETE_GEM, &json!([id]))
}

/// A custom gem as the registry records it after create or update.
pub fn custom_gem(id: String, name: &str, prompt: &str, description: &str) -> Gem {
    Gem {
        id,
        name: name.to_string(),
        prompt: prompt.to_string(),
        description: description.to_string(),
        predefined: false,
    }
}
