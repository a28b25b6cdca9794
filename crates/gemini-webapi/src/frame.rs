//! Positional schema of the upstream frames.
//!
//! The service addresses every field by array position. All index paths live
//! here so a layout change upstream is fixed in one place.

use serde_json::Value;

use crate::types::{Candidate, ChatSessionMetadata, Gem, Image};

/// Index paths, schema revision 1.
pub mod paths {
    /// Error code inside an outer frame.
    pub const ERROR_CODE: &[usize] = &[0, 5, 2, 0, 1, 0];

    /// Envelope part: `["wrb.fr", rpcId, "<inner json>", null, null, null, identifier]`.
    pub const PART_RPC_ID: &[usize] = &[1];
    pub const PART_BODY: &[usize] = &[2];
    pub const PART_IDENTIFIER: &[usize] = &[6];

    pub const CONVERSATION_ID: &[usize] = &[1, 0];
    pub const RESPONSE_ID: &[usize] = &[1, 1];
    pub const CANDIDATES: &[usize] = &[4];

    pub const CANDIDATE_ID: &[usize] = &[0];
    pub const CANDIDATE_TEXT: &[usize] = &[1, 0];
    pub const CANDIDATE_THOUGHTS: &[usize] = &[37, 0, 0];
    pub const CANDIDATE_FINISH_REASON: &[usize] = &[8, 0];
    pub const CANDIDATE_WEB_IMAGES: &[usize] = &[12, 1];
    pub const CANDIDATE_GENERATED_IMAGES: &[usize] = &[12, 7, 0];

    pub const WEB_IMAGE_URL: &[usize] = &[0, 0, 0];
    pub const WEB_IMAGE_TITLE: &[usize] = &[7, 0];
    pub const WEB_IMAGE_ALT: &[usize] = &[0, 4];

    pub const GENERATED_IMAGE_DATA: &[usize] = &[0, 3, 3];
    pub const GENERATED_IMAGE_SEED: &[usize] = &[3, 6];
    pub const GENERATED_IMAGE_ALT: &[usize] = &[3, 5, 0];

    pub const GEM_LIST: &[usize] = &[2];
    pub const GEM_ID: &[usize] = &[0];
    pub const GEM_NAME: &[usize] = &[1, 0];
    pub const GEM_DESCRIPTION: &[usize] = &[1, 1];
    pub const GEM_PROMPT: &[usize] = &[2, 0];

    pub const CREATED_GEM_ID: &[usize] = &[0];
}

/// Marker in the first slot of an RPC envelope part.
pub const ENVELOPE_MARKER: &str = "wrb.fr";

pub fn get<'a>(value: &'a Value, path: &[usize]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, &index| current.as_array()?.get(index))
}

pub fn get_str<'a>(value: &'a Value, path: &[usize]) -> Option<&'a str> {
    get(value, path)?.as_str()
}

pub fn get_i64(value: &Value, path: &[usize]) -> Option<i64> {
    get(value, path)?.as_i64()
}

fn get_string(value: &Value, path: &[usize]) -> Option<String> {
    get_str(value, path).map(str::to_string)
}

/// Strings or numbers rendered as text; anything else is absent.
fn get_scalar(value: &Value, path: &[usize]) -> Option<String> {
    match get(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Upstream error code carried by an outer frame.
pub fn error_code(frame: &Value) -> Option<i64> {
    get_i64(frame, paths::ERROR_CODE)
}

/// One RPC envelope part of an outer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopePart {
    pub rpc_id: Option<String>,
    pub body: Option<String>,
    pub identifier: Option<String>,
}

/// Envelope parts of an outer frame, in order. Non-envelope parts are ignored.
pub fn envelope_parts(frame: &Value) -> Vec<EnvelopePart> {
    let Some(parts) = frame.as_array() else {
        return Vec::new();
    };
    parts
        .iter()
        .filter(|part| get_str(part, &[0]) == Some(ENVELOPE_MARKER))
        .map(|part| EnvelopePart {
            rpc_id: get_string(part, paths::PART_RPC_ID),
            body: get_string(part, paths::PART_BODY),
            identifier: get_string(part, paths::PART_IDENTIFIER),
        })
        .collect()
}

/// Decoded inner body of the first envelope part that carries candidates.
pub fn generate_body(frame: &Value) -> Option<Value> {
    frame.as_array()?.iter().find_map(|part| {
        let body: Value = serde_json::from_str(get_str(part, paths::PART_BODY)?).ok()?;
        let has_candidates = get(&body, paths::CANDIDATES)
            .and_then(Value::as_array)
            .is_some_and(|c| !c.is_empty());
        has_candidates.then_some(body)
    })
}

/// Whole-text state of one generate frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: ChatSessionMetadata,
    pub candidates: Vec<Candidate>,
}

impl Snapshot {
    /// Text and thoughts of the first candidate, which drive the deltas.
    pub fn primary(&self) -> (&str, &str) {
        match self.candidates.first() {
            Some(c) => (c.content.as_str(), c.thoughts.as_deref().unwrap_or_default()),
            None => ("", ""),
        }
    }
}

pub fn parse_generate_body(body: &Value) -> Snapshot {
    let candidates = get(body, paths::CANDIDATES)
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .enumerate()
                .map(|(index, c)| parse_candidate(c, index))
                .collect()
        })
        .unwrap_or_default();
    Snapshot {
        metadata: ChatSessionMetadata {
            conversation_id: get_string(body, paths::CONVERSATION_ID),
            response_id: get_string(body, paths::RESPONSE_ID),
            chosen_index: 0,
        },
        candidates,
    }
}

fn parse_candidate(value: &Value, index: usize) -> Candidate {
    let mut images: Vec<Image> = get(value, paths::CANDIDATE_WEB_IMAGES)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(parse_web_image).collect())
        .unwrap_or_default();
    if let Some(list) = get(value, paths::CANDIDATE_GENERATED_IMAGES).and_then(Value::as_array) {
        images.extend(list.iter().filter_map(parse_generated_image));
    }
    Candidate {
        id: get_string(value, paths::CANDIDATE_ID),
        content: get_string(value, paths::CANDIDATE_TEXT).unwrap_or_default(),
        thoughts: get_string(value, paths::CANDIDATE_THOUGHTS),
        index,
        finish_reason: get_scalar(value, paths::CANDIDATE_FINISH_REASON),
        images,
    }
}

fn parse_web_image(value: &Value) -> Option<Image> {
    Some(Image::Web {
        url: get_string(value, paths::WEB_IMAGE_URL)?,
        title: get_string(value, paths::WEB_IMAGE_TITLE).unwrap_or_default(),
        alt: get_string(value, paths::WEB_IMAGE_ALT).unwrap_or_default(),
    })
}

fn parse_generated_image(value: &Value) -> Option<Image> {
    let seed = get_scalar(value, paths::GENERATED_IMAGE_SEED).unwrap_or_default();
    Some(Image::Generated {
        data: get_string(value, paths::GENERATED_IMAGE_DATA)?,
        title: format!("[Generated Image {seed}]"),
        alt: get_string(value, paths::GENERATED_IMAGE_ALT).unwrap_or_default(),
    })
}

/// Gems listed in a list-gems body.
pub fn parse_gem_list(body: &Value, predefined: bool) -> Vec<Gem> {
    get(body, paths::GEM_LIST)
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    Some(Gem {
                        id: get_string(entry, paths::GEM_ID)?,
                        name: get_string(entry, paths::GEM_NAME).unwrap_or_default(),
                        description: get_string(entry, paths::GEM_DESCRIPTION)
                            .unwrap_or_default(),
                        prompt: get_string(entry, paths::GEM_PROMPT).unwrap_or_default(),
                        predefined,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn created_gem_id(body: &Value) -> Option<String> {
    get_string(body, paths::CREATED_GEM_ID)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn get_walks_index_paths() {
        let value = json!([[1, ["a", "b"]], "x"]);
        assert_eq!(get_str(&value, &[0, 1, 1]), Some("b"));
        assert_eq!(get_i64(&value, &[0, 0]), Some(1));
        assert_eq!(get(&value, &[0, 5]), None);
        assert_eq!(get(&value, &[1, 0]), None);
        assert_eq!(get(&value, &[]), Some(&value));
    }

    #[test]
    fn error_code_at_fixed_path() {
        let frame = json!([[null, null, null, null, null, [null, null, [[null, [1037]]]]]]);
        assert_eq!(error_code(&frame), Some(1037));
        assert_eq!(error_code(&json!([["wrb.fr"]])), None);
    }

    #[test]
    fn envelope_parts_skip_foreign_entries() {
        let frame = json!([
            ["wrb.fr", "CNgdBe", "[1]", null, null, null, "system"],
            ["di", 42],
            ["af.httprm", 10, "-1", 5]
        ]);
        assert_eq!(
            envelope_parts(&frame),
            vec![EnvelopePart {
                rpc_id: Some("CNgdBe".to_string()),
                body: Some("[1]".to_string()),
                identifier: Some("system".to_string()),
            }]
        );
    }

    #[test]
    fn generate_body_needs_candidates() {
        let with = outer(&generate_inner("c_1", "r_1", "rc_1", "Hello"));
        assert!(generate_body(&with).is_some());
        let without = outer(&json!([null, ["c_1", "r_1"]]));
        assert!(generate_body(&without).is_none());
    }

    #[test]
    fn parses_candidates_and_metadata() {
        let mut candidate = vec![json!("rc_1"), json!(["Hello **world**"])];
        candidate.resize(38, Value::Null);
        candidate[8] = json!([1]);
        candidate[12] = json!([
            null,
            [[[["https://img.test/cat.png"], null, null, null, "a cat"], null, null, null, null, null, null, ["Cat"]]],
            null,
            null,
            null,
            null,
            null,
            [[[
                [null, null, null, [null, null, null, "aGk="]],
                null,
                null,
                [null, null, null, null, null, ["generated alt"], 77]
            ]]]
        ]);
        candidate[37] = json!([["thinking..."]]);
        let body = json!([null, ["c_9", "r_9"], null, null, [candidate]]);

        let snapshot = parse_generate_body(&body);
        assert_eq!(snapshot.metadata.conversation_id.as_deref(), Some("c_9"));
        assert_eq!(snapshot.metadata.response_id.as_deref(), Some("r_9"));
        let c = &snapshot.candidates[0];
        assert_eq!(c.id.as_deref(), Some("rc_1"));
        assert_eq!(c.content, "Hello **world**");
        assert_eq!(c.thoughts.as_deref(), Some("thinking..."));
        assert_eq!(c.finish_reason.as_deref(), Some("1"));
        assert_eq!(
            c.images,
            vec![
                Image::Web {
                    url: "https://img.test/cat.png".to_string(),
                    title: "Cat".to_string(),
                    alt: "a cat".to_string(),
                },
                Image::Generated {
                    data: "aGk=".to_string(),
                    title: "[Generated Image 77]".to_string(),
                    alt: "generated alt".to_string(),
                },
            ]
        );
        assert_eq!(snapshot.primary(), ("Hello **world**", "thinking..."));
    }

    #[test]
    fn parses_gem_list_and_created_id() {
        let body = json!([
            null,
            null,
            [
                ["g1", ["Writer", "Helps write"], ["Be concise"]],
                ["g2", ["Coder"]],
                [null, ["broken"]]
            ]
        ]);
        let gems = parse_gem_list(&body, false);
        assert_eq!(gems.len(), 2);
        assert_eq!(gems[0].description, "Helps write");
        assert_eq!(gems[0].prompt, "Be concise");
        assert_eq!(gems[1].name, "Coder");
        assert!(!gems[1].predefined);
        assert_eq!(created_gem_id(&json!(["new-id"])), Some("new-id".to_string()));
    }
}
