//! Value types returned by the client.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GeminiError, Result};

static FILE_NAME_WITH_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^/\\]*\.\w+").expect("file name regex is valid"));

/// Continuation identifiers threading a conversation across turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSessionMetadata {
    /// Conversation id (`c_...`).
    pub conversation_id: Option<String>,
    /// Id of the last response (`r_...`).
    pub response_id: Option<String>,
    /// Candidate of the last turn the conversation continues from.
    pub chosen_index: usize,
}

impl fmt::Display for ChatSessionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CID: {}", self.conversation_id.as_deref().unwrap_or_default())
    }
}

/// One alternative completion within a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Server id of this candidate; seeds the next turn when chosen.
    pub id: Option<String>,
    /// Reply text.
    pub content: String,
    /// Reasoning text, for models that expose it.
    pub thoughts: Option<String>,
    /// Position within the turn's candidate list.
    pub index: usize,
    /// Finish reason string, when the frame carries one.
    pub finish_reason: Option<String>,
    /// Web and generated images attached to this candidate.
    #[serde(default)]
    pub images: Vec<Image>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Output of a generate call.
///
/// Streaming yields one of these per visible change with only the deltas
/// populated alongside the snapshot text; the terminal value of a stream (and
/// the result of a non-streaming call) also carries candidates, images and
/// continuation metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Cleaned snapshot text of the primary candidate.
    pub text: String,
    /// Text added since the previous chunk.
    pub text_delta: String,
    /// Cleaned snapshot of the reasoning text.
    pub thoughts: String,
    /// Reasoning text added since the previous chunk.
    pub thoughts_delta: String,
    /// Images of the primary candidate.
    pub images: Vec<Image>,
    /// All candidates of the turn; empty on intermediate chunks.
    pub candidates: Vec<Candidate>,
    /// Continuation identifiers; set on terminal output.
    pub metadata: Option<ChatSessionMetadata>,
}

impl ModelOutput {
    /// Candidate selected by the metadata's `chosen_index`, if present.
    pub fn chosen(&self) -> Option<&Candidate> {
        let index = self.metadata.as_ref().map_or(0, |m| m.chosen_index);
        self.candidates.get(index)
    }
}

impl fmt::Display for ModelOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// An image attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Image {
    /// Hosted on the web; saving downloads it.
    Web {
        url: String,
        title: String,
        alt: String,
    },
    /// Produced by the model and delivered inline as base64.
    Generated {
        data: String,
        title: String,
        alt: String,
    },
}

impl Image {
    pub fn title(&self) -> &str {
        match self {
            Image::Web { title, .. } | Image::Generated { title, .. } => title,
        }
    }

    pub fn alt(&self) -> &str {
        match self {
            Image::Web { alt, .. } | Image::Generated { alt, .. } => alt,
        }
    }

    /// Write the image into `dir`.
    ///
    /// Without `filename`, web images use the last path segment of their URL
    /// and generated images a timestamp. Returns `Ok(None)` when no usable
    /// file name can be derived and `skip_invalid_filename` is set.
    pub async fn save(
        &self,
        http: &reqwest::Client,
        dir: impl AsRef<Path>,
        filename: Option<&str>,
        skip_invalid_filename: bool,
    ) -> Result<Option<PathBuf>> {
        let candidate = match (filename, self) {
            (Some(name), _) => name.to_string(),
            (None, Image::Web { url, .. }) => url_file_name(url),
            (None, Image::Generated { .. }) => {
                format!("{}.png", chrono::Local::now().format("%Y%m%d%H%M%S%3f"))
            }
        };
        let name = match valid_file_name(&candidate) {
            Some(name) => name,
            None if skip_invalid_filename => {
                tracing::warn!(filename = %candidate, "skipping image with invalid filename");
                return Ok(None);
            }
            None => candidate,
        };

        let bytes = match self {
            Image::Web { url, .. } => {
                let response = http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| GeminiError::http("image download", e))?;
                response
                    .bytes()
                    .await
                    .map_err(|e| GeminiError::http("image download", e))?
                    .to_vec()
            }
            Image::Generated { data, .. } => base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| GeminiError::InvalidRequest(format!("image data is not base64: {e}")))?,
        };

        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), "image saved");
        Ok(Some(path))
    }
}

fn url_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    without_query
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn valid_file_name(name: &str) -> Option<String> {
    FILE_NAME_WITH_EXTENSION
        .find(name)
        .map(|m| m.as_str().to_string())
}

/// A named system-prompt preset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gem {
    /// Server id; predefined gems use readable slugs.
    pub id: String,
    /// Display name.
    pub name: String,
    /// System prompt applied to requests using this gem.
    pub prompt: String,
    pub description: String,
    /// Shipped by the service rather than created by the user.
    pub predefined: bool,
}

impl fmt::Display for Gem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordered collection of gems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemJar(Vec<Gem>);

impl GemJar {
    pub fn new(gems: Vec<Gem>) -> Self {
        Self(gems)
    }

    /// Look a gem up by id, or by name when no id is given.
    pub fn get(&self, id: Option<&str>, name: Option<&str>) -> Option<&Gem> {
        match (id, name) {
            (Some(id), _) => self.0.iter().find(|gem| gem.id == id),
            (None, Some(name)) => self.0.iter().find(|gem| gem.name == name),
            (None, None) => None,
        }
    }

    /// Gems whose `predefined` flag matches; all gems when `predefined` is `None`.
    pub fn filter(&self, predefined: Option<bool>) -> GemJar {
        self.0
            .iter()
            .filter(|gem| predefined.is_none_or(|p| gem.predefined == p))
            .cloned()
            .collect()
    }

    /// Replace the gem with the same id, or append.
    pub fn upsert(&mut self, gem: Gem) {
        match self.0.iter_mut().find(|g| g.id == gem.id) {
            Some(existing) => *existing = gem,
            None => self.0.push(gem),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Gem> {
        let index = self.0.iter().position(|g| g.id == id)?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Gem> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Gem> for GemJar {
    fn from_iter<I: IntoIterator<Item = Gem>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for GemJar {
    type Item = Gem;
    type IntoIter = std::vec::IntoIter<Gem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a GemJar {
    type Item = &'a Gem;
    type IntoIter = std::slice::Iter<'a, Gem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gem(id: &str, name: &str, predefined: bool) -> Gem {
        Gem {
            id: id.to_string(),
            name: name.to_string(),
            predefined,
            ..Default::default()
        }
    }

    fn jar() -> GemJar {
        GemJar::new(vec![
            gem("coding-partner", "Coding partner", true),
            gem("brainstormer", "Brainstormer", true),
            gem("c-1", "My gem", false),
        ])
    }

    #[test]
    fn gem_jar_filters_by_predefined_flag() {
        let jar = jar();
        assert_eq!(jar.filter(Some(true)).len(), 2);
        assert_eq!(jar.filter(Some(false)).len(), 1);
        assert_eq!(jar.filter(None).len(), 3);
    }

    #[test]
    fn gem_jar_get_by_id_and_name() {
        let jar = jar();
        assert_eq!(jar.get(Some("c-1"), None).map(|g| g.name.as_str()), Some("My gem"));
        assert_eq!(
            jar.get(None, Some("Brainstormer")).map(|g| g.id.as_str()),
            Some("brainstormer")
        );
        assert_eq!(jar.get(Some("missing"), None), None);
        assert_eq!(
            jar.get(Some("c-1"), Some("Brainstormer")).map(|g| g.name.as_str()),
            Some("My gem")
        );
        assert_eq!(jar.get(Some("missing"), Some("Brainstormer")), None);
        assert_eq!(jar.get(None, None), None);
    }

    #[test]
    fn gem_jar_upsert_and_remove() {
        let mut jar = jar();
        jar.upsert(gem("c-1", "Renamed", false));
        assert_eq!(jar.len(), 3);
        assert_eq!(jar.get(Some("c-1"), None).unwrap().name, "Renamed");
        jar.upsert(gem("c-2", "Another", false));
        assert_eq!(jar.len(), 4);
        assert!(jar.remove("c-2").is_some());
        assert!(jar.remove("c-2").is_none());
    }

    #[test]
    fn display_impls() {
        let metadata = ChatSessionMetadata {
            conversation_id: Some("c_123".to_string()),
            ..Default::default()
        };
        assert_eq!(metadata.to_string(), "CID: c_123");
        assert_eq!(ChatSessionMetadata::default().to_string(), "CID: ");
        assert_eq!(gem("x", "Writer", false).to_string(), "Writer");
        let output = ModelOutput {
            text: "hi".to_string(),
            ..Default::default()
        };
        assert_eq!(output.to_string(), "hi");
    }

    #[test]
    fn chosen_follows_metadata_index() {
        let output = ModelOutput {
            candidates: vec![
                Candidate {
                    content: "a".to_string(),
                    ..Default::default()
                },
                Candidate {
                    content: "b".to_string(),
                    index: 1,
                    ..Default::default()
                },
            ],
            metadata: Some(ChatSessionMetadata {
                chosen_index: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(output.chosen().map(|c| c.content.as_str()), Some("b"));
    }

    #[test]
    fn file_names_from_urls() {
        assert_eq!(url_file_name("https://x.test/a/b/cat.jpg?sz=200"), "cat.jpg");
        assert_eq!(valid_file_name("cat.jpg"), Some("cat.jpg".to_string()));
        assert_eq!(valid_file_name("no-extension"), None);
    }

    #[tokio::test]
    async fn generated_image_saves_decoded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::Generated {
            data: base64::engine::general_purpose::STANDARD.encode(b"png-bytes"),
            title: "[Generated Image 1]".to_string(),
            alt: String::new(),
        };
        let http = reqwest::Client::new();
        let path = image
            .save(&http, dir.path(), Some("out.png"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn invalid_filename_is_skipped_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::Web {
            url: "https://x.test/images/noext".to_string(),
            title: String::new(),
            alt: String::new(),
        };
        let http = reqwest::Client::new();
        let saved = image.save(&http, dir.path(), None, true).await.unwrap();
        assert_eq!(saved, None);
    }
}
