//! File attachments: read, upload, reference in the prompt.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::ser::{Serialize, SerializeTuple, Serializer};

use crate::constants::PUSH_ID;
use crate::error::{GeminiError, Result};

/// An uploaded file as referenced from the generate payload:
/// `[[uploadId], fileName]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Id returned by the upload endpoint.
    pub upload_id: String,
    /// Original file name shown to the model.
    pub file_name: String,
}

impl Serialize for FileRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&[&self.upload_id])?;
        tuple.serialize_element(&self.file_name)?;
        tuple.end()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Upload one file; the response body is the upload id.
pub async fn upload_file(
    http: &reqwest::Client,
    url: &str,
    path: &Path,
    timeout: Duration,
) -> Result<FileRef> {
    let bytes = tokio::fs::read(path).await?;
    let name = file_name(path);
    let form = Form::new().part("file", Part::bytes(bytes).file_name(name.clone()));
    let response = http
        .post(url)
        .header(PUSH_ID.0, PUSH_ID.1)
        .multipart(form)
        .timeout(timeout)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| GeminiError::transport("file upload", e, timeout))?;
    let upload_id = response
        .text()
        .await
        .map_err(|e| GeminiError::transport("file upload", e, timeout))?
        .trim()
        .to_string();
    if upload_id.is_empty() {
        return Err(GeminiError::api("file upload returned an empty id"));
    }
    tracing::debug!(file = %name, "file uploaded");
    Ok(FileRef {
        upload_id,
        file_name: name,
    })
}

/// Upload every file, skipping the ones that fail.
pub async fn prepare_files(
    http: &reqwest::Client,
    url: &str,
    files: &[PathBuf],
    timeout: Duration,
) -> Vec<FileRef> {
    let mut refs = Vec::with_capacity(files.len());
    for path in files {
        match upload_file(http, url, path, timeout).await {
            Ok(file_ref) => refs.push(file_ref),
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping attachment"),
        }
    }
    refs
}
