//! The Gemini web client.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::chat::ChatSession;
use crate::config::ClientConfig;
use crate::constants::{self, Model, RpcId};
use crate::error::{GeminiError, Result};
use crate::generate::{self, Continuation, GenerateOptions, GenerateStream};
use crate::gems;
use crate::rpc::{self, RpcCall, RpcResponse};
use crate::session::{CookieStore, RequestCounter, Session, SessionManager};
use crate::types::{Gem, GemJar, Image, ModelOutput};
use crate::upload::{self, FileRef};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=utf-8";

struct ClientInner {
    http: reqwest::Client,
    config: ClientConfig,
    session: SessionManager,
    gems: Mutex<GemJar>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    refresh_started: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Client for the Gemini web app, authenticated with browser cookies.
///
/// Cheap to clone; clones share cookies, session values, the request counter
/// and the gem registry. After [`GeminiClient::close`] every operation fails
/// with [`GeminiError::Closed`] without touching the network.
#[derive(Clone)]
pub struct GeminiClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("session", &self.inner.session.session())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_counter(config, RequestCounter::new())
    }

    /// Like [`GeminiClient::new`] with a caller-supplied request counter.
    pub fn with_counter(config: ClientConfig, counter: RequestCounter) -> Result<Self> {
        if config.secure_1psid.trim().is_empty() {
            return Err(GeminiError::Config("__Secure-1PSID must not be empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(constants::ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static(constants::REFERER));
        headers.insert(USER_AGENT, HeaderValue::from_static(constants::USER_AGENT));
        headers.insert(
            constants::X_SAME_DOMAIN.0,
            HeaderValue::from_static(constants::X_SAME_DOMAIN.1),
        );

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.timeout);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| GeminiError::Config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| GeminiError::Config(format!("cannot build HTTP client: {e}")))?;

        let cookies = CookieStore::new(&config.secure_1psid, config.secure_1psidts.as_deref());
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                session: SessionManager::new(cookies, counter),
                config,
                gems: Mutex::new(GemJar::default()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                refresh_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(GeminiError::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting operations, abort in-flight streams and stop cookie refresh.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.shutdown.cancel();
            tracing::info!("client closed");
        }
    }

    /// Values scraped at bootstrap.
    pub fn session(&self) -> Session {
        self.inner.session.session()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.inner.session.cookies().get(name)
    }

    /// Bootstrap the session; starts cookie auto-refresh when configured.
    ///
    /// `timeout` overrides the configured request timeout for this call.
    pub async fn initialize(&self, timeout: Option<Duration>) -> Result<Session> {
        self.ensure_open()?;
        let inner = &self.inner;
        let session = inner
            .session
            .initialize(
                &inner.http,
                &inner.config.endpoints.init,
                timeout.unwrap_or(inner.config.timeout),
            )
            .await?;
        tracing::info!(
            session_id = session.session_id.is_some(),
            build_label = session.build_label.as_deref().unwrap_or("-"),
            "client initialized"
        );
        if inner.config.auto_refresh && !inner.refresh_started.swap(true, Ordering::AcqRel) {
            self.spawn_auto_refresh();
        }
        Ok(session)
    }

    fn spawn_auto_refresh(&self) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.child_token();
        let interval = self.inner.config.refresh_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let rotation = inner.session.rotate(
                    &inner.http,
                    &inner.config.endpoints.rotate_cookies,
                    inner.config.timeout,
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = rotation => {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "cookie rotation failed; retrying next interval");
                        }
                    }
                }
            }
            tracing::debug!("cookie auto-refresh stopped");
        });
    }

    /// Refresh `__Secure-1PSIDTS` now. Returns the names of updated cookies.
    pub async fn rotate_cookies(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let inner = &self.inner;
        inner
            .session
            .rotate(&inner.http, &inner.config.endpoints.rotate_cookies, self.timeout())
            .await
    }

    /// Upload a local file for use as an attachment.
    pub async fn upload_file(&self, path: &Path) -> Result<FileRef> {
        self.ensure_open()?;
        upload::upload_file(
            &self.inner.http,
            &self.inner.config.endpoints.upload,
            path,
            self.timeout(),
        )
        .await
    }

    pub async fn generate_content(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelOutput> {
        self.generate_content_stream(prompt, options)
            .await?
            .collect_output()
            .await
    }

    pub async fn generate_content_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateStream> {
        self.start_generate(prompt, options, &Continuation::default())
            .await
    }

    pub(crate) async fn start_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        continuation: &Continuation,
    ) -> Result<GenerateStream> {
        self.ensure_open()?;
        let inner = &self.inner;
        let timeout = self.timeout();

        let files =
            upload::prepare_files(&inner.http, &inner.config.endpoints.upload, &options.files, timeout)
                .await;
        let request_id = inner.session.next_request_id();
        let body = generate::build_payload(
            prompt,
            options,
            &files,
            request_id,
            &inner.session.session(),
            continuation,
        )?;
        tracing::debug!(
            request_id,
            model = %options.model,
            files = files.len(),
            continued = continuation.conversation_id.is_some(),
            "generate request"
        );

        let mut request = inner
            .http
            .post(&inner.config.endpoints.generate)
            .header(COOKIE, inner.session.cookies().header_value())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some((name, value)) = options.model.header() {
            request = request.header(name, value);
        }

        let cancel = inner.shutdown.child_token();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(GeminiError::Closed),
            response = tokio::time::timeout(timeout, request.send()) => response,
        };
        let response = response
            .map_err(|_| GeminiError::Timeout(timeout))?
            .map_err(|e| GeminiError::transport("generate request", e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeminiError::api_status("generate request failed", status.as_u16()));
        }

        let bytes = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| GeminiError::transport("generate stream", e, timeout))
        });
        Ok(GenerateStream::spawn(bytes, cancel))
    }

    /// Start a new conversation.
    pub fn start_chat(&self, model: Model, gem: Option<String>) -> Result<ChatSession> {
        self.ensure_open()?;
        Ok(ChatSession::new(self.clone(), model, gem))
    }

    /// Send a batch of RPC calls and decode the replies.
    pub async fn batch_execute(&self, calls: &[RpcCall]) -> Result<Vec<RpcResponse>> {
        self.ensure_open()?;
        if calls.is_empty() {
            return Err(GeminiError::InvalidRequest("empty RPC batch".to_string()));
        }
        let inner = &self.inner;
        let timeout = self.timeout();
        let session = inner.session.session();
        let request_id = inner.session.next_request_id();
        let rpc_ids = calls
            .iter()
            .map(|c| c.rpc_id.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut query = vec![
            ("rpcids", rpc_ids.clone()),
            ("_reqid", request_id.to_string()),
            ("rt", "c".to_string()),
        ];
        if let Some(bl) = &session.build_label {
            query.push(("bl", bl.clone()));
        }
        if let Some(sid) = &session.session_id {
            query.push(("f.sid", sid.clone()));
        }
        tracing::debug!(request_id, rpc_ids = %rpc_ids, "batch execute");

        let response = inner
            .http
            .post(&inner.config.endpoints.batch_execute)
            .query(&query)
            .header(COOKIE, inner.session.cookies().header_value())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(rpc::encode_batch(calls, session.batch_token()))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GeminiError::transport("batch execute", e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeminiError::api_status("batch execute failed", status.as_u16()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| GeminiError::transport("batch execute", e, timeout))?;

        let mut responses = rpc::decode_batch(&text)?;
        rpc::pair_identifiers(calls, &mut responses);
        Ok(responses)
    }

    /// Fetch predefined and custom gems, replacing the cached registry.
    pub async fn fetch_gems(&self, include_hidden: bool, language: &str) -> Result<GemJar> {
        let responses = self
            .batch_execute(&gems::list_calls(include_hidden, language))
            .await?;
        let jar = gems::parse_list(&responses)?;
        tracing::debug!(gems = jar.len(), "gems fetched");
        *self.inner.gems.lock() = jar.clone();
        Ok(jar)
    }

    /// Cached registry from the last fetch, create, update or delete.
    pub fn gems(&self) -> GemJar {
        self.inner.gems.lock().clone()
    }

    /// Create a custom gem; the returned gem carries the server-assigned id.
    pub async fn create_gem(&self, name: &str, prompt: &str, description: &str) -> Result<Gem> {
        let responses = self
            .batch_execute(&[gems::create_call(name, prompt, description)])
            .await?;
        let id = gems::parse_created(&responses)?;
        let gem = gems::custom_gem(id, name, prompt, description);
        self.inner.gems.lock().upsert(gem.clone());
        tracing::info!(gem_id = %gem.id, "gem created");
        Ok(gem)
    }

    pub async fn update_gem(
        &self,
        id: &str,
        name: &str,
        prompt: &str,
        description: &str,
    ) -> Result<Gem> {
        self.batch_execute(&[gems::update_call(id, name, prompt, description)])
            .await?;
        let gem = gems::custom_gem(id.to_string(), name, prompt, description);
        self.inner.gems.lock().upsert(gem.clone());
        Ok(gem)
    }

    pub async fn delete_gem(&self, id: &str) -> Result<()> {
        self.batch_execute(&[gems::delete_call(id)]).await?;
        self.inner.gems.lock().remove(id);
        Ok(())
    }

    pub async fn delete_chat(&self, conversation_id: &str) -> Result<()> {
        self.batch_execute(&[RpcCall::from_json(RpcId::DELETE_CHAT, &json!([conversation_id]))])
            .await?;
        Ok(())
    }

    /// Raw conversation history as returned by the service.
    pub async fn read_chat(&self, conversation_id: &str) -> Result<Option<Value>> {
        let call = RpcCall::from_json(
            RpcId::READ_CHAT,
            &json!([conversation_id, 10, null, 1, [1], [4], null, 1]),
        );
        let responses = self.batch_execute(&[call]).await?;
        match responses.iter().find(|r| r.rpc_id == RpcId::READ_CHAT) {
            Some(response) => response.json(),
            None => Ok(None),
        }
    }

    /// Save an image from a reply through this client's transport.
    pub async fn save_image(
        &self,
        image: &Image,
        dir: impl AsRef<Path>,
        filename: Option<&str>,
        skip_invalid_filename: bool,
    ) -> Result<Option<PathBuf>> {
        self.ensure_open()?;
        image
            .save(&self.inner.http, dir, filename, skip_invalid_filename)
            .await
    }
}
