//! Client for the Gemini web app.
//!
//! Authenticates with the browser's `__Secure-1PSID` / `__Secure-1PSIDTS`
//! cookies, talks the app's internal RPC protocol and decodes its streaming
//! responses into text deltas.
//!
//! ```no_run
//! use gemini_webapi::{ClientConfig, GeminiClient, GenerateOptions, Model};
//!
//! # async fn run() -> gemini_webapi::Result<()> {
//! let client = GeminiClient::new(ClientConfig::builder("psid-cookie").build())?;
//! client.initialize(None).await?;
//!
//! let options = GenerateOptions::default().model(Model::Flash);
//! let output = client.generate_content("Hello", &options).await?;
//! println!("{output}");
//!
//! let mut chat = client.start_chat(Model::Pro, None)?;
//! chat.send_message("Remember the number 7").await?;
//! let reply = chat.send_message("Which number?").await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod client;
pub mod config;
pub mod constants;
pub mod delta;
pub mod error;
pub mod frame;
pub mod gems;
pub mod generate;
pub mod rpc;
pub mod session;
pub mod stream;
pub mod types;
pub mod upload;

pub use chat::{ChatSession, ChatState, ChatStream};
pub use client::GeminiClient;
pub use config::{ClientConfig, ClientConfigBuilder, Credentials, Endpoints};
pub use constants::Model;
pub use error::{GeminiError, Result};
pub use generate::{GenerateOptions, GenerateStream};
pub use rpc::{RpcCall, RpcResponse};
pub use session::Session;
pub use types::{Candidate, ChatSessionMetadata, Gem, GemJar, Image, ModelOutput};
pub use upload::FileRef;
