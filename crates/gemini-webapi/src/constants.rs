//! Fixed values of the upstream web protocol: endpoints, RPC ids, browser
//! headers, the model table and the error codes found inside frames.

use std::fmt;
use std::str::FromStr;

use crate::error::GeminiError;

pub const GOOGLE_URL: &str = "https://www.google.com";
pub const INIT_URL: &str = "https://gemini.google.com/app";
pub const GENERATE_URL: &str =
    "https://gemini.google.com/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";
pub const ROTATE_COOKIES_URL: &str = "https://accounts.google.com/RotateCookies";
pub const UPLOAD_URL: &str = "https://content-push.googleapis.com/upload";
pub const BATCH_EXECUTE_URL: &str = "https://gemini.google.com/_/BardChatUi/data/batchexecute";

/// Path components shared by the default endpoints, used to rebase them onto
/// another origin.
pub(crate) const INIT_PATH: &str = "/app";
pub(crate) const GENERATE_PATH: &str =
    "/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";
pub(crate) const ROTATE_COOKIES_PATH: &str = "/RotateCookies";
pub(crate) const UPLOAD_PATH: &str = "/upload";
pub(crate) const BATCH_EXECUTE_PATH: &str = "/_/BardChatUi/data/batchexecute";

pub const ORIGIN: &str = "https://gemini.google.com";
pub const REFERER: &str = "https://gemini.google.com/";
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36";
pub const X_SAME_DOMAIN: (&str, &str) = ("x-same-domain", "1");
pub const PUSH_ID: (&str, &str) = ("push-id", "feeds/mcudyrk2a4khkz");

/// Header carrying the model selection on generate requests.
pub const MODEL_HEADER: &str = "x-goog-ext-525001261-jspb";

/// Request-type constant in the fourth slot of every batch tuple.
pub const BATCH_REQUEST_TYPE: u8 = 1;

/// Identifiers of the batchexecute RPCs.
pub struct RpcId;

impl RpcId {
    pub const LIST_CHATS: &'static str = "MaZiqc";
    pub const READ_CHAT: &'static str = "hNvQHb";
    pub const DELETE_CHAT: &'static str = "GzXR5e";
    pub const LIST_GEMS: &'static str = "CNgdBe";
    pub const CREATE_GEM: &'static str = "oMH3Zd";
    pub const UPDATE_GEM: &'static str = "kHv0Vd";
    pub const DELETE_GEM: &'static str = "UXcSJb";
    pub const BARD_ACTIVITY: &'static str = "ESY5D";
}

/// Models selectable on a generate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Model {
    #[default]
    Unspecified,
    Pro,
    Flash,
    FlashThinking,
}

impl Model {
    pub const ALL: [Model; 4] = [
        Model::Unspecified,
        Model::Pro,
        Model::Flash,
        Model::FlashThinking,
    ];

    /// Wire name sent in the request body.
    pub fn name(self) -> &'static str {
        match self {
            Model::Unspecified => "unspecified",
            Model::Pro => "gemini-3.0-pro",
            Model::Flash => "gemini-3.0-flash",
            Model::FlashThinking => "gemini-3.0-flash-thinking",
        }
    }

    /// Extra request header selecting this model, if any.
    pub fn header(self) -> Option<(&'static str, &'static str)> {
        let value = match self {
            Model::Unspecified => return None,
            Model::Pro => r#"[1,null,null,null,"9d8ca3786ebdfbea",null,null,0,[4],null,null,1]"#,
            Model::Flash => r#"[1,null,null,null,"fbb127bbb056c959",null,null,0,[4],null,null,1]"#,
            Model::FlashThinking => {
                r#"[1,null,null,null,"5bf011840784117a",null,null,0,[4],null,null,1]"#
            }
        };
        Some((MODEL_HEADER, value))
    }

    /// Look a model up by its wire name or short alias (`pro`, `flash`, ...).
    pub fn from_name(name: &str) -> Option<Model> {
        let name = name.trim();
        Model::ALL.into_iter().find(|model| {
            model.name().eq_ignore_ascii_case(name) || model.alias().eq_ignore_ascii_case(name)
        })
    }

    fn alias(self) -> &'static str {
        match self {
            Model::Unspecified => "unspecified",
            Model::Pro => "pro",
            Model::Flash => "flash",
            Model::FlashThinking => "flash-thinking",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Model {
    type Err = GeminiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Model::from_name(s).ok_or_else(|| GeminiError::ModelInvalid(format!("unknown model '{s}'")))
    }
}

/// Error codes the service embeds in frame payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    TemporaryError1013,
    UsageLimitExceeded,
    ModelInconsistent,
    ModelHeaderInvalid,
    IpTemporarilyBlocked,
    Unknown(i64),
}

impl ErrorCode {
    pub fn from_code(code: i64) -> ErrorCode {
        match code {
            1013 => ErrorCode::TemporaryError1013,
            1037 => ErrorCode::UsageLimitExceeded,
            1050 => ErrorCode::ModelInconsistent,
            1052 => ErrorCode::ModelHeaderInvalid,
            1060 => ErrorCode::IpTemporarilyBlocked,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            ErrorCode::TemporaryError1013 => 1013,
            ErrorCode::UsageLimitExceeded => 1037,
            ErrorCode::ModelInconsistent => 1050,
            ErrorCode::ModelHeaderInvalid => 1052,
            ErrorCode::IpTemporarilyBlocked => 1060,
            ErrorCode::Unknown(code) => code,
        }
    }
}
