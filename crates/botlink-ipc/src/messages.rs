use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString, IntoStaticStr};

/// What the gateway asks the worker to do.
///
/// `update`, `start` and `process` are forwarded client actions. `cleanup`
/// and `ping` are internal control commands that never come from a client.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    Update,
    Start,
    Process,
    Cleanup,
    Ping,
}

impl CommandKind {
    /// Kinds a client may request through the gateway.
    pub fn is_client_action(self) -> bool {
        matches!(self, Self::Update | Self::Start | Self::Process)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessParams {
    pub object: String,
    pub method: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Command Channel request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub kind: CommandKind,
    /// base64 project archive, `update` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// `process` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ProcessParams>,
}

impl CommandMessage {
    fn bare(kind: CommandKind) -> Self {
        Self {
            kind,
            data: None,
            params: None,
        }
    }

    pub fn update(archive_b64: impl Into<String>) -> Self {
        Self {
            data: Some(archive_b64.into()),
            ..Self::bare(CommandKind::Update)
        }
    }

    pub fn start() -> Self {
        Self::bare(CommandKind::Start)
    }

    pub fn process(
        object: impl Into<String>,
        method: impl Into<String>,
        args: Map<String, Value>,
    ) -> Self {
        Self {
            params: Some(ProcessParams {
                object: object.into(),
                method: method.into(),
                args,
            }),
            ..Self::bare(CommandKind::Process)
        }
    }

    pub fn cleanup() -> Self {
        Self::bare(CommandKind::Cleanup)
    }

    pub fn ping() -> Self {
        Self::bare(CommandKind::Ping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Stable, client-visible failure codes.
///
/// Grouped by leading digits: `00` connection, `01` protocol, `02` project,
/// `03` execution, `99` system.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoStaticStr,
    Display,
)]
pub enum ErrorCode {
    #[serde(rename = "00001")]
    #[strum(serialize = "00001")]
    ConnectionRejected,
    #[serde(rename = "00020")]
    #[strum(serialize = "00020")]
    PermissionDenied,

    #[serde(rename = "01001")]
    #[strum(serialize = "01001")]
    InvalidFormat,
    #[serde(rename = "01002")]
    #[strum(serialize = "01002")]
    MissingField,
    #[serde(rename = "01003")]
    #[strum(serialize = "01003")]
    UnknownCommand,
    #[serde(rename = "01004")]
    #[strum(serialize = "01004")]
    InvalidParams,

    #[serde(rename = "02001")]
    #[strum(serialize = "02001")]
    UploadFailed,
    #[serde(rename = "02002")]
    #[strum(serialize = "02002")]
    InvalidProject,
    #[serde(rename = "02003")]
    #[strum(serialize = "02003")]
    LoadFailed,
    #[serde(rename = "02004")]
    #[strum(serialize = "02004")]
    NoProjectLoaded,
    #[serde(rename = "02005")]
    #[strum(serialize = "02005")]
    SecurityViolation,

    #[serde(rename = "03001")]
    #[strum(serialize = "03001")]
    ExecutionFailed,
    #[serde(rename = "03002")]
    #[strum(serialize = "03002")]
    MethodNotFound,
    #[serde(rename = "03003")]
    #[strum(serialize = "03003")]
    ObjectNotFound,
    #[serde(rename = "03005")]
    #[strum(serialize = "03005")]
    ExecutionTimeout,

    #[serde(rename = "99001")]
    #[strum(serialize = "99001")]
    Internal,
    #[serde(rename = "99002")]
    #[strum(serialize = "99002")]
    WorkerTimeout,
    #[serde(rename = "99003")]
    #[strum(serialize = "99003")]
    WorkerUnavailable,
}

impl ErrorCode {
    pub fn code(self) -> &'static str {
        self.into()
    }
}

/// Exactly one of these answers every [`CommandMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Reply {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: message.into(),
            error_code: None,
            data,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: message.into(),
            error_code: Some(code),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

/// Callback Channel event. `type` is `callback` for task outcomes, or
/// whatever name the loaded code pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl CallbackMessage {
    pub const TASK_OUTCOME: &'static str = "callback";

    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
