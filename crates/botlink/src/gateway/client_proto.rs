//! Newline-delimited JSON spoken with the client.
//!
//! ```text
//! -> {"hello": {"subject": "alice", "permissions": ["robot:control"]}}
//! <- {"event": "connected", "data": {"session": "...", "subject": "alice"}}
//! -> {"id": 1, "action": "process", "params": {"object": "robot_controller", "method": "prepare_mode"}}
//! <- {"id": 1, "reply": {"status": "success", "message": "...", "data": {...}}}
//! <- {"event": "recognition_result", "data": {...}}
//! ```

use botlink_ipc::{CommandKind, CommandMessage, ErrorCode, Reply};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::session::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn into_reply(self) -> Reply {
        Reply::error(self.code, self.message)
    }
}

#[derive(Debug, Deserialize)]
struct Hello {
    hello: Identity,
}

/// First line of every connection.
pub fn parse_hello(line: &str) -> Result<Identity, ProtocolError> {
    serde_json::from_str::<Hello>(line)
        .map(|h| h.hello)
        .map_err(|e| {
            ProtocolError::new(
                ErrorCode::InvalidFormat,
                format!("expected {{\"hello\": {{\"subject\", \"permissions\"}}}}: {e}"),
            )
        })
}

/// A client request line. `id` is echoed back untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub id: Value,
    pub command: CommandMessage,
}

/// Parse a request line. On failure the request id (if one could be read)
/// comes back with the error so the reply can still be correlated.
pub fn parse_request(line: &str) -> Result<ClientRequest, (Value, ProtocolError)> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        (
            Value::Null,
            ProtocolError::new(ErrorCode::InvalidFormat, format!("invalid JSON: {e}")),
        )
    })?;
    let Value::Object(mut fields) = value else {
        return Err((
            Value::Null,
            ProtocolError::new(ErrorCode::InvalidFormat, "message must be a JSON object"),
        ));
    };
    let id = fields.remove("id").unwrap_or(Value::Null);
    match validate(&fields) {
        Ok(command) => Ok(ClientRequest { id, command }),
        Err(e) => Err((id, e)),
    }
}

fn validate(fields: &Map<String, Value>) -> Result<CommandMessage, ProtocolError> {
    let action = match fields.get("action") {
        Some(Value::String(action)) => action,
        Some(_) => {
            return Err(ProtocolError::new(
                ErrorCode::InvalidFormat,
                "'action' must be a string",
            ));
        }
        None => {
            return Err(ProtocolError::new(
                ErrorCode::MissingField,
                "missing 'action' field",
            ));
        }
    };
    let unknown = || {
        ProtocolError::new(
            ErrorCode::UnknownCommand,
            format!("unknown action: {action}"),
        )
    };
    let kind = action.parse::<CommandKind>().map_err(|_| unknown())?;

    match kind {
        CommandKind::Update => match fields.get("data") {
            Some(Value::String(data)) => Ok(CommandMessage::update(data.clone())),
            Some(_) => Err(ProtocolError::new(
                ErrorCode::InvalidParams,
                "'data' must be a base64 string",
            )),
            None => Err(ProtocolError::new(
                ErrorCode::MissingField,
                "update requires a 'data' field",
            )),
        },
        CommandKind::Start => Ok(CommandMessage::start()),
        CommandKind::Process => validate_process(fields.get("params")),
        // internal control kinds are never client actions
        CommandKind::Cleanup | CommandKind::Ping => Err(unknown()),
    }
}

fn validate_process(params: Option<&Value>) -> Result<CommandMessage, ProtocolError> {
    let params = match params {
        Some(Value::Object(params)) => params,
        Some(_) => {
            return Err(ProtocolError::new(
                ErrorCode::InvalidParams,
                "'params' must be an object",
            ));
        }
        None => {
            return Err(ProtocolError::new(
                ErrorCode::MissingField,
                "process requires a 'params' field",
            ));
        }
    };
    let field = |name: &str| match params.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(ProtocolError::new(
            ErrorCode::InvalidParams,
            format!("'params.{name}' must be a non-empty string"),
        )),
        None => Err(ProtocolError::new(
            ErrorCode::MissingField,
            format!("'params' must contain '{name}'"),
        )),
    };
    let object = field("object")?;
    let method = field("method")?;
    let args = match params.get("args") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args.clone(),
        Some(_) => {
            return Err(ProtocolError::new(
                ErrorCode::InvalidParams,
                "'args' must be an object",
            ));
        }
    };
    Ok(CommandMessage::process(object, method, args))
}

/// Everything the gateway writes to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerLine {
    Reply { id: Value, reply: Reply },
    Event { event: String, data: Value },
}

impl ServerLine {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        ServerLine::Event {
            event: event.into(),
            data,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::event(
            "error",
            json!({ "code": code.code(), "message": message.into() }),
        )
    }

    /// Serialized line including the trailing newline.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|e| {
            format!(r#"{{"event":"error","data":{{"message":"{e}"}}}}"#).into_bytes()
        });
        line.push(b'\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_of(line: &str) -> ErrorCode {
        parse_request(line).unwrap_err().1.code
    }

    #[test]
    fn process_request_keeps_id_and_args() {
        let req = parse_request(
            r#"{"id": 7, "action": "process", "params": {"object": "robot_controller", "method": "start_recognition", "args": {"interval_ms": 50}}}"#,
        )
        .unwrap();
        assert_eq!(req.id, json!(7));
        assert_eq!(req.command.kind, CommandKind::Process);
        let params = req.command.params.unwrap();
        assert_eq!(params.object, "robot_controller");
        assert_eq!(params.method, "start_recognition");
        assert_eq!(params.args["interval_ms"], 50);
    }

    #[test]
    fn args_are_optional() {
        let req = parse_request(
            r#"{"action": "process", "params": {"object": "o", "method": "m"}}"#,
        )
        .unwrap();
        assert_eq!(req.id, Value::Null);
        assert!(req.command.params.unwrap().args.is_empty());
    }

    #[test]
    fn malformed_requests_map_to_protocol_codes() {
        assert_eq!(code_of("not json"), ErrorCode::InvalidFormat);
        assert_eq!(code_of("[1, 2]"), ErrorCode::InvalidFormat);
        assert_eq!(code_of(r#"{"id": 1}"#), ErrorCode::MissingField);
        assert_eq!(code_of(r#"{"action": "reboot"}"#), ErrorCode::UnknownCommand);
        assert_eq!(code_of(r#"{"action": "cleanup"}"#), ErrorCode::UnknownCommand);
        assert_eq!(code_of(r#"{"action": "update"}"#), ErrorCode::MissingField);
        assert_eq!(code_of(r#"{"action": "update", "data": 5}"#), ErrorCode::InvalidParams);
        assert_eq!(code_of(r#"{"action": "process"}"#), ErrorCode::MissingField);
        assert_eq!(
            code_of(r#"{"action": "process", "params": {"object": "o"}}"#),
            ErrorCode::MissingField
        );
        assert_eq!(
            code_of(r#"{"action": "process", "params": {"object": "o", "method": "m", "args": []}}"#),
            ErrorCode::InvalidParams
        );
    }

    #[test]
    fn failed_validation_still_returns_the_id() {
        let (id, err) = parse_request(r#"{"id": "abc", "action": "process"}"#).unwrap_err();
        assert_eq!(id, json!("abc"));
        assert_eq!(err.code, ErrorCode::MissingField);
    }

    #[test]
    fn hello_carries_identity() {
        let identity = parse_hello(
            r#"{"hello": {"subject": "alice", "permissions": ["robot:control"]}}"#,
        )
        .unwrap();
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.permissions, ["robot:control"]);
        assert_eq!(parse_hello("{}").unwrap_err().code, ErrorCode::InvalidFormat);
    }

    #[test]
    fn server_lines_are_flat_json() {
        let line = ServerLine::Reply {
            id: json!(1),
            reply: Reply::success("ok", None),
        }
        .to_line();
        let value: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["reply"]["status"], "success");
        assert_eq!(*line.last().unwrap(), b'\n');

        let value: Value =
            serde_json::from_slice(&ServerLine::error(ErrorCode::ConnectionRejected, "busy").to_line())
                .unwrap();
        assert_eq!(value, json!({"event": "error", "data": {"code": "00001", "message": "busy"}}));
    }
}
