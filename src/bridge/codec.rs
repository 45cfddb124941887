//! Line oriented JSON-RPC framing used by stratum miners.
//!
//! Each line on the wire is one [`Message`]. Requests carry an `id` that is echoed back untouched
//! in the matching [`Response`], whether the miner sent it as a number or a string.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const NOTIFY: &str = "mining.notify";
pub const SET_EXTRANONCE: &str = "mining.set_extranonce";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Invalid JSON or a message without the fields its kind requires.
    MalformedMessage(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::MalformedMessage(e) => write!(f, "MalformedMessage {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// Error responses use the stratum `[code, message, traceback]` triple.
    pub fn error(id: Value, code: i32, message: &str) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(Value::Array(vec![
                Value::from(code),
                Value::from(message),
                Value::Null,
            ])),
        }
    }
}

impl Notification {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }

    pub fn set_difficulty(difficulty: f64) -> Self {
        Self::new(SET_DIFFICULTY, vec![Value::from(difficulty)])
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

/// Some ASIC firmwares put raw tabs and other control characters inside JSON strings.
fn sanitize(input: &str) -> std::borrow::Cow<'_, str> {
    if input.chars().any(|c| c.is_control() && c != '\n' && c != '\r') {
        tracing::debug!("JSON input sanitized (control characters replaced with spaces)");
        input
            .chars()
            .map(|c| {
                if c.is_control() && c != '\n' && c != '\r' {
                    ' '
                } else {
                    c
                }
            })
            .collect::<String>()
            .into()
    } else {
        input.into()
    }
}

fn take_params(obj: &mut Map<String, Value>) -> Result<Vec<Value>, CodecError> {
    match obj.remove("params") {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(params)) => Ok(params),
        Some(other) => Err(CodecError::MalformedMessage(format!(
            "params must be an array, got {}",
            other
        ))),
    }
}

/// Decodes one line received from a miner.
pub fn decode(line: &str) -> Result<Message, CodecError> {
    let line = sanitize(line);
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| CodecError::MalformedMessage(e.to_string()))?;
    let mut obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(CodecError::MalformedMessage(format!(
                "expected a JSON object, got {}",
                other
            )))
        }
    };
    let id = obj.remove("id").unwrap_or(Value::Null);
    match obj.remove("method") {
        Some(Value::String(method)) => {
            let params = take_params(&mut obj)?;
            if id.is_null() {
                Ok(Message::Notification(Notification { method, params }))
            } else {
                Ok(Message::Request(Request { id, method, params }))
            }
        }
        Some(other) => Err(CodecError::MalformedMessage(format!(
            "method must be a string, got {}",
            other
        ))),
        None => {
            if id.is_null() || !(obj.contains_key("result") || obj.contains_key("error")) {
                return Err(CodecError::MalformedMessage(
                    "missing method or result".to_string(),
                ));
            }
            let result = obj.remove("result").unwrap_or(Value::Null);
            let error = match obj.remove("error") {
                None | Some(Value::Null) => None,
                Some(e) => Some(e),
            };
            Ok(Message::Response(Response { id, result, error }))
        }
    }
}

/// Encodes a message as a single line, without the trailing newline.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::MalformedMessage(e.to_string()))
}
