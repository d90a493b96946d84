//! Result normalization
//!
//! Turns whatever a handler produced into the reply handed back to the
//! triggering transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use localfn_core::{EmulatorError, ErrorCode};

use crate::handler::{HandlerError, HandlerResult, Stack};

/// Reply returned to the triggering transport
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Fields of an enveloped reply that are passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    pub fn new(status_code: u16, body: impl Into<Value>) -> Self {
        Self {
            status_code,
            headers: None,
            body: Some(body.into()),
            extra: Map::new(),
        }
    }

    pub fn empty(status_code: u16) -> Self {
        Self {
            status_code,
            headers: None,
            body: None,
            extra: Map::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Body as transport text: strings verbatim, anything else as JSON
    pub fn body_text(&self) -> String {
        match &self.body {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Reply for a failure that never reached a handler
    pub fn from_error(error: &EmulatorError) -> Self {
        Self::new(error.http_status(), error.to_json())
            .with_header("Content-Type", "application/json")
    }
}

/// Error envelope returned for thrown handler errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_message: String,
    pub error_type: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl From<&HandlerError> for ErrorEnvelope {
    fn from(error: &HandlerError) -> Self {
        let stack_trace = match &error.stack {
            Some(Stack::Raw(stack)) => parse_stack_trace(stack),
            Some(Stack::Frames(frames)) => frames.clone(),
            None => Vec::new(),
        };

        Self {
            error_message: error.message.clone(),
            error_type: error.error_type.clone(),
            stack_trace,
        }
    }
}

/// What a handler produced, decided once by inspecting its shape
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    /// Object carrying its own `statusCode`
    Enveloped(Map<String, Value>),
    /// Any other returned value
    RawValue(Value),
    /// The handler threw or rejected
    Thrown(HandlerError),
}

impl From<HandlerResult> for RawOutcome {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(Value::Object(map)) if map.contains_key("statusCode") => Self::Enveloped(map),
            Ok(value) => Self::RawValue(value),
            Err(error) => Self::Thrown(error),
        }
    }
}

/// Normalize a handler outcome into a reply
pub fn normalize(result: HandlerResult) -> Reply {
    match RawOutcome::from(result) {
        RawOutcome::Enveloped(map) => pass_through(map),
        RawOutcome::RawValue(value) => Reply::new(200, value.to_string()),
        RawOutcome::Thrown(error) => error_reply(&error),
    }
}

/// Error envelope reply. Thrown errors do not signal a transport failure.
pub fn error_reply(error: &HandlerError) -> Reply {
    let envelope = ErrorEnvelope::from(error);
    let body = serde_json::to_string(&envelope).unwrap_or_else(|_| {
        format!(
            r#"{{"errorMessage":{:?},"errorType":{:?},"stackTrace":[]}}"#,
            envelope.error_message, envelope.error_type
        )
    });

    Reply::new(ErrorCode::HandlerError.http_status(), body)
        .with_header("Content-Type", "application/json")
}

/// Reply sent when the deadline elapses before the handler settles
pub fn timeout_reply(function_key: &str, timeout: Duration) -> Reply {
    let status = ErrorCode::Timeout.http_status();
    Reply::new(
        status,
        format!(
            "[{}] - Function '{}' timed out after {}ms",
            status,
            function_key,
            timeout.as_millis()
        ),
    )
    .with_header("Content-Type", "text/plain")
}

/// Split a stack representation into frame lines.
///
/// The first line of a stack is the error header and lines that are not
/// frames (blank lines, source excerpts) are dropped.
pub fn parse_stack_trace(stack: &str) -> Vec<String> {
    stack
        .lines()
        .map(str::trim)
        .filter(|line| is_frame(line))
        .map(str::to_string)
        .collect()
}

fn is_frame(line: &str) -> bool {
    // JavaScript and Rust caller frames, then Python traceback frames
    line.starts_with("at ") || line.starts_with("File \"")
}

fn pass_through(mut map: Map<String, Value>) -> Reply {
    let status_code = match map.remove("statusCode") {
        Some(value) => read_status(&value).unwrap_or_else(|| {
            warn!(status_code = %value, "Handler returned an unusable statusCode");
            502
        }),
        None => 200,
    };

    let headers = match map.remove("headers") {
        Some(Value::Object(headers)) => Some(read_headers(headers)),
        Some(Value::Null) | None => None,
        Some(other) => {
            warn!(headers = %other, "Ignoring non-object headers in handler reply");
            None
        }
    };

    let body = map.remove("body");

    Reply {
        status_code,
        headers,
        body,
        extra: map,
    }
}

fn read_status(value: &Value) -> Option<u16> {
    let code = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };

    u16::try_from(code).ok().filter(|c| (100..=999).contains(c))
}

fn read_headers(headers: Map<String, Value>) -> HashMap<String, String> {
    headers
        .into_iter()
        .filter_map(|(name, value)| match value {
            Value::String(s) => Some((name, s)),
            Value::Number(_) | Value::Bool(_) => Some((name, value.to_string())),
            _ => {
                warn!(header = %name, "Dropping header with a non-scalar value");
                None
            }
        })
        .collect()
}
