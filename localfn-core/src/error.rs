//! Error categories and formatting

use serde::Serialize;
use thiserror::Error;

/// Failure categories surfaced by the emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The handler threw or rejected
    HandlerError,
    /// The invocation deadline elapsed before settlement
    Timeout,
    /// The sandbox could not be started or reached
    SandboxUnavailable,
    /// No function is configured under the requested key
    FunctionNotFound,
    /// Malformed configuration detected at construction time
    Configuration,
    /// The targeted connection no longer exists
    Gone,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandlerError => "HandlerError",
            Self::Timeout => "TimeoutError",
            Self::SandboxUnavailable => "SandboxUnavailableError",
            Self::FunctionNotFound => "ResourceNotFoundException",
            Self::Configuration => "ConfigurationError",
            Self::Gone => "GoneException",
            Self::Internal => "ServiceException",
        }
    }

    /// Status used when the failure is turned into a reply.
    ///
    /// Handler and sandbox failures travel inside a 200 error envelope, while
    /// a timeout is a distinct 503.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::HandlerError | Self::SandboxUnavailable => 200,
            Self::Timeout => 503,
            Self::FunctionNotFound => 404,
            Self::Configuration => 400,
            Self::Gone => 410,
            Self::Internal => 500,
        }
    }
}

/// Emulator-level error, as returned by the front end for requests that
/// never reach a handler
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct EmulatorError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl EmulatorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Format as a JSON error body
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonError<'a> {
            #[serde(rename = "__type")]
            error_type: &'static str,
            message: &'a str,
            #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
            request_id: Option<&'a str>,
        }

        let error = JsonError {
            error_type: self.code.as_str(),
            message: &self.message,
            request_id: self.request_id.as_deref(),
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(r#"{{"__type":"{}","message":"{}"}}"#, self.code.as_str(), self.message)
        })
    }
}
