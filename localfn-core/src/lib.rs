//! Core types for localfn
//!
//! This crate provides the error categories and request identifiers shared
//! by the invocation engine and the binary front end.

pub mod error;
pub mod request_id;

pub use error::{EmulatorError, ErrorCode};
pub use request_id::RequestId;
