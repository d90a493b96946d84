//! Invocation records

use localfn_core::RequestId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Invocation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationType {
    /// Synchronous invocation (wait for response)
    #[default]
    RequestResponse,
    /// Asynchronous invocation (fire and forget)
    Event,
    /// Validation only (don't actually invoke)
    DryRun,
}

impl InvocationType {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RequestResponse" => Some(Self::RequestResponse),
            "Event" => Some(Self::Event),
            "DryRun" => Some(Self::DryRun),
            _ => None,
        }
    }
}

/// One execution attempt of a handler against one event.
///
/// The execution arm and the timeout arm race to call [`Invocation::settle`];
/// only the first caller gets `true` and may report an outcome.
#[derive(Debug)]
pub struct Invocation {
    pub request_id: RequestId,
    pub function_key: String,
    pub timeout: Duration,
    /// Absolute deadline on the tokio clock
    pub deadline: Instant,
    /// Absolute deadline in epoch milliseconds, as handed to handlers
    pub deadline_ms: i64,
    done: AtomicBool,
}

impl Invocation {
    pub fn new(function_key: impl Into<String>, timeout: Duration) -> Self {
        let deadline_ms =
            chrono::Utc::now().timestamp_millis() + i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX / 2);

        Self {
            request_id: RequestId::new(),
            function_key: function_key.into(),
            timeout,
            deadline: Instant::now() + timeout,
            deadline_ms,
            done: AtomicBool::new(false),
        }
    }

    /// Claim the settlement. Returns `true` for exactly one caller.
    pub fn settle(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
