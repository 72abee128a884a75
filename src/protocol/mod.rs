//! Command/event message types.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Shape |
//! |--------------|-----------|-------|
//! | [`Request`] | Local → Remote | `{"id", "method", "params"}` |
//! | [`Response`] | Remote → Local | `{"id", "result"}` or `{"id", "error": {"code", "message"}}` |
//! | [`Event`] | Remote → Local | `{"method", "params"}` (no `id`) |
//!
//! Methods follow `Domain.action` format (`Page.navigate`,
//! `Runtime.evaluate`); events follow `Domain.event`
//! (`Page.loadEventFired`).

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Submodules
// ============================================================================

/// Event message type.
pub mod event;

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use event::Event;
pub use request::{RemoteFailure, Request, Response};

// ============================================================================
// Incoming
// ============================================================================

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Response to a command.
    Response(Response),
    /// Unsolicited event.
    Event(Event),
}

/// Superset of every inbound field, used for classification.
#[derive(Deserialize)]
struct RawIncoming {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteFailure>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

impl Incoming {
    /// Classifies an inbound text message.
    ///
    /// A message with an `id` is a response; otherwise a `method` makes it
    /// an event.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the text is not valid JSON of the expected shape
    /// - [`Error::Protocol`] if it is neither a response nor an event
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawIncoming = serde_json::from_str(text)?;

        match (raw.id, raw.method) {
            (Some(id), _) => {
                let outcome = match raw.error {
                    Some(failure) => Err(failure),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response(Response { id, outcome }))
            }
            (None, Some(method)) => Ok(Self::Event(Event {
                method,
                params: raw.params,
                session_id: raw.session_id,
            })),
            (None, None) => Err(Error::protocol(
                "inbound message has neither id nor method",
            )),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
