//! Request and Response message types.
//!
//! Commands are plain data: a `Domain.action` method string plus an untyped
//! params object. Typed commands can be layered on top without changing the
//! wire format (see [`Session::call`](crate::Session::call)).

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Request
// ============================================================================

/// A command request from local end to remote end.
///
/// # Format
///
/// ```json
/// { "id": 1, "method": "Page.navigate", "params": { "url": "..." } }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Correlation id, unique within the session.
    pub id: RequestId,

    /// Method in `Domain.action` format.
    pub method: String,

    /// Command parameters (an object, `{}` when empty).
    pub params: Value,
}

impl Request {
    /// Creates a request. `null` params are sent as `{}`.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Serializes the request to its wire text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Response
// ============================================================================

/// Error payload of a failed command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteFailure {
    /// Error code.
    pub code: i64,

    /// Human readable message.
    pub message: String,

    /// Optional extra detail.
    #[serde(default)]
    pub data: Option<Value>,
}

/// A response from remote end to local end.
///
/// # Format
///
/// ```json
/// { "id": 1, "result": { ... } }
/// { "id": 1, "error": { "code": -32601, "message": "..." } }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Matches the request `id`.
    pub id: RequestId,

    /// Result or remote error.
    pub outcome: std::result::Result<Value, RemoteFailure>,
}

impl Response {
    /// Returns `true` if this is a success response.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Returns `true` if this is an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Extracts the result value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the response was an error.
    pub fn into_result(self) -> Result<Value> {
        self.outcome
            .map_err(|failure| Error::remote(failure.code, failure.message, failure.data))
    }
}

// ============================================================================
// Tests
// ============================================================================
