//! Event message types.
//!
//! Events are unsolicited notifications from the remote end. They carry no
//! `id`, which is how they are told apart from responses.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// Event
// ============================================================================

/// An event notification from remote end to local end.
///
/// # Format
///
/// ```json
/// { "method": "Page.loadEventFired", "params": { "timestamp": 1.5 } }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    /// Event name in `Domain.event` format.
    pub method: String,

    /// Event-specific data.
    #[serde(default)]
    pub params: Value,

    /// Target session the event belongs to, when flattened sessions are used.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

impl Event {
    /// Creates an event.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            session_id: None,
        }
    }

    /// Returns the domain part of the method.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let event = Event::new("Page.loadEventFired", Value::Null);
    /// assert_eq!(event.domain(), "Page");
    /// ```
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }

    /// Returns the event name part of the method.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.method
            .split_once('.')
            .map(|(_, name)| name)
            .unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
