//! Actions and their results.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One atomic automation step, opaque to the relay.
///
/// The relay only routes actions; `name` and `params` are interpreted
/// client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Opaque action name (e.g. `"click_element"`).
    pub name: String,
    /// Whether the client should attach a screenshot to the result.
    #[serde(default)]
    pub screenshot: bool,
    /// Seconds to wait after this action's result before the next dispatch.
    #[serde(default)]
    pub delay: f64,
    /// Opaque action parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Action {
    /// Create an action with defaults (no screenshot, no delay, no params).
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            screenshot: false,
            delay: 0.0,
            params: None,
        }
    }

    /// Request a screenshot with the result.
    #[must_use]
    pub const fn with_screenshot(mut self) -> Self {
        self.screenshot = true;
        self
    }

    /// Set the post-action delay in seconds.
    #[must_use]
    pub const fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Attach opaque parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Action executed successfully.
    Ok,
    /// Action failed on the client.
    Error,
    /// No result arrived within the per-action timeout.
    Timeout,
    /// Action was never dispatched (sequence aborted or cancelled).
    Aborted,
}

/// Result of one action, streamed client → relay → controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Identifier of the owning sequence.
    pub request_id: String,
    /// Zero-based position within the sequence.
    pub action_index: u32,
    /// Outcome of the action.
    pub status: ActionStatus,
    /// Screenshot payload, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Error detail when `status` is not `Ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl ActionResult {
    /// Create a successful result.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, action_index: u32) -> Self {
        Self::with_status(request_id, action_index, ActionStatus::Ok, None)
    }

    /// Create a failed result with an error detail.
    #[must_use]
    pub fn error(
        request_id: impl Into<String>,
        action_index: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self::with_status(
            request_id,
            action_index,
            ActionStatus::Error,
            Some(detail.into()),
        )
    }

    /// Create a timeout result.
    #[must_use]
    pub fn timeout(request_id: impl Into<String>, action_index: u32) -> Self {
        Self::with_status(
            request_id,
            action_index,
            ActionStatus::Timeout,
            Some("action timed out".to_string()),
        )
    }

    /// Create an aborted result for a never-dispatched action.
    #[must_use]
    pub fn aborted(request_id: impl Into<String>, action_index: u32) -> Self {
        Self::with_status(request_id, action_index, ActionStatus::Aborted, None)
    }

    fn with_status(
        request_id: impl Into<String>,
        action_index: u32,
        status: ActionStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            action_index,
            status,
            screenshot: None,
            error,
            timestamp: now_millis(),
        }
    }

    /// Attach a screenshot from raw bytes.
    #[must_use]
    pub fn with_screenshot(mut self, bytes: &[u8]) -> Self {
        self.screenshot = Some(BASE64.encode(bytes));
        self
    }

    /// Decode the screenshot payload from base64.
    #[must_use]
    pub fn screenshot_bytes(&self) -> Option<Vec<u8>> {
        self.screenshot
            .as_deref()
            .and_then(|s| BASE64.decode(s).ok())
    }
}

/// Screenshot-free summary row carried by `SEQUENCE_COMPLETE`.
///
/// Screenshots stream per-action; the terminal summary never repeats them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Zero-based position within the sequence.
    pub action_index: u32,
    /// Outcome of the action.
    pub status: ActionStatus,
    /// Error detail when `status` is not `Ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl From<&ActionResult> for ActionOutcome {
    fn from(result: &ActionResult) -> Self {
        Self {
            action_index: result.action_index,
            status: result.status,
            error: result.error.clone(),
            timestamp: result.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screenshot_roundtrip() {
        let original = b"\x89PNG fake bytes";
        let result = ActionResult::ok("r1", 0).with_screenshot(original);
        assert_eq!(result.screenshot_bytes().unwrap(), original);
    }

    #[test]
    fn test_action_defaults() {
        let action: Action = serde_json::from_str(r#"{"name":"click_x"}"#).unwrap();
        assert_eq!(action.name, "click_x");
        assert!(!action.screenshot);
        assert_eq!(action.delay, 0.0);
        assert!(action.params.is_none());
    }

    #[test]
    fn test_action_builder() {
        let action = Action::named("click_element")
            .with_screenshot()
            .with_delay(0.5)
            .with_params(serde_json::json!({"element": "chart_e200"}));
        let json = serde_json::to_string(&action).unwrap();
        let parsed: Action = serde_json::from_str(&json).unwrap();
        assert!(parsed.screenshot);
        assert_eq!(parsed.delay, 0.5);
        assert_eq!(parsed.params.unwrap()["element"], "chart_e200");
    }

    #[test]
    fn test_outcome_drops_screenshot() {
        let result = ActionResult::error("r1", 2, "no such element").with_screenshot(b"bytes");
        let outcome = ActionOutcome::from(&result);
        assert_eq!(outcome.action_index, 2);
        assert_eq!(outcome.status, ActionStatus::Error);
        assert_eq!(outcome.error.as_deref(), Some("no such element"));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(!json.contains("screenshot"));
    }
}
