//! JSON-RPC 2.0 envelopes exchanged with the control plane.
//!
//! Requests travel as HTTP POSTs to the session's message endpoint; responses
//! come back asynchronously as `data:` lines on the event stream. The types
//! here are only the wire shapes. Correlation lives in [`crate::correlator`].
//!
//! # Examples
//!
//! ```
//! use mcp_link::jrpc::{Request, Response};
//! use serde_json::json;
//!
//! let request = Request::new("tools/list", None, json!("7f1c"));
//! let wire = serde_json::to_string(&request).unwrap();
//! assert!(wire.contains("\"method\":\"tools/list\""));
//! assert!(!wire.contains("params"));
//!
//! let response: Response<serde_json::Value> = serde_json::from_str(
//!     r#"{"jsonrpc": "2.0", "id": "7f1c", "result": {"tools": []}}"#
//! ).unwrap();
//! assert_eq!(response.id, json!("7f1c"));
//! assert!(response.into_result().is_ok());
//! ```

use std::fmt::{Display, Formatter};

/// A JSON-RPC 2.0 request.
///
/// The `id` is echoed back by the server and is how a response finds its
/// waiting caller. Replies to reverse calls reuse the server's `call_id` here.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 response.
///
/// Exactly one of `result` and `error` is expected, but servers are not
/// trusted on that point; [`Response::into_result`] prefers the error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Response<R> {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(default)]
    pub id: serde_json::Value,
}

fn default_version() -> String {
    "2.0".to_string()
}

impl<R> Response<R> {
    pub fn new(result: R, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(e: Error, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(e),
            id,
        }
    }

    /// Splits the envelope into the server's verdict.
    ///
    /// A response carrying neither field is reported as an internal error.
    pub fn into_result(self) -> Result<R, Error> {
        match (self.error, self.result) {
            (Some(e), _) => Err(e),
            (None, Some(r)) => Ok(r),
            (None, None) => Err(Error::internal_error("response carried no result".to_string())),
        }
    }
}

/// A JSON-RPC 2.0 error object.
///
/// Standard codes: `-32700` parse error, `-32600` invalid request, `-32601`
/// method not found, `-32602` invalid params, `-32603` internal error.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Error {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn internal_error(message: String) -> Self {
        Self {
            code: -32603,
            message,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_envelope_reuses_call_id() {
        let call_id = json!(41);
        let request = Request::new("tools/reply", Some(json!({"result": {"content": []}})), call_id);
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({"jsonrpc": "2.0", "method": "tools/reply", "params": {"result": {"content": []}}, "id": 41})
        );
    }

    #[test]
    fn error_wins_over_result() {
        let response: Response<serde_json::Value> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "a",
            "result": {"ok": true},
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.to_string(), "Error -32601: Method not found");
    }

    #[test]
    fn empty_response_is_an_internal_error() {
        let response: Response<serde_json::Value> = serde_json::from_value(json!({"id": "a"})).unwrap();
        assert_eq!(response.into_result().unwrap_err().code, -32603);
    }
}
