//! Plugin wire protocol.
//!
//! Container-mode plugin calls exchange exactly one request and one
//! response per call, as newline-delimited JSON over the child's standard
//! I/O streams.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::errors::{RuntimeError, RuntimeResult};

/// One `execute` request sent to a plugin process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Correlation id echoed by the response
    pub corr: String,
    /// Operation; only `execute` is defined
    pub op: String,
    /// Opaque plugin input
    pub input: serde_json::Value,
    /// Remaining budget in milliseconds
    pub deadline_ms: u64,
}

impl WireRequest {
    pub fn execute(corr: impl Into<String>, input: serde_json::Value, deadline_ms: u64) -> Self {
        Self {
            corr: corr.into(),
            op: "execute".to_string(),
            input,
            deadline_ms,
        }
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn encode(&self) -> RuntimeResult<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| RuntimeError::WireProtocol(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

/// One response read back from a plugin process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    /// Correlation id of the request being answered
    pub corr: String,
    /// Whether execution succeeded
    pub ok: bool,
    /// Present when `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present when not `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Self-reported metrics (duration, peaks)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl WireResponse {
    pub fn success(corr: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            corr: corr.into(),
            ok: true,
            result: Some(result),
            error: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn failure(corr: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            corr: corr.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn encode(&self) -> RuntimeResult<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| RuntimeError::WireProtocol(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse a response line and verify it answers `expected_corr`.
    pub fn decode(line: &str, expected_corr: &str) -> RuntimeResult<Self> {
        let response: WireResponse = serde_json::from_str(line.trim())
            .map_err(|e| RuntimeError::WireProtocol(format!("Malformed response: {e}")))?;
        if response.corr != expected_corr {
            return Err(RuntimeError::WireProtocol(format!(
                "Correlation mismatch: expected {expected_corr}, got {}",
                response.corr
            )));
        }
        if response.ok && response.result.is_none() {
            return Err(RuntimeError::WireProtocol(
                "ok response without result".to_string(),
            ));
        }
        if !response.ok && response.error.is_none() {
            return Err(RuntimeError::WireProtocol(
                "error response without error".to_string(),
            ));
        }
        Ok(response)
    }
}

/// Parse a request line, as the plugin runner does.
pub fn decode_request(line: &str) -> RuntimeResult<WireRequest> {
    let request: WireRequest = serde_json::from_str(line.trim())
        .map_err(|e| RuntimeError::WireProtocol(format!("Malformed request: {e}")))?;
    if request.op != "execute" {
        return Err(RuntimeError::WireProtocol(format!(
            "Unknown op: {}",
            request.op
        )));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = WireRequest::execute("c-1", json!({"n": 3}), 5000);
        let line = request.encode().unwrap();
        assert!(line.ends_with('\n'));

        let decoded = decode_request(&line).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_unknown_op_rejected() {
        let line = r#"{"corr":"c-1","op":"shutdown","input":null,"deadline_ms":100}"#;
        assert!(decode_request(line).is_err());
    }

    #[test]
    fn test_response_round_trip() {
        let response = WireResponse::success("c-2", json!(6)).with_metric("duration_ms", 12.0);
        let line = response.encode().unwrap();
        let decoded = WireResponse::decode(&line, "c-2").unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_correlation_mismatch() {
        let line = WireResponse::success("c-3", json!(1)).encode().unwrap();
        let err = WireResponse::decode(&line, "c-9").unwrap_err();
        assert!(err.to_string().contains("Correlation mismatch"));
    }

    #[test]
    fn test_contract_violations() {
        // ok without result
        let err = WireResponse::decode(r#"{"corr":"c","ok":true}"#, "c").unwrap_err();
        assert!(err.to_string().contains("without result"));

        // error without message
        let err = WireResponse::decode(r#"{"corr":"c","ok":false}"#, "c").unwrap_err();
        assert!(err.to_string().contains("without error"));
    }
}
