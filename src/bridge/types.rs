//! Messages crossing between the JS thread and the async runtime.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Error;

/// A store call issued by a script.
#[derive(Debug)]
pub(crate) struct StoreCall {
    /// `stores.<name>.<Method>`.
    pub process: String,
    /// JSON array of arguments.
    pub args: Vec<serde_json::Value>,
    pub reply_tx: std::sync::mpsc::Sender<CallReply>,
}

/// Outcome of a [`StoreCall`], as the script sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CallReply {
    Ok(serde_json::Value),
    Error { kind: String, message: String },
}

impl From<crate::error::Result<serde_json::Value>> for CallReply {
    fn from(result: crate::error::Result<serde_json::Value>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::from(&e),
        }
    }
}

impl From<&Error> for CallReply {
    fn from(e: &Error) -> Self {
        Self::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Sender half held by the JS thread.
pub(crate) struct StoreBridge {
    pub tx: mpsc::UnboundedSender<StoreCall>,
}

/// Result of a script run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptOutput {
    pub result: serde_json::Value,
    /// Store calls the script made.
    pub calls: usize,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_reply_wire_shape() {
        let ok = serde_json::to_value(CallReply::Ok(json!([1]))).unwrap();
        assert_eq!(ok, json!({"ok": [1]}));

        let err = CallReply::from(&Error::not_found("L"));
        assert_eq!(
            serde_json::to_value(err).unwrap(),
            json!({"error": {"kind": "NotFound", "message": "not found: L"}})
        );
    }
}
