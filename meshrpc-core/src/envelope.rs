//! RPC envelopes exchanged on the wire (§6 reference codec).
//!
//! ```json
//! request:  { "id": <u32>, "method": "<name>", "params": [<alpha-ordered args>] }
//! response: { "id": <u32>, "result": <any> }  OR  { "id": <u32>, "error": {...} }
//! push:     { "id": 0,     "method": "<name>", "params": [...] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::NOTIFICATION_ID;
use crate::error::ErrorPayload;

/// A request or push envelope. `id == 0` marks a notification (P+S push);
/// no response is expected and none should be sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RequestEnvelope {
    pub fn is_notification(&self) -> bool {
        self.id == NOTIFICATION_ID
    }

    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: NOTIFICATION_ID,
            method: method.into(),
            params,
        }
    }

    pub fn request(id: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// A response envelope. Exactly one of `result`/`error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponseEnvelope {
    pub fn ok(id: u32, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u32, error: ErrorPayload) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, crate::error::Error> {
        if let Some(e) = self.error {
            Err(crate::error::Error::from_payload(e))
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// A decoded wire message is either a request/push or a response; the
/// reader distinguishes by presence of `method` vs `result`/`error`.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl WireMessage {
    pub fn from_value(value: Value) -> crate::error::Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| crate::error::Error::DecodeFailed("expected object".into()))?;
        if obj.contains_key("method") {
            Ok(WireMessage::Request(serde_json::from_value(value)?))
        } else {
            Ok(WireMessage::Response(serde_json::from_value(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = RequestEnvelope::request(7, "_hb", vec![Value::String("x".into())]);
        let v = serde_json::to_value(&req).unwrap();
        let decoded = WireMessage::from_value(v).unwrap();
        match decoded {
            WireMessage::Request(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.method, "_hb");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn response_error_roundtrip() {
        let resp = ResponseEnvelope::err(
            3,
            ErrorPayload {
                code: 401,
                message: "nope".into(),
            },
        );
        let v = serde_json::to_value(&resp).unwrap();
        let decoded = WireMessage::from_value(v).unwrap();
        match decoded {
            WireMessage::Response(r) => {
                assert!(r.result.is_none());
                assert_eq!(r.error.unwrap().code, 401);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn notification_has_zero_id() {
        let push = RequestEnvelope::notification("kv", vec![]);
        assert!(push.is_notification());
    }
}
