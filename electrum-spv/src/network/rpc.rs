//! JSON-RPC 2.0 message framing for the Electrum protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

/// Error object carried by a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// A decoded message received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
    /// Servers are not expected to send requests; the session treats this as fatal.
    Request {
        method: String,
    },
}

pub fn encode_request(id: u64, method: &str, params: &[Value]) -> serde_json::Result<String> {
    serde_json::to_string(&Request {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })
}

/// Decode one line, which may hold a single message or a batch.
pub fn decode_line(line: &str) -> Result<Vec<Incoming>, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
    match value {
        Value::Array(batch) => batch.into_iter().map(decode_message).collect(),
        other => decode_message(other).map(|message| vec![message]),
    }
}

fn decode_message(value: Value) -> Result<Incoming, String> {
    let mut object = match value {
        Value::Object(object) => object,
        other => return Err(format!("expected a JSON object, got {}", other)),
    };

    if let Some(method) = object.remove("method") {
        let method = match method {
            Value::String(method) => method,
            other => return Err(format!("method is not a string: {}", other)),
        };
        if object.get("id").is_some_and(|id| !id.is_null()) {
            return Ok(Incoming::Request {
                method,
            });
        }
        let params = match object.remove("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(other) => return Err(format!("notification params must be a list: {}", other)),
        };
        return Ok(Incoming::Notification {
            method,
            params,
        });
    }

    let id = object
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("response without a usable id: {}", Value::Object(object.clone())))?;

    if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
        return Ok(Incoming::Response {
            id,
            result: Err(parse_error(error)),
        });
    }
    match object.remove("result") {
        Some(result) => Ok(Incoming::Response {
            id,
            result: Ok(result),
        }),
        None => Err(format!("response {} has neither result nor error", id)),
    }
}

fn parse_error(error: Value) -> RpcError {
    serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| RpcError {
        code: 0,
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_request() {
        let line = encode_request(7, "blockchain.block.header", &[json!(100)]).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 7, "method": "blockchain.block.header", "params": [100]})
        );
    }

    #[test]
    fn test_decode_response_and_error() {
        let messages = decode_line(r#"{"jsonrpc":"2.0","id":3,"result":{"height":5}}"#).unwrap();
        assert_eq!(
            messages,
            vec![Incoming::Response {
                id: 3,
                result: Ok(json!({"height": 5}))
            }]
        );

        let messages =
            decode_line(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-103,"message":"busy"}}"#).unwrap();
        assert_eq!(
            messages,
            vec![Incoming::Response {
                id: 4,
                result: Err(RpcError {
                    code: -103,
                    message: "busy".into()
                })
            }]
        );
    }

    #[test]
    fn test_decode_notification_and_request() {
        let messages = decode_line(
            r#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[{"height":9,"hex":"00"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            &messages[0],
            Incoming::Notification { method, params } if method == "blockchain.headers.subscribe" && params.len() == 1
        ));

        let messages = decode_line(r#"{"jsonrpc":"2.0","id":1,"method":"server.ping","params":[]}"#).unwrap();
        assert_eq!(
            messages,
            vec![Incoming::Request {
                method: "server.ping".into()
            }]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line("42").is_err());
        assert!(decode_line(r#"{"jsonrpc":"2.0","id":"abc","result":1}"#).is_err());
        assert!(decode_line(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn test_decode_batch() {
        let messages = decode_line(r#"[{"id":1,"result":true},{"id":2,"result":false}]"#).unwrap();
        assert_eq!(messages.len(), 2);
    }
}
