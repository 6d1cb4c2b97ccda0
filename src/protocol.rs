//! Wire contract types
//!
//! The decoded representation of one engine event, the outbound command set,
//! and the interception-result payload sent back when a prefix event has
//! been intercepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered parameter map of one event
///
/// Values are dynamically typed JSON (`null`, boolean, number, string,
/// array, or nested object); key order follows the wire payload.
pub type ParamMap = serde_json::Map<String, Value>;

/// One decoded engine event: a name plus its parameter map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `MethodCall`
    pub name: String,
    /// Event parameters as decoded from the frame body
    pub params: ParamMap,
}

/// Outbound control messages to the engine
///
/// Commands are fire-and-forget: no acknowledgement is awaited.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask the engine to begin streaming events to this client
    Start,
    /// Ask the engine to stop streaming events to this client
    Stop,
    /// Answer to an intercepted prefix event
    InterceptionResult(InterceptionResult),
}

impl Command {
    /// Encode to the exact outbound wire text (unterminated ASCII)
    pub fn encode(&self) -> String {
        match self {
            Command::Start => "START".to_string(),
            Command::Stop => "STOP".to_string(),
            Command::InterceptionResult(result) => format!(
                "INTERCEPTION_RESULT:{}",
                serde_json::to_string(result).unwrap_or_default()
            ),
        }
    }
}

/// Payload of an `INTERCEPTION_RESULT` command
///
/// An empty entry list tells the engine to suppress the underlying action;
/// a non-empty list carries the (possibly rewritten) parameters to commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptionResult {
    /// Name of the intercepted event
    pub event: String,
    /// The parameters the engine should commit
    pub params: ParamEntries,
}

/// Entry-list wrapper the engine expects around interception parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntries {
    pub entries: Vec<ParamEntry>,
}

/// One `{key, value}` interception parameter, value coerced to text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub key: String,
    pub value: String,
}

impl InterceptionResult {
    /// Wrap a parameter map as the engine's entry list
    ///
    /// Values are coerced to text: strings contribute their content,
    /// everything else its compact JSON rendering.
    pub fn new(event: &str, params: &ParamMap) -> Self {
        Self {
            event: event.to_string(),
            params: ParamEntries {
                entries: params
                    .iter()
                    .map(|(key, value)| ParamEntry {
                        key: key.clone(),
                        value: coerce_value(value),
                    })
                    .collect(),
            },
        }
    }
}

/// Textual coercion for interception-result values
fn coerce_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_start_stop() {
        assert_eq!(Command::Start.encode(), "START");
        assert_eq!(Command::Stop.encode(), "STOP");
    }

    #[test]
    fn test_encode_interception_result_empty() {
        let result = InterceptionResult::new("MethodCall", &ParamMap::new());
        let command = Command::InterceptionResult(result);
        assert_eq!(
            command.encode(),
            r#"INTERCEPTION_RESULT:{"event":"MethodCall","params":{"entries":[]}}"#
        );
    }

    #[test]
    fn test_interception_result_preserves_entry_order() {
        let mut params = ParamMap::new();
        params.insert("Method".to_string(), json!("Foo"));
        params.insert("Arg".to_string(), json!(1));

        let result = InterceptionResult::new("MethodCall", &params);
        let keys: Vec<&str> = result
            .params
            .entries
            .iter()
            .map(|e| e.key.as_str())
            .collect();
        assert_eq!(keys, ["Method", "Arg"]);
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(coerce_value(&json!("plain")), "plain");
        assert_eq!(coerce_value(&json!(42)), "42");
        assert_eq!(coerce_value(&json!(true)), "true");
        assert_eq!(coerce_value(&json!(null)), "null");
        assert_eq!(coerce_value(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_interception_result_serde_shape() {
        let mut params = ParamMap::new();
        params.insert("Method".to_string(), json!("Foo"));

        let result = InterceptionResult::new("MethodCall", &params);
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(
            json,
            r#"{"event":"MethodCall","params":{"entries":[{"key":"Method","value":"Foo"}]}}"#
        );
    }
}
