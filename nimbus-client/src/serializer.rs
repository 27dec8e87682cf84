use std::collections::HashMap;

use nimbus_common::NimbusError;
use serde_json::Value;

/// The external codec boundary. This core only ever sees an opaque value
/// tree going in and coming out; how that tree is encoded on the wire (CBOR
/// in the platform's own clients) is entirely up to the implementation the
/// caller supplies.
///
/// `format_tag` must match one of a function handle's
/// `supported_input_formats` or the invocation is rejected locally before
/// any RPC is made (see [`crate::function::Function::remote`]).
pub trait Serializer: Send + Sync {
    fn format_tag(&self) -> &'static str;

    fn encode_call(
        &self,
        args: &[Value],
        kwargs: &HashMap<String, Value>,
    ) -> Result<Vec<u8>, NimbusError>;

    fn decode_result(&self, bytes: &[u8]) -> Result<Value, NimbusError>;
}

/// A JSON-backed stand-in implementation, useful for tests and for callers
/// that don't need wire compatibility with the platform's other language
/// clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format_tag(&self) -> &'static str {
        "json"
    }

    fn encode_call(&self, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Vec<u8>, NimbusError> {
        serde_json::to_vec(&(args, kwargs))
            .map_err(|error| NimbusError::InvalidArgument(format!("failed to encode call arguments: {error}")))
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<Value, NimbusError> {
        serde_json::from_slice(bytes)
            .map_err(|error| NimbusError::Internal(format!("failed to decode function result: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn round_trips_through_json() {
        let serializer = JsonSerializer;
        let args = vec![Value::from(1), Value::from("two")];
        let kwargs = HashMap::from([("k".to_string(), Value::from(true))]);
        let encoded = serializer.encode_call(&args, &kwargs).unwrap();
        let decoded: (Vec<Value>, HashMap<String, Value>) = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.0, args);
        assert_eq!(decoded.1, kwargs);
    }
}
