//! JSON record codec.
//!
//! Both the local publish path and the cross-broker bridge serialize through
//! [`encode_record`], so a sink on a foreign broker receives byte-identical
//! payloads to a same-broker sink.

use flowgate_types::Result;

pub fn encode_record(value: &serde_json::Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_record(payload: &[u8]) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_compact_json() {
        let bytes = encode_record(&json!({"v": 4})).unwrap();
        assert_eq!(bytes, br#"{"v":4}"#);
    }

    #[test]
    fn decode_rejects_non_json() {
        let err = decode_record(b"not json").unwrap_err();
        assert!(matches!(err, flowgate_types::FlowgateError::Json(_)));
    }
}
