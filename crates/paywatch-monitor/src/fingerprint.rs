//! Content fingerprints for delivery deduplication.
//!
//! A fingerprint is the lowercase hex SHA-256 of
//! `provider \n kind \n canonical payload`. JSON payloads are canonicalized
//! with sorted object keys and no insignificant whitespace, so a provider
//! retry that re-serializes the same document collapses onto the original.
//! Anything that does not parse as JSON is hashed as raw bytes.

use paywatch_core::ProviderName;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes the dedup fingerprint of a delivery.
pub fn fingerprint(provider: &ProviderName, webhook_kind: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(webhook_kind.as_bytes());
    hasher.update(b"\n");

    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => {
            let mut canonical = String::with_capacity(payload.len());
            write_canonical(&value, &mut canonical);
            hasher.update(canonical.as_bytes());
        },
        Err(_) => hasher.update(payload),
    }

    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blockbee() -> ProviderName {
        ProviderName::parse("blockbee").unwrap()
    }

    #[test]
    fn key_order_and_whitespace_do_not_matter() {
        let a = fingerprint(&blockbee(), "payment", br#"{"txid":"abc","value":10}"#);
        let b = fingerprint(&blockbee(), "payment", b"{ \"value\": 10,\n \"txid\": \"abc\" }");
        assert_eq!(a, b);
    }

    #[test]
    fn nested_objects_are_canonicalized() {
        let a = fingerprint(&blockbee(), "payment", br#"{"meta":{"b":1,"a":[{"y":2,"x":1}]}}"#);
        let b = fingerprint(&blockbee(), "payment", br#"{"meta":{"a":[{"x":1,"y":2}],"b":1}}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn provider_and_kind_are_part_of_the_fingerprint() {
        let payload = br#"{"txid":"abc"}"#;
        let dynopay = ProviderName::parse("dynopay").unwrap();
        assert_ne!(
            fingerprint(&blockbee(), "payment", payload),
            fingerprint(&dynopay, "payment", payload)
        );
        assert_ne!(
            fingerprint(&blockbee(), "payment", payload),
            fingerprint(&blockbee(), "refund", payload)
        );
    }

    #[test]
    fn array_order_matters() {
        let a = fingerprint(&blockbee(), "payment", b"[1,2]");
        let b = fingerprint(&blockbee(), "payment", b"[2,1]");
        assert_ne!(a, b);
    }

    #[test]
    fn non_json_payloads_hash_raw_bytes() {
        let a = fingerprint(&blockbee(), "payment", b"txid=abc&value=10");
        let b = fingerprint(&blockbee(), "payment", b"txid=abc&value=10");
        let c = fingerprint(&blockbee(), "payment", b"value=10&txid=abc");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
