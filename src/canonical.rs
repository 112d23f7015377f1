//! JCS (RFC 8785) canonicalization and hashing helpers.
//!
//! Proposal payloads are canonicalized before signing; privilege bindings are
//! canonicalized before CRC32 checksumming to detect configuration drift.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonicalize a value using JCS (RFC 8785): object keys sorted lexicographically,
/// no whitespace, round-tripped through `serde_json::Value` so nested objects are
/// sorted too.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    canonicalize_value(&v)
}

fn canonicalize_value(value: &serde_json::Value) -> Result<String, serde_json::Error> {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let mut result = String::from("{");
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    result.push(',');
                }
                result.push_str(&serde_json::to_string(k)?);
                result.push(':');
                result.push_str(&canonicalize_value(v)?);
            }
            result.push('}');
            Ok(result)
        }
        serde_json::Value::Array(arr) => {
            let mut result = String::from("[");
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    result.push(',');
                }
                result.push_str(&canonicalize_value(v)?);
            }
            result.push(']');
            Ok(result)
        }
        _ => serde_json::to_string(value),
    }
}

pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = canonicalize(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stable CRC32 over a privilege binding's identifying fields, used to detect
/// configuration drift when reconciling.
pub fn checksum(parts: &[&str]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\0");
        }
        hasher.update(p.as_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize_value(&v).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn sorts_nested() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": []});
        assert_eq!(canonicalize_value(&v).unwrap(), r#"{"a":[],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn hash_is_deterministic() {
        let v = json!({"group": "g-1", "version": 1});
        assert_eq!(hash_canonical(&v).unwrap(), hash_canonical(&v).unwrap());
        assert_eq!(hash_canonical(&v).unwrap().len(), 64);
    }

    #[test]
    fn checksum_is_order_sensitive_and_stable() {
        let a = checksum(&["res", "role", "cond"]);
        let b = checksum(&["res", "role", "cond"]);
        let c = checksum(&["role", "res", "cond"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
