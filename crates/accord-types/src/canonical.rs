//! Canonical encoding for Accord messages
//!
//! The byte sequence fed to both Ed25519 signing and the continuity hash is a
//! deterministic JSON serialization: object keys in lexicographic order, no
//! insignificant whitespace. `serde_json::Map` preserves insertion order, so
//! objects are re-sorted here rather than trusting the producer.

use serde_json::Value;

/// Serialize a JSON value to its canonical byte form.
pub fn to_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out);
    out
}

/// Canonical form as a string, for diagnostics and tests.
pub fn to_string(value: &Value) -> String {
    // write_value only emits output produced by serde_json, which is UTF-8
    String::from_utf8(to_bytes(value)).unwrap_or_default()
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            // serde_json's string escaping is already deterministic
            match serde_json::to_vec(s) {
                Ok(encoded) => out.extend_from_slice(&encoded),
                Err(_) => out.extend_from_slice(b"\"\""),
            }
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                match serde_json::to_vec(key) {
                    Ok(encoded) => out.extend_from_slice(&encoded),
                    Err(_) => out.extend_from_slice(b"\"\""),
                }
                out.push(b':');
                write_value(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}
