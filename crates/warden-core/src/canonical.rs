//! Deterministic byte encoding for anything that is hashed or signed.
//!
//! Output is compact JSON: object keys sorted by their UTF-8 bytes, arrays in
//! original order, strings with standard JSON escaping and no whitespace.
//! Numbers follow the `warden-canon/1` convention:
//!
//! - integers print in plain decimal;
//! - finite floats that are integral with magnitude below 2^53 print as
//!   integers (`1.0` -> `1`, `-0.0` -> `0`);
//! - every other float prints in its shortest round-trip form with no
//!   trailing `.0` (`0.1`, `1e-7`, `1e21`).
//!
//! The shared vector file `tests/vectors/canonical_vectors.json` is the binding
//! definition of this encoding. Any change here must bump [`CANONICAL_VERSION`].

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::error::{WardenError, WardenResult};

pub const CANONICAL_VERSION: &str = "warden-canon/1";

const MAX_EXACT_INTEGER_F64: f64 = 9_007_199_254_740_992.0;

pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_value(&mut out, value);
    out
}

pub fn canonicalize_serialize<T: Serialize + ?Sized>(value: &T) -> WardenResult<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| WardenError::validation(format!("value is not JSON-representable: {e}")))?;
    Ok(canonicalize(&value))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

pub fn canonical_hash_hex(value: &Value) -> String {
    sha256_hex(&canonicalize(value))
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_str(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Map iteration order depends on serde_json features; sort explicitly.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_str(out, k);
                out.push(b':');
                write_value(out, v);
            }
            out.push(b'}');
        }
    }
}

fn write_number(out: &mut Vec<u8>, n: &Number) {
    if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
        return;
    }
    if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
        return;
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER_F64 => {
            out.extend_from_slice((f as i64).to_string().as_bytes());
        }
        Some(f) if f.is_finite() => {
            out.extend_from_slice(shortest_float(f).as_bytes());
        }
        _ => out.extend_from_slice(n.to_string().as_bytes()),
    }
}

/// Shortest round-trip form of a finite float, in the `warden-canon/1`
/// spelling: no trailing `.0`, no `+` in the exponent.
fn shortest_float(f: f64) -> String {
    let mut buf = ryu::Buffer::new();
    let raw = buf.format_finite(f);
    let (mantissa, exponent) = match raw.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e.trim_start_matches('+'))),
        None => (raw, None),
    };
    let mantissa = mantissa.strip_suffix(".0").unwrap_or(mantissa);
    match exponent {
        Some(e) => format!("{mantissa}e{e}"),
        None => mantissa.to_string(),
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    // Serializing a str into a Vec cannot fail.
    if serde_json::to_writer(&mut *out, s).is_err() {
        out.extend_from_slice(b"\"\"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(v: Value) -> String {
        String::from_utf8(canonicalize(&v)).unwrap()
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"z": [2, 1], "a": 1});
        let b = json!({"a": 1, "z": [2, 1]});
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canon(a), r#"{"a":1,"z":[2,1]}"#);
    }

    #[test]
    fn array_order_is_meaningful() {
        assert_ne!(
            canonicalize(&json!([1, 2])),
            canonicalize(&json!([2, 1]))
        );
    }

    #[test]
    fn integral_floats_print_as_integers() {
        assert_eq!(canon(json!(1.0)), "1");
        assert_eq!(canon(json!(-0.0)), "0");
        assert_eq!(canon(json!(42.0)), "42");
        assert_eq!(canon(json!(0.1)), "0.1");
        assert_eq!(canon(json!(-2.5)), "-2.5");
    }

    #[test]
    fn large_and_tiny_floats_use_bare_exponents() {
        assert_eq!(canon(json!(1e21)), "1e21");
        assert_eq!(canon(json!(1.5e300)), "1.5e300");
        assert_eq!(canon(json!(1e-7)), "1e-7");
        assert_eq!(canon(json!(-2.5e-300)), "-2.5e-300");
        assert_eq!(canon(json!(12.5)), "12.5");
    }

    #[test]
    fn float_at_exact_integer_limit_keeps_full_digits() {
        // 2^53 is outside the integer branch but still exact.
        assert_eq!(canon(json!(9_007_199_254_740_992.0_f64)), "9007199254740992");
        assert_eq!(canon(json!(1e16)), "1e16");
    }

    #[test]
    fn exponent_spelling_of_input_does_not_leak() {
        let a: Value = serde_json::from_str("1e+21").unwrap();
        let b: Value = serde_json::from_str("1E21").unwrap();
        assert_eq!(canon(a), "1e21");
        assert_eq!(canon(b), "1e21");
    }

    #[test]
    fn keys_sort_by_utf8_bytes() {
        let v = json!({"b": 1, "B": 2, "é": 3, "a": 4});
        assert_eq!(canon(v), "{\"B\":2,\"a\":4,\"b\":1,\"é\":3}");
    }

    #[test]
    fn strings_use_json_escaping_without_whitespace() {
        let v = json!({"msg": "line\nbreak \"quoted\" \t/"});
        assert_eq!(canon(v), r#"{"msg":"line\nbreak \"quoted\" \t/"}"#);
        assert_eq!(canon(json!("\u{0001}")), "\"\\u0001\"");
    }

    #[test]
    fn typed_values_canonicalize_like_their_json() {
        #[derive(Serialize)]
        struct Row {
            zeta: u32,
            alpha: &'static str,
        }
        let bytes = canonicalize_serialize(&Row {
            zeta: 7,
            alpha: "x",
        })
        .unwrap();
        assert_eq!(bytes, br#"{"alpha":"x","zeta":7}"#.to_vec());
    }

    #[test]
    fn hash_helpers_agree() {
        let v = json!({"a": 1});
        assert_eq!(canonical_hash_hex(&v), sha256_hex(br#"{"a":1}"#));
        assert_eq!(canonical_hash_hex(&v).len(), 64);
    }
}
