use std::collections::BTreeMap;

use proptest::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use warden_core::canonical::{canonicalize, CANONICAL_VERSION};

#[derive(Deserialize)]
struct Vector {
    name: String,
    value: Value,
    canonical: String,
}

fn vectors() -> Vec<Vector> {
    let raw = include_str!("vectors/canonical_vectors.json");
    serde_json::from_str(raw).expect("valid canonical vectors json")
}

#[test]
fn shared_vectors_match_contract() {
    assert_eq!(CANONICAL_VERSION, "warden-canon/1");
    for vector in vectors() {
        let bytes = canonicalize(&vector.value);
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            vector.canonical,
            "canonical mismatch for {}",
            vector.name
        );
    }
}

#[test]
fn key_order_vectors_agree() {
    let all = vectors();
    let find = |name: &str| {
        all.iter()
            .find(|v| v.name == name)
            .map(|v| canonicalize(&v.value))
            .expect("vector present")
    };
    assert_eq!(find("key_order_z_first"), find("key_order_a_first"));
}

#[test]
fn source_text_key_order_does_not_change_encoding() {
    let texts = [
        r#"{"z":[2,1],"a":{"y":true,"b":null},"m":1.5}"#,
        r#"{"a":{"b":null,"y":true},"m":1.5,"z":[2,1]}"#,
        r#"{ "m" : 1.5, "z" : [2, 1], "a" : { "y" : true, "b" : null } }"#,
    ];
    for text in texts {
        let value: Value = serde_json::from_str(text).expect("valid json");
        assert_eq!(
            String::from_utf8(canonicalize(&value)).expect("utf8"),
            r#"{"a":{"b":null,"y":true},"m":1.5,"z":[2,1]}"#,
            "input {text}"
        );
    }
}

#[test]
fn float_vectors_never_carry_plus_or_trailing_zero() {
    for vector in vectors() {
        let text = vector.canonical;
        assert!(!text.contains("e+"), "{}: {text}", vector.name);
        assert!(!text.contains(".0e"), "{}: {text}", vector.name);
    }
}

#[test]
fn canonical_output_reparses_to_the_same_value() {
    for vector in vectors() {
        let bytes = canonicalize(&vector.value);
        let reparsed: Value = serde_json::from_slice(&bytes).expect("canonical output is json");
        assert_eq!(
            canonicalize(&reparsed),
            bytes,
            "canonicalization not idempotent for {}",
            vector.name
        );
    }
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _\\-é]{0,8}".prop_map(Value::String),
    ]
}

fn json_value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..5)
                .prop_map(|m: BTreeMap<String, Value>| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Writes `value` as JSON text with every object's keys in descending order.
fn reversed_text(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| b.0.cmp(a.0));
            let fields: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}: {}", Value::String(k.clone()), reversed_text(v)))
                .collect();
            format!("{{ {} }}", fields.join(", "))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(reversed_text).collect();
            format!("[ {} ]", items.join(", "))
        }
        other => other.to_string(),
    }
}

proptest! {
    #[test]
    fn reordered_source_text_encodes_identically(value in json_value()) {
        let reparsed: Value = serde_json::from_str(&reversed_text(&value)).expect("valid json");
        prop_assert_eq!(canonicalize(&value), canonicalize(&reparsed));
    }

    #[test]
    fn different_values_encode_differently(a in json_value(), b in json_value()) {
        prop_assume!(a != b);
        prop_assert_ne!(canonicalize(&a), canonicalize(&b));
    }
}
