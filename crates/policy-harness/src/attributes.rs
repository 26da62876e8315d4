// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribute bags carried by Check and Report calls, and the predicate used to compare a recorded
//! bag against an expected JSON object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

const STRICT_KEY: &str = "__strict__";
const WILDCARD: &str = "*";

/// A single typed attribute value.
///
/// Wire form is an externally tagged JSON object, e.g. `{"string": "http"}` or `{"int64": 200}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Int64(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int64(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Bytes(b) => write!(f, "{b:?}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Mapping from attribute name to typed value, decoded from one control-plane call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag {
    attributes: BTreeMap<String, AttributeValue>,
}

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }
}

impl fmt::Display for AttributeBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kvs = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<String>>();
        write!(f, "{{{}}}", kvs.join(", "))
    }
}

/// Compares a recorded bag against the expected attributes.
pub trait BagVerifier {
    fn verify(&self, bag: &AttributeBag, expected: &str) -> Result<(), String>;
}

/// Default [`BagVerifier`]: the expectation is a JSON object whose entries must all be present in
/// the bag.
///
/// * `"*"` matches any value.
/// * JSON strings match `String` values, and also `Int64`/`Bool` values whose text form is equal.
/// * JSON integers match `Int64`, booleans match `Bool`, arrays of bytes match `Bytes`.
/// * Bag entries the expectation doesn't mention are ignored unless it sets `"__strict__": true`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBagVerifier;

impl BagVerifier for JsonBagVerifier {
    fn verify(&self, bag: &AttributeBag, expected: &str) -> Result<(), String> {
        let expectation: Value = serde_json::from_str(expected)
            .map_err(|e| format!("expected attributes are not valid JSON: {e}"))?;
        let Value::Object(expectation) = expectation else {
            return Err("expected attributes must be a JSON object".to_string());
        };

        let strict = matches!(expectation.get(STRICT_KEY), Some(Value::Bool(true)));

        for (name, expected_value) in expectation
            .iter()
            .filter(|(k, _)| k.as_str() != STRICT_KEY)
        {
            let Some(actual) = bag.get(name) else {
                return Err(format!("attribute {name} is missing"));
            };
            if !value_matches(actual, expected_value) {
                return Err(format!(
                    "attribute {name}: {actual}, expected: {expected_value}"
                ));
            }
        }

        if strict {
            if let Some((name, _)) = bag
                .iter()
                .find(|(k, _)| !expectation.contains_key(k.as_str()))
            {
                return Err(format!("unexpected attribute {name}"));
            }
        }
        Ok(())
    }
}

fn value_matches(actual: &AttributeValue, expected: &Value) -> bool {
    if expected.as_str() == Some(WILDCARD) {
        return true;
    }
    match (actual, expected) {
        (AttributeValue::String(a), Value::String(e)) => a == e,
        (AttributeValue::Int64(a), Value::String(e)) => a.to_string() == *e,
        (AttributeValue::Bool(a), Value::String(e)) => a.to_string() == *e,
        (AttributeValue::Int64(a), Value::Number(e)) => e.as_i64() == Some(*a),
        (AttributeValue::Bool(a), Value::Bool(e)) => a == e,
        (AttributeValue::Bytes(a), Value::Array(e)) => {
            a.len() == e.len()
                && a
                    .iter()
                    .zip(e)
                    .all(|(byte, v)| v.as_u64() == Some(u64::from(*byte)))
        }
        _ => false,
    }
}
