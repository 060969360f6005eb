use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// Decimal places kept when a float participates in a requirement hash.
const FLOAT_PRECISION: usize = 8;

/// A dynamically-typed datum flowing between tasks.
///
/// Producers receive their resolved requirements as `Value`s and return a
/// `Value`. The engine never inspects the payload beyond hashing it for
/// change detection, so any shape expressible with this enum can travel
/// through the graph.
///
/// `Value::None` doubles as "the producer returned nothing" and as the
/// pre-seeded null sentinel (see [`crate::Graph::resolve`]).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Serialize the value to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize a value from a JSON string.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Writes the canonical form used for requirement hashing.
    ///
    /// Floats are rounded to a fixed precision, maps are rendered in sorted
    /// key order, sequences element-wise with order preserved. `None`
    /// contributes nothing, so an optional requirement left unset does not
    /// disturb the digest.
    pub(crate) fn write_normalized(&self, out: &mut String) {
        match self {
            Value::None => {}
            Value::Bool(value) => {
                let _ = write!(out, "{value}");
            }
            Value::Int(value) => {
                let _ = write!(out, "{value}");
            }
            Value::Float(value) => {
                let _ = write!(out, "{value:.prec$}", prec = FLOAT_PRECISION);
            }
            Value::Str(value) => out.push_str(value),
            Value::Seq(items) => {
                out.push('[');
                for item in items {
                    item.write_normalized(out);
                    out.push(',');
                }
                out.push(']');
            }
            Value::Map(map) => {
                out.push('{');
                for (key, value) in map {
                    out.push_str(key);
                    out.push('=');
                    value.write_normalized(out);
                    out.push(';');
                }
                out.push('}');
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Value::None,
        }
    }
}

/// A 32-byte BLAKE3 hash used for change detection.
///
/// Every `Computed` task stores the digest of its normalized dependency
/// values at the last successful run; a matching digest on the next run
/// means the stored value can be trusted without calling the producer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Digest of an ordered slice of dependency values.
///
/// The canonical forms are concatenated with a separator so that adjacent
/// values cannot blend into each other.
pub(crate) fn hash_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Hash32 {
    let mut acc = String::new();

    for value in values {
        value.write_normalized(&mut acc);
        acc.push('|');
    }

    Hash32::hash(acc)
}

/// Run-wide configuration shared by every task.
///
/// This is a string-keyed bag of [`Value`]s, mirrored onto restored tasks
/// when a checkpoint is loaded, plus the switches that alter engine
/// behavior for a whole run.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, Value>,
    /// Force producers of checkpoint-restored tasks to run again even when
    /// their requirement hash still matches.
    pub rerun_cached: bool,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a configuration variable, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Look up a configuration variable.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_normalization_is_rounded() {
        let a = Value::Float(0.123456789123);
        let b = Value::Float(0.123456789456);

        assert_eq!(hash_values([&a]), hash_values([&b]));

        let c = Value::Float(0.12345777);
        assert_ne!(hash_values([&a]), hash_values([&c]));
    }

    #[test]
    fn test_map_hash_ignores_insertion_order() {
        let mut first = BTreeMap::new();
        first.insert("a".to_string(), Value::Int(1));
        first.insert("b".to_string(), Value::Int(2));

        let mut second = BTreeMap::new();
        second.insert("b".to_string(), Value::Int(2));
        second.insert("a".to_string(), Value::Int(1));

        assert_eq!(
            hash_values([&Value::Map(first)]),
            hash_values([&Value::Map(second)]),
        );
    }

    #[test]
    fn test_seq_hash_preserves_order() {
        let a = Value::Seq(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::Seq(vec![Value::Int(2), Value::Int(1)]);

        assert_ne!(hash_values([&a]), hash_values([&b]));
    }

    #[test]
    fn test_none_contributes_nothing() {
        let mut acc = String::new();
        Value::None.write_normalized(&mut acc);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_adjacent_values_do_not_blend() {
        let a = [Value::Str("ab".into()), Value::Str("c".into())];
        let b = [Value::Str("a".into()), Value::Str("bc".into())];

        assert_ne!(hash_values(a.iter()), hash_values(b.iter()));
    }

    #[test]
    fn test_value_json_round_trip() {
        let value = Value::Seq(vec![Value::Int(1), Value::Str("two".into())]);
        let json = value.to_json().unwrap();
        assert_eq!(Value::from_json(&json).unwrap(), value);
    }
}
