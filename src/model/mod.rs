pub mod request;
pub mod stream;
pub mod table;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An item: attribute name to value.
pub type Item = BTreeMap<CompactString, AttributeValue>;

/// Substitution map for `#name` placeholders in expressions.
pub type NameMap = BTreeMap<CompactString, CompactString>;

/// Substitution map for `:val` placeholders in expressions.
pub type ValueMap = BTreeMap<CompactString, AttributeValue>;

/// The type of a key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    S,
    N,
    B,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::S => "S",
            KeyType::N => "N",
            KeyType::B => "B",
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attribute value in the store's wire model. Numbers stay textual
/// lexemes, as on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttributeValue {
    S(CompactString),
    N(CompactString),
    B(Vec<u8>),
    Bool(bool),
    Null,
    L(Vec<AttributeValue>),
    M(BTreeMap<CompactString, AttributeValue>),
}

impl AttributeValue {
    pub fn s(value: impl Into<CompactString>) -> Self {
        AttributeValue::S(value.into())
    }

    pub fn n(value: impl Into<CompactString>) -> Self {
        AttributeValue::N(value.into())
    }

    pub fn b(value: impl Into<Vec<u8>>) -> Self {
        AttributeValue::B(value.into())
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_n(&self) -> Option<&str> {
        match self {
            AttributeValue::N(n) => Some(n.as_str()),
            _ => None,
        }
    }

    pub fn as_b(&self) -> Option<&[u8]> {
        match self {
            AttributeValue::B(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// The key type of this value, if it is usable as a key attribute.
    pub fn key_type(&self) -> Option<KeyType> {
        match self {
            AttributeValue::S(_) => Some(KeyType::S),
            AttributeValue::N(_) => Some(KeyType::N),
            AttributeValue::B(_) => Some(KeyType::B),
            _ => None,
        }
    }

    /// Wire type tag, as accepted by `attribute_type`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            AttributeValue::S(_) => "S",
            AttributeValue::N(_) => "N",
            AttributeValue::B(_) => "B",
            AttributeValue::Bool(_) => "BOOL",
            AttributeValue::Null => "NULL",
            AttributeValue::L(_) => "L",
            AttributeValue::M(_) => "M",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeValue, KeyType};

    #[test]
    fn key_type_of_scalar_values() {
        assert_eq!(AttributeValue::s("a").key_type(), Some(KeyType::S));
        assert_eq!(AttributeValue::n("1").key_type(), Some(KeyType::N));
        assert_eq!(AttributeValue::b(vec![1u8]).key_type(), Some(KeyType::B));
        assert_eq!(AttributeValue::Bool(true).key_type(), None);
        assert_eq!(AttributeValue::Null.key_type(), None);
    }

    #[test]
    fn type_tags_are_wire_shaped() {
        assert_eq!(AttributeValue::s("a").type_tag(), "S");
        assert_eq!(AttributeValue::L(vec![]).type_tag(), "L");
        assert_eq!(AttributeValue::Null.type_tag(), "NULL");
    }
}
