use crate::model::KeyType;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// A key attribute definition (name + type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDefinition {
    pub name: CompactString,
    pub key_type: KeyType,
}

impl KeyDefinition {
    pub fn new(name: impl Into<CompactString>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }
}

/// What a secondary index projects into itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionKind {
    All,
    KeysOnly,
    Include(Vec<CompactString>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIndexDescription {
    pub name: CompactString,
    pub hash_key: KeyDefinition,
    pub range_key: Option<KeyDefinition>,
    pub projection: ProjectionKind,
}

/// A table as described by a client (virtual) or as hosted by the underlying
/// store (physical). Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: CompactString,
    pub hash_key: KeyDefinition,
    pub range_key: Option<KeyDefinition>,
    pub secondary_indexes: Vec<SecondaryIndexDescription>,
}

impl TableDescription {
    pub fn new(name: impl Into<CompactString>, hash_key: KeyDefinition) -> Self {
        Self {
            name: name.into(),
            hash_key,
            range_key: None,
            secondary_indexes: Vec::new(),
        }
    }

    pub fn with_range_key(mut self, range_key: KeyDefinition) -> Self {
        self.range_key = Some(range_key);
        self
    }

    pub fn with_secondary_index(mut self, index: SecondaryIndexDescription) -> Self {
        self.secondary_indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&SecondaryIndexDescription> {
        self.secondary_indexes.iter().find(|idx| idx.name == name)
    }

    pub fn with_name(mut self, name: impl Into<CompactString>) -> Self {
        self.name = name.into();
        self
    }
}

/// Lifecycle state of a physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    Creating,
    Active,
    Deleting,
}

/// A physical table as reported by the underlying store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalTableInfo {
    pub description: TableDescription,
    pub status: TableStatus,
}
