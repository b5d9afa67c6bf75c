use crate::error::MtdbError;
use crate::model::KeyType;
use crate::model::table::{SecondaryIndexDescription, TableDescription};

/// Picks the physical secondary index that will host a virtual one.
///
/// A physical index is compatible when its hash key is a string (composite
/// keys are always strings after encoding) and its range key matches the
/// virtual range key: identical type, or absent on both sides.
pub trait SecondaryIndexMapper: Send + Sync + std::fmt::Debug {
    fn resolve<'a>(
        &self,
        virtual_table: &TableDescription,
        virtual_index: &SecondaryIndexDescription,
        physical_table: &'a TableDescription,
    ) -> Result<&'a SecondaryIndexDescription, MtdbError>;
}

fn range_shape_matches(
    virtual_index: &SecondaryIndexDescription,
    physical_index: &SecondaryIndexDescription,
) -> bool {
    match (&virtual_index.range_key, &physical_index.range_key) {
        (None, None) => true,
        (Some(v), Some(p)) => v.key_type == p.key_type,
        _ => false,
    }
}

fn hash_compatible(physical_index: &SecondaryIndexDescription) -> bool {
    physical_index.hash_key.key_type == KeyType::S
}

/// Requires a physical index with the same name and a compatible key shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByNameIndexMapper;

impl SecondaryIndexMapper for ByNameIndexMapper {
    fn resolve<'a>(
        &self,
        virtual_table: &TableDescription,
        virtual_index: &SecondaryIndexDescription,
        physical_table: &'a TableDescription,
    ) -> Result<&'a SecondaryIndexDescription, MtdbError> {
        physical_table
            .index(&virtual_index.name)
            .filter(|physical| {
                hash_compatible(physical) && range_shape_matches(virtual_index, physical)
            })
            .ok_or_else(|| MtdbError::NoCompatibleIndex {
                table: virtual_table.name.to_string(),
                index: virtual_index.name.to_string(),
            })
    }
}

/// Picks any physical index whose key-type shape matches, preferring
/// hash-only physical indexes for hash-only virtual indexes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByTypeIndexMapper;

impl SecondaryIndexMapper for ByTypeIndexMapper {
    fn resolve<'a>(
        &self,
        virtual_table: &TableDescription,
        virtual_index: &SecondaryIndexDescription,
        physical_table: &'a TableDescription,
    ) -> Result<&'a SecondaryIndexDescription, MtdbError> {
        let exact = physical_table.secondary_indexes.iter().find(|physical| {
            hash_compatible(physical) && range_shape_matches(virtual_index, physical)
        });
        let fallback = || {
            virtual_index.range_key.is_none().then(|| {
                physical_table
                    .secondary_indexes
                    .iter()
                    .find(|physical| hash_compatible(physical))
            })?
        };
        exact
            .or_else(fallback)
            .ok_or_else(|| MtdbError::NoCompatibleIndex {
                table: virtual_table.name.to_string(),
                index: virtual_index.name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{ByNameIndexMapper, ByTypeIndexMapper, SecondaryIndexMapper};
    use crate::model::KeyType;
    use crate::model::table::{
        KeyDefinition, ProjectionKind, SecondaryIndexDescription, TableDescription,
    };

    fn index(
        name: &str,
        hash_type: KeyType,
        range: Option<KeyType>,
    ) -> SecondaryIndexDescription {
        SecondaryIndexDescription {
            name: name.into(),
            hash_key: KeyDefinition::new("ihk", hash_type),
            range_key: range.map(|t| KeyDefinition::new("irk", t)),
            projection: ProjectionKind::All,
        }
    }

    fn virtual_table() -> TableDescription {
        TableDescription::new("vt", KeyDefinition::new("hk", KeyType::S))
    }

    #[test]
    fn by_name_requires_matching_name_and_shape() {
        let physical = TableDescription::new("pt", KeyDefinition::new("hk", KeyType::S))
            .with_secondary_index(index("idx", KeyType::S, Some(KeyType::N)));

        let compatible = index("idx", KeyType::N, Some(KeyType::N));
        let resolved = ByNameIndexMapper
            .resolve(&virtual_table(), &compatible, &physical)
            .expect("resolve");
        assert_eq!(resolved.name, "idx");

        let wrong_range = index("idx", KeyType::S, None);
        assert!(
            ByNameIndexMapper
                .resolve(&virtual_table(), &wrong_range, &physical)
                .is_err()
        );

        let wrong_name = index("other", KeyType::S, Some(KeyType::N));
        assert!(
            ByNameIndexMapper
                .resolve(&virtual_table(), &wrong_name, &physical)
                .is_err()
        );
    }

    #[test]
    fn by_type_prefers_hash_only_for_hash_only() {
        let physical = TableDescription::new("pt", KeyDefinition::new("hk", KeyType::S))
            .with_secondary_index(index("with_range", KeyType::S, Some(KeyType::S)))
            .with_secondary_index(index("hash_only", KeyType::S, None));

        let resolved = ByTypeIndexMapper
            .resolve(&virtual_table(), &index("v", KeyType::N, None), &physical)
            .expect("resolve");
        assert_eq!(resolved.name, "hash_only");
    }

    #[test]
    fn by_type_rejects_when_no_string_hash_exists() {
        let physical = TableDescription::new("pt", KeyDefinition::new("hk", KeyType::S))
            .with_secondary_index(index("numeric_hash", KeyType::N, None));
        assert!(
            ByTypeIndexMapper
                .resolve(&virtual_table(), &index("v", KeyType::S, None), &physical)
                .is_err()
        );
    }
}
