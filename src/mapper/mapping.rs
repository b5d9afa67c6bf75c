use crate::error::MtdbError;
use crate::mapper::expression::{
    ExpressionRole, KeyPart, KeyedField, RewriteContext, RewrittenExpression, rewrite,
};
use crate::mapper::index::SecondaryIndexMapper;
use crate::mapper::key_codec::{KeyCodec, value_from_text};
use crate::model::request::{ComparisonOperator, KeyCondition};
use crate::model::table::{KeyDefinition, SecondaryIndexDescription, TableDescription};
use crate::model::{AttributeValue, Item, KeyType, NameMap, ValueMap};
use compact_str::CompactString;
use std::collections::BTreeMap;

/// How one virtual key attribute lands in the physical schema.
///
/// `is_hash_key` marks mappings whose physical attribute carries the
/// tenant-qualified composite; their values are encoded on the way in and
/// decoded on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub virtual_field: CompactString,
    pub physical_field: CompactString,
    pub virtual_type: KeyType,
    pub physical_type: KeyType,
    pub is_hash_key: bool,
    pub part: KeyPart,
}

/// How a virtual whole-table scan is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    /// The physical range key holds the virtual hash value, so a scan is a
    /// physical query on the tenant-qualified prefix.
    PrefixQuery,
    /// The composite lives in the physical hash key; a scan is a physical
    /// scan post-filtered by decoded prefix.
    FilteredScan,
}

/// The materialized translation plan for one `(tenant, virtual table)`.
/// Built lazily on first reference and cached by the façade until the
/// virtual table is dropped.
#[derive(Debug, Clone)]
pub struct TableMapping {
    tenant_id: CompactString,
    virtual_desc: TableDescription,
    physical_desc: TableDescription,
    fields: Vec<FieldMapping>,
    by_virtual: BTreeMap<CompactString, usize>,
    by_physical: BTreeMap<CompactString, usize>,
    /// Alias set handed to the expression rewriter, derived from `fields`.
    rewrite_fields: BTreeMap<CompactString, KeyedField>,
    index_names: BTreeMap<CompactString, CompactString>,
    codec: KeyCodec,
    scan: ScanStrategy,
    /// Physical hash attribute holding the bare prefix in `PrefixQuery`
    /// layout; `None` when the composite lives in the hash key itself.
    prefix_attr: Option<CompactString>,
}

impl TableMapping {
    pub fn build(
        tenant_id: &str,
        virtual_desc: &TableDescription,
        physical_desc: &TableDescription,
        index_mapper: &dyn SecondaryIndexMapper,
        codec: &KeyCodec,
    ) -> Result<Self, MtdbError> {
        let incompatible = |reason: String| MtdbError::IncompatibleSchema {
            table: virtual_desc.name.to_string(),
            physical: physical_desc.name.to_string(),
            reason,
        };

        if physical_desc.hash_key.key_type != KeyType::S {
            return Err(incompatible(format!(
                "physical hash key must be S, is {}",
                physical_desc.hash_key.key_type
            )));
        }

        let mut fields = Vec::new();
        let mut prefix_attr = None;
        let scan = match (&virtual_desc.range_key, &physical_desc.range_key) {
            (Some(virtual_range), Some(physical_range)) => {
                if virtual_range.key_type != physical_range.key_type {
                    return Err(incompatible(format!(
                        "range key type {} does not match physical {}",
                        virtual_range.key_type, physical_range.key_type
                    )));
                }
                fields.push(FieldMapping {
                    virtual_field: virtual_desc.hash_key.name.clone(),
                    physical_field: physical_desc.hash_key.name.clone(),
                    virtual_type: virtual_desc.hash_key.key_type,
                    physical_type: KeyType::S,
                    is_hash_key: true,
                    part: KeyPart::PrimaryHash,
                });
                fields.push(FieldMapping {
                    virtual_field: virtual_range.name.clone(),
                    physical_field: physical_range.name.clone(),
                    virtual_type: virtual_range.key_type,
                    physical_type: physical_range.key_type,
                    is_hash_key: false,
                    part: KeyPart::PrimaryRange,
                });
                ScanStrategy::FilteredScan
            }
            (Some(_), None) => {
                return Err(incompatible(
                    "virtual table has a range key but the physical table does not".to_string(),
                ));
            }
            (None, None) => {
                fields.push(FieldMapping {
                    virtual_field: virtual_desc.hash_key.name.clone(),
                    physical_field: physical_desc.hash_key.name.clone(),
                    virtual_type: virtual_desc.hash_key.key_type,
                    physical_type: KeyType::S,
                    is_hash_key: true,
                    part: KeyPart::PrimaryHash,
                });
                ScanStrategy::FilteredScan
            }
            (None, Some(physical_range)) => {
                // Hash-only virtual table on a range-keyed physical table:
                // the virtual hash value lands in the physical range key and
                // the physical hash key carries only the tenant prefix.
                if physical_range.key_type != virtual_desc.hash_key.key_type {
                    return Err(incompatible(format!(
                        "physical range key type {} cannot hold virtual hash type {}",
                        physical_range.key_type, virtual_desc.hash_key.key_type
                    )));
                }
                fields.push(FieldMapping {
                    virtual_field: virtual_desc.hash_key.name.clone(),
                    physical_field: physical_range.name.clone(),
                    virtual_type: virtual_desc.hash_key.key_type,
                    physical_type: physical_range.key_type,
                    is_hash_key: false,
                    part: KeyPart::PrimaryHash,
                });
                prefix_attr = Some(physical_desc.hash_key.name.clone());
                ScanStrategy::PrefixQuery
            }
        };

        let mut index_names = BTreeMap::new();
        for virtual_index in &virtual_desc.secondary_indexes {
            let physical_index =
                index_mapper.resolve(virtual_desc, virtual_index, physical_desc)?;
            index_names.insert(virtual_index.name.clone(), physical_index.name.clone());

            push_field(
                &mut fields,
                FieldMapping {
                    virtual_field: virtual_index.hash_key.name.clone(),
                    physical_field: physical_index.hash_key.name.clone(),
                    virtual_type: virtual_index.hash_key.key_type,
                    physical_type: physical_index.hash_key.key_type,
                    is_hash_key: true,
                    part: KeyPart::IndexHash,
                },
                virtual_desc,
                physical_desc,
            )?;
            if let (Some(virtual_range), Some(physical_range)) =
                (&virtual_index.range_key, &physical_index.range_key)
            {
                push_field(
                    &mut fields,
                    FieldMapping {
                        virtual_field: virtual_range.name.clone(),
                        physical_field: physical_range.name.clone(),
                        virtual_type: virtual_range.key_type,
                        physical_type: physical_range.key_type,
                        is_hash_key: false,
                        part: KeyPart::IndexRange,
                    },
                    virtual_desc,
                    physical_desc,
                )?;
            }
        }

        let mut by_virtual = BTreeMap::new();
        let mut by_physical = BTreeMap::new();
        let mut rewrite_fields = BTreeMap::new();
        for (i, field) in fields.iter().enumerate() {
            by_virtual.insert(field.virtual_field.clone(), i);
            by_physical.insert(field.physical_field.clone(), i);
            rewrite_fields.insert(
                field.virtual_field.clone(),
                KeyedField {
                    physical_name: field.physical_field.clone(),
                    virtual_type: field.virtual_type,
                    part: field.part,
                    encodes_composite: field.is_hash_key,
                },
            );
        }

        Ok(Self {
            tenant_id: tenant_id.into(),
            virtual_desc: virtual_desc.clone(),
            physical_desc: physical_desc.clone(),
            fields,
            by_virtual,
            by_physical,
            rewrite_fields,
            index_names,
            codec: codec.clone(),
            scan,
            prefix_attr,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn virtual_description(&self) -> &TableDescription {
        &self.virtual_desc
    }

    pub fn physical_description(&self) -> &TableDescription {
        &self.physical_desc
    }

    pub fn physical_table_name(&self) -> &str {
        &self.physical_desc.name
    }

    pub fn scan_strategy(&self) -> ScanStrategy {
        self.scan
    }

    pub fn field_mappings(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// Physical attribute holding the composite (or bare prefix) for this
    /// table's rows.
    pub fn physical_hash_attr(&self) -> &str {
        &self.physical_desc.hash_key.name
    }

    /// The tenant-qualified prefix every composite key of this table starts
    /// with.
    pub fn hash_prefix(&self) -> CompactString {
        self.codec
            .encode_prefix(&self.tenant_id, &self.virtual_desc.name)
    }

    fn field_by_virtual(&self, name: &str) -> Option<&FieldMapping> {
        self.by_virtual.get(name).map(|&i| &self.fields[i])
    }

    fn encode_field_value(
        &self,
        field: &FieldMapping,
        value: &AttributeValue,
    ) -> Result<AttributeValue, MtdbError> {
        if value.key_type() != Some(field.virtual_type) {
            return Err(MtdbError::Validation(format!(
                "attribute '{}' expects type {}, got {}",
                field.virtual_field,
                field.virtual_type,
                value.type_tag()
            )));
        }
        if field.is_hash_key {
            Ok(AttributeValue::S(self.codec.encode(
                &self.tenant_id,
                &self.virtual_desc.name,
                value,
            )?))
        } else {
            Ok(value.clone())
        }
    }

    /// Checks a decoded composite belongs to this mapping's tenant and
    /// table; every inverse translation checks it.
    fn owns(&self, tenant_id: &str, table_name: &str) -> bool {
        self.tenant_id == tenant_id && self.virtual_desc.name == table_name
    }

    /// Translates a virtual item into its physical shape. The input is
    /// never mutated.
    pub fn apply_to_item(&self, item: &Item) -> Result<Item, MtdbError> {
        let mut out = Item::new();
        for (name, value) in item {
            match self.field_by_virtual(name) {
                Some(field) => {
                    out.insert(
                        field.physical_field.clone(),
                        self.encode_field_value(field, value)?,
                    );
                }
                None => {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        if let Some(prefix_attr) = &self.prefix_attr {
            out.insert(prefix_attr.clone(), AttributeValue::S(self.hash_prefix()));
        }
        Ok(out)
    }

    /// Translates a physical item back into the virtual shape. Returns
    /// `None` when the item belongs to a different tenant or virtual table.
    pub fn invert_item(&self, item: &Item) -> Result<Option<Item>, MtdbError> {
        let mut out = Item::new();
        for (name, value) in item {
            if let Some(prefix_attr) = &self.prefix_attr
                && name == prefix_attr
            {
                let text = value.as_s().ok_or_else(|| MtdbError::Validation(
                    format!("physical hash attribute '{name}' is not a string"),
                ))?;
                let decoded = self.codec.decode(text)?;
                if !self.owns(&decoded.tenant_id, &decoded.table_name) {
                    return Ok(None);
                }
                continue;
            }
            let Some(&i) = self.by_physical.get(name.as_str()) else {
                out.insert(name.clone(), value.clone());
                continue;
            };
            let field = &self.fields[i];
            if field.is_hash_key {
                let text = value.as_s().ok_or_else(|| MtdbError::Validation(
                    format!("physical key attribute '{name}' is not a string"),
                ))?;
                let decoded = self.codec.decode(text)?;
                if !self.owns(&decoded.tenant_id, &decoded.table_name) {
                    return Ok(None);
                }
                out.insert(
                    field.virtual_field.clone(),
                    value_from_text(&decoded.value_text, field.virtual_type)?,
                );
            } else {
                out.insert(field.virtual_field.clone(), value.clone());
            }
        }
        Ok(Some(out))
    }

    /// Translates a virtual primary key into the physical one. Every
    /// primary-key attribute must be present.
    pub fn apply_to_key(&self, key: &Item) -> Result<Item, MtdbError> {
        let mut out = Item::new();
        for field in &self.fields {
            if !matches!(field.part, KeyPart::PrimaryHash | KeyPart::PrimaryRange) {
                continue;
            }
            let value = key.get(field.virtual_field.as_str()).ok_or_else(|| {
                MtdbError::Validation(format!(
                    "key is missing attribute '{}'",
                    field.virtual_field
                ))
            })?;
            out.insert(
                field.physical_field.clone(),
                self.encode_field_value(field, value)?,
            );
        }
        if let Some(prefix_attr) = &self.prefix_attr {
            out.insert(prefix_attr.clone(), AttributeValue::S(self.hash_prefix()));
        }
        for name in key.keys() {
            if self
                .field_by_virtual(name)
                .is_none_or(|f| !matches!(f.part, KeyPart::PrimaryHash | KeyPart::PrimaryRange))
            {
                return Err(MtdbError::Validation(format!(
                    "'{name}' is not a primary key attribute"
                )));
            }
        }
        Ok(out)
    }

    /// Inverse of [`TableMapping::apply_to_key`], for returned keys.
    pub fn invert_key(&self, key: &Item) -> Result<Option<Item>, MtdbError> {
        self.invert_item(key)
    }

    /// Rewrites one textual expression for the given role.
    pub fn rewrite_expression(
        &self,
        role: ExpressionRole,
        text: &str,
        names: Option<&NameMap>,
        values: Option<&ValueMap>,
    ) -> Result<RewrittenExpression, MtdbError> {
        let ctx = RewriteContext {
            fields: &self.rewrite_fields,
            codec: &self.codec,
            tenant_id: &self.tenant_id,
            table_name: &self.virtual_desc.name,
        };
        rewrite(&ctx, role, text, names, values)
    }

    /// Rewrites the structured key-conditions map. The hash key takes only
    /// equality; range keys take `=`, `>`, and `begins_with`.
    pub fn rewrite_key_conditions(
        &self,
        conditions: &BTreeMap<CompactString, KeyCondition>,
    ) -> Result<BTreeMap<CompactString, KeyCondition>, MtdbError> {
        let mut out = BTreeMap::new();
        for (attribute, condition) in conditions {
            let field = self.field_by_virtual(attribute).ok_or_else(|| {
                MtdbError::Validation(format!("'{attribute}' is not a key attribute"))
            })?;
            let is_hash_part = matches!(field.part, KeyPart::PrimaryHash | KeyPart::IndexHash);
            if is_hash_part && condition.operator != ComparisonOperator::Eq {
                return Err(MtdbError::UnsupportedPredicate(format!(
                    "only EQ is supported on hash key '{attribute}'"
                )));
            }
            let values = condition
                .values
                .iter()
                .map(|value| {
                    if field.is_hash_key {
                        self.encode_field_value(field, value)
                    } else {
                        Ok(value.clone())
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(
                field.physical_field.clone(),
                KeyCondition {
                    operator: condition.operator,
                    values,
                },
            );
        }
        if let Some(prefix_attr) = &self.prefix_attr
            && conditions
                .keys()
                .any(|attr| {
                    self.field_by_virtual(attr)
                        .is_some_and(|f| f.part == KeyPart::PrimaryHash)
                })
        {
            out.insert(
                prefix_attr.clone(),
                KeyCondition::eq(AttributeValue::S(self.hash_prefix())),
            );
        }
        Ok(out)
    }

    /// Resolves a virtual secondary-index name to its physical counterpart.
    pub fn resolve_index(&self, virtual_index: &str) -> Result<&str, MtdbError> {
        self.index_names
            .get(virtual_index)
            .map(CompactString::as_str)
            .ok_or_else(|| MtdbError::Validation(format!("unknown index '{virtual_index}'")))
    }

    /// Decodes the tenant and virtual table a physical item belongs to,
    /// from its composite hash attribute.
    pub fn decoded_owner(&self, item: &Item) -> Option<(CompactString, CompactString)> {
        let value = item.get(self.physical_hash_attr())?;
        let decoded = self.codec.decode(value.as_s()?).ok()?;
        Some((decoded.tenant_id, decoded.table_name))
    }
}

fn push_field(
    fields: &mut Vec<FieldMapping>,
    field: FieldMapping,
    virtual_desc: &TableDescription,
    physical_desc: &TableDescription,
) -> Result<(), MtdbError> {
    if let Some(existing) = fields
        .iter()
        .find(|f| f.virtual_field == field.virtual_field)
    {
        if existing.physical_field == field.physical_field
            && existing.virtual_type == field.virtual_type
        {
            return Ok(());
        }
        return Err(MtdbError::IncompatibleSchema {
            table: virtual_desc.name.to_string(),
            physical: physical_desc.name.to_string(),
            reason: format!(
                "attribute '{}' maps ambiguously to '{}' and '{}'",
                field.virtual_field, existing.physical_field, field.physical_field
            ),
        });
    }
    fields.push(field);
    Ok(())
}

/// Produces the physical table hosting a virtual table. The shared-table
/// façade persists the virtual description and uses this to decide where
/// the rows actually live.
pub trait CreateTableRequestFactory: Send + Sync + std::fmt::Debug {
    fn physical_table_for(
        &self,
        virtual_desc: &TableDescription,
    ) -> Result<TableDescription, MtdbError>;
}

/// Default factory: one physical table per key shape, named by the range
/// key type (`mt_shared_s`, `mt_shared_s_n`, ...). Secondary indexes keep
/// the virtual index name over dedicated string hash attributes so the
/// by-name index mapper finds them.
#[derive(Debug, Clone)]
pub struct ShapedTableFactory {
    pub base_name: CompactString,
    pub hash_attr: CompactString,
    pub range_attr: CompactString,
    pub table_prefix: Option<String>,
}

impl Default for ShapedTableFactory {
    fn default() -> Self {
        Self {
            base_name: "mt_shared".into(),
            hash_attr: "hk".into(),
            range_attr: "rk".into(),
            table_prefix: None,
        }
    }
}

impl ShapedTableFactory {
    fn shape_suffix(range: Option<&KeyDefinition>) -> &'static str {
        match range.map(|r| r.key_type) {
            None => "_s",
            Some(KeyType::S) => "_s_s",
            Some(KeyType::N) => "_s_n",
            Some(KeyType::B) => "_s_b",
        }
    }
}

impl CreateTableRequestFactory for ShapedTableFactory {
    fn physical_table_for(
        &self,
        virtual_desc: &TableDescription,
    ) -> Result<TableDescription, MtdbError> {
        let mut name = String::new();
        if let Some(prefix) = &self.table_prefix {
            name.push_str(prefix);
        }
        name.push_str(&self.base_name);
        name.push_str(Self::shape_suffix(virtual_desc.range_key.as_ref()));

        let mut physical =
            TableDescription::new(name, KeyDefinition::new(self.hash_attr.clone(), KeyType::S));
        if let Some(virtual_range) = &virtual_desc.range_key {
            physical = physical.with_range_key(KeyDefinition::new(
                self.range_attr.clone(),
                virtual_range.key_type,
            ));
        }
        for virtual_index in &virtual_desc.secondary_indexes {
            let physical_index = SecondaryIndexDescription {
                name: virtual_index.name.clone(),
                hash_key: KeyDefinition::new(
                    format!("{}_hk", virtual_index.name),
                    KeyType::S,
                ),
                range_key: virtual_index
                    .range_key
                    .as_ref()
                    .map(|r| KeyDefinition::new(format!("{}_rk", virtual_index.name), r.key_type)),
                projection: virtual_index.projection.clone(),
            };
            physical = physical.with_secondary_index(physical_index);
        }
        Ok(physical)
    }
}
