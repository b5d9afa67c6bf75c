use crate::model::{AttributeValue, Item, NameMap, ValueMap};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct GetItemRequest {
    pub table_name: CompactString,
    pub key: Item,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
}

impl GetItemRequest {
    pub fn new(table_name: impl Into<CompactString>, key: Item) -> Self {
        Self {
            table_name: table_name.into(),
            key,
            projection_expression: None,
            expression_attribute_names: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetItemResponse {
    pub item: Option<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutItemRequest {
    pub table_name: CompactString,
    pub item: Item,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
    pub expression_attribute_values: Option<ValueMap>,
}

impl PutItemRequest {
    pub fn new(table_name: impl Into<CompactString>, item: Item) -> Self {
        Self {
            table_name: table_name.into(),
            item,
            condition_expression: None,
            expression_attribute_names: None,
            expression_attribute_values: None,
        }
    }

    pub fn with_condition(
        mut self,
        expression: impl Into<String>,
        names: Option<NameMap>,
        values: Option<ValueMap>,
    ) -> Self {
        self.condition_expression = Some(expression.into());
        self.expression_attribute_names = names;
        self.expression_attribute_values = values;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutItemResponse {
    pub attributes: Option<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItemRequest {
    pub table_name: CompactString,
    pub key: Item,
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
    pub expression_attribute_values: Option<ValueMap>,
}

impl UpdateItemRequest {
    pub fn new(
        table_name: impl Into<CompactString>,
        key: Item,
        update_expression: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            key,
            update_expression: update_expression.into(),
            condition_expression: None,
            expression_attribute_names: None,
            expression_attribute_values: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateItemResponse {
    pub attributes: Option<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteItemRequest {
    pub table_name: CompactString,
    pub key: Item,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
    pub expression_attribute_values: Option<ValueMap>,
}

impl DeleteItemRequest {
    pub fn new(table_name: impl Into<CompactString>, key: Item) -> Self {
        Self {
            table_name: table_name.into(),
            key,
            condition_expression: None,
            expression_attribute_names: None,
            expression_attribute_values: None,
        }
    }

    pub fn with_condition(
        mut self,
        expression: impl Into<String>,
        names: Option<NameMap>,
        values: Option<ValueMap>,
    ) -> Self {
        self.condition_expression = Some(expression.into());
        self.expression_attribute_names = names;
        self.expression_attribute_values = values;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteItemResponse {
    pub attributes: Option<Item>,
}

/// Keys requested from one table in a batch get.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeysAndProjection {
    pub keys: Vec<Item>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetItemRequest {
    pub requests: BTreeMap<CompactString, KeysAndProjection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetItemResponse {
    pub responses: BTreeMap<CompactString, Vec<Item>>,
    pub unprocessed: BTreeMap<CompactString, Vec<Item>>,
}

/// Comparison operators accepted in the structured key-conditions map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Eq,
    Gt,
    BeginsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
    pub operator: ComparisonOperator,
    pub values: Vec<AttributeValue>,
}

impl KeyCondition {
    pub fn eq(value: AttributeValue) -> Self {
        Self {
            operator: ComparisonOperator::Eq,
            values: vec![value],
        }
    }

    pub fn gt(value: AttributeValue) -> Self {
        Self {
            operator: ComparisonOperator::Gt,
            values: vec![value],
        }
    }

    pub fn begins_with(value: AttributeValue) -> Self {
        Self {
            operator: ComparisonOperator::BeginsWith,
            values: vec![value],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub table_name: CompactString,
    pub index_name: Option<CompactString>,
    pub key_conditions: BTreeMap<CompactString, KeyCondition>,
    pub key_condition_expression: Option<String>,
    pub filter_expression: Option<String>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
    pub expression_attribute_values: Option<ValueMap>,
    pub limit: Option<usize>,
    pub exclusive_start_key: Option<Item>,
}

impl QueryRequest {
    pub fn new(table_name: impl Into<CompactString>) -> Self {
        Self {
            table_name: table_name.into(),
            index_name: None,
            key_conditions: BTreeMap::new(),
            key_condition_expression: None,
            filter_expression: None,
            projection_expression: None,
            expression_attribute_names: None,
            expression_attribute_values: None,
            limit: None,
            exclusive_start_key: None,
        }
    }

    pub fn with_key_condition(
        mut self,
        attribute: impl Into<CompactString>,
        condition: KeyCondition,
    ) -> Self {
        self.key_conditions.insert(attribute.into(), condition);
        self
    }

    pub fn with_index(mut self, index_name: impl Into<CompactString>) -> Self {
        self.index_name = Some(index_name.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub table_name: CompactString,
    pub index_name: Option<CompactString>,
    pub filter_expression: Option<String>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: Option<NameMap>,
    pub expression_attribute_values: Option<ValueMap>,
    pub limit: Option<usize>,
    pub exclusive_start_key: Option<Item>,
}

impl ScanRequest {
    pub fn new(table_name: impl Into<CompactString>) -> Self {
        Self {
            table_name: table_name.into(),
            index_name: None,
            filter_expression: None,
            projection_expression: None,
            expression_attribute_names: None,
            expression_attribute_values: None,
            limit: None,
            exclusive_start_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResponse {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}
