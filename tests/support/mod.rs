//! In-memory implementations of the underlying store and streams endpoints,
//! plus fixture helpers shared by the integration tests.

// Each integration test binary compiles this module and uses a subset.
#![allow(dead_code)]

pub mod eval;

use mtdb::error::MtdbError;
use mtdb::mapper::expression::{parse_condition, parse_projection, parse_update};
use mtdb::model::request::{
    BatchGetItemRequest, BatchGetItemResponse, ComparisonOperator, DeleteItemRequest,
    DeleteItemResponse, GetItemRequest, GetItemResponse, KeyCondition, PutItemRequest,
    PutItemResponse, QueryRequest, QueryResponse, ScanRequest, ScanResponse, UpdateItemRequest,
    UpdateItemResponse,
};
use mtdb::model::stream::{
    GetRecordsRequest, GetRecordsResponse, GetShardIteratorRequest, GetShardIteratorResponse,
    StreamEventKind, StreamRecord,
};
use mtdb::model::table::{PhysicalTableInfo, TableDescription, TableStatus};
use mtdb::model::{AttributeValue, Item, NameMap, ValueMap};
use mtdb::store::{StoreClient, StreamsClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// in-memory table store
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, PartialOrd)]
enum SortKey {
    S(String),
    N(f64),
    B(Vec<u8>),
}

impl Eq for SortKey {}

#[allow(clippy::derive_ord_xor_partial_ord)]
impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (SortKey::N(a), SortKey::N(b)) => a.total_cmp(b),
            _ => self.partial_cmp(other).unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

fn sort_key(value: &AttributeValue) -> Result<SortKey, MtdbError> {
    match value {
        AttributeValue::S(s) => Ok(SortKey::S(s.to_string())),
        AttributeValue::N(n) => n
            .parse()
            .map(SortKey::N)
            .map_err(|_| MtdbError::Validation(format!("bad numeric key '{n}'"))),
        AttributeValue::B(b) => Ok(SortKey::B(b.clone())),
        other => Err(MtdbError::Validation(format!(
            "value of type {} cannot be a key",
            other.type_tag()
        ))),
    }
}

type PrimaryKey = (SortKey, Option<SortKey>);

struct TableData {
    description: TableDescription,
    items: BTreeMap<PrimaryKey, Item>,
}

impl TableData {
    fn key_of(&self, item: &Item) -> Result<PrimaryKey, MtdbError> {
        let hash = item
            .get(self.description.hash_key.name.as_str())
            .ok_or_else(|| {
                MtdbError::Validation(format!(
                    "item is missing hash key '{}'",
                    self.description.hash_key.name
                ))
            })?;
        let range = match &self.description.range_key {
            Some(range_key) => Some(sort_key(item.get(range_key.name.as_str()).ok_or_else(
                || MtdbError::Validation(format!("item is missing range key '{}'", range_key.name)),
            )?)?),
            None => None,
        };
        Ok((sort_key(hash)?, range))
    }

    fn key_item(&self, item: &Item) -> Item {
        let mut key = Item::new();
        if let Some(value) = item.get(self.description.hash_key.name.as_str()) {
            key.insert(self.description.hash_key.name.clone(), value.clone());
        }
        if let Some(range_key) = &self.description.range_key
            && let Some(value) = item.get(range_key.name.as_str())
        {
            key.insert(range_key.name.clone(), value.clone());
        }
        key
    }
}

/// Store fake with real conditional-expression semantics, backed by the
/// crate's expression parser and the reference evaluator.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<BTreeMap<String, TableData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw physical rows of one table, for asserting on the wire shape.
    pub fn dump(&self, table_name: &str) -> Vec<Item> {
        let tables = self.tables.lock();
        tables
            .get(table_name)
            .map(|table| table.items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    fn check_condition(
        existing: Option<&Item>,
        condition: Option<&str>,
        names: Option<&NameMap>,
        values: Option<&ValueMap>,
    ) -> Result<(), MtdbError> {
        let Some(condition) = condition else {
            return Ok(());
        };
        let expr = parse_condition(condition)?;
        let empty = Item::new();
        let subject = existing.unwrap_or(&empty);
        if eval::eval_condition(&expr, subject, names, values)? {
            Ok(())
        } else {
            Err(MtdbError::ConditionalCheckFailed)
        }
    }

    fn project(
        items: Vec<Item>,
        projection: Option<&str>,
        names: Option<&NameMap>,
    ) -> Result<Vec<Item>, MtdbError> {
        let Some(projection) = projection else {
            return Ok(items);
        };
        let paths = parse_projection(projection)?;
        let mut roots = Vec::new();
        for path in &paths {
            let root = match &path.0[0] {
                mtdb::mapper::expression::PathElement::Attr(token) => match token {
                    mtdb::mapper::expression::NameToken::Ident(name) => name.to_string(),
                    mtdb::mapper::expression::NameToken::Ref(name) => names
                        .and_then(|names| names.get(format!("#{name}").as_str()))
                        .map(|resolved| resolved.to_string())
                        .ok_or_else(|| {
                            MtdbError::MalformedExpression(format!("unresolved '#{name}'"))
                        })?,
                },
                _ => continue,
            };
            roots.push(root);
        }
        Ok(items
            .into_iter()
            .map(|item| {
                item.into_iter()
                    .filter(|(name, _)| roots.iter().any(|root| root == name.as_str()))
                    .collect()
            })
            .collect())
    }

    fn matches_key_condition(
        item: &Item,
        attribute: &str,
        condition: &KeyCondition,
    ) -> Result<bool, MtdbError> {
        let Some(value) = item.get(attribute) else {
            return Ok(false);
        };
        let expected = condition
            .values
            .first()
            .ok_or_else(|| MtdbError::Validation("key condition without a value".into()))?;
        Ok(match condition.operator {
            ComparisonOperator::Eq => value == expected,
            ComparisonOperator::Gt => match (value, expected) {
                (AttributeValue::N(a), AttributeValue::N(b)) => {
                    eval::numeric_cmp(a, b).is_some_and(|o| o.is_gt())
                }
                (AttributeValue::S(a), AttributeValue::S(b)) => a > b,
                (AttributeValue::B(a), AttributeValue::B(b)) => a > b,
                _ => false,
            },
            ComparisonOperator::BeginsWith => match (value, expected) {
                (AttributeValue::S(a), AttributeValue::S(b)) => a.starts_with(b.as_str()),
                _ => false,
            },
        })
    }

    fn select(
        table: &TableData,
        key_conditions: &BTreeMap<compact_str::CompactString, KeyCondition>,
        key_condition_expression: Option<&str>,
        filter_expression: Option<&str>,
        names: Option<&NameMap>,
        values: Option<&ValueMap>,
        exclusive_start_key: Option<&Item>,
        limit: Option<usize>,
    ) -> Result<(Vec<Item>, Option<Item>), MtdbError> {
        let key_expr = key_condition_expression.map(parse_condition).transpose()?;
        let filter_expr = filter_expression.map(parse_condition).transpose()?;

        let mut started = exclusive_start_key.is_none();
        let start_key = exclusive_start_key
            .map(|key| table.key_of(key))
            .transpose()
            .ok()
            .flatten();

        let mut matches = Vec::new();
        let mut last_key = None;
        for (primary, item) in &table.items {
            if !started {
                if Some(primary) == start_key.as_ref() {
                    started = true;
                }
                continue;
            }
            let mut keep = true;
            for (attribute, condition) in key_conditions {
                if !Self::matches_key_condition(item, attribute, condition)? {
                    keep = false;
                    break;
                }
            }
            if keep && let Some(expr) = &key_expr {
                keep = eval::eval_condition(expr, item, names, values)?;
            }
            if keep && let Some(expr) = &filter_expr {
                keep = eval::eval_condition(expr, item, names, values)?;
            }
            if keep {
                matches.push(item.clone());
                if let Some(limit) = limit
                    && matches.len() >= limit
                {
                    last_key = Some(table.key_item(item));
                    break;
                }
            }
        }
        Ok((matches, last_key))
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn create_table(&self, description: &TableDescription) -> Result<(), MtdbError> {
        let mut tables = self.tables.lock();
        if tables.contains_key(description.name.as_str()) {
            return Err(MtdbError::TableAlreadyExists(description.name.to_string()));
        }
        tables.insert(
            description.name.to_string(),
            TableData {
                description: description.clone(),
                items: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn describe_table(
        &self,
        table_name: &str,
    ) -> Result<Option<PhysicalTableInfo>, MtdbError> {
        let tables = self.tables.lock();
        Ok(tables.get(table_name).map(|table| PhysicalTableInfo {
            description: table.description.clone(),
            status: TableStatus::Active,
        }))
    }

    async fn delete_table(&self, table_name: &str) -> Result<(), MtdbError> {
        let mut tables = self.tables.lock();
        tables
            .remove(table_name)
            .map(|_| ())
            .ok_or_else(|| MtdbError::TableNotFound(table_name.to_string()))
    }

    async fn get_item(&self, request: &GetItemRequest) -> Result<GetItemResponse, MtdbError> {
        let tables = self.tables.lock();
        let table = tables
            .get(request.table_name.as_str())
            .ok_or_else(|| MtdbError::TableNotFound(request.table_name.to_string()))?;
        let key = table.key_of(&request.key)?;
        let item = table.items.get(&key).cloned();
        let items = Self::project(
            item.into_iter().collect(),
            request.projection_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
        )?;
        Ok(GetItemResponse {
            item: items.into_iter().next(),
        })
    }

    async fn put_item(&self, request: &PutItemRequest) -> Result<PutItemResponse, MtdbError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(request.table_name.as_str())
            .ok_or_else(|| MtdbError::TableNotFound(request.table_name.to_string()))?;
        let key = table.key_of(&request.item)?;
        Self::check_condition(
            table.items.get(&key),
            request.condition_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
        )?;
        let previous = table.items.insert(key, request.item.clone());
        Ok(PutItemResponse {
            attributes: previous,
        })
    }

    async fn update_item(
        &self,
        request: &UpdateItemRequest,
    ) -> Result<UpdateItemResponse, MtdbError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(request.table_name.as_str())
            .ok_or_else(|| MtdbError::TableNotFound(request.table_name.to_string()))?;
        let key = table.key_of(&request.key)?;
        Self::check_condition(
            table.items.get(&key),
            request.condition_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
        )?;
        let mut item = table.items.get(&key).cloned().unwrap_or_else(|| request.key.clone());
        let update = parse_update(&request.update_expression)?;
        eval::apply_update(
            &mut item,
            &update,
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
        )?;
        table.items.insert(key, item.clone());
        Ok(UpdateItemResponse {
            attributes: Some(item),
        })
    }

    async fn delete_item(
        &self,
        request: &DeleteItemRequest,
    ) -> Result<DeleteItemResponse, MtdbError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(request.table_name.as_str())
            .ok_or_else(|| MtdbError::TableNotFound(request.table_name.to_string()))?;
        let key = table.key_of(&request.key)?;
        Self::check_condition(
            table.items.get(&key),
            request.condition_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
        )?;
        let previous = table.items.remove(&key);
        Ok(DeleteItemResponse {
            attributes: previous,
        })
    }

    async fn batch_get_item(
        &self,
        request: &BatchGetItemRequest,
    ) -> Result<BatchGetItemResponse, MtdbError> {
        let tables = self.tables.lock();
        let mut response = BatchGetItemResponse::default();
        for (table_name, keys) in &request.requests {
            let table = tables
                .get(table_name.as_str())
                .ok_or_else(|| MtdbError::TableNotFound(table_name.to_string()))?;
            for key in &keys.keys {
                let primary = table.key_of(key)?;
                if let Some(item) = table.items.get(&primary) {
                    response
                        .responses
                        .entry(table_name.clone())
                        .or_default()
                        .push(item.clone());
                }
            }
        }
        Ok(response)
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, MtdbError> {
        let tables = self.tables.lock();
        let table = tables
            .get(request.table_name.as_str())
            .ok_or_else(|| MtdbError::TableNotFound(request.table_name.to_string()))?;
        if let Some(index_name) = &request.index_name
            && table.description.index(index_name).is_none()
        {
            return Err(MtdbError::Validation(format!(
                "unknown index '{index_name}'"
            )));
        }
        let (items, last_evaluated_key) = Self::select(
            table,
            &request.key_conditions,
            request.key_condition_expression.as_deref(),
            request.filter_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
            request.exclusive_start_key.as_ref(),
            request.limit,
        )?;
        let items = Self::project(
            items,
            request.projection_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
        )?;
        Ok(QueryResponse {
            items,
            last_evaluated_key,
        })
    }

    async fn scan(&self, request: &ScanRequest) -> Result<ScanResponse, MtdbError> {
        let tables = self.tables.lock();
        let table = tables
            .get(request.table_name.as_str())
            .ok_or_else(|| MtdbError::TableNotFound(request.table_name.to_string()))?;
        let (items, last_evaluated_key) = Self::select(
            table,
            &BTreeMap::new(),
            None,
            request.filter_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
            request.exclusive_start_key.as_ref(),
            request.limit,
        )?;
        let items = Self::project(
            items,
            request.projection_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
        )?;
        Ok(ScanResponse {
            items,
            last_evaluated_key,
        })
    }
}

// ---------------------------------------------------------------------------
// scripted streams endpoint
// ---------------------------------------------------------------------------

/// Streams fake fed with a queue of responses; counts calls so tests can
/// assert how often the underlying endpoint was actually hit.
#[derive(Default)]
pub struct ScriptedStreams {
    responses: Mutex<VecDeque<Result<GetRecordsResponse, MtdbError>>>,
    iterator_calls: AtomicUsize,
    records_calls: AtomicUsize,
    issued: AtomicUsize,
}

impl ScriptedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_records(&self, records: Vec<StreamRecord>, next: Option<&str>) {
        self.responses.lock().push_back(Ok(GetRecordsResponse {
            records,
            next_shard_iterator: next.map(String::from),
        }));
    }

    pub fn push_error(&self, error: MtdbError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn iterator_calls(&self) -> usize {
        self.iterator_calls.load(Ordering::SeqCst)
    }

    pub fn records_calls(&self) -> usize {
        self.records_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamsClient for ScriptedStreams {
    async fn get_shard_iterator(
        &self,
        request: &GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, MtdbError> {
        self.iterator_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(GetShardIteratorResponse {
            shard_iterator: format!("u{n}-{}-{}", request.shard_id, request.kind),
        })
    }

    async fn get_records(
        &self,
        _request: &GetRecordsRequest,
    ) -> Result<GetRecordsResponse, MtdbError> {
        self.records_calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(MtdbError::Store("no scripted response left".to_string())))
    }
}

/// `count` records with consecutive sequence numbers starting at `start`.
pub fn make_records(start: u64, count: usize) -> Vec<StreamRecord> {
    (0..count as u64)
        .map(|i| {
            let seq = start + i;
            let mut keys = Item::new();
            keys.insert("hk".into(), AttributeValue::s(format!("o1.T1.k{seq}")));
            StreamRecord {
                event_id: format!("e{seq}").into(),
                event_kind: StreamEventKind::Insert,
                sequence_number: seq.to_string().into(),
                keys,
                new_image: None,
                old_image: None,
            }
        })
        .collect()
}

pub fn item(entries: &[(&str, AttributeValue)]) -> Item {
    entries
        .iter()
        .map(|(k, v)| ((*k).into(), v.clone()))
        .collect()
}
