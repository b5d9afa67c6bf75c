use crate::config::SharedTableConfig;
use crate::context::TenantContextProvider;
use crate::error::MtdbError;
use crate::mapper::expression::ExpressionRole;
use crate::mapper::index::{ByNameIndexMapper, SecondaryIndexMapper};
use crate::mapper::key_codec::KeyCodec;
use crate::mapper::mapping::{
    CreateTableRequestFactory, ScanStrategy, ShapedTableFactory, TableMapping,
};
use crate::model::request::{
    BatchGetItemRequest, BatchGetItemResponse, DeleteItemRequest, DeleteItemResponse,
    GetItemRequest, GetItemResponse, KeyCondition, KeysAndProjection, PutItemRequest,
    PutItemResponse, QueryRequest, QueryResponse, ScanRequest, ScanResponse, UpdateItemRequest,
    UpdateItemResponse,
};
use crate::model::table::{TableDescription, TableStatus};
use crate::model::{AttributeValue, Item, NameMap, ValueMap};
use crate::repo::TableDescriptionRepo;
use crate::store::StoreClient;
use compact_str::CompactString;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type MappingKey = (CompactString, CompactString);

/// Multi-tenant façade that co-locates many tenants' virtual tables inside
/// a small set of shared physical tables, distinguishing rows by a
/// tenant-qualified composite hash key.
///
/// Every operation reads the tenant context once at entry, resolves the
/// virtual table description, materializes (or fetches) the table mapping,
/// rewrites the request, dispatches it, and rewrites the response. Caller
/// requests are never mutated; rewrites always work on copies.
pub struct SharedTableFacade {
    config: SharedTableConfig,
    store: Arc<dyn StoreClient>,
    repo: Arc<dyn TableDescriptionRepo>,
    context: Arc<dyn TenantContextProvider>,
    index_mapper: Arc<dyn SecondaryIndexMapper>,
    table_factory: Arc<dyn CreateTableRequestFactory>,
    codec: KeyCodec,
    mappings: RwLock<HashMap<MappingKey, Arc<TableMapping>>>,
}

impl SharedTableFacade {
    pub fn new(
        config: SharedTableConfig,
        store: Arc<dyn StoreClient>,
        repo: Arc<dyn TableDescriptionRepo>,
        context: Arc<dyn TenantContextProvider>,
    ) -> Self {
        let codec = KeyCodec::new(config.delimiter, config.table_prefix.clone());
        let table_factory = Arc::new(ShapedTableFactory {
            table_prefix: config.table_prefix.clone(),
            ..ShapedTableFactory::default()
        });
        Self {
            config,
            store,
            repo,
            context,
            index_mapper: Arc::new(ByNameIndexMapper),
            table_factory,
            codec,
            mappings: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_index_mapper(mut self, index_mapper: Arc<dyn SecondaryIndexMapper>) -> Self {
        self.index_mapper = index_mapper;
        self
    }

    pub fn with_table_factory(mut self, table_factory: Arc<dyn CreateTableRequestFactory>) -> Self {
        self.table_factory = table_factory;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn key_codec(&self) -> &KeyCodec {
        &self.codec
    }

    fn tenant(&self) -> Result<CompactString, MtdbError> {
        let tenant = self.context.tenant_id();
        if tenant.is_empty() {
            return Err(MtdbError::NoTenantContext);
        }
        Ok(tenant)
    }

    /// Fetches or lazily materializes the mapping for one virtual table.
    /// The cache is read-mostly; concurrent misses may both build, the
    /// first insert wins.
    pub(crate) async fn mapping(
        &self,
        tenant_id: &str,
        table_name: &str,
    ) -> Result<Arc<TableMapping>, MtdbError> {
        let key = (CompactString::from(tenant_id), CompactString::from(table_name));
        if let Some(mapping) = self.mappings.read().get(&key) {
            return Ok(Arc::clone(mapping));
        }
        let description = self.repo.get(tenant_id, table_name).await?;
        let mapping = Arc::new(self.build_mapping(tenant_id, &description)?);
        let mut cache = self.mappings.write();
        Ok(Arc::clone(cache.entry(key).or_insert(mapping)))
    }

    fn build_mapping(
        &self,
        tenant_id: &str,
        description: &TableDescription,
    ) -> Result<TableMapping, MtdbError> {
        let physical = self.table_factory.physical_table_for(description)?;
        TableMapping::build(
            tenant_id,
            description,
            &physical,
            self.index_mapper.as_ref(),
            &self.codec,
        )
    }

    // ------------------------------------------------------------------
    // table operations
    // ------------------------------------------------------------------

    pub async fn create_table(
        &self,
        description: &TableDescription,
    ) -> Result<TableDescription, MtdbError> {
        let tenant_id = self.tenant()?;
        // Schema errors surface before anything is persisted.
        let mapping = self.build_mapping(&tenant_id, description)?;
        let physical_desc = mapping.physical_description().clone();

        self.repo.create(&tenant_id, description).await?;
        if self.config.precreate_tables {
            self.ensure_physical_table(&physical_desc).await?;
        } else if self
            .store
            .describe_table(&physical_desc.name)
            .await?
            .is_none()
        {
            return Err(MtdbError::TableNotFound(physical_desc.name.to_string()));
        }
        info!(
            facade = %self.config.name,
            tenant = %tenant_id,
            table = %description.name,
            physical = %physical_desc.name,
            "created virtual table"
        );
        Ok(description.clone())
    }

    async fn ensure_physical_table(
        &self,
        description: &TableDescription,
    ) -> Result<(), MtdbError> {
        if self.store.describe_table(&description.name).await?.is_none() {
            debug!(table = %description.name, "creating physical table");
            self.store.create_table(description).await?;
        }
        loop {
            match self.store.describe_table(&description.name).await? {
                Some(info) if info.status == TableStatus::Active => return Ok(()),
                Some(_) => {
                    debug!(table = %description.name, "waiting for physical table to become active");
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds))
                        .await;
                }
                None => {
                    return Err(MtdbError::TableNotFound(description.name.to_string()));
                }
            }
        }
    }

    pub async fn describe_table(&self, table_name: &str) -> Result<TableDescription, MtdbError> {
        let tenant_id = self.tenant()?;
        self.repo.get(&tenant_id, table_name).await
    }

    pub async fn delete_table(&self, table_name: &str) -> Result<TableDescription, MtdbError> {
        let tenant_id = self.tenant()?;
        let removed = self.repo.delete(&tenant_id, table_name).await?;
        self.mappings
            .write()
            .remove(&(tenant_id.clone(), CompactString::from(table_name)));

        if self.config.truncate_on_delete_table {
            let mapping = Arc::new(self.build_mapping(&tenant_id, &removed)?);
            let store = Arc::clone(&self.store);
            if self.config.delete_table_async {
                let facade_name = self.config.name.clone();
                tokio::spawn(async move {
                    if let Err(error) = truncate_rows(store, mapping).await {
                        warn!(
                            facade = %facade_name,
                            error = %error,
                            "background table truncation failed"
                        );
                    }
                });
            } else {
                truncate_rows(store, mapping).await?;
            }
        }
        info!(
            facade = %self.config.name,
            tenant = %tenant_id,
            table = %table_name,
            "deleted virtual table"
        );
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // item operations
    // ------------------------------------------------------------------

    pub async fn get_item(&self, request: &GetItemRequest) -> Result<GetItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mapping = self.mapping(&tenant_id, &request.table_name).await?;

        let mut physical = GetItemRequest::new(
            mapping.physical_table_name(),
            mapping.apply_to_key(&request.key)?,
        );
        if let Some(projection) = &request.projection_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::Projection,
                projection,
                request.expression_attribute_names.as_ref(),
                None,
            )?;
            physical.projection_expression = Some(rewritten.text);
            physical.expression_attribute_names = rewritten.names;
        }

        let response = self.store.get_item(&physical).await?;
        let item = match response.item {
            Some(item) => mapping.invert_item(&item)?,
            None => None,
        };
        Ok(GetItemResponse { item })
    }

    pub async fn put_item(&self, request: &PutItemRequest) -> Result<PutItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mapping = self.mapping(&tenant_id, &request.table_name).await?;

        let mut physical = PutItemRequest::new(
            mapping.physical_table_name(),
            mapping.apply_to_item(&request.item)?,
        );
        self.rewrite_condition(&mapping, request.condition_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
            &mut physical.condition_expression,
            &mut physical.expression_attribute_names,
            &mut physical.expression_attribute_values,
        )?;

        let response = self.store.put_item(&physical).await?;
        let attributes = match response.attributes {
            Some(item) => mapping.invert_item(&item)?,
            None => None,
        };
        Ok(PutItemResponse { attributes })
    }

    pub async fn update_item(
        &self,
        request: &UpdateItemRequest,
    ) -> Result<UpdateItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mapping = self.mapping(&tenant_id, &request.table_name).await?;

        let update = mapping.rewrite_expression(
            ExpressionRole::Update,
            &request.update_expression,
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
        )?;
        let mut physical = UpdateItemRequest::new(
            mapping.physical_table_name(),
            mapping.apply_to_key(&request.key)?,
            update.text,
        );
        physical.expression_attribute_names = update.names;
        physical.expression_attribute_values = update.values;

        if let Some(condition) = &request.condition_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::Condition,
                condition,
                physical.expression_attribute_names.as_ref(),
                physical.expression_attribute_values.as_ref(),
            )?;
            if rewritten.proved == Some(false) {
                return Err(MtdbError::ConditionalCheckFailed);
            }
            physical.condition_expression = Some(rewritten.text);
            physical.expression_attribute_names = rewritten.names;
            physical.expression_attribute_values = rewritten.values;
        }

        let response = self.store.update_item(&physical).await?;
        let attributes = match response.attributes {
            Some(item) => mapping.invert_item(&item)?,
            None => None,
        };
        Ok(UpdateItemResponse { attributes })
    }

    pub async fn delete_item(
        &self,
        request: &DeleteItemRequest,
    ) -> Result<DeleteItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mapping = self.mapping(&tenant_id, &request.table_name).await?;

        let mut physical = DeleteItemRequest::new(
            mapping.physical_table_name(),
            mapping.apply_to_key(&request.key)?,
        );
        self.rewrite_condition(&mapping, request.condition_expression.as_deref(),
            request.expression_attribute_names.as_ref(),
            request.expression_attribute_values.as_ref(),
            &mut physical.condition_expression,
            &mut physical.expression_attribute_names,
            &mut physical.expression_attribute_values,
        )?;

        let response = self.store.delete_item(&physical).await?;
        let attributes = match response.attributes {
            Some(item) => mapping.invert_item(&item)?,
            None => None,
        };
        Ok(DeleteItemResponse { attributes })
    }

    /// Rewrites a condition expression into the physical request fields.
    /// Conditions the rewriter proved constant-false fail here, before any
    /// physical call.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_condition(
        &self,
        mapping: &TableMapping,
        condition: Option<&str>,
        names: Option<&NameMap>,
        values: Option<&ValueMap>,
        out_condition: &mut Option<String>,
        out_names: &mut Option<NameMap>,
        out_values: &mut Option<ValueMap>,
    ) -> Result<(), MtdbError> {
        let Some(condition) = condition else {
            return Ok(());
        };
        let rewritten =
            mapping.rewrite_expression(ExpressionRole::Condition, condition, names, values)?;
        if rewritten.proved == Some(false) {
            return Err(MtdbError::ConditionalCheckFailed);
        }
        *out_condition = Some(rewritten.text);
        *out_names = rewritten.names;
        *out_values = rewritten.values;
        Ok(())
    }

    pub async fn batch_get_item(
        &self,
        request: &BatchGetItemRequest,
    ) -> Result<BatchGetItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;

        let total_keys: usize = request.requests.values().map(|r| r.keys.len()).sum();
        if total_keys > 100 {
            return Err(MtdbError::Validation(format!(
                "batch get is limited to 100 keys, got {total_keys}"
            )));
        }
        if request
            .requests
            .values()
            .any(|r| r.projection_expression.is_some())
        {
            return Err(MtdbError::UnsupportedOperation(
                "projection expressions are not supported in batch gets".to_string(),
            ));
        }

        // Rewrite keys per virtual table, partitioned by physical table.
        let mut mappings: BTreeMap<CompactString, Arc<TableMapping>> = BTreeMap::new();
        let mut physical = BatchGetItemRequest::default();
        for (table_name, keys) in &request.requests {
            let mapping = self.mapping(&tenant_id, table_name).await?;
            let entry = physical
                .requests
                .entry(CompactString::from(mapping.physical_table_name()))
                .or_insert_with(KeysAndProjection::default);
            for key in &keys.keys {
                entry.keys.push(mapping.apply_to_key(key)?);
            }
            mappings.insert(table_name.clone(), mapping);
        }

        let response = self.store.batch_get_item(&physical).await?;

        // Route every returned row back to its virtual table by decoding
        // the composite; rows of other tenants are dropped.
        let mut out = BatchGetItemResponse::default();
        for items in response.responses.values() {
            for item in items {
                let Some((mapping, virtual_table)) =
                    self.route_item(&tenant_id, &mappings, item)
                else {
                    continue;
                };
                if let Some(virtual_item) = mapping.invert_item(item)? {
                    out.responses
                        .entry(virtual_table)
                        .or_default()
                        .push(virtual_item);
                }
            }
        }
        for keys in response.unprocessed.values() {
            for key in keys {
                let Some((mapping, virtual_table)) = self.route_item(&tenant_id, &mappings, key)
                else {
                    continue;
                };
                if let Some(virtual_key) = mapping.invert_key(key)? {
                    out.unprocessed
                        .entry(virtual_table)
                        .or_default()
                        .push(virtual_key);
                }
            }
        }
        Ok(out)
    }

    /// Finds which of this request's virtual tables a physical row belongs
    /// to, by decoding its composite hash attribute.
    fn route_item(
        &self,
        tenant_id: &str,
        mappings: &BTreeMap<CompactString, Arc<TableMapping>>,
        item: &Item,
    ) -> Option<(Arc<TableMapping>, CompactString)> {
        for (virtual_table, mapping) in mappings {
            if let Some((owner_tenant, owner_table)) = mapping.decoded_owner(item)
                && owner_tenant == tenant_id
                && owner_table == *virtual_table
            {
                return Some((Arc::clone(mapping), virtual_table.clone()));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // query and scan
    // ------------------------------------------------------------------

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mapping = self.mapping(&tenant_id, &request.table_name).await?;

        let mut physical = QueryRequest::new(mapping.physical_table_name());
        if let Some(index_name) = &request.index_name {
            physical.index_name = Some(mapping.resolve_index(index_name)?.into());
        }
        physical.key_conditions = mapping.rewrite_key_conditions(&request.key_conditions)?;
        physical.limit = request.limit;
        if let Some(start_key) = &request.exclusive_start_key {
            physical.exclusive_start_key = Some(mapping.apply_to_item(start_key)?);
        }

        let mut names = request.expression_attribute_names.clone();
        let mut values = request.expression_attribute_values.clone();
        if let Some(expression) = &request.key_condition_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::KeyCondition,
                expression,
                names.as_ref(),
                values.as_ref(),
            )?;
            let mut text = rewritten.text;
            names = rewritten.names;
            values = rewritten.values;
            // In the prefix layout the virtual hash key rewrote to the
            // physical range key, so the physical hash key still needs its
            // tenant-prefix equality.
            if mapping.scan_strategy() == ScanStrategy::PrefixQuery && request.index_name.is_none()
            {
                let mut names_map = names.take().unwrap_or_default();
                let mut values_map = values.take().unwrap_or_default();
                let name_alias = fresh_alias("#mtp", |a| names_map.contains_key(a));
                let value_alias = fresh_alias(":mtp", |a| values_map.contains_key(a));
                names_map.insert(
                    name_alias.clone().into(),
                    mapping.physical_hash_attr().into(),
                );
                values_map.insert(
                    value_alias.clone().into(),
                    AttributeValue::S(mapping.hash_prefix()),
                );
                text = format!("{text} AND {name_alias} = {value_alias}");
                names = Some(names_map);
                values = Some(values_map);
            }
            physical.key_condition_expression = Some(text);
        }
        if let Some(expression) = &request.filter_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::Filter,
                expression,
                names.as_ref(),
                values.as_ref(),
            )?;
            physical.filter_expression = Some(rewritten.text);
            names = rewritten.names;
            values = rewritten.values;
        }
        if let Some(expression) = &request.projection_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::Projection,
                expression,
                names.as_ref(),
                None,
            )?;
            physical.projection_expression = Some(rewritten.text);
            names = rewritten.names;
        }
        physical.expression_attribute_names = names;
        physical.expression_attribute_values = values;

        let response = self.store.query(&physical).await?;
        self.virtualize_rows(&mapping, &tenant_id, response.items, response.last_evaluated_key)
            .map(|(items, last_evaluated_key)| QueryResponse {
                items,
                last_evaluated_key,
            })
    }

    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        if request.index_name.is_some() {
            return Err(MtdbError::UnsupportedOperation(
                "scans over secondary indexes are not supported".to_string(),
            ));
        }
        let mapping = self.mapping(&tenant_id, &request.table_name).await?;

        let mut names = request.expression_attribute_names.clone();
        let mut values = request.expression_attribute_values.clone();
        let mut filter_expression = None;
        if let Some(expression) = &request.filter_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::Filter,
                expression,
                names.as_ref(),
                values.as_ref(),
            )?;
            filter_expression = Some(rewritten.text);
            names = rewritten.names;
            values = rewritten.values;
        }
        let mut projection_expression = None;
        if let Some(expression) = &request.projection_expression {
            let rewritten = mapping.rewrite_expression(
                ExpressionRole::Projection,
                expression,
                names.as_ref(),
                None,
            )?;
            projection_expression = Some(rewritten.text);
            names = rewritten.names;
        }

        let (items, last_evaluated_key) = match mapping.scan_strategy() {
            ScanStrategy::PrefixQuery => {
                // The physical hash key holds only the tenant prefix, so a
                // whole-table scan is an exact hash query.
                let mut physical = QueryRequest::new(mapping.physical_table_name());
                physical.key_conditions.insert(
                    mapping.physical_hash_attr().into(),
                    KeyCondition::eq(AttributeValue::S(mapping.hash_prefix())),
                );
                physical.filter_expression = filter_expression;
                physical.projection_expression = projection_expression;
                physical.expression_attribute_names = names;
                physical.expression_attribute_values = values;
                physical.limit = request.limit;
                if let Some(start_key) = &request.exclusive_start_key {
                    physical.exclusive_start_key = Some(mapping.apply_to_item(start_key)?);
                }
                let response = self.store.query(&physical).await?;
                (response.items, response.last_evaluated_key)
            }
            ScanStrategy::FilteredScan => {
                let mut physical = ScanRequest::new(mapping.physical_table_name());
                physical.filter_expression = filter_expression;
                physical.projection_expression = projection_expression;
                physical.expression_attribute_names = names;
                physical.expression_attribute_values = values;
                physical.limit = request.limit;
                if let Some(start_key) = &request.exclusive_start_key {
                    physical.exclusive_start_key = Some(mapping.apply_to_item(start_key)?);
                }
                let response = self.store.scan(&physical).await?;
                (response.items, response.last_evaluated_key)
            }
        };

        self.virtualize_rows(&mapping, &tenant_id, items, last_evaluated_key)
            .map(|(items, last_evaluated_key)| ScanResponse {
                items,
                last_evaluated_key,
            })
    }

    /// Post-filters rows by their decoded owner and translates them (and
    /// the paging key) back into the virtual shape.
    fn virtualize_rows(
        &self,
        mapping: &TableMapping,
        tenant_id: &str,
        items: Vec<Item>,
        last_evaluated_key: Option<Item>,
    ) -> Result<(Vec<Item>, Option<Item>), MtdbError> {
        let mut out = Vec::with_capacity(items.len());
        for item in &items {
            if let Some((owner_tenant, owner_table)) = mapping.decoded_owner(item)
                && (owner_tenant != tenant_id || owner_table != mapping.virtual_description().name)
            {
                continue;
            }
            if let Some(virtual_item) = mapping.invert_item(item)? {
                out.push(virtual_item);
            }
        }
        let last = match last_evaluated_key {
            Some(key) => mapping.invert_key(&key)?,
            None => None,
        };
        Ok((out, last))
    }
}

fn fresh_alias(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 0usize;
    loop {
        let candidate = format!("{base}{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Deletes every physical row owned by the mapping's virtual table. Used by
/// `delete_table` when truncation is enabled, inline or in the background.
async fn truncate_rows(
    store: Arc<dyn StoreClient>,
    mapping: Arc<TableMapping>,
) -> Result<(), MtdbError> {
    let mut start_key: Option<Item> = None;
    let mut deleted = 0usize;
    loop {
        let (items, next) = match mapping.scan_strategy() {
            ScanStrategy::PrefixQuery => {
                let mut request = QueryRequest::new(mapping.physical_table_name());
                request.key_conditions.insert(
                    mapping.physical_hash_attr().into(),
                    KeyCondition::eq(AttributeValue::S(mapping.hash_prefix())),
                );
                request.exclusive_start_key = start_key.take();
                let response = store.query(&request).await?;
                (response.items, response.last_evaluated_key)
            }
            ScanStrategy::FilteredScan => {
                let mut request = ScanRequest::new(mapping.physical_table_name());
                request.exclusive_start_key = start_key.take();
                let response = store.scan(&request).await?;
                (response.items, response.last_evaluated_key)
            }
        };

        for item in &items {
            let owned = mapping.decoded_owner(item).is_some_and(|(tenant, table)| {
                tenant == mapping.tenant_id() && table == mapping.virtual_description().name
            });
            if !owned {
                continue;
            }
            let mut key = Item::new();
            let physical = mapping.physical_description();
            if let Some(value) = item.get(physical.hash_key.name.as_str()) {
                key.insert(physical.hash_key.name.clone(), value.clone());
            }
            if let Some(range) = &physical.range_key
                && let Some(value) = item.get(range.name.as_str())
            {
                key.insert(range.name.clone(), value.clone());
            }
            store
                .delete_item(&DeleteItemRequest::new(
                    mapping.physical_table_name(),
                    key,
                ))
                .await?;
            deleted += 1;
        }

        match next {
            Some(key) => start_key = Some(key),
            None => break,
        }
    }
    debug!(
        table = %mapping.virtual_description().name,
        tenant = %mapping.tenant_id(),
        deleted,
        "truncated virtual table rows"
    );
    Ok(())
}
