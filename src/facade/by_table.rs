use crate::config::TablePerTenantConfig;
use crate::context::TenantContextProvider;
use crate::error::MtdbError;
use crate::mapper::key_codec::{escape_segment, unescape_segment};
use crate::model::request::{
    BatchGetItemRequest, BatchGetItemResponse, DeleteItemRequest, DeleteItemResponse,
    GetItemRequest, GetItemResponse, PutItemRequest, PutItemResponse, QueryRequest, QueryResponse,
    ScanRequest, ScanResponse, UpdateItemRequest, UpdateItemResponse,
};
use crate::model::table::TableDescription;
use crate::store::StoreClient;
use compact_str::CompactString;
use std::sync::Arc;
use tracing::info;

/// Multi-tenant façade that gives each tenant its own physical tables. The
/// physical table name is `prefix + tenant + delimiter + virtualName`; keys,
/// indexes, and expressions pass through untouched.
pub struct TablePerTenantFacade {
    config: TablePerTenantConfig,
    store: Arc<dyn StoreClient>,
    context: Arc<dyn TenantContextProvider>,
}

impl TablePerTenantFacade {
    pub fn new(
        config: TablePerTenantConfig,
        store: Arc<dyn StoreClient>,
        context: Arc<dyn TenantContextProvider>,
    ) -> Self {
        Self {
            config,
            store,
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn tenant(&self) -> Result<CompactString, MtdbError> {
        let tenant = self.context.tenant_id();
        if tenant.is_empty() {
            return Err(MtdbError::NoTenantContext);
        }
        Ok(tenant)
    }

    /// Physical name hosting one tenant's virtual table. Both segments are
    /// escaped so the delimiter splits unambiguously.
    pub fn physical_name(&self, tenant_id: &str, table_name: &str) -> CompactString {
        let mut out = CompactString::default();
        if let Some(prefix) = &self.config.table_prefix {
            out.push_str(prefix);
        }
        out.push_str(&escape_segment(tenant_id, self.config.delimiter));
        out.push(self.config.delimiter);
        out.push_str(&escape_segment(table_name, self.config.delimiter));
        out
    }

    /// Recovers `(tenant, virtual table)` from a physical table name.
    pub fn tenant_and_table(
        &self,
        physical_name: &str,
    ) -> Result<(CompactString, CompactString), MtdbError> {
        let malformed = || MtdbError::MalformedPhysicalKey {
            key: physical_name.to_string(),
            reason: "expected 'tenant<delimiter>table'".to_string(),
        };
        let stripped = match &self.config.table_prefix {
            Some(prefix) => physical_name.strip_prefix(prefix.as_str()).ok_or_else(malformed)?,
            None => physical_name,
        };
        let mut segments = stripped.split(self.config.delimiter);
        match (segments.next(), segments.next(), segments.next()) {
            (Some(tenant), Some(table), None) => {
                let tenant = unescape_segment(tenant).ok_or_else(malformed)?;
                let table = unescape_segment(table).ok_or_else(malformed)?;
                Ok((tenant, table))
            }
            _ => Err(malformed()),
        }
    }

    pub async fn create_table(
        &self,
        description: &TableDescription,
    ) -> Result<TableDescription, MtdbError> {
        let tenant_id = self.tenant()?;
        let physical_name = self.physical_name(&tenant_id, &description.name);
        if self.store.describe_table(&physical_name).await?.is_some() {
            return Err(MtdbError::TableAlreadyExists(description.name.to_string()));
        }
        let physical = description.clone().with_name(physical_name.clone());
        self.store.create_table(&physical).await?;
        info!(
            facade = %self.config.name,
            tenant = %tenant_id,
            table = %description.name,
            physical = %physical_name,
            "created tenant table"
        );
        Ok(description.clone())
    }

    pub async fn describe_table(&self, table_name: &str) -> Result<TableDescription, MtdbError> {
        let tenant_id = self.tenant()?;
        let physical_name = self.physical_name(&tenant_id, table_name);
        match self.store.describe_table(&physical_name).await? {
            Some(info) => Ok(info.description.with_name(table_name)),
            None => Err(MtdbError::TableNotFound(table_name.to_string())),
        }
    }

    pub async fn delete_table(&self, table_name: &str) -> Result<(), MtdbError> {
        let tenant_id = self.tenant()?;
        let physical_name = self.physical_name(&tenant_id, table_name);
        if self.store.describe_table(&physical_name).await?.is_none() {
            return Err(MtdbError::TableNotFound(table_name.to_string()));
        }
        self.store.delete_table(&physical_name).await
    }

    pub async fn get_item(&self, request: &GetItemRequest) -> Result<GetItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = request.clone();
        physical.table_name = self.physical_name(&tenant_id, &request.table_name);
        self.store.get_item(&physical).await
    }

    pub async fn put_item(&self, request: &PutItemRequest) -> Result<PutItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = request.clone();
        physical.table_name = self.physical_name(&tenant_id, &request.table_name);
        self.store.put_item(&physical).await
    }

    pub async fn update_item(
        &self,
        request: &UpdateItemRequest,
    ) -> Result<UpdateItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = request.clone();
        physical.table_name = self.physical_name(&tenant_id, &request.table_name);
        self.store.update_item(&physical).await
    }

    pub async fn delete_item(
        &self,
        request: &DeleteItemRequest,
    ) -> Result<DeleteItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = request.clone();
        physical.table_name = self.physical_name(&tenant_id, &request.table_name);
        self.store.delete_item(&physical).await
    }

    pub async fn batch_get_item(
        &self,
        request: &BatchGetItemRequest,
    ) -> Result<BatchGetItemResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = BatchGetItemRequest::default();
        for (table_name, keys) in &request.requests {
            physical
                .requests
                .insert(self.physical_name(&tenant_id, table_name), keys.clone());
        }
        let response = self.store.batch_get_item(&physical).await?;

        let mut out = BatchGetItemResponse::default();
        for (physical_name, items) in response.responses {
            let (_, table) = self.tenant_and_table(&physical_name)?;
            out.responses.insert(table, items);
        }
        for (physical_name, keys) in response.unprocessed {
            let (_, table) = self.tenant_and_table(&physical_name)?;
            out.unprocessed.insert(table, keys);
        }
        Ok(out)
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = request.clone();
        physical.table_name = self.physical_name(&tenant_id, &request.table_name);
        self.store.query(&physical).await
    }

    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanResponse, MtdbError> {
        let tenant_id = self.tenant()?;
        let mut physical = request.clone();
        physical.table_name = self.physical_name(&tenant_id, &request.table_name);
        self.store.scan(&physical).await
    }
}
