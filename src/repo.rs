use crate::error::MtdbError;
use crate::model::request::{DeleteItemRequest, GetItemRequest, PutItemRequest};
use crate::model::table::{KeyDefinition, TableDescription};
use crate::model::{AttributeValue, Item, KeyType, NameMap};
use crate::store::StoreClient;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Persists virtual table descriptions, keyed by `(tenant, virtual name)`.
#[async_trait]
pub trait TableDescriptionRepo: Send + Sync {
    /// Persists a new description. `TableAlreadyExists` if one is present.
    async fn create(
        &self,
        tenant_id: &str,
        description: &TableDescription,
    ) -> Result<(), MtdbError>;

    /// Retrieves a description. `TableNotFound` if absent.
    async fn get(&self, tenant_id: &str, table_name: &str) -> Result<TableDescription, MtdbError>;

    /// Removes and returns a description. `TableNotFound` if absent.
    async fn delete(
        &self,
        tenant_id: &str,
        table_name: &str,
    ) -> Result<TableDescription, MtdbError>;
}

const TENANT_ATTR: &str = "tenant";
const TABLE_ATTR: &str = "table";
const DESCRIPTION_ATTR: &str = "description";

/// Repo that keeps descriptions as JSON documents inside a physical table of
/// the underlying store (`_tablemetadata` by default), keyed by tenant and
/// virtual table name.
pub struct StoreTableDescriptionRepo {
    store: Arc<dyn StoreClient>,
    table_name: String,
    table_ready: OnceCell<()>,
}

impl StoreTableDescriptionRepo {
    pub fn new(store: Arc<dyn StoreClient>, table_name: impl Into<String>) -> Self {
        Self {
            store,
            table_name: table_name.into(),
            table_ready: OnceCell::new(),
        }
    }

    fn metadata_description(&self) -> TableDescription {
        TableDescription::new(
            self.table_name.as_str(),
            KeyDefinition::new(TENANT_ATTR, KeyType::S),
        )
        .with_range_key(KeyDefinition::new(TABLE_ATTR, KeyType::S))
    }

    async fn ensure_table(&self) -> Result<(), MtdbError> {
        self.table_ready
            .get_or_try_init(|| async {
                if self.store.describe_table(&self.table_name).await?.is_none() {
                    debug!(table = %self.table_name, "creating table metadata store");
                    self.store.create_table(&self.metadata_description()).await?;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn key_for(tenant_id: &str, table_name: &str) -> Item {
        let mut key = Item::new();
        key.insert(TENANT_ATTR.into(), AttributeValue::s(tenant_id));
        key.insert(TABLE_ATTR.into(), AttributeValue::s(table_name));
        key
    }

    fn decode_item(item: &Item, table_name: &str) -> Result<TableDescription, MtdbError> {
        let serialized = item
            .get(DESCRIPTION_ATTR)
            .and_then(AttributeValue::as_s)
            .ok_or_else(|| {
                MtdbError::Store(format!(
                    "metadata row for table '{table_name}' is missing its description"
                ))
            })?;
        serde_json::from_str(serialized)
            .map_err(|e| MtdbError::Store(format!("corrupt table description: {e}")))
    }
}

#[async_trait]
impl TableDescriptionRepo for StoreTableDescriptionRepo {
    async fn create(
        &self,
        tenant_id: &str,
        description: &TableDescription,
    ) -> Result<(), MtdbError> {
        self.ensure_table().await?;
        let serialized = serde_json::to_string(description)
            .map_err(|e| MtdbError::Store(format!("failed to encode table description: {e}")))?;

        let mut item = Self::key_for(tenant_id, &description.name);
        item.insert(DESCRIPTION_ATTR.into(), AttributeValue::s(serialized));

        let mut names = NameMap::new();
        names.insert("#t".into(), TABLE_ATTR.into());
        let request = PutItemRequest::new(self.table_name.as_str(), item).with_condition(
            "attribute_not_exists(#t)",
            Some(names),
            None,
        );
        match self.store.put_item(&request).await {
            Ok(_) => Ok(()),
            Err(MtdbError::ConditionalCheckFailed) => {
                Err(MtdbError::TableAlreadyExists(description.name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, tenant_id: &str, table_name: &str) -> Result<TableDescription, MtdbError> {
        self.ensure_table().await?;
        let request = GetItemRequest::new(
            self.table_name.as_str(),
            Self::key_for(tenant_id, table_name),
        );
        let response = self.store.get_item(&request).await?;
        match response.item {
            Some(item) => Self::decode_item(&item, table_name),
            None => Err(MtdbError::TableNotFound(table_name.to_string())),
        }
    }

    async fn delete(
        &self,
        tenant_id: &str,
        table_name: &str,
    ) -> Result<TableDescription, MtdbError> {
        let description = self.get(tenant_id, table_name).await?;
        let request = DeleteItemRequest::new(
            self.table_name.as_str(),
            Self::key_for(tenant_id, table_name),
        );
        self.store.delete_item(&request).await?;
        Ok(description)
    }
}
