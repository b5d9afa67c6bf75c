use crate::error::MtdbError;
use crate::model::request::{
    BatchGetItemRequest, BatchGetItemResponse, DeleteItemRequest, DeleteItemResponse,
    GetItemRequest, GetItemResponse, PutItemRequest, PutItemResponse, QueryRequest, QueryResponse,
    ScanRequest, ScanResponse, UpdateItemRequest, UpdateItemResponse,
};
use crate::model::stream::{
    GetRecordsRequest, GetRecordsResponse, GetShardIteratorRequest, GetShardIteratorResponse,
};
use crate::model::table::{PhysicalTableInfo, TableDescription};
use async_trait::async_trait;

/// The underlying NSQL table service. The façades translate virtual
/// requests into physical requests against an implementation of this trait
/// and translate the responses back; they never interpret physical items
/// beyond the key attributes they rewrote.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn create_table(&self, description: &TableDescription) -> Result<(), MtdbError>;

    async fn describe_table(
        &self,
        table_name: &str,
    ) -> Result<Option<PhysicalTableInfo>, MtdbError>;

    async fn delete_table(&self, table_name: &str) -> Result<(), MtdbError>;

    async fn get_item(&self, request: &GetItemRequest) -> Result<GetItemResponse, MtdbError>;

    async fn put_item(&self, request: &PutItemRequest) -> Result<PutItemResponse, MtdbError>;

    async fn update_item(
        &self,
        request: &UpdateItemRequest,
    ) -> Result<UpdateItemResponse, MtdbError>;

    async fn delete_item(
        &self,
        request: &DeleteItemRequest,
    ) -> Result<DeleteItemResponse, MtdbError>;

    async fn batch_get_item(
        &self,
        request: &BatchGetItemRequest,
    ) -> Result<BatchGetItemResponse, MtdbError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, MtdbError>;

    async fn scan(&self, request: &ScanRequest) -> Result<ScanResponse, MtdbError>;
}

/// The underlying change-feed endpoint. `get_records` is the cost-limited
/// call the caching adapter exists for.
#[async_trait]
pub trait StreamsClient: Send + Sync {
    async fn get_shard_iterator(
        &self,
        request: &GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, MtdbError>;

    async fn get_records(
        &self,
        request: &GetRecordsRequest,
    ) -> Result<GetRecordsResponse, MtdbError>;
}
