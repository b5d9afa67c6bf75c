use crate::context::TenantContextProvider;
use crate::error::MtdbError;
use crate::facade::{SharedTableFacade, TablePerTenantFacade};
use crate::model::Item;
use crate::model::stream::{
    GetRecordsRequest, GetShardIteratorRequest, GetShardIteratorResponse,
    GetTenantRecordsResponse, StreamArn, StreamRecord, TenantRecord,
};
use crate::streams::cache::{CachingStreams, ExternalIterator};
use compact_str::CompactString;
use std::sync::Arc;
use tracing::debug;

/// Virtualized change-feed view for the shared-table mapping mode.
///
/// Each physical record's composite hash key names the tenant and virtual
/// table it belongs to. Records are filtered to the calling tenant (all
/// tenants in the base context) and their key and item images are
/// translated back into the virtual shape.
pub struct SharedTableStreamsFacade {
    streams: Arc<CachingStreams>,
    facade: Arc<SharedTableFacade>,
    context: Arc<dyn TenantContextProvider>,
    /// Attribute of the streamed physical table that carries the composite.
    hash_key_attribute: CompactString,
}

impl SharedTableStreamsFacade {
    pub fn new(
        streams: Arc<CachingStreams>,
        facade: Arc<SharedTableFacade>,
        context: Arc<dyn TenantContextProvider>,
        hash_key_attribute: impl Into<CompactString>,
    ) -> Self {
        Self {
            streams,
            facade,
            context,
            hash_key_attribute: hash_key_attribute.into(),
        }
    }

    pub async fn get_shard_iterator(
        &self,
        request: &GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, MtdbError> {
        self.streams.get_shard_iterator(request).await
    }

    pub async fn get_records(
        &self,
        request: &GetRecordsRequest,
    ) -> Result<GetTenantRecordsResponse, MtdbError> {
        let tenant_filter = self.context.tenant_id();
        let response = self.streams.get_records(request).await?;

        let mut records = Vec::with_capacity(response.records.len());
        for record in response.records {
            let Some((tenant_id, table_name)) = self.decode_owner(&record.keys) else {
                debug!(
                    event = %record.event_id,
                    "dropping stream record without a decodable composite key"
                );
                continue;
            };
            if !tenant_filter.is_empty() && tenant_id != tenant_filter {
                continue;
            }
            let record = self.virtualize(&tenant_id, &table_name, record).await?;
            records.push(TenantRecord {
                tenant_id,
                table_name,
                record,
            });
        }
        Ok(GetTenantRecordsResponse {
            records,
            next_shard_iterator: response.next_shard_iterator,
        })
    }

    fn decode_owner(&self, keys: &Item) -> Option<(CompactString, CompactString)> {
        let composite = keys.get(self.hash_key_attribute.as_str())?.as_s()?;
        let decoded = self.facade.key_codec().decode(composite).ok()?;
        Some((decoded.tenant_id, decoded.table_name))
    }

    /// Translates the record's key and item images into the virtual shape.
    /// If the virtual table was dropped since the record was written, the
    /// physical shape is passed through tagged but untranslated.
    async fn virtualize(
        &self,
        tenant_id: &str,
        table_name: &str,
        record: StreamRecord,
    ) -> Result<StreamRecord, MtdbError> {
        let mapping = match self.facade.mapping(tenant_id, table_name).await {
            Ok(mapping) => mapping,
            Err(MtdbError::TableNotFound(_)) => {
                debug!(tenant = %tenant_id, table = %table_name, "streamed table no longer described");
                return Ok(record);
            }
            Err(other) => return Err(other),
        };
        let mut out = record;
        if let Some(keys) = mapping.invert_key(&out.keys)? {
            out.keys = keys;
        }
        if let Some(image) = out.new_image.take() {
            out.new_image = mapping.invert_item(&image)?;
        }
        if let Some(image) = out.old_image.take() {
            out.old_image = mapping.invert_item(&image)?;
        }
        Ok(out)
    }
}

/// Virtualized change-feed view for the table-per-tenant mapping mode: the
/// tenant and virtual table are recovered from the physical table name in
/// the stream ARN, and records pass through otherwise untouched.
pub struct TablePerTenantStreamsFacade {
    streams: Arc<CachingStreams>,
    facade: Arc<TablePerTenantFacade>,
}

impl TablePerTenantStreamsFacade {
    pub fn new(streams: Arc<CachingStreams>, facade: Arc<TablePerTenantFacade>) -> Self {
        Self { streams, facade }
    }

    pub async fn get_shard_iterator(
        &self,
        request: &GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, MtdbError> {
        self.streams.get_shard_iterator(request).await
    }

    pub async fn get_records(
        &self,
        request: &GetRecordsRequest,
    ) -> Result<GetTenantRecordsResponse, MtdbError> {
        let iterator = ExternalIterator::parse(&request.shard_iterator)?;
        let arn = StreamArn::parse(iterator.stream_arn())?;
        let (tenant_id, table_name) = self.facade.tenant_and_table(&arn.table_name)?;

        let response = self.streams.get_records(request).await?;
        let records = response
            .records
            .into_iter()
            .map(|record| TenantRecord {
                tenant_id: tenant_id.clone(),
                table_name: table_name.clone(),
                record,
            })
            .collect();
        Ok(GetTenantRecordsResponse {
            records,
            next_shard_iterator: response.next_shard_iterator,
        })
    }
}
