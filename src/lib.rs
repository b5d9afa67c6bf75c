pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod mapper;
pub mod model;
pub mod repo;
pub mod store;
pub mod streams;

pub use crate::config::{SharedTableConfig, StreamsCacheConfig, TablePerTenantConfig};
pub use crate::context::{
    BASE_CONTEXT, SettableTenantContext, TaskLocalTenantContext, TenantContextProvider,
};
pub use crate::error::{MtdbError, MtdbErrorCode};
pub use crate::facade::{SharedTableFacade, TablePerTenantFacade};
pub use crate::mapper::expression::ExpressionRole;
pub use crate::mapper::index::{ByNameIndexMapper, ByTypeIndexMapper, SecondaryIndexMapper};
pub use crate::mapper::key_codec::KeyCodec;
pub use crate::mapper::mapping::{
    CreateTableRequestFactory, FieldMapping, ScanStrategy, ShapedTableFactory, TableMapping,
};
pub use crate::model::{AttributeValue, Item, KeyType, NameMap, ValueMap};
pub use crate::repo::{StoreTableDescriptionRepo, TableDescriptionRepo};
pub use crate::store::{StoreClient, StreamsClient};
pub use crate::streams::{CachingStreams, SharedTableStreamsFacade, TablePerTenantStreamsFacade};
