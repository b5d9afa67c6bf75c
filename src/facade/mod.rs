pub mod by_table;
pub mod shared;

pub use by_table::TablePerTenantFacade;
pub use shared::SharedTableFacade;
