pub const DEFAULT_DELIMITER: char = '.';
pub const DEFAULT_METADATA_TABLE: &str = "_tablemetadata";

/// Runtime configuration for the shared-table façade.
#[derive(Debug, Clone)]
pub struct SharedTableConfig {
    /// Identifier used in logs and metrics.
    pub name: String,
    /// Separator between the tenant id, virtual table name, and hash-key
    /// value inside composite physical keys, and between the tenant id and
    /// table name in prefixed physical table names.
    pub delimiter: char,
    /// Prepended to every physical table name, for environment isolation.
    pub table_prefix: Option<String>,
    /// If true, `delete_table` returns as soon as the table metadata is
    /// removed and row deletion proceeds in the background.
    pub delete_table_async: bool,
    /// If true, physical rows owned by the virtual table are deleted when
    /// the table is dropped.
    pub truncate_on_delete_table: bool,
    /// Create physical tables eagerly when a virtual table is created;
    /// otherwise only verify they exist.
    pub precreate_tables: bool,
    /// Interval between polls while waiting for a physical table to become
    /// active. Zero polls without sleeping.
    pub poll_interval_seconds: u64,
    /// Physical table holding serialized virtual table descriptions.
    pub metadata_table_name: String,
}

impl Default for SharedTableConfig {
    fn default() -> Self {
        Self {
            name: "MtAmazonDynamoDbBySharedTable".to_string(),
            delimiter: DEFAULT_DELIMITER,
            table_prefix: None,
            delete_table_async: false,
            truncate_on_delete_table: false,
            precreate_tables: true,
            poll_interval_seconds: 0,
            metadata_table_name: DEFAULT_METADATA_TABLE.to_string(),
        }
    }
}

impl SharedTableConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_table_prefix(mut self, table_prefix: impl Into<String>) -> Self {
        self.table_prefix = Some(table_prefix.into());
        self
    }

    pub fn with_delete_table_async(mut self, delete_table_async: bool) -> Self {
        self.delete_table_async = delete_table_async;
        self
    }

    pub fn with_truncate_on_delete_table(mut self, truncate: bool) -> Self {
        self.truncate_on_delete_table = truncate;
        self
    }

    pub fn with_precreate_tables(mut self, precreate_tables: bool) -> Self {
        self.precreate_tables = precreate_tables;
        self
    }

    pub fn with_poll_interval_seconds(mut self, poll_interval_seconds: u64) -> Self {
        self.poll_interval_seconds = poll_interval_seconds;
        self
    }

    pub fn with_metadata_table_name(mut self, metadata_table_name: impl Into<String>) -> Self {
        self.metadata_table_name = metadata_table_name.into();
        self
    }

    /// Physical name of a table, with the environment prefix applied.
    pub fn prefixed(&self, table_name: &str) -> String {
        match &self.table_prefix {
            Some(prefix) => format!("{prefix}{table_name}"),
            None => table_name.to_string(),
        }
    }
}

/// Configuration for the table-per-tenant façade. Physical table names are
/// `prefix + tenant + delimiter + virtualName`; no key rewriting happens.
#[derive(Debug, Clone)]
pub struct TablePerTenantConfig {
    pub name: String,
    pub delimiter: char,
    pub table_prefix: Option<String>,
}

impl Default for TablePerTenantConfig {
    fn default() -> Self {
        Self {
            name: "MtAmazonDynamoDbByTable".to_string(),
            delimiter: DEFAULT_DELIMITER,
            table_prefix: None,
        }
    }
}

impl TablePerTenantConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_table_prefix(mut self, table_prefix: impl Into<String>) -> Self {
        self.table_prefix = Some(table_prefix.into());
        self
    }
}

/// Configuration for the caching streams adapter.
#[derive(Debug, Clone)]
pub struct StreamsCacheConfig {
    /// Maximum number of cached segments before FIFO eviction kicks in.
    pub max_segments: usize,
    /// Maximum `get_records` attempts when the underlying endpoint keeps
    /// reporting its rate limit exceeded.
    pub max_retries: u32,
    /// Base backoff; attempt `n` sleeps `n × backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for StreamsCacheConfig {
    fn default() -> Self {
        Self {
            max_segments: 1000,
            max_retries: 10,
            backoff_ms: 1000,
        }
    }
}

impl StreamsCacheConfig {
    pub fn with_max_segments(mut self, max_segments: usize) -> Self {
        self.max_segments = max_segments;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }
}
