use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtdbErrorCode {
    NoTenantContext,
    TableNotFound,
    TableAlreadyExists,
    IncompatibleSchema,
    NoCompatibleIndex,
    UnsupportedPredicate,
    UnsupportedOperation,
    MalformedPhysicalKey,
    MalformedExpression,
    MalformedIterator,
    ConditionalCheckFailed,
    LimitExceeded,
    IteratorExpired,
    Validation,
    Store,
    Cancelled,
}

impl MtdbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MtdbErrorCode::NoTenantContext => "no_tenant_context",
            MtdbErrorCode::TableNotFound => "table_not_found",
            MtdbErrorCode::TableAlreadyExists => "table_already_exists",
            MtdbErrorCode::IncompatibleSchema => "incompatible_schema",
            MtdbErrorCode::NoCompatibleIndex => "no_compatible_index",
            MtdbErrorCode::UnsupportedPredicate => "unsupported_predicate",
            MtdbErrorCode::UnsupportedOperation => "unsupported_operation",
            MtdbErrorCode::MalformedPhysicalKey => "malformed_physical_key",
            MtdbErrorCode::MalformedExpression => "malformed_expression",
            MtdbErrorCode::MalformedIterator => "malformed_iterator",
            MtdbErrorCode::ConditionalCheckFailed => "conditional_check_failed",
            MtdbErrorCode::LimitExceeded => "limit_exceeded",
            MtdbErrorCode::IteratorExpired => "iterator_expired",
            MtdbErrorCode::Validation => "validation",
            MtdbErrorCode::Store => "store",
            MtdbErrorCode::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MtdbError {
    #[error("no tenant context set for the current operation")]
    NoTenantContext,
    #[error("table '{0}' not found")]
    TableNotFound(String),
    #[error("table '{0}' already exists")]
    TableAlreadyExists(String),
    #[error("virtual table '{table}' is not compatible with physical table '{physical}': {reason}")]
    IncompatibleSchema {
        table: String,
        physical: String,
        reason: String,
    },
    #[error("no physical index compatible with index '{index}' on table '{table}'")]
    NoCompatibleIndex { table: String, index: String },
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("malformed physical key '{key}': {reason}")]
    MalformedPhysicalKey { key: String, reason: String },
    #[error("malformed expression: {0}")]
    MalformedExpression(String),
    #[error("malformed shard iterator: {0}")]
    MalformedIterator(String),
    #[error("conditional check failed")]
    ConditionalCheckFailed,
    #[error("rate limit exceeded")]
    LimitExceeded,
    #[error("shard iterator expired")]
    IteratorExpired,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl MtdbError {
    pub fn code(&self) -> MtdbErrorCode {
        match self {
            MtdbError::NoTenantContext => MtdbErrorCode::NoTenantContext,
            MtdbError::TableNotFound(_) => MtdbErrorCode::TableNotFound,
            MtdbError::TableAlreadyExists(_) => MtdbErrorCode::TableAlreadyExists,
            MtdbError::IncompatibleSchema { .. } => MtdbErrorCode::IncompatibleSchema,
            MtdbError::NoCompatibleIndex { .. } => MtdbErrorCode::NoCompatibleIndex,
            MtdbError::UnsupportedPredicate(_) => MtdbErrorCode::UnsupportedPredicate,
            MtdbError::UnsupportedOperation(_) => MtdbErrorCode::UnsupportedOperation,
            MtdbError::MalformedPhysicalKey { .. } => MtdbErrorCode::MalformedPhysicalKey,
            MtdbError::MalformedExpression(_) => MtdbErrorCode::MalformedExpression,
            MtdbError::MalformedIterator(_) => MtdbErrorCode::MalformedIterator,
            MtdbError::ConditionalCheckFailed => MtdbErrorCode::ConditionalCheckFailed,
            MtdbError::LimitExceeded => MtdbErrorCode::LimitExceeded,
            MtdbError::IteratorExpired => MtdbErrorCode::IteratorExpired,
            MtdbError::Validation(_) => MtdbErrorCode::Validation,
            MtdbError::Store(_) => MtdbErrorCode::Store,
            MtdbError::Cancelled => MtdbErrorCode::Cancelled,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}
