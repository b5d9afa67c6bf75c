use compact_str::CompactString;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;

/// The base (no-tenant) context. Tenant-scoped operations reject it.
pub const BASE_CONTEXT: &str = "";

/// Process-wide lookup for the tenant on whose behalf the current logical
/// operation runs. Implementations return [`BASE_CONTEXT`] when no tenant is
/// set; the façades read the value exactly once per operation at entry and
/// thread it explicitly from there.
pub trait TenantContextProvider: Send + Sync + std::fmt::Debug {
    fn tenant_id(&self) -> CompactString;
}

fn normalize(tenant_id: &str) -> CompactString {
    let trimmed = tenant_id.trim();
    if trimmed.is_empty() {
        CompactString::const_new(BASE_CONTEXT)
    } else {
        CompactString::from(tenant_id)
    }
}

tokio::task_local! {
    static TENANT_CONTEXT: CompactString;
}

/// Provider backed by tokio task-local storage: the tenant travels with the
/// task that entered the scope and is invisible to unrelated tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLocalTenantContext;

impl TaskLocalTenantContext {
    /// Runs `f` with the given tenant as the current context. Blank values
    /// normalize to the base context.
    pub async fn scope<F>(tenant_id: &str, f: F) -> F::Output
    where
        F: Future,
    {
        TENANT_CONTEXT.scope(normalize(tenant_id), f).await
    }
}

impl TenantContextProvider for TaskLocalTenantContext {
    fn tenant_id(&self) -> CompactString {
        TENANT_CONTEXT
            .try_with(|tenant| tenant.clone())
            .unwrap_or_else(|_| CompactString::const_new(BASE_CONTEXT))
    }
}

/// Provider holding an explicitly set tenant. Useful for single-tenant
/// embeddings and tests.
#[derive(Debug, Default)]
pub struct SettableTenantContext {
    current: RwLock<CompactString>,
}

impl SettableTenantContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, tenant_id: &str) {
        *self.current.write() = normalize(tenant_id);
    }

    pub fn clear(&self) {
        *self.current.write() = CompactString::const_new(BASE_CONTEXT);
    }
}

impl TenantContextProvider for SettableTenantContext {
    fn tenant_id(&self) -> CompactString {
        self.current.read().clone()
    }
}
