use std::sync::Arc;

use pixgate_core::{Tenant, TenantId};

/// Tenant context for a request.
///
/// Inserted by the auth middleware; immutable and present for all
/// authenticated routes.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant: Arc<Tenant>,
}

impl TenantContext {
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant: Arc::new(tenant),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant.id
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }
}
