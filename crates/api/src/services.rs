//! Shared handler state.

use std::sync::Arc;

use pixgate_store::{JobRepository, TenantRepository};

/// What the HTTP handlers need. The worker pool and webhook deliverer run
/// beside the server and share the same repositories; they are wired in the
/// binary, not here.
pub struct AppServices {
    pub jobs: Arc<dyn JobRepository>,
    pub tenants: Arc<dyn TenantRepository>,
    /// Attempt budget stamped onto new jobs.
    pub max_attempts: u32,
}
