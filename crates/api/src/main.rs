use std::sync::Arc;

use anyhow::Context as _;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use pixgate_api::auth::tenant_for_key;
use pixgate_api::config::AppConfig;
use pixgate_api::middleware::AuthState;
use pixgate_api::services::AppServices;
use pixgate_coord::{CoordConfig, CoordStore, InMemoryCoordStore, RedisCoordStore};
use pixgate_core::{Credential, CredentialId, EndpointTag, RetryPolicy};
use pixgate_provider::{EndpointRegistry, FakeProvider, GeminiDriver, ImageProvider};
use pixgate_storage::{BlobStore, InMemoryBlobStore, LocalBlobStore};
use pixgate_store::{
    CredentialRepository, InMemoryCredentialRepository, InMemoryJobRepository,
    InMemoryTenantRepository, JobRepository, PostgresCredentialRepository,
    PostgresJobRepository, PostgresTenantRepository, TenantRepository,
};
use pixgate_webhook::{DelivererConfig, WebhookDeliverer};
use pixgate_worker::{ExecutorConfig, JobExecutor, RunnerConfig, WorkerHandle, WorkerPool};

struct Gateway {
    services: Arc<AppServices>,
    auth: AuthState,
    worker: WorkerHandle,
    webhook_task: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pixgate_observability::init();
    let config = AppConfig::from_env()?;

    let gateway = if config.use_persistent_stores {
        build_persistent(&config).await?
    } else {
        tracing::warn!("USE_PERSISTENT_STORES=false; running on in-memory stores and the fake provider");
        build_in_memory(&config).await?
    };

    let app = pixgate_api::app::build_router(gateway.services, gateway.auth);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight jobs, then let the webhook queue empty out.
    gateway.worker.shutdown().await;
    let _ = gateway.webhook_task.await;
    Ok(())
}

async fn build_persistent(config: &AppConfig) -> anyhow::Result<Gateway> {
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let jobs: Arc<dyn JobRepository> = Arc::new(PostgresJobRepository::new(pool.clone()));
    let tenants: Arc<dyn TenantRepository> =
        Arc::new(PostgresTenantRepository::new(pool.clone()));
    let credentials: Arc<dyn CredentialRepository> =
        Arc::new(PostgresCredentialRepository::new(pool));

    let coord: Arc<dyn CoordStore> = Arc::new(
        RedisCoordStore::connect(&config.redis_url, CoordConfig::default())
            .await
            .context("failed to connect to Redis")?,
    );
    let blobs: Arc<dyn BlobStore> =
        Arc::new(LocalBlobStore::new(&config.blob_dir, &config.blob_base_url));

    let registry = build_registry(config);
    let provider: Arc<dyn ImageProvider> = Arc::new(
        GeminiDriver::new(registry.clone(), config.endpoint_fallback)
            .with_request_timeout(config.provider_timeout),
    );

    Ok(wire(config, coord, jobs, tenants, credentials, provider, blobs, registry))
}

async fn build_in_memory(config: &AppConfig) -> anyhow::Result<Gateway> {
    let jobs: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
    let tenants_repo = Arc::new(InMemoryTenantRepository::new());
    let credentials_repo = Arc::new(InMemoryCredentialRepository::new());

    if let Some(dev_key) = &config.dev_api_key {
        let tenant = tenant_for_key("dev", dev_key, 120, 10);
        tracing::info!(tenant_id = %tenant.id, "seeded dev tenant");
        tenants_repo.insert(&tenant).await?;
    }
    credentials_repo
        .insert(&Credential {
            id: CredentialId::new(),
            provider: "gemini".to_string(),
            endpoint: EndpointTag::Primary,
            secret: config
                .gemini_api_key
                .clone()
                .unwrap_or_else(|| "dev-credential".to_string()),
            rpm_limit: 60,
            concurrency_limit: 8,
            priority: 0,
            enabled: true,
        })
        .await?;

    let tenants: Arc<dyn TenantRepository> = tenants_repo;
    let credentials: Arc<dyn CredentialRepository> = credentials_repo;
    let coord: Arc<dyn CoordStore> = Arc::new(InMemoryCoordStore::default());
    let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let registry = build_registry(config);
    let provider: Arc<dyn ImageProvider> = Arc::new(FakeProvider::new());

    Ok(wire(config, coord, jobs, tenants, credentials, provider, blobs, registry))
}

fn build_registry(config: &AppConfig) -> EndpointRegistry {
    let mut registry = EndpointRegistry::default_gemini();
    if let Some(url) = &config.gemini_primary_url {
        registry = registry.with_base_url(EndpointTag::Primary, url);
    }
    if let Some(url) = &config.gemini_proxy_url {
        registry = registry.with_base_url(EndpointTag::ProxyA, url);
    }
    registry
}

#[allow(clippy::too_many_arguments)]
fn wire(
    config: &AppConfig,
    coord: Arc<dyn CoordStore>,
    jobs: Arc<dyn JobRepository>,
    tenants: Arc<dyn TenantRepository>,
    credentials: Arc<dyn CredentialRepository>,
    provider: Arc<dyn ImageProvider>,
    blobs: Arc<dyn BlobStore>,
    registry: EndpointRegistry,
) -> Gateway {
    let (webhooks, webhook_task) = WebhookDeliverer::new(DelivererConfig::default()).spawn();

    let executor = JobExecutor::new(
        coord,
        jobs.clone(),
        tenants.clone(),
        credentials,
        provider,
        blobs,
        webhooks,
        registry,
        ExecutorConfig {
            provider: "gemini".to_string(),
            model: pixgate_provider::DEFAULT_MODEL.to_string(),
            global_rpm: config.global_rpm,
            global_concurrency: config.global_concurrency,
            rpm_window_ms: 60_000,
            retry_policy: RetryPolicy {
                max_attempts: config.max_attempts,
                ..RetryPolicy::default()
            },
            endpoint_fallback: config.endpoint_fallback,
        },
    );
    let worker = WorkerPool::new(
        executor,
        jobs.clone(),
        RunnerConfig {
            concurrency: config.worker_concurrency,
            ..RunnerConfig::default()
        },
    )
    .spawn();

    let services = Arc::new(AppServices {
        jobs,
        tenants: tenants.clone(),
        max_attempts: config.max_attempts,
    });
    let auth = AuthState { tenants };

    Gateway {
        services,
        auth,
        worker,
        webhook_task,
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
