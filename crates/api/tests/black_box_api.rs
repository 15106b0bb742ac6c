//! Black-box tests: the real router on an ephemeral port, driven over HTTP.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use pixgate_api::app::build_router;
use pixgate_api::auth::tenant_for_key;
use pixgate_api::middleware::AuthState;
use pixgate_api::services::AppServices;
use pixgate_coord::{CoordStore, InMemoryCoordStore};
use pixgate_core::{Credential, CredentialId, EndpointTag, RetryPolicy, Tenant};
use pixgate_provider::{EndpointRegistry, FakeProvider, ImageProvider};
use pixgate_storage::{BlobStore, InMemoryBlobStore};
use pixgate_store::{
    CredentialRepository, InMemoryCredentialRepository, InMemoryJobRepository,
    InMemoryTenantRepository, JobRepository, TenantRepository,
};
use pixgate_webhook::{DelivererConfig, WebhookDeliverer};
use pixgate_worker::{ExecutorConfig, JobExecutor, RunnerConfig, WorkerPool};

const API_KEY: &str = "pk_test_4f3a2b1c";

struct TestServer {
    base_url: String,
    provider: Arc<FakeProvider>,
    server: tokio::task::JoinHandle<()>,
    // Held so the pool keeps pulling for the server's lifetime.
    _worker: Option<pixgate_worker::WorkerHandle>,
}

impl TestServer {
    /// Full stack: API + worker pool + webhook deliverer on in-memory
    /// stores and the fake provider.
    async fn spawn() -> Self {
        Self::spawn_with(true, |t| t).await
    }

    /// API only; queued jobs stay queued. Used where the test must win the
    /// race against the worker (cancel scenarios).
    async fn spawn_without_worker() -> Self {
        Self::spawn_with(false, |t| t).await
    }

    async fn spawn_with(run_worker: bool, customize: impl FnOnce(Tenant) -> Tenant) -> Self {
        let coord: Arc<InMemoryCoordStore> = Arc::new(InMemoryCoordStore::default());
        let jobs: Arc<InMemoryJobRepository> = Arc::new(InMemoryJobRepository::new());
        let tenants: Arc<InMemoryTenantRepository> = Arc::new(InMemoryTenantRepository::new());
        let credentials: Arc<InMemoryCredentialRepository> =
            Arc::new(InMemoryCredentialRepository::new());
        let provider = Arc::new(FakeProvider::new());
        let blobs: Arc<InMemoryBlobStore> = Arc::new(InMemoryBlobStore::new());

        let tenant = customize(tenant_for_key("acme", API_KEY, 100, 10));
        tenants.insert(&tenant).await.unwrap();
        credentials
            .insert(&Credential {
                id: CredentialId::new(),
                provider: "gemini".to_string(),
                endpoint: EndpointTag::Primary,
                secret: "sk-test".to_string(),
                rpm_limit: 100,
                concurrency_limit: 10,
                priority: 0,
                enabled: true,
            })
            .await
            .unwrap();

        let (webhooks, _webhook_task) = WebhookDeliverer::new(DelivererConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(2),
        })
        .spawn();

        let worker = if run_worker {
            let executor = JobExecutor::new(
                coord.clone() as Arc<dyn CoordStore>,
                jobs.clone() as Arc<dyn JobRepository>,
                tenants.clone() as Arc<dyn TenantRepository>,
                credentials.clone() as Arc<dyn CredentialRepository>,
                provider.clone() as Arc<dyn ImageProvider>,
                blobs.clone() as Arc<dyn BlobStore>,
                webhooks,
                EndpointRegistry::default_gemini(),
                ExecutorConfig {
                    retry_policy: RetryPolicy {
                        base_delay_ms: 50,
                        ..RetryPolicy::default()
                    },
                    ..ExecutorConfig::default()
                },
            );
            Some(
                WorkerPool::new(
                    executor,
                    jobs.clone() as Arc<dyn JobRepository>,
                    RunnerConfig {
                        concurrency: 4,
                        poll_interval: Duration::from_millis(10),
                    },
                )
                .spawn(),
            )
        } else {
            None
        };

        let services = Arc::new(AppServices {
            jobs: jobs.clone() as Arc<dyn JobRepository>,
            tenants: tenants.clone() as Arc<dyn TenantRepository>,
            max_attempts: 4,
        });
        let auth = AuthState {
            tenants: tenants as Arc<dyn TenantRepository>,
        };
        let app = build_router(services, auth);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            provider,
            server,
            _worker: worker,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn submit(
    client: &reqwest::Client,
    base_url: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let res = client
        .post(format!("{base_url}/v1/images/generate"))
        .bearer_auth(API_KEY)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    let body = res.json().await.unwrap_or(json!({}));
    (status, body)
}

async fn poll_until_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    wanted: &str,
) -> serde_json::Value {
    for _ in 0..300 {
        let res = client
            .get(format!("{base_url}/v1/jobs/{job_id}"))
            .bearer_auth(API_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if body["status"] == wanted {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached {wanted}");
}

#[tokio::test]
async fn health_is_open_and_timestamped() {
    let srv = TestServer::spawn_without_worker().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn auth_is_required_for_job_endpoints() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/images/generate", srv.base_url))
        .json(&json!({"prompt": "A red apple"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/v1/jobs", srv.base_url))
        .bearer_auth("pk_wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn x_api_key_header_authenticates() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/v1/jobs", srv.base_url))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn happy_path_submit_poll_succeed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = submit(
        &client,
        &srv.base_url,
        json!({"prompt": "A red apple", "mode": "final"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "QUEUED");
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let final_body = poll_until_status(&client, &srv.base_url, &job_id, "SUCCEEDED").await;
    let urls = final_body["resultUrls"].as_array().unwrap();
    assert_eq!(urls.len(), 1);
    assert!(final_body.get("error").is_none());
}

#[tokio::test]
async fn idempotent_submissions_return_one_job() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();
    let body = json!({"prompt": "A red apple", "mode": "final"});

    let mut ids = Vec::new();
    for _ in 0..2 {
        let res = client
            .post(format!("{}/v1/images/generate", srv.base_url))
            .bearer_auth(API_KEY)
            .header("Idempotency-Key", "K1")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = res.json().await.unwrap();
        ids.push(body["jobId"].as_str().unwrap().to_string());
    }
    assert_eq!(ids[0], ids[1]);

    // Exactly one row exists.
    let res = client
        .get(format!("{}/v1/jobs", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    let listing: serde_json::Value = res.json().await.unwrap();
    assert_eq!(listing["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn validation_failures_are_400_invalid_request() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();

    for body in [
        json!({"prompt": ""}),
        json!({"prompt": "A red apple", "sampleCount": 0}),
        json!({"prompt": "A red apple", "sampleCount": 11}),
        json!({"prompt": "A red apple", "mode": "fastest"}),
        json!({"prompt": "A red apple", "resolution": "8K"}),
        json!({"prompt": "A red apple", "aspectRatio": "2:1"}),
        json!({"prompt": "A red apple", "inputImage": "http://not-a-data-uri"}),
        json!({"prompt": "A red apple", "inputImage": "data:image/tiff;base64,aGk="}),
    ] {
        let (status, response) = submit(&client, &srv.base_url, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert_eq!(response["error"], "INVALID_REQUEST", "body: {body}");
    }
}

#[tokio::test]
async fn unknown_job_is_404() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/v1/jobs/job_nonexistent", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_before_work_wins_and_no_provider_call_happens() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();

    let (_, body) = submit(&client, &srv.base_url, json!({"prompt": "A red apple"})).await;
    let job_id = body["jobId"].as_str().unwrap();

    let res = client
        .delete(format!("{}/v1/jobs/{job_id}", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "CANCELED");

    // Terminal and immutable; a second cancel is an invalid state.
    let res = client
        .delete(format!("{}/v1/jobs/{job_id}", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "INVALID_STATE");

    assert_eq!(srv.provider.call_count(), 0);
}

#[tokio::test]
async fn listing_pages_with_cursor_and_status_filter() {
    let srv = TestServer::spawn_without_worker().await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        submit(&client, &srv.base_url, json!({"prompt": format!("prompt {i}")})).await;
    }

    let res = client
        .get(format!("{}/v1/jobs?limit=2", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["hasMore"], true);

    let cursor = page["nextCursor"].as_str().unwrap();
    let res = client
        .get(format!("{}/v1/jobs?limit=2&cursor={cursor}", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    let next: serde_json::Value = res.json().await.unwrap();
    assert_eq!(next["items"].as_array().unwrap().len(), 1);
    assert_eq!(next["hasMore"], false);

    // Everything is still queued; the SUCCEEDED filter is empty.
    let res = client
        .get(format!("{}/v1/jobs?status=SUCCEEDED", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    let filtered: serde_json::Value = res.json().await.unwrap();
    assert!(filtered["items"].as_array().unwrap().is_empty());

    let res = client
        .get(format!("{}/v1/jobs?status=NONSENSE", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn successful_jobs_deliver_a_verifiable_webhook() {
    use axum::extract::State;
    use axum::routing::post;

    type Seen = Arc<std::sync::Mutex<Vec<(Vec<u8>, String)>>>;

    async fn hook(
        State(seen): State<Seen>,
        headers: axum::http::HeaderMap,
        body: axum::body::Bytes,
    ) -> StatusCode {
        let signature = headers
            .get("X-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        seen.lock().unwrap().push((body.to_vec(), signature));
        StatusCode::OK
    }

    let seen: Seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let receiver = axum::Router::new()
        .route("/hook", post(hook))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hook_url = format!("http://{}/hook", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, receiver).await.unwrap();
    });

    let srv = TestServer::spawn_with(true, |mut tenant| {
        tenant.webhook_url = Some(hook_url);
        tenant.webhook_secret = Some("hook-secret".to_string());
        tenant.webhook_enabled = true;
        tenant
    })
    .await;
    let client = reqwest::Client::new();

    let (_, body) = submit(
        &client,
        &srv.base_url,
        json!({"prompt": "A red apple", "mode": "final"}),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();
    poll_until_status(&client, &srv.base_url, &job_id, "SUCCEEDED").await;

    // The delivery races the status poll; wait for it.
    for _ in 0..200 {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let deliveries = seen.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (raw_body, signature) = &deliveries[0];
    assert!(pixgate_webhook::verify(raw_body, "hook-secret", signature));

    let mut tampered = raw_body.clone();
    tampered[0] ^= 0x01;
    assert!(!pixgate_webhook::verify(&tampered, "hook-secret", signature));

    let event: serde_json::Value = serde_json::from_slice(raw_body).unwrap();
    assert_eq!(event["jobId"], job_id);
    assert_eq!(event["status"], "SUCCEEDED");
    assert_eq!(event["resultUrls"].as_array().unwrap().len(), 1);
    assert!(event["eventId"].as_str().unwrap().starts_with("evt_"));
}

#[tokio::test]
async fn retryable_provider_failure_retries_to_success() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    srv.provider.push_error(pixgate_core::ErrorCode::ServerError);

    let (_, body) = submit(
        &client,
        &srv.base_url,
        json!({"prompt": "A red apple", "mode": "final"}),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let final_body = poll_until_status(&client, &srv.base_url, &job_id, "SUCCEEDED").await;
    assert_eq!(final_body["resultUrls"].as_array().unwrap().len(), 1);
    assert_eq!(srv.provider.call_count(), 2);
}
