//! The retrying webhook deliverer.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use pixgate_core::Tenant;

use crate::event::WebhookEvent;
use crate::signature::{sign, SIGNATURE_HEADER};

const USER_AGENT: &str = "pixgate-webhook/0.3";

/// Delivery tunables.
#[derive(Debug, Clone)]
pub struct DelivererConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for DelivererConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Delivery {
    url: String,
    secret: String,
    event: WebhookEvent,
}

/// Clonable handle for enqueuing events.
#[derive(Clone)]
pub struct WebhookSender {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl WebhookSender {
    /// Enqueue an event for the tenant. Returns whether anything was
    /// enqueued (tenants without a configured webhook are skipped).
    pub fn enqueue(&self, tenant: &Tenant, event: WebhookEvent) -> bool {
        if !tenant.wants_webhooks() {
            return false;
        }
        let (Some(url), Some(secret)) = (&tenant.webhook_url, &tenant.webhook_secret) else {
            return false;
        };
        let delivery = Delivery {
            url: url.clone(),
            secret: secret.clone(),
            event,
        };
        self.tx.send(delivery).is_ok()
    }
}

/// Background task POSTing signed events with bounded retries.
pub struct WebhookDeliverer {
    config: DelivererConfig,
    http: Client,
}

impl WebhookDeliverer {
    pub fn new(config: DelivererConfig) -> Self {
        Self {
            config,
            http: Client::new(),
        }
    }

    /// Create the sender handle and spawn the delivery loop. The loop exits
    /// once every sender is dropped and the queue drains.
    pub fn spawn(self) -> (WebhookSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                self.deliver(delivery).await;
            }
        });
        (WebhookSender { tx }, handle)
    }

    async fn deliver(&self, delivery: Delivery) {
        let body = match serde_json::to_vec(&delivery.event) {
            Ok(body) => body,
            Err(e) => {
                error!(event_id = %delivery.event.event_id, error = %e, "unserializable webhook event");
                return;
            }
        };
        // Sign the exact bytes that go on the wire.
        let signature = sign(&body, &delivery.secret);

        for attempt in 1..=self.config.max_attempts {
            let result = self
                .http
                .post(&delivery.url)
                .timeout(self.config.request_timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .header(SIGNATURE_HEADER, &signature)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        event_id = %delivery.event.event_id,
                        attempt,
                        "webhook delivered"
                    );
                    return;
                }
                Ok(response) => {
                    warn!(
                        event_id = %delivery.event.event_id,
                        attempt,
                        code = %format!("WEBHOOK_HTTP_{}", response.status().as_u16()),
                        "webhook delivery rejected"
                    );
                }
                Err(e) => {
                    warn!(
                        event_id = %delivery.event.event_id,
                        attempt,
                        error = %e.without_url(),
                        "webhook delivery failed"
                    );
                }
            }

            if attempt < self.config.max_attempts {
                let exp = 2_u32.saturating_pow(attempt - 1);
                let delay = self
                    .config
                    .base_delay
                    .saturating_mul(exp)
                    .min(self.config.max_delay);
                tokio::time::sleep(delay).await;
            }
        }

        // No dead-letter queue by contract; polling covers the gap.
        error!(
            event_id = %delivery.event.event_id,
            job_id = %delivery.event.job_id,
            attempts = self.config.max_attempts,
            "webhook delivery exhausted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::verify;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use pixgate_core::{EventId, JobStatus, TenantId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct Captured {
        hits: Arc<AtomicU32>,
        fail_first: u32,
        seen: Arc<std::sync::Mutex<Vec<(Vec<u8>, String)>>>,
    }

    async fn receiver(
        State(state): State<Captured>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> StatusCode {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.seen.lock().unwrap().push((body.to_vec(), signature));
        if hit <= state.fail_first {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    async fn spawn_receiver(fail_first: u32) -> (String, Captured) {
        let state = Captured {
            hits: Arc::new(AtomicU32::new(0)),
            fail_first,
            seen: Arc::new(std::sync::Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/hook", post(receiver))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), state)
    }

    fn tenant(url: &str) -> Tenant {
        Tenant {
            id: TenantId::new(),
            name: "acme".to_string(),
            api_key_lookup: String::new(),
            api_key_fingerprint: String::new(),
            api_key_salt: String::new(),
            plan_rpm: 60,
            plan_concurrency: 5,
            webhook_url: Some(url.to_string()),
            webhook_secret: Some("hook-secret".to_string()),
            webhook_enabled: true,
        }
    }

    fn event() -> WebhookEvent {
        WebhookEvent {
            event_id: EventId::new(),
            job_id: "job_1".to_string(),
            tenant_id: TenantId::new().to_string(),
            status: JobStatus::Succeeded,
            result_urls: Some(vec!["https://blobs.test/jobs/1/0.png".to_string()]),
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn fast_config() -> DelivererConfig {
        DelivererConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn delivered_payloads_verify_against_the_secret() {
        let (url, captured) = spawn_receiver(0).await;
        let (sender, handle) = WebhookDeliverer::new(fast_config()).spawn();

        assert!(sender.enqueue(&tenant(&url), event()));
        drop(sender);
        handle.await.unwrap();

        let seen = captured.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (body, signature) = &seen[0];
        assert!(verify(body, "hook-secret", signature));
        assert!(!verify(body, "other-secret", signature));

        let mut tampered = body.clone();
        tampered[0] ^= 0x01;
        assert!(!verify(&tampered, "hook-secret", signature));
    }

    #[tokio::test]
    async fn retries_until_the_receiver_accepts() {
        let (url, captured) = spawn_receiver(2).await;
        let (sender, handle) = WebhookDeliverer::new(fast_config()).spawn();

        sender.enqueue(&tenant(&url), event());
        drop(sender);
        handle.await.unwrap();

        assert_eq!(captured.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, captured) = spawn_receiver(u32::MAX).await;
        let (sender, handle) = WebhookDeliverer::new(fast_config()).spawn();

        sender.enqueue(&tenant(&url), event());
        drop(sender);
        handle.await.unwrap();

        assert_eq!(captured.hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn tenants_without_webhooks_are_skipped() {
        let (sender, handle) = WebhookDeliverer::new(fast_config()).spawn();
        let mut t = tenant("http://127.0.0.1:1/hook");
        t.webhook_enabled = false;
        assert!(!sender.enqueue(&t, event()));
        drop(sender);
        handle.await.unwrap();
    }
}
