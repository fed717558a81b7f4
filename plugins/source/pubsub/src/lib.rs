//! Google Cloud Pub/Sub subscription as a [`MessageSource`], over the REST API.
//!
//! `receive` pulls in batches of `max_messages` and hands them out one by one;
//! `ack` maps to `:acknowledge` and `nack` to `:modifyAckDeadline` with a zero
//! deadline, which makes the message immediately available for redelivery.

mod wire;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use serde::Serialize;

use scanstate_api::{Delivery, MessageSource, SourceError, SourceFuture};

use wire::{
    AcknowledgeRequest, ErrorResponse, ModifyAckDeadlineRequest, PullRequest, PullResponse,
};

/// Environment variable the official client libraries use to target the emulator.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub project_id: String,
    pub subscription_id: String,
    /// Upper bound of messages per `:pull`.
    pub max_messages: u32,
    /// Overrides both the emulator variable and [`DEFAULT_ENDPOINT`].
    pub endpoint: Option<String>,
    /// OAuth2 bearer token. Never sent to the emulator.
    pub access_token: Option<String>,
    /// Pause after a pull that returned nothing.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl PubSubConfig {
    pub fn new(project_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            subscription_id: subscription_id.into(),
            max_messages: 32,
            endpoint: None,
            access_token: None,
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn subscription_path(&self) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, self.subscription_id)
    }

    /// Base URL and whether it points at the emulator.
    pub fn resolve_endpoint(&self, emulator_host: Option<&str>) -> (String, bool) {
        if let Some(endpoint) = &self.endpoint {
            return (endpoint.trim_end_matches('/').to_string(), false);
        }
        match emulator_host.map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                (host.trim_end_matches('/').to_string(), true)
            }
            Some(host) => (format!("http://{host}"), true),
            None => (DEFAULT_ENDPOINT.to_string(), false),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  PubSubSource
// ═══════════════════════════════════════════════════════════════

pub struct PubSubSource {
    http: reqwest::Client,
    base_url: String,
    subscription: String,
    token: Option<String>,
    max_messages: u32,
    poll_interval: Duration,
    /// Pulled but not yet handed out. Held across a pull so concurrent
    /// receivers share one batch instead of issuing parallel pulls.
    buffer: tokio::sync::Mutex<VecDeque<Delivery>>,
    closed: AtomicBool,
}

impl PubSubSource {
    /// Build the client and verify the subscription exists.
    pub async fn connect(config: PubSubConfig) -> Result<Self, SourceError> {
        let emulator = std::env::var(EMULATOR_HOST_ENV).ok();
        Self::connect_with(config, emulator.as_deref()).await
    }

    /// Like [`connect`](Self::connect) with the emulator host passed explicitly.
    pub async fn connect_with(config: PubSubConfig, emulator_host: Option<&str>) -> Result<Self, SourceError> {
        if config.project_id.is_empty() || config.subscription_id.is_empty() {
            return Err(SourceError::Config("project_id and subscription_id are required".into()));
        }
        if config.max_messages == 0 {
            return Err(SourceError::Config("max_messages must be at least 1".into()));
        }

        let (base_url, emulator) = config.resolve_endpoint(emulator_host);
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SourceError::Config(format!("HTTP client: {e}")))?;

        let source = Self {
            http,
            base_url,
            subscription: config.subscription_path(),
            token: if emulator { None } else { config.access_token.clone() },
            max_messages: config.max_messages,
            poll_interval: config.poll_interval,
            buffer: tokio::sync::Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        };

        source.check_subscription().await?;
        tracing::info!(
            subscription = %source.subscription,
            endpoint = %source.base_url,
            emulator,
            "pubsub source connected"
        );
        Ok(source)
    }

    fn url(&self, method: Option<&str>) -> String {
        match method {
            Some(m) => format!("{}/v1/{}:{m}", self.base_url, self.subscription),
            None => format!("{}/v1/{}", self.base_url, self.subscription),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check_subscription(&self) -> Result<(), SourceError> {
        let resp = self
            .authorize(self.http.get(self.url(None)))
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("get {}: {e}", self.subscription)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = error_detail(resp).await;
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(SourceError::Unavailable(format!("subscription {} not found: {detail}", self.subscription)))
        } else {
            Err(SourceError::Unavailable(format!("get {} ({status}): {detail}", self.subscription)))
        }
    }

    async fn call<B: Serialize>(&self, method: &str, body: &B) -> Result<reqwest::Response, SourceError> {
        let resp = self
            .authorize(self.http.post(self.url(Some(method))))
            .json(body)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{method}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = error_detail(resp).await;
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SourceError::Unavailable(format!("{method} ({status}): {detail}")))
        } else {
            Err(SourceError::Protocol(format!("{method} ({status}): {detail}")))
        }
    }

    async fn pull(&self) -> Result<Vec<Delivery>, SourceError> {
        let resp = self.call("pull", &PullRequest { max_messages: self.max_messages }).await?;
        let body: PullResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Protocol(format!("pull response: {e}")))?;

        let deliveries: Vec<Delivery> = body
            .received_messages
            .into_iter()
            .map(|m| {
                let data = match base64::engine::general_purpose::STANDARD.decode(&m.message.data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // Left to the worker's decode failure policy.
                        tracing::warn!(message_id = %m.message.message_id, error = %e, "message data is not base64");
                        m.message.data.into_bytes()
                    }
                };
                Delivery {
                    ack_id: m.ack_id,
                    data,
                    delivery_attempt: m.delivery_attempt.unwrap_or(1),
                }
            })
            .collect();

        tracing::debug!(subscription = %self.subscription, count = deliveries.len(), "pulled messages");
        Ok(deliveries)
    }

    async fn modify_deadline(&self, ack_ids: &[&str], seconds: u32) -> Result<(), SourceError> {
        self.call("modifyAckDeadline", &ModifyAckDeadlineRequest { ack_ids, ack_deadline_seconds: seconds })
            .await
            .map(|_| ())
    }
}

async fn error_detail(resp: reqwest::Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(e) if !e.error.status.is_empty() => format!("{}: {}", e.error.status, e.error.message),
        Ok(e) => e.error.message,
        Err(_) => text,
    }
}

fn settle_error(ack_id: &str, e: SourceError) -> SourceError {
    SourceError::Settle { ack_id: ack_id.to_string(), detail: e.to_string() }
}

impl MessageSource for PubSubSource {
    /// Dropping this future while a pull is in flight loses that batch on the
    /// client side; the server redelivers it once the ack deadline passes.
    fn receive(&self) -> SourceFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(None);
                }

                let mut buffer = self.buffer.lock().await;
                if let Some(delivery) = buffer.pop_front() {
                    return Ok(Some(delivery));
                }

                let pulled = self.pull().await?;
                if pulled.is_empty() {
                    drop(buffer);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                buffer.extend(pulled);
            }
        })
    }

    fn ack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            self.call("acknowledge", &AcknowledgeRequest { ack_ids: &[ack_id] })
                .await
                .map(|_| ())
                .map_err(|e| settle_error(ack_id, e))
        })
    }

    fn nack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async move { self.modify_deadline(&[ack_id], 0).await.map_err(|e| settle_error(ack_id, e)) })
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }

            let buffered: Vec<Delivery> = self.buffer.lock().await.drain(..).collect();
            if !buffered.is_empty() {
                let ids: Vec<&str> = buffered.iter().map(|d| d.ack_id.as_str()).collect();
                // Best effort: unreturned messages come back after the ack deadline anyway.
                if let Err(e) = self.modify_deadline(&ids, 0).await {
                    tracing::warn!(count = ids.len(), error = %e, "failed to return buffered messages");
                }
            }
            tracing::info!(subscription = %self.subscription, returned = buffered.len(), "pubsub source closed");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.subscription
    }
}
