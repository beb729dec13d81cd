//! Persistence gateway: the `GarageStore` contract plus the Supabase
//! (PostgREST) implementation with transient-failure retries.

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Car, CarPatch, CrawlState, CrawlStatePatch};
use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fleet-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decoding store response: {message}")]
    Decode { message: String },
    #[error("request for {operation} cannot be retried")]
    NotRetryable { operation: String },
}

/// Substrings that have historically marked transient backend failures
/// (Cloudflare error pages, gateway hiccups, HTML bodies where JSON was
/// expected). Used only as a fallback when no structured signal applies.
const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "cloudflare",
    "internal server error",
    "json could not be generated",
    "expecting value",
    "timed out",
    "timeout",
    "connection reset",
];

pub fn message_looks_transient(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_MESSAGE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Decide whether an operation is worth retrying. Structured classification
/// first (timeouts, connect failures, 429/5xx, non-JSON bodies); message
/// scanning is the last resort.
pub fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        StoreError::Status { status, body } => {
            *status == 429 || (500..=599).contains(status) || message_looks_transient(body)
        }
        StoreError::Decode { .. } => true,
        StoreError::NotRetryable { .. } => false,
    }
}

/// Exponential backoff with a small random jitter on top.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            cap: Duration::from_secs(60),
            jitter: Duration::from_millis(1500),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic component: `min(cap, 2^attempt)` seconds, attempt ≥ 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let secs = 2f64.powi(attempt.min(31) as i32);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter.as_secs_f64());
        self.base_delay(attempt) + Duration::from_secs_f64(jitter)
    }
}

/// Read/write contract the crawl engine depends on. Partial-field patches
/// are merged against the stored row; absent fields stay untouched.
#[async_trait]
pub trait GarageStore: Send + Sync {
    async fn read_state(&self) -> Result<CrawlState, StoreError>;
    async fn write_state(&self, patch: CrawlStatePatch) -> Result<(), StoreError>;
    async fn read_car(&self, car_id: i64) -> Result<Option<Car>, StoreError>;
    async fn upsert_car(&self, car: &Car) -> Result<(), StoreError>;
    async fn patch_car(&self, car_id: i64, patch: &CarPatch) -> Result<(), StoreError>;
}

/// Supabase-backed store. Every call is wrapped in bounded retries because
/// the hosted backend intermittently answers with Cloudflare HTML pages
/// instead of PostgREST JSON.
#[derive(Debug)]
pub struct SupabaseStore {
    client: reqwest::Client,
    rest_url: String,
    service_key: String,
    backoff: BackoffPolicy,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_role_key: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            service_key: service_role_key.to_string(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn request(&self, method: Method, path_and_query: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, path_and_query))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn send_with_retries(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<String, StoreError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let cloned = request
                .try_clone()
                .ok_or_else(|| StoreError::NotRetryable {
                    operation: operation.to_string(),
                })?;

            let result = async {
                let response = cloned.send().await?;
                let status = response.status().as_u16();
                let body = response.text().await?;
                if !(200..300).contains(&status) {
                    return Err(StoreError::Status { status, body });
                }
                Ok(body)
            }
            .await;

            match result {
                Ok(body) => return Ok(body),
                Err(err) if is_transient(&err) && attempt < self.backoff.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.backoff.max_attempts,
                        error = %err,
                        "transient store failure, backing off"
                    );
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn decode<T: DeserializeOwned>(operation: &str, body: &str) -> Result<T, StoreError> {
        serde_json::from_str(body).map_err(|e| StoreError::Decode {
            message: format!("{operation}: {e}"),
        })
    }
}

#[async_trait]
impl GarageStore for SupabaseStore {
    async fn read_state(&self) -> Result<CrawlState, StoreError> {
        let body = self
            .send_with_retries(
                "read_state",
                self.request(Method::GET, "scrape_state?id=eq.1&select=*"),
            )
            .await?;
        let rows: Vec<CrawlState> = Self::decode("read_state", &body)?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn write_state(&self, patch: CrawlStatePatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        self.send_with_retries(
            "write_state",
            self.request(Method::PATCH, "scrape_state?id=eq.1")
                .header("Prefer", "return=minimal")
                .json(&patch),
        )
        .await?;
        Ok(())
    }

    async fn read_car(&self, car_id: i64) -> Result<Option<Car>, StoreError> {
        let body = self
            .send_with_retries(
                "read_car",
                self.request(
                    Method::GET,
                    &format!("member_cars?car_id=eq.{car_id}&select=*&limit=1"),
                ),
            )
            .await?;
        let rows: Vec<Car> = Self::decode("read_car", &body)?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_car(&self, car: &Car) -> Result<(), StoreError> {
        self.send_with_retries(
            "upsert_car",
            self.request(Method::POST, "member_cars")
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(car),
        )
        .await?;
        Ok(())
    }

    async fn patch_car(&self, car_id: i64, patch: &CarPatch) -> Result<(), StoreError> {
        self.send_with_retries(
            "patch_car",
            self.request(Method::PATCH, &format!("member_cars?car_id=eq.{car_id}"))
                .header("Prefer", "return=minimal")
                .json(patch),
        )
        .await?;
        Ok(())
    }
}
