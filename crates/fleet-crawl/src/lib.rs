//! Crawl engine: paced fetching, observation reconciliation, and the
//! dual-mode (backfill / nightly) orchestration state machine.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use fleet_core::{
    Car, CarPatch, CarStatus, CrawlMode, CrawlState, CrawlStatePatch, NoteCapture, Patch,
};
use fleet_parse::{
    classify_ownership, detect_soft_error, extract_known_makes, parse_car_details,
    parse_fleet_page, split_display_name, CarDetails, FleetRow, Ownership, FALLBACK_MAKES,
};
use fleet_store::{GarageStore, StoreError};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "fleet-crawl";

/// Backfill stops once listing rows are older than this local date.
const BACKFILL_CUTOFF: (i32, u32, u32) = (2023, 1, 1);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub user_agent: String,
    pub timezone: Tz,
    /// Jitter window (seconds) slept before every upstream request.
    pub min_delay: f64,
    pub max_delay: f64,
    /// Long fixed sleep after a blocking 403 before the next attempt.
    pub cooldown: Duration,
    /// Total fetch attempts per URL (403s consume them).
    pub max_attempts: u32,
    pub fleet_url_template: String,
    pub car_url_template: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl CrawlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let supabase_url = std::env::var("SUPABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("SUPABASE_URL must be set")?;
        let supabase_service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("SUPABASE_SERVICE_ROLE_KEY must be set")?;

        let tz_name = env_or("TIMEZONE", "Europe/London");
        let timezone: Tz = tz_name
            .parse()
            .map_err(|e| anyhow!("invalid TIMEZONE {tz_name:?}: {e}"))?;

        let min_delay = env_parsed("MIN_DELAY_SECONDS", 6.0f64).max(0.0);
        let max_delay = env_parsed("MAX_DELAY_SECONDS", 8.0f64).max(min_delay);

        Ok(Self {
            supabase_url,
            supabase_service_role_key,
            user_agent: env_or(
                "USER_AGENT",
                "Mozilla/5.0 (compatible; FleetTracker/0.1)",
            ),
            timezone,
            min_delay,
            max_delay,
            cooldown: Duration::from_secs(env_parsed("COOLDOWN_SECONDS", 1800u64)),
            max_attempts: env_parsed("MAX_RETRIES", 3u32).max(1),
            fleet_url_template: env_or(
                "FLEET_URL_TEMPLATE",
                "https://www.pistonheads.com/members/fleet.asp?p={p}&s=&m=&marque=&o=&model=",
            ),
            car_url_template: env_or(
                "CAR_URL_TEMPLATE",
                "https://www.pistonheads.com/members/showCar.asp?carId={car_id}",
            ),
        })
    }

    pub fn fleet_url(&self, page: u32) -> String {
        self.fleet_url_template.replace("{p}", &page.to_string())
    }

    pub fn car_url(&self, car_id: i64) -> String {
        self.car_url_template
            .replace("{car_id}", &car_id.to_string())
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Sequential page fetch seam. The production implementation paces itself;
/// tests script it.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<PageResponse, FetchError>;
}

/// Only a 403 is retried here, after a long cooldown; once attempts run out
/// the 403 is handed back and the caller decides (it treats it as fatal).
fn retry_after_403(status: u16, attempt: u32, max_attempts: u32) -> bool {
    status == 403 && attempt < max_attempts
}

/// Rate-limited, cooldown-retrying HTTP GET. One request at a time; pacing
/// is the entire anti-blocking strategy, so no concurrency.
pub struct HttpFetcher {
    client: reqwest::Client,
    min_delay: f64,
    max_delay: f64,
    cooldown: Duration,
    max_attempts: u32,
}

impl HttpFetcher {
    pub fn new(config: &CrawlConfig) -> Result<Self, FetchError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-GB,en;q=0.9"),
        );
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            min_delay: config.min_delay,
            max_delay: config.max_delay,
            cooldown: config.cooldown,
            max_attempts: config.max_attempts.max(1),
        })
    }

    async fn pace(&self) {
        let secs = rand::thread_rng().gen_range(self.min_delay..=self.max_delay);
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<PageResponse, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.pace().await;
            let response = self.client.get(url).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            if retry_after_403(status, attempt, self.max_attempts) {
                warn!(url, attempt, "403 from upstream, cooling down");
                tokio::time::sleep(self.cooldown).await;
                continue;
            }
            return Ok(PageResponse { status, body });
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Ownership text outside the two known literals.
    UnrecognizedOwnership,
    /// A "Previously Owned" observation never creates a record.
    SoldWithoutRecord,
}

/// The single write the current observation warrants.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePlan {
    Skip(SkipReason),
    Create(Car),
    Patch { car_id: i64, patch: CarPatch },
}

/// Merge one observed row + detail against the stored record. Pure: the
/// caller issues the returned write. Repeated application of identical
/// observations is idempotent apart from the refresh timestamps.
pub fn plan_write(
    row: &FleetRow,
    details: &CarDetails,
    existing: Option<&Car>,
    makes: &[String],
    now: DateTime<Tz>,
) -> WritePlan {
    let now_fixed = now.fixed_offset();
    let updated_at = row.updated_at.map(|dt| dt.fixed_offset());

    match classify_ownership(details.ownership.as_deref()) {
        Ownership::Unrecognized => WritePlan::Skip(SkipReason::UnrecognizedOwnership),

        Ownership::PreviouslyOwned => {
            let Some(car) = existing else {
                return WritePlan::Skip(SkipReason::SoldWithoutRecord);
            };
            let mut patch = CarPatch {
                last_updated_at: Patch::set_or_clear(updated_at),
                last_updated_raw: Some(row.updated_raw.clone()),
                last_seen_at: Some(now_fixed),
                last_scraped_at: Some(now_fixed),
                ..Default::default()
            };
            if car.status != CarStatus::Sold {
                patch.status = Some(CarStatus::Sold);
                patch.sold_at = Patch::Set(now_fixed);
            }
            WritePlan::Patch {
                car_id: car.car_id,
                patch,
            }
        }

        Ownership::Current => {
            match existing {
                None => {
                    let parts = split_display_name(&row.display_name, makes);
                    let notes = details.notes_text.trim();
                    WritePlan::Create(Car {
                        car_id: row.car_id,
                        owner_username: row.owner.clone(),
                        display_name: row.display_name.clone(),
                        make: parts.make,
                        model: parts.model,
                        model_year: parts.year,
                        status: CarStatus::Current,
                        sold_at: None,
                        last_updated_at: updated_at,
                        last_updated_raw: row.updated_raw.clone(),
                        notes_current: if notes.is_empty() {
                            None
                        } else {
                            Some(notes.to_string())
                        },
                        notes_history: None,
                        first_seen_at: now_fixed,
                        last_seen_at: now_fixed,
                        last_scraped_at: now_fixed,
                    })
                }
                Some(car) => {
                    // A current sighting always wins, even over Sold.
                    let mut patch = CarPatch {
                        owner_username: Some(row.owner.clone()),
                        status: Some(CarStatus::Current),
                        sold_at: Patch::Clear,
                        last_updated_at: Patch::set_or_clear(updated_at),
                        last_updated_raw: Some(row.updated_raw.clone()),
                        last_seen_at: Some(now_fixed),
                        last_scraped_at: Some(now_fixed),
                        ..Default::default()
                    };

                    if car.display_name != row.display_name {
                        let parts = split_display_name(&row.display_name, makes);
                        patch.display_name = Some(row.display_name.clone());
                        patch.make = Patch::set_or_clear(parts.make);
                        patch.model = Patch::set_or_clear(parts.model);
                        patch.model_year = Patch::set_or_clear(parts.year);
                    }

                    let new_notes = details.notes_text.trim();
                    let old_notes = car.notes_current.as_deref().unwrap_or("").trim();
                    if !new_notes.is_empty() && new_notes != old_notes {
                        let mut history = car.notes_history.clone().unwrap_or_default();
                        history.push(NoteCapture {
                            captured_at: now_fixed,
                            notes: new_notes.to_string(),
                        });
                        patch.notes_current = Some(new_notes.to_string());
                        patch.notes_history = Some(history);
                    }

                    WritePlan::Patch {
                        car_id: car.car_id,
                        patch,
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("blocked: 403 persisted after retries for {url}")]
    Blocked { url: String },
    #[error("server error {status} on fleet page {page}")]
    ListingUpstream { status: u16, page: u32 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A listing page produced zero rows.
    ListingExhausted,
    /// Backfill reached a row older than the historical cutoff.
    CutoffReached { page: u32 },
    /// Nightly run re-encountered the previous run's head signature.
    SignatureMatched { page: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlSummary {
    pub mode: CrawlMode,
    pub pages_fetched: u32,
    /// Rows examined, including ones subsequently skipped.
    pub rows_seen: usize,
    pub cars_created: usize,
    pub cars_patched: usize,
    pub rows_skipped: usize,
    pub stop: StopReason,
}

fn initial_start_page(state: &CrawlState) -> u32 {
    // A nightly checkpoint must not steer backfill resumption.
    if state.last_mode == Some(CrawlMode::Initial) {
        if let Some(page) = state.last_completed_page {
            if page >= 1 {
                return page + 1;
            }
        }
    }
    1
}

fn resolve_known_makes(listing_html: &str) -> Vec<String> {
    let extracted = extract_known_makes(listing_html);
    if extracted.is_empty() {
        debug!("live marque extraction came back empty, using fallback list");
        FALLBACK_MAKES.iter().map(|s| s.to_string()).collect()
    } else {
        extracted
    }
}

/// Drives pagination, mode-specific termination, and checkpointing. State is
/// exchanged with the store only at checkpoint boundaries; any fatal error
/// leaves the last committed checkpoint in place so the next invocation
/// resumes instead of restarting.
pub struct Crawler<'a> {
    config: &'a CrawlConfig,
    fetcher: &'a dyn PageFetcher,
    store: &'a dyn GarageStore,
}

impl<'a> Crawler<'a> {
    pub fn new(
        config: &'a CrawlConfig,
        fetcher: &'a dyn PageFetcher,
        store: &'a dyn GarageStore,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
        }
    }

    pub async fn run(&self, mode: CrawlMode) -> Result<CrawlSummary, CrawlError> {
        let now = Utc::now().with_timezone(&self.config.timezone);
        self.run_at(mode, now).await
    }

    /// Like [`run`](Self::run) but with an injected clock reference.
    pub async fn run_at(
        &self,
        mode: CrawlMode,
        now: DateTime<Tz>,
    ) -> Result<CrawlSummary, CrawlError> {
        let now_fixed = now.fixed_offset();
        let state = self.store.read_state().await?;

        let stop_signature = match mode {
            CrawlMode::Nightly => state.last_fleet_signature.clone(),
            CrawlMode::Initial => None,
        };
        let cutoff = self
            .config
            .timezone
            .with_ymd_and_hms(BACKFILL_CUTOFF.0, BACKFILL_CUTOFF.1, BACKFILL_CUTOFF.2, 0, 0, 0)
            .single()
            .expect("cutoff is a valid local time");

        let mut page = match mode {
            CrawlMode::Initial => initial_start_page(&state),
            CrawlMode::Nightly => 1,
        };
        info!(%mode, page, "starting crawl");

        let mut makes: Option<Vec<String>> = None;
        let mut head_signature: Option<String> = None;
        let mut pages_fetched = 0u32;
        let mut rows_seen = 0usize;
        let mut cars_created = 0usize;
        let mut cars_patched = 0usize;
        let mut rows_skipped = 0usize;

        let summary = |stop: StopReason,
                       pages_fetched: u32,
                       rows_seen: usize,
                       cars_created: usize,
                       cars_patched: usize,
                       rows_skipped: usize| CrawlSummary {
            mode,
            pages_fetched,
            rows_seen,
            cars_created,
            cars_patched,
            rows_skipped,
            stop,
        };

        loop {
            let fleet_url = self.config.fleet_url(page);
            let listing = self.fetcher.get(&fleet_url).await?;
            pages_fetched += 1;

            if listing.status == 403 {
                return Err(CrawlError::Blocked { url: fleet_url });
            }
            if listing.status >= 500 {
                return Err(CrawlError::ListingUpstream {
                    status: listing.status,
                    page,
                });
            }

            if makes.is_none() {
                let resolved = resolve_known_makes(&listing.body);
                info!(count = resolved.len(), "marque vocabulary resolved");
                makes = Some(resolved);
            }
            let makes_ref: &[String] = makes.as_deref().unwrap_or(&[]);

            let rows = parse_fleet_page(&listing.body, now);
            if rows.is_empty() {
                info!(page, "no rows on page, end of listing");
                break;
            }

            if mode == CrawlMode::Nightly && head_signature.is_none() {
                head_signature = Some(rows[0].signature.clone());
                debug!(
                    head = %rows[0].signature,
                    stop = stop_signature.as_deref().unwrap_or("<none>"),
                    "nightly signatures"
                );
            }

            for row in &rows {
                if mode == CrawlMode::Nightly
                    && stop_signature.as_deref() == Some(row.signature.as_str())
                {
                    // Everything from here on was covered by the previous run.
                    self.store
                        .write_state(CrawlStatePatch {
                            last_fleet_signature: head_signature.clone(),
                            last_run_at: Some(now_fixed),
                            last_mode: Some(CrawlMode::Nightly),
                            last_completed_page: None,
                        })
                        .await?;
                    info!(page, "reached previous run's head signature");
                    return Ok(summary(
                        StopReason::SignatureMatched { page },
                        pages_fetched,
                        rows_seen,
                        cars_created,
                        cars_patched,
                        rows_skipped,
                    ));
                }

                if mode == CrawlMode::Initial {
                    if let Some(updated_at) = row.updated_at {
                        if updated_at < cutoff {
                            self.store
                                .write_state(CrawlStatePatch {
                                    last_run_at: Some(now_fixed),
                                    last_mode: Some(CrawlMode::Initial),
                                    last_completed_page: Some(page),
                                    ..Default::default()
                                })
                                .await?;
                            info!(page, updated = %updated_at, "reached pre-cutoff row");
                            return Ok(summary(
                                StopReason::CutoffReached { page },
                                pages_fetched,
                                rows_seen,
                                cars_created,
                                cars_patched,
                                rows_skipped,
                            ));
                        }
                    }
                }

                rows_seen += 1;
                let car_url = self.config.car_url(row.car_id);
                let detail = self.fetcher.get(&car_url).await?;
                if detail.status == 403 {
                    return Err(CrawlError::Blocked { url: car_url });
                }
                if detail.status == 404 {
                    debug!(car_id = row.car_id, "detail 404, skipping row");
                    rows_skipped += 1;
                    continue;
                }
                if detect_soft_error(&detail.body) {
                    debug!(car_id = row.car_id, "soft error page, skipping row");
                    rows_skipped += 1;
                    continue;
                }

                let details = parse_car_details(&detail.body);
                let existing = self.store.read_car(row.car_id).await?;
                match plan_write(row, &details, existing.as_ref(), makes_ref, now) {
                    WritePlan::Skip(reason) => {
                        debug!(car_id = row.car_id, ?reason, "row skipped");
                        rows_skipped += 1;
                    }
                    WritePlan::Create(car) => {
                        self.store.upsert_car(&car).await?;
                        cars_created += 1;
                    }
                    WritePlan::Patch { car_id, patch } => {
                        self.store.patch_car(car_id, &patch).await?;
                        cars_patched += 1;
                    }
                }
            }

            // Resumability boundary: the page is fully processed before its
            // checkpoint is written.
            let checkpoint = match mode {
                CrawlMode::Initial => CrawlStatePatch {
                    last_run_at: Some(now_fixed),
                    last_mode: Some(CrawlMode::Initial),
                    last_completed_page: Some(page),
                    ..Default::default()
                },
                CrawlMode::Nightly => CrawlStatePatch {
                    last_run_at: Some(now_fixed),
                    last_mode: Some(CrawlMode::Nightly),
                    ..Default::default()
                },
            };
            self.store.write_state(checkpoint).await?;
            info!(page, rows = rows.len(), "completed page");
            page += 1;
        }

        // Listing exhausted. A nightly run that never matched still records
        // its head signature as tomorrow's baseline.
        if mode == CrawlMode::Nightly {
            if let Some(signature) = head_signature {
                self.store
                    .write_state(CrawlStatePatch {
                        last_fleet_signature: Some(signature),
                        last_run_at: Some(now_fixed),
                        last_mode: Some(CrawlMode::Nightly),
                        last_completed_page: None,
                    })
                    .await?;
            }
        }

        Ok(summary(
            StopReason::ListingExhausted,
            pages_fetched,
            rows_seen,
            cars_created,
            cars_patched,
            rows_skipped,
        ))
    }
}
