//! End-to-end crawl runs against a scripted fetcher and an in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use fleet_core::{Car, CarPatch, CarStatus, CrawlMode, CrawlState, CrawlStatePatch};
use fleet_crawl::{
    CrawlConfig, CrawlError, Crawler, FetchError, PageFetcher, PageResponse, StopReason,
};
use fleet_store::{GarageStore, StoreError};

fn config() -> CrawlConfig {
    CrawlConfig {
        supabase_url: "http://localhost".to_string(),
        supabase_service_role_key: "test-key".to_string(),
        user_agent: "test".to_string(),
        timezone: "Europe/London".parse().expect("known timezone"),
        min_delay: 0.0,
        max_delay: 0.0,
        cooldown: Duration::ZERO,
        max_attempts: 1,
        fleet_url_template: "https://fleet.test/fleet?p={p}".to_string(),
        car_url_template: "https://fleet.test/car/{car_id}".to_string(),
    }
}

/// Wednesday 2025-06-11 15:00 in London.
fn now() -> DateTime<Tz> {
    "Europe/London"
        .parse::<Tz>()
        .expect("known timezone")
        .with_ymd_and_hms(2025, 6, 11, 15, 0, 0)
        .single()
        .expect("valid local time")
}

fn listing_page(rows: &[(i64, &str, &str, &str)]) -> String {
    let mut html = String::from(
        r#"<html><body>
        <select id="marque">
          <option>All Marques</option>
          <option>Porsche</option>
          <option>Land Rover</option>
          <option>Rover</option>
        </select>
        <table class="data"><tbody>"#,
    );
    for (car_id, owner, display_name, updated) in rows {
        html.push_str(&format!(
            r#"<tr><td>{owner}</td><td>-</td>
               <td><a href="/members/showCar.asp?carId={car_id}">{display_name}</a></td>
               <td>-</td><td>{updated}</td></tr>"#
        ));
    }
    html.push_str("</tbody></table></body></html>");
    html
}

fn empty_listing() -> String {
    r#"<html><body><select id="marque"><option>Porsche</option></select></body></html>"#
        .to_string()
}

fn detail_page(ownership: &str, notes: &str) -> String {
    format!(r#"<div id="ownership">{ownership}</div><div id="notes">{notes}</div>"#)
}

fn ok(body: String) -> PageResponse {
    PageResponse { status: 200, body }
}

/// Serves a fixed URL -> response map; anything unmapped is a 404 with an
/// empty body. Records every URL fetched, in order.
struct ScriptedFetcher {
    pages: HashMap<String, PageResponse>,
    log: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn new(pages: HashMap<String, PageResponse>) -> Self {
        Self {
            pages,
            log: Mutex::new(Vec::new()),
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn get(&self, url: &str) -> Result<PageResponse, FetchError> {
        self.log.lock().expect("lock").push(url.to_string());
        Ok(self.pages.get(url).cloned().unwrap_or(PageResponse {
            status: 404,
            body: String::new(),
        }))
    }
}

/// In-memory `GarageStore` with the same merge semantics as the real one.
#[derive(Default)]
struct MemoryStore {
    state: Mutex<CrawlState>,
    cars: Mutex<BTreeMap<i64, Car>>,
    state_writes: Mutex<Vec<CrawlStatePatch>>,
}

impl MemoryStore {
    fn with_state(state: CrawlState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Default::default()
        }
    }

    fn state(&self) -> CrawlState {
        self.state.lock().expect("lock").clone()
    }

    fn car(&self, car_id: i64) -> Option<Car> {
        self.cars.lock().expect("lock").get(&car_id).cloned()
    }

    fn car_count(&self) -> usize {
        self.cars.lock().expect("lock").len()
    }

    fn state_write_count(&self) -> usize {
        self.state_writes.lock().expect("lock").len()
    }
}

#[async_trait]
impl GarageStore for MemoryStore {
    async fn read_state(&self) -> Result<CrawlState, StoreError> {
        Ok(self.state.lock().expect("lock").clone())
    }

    async fn write_state(&self, patch: CrawlStatePatch) -> Result<(), StoreError> {
        self.state.lock().expect("lock").apply(&patch);
        self.state_writes.lock().expect("lock").push(patch);
        Ok(())
    }

    async fn read_car(&self, car_id: i64) -> Result<Option<Car>, StoreError> {
        Ok(self.cars.lock().expect("lock").get(&car_id).cloned())
    }

    async fn upsert_car(&self, car: &Car) -> Result<(), StoreError> {
        self.cars
            .lock()
            .expect("lock")
            .insert(car.car_id, car.clone());
        Ok(())
    }

    async fn patch_car(&self, car_id: i64, patch: &CarPatch) -> Result<(), StoreError> {
        let mut cars = self.cars.lock().expect("lock");
        if let Some(car) = cars.get_mut(&car_id) {
            car.apply(patch);
        }
        Ok(())
    }
}

#[tokio::test]
async fn nightly_stops_at_the_previous_head_signature() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(1),
        ok(listing_page(&[
            (101, "alice", "Porsche 911 (2019)", "09:49"),
            (102, "bob", "Land Rover Defender", "Yesterday (22:19)"),
            (103, "carol", "Rover 75", "Friday"),
        ])),
    );
    pages.insert(cfg.car_url(101), ok(detail_page("Current Car", "Daily.")));
    pages.insert(cfg.car_url(102), ok(detail_page("Current Car", "")));
    // 103's detail must never be requested.

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::with_state(CrawlState {
        last_fleet_signature: Some("103|carol|Friday".to_string()),
        last_mode: Some(CrawlMode::Nightly),
        ..Default::default()
    });

    let summary = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Nightly, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(summary.stop, StopReason::SignatureMatched { page: 1 });
    assert_eq!(summary.rows_seen, 2);
    assert_eq!(summary.cars_created, 2);
    assert_eq!(summary.cars_patched, 0);

    // Listing page plus two detail pages, nothing more.
    assert_eq!(
        fetcher.fetched(),
        vec![cfg.fleet_url(1), cfg.car_url(101), cfg.car_url(102)]
    );

    let state = store.state();
    assert_eq!(
        state.last_fleet_signature.as_deref(),
        Some("101|alice|09:49")
    );
    assert_eq!(state.last_mode, Some(CrawlMode::Nightly));
    assert_eq!(state.last_completed_page, None);
}

#[tokio::test]
async fn nightly_first_run_walks_to_exhaustion_and_records_the_head() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(1),
        ok(listing_page(&[(101, "alice", "Porsche 911", "09:49")])),
    );
    pages.insert(cfg.fleet_url(2), ok(empty_listing()));
    pages.insert(cfg.car_url(101), ok(detail_page("Current Car", "")));

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::default();

    let summary = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Nightly, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(summary.stop, StopReason::ListingExhausted);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.cars_created, 1);

    let state = store.state();
    assert_eq!(
        state.last_fleet_signature.as_deref(),
        Some("101|alice|09:49")
    );
    assert_eq!(state.last_mode, Some(CrawlMode::Nightly));
    assert_eq!(state.last_completed_page, None);
}

#[tokio::test]
async fn backfill_resumes_after_the_last_completed_page() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(cfg.fleet_url(6), ok(empty_listing()));

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::with_state(CrawlState {
        last_mode: Some(CrawlMode::Initial),
        last_completed_page: Some(5),
        ..Default::default()
    });

    let summary = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Initial, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(summary.stop, StopReason::ListingExhausted);
    assert_eq!(fetcher.fetched(), vec![cfg.fleet_url(6)]);
    // An empty page writes no checkpoint.
    assert_eq!(store.state_write_count(), 0);
}

#[tokio::test]
async fn backfill_ignores_a_nightly_checkpoint_and_starts_at_page_one() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(cfg.fleet_url(1), ok(empty_listing()));

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::with_state(CrawlState {
        last_mode: Some(CrawlMode::Nightly),
        last_completed_page: Some(5),
        ..Default::default()
    });

    Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Initial, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(fetcher.fetched(), vec![cfg.fleet_url(1)]);
}

#[tokio::test]
async fn backfill_stops_at_the_historical_cutoff() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(1),
        ok(listing_page(&[
            (101, "alice", "Porsche 911", "09:49"),
            (102, "bob", "Rover 75", "Monday 26th January 2015"),
            (103, "carol", "Land Rover Defender", "09:00"),
        ])),
    );
    pages.insert(cfg.car_url(101), ok(detail_page("Current Car", "")));
    // 102 and 103 must never be requested.

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::default();

    let summary = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Initial, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(summary.stop, StopReason::CutoffReached { page: 1 });
    assert_eq!(summary.rows_seen, 1);
    assert_eq!(summary.cars_created, 1);
    assert_eq!(
        fetcher.fetched(),
        vec![cfg.fleet_url(1), cfg.car_url(101)]
    );

    let state = store.state();
    assert_eq!(state.last_mode, Some(CrawlMode::Initial));
    assert_eq!(state.last_completed_page, Some(1));
    assert_eq!(state.last_fleet_signature, None);
}

#[tokio::test]
async fn missing_and_soft_error_detail_pages_are_skipped() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(1),
        ok(listing_page(&[
            (101, "alice", "Porsche 911", "09:49"),
            (102, "bob", "Rover 75", "09:48"),
            (103, "carol", "Land Rover Defender", "09:47"),
        ])),
    );
    // 101 has no mapped detail page, so the fetcher answers 404.
    pages.insert(
        cfg.car_url(102),
        ok("<html>Oops! We can't find that page.</html>".to_string()),
    );
    pages.insert(cfg.car_url(103), ok(detail_page("Current Car", "")));
    pages.insert(cfg.fleet_url(2), ok(empty_listing()));

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::default();

    let summary = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Initial, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(summary.rows_seen, 3);
    assert_eq!(summary.rows_skipped, 2);
    assert_eq!(summary.cars_created, 1);
    assert_eq!(store.car_count(), 1);
    assert!(store.car(103).is_some());
}

#[tokio::test]
async fn persistent_detail_403_aborts_without_checkpointing() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(1),
        ok(listing_page(&[
            (101, "alice", "Porsche 911", "09:49"),
            (102, "bob", "Rover 75", "09:48"),
        ])),
    );
    // The fetcher has already burned its cooldown retries by the time the
    // orchestrator sees this 403.
    pages.insert(
        cfg.car_url(101),
        PageResponse {
            status: 403,
            body: String::new(),
        },
    );

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::default();

    let err = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Initial, now())
        .await
        .expect_err("run aborts");
    match err {
        CrawlError::Blocked { url } => assert_eq!(url, cfg.car_url(101)),
        other => panic!("unexpected error: {other}"),
    }

    // The aborted page was never checkpointed and no later row was fetched.
    assert_eq!(store.state_write_count(), 0);
    assert_eq!(store.state(), CrawlState::default());
    assert_eq!(fetcher.fetched(), vec![cfg.fleet_url(1), cfg.car_url(101)]);
}

#[tokio::test]
async fn listing_server_error_aborts_with_state_untouched() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(4),
        PageResponse {
            status: 500,
            body: "Internal Server Error".to_string(),
        },
    );

    let fetcher = ScriptedFetcher::new(pages);
    let prior = CrawlState {
        last_mode: Some(CrawlMode::Initial),
        last_completed_page: Some(3),
        ..Default::default()
    };
    let store = MemoryStore::with_state(prior.clone());

    let err = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Initial, now())
        .await
        .expect_err("run aborts");
    match err {
        CrawlError::ListingUpstream { status, page } => {
            assert_eq!(status, 500);
            assert_eq!(page, 4);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The pre-abort checkpoint survives for the next invocation to resume.
    assert_eq!(store.state_write_count(), 0);
    assert_eq!(store.state(), prior);
}

#[tokio::test]
async fn previously_owned_sighting_marks_a_stored_car_sold() {
    let cfg = config();
    let mut pages = HashMap::new();
    pages.insert(
        cfg.fleet_url(1),
        ok(listing_page(&[(101, "alice", "Porsche 911 (2019)", "09:49")])),
    );
    pages.insert(
        cfg.car_url(101),
        ok(detail_page("Previously Owned", "Gone but not forgotten.")),
    );
    pages.insert(cfg.fleet_url(2), ok(empty_listing()));

    let fetcher = ScriptedFetcher::new(pages);
    let store = MemoryStore::default();
    let seen = now().fixed_offset();
    store
        .upsert_car(&Car {
            car_id: 101,
            owner_username: "alice".to_string(),
            display_name: "Porsche 911 (2019)".to_string(),
            make: Some("Porsche".to_string()),
            model: Some("911".to_string()),
            model_year: Some(2019),
            status: CarStatus::Current,
            sold_at: None,
            last_updated_at: None,
            last_updated_raw: "Friday".to_string(),
            notes_current: None,
            notes_history: None,
            first_seen_at: seen,
            last_seen_at: seen,
            last_scraped_at: seen,
        })
        .await
        .expect("seed car");

    let summary = Crawler::new(&cfg, &fetcher, &store)
        .run_at(CrawlMode::Nightly, now())
        .await
        .expect("crawl succeeds");

    assert_eq!(summary.cars_patched, 1);
    assert_eq!(summary.cars_created, 0);

    let car = store.car(101).expect("car still stored");
    assert_eq!(car.status, CarStatus::Sold);
    assert_eq!(car.sold_at, Some(now().fixed_offset()));
    assert_eq!(car.last_updated_raw, "09:49");
}
