//! Core domain model for the member fleet tracker.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fleet-core";

/// Which flavour of crawl a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    /// Exhaustive historical backfill, bounded by a fixed date cutoff.
    Initial,
    /// Incremental sync bounded by the previous run's head signature.
    Nightly,
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlMode::Initial => write!(f, "initial"),
            CrawlMode::Nightly => write!(f, "nightly"),
        }
    }
}

/// Singleton crawl checkpoint row. Only the orchestrator writes it, and only
/// at checkpoint boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlState {
    #[serde(default)]
    pub last_fleet_signature: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub last_mode: Option<CrawlMode>,
    #[serde(default)]
    pub last_completed_page: Option<u32>,
}

impl CrawlState {
    pub fn apply(&mut self, patch: &CrawlStatePatch) {
        if let Some(sig) = &patch.last_fleet_signature {
            self.last_fleet_signature = Some(sig.clone());
        }
        if let Some(at) = patch.last_run_at {
            self.last_run_at = Some(at);
        }
        if let Some(mode) = patch.last_mode {
            self.last_mode = Some(mode);
        }
        if let Some(page) = patch.last_completed_page {
            self.last_completed_page = Some(page);
        }
    }
}

/// Partial update for [`CrawlState`]. Absent fields are left untouched by the
/// gateway; checkpoint fields are only ever set, never cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrawlStatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fleet_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mode: Option<CrawlMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_page: Option<u32>,
}

impl CrawlStatePatch {
    pub fn is_empty(&self) -> bool {
        self.last_fleet_signature.is_none()
            && self.last_run_at.is_none()
            && self.last_mode.is_none()
            && self.last_completed_page.is_none()
    }
}

/// Lifecycle status of a tracked car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarStatus {
    Current,
    Sold,
}

/// One captured revision of a car's free-text notes. The history list is
/// append-only and never reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteCapture {
    pub captured_at: DateTime<FixedOffset>,
    pub notes: String,
}

/// Persisted car record, one per distinct `car_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Car {
    pub car_id: i64,
    pub owner_username: String,
    pub display_name: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub model_year: Option<i32>,
    pub status: CarStatus,
    pub sold_at: Option<DateTime<FixedOffset>>,
    pub last_updated_at: Option<DateTime<FixedOffset>>,
    pub last_updated_raw: String,
    pub notes_current: Option<String>,
    pub notes_history: Option<Vec<NoteCapture>>,
    pub first_seen_at: DateTime<FixedOffset>,
    pub last_seen_at: DateTime<FixedOffset>,
    pub last_scraped_at: DateTime<FixedOffset>,
}

impl Car {
    pub fn apply(&mut self, patch: &CarPatch) {
        if let Some(v) = &patch.owner_username {
            self.owner_username = v.clone();
        }
        if let Some(v) = &patch.display_name {
            self.display_name = v.clone();
        }
        patch.make.apply_to(&mut self.make);
        patch.model.apply_to(&mut self.model);
        patch.model_year.apply_to(&mut self.model_year);
        if let Some(v) = patch.status {
            self.status = v;
        }
        patch.sold_at.apply_to(&mut self.sold_at);
        patch.last_updated_at.apply_to(&mut self.last_updated_at);
        if let Some(v) = &patch.last_updated_raw {
            self.last_updated_raw = v.clone();
        }
        if let Some(v) = &patch.notes_current {
            self.notes_current = Some(v.clone());
        }
        if let Some(v) = &patch.notes_history {
            self.notes_history = Some(v.clone());
        }
        if let Some(v) = patch.last_seen_at {
            self.last_seen_at = v;
        }
        if let Some(v) = patch.last_scraped_at {
            self.last_scraped_at = v;
        }
    }
}

/// Three-state field update for nullable columns: leave untouched, set to
/// SQL NULL, or set to a value. `Keep` must be skipped during serialization
/// (`skip_serializing_if = "Patch::is_keep"`); `Clear` serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    /// `Some` becomes `Set`, `None` becomes an explicit `Clear`.
    pub fn set_or_clear(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Clear,
        }
    }
}

impl<T: Clone> Patch<T> {
    pub fn apply_to(&self, target: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Clear => *target = None,
            Patch::Set(v) => *target = Some(v.clone()),
        }
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Patch::Keep => Err(serde::ser::Error::custom(
                "Patch::Keep fields must be skipped, not serialized",
            )),
            Patch::Clear => serializer.serialize_none(),
            Patch::Set(v) => serializer.serialize_some(v),
        }
    }
}

/// Partial update for [`Car`]. Non-nullable columns use `Option` (absent or
/// set); nullable columns use [`Patch`] so an explicit NULL write is
/// distinguishable from "leave alone".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CarPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Patch::is_keep")]
    pub make: Patch<String>,
    #[serde(skip_serializing_if = "Patch::is_keep")]
    pub model: Patch<String>,
    #[serde(skip_serializing_if = "Patch::is_keep")]
    pub model_year: Patch<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CarStatus>,
    #[serde(skip_serializing_if = "Patch::is_keep")]
    pub sold_at: Patch<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Patch::is_keep")]
    pub last_updated_at: Patch<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes_current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes_history: Option<Vec<NoteCapture>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scraped_at: Option<DateTime<FixedOffset>>,
}
