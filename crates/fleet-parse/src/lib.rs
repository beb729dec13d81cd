//! Pure parsing for the member fleet crawl: listing rows, detail pages,
//! free-text timestamps, compound display names, and the marque vocabulary.
//!
//! Everything in this crate is side-effect-free so the classifiers and
//! normalizers can be tested without any network or store in play.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

pub const CRATE_NAME: &str = "fleet-parse";

/// One row of the paginated fleet listing, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetRow {
    pub owner: String,
    pub display_name: String,
    pub car_id: i64,
    pub updated_raw: String,
    pub updated_at: Option<DateTime<Tz>>,
    /// Exact-match identity used for incremental stop detection.
    pub signature: String,
}

/// Ownership state and notes extracted from one car detail page.
#[derive(Debug, Clone, PartialEq)]
pub struct CarDetails {
    pub ownership: Option<String>,
    pub notes_text: String,
}

/// Result of splitting a compound display name against the marque vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct NameParts {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
}

/// Tagged ownership classification. Anything outside the two known literals
/// is `Unrecognized` and skipped defensively upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Current,
    PreviouslyOwned,
    Unrecognized,
}

pub fn classify_ownership(raw: Option<&str>) -> Ownership {
    match raw.map(str::trim) {
        Some("Current Car") => Ownership::Current,
        Some("Previously Owned") => Ownership::PreviouslyOwned,
        _ => Ownership::Unrecognized,
    }
}

/// Phrases (lowercase) that mark a 200 response whose content says the
/// profile or car is unavailable. Matched case-insensitively.
const SOFT_ERROR_PHRASES: &[&str] = &[
    "this user's profile is not available",
    "this member limits who may view their full profile",
    "oops",
    "can't find",
    "cannot find",
    "not available",
];

pub fn detect_soft_error(page_text: &str) -> bool {
    let text = page_text.to_lowercase();
    SOFT_ERROR_PHRASES.iter().any(|p| text.contains(p))
}

/// Marques used when live extraction from the listing page yields nothing.
pub const FALLBACK_MAKES: &[&str] = &[
    "AC", "Adams", "AJS", "Alfa Romeo", "Alpina", "Alpine", "Alvis", "Aprilia", "Ariel", "Ascari",
    "Aston Martin", "Audi", "Austin", "Austin Healey", "BAC", "Bedford", "Bentley", "Bitter",
    "BMW", "Bond", "Bowler", "Bristol", "BSA", "Buell", "Bugatti", "Buick", "Cadillac",
    "Caterham", "Chevrolet", "Chrysler", "Citroen", "Comma", "Dacia", "Daf", "Daihatsu",
    "Daimler", "Darrian", "Datsun", "Davrian", "Dax", "De Tomaso", "Delorean", "Dennis", "Dodge",
    "Ducati", "Evante", "Facel Vega", "Farbio", "Ferrari", "Fiat", "Fisher", "Ford",
    "Gardner Douglas", "GB Roadster", "Gilbern", "Ginetta", "GMC", "Gordon-Keeble", "Grinnell",
    "Gumpert", "Harley Davidson", "Hillman", "Holden", "Honda", "Hummer", "Husaberg", "Hyundai",
    "Indian", "Infiniti", "Iso Rivolta", "Isuzu", "Jaguar", "JBA Cars", "Jeep", "Jensen",
    "Kawasaki", "Kia", "Kit Cars", "Koenigsegg", "KTM", "Lada", "Lagonda", "Lamborghini",
    "Lancia", "Land Rover", "Laverda", "Lexus", "Leyland", "Locost", "Lola", "Lotus", "Marcos",
    "Marlin", "Maserati", "Matra", "Mazda", "McLaren", "Mercedes", "Mercury", "Messerschmidt",
    "MG", "MINI", "Mitsubishi", "Morgan", "Morris", "Mosler", "Moto Guzzi", "Moto Morini",
    "Motobi", "MV Agusta", "MZ", "Nissan", "Noble", "Oldsmobile", "Opel", "Other", "Pagani",
    "Panther", "Peugeot", "PGO", "Piaggio", "Polestar", "Pontiac", "Porsche", "Proton",
    "Racing Car", "Radical", "Range Rover", "Reliant", "Renault", "Riley", "Rolls Royce",
    "Rover", "Royal Enfield", "Saab", "Scott", "Seat", "Shelby", "Silk", "Simca", "Singer",
    "Skoda", "smart", "Spyker", "Strathcarron", "Subaru", "Sunbeam", "Suzuki", "Sylva",
    "Talbot", "Tatra", "Tesla", "Toyota", "Trabant", "TriBSA", "Trident", "Triton", "Triumph",
    "TVR", "Ultima", "Vanden Plas", "Vauxhall", "Velocette", "Venturi", "Vincent", "Volkswagen",
    "Volvo", "Westfield", "Wolseley", "Yamaha", "Zenos",
];

/// Collapse all runs of whitespace to single spaces and trim.
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Date normalizer
// ---------------------------------------------------------------------------

static LONG_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday)\s+(\d{1,2})(?:st|nd|rd|th)\s+(January|February|March|April|May|June|July|August|September|October|November|December)(?:\s+(\d{4}))?(?:\s*\((\d{1,2}):(\d{2})\))?$",
    )
    .expect("valid regex")
});

static YESTERDAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Yesterday\s*\((\d{1,2}):(\d{2})\)").expect("valid regex"));

static WEEKDAY_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday)\s*\((\d{1,2}):(\d{2})\)",
    )
    .expect("valid regex")
});

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("valid regex"));

static WEEKDAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday)$")
        .expect("valid regex")
});

fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name.to_lowercase().as_str() {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn month_from_name(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "january" => Some(1),
        "february" => Some(2),
        "march" => Some(3),
        "april" => Some(4),
        "may" => Some(5),
        "june" => Some(6),
        "july" => Some(7),
        "august" => Some(8),
        "september" => Some(9),
        "october" => Some(10),
        "november" => Some(11),
        "december" => Some(12),
        _ => None,
    }
}

fn at_time(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&date.and_hms_opt(hour, minute, 0)?)
        .earliest()
}

/// Most recent occurrence of `target` at `hour:minute`, at or before `now`
/// (searching back at most 7 days).
fn most_recent_weekday(
    now: DateTime<Tz>,
    target: Weekday,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Tz>> {
    let days_back =
        (now.weekday().num_days_from_monday() + 7 - target.num_days_from_monday()) % 7;
    let date = now.date_naive() - Duration::days(i64::from(days_back));
    let candidate = at_time(now.timezone(), date, hour, minute)?;
    if candidate > now {
        Some(candidate - Duration::days(7))
    } else {
        Some(candidate)
    }
}

/// Normalize the listing's free-text "Updated" cell into an absolute local
/// timestamp. Patterns are tried in precedence order; anything unrecognized
/// (or an invalid calendar date) yields `None`.
pub fn parse_fleet_updated(updated_raw: &str, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
    let raw = clean_text(updated_raw);
    let tz = now.timezone();

    // "Monday 26th January" / "Tuesday 23rd September 2025" / optional "(HH:MM)"
    if let Some(caps) = LONG_DATE_RE.captures(&raw) {
        let day: u32 = caps[2].parse().ok()?;
        let month = month_from_name(&caps[3])?;
        let year: i32 = match caps.get(4) {
            Some(y) => y.as_str().parse().ok()?,
            None => now.year(),
        };
        let hour: u32 = caps.get(5).map_or(Ok(0), |h| h.as_str().parse()).ok()?;
        let minute: u32 = caps.get(6).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        return at_time(tz, date, hour, minute);
    }

    // "Yesterday (22:19)"
    if let Some(caps) = YESTERDAY_RE.captures(&raw) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        let date = now.date_naive() - Duration::days(1);
        return at_time(tz, date, hour, minute);
    }

    // "Friday (10:01)"
    if let Some(caps) = WEEKDAY_TIME_RE.captures(&raw) {
        let target = weekday_from_name(&caps[1])?;
        let hour: u32 = caps[2].parse().ok()?;
        let minute: u32 = caps[3].parse().ok()?;
        return most_recent_weekday(now, target, hour, minute);
    }

    // Bare "09:49": today, or yesterday when noticeably in the future.
    if let Some(caps) = TIME_RE.captures(&raw) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        let candidate = at_time(tz, now.date_naive(), hour, minute)?;
        if candidate > now + Duration::minutes(1) {
            return Some(candidate - Duration::days(1));
        }
        return Some(candidate);
    }

    // Bare "Friday": most recent occurrence at midnight.
    if let Some(caps) = WEEKDAY_RE.captures(&raw) {
        let target = weekday_from_name(&caps[1])?;
        return most_recent_weekday(now, target, 0, 0);
    }

    None
}

// ---------------------------------------------------------------------------
// Name splitter
// ---------------------------------------------------------------------------

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(((?:19|20)\d{2})\)\s*$").expect("valid regex"));

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a display string into (make, model, year) against the marque
/// vocabulary. Longest vocabulary entries win, so "Land Rover" beats "Rover".
pub fn split_display_name(display_name: &str, makes: &[String]) -> NameParts {
    let name = display_name.trim();

    let (without_year, year) = match YEAR_RE.captures(name) {
        Some(caps) => {
            let start = caps.get(0).map_or(name.len(), |m| m.start());
            (name[..start].trim(), caps[1].parse::<i32>().ok())
        }
        None => (name, None),
    };
    let rest = clean_text(without_year);

    let mut candidates: Vec<&String> = makes.iter().collect();
    candidates.sort_by_key(|m| std::cmp::Reverse(m.len()));

    for make in candidates {
        if make.is_empty() {
            continue;
        }
        if rest.len() == make.len() && rest.eq_ignore_ascii_case(make) {
            return NameParts {
                make: Some(make.clone()),
                model: None,
                year,
            };
        }
        if rest.len() > make.len()
            && rest.is_char_boundary(make.len())
            && rest[..make.len()].eq_ignore_ascii_case(make)
            && rest.as_bytes()[make.len()] == b' '
        {
            return NameParts {
                make: Some(make.clone()),
                model: non_empty(&rest[make.len()..]),
                year,
            };
        }
    }

    NameParts {
        make: None,
        model: non_empty(&rest),
        year,
    }
}

// ---------------------------------------------------------------------------
// Listing page parser
// ---------------------------------------------------------------------------

static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.data").expect("valid selector"));
static TBODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tbody").expect("valid selector"));
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));
static MARQUE_OPTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("select#marque option").expect("valid selector"));
static OWNERSHIP_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#ownership").expect("valid selector"));
static NOTES_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#notes").expect("valid selector"));

static CAR_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)carId=(\d+)").expect("valid regex"));

fn element_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

/// Extract listing rows in document order. An absent results table yields an
/// empty vec, which the orchestrator treats as end-of-listing. Malformed rows
/// (too few cells, no car link, non-numeric id) are skipped, not fatal.
pub fn parse_fleet_page(html: &str, now: DateTime<Tz>) -> Vec<FleetRow> {
    let document = Html::parse_document(html);
    let Some(table) = document.select(&TABLE_SEL).next() else {
        return Vec::new();
    };

    let rows: Vec<ElementRef<'_>> = match table.select(&TBODY_SEL).next() {
        Some(tbody) => tbody.select(&TR_SEL).collect(),
        None => table.select(&TR_SEL).collect(),
    };

    let mut out = Vec::new();
    for tr in rows {
        let cells: Vec<ElementRef<'_>> = tr.select(&TD_SEL).collect();
        if cells.len() < 5 {
            continue;
        }

        let owner = element_text(cells[0]);

        let Some(link) = cells[2].select(&LINK_SEL).next() else {
            continue;
        };
        let display_name = element_text(link);
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(car_id) = CAR_ID_RE
            .captures(href)
            .and_then(|caps| caps[1].parse::<i64>().ok())
        else {
            continue;
        };

        let updated_raw = element_text(cells[4]);
        let updated_at = parse_fleet_updated(&updated_raw, now);
        let signature = format!("{car_id}|{owner}|{updated_raw}");

        out.push(FleetRow {
            owner,
            display_name,
            car_id,
            updated_raw,
            updated_at,
            signature,
        });
    }
    out
}

/// Pull the marque vocabulary out of the listing page's filter control,
/// dropping placeholder entries and case-insensitive duplicates (first
/// spelling wins). An empty result means the caller should fall back to
/// [`FALLBACK_MAKES`].
pub fn extract_known_makes(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for option in document.select(&MARQUE_OPTION_SEL) {
        let value = element_text(option);
        if value.is_empty() {
            continue;
        }
        let lower = value.to_lowercase();
        if lower == "all marques" || lower == "all" {
            continue;
        }
        if seen.insert(lower) {
            out.push(value);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Detail page parser
// ---------------------------------------------------------------------------

static BR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?\s*>").expect("valid regex"));
static MULTI_NEWLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Flatten the notes element's inner HTML: `<br>` becomes a newline, other
/// markup is dropped, entities are decoded, and 3+ blank-line runs collapse.
fn notes_html_to_text(notes_html: &str) -> String {
    if notes_html.is_empty() {
        return String::new();
    }
    let with_newlines = BR_RE.replace_all(notes_html, "\n");
    let fragment = Html::parse_fragment(&with_newlines);
    let text: String = fragment.root_element().text().collect();
    let text = text.replace("\r\n", "\n");
    MULTI_NEWLINE_RE.replace_all(&text, "\n\n").trim().to_string()
}

pub fn parse_car_details(html: &str) -> CarDetails {
    let document = Html::parse_document(html);
    let ownership = document.select(&OWNERSHIP_SEL).next().map(element_text);
    let notes_text = document
        .select(&NOTES_SEL)
        .next()
        .map(|el| notes_html_to_text(&el.inner_html()))
        .unwrap_or_default();
    CarDetails {
        ownership,
        notes_text,
    }
}
