use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Unix milliseconds (UTC), the canonical instant.
pub type Ms = i64;

pub type ManagerId = i64;
pub type SlotId = i64;
pub type BookingId = i64;
pub type CustomerId = i64;

/// Every slot is exactly one hour long.
pub const SLOT_DURATION_MS: Ms = 3_600_000;

const DAY_MS: Ms = 24 * SLOT_DURATION_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The one-hour window starting at `start`.
    pub fn slot_at(start: Ms) -> Self {
        Self::new(start, start.saturating_add(SLOT_DURATION_MS))
    }

    /// The UTC calendar day `[00:00, 24:00)` of `date`.
    pub fn day(date: NaiveDate) -> Self {
        let start = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default();
        Self::new(start, start + DAY_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching boundaries (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A one-hour availability window owned by a single manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    pub manager_id: ManagerId,
    pub span: Span,
    pub booked: bool,
}

impl Slot {
    pub fn new(id: SlotId, manager_id: ManagerId, start: Ms, booked: bool) -> Self {
        Self {
            id,
            manager_id,
            span: Span::slot_at(start),
            booked,
        }
    }

    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.span.overlaps(&other.span)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesManager {
    pub id: ManagerId,
    pub name: Option<String>,
    pub languages: Vec<String>,
    pub products: Vec<String>,
    pub customer_ratings: Vec<String>,
    pub current_load: i64,
}

impl SalesManager {
    pub fn new(
        id: ManagerId,
        name: Option<String>,
        languages: Vec<String>,
        products: Vec<String>,
        customer_ratings: Vec<String>,
    ) -> Self {
        Self {
            id,
            name,
            languages,
            products,
            customer_ratings,
            current_load: 0,
        }
    }

    /// Language and rating membership plus product superset.
    pub fn matches(&self, filter: &SlotFilter) -> bool {
        self.languages.iter().any(|l| *l == filter.language)
            && self.customer_ratings.iter().any(|r| *r == filter.rating)
            && filter
                .products
                .iter()
                .all(|p| self.products.iter().any(|own| own == p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: BookingId,
    pub manager_id: ManagerId,
    pub span: Span,
    pub customer_id: CustomerId,
}

/// A booking row before the store has assigned its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub manager_id: ManagerId,
    pub span: Span,
    pub customer_id: CustomerId,
}

impl NewBooking {
    pub fn for_slot(slot: &Slot, customer_id: CustomerId) -> Self {
        Self {
            manager_id: slot.manager_id,
            span: slot.span,
            customer_id,
        }
    }

    pub fn with_id(self, id: BookingId) -> Booking {
        Booking {
            id,
            manager_id: self.manager_id,
            span: self.span,
            customer_id: self.customer_id,
        }
    }
}

/// Matching criteria shared by the calendar query and the assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotFilter {
    pub date: NaiveDate,
    pub language: String,
    pub rating: String,
    pub products: Vec<String>,
}

impl SlotFilter {
    pub fn day_span(&self) -> Span {
        Span::day(self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub criteria: SlotFilter,
    /// Already normalized to UTC milliseconds.
    pub desired_start: Ms,
    pub customer_id: CustomerId,
}

// ── Results ──────────────────────────────────────────────────────

/// Number of distinct managers free at one canonical start instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarEntry {
    pub start: Ms,
    pub available_count: usize,
}

// ── Instant normalization ────────────────────────────────────────

/// Parse an RFC 3339 / ISO-8601 instant with any offset into UTC milliseconds.
/// A bare `YYYY-MM-DDTHH:MM:SS` without offset is read as UTC.
pub fn parse_instant(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Render as `2024-05-03T10:30:00.000Z`.
pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

/// Render a list as a PostgreSQL text-array literal, e.g. `{German,English}`.
pub fn format_text_array(items: &[String]) -> String {
    format!("{{{}}}", items.join(","))
}

/// Parse a PostgreSQL text-array literal. A value without braces is a single element.
pub fn parse_text_array(s: &str) -> Vec<String> {
    let s = s.trim();
    let inner = s
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(s);
    inner
        .split(',')
        .map(|item| item.trim().trim_matches('"').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = SLOT_DURATION_MS;

    fn manager(languages: &[&str], products: &[&str], ratings: &[&str]) -> SalesManager {
        let owned = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        SalesManager::new(1, None, owned(languages), owned(products), owned(ratings))
    }

    fn filter(language: &str, rating: &str, products: &[&str]) -> SlotFilter {
        SlotFilter {
            date: NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            language: language.into(),
            rating: rating.into(),
            products: products.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn slot_is_one_hour() {
        let s = Slot::new(1, 7, 10 * H, false);
        assert_eq!(s.span.duration_ms(), H);
        assert_eq!(s.start(), 10 * H);
    }

    #[test]
    fn half_hour_offset_slots_overlap() {
        let a = Slot::new(1, 1, 10 * H, false);
        let b = Slot::new(2, 1, 10 * H + H / 2, true);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn day_span_is_utc_midnight_to_midnight() {
        let day = Span::day(NaiveDate::from_ymd_opt(2024, 5, 3).unwrap());
        assert_eq!(format_instant(day.start), "2024-05-03T00:00:00.000Z");
        assert_eq!(format_instant(day.end), "2024-05-04T00:00:00.000Z");
        assert!(day.contains_instant(day.start));
        assert!(!day.contains_instant(day.end));
    }

    #[test]
    fn manager_matching() {
        let m = manager(&["German", "English"], &["SolarPanels", "Heatpumps"], &["Gold", "Bronze"]);
        assert!(m.matches(&filter("German", "Gold", &["SolarPanels"])));
        assert!(m.matches(&filter("English", "Bronze", &["SolarPanels", "Heatpumps"])));
        assert!(m.matches(&filter("German", "Gold", &[])));
        assert!(!m.matches(&filter("French", "Gold", &["SolarPanels"])));
        assert!(!m.matches(&filter("German", "Silver", &["SolarPanels"])));
        assert!(!m.matches(&filter("German", "Gold", &["SolarPanels", "Batteries"])));
    }

    #[test]
    fn parse_instant_normalizes_offsets() {
        let utc = parse_instant("2024-05-03T10:30:00.000Z").unwrap();
        let berlin = parse_instant("2024-05-03T12:30:00+02:00").unwrap();
        let naive = parse_instant("2024-05-03T10:30:00").unwrap();
        assert_eq!(utc, berlin);
        assert_eq!(utc, naive);
        assert_eq!(format_instant(utc), "2024-05-03T10:30:00.000Z");
        assert!(parse_instant("tomorrow").is_none());
    }

    #[test]
    fn text_array_literals() {
        assert_eq!(parse_text_array("{German,English}"), vec!["German", "English"]);
        assert_eq!(parse_text_array("{ \"Solar Panels\" }"), vec!["Solar Panels"]);
        assert_eq!(parse_text_array("Gold"), vec!["Gold"]);
        assert!(parse_text_array("{}").is_empty());
        assert_eq!(
            format_text_array(&["a".to_string(), "b".to_string()]),
            "{a,b}"
        );
    }
}
