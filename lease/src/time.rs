use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

/// Source of "now" for lease arithmetic. Always UTC.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to. Starts at the wall-clock time of
/// construction.
#[derive(Debug)]
pub struct ManualClock {
    base: Timestamp,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(base: Timestamp) -> Self {
        Self {
            base,
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.base + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Renders a timestamp as fixed-width RFC 3339 text (`2024-01-02T03:04:05.678Z`).
///
/// Every value has the same width and suffix, so lexical comparison of the
/// stored text agrees with chronological order.
pub fn to_storage_text(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parses a stored timestamp into UTC.
///
/// Text carrying an offset is converted to UTC. Text without any zone is taken
/// to already be UTC, never local time.
pub fn parse_utc(text: &str) -> Result<Timestamp, String> {
    let text = text.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(text) {
        return Ok(with_offset.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!("unrecognised timestamp {text:?}"))
}

/// `now` shifted by `lock_duration_ms`, or `None` when the result falls
/// outside the representable date range.
pub fn expires_after(now: Timestamp, lock_duration_ms: i64) -> Option<Timestamp> {
    Duration::try_milliseconds(lock_duration_ms).and_then(|delta| now.checked_add_signed(delta))
}
