//! UTC instant parsing and formatting.
//!
//! Every timestamp in ciledger is a `DateTime<Utc>`. Legacy files written by
//! older tooling may carry naive ISO-8601 strings without an offset; those are
//! read as UTC.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 instant, accepting `Z`, explicit offsets and naive forms.
#[must_use]
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Canonical on-disk form: RFC 3339, microsecond precision, `Z` suffix.
#[must_use]
pub fn format_instant(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Compact stamp used in archive and quarantine file names.
#[must_use]
pub fn file_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d-%H%M%S").to_string()
}

/// Day bucket key (`YYYY-MM-DD`, UTC).
#[must_use]
pub fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Month bucket key (`YYYY-MM`, UTC).
#[must_use]
pub fn month_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m").to_string()
}

/// Start of the trailing `window` ending at `now`, clamped to the earliest
/// representable instant.
#[must_use]
pub fn window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Serde adapter for `DateTime<Utc>` fields that tolerates legacy formats.
pub mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::format_instant(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        super::parse_instant(&raw)
            .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp: {raw}")))
    }
}

/// Like [`lenient`], for optional fields. `null`, absent and unparsable
/// values all map to `None`, so one bad stamp never rejects its document.
pub mod lenient_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, ser: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => ser.serialize_str(&super::format_instant(*ts)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<Value>::deserialize(de)?;
        Ok(raw
            .as_ref()
            .and_then(Value::as_str)
            .and_then(super::parse_instant))
    }
}
