//! Best-effort lookup of a routing key inside arbitrary JSON payloads.
//!
//! A field may occur any number of times at any depth. Every occurrence is
//! collected, the lexicographically smallest text representation wins, and the
//! winner is coerced to the requested [`KeyType`]. Nothing in here fails: a
//! missing field or an uncoercible value is simply `None`.
use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde_json::{map, Value};
use tracing::{debug, warn};

pub const COERCION_FAILED: &str = "relay_routing_key_coercion_failed_total";

/// Tokens coerced to `true`, compared ASCII case-insensitively. Anything else is `false`.
const TRUTHY_TOKENS: [&str; 5] = ["true", "ja", "yes", "si", "1"];

const LOCAL_DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int32,
    Int64,
    Float64,
    Text,
    Boolean,
    /// Date-time with an offset, optionally followed by a `[Region/Zone]` suffix.
    DateTime,
    /// Date-time with the offset, if any, dropped.
    LocalDateTime,
    /// Calendar date, taken from the date part of a date-time if needed.
    Date,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedKey {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Boolean(bool),
    DateTime(DateTime<FixedOffset>),
    LocalDateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl ExtractedKey {
    /// Integer view of the key, used to feed partition strategies.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ExtractedKey::Int32(value) => Some(i64::from(*value)),
            ExtractedKey::Int64(value) => Some(*value),
            _ => None,
        }
    }
}

enum Frame<'a> {
    Object(map::Iter<'a>),
    Array(std::slice::Iter<'a, Value>),
}

/// Lazy, depth-first iterator over the text form of every value stored under
/// `field`, at any depth. Containers are always descended into, including the
/// value of a matching key and arrays nested in arrays.
pub struct FieldMatches<'a> {
    field: &'a str,
    stack: Vec<Frame<'a>>,
}

impl<'a> FieldMatches<'a> {
    fn descend(&mut self, value: &'a Value) {
        match value {
            Value::Object(object) => self.stack.push(Frame::Object(object.iter())),
            Value::Array(items) => self.stack.push(Frame::Array(items.iter())),
            _ => {}
        }
    }
}

impl<'a> Iterator for FieldMatches<'a> {
    type Item = Cow<'a, str>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = match self.stack.last_mut()? {
                Frame::Object(entries) => entries.next().map(|(key, value)| (Some(key), value)),
                Frame::Array(items) => items.next().map(|value| (None, value)),
            };

            let Some((key, value)) = step else {
                self.stack.pop();
                continue;
            };

            self.descend(value);
            if key.is_some_and(|key| key == self.field) {
                return Some(text_of(value));
            }
        }
    }
}

/// Strings contribute their raw content, everything else its JSON text.
fn text_of(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(text) => Cow::Borrowed(text),
        other => Cow::Owned(other.to_string()),
    }
}

pub fn find_field<'a>(document: &'a Value, field: &'a str) -> FieldMatches<'a> {
    let mut matches = FieldMatches {
        field,
        stack: Vec::new(),
    };
    matches.descend(document);
    matches
}

/// Lexicographically smallest occurrence of `field`, trimmed.
///
/// Ordering is on the raw text, not on numbers: `"21"` wins over `"3"`.
pub fn select_candidate(document: &Value, field: &str) -> Option<String> {
    find_field(document, field)
        .min()
        .map(|candidate| candidate.trim().to_owned())
}

pub fn extract(document: &Value, field: &str, key_type: KeyType) -> Option<ExtractedKey> {
    let Some(candidate) = select_candidate(document, field) else {
        debug!(field, "routing key field not present in document");
        return None;
    };

    let coerced = coerce(&candidate, key_type);
    if coerced.is_none() {
        warn!(
            field,
            value = %candidate,
            ?key_type,
            "cannot coerce routing key value"
        );
        metrics::counter!(COERCION_FAILED, &[("type", format!("{key_type:?}"))]).increment(1);
    }
    coerced
}

pub fn extract_i64(document: &Value, field: &str) -> Option<i64> {
    extract(document, field, KeyType::Int64).and_then(|key| key.as_i64())
}

pub fn coerce(raw: &str, key_type: KeyType) -> Option<ExtractedKey> {
    match key_type {
        KeyType::Int32 => raw.parse().ok().map(ExtractedKey::Int32),
        KeyType::Int64 => raw.parse().ok().map(ExtractedKey::Int64),
        KeyType::Float64 => raw.parse().ok().map(ExtractedKey::Float64),
        KeyType::Text => Some(ExtractedKey::Text(raw.to_owned())),
        KeyType::Boolean => Some(ExtractedKey::Boolean(is_truthy(raw))),
        KeyType::DateTime => parse_date_time(raw).map(ExtractedKey::DateTime),
        KeyType::LocalDateTime => parse_local_date_time(raw).map(ExtractedKey::LocalDateTime),
        KeyType::Date => parse_date(raw).map(ExtractedKey::Date),
    }
}

fn is_truthy(raw: &str) -> bool {
    TRUTHY_TOKENS
        .iter()
        .any(|token| raw.eq_ignore_ascii_case(token))
}

/// `2024-03-01T10:15:30+01:00[Europe/Paris]` carries a region id after the
/// offset. The offset alone pins the instant, so the region is ignored.
fn strip_region(raw: &str) -> &str {
    match raw.find('[') {
        Some(start) if raw.ends_with(']') => &raw[..start],
        _ => raw,
    }
}

fn parse_date_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(strip_region(raw)).ok()
}

fn parse_local_date_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = strip_region(raw);
    DateTime::parse_from_rfc3339(raw)
        .map(|date_time| date_time.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, LOCAL_DATE_TIME_FORMAT))
        .ok()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    parse_local_date_time(raw)
        .map(|date_time| date_time.date())
        .or_else(|| NaiveDate::parse_from_str(strip_region(raw), DATE_FORMAT).ok())
}
