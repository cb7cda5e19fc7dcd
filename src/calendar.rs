//! Normalization of the parse backend's upload responses into calendar events.
//!
//! The backend answers either with a single parse result or, when several
//! files were uploaded together, with an array of them. Both shapes are
//! folded into one flat, ordered list of [`CalendarEvent`]s. Anything that
//! does not look like `{ data: { events: [...] } }` contributes no events
//! instead of failing the whole upload.

use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Result, WorkspaceError};

const DEFAULT_SUMMARY: &str = "No Title";
const INVALID_DATE: &str = "Invalid Date";
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// A point in time that may be the "Invalid Date" sentinel.
///
/// Every ordering test against an invalid instant is false, so malformed
/// times flow through the graph without creating edges or selections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventInstant(Option<DateTime<FixedOffset>>);

impl EventInstant {
    pub const INVALID: EventInstant = EventInstant(None);

    /// Reads an ISO-8601 value. Values without an offset (including plain
    /// dates for all-day events) are taken to be in `zone`.
    pub fn parse(raw: &str, zone: FixedOffset) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
            return Self::INVALID;
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Self(Some(parsed));
        }

        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Self(zone.from_local_datetime(&naive).single());
            }
        }

        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .and_then(|naive| zone.from_local_datetime(&naive).single())
            .map_or(Self::INVALID, |parsed| Self(Some(parsed)))
    }

    pub fn from_datetime<Tz: TimeZone>(value: DateTime<Tz>) -> Self {
        Self(Some(value.fixed_offset()))
    }

    pub fn get(&self) -> Option<DateTime<FixedOffset>> {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    /// `self <= other`, false whenever either side is invalid.
    pub fn at_or_before(&self, other: &EventInstant) -> bool {
        match (self.0, other.0) {
            (Some(lhs), Some(rhs)) => lhs <= rhs,
            _ => false,
        }
    }

    /// Calendar day of this instant as seen from `zone`.
    pub fn local_date(&self, zone: FixedOffset) -> Option<NaiveDate> {
        self.0.map(|value| value.with_timezone(&zone).date_naive())
    }

    /// 0 (Sunday) through 6 (Saturday) as seen from `zone`.
    pub fn weekday(&self, zone: FixedOffset) -> Option<u32> {
        self.local_date(zone)
            .map(|date| date.weekday().num_days_from_sunday())
    }
}

impl fmt::Display for EventInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{}", value.to_rfc3339()),
            None => f.write_str(INVALID_DATE),
        }
    }
}

impl Serialize for EventInstant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(value) => serializer.serialize_str(&value.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for EventInstant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .map(|value| EventInstant::parse(&value, Utc.fix()))
            .unwrap_or_default())
    }
}

/// One event as the backend serializes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawEvent {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl RawEvent {
    /// Never fails: fields of the wrong type read as missing.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        RawEvent {
            summary: text("summary").unwrap_or_else(|| DEFAULT_SUMMARY.to_string()),
            start: text("start"),
            end: text("end"),
            description: text("description").filter(|s| !s.trim().is_empty()),
            location: text("location").filter(|s| !s.trim().is_empty()),
        }
    }
}

impl<'de> Deserialize<'de> for RawEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(RawEvent::from_value(&value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParseData {
    /// `None` when the backend sent no `events` array.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<RawEvent>>,
}

/// One backend response for one uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParseResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ParseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ParseResult {
    pub fn from_value(value: &Value) -> Self {
        let events = value
            .get("data")
            .and_then(|data| data.get("events"))
            .and_then(Value::as_array)
            .map(|items| items.iter().map(RawEvent::from_value).collect());

        let data = value
            .get("data")
            .filter(|data| data.is_object())
            .map(|_| ParseData { events });

        ParseResult {
            data,
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    pub fn with_events(events: Vec<RawEvent>) -> Self {
        ParseResult {
            data: Some(ParseData {
                events: Some(events),
            }),
            message: None,
        }
    }

    pub fn raw_events(&self) -> &[RawEvent] {
        self.data
            .as_ref()
            .and_then(|data| data.events.as_deref())
            .unwrap_or_default()
    }
}

impl<'de> Deserialize<'de> for ParseResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(ParseResult::from_value(&value))
    }
}

/// The upload endpoint's response: one parse result or an array of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UploadPayload {
    Single(ParseResult),
    Batch(Vec<ParseResult>),
}

impl Default for UploadPayload {
    fn default() -> Self {
        UploadPayload::Batch(Vec::new())
    }
}

impl UploadPayload {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(_) => Ok(UploadPayload::Single(ParseResult::from_value(value))),
            Value::Array(items) => Ok(UploadPayload::Batch(
                items.iter().map(ParseResult::from_value).collect(),
            )),
            _ => Err(WorkspaceError::MissingEventData),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(&value)
    }

    pub fn entries(&self) -> &[ParseResult] {
        match self {
            UploadPayload::Single(result) => std::slice::from_ref(result),
            UploadPayload::Batch(results) => results,
        }
    }

    pub fn into_entries(self) -> Vec<ParseResult> {
        match self {
            UploadPayload::Single(result) => vec![result],
            UploadPayload::Batch(results) => results,
        }
    }

    /// First backend message found, used to acknowledge an upload.
    pub fn message(&self) -> Option<&str> {
        self.entries()
            .iter()
            .find_map(|entry| entry.message.as_deref())
    }

    /// Flattens every entry's events in input order with `{file}-{event}` ids.
    pub fn events(&self, zone: FixedOffset) -> Vec<CalendarEvent> {
        self.entries()
            .iter()
            .enumerate()
            .flat_map(|(file_index, entry)| {
                entry
                    .raw_events()
                    .iter()
                    .enumerate()
                    .map(move |(event_index, raw)| {
                        CalendarEvent::from_raw(format!("{file_index}-{event_index}"), raw, zone)
                    })
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<'de> Deserialize<'de> for UploadPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        UploadPayload::from_value(&value).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: EventInstant,
    pub end: EventInstant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl CalendarEvent {
    pub fn from_raw(id: String, raw: &RawEvent, zone: FixedOffset) -> Self {
        let instant = |value: &Option<String>| {
            value
                .as_deref()
                .map(|value| EventInstant::parse(value, zone))
                .unwrap_or_default()
        };

        CalendarEvent {
            id,
            summary: raw.summary.clone(),
            start: instant(&raw.start),
            end: instant(&raw.end),
            description: raw.description.clone(),
            location: raw.location.clone(),
        }
    }
}

/// Parses a stored or freshly received upload body. Any problem yields no
/// events rather than an error.
pub fn normalize_events(raw: &str, zone: FixedOffset) -> Vec<CalendarEvent> {
    match UploadPayload::parse(raw) {
        Ok(payload) => payload.events(zone),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable calendar upload");
            Vec::new()
        }
    }
}

/// Appends `incoming` to a previously stored upload, always yielding a batch.
pub fn merge_uploads(existing: Option<&str>, incoming: UploadPayload) -> UploadPayload {
    let mut entries = match existing.map(UploadPayload::parse) {
        Some(Ok(previous)) => previous.into_entries(),
        Some(Err(err)) => {
            tracing::warn!(error = %err, "discarding unreadable stored upload before merge");
            Vec::new()
        }
        None => Vec::new(),
    };
    entries.extend(incoming.into_entries());
    UploadPayload::Batch(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        Utc.fix()
    }

    const TWO_EVENTS: &str = r#"[{"data":{"events":[
        {"summary":"A","start":"2023-10-10T09:00:00Z","end":"2023-10-10T10:00:00Z"},
        {"summary":"B","start":"2023-10-10T10:00:00Z","end":"2023-10-10T11:00:00Z"}
    ]}}]"#;

    #[test]
    fn batch_payload_flattens_with_file_and_event_ids() {
        let events = normalize_events(TWO_EVENTS, utc());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "0-0");
        assert_eq!(events[1].id, "0-1");
        assert_eq!(events[1].summary, "B");
        assert!(events[0].end.at_or_before(&events[1].start));
    }

    #[test]
    fn single_payload_is_accepted() {
        let raw = r#"{"data":{"events":[
            {"summary":"Solo","start":"2023-10-12T14:00:00Z"}
        ]},"message":"ok"}"#;
        let payload = UploadPayload::parse(raw).unwrap();
        assert!(matches!(payload, UploadPayload::Single(_)));
        assert_eq!(payload.message(), Some("ok"));

        let events = payload.events(utc());
        assert_eq!(events.len(), 1);
        assert!(!events[0].end.is_valid(), "missing end reads as invalid");
    }

    #[test]
    fn multiple_files_concatenate_in_order() {
        let raw = r#"[
            {"data":{"events":[{"summary":"x","start":"2023-10-10T09:00:00Z"}]}},
            {"data":{"events":[{"summary":"y","start":"2023-10-09T09:00:00Z"},{"summary":"z"}]}}
        ]"#;
        let ids: Vec<String> = normalize_events(raw, utc())
            .into_iter()
            .map(|event| event.id)
            .collect();
        assert_eq!(ids, vec!["0-0", "1-0", "1-1"]);
    }

    #[test]
    fn malformed_shapes_produce_no_events() {
        for raw in [
            "{not valid json",
            "42",
            r#"{"data":{"events":"not an array"}}"#,
            r#"{"data":{}}"#,
            r#"{"nothing":true}"#,
            r#"[{"data":"text"}]"#,
        ] {
            assert!(normalize_events(raw, utc()).is_empty(), "input {raw}");
        }
    }

    #[test]
    fn invalid_dates_become_sentinels() {
        let raw = r#"{"data":{"events":[{"summary":"bad","start":"N/A","end":"garbage"}]}}"#;
        let events = normalize_events(raw, utc());
        assert_eq!(events.len(), 1);
        assert!(!events[0].start.is_valid());
        assert_eq!(events[0].start.to_string(), "Invalid Date");
        assert!(!events[0].start.at_or_before(&events[0].end));
        assert!(!EventInstant::INVALID.at_or_before(&EventInstant::INVALID));
    }

    #[test]
    fn naive_and_date_only_values_use_the_zone() {
        let zone = FixedOffset::east_opt(2 * 3600).unwrap();
        let naive = EventInstant::parse("2023-10-10T00:30:00", zone);
        assert_eq!(
            naive.get().unwrap().with_timezone(&Utc).to_rfc3339(),
            "2023-10-09T22:30:00+00:00"
        );

        let all_day = EventInstant::parse("2023-10-15", zone);
        assert_eq!(all_day.local_date(zone), NaiveDate::from_ymd_opt(2023, 10, 15));
        assert_eq!(all_day.weekday(zone), Some(0));
    }

    #[test]
    fn weekday_depends_on_zone() {
        let instant = EventInstant::parse("2023-10-10T23:30:00Z", utc());
        assert_eq!(instant.weekday(utc()), Some(2));
        let ahead = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(instant.weekday(ahead), Some(3));
    }

    #[test]
    fn merge_wraps_single_and_appends() {
        let existing = r#"{"data":{"events":[{"summary":"old"}]}}"#;
        let incoming = UploadPayload::Single(ParseResult::with_events(vec![RawEvent {
            summary: "new".into(),
            ..RawEvent::default()
        }]));

        let merged = merge_uploads(Some(existing), incoming);
        let summaries: Vec<String> = merged
            .events(utc())
            .into_iter()
            .map(|event| event.summary)
            .collect();
        assert_eq!(summaries, vec!["old", "new"]);
        assert!(matches!(merged, UploadPayload::Batch(ref entries) if entries.len() == 2));
    }

    #[test]
    fn merge_ignores_corrupt_existing_value() {
        let merged = merge_uploads(Some("{oops"), UploadPayload::Single(ParseResult::default()));
        assert_eq!(merged.entries().len(), 1);
    }

    #[test]
    fn instants_round_trip_through_json() {
        let event = CalendarEvent::from_raw(
            "0-0".into(),
            &RawEvent {
                summary: "A".into(),
                start: Some("2023-10-10T09:00:00+02:00".into()),
                end: None,
                ..RawEvent::default()
            },
            utc(),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"end\":null"));
        let back: CalendarEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
