//! Core domain model for the IHDP incremental loader: records, keys, watermarks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "ihdp-core";

/// A record as produced by a fetcher: canonical field name -> value.
pub type RawRecord = Map<String, Value>;

/// Monotonic ordering key of a source (epoch millis, year, yyyymm, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecencyKey(pub i64);

impl RecencyKey {
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tuple of field values identifying one logical entity within a source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(pub Vec<String>);

impl NaturalKey {
    /// Never appears inside a part; `RecordSchema::extract` rejects such values.
    pub const SEPARATOR: char = '\u{1f}';

    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Single-column encoding used by the warehouse tables.
    pub fn to_storage_key(&self) -> String {
        self.0.join(&Self::SEPARATOR.to_string())
    }

    pub fn from_storage_key(stored: &str) -> Self {
        Self(stored.split(Self::SEPARATOR).map(ToString::to_string).collect())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Per-record extraction failure. Never fatal for the batch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record {index}: missing field `{field}`")]
    MissingField { index: usize, field: String },
    #[error("record {index}: field `{field}` is not a usable recency key: {value}")]
    InvalidRecency {
        index: usize,
        field: String,
        value: String,
    },
    #[error("record {index}: field `{field}` cannot be part of a natural key: {value}")]
    InvalidKeyComponent {
        index: usize,
        field: String,
        value: String,
    },
    #[error("record {index}: {reason}")]
    Malformed { index: usize, reason: String },
}

impl ParseError {
    pub fn malformed(index: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            index,
            reason: reason.into(),
        }
    }
}

/// A record that passed extraction: keys are known and typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub natural_key: NaturalKey,
    pub recency_key: RecencyKey,
    pub fields: RawRecord,
}

/// Which fields of a raw record carry the recency key and the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub recency_field: String,
    pub natural_key_fields: Vec<String>,
}

impl RecordSchema {
    pub fn new(
        recency_field: impl Into<String>,
        natural_key_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            recency_field: recency_field.into(),
            natural_key_fields: natural_key_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn extract(&self, index: usize, fields: RawRecord) -> Result<CandidateRecord, ParseError> {
        let recency_value =
            fields
                .get(&self.recency_field)
                .ok_or_else(|| ParseError::MissingField {
                    index,
                    field: self.recency_field.clone(),
                })?;
        let recency_key =
            recency_from_value(recency_value).ok_or_else(|| ParseError::InvalidRecency {
                index,
                field: self.recency_field.clone(),
                value: recency_value.to_string(),
            })?;

        let mut parts = Vec::with_capacity(self.natural_key_fields.len());
        for field in &self.natural_key_fields {
            let value = fields.get(field).ok_or_else(|| ParseError::MissingField {
                index,
                field: field.clone(),
            })?;
            let part = key_part_from_value(value).ok_or_else(|| ParseError::InvalidKeyComponent {
                index,
                field: field.clone(),
                value: value.to_string(),
            })?;
            parts.push(part);
        }

        Ok(CandidateRecord {
            natural_key: NaturalKey(parts),
            recency_key,
            fields,
        })
    }
}

fn recency_from_value(value: &Value) -> Option<RecencyKey> {
    let raw = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    raw.map(RecencyKey)
}

fn key_part_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.contains(NaturalKey::SEPARATOR) => None,
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Result of one fetch call against a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedBatch {
    pub records: Vec<RawRecord>,
    /// Records the fetcher could not map; reported, never inserted.
    pub rejected: Vec<ParseError>,
    pub has_more: bool,
}

impl FetchedBatch {
    pub fn new(records: Vec<RawRecord>, has_more: bool) -> Self {
        Self {
            records,
            rejected: Vec::new(),
            has_more,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Full,
    Incremental,
}

impl LoadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::Full => "full",
            LoadMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStatus {
    Completed,
    Failed,
}

impl WatermarkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkStatus::Completed => "completed",
            WatermarkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WatermarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatermarkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(WatermarkStatus::Completed),
            "failed" => Ok(WatermarkStatus::Failed),
            other => Err(format!("unknown watermark status `{other}`")),
        }
    }
}

/// Durable per-source load position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub source_id: String,
    pub max_recency_key: Option<RecencyKey>,
    pub last_run_at: DateTime<Utc>,
    pub status: WatermarkStatus,
    pub record_count: i64,
    pub last_error: Option<String>,
}

impl Watermark {
    pub fn completed(
        source_id: impl Into<String>,
        max_recency_key: Option<RecencyKey>,
        record_count: i64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            max_recency_key,
            last_run_at: Utc::now(),
            status: WatermarkStatus::Completed,
            record_count,
            last_error: None,
        }
    }

    pub fn failed(
        source_id: impl Into<String>,
        max_recency_key: Option<RecencyKey>,
        record_count: i64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            max_recency_key,
            last_run_at: Utc::now(),
            status: WatermarkStatus::Failed,
            record_count,
            last_error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn extracts_composite_keys_and_numeric_strings() {
        let schema = RecordSchema::new("year", ["statistic", "year", "county"]);
        let candidate = schema
            .extract(
                0,
                record(json!({"statistic": "RIA02", "year": "2023", "county": "Cork", "value": 1.5})),
            )
            .unwrap();
        assert_eq!(candidate.recency_key, RecencyKey(2023));
        assert_eq!(candidate.natural_key, NaturalKey::new(["RIA02", "2023", "Cork"]));
        assert_eq!(candidate.fields.get("value"), Some(&json!(1.5)));
    }

    #[test]
    fn missing_and_invalid_fields_are_reported_per_record() {
        let schema = RecordSchema::new("publish_date", ["property_id"]);
        let missing = schema.extract(3, record(json!({"property_id": 1}))).unwrap_err();
        assert_eq!(
            missing,
            ParseError::MissingField {
                index: 3,
                field: "publish_date".into()
            }
        );

        let invalid = schema
            .extract(4, record(json!({"property_id": 1, "publish_date": "yesterday"})))
            .unwrap_err();
        assert!(matches!(invalid, ParseError::InvalidRecency { index: 4, .. }));

        let null_key = schema
            .extract(5, record(json!({"property_id": null, "publish_date": 10})))
            .unwrap_err();
        assert!(matches!(null_key, ParseError::InvalidKeyComponent { index: 5, .. }));
    }

    #[test]
    fn storage_key_encoding_is_reversible() {
        let key = NaturalKey::new(["123", "1700000000000"]);
        assert_eq!(NaturalKey::from_storage_key(&key.to_storage_key()), key);
    }

    #[test]
    fn key_parts_containing_the_storage_separator_are_rejected() {
        let schema = RecordSchema::new("ts", ["id", "area"]);
        let sneaky = format!("Dublin{}6", NaturalKey::SEPARATOR);
        let err = schema
            .extract(4, record(json!({"id": "a", "area": sneaky, "ts": 1})))
            .unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidKeyComponent { index: 4, ref field, .. } if field == "area"
        ));

        let ok = schema
            .extract(5, record(json!({"id": "a", "area": "Dublin 6", "ts": 1})))
            .unwrap();
        let stored = ok.natural_key.to_storage_key();
        assert_eq!(NaturalKey::from_storage_key(&stored), ok.natural_key);
    }

    #[test]
    fn watermark_status_parses_its_own_labels() {
        for status in [WatermarkStatus::Completed, WatermarkStatus::Failed] {
            assert_eq!(status.as_str().parse::<WatermarkStatus>(), Ok(status));
        }
        assert!("running".parse::<WatermarkStatus>().is_err());
    }
}
