//! Field mapping from source payloads to canonical records.

use chrono::{DateTime, NaiveDate, Utc};
use ihdp_core::{ParseError, RawRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Copy the value as-is.
    #[default]
    Raw,
    Text,
    Integer,
    Number,
    /// Currency text such as `€1,850 per month`.
    Price,
    EpochMillis,
    YearPrefix,
    YearMonth,
    DateYmd,
    JoinList,
    County,
}

/// One canonical field: where to read it (JSON pointer) and how to coerce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    pub pointer: String,
    /// Tried in order when `pointer` is absent or null.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_pointers: Vec<String>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub required: bool,
}

impl FieldMapping {
    pub fn new(name: impl Into<String>, pointer: impl Into<String>, transform: Transform) -> Self {
        Self {
            name: name.into(),
            pointer: pointer.into(),
            fallback_pointers: Vec::new(),
            transform,
            required: false,
        }
    }

    pub fn or_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.fallback_pointers.push(pointer.into());
        self
    }

    fn lookup<'a>(&self, source: &'a Value) -> Option<&'a Value> {
        std::iter::once(&self.pointer)
            .chain(&self.fallback_pointers)
            .find_map(|pointer| source.pointer(pointer).filter(|v| !v.is_null()))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

const COUNTIES: [&str; 26] = [
    "Carlow", "Cavan", "Clare", "Cork", "Donegal", "Dublin", "Galway", "Kerry", "Kildare",
    "Kilkenny", "Laois", "Leitrim", "Limerick", "Longford", "Louth", "Mayo", "Meath", "Monaghan",
    "Offaly", "Roscommon", "Sligo", "Tipperary", "Waterford", "Westmeath", "Wexford", "Wicklow",
];

/// Build a canonical record from `source` using `mappings`. Unresolvable
/// optional fields become `null`; unresolvable required fields reject the record.
pub fn map_record(
    index: usize,
    source: &Value,
    mappings: &[FieldMapping],
) -> Result<RawRecord, ParseError> {
    let mut record = RawRecord::new();
    for mapping in mappings {
        let raw = mapping.lookup(source);
        let value = match raw {
            Some(raw) => match apply_transform(mapping.transform, raw) {
                Some(value) => value,
                None if mapping.required => {
                    return Err(ParseError::malformed(
                        index,
                        format!("field `{}` could not be read from {raw}", mapping.name),
                    ))
                }
                None => Value::Null,
            },
            None if mapping.required => {
                return Err(ParseError::MissingField {
                    index,
                    field: mapping.name.clone(),
                })
            }
            None => Value::Null,
        };
        record.insert(mapping.name.clone(), value);
    }
    Ok(record)
}

/// Add derived fields to an already tabular record, reading pointers against
/// the record itself (`/time_period`, `/value`, ...).
pub fn derive_fields(
    index: usize,
    record: &mut RawRecord,
    mappings: &[FieldMapping],
) -> Result<(), ParseError> {
    if mappings.is_empty() {
        return Ok(());
    }
    let derived = map_record(index, &Value::Object(record.clone()), mappings)?;
    record.extend(derived);
    Ok(())
}

pub fn apply_transform(transform: Transform, value: &Value) -> Option<Value> {
    match transform {
        Transform::Raw => Some(value.clone()),
        Transform::Text => text_of(value).map(Value::String),
        Transform::Integer => integer_of(value).map(Value::from),
        Transform::Number => number_of(value).and_then(number_value),
        Transform::Price => match value {
            Value::String(s) => extract_numbers(&s.replace(',', ""))
                .first()
                .copied()
                .and_then(number_value),
            other => number_of(other).and_then(number_value),
        },
        Transform::EpochMillis => epoch_millis_of(value).map(Value::from),
        Transform::YearPrefix => match value {
            Value::String(s) => s.trim().get(..4)?.parse::<i64>().ok().map(Value::from),
            other => integer_of(other).map(Value::from),
        },
        Transform::YearMonth => value.as_str().and_then(year_month).map(Value::from),
        Transform::DateYmd => value
            .as_str()
            .and_then(parse_date)
            .and_then(|d| d.format("%Y%m%d").to_string().parse::<i64>().ok())
            .map(Value::from),
        Transform::JoinList => {
            let items: Vec<String> = value.as_array()?.iter().filter_map(text_of).collect();
            (!items.is_empty()).then(|| Value::String(items.join(", ")))
        }
        Transform::County => value.as_str().and_then(county_in).map(Value::from),
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(s) => extract_numbers(s).first().map(|f| f.round() as i64),
        _ => None,
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| extract_numbers(s).first().copied()),
        _ => None,
    }
}

fn number_value(f: f64) -> Option<Value> {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number)
    }
}

fn epoch_millis_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(_) => integer_of(value),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(millis) = s.parse::<i64>() {
                return Some(millis);
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc).timestamp_millis());
            }
            parse_date(s)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| s.get(..10).and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()))
}

/// `2024-01`, `2024M01` and `2024-01-15` all map to `202401`.
fn year_month(s: &str) -> Option<i64> {
    let s = s.trim();
    let year: i64 = s.get(..4)?.parse().ok()?;
    let rest = s.get(4..)?.trim_start_matches(['-', 'M', 'm']);
    let month: i64 = rest.get(..2)?.parse().ok()?;
    (1..=12).contains(&month).then_some(year * 100 + month)
}

fn county_in(text: &str) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    if lower.contains("dublin") {
        return Some("Dublin");
    }
    COUNTIES
        .iter()
        .find(|county| lower.contains(&county.to_ascii_lowercase()))
        .copied()
}

pub(crate) fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
        out.push(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn price_and_integer_transforms_read_listing_text() {
        assert_eq!(
            apply_transform(Transform::Price, &json!("€1,850 per month")),
            Some(json!(1850))
        );
        assert_eq!(apply_transform(Transform::Integer, &json!("3 Bed")), Some(json!(3)));
        assert_eq!(apply_transform(Transform::Number, &json!("2.5")), Some(json!(2.5)));
        assert_eq!(apply_transform(Transform::Price, &json!("Price on application")), None);
    }

    #[test]
    fn date_transforms_produce_orderable_integers() {
        assert_eq!(
            apply_transform(Transform::EpochMillis, &json!("2024-03-01T00:00:00Z")),
            Some(json!(1_709_251_200_000i64))
        );
        assert_eq!(
            apply_transform(Transform::EpochMillis, &json!(1_709_251_200_000i64)),
            Some(json!(1_709_251_200_000i64))
        );
        assert_eq!(apply_transform(Transform::YearPrefix, &json!("2023Q4")), Some(json!(2023)));
        assert_eq!(apply_transform(Transform::YearMonth, &json!("2024M07")), Some(json!(202407)));
        assert_eq!(apply_transform(Transform::YearMonth, &json!("2024-13")), None);
        assert_eq!(apply_transform(Transform::DateYmd, &json!("05/02/2021")), Some(json!(20210205)));
    }

    #[test]
    fn county_and_list_transforms() {
        assert_eq!(
            apply_transform(Transform::County, &json!("Apartment 4, Ranelagh, Dublin 6")),
            Some(json!("Dublin"))
        );
        assert_eq!(apply_transform(Transform::County, &json!("Somewhere")), None);
        assert_eq!(
            apply_transform(Transform::JoinList, &json!(["Parking", "Garden"])),
            Some(json!("Parking, Garden"))
        );
    }

    #[test]
    fn required_fields_reject_only_their_record() {
        let mappings = vec![
            FieldMapping::new("property_id", "/id", Transform::Raw).required(),
            FieldMapping::new("bedrooms", "/numBedrooms", Transform::Integer),
        ];
        let ok = map_record(0, &json!({"id": 7, "numBedrooms": "2 Bed"}), &mappings).unwrap();
        assert_eq!(Value::Object(ok), json!({"property_id": 7, "bedrooms": 2}));

        let sparse = map_record(1, &json!({"id": 8}), &mappings).unwrap();
        assert_eq!(sparse.get("bedrooms"), Some(&Value::Null));

        let err = map_record(2, &json!({"numBedrooms": "1 Bed"}), &mappings).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                index: 2,
                field: "property_id".into()
            }
        );
    }

    #[test]
    fn fallback_pointers_apply_only_when_the_primary_is_missing() {
        let mappings = vec![FieldMapping::new("price", "/abbreviatedPrice", Transform::Price)
            .or_pointer("/price")];
        let abbreviated = json!({"abbreviatedPrice": "€2,450", "price": "€2,400 per month"});
        let plain = json!({"abbreviatedPrice": null, "price": "€1,900 per month"});

        assert_eq!(map_record(0, &abbreviated, &mappings).unwrap().get("price"), Some(&json!(2450)));
        assert_eq!(map_record(1, &plain, &mappings).unwrap().get("price"), Some(&json!(1900)));
        assert_eq!(
            map_record(2, &json!({}), &mappings).unwrap().get("price"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn derived_fields_extend_tabular_records() {
        let mut record = json!({"time_period": "2022-05", "value": 4.0})
            .as_object()
            .cloned()
            .unwrap();
        derive_fields(
            0,
            &mut record,
            &[FieldMapping::new("period_key", "/time_period", Transform::YearMonth).required()],
        )
        .unwrap();
        assert_eq!(record.get("period_key"), Some(&json!(202205)));
        assert_eq!(record.get("value"), Some(&json!(4.0)));
    }
}
