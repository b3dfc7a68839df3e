//! SDMX-JSON data messages, one configured series per page.

use std::sync::Arc;

use async_trait::async_trait;
use ihdp_core::{FetchedBatch, ParseError, RawRecord};
use ihdp_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::mapping::{derive_fields, FieldMapping};
use crate::{FetchError, SourceFetcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdmxSeries {
    /// Label stored with every observation (`mro`, `deposit_facility`, ...).
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdmxSpec {
    pub series: Vec<SdmxSeries>,
    #[serde(default)]
    pub derive: Vec<FieldMapping>,
}

impl SdmxSpec {
    /// Flatten a data message into `{series, series_key, time_period, value}`
    /// records, one per observation.
    pub fn parse_message(
        &self,
        series_name: &str,
        body: &[u8],
    ) -> Result<Vec<Result<RawRecord, ParseError>>, FetchError> {
        let message: JsonValue = serde_json::from_slice(body)
            .map_err(|err| FetchError::decode("sdmx message", err.to_string()))?;
        let time_values = time_period_values(&message);
        let series = message
            .pointer("/dataSets/0/series")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| FetchError::decode("sdmx message", "no dataSets[0].series"))?;

        let mut out = Vec::new();
        for (series_key, body) in series {
            let Some(observations) = body.get("observations").and_then(JsonValue::as_object) else {
                continue;
            };
            let mut ordered: Vec<(&String, &JsonValue)> = observations.iter().collect();
            ordered.sort_by_key(|(idx, _)| idx.parse::<usize>().unwrap_or(usize::MAX));

            for (obs_index, obs) in ordered {
                let index = out.len();
                let Ok(position) = obs_index.parse::<usize>() else {
                    out.push(Err(ParseError::malformed(
                        index,
                        format!("observation index `{obs_index}` is not numeric"),
                    )));
                    continue;
                };
                let time_period = time_values
                    .get(position)
                    .cloned()
                    .unwrap_or_else(|| obs_index.clone());
                let value = obs.get(0).cloned().unwrap_or(JsonValue::Null);

                let mut record = RawRecord::new();
                record.insert("series".into(), JsonValue::from(series_name));
                record.insert("series_key".into(), JsonValue::from(series_key.as_str()));
                record.insert("time_period".into(), JsonValue::from(time_period));
                record.insert("value".into(), value);
                out.push(derive_fields(index, &mut record, &self.derive).map(|()| record));
            }
        }
        Ok(out)
    }
}

/// Observation positions resolve through the `TIME_PERIOD` observation
/// dimension; falls back to the first observation dimension.
fn time_period_values(message: &JsonValue) -> Vec<String> {
    let Some(dimensions) = message
        .pointer("/structure/dimensions/observation")
        .and_then(JsonValue::as_array)
    else {
        return Vec::new();
    };
    let dimension = dimensions
        .iter()
        .find(|d| d.get("id").and_then(JsonValue::as_str) == Some("TIME_PERIOD"))
        .or_else(|| dimensions.first());
    dimension
        .and_then(|d| d.get("values"))
        .and_then(JsonValue::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.get("id").and_then(JsonValue::as_str).map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub struct SdmxFetcher {
    source_id: String,
    spec: SdmxSpec,
    http: Arc<HttpFetcher>,
}

impl SdmxFetcher {
    pub fn new(
        source_id: impl Into<String>,
        spec: SdmxSpec,
        http: Arc<HttpFetcher>,
    ) -> Result<Self, FetchError> {
        if spec.series.is_empty() {
            return Err(FetchError::Config("sdmx_json needs at least one series".into()));
        }
        Ok(Self {
            source_id: source_id.into(),
            spec,
            http,
        })
    }
}

#[async_trait]
impl SourceFetcher for SdmxFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self, page: u32) -> Result<FetchedBatch, FetchError> {
        let Some(series) = page
            .checked_sub(1)
            .and_then(|idx| self.spec.series.get(idx as usize))
        else {
            return Ok(FetchedBatch::new(Vec::new(), false));
        };
        let response = self.http.fetch_bytes(&self.source_id, &series.url).await?;
        let mut batch = FetchedBatch::new(Vec::new(), (page as usize) < self.spec.series.len());
        for parsed in self.spec.parse_message(&series.name, &response.body)? {
            match parsed {
                Ok(record) => batch.records.push(record),
                Err(err) => batch.rejected.push(err),
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::mapping::Transform;
    use serde_json::json;

    fn rates_spec() -> SdmxSpec {
        SdmxSpec {
            series: vec![SdmxSeries {
                name: "mro".into(),
                url: "https://rates.test/service/data/FM/M.U2.EUR.4F.KR.MRR_FR.LEV".into(),
            }],
            derive: vec![FieldMapping::new("period_key", "/time_period", Transform::YearMonth).required()],
        }
    }

    #[test]
    fn observations_resolve_time_periods_through_structure() {
        let body = fs::read(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ecb/mro.json"))
            .unwrap();
        let records: Vec<RawRecord> = rates_spec()
            .parse_message("mro", &body)
            .unwrap()
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(
            JsonValue::Object(records[2].clone()),
            json!({
                "series": "mro",
                "series_key": "0:0:0:0:0:0:0",
                "time_period": "2024-07",
                "value": 4.25,
                "period_key": 202407
            })
        );
    }

    #[test]
    fn messages_without_structure_fall_back_to_raw_indices() {
        let body = br#"{"dataSets":[{"series":{"0":{"observations":{"1":[3.0],"x":[1.0]}}}}]}"#;
        let spec = SdmxSpec {
            series: Vec::new(),
            derive: Vec::new(),
        };
        let parsed = spec.parse_message("dfr", body).unwrap();
        assert_eq!(parsed.len(), 2);
        let first = parsed[0].as_ref().unwrap();
        assert_eq!(first["time_period"], json!("1"));
        assert!(matches!(parsed[1], Err(ParseError::Malformed { index: 1, .. })));

        assert!(matches!(
            spec.parse_message("dfr", b"{}"),
            Err(FetchError::Decode { .. })
        ));
    }
}
