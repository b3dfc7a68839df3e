//! Whole-file CSV datasets (statistics tables, register downloads).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ihdp_core::{FetchedBatch, ParseError, RawRecord};
use ihdp_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::mapping::{derive_fields, FieldMapping};
use crate::{FetchError, SourceFetcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvSpec {
    pub url: String,
    /// Exact header -> canonical column. Headers not listed are snake_cased.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub derive: Vec<FieldMapping>,
}

impl CsvSpec {
    pub fn column_name(&self, header: &str) -> String {
        let header = header.trim();
        self.rename
            .get(header)
            .cloned()
            .unwrap_or_else(|| normalize_header(header))
    }

    /// The whole file is one batch. Rows that do not fit the header are
    /// rejected individually.
    pub fn parse_table(&self, body: &[u8]) -> Result<FetchedBatch, FetchError> {
        let text = decode_text(body);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(false)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let columns: Vec<String> = reader
            .headers()
            .map_err(|err| FetchError::decode("csv header", err.to_string()))?
            .iter()
            .map(|h| self.column_name(h))
            .collect();

        let mut batch = FetchedBatch::new(Vec::new(), false);
        for (index, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    batch.rejected.push(ParseError::malformed(index, err.to_string()));
                    continue;
                }
            };
            let mut record: RawRecord = columns
                .iter()
                .zip(row.iter())
                .map(|(column, cell)| (column.clone(), cell_value(cell)))
                .collect();
            match derive_fields(index, &mut record, &self.derive) {
                Ok(()) => batch.records.push(record),
                Err(err) => batch.rejected.push(err),
            }
        }
        Ok(batch)
    }
}

/// UTF-8 (BOM tolerated) with a Latin-1 fallback.
pub fn decode_text(body: &[u8]) -> String {
    let body = body.strip_prefix(b"\xef\xbb\xbf").unwrap_or(body);
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => body.iter().map(|&b| b as char).collect(),
    }
}

/// `Statistic Label` -> `statistic_label`, `TLIST(A1)` -> `tlist_a1`.
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    for ch in header.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Integers and decimals become numbers unless that would lose text (leading
/// zeros, thousands separators); empty cells become `null`.
fn cell_value(cell: &str) -> JsonValue {
    if cell.is_empty() {
        return JsonValue::Null;
    }
    let numeric_shape = cell
        .strip_prefix('-')
        .unwrap_or(cell)
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.');
    let leading_zero = cell.len() > 1 && cell.starts_with('0') && !cell.starts_with("0.");
    if numeric_shape && !leading_zero {
        if let Ok(int) = cell.parse::<i64>() {
            return JsonValue::from(int);
        }
        if let Some(number) = cell.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return JsonValue::Number(number);
        }
    }
    JsonValue::String(cell.to_string())
}

pub struct CsvFetcher {
    source_id: String,
    spec: CsvSpec,
    http: Arc<HttpFetcher>,
}

impl CsvFetcher {
    pub fn new(source_id: impl Into<String>, spec: CsvSpec, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
            http,
        }
    }
}

#[async_trait]
impl SourceFetcher for CsvFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self, page: u32) -> Result<FetchedBatch, FetchError> {
        if page > 1 {
            return Ok(FetchedBatch::new(Vec::new(), false));
        }
        let response = self.http.fetch_bytes(&self.source_id, &self.spec.url).await?;
        self.spec.parse_table(&response.body)
    }
}
