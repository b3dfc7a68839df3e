//! Paged JSON listings, served either as a JSON body or embedded in an HTML
//! `<script>` element.

use std::sync::Arc;

use async_trait::async_trait;
use ihdp_core::{FetchedBatch, ParseError};
use ihdp_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::mapping::{map_record, FieldMapping};
use crate::{FetchError, SourceFetcher};

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonPagesSpec {
    /// May reference `{page}`, `{offset}` and `{page_size}`.
    pub url_template: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Tried in order; the first element whose text parses as JSON wins.
    /// Empty means the response body itself is JSON.
    #[serde(default)]
    pub embedded_script_selectors: Vec<String>,
    pub records_pointer: String,
    /// Applied to every element of the records array before mapping.
    #[serde(default)]
    pub item_pointer: Option<String>,
    pub fields: Vec<FieldMapping>,
}

impl JsonPagesSpec {
    pub fn validate(&self) -> Result<(), FetchError> {
        if !["{page}", "{offset}"]
            .iter()
            .any(|placeholder| self.url_template.contains(placeholder))
        {
            return Err(FetchError::Config(format!(
                "url_template `{}` has neither {{page}} nor {{offset}}",
                self.url_template
            )));
        }
        if self.page_size == 0 {
            return Err(FetchError::Config("page_size must be positive".into()));
        }
        if self.fields.is_empty() {
            return Err(FetchError::Config("json_pages needs at least one field".into()));
        }
        for selector in &self.embedded_script_selectors {
            parse_selector(selector)?;
        }
        Ok(())
    }

    pub fn page_url(&self, page: u32) -> String {
        let offset = page.saturating_sub(1).saturating_mul(self.page_size);
        self.url_template
            .replace("{page}", &page.to_string())
            .replace("{offset}", &offset.to_string())
            .replace("{page_size}", &self.page_size.to_string())
    }

    pub fn parse_page(&self, body: &[u8]) -> Result<FetchedBatch, FetchError> {
        let payload = self.payload(body)?;
        let items = payload
            .pointer(&self.records_pointer)
            .ok_or_else(|| {
                FetchError::decode("listing page", format!("no value at {}", self.records_pointer))
            })?
            .as_array()
            .ok_or_else(|| {
                FetchError::decode("listing page", format!("{} is not an array", self.records_pointer))
            })?;

        let has_more = items.len() >= self.page_size as usize;
        let mut batch = FetchedBatch::new(Vec::with_capacity(items.len()), has_more);
        for (index, item) in items.iter().enumerate() {
            let item = match &self.item_pointer {
                Some(pointer) => match item.pointer(pointer) {
                    Some(inner) => inner,
                    None => {
                        batch
                            .rejected
                            .push(ParseError::malformed(index, format!("no value at {pointer}")));
                        continue;
                    }
                },
                None => item,
            };
            match map_record(index, item, &self.fields) {
                Ok(record) => batch.records.push(record),
                Err(err) => batch.rejected.push(err),
            }
        }
        Ok(batch)
    }

    fn payload(&self, body: &[u8]) -> Result<JsonValue, FetchError> {
        if self.embedded_script_selectors.is_empty() {
            return serde_json::from_slice(body)
                .map_err(|err| FetchError::decode("json body", err.to_string()));
        }

        let document = Html::parse_document(&String::from_utf8_lossy(body));
        for selector in &self.embedded_script_selectors {
            let Some(text) = select_first_text(&document, selector)? else {
                continue;
            };
            match serde_json::from_str(&text) {
                Ok(value) => return Ok(value),
                Err(err) => debug!(selector = %selector, error = %err, "embedded script is not JSON"),
            }
        }
        Err(FetchError::decode(
            "html page",
            format!(
                "none of the selectors matched a JSON payload: {}",
                self.embedded_script_selectors.join(" | ")
            ),
        ))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector)
        .map_err(|e| FetchError::Config(format!("invalid selector `{selector}`: {e}")))
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, FetchError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).next().and_then(|n| {
        let text = n.text().collect::<String>();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }))
}

pub struct JsonPagesFetcher {
    source_id: String,
    spec: JsonPagesSpec,
    http: Arc<HttpFetcher>,
}

impl JsonPagesFetcher {
    pub fn new(
        source_id: impl Into<String>,
        spec: JsonPagesSpec,
        http: Arc<HttpFetcher>,
    ) -> Result<Self, FetchError> {
        spec.validate()?;
        Ok(Self {
            source_id: source_id.into(),
            spec,
            http,
        })
    }
}

#[async_trait]
impl SourceFetcher for JsonPagesFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self, page: u32) -> Result<FetchedBatch, FetchError> {
        let url = self.spec.page_url(page);
        let response = self.http.fetch_bytes(&self.source_id, &url).await?;
        self.spec.parse_page(&response.body)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::mapping::Transform;
    use serde_json::json;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn listing_spec(selectors: &[&str]) -> JsonPagesSpec {
        JsonPagesSpec {
            url_template: "https://listings.test/rent?pageSize={page_size}&from={offset}".into(),
            page_size: 3,
            embedded_script_selectors: selectors.iter().map(|s| s.to_string()).collect(),
            records_pointer: "/props/pageProps/listings".into(),
            item_pointer: Some("/listing".into()),
            fields: vec![
                FieldMapping::new("property_id", "/id", Transform::Raw).required(),
                FieldMapping::new("publish_date", "/publishDate", Transform::EpochMillis).required(),
                FieldMapping::new("price", "/price", Transform::Price),
                FieldMapping::new("bedrooms", "/numBedrooms", Transform::Integer),
                FieldMapping::new("county", "/title", Transform::County),
            ],
        }
    }

    #[test]
    fn page_url_substitutes_offsets() {
        let spec = listing_spec(&[]);
        assert_eq!(
            spec.page_url(1),
            "https://listings.test/rent?pageSize=3&from=0"
        );
        assert_eq!(
            spec.page_url(3),
            "https://listings.test/rent?pageSize=3&from=6"
        );
    }

    #[test]
    fn parses_listing_fixture_from_embedded_script() {
        let html = fs::read(workspace_root().join("fixtures/daft/page-1.html")).unwrap();
        let batch = listing_spec(&["script#__NEXT_DATA__"]).parse_page(&html).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert!(batch.has_more);
        assert_eq!(
            JsonValue::Object(batch.records[0].clone()),
            json!({
                "property_id": 5512034,
                "publish_date": 1_709_251_200_000i64,
                "price": 2450,
                "bedrooms": 2,
                "county": "Dublin"
            })
        );
        assert_eq!(
            batch.rejected,
            vec![ParseError::MissingField {
                index: 2,
                field: "publish_date".into()
            }]
        );
    }

    #[test]
    fn selector_fallback_uses_first_parseable_payload() {
        let html = br#"<html><body>
            <script id="stale">not json at all</script>
            <script type="application/json" class="state">{"props":{"pageProps":{"listings":[]}}}</script>
        </body></html>"#;
        let spec = listing_spec(&["script#__NEXT_DATA__", "script#stale", "script.state"]);
        let batch = spec.parse_page(html).unwrap();
        assert!(batch.is_empty());
        assert!(!batch.has_more);

        let err = listing_spec(&["script#__NEXT_DATA__"]).parse_page(html).unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn templates_without_paging_placeholders_are_rejected() {
        let mut spec = listing_spec(&[]);
        spec.url_template = "https://listings.test/rent".into();
        assert!(matches!(spec.validate(), Err(FetchError::Config(_))));
        assert!(listing_spec(&["script#__NEXT_DATA__"]).validate().is_ok());
    }
}
