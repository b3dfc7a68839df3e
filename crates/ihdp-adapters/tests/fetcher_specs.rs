use ihdp_adapters::{FetcherSpec, Transform};

#[test]
fn fetcher_specs_deserialize_from_yaml() {
    let yaml = r#"
- kind: json_pages
  url_template: "https://listings.test/rent?pageSize={page_size}&from={offset}"
  embedded_script_selectors: ["script#__NEXT_DATA__"]
  records_pointer: /props/pageProps/listings
  item_pointer: /listing
  fields:
    - { name: property_id, pointer: /id, required: true }
    - { name: publish_date, pointer: /publishDate, transform: epoch_millis, required: true }
- kind: csv
  url: "https://stats.test/api/data/RIA02?format=csv"
  rename: { "Statistic Label": statistic_label }
  derive:
    - { name: year, pointer: /tlist_a1, transform: year_prefix }
- kind: sdmx_json
  series:
    - { name: mro, url: "https://rates.test/data/MRR_FR" }
- kind: fixture
  dir: fixtures/demo-listings
"#;
    let specs: Vec<FetcherSpec> = serde_yaml::from_str(yaml).unwrap();
    let kinds: Vec<&str> = specs.iter().map(FetcherSpec::kind).collect();
    assert_eq!(kinds, ["json_pages", "csv", "sdmx_json", "fixture"]);

    let FetcherSpec::JsonPages(listing) = &specs[0] else {
        panic!("expected json_pages");
    };
    assert_eq!(listing.page_size, 20);
    assert_eq!(listing.fields[0].transform, Transform::Raw);
    assert_eq!(listing.fields[1].transform, Transform::EpochMillis);
    assert!(specs[3].is_offline());
}

#[test]
fn unknown_kinds_are_rejected() {
    let err = serde_yaml::from_str::<FetcherSpec>("kind: browser\nurl: x\n").unwrap_err();
    assert!(err.to_string().contains("browser"));
}
