use std::path::Path;

use mandi_adapters::{normalize_records, AdapterContext, FixtureAdapter, SourceAdapter};
use mandi_storage::{HttpClientConfig, HttpFetcher};
use uuid::Uuid;

fn fixture_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/data-gov-in/sample.json")
}

#[tokio::test]
async fn fixture_payload_normalizes_one_candidate_per_record() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    let adapter = FixtureAdapter::new(fixture_path());
    let records = adapter
        .fetch_records(&http, &AdapterContext::new(Uuid::new_v4()))
        .await
        .expect("fixture records");
    assert_eq!(records.len(), 12);

    let candidates = normalize_records(&records);
    assert_eq!(candidates.len(), records.len());

    let first = &candidates[0];
    assert_eq!(first.commodity.as_deref(), Some("Onion"));
    assert_eq!(first.market.as_deref(), Some("Lasalgaon"));
    assert_eq!(first.arrival_date.as_deref(), Some("14/10/2026"));
    assert_eq!(first.modal_price, Some(1750.0));

    let unreported = &candidates[7];
    assert_eq!(unreported.modal_price, None);
    assert_eq!(unreported.min_price, None);

    let without_variety = &candidates[4];
    assert_eq!(without_variety.variety, None);

    let without_prices = &candidates[11];
    assert_eq!(without_prices.modal_price, None);
}

#[tokio::test]
async fn missing_fixture_is_an_io_error() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    let adapter = FixtureAdapter::new("/definitely/not/here.json");
    let err = adapter
        .fetch_records(&http, &AdapterContext::new(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("/definitely/not/here.json"));
}
