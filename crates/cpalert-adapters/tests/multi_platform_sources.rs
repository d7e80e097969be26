use std::time::Duration;

use chrono::{TimeZone, Utc};
use cpalert_adapters::{
    normalize, ClistAdapter, FetchRequest, KontestsAdapter, PlatformRules, SourceAdapter,
};
use cpalert_core::{Platform, SourceFailure, TimeRange};
use cpalert_http::{HttpClientConfig, HttpFetcher};

fn window() -> TimeRange {
    TimeRange::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).single().unwrap(),
    )
}

#[test]
fn kontests_records_split_cleanly_per_platform() {
    let body = include_bytes!("fixtures/kontests_all.json");
    let records = KontestsAdapter::default().parse(body).expect("records");
    let rules = PlatformRules::builtin();

    let codeforces = normalize(records.clone(), Platform::Codeforces, &rules, &window());
    assert_eq!(codeforces.len(), 1, "gym contests must not leak in");
    assert_eq!(codeforces[0].name(), "Codeforces Round 1020 (Div. 2)");

    let atcoder = normalize(records.clone(), Platform::AtCoder, &rules, &window());
    assert_eq!(atcoder.len(), 1);

    assert!(normalize(records, Platform::LeetCode, &rules, &window()).is_empty());
}

#[test]
fn clist_and_kontests_agree_on_identity() {
    let rules = PlatformRules::builtin();
    let clist = ClistAdapter::new("u", "k")
        .parse(include_bytes!("fixtures/clist_contests.json"))
        .expect("clist");
    let kontests = KontestsAdapter::default()
        .parse(include_bytes!("fixtures/kontests_all.json"))
        .expect("kontests");

    let a = normalize(clist, Platform::Codeforces, &rules, &window());
    let b = normalize(kontests, Platform::Codeforces, &rules, &window());
    assert_eq!(a[0].identity(), b[0].identity());
}

#[test]
fn unknown_resources_are_dropped_not_guessed() {
    let rules = PlatformRules::builtin();
    let clist = ClistAdapter::new("u", "k")
        .parse(include_bytes!("fixtures/clist_contests.json"))
        .expect("clist");
    let tagged: usize = Platform::ALL
        .into_iter()
        .map(|p| normalize(clist.clone(), p, &rules, &window()).len())
        .sum();
    // five records, one of them topcoder
    assert_eq!(tagged, 4);
}

#[tokio::test]
async fn blank_clist_credentials_fail_as_unavailable_without_network() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
    let adapter = ClistAdapter::new("", "");
    let result = adapter
        .fetch(&http, &FetchRequest::new(window(), Duration::from_secs(1)))
        .await;
    assert!(matches!(result, Err(SourceFailure::Unavailable(_))));
}
