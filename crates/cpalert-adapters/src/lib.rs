//! Source adapter contracts, platform detection and the per-provider adapters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cpalert_core::{Contest, Platform, RawContest, SourceFailure, SourceResult, TimeRange};
use cpalert_http::{HttpFetcher, HttpRequest};
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpalert-adapters";

pub const CODEFORCES_API: &str = "codeforces-api";
pub const LEETCODE_GRAPHQL: &str = "leetcode-graphql";
pub const CODECHEF_API: &str = "codechef-api";
pub const CLIST: &str = "clist";
pub const ATCODER_SCRAPE: &str = "atcoder-scrape";
pub const ATCODER_PROBLEMS: &str = "atcoder-problems";
pub const KONTESTS: &str = "kontests";

pub const ALL_SOURCES: [&str; 7] = [
    CODEFORCES_API,
    LEETCODE_GRAPHQL,
    CODECHEF_API,
    CLIST,
    ATCODER_SCRAPE,
    ATCODER_PROBLEMS,
    KONTESTS,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    StructuredApi,
    AggregatorApi,
    PageScrape,
    LegacyApi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub run_id: Uuid,
    pub window: TimeRange,
    pub timeout: Duration,
    pub attempt: usize,
}

impl FetchRequest {
    pub fn new(window: TimeRange, timeout: Duration) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            window,
            timeout,
            attempt: 0,
        }
    }
}

/// One external endpoint. `fetch` always returns a [`SourceResult`]; network and
/// payload problems are classified into [`SourceFailure`] rather than raised.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> SourceKind;
    fn probe_url(&self) -> &str;

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult;
}

#[derive(Debug, Clone, Default)]
pub struct SourceCredentials {
    pub clist_username: Option<String>,
    pub clist_api_key: Option<String>,
}

impl SourceCredentials {
    fn clist(&self) -> Option<(String, String)> {
        let user = self.clist_username.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let key = self.clist_api_key.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some((user.to_string(), key.to_string()))
    }
}

pub fn adapter_for_source(
    source_id: &str,
    credentials: &SourceCredentials,
) -> Option<Arc<dyn SourceAdapter>> {
    match source_id {
        CODEFORCES_API => Some(Arc::new(CodeforcesApiAdapter::default())),
        LEETCODE_GRAPHQL => Some(Arc::new(LeetCodeGraphqlAdapter::default())),
        CODECHEF_API => Some(Arc::new(CodeChefApiAdapter::default())),
        CLIST => credentials
            .clist()
            .map(|(user, key)| Arc::new(ClistAdapter::new(user, key)) as Arc<dyn SourceAdapter>),
        ATCODER_SCRAPE => Some(Arc::new(AtCoderScrapeAdapter::default())),
        ATCODER_PROBLEMS => Some(Arc::new(AtCoderProblemsAdapter::default())),
        KONTESTS => Some(Arc::new(KontestsAdapter::default())),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRule {
    pub platform: Platform,
    pub resources: Vec<String>,
    pub hosts: Vec<String>,
    pub name_keywords: Vec<String>,
    pub contests_url: String,
}

impl PlatformRule {
    pub fn new(platform: Platform, contests_url: &str) -> Self {
        Self {
            platform,
            resources: Vec::new(),
            hosts: Vec::new(),
            name_keywords: Vec::new(),
            contests_url: contests_url.to_string(),
        }
    }

    pub fn resources(mut self, values: &[&str]) -> Self {
        self.resources = lowercase_all(values);
        self
    }

    pub fn hosts(mut self, values: &[&str]) -> Self {
        self.hosts = lowercase_all(values);
        self
    }

    pub fn name_keywords(mut self, values: &[&str]) -> Self {
        self.name_keywords = lowercase_all(values);
        self
    }
}

fn lowercase_all(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.trim().to_lowercase()).collect()
}

/// Ordered rule list used to tag records from multi-platform sources.
///
/// Matching runs in three passes over the rules: explicit resource field, then
/// URL host substring, then case-insensitive name substring. The first hit
/// wins. A record matching nothing is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRules {
    rules: Vec<PlatformRule>,
    ignored_resources: Vec<String>,
}

impl Default for PlatformRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PlatformRules {
    pub fn new(rules: Vec<PlatformRule>, ignored_resources: &[&str]) -> Self {
        Self {
            rules,
            ignored_resources: lowercase_all(ignored_resources),
        }
    }

    pub fn builtin() -> Self {
        Self::new(
            vec![
                PlatformRule::new(Platform::Codeforces, "https://codeforces.com/contests")
                    .resources(&["codeforces.com", "codeforces"])
                    .hosts(&["codeforces.com"])
                    .name_keywords(&["codeforces"]),
                PlatformRule::new(Platform::AtCoder, "https://atcoder.jp/contests/")
                    .resources(&["atcoder.jp", "atcoder"])
                    .hosts(&["atcoder.jp"])
                    .name_keywords(&["atcoder"]),
                PlatformRule::new(Platform::LeetCode, "https://leetcode.com/contest/")
                    .resources(&["leetcode.com", "leetcode"])
                    .hosts(&["leetcode.com"])
                    .name_keywords(&["leetcode"]),
                PlatformRule::new(Platform::CodeChef, "https://www.codechef.com/contests")
                    .resources(&["codechef.com", "codechef"])
                    .hosts(&["codechef.com"])
                    .name_keywords(&["codechef"]),
            ],
            &["codeforces::gym", "codeforces.com/gym"],
        )
    }

    pub fn contests_url(&self, platform: Platform) -> &str {
        self.rules
            .iter()
            .find(|r| r.platform == platform)
            .map(|r| r.contests_url.as_str())
            .unwrap_or_default()
    }

    pub fn detect(&self, record: &RawContest) -> Option<Platform> {
        if let Some(resource) = record.resource.as_deref() {
            let resource = resource.trim().to_lowercase();
            if self.ignored_resources.contains(&resource) {
                return None;
            }
            if let Some(rule) = self
                .rules
                .iter()
                .find(|r| r.resources.contains(&resource))
            {
                return Some(rule.platform);
            }
        }

        if let Some(host) = record.url.as_deref().and_then(url_host) {
            if let Some(rule) = self
                .rules
                .iter()
                .find(|r| r.hosts.iter().any(|h| host.contains(h.as_str())))
            {
                return Some(rule.platform);
            }
        }

        let name = record.name.to_lowercase();
        self.rules
            .iter()
            .find(|r| r.name_keywords.iter().any(|k| name.contains(k.as_str())))
            .map(|r| r.platform)
    }
}

fn url_host(raw: &str) -> Option<String> {
    url::Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

pub fn normalize(
    records: Vec<RawContest>,
    platform: Platform,
    rules: &PlatformRules,
    window: &TimeRange,
) -> Vec<Contest> {
    records
        .into_iter()
        .filter_map(|raw| {
            if rules.detect(&raw)? != platform {
                return None;
            }
            let url = raw
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| rules.contests_url(platform))
                .to_string();
            match Contest::new(platform, raw.name.as_str(), raw.start, raw.resolved_end(), url) {
                Ok(contest) if window.contains(contest.start_time()) => Some(contest),
                Ok(_) => None,
                Err(err) => {
                    debug!(%platform, error = %err, "dropping invalid contest record");
                    None
                }
            }
        })
        .collect()
}

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, SourceFailure> {
    serde_json::from_slice(body).map_err(|e| SourceFailure::BadFormat(e.to_string()))
}

fn epoch(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let naive = s.trim_end_matches("UTC").trim_end_matches('Z').trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|n| n.and_utc())
}

fn parse_hh_mm(input: &str) -> Option<i64> {
    let (h, m) = input.trim().split_once(':')?;
    let h: i64 = h.trim().parse().ok()?;
    let m: i64 = m.trim().parse().ok()?;
    h.checked_mul(3600)?.checked_add(m.checked_mul(60)?)
}

fn selector(css: &str) -> Result<Selector, SourceFailure> {
    Selector::parse(css).map_err(|e| SourceFailure::BadFormat(e.to_string()))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn drop_unparsed(source_id: &str, name: &str) {
    debug!(source_id, name, "dropping record with unparseable timestamps");
}

#[derive(Debug, Deserialize)]
struct CodeforcesEnvelope {
    status: String,
    comment: Option<String>,
    result: Option<Vec<CodeforcesContest>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeforcesContest {
    id: i64,
    name: String,
    phase: String,
    duration_seconds: Option<i64>,
    start_time_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CodeforcesApiAdapter {
    endpoint: String,
    pre_call_delay: Duration,
}

impl Default for CodeforcesApiAdapter {
    fn default() -> Self {
        Self {
            endpoint: "https://codeforces.com/api/contest.list?gym=false".to_string(),
            // Codeforces asks for at most one API call per two seconds.
            pre_call_delay: Duration::from_secs(2),
        }
    }
}

impl CodeforcesApiAdapter {
    pub fn parse(&self, body: &[u8]) -> SourceResult {
        let envelope: CodeforcesEnvelope = decode_json(body)?;
        if envelope.status != "OK" {
            let comment = envelope.comment.unwrap_or_default();
            if comment.to_lowercase().contains("limit exceeded") {
                return Err(SourceFailure::Transient(comment));
            }
            return Err(SourceFailure::BadFormat(format!(
                "status {}: {comment}",
                envelope.status
            )));
        }
        let contests = envelope
            .result
            .ok_or_else(|| SourceFailure::BadFormat("missing result".to_string()))?;

        let records = contests
            .into_iter()
            .filter(|c| c.phase == "BEFORE")
            .filter_map(|c| {
                let Some(start) = c.start_time_seconds.and_then(epoch) else {
                    drop_unparsed(CODEFORCES_API, &c.name);
                    return None;
                };
                Some(RawContest {
                    resource: Some("codeforces.com".to_string()),
                    url: Some(format!("https://codeforces.com/contest/{}", c.id)),
                    name: c.name,
                    start,
                    end: None,
                    duration_secs: c.duration_seconds,
                })
            })
            .collect();
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for CodeforcesApiAdapter {
    fn source_id(&self) -> &'static str {
        CODEFORCES_API
    }

    fn kind(&self) -> SourceKind {
        SourceKind::StructuredApi
    }

    fn probe_url(&self) -> &str {
        "https://codeforces.com/api/contest.list?gym=false"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        let req = HttpRequest::new(&self.endpoint)
            .timeout(request.timeout)
            .pre_call_delay(self.pre_call_delay);
        let page = http.get(request.run_id, self.source_id(), &req).await?;
        self.parse(&page.body)
    }
}

const LEETCODE_UPCOMING_QUERY: &str =
    "query upcomingContests { upcomingContests { title titleSlug startTime duration } }";

#[derive(Debug, Deserialize)]
struct LeetCodeEnvelope {
    data: Option<LeetCodeData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeetCodeData {
    upcoming_contests: Vec<LeetCodeContest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeetCodeContest {
    title: String,
    title_slug: String,
    start_time: i64,
    duration: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LeetCodeGraphqlAdapter {
    endpoint: String,
}

impl Default for LeetCodeGraphqlAdapter {
    fn default() -> Self {
        Self {
            endpoint: "https://leetcode.com/graphql".to_string(),
        }
    }
}

impl LeetCodeGraphqlAdapter {
    pub fn parse(&self, body: &[u8]) -> SourceResult {
        let envelope: LeetCodeEnvelope = decode_json(body)?;
        let data = envelope
            .data
            .ok_or_else(|| SourceFailure::BadFormat("graphql response without data".to_string()))?;
        let records = data
            .upcoming_contests
            .into_iter()
            .filter_map(|c| {
                let Some(start) = epoch(c.start_time) else {
                    drop_unparsed(LEETCODE_GRAPHQL, &c.title);
                    return None;
                };
                Some(RawContest {
                    resource: Some("leetcode.com".to_string()),
                    url: Some(format!("https://leetcode.com/contest/{}", c.title_slug)),
                    name: c.title,
                    start,
                    end: None,
                    duration_secs: c.duration,
                })
            })
            .collect();
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for LeetCodeGraphqlAdapter {
    fn source_id(&self) -> &'static str {
        LEETCODE_GRAPHQL
    }

    fn kind(&self) -> SourceKind {
        SourceKind::StructuredApi
    }

    fn probe_url(&self) -> &str {
        "https://leetcode.com/contest/"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        let req = HttpRequest::new(&self.endpoint)
            .timeout(request.timeout)
            .header("Referer", "https://leetcode.com/contest/");
        let body = serde_json::json!({ "query": LEETCODE_UPCOMING_QUERY });
        let page = http
            .post_json(request.run_id, self.source_id(), &req, &body)
            .await?;
        self.parse(&page.body)
    }
}

#[derive(Debug, Deserialize)]
struct CodeChefEnvelope {
    status: String,
    #[serde(default)]
    present_contests: Option<Vec<CodeChefContest>>,
    #[serde(default)]
    future_contests: Option<Vec<CodeChefContest>>,
}

#[derive(Debug, Deserialize)]
struct CodeChefContest {
    contest_code: String,
    contest_name: String,
    contest_start_date_iso: String,
    contest_end_date_iso: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CodeChefApiAdapter {
    endpoint: String,
}

impl Default for CodeChefApiAdapter {
    fn default() -> Self {
        Self {
            endpoint: "https://www.codechef.com/api/list/contests/all?sort_by=START&sorting_order=asc&offset=0&mode=all".to_string(),
        }
    }
}

impl CodeChefApiAdapter {
    pub fn parse(&self, body: &[u8]) -> SourceResult {
        let envelope: CodeChefEnvelope = decode_json(body)?;
        if envelope.status != "success" {
            return Err(SourceFailure::BadFormat(format!("status {}", envelope.status)));
        }
        if envelope.present_contests.is_none() && envelope.future_contests.is_none() {
            return Err(SourceFailure::BadFormat("missing contest lists".to_string()));
        }
        let records = envelope
            .present_contests
            .into_iter()
            .chain(envelope.future_contests)
            .flatten()
            .filter_map(|c| {
                let Some(start) = parse_timestamp(&c.contest_start_date_iso) else {
                    drop_unparsed(CODECHEF_API, &c.contest_name);
                    return None;
                };
                Some(RawContest {
                    resource: Some("codechef.com".to_string()),
                    url: Some(format!("https://www.codechef.com/{}", c.contest_code)),
                    name: c.contest_name,
                    start,
                    end: c.contest_end_date_iso.as_deref().and_then(parse_timestamp),
                    duration_secs: None,
                })
            })
            .collect();
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for CodeChefApiAdapter {
    fn source_id(&self) -> &'static str {
        CODECHEF_API
    }

    fn kind(&self) -> SourceKind {
        SourceKind::StructuredApi
    }

    fn probe_url(&self) -> &str {
        "https://www.codechef.com/contests"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        let req = HttpRequest::new(&self.endpoint).timeout(request.timeout);
        let page = http.get(request.run_id, self.source_id(), &req).await?;
        self.parse(&page.body)
    }
}

#[derive(Debug, Deserialize)]
struct ClistPage {
    objects: Vec<ClistContest>,
}

#[derive(Debug, Deserialize)]
struct ClistContest {
    event: String,
    resource: Option<String>,
    host: Option<String>,
    href: Option<String>,
    start: String,
    end: Option<String>,
    duration: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ClistAdapter {
    endpoint: String,
    username: String,
    api_key: String,
}

impl ClistAdapter {
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: "https://clist.by/api/v4/contest/".to_string(),
            username: username.into(),
            api_key: api_key.into(),
        }
    }

    pub fn request_url(&self, window: &TimeRange) -> Result<String, SourceFailure> {
        let fmt = "%Y-%m-%dT%H:%M:%S";
        url::Url::parse_with_params(
            &self.endpoint,
            &[
                ("upcoming", "true".to_string()),
                ("start__gte", window.begin.format(fmt).to_string()),
                ("start__lte", window.end.format(fmt).to_string()),
                ("order_by", "start".to_string()),
                ("limit", "200".to_string()),
                ("format", "json".to_string()),
            ],
        )
        .map(String::from)
        .map_err(|e| SourceFailure::Unavailable(e.to_string()))
    }

    pub fn parse(&self, body: &[u8]) -> SourceResult {
        let page: ClistPage = decode_json(body)?;
        let records = page
            .objects
            .into_iter()
            .filter_map(|c| {
                let Some(start) = parse_timestamp(&c.start) else {
                    drop_unparsed(CLIST, &c.event);
                    return None;
                };
                Some(RawContest {
                    resource: c.resource.or(c.host),
                    name: c.event,
                    url: c.href,
                    start,
                    end: c.end.as_deref().and_then(parse_timestamp),
                    duration_secs: c.duration,
                })
            })
            .collect();
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for ClistAdapter {
    fn source_id(&self) -> &'static str {
        CLIST
    }

    fn kind(&self) -> SourceKind {
        SourceKind::AggregatorApi
    }

    fn probe_url(&self) -> &str {
        "https://clist.by/"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        if self.username.is_empty() || self.api_key.is_empty() {
            return Err(SourceFailure::Unavailable("missing clist credentials".to_string()));
        }
        let req = HttpRequest::new(self.request_url(&request.window)?)
            .timeout(request.timeout)
            .header(
                "Authorization",
                format!("ApiKey {}:{}", self.username, self.api_key),
            );
        let page = http.get(request.run_id, self.source_id(), &req).await?;
        self.parse(&page.body)
    }
}

#[derive(Debug, Clone)]
pub struct AtCoderScrapeAdapter {
    endpoint: String,
}

impl Default for AtCoderScrapeAdapter {
    fn default() -> Self {
        Self {
            endpoint: "https://atcoder.jp/contests/?lang=en".to_string(),
        }
    }
}

impl AtCoderScrapeAdapter {
    pub fn parse(&self, html: &str) -> SourceResult {
        let document = Html::parse_document(html);
        let table = selector("#contest-table-upcoming")?;
        if document.select(&table).next().is_none() {
            return Err(SourceFailure::BadFormat(
                "upcoming contest table missing".to_string(),
            ));
        }

        let rows = selector("#contest-table-upcoming tbody tr")?;
        let cells = selector("td")?;
        let time = selector("time")?;
        let link = selector("a[href^='/contests/']")?;

        let mut records = Vec::new();
        for row in document.select(&rows) {
            let tds: Vec<ElementRef<'_>> = row.select(&cells).collect();
            let (Some(start_td), Some(name_td)) = (tds.first(), tds.get(1)) else {
                continue;
            };
            let Some(anchor) = name_td.select(&link).next() else {
                continue;
            };
            let name = element_text(anchor);
            let start_text = start_td
                .select(&time)
                .next()
                .map(element_text)
                .unwrap_or_else(|| element_text(*start_td));
            let Some(start) = parse_timestamp(&start_text) else {
                drop_unparsed(ATCODER_SCRAPE, &name);
                continue;
            };
            let href = anchor.value().attr("href").unwrap_or_default();
            records.push(RawContest {
                resource: Some("atcoder.jp".to_string()),
                url: Some(format!("https://atcoder.jp{href}")),
                name,
                start,
                end: None,
                duration_secs: tds.get(2).and_then(|td| parse_hh_mm(&element_text(*td))),
            });
        }
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for AtCoderScrapeAdapter {
    fn source_id(&self) -> &'static str {
        ATCODER_SCRAPE
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PageScrape
    }

    fn probe_url(&self) -> &str {
        "https://atcoder.jp/contests/"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        let req = HttpRequest::new(&self.endpoint).timeout(request.timeout);
        let page = http.get(request.run_id, self.source_id(), &req).await?;
        let html = String::from_utf8_lossy(&page.body);
        self.parse(&html)
    }
}

#[derive(Debug, Deserialize)]
struct ProblemsContest {
    id: String,
    start_epoch_second: i64,
    duration_second: i64,
    title: String,
}

#[derive(Debug, Clone)]
pub struct AtCoderProblemsAdapter {
    endpoint: String,
}

impl Default for AtCoderProblemsAdapter {
    fn default() -> Self {
        Self {
            endpoint: "https://kenkoooo.com/atcoder/resources/contests.json".to_string(),
        }
    }
}

impl AtCoderProblemsAdapter {
    pub fn parse(&self, body: &[u8], now: DateTime<Utc>) -> SourceResult {
        let contests: Vec<ProblemsContest> = decode_json(body)?;
        let records = contests
            .into_iter()
            .filter_map(|c| {
                let start = epoch(c.start_epoch_second)?;
                (start >= now).then(|| RawContest {
                    resource: Some("atcoder.jp".to_string()),
                    url: Some(format!("https://atcoder.jp/contests/{}", c.id)),
                    name: c.title,
                    start,
                    end: None,
                    duration_secs: Some(c.duration_second),
                })
            })
            .collect();
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for AtCoderProblemsAdapter {
    fn source_id(&self) -> &'static str {
        ATCODER_PROBLEMS
    }

    fn kind(&self) -> SourceKind {
        SourceKind::LegacyApi
    }

    fn probe_url(&self) -> &str {
        "https://kenkoooo.com/atcoder/resources/contests.json"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        let req = HttpRequest::new(&self.endpoint).timeout(request.timeout);
        let page = http.get(request.run_id, self.source_id(), &req).await?;
        self.parse(&page.body, request.window.begin)
    }
}

#[derive(Debug, Deserialize)]
struct KontestsContest {
    name: String,
    url: Option<String>,
    start_time: String,
    end_time: Option<String>,
    site: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KontestsAdapter {
    endpoint: String,
}

impl Default for KontestsAdapter {
    fn default() -> Self {
        Self {
            endpoint: "https://kontests.net/api/v1/all".to_string(),
        }
    }
}

impl KontestsAdapter {
    pub fn parse(&self, body: &[u8]) -> SourceResult {
        let contests: Vec<KontestsContest> = decode_json(body)?;
        let records = contests
            .into_iter()
            .filter(|c| c.status.as_deref().map_or(true, |s| s == "BEFORE"))
            .filter_map(|c| {
                let Some(start) = parse_timestamp(&c.start_time) else {
                    drop_unparsed(KONTESTS, &c.name);
                    return None;
                };
                Some(RawContest {
                    resource: c.site,
                    name: c.name,
                    url: c.url,
                    start,
                    end: c.end_time.as_deref().and_then(parse_timestamp),
                    duration_secs: None,
                })
            })
            .collect();
        SourceFailure::non_empty(records)
    }
}

#[async_trait]
impl SourceAdapter for KontestsAdapter {
    fn source_id(&self) -> &'static str {
        KONTESTS
    }

    fn kind(&self) -> SourceKind {
        SourceKind::LegacyApi
    }

    fn probe_url(&self) -> &str {
        "https://kontests.net/api/v1/sites"
    }

    async fn fetch(&self, http: &HttpFetcher, request: &FetchRequest) -> SourceResult {
        let req = HttpRequest::new(&self.endpoint).timeout(request.timeout);
        let page = http.get(request.run_id, self.source_id(), &req).await?;
        self.parse(&page.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    fn march_window() -> TimeRange {
        TimeRange::new(utc(2026, 3, 1, 0, 0), utc(2026, 3, 15, 0, 0))
    }

    fn raw(resource: Option<&str>, url: Option<&str>, name: &str) -> RawContest {
        RawContest {
            resource: resource.map(str::to_string),
            name: name.to_string(),
            url: url.map(str::to_string),
            start: utc(2026, 3, 7, 12, 0),
            end: None,
            duration_secs: None,
        }
    }

    #[test]
    fn codeforces_keeps_only_upcoming_phase() {
        let body = include_bytes!("../tests/fixtures/codeforces_contest_list.json");
        let records = CodeforcesApiAdapter::default().parse(body).expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Codeforces Round 1020 (Div. 2)");
        assert_eq!(records[0].start, utc(2026, 3, 7, 14, 35));
        assert_eq!(records[0].resolved_end(), Some(utc(2026, 3, 7, 16, 35)));
        assert_eq!(records[0].url.as_deref(), Some("https://codeforces.com/contest/2110"));
    }

    #[test]
    fn out_of_range_codeforces_times_are_dropped() {
        let body = br#"{"status": "OK", "result": [
            {"id": 1, "name": "Endless Round", "phase": "BEFORE", "durationSeconds": 1000000000000000, "startTimeSeconds": 1772894100},
            {"id": 2, "name": "Far Round", "phase": "BEFORE", "durationSeconds": 7200, "startTimeSeconds": 8210266876799}
        ]}"#;
        let records = CodeforcesApiAdapter::default().parse(body).expect("records");
        assert_eq!(records.len(), 2);

        let wide = TimeRange::new(utc(2026, 3, 1, 0, 0), DateTime::<Utc>::MAX_UTC);
        let contests = normalize(records, Platform::Codeforces, &PlatformRules::builtin(), &wide);
        assert_eq!(contests.len(), 1);
        assert_eq!(contests[0].name(), "Endless Round");
        assert_eq!(contests[0].end_time(), utc(2026, 3, 7, 16, 35));
    }

    #[test]
    fn codeforces_call_limit_is_transient() {
        let body = include_bytes!("../tests/fixtures/codeforces_call_limit.json");
        let err = CodeforcesApiAdapter::default().parse(body).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn garbage_payload_is_bad_format() {
        let err = CodeforcesApiAdapter::default().parse(b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, SourceFailure::BadFormat(_)));
        let err = KontestsAdapter::default().parse(b"{\"not\": \"a list\"}").unwrap_err();
        assert!(matches!(err, SourceFailure::BadFormat(_)));
    }

    #[test]
    fn empty_result_is_empty_failure() {
        let err = CodeforcesApiAdapter::default()
            .parse(br#"{"status":"OK","result":[]}"#)
            .unwrap_err();
        assert_eq!(err, SourceFailure::Empty);
    }

    #[test]
    fn leetcode_graphql_maps_slugs_to_urls() {
        let body = include_bytes!("../tests/fixtures/leetcode_upcoming.json");
        let records = LeetCodeGraphqlAdapter::default().parse(body).expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].start, utc(2026, 3, 8, 2, 30));
        assert_eq!(
            records[0].url.as_deref(),
            Some("https://leetcode.com/contest/weekly-contest-490")
        );
        let err = LeetCodeGraphqlAdapter::default()
            .parse(br#"{"data": null, "errors": [{"message": "boom"}]}"#)
            .unwrap_err();
        assert!(matches!(err, SourceFailure::BadFormat(_)));
    }

    #[test]
    fn codechef_reads_present_and_future_contests_with_offsets() {
        let body = include_bytes!("../tests/fixtures/codechef_contests.json");
        let records = CodeChefApiAdapter::default().parse(body).expect("records");
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["Starters 225", "Starters 226"]);
        assert_eq!(records[1].start, utc(2026, 3, 4, 14, 30));
        assert_eq!(records[1].end, Some(utc(2026, 3, 4, 16, 30)));

        // started contests fall out of the window
        let rules = PlatformRules::builtin();
        let upcoming = normalize(records, Platform::CodeChef, &rules, &march_window());
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].name(), "Starters 226");

        let err = CodeChefApiAdapter::default()
            .parse(br#"{"status": "success", "past_contests": []}"#)
            .unwrap_err();
        assert!(matches!(err, SourceFailure::BadFormat(_)));
    }

    #[test]
    fn clist_keeps_resource_field_and_naive_utc_times() {
        let adapter = ClistAdapter::new("user", "key");
        let body = include_bytes!("../tests/fixtures/clist_contests.json");
        let records = adapter.parse(body).expect("records");
        assert_eq!(records.len(), 5);
        assert_eq!(records[1].resource.as_deref(), Some("atcoder.jp"));
        assert_eq!(records[1].start, utc(2026, 3, 7, 12, 0));

        let url = adapter.request_url(&march_window()).expect("url");
        assert!(url.starts_with("https://clist.by/api/v4/contest/?upcoming=true"));
        assert!(url.contains("start__gte=2026-03-01T00%3A00%3A00"));
    }

    #[test]
    fn atcoder_scrape_reads_upcoming_table_only() {
        let html = include_str!("../tests/fixtures/atcoder_contests.html");
        let records = AtCoderScrapeAdapter::default().parse(html).expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "AtCoder Beginner Contest 446");
        assert_eq!(records[0].start, utc(2026, 3, 7, 12, 0));
        assert_eq!(records[0].duration_secs, Some(6000));
        assert_eq!(records[1].url.as_deref(), Some("https://atcoder.jp/contests/arc215"));
    }

    #[test]
    fn atcoder_scrape_without_table_is_bad_format() {
        let err = AtCoderScrapeAdapter::default()
            .parse("<html><body>maintenance</body></html>")
            .unwrap_err();
        assert!(matches!(err, SourceFailure::BadFormat(_)));
    }

    #[test]
    fn atcoder_problems_drops_started_contests() {
        let body = include_bytes!("../tests/fixtures/atcoder_problems_contests.json");
        let records = AtCoderProblemsAdapter::default()
            .parse(body, utc(2026, 3, 1, 0, 0))
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url.as_deref(), Some("https://atcoder.jp/contests/abc446"));
    }

    #[test]
    fn kontests_skips_running_contests_and_parses_both_time_styles() {
        let body = include_bytes!("../tests/fixtures/kontests_all.json");
        let records = KontestsAdapter::default().parse(body).expect("records");
        assert_eq!(records.len(), 3);
        let abc = records.iter().find(|r| r.name.contains("446")).unwrap();
        assert_eq!(abc.start, utc(2026, 3, 7, 12, 0));
        assert_eq!(abc.end, Some(utc(2026, 3, 7, 13, 40)));
    }

    #[test]
    fn detection_prefers_resource_then_host_then_name() {
        let rules = PlatformRules::builtin();
        // Resource wins even when the URL points elsewhere.
        assert_eq!(
            rules.detect(&raw(Some("AtCoder"), Some("https://codeforces.com/x"), "LeetCode weekly")),
            Some(Platform::AtCoder)
        );
        // Unknown resource falls through to the host.
        assert_eq!(
            rules.detect(&raw(Some("mirror.example"), Some("https://www.codechef.com/START1"), "Codeforces mirror")),
            Some(Platform::CodeChef)
        );
        // No resource, no recognizable host: name decides.
        assert_eq!(
            rules.detect(&raw(None, Some("https://example.org"), "LeetCode Weekly Contest 1")),
            Some(Platform::LeetCode)
        );
        assert_eq!(rules.detect(&raw(None, None, "SRM 900")), None);
        assert_eq!(
            rules.detect(&raw(Some("CodeForces::Gym"), Some("https://codeforces.com/gym/1"), "Gym")),
            None
        );
    }

    #[test]
    fn normalize_filters_platform_and_window() {
        let body = include_bytes!("../tests/fixtures/clist_contests.json");
        let records = ClistAdapter::new("u", "k").parse(body).expect("records");
        let rules = PlatformRules::builtin();

        let atcoder = normalize(records.clone(), Platform::AtCoder, &rules, &march_window());
        assert_eq!(atcoder.len(), 1);
        assert_eq!(atcoder[0].platform(), Platform::AtCoder);
        assert_eq!(atcoder[0].end_time(), utc(2026, 3, 7, 13, 40));

        let narrow = TimeRange::new(utc(2026, 3, 1, 0, 0), utc(2026, 3, 5, 0, 0));
        assert!(normalize(records, Platform::Codeforces, &rules, &narrow).is_empty());
    }

    #[test]
    fn normalize_falls_back_to_platform_contest_page() {
        let rules = PlatformRules::builtin();
        let mut record = raw(Some("leetcode.com"), None, "Weekly Contest 490");
        record.url = Some("  ".to_string());
        let contests = normalize(vec![record], Platform::LeetCode, &rules, &march_window());
        assert_eq!(contests[0].url(), "https://leetcode.com/contest/");
    }

    #[test]
    fn clist_requires_credentials() {
        let none = SourceCredentials::default();
        assert!(adapter_for_source(CLIST, &none).is_none());
        let blank = SourceCredentials {
            clist_username: Some("me".into()),
            clist_api_key: Some("  ".into()),
        };
        assert!(adapter_for_source(CLIST, &blank).is_none());
        let full = SourceCredentials {
            clist_username: Some("me".into()),
            clist_api_key: Some("abc".into()),
        };
        assert_eq!(adapter_for_source(CLIST, &full).unwrap().kind(), SourceKind::AggregatorApi);
        for id in ALL_SOURCES.iter().filter(|id| **id != CLIST) {
            assert_eq!(adapter_for_source(id, &none).unwrap().source_id(), *id);
        }
    }

    #[test]
    fn timestamp_forms() {
        let expected = utc(2026, 3, 7, 12, 0);
        for input in [
            "2026-03-07T12:00:00Z",
            "2026-03-07T12:00:00.000Z",
            "2026-03-07 21:00:00+0900",
            "2026-03-07T12:00:00",
            "2026-03-07 12:00:00 UTC",
            "2026-03-07T17:30:00+05:30",
        ] {
            assert_eq!(parse_timestamp(input), Some(expected), "{input}");
        }
        assert_eq!(parse_timestamp("next tuesday"), None);
        assert_eq!(parse_hh_mm("100:30"), Some(100 * 3600 + 1800));
        assert_eq!(parse_hh_mm("9999999999999999:00"), None);
    }
}
