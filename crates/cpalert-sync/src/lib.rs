//! Contest aggregation and the refresh/arm service loop.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cpalert_adapters::{
    adapter_for_source, normalize, FetchRequest, PlatformRules, SourceAdapter, SourceCredentials,
    SourceKind, ATCODER_PROBLEMS, ATCODER_SCRAPE, CLIST, CODECHEF_API, CODEFORCES_API, KONTESTS,
    LEETCODE_GRAPHQL,
};
use cpalert_core::{
    Contest, ContestList, OffsetParseError, Platform, RawContest, ReminderOffset, SourceFailure,
    TimeRange,
};
use cpalert_http::{BackoffPolicy, HttpClientConfig, HttpFetcher, ProbeStatus};
use cpalert_remind::{
    ArmReport, DeliverySink, FanoutSink, LogSink, ReminderScheduler, ReminderTaskView,
    SystemClock, WebhookSink,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpalert-sync";

// Covers pre-call delays and body parsing on top of the HTTP timeout.
const ATTEMPT_GUARD_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

impl From<OffsetParseError> for ConfigError {
    fn from(err: OffsetParseError) -> Self {
        ConfigError::InvalidValue {
            key: "CPALERT_REMINDER_OFFSETS",
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub platforms_file: PathBuf,
    pub days_ahead: u32,
    pub refresh_cron: String,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub reminder_offsets: Vec<ReminderOffset>,
    pub credentials: SourceCredentials,
    pub webhook_url: Option<String>,
    pub bind_addr: String,
}

impl AlertConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let days_ahead = match non_empty("CPALERT_DAYS_AHEAD") {
            Some(v) => parse_whole("CPALERT_DAYS_AHEAD", &v)?,
            None => 7,
        };
        let http_timeout_secs = match non_empty("CPALERT_HTTP_TIMEOUT_SECS") {
            Some(v) => match parse_whole("CPALERT_HTTP_TIMEOUT_SECS", &v)? {
                0 => {
                    return Err(ConfigError::InvalidValue {
                        key: "CPALERT_HTTP_TIMEOUT_SECS",
                        message: "timeout must be at least one second".to_string(),
                    })
                }
                secs => secs,
            },
            None => 10,
        };
        let scheduler_enabled = match non_empty("CPALERT_SCHEDULER_ENABLED") {
            Some(v) => parse_flag("CPALERT_SCHEDULER_ENABLED", &v)?,
            None => true,
        };
        let reminder_offsets = match non_empty("CPALERT_REMINDER_OFFSETS") {
            Some(v) => ReminderOffset::parse_list(&v)?,
            None => ReminderOffset::defaults(),
        };
        if reminder_offsets.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CPALERT_REMINDER_OFFSETS",
                message: "at least one offset is required".to_string(),
            });
        }

        Ok(Self {
            platforms_file: non_empty("CPALERT_PLATFORMS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./platforms.yaml")),
            days_ahead,
            refresh_cron: non_empty("CPALERT_REFRESH_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            scheduler_enabled,
            user_agent: non_empty("CPALERT_USER_AGENT")
                .unwrap_or_else(|| format!("cpalert/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs,
            reminder_offsets,
            credentials: SourceCredentials {
                clist_username: non_empty("CLIST_USERNAME"),
                clist_api_key: non_empty("CLIST_API_KEY"),
            },
            webhook_url: non_empty("CPALERT_WEBHOOK_URL"),
            bind_addr: non_empty("CPALERT_BIND_ADDR")
                .unwrap_or_else(|| "127.0.0.1:8088".to_string()),
        })
    }
}

fn parse_whole<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        message: format!("`{value}` is not a whole number"),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            message: format!("`{value}` is not a boolean"),
        }),
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub platform: Platform,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub days_ahead: Option<u32>,
}

/// Enabled platforms and per-platform windows, read from `platforms.yaml`.
/// Platforms absent from an existing file are disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRegistry {
    pub platforms: Vec<PlatformSettings>,
}

impl PlatformRegistry {
    pub fn all_enabled() -> Self {
        Self {
            platforms: Platform::ALL
                .into_iter()
                .map(|platform| PlatformSettings {
                    platform,
                    enabled: true,
                    days_ahead: None,
                })
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no platform registry; enabling every platform");
                return Ok(Self::all_enabled());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn enabled(&self) -> BTreeSet<Platform> {
        self.platforms
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.platform)
            .collect()
    }

    pub fn windows(&self, now: DateTime<Utc>, default_days: u32) -> Vec<(Platform, TimeRange)> {
        let mut seen = BTreeMap::new();
        for settings in self.platforms.iter().filter(|s| s.enabled) {
            seen.entry(settings.platform).or_insert_with(|| {
                TimeRange::days_ahead(now, settings.days_ahead.unwrap_or(default_days))
            });
        }
        seen.into_iter().collect()
    }
}

// One permit per cascade that uses a source, so cascades sharing an
// aggregator source never queue behind each other under the attempt guard.
pub fn shared_source_limits() -> HashMap<String, usize> {
    let mut limits = HashMap::new();
    for platform in Platform::ALL {
        for source_id in default_source_order(platform) {
            *limits.entry(source_id.to_string()).or_insert(0) += 1;
        }
    }
    limits
}

pub fn http_config(config: &AlertConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        source_concurrency: shared_source_limits(),
        ..Default::default()
    }
}

pub fn default_source_order(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Codeforces => &[CODEFORCES_API, CLIST, KONTESTS],
        Platform::AtCoder => &[CLIST, ATCODER_SCRAPE, ATCODER_PROBLEMS, KONTESTS],
        Platform::LeetCode => &[LEETCODE_GRAPHQL, CLIST, KONTESTS],
        Platform::CodeChef => &[CODECHEF_API, CLIST, KONTESTS],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub source_id: &'static str,
    pub attempts: usize,
    pub failure: SourceFailure,
}

#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub platform: Platform,
    pub contests: ContestList,
    pub winner: Option<&'static str>,
    pub failures: Vec<AdapterFailure>,
}

impl CascadeOutcome {
    pub fn nothing_scheduled(&self) -> bool {
        self.contests.is_empty()
            && self
                .failures
                .iter()
                .all(|f| f.failure == SourceFailure::Empty)
    }
}

pub struct Cascade {
    platform: Platform,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    rules: Arc<PlatformRules>,
    policy: BackoffPolicy,
}

impl Cascade {
    pub fn new(
        platform: Platform,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: Arc<HttpFetcher>,
        rules: Arc<PlatformRules>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            platform,
            adapters,
            http,
            rules,
            policy,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn source_ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    pub async fn fetch_platform(&self, window: TimeRange) -> ContestList {
        self.run(window).await.contests
    }

    pub async fn run(&self, window: TimeRange) -> CascadeOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("cascade", platform = %self.platform, %run_id);
        async {
            let mut failures = Vec::new();
            for adapter in &self.adapters {
                let source_id = adapter.source_id();
                let (records, attempts) = match self.attempt(adapter.as_ref(), run_id, window).await {
                    Ok(ok) => ok,
                    Err(failure) => {
                        warn!(
                            source_id,
                            attempts = failure.attempts,
                            error = %failure.failure,
                            "source failed; advancing cascade"
                        );
                        failures.push(failure);
                        continue;
                    }
                };

                let contests = normalize(records, self.platform, &self.rules, &window);
                if contests.is_empty() {
                    debug!(source_id, "source had no valid contests for platform in window");
                    failures.push(AdapterFailure {
                        source_id,
                        attempts,
                        failure: SourceFailure::Empty,
                    });
                    continue;
                }

                info!(source_id, contests = contests.len(), "source accepted");
                return CascadeOutcome {
                    platform: self.platform,
                    contests,
                    winner: Some(source_id),
                    failures,
                };
            }

            let outcome = CascadeOutcome {
                platform: self.platform,
                contests: Vec::new(),
                winner: None,
                failures,
            };
            if outcome.nothing_scheduled() {
                info!("no contests in range");
            } else {
                warn!(failed_sources = outcome.failures.len(), "all sources failed");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn attempt(
        &self,
        adapter: &dyn SourceAdapter,
        run_id: Uuid,
        window: TimeRange,
    ) -> Result<(Vec<RawContest>, usize), AdapterFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let timeout = self.policy.timeout_for_attempt(attempt);
            let request = FetchRequest {
                run_id,
                window,
                timeout,
                attempt,
            };
            let result = tokio::time::timeout(
                timeout + ATTEMPT_GUARD_SLACK,
                adapter.fetch(&self.http, &request),
            )
            .await
            .unwrap_or(Err(SourceFailure::TimedOut));
            attempt += 1;

            match result {
                Ok(records) if records.is_empty() => {
                    return Err(AdapterFailure {
                        source_id: adapter.source_id(),
                        attempts: attempt,
                        failure: SourceFailure::Empty,
                    })
                }
                Ok(records) => return Ok((records, attempt)),
                Err(failure) if failure.is_retryable() && attempt < max_attempts => {
                    debug!(
                        source_id = adapter.source_id(),
                        attempt,
                        error = %failure,
                        "transient failure; retrying same source"
                    );
                    tokio::time::sleep(self.policy.delay_for_attempt(attempt - 1)).await;
                }
                Err(failure) => {
                    return Err(AdapterFailure {
                        source_id: adapter.source_id(),
                        attempts: attempt,
                        failure,
                    })
                }
            }
        }
    }

    pub async fn probe(&self) -> PlatformProbe {
        let adapters = join_all(self.adapters.iter().map(|adapter| async move {
            AdapterProbe {
                source_id: adapter.source_id(),
                kind: adapter.kind(),
                status: self.http.probe(adapter.source_id(), adapter.probe_url()).await,
            }
        }))
        .await;
        PlatformProbe {
            platform: self.platform,
            reachable: adapters.iter().any(|a| a.status == ProbeStatus::Reachable),
            adapters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterProbe {
    pub source_id: &'static str,
    pub kind: SourceKind,
    pub status: ProbeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformProbe {
    pub platform: Platform,
    pub reachable: bool,
    pub adapters: Vec<AdapterProbe>,
}

pub struct Aggregator {
    cascades: BTreeMap<Platform, Cascade>,
}

impl Aggregator {
    pub fn new(cascades: Vec<Cascade>) -> Self {
        Self {
            cascades: cascades.into_iter().map(|c| (c.platform(), c)).collect(),
        }
    }

    pub fn from_sources(
        http: Arc<HttpFetcher>,
        credentials: &SourceCredentials,
        rules: PlatformRules,
        policy: BackoffPolicy,
    ) -> Self {
        let rules = Arc::new(rules);
        let mut shared: BTreeMap<&'static str, Arc<dyn SourceAdapter>> = BTreeMap::new();
        let cascades = Platform::ALL
            .into_iter()
            .map(|platform| {
                let adapters = default_source_order(platform)
                    .iter()
                    .filter_map(|id| {
                        if let Some(adapter) = shared.get(id) {
                            return Some(Arc::clone(adapter));
                        }
                        let adapter = adapter_for_source(id, credentials);
                        match &adapter {
                            Some(a) => {
                                shared.insert(*id, Arc::clone(a));
                            }
                            None => debug!(source_id = *id, %platform, "source not configured; skipped"),
                        }
                        adapter
                    })
                    .collect();
                Cascade::new(platform, adapters, Arc::clone(&http), Arc::clone(&rules), policy)
            })
            .collect();
        Self::new(cascades)
    }

    pub fn cascade(&self, platform: Platform) -> Option<&Cascade> {
        self.cascades.get(&platform)
    }

    pub async fn fetch_platform(&self, platform: Platform, window: TimeRange) -> ContestList {
        match self.cascades.get(&platform) {
            Some(cascade) => cascade.fetch_platform(window).await,
            None => Vec::new(),
        }
    }

    pub async fn aggregate(&self, platforms: &BTreeSet<Platform>, window: TimeRange) -> ContestList {
        let requests: Vec<_> = platforms.iter().map(|p| (*p, window)).collect();
        self.aggregate_windows(&requests).await
    }

    pub async fn aggregate_windows(&self, requests: &[(Platform, TimeRange)]) -> ContestList {
        let fetched = join_all(requests.iter().map(|(platform, window)| async move {
            (*window, self.fetch_platform(*platform, *window).await)
        }))
        .await;

        let mut seen = HashSet::new();
        let mut contests: ContestList = fetched
            .into_iter()
            .flat_map(|(window, contests)| {
                contests
                    .into_iter()
                    .filter(move |c| window.contains(c.start_time()))
            })
            .filter(|c| seen.insert(c.identity()))
            .collect();
        contests.sort_by(Contest::cmp_schedule);
        contests
    }

    pub async fn probe(&self, platform: Platform) -> Option<PlatformProbe> {
        match self.cascades.get(&platform) {
            Some(cascade) => Some(cascade.probe().await),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub contests: usize,
    pub reminders: ArmReport,
}

pub struct AlertService {
    aggregator: Aggregator,
    scheduler: ReminderScheduler,
    registry: PlatformRegistry,
    default_days: u32,
    last: RwLock<ContestList>,
    refresh_lock: Mutex<()>,
}

impl AlertService {
    pub fn new(
        aggregator: Aggregator,
        scheduler: ReminderScheduler,
        registry: PlatformRegistry,
        default_days: u32,
    ) -> Self {
        Self {
            aggregator,
            scheduler,
            registry,
            default_days,
            last: RwLock::new(Vec::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &AlertConfig) -> anyhow::Result<Self> {
        let registry = PlatformRegistry::load(&config.platforms_file)?;
        let http = HttpFetcher::new(http_config(config)).context("building http fetcher")?;
        let policy = BackoffPolicy {
            base_timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        };
        let aggregator = Aggregator::from_sources(
            Arc::new(http),
            &config.credentials,
            PlatformRules::builtin(),
            policy,
        );

        let mut sinks: Vec<Arc<dyn DeliverySink>> = vec![Arc::new(LogSink)];
        if let Some(url) = &config.webhook_url {
            sinks.push(Arc::new(
                WebhookSink::new(url.clone())
                    .with_timeout(Duration::from_secs(config.http_timeout_secs)),
            ));
        }
        let scheduler = ReminderScheduler::new(
            config.reminder_offsets.clone(),
            Arc::new(FanoutSink::new(sinks)),
            Arc::new(SystemClock),
        );

        Ok(Self::new(aggregator, scheduler, registry, config.days_ahead))
    }

    pub async fn refresh(&self) -> ContestList {
        self.refresh_with_days(None).await
    }

    pub async fn refresh_with_days(&self, days: Option<u32>) -> ContestList {
        let now = self.scheduler.clock().now();
        let requests = match days {
            Some(days) => self
                .registry
                .enabled()
                .into_iter()
                .map(|p| (p, TimeRange::days_ahead(now, days)))
                .collect(),
            None => self.registry.windows(now, self.default_days),
        };
        let contests = self.aggregator.aggregate_windows(&requests).await;
        info!(contests = contests.len(), platforms = requests.len(), "refresh complete");
        *self.last.write().await = contests.clone();
        contests
    }

    pub async fn arm(&self, contests: &[Contest]) -> ArmReport {
        self.scheduler.arm(contests).await
    }

    /// The sequence both the periodic and the on-demand trigger run.
    pub async fn refresh_and_arm(&self) -> RefreshSummary {
        let _guard = self.refresh_lock.lock().await;
        let contests = self.refresh().await;
        let reminders = self.arm(&contests).await;
        RefreshSummary {
            contests: contests.len(),
            reminders,
        }
    }

    pub async fn probe(&self, platform: Platform) -> Option<PlatformProbe> {
        self.aggregator.probe(platform).await
    }

    pub async fn probe_all(&self) -> Vec<PlatformProbe> {
        join_all(self.registry.enabled().into_iter().map(|p| self.probe(p)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn last_contests(&self) -> ContestList {
        self.last.read().await.clone()
    }

    pub async fn reminders(&self) -> Vec<ReminderTaskView> {
        self.scheduler.snapshot().await
    }

    pub async fn shutdown(&self) -> usize {
        self.scheduler.cancel_all().await
    }
}

pub async fn maybe_build_scheduler(
    service: Arc<AlertService>,
    config: &AlertConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.refresh_cron;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            let summary = service.refresh_and_arm().await;
            info!(
                contests = summary.contests,
                armed = summary.reminders.armed,
                "scheduled refresh finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
