//! Reminder scheduling: arming epochs of one-shot timers with at-most-once
//! delivery per `(contest identity, offset)`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cpalert_core::{Contest, ContestIdentity, ReminderOffset};
use dashmap::DashSet;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cpalert-remind";

// Timers re-read the clock after each slice.
const MAX_SLEEP_SLICE: StdDuration = StdDuration::from_secs(3600);

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl AnchoredClock {
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.anchor + elapsed
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery rejected with status {status}")]
    Rejected { status: u16 },
    #[error("delivery transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, contest: &Contest, offset_label: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn deliver(&self, contest: &Contest, offset_label: &str) -> Result<(), DeliveryError> {
        info!(
            platform = %contest.platform(),
            contest = contest.name(),
            url = contest.url(),
            offset = offset_label,
            "reminder"
        );
        Ok(())
    }
}

pub fn summary_line(contest: &Contest, offset_label: &str) -> String {
    format!(
        "{} ({}) starts in {} at {}: {}",
        contest.name(),
        contest.platform(),
        offset_label,
        contest.start_time().format("%Y-%m-%d %H:%M UTC"),
        contest.url()
    )
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: String,
    contest: &'a Contest,
    offset: &'a str,
}

#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
    timeout: StdDuration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: StdDuration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn deliver(&self, contest: &Contest, offset_label: &str) -> Result<(), DeliveryError> {
        let payload = WebhookPayload {
            content: summary_line(contest, offset_label),
            contest,
            offset: offset_label,
        };
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DeliveryError::Rejected {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn DeliverySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn DeliverySink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl DeliverySink for FanoutSink {
    async fn deliver(&self, contest: &Contest, offset_label: &str) -> Result<(), DeliveryError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(contest, offset_label).await {
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError::Message(failures.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Armed,
    Fired,
    Cancelled,
}

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Single-writer state cell: only the first transition out of `Armed` wins.
#[derive(Debug)]
struct TaskSlot(AtomicU8);

impl TaskSlot {
    fn armed() -> Self {
        Self(AtomicU8::new(ARMED))
    }

    fn leave_armed(&self, to: u8) -> bool {
        self.0
            .compare_exchange(ARMED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> TaskState {
        match self.0.load(Ordering::Acquire) {
            ARMED => TaskState::Armed,
            FIRED => TaskState::Fired,
            _ => TaskState::Cancelled,
        }
    }
}

type DedupKey = (ContestIdentity, ReminderOffset);

struct ReminderTask {
    contest: Contest,
    offset: ReminderOffset,
    fire_at: DateTime<Utc>,
    slot: Arc<TaskSlot>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Epoch {
    id: u64,
    tasks: Vec<ReminderTask>,
}

impl Epoch {
    fn cancel(&self) -> usize {
        self.cancel_where(|_| true)
    }

    // Tasks already due finish under their own epoch's dedup set.
    fn cancel_pending(&self, now: DateTime<Utc>) -> usize {
        self.cancel_where(|task| task.fire_at > now)
    }

    fn cancel_where(&self, pick: impl Fn(&ReminderTask) -> bool) -> usize {
        self.tasks
            .iter()
            .filter(|task| pick(task))
            .filter(|task| {
                let cancelled = task.slot.leave_armed(CANCELLED);
                if cancelled {
                    task.handle.abort();
                }
                cancelled
            })
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderTaskView {
    pub epoch: u64,
    pub contest_identity: ContestIdentity,
    pub contest_name: String,
    pub offset: String,
    pub fire_at: DateTime<Utc>,
    pub state: TaskState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArmReport {
    pub epoch: u64,
    pub armed: usize,
    pub cancelled: usize,
    pub skipped_started: usize,
    pub skipped_past_offsets: usize,
}

pub struct ReminderScheduler {
    offsets: Vec<ReminderOffset>,
    sink: Arc<dyn DeliverySink>,
    clock: Arc<dyn Clock>,
    epoch: Mutex<Epoch>,
}

impl ReminderScheduler {
    pub fn new(
        offsets: Vec<ReminderOffset>,
        sink: Arc<dyn DeliverySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            offsets,
            sink,
            clock,
            epoch: Mutex::new(Epoch::default()),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Supersedes the current epoch with reminders for `contests`.
    ///
    /// Calls are serialized; the previous epoch's tasks that are not yet due are
    /// cancelled before any new task is spawned.
    pub async fn arm(&self, contests: &[Contest]) -> ArmReport {
        let mut epoch = self.epoch.lock().await;
        let now = self.clock.now();
        let cancelled = epoch.cancel_pending(now);

        let dedup: Arc<DashSet<DedupKey>> = Arc::new(DashSet::new());
        let mut report = ArmReport {
            epoch: epoch.id + 1,
            cancelled,
            ..ArmReport::default()
        };
        let mut tasks = Vec::new();

        for contest in contests {
            if contest.start_time() <= now {
                report.skipped_started += 1;
                continue;
            }
            for offset in &self.offsets {
                let fire_at = contest.start_time() - offset.as_duration();
                if fire_at <= now {
                    report.skipped_past_offsets += 1;
                    continue;
                }
                let slot = Arc::new(TaskSlot::armed());
                let handle = tokio::spawn(run_task(
                    contest.clone(),
                    *offset,
                    fire_at,
                    Arc::clone(&slot),
                    Arc::clone(&dedup),
                    Arc::clone(&self.sink),
                    Arc::clone(&self.clock),
                ));
                tasks.push(ReminderTask {
                    contest: contest.clone(),
                    offset: *offset,
                    fire_at,
                    slot,
                    handle,
                });
            }
        }

        report.armed = tasks.len();
        *epoch = Epoch {
            id: report.epoch,
            tasks,
        };
        info!(
            epoch = report.epoch,
            armed = report.armed,
            cancelled = report.cancelled,
            skipped_started = report.skipped_started,
            skipped_past_offsets = report.skipped_past_offsets,
            "reminders armed"
        );
        report
    }

    pub async fn cancel_all(&self) -> usize {
        let epoch = self.epoch.lock().await;
        let cancelled = epoch.cancel();
        info!(epoch = epoch.id, cancelled, "reminders cancelled");
        cancelled
    }

    pub async fn snapshot(&self) -> Vec<ReminderTaskView> {
        let epoch = self.epoch.lock().await;
        epoch
            .tasks
            .iter()
            .map(|task| ReminderTaskView {
                epoch: epoch.id,
                contest_identity: task.contest.identity(),
                contest_name: task.contest.name().to_string(),
                offset: task.offset.label(),
                fire_at: task.fire_at,
                state: task.slot.state(),
            })
            .collect()
    }

    pub async fn armed_count(&self) -> usize {
        let epoch = self.epoch.lock().await;
        epoch
            .tasks
            .iter()
            .filter(|task| task.slot.state() == TaskState::Armed)
            .count()
    }
}

impl Drop for ReminderScheduler {
    fn drop(&mut self) {
        if let Ok(epoch) = self.epoch.try_lock() {
            epoch.cancel();
        }
    }
}

async fn sleep_until(clock: &dyn Clock, fire_at: DateTime<Utc>) {
    loop {
        let remaining = fire_at - clock.now();
        let Ok(remaining) = remaining.to_std() else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(MAX_SLEEP_SLICE)).await;
    }
}

async fn run_task(
    contest: Contest,
    offset: ReminderOffset,
    fire_at: DateTime<Utc>,
    slot: Arc<TaskSlot>,
    dedup: Arc<DashSet<DedupKey>>,
    sink: Arc<dyn DeliverySink>,
    clock: Arc<dyn Clock>,
) {
    sleep_until(clock.as_ref(), fire_at).await;

    if !dedup.insert((contest.identity(), offset)) {
        slot.leave_armed(CANCELLED);
        debug!(contest = contest.name(), offset = %offset, "duplicate reminder discarded");
        return;
    }
    if !slot.leave_armed(FIRED) {
        return;
    }

    let label = offset.label();
    match sink.deliver(&contest, &label).await {
        Ok(()) => info!(contest = contest.name(), offset = %label, "reminder delivered"),
        Err(err) => warn!(
            contest = contest.name(),
            offset = %label,
            error = %err,
            "reminder delivery failed; not retrying"
        ),
    }
}
