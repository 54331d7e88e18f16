//! Persistent cron-driven scheduler.
//!
//! State is a min-heap of `(next_run_ts, job_id, version)` plus a version
//! counter per job.  Bumping the version logically invalidates every prior
//! heap entry for that job; the loop lazily discards stale entries instead
//! of searching the heap.  The loop sleeps until the earliest due time and
//! is woken early by upsert/pause/delete through a single wakeup signal,
//! so idle CPU cost is one timer, not a poll.

use crate::platform::MessageService;
use crate::timer::jobs::{
    JobError, JobStatus, JobStore, MisfirePolicy, RecurringJob, WorkdayMode, generate_job_id,
    is_valid_job_id, parse_cron, validate_timezone,
};
use crate::timer::workday::WorkdayOracle;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info, warn};

/// Upper bound on cron occurrences examined by the workday filter.
pub const MAX_FILTER_STEPS: usize = 370;
/// A firing later than this is classified as a misfire.
pub const MISFIRE_THRESHOLD_SECONDS: i64 = 1;
/// Consecutive failures before a job auto-pauses.
pub const AUTO_PAUSE_FAILURES: i64 = 3;

// ---------------------------------------------------------------------------
// Scheduling state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    next_run_ts: i64,
    job_id: String,
    version: u64,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    versions: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Misfire classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MisfireDecision {
    /// Fire the occurrence; `misfire` selects the late marker.
    Fire { misfire: bool },
    /// Drop the occurrence and reschedule only.
    Drop { lag_seconds: i64 },
}

/// Classify a due firing against its scheduled time.
///
/// Within the grace window `fire_once` fires late and `skip` drops; beyond
/// the window both drop.
pub(crate) fn classify_misfire(
    scheduled_ts: i64,
    fired_ts: i64,
    policy: MisfirePolicy,
    grace_seconds: i64,
) -> MisfireDecision {
    let lag_seconds = fired_ts - scheduled_ts;
    if lag_seconds <= MISFIRE_THRESHOLD_SECONDS {
        return MisfireDecision::Fire { misfire: false };
    }
    if lag_seconds > grace_seconds {
        return MisfireDecision::Drop { lag_seconds };
    }
    match policy {
        MisfirePolicy::FireOnce => MisfireDecision::Fire { misfire: true },
        MisfirePolicy::Skip => MisfireDecision::Drop { lag_seconds },
    }
}

// ---------------------------------------------------------------------------
// Next-run computation
// ---------------------------------------------------------------------------

async fn day_passes_filter(oracle: &WorkdayOracle, mode: WorkdayMode, at: &DateTime<Tz>) -> bool {
    let weekday_index = at.weekday().num_days_from_monday();
    match mode {
        WorkdayMode::None => true,
        WorkdayMode::MonFri => weekday_index < 5,
        WorkdayMode::Weekend => weekday_index >= 5,
        // Oracle unavailable: degrade to the plain weekday filters.
        WorkdayMode::CnWorkday => match oracle.is_workday(at.date_naive()).await {
            Some(is_workday) => is_workday,
            None => weekday_index < 5,
        },
        WorkdayMode::CnRestday => match oracle.is_restday(at.date_naive()).await {
            Some(is_restday) => is_restday,
            None => weekday_index >= 5,
        },
    }
}

/// Compute the next occurrence strictly after `max(now, last_run_at + 1s)`
/// that satisfies the job's workday mode.
///
/// Deterministic for a given `now`, which tests inject.
pub async fn compute_next_run_from(
    oracle: &WorkdayOracle,
    job: &RecurringJob,
    now: DateTime<Tz>,
) -> Result<DateTime<Tz>, JobError> {
    let tz = validate_timezone(&job.timezone)?;
    let schedule = parse_cron(&job.cron_expr)?;

    let mut base = now;
    if let Some(last) = job.last_run_at {
        let floor = last.with_timezone(&tz) + ChronoDuration::seconds(1);
        if floor > base {
            base = floor;
        }
    }

    let mut skipped = 0usize;
    for candidate in schedule.after(&base).take(MAX_FILTER_STEPS) {
        if day_passes_filter(oracle, job.workday_mode, &candidate).await {
            if skipped > 0 {
                debug!(
                    job_id = %job.job_id,
                    skipped,
                    mode = job.workday_mode.as_str(),
                    next = %candidate,
                    "workday filter shifted next run"
                );
            }
            return Ok(candidate);
        }
        skipped += 1;
    }
    Err(JobError::FilterExhausted(MAX_FILTER_STEPS))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Parameters for a new recurring job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub chat_key: String,
    pub cron_expr: String,
    pub timezone: String,
    pub workday_mode: WorkdayMode,
    pub event_desc: String,
    pub title: Option<String>,
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub workday_mode: Option<WorkdayMode>,
    pub event_desc: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug)]
pub struct JobSummary {
    pub active: i64,
    pub paused: i64,
    pub upcoming: Vec<RecurringJob>,
    pub recent: Vec<RecurringJob>,
}

pub struct RecurringTimerEngine {
    store: Arc<Mutex<JobStore>>,
    oracle: Arc<WorkdayOracle>,
    messages: Arc<dyn MessageService>,
    sched: Mutex<SchedulerState>,
    wakeup: Notify,
}

impl RecurringTimerEngine {
    pub fn new(
        store: Arc<Mutex<JobStore>>,
        oracle: Arc<WorkdayOracle>,
        messages: Arc<dyn MessageService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            oracle,
            messages,
            sched: Mutex::new(SchedulerState::default()),
            wakeup: Notify::new(),
        })
    }

    /// Restore active jobs from the store and start the scheduling loop.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        self.reload_from_store().await;
        let engine = Arc::clone(self);
        info!("recurring timer engine started");
        tokio::spawn(async move { engine.run_loop(shutdown).await })
    }

    // -----------------------------------------------------------------------
    // Public job API
    // -----------------------------------------------------------------------

    pub async fn create_job(&self, new: NewJob) -> Result<RecurringJob, JobError> {
        validate_timezone(&new.timezone)?;
        parse_cron(&new.cron_expr)?;

        let mut job = {
            let store = self.store.lock().await;
            let job = RecurringJob {
                job_id: generate_job_id(&store)?,
                chat_key: new.chat_key,
                title: new.title,
                event_desc: new.event_desc,
                cron_expr: new.cron_expr,
                timezone: new.timezone,
                workday_mode: new.workday_mode,
                status: JobStatus::Active,
                next_run_at: None,
                last_run_at: None,
                misfire_policy: MisfirePolicy::FireOnce,
                misfire_grace_seconds: 300,
                consecutive_failures: 0,
                last_error: None,
                paused_notice_sent_at: None,
            };
            store.insert(&job)?;
            job
        };
        self.upsert_schedule(&mut job).await?;
        Ok(job)
    }

    pub async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<RecurringJob, JobError> {
        let mut job = self.get_job(job_id).await?;
        if let Some(cron_expr) = update.cron_expr {
            parse_cron(&cron_expr)?;
            job.cron_expr = cron_expr;
        }
        if let Some(timezone) = update.timezone {
            validate_timezone(&timezone)?;
            job.timezone = timezone;
        }
        if let Some(workday_mode) = update.workday_mode {
            job.workday_mode = workday_mode;
        }
        if let Some(event_desc) = update.event_desc {
            job.event_desc = event_desc;
        }
        if let Some(title) = update.title {
            job.title = Some(title);
        }
        self.store.lock().await.update(&job)?;
        if job.status == JobStatus::Active {
            self.upsert_schedule(&mut job).await?;
        }
        Ok(job)
    }

    /// Load a job, healing a missing `next_run_at` on active jobs so the
    /// cron keeps firing for historic rows.
    pub async fn get_job(&self, job_id: &str) -> Result<RecurringJob, JobError> {
        let job_id = job_id.trim();
        if !is_valid_job_id(job_id) {
            return Err(JobError::InvalidJobId(job_id.to_owned()));
        }
        let mut job = self
            .store
            .lock()
            .await
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_owned()))?;
        if job.status == JobStatus::Active && job.next_run_at.is_none() {
            self.upsert_schedule(&mut job).await?;
        }
        Ok(job)
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), JobError> {
        let job_id = job_id.trim();
        self.unschedule(job_id).await;
        self.store.lock().await.delete(job_id)?;
        debug!(job_id, "job deleted");
        Ok(())
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<RecurringJob, JobError> {
        let mut job = self.get_job(job_id).await?;
        job.status = JobStatus::Paused;
        self.store.lock().await.update(&job)?;
        self.unschedule(&job.job_id).await;
        debug!(job_id = %job.job_id, "job paused");
        Ok(job)
    }

    /// Resume a paused job with failure state cleared and a freshly
    /// computed schedule.
    pub async fn resume_job(&self, job_id: &str) -> Result<RecurringJob, JobError> {
        let mut job = self.get_job(job_id).await?;
        job.status = JobStatus::Active;
        job.consecutive_failures = 0;
        job.last_error = None;
        job.paused_notice_sent_at = None;
        self.store.lock().await.update(&job)?;
        self.upsert_schedule(&mut job).await?;
        debug!(job_id = %job.job_id, "job resumed");
        Ok(job)
    }

    /// Fire a job immediately without touching its cron expression.
    pub async fn run_now(&self, job_id: &str) -> Result<bool, JobError> {
        let mut job = self.get_job(job_id).await?;
        if job.status != JobStatus::Active {
            return Ok(false);
        }
        let tz = validate_timezone(&job.timezone)?;
        let fired_at = Utc::now().with_timezone(&tz);
        self.fire_job(&mut job, fired_at, false).await;
        if job.status == JobStatus::Active {
            self.upsert_schedule(&mut job).await?;
        }
        Ok(true)
    }

    pub async fn list_jobs(
        &self,
        chat_key: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<RecurringJob>, JobError> {
        let jobs = self.store.lock().await.list(chat_key, status, limit)?;
        // Heal missing next_run_at so listed cron jobs keep firing.
        let mut healed = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            if job.status == JobStatus::Active && job.next_run_at.is_none() {
                if let Err(e) = self.upsert_schedule(&mut job).await {
                    warn!(job_id = %job.job_id, error = %e, "next_run_at heal failed");
                }
            }
            healed.push(job);
        }
        Ok(healed)
    }

    pub async fn summary(
        &self,
        chat_key: &str,
        upcoming_limit: usize,
        recent_limit: usize,
    ) -> Result<JobSummary, JobError> {
        let missing = {
            let store = self.store.lock().await;
            store.active_missing_next_run(chat_key, upcoming_limit.max(5))?
        };
        for mut job in missing {
            if let Err(e) = self.upsert_schedule(&mut job).await {
                warn!(job_id = %job.job_id, error = %e, "next_run_at heal failed");
            }
        }

        let store = self.store.lock().await;
        Ok(JobSummary {
            active: store.count(chat_key, JobStatus::Active)?,
            paused: store.count(chat_key, JobStatus::Paused)?,
            upcoming: store.upcoming(chat_key, upcoming_limit)?,
            recent: store.recent(chat_key, recent_limit)?,
        })
    }

    // -----------------------------------------------------------------------
    // Scheduling internals
    // -----------------------------------------------------------------------

    async fn compute_next_run(&self, job: &RecurringJob) -> Result<DateTime<Tz>, JobError> {
        let tz = validate_timezone(&job.timezone)?;
        compute_next_run_from(&self.oracle, job, Utc::now().with_timezone(&tz)).await
    }

    /// Recompute `next_run_at`, persist it, and (re)insert into the heap.
    async fn upsert_schedule(&self, job: &mut RecurringJob) -> Result<(), JobError> {
        let next = self.compute_next_run(job).await?;
        job.next_run_at = Some(next.fixed_offset());
        if let Err(e) = self.store.lock().await.update(job) {
            // Keep the in-memory schedule alive even when persistence
            // hiccups; the row catches up on the next successful write.
            error!(job_id = %job.job_id, error = %e, "next_run_at persist failed");
        }
        self.schedule(job).await;
        Ok(())
    }

    async fn schedule(&self, job: &RecurringJob) {
        if job.status != JobStatus::Active {
            return;
        }
        let Some(next_run_at) = job.next_run_at else {
            return;
        };
        let (version, heap_size) = {
            let mut sched = self.sched.lock().await;
            let version = sched.versions.get(&job.job_id).copied().unwrap_or(0) + 1;
            sched.versions.insert(job.job_id.clone(), version);
            sched.heap.push(Reverse(HeapEntry {
                next_run_ts: next_run_at.timestamp(),
                job_id: job.job_id.clone(),
                version,
            }));
            (version, sched.heap.len())
        };
        self.wakeup.notify_one();
        debug!(
            job_id = %job.job_id,
            version,
            next_run_ts = next_run_at.timestamp(),
            heap_size,
            "job scheduled"
        );
    }

    async fn unschedule(&self, job_id: &str) {
        let version = {
            let mut sched = self.sched.lock().await;
            let version = sched.versions.get(job_id).copied().unwrap_or(0) + 1;
            sched.versions.insert(job_id.to_owned(), version);
            version
        };
        self.wakeup.notify_one();
        debug!(job_id, version, "job unscheduled");
    }

    async fn reload_from_store(&self) {
        {
            let mut sched = self.sched.lock().await;
            sched.heap.clear();
            sched.versions.clear();
        }
        let jobs = match self.store.lock().await.active_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "active job reload failed");
                return;
            }
        };
        debug!(active_jobs = jobs.len(), "restoring schedules");
        for mut job in jobs {
            if let Err(e) = self.upsert_schedule(&mut job).await {
                error!(job_id = %job.job_id, error = %e, "job restore failed");
            }
        }
    }

    async fn peek_valid(&self) -> Option<HeapEntry> {
        let mut sched = self.sched.lock().await;
        while let Some(Reverse(entry)) = sched.heap.peek().cloned() {
            let current = sched.versions.get(&entry.job_id).copied().unwrap_or(0);
            if entry.version != current {
                sched.heap.pop();
                continue;
            }
            return Some(entry);
        }
        None
    }

    async fn pop_valid(&self) -> Option<HeapEntry> {
        let mut sched = self.sched.lock().await;
        while let Some(Reverse(entry)) = sched.heap.pop() {
            let current = sched.versions.get(&entry.job_id).copied().unwrap_or(0);
            if entry.version != current {
                continue;
            }
            return Some(entry);
        }
        None
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(entry) = self.peek_valid().await else {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = self.wakeup.notified() => {}
                }
                continue;
            };

            let delay = entry.next_run_ts - Utc::now().timestamp();
            if delay > 0 {
                debug!(job_id = %entry.job_id, due_in = delay, "waiting until due");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = self.wakeup.notified() => {}
                    () = tokio::time::sleep(Duration::from_secs(delay as u64)) => {}
                }
                continue;
            }

            let Some(entry) = self.pop_valid().await else {
                continue;
            };
            let job = match self.store.lock().await.get(&entry.job_id) {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = %entry.job_id, error = %e, "due job load failed");
                    continue;
                }
            };
            let Some(job) = job else {
                debug!(job_id = %entry.job_id, "due job vanished, skipping");
                continue;
            };
            if job.status != JobStatus::Active {
                debug!(job_id = %job.job_id, "due job inactive, skipping");
                continue;
            }

            self.handle_due_job(job).await;
        }
        debug!("recurring timer loop stopped");
    }

    async fn handle_due_job(&self, mut job: RecurringJob) {
        let tz = match validate_timezone(&job.timezone) {
            Ok(tz) => tz,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "job timezone unusable");
                return;
            }
        };
        let fired_at = Utc::now().with_timezone(&tz);

        let decision = match job.next_run_at {
            Some(scheduled) => classify_misfire(
                scheduled.timestamp(),
                fired_at.timestamp(),
                job.misfire_policy,
                job.misfire_grace_seconds,
            ),
            None => MisfireDecision::Fire { misfire: false },
        };

        match decision {
            MisfireDecision::Drop { lag_seconds } => {
                debug!(
                    job_id = %job.job_id,
                    lag_seconds,
                    policy = job.misfire_policy.as_str(),
                    grace = job.misfire_grace_seconds,
                    "missed occurrence dropped"
                );
            }
            MisfireDecision::Fire { misfire } => {
                if misfire {
                    debug!(job_id = %job.job_id, "misfire within grace, firing late");
                }
                self.fire_job(&mut job, fired_at, misfire).await;
            }
        }

        if job.status == JobStatus::Active {
            if let Err(e) = self.upsert_schedule(&mut job).await {
                error!(job_id = %job.job_id, error = %e, "reschedule failed");
            }
        }
    }

    async fn fire_job(&self, job: &mut RecurringJob, fired_at: DateTime<Tz>, misfire: bool) {
        let title = job
            .title
            .as_deref()
            .map(|t| format!("{t}\n"))
            .unwrap_or_default();
        let marker = if misfire { "（补发）" } else { "" };
        let content = format!("⏰ 定时提醒{marker}：{title}{}", job.event_desc);

        match self
            .messages
            .push_system_message(&job.chat_key, &content, true)
            .await
        {
            Ok(()) => {
                job.last_run_at = Some(fired_at.fixed_offset());
                job.consecutive_failures = 0;
                job.last_error = None;
                if let Err(e) = self.store.lock().await.update(job) {
                    error!(job_id = %job.job_id, error = %e, "fire-state persist failed");
                }
                debug!(job_id = %job.job_id, fired_at = %fired_at, misfire, "job fired");
            }
            Err(e) => {
                job.consecutive_failures += 1;
                job.last_error = Some(e.to_string());
                if let Err(persist) = self.store.lock().await.update(job) {
                    error!(job_id = %job.job_id, error = %persist, "failure-state persist failed");
                }
                error!(
                    job_id = %job.job_id,
                    consecutive_failures = job.consecutive_failures,
                    error = %e,
                    "job fire failed"
                );
                if job.consecutive_failures >= AUTO_PAUSE_FAILURES {
                    self.auto_pause(job, fired_at).await;
                }
            }
        }
    }

    async fn auto_pause(&self, job: &mut RecurringJob, now: DateTime<Tz>) {
        let already_notified = job.paused_notice_sent_at.is_some();
        job.status = JobStatus::Paused;
        if !already_notified {
            job.paused_notice_sent_at = Some(now.fixed_offset());
        }
        if let Err(e) = self.store.lock().await.update(job) {
            error!(job_id = %job.job_id, error = %e, "auto-pause persist failed");
        }
        self.unschedule(&job.job_id).await;
        warn!(
            job_id = %job.job_id,
            failures = job.consecutive_failures,
            "job auto-paused after repeated failures"
        );

        if already_notified {
            return;
        }
        let notice = format!(
            "⏸️ 定时任务已自动暂停：连续触发失败次数过多。\n- 任务ID: {}\n- 标题: {}\n- 最近错误: {}\n恢复该任务后会重新计算下次触发时间。",
            job.job_id,
            job.title.as_deref().unwrap_or("（无）"),
            job.last_error.as_deref().unwrap_or("（无）"),
        );
        if let Err(e) = self
            .messages
            .push_system_message(&job.chat_key, &notice, false)
            .await
        {
            error!(job_id = %job.job_id, error = %e, "auto-pause notice delivery failed");
        }
    }

    /// The live heap entries (version-valid only).  Test hook for the
    /// one-live-entry-per-active-job invariant.
    #[cfg(test)]
    pub(crate) async fn live_entries(&self) -> Vec<(String, u64)> {
        let sched = self.sched.lock().await;
        sched
            .heap
            .iter()
            .filter(|Reverse(entry)| {
                sched.versions.get(&entry.job_id).copied().unwrap_or(0) == entry.version
            })
            .map(|Reverse(entry)| (entry.job_id.clone(), entry.version))
            .collect()
    }
}
