//! Persistent recurring-job model and its SQLite store.
//!
//! # Schema
//! One row per job in `recurring_timer_job`; unique index on `job_id`,
//! lookup indexes on `chat_key`, `status`, `next_run_at`, `last_run_at`.
//! Timestamps are stored as RFC 3339 strings carrying the job-zone offset.
//!
//! # job_id
//! Short external identifier matching `^[a-z0-9]{4,12}$`.  Allocation
//! starts at 4 chars and grows after repeated collisions; the unique index
//! is the final arbiter under concurrency.

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use rusqlite::{Connection, params};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const JOB_ID_MIN_LEN: usize = 4;
pub const JOB_ID_MAX_LEN: usize = 12;
const JOB_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Active,
    Paused,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(JobStatus::Active),
            "paused" => Some(JobStatus::Paused),
            _ => None,
        }
    }
}

/// Day filter applied on top of the cron next-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkdayMode {
    None,
    MonFri,
    Weekend,
    CnWorkday,
    CnRestday,
}

impl WorkdayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkdayMode::None => "none",
            WorkdayMode::MonFri => "mon_fri",
            WorkdayMode::Weekend => "weekend",
            WorkdayMode::CnWorkday => "cn_workday",
            WorkdayMode::CnRestday => "cn_restday",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(WorkdayMode::None),
            "mon_fri" => Some(WorkdayMode::MonFri),
            "weekend" => Some(WorkdayMode::Weekend),
            "cn_workday" => Some(WorkdayMode::CnWorkday),
            "cn_restday" => Some(WorkdayMode::CnRestday),
            _ => None,
        }
    }
}

/// What to do with an occurrence the service missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfirePolicy {
    /// Fire once with a misfire marker, provided the lag is within grace.
    FireOnce,
    /// Never fire missed occurrences; reschedule only.
    Skip,
}

impl MisfirePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            MisfirePolicy::FireOnce => "fire_once",
            MisfirePolicy::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fire_once" => Some(MisfirePolicy::FireOnce),
            "skip" => Some(MisfirePolicy::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecurringJob {
    pub job_id: String,
    pub chat_key: String,
    pub title: Option<String>,
    pub event_desc: String,
    pub cron_expr: String,
    pub timezone: String,
    pub workday_mode: WorkdayMode,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<FixedOffset>>,
    pub last_run_at: Option<DateTime<FixedOffset>>,
    pub misfire_policy: MisfirePolicy,
    pub misfire_grace_seconds: i64,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub paused_notice_sent_at: Option<DateTime<FixedOffset>>,
}

// ---------------------------------------------------------------------------
// Errors & validation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum JobError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("no day satisfying the filter within {0} cron steps")]
    FilterExhausted(usize),
    #[error("job id space exhausted")]
    IdSpaceExhausted,
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// `^[a-z0-9]{4,12}$`
pub fn is_valid_job_id(job_id: &str) -> bool {
    (JOB_ID_MIN_LEN..=JOB_ID_MAX_LEN).contains(&job_id.len())
        && job_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

pub fn validate_timezone(timezone: &str) -> Result<Tz, JobError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| JobError::InvalidTimezone(timezone.to_owned()))
}

/// Parse a 5-field cron expression (min hour dom month dow).
///
/// The cron crate wants a seconds field, so a zero-seconds field is
/// prepended before parsing.
pub fn parse_cron(cron_expr: &str) -> Result<cron::Schedule, JobError> {
    let trimmed = cron_expr.trim();
    if trimmed.is_empty() {
        return Err(JobError::InvalidCron("empty expression".to_owned()));
    }
    if trimmed.split_whitespace().count() != 5 {
        return Err(JobError::InvalidCron(format!(
            "expected 5 fields: {trimmed}"
        )));
    }
    cron::Schedule::from_str(&format!("0 {trimmed}"))
        .map_err(|e| JobError::InvalidCron(format!("{trimmed}: {e}")))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self, JobError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> Result<(), JobError> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> Result<(), JobError> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn insert(&self, job: &RecurringJob) -> Result<(), JobError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO recurring_timer_job
                 (job_id, chat_key, title, event_desc, cron_expr, timezone,
                  workday_mode, status, next_run_at, last_run_at,
                  misfire_policy, misfire_grace_seconds, consecutive_failures,
                  last_error, paused_notice_sent_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                job.job_id,
                job.chat_key,
                job.title,
                job.event_desc,
                job.cron_expr,
                job.timezone,
                job.workday_mode.as_str(),
                job.status.as_str(),
                job.next_run_at.map(|t| t.to_rfc3339()),
                job.last_run_at.map(|t| t.to_rfc3339()),
                job.misfire_policy.as_str(),
                job.misfire_grace_seconds,
                job.consecutive_failures,
                job.last_error,
                job.paused_notice_sent_at.map(|t| t.to_rfc3339()),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn update(&self, job: &RecurringJob) -> Result<(), JobError> {
        let changed = self.conn.execute(
            "UPDATE recurring_timer_job SET
                 chat_key = ?2, title = ?3, event_desc = ?4, cron_expr = ?5,
                 timezone = ?6, workday_mode = ?7, status = ?8,
                 next_run_at = ?9, last_run_at = ?10, misfire_policy = ?11,
                 misfire_grace_seconds = ?12, consecutive_failures = ?13,
                 last_error = ?14, paused_notice_sent_at = ?15,
                 updated_at = ?16
             WHERE job_id = ?1",
            params![
                job.job_id,
                job.chat_key,
                job.title,
                job.event_desc,
                job.cron_expr,
                job.timezone,
                job.workday_mode.as_str(),
                job.status.as_str(),
                job.next_run_at.map(|t| t.to_rfc3339()),
                job.last_run_at.map(|t| t.to_rfc3339()),
                job.misfire_policy.as_str(),
                job.misfire_grace_seconds,
                job.consecutive_failures,
                job.last_error,
                job.paused_notice_sent_at.map(|t| t.to_rfc3339()),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(JobError::NotFound(job.job_id.clone()));
        }
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<RecurringJob>, JobError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_JOB} WHERE job_id = ?1"))?;
        let mut rows = stmt.query_map(params![job_id], row_to_raw)?;
        match rows.next().transpose()? {
            Some(raw) => Ok(Some(raw_to_job(raw)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, job_id: &str) -> Result<bool, JobError> {
        let changed = self.conn.execute(
            "DELETE FROM recurring_timer_job WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(changed > 0)
    }

    pub fn job_id_exists(&self, job_id: &str) -> Result<bool, JobError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM recurring_timer_job WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn active_jobs(&self) -> Result<Vec<RecurringJob>, JobError> {
        self.query_jobs(
            &format!("{SELECT_JOB} WHERE status = 'active'"),
            params![],
        )
    }

    pub fn list(
        &self,
        chat_key: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<RecurringJob>, JobError> {
        match status {
            Some(status) => self.query_jobs(
                &format!(
                    "{SELECT_JOB} WHERE chat_key = ?1 AND status = ?2
                     ORDER BY updated_at DESC LIMIT ?3"
                ),
                params![chat_key, status.as_str(), limit as i64],
            ),
            None => self.query_jobs(
                &format!(
                    "{SELECT_JOB} WHERE chat_key = ?1 ORDER BY updated_at DESC LIMIT ?2"
                ),
                params![chat_key, limit as i64],
            ),
        }
    }

    pub fn count(&self, chat_key: &str, status: JobStatus) -> Result<i64, JobError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM recurring_timer_job WHERE chat_key = ?1 AND status = ?2",
            params![chat_key, status.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Active jobs with a known next run, soonest first.
    pub fn upcoming(&self, chat_key: &str, limit: usize) -> Result<Vec<RecurringJob>, JobError> {
        self.query_jobs(
            &format!(
                "{SELECT_JOB} WHERE chat_key = ?1 AND status = 'active'
                     AND next_run_at IS NOT NULL
                 ORDER BY next_run_at ASC LIMIT ?2"
            ),
            params![chat_key, limit as i64],
        )
    }

    /// Most recently fired jobs first.
    pub fn recent(&self, chat_key: &str, limit: usize) -> Result<Vec<RecurringJob>, JobError> {
        self.query_jobs(
            &format!(
                "{SELECT_JOB} WHERE chat_key = ?1 AND last_run_at IS NOT NULL
                 ORDER BY last_run_at DESC LIMIT ?2"
            ),
            params![chat_key, limit as i64],
        )
    }

    /// Active jobs missing `next_run_at` (historic rows, failed upserts).
    pub fn active_missing_next_run(
        &self,
        chat_key: &str,
        limit: usize,
    ) -> Result<Vec<RecurringJob>, JobError> {
        self.query_jobs(
            &format!(
                "{SELECT_JOB} WHERE chat_key = ?1 AND status = 'active'
                     AND next_run_at IS NULL
                 ORDER BY updated_at DESC LIMIT ?2"
            ),
            params![chat_key, limit as i64],
        )
    }

    fn query_jobs<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<RecurringJob>, JobError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, row_to_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(raw_to_job).collect()
    }
}

const SELECT_JOB: &str = "SELECT job_id, chat_key, title, event_desc, cron_expr, timezone,
        workday_mode, status, next_run_at, last_run_at, misfire_policy,
        misfire_grace_seconds, consecutive_failures, last_error,
        paused_notice_sent_at
 FROM recurring_timer_job";

struct RawJob {
    job_id: String,
    chat_key: String,
    title: Option<String>,
    event_desc: String,
    cron_expr: String,
    timezone: String,
    workday_mode: String,
    status: String,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    misfire_policy: String,
    misfire_grace_seconds: i64,
    consecutive_failures: i64,
    last_error: Option<String>,
    paused_notice_sent_at: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        job_id: row.get(0)?,
        chat_key: row.get(1)?,
        title: row.get(2)?,
        event_desc: row.get(3)?,
        cron_expr: row.get(4)?,
        timezone: row.get(5)?,
        workday_mode: row.get(6)?,
        status: row.get(7)?,
        next_run_at: row.get(8)?,
        last_run_at: row.get(9)?,
        misfire_policy: row.get(10)?,
        misfire_grace_seconds: row.get(11)?,
        consecutive_failures: row.get(12)?,
        last_error: row.get(13)?,
        paused_notice_sent_at: row.get(14)?,
    })
}

fn parse_stored_time(
    field: &str,
    value: Option<String>,
) -> Result<Option<DateTime<FixedOffset>>, JobError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(Some)
            .map_err(|e| JobError::Corrupt(format!("{field}: {raw}: {e}"))),
    }
}

fn raw_to_job(raw: RawJob) -> Result<RecurringJob, JobError> {
    Ok(RecurringJob {
        workday_mode: WorkdayMode::parse(&raw.workday_mode)
            .ok_or_else(|| JobError::Corrupt(format!("workday_mode: {}", raw.workday_mode)))?,
        status: JobStatus::parse(&raw.status)
            .ok_or_else(|| JobError::Corrupt(format!("status: {}", raw.status)))?,
        misfire_policy: MisfirePolicy::parse(&raw.misfire_policy)
            .ok_or_else(|| JobError::Corrupt(format!("misfire_policy: {}", raw.misfire_policy)))?,
        next_run_at: parse_stored_time("next_run_at", raw.next_run_at)?,
        last_run_at: parse_stored_time("last_run_at", raw.last_run_at)?,
        paused_notice_sent_at: parse_stored_time(
            "paused_notice_sent_at",
            raw.paused_notice_sent_at,
        )?,
        job_id: raw.job_id,
        chat_key: raw.chat_key,
        title: raw.title,
        event_desc: raw.event_desc,
        cron_expr: raw.cron_expr,
        timezone: raw.timezone,
        misfire_grace_seconds: raw.misfire_grace_seconds,
        consecutive_failures: raw.consecutive_failures,
        last_error: raw.last_error,
    })
}

// ---------------------------------------------------------------------------
// Id allocation
// ---------------------------------------------------------------------------

fn random_job_id(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| JOB_ID_ALPHABET[rng.gen_range(0..JOB_ID_ALPHABET.len())] as char)
        .collect()
}

/// Allocate a job id not currently present in the store.
///
/// Starts at [`JOB_ID_MIN_LEN`] chars and grows after 10 consecutive
/// collisions.  The existence pre-check only reduces the collision window;
/// the unique index decides concurrent races.
pub fn generate_job_id(store: &JobStore) -> Result<String, JobError> {
    let mut length = JOB_ID_MIN_LEN;
    loop {
        for _ in 0..10 {
            let candidate = random_job_id(length);
            if !store.job_id_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        if length >= JOB_ID_MAX_LEN {
            return Err(JobError::IdSpaceExhausted);
        }
        length += 1;
    }
}
