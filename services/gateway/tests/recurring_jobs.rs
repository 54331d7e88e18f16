//! Next-run computation with timezone-aware cron and workday filters, plus
//! the engine's public job API.

mod common;

use chrono::TimeZone;
use chrono_tz::Tz;
use common::RecordingMessages;
use gateway::timer::jobs::{
    JobError, JobStatus, JobStore, MisfirePolicy, RecurringJob, WorkdayMode,
};
use gateway::timer::recurring::{
    JobUpdate, NewJob, RecurringTimerEngine, compute_next_run_from,
};
use gateway::timer::workday::WorkdayOracle;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

fn seed_year(dir: &Path, year: i32, days: &[(String, i64)]) {
    let payload = serde_json::json!({
        "code": 0,
        "data": days
            .iter()
            .map(|(date, is_holiday)| serde_json::json!({
                "date": date,
                "is_holiday": is_holiday,
                "name": ""
            }))
            .collect::<Vec<_>>(),
    });
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(format!("allyear_{year}.json")),
        serde_json::to_vec(&payload).unwrap(),
    )
    .unwrap();
}

/// The 2024 golden-week calendar fragment: Oct 1-7 holidays, Oct 12 a
/// make-up Saturday workday, Oct 13 a rest day.
fn seed_golden_week(dir: &Path) {
    let days = vec![
        ("2024-09-30".to_owned(), 0),
        ("2024-10-01".to_owned(), 1),
        ("2024-10-02".to_owned(), 1),
        ("2024-10-03".to_owned(), 1),
        ("2024-10-04".to_owned(), 1),
        ("2024-10-05".to_owned(), 1),
        ("2024-10-06".to_owned(), 1),
        ("2024-10-07".to_owned(), 1),
        ("2024-10-08".to_owned(), 0),
        ("2024-10-09".to_owned(), 0),
        ("2024-10-10".to_owned(), 0),
        ("2024-10-11".to_owned(), 0),
        ("2024-10-12".to_owned(), 0),
        ("2024-10-13".to_owned(), 1),
        ("2024-10-14".to_owned(), 0),
    ];
    seed_year(dir, 2024, &days);
}

fn job(cron_expr: &str, timezone: &str, mode: WorkdayMode) -> RecurringJob {
    RecurringJob {
        job_id: "test1".to_owned(),
        chat_key: "sse-p-group_1".to_owned(),
        title: None,
        event_desc: "daily reminder".to_owned(),
        cron_expr: cron_expr.to_owned(),
        timezone: timezone.to_owned(),
        workday_mode: mode,
        status: JobStatus::Active,
        next_run_at: None,
        last_run_at: None,
        misfire_policy: MisfirePolicy::FireOnce,
        misfire_grace_seconds: 300,
        consecutive_failures: 0,
        last_error: None,
        paused_notice_sent_at: None,
    }
}

fn shanghai(y: i32, m: u32, d: u32, h: u32, min: u32) -> chrono::DateTime<Tz> {
    let tz: Tz = "Asia/Shanghai".parse().unwrap();
    tz.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

#[tokio::test]
async fn cn_workday_skips_golden_week() {
    let dir = tempfile::tempdir().unwrap();
    seed_golden_week(dir.path());
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    let job = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::CnWorkday);
    let next = compute_next_run_from(&oracle, &job, shanghai(2024, 9, 30, 18, 0))
        .await
        .unwrap();
    assert_eq!(next, shanghai(2024, 10, 8, 9, 0));
}

#[tokio::test]
async fn cn_workday_fires_on_makeup_saturday_then_skips_sunday() {
    let dir = tempfile::tempdir().unwrap();
    seed_golden_week(dir.path());
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    let mut filtered = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::CnWorkday);
    filtered.last_run_at = Some(shanghai(2024, 10, 11, 9, 0).fixed_offset());
    let next = compute_next_run_from(&oracle, &filtered, shanghai(2024, 10, 11, 9, 0))
        .await
        .unwrap();
    // Oct 12 is a make-up workday even though it is a Saturday.
    assert_eq!(next, shanghai(2024, 10, 12, 9, 0));

    filtered.last_run_at = Some(shanghai(2024, 10, 12, 9, 0).fixed_offset());
    let next = compute_next_run_from(&oracle, &filtered, shanghai(2024, 10, 12, 9, 0))
        .await
        .unwrap();
    // Oct 13 is a rest Sunday; Oct 14 is the next working day.
    assert_eq!(next, shanghai(2024, 10, 14, 9, 0));
}

#[tokio::test]
async fn cn_restday_selects_holidays_and_weekends() {
    let dir = tempfile::tempdir().unwrap();
    seed_golden_week(dir.path());
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    let mut rest = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::CnRestday);
    rest.last_run_at = Some(shanghai(2024, 10, 11, 9, 0).fixed_offset());
    let next = compute_next_run_from(&oracle, &rest, shanghai(2024, 10, 11, 9, 0))
        .await
        .unwrap();
    // Oct 12 is a make-up workday, so the next rest day is Sunday Oct 13.
    assert_eq!(next, shanghai(2024, 10, 13, 9, 0));
}

#[tokio::test]
async fn unavailable_oracle_degrades_to_weekday_filters() {
    let dir = tempfile::tempdir().unwrap();
    // The cached year has no October entries, so October answers are None
    // and the filter falls back to mon_fri.
    seed_year(dir.path(), 2024, &[("2024-01-01".to_owned(), 1)]);
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    let job = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::CnWorkday);
    // Friday 18:00: Saturday and Sunday are skipped by the fallback.
    let next = compute_next_run_from(&oracle, &job, shanghai(2024, 10, 11, 18, 0))
        .await
        .unwrap();
    assert_eq!(next, shanghai(2024, 10, 14, 9, 0));
}

#[tokio::test]
async fn mon_fri_and_weekend_filters() {
    let dir = tempfile::tempdir().unwrap();
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    // Friday 2024-10-11 10:00: the 09:00 slot is gone for the day.
    let weekdays = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::MonFri);
    let next = compute_next_run_from(&oracle, &weekdays, shanghai(2024, 10, 11, 10, 0))
        .await
        .unwrap();
    assert_eq!(next, shanghai(2024, 10, 14, 9, 0));

    let weekends = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::Weekend);
    let next = compute_next_run_from(&oracle, &weekends, shanghai(2024, 10, 11, 10, 0))
        .await
        .unwrap();
    assert_eq!(next, shanghai(2024, 10, 12, 9, 0));
}

#[tokio::test]
async fn next_run_is_strictly_after_last_run() {
    let dir = tempfile::tempdir().unwrap();
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    // last_run_at is ahead of `now`; the base must honor it.
    let mut daily = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::None);
    daily.last_run_at = Some(shanghai(2024, 10, 11, 9, 0).fixed_offset());
    let next = compute_next_run_from(&oracle, &daily, shanghai(2024, 10, 11, 8, 0))
        .await
        .unwrap();
    assert_eq!(next, shanghai(2024, 10, 12, 9, 0));
    assert!(next.fixed_offset() > daily.last_run_at.unwrap());
}

#[tokio::test]
async fn all_holiday_calendar_exhausts_the_filter() {
    let dir = tempfile::tempdir().unwrap();
    // Every day of 2024 and 2025 is a rest day: no workday within the
    // 370-step bound.
    for year in [2024, 2025] {
        let mut days = Vec::new();
        let mut date = chrono::NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
        let end = chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap();
        while date < end {
            days.push((date.format("%Y-%m-%d").to_string(), 1));
            date = date.succ_opt().unwrap();
        }
        seed_year(dir.path(), year, &days);
    }
    let oracle = WorkdayOracle::new(dir.path().to_path_buf());

    let job = job("0 9 * * *", "Asia/Shanghai", WorkdayMode::CnWorkday);
    let result = compute_next_run_from(&oracle, &job, shanghai(2024, 10, 1, 0, 0)).await;
    assert!(matches!(result, Err(JobError::FilterExhausted(_))));
}

// ---------------------------------------------------------------------------
// Engine public API
// ---------------------------------------------------------------------------

fn engine() -> (Arc<RecurringTimerEngine>, Arc<Mutex<JobStore>>) {
    let store = Arc::new(Mutex::new(JobStore::open_in_memory().unwrap()));
    let dir = std::env::temp_dir().join("gateway-recurring-it-no-holiday-data");
    let oracle = WorkdayOracle::new(dir);
    let engine = RecurringTimerEngine::new(Arc::clone(&store), oracle, RecordingMessages::new());
    (engine, store)
}

fn new_job() -> NewJob {
    NewJob {
        chat_key: "sse-p-group_1".to_owned(),
        cron_expr: "*/5 * * * *".to_owned(),
        timezone: "UTC".to_owned(),
        workday_mode: WorkdayMode::None,
        event_desc: "ping".to_owned(),
        title: None,
    }
}

#[tokio::test]
async fn create_validates_cron_and_timezone() {
    let (engine, _store) = engine();

    let mut bad_cron = new_job();
    bad_cron.cron_expr = "not a cron".to_owned();
    assert!(matches!(
        engine.create_job(bad_cron).await,
        Err(JobError::InvalidCron(_))
    ));

    let mut bad_tz = new_job();
    bad_tz.timezone = "Mars/Olympus".to_owned();
    assert!(matches!(
        engine.create_job(bad_tz).await,
        Err(JobError::InvalidTimezone(_))
    ));

    let job = engine.create_job(new_job()).await.unwrap();
    assert!(gateway::timer::jobs::is_valid_job_id(&job.job_id));
    assert!(job.next_run_at.is_some());
}

#[tokio::test]
async fn get_rejects_malformed_ids_and_reports_missing_jobs() {
    let (engine, _store) = engine();
    assert!(matches!(
        engine.get_job("NOPE!").await,
        Err(JobError::InvalidJobId(_))
    ));
    assert!(matches!(
        engine.get_job("zzzz9999").await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_refreshes_schedule_for_active_jobs() {
    let (engine, _store) = engine();
    let job = engine.create_job(new_job()).await.unwrap();

    let updated = engine
        .update_job(&job.job_id, JobUpdate {
            cron_expr: Some("0 3 * * *".to_owned()),
            ..JobUpdate::default()
        })
        .await
        .unwrap();
    assert_eq!(updated.cron_expr, "0 3 * * *");
    // The schedule was recomputed against the new expression: a 03:00
    // daily slot, minutes and seconds zeroed.
    let next = updated.next_run_at.unwrap();
    use chrono::Timelike;
    assert_eq!(next.hour(), 3);
    assert_eq!(next.minute(), 0);
}

#[tokio::test]
async fn list_heals_missing_next_run() {
    let (engine, store) = engine();
    let job = engine.create_job(new_job()).await.unwrap();

    // Simulate a historic row with no schedule.
    {
        let mut broken = job.clone();
        broken.next_run_at = None;
        store.lock().await.update(&broken).unwrap();
    }

    let listed = engine.list_jobs("sse-p-group_1", None, 50).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].next_run_at.is_some(), "listing must heal the row");
}

#[tokio::test]
async fn delete_removes_job_and_schedule() {
    let (engine, store) = engine();
    let job = engine.create_job(new_job()).await.unwrap();

    engine.delete_job(&job.job_id).await.unwrap();
    assert!(store.lock().await.get(&job.job_id).unwrap().is_none());
    assert!(matches!(
        engine.get_job(&job.job_id).await,
        Err(JobError::NotFound(_))
    ));
}
