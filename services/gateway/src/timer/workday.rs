//! Chinese holiday/workday oracle.
//!
//! Answers whether a calendar date is a working day (make-up workdays
//! included) or a rest day (weekends, statutory holidays, compensatory
//! days off).  Data source: a per-year on-disk cache `allyear_<year>.json`
//! with an HTTP fallback to the remote calendar service.  The answer is
//! tri-state — `None` means neither cache nor remote could say, and the
//! caller falls back to plain weekday logic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const REMOTE_BASE: &str = "https://holiday.ailcc.com/api/holiday/allyear";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// date -> is_holiday (true = rest day, false = working day incl. make-up).
type YearData = HashMap<NaiveDate, bool>;

#[derive(Debug, Serialize, Deserialize)]
struct AllYearPayload {
    code: i64,
    #[serde(default)]
    data: Vec<AllYearDay>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AllYearDay {
    date: String,
    is_holiday: i64,
    #[serde(default)]
    name: String,
}

pub struct WorkdayOracle {
    cache_dir: PathBuf,
    http: reqwest::Client,
    years: RwLock<HashMap<i32, Arc<YearData>>>,
}

impl WorkdayOracle {
    pub fn new(cache_dir: PathBuf) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            cache_dir,
            http,
            years: RwLock::new(HashMap::new()),
        })
    }

    /// Is `date` a working day (make-up workdays count)?
    pub async fn is_workday(&self, date: NaiveDate) -> Option<bool> {
        let data = self.year_data(date_year(date)).await?;
        data.get(&date).map(|is_holiday| !is_holiday)
    }

    /// Is `date` a rest day (weekend / statutory holiday / compensatory)?
    pub async fn is_restday(&self, date: NaiveDate) -> Option<bool> {
        let data = self.year_data(date_year(date)).await?;
        data.get(&date).copied()
    }

    fn cache_path(&self, year: i32) -> PathBuf {
        self.cache_dir.join(format!("allyear_{year}.json"))
    }

    async fn year_data(&self, year: i32) -> Option<Arc<YearData>> {
        if let Some(data) = self.years.read().await.get(&year) {
            return Some(Arc::clone(data));
        }

        // Write lock across the load: concurrent callers for the same year
        // wait instead of racing the remote fetch.
        let mut years = self.years.write().await;
        if let Some(data) = years.get(&year) {
            return Some(Arc::clone(data));
        }

        let cache_path = self.cache_path(year);
        if let Some(payload) = read_cache_file(&cache_path) {
            match parse_allyear(&payload) {
                Ok(parsed) => {
                    let parsed = Arc::new(parsed);
                    years.insert(year, Arc::clone(&parsed));
                    return Some(parsed);
                }
                Err(e) => warn!(year, error = %e, "holiday cache file unusable, refetching"),
            }
        }

        let payload = self.fetch_allyear(year).await?;
        let parsed = match parse_allyear(&payload) {
            Ok(parsed) => Arc::new(parsed),
            Err(e) => {
                error!(year, error = %e, "remote holiday payload unusable");
                return None;
            }
        };
        years.insert(year, Arc::clone(&parsed));
        write_cache_file(&cache_path, &payload);
        Some(parsed)
    }

    async fn fetch_allyear(&self, year: i32) -> Option<AllYearPayload> {
        let url = format!("{REMOTE_BASE}/{year}");
        let payload: AllYearPayload = match self.http.get(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.json().await {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(year, error = %e, "holiday response body unreadable");
                        return None;
                    }
                },
                Err(e) => {
                    error!(year, error = %e, "holiday endpoint returned error status");
                    return None;
                }
            },
            Err(e) => {
                error!(year, error = %e, "holiday fetch failed");
                return None;
            }
        };

        if payload.code != 0 {
            error!(year, code = payload.code, "holiday endpoint rejected the request");
            return None;
        }
        info!(year, days = payload.data.len(), "holiday data fetched");
        Some(payload)
    }
}

fn date_year(date: NaiveDate) -> i32 {
    use chrono::Datelike;
    date.year()
}

fn read_cache_file(path: &Path) -> Option<AllYearPayload> {
    if !path.exists() {
        return None;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "holiday cache read failed");
            return None;
        }
    };
    match serde_json::from_str::<AllYearPayload>(&raw) {
        Ok(payload) if payload.code == 0 => Some(payload),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "holiday cache parse failed");
            None
        }
    }
}

fn write_cache_file(path: &Path, payload: &AllYearPayload) {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(payload)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    };
    if let Err(e) = write() {
        error!(path = %path.display(), error = %e, "holiday cache write failed");
    }
}

fn parse_allyear(payload: &AllYearPayload) -> Result<YearData, String> {
    if payload.data.is_empty() {
        return Err("payload has no day entries".to_owned());
    }
    let mut parsed = HashMap::with_capacity(payload.data.len());
    for day in &payload.data {
        let Ok(date) = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d") else {
            continue;
        };
        match day.is_holiday {
            0 => parsed.insert(date, false),
            1 => parsed.insert(date, true),
            _ => continue,
        };
    }
    if parsed.is_empty() {
        return Err("no parseable day entries".to_owned());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_cache(dir: &Path, year: i32, days: &[(&str, i64)]) {
        let payload = AllYearPayload {
            code: 0,
            data: days
                .iter()
                .map(|(date, is_holiday)| AllYearDay {
                    date: (*date).to_owned(),
                    is_holiday: *is_holiday,
                    name: String::new(),
                })
                .collect(),
        };
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(format!("allyear_{year}.json")),
            serde_json::to_vec(&payload).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn answers_from_cache_file_without_network() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(
            dir.path(),
            2024,
            &[("2024-10-01", 1), ("2024-10-08", 0), ("2024-10-12", 0)],
        );
        let oracle = WorkdayOracle::new(dir.path().to_path_buf());

        let holiday = NaiveDate::from_ymd_opt(2024, 10, 1).unwrap();
        let workday = NaiveDate::from_ymd_opt(2024, 10, 8).unwrap();
        let makeup = NaiveDate::from_ymd_opt(2024, 10, 12).unwrap();

        assert_eq!(oracle.is_workday(holiday).await, Some(false));
        assert_eq!(oracle.is_restday(holiday).await, Some(true));
        assert_eq!(oracle.is_workday(workday).await, Some(true));
        // A make-up Saturday counts as a working day.
        assert_eq!(oracle.is_workday(makeup).await, Some(true));
    }

    #[tokio::test]
    async fn unknown_date_in_cached_year_is_undecidable() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path(), 2024, &[("2024-10-01", 1)]);
        let oracle = WorkdayOracle::new(dir.path().to_path_buf());

        let missing = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        assert_eq!(oracle.is_workday(missing).await, None);
    }

    #[test]
    fn rejected_payload_code_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allyear_2024.json");
        let bad = AllYearPayload {
            code: 1,
            data: vec![AllYearDay {
                date: "2024-10-01".to_owned(),
                is_holiday: 1,
                name: String::new(),
            }],
        };
        std::fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();

        assert!(read_cache_file(&path).is_none());
    }

    #[test]
    fn parse_skips_malformed_day_entries() {
        let payload = AllYearPayload {
            code: 0,
            data: vec![
                AllYearDay {
                    date: "not-a-date".to_owned(),
                    is_holiday: 1,
                    name: String::new(),
                },
                AllYearDay {
                    date: "2024-05-01".to_owned(),
                    is_holiday: 7,
                    name: String::new(),
                },
                AllYearDay {
                    date: "2024-05-02".to_owned(),
                    is_holiday: 1,
                    name: "劳动节".to_owned(),
                },
            ],
        };
        let parsed = parse_allyear(&payload).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed.get(&NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()),
            Some(&true)
        );
    }
}
