//! Time-driven scheduler embedded in the orchestrator process.
//!
//! A table of recurring jobs with cadence strings. Triggers are
//! edge-triggered against the shared clock: a tick fires every job whose
//! next instant has passed, then advances that job past *now* - ticks
//! skipped during downtime are not replayed. Each job runs to completion
//! before the next run of the same job starts (non-overlapping); different
//! jobs may run concurrently. Job failures are logged and never crash the
//! scheduler.
//!
//! Built-in cadences: inbox-processing every 30 min, dashboard refresh
//! hourly, morning briefing daily at 08:00, weekly audit Monday 07:00,
//! vault sync every 5 min (peered mode), signal merge every 30 min (local
//! mode).

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adjutant_core::retry::Clock;
use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use tracing::{error, info, warn};

use crate::shutdown::ShutdownToken;

/// When a job recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval from the previous fire.
    Every(Duration),
    /// Once a day at the given wall-clock time.
    Daily(NaiveTime),
    /// Once a week on the given day and time.
    Weekly(Weekday, NaiveTime),
}

impl Cadence {
    /// Next fire instant strictly after `after`, in the scheduler's
    /// timezone offset.
    #[must_use]
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        offset: chrono::FixedOffset,
    ) -> DateTime<Utc> {
        match self {
            Self::Every(interval) => {
                after + chrono::Duration::from_std(*interval).unwrap_or_default()
            },
            Self::Daily(time) => {
                let local = after.with_timezone(&offset);
                let mut candidate = local.date_naive().and_time(*time);
                if offset
                    .from_local_datetime(&candidate)
                    .single()
                    .map_or(true, |dt| dt.with_timezone(&Utc) <= after)
                {
                    candidate += chrono::Duration::days(1);
                }
                offset
                    .from_local_datetime(&candidate)
                    .single()
                    .map_or(after, |dt| dt.with_timezone(&Utc))
            },
            Self::Weekly(weekday, time) => {
                let local = after.with_timezone(&offset);
                let mut date = local.date_naive();
                for _ in 0..8 {
                    let candidate = date.and_time(*time);
                    if date.weekday() == *weekday {
                        if let Some(dt) = offset.from_local_datetime(&candidate).single() {
                            if dt.with_timezone(&Utc) > after {
                                return dt.with_timezone(&Utc);
                            }
                        }
                    }
                    date += chrono::Duration::days(1);
                }
                after
            },
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    /// Parse a cadence string: `every 30m`, `daily 08:00`,
    /// `weekly mon 07:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match parts.next() {
            Some("every") => {
                let spec = parts.next().ok_or("missing interval")?;
                parse_duration(spec).map(Self::Every)
            },
            Some("daily") => {
                let time = parts.next().ok_or("missing time")?;
                NaiveTime::parse_from_str(time, "%H:%M")
                    .map(Self::Daily)
                    .map_err(|err| err.to_string())
            },
            Some("weekly") => {
                let day = parts.next().ok_or("missing weekday")?;
                let weekday = day
                    .parse::<Weekday>()
                    .map_err(|_| format!("bad weekday {day:?}"))?;
                let time = parts.next().ok_or("missing time")?;
                NaiveTime::parse_from_str(time, "%H:%M")
                    .map(|time| Self::Weekly(weekday, time))
                    .map_err(|err| err.to_string())
            },
            _ => Err(format!("unrecognised cadence: {s:?}")),
        }
    }
}

/// Parse `30m`, `2h`, `45s`, `1d`.
fn parse_duration(spec: &str) -> Result<Duration, String> {
    let (digits, unit) = spec.split_at(spec.len().saturating_sub(1));
    let value: u64 = digits.parse().map_err(|_| format!("bad interval {spec:?}"))?;
    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86_400)),
        _ => Err(format!("bad interval unit in {spec:?}")),
    }
}

/// Type-erased job body, built by [`Scheduler::register`].
type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Job {
    name: &'static str,
    cadence: Cadence,
    next_fire: DateTime<Utc>,
    running: Arc<AtomicBool>,
    run: JobFn,
}

/// The job table.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    offset: chrono::FixedOffset,
    jobs: Vec<Job>,
}

impl Scheduler {
    /// Create an empty scheduler using the local timezone offset.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let offset = *chrono::Local::now().offset();
        Self::with_offset(clock, offset)
    }

    /// Create a scheduler with an explicit timezone offset (tests).
    #[must_use]
    pub fn with_offset(clock: Arc<dyn Clock>, offset: chrono::FixedOffset) -> Self {
        Self {
            clock,
            offset,
            jobs: Vec::new(),
        }
    }

    /// Register a job. The first fire is one cadence away - jobs do not
    /// run at startup.
    pub fn register<F, Fut>(&mut self, name: &'static str, cadence: Cadence, run: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: JobFn =
            Arc::new(move || Box::pin(run()) as Pin<Box<dyn Future<Output = ()> + Send>>);
        let next_fire = cadence.next_after(self.clock.now(), self.offset);
        info!(job = name, next = %next_fire, "job registered");
        self.jobs.push(Job {
            name,
            cadence,
            next_fire,
            running: Arc::new(AtomicBool::new(false)),
            run,
        });
    }

    /// Names of jobs due at the current instant (test hook).
    #[must_use]
    pub fn due(&self) -> Vec<&'static str> {
        let now = self.clock.now();
        self.jobs
            .iter()
            .filter(|job| job.next_fire <= now)
            .map(|job| job.name)
            .collect()
    }

    /// Fire every due job (spawned; non-overlapping per job) and advance
    /// its next instant past now. Returns the number of jobs fired.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for job in &mut self.jobs {
            if job.next_fire > now {
                continue;
            }
            // Skipped ticks are not replayed: advance past *now*.
            let mut next = job.cadence.next_after(now, self.offset);
            while next <= now {
                next = job.cadence.next_after(next, self.offset);
            }
            job.next_fire = next;

            if job.running.swap(true, Ordering::SeqCst) {
                warn!(job = job.name, "previous run still active, skipping");
                continue;
            }
            fired += 1;
            let name = job.name;
            let running = Arc::clone(&job.running);
            let fut = (job.run)();
            tokio::spawn(async move {
                info!(job = name, "scheduled job starting");
                // Job panics must not poison the flag or the scheduler.
                let result = tokio::spawn(fut).await;
                if let Err(err) = result {
                    error!(job = name, error = %err, "scheduled job panicked");
                }
                running.store(false, Ordering::SeqCst);
            });
        }
        fired
    }

    /// Run the tick loop until shutdown.
    pub async fn run(mut self, mut token: ShutdownToken) {
        info!(jobs = self.jobs.len(), "scheduler active");
        loop {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(5)) => {
                    self.tick();
                },
                () = token.triggered() => break,
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::retry::FixedClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn utc_offset() -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_cadence_parsing() {
        assert_eq!(
            "every 30m".parse::<Cadence>().unwrap(),
            Cadence::Every(Duration::from_secs(1800))
        );
        assert_eq!(
            "daily 08:00".parse::<Cadence>().unwrap(),
            Cadence::Daily(NaiveTime::from_hms_opt(8, 0, 0).unwrap())
        );
        assert_eq!(
            "weekly mon 07:00".parse::<Cadence>().unwrap(),
            Cadence::Weekly(Weekday::Mon, NaiveTime::from_hms_opt(7, 0, 0).unwrap())
        );
        assert!("hourly".parse::<Cadence>().is_err());
    }

    #[test]
    fn test_daily_next_after() {
        let cadence: Cadence = "daily 08:00".parse().unwrap();
        let before = Utc.with_ymd_and_hms(2026, 2, 3, 6, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(before, utc_offset()),
            Utc.with_ymd_and_hms(2026, 2, 3, 8, 0, 0).unwrap()
        );
        let after = Utc.with_ymd_and_hms(2026, 2, 3, 9, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(after, utc_offset()),
            Utc.with_ymd_and_hms(2026, 2, 4, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_weekly_next_after() {
        let cadence: Cadence = "weekly mon 07:00".parse().unwrap();
        // 2026-02-03 is a Tuesday.
        let now = Utc.with_ymd_and_hms(2026, 2, 3, 12, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(now, utc_offset()),
            Utc.with_ymd_and_hms(2026, 2, 9, 7, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_missed_ticks_not_replayed() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 12, 0, 0).unwrap(),
        ));
        let count = Arc::new(AtomicUsize::new(0));
        let mut scheduler =
            Scheduler::with_offset(Arc::clone(&clock) as Arc<dyn Clock>, utc_offset());
        let counter = Arc::clone(&count);
        scheduler.register("counter", "every 10m".parse().unwrap(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(scheduler.tick(), 0);
        assert!(scheduler.due().is_empty());

        // An hour of downtime: six intervals missed, exactly one fire.
        clock.advance(Duration::from_secs(3600));
        assert_eq!(scheduler.due(), vec!["counter"]);
        assert_eq!(scheduler.tick(), 1);
        assert_eq!(scheduler.tick(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_job_does_not_overlap() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 12, 0, 0).unwrap(),
        ));
        let mut scheduler =
            Scheduler::with_offset(Arc::clone(&clock) as Arc<dyn Clock>, utc_offset());
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let done_rx = Arc::new(tokio::sync::Mutex::new(Some(done_rx)));
        scheduler.register("slow", "every 1m".parse().unwrap(), move || {
            let done_rx = Arc::clone(&done_rx);
            async move {
                if let Some(rx) = done_rx.lock().await.take() {
                    let _ = rx.await;
                }
            }
        });

        clock.advance(Duration::from_secs(61));
        assert_eq!(scheduler.tick(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Next interval arrives while the first run is still blocked.
        clock.advance(Duration::from_secs(61));
        assert_eq!(scheduler.tick(), 0);

        let _ = done_tx.send(());
    }
}
