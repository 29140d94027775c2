use crate::{
    config::parse_clock,
    context::AppContext,
    error::BotResult,
    metrics,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

pub mod schedule;
pub mod tasks;

pub use schedule::{start_of_local_day, Schedule};

/// Scheduled job types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Snapshot,
    WarningCheck,
    NightlyReport,
    Maintenance,
    Backup,
    BirthdayGifts,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Snapshot => "snapshot",
            JobKind::WarningCheck => "warning_check",
            JobKind::NightlyReport => "nightly_report",
            JobKind::Maintenance => "maintenance",
            JobKind::Backup => "backup",
            JobKind::BirthdayGifts => "birthday_gifts",
        }
    }
}

/// `Idle → Running → Success | Failed`; the outcome is held until the next run starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: JobKind,
    pub state: JobState,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
}

impl JobStatus {
    fn new(job: JobKind) -> Self {
        Self {
            job,
            state: JobState::Idle,
            last_started: None,
            last_finished: None,
            last_error: None,
            next_run: None,
        }
    }
}

/// Shared view of job state, read by the admin API
#[derive(Debug, Default)]
pub struct JobBoard {
    jobs: Mutex<BTreeMap<JobKind, JobStatus>>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, job: JobKind, f: impl FnOnce(&mut JobStatus)) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(jobs.entry(job).or_insert_with(|| JobStatus::new(job)));
    }

    pub fn schedule(&self, job: JobKind, next_run: DateTime<Utc>) {
        self.update(job, |status| status.next_run = Some(next_run));
    }

    pub fn started(&self, job: JobKind, at: DateTime<Utc>) {
        self.update(job, |status| {
            status.state = JobState::Running;
            status.last_started = Some(at);
        });
    }

    pub fn finished(&self, job: JobKind, at: DateTime<Utc>, error: Option<String>) {
        self.update(job, |status| {
            status.state = if error.is_some() {
                JobState::Failed
            } else {
                JobState::Success
            };
            status.last_finished = Some(at);
            status.last_error = error;
        });
    }

    pub fn get(&self, job: JobKind) -> Option<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.get(&job).cloned()
    }

    pub fn snapshot(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.values().cloned().collect()
    }
}

/// Single cooperative scheduler loop
///
/// Every tick fires the jobs whose time has come, one after another. A
/// failing job is logged and the loop keeps going.
pub struct JobScheduler {
    context: Arc<AppContext>,
    jobs: Vec<(JobKind, Schedule)>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> BotResult<Self> {
        let scheduler = &context.config.scheduler;
        let mut jobs = vec![
            (
                JobKind::Snapshot,
                Schedule::Hourly {
                    minute: scheduler.snapshot_minute,
                },
            ),
            (
                JobKind::WarningCheck,
                Schedule::Every(ChronoDuration::hours(scheduler.warning_check_hours as i64)),
            ),
            (
                JobKind::NightlyReport,
                Schedule::Daily {
                    time: scheduler.report_time()?,
                },
            ),
            (
                JobKind::Maintenance,
                Schedule::Monthly {
                    day: scheduler.maintenance_day_of_month,
                    time: scheduler.maintenance_clock()?,
                },
            ),
        ];

        if context.config.backup.enabled {
            jobs.push((
                JobKind::Backup,
                Schedule::Daily {
                    time: parse_clock(&context.config.backup.time)?,
                },
            ));
        }

        if context.config.birthday.enabled {
            jobs.push((
                JobKind::BirthdayGifts,
                Schedule::Daily {
                    time: parse_clock(&context.config.birthday.time)?,
                },
            ));
        }

        Ok(Self { context, jobs })
    }

    /// Start the scheduler loop in the background
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!("Starting background job scheduler");
        tokio::spawn(self.run_loop())
    }

    /// First fire time of every job after `now`
    pub fn initial_plan(&self, now: DateTime<Utc>) -> BTreeMap<JobKind, DateTime<Utc>> {
        self.jobs
            .iter()
            .map(|(kind, schedule)| {
                let next = schedule.next_after(now, self.context.tz);
                self.context.jobs.schedule(*kind, next);
                (*kind, next)
            })
            .collect()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut plan = self.initial_plan(Utc::now());
        for (kind, next) in &plan {
            info!("Job {} first due at {}", kind.as_str(), next);
        }

        let mut ticker = interval(Duration::from_secs(self.context.config.scheduler.tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.run_due(&mut plan, Utc::now()).await;
        }
    }

    /// Run every job due at `now` and reschedule it; returns the jobs that ran
    pub async fn run_due(
        &self,
        plan: &mut BTreeMap<JobKind, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<JobKind> {
        let mut ran = Vec::new();

        for (kind, schedule) in &self.jobs {
            let due = plan.get(kind).map(|at| *at <= now).unwrap_or(true);
            if !due {
                continue;
            }

            self.run_job(*kind).await;
            ran.push(*kind);

            let next = schedule.next_after(now, self.context.tz);
            plan.insert(*kind, next);
            self.context.jobs.schedule(*kind, next);
        }

        ran
    }

    /// Run one job with state tracking, metrics and the overrun warning
    pub async fn run_job(&self, kind: JobKind) -> JobState {
        let ctx = &self.context;
        ctx.jobs.started(kind, Utc::now());
        info!("Running {} job", kind.as_str());

        let timer = Instant::now();
        let result = match kind {
            JobKind::Snapshot => tasks::snapshot_usage(ctx, Utc::now()).await.map(|run| {
                info!(
                    "Snapshot job recorded {} account(s), skipped {}",
                    run.recorded, run.skipped
                );
            }),
            JobKind::WarningCheck => tasks::check_warnings(ctx, Utc::now()).await.map(|sent| {
                if sent > 0 {
                    info!("Warning check sent {} warning(s)", sent);
                } else {
                    info!("Warning check: nothing to send");
                }
            }),
            JobKind::NightlyReport => tasks::nightly_report(ctx, Utc::now()).await.map(|run| {
                info!(
                    "Nightly report: {} report(s) sent, {} failed, {} account(s) purged",
                    run.reports_sent, run.reports_failed, run.purged_accounts
                );
            }),
            JobKind::Maintenance => tasks::monthly_maintenance(ctx).await,
            JobKind::Backup => tasks::backup(ctx).await.map(|meta| {
                info!("Backup written to {}", meta.path.display());
            }),
            JobKind::BirthdayGifts => tasks::birthday_gifts(ctx, Utc::now()).await.map(|run| {
                info!(
                    "Birthday gifts: {} owner(s) gifted, {} failed",
                    run.gifted_owners, run.failed_owners
                );
            }),
        };
        let elapsed = timer.elapsed();

        let budget = Duration::from_secs(ctx.config.scheduler.job_budget_secs);
        if elapsed > budget {
            warn!(
                "Job {} took {:.1}s, over its {}s budget",
                kind.as_str(),
                elapsed.as_secs_f64(),
                budget.as_secs()
            );
        }

        let (state, error_text) = match result {
            Ok(()) => (JobState::Success, None),
            Err(e) => {
                error!("Job {} failed: {}", kind.as_str(), e);
                (JobState::Failed, Some(e.to_string()))
            }
        };

        let status = if state == JobState::Success { "success" } else { "failure" };
        metrics::record_background_job(kind.as_str(), status, elapsed.as_secs_f64());
        ctx.jobs.finished(kind, Utc::now(), error_text);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BotConfig,
        context::AppContext,
        db::create_memory_pool,
        identity::IdentityMap,
        panel::{NormalizedUserRecord, Panel},
        testing::{FakePanel, RecordingNotifier},
    };
    use chrono::TimeZone;

    async fn scheduler() -> (Arc<JobScheduler>, Arc<FakePanel>) {
        let mut config = BotConfig::default();
        config.scheduler.timezone = "UTC".to_string();
        let db = create_memory_pool().await.unwrap();
        let hiddify = Arc::new(FakePanel::new(Panel::Hiddify));
        let marzban = Arc::new(FakePanel::new(Panel::Marzban));
        let ctx = AppContext::from_parts(
            config,
            db,
            hiddify.clone(),
            marzban,
            Arc::new(IdentityMap::empty()),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        (Arc::new(JobScheduler::new(Arc::new(ctx)).unwrap()), hiddify)
    }

    #[test]
    fn test_job_board_transitions() {
        let board = JobBoard::new();
        let now = Utc::now();
        board.schedule(JobKind::Snapshot, now);
        assert_eq!(board.get(JobKind::Snapshot).unwrap().state, JobState::Idle);

        board.started(JobKind::Snapshot, now);
        assert_eq!(board.get(JobKind::Snapshot).unwrap().state, JobState::Running);

        board.finished(JobKind::Snapshot, now, Some("boom".to_string()));
        let status = board.get(JobKind::Snapshot).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("boom"));

        board.finished(JobKind::Snapshot, now, None);
        assert_eq!(board.get(JobKind::Snapshot).unwrap().state, JobState::Success);
        assert!(board.get(JobKind::Snapshot).unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_backup_job_only_when_enabled() {
        let (scheduler, _) = scheduler().await;
        assert!(scheduler.jobs.iter().all(|(kind, _)| *kind != JobKind::Backup));
        assert_eq!(scheduler.jobs.len(), 5);
    }

    #[tokio::test]
    async fn test_birthday_job_runs_daily_after_midnight() {
        let (scheduler, _) = scheduler().await;
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        let plan = scheduler.initial_plan(start);
        assert_eq!(
            plan[&JobKind::BirthdayGifts],
            Utc.with_ymd_and_hms(2025, 3, 11, 0, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_due_fires_and_reschedules() {
        let (scheduler, hiddify) = scheduler().await;
        let id = "7f9c0a2e-2f4e-4a57-9a57-2d4c1f0b9e11";
        hiddify.insert(
            NormalizedUserRecord::new("dana", id, 10.0, 1.0)
                .with_external_id(Some(id.to_string()))
                .active(true),
        );
        scheduler
            .context
            .accounts
            .register(id, Some(42), None)
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        let mut plan = scheduler.initial_plan(start);
        assert_eq!(plan[&JobKind::Snapshot], Utc.with_ymd_and_hms(2025, 3, 10, 10, 1, 0).unwrap());

        // Nothing due yet
        assert!(scheduler.run_due(&mut plan, start).await.is_empty());

        let tick = Utc.with_ymd_and_hms(2025, 3, 10, 10, 1, 0).unwrap();
        let ran = scheduler.run_due(&mut plan, tick).await;
        assert_eq!(ran, vec![JobKind::Snapshot]);
        assert_eq!(plan[&JobKind::Snapshot], Utc.with_ymd_and_hms(2025, 3, 10, 11, 1, 0).unwrap());

        let status = scheduler.context.jobs.get(JobKind::Snapshot).unwrap();
        assert_eq!(status.state, JobState::Success);
        assert_eq!(status.next_run, Some(plan[&JobKind::Snapshot]));

        let account = scheduler.context.accounts.get_by_external_id(id).await.unwrap().unwrap();
        assert_eq!(scheduler.context.snapshots.list(account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_later_jobs() {
        let (scheduler, _) = scheduler().await;
        // Closing the pool makes every database-backed job fail
        scheduler.context.db.close().await;

        let start = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        let mut plan = scheduler.initial_plan(start);
        let far = start + ChronoDuration::days(40);
        let ran = scheduler.run_due(&mut plan, far).await;

        assert_eq!(ran.len(), 5);
        assert_eq!(
            scheduler.context.jobs.get(JobKind::Snapshot).unwrap().state,
            JobState::Failed
        );
        assert_eq!(
            scheduler.context.jobs.get(JobKind::Maintenance).unwrap().state,
            JobState::Failed
        );
    }
}
