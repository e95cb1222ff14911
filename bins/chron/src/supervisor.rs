use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chron_core::error::ChronError;
use chron_core::job::{self, JobKind, JobSchedule, MakeUpRuns, ScheduledOptions, StartupOptions};
use chron_core::mailbox::Mailbox;
use chron_core::store::{RunStatusEntry, StatusStore};

use crate::runner;
use crate::scheduler::{Scheduler, TaskCallback, TaskId};

/// Delay between a startup job exiting and its restart.
const RESTART_DELAY: Duration = Duration::from_secs(5);

struct JobEntry {
    kind: JobKind,
    schedule: Option<JobSchedule>,
    task: Option<TaskId>,
    allow_concurrent: bool,
    /// Invocations currently in flight.
    active: u32,
    /// Pids of live children, one per in-flight invocation.
    pids: Vec<u32>,
}

struct Registry {
    jobs: HashMap<String, JobEntry>,
    generation: CancellationToken,
}

/// One registered job as the control plane lists it.
pub struct JobSummary {
    pub name: String,
    pub running: bool,
}

/// Detailed job state as the control plane reports it.
pub struct JobStatusView {
    pub name: String,
    pub kind: JobKind,
    /// Run history, newest first, untruncated.
    pub runs: Vec<RunStatusEntry>,
    pub next_run: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

/// The narrow surface the control plane sees; the supervisor never learns
/// the web layer exists.
pub trait StatusApi: Send + Sync {
    fn jobs(&self) -> Vec<JobSummary>;
    fn job_status(&self, name: &str) -> Option<JobStatusView>;
    /// Log path for a registered job, None when the name is unknown.
    fn job_log_path(&self, name: &str) -> Option<PathBuf>;
    /// SIGTERM every live child of `name`; true when something was signaled.
    fn terminate(&self, name: &str) -> bool;
}

/// Owns the job registry, drives startup loops and scheduled execution,
/// and enforces generation-scoped cancellation.
pub struct Supervisor {
    registry: Mutex<Registry>,
    scheduler: Scheduler,
    store: Arc<StatusStore>,
    mailbox: Arc<Mailbox>,
    chron_dir: PathBuf,
    port: Option<u16>,
}

impl Supervisor {
    pub fn new(
        scheduler: Scheduler,
        store: Arc<StatusStore>,
        mailbox: Arc<Mailbox>,
        chron_dir: PathBuf,
        port: Option<u16>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                jobs: HashMap::new(),
                generation: CancellationToken::new(),
            }),
            scheduler,
            store,
            mailbox,
            chron_dir,
            port,
        })
    }

    /// Register an always-on job and detach its supervision loop.
    ///
    /// The loop runs the command to completion, then, while `keep_alive`
    /// holds and the generation is alive, waits 5 seconds and runs again.
    pub fn startup(
        self: Arc<Self>,
        name: &str,
        command: &str,
        opts: StartupOptions,
    ) -> Result<(), ChronError> {
        let token = self.register(name, JobKind::Startup, None, false)?;
        info!("registered startup job {name}");

        let sup = self;
        let name = name.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                sup.begin(&name);
                runner::execute(&sup, &name, &command, &token).await;
                sup.finish(&name);
                if !opts.keep_alive {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                    _ = token.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    /// Register a cron-driven job, then make up missed runs before returning.
    pub async fn schedule(
        self: Arc<Self>,
        name: &str,
        cron_expr: &str,
        command: &str,
        opts: ScheduledOptions,
    ) -> Result<(), ChronError> {
        let schedule = JobSchedule::parse(cron_expr)?;
        let token = self.register(
            name,
            JobKind::Scheduled,
            Some(schedule.clone()),
            opts.allow_concurrent_runs,
        )?;

        let callback: TaskCallback = {
            let sup = Arc::clone(&self);
            let name = name.to_string();
            let command = command.to_string();
            let token = token.clone();
            Arc::new(move || {
                let sup = Arc::clone(&sup);
                let name = name.clone();
                let command = command.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    sup.run_scheduled(&name, &command, &token).await;
                });
            })
        };

        // The task is registered under the registry lock so a concurrent
        // reset() either sees it (and unregisters it) or prevents it.
        {
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.jobs.get_mut(name) {
                let task = self.scheduler.register(schedule.clone(), callback);
                entry.task = Some(task);
            }
        }
        info!("registered scheduled job {name} ({cron_expr})");

        self.catch_up(name, command, &schedule, opts.make_up_missed_runs, &token)
            .await;
        Ok(())
    }

    /// Collapse the current generation: cancel its token (live children get
    /// SIGTERM through their per-invocation hooks, future spawns become
    /// no-ops), unregister every scheduled task, and empty the registry.
    pub fn reset(&self) {
        let mut registry = self.registry.lock();
        let old = std::mem::replace(&mut registry.generation, CancellationToken::new());
        old.cancel();
        for (_, entry) in registry.jobs.drain() {
            if let Some(task) = entry.task {
                self.scheduler.unregister(task);
            }
        }
        info!("supervisor reset: job registry cleared");
    }

    /// Every registered job, sorted by name.
    pub fn jobs(&self) -> Vec<JobSummary> {
        let registry = self.registry.lock();
        let mut jobs: Vec<JobSummary> = registry
            .jobs
            .iter()
            .map(|(name, entry)| JobSummary {
                name: name.clone(),
                running: !entry.pids.is_empty(),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Run history for `name`, newest first.
    pub fn recent_runs(&self, name: &str) -> Vec<RunStatusEntry> {
        let mut runs = self.store.find_by_name(name);
        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        runs
    }

    pub fn job_status(&self, name: &str) -> Option<JobStatusView> {
        let (kind, schedule, pid) = {
            let registry = self.registry.lock();
            let entry = registry.jobs.get(name)?;
            (
                entry.kind,
                entry.schedule.clone(),
                entry.pids.last().copied(),
            )
        };
        Some(JobStatusView {
            name: name.to_string(),
            kind,
            runs: self.recent_runs(name),
            next_run: schedule.as_ref().and_then(|s| s.next_after(Utc::now())),
            pid,
        })
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Where this job's output lands.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.chron_dir.join("logs").join(format!("{name}.log"))
    }

    pub(crate) fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Mailbox endpoint advertised to children, when a port is bound.
    pub(crate) fn mailbox_url(&self, name: &str) -> Option<String> {
        self.port
            .map(|port| format!("http://0.0.0.0:{port}/mailbox/{name}"))
    }

    pub(crate) fn add_pid(&self, name: &str, pid: u32) {
        if let Some(entry) = self.registry.lock().jobs.get_mut(name) {
            entry.pids.push(pid);
        }
    }

    /// Called as each child exits, so a dead pid is never reported while a
    /// sibling invocation is still running.
    pub(crate) fn remove_pid(&self, name: &str, pid: u32) {
        if let Some(entry) = self.registry.lock().jobs.get_mut(name) {
            entry.pids.retain(|p| *p != pid);
        }
    }

    async fn run_scheduled(&self, name: &str, command: &str, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        if !self.try_begin(name) {
            warn!("Skipping {name} because it is still running");
            return;
        }
        runner::execute(self, name, command, token).await;
        self.finish(name);
    }

    async fn catch_up(
        &self,
        name: &str,
        command: &str,
        schedule: &JobSchedule,
        make_up: MakeUpRuns,
        token: &CancellationToken,
    ) {
        let Some(last) = self.store.latest_for(name) else {
            return;
        };
        let Some(last_at) = DateTime::from_timestamp_millis(last) else {
            return;
        };
        let now = Utc::now();
        let missed = schedule
            .occurrences_from(last_at)
            .take_while(|t| *t <= now)
            .count();
        let runs = match make_up {
            MakeUpRuns::All => missed,
            MakeUpRuns::Count(n) => missed.min(n as usize),
        };
        if runs == 0 {
            return;
        }
        info!("Making up {runs} of {missed} missed runs for {name}");
        for _ in 0..runs {
            if token.is_cancelled() {
                return;
            }
            self.begin(name);
            runner::execute(self, name, command, token).await;
            self.finish(name);
        }
    }

    fn register(
        &self,
        name: &str,
        kind: JobKind,
        schedule: Option<JobSchedule>,
        allow_concurrent: bool,
    ) -> Result<CancellationToken, ChronError> {
        job::validate_name(name)?;
        let mut registry = self.registry.lock();
        if registry.jobs.contains_key(name) {
            return Err(ChronError::DuplicateName(name.to_string()));
        }
        registry.jobs.insert(
            name.to_string(),
            JobEntry {
                kind,
                schedule,
                task: None,
                allow_concurrent,
                active: 0,
                pids: Vec::new(),
            },
        );
        Ok(registry.generation.clone())
    }

    fn begin(&self, name: &str) {
        if let Some(entry) = self.registry.lock().jobs.get_mut(name) {
            entry.active += 1;
        }
    }

    /// Atomic check-and-mark for the non-concurrent rule.
    fn try_begin(&self, name: &str) -> bool {
        let mut registry = self.registry.lock();
        match registry.jobs.get_mut(name) {
            Some(entry) if entry.active > 0 && !entry.allow_concurrent => false,
            Some(entry) => {
                entry.active += 1;
                true
            }
            None => false,
        }
    }

    fn finish(&self, name: &str) {
        if let Some(entry) = self.registry.lock().jobs.get_mut(name) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

impl StatusApi for Supervisor {
    fn jobs(&self) -> Vec<JobSummary> {
        Supervisor::jobs(self)
    }

    fn job_status(&self, name: &str) -> Option<JobStatusView> {
        Supervisor::job_status(self, name)
    }

    fn job_log_path(&self, name: &str) -> Option<PathBuf> {
        let registry = self.registry.lock();
        if registry.jobs.contains_key(name) {
            Some(self.log_path(name))
        } else {
            None
        }
    }

    fn terminate(&self, name: &str) -> bool {
        let registry = self.registry.lock();
        let Some(entry) = registry.jobs.get(name) else {
            return false;
        };
        for pid in &entry.pids {
            runner::send_sigterm(*pid);
        }
        !entry.pids.is_empty()
    }
}
