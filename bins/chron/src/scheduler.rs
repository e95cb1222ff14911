use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::interval;
use tracing::info;

use chron_core::job::JobSchedule;

use crate::module::{Module, ModuleCtx};

/// Callback fired when a task comes due. Must not block the tick loop.
pub type TaskCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle returned by [`Scheduler::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct TaskEntry {
    schedule: JobSchedule,
    due: Option<DateTime<Utc>>,
    callback: TaskCallback,
}

struct SchedulerInner {
    next_id: u64,
    tasks: HashMap<u64, TaskEntry>,
}

/// Passive cron scheduler polling at a fixed tick.
///
/// On each tick every task whose due instant is at or before now fires once
/// and its due instant advances strictly past now, so a missed tick is
/// caught but a minute never fires twice.
#[derive(Clone)]
pub struct Scheduler {
    tick: Duration,
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            inner: Arc::new(Mutex::new(SchedulerInner {
                next_id: 0,
                tasks: HashMap::new(),
            })),
        }
    }

    /// Register a task; it first fires at the next occurrence after now.
    pub fn register(&self, schedule: JobSchedule, callback: TaskCallback) -> TaskId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let due = schedule.next_after(Utc::now());
        inner.tasks.insert(
            id,
            TaskEntry {
                schedule,
                due,
                callback,
            },
        );
        TaskId(id)
    }

    pub fn unregister(&self, id: TaskId) {
        self.inner.lock().tasks.remove(&id.0);
    }

    /// Fire every task due at or before `now`; returns how many fired.
    fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let fired: Vec<TaskCallback> = {
            let mut inner = self.inner.lock();
            inner
                .tasks
                .values_mut()
                .filter(|t| matches!(t.due, Some(due) if due <= now))
                .map(|t| {
                    t.due = t.schedule.next_after(now);
                    Arc::clone(&t.callback)
                })
                .collect()
        };
        let count = fired.len();
        for callback in fired {
            callback();
        }
        count
    }
}

impl Module for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.tick);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.fire_due(Utc::now());
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_ok() && *ctx.shutdown.borrow() {
                            info!("scheduler stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
