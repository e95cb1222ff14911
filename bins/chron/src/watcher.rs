use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::loader;
use crate::module::{Module, ModuleCtx};
use crate::supervisor::Supervisor;

/// Trailing-edge debounce window for chronfile change bursts.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Watches the chronfile and reloads the supervisor after changes settle.
///
/// Reload failures are logged and swallowed; the watcher keeps running.
pub struct ChronfileWatcher {
    path: PathBuf,
    supervisor: Arc<Supervisor>,
}

impl ChronfileWatcher {
    pub fn new(path: PathBuf, supervisor: Arc<Supervisor>) -> Self {
        Self { path, supervisor }
    }
}

impl Module for ChronfileWatcher {
    fn name(&self) -> &'static str {
        "watcher"
    }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(16);
            let mut watcher = RecommendedWatcher::new(
                move |res| {
                    let _ = tx.blocking_send(res);
                },
                notify::Config::default(),
            )?;
            watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
            info!("watching {}", self.path.display());

            let mut deadline: Option<Instant> = None;
            loop {
                // Dummy far-future deadline keeps the select arm well-formed
                // while nothing is pending.
                let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(Ok(event)) if reloads(&event.kind) => {
                            deadline = Some(Instant::now() + DEBOUNCE);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!("watch {}: {e}", self.path.display()),
                        None => break,
                    },
                    _ = sleep_until(wake), if deadline.is_some() => {
                        deadline = None;
                        match loader::load(&self.supervisor, &self.path).await {
                            Ok(()) => info!("reloaded {}", self.path.display()),
                            Err(e) => warn!("reload {}: {e:#}", self.path.display()),
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_ok() && *ctx.shutdown.borrow() {
                            info!("watcher stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

fn reloads(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(_) | EventKind::Remove(_))
}
