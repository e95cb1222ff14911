use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use chron_core::cfg;
use chron_core::job::{ScheduledOptions, StartupOptions};

use crate::supervisor::Supervisor;

/// Apply the chronfile at `path` to the supervisor.
///
/// The current generation is torn down before any new job is registered,
/// so the registry never transiently holds old and new jobs at once.
/// Parse and registration failures propagate to the caller.
pub async fn load(supervisor: &Arc<Supervisor>, path: &Path) -> Result<()> {
    let doc = cfg::parse_chronfile(path)?;
    supervisor.reset();

    for (name, entry) in &doc.startup {
        supervisor.clone().startup(
            name,
            &entry.command,
            StartupOptions {
                keep_alive: entry.keep_alive,
            },
        )?;
    }
    for (name, entry) in &doc.schedule {
        supervisor
            .clone()
            .schedule(
                name,
                &entry.schedule,
                &entry.command,
                ScheduledOptions {
                    allow_concurrent_runs: entry.allow_concurrent_runs,
                    make_up_missed_runs: entry.make_up_missed_runs,
                },
            )
            .await?;
    }

    info!(
        "loaded {} startup and {} scheduled jobs from {}",
        doc.startup.len(),
        doc.schedule.len(),
        path.display()
    );
    Ok(())
}
