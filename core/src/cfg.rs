use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::job::MakeUpRuns;

/// Identifier used to compute per-app data directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"chron"`.
    pub application: &'static str,
}

/// Return the data directory for this app, creating it if needed.
///
/// On Linux this resolves to `$HOME/.local/share/<application>`.
pub fn data_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.data_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// The declarative job document chron supervises.
///
/// Two top-level tables: `[startup.<name>]` and `[schedule.<name>]`.
/// Unknown fields anywhere in the document are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chronfile {
    /// Always-on jobs, keyed by job name.
    #[serde(default)]
    pub startup: BTreeMap<String, StartupEntry>,
    /// Cron-driven jobs, keyed by job name.
    #[serde(default)]
    pub schedule: BTreeMap<String, ScheduleEntry>,
}

/// One `[startup.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StartupEntry {
    /// Shell command, executed via `sh -c`.
    pub command: String,
    /// Restart the command after it exits (default true).
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
}

/// One `[schedule.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Five-field cron expression.
    pub schedule: String,
    /// Shell command, executed via `sh -c`.
    pub command: String,
    /// Permit overlapping runs (default false).
    #[serde(default)]
    pub allow_concurrent_runs: bool,
    /// Missed-run catch-up budget (default 0).
    #[serde(default)]
    pub make_up_missed_runs: MakeUpRuns,
}

fn default_keep_alive() -> bool {
    true
}

/// Read and strictly parse a chronfile.
pub fn parse_chronfile(path: &Path) -> Result<Chronfile> {
    let txt =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let doc: Chronfile =
        toml::from_str(&txt).with_context(|| format!("parse {}", path.display()))?;
    Ok(doc)
}
