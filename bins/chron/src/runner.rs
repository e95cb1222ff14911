use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use chrono::{Local, SecondsFormat};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use chron_core::mailbox::ERRORS_SOURCE;
use chron_core::store::RunStatusEntry;

use crate::supervisor::Supervisor;

const DIVIDER_WIDTH: usize = 80;

/// Send SIGTERM to a child process. Termination is best-effort and never escalates.
pub(crate) fn send_sigterm(pid: u32) {
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// Run one invocation of `command` for job `name` to completion.
///
/// The invocation owns its run-status id and log handle; whatever way the
/// child exits, post-processing runs here and nowhere else.
pub(crate) async fn execute(
    sup: &Supervisor,
    name: &str,
    command: &str,
    token: &CancellationToken,
) {
    if token.is_cancelled() {
        return;
    }

    let entry = RunStatusEntry::begin(name);
    let run_id = entry.id.clone();
    if let Err(e) = sup.store().insert(entry) {
        error!("record run start for {name}: {e:#}");
    }

    let mut log = open_log(sup, name);

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    redirect(&mut cmd, log.as_ref());
    if let Some(url) = sup.mailbox_url(name) {
        cmd.env("CHRON_MAILBOX_URL", url);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("spawn {name}: {e}");
            return;
        }
    };
    let pid = child.id();
    if let Some(pid) = pid {
        sup.add_pid(name, pid);
    }

    // The generation token doubles as the SIGTERM hook for this child.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            if let Some(pid) = pid {
                send_sigterm(pid);
            }
            child.wait().await
        }
    };
    if let Some(pid) = pid {
        sup.remove_pid(name, pid);
    }

    match status {
        Ok(status) => {
            let code = exit_code(status);
            if let Err(e) = sup.store().update(&run_id, code) {
                error!("record exit for {name}: {e:#}");
            }
            if code != 0 {
                let notice = format!("{name} failed with status code {code}");
                warn!("{notice}");
                if let Err(e) = sup.mailbox().add(ERRORS_SOURCE, &notice) {
                    error!("post failure notice for {name}: {e:#}");
                }
            }
            if let Some(file) = log.as_mut() {
                let footer = format!("{}\nStatus: {code}\n\n", "-".repeat(DIVIDER_WIDTH));
                if let Err(e) = file.write_all(footer.as_bytes()) {
                    warn!("write log footer for {name}: {e}");
                }
            }
        }
        Err(e) => error!("wait for {name}: {e}"),
    }
}

/// Open the per-job log in append mode and frame the invocation.
///
/// Failures are logged, not fatal: the child still runs, with its output
/// discarded.
fn open_log(sup: &Supervisor, name: &str) -> Option<std::fs::File> {
    let path = sup.log_path(name);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("create log dir {}: {e}", parent.display());
            return None;
        }
    }
    let mut file = match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(e) => {
            warn!("open log {}: {e}", path.display());
            return None;
        }
    };
    let header = format!(
        "{}\n{}\n",
        Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        "-".repeat(DIVIDER_WIDTH)
    );
    if let Err(e) = file.write_all(header.as_bytes()) {
        warn!("write log header for {name}: {e}");
    }
    Some(file)
}

fn redirect(cmd: &mut Command, log: Option<&std::fs::File>) {
    cmd.stdin(Stdio::null());
    let handles = log.and_then(|f| f.try_clone().ok().zip(f.try_clone().ok()));
    match handles {
        Some((out, err)) => {
            cmd.stdout(Stdio::from(out));
            cmd.stderr(Stdio::from(err));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }
}

/// Exit code of a finished child; a signal death maps to `128 + signo`.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}
