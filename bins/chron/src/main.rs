use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chron_core::{
    cfg::{self, AppId},
    logx,
    mailbox::Mailbox,
    store::StatusStore,
};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

mod loader;
mod module;
mod runner;
mod scheduler;
mod supervisor;
mod watcher;
mod web;

use crate::module::{Module, ModuleCtx};
use crate::scheduler::Scheduler;
use crate::supervisor::{StatusApi, Supervisor};
use crate::watcher::ChronfileWatcher;
use crate::web::WebServer;

const APP: AppId = AppId { qualifier: "com", organization: "local", application: "chron" };

#[derive(Parser)]
#[command(name = "chron", version, about = "Personal job supervisor")]
struct Cli {
    /// Chronfile describing startup and scheduled jobs.
    chronfile: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 });
    });
    let port = match std::env::var("PORT").ok().and_then(|s| s.parse::<u16>().ok()) {
        Some(port) => port,
        None => {
            eprintln!("PORT must be set to a non-negative integer");
            std::process::exit(1);
        }
    };

    logx::init("info");

    // ---- data dir + stores
    let chron_dir = cfg::data_dir(&APP)?;
    info!("chron boot");
    info!("data dir {}", chron_dir.display());
    let store = Arc::new(StatusStore::open(chron_dir.join("jobStatus.json"))?);
    let mailbox = Arc::new(Mailbox::open(chron_dir.join("mailbox.json"))?);

    // ---- modules
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();

    // Cron scheduler @ 1s tick
    let scheduler = Scheduler::new(Duration::from_secs(1));
    let sch = Box::new(scheduler.clone());
    info!("module start: {}", sch.name());
    tasks.push(sch.spawn(ModuleCtx { shutdown: shutdown_rx.clone() }));

    let supervisor = Supervisor::new(
        scheduler,
        store,
        mailbox.clone(),
        chron_dir.clone(),
        Some(port),
    );

    // Initial load; a broken chronfile aborts startup.
    loader::load(&supervisor, &cli.chronfile)
        .await
        .with_context(|| format!("load {}", cli.chronfile.display()))?;

    // Chronfile watcher for live reconfiguration
    let wat = Box::new(ChronfileWatcher::new(cli.chronfile.clone(), supervisor.clone()));
    info!("module start: {}", wat.name());
    tasks.push(wat.spawn(ModuleCtx { shutdown: shutdown_rx.clone() }));

    // HTTP control plane
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let api: Arc<dyn StatusApi> = supervisor.clone();
    let srv = Box::new(WebServer::new(addr, api, mailbox.clone()));
    info!("module start: {}", srv.name());
    tasks.push(srv.spawn(ModuleCtx { shutdown: shutdown_rx.clone() }));

    info!("runtime: modules started; press Ctrl+C to stop");

    // ---- wait for ctrl+c
    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    // Children get SIGTERM before the daemon exits.
    supervisor.reset();

    // ---- wait for modules to end
    for t in tasks {
        match t.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("module ended with error: {e}"),
            Err(e) => warn!("join error: {e}"),
        }
    }
    Ok(())
}
