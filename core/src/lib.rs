#![deny(missing_docs)]
//! chron_core: shared building blocks (config, stores, logging, job model).

/// Chronfile parsing and data-directory helpers (AppId, dirs, parse, etc.)
pub mod cfg;
/// Typed errors surfaced by job registration.
pub mod error;
/// Shared job model used by the supervisor, scheduler, and web surface.
pub mod job;
/// Tracing/log initialization helpers.
pub mod logx;
/// Message log addressable by source tag, persisted as `mailbox.json`.
pub mod mailbox;
/// Run-status store persisted as `jobStatus.json`.
pub mod store;
