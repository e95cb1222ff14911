use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::write_json_document;

/// Source tag reserved for supervisor-emitted failure notices.
pub const ERRORS_SOURCE: &str = "@errors";

/// One time-stamped message in the mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Source tag, a job name or [`ERRORS_SOURCE`].
    pub source: String,
    /// Human-readable time the message was added.
    pub timestamp: String,
    /// Free-text payload.
    pub message: String,
}

/// Message log addressable by source tag, persisted as a JSON array document.
///
/// Messages are unordered with respect to each other; callers that need
/// order sort by timestamp.
pub struct Mailbox {
    path: PathBuf,
    messages: Mutex<Vec<Message>>,
}

impl Mailbox {
    /// Open the mailbox at `path`, loading any existing document.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let messages = if path.exists() {
            let txt =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&txt).with_context(|| format!("parse {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            messages: Mutex::new(messages),
        })
    }

    /// Stamp and insert a message, returning the stored record.
    pub fn add(&self, source: &str, message: &str) -> Result<Message> {
        let record = Message {
            source: source.to_string(),
            timestamp: Local::now().to_rfc2822(),
            message: message.to_string(),
        };
        let mut messages = self.messages.lock();
        messages.push(record.clone());
        write_json_document(&self.path, &*messages)?;
        Ok(record)
    }

    /// Messages whose source equals `source`.
    pub fn list_by(&self, source: &str) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.source == source)
            .cloned()
            .collect()
    }

    /// Every message in the mailbox.
    pub fn list_all(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Number of messages in the mailbox.
    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Remove and return all messages with `source`.
    pub fn clear_by(&self, source: &str) -> Result<Vec<Message>> {
        let mut messages = self.messages.lock();
        let removed: Vec<Message> = messages
            .iter()
            .filter(|m| m.source == source)
            .cloned()
            .collect();
        messages.retain(|m| m.source != source);
        write_json_document(&self.path, &*messages)?;
        Ok(removed)
    }

    /// Remove and return every message.
    pub fn clear_all(&self) -> Result<Vec<Message>> {
        let mut messages = self.messages.lock();
        let removed = std::mem::take(&mut *messages);
        write_json_document(&self.path, &*messages)?;
        Ok(removed)
    }
}
