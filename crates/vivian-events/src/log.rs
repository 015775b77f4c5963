//! Event log: bounded in-memory ring plus an optional append-only JSONL file.
//! The file is opened per write; nothing is buffered between events.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::event::Event;

/// Which recorded events [`EventLog::history`] returns.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub event_type: Option<String>,
    /// Only events with a timestamp strictly after this (epoch seconds).
    pub since: Option<f64>,
    /// At most this many events, the most recent ones.
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            since: None,
            limit: 50,
        }
    }
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn since(mut self, since: f64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.event_type.as_ref().is_none_or(|t| *t == event.event_type)
            && self.since.is_none_or(|since| event.timestamp > since)
    }
}

pub struct EventLog {
    ring: Mutex<VecDeque<Event>>,
    capacity: usize,
    file: Option<PathBuf>,
}

impl EventLog {
    pub fn new(capacity: usize, file: Option<PathBuf>) -> Self {
        if let Some(parent) = file.as_deref().and_then(Path::parent) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create event log directory {}: {e}", parent.display());
            }
        }
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            file,
        }
    }

    /// Record an event in memory and, if configured, on disk.
    pub fn record(&self, event: &Event) {
        if self.capacity > 0 {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            ring.push_back(event.clone());
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }

        if let Some(path) = &self.file {
            if let Err(e) = append_line(path, event) {
                tracing::error!("Failed to write event log {}: {e}", path.display());
            }
        }
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// The most recent events matching `query`, oldest first.
    pub fn history(&self, query: &HistoryQuery) -> Vec<Event> {
        self.history_where(query, |_| true)
    }

    /// Like [`EventLog::history`], with an extra predicate every returned
    /// event must satisfy.
    pub fn history_where<P>(&self, query: &HistoryQuery, predicate: P) -> Vec<Event>
    where
        P: Fn(&Event) -> bool,
    {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let mut events: Vec<Event> = ring
            .iter()
            .rev()
            .filter(|e| query.matches(e) && predicate(e))
            .take(query.limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// Forget the in-memory events. The JSONL file is append-only and is
    /// left as it is.
    pub fn clear(&self) {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

fn append_line(path: &Path, event: &Event) -> vivian_core::Result<()> {
    let line = event.to_log_line()?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Read back a JSONL event log. Malformed lines are skipped.
pub fn read_log(path: &Path) -> vivian_core::Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<Event>(l) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Skipping malformed event log line: {e}");
                None
            }
        })
        .collect())
}
