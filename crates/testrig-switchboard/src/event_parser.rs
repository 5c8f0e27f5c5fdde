/*!
 * Event parser for device log lines.
 *
 * Each device gets one parser. Every line the switchboard reads is tested
 * against a table of labelled regular expressions; a hit becomes an immutable
 * [`LogEvent`] appended to the device's history. Named capture groups in the
 * pattern become the event's fields.
 *
 * The history backs boot and crash detection. In particular a `bootup` event is
 * only expected when a `reboot_requested` event precedes it within the reboot
 * window; anything else is reported by [`EventParser::get_unexpected_reboots`].
 */
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SwitchboardError};

/// Label of the event emitted when the host asks a device to reboot
pub const REBOOT_REQUESTED_LABEL: &str = "reboot_requested";

/// Label device models use for their boot banner
pub const BOOTUP_LABEL: &str = "bootup";

/// Prefix of host-generated note lines in the device log
pub const NOTE_PREFIX: &str = "TESTRIG-M: Note: ";

/// Note text recorded when a reboot is requested
pub const REBOOT_REQUESTED_NOTE: &str = "reboot requested";

/// Default number of events kept per device
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Default window in which a reboot request explains a bootup
pub const DEFAULT_REBOOT_WINDOW: Duration = Duration::from_secs(60);

/// A structured event extracted from one log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// The filter label that matched
    pub label: String,
    /// When the line arrived
    pub timestamp: DateTime<Utc>,
    /// The raw line
    pub line: String,
    /// Named capture groups of the matching pattern
    pub fields: BTreeMap<String, String>,
}

/// A labelled pattern
#[derive(Debug, Clone)]
pub struct EventFilter {
    label: String,
    pattern: Regex,
}

impl EventFilter {
    /// Compile a filter
    pub fn new<L: Into<String>>(label: L, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| SwitchboardError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            label: label.into(),
            pattern,
        })
    }

    /// The filter label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The source of the pattern
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    fn apply(&self, line: &str, timestamp: DateTime<Utc>) -> Option<LogEvent> {
        let captures = self.pattern.captures(line)?;
        let fields = self
            .pattern
            .capture_names()
            .flatten()
            .filter_map(|name| captures.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Some(LogEvent {
            label: self.label.clone(),
            timestamp,
            line: line.to_string(),
            fields,
        })
    }
}

fn reboot_requested_filter() -> Result<EventFilter> {
    EventFilter::new(
        REBOOT_REQUESTED_LABEL,
        &format!("{}{}", regex::escape(NOTE_PREFIX), regex::escape(REBOOT_REQUESTED_NOTE)),
    )
}

#[derive(Debug)]
struct ParserState {
    filters: Vec<EventFilter>,
    events: VecDeque<LogEvent>,
    events_file: Option<(PathBuf, BufWriter<File>)>,
}

/// Per-device event parser
#[derive(Debug)]
pub struct EventParser {
    device: String,
    capacity: usize,
    reboot_window: Duration,
    state: Mutex<ParserState>,
}

impl EventParser {
    /// Create a parser that only knows the built-in reboot request filter
    pub fn new<D: Into<String>>(device: D) -> Self {
        let filters = reboot_requested_filter().into_iter().collect();
        Self {
            device: device.into(),
            capacity: DEFAULT_EVENT_CAPACITY,
            reboot_window: DEFAULT_REBOOT_WINDOW,
            state: Mutex::new(ParserState {
                filters,
                events: VecDeque::new(),
                events_file: None,
            }),
        }
    }

    /// Add a labelled pattern
    pub fn with_filter<L: Into<String>>(self, label: L, pattern: &str) -> Result<Self> {
        self.add_filter(EventFilter::new(label, pattern)?);
        Ok(self)
    }

    /// Limit how many events are retained
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the window within which a reboot request explains a bootup
    pub fn with_reboot_window(mut self, window: Duration) -> Self {
        self.reboot_window = window;
        self
    }

    /// Also append every event as a JSON line to `path`
    pub fn with_events_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        self.set_events_file(path)?;
        Ok(self)
    }

    /// The device this parser belongs to
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Add a filter at runtime; lines already processed are not re-parsed
    pub fn add_filter(&self, filter: EventFilter) {
        self.lock().filters.push(filter);
    }

    /// Labels currently being matched
    pub fn labels(&self) -> Vec<String> {
        self.lock().filters.iter().map(|f| f.label.clone()).collect()
    }

    /// Redirect the JSON events file, e.g. when the device log rotates
    pub fn set_events_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.lock().events_file = Some((path, BufWriter::new(file)));
        Ok(())
    }

    /// Path of the JSON events file, if any
    pub fn events_file(&self) -> Option<PathBuf> {
        self.lock().events_file.as_ref().map(|(p, _)| p.clone())
    }

    /// Parse a line that arrived now
    pub fn process_line(&self, line: &str) -> Vec<LogEvent> {
        self.process_line_at(line, Utc::now())
    }

    /// Parse a line with an explicit arrival time
    pub fn process_line_at(&self, line: &str, timestamp: DateTime<Utc>) -> Vec<LogEvent> {
        let mut state = self.lock();
        let matched: Vec<LogEvent> = state
            .filters
            .iter()
            .filter_map(|filter| filter.apply(line, timestamp))
            .collect();

        for event in &matched {
            debug!(device = %self.device, label = %event.label, "Log event");
            if let Some((path, writer)) = state.events_file.as_mut() {
                let written = serde_json::to_string(event)
                    .map_err(std::io::Error::from)
                    .and_then(|json| writeln!(writer, "{}", json))
                    .and_then(|_| writer.flush());
                if let Err(e) = written {
                    warn!("Failed to append event to {}: {}", path.display(), e);
                }
            }
            if state.events.len() == self.capacity {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());
        }
        matched
    }

    /// The most recent `count` events carrying any of `labels`, newest first.
    /// An empty label list selects every label.
    pub fn get_last_events(&self, labels: &[&str], count: usize) -> Vec<LogEvent> {
        self.lock()
            .events
            .iter()
            .rev()
            .filter(|e| labels.is_empty() || labels.contains(&e.label.as_str()))
            .take(count)
            .cloned()
            .collect()
    }

    /// The most recent event with `label`
    pub fn get_last_event(&self, label: &str) -> Option<LogEvent> {
        self.get_last_events(&[label], 1).into_iter().next()
    }

    /// Bootups not preceded by a reboot request within the reboot window.
    ///
    /// A request explains at most the first bootup after it.
    pub fn get_unexpected_reboots(&self) -> Vec<LogEvent> {
        // A window too large for chrono is treated as unbounded
        let window = chrono::Duration::from_std(self.reboot_window).ok();
        let state = self.lock();
        let mut pending_request: Option<DateTime<Utc>> = None;
        let mut unexpected = Vec::new();

        for event in &state.events {
            match event.label.as_str() {
                REBOOT_REQUESTED_LABEL => pending_request = Some(event.timestamp),
                BOOTUP_LABEL => {
                    let explained = pending_request.take().map_or(false, |requested| {
                        event.timestamp >= requested
                            && window.map_or(true, |w| event.timestamp - requested <= w)
                    });
                    if !explained {
                        unexpected.push(event.clone());
                    }
                }
                _ => {}
            }
        }
        unexpected
    }

    /// Number of retained events
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ParserState> {
        // A panic while holding the lock leaves the history intact, so keep using it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
