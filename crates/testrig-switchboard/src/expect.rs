/*!
 * Expect primitives.
 *
 * A waiter is a channel registered with the switchboard. The reader loop pushes
 * each completed line into every registered channel and never waits on any of
 * them; the matching happens on the caller's side. A waiter only ever sees lines
 * that arrived after it was registered.
 */
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Result, SwitchboardError};

/// Outcome of an `expect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectResponse {
    /// Index of the pattern that matched, if any
    pub index: Option<usize>,
    /// Text seen since registration that precedes the match (or everything, on timeout)
    pub before: String,
    /// The matched text
    pub matched: Option<String>,
    /// Remainder of the matched line after the match
    pub after: String,
    /// The full line that matched
    pub line: Option<String>,
    /// Whether the deadline elapsed before any pattern matched
    pub timed_out: bool,
    /// Time spent waiting
    pub elapsed: Duration,
}

impl ExpectResponse {
    pub(crate) fn matched(index: usize, before: String, line: &str, start: usize, end: usize, elapsed: Duration) -> Self {
        Self {
            index: Some(index),
            before,
            matched: Some(line[start..end].to_string()),
            after: line[end..].to_string(),
            line: Some(line.to_string()),
            timed_out: false,
            elapsed,
        }
    }

    pub(crate) fn timed_out(before: String, elapsed: Duration) -> Self {
        Self {
            index: None,
            before,
            matched: None,
            after: String::new(),
            line: None,
            timed_out: true,
            elapsed,
        }
    }

    /// Whether a pattern matched
    pub fn is_match(&self) -> bool {
        self.index.is_some()
    }
}

/// Compile expect patterns in order
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|e| SwitchboardError::InvalidPattern {
                pattern: p.as_ref().to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// First pattern (in list order) that matches `line`, with the match bounds
pub(crate) fn first_match(patterns: &[Regex], line: &str) -> Option<(usize, usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .find_map(|(index, pattern)| pattern.find(line).map(|m| (index, m.start(), m.end())))
}

type WaiterMap = BTreeMap<u64, mpsc::UnboundedSender<Arc<str>>>;

/// Registered waiters of one switchboard session
///
/// `None` means the session is not accepting waiters; closing drops every
/// sender, which wakes blocked callers with a closed channel.
#[derive(Debug, Default)]
pub(crate) struct WaiterSet {
    waiters: Mutex<Option<WaiterMap>>,
    next_id: AtomicU64,
}

impl WaiterSet {
    pub(crate) fn open(&self) {
        *self.lock() = Some(WaiterMap::new());
    }

    pub(crate) fn close(&self) {
        self.lock().take();
    }

    pub(crate) fn register(self: &Arc<Self>) -> Option<Waiter> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().as_mut()?.insert(id, tx);
        Some(Waiter {
            id,
            rx,
            set: Arc::clone(self),
        })
    }

    fn deregister(&self, id: u64) {
        if let Some(waiters) = self.lock().as_mut() {
            waiters.remove(&id);
        }
    }

    /// Offer a line to every waiter registered right now
    pub(crate) fn broadcast(&self, line: &Arc<str>) {
        if let Some(waiters) = self.lock().as_mut() {
            waiters.retain(|_, tx| tx.send(Arc::clone(line)).is_ok());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> MutexGuard<'_, Option<WaiterMap>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A registered waiter; deregisters itself when dropped
#[derive(Debug)]
pub(crate) struct Waiter {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<str>>,
    set: Arc<WaiterSet>,
}

/// How a wait ended without a match
pub(crate) enum WaitEnd {
    Matched(ExpectResponse),
    TimedOut(ExpectResponse),
    Closed,
}

impl Waiter {
    /// Consume lines until one matches, the deadline passes, or the session closes
    ///
    /// A timeout too large to form a deadline waits without one.
    pub(crate) async fn wait(mut self, patterns: &[Regex], timeout: Duration) -> WaitEnd {
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut before = String::new();

        loop {
            let received = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.rx.recv()).await,
                None => Ok(self.rx.recv().await),
            };
            match received {
                Ok(Some(line)) => {
                    if let Some((index, begin, end)) = first_match(patterns, &line) {
                        before.push_str(&line[..begin]);
                        return WaitEnd::Matched(ExpectResponse::matched(
                            index,
                            before,
                            &line,
                            begin,
                            end,
                            start.elapsed(),
                        ));
                    }
                    before.push_str(&line);
                    before.push('\n');
                }
                Ok(None) => return WaitEnd::Closed,
                Err(_) => return WaitEnd::TimedOut(ExpectResponse::timed_out(before, start.elapsed())),
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.set.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> Arc<WaiterSet> {
        let set = Arc::new(WaiterSet::default());
        set.open();
        set
    }

    #[test]
    fn test_first_match_wins_in_list_order() {
        let patterns = compile_patterns(&["bar", "foo", "o+"]).unwrap();
        assert_eq!(first_match(&patterns, "xxfooyy"), Some((1, 2, 5)));
        assert_eq!(first_match(&patterns, "zzz"), None);
    }

    #[test]
    fn test_invalid_pattern() {
        let err = compile_patterns(&["ok", "[broken"]).unwrap_err();
        assert!(matches!(err, SwitchboardError::InvalidPattern { ref pattern, .. } if pattern == "[broken"));
    }

    #[tokio::test]
    async fn test_waiter_matches_and_splits_line() {
        let set = set();
        let waiter = set.register().unwrap();
        set.broadcast(&Arc::from("noise"));
        set.broadcast(&Arc::from("xxxfooyyy"));

        let patterns = compile_patterns(&["foo"]).unwrap();
        let WaitEnd::Matched(response) = waiter.wait(&patterns, Duration::from_secs(1)).await else {
            panic!("expected a match");
        };
        assert_eq!(response.index, Some(0));
        assert_eq!(response.before, "noise\nxxx");
        assert_eq!(response.matched.as_deref(), Some("foo"));
        assert_eq!(response.after, "yyy");
        assert_eq!(response.line.as_deref(), Some("xxxfooyyy"));
        assert_eq!(set.len(), 0, "waiter deregisters on drop");
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_for_match() {
        let set = set();
        let waiter = set.register().unwrap();
        set.broadcast(&Arc::from("ready"));

        let patterns = compile_patterns(&["ready"]).unwrap();
        let WaitEnd::Matched(response) = waiter.wait(&patterns, Duration::MAX).await else {
            panic!("expected a match");
        };
        assert_eq!(response.index, Some(0));
        assert!(!response.timed_out);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_ends_on_close() {
        let set = set();
        let waiter = set.register().unwrap();
        set.close();

        let patterns = compile_patterns(&["ready"]).unwrap();
        assert!(matches!(waiter.wait(&patterns, Duration::MAX).await, WaitEnd::Closed));
    }

    #[tokio::test]
    async fn test_waiter_times_out_with_accumulated_text() {
        let set = set();
        let waiter = set.register().unwrap();
        set.broadcast(&Arc::from("a"));
        set.broadcast(&Arc::from("b"));

        let patterns = compile_patterns(&["never"]).unwrap();
        let WaitEnd::TimedOut(response) = waiter.wait(&patterns, Duration::from_millis(20)).await else {
            panic!("expected a timeout");
        };
        assert!(response.timed_out);
        assert!(!response.is_match());
        assert_eq!(response.before, "a\nb\n");
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_and_blocks_registration() {
        let set = set();
        let waiter = set.register().unwrap();
        set.close();
        let patterns = compile_patterns(&["x"]).unwrap();
        assert!(matches!(waiter.wait(&patterns, Duration::from_secs(30)).await, WaitEnd::Closed));
        assert!(set.register().is_none());
    }

    #[test]
    fn test_no_history_replay() {
        let set = set();
        set.broadcast(&Arc::from("early"));
        let mut waiter = set.register().unwrap();
        assert!(waiter.rx.try_recv().is_err());
    }
}
