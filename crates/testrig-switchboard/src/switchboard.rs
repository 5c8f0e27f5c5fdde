/*!
 * The per-device switchboard.
 *
 * A switchboard owns one transport for its whole session. A single reader task
 * drains the transport, frames lines, and hands each line to the device log, the
 * event parser and the registered waiters, in that order. A single writer task
 * serialises outgoing bytes so concurrent senders never interleave. Callers that
 * `expect` wait on their own channel; the reader never waits on them.
 */
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use testrig_core::config::SwitchboardConfig;

use crate::error::{Result, SwitchboardError};
use crate::event_parser::{EventParser, NOTE_PREFIX, REBOOT_REQUESTED_NOTE};
use crate::expect::{compile_patterns, ExpectResponse, WaitEnd, Waiter, WaiterSet};
use crate::framer::LineFramer;
use crate::log::{events_path_for, DeviceLog};
use crate::transport::{BoxedReader, BoxedWriter, Transport, TransportStreams};

const READ_BUFFER_SIZE: usize = 4096;
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Lifecycle of a switchboard session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchboardState {
    /// No session; the transport is released
    Closed,
    /// The transport is being opened
    Opening,
    /// Reader and writer loops are running
    Open,
    /// The session is shutting down
    Closing,
}

impl fmt::Display for SwitchboardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchboardState::Closed => write!(f, "closed"),
            SwitchboardState::Opening => write!(f, "opening"),
            SwitchboardState::Open => write!(f, "open"),
            SwitchboardState::Closing => write!(f, "closing"),
        }
    }
}

/// Session settings for one switchboard
#[derive(Debug, Clone)]
pub struct SwitchboardOptions {
    /// Where the device log is written
    pub log_path: PathBuf,
    /// Byte that terminates a line
    pub delimiter: u8,
    /// How long a partial line may wait for its delimiter
    pub partial_line_timeout: Duration,
    /// How long `close` waits for the loops before aborting them
    pub close_grace: Duration,
    /// Log size that triggers rotation; 0 disables it
    pub max_log_size: u64,
}

impl SwitchboardOptions {
    /// Defaults with the given log path
    pub fn new<P: Into<PathBuf>>(log_path: P) -> Self {
        Self {
            log_path: log_path.into(),
            delimiter: b'\n',
            partial_line_timeout: Duration::from_millis(100),
            close_grace: Duration::from_secs(1),
            max_log_size: 0,
        }
    }

    /// Options taken from the `[switchboard]` configuration section
    pub fn from_config<P: Into<PathBuf>>(config: &SwitchboardConfig, log_path: P) -> Result<Self> {
        Ok(Self {
            log_path: log_path.into(),
            delimiter: config.delimiter_byte()?,
            partial_line_timeout: config.partial_line_timeout(),
            close_grace: config.close_grace(),
            max_log_size: config.max_log_size,
        })
    }

    /// Set the line delimiter
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set the partial-line flush timeout
    pub fn with_partial_line_timeout(mut self, timeout: Duration) -> Self {
        self.partial_line_timeout = timeout;
        self
    }

    /// Set the close grace period
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Set the rotation size
    pub fn with_max_log_size(mut self, max_log_size: u64) -> Self {
        self.max_log_size = max_log_size;
        self
    }
}

#[derive(Debug)]
struct WriteRequest {
    data: Bytes,
    ack: oneshot::Sender<Result<()>>,
}

#[derive(Debug)]
enum ControlRequest {
    Note {
        text: String,
        ack: oneshot::Sender<Result<()>>,
    },
    NewLog {
        path: PathBuf,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// State shared between the handle and its loops
#[derive(Debug)]
struct Shared {
    device: String,
    address: String,
    state: watch::Sender<SwitchboardState>,
    transport: Mutex<Box<dyn Transport>>,
    parser: Arc<EventParser>,
    waiters: Arc<WaiterSet>,
    failure: StdMutex<Option<String>>,
    log_path: StdMutex<PathBuf>,
}

impl Shared {
    fn state(&self) -> SwitchboardState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SwitchboardState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(device = %self.device, "Switchboard state {} -> {}", previous, state);
        }
    }

    fn peek_failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    fn take_failure(&self) -> Option<String> {
        lock(&self.failure).take()
    }

    fn note_log_path(&self, path: &Path) {
        let mut current = lock(&self.log_path);
        if current.as_path() != path {
            *current = path.to_path_buf();
        }
    }

    /// Tear the session down after a transport failure
    async fn fail(&self, reason: String, shutdown: &watch::Sender<bool>) {
        error!(device = %self.device, "Transport failure on {}: {}", self.address, reason);
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(reason);
            }
        }
        self.waiters.close();
        let _ = shutdown.send(true);
        self.set_state(SwitchboardState::Closing);
        if let Err(e) = self.transport.lock().await.close().await {
            warn!(device = %self.device, "Failed to release transport {}: {}", self.address, e);
        }
        self.set_state(SwitchboardState::Closed);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Session {
    shutdown: Arc<watch::Sender<bool>>,
    writes: mpsc::Sender<WriteRequest>,
    control: mpsc::Sender<ControlRequest>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    fn abort(self) {
        let _ = self.shutdown.send(true);
        self.reader.abort();
        self.writer.abort();
    }
}

/// Exclusive owner of one device's transport
#[derive(Debug)]
pub struct Switchboard {
    shared: Arc<Shared>,
    options: SwitchboardOptions,
    session: Mutex<Option<Session>>,
}

impl Switchboard {
    /// Create a closed switchboard around `transport`
    pub fn new<D: Into<String>>(
        device: D,
        transport: Box<dyn Transport>,
        parser: Arc<EventParser>,
        options: SwitchboardOptions,
    ) -> Self {
        let (state, _) = watch::channel(SwitchboardState::Closed);
        let shared = Shared {
            device: device.into(),
            address: transport.address().to_string(),
            state,
            transport: Mutex::new(transport),
            parser,
            waiters: Arc::new(WaiterSet::default()),
            failure: StdMutex::new(None),
            log_path: StdMutex::new(options.log_path.clone()),
        };
        Self {
            shared: Arc::new(shared),
            options,
            session: Mutex::new(None),
        }
    }

    /// The device this switchboard serves
    pub fn device(&self) -> &str {
        &self.shared.device
    }

    /// The transport address
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Current lifecycle state
    pub fn state(&self) -> SwitchboardState {
        self.shared.state()
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<SwitchboardState> {
        self.shared.state.subscribe()
    }

    /// The event parser fed by this switchboard
    pub fn event_parser(&self) -> &Arc<EventParser> {
        &self.shared.parser
    }

    /// The log file currently being written
    pub fn log_path(&self) -> PathBuf {
        lock(&self.shared.log_path).clone()
    }

    /// The transport failure that closed the session, if it has not been reported yet.
    ///
    /// Taking it marks it reported; the next call returns `None`.
    pub fn take_failure(&self) -> Option<SwitchboardError> {
        self.shared
            .take_failure()
            .map(|reason| SwitchboardError::transport(&self.shared.address, reason))
    }

    /// Session settings
    pub fn options(&self) -> &SwitchboardOptions {
        &self.options
    }

    /// Open the transport and start the reader and writer loops.
    ///
    /// Opening an open switchboard is a no-op. A failure leaves it `Closed`.
    pub async fn open(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.state() == SwitchboardState::Open {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.abort();
        }
        self.shared.take_failure();
        self.shared.set_state(SwitchboardState::Opening);

        match self.start_session().await {
            Ok(started) => {
                *session = Some(started);
                self.shared.set_state(SwitchboardState::Open);
                info!(device = %self.shared.device, "Switchboard open on {}", self.shared.address);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SwitchboardState::Closed);
                error!(device = %self.shared.device, "Failed to open switchboard on {}: {}", self.shared.address, e);
                Err(e)
            }
        }
    }

    async fn start_session(&self) -> Result<Session> {
        let log = DeviceLog::open(self.log_path(), self.options.max_log_size).await?;
        let TransportStreams { reader, writer } = self.shared.transport.lock().await.open().await?;

        self.shared.waiters.open();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (writes_tx, writes_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let reader_loop = ReaderLoop {
            shared: Arc::clone(&self.shared),
            reader,
            log,
            framer: LineFramer::new(self.options.delimiter),
            control: control_rx,
            shutdown: Arc::clone(&shutdown),
            partial_line_timeout: self.options.partial_line_timeout,
        };
        let reader = tokio::spawn(reader_loop.run(shutdown_rx.clone()));
        let writer = tokio::spawn(run_writer(
            Arc::clone(&self.shared),
            writer,
            writes_rx,
            Arc::clone(&shutdown),
            shutdown_rx,
        ));

        Ok(Session {
            shutdown,
            writes: writes_tx,
            control: control_tx,
            reader,
            writer,
        })
    }

    /// Write bytes to the device. Returns once they are flushed to the transport.
    pub async fn send<D: AsRef<[u8]>>(&self, data: D) -> Result<()> {
        self.ensure_open()?;
        let writes = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.writes.clone())
            .ok_or_else(|| SwitchboardError::NotOpen(self.shared.device.clone()))?;

        let (ack, done) = oneshot::channel();
        let request = WriteRequest {
            data: Bytes::copy_from_slice(data.as_ref()),
            ack,
        };
        writes.send(request).await.map_err(|_| self.closed_error())?;
        done.await.map_err(|_| self.closed_error())?
    }

    /// Wait for a line matching any of `patterns`; the first pattern in list order wins.
    ///
    /// Only lines that arrive after this call are considered. A timeout is not an
    /// error: the response carries `timed_out` and everything seen meanwhile.
    pub async fn expect<S: AsRef<str>>(&self, patterns: &[S], timeout: Duration) -> Result<ExpectResponse> {
        let patterns = compile_patterns(patterns)?;
        let waiter = self.register_waiter()?;
        self.finish_wait(waiter, &patterns, timeout).await
    }

    /// Send `data` and wait for a response, registering before the bytes go out
    pub async fn send_and_expect<D, S>(&self, data: D, patterns: &[S], timeout: Duration) -> Result<ExpectResponse>
    where
        D: AsRef<[u8]>,
        S: AsRef<str>,
    {
        let patterns = compile_patterns(patterns)?;
        let waiter = self.register_waiter()?;
        self.send(data).await?;
        self.finish_wait(waiter, &patterns, timeout).await
    }

    /// Write a host note into the device log and event stream. Notes are not offered to waiters.
    pub async fn add_log_note<S: AsRef<str>>(&self, note: S) -> Result<()> {
        let text = note.as_ref().replace(['\r', '\n'], " ");
        self.control(|ack| ControlRequest::Note { text, ack }).await
    }

    /// Record that the host asked the device to reboot
    pub async fn note_reboot_requested(&self) -> Result<()> {
        self.add_log_note(REBOOT_REQUESTED_NOTE).await
    }

    /// Continue the device log in a new file; the previous file is kept
    pub async fn start_new_log<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.control(|ack| ControlRequest::NewLog { path, ack }).await
    }

    /// Stop the loops, release the transport and wake every waiter.
    ///
    /// Closing a closed switchboard is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            return Ok(());
        };
        if self.state() != SwitchboardState::Closed {
            self.shared.set_state(SwitchboardState::Closing);
        }
        self.shared.waiters.close();

        let Session {
            shutdown,
            writes,
            control,
            mut reader,
            mut writer,
        } = active;
        let _ = shutdown.send(true);
        drop(writes);
        drop(control);

        let joined = tokio::time::timeout(self.options.close_grace, async {
            let _ = (&mut reader).await;
            let _ = (&mut writer).await;
        })
        .await;
        if joined.is_err() {
            warn!(
                device = %self.shared.device,
                "Switchboard loops did not stop within {:?}, aborting",
                self.options.close_grace
            );
            reader.abort();
            writer.abort();
        }

        let released = self.shared.transport.lock().await.close().await;
        self.shared.set_state(SwitchboardState::Closed);
        info!(device = %self.shared.device, "Switchboard closed");
        released
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == SwitchboardState::Open {
            return Ok(());
        }
        match self.shared.take_failure() {
            Some(reason) => Err(SwitchboardError::transport(&self.shared.address, reason)),
            None => Err(SwitchboardError::NotOpen(self.shared.device.clone())),
        }
    }

    fn closed_error(&self) -> SwitchboardError {
        let reason = self.shared.peek_failure().unwrap_or_else(|| "session closed".to_string());
        SwitchboardError::session_closed(&self.shared.device, reason)
    }

    fn register_waiter(&self) -> Result<Waiter> {
        self.ensure_open()?;
        self.shared.waiters.register().ok_or_else(|| self.closed_error())
    }

    async fn finish_wait(
        &self,
        waiter: Waiter,
        patterns: &[regex::Regex],
        timeout: Duration,
    ) -> Result<ExpectResponse> {
        match waiter.wait(patterns, timeout).await {
            WaitEnd::Matched(response) => Ok(response),
            WaitEnd::TimedOut(response) => {
                debug!(device = %self.shared.device, "Expect timed out after {:?}", response.elapsed);
                Ok(response)
            }
            WaitEnd::Closed => Err(self.closed_error()),
        }
    }

    async fn control<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> ControlRequest,
    {
        self.ensure_open()?;
        let control = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.control.clone())
            .ok_or_else(|| SwitchboardError::NotOpen(self.shared.device.clone()))?;

        let (ack, done) = oneshot::channel();
        control.send(make(ack)).await.map_err(|_| self.closed_error())?;
        done.await.map_err(|_| self.closed_error())?
    }
}

impl Drop for Switchboard {
    fn drop(&mut self) {
        self.shared.waiters.close();
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.shutdown.send(true);
        }
    }
}

struct ReaderLoop {
    shared: Arc<Shared>,
    reader: BoxedReader,
    log: DeviceLog,
    framer: LineFramer,
    control: mpsc::Receiver<ControlRequest>,
    shutdown: Arc<watch::Sender<bool>>,
    partial_line_timeout: Duration,
}

impl ReaderLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let outcome: std::result::Result<(), String> = loop {
            let partial_pending = self.framer.has_partial();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break Ok(()),
                Some(request) = self.control.recv() => self.handle_control(request).await,
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => break Err("device closed the stream".to_string()),
                    Ok(n) => {
                        for line in self.framer.push(&buf[..n]) {
                            self.dispatch(line).await;
                        }
                    }
                    Err(e) => break Err(e.to_string()),
                },
                _ = tokio::time::sleep(self.partial_line_timeout), if partial_pending => {
                    if let Some(line) = self.framer.take_partial() {
                        self.dispatch(line).await;
                    }
                }
            }
        };

        if let Some(line) = self.framer.take_partial() {
            self.dispatch(line).await;
        }
        if let Err(e) = self.log.flush().await {
            warn!(device = %self.shared.device, "Failed to flush device log: {}", e);
        }
        if let Err(reason) = outcome {
            self.shared.fail(reason, &self.shutdown).await;
        }
        debug!(device = %self.shared.device, "Reader loop stopped");
    }

    async fn dispatch(&mut self, line: String) {
        self.record(Utc::now(), &line).await;
        self.shared.waiters.broadcast(&Arc::from(line));
    }

    /// Log first, then parse
    async fn record(&mut self, timestamp: DateTime<Utc>, line: &str) {
        if let Err(e) = self.log.write_line(timestamp, line).await {
            warn!(device = %self.shared.device, "Failed to write device log: {}", e);
        }
        self.shared.note_log_path(self.log.path());
        self.shared.parser.process_line_at(line, timestamp);
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Note { text, ack } => {
                let line = format!("{}{}", NOTE_PREFIX, text);
                self.record(Utc::now(), &line).await;
                let _ = ack.send(Ok(()));
            }
            ControlRequest::NewLog { path, ack } => {
                let result = self.log.start_new_log(&path).await;
                if result.is_ok() {
                    self.shared.note_log_path(self.log.path());
                    if self.shared.parser.events_file().is_some() {
                        if let Err(e) = self.shared.parser.set_events_file(events_path_for(&path)) {
                            warn!(device = %self.shared.device, "Failed to move events file: {}", e);
                        }
                    }
                    info!(device = %self.shared.device, "Started new device log {}", path.display());
                }
                let _ = ack.send(result);
            }
        }
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut writer: BoxedWriter,
    mut requests: mpsc::Receiver<WriteRequest>,
    shutdown: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            request = requests.recv() => {
                let Some(WriteRequest { data, ack }) = request else {
                    break;
                };
                let written = async {
                    writer.write_all(&data).await?;
                    writer.flush().await
                }
                .await;
                match written {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = ack.send(Err(SwitchboardError::transport(&shared.address, &reason)));
                        shared.fail(reason, &shutdown).await;
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(device = %shared.device, "Writer shutdown: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_parser::{BOOTUP_LABEL, REBOOT_REQUESTED_LABEL};
    use crate::transports::DuplexTransport;
    use tempfile::tempdir;
    use tokio::io::DuplexStream;

    async fn open_board(dir: &Path, parser: EventParser) -> (Switchboard, DuplexStream) {
        let (transport, device) = DuplexTransport::pair("duplex://board");
        let options = SwitchboardOptions::new(dir.join("board.txt"))
            .with_partial_line_timeout(Duration::from_millis(50))
            .with_close_grace(Duration::from_millis(500));
        let board = Switchboard::new("board", Box::new(transport), Arc::new(parser), options);
        board.open().await.unwrap();
        (board, device)
    }

    async fn emit(device: &mut DuplexStream, data: &[u8]) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.write_all(data).await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_splits_matched_line() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;
        assert_eq!(board.state(), SwitchboardState::Open);

        let (response, _) = tokio::join!(
            board.expect(&["bar", "foo"], Duration::from_secs(2)),
            emit(&mut device, b"xxxfooyyy\n"),
        );
        let response = response.unwrap();
        assert_eq!(response.index, Some(1));
        assert_eq!(response.before, "xxx");
        assert_eq!(response.after, "yyy");
        assert!(!response.timed_out);

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_returns_everything_seen() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;

        let (response, _) = tokio::join!(
            board.expect(&["never"], Duration::from_millis(400)),
            emit(&mut device, b"abc\ndef"),
        );
        let response = response.unwrap();
        assert!(response.timed_out);
        assert_eq!(response.index, None);
        assert_eq!(response.before, "abc\ndef\n", "partial line is flushed after the timeout");

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lines_before_registration_are_not_replayed() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;

        let (first, _) = tokio::join!(
            board.expect(&["early"], Duration::from_secs(2)),
            emit(&mut device, b"early\n"),
        );
        assert!(first.unwrap().is_match());

        let (second, _) = tokio::join!(
            board.expect(&["early", "late"], Duration::from_secs(2)),
            emit(&mut device, b"late\n"),
        );
        let second = second.unwrap();
        assert_eq!(second.index, Some(1));
        assert_eq!(second.before, "");

        board.close().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_close_wakes_blocked_expect() {
        let dir = tempdir().unwrap();
        let (board, _device) = open_board(dir.path(), EventParser::new("board")).await;

        let started = std::time::Instant::now();
        let (waited, closed) = tokio::join!(board.expect(&["never"], Duration::from_secs(30)), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            board.close().await
        });
        closed.unwrap();
        assert!(matches!(waited, Err(SwitchboardError::SessionClosed { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(board.state(), SwitchboardState::Closed);

        assert!(matches!(board.send(b"x").await, Err(SwitchboardError::NotOpen(_))));
        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_waiters_each_see_the_line() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;

        let (a, b, _) = tokio::join!(
            board.expect(&["ready"], Duration::from_secs(2)),
            board.expect(&["login:", "ready"], Duration::from_secs(2)),
            emit(&mut device, b"system ready\n"),
        );
        assert_eq!(a.unwrap().index, Some(0));
        assert_eq!(b.unwrap().index, Some(1));

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;
        let a_line = format!("{}\n", "A".repeat(63));
        let b_line = format!("{}\n", "B".repeat(63));

        let sender = |line: String| {
            let board = &board;
            async move {
                for _ in 0..20 {
                    board.send(line.as_bytes()).await.unwrap();
                }
            }
        };
        tokio::join!(sender(a_line), sender(b_line));

        let mut received = vec![0u8; 40 * 64];
        tokio::io::AsyncReadExt::read_exact(&mut device, &mut received).await.unwrap();
        let text = String::from_utf8(received).unwrap();
        for line in text.lines() {
            assert!(line == "A".repeat(63) || line == "B".repeat(63), "interleaved: {line}");
        }

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_expect_sees_immediate_reply() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;

        let echo = async {
            let mut buf = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut device, &mut buf).await.unwrap();
            device.write_all(b"pong\n").await.unwrap();
        };
        let (response, _) = tokio::join!(board.send_and_expect(b"ping\n", &["pong"], Duration::from_secs(2)), echo);
        assert!(response.unwrap().is_match());

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_loss_closes_session_and_surfaces_once() {
        let dir = tempdir().unwrap();
        let (board, device) = open_board(dir.path(), EventParser::new("board")).await;
        let mut state = board.subscribe_state();

        drop(device);
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == SwitchboardState::Closed))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(board.send(b"x").await, Err(SwitchboardError::Transport { .. })));
        assert!(matches!(board.send(b"x").await, Err(SwitchboardError::NotOpen(_))));
        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_open_leaves_switchboard_closed() {
        let dir = tempdir().unwrap();
        let (board, _device) = open_board(dir.path(), EventParser::new("board")).await;
        board.open().await.unwrap();
        board.close().await.unwrap();

        // The in-memory pipe can only be opened once
        assert!(board.open().await.is_err());
        assert_eq!(board.state(), SwitchboardState::Closed);
    }

    #[tokio::test]
    async fn test_lines_reach_log_then_parser_before_waiters() {
        let dir = tempdir().unwrap();
        let parser = EventParser::new("board").with_filter(BOOTUP_LABEL, r"U-Boot (?P<version>\S+)").unwrap();
        let (board, mut device) = open_board(dir.path(), parser).await;

        let (response, _) = tokio::join!(
            board.expect(&["U-Boot"], Duration::from_secs(2)),
            emit(&mut device, b"U-Boot 2024.01\r\n"),
        );
        assert!(response.unwrap().is_match());

        let event = board.event_parser().get_last_event(BOOTUP_LABEL).unwrap();
        assert_eq!(event.fields.get("version").map(String::as_str), Some("2024.01"));
        let logged = std::fs::read_to_string(board.log_path()).unwrap();
        assert!(logged.contains("> U-Boot 2024.01"));

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_notes_are_logged_and_parsed_but_not_expected() {
        let dir = tempdir().unwrap();
        let (board, _device) = open_board(dir.path(), EventParser::new("board")).await;

        let (waited, noted) = tokio::join!(board.expect(&["marker"], Duration::from_millis(200)), async {
            board.add_log_note("marker").await
        });
        noted.unwrap();
        assert!(waited.unwrap().timed_out);

        board.note_reboot_requested().await.unwrap();
        assert!(board.event_parser().get_last_event(REBOOT_REQUESTED_LABEL).is_some());

        let logged = std::fs::read_to_string(board.log_path()).unwrap();
        assert!(logged.contains("TESTRIG-M: Note: marker"));
        assert!(logged.contains("TESTRIG-M: Note: reboot requested"));

        board.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_new_log_switches_files() {
        let dir = tempdir().unwrap();
        let (board, mut device) = open_board(dir.path(), EventParser::new("board")).await;
        let first = board.log_path();
        let second = dir.path().join("second.txt");

        board.start_new_log(&second).await.unwrap();
        let (response, _) = tokio::join!(
            board.expect(&["after"], Duration::from_secs(2)),
            emit(&mut device, b"after\n"),
        );
        assert!(response.unwrap().is_match());

        assert_eq!(board.log_path(), second);
        assert!(std::fs::read_to_string(&second).unwrap().contains("after"));
        assert!(!std::fs::read_to_string(&first).unwrap().contains("after"));

        board.close().await.unwrap();
    }

    #[test]
    fn test_options_from_config() {
        let config = SwitchboardConfig {
            line_delimiter: "\r\n".to_string(),
            partial_line_timeout_ms: 250,
            close_grace_ms: 2000,
            max_log_size: 1024,
            default_expect_timeout_ms: 30_000,
        };
        let options = SwitchboardOptions::from_config(&config, "/tmp/board.txt").unwrap();
        assert_eq!(options.delimiter, b'\n');
        assert_eq!(options.partial_line_timeout, Duration::from_millis(250));
        assert_eq!(options.close_grace, Duration::from_secs(2));
        assert_eq!(options.max_log_size, 1024);
    }
}
