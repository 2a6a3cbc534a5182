//! Engine session management.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use plotpipe_core::{
    Error, Result, SessionConfig, SessionId, SessionInfo, SessionStatus, StreamKind,
};

use crate::detector::ErrorDetector;
use crate::framer::{CommandTracker, Framer, SentinelTag};
use crate::process::EngineProcess;
use crate::queue::OutputQueue;
use crate::reader::LineReader;

/// State touched only while a request is in progress.
#[derive(Debug)]
struct Inner {
    process: EngineProcess,
    readers: Vec<LineReader>,
    /// Stdout lines already attributed to earlier requests
    out_index: usize,
}

/// A session driving one engine process.
///
/// Commands are written to the engine's stdin followed by a sentinel
/// trailer; two line readers drain stdout and stderr into queues. Requests
/// are serialized: one `send`, `ask`, `read` or `flush` runs at a time.
#[derive(Debug)]
pub struct Session {
    /// Session identifier
    id: SessionId,

    /// Configuration the session was started with
    config: SessionConfig,

    /// Builds command trailers and recognises markers
    framer: Framer,

    /// Process, readers and cursor
    inner: Mutex<Inner>,

    /// Engine stdout lines
    stdout: Arc<OutputQueue>,

    /// Engine stderr lines
    stderr: Arc<OutputQueue>,

    /// Pending commands by sentinel tag
    tracker: Arc<CommandTracker>,

    /// Current session status
    status: Mutex<SessionStatus>,

    /// Terminal the engine is plotting to
    active_terminal: Mutex<Option<String>>,

    /// Framed commands written so far
    commands_sent: AtomicU64,

    /// Engine process id
    pid: u32,

    /// Spawn time
    started_at: DateTime<Utc>,
}

impl Session {
    /// Start an engine with default settings for `program`.
    pub fn new(program: impl Into<String>) -> Result<Self> {
        Self::spawn(SessionConfig::for_program(program))
    }

    /// Start an engine and run the start-up handshake.
    pub fn spawn(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let id = SessionId::new();
        info!(
            "Creating session: id={}, program='{}'",
            id, config.engine.program
        );

        let (mut process, stdout_pipe, stderr_pipe) = EngineProcess::spawn(&config.engine)?;
        let pid = process.pid();

        let framer = Framer::new(&config.framing);
        let stdout = Arc::new(OutputQueue::new());
        let stderr = Arc::new(OutputQueue::new());
        let tracker = Arc::new(CommandTracker::new());

        let readers = [
            LineReader::spawn(
                id,
                StreamKind::Stdout,
                stdout_pipe,
                Arc::clone(&stdout),
                Arc::clone(&tracker),
                framer.clone(),
            ),
            LineReader::spawn(
                id,
                StreamKind::Stderr,
                stderr_pipe,
                Arc::clone(&stderr),
                Arc::clone(&tracker),
                framer.clone(),
            ),
        ];
        let readers = match readers.into_iter().collect::<std::io::Result<Vec<_>>>() {
            Ok(readers) => readers,
            Err(e) => {
                error!("Failed to start line readers for session {}: {}", id, e);
                let _ = process.kill();
                return Err(Error::Io(e));
            }
        };

        let session = Self {
            id,
            framer,
            inner: Mutex::new(Inner {
                process,
                readers,
                out_index: 0,
            }),
            stdout,
            stderr,
            tracker,
            status: Mutex::new(SessionStatus::Starting),
            active_terminal: Mutex::new(config.engine.terminal.clone()),
            commands_sent: AtomicU64::new(0),
            pid,
            started_at: Utc::now(),
            config,
        };

        // Dropping the session on failure kills the engine
        session.handshake()?;
        session.set_status(SessionStatus::Ready);
        info!("Session created successfully: id={}, pid={}", session.id, pid);
        Ok(session)
    }

    /// Synchronize with the engine, discard start-up output and settle the
    /// active terminal.
    fn handshake(&self) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            let timeout = Some(self.config.timing.startup_timeout());
            self.send_framed(&mut inner, "", true, timeout)?;

            let banner = self.stdout.drain().len() + self.stderr.drain().len();
            if banner > 0 {
                debug!("Discarded {} start-up lines: id={}", banner, self.id);
            }
            inner.out_index = 0;
        }

        if let Some(terminal) = self.config.engine.terminal.clone() {
            return self.set_terminal(&terminal);
        }

        if self.config.framing.query_terminal {
            match self.ask("print GPVAL_TERM") {
                Ok(lines) => {
                    let terminal = lines.into_iter().next().map(|t| t.trim().to_string());
                    debug!("Engine terminal: id={}, {:?}", self.id, terminal);
                    *self.lock_terminal() = terminal;
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => warn!("Could not query engine terminal: id={}, {}", self.id, e),
            }
        }

        Ok(())
    }

    /// Get the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Get the configuration the session was started with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Engine process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the current session status.
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a command in flight; the handshake keeps `Starting`.
    fn begin_command(&self) {
        if self.status() == SessionStatus::Ready {
            self.set_status(SessionStatus::Busy);
        }
    }

    fn end_command(&self) {
        if self.status() == SessionStatus::Busy {
            self.set_status(SessionStatus::Ready);
        }
    }

    fn set_status(&self, status: SessionStatus) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *current == status {
            return;
        }
        // Closed is final
        if *current == SessionStatus::Closed {
            return;
        }
        debug!(
            "Session status changed: id={}, {:?} → {:?}",
            self.id, *current, status
        );
        *current = status;
    }

    /// Terminal the engine is currently plotting to.
    pub fn active_terminal(&self) -> Option<String> {
        self.lock_terminal().clone()
    }

    /// Check if the engine is still running.
    ///
    /// Does not wait for a request in progress: the session must be open and
    /// both engine streams still connected.
    pub fn is_alive(&self) -> bool {
        self.status().is_open() && self.tracker.streams_open()
    }

    /// Snapshot of the session for reporting.
    pub fn info(&self) -> SessionInfo {
        let status = self.status();
        SessionInfo {
            id: self.id,
            program: self.config.engine.program.clone(),
            pid: status.is_open().then_some(self.pid),
            status,
            started_at: self.started_at,
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            active_terminal: self.active_terminal(),
        }
    }

    /// Send instructions to the engine.
    ///
    /// With `block`, returns only once every stdout (and, with the stderr
    /// sentinel, stderr) line the instructions produced has been queued.
    /// Without it, returns right after the write; use [`Session::read`] to
    /// collect deferred output.
    pub fn send(&self, text: &str, block: bool) -> Result<()> {
        let mut inner = self.lock_inner();
        self.ensure_open()?;
        let timeout = self.config.timing.send_timeout();
        self.send_framed(&mut inner, text, block, timeout)
    }

    /// Send a command expected to answer, and return its stdout lines.
    ///
    /// Fails with [`Error::Engine`] when the engine reports an error for the
    /// command and with [`Error::EmptyResponse`] when it prints nothing.
    /// The session stays usable after either.
    pub fn ask(&self, command: &str) -> Result<Vec<String>> {
        let mut inner = self.lock_inner();
        self.ensure_open()?;
        let timeout = self.config.timing.send_timeout();

        // Earlier non-blocking commands finish first so their output stays
        // ahead of the cursor
        let process = &mut inner.process;
        let idle = self.tracker.wait_idle(
            timeout,
            self.config.timing.poll_interval(),
            &mut || process.is_alive(),
        );
        idle.map_err(|e| self.fail(e))?;

        let err_start = self.stderr.len();
        inner.out_index = self.stdout.len();

        self.send_framed(&mut inner, command, true, timeout)?;

        let err_end = self.stderr.len();
        let window = self.stderr.snapshot(err_start, err_end);
        let detector = ErrorDetector::new();

        if let Some(caret) = detector.find_caret(&window) {
            let lines = self.stderr.drain_from(err_start + detector.report_start(caret));
            let report = detector.report(lines);

            let discarded = self.stdout.drain().len() + self.stderr.drain().len();
            inner.out_index = 0;
            debug!(
                "Engine error: id={}, echoed={:?}, discarded {} lines",
                self.id, report.echoed, discarded
            );

            return Err(Error::Engine {
                command: command.to_string(),
                message: report.message,
                lines: report.lines,
            });
        }

        let response = self.stdout.drain_from(inner.out_index);
        if response.is_empty() {
            return Err(Error::EmptyResponse(command.to_string()));
        }
        Ok(response)
    }

    /// Ask and parse every response line as `T`.
    pub fn ask_as<T>(&self, command: &str) -> Result<Vec<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.ask(command)?
            .iter()
            .map(|line| {
                line.trim()
                    .parse::<T>()
                    .map_err(|e| Error::Parse(format!("'{}': {}", line.trim(), e)))
            })
            .collect()
    }

    /// Drain everything currently queued for `kind`.
    ///
    /// Waits up to `timeout` for a first line if the queue is empty; a zero
    /// timeout never blocks. An empty result is not an error. Works after
    /// the session is closed, for a final diagnostic drain.
    pub fn read(&self, kind: StreamKind, timeout: Duration) -> Vec<String> {
        let mut inner = self.lock_inner();
        match kind {
            StreamKind::Stdout => {
                inner.out_index = 0;
                self.stdout.wait_drain(timeout)
            }
            StreamKind::Stderr => self.stderr.wait_drain(timeout),
        }
    }

    /// Drain both queues: stdout lines first, then stderr lines.
    pub fn flush(&self) -> Vec<String> {
        let mut inner = self.lock_inner();
        inner.out_index = 0;
        let mut lines = self.stdout.wait_drain(self.config.timing.read_timeout());
        lines.extend(self.stderr.drain());
        lines
    }

    /// Change the terminal the engine plots to.
    pub fn set_terminal(&self, terminal: &str) -> Result<()> {
        let terminal = terminal.trim();
        if terminal.is_empty() || terminal.contains('\n') {
            return Err(Error::InvalidInput(format!(
                "terminal must be a single non-empty line, got {terminal:?}"
            )));
        }

        self.send(&format!("set terminal {terminal}"), true)?;
        *self.lock_terminal() = Some(terminal.to_string());
        info!("Active terminal set: id={}, {}", self.id, terminal);
        Ok(())
    }

    /// Ask the engine to exit, then kill it and return its last stdout lines.
    ///
    /// Calling it again after the session is closed returns an empty result.
    pub fn terminate(&self) -> Result<Vec<String>> {
        let mut inner = self.lock_inner();
        if self.status() == SessionStatus::Closed {
            // Reap an engine that died on its own
            if let Err(e) = inner.process.kill() {
                debug!("Engine already gone: id={}, {}", self.id, e);
            }
            return Ok(Vec::new());
        }

        info!("Terminating session: id={}", self.id);
        let exit = self.config.engine.exit_command.clone();
        if let Err(e) = self.send_framed(&mut inner, &exit, false, None) {
            debug!("Exit command not delivered: id={}, {}", self.id, e);
        }

        self.set_status(SessionStatus::Closed);
        inner.process.kill().map_err(|e| {
            error!("Failed to kill engine for session {}: {}", self.id, e);
            e
        })?;

        let lines = self.stdout.wait_drain(self.config.timing.read_timeout());

        // Readers end once the pipes close; one kept open by a grandchild
        // is left detached
        for reader in std::mem::take(&mut inner.readers) {
            if reader.is_finished() {
                reader.join();
            } else {
                debug!("Detaching {} reader: id={}", reader.kind(), self.id);
            }
        }

        info!(
            "Session terminated successfully: id={}, completed={}, lost={}",
            self.id,
            self.tracker.completed(),
            self.tracker.lost()
        );
        Ok(lines)
    }

    /// Write a framed payload and, for blocking sends, wait for its markers.
    fn send_framed(
        &self,
        inner: &mut Inner,
        text: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let tag = SentinelTag::generate();
        let payload = self.framer.frame(text, &tag);
        self.tracker
            .register(tag.clone(), text, block, self.framer.stderr_sentinel());

        debug!(
            "Sending command: id={}, tag={}, block={}, {} bytes",
            self.id,
            tag,
            block,
            text.len()
        );

        if let Err(e) = inner.process.write(&payload) {
            self.tracker.forget(&tag);
            return Err(self.fail(e));
        }
        self.commands_sent.fetch_add(1, Ordering::Relaxed);

        if !block {
            return Ok(());
        }

        self.begin_command();
        let process = &mut inner.process;
        let waited = self.tracker.wait_for(
            &tag,
            timeout,
            self.config.timing.poll_interval(),
            &mut || process.is_alive(),
        );

        match waited {
            Ok(()) => {
                self.end_command();
                Ok(())
            }
            Err(e) => {
                self.tracker.abandon(&tag);
                Err(self.fail(e))
            }
        }
    }

    /// Close the session on terminal errors; pass the error through.
    fn fail(&self, e: Error) -> Error {
        if e.is_terminal() {
            warn!("Session closed: id={}, {}", self.id, e);
            self.set_status(SessionStatus::Closed);
        } else {
            self.end_command();
        }
        e
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status().is_open() {
            Ok(())
        } else {
            Err(Error::SessionTerminated)
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_terminal(&self) -> MutexGuard<'_, Option<String>> {
        self.active_terminal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Failed to terminate session {} on drop: {}", self.id, e);
        }
    }
}
