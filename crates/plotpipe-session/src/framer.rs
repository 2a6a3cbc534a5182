//! Command framing: sentinel tags, trailer instructions and the correlation
//! table that tells the session when a command's output has ended.
//!
//! Every command is written as the caller's text followed by a trailer that
//! makes the engine print `<prefix>-<tag>`. Line readers recognise those
//! marker lines, record them here and wake the waiting caller. Marker lines
//! never reach the output queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use plotpipe_core::{Error, FramingSettings, Result, StreamKind};

/// How long a dead engine gets to flush its pipes before waits give up.
const EXIT_GRACE: Duration = Duration::from_millis(500);

static TAG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique identifier embedded in a command's end-of-output marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SentinelTag(String);

impl SentinelTag {
    /// Generate a fresh tag from the wall clock and a process-wide counter.
    ///
    /// The counter alone keeps tags unique within this process; the
    /// timestamp separates tags from earlier runs that might still be echoed
    /// by a reused engine.
    pub fn generate() -> Self {
        let seq = TAG_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self(format!("{nanos:x}-{seq:x}"))
    }

    /// Tag text as it appears in the marker.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SentinelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds framed command payloads and recognises marker lines.
#[derive(Debug, Clone)]
pub struct Framer {
    prefix: String,
    stderr_sentinel: bool,
}

impl Framer {
    /// Create a framer from configuration.
    pub fn new(settings: &FramingSettings) -> Self {
        Self {
            prefix: settings.marker_prefix.clone(),
            stderr_sentinel: settings.stderr_sentinel,
        }
    }

    /// Whether the trailer also marks the end of stderr output.
    pub fn stderr_sentinel(&self) -> bool {
        self.stderr_sentinel
    }

    /// Marker line the engine prints for `tag`.
    pub fn marker(&self, tag: &SentinelTag) -> String {
        format!("{}-{}", self.prefix, tag)
    }

    /// Full payload for `text`: the caller's instructions, then the trailer.
    ///
    /// With the stderr sentinel the print channel is first reset to stderr
    /// to mark that stream, then redirected to the controlling pipe for the
    /// stdout marker. The engine is left printing to stdout either way.
    pub fn frame(&self, text: &str, tag: &SentinelTag) -> String {
        let marker = self.marker(tag);
        let text = text.trim_end_matches(['\n', '\r']);

        let mut payload = String::with_capacity(text.len() + 2 * marker.len() + 64);
        if !text.is_empty() {
            payload.push_str(text);
            payload.push('\n');
        }
        if self.stderr_sentinel {
            payload.push_str("set print\n");
            payload.push_str(&format!("print \"{marker}\"\n"));
        }
        payload.push_str("set print \"-\"\n");
        payload.push_str(&format!("print \"{marker}\"\n"));
        payload
    }

    /// Extract the tag if `line` is a marker line.
    pub fn parse_marker(&self, line: &str) -> Option<SentinelTag> {
        let tag = line
            .trim_end()
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?;
        if tag.is_empty() || tag.contains(char::is_whitespace) {
            return None;
        }
        Some(SentinelTag(tag.to_string()))
    }
}

/// A command whose markers have not all been seen yet.
#[derive(Debug)]
struct PendingCommand {
    /// Write order; the engine answers commands in this order
    seq: u64,
    /// First line of the command, for logs
    preview: String,
    awaiting_stdout: bool,
    awaiting_stderr: bool,
    /// A caller is waiting and will remove the entry itself
    blocking: bool,
    issued_at: Instant,
}

impl PendingCommand {
    fn is_complete(&self) -> bool {
        !self.awaiting_stdout && !self.awaiting_stderr
    }

    fn awaiting(&mut self, stream: StreamKind) -> &mut bool {
        match stream {
            StreamKind::Stdout => &mut self.awaiting_stdout,
            StreamKind::Stderr => &mut self.awaiting_stderr,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashMap<SentinelTag, PendingCommand>,
    stdout_closed: bool,
    stderr_closed: bool,
    next_seq: u64,
    completed: u64,
    lost: u64,
}

/// Correlation table from sentinel tag to pending command.
///
/// Line readers call [`CommandTracker::complete`] when a marker arrives; the
/// session blocks in [`CommandTracker::wait_for`] on a condition variable.
#[derive(Debug, Default)]
pub struct CommandTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl CommandTracker {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a command before its payload is written.
    pub fn register(&self, tag: SentinelTag, text: &str, blocking: bool, expect_stderr: bool) {
        let preview = text.lines().next().unwrap_or_default().to_string();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(
            tag,
            PendingCommand {
                seq,
                preview,
                awaiting_stdout: true,
                awaiting_stderr: expect_stderr,
                blocking,
                issued_at: Instant::now(),
            },
        );
    }

    /// Record that `stream` delivered the marker for `tag`.
    ///
    /// Markers on one stream arrive in write order, so older commands still
    /// waiting on that stream lost their marker (the engine consumed the
    /// trailer as input) and are released too.
    pub fn complete(&self, tag: &SentinelTag, stream: StreamKind) {
        let mut state = self.lock();
        let Some(command) = state.pending.get_mut(tag) else {
            warn!("Marker for unknown command on {}: {}", stream, tag);
            return;
        };

        *command.awaiting(stream) = false;
        let seq = command.seq;

        let mut released = Vec::new();
        for (older_tag, older) in state.pending.iter_mut() {
            if older.seq < seq && *older.awaiting(stream) {
                warn!(
                    "Marker lost on {}: tag={}, '{}', superseded by {}",
                    stream, older_tag, older.preview, tag
                );
                *older.awaiting(stream) = false;
                if older.is_complete() && !older.blocking {
                    released.push(older_tag.clone());
                }
            }
        }
        state.lost += released.len() as u64;
        for older_tag in &released {
            state.pending.remove(older_tag);
        }

        let finished = match state.pending.get(tag) {
            Some(command) if command.is_complete() => {
                debug!(
                    "Command completed: tag={}, '{}', {}ms",
                    tag,
                    command.preview,
                    command.issued_at.elapsed().as_millis()
                );
                Some(command.blocking)
            }
            _ => None,
        };
        if let Some(blocking) = finished {
            state.completed += 1;
            if !blocking {
                state.pending.remove(tag);
            }
        }

        drop(state);
        self.changed.notify_all();
    }

    /// Record that a reader reached end-of-stream.
    pub fn stream_closed(&self, stream: StreamKind) {
        let mut state = self.lock();
        match stream {
            StreamKind::Stdout => state.stdout_closed = true,
            StreamKind::Stderr => state.stderr_closed = true,
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Drop a command whose payload never reached the engine.
    pub fn forget(&self, tag: &SentinelTag) {
        self.lock().pending.remove(tag);
    }

    /// Stop waiting for `tag`; its markers are still consumed when they come.
    pub fn abandon(&self, tag: &SentinelTag) {
        let mut state = self.lock();
        let complete = match state.pending.get_mut(tag) {
            Some(command) => {
                command.blocking = false;
                command.is_complete()
            }
            None => false,
        };
        if complete {
            state.pending.remove(tag);
        }
    }

    /// Number of commands still waiting for a marker.
    pub fn outstanding(&self) -> usize {
        self.lock()
            .pending
            .values()
            .filter(|command| !command.is_complete())
            .count()
    }

    /// Number of commands completed since creation.
    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    /// Number of commands released because their marker never came.
    pub fn lost(&self) -> u64 {
        self.lock().lost
    }

    /// Whether both engine streams are still open.
    pub fn streams_open(&self) -> bool {
        let state = self.lock();
        !state.stdout_closed && !state.stderr_closed
    }

    /// Block until every marker for `tag` has arrived.
    ///
    /// `alive` is polled every `poll` to notice an engine that died without
    /// closing its pipes. Fails with [`Error::ProcessExited`] when the engine
    /// is gone and [`Error::WaitTimeout`] when `timeout` runs out.
    pub fn wait_for(
        &self,
        tag: &SentinelTag,
        timeout: Option<Duration>,
        poll: Duration,
        alive: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        self.wait_until(timeout, poll, alive, |state| {
            match state.pending.get(tag).map(PendingCommand::is_complete) {
                Some(true) => {
                    state.pending.remove(tag);
                    true
                }
                Some(false) => false,
                // Already collected, nothing left to wait for
                None => true,
            }
        })
    }

    /// Block until no command is waiting for a marker.
    pub fn wait_idle(
        &self,
        timeout: Option<Duration>,
        poll: Duration,
        alive: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        self.wait_until(timeout, poll, alive, |state| {
            state.pending.values().all(PendingCommand::is_complete)
        })
    }

    fn wait_until<F>(
        &self,
        timeout: Option<Duration>,
        poll: Duration,
        alive: &mut dyn FnMut() -> bool,
        mut done: F,
    ) -> Result<()>
    where
        F: FnMut(&mut TrackerState) -> bool,
    {
        let start = Instant::now();
        let mut dead_since: Option<Instant> = None;
        let mut state = self.lock();

        loop {
            if done(&mut state) {
                return Ok(());
            }

            if state.stdout_closed || state.stderr_closed {
                return Err(Error::ProcessExited);
            }

            let elapsed = start.elapsed();
            let slice = match timeout {
                Some(limit) if elapsed >= limit => {
                    return Err(Error::WaitTimeout(limit.as_millis() as u64));
                }
                Some(limit) => poll.min(limit - elapsed),
                None => poll,
            };

            let (guard, _) = self
                .changed
                .wait_timeout(state, slice)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;

            // Pipes may still hold the final lines after the child exits
            match dead_since {
                Some(since) if since.elapsed() >= EXIT_GRACE => {
                    if !done(&mut state) {
                        return Err(Error::ProcessExited);
                    }
                    return Ok(());
                }
                Some(_) => {}
                None => {
                    if !alive() {
                        debug!("Engine exited while waiting, draining pipes");
                        dead_since = Some(Instant::now());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn framer() -> Framer {
        Framer::new(&FramingSettings::default())
    }

    #[test]
    fn test_tags_are_unique() {
        let tags: std::collections::HashSet<_> =
            (0..1000).map(|_| SentinelTag::generate()).collect();
        assert_eq!(tags.len(), 1000);
    }

    #[test]
    fn test_marker_format() {
        let tag = SentinelTag("abc123".to_string());
        assert_eq!(framer().marker(&tag), "COMMAND_SEQUENCE_ENDED-abc123");
    }

    #[test]
    fn test_frame_with_stderr_sentinel() {
        let tag = SentinelTag("t1".to_string());
        let payload = framer().frame("plot sin(x)\n", &tag);
        assert_eq!(
            payload,
            "plot sin(x)\n\
             set print\n\
             print \"COMMAND_SEQUENCE_ENDED-t1\"\n\
             set print \"-\"\n\
             print \"COMMAND_SEQUENCE_ENDED-t1\"\n"
        );
    }

    #[test]
    fn test_frame_stdout_only() {
        let settings = FramingSettings {
            stderr_sentinel: false,
            ..FramingSettings::default()
        };
        let tag = SentinelTag("t2".to_string());
        let payload = Framer::new(&settings).frame("a=1\nb=2", &tag);
        assert_eq!(
            payload,
            "a=1\nb=2\nset print \"-\"\nprint \"COMMAND_SEQUENCE_ENDED-t2\"\n"
        );
    }

    #[test]
    fn test_frame_empty_text_is_trailer_only() {
        let tag = SentinelTag("t3".to_string());
        let payload = framer().frame("", &tag);
        assert!(payload.starts_with("set print\n"));
    }

    #[test]
    fn test_parse_marker() {
        let framer = framer();
        let tag = SentinelTag::generate();
        let line = framer.marker(&tag);

        assert_eq!(framer.parse_marker(&line), Some(tag.clone()));
        assert_eq!(framer.parse_marker(&format!("{line}\r")), Some(tag));
        assert_eq!(framer.parse_marker("COMMAND_SEQUENCE_ENDED-"), None);
        assert_eq!(framer.parse_marker("COMMAND_SEQUENCE_ENDEDx-1"), None);
        assert_eq!(framer.parse_marker("2"), None);
        assert_eq!(framer.parse_marker(" COMMAND_SEQUENCE_ENDED-1"), None);
    }

    #[test]
    fn test_complete_stdout_only() {
        let tracker = CommandTracker::new();
        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "print 1", false, false);
        assert_eq!(tracker.outstanding(), 1);

        tracker.complete(&tag, StreamKind::Stdout);
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.completed(), 1);
    }

    #[test]
    fn test_complete_needs_both_streams() {
        let tracker = CommandTracker::new();
        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "print 1", false, true);

        tracker.complete(&tag, StreamKind::Stdout);
        assert_eq!(tracker.outstanding(), 1);
        tracker.complete(&tag, StreamKind::Stderr);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_later_marker_releases_lost_command() {
        let tracker = CommandTracker::new();
        let swallowed = SentinelTag::generate();
        let next = SentinelTag::generate();
        tracker.register(swallowed.clone(), "plot '-'", false, true);
        tracker.register(next.clone(), "1 2\ne", false, true);
        assert_eq!(tracker.outstanding(), 2);

        tracker.complete(&next, StreamKind::Stderr);
        assert_eq!(tracker.outstanding(), 2);
        tracker.complete(&next, StreamKind::Stdout);
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.completed(), 1);
        assert_eq!(tracker.lost(), 1);

        assert!(tracker
            .wait_idle(Some(Duration::ZERO), Duration::from_millis(10), &mut || true)
            .is_ok());

        // The lost marker showing up late is only logged
        tracker.complete(&swallowed, StreamKind::Stdout);
        assert_eq!(tracker.completed(), 1);
    }

    #[test]
    fn test_earlier_marker_does_not_release_later_command() {
        let tracker = CommandTracker::new();
        let first = SentinelTag::generate();
        let second = SentinelTag::generate();
        tracker.register(first.clone(), "print 1", false, false);
        tracker.register(second.clone(), "print 2", false, false);

        tracker.complete(&first, StreamKind::Stdout);
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn test_streams_open() {
        let tracker = CommandTracker::new();
        assert!(tracker.streams_open());
        tracker.stream_closed(StreamKind::Stderr);
        assert!(!tracker.streams_open());
    }

    #[test]
    fn test_unknown_marker_is_ignored() {
        let tracker = CommandTracker::new();
        tracker.complete(&SentinelTag::generate(), StreamKind::Stdout);
        assert_eq!(tracker.completed(), 0);
    }

    #[test]
    fn test_wait_for_wakes_on_completion() {
        let tracker = Arc::new(CommandTracker::new());
        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "fit f(x) 'data' via a", true, false);

        let reader = {
            let tracker = Arc::clone(&tracker);
            let tag = tag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                tracker.complete(&tag, StreamKind::Stdout);
            })
        };

        let result = tracker.wait_for(
            &tag,
            Some(Duration::from_secs(5)),
            Duration::from_millis(10),
            &mut || true,
        );
        reader.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_wait_for_timeout() {
        let tracker = CommandTracker::new();
        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "pause -1", true, false);

        let result = tracker.wait_for(
            &tag,
            Some(Duration::from_millis(100)),
            Duration::from_millis(10),
            &mut || true,
        );
        assert!(matches!(result, Err(Error::WaitTimeout(100))));

        // A late marker after abandoning cleans the entry up
        tracker.abandon(&tag);
        tracker.complete(&tag, StreamKind::Stdout);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_wait_for_fails_on_closed_stream() {
        let tracker = CommandTracker::new();
        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "print 1", true, false);
        tracker.stream_closed(StreamKind::Stdout);

        let result = tracker.wait_for(&tag, None, Duration::from_millis(10), &mut || true);
        assert!(matches!(result, Err(Error::ProcessExited)));
    }

    #[test]
    fn test_wait_for_fails_when_engine_dies() {
        let tracker = CommandTracker::new();
        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "print 1", true, false);

        let start = Instant::now();
        let result = tracker.wait_for(&tag, None, Duration::from_millis(10), &mut || false);
        assert!(matches!(result, Err(Error::ProcessExited)));
        assert!(start.elapsed() >= EXIT_GRACE);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_idle() {
        let tracker = CommandTracker::new();
        assert!(tracker
            .wait_idle(Some(Duration::ZERO), Duration::from_millis(10), &mut || true)
            .is_ok());

        let tag = SentinelTag::generate();
        tracker.register(tag.clone(), "exit", false, false);
        let result = tracker.wait_idle(
            Some(Duration::from_millis(50)),
            Duration::from_millis(10),
            &mut || true,
        );
        assert!(matches!(result, Err(Error::WaitTimeout(_))));

        tracker.complete(&tag, StreamKind::Stdout);
        assert!(tracker
            .wait_idle(Some(Duration::ZERO), Duration::from_millis(10), &mut || true)
            .is_ok());
    }
}
