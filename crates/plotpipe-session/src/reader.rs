//! Background line readers, one per engine output stream.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use plotpipe_core::{SessionId, StreamKind};

use crate::framer::{CommandTracker, Framer};
use crate::queue::OutputQueue;

/// A thread draining one engine stream into an [`OutputQueue`].
///
/// Marker lines are routed to the [`CommandTracker`] instead of the queue.
/// The thread ends at end-of-stream or on the first read error, closes the
/// queue and reports the stream as closed; it never panics past its own
/// boundary.
#[derive(Debug)]
pub struct LineReader {
    kind: StreamKind,
    handle: JoinHandle<u64>,
}

impl LineReader {
    /// Start reading `stream` on a dedicated thread.
    pub fn spawn<R>(
        session_id: SessionId,
        kind: StreamKind,
        stream: R,
        queue: Arc<OutputQueue>,
        tracker: Arc<CommandTracker>,
        framer: Framer,
    ) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("plotpipe-{kind}"))
            .spawn(move || {
                let lines = read_lines(stream, kind, &queue, &tracker, &framer);
                queue.close();
                tracker.stream_closed(kind);
                debug!(
                    "Line reader finished: session={}, stream={}, {} lines",
                    session_id, kind, lines
                );
                lines
            })?;

        Ok(Self { kind, handle })
    }

    /// Stream this reader drains.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and return the number of lines it queued.
    pub fn join(self) -> Option<u64> {
        self.handle.join().ok()
    }
}

fn read_lines<R: Read>(
    stream: R,
    kind: StreamKind,
    queue: &OutputQueue,
    tracker: &CommandTracker,
    framer: &Framer,
) -> u64 {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    let mut count = 0;

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error on engine {}: {}", kind, e);
                break;
            }
        }

        while matches!(buffer.last(), Some(&(b'\n' | b'\r'))) {
            buffer.pop();
        }
        let line = String::from_utf8_lossy(&buffer).into_owned();

        if let Some(tag) = framer.parse_marker(&line) {
            tracker.complete(&tag, kind);
            continue;
        }

        trace!("engine {}: {}", kind, line);
        queue.push(line);
        count += 1;
    }

    count
}
