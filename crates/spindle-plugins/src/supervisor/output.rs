//! Bounded capture of plugin stdout and stderr.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

const OUTPUT_TARGET: &str = "spindle_plugins::supervisor::output";

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl Stream {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
struct OutputState {
    lines: VecDeque<String>,
    capacity: usize,
    marker: Option<String>,
    marker_seen: bool,
}

/// Ring buffer of the most recent output lines of one plugin.
///
/// When built with a readiness marker, every pushed line is checked against
/// it so the marker is never missed because its line was already evicted.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    state: Arc<Mutex<OutputState>>,
}

impl OutputBuffer {
    /// Creates a buffer retaining at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Creates a buffer that also watches for `marker`.
    #[must_use]
    pub fn with_marker(capacity: usize, marker: impl Into<String>) -> Self {
        Self::build(capacity, Some(marker.into()))
    }

    fn build(capacity: usize, marker: Option<String>) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(Mutex::new(OutputState {
                lines: VecDeque::with_capacity(capacity),
                capacity,
                marker,
                marker_seen: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.lock();
        let hit = !state.marker_seen
            && state
                .marker
                .as_deref()
                .is_some_and(|marker| line.contains(marker));
        if hit {
            state.marker_seen = true;
        }
        if state.lines.len() == state.capacity {
            state.lines.pop_front();
        }
        state.lines.push_back(line);
    }

    /// Returns `true` once a line containing the readiness marker arrived.
    #[must_use]
    pub fn marker_seen(&self) -> bool {
        self.lock().marker_seen
    }

    /// Snapshot of the retained lines, oldest first.
    #[must_use]
    pub fn tail(&self) -> OutputTail {
        OutputTail(self.lock().lines.iter().cloned().collect())
    }
}

/// Longest line kept from plugin output; the rest of the line is discarded.
pub(crate) const MAX_LINE_BYTES: usize = 8 * 1024;

/// Spawns a task that copies `reader` line by line into `buffer`.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the
/// capture, and the pipe is read to end of stream so the plugin never
/// blocks on a full pipe or dies writing to a closed one.
pub(crate) fn capture<R>(
    plugin: &str,
    stream: Stream,
    reader: R,
    buffer: OutputBuffer,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let plugin = plugin.to_owned();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            match read_line_capped(&mut reader, &mut raw).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => {
                    debug!(
                        target: OUTPUT_TARGET,
                        plugin = plugin.as_str(),
                        stream = stream.as_str(),
                        %error,
                        "plugin output read failed"
                    );
                    break;
                }
            }
            let line = decode_line(&raw);
            debug!(
                target: OUTPUT_TARGET,
                plugin = plugin.as_str(),
                stream = stream.as_str(),
                line = line.as_str(),
                "plugin output"
            );
            buffer.push(line);
        }
    })
}

/// Reads one line into `line`, keeping at most [`MAX_LINE_BYTES`] of it.
///
/// Returns `false` at end of stream when nothing was read.
pub(crate) async fn read_line_capped<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut read_any = false;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(read_any);
        }
        read_any = true;
        let (taken, complete) = chunk
            .iter()
            .position(|byte| *byte == b'\n')
            .map_or_else(|| (chunk.len(), false), |end| (end + 1, true));
        let room = MAX_LINE_BYTES.saturating_sub(line.len());
        line.extend(chunk.iter().take(taken.min(room)));
        reader.consume(taken);
        if complete {
            return Ok(true);
        }
    }
}

/// Decodes a raw line lossily and strips its terminator.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let trimmed = raw.strip_suffix(b"\n").unwrap_or(raw);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// Waits up to `limit` for capture tasks to reach end of stream.
pub(crate) async fn drain(readers: &mut Vec<JoinHandle<()>>, limit: Duration) {
    let pending = std::mem::take(readers);
    let joined = tokio::time::timeout(limit, async {
        for reader in pending {
            drop(reader.await);
        }
    })
    .await;
    if joined.is_err() {
        debug!(target: OUTPUT_TARGET, "output readers still open after drain limit");
    }
}

/// Final output lines attached to a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputTail(Vec<String>);

impl OutputTail {
    /// Wraps captured lines.
    #[must_use]
    pub const fn from_lines(lines: Vec<String>) -> Self {
        Self(lines)
    }

    /// Captured lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.0
    }

    /// Returns `true` when nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` when any line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.0.iter().any(|line| line.contains(needle))
    }
}

impl fmt::Display for OutputTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        f.write_str("; last output:")?;
        for line in &self.0 {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

/// How a plugin process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitSummary {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitSummary {
    /// Summary for a known exit code, or an unknown status.
    #[must_use]
    pub const fn from_code(code: Option<i32>) -> Self {
        Self { code, signal: None }
    }

    /// Exit code, when the process exited normally.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        self.code
    }

    /// Terminating signal, when the process was killed.
    #[must_use]
    pub const fn signal(self) -> Option<i32> {
        self.signal
    }
}

impl From<ExitStatus> for ExitSummary {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}
