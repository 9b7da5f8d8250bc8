//! Incremental reader for the JSON-lines override log.
//!
//! The log is append-only. Each read picks up from the last byte offset and
//! returns only complete lines; a trailing partial line is held back until
//! its newline arrives. If the file shrinks (truncated or rotated), reading
//! restarts from the beginning. Replaying old events is harmless because the
//! store ignores writes that are not newer than what it already holds.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use fabric_state::OverrideEvent;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::{MergerError, MergerResult};

/// Events parsed from one read.
#[derive(Debug, Default)]
pub struct LogBatch {
    pub events: Vec<OverrideEvent>,
    /// Lines that failed to parse.
    pub malformed: usize,
    /// The file shrank since the previous read.
    pub rewound: bool,
}

#[derive(Debug)]
pub struct OverrideLog {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl OverrideLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far, including any held-back partial line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever was appended since the last call.
    ///
    /// A missing file is treated as empty. Cancel-safe: nothing is recorded
    /// until the read completes.
    pub async fn read_new(&mut self) -> MergerResult<LogBatch> {
        let io = |source| MergerError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogBatch::default()),
            Err(e) => return Err(io(e)),
        };
        let len = file.metadata().await.map_err(io)?.len();

        let rewound = len < self.offset;
        let start = if rewound { 0 } else { self.offset };
        if len == start {
            return Ok(LogBatch::default());
        }
        file.seek(SeekFrom::Start(start)).await.map_err(io)?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.take(len - start)
            .read_to_end(&mut buf)
            .await
            .map_err(io)?;

        if rewound {
            warn!(path = %self.path.display(), "override log shrank, replaying from start");
            self.partial.clear();
        }
        self.offset = start + buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let mut batch = self.drain_lines();
        batch.rewound = rewound;
        Ok(batch)
    }

    fn drain_lines(&mut self) -> LogBatch {
        let mut batch = LogBatch::default();
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return batch;
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
        for line in String::from_utf8_lossy(&complete).lines() {
            match parse_line(line) {
                None => {}
                Some(Ok(event)) => batch.events.push(event),
                Some(Err(e)) => {
                    warn!(path = %self.path.display(), error = %e, "skipping malformed override");
                    batch.malformed += 1;
                }
            }
        }
        debug!(
            events = batch.events.len(),
            malformed = batch.malformed,
            offset = self.offset,
            "override log read"
        );
        batch
    }
}

/// Parse one log line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<Result<OverrideEvent, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}
