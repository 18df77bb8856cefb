//! Change event sources feeding the bronze ingestor.
//!
//! A source hands out raw change payloads in order together with an
//! opaque numeric position. The ingestor commits the position only after
//! the batch is durable in bronze, and re-seeks to the committed position
//! on the next run, so delivery is at-least-once.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use medallion_types::error::StageError;

const EOF_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One undecoded change as delivered by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Position of this change in the source.
    pub position: u64,
    pub payload: String,
    /// Set when the source could already tell the change is unusable. The
    /// ingestor quarantines it without decoding.
    pub rejected: Option<StageError>,
}

impl RawChange {
    pub fn new(position: u64, payload: impl Into<String>) -> Self {
        Self {
            position,
            payload: payload.into(),
            rejected: None,
        }
    }

    pub fn rejected(position: u64, payload: impl Into<String>, err: StageError) -> Self {
        Self {
            position,
            payload: payload.into(),
            rejected: Some(err),
        }
    }
}

/// A bounded pull from a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatch {
    pub changes: Vec<RawChange>,
    /// Position to resume from once every change of the batch is durable.
    pub next_position: u64,
}

impl SourceBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Ordered, at-least-once stream of raw changes.
pub trait ChangeSource: Send {
    /// Name the committed position is stored under.
    fn name(&self) -> &str;

    /// Resume reading at `position`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the source can't be repositioned.
    fn seek(&mut self, position: u64) -> Result<(), StageError>;

    /// Pull at most `max_records` changes, waiting no longer than
    /// `max_wait` for the first one.
    ///
    /// # Errors
    ///
    /// Returns a transient error on read failure.
    fn poll_batch(
        &mut self,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<SourceBatch, StageError>;
}

// ---------------------------------------------------------------------------
// JSON Lines file
// ---------------------------------------------------------------------------

/// Reads one raw change per line from a file. The position is the number
/// of lines consumed, blank lines included.
///
/// A line counts only once its `\n` is written: a trailing fragment is
/// held back until the producer finishes it. Lines that are not UTF-8 are
/// handed out as rejected changes so the batch can go on.
pub struct JsonlChangeSource {
    name: String,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    position: u64,
    /// Bytes of an unterminated last line seen at end of file.
    partial: Vec<u8>,
}

impl JsonlChangeSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            reader: None,
            position: 0,
            partial: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_error(&self, err: &std::io::Error) -> StageError {
        StageError::transient_io(
            "SOURCE_READ",
            format!("failed to read {}: {err}", self.path.display()),
        )
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>, StageError> {
        if self.reader.is_none() {
            let file = File::open(&self.path).map_err(|e| self.read_error(&e))?;
            let mut reader = BufReader::new(file);
            let mut skipped = 0u64;
            let mut line = Vec::new();
            while skipped < self.position {
                line.clear();
                let n = reader
                    .read_until(b'\n', &mut line)
                    .map_err(|e| self.read_error(&e))?;
                if n == 0 {
                    break;
                }
                if line.last() != Some(&b'\n') {
                    self.partial = std::mem::take(&mut line);
                    break;
                }
                skipped += 1;
            }
            self.position = skipped;
            self.reader = Some(reader);
        }
        self.reader
            .as_mut()
            .ok_or_else(|| StageError::internal("SOURCE_STATE", "reader not initialised"))
    }

    /// Next complete line without its terminator, or `None` when nothing
    /// complete is available yet.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, StageError> {
        let mut line = std::mem::take(&mut self.partial);
        let read = self.reader()?.read_until(b'\n', &mut line);
        if let Err(e) = read {
            self.partial = line;
            return Err(self.read_error(&e));
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            Ok(Some(line))
        } else {
            self.partial = line;
            Ok(None)
        }
    }

    fn to_change(position: u64, line: Vec<u8>) -> Option<RawChange> {
        match String::from_utf8(line) {
            Ok(text) => {
                let payload = text.trim();
                (!payload.is_empty()).then(|| RawChange::new(position, payload))
            }
            Err(e) => {
                let reason = e.utf8_error().to_string();
                let payload = String::from_utf8_lossy(e.as_bytes()).trim().to_string();
                Some(RawChange::rejected(
                    position,
                    payload,
                    StageError::malformed_event(
                        "INVALID_UTF8",
                        format!("line {position} is not valid UTF-8: {reason}"),
                    ),
                ))
            }
        }
    }
}

impl ChangeSource for JsonlChangeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, position: u64) -> Result<(), StageError> {
        self.reader = None;
        self.partial.clear();
        self.position = position;
        self.reader()?;
        Ok(())
    }

    fn poll_batch(
        &mut self,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<SourceBatch, StageError> {
        let deadline = Instant::now() + max_wait;
        let mut changes = Vec::new();

        while changes.len() < max_records {
            match self.next_line()? {
                Some(line) => {
                    let position = self.position;
                    self.position += 1;
                    if let Some(change) = Self::to_change(position, line) {
                        changes.push(change);
                    }
                }
                None if changes.is_empty() && Instant::now() < deadline => {
                    std::thread::sleep(EOF_POLL_INTERVAL.min(deadline - Instant::now()));
                }
                None => break,
            }
        }

        Ok(SourceBatch {
            changes,
            next_position: self.position,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Growable in-process source. Clones share the same buffer, so a test can
/// keep one handle to [`push`](Self::push) while the pipeline owns another.
#[derive(Clone)]
pub struct MemoryChangeSource {
    name: String,
    buffer: Arc<Mutex<Vec<String>>>,
    position: u64,
}

impl MemoryChangeSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            position: 0,
        }
    }

    pub fn with_payloads<I, S>(name: impl Into<String>, payloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Self::new(name);
        source.extend(payloads);
        source
    }

    /// Append one raw payload.
    pub fn push(&self, payload: impl Into<String>) {
        self.extend([payload]);
    }

    pub fn extend<I, S>(&self, payloads: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.extend(payloads.into_iter().map(Into::into));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeSource for MemoryChangeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, position: u64) -> Result<(), StageError> {
        self.position = position;
        Ok(())
    }

    fn poll_batch(
        &mut self,
        max_records: usize,
        _max_wait: Duration,
    ) -> Result<SourceBatch, StageError> {
        let buffer = self
            .buffer
            .lock()
            .map_err(|_| StageError::internal("SOURCE_STATE", "memory source lock poisoned"))?;
        let start = usize::try_from(self.position).unwrap_or(usize::MAX);
        let changes: Vec<RawChange> = buffer
            .iter()
            .enumerate()
            .skip(start)
            .take(max_records)
            .map(|(i, payload)| RawChange::new(i as u64, payload.clone()))
            .collect();
        drop(buffer);

        if let Some(last) = changes.last() {
            self.position = last.position + 1;
        }
        Ok(SourceBatch {
            changes,
            next_position: self.position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("stream.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[test]
    fn jsonl_reads_in_bounded_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), &["a", "b", "c"]);
        let mut source = JsonlChangeSource::new("s", path);

        let first = source.poll_batch(2, Duration::ZERO).unwrap();
        assert_eq!(first.changes.len(), 2);
        assert_eq!(first.changes[0].payload, "a");
        assert_eq!(first.next_position, 2);

        let second = source.poll_batch(2, Duration::ZERO).unwrap();
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].position, 2);
        assert_eq!(second.next_position, 3);

        assert!(source.poll_batch(2, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn jsonl_skips_blank_lines_but_counts_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), &["a", "", "  ", "b"]);
        let mut source = JsonlChangeSource::new("s", path);

        let batch = source.poll_batch(10, Duration::ZERO).unwrap();
        let payloads: Vec<_> = batch.changes.iter().map(|c| c.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b"]);
        assert_eq!(batch.changes[1].position, 3);
        assert_eq!(batch.next_position, 4);
    }

    #[test]
    fn jsonl_seek_resumes_after_committed_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), &["a", "b", "c"]);
        let mut source = JsonlChangeSource::new("s", path);
        source.poll_batch(3, Duration::ZERO).unwrap();

        source.seek(1).unwrap();
        let batch = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(batch.changes[0].payload, "b");
        assert_eq!(batch.next_position, 3);
    }

    #[test]
    fn jsonl_sees_lines_appended_after_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), &["a"]);
        let mut source = JsonlChangeSource::new("s", &path);
        assert_eq!(source.poll_batch(10, Duration::ZERO).unwrap().changes.len(), 1);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "b").unwrap();
        let batch = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(batch.changes[0].payload, "b");
    }

    #[test]
    fn jsonl_rejects_non_utf8_line_and_keeps_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.jsonl");
        std::fs::write(&path, b"a\n\xff\xfe{\"bad\":1}\nc\n").unwrap();
        let mut source = JsonlChangeSource::new("s", &path);

        let batch = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(batch.changes.len(), 3);
        assert_eq!(batch.next_position, 3);
        assert!(batch.changes[0].rejected.is_none());
        assert!(batch.changes[2].rejected.is_none());
        assert_eq!(batch.changes[2].payload, "c");

        let bad = &batch.changes[1];
        assert_eq!(bad.position, 1);
        assert!(bad.payload.ends_with("{\"bad\":1}"));
        let err = bad.rejected.as_ref().unwrap();
        assert_eq!(err.code, "INVALID_UTF8");
        assert!(!err.retryable);
    }

    #[test]
    fn jsonl_resumes_past_non_utf8_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.jsonl");
        std::fs::write(&path, b"\xff\n\xfe\nc\n").unwrap();
        let mut source = JsonlChangeSource::new("s", &path);

        source.seek(2).unwrap();
        let batch = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(batch.changes, vec![RawChange::new(2, "c")]);
    }

    #[test]
    fn jsonl_holds_back_unterminated_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.jsonl");
        let event = r#"{"event_id":"e1","entity_type":"orders","operation":"INSERT"}"#;
        let (head, tail) = event.split_at(20);
        std::fs::write(&path, format!("a\n{head}")).unwrap();
        let mut source = JsonlChangeSource::new("s", &path);

        let first = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(first.changes, vec![RawChange::new(0, "a")]);
        assert_eq!(first.next_position, 1);
        assert!(source.poll_batch(10, Duration::ZERO).unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{tail}").unwrap();
        let second = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(second.changes, vec![RawChange::new(1, event)]);
        assert_eq!(second.next_position, 2);
    }

    #[test]
    fn jsonl_reopen_does_not_count_unterminated_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.jsonl");
        std::fs::write(&path, "a\nb\npartial").unwrap();
        let mut source = JsonlChangeSource::new("s", &path);

        source.seek(5).unwrap();
        assert!(source.poll_batch(10, Duration::ZERO).unwrap().is_empty());
        assert_eq!(source.poll_batch(10, Duration::ZERO).unwrap().next_position, 2);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "-line").unwrap();
        let batch = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(batch.changes, vec![RawChange::new(2, "partial-line")]);
    }

    #[test]
    fn jsonl_missing_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = JsonlChangeSource::new("s", dir.path().join("absent.jsonl"));
        let err = source.poll_batch(1, Duration::ZERO).unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.code, "SOURCE_READ");
    }

    #[test]
    fn memory_source_shares_buffer_between_clones() {
        let handle = MemoryChangeSource::new("mem");
        let mut source = handle.clone();
        handle.push("x");
        handle.push("y");

        let batch = source.poll_batch(1, Duration::ZERO).unwrap();
        assert_eq!(batch.changes[0].payload, "x");
        assert_eq!(batch.next_position, 1);

        source.seek(0).unwrap();
        let replay = source.poll_batch(10, Duration::ZERO).unwrap();
        assert_eq!(replay.changes.len(), 2);
        assert_eq!(replay.next_position, 2);
    }
}
