//! JSON-lines container logs.
//!
//! Each line of container output becomes one JSON object:
//! `{"time":"<RFC3339Nano>","stream":"stdout","log":"<line>\n"}`. The
//! writer side runs inside the supervisor process and drains the task's
//! stdio FIFOs; the reader side backs `logs` with tail/since/until
//! filtering and follow mode.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;

/// Which side of the task's stdio a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(
        serialize_with = "serialize_nanos",
        deserialize_with = "deserialize_nanos"
    )]
    pub time: DateTime<Utc>,
    pub stream: Stream,
    /// The raw line including its trailing newline, if the source had one.
    pub log: String,
}

fn serialize_nanos<S: serde::Serializer>(
    time: &DateTime<Utc>,
    ser: S,
) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn deserialize_nanos<'de, D: serde::Deserializer<'de>>(
    de: D,
) -> std::result::Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(de)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Append-only writer for one container's log file.
#[derive(Debug)]
pub struct LogWriter {
    file: std::fs::File,
}

impl LogWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::Logs(format!("opening {}: {}", path.display(), e)))?;
        Ok(Self { file })
    }

    pub fn write(&mut self, stream: Stream, log: String) -> Result<()> {
        use std::io::Write;
        let entry = LogEntry {
            time: Utc::now(),
            stream,
            log,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }
}

/// Drain one stdio FIFO into the shared writer, line by line. Returns when
/// the FIFO hits EOF (task exited and the write side closed).
pub async fn drain<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    writer: Arc<Mutex<LogWriter>>,
) -> Result<()> {
    let mut lines = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = lines.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let log = String::from_utf8_lossy(&buf).into_owned();
        writer.lock().await.write(stream, log)?;
    }
}

/// Filters for reading a log file.
#[derive(Debug, Clone, Default)]
pub struct ReadOpts {
    /// Only the last N entries.
    pub tail: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ReadOpts {
    fn keep(&self, entry: &LogEntry) -> bool {
        if let Some(since) = self.since {
            if entry.time < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.time > until {
                return false;
            }
        }
        true
    }
}

/// Parse a `--since`/`--until` value: an RFC3339 timestamp, or a duration
/// like `10m` meaning that long before now.
pub fn parse_time_filter(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let dur = humantime::parse_duration(s)
        .map_err(|_| Error::invalid(format!("invalid time filter {:?}", s)))?;
    let dur = chrono::Duration::from_std(dur)
        .map_err(|_| Error::invalid(format!("time filter {:?} out of range", s)))?;
    Ok(now - dur)
}

/// Read matching entries from a log file. With `tail`, only the final
/// portion of the file is scanned.
pub fn read_entries(path: &Path, opts: &ReadOpts) -> Result<Vec<LogEntry>> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::Logs(format!("opening {}: {}", path.display(), e)))?;

    if let Some(n) = opts.tail {
        let offset = tail_offset(&mut file, n)?;
        file.seek(SeekFrom::Start(offset))?;
    }

    let mut out = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        // A torn final line (writer mid-append) is not an error.
        let Ok(entry) = serde_json::from_str::<LogEntry>(&line) else {
            continue;
        };
        if opts.keep(&entry) {
            out.push(entry);
        }
    }
    Ok(out)
}

/// Byte offset of the start of the n-th line from the end, found by
/// scanning backwards in fixed-size chunks.
fn tail_offset(file: &mut std::fs::File, n: usize) -> Result<u64> {
    const CHUNK: u64 = 8192;
    let len = file.seek(SeekFrom::End(0))?;
    if n == 0 {
        return Ok(len);
    }

    let mut newlines = 0usize;
    let mut pos = len;
    let mut buf = vec![0u8; CHUNK as usize];

    while pos > 0 {
        let read_len = CHUNK.min(pos);
        pos -= read_len;
        file.seek(SeekFrom::Start(pos))?;
        let chunk = &mut buf[..read_len as usize];
        file.read_exact(chunk)?;

        for (i, &b) in chunk.iter().enumerate().rev() {
            if b != b'\n' {
                continue;
            }
            // The trailing newline of the file terminates the last entry.
            if pos + i as u64 == len - 1 {
                continue;
            }
            newlines += 1;
            if newlines == n {
                return Ok(pos + i as u64 + 1);
            }
        }
    }
    Ok(0)
}

/// Events produced while following a log file.
#[derive(Debug)]
pub enum FollowEvent {
    Entry(LogEntry),
    /// The watcher failed; following cannot continue.
    Lost(String),
}

/// Follow a log file: emits entries appended after `start_offset` until the
/// receiver is dropped. Uses a filesystem watcher rather than polling.
pub fn follow(
    path: &Path,
    start_offset: u64,
    opts: ReadOpts,
) -> Result<tokio::sync::mpsc::Receiver<FollowEvent>> {
    use notify::Watcher;

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let path = path.to_path_buf();

    std::thread::spawn(move || {
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = event_tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                let _ = tx.blocking_send(FollowEvent::Lost(e.to_string()));
                return;
            }
        };
        if let Err(e) = watcher.watch(&path, notify::RecursiveMode::NonRecursive) {
            let _ = tx.blocking_send(FollowEvent::Lost(e.to_string()));
            return;
        }

        let mut offset = start_offset;
        loop {
            if drain_new_entries(&path, &mut offset, &opts, &tx).is_err() {
                return;
            }
            match event_rx.recv() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    let _ = tx.blocking_send(FollowEvent::Lost(e.to_string()));
                    return;
                }
                // Watcher dropped.
                Err(_) => return,
            }
        }
    });

    Ok(rx)
}

/// Forward entries appended past `offset`. Errors mean the receiver went
/// away and following should stop.
fn drain_new_entries(
    path: &PathBuf,
    offset: &mut u64,
    opts: &ReadOpts,
    tx: &tokio::sync::mpsc::Sender<FollowEvent>,
) -> std::result::Result<(), ()> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Ok(());
    };
    if file.seek(SeekFrom::Start(*offset)).is_err() {
        return Ok(());
    }
    let mut reader = std::io::BufReader::new(&mut file);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return Ok(()),
            Ok(n) => {
                // Hold position on a torn line; the rest arrives next event.
                if !line.ends_with('\n') {
                    return Ok(());
                }
                *offset += n as u64;
                if let Ok(entry) = serde_json::from_str::<LogEntry>(line.trim_end()) {
                    if opts.keep(&entry) {
                        tx.blocking_send(FollowEvent::Entry(entry)).map_err(|_| ())?;
                    }
                }
            }
        }
    }
}

/// Format one entry for terminal output.
pub fn render(entry: &LogEntry, timestamps: bool) -> String {
    let text = entry.log.trim_end_matches('\n');
    if timestamps {
        format!(
            "{} {}",
            entry.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            text
        )
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write_log(dir: &tempfile::TempDir, entries: &[(i64, Stream, &str)]) -> PathBuf {
        let path = dir.path().join("logs");
        let mut raw = String::new();
        for (secs, stream, log) in entries {
            let entry = LogEntry {
                time: Utc.timestamp_opt(*secs, 500_000_000).unwrap(),
                stream: *stream,
                log: format!("{}\n", log),
            };
            raw.push_str(&serde_json::to_string(&entry).unwrap());
            raw.push('\n');
        }
        std::fs::write(&path, raw).unwrap();
        path
    }

    #[test]
    fn test_encoding_shape() {
        let entry = LogEntry {
            time: Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap(),
            stream: Stream::Stdout,
            log: "hello\n".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"stream\":\"stdout\""));
        assert!(json.contains("\"log\":\"hello\\n\""));
        // Nanosecond precision in the timestamp.
        assert!(json.contains(".123456789Z"));

        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_tail_returns_last_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            &[
                (100, Stream::Stdout, "one"),
                (200, Stream::Stdout, "two"),
                (300, Stream::Stderr, "three"),
            ],
        );

        let opts = ReadOpts {
            tail: Some(2),
            ..Default::default()
        };
        let entries = read_entries(&path, &opts).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log, "two\n");
        assert_eq!(entries[1].log, "three\n");

        let opts = ReadOpts {
            tail: Some(10),
            ..Default::default()
        };
        assert_eq!(read_entries(&path, &opts).unwrap().len(), 3);
    }

    #[test]
    fn test_since_until_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            &[
                (100, Stream::Stdout, "one"),
                (200, Stream::Stdout, "two"),
                (300, Stream::Stdout, "three"),
            ],
        );

        let opts = ReadOpts {
            since: Some(Utc.timestamp_opt(150, 0).unwrap()),
            until: Some(Utc.timestamp_opt(250, 0).unwrap()),
            ..Default::default()
        };
        let entries = read_entries(&path, &opts).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log, "two\n");
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, &[(100, Stream::Stdout, "one")]);
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"time\":\"2024-").unwrap();

        let entries = read_entries(&path, &ReadOpts::default()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_parse_time_filter_forms() {
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let abs = parse_time_filter("2023-11-14T22:13:20Z", now).unwrap();
        assert_eq!(abs.timestamp(), 1_700_000_000);

        let rel = parse_time_filter("10m", now).unwrap();
        assert_eq!(rel.timestamp(), 1_000_000 - 600);

        assert!(parse_time_filter("soon", now).is_err());
    }

    #[test]
    fn test_render() {
        let entry = LogEntry {
            time: Utc.timestamp_opt(0, 0).unwrap(),
            stream: Stream::Stdout,
            log: "hi\n".to_string(),
        };
        assert_eq!(render(&entry, false), "hi");
        assert!(render(&entry, true).starts_with("1970-01-01T00:00:00"));
    }

    #[tokio::test]
    async fn test_drain_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        let writer = Arc::new(Mutex::new(LogWriter::open(&path).unwrap()));

        let input: &[u8] = b"first\nsecond\n";
        drain(input, Stream::Stdout, writer).await.unwrap();

        let entries = read_entries(&path, &ReadOpts::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log, "first\n");
        assert_eq!(entries[1].stream, Stream::Stdout);
    }
}
