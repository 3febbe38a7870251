//! Destinations for relayed command output.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Something command output can be appended to.
pub trait OutputSink: Send + Sync {
    fn append(&self, text: &str) -> io::Result<()>;
}

pub type SharedSink = Arc<dyn OutputSink>;

/// One relayed line, stamped with the stream it came from and its position
/// in that stream.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Which of the command's two streams a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// In-memory sink, cheap to clone and inspect.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<String>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for SharedBuffer {
    fn append(&self, text: &str) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
        Ok(())
    }
}

/// Forwards each appended line to a channel as an [`OutputLine`].
pub struct ChannelSink {
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
    line_number: AtomicU32,
}

impl ChannelSink {
    pub fn new(stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self {
            stream,
            tx,
            line_number: AtomicU32::new(0),
        }
    }
}

impl OutputSink for ChannelSink {
    fn append(&self, text: &str) -> io::Result<()> {
        for line in text.lines() {
            let line_number = self.line_number.fetch_add(1, Ordering::SeqCst) + 1;
            self.tx
                .send(OutputLine {
                    stream: self.stream,
                    content: line.to_string(),
                    line_number,
                    timestamp: Utc::now(),
                })
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output receiver closed"))?;
        }
        Ok(())
    }
}

/// Appends to a file on disk.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl OutputSink for FileSink {
    fn append(&self, text: &str) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(text.as_bytes())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn append(&self, _text: &str) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_numbers_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(OutputStream::Stderr, tx);
        sink.append("first\n").unwrap();
        sink.append("second\n").unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(first.line_number, 1);
        assert_eq!(second.line_number, 2);
        assert_eq!(second.stream, OutputStream::Stderr);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.out");
        let sink = FileSink::append_to(&path).unwrap();
        sink.append("a\n").unwrap();
        sink.append("b\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
