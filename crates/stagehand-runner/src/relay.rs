//! Concurrent draining of a command's stdout and stderr.
//!
//! Both streams get their own reader task. Draining them one after the other
//! would let a child that fills the unread pipe's buffer stall forever.

use crate::sink::SharedSink;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The two reader tasks of one relayed command.
#[derive(Debug)]
pub struct RelayHandle {
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl RelayHandle {
    /// Wait until both streams reach end-of-stream or fail.
    pub async fn join(self) {
        for (name, handle) in [("stdout", self.stdout), ("stderr", self.stderr)] {
            if let Err(e) = handle.await {
                warn!(stream = name, error = %e, "Output reader task failed");
            }
        }
    }
}

/// Start relaying `stdout` into `out` and `stderr` into `err`.
///
/// Read errors are logged and end only the affected reader.
pub fn relay_output<O, E>(source: &str, stdout: O, stderr: E, out: SharedSink, err: SharedSink) -> RelayHandle
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    RelayHandle {
        stdout: spawn_reader(source.to_string(), "stdout", stdout, out),
        stderr: spawn_reader(source.to_string(), "stderr", stderr, err),
    }
}

fn spawn_reader<R>(source: String, stream: &'static str, reader: R, sink: SharedSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut lines = 0u64;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches('\n').trim_end_matches('\r');
                    lines += 1;
                    // Keep draining even if the sink is broken.
                    if let Err(e) = sink.append(&format!("{}\n", line)) {
                        warn!(source = %source, stream, error = %e, "Failed to append command output");
                    }
                }
                Err(e) => {
                    warn!(source = %source, stream, error = %e, "Error while reading command output stream");
                    break;
                }
            }
        }
        debug!(source = %source, stream, lines, "Output stream closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SharedBuffer;
    use std::io;
    use std::pin::Pin;
    use std::process::Stdio;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("device went away")))
        }
    }

    #[tokio::test]
    async fn test_relays_both_streams_line_by_line() {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        relay_output(
            "test",
            &b"one\ntwo"[..],
            &b"oops\r\n"[..],
            Arc::new(out.clone()),
            Arc::new(err.clone()),
        )
        .join()
        .await;

        assert_eq!(out.contents(), "one\ntwo\n");
        assert_eq!(err.contents(), "oops\n");
    }

    #[tokio::test]
    async fn test_read_error_only_stops_that_stream() {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        relay_output(
            "test",
            FailingReader,
            &b"still here\n"[..],
            Arc::new(out.clone()),
            Arc::new(err.clone()),
        )
        .join()
        .await;

        assert_eq!(out.contents(), "");
        assert_eq!(err.contents(), "still here\n");
    }

    #[tokio::test]
    async fn test_child_filling_stderr_does_not_stall() {
        // Far more than a pipe buffer's worth on stderr before touching stdout.
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("i=0; while [ $i -lt 20000 ]; do echo \"noise line $i\" >&2; i=$((i+1)); done; echo done")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let relay = relay_output(
            "noisy",
            child.stdout.take().unwrap(),
            child.stderr.take().unwrap(),
            Arc::new(out.clone()),
            Arc::new(err.clone()),
        );

        let status = tokio::time::timeout(std::time::Duration::from_secs(30), child.wait())
            .await
            .expect("child stalled")
            .unwrap();
        relay.join().await;

        assert!(status.success());
        assert_eq!(out.contents(), "done\n");
        assert_eq!(err.contents().lines().count(), 20000);
    }
}
