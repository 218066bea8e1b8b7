//! Output stream readers: drain a workload's stdout/stderr line by line.

use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

/// Which standard stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::Stdout => "STDOUT",
            StreamName::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One non-empty line of workload output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamName,
    pub text: String,
}

/// Destination for workload output.
pub type LineSink = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// The default sink: every line becomes an `info` event tagged with its stream.
pub fn log_sink() -> LineSink {
    Arc::new(|line: OutputLine| {
        tracing::info!(stream = line.stream.as_str(), "{}: {}", line.stream, line.text);
    })
}

/// Read `source` until end-of-stream or until `stop` is cancelled.
///
/// Lines are trimmed; empty lines are dropped. Invalid UTF-8 is replaced
/// rather than ending the stream, so the pipe keeps draining.
pub async fn drain_lines<R>(source: R, stream: StreamName, stop: CancellationToken, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim();
                if !text.is_empty() {
                    sink(OutputLine {
                        stream,
                        text: text.to_string(),
                    });
                }
            }
            Err(e) => {
                tracing::warn!(stream = stream.as_str(), error = %e, "error reading workload output");
                break;
            }
        }
    }
    tracing::debug!(stream = stream.as_str(), "output reader finished");
}
