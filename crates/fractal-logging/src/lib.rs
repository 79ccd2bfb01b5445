//! Fractal Logging
//!
//! Append-only line logs fed through channels.
//!
//! Producers hold a cheap, cloneable [`LineSink`] and never touch the file:
//! each call to [`LineSink::write`] only enqueues. A single drain task per
//! sink owns the file handle, writes one line per event and flushes whenever
//! the queue runs dry. [`SinkWriter::finish`] stops the drain task after the
//! remaining lines are written and flushed.
//!
//! Console diagnostics go through `tracing`; see [`init_tracing`].

use std::io;
use std::path::Path;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Producer side of a line log.
#[derive(Debug, Clone)]
pub struct LineSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LineSink {
    /// Create (truncate) the file at `path` and start draining into it.
    ///
    /// Missing parent directories are created.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<(LineSink, SinkWriter)> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::spawn(file))
    }

    /// Start draining into an arbitrary writer.
    pub fn spawn<W>(writer: W) -> (LineSink, SinkWriter)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(drain(rx, shutdown_rx, writer));
        (
            LineSink { tx },
            SinkWriter {
                shutdown: shutdown_tx,
                task,
            },
        )
    }

    /// A sink whose lines are delivered to the returned receiver instead of a file.
    pub fn detached() -> (LineSink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LineSink { tx }, rx)
    }

    /// Enqueue one line. Never blocks; lines written after shutdown are dropped.
    pub fn write(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }

    /// Whether the consuming side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle to a sink's drain task.
#[derive(Debug)]
pub struct SinkWriter {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<u64>>,
}

impl SinkWriter {
    /// Write out everything queued so far, flush, and stop.
    ///
    /// Returns the total number of lines written.
    pub async fn finish(self) -> io::Result<u64> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

async fn drain<W>(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
    writer: W,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::new(writer);
    let mut written = 0u64;

    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break };
                write_line(&mut out, &line).await?;
                written += 1;

                while let Ok(line) = rx.try_recv() {
                    write_line(&mut out, &line).await?;
                    written += 1;
                }
                out.flush().await?;
            }
            _ = &mut shutdown => {
                rx.close();
                while let Some(line) = rx.recv().await {
                    write_line(&mut out, &line).await?;
                    written += 1;
                }
                break;
            }
        }
    }

    out.flush().await?;
    out.shutdown().await?;
    Ok(written)
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut BufWriter<W>, line: &str) -> io::Result<()> {
    out.write_all(line.trim_end_matches('\n').as_bytes()).await?;
    out.write_all(b"\n").await
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directives` is used. Calling
/// this more than once is harmless.
pub fn init_tracing(default_directives: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
