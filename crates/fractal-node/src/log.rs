//! Per-node activity and error logs.

use std::io;
use std::path::Path;

use fractal_logging::{LineSink, SinkWriter};
use tokio::sync::mpsc::UnboundedReceiver;

/// Where a node records what it did and what went wrong.
///
/// Every activity line is mirrored to `tracing::info!`, every error line to
/// `tracing::warn!`. Either sink may be absent.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    activity: Option<LineSink>,
    errors: Option<LineSink>,
}

/// Drain tasks for the two log files of an [`EventLog`].
#[derive(Debug)]
pub struct EventLogWriters {
    activity: SinkWriter,
    errors: SinkWriter,
}

impl EventLogWriters {
    /// Flush both files and stop their drain tasks.
    pub async fn finish(self) -> io::Result<()> {
        let activity = self.activity.finish().await?;
        let errors = self.errors.finish().await?;
        tracing::debug!(activity, errors, "log sinks closed");
        Ok(())
    }
}

impl EventLog {
    /// Open `<dir>/<name>.log` and `<dir>/<name>.err.log`.
    pub async fn open(dir: &Path, name: &str) -> io::Result<(EventLog, EventLogWriters)> {
        let (activity, activity_writer) = LineSink::create(dir.join(format!("{name}.log"))).await?;
        let (errors, errors_writer) = LineSink::create(dir.join(format!("{name}.err.log"))).await?;
        Ok((
            EventLog {
                activity: Some(activity),
                errors: Some(errors),
            },
            EventLogWriters {
                activity: activity_writer,
                errors: errors_writer,
            },
        ))
    }

    /// Logs that only reach `tracing`.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Logs whose lines are handed to the returned receivers (activity, errors).
    pub fn detached() -> (EventLog, UnboundedReceiver<String>, UnboundedReceiver<String>) {
        let (activity, activity_rx) = LineSink::detached();
        let (errors, errors_rx) = LineSink::detached();
        (
            EventLog {
                activity: Some(activity),
                errors: Some(errors),
            },
            activity_rx,
            errors_rx,
        )
    }

    pub fn activity(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!("{line}");
        if let Some(sink) = &self.activity {
            sink.write(line);
        }
    }

    pub fn error(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!("{line}");
        if let Some(sink) = &self.errors {
            sink.write(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_logs_split_by_severity() {
        let (log, mut activity, mut errors) = EventLog::detached();
        log.activity("joined as #1");
        log.error("dial failed");

        assert_eq!(activity.recv().await.as_deref(), Some("joined as #1"));
        assert_eq!(errors.recv().await.as_deref(), Some("dial failed"));
        assert!(activity.try_recv().is_err());
    }

    #[tokio::test]
    async fn files_are_written_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let (log, writers) = EventLog::open(dir.path(), "worker-9001").await.unwrap();
        log.activity("a");
        log.clone().activity("b");
        log.error("c");
        writers.finish().await.unwrap();

        let activity = tokio::fs::read_to_string(dir.path().join("worker-9001.log"))
            .await
            .unwrap();
        let errors = tokio::fs::read_to_string(dir.path().join("worker-9001.err.log"))
            .await
            .unwrap();
        assert_eq!(activity, "a\nb\n");
        assert_eq!(errors, "c\n");
    }

    #[test]
    fn silent_log_accepts_lines() {
        let log = EventLog::silent();
        log.activity("nothing to see");
        log.error("nowhere to go");
    }
}
