//! Reading container logs written by the json-file driver

use super::manager::ContainerManager;
use super::meta::Container;
use crate::error::{HullError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const JSON_FILE_DRIVER: &str = "json-file";

/// One line of a json-file log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub log: String,
    /// `stdout` or `stderr`
    pub stream: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub follow: bool,
    /// Only the last N lines of the existing log
    pub tail: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub stdout: bool,
    pub stderr: bool,
}

impl LogsOptions {
    fn wants(&self, message: &LogMessage) -> bool {
        let stream_ok = match (self.stdout, self.stderr) {
            (false, false) | (true, true) => true,
            (true, false) => message.stream == "stdout",
            (false, true) => message.stream == "stderr",
        };
        stream_ok && self.since.map_or(true, |since| message.time >= since)
    }
}

/// Reads complete lines appended to a file, opening it once it exists
struct LogTail {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    partial: String,
}

impl LogTail {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: None,
            partial: String::new(),
        }
    }

    async fn read_available(&mut self) -> std::io::Result<Vec<LogMessage>> {
        if self.reader.is_none() {
            match File::open(&self.path).await {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        loop {
            if reader.read_line(&mut self.partial).await? == 0 {
                break;
            }
            // Wait for the writer to finish the line
            if !self.partial.ends_with('\n') {
                break;
            }
            match serde_json::from_str::<LogMessage>(self.partial.trim_end()) {
                Ok(message) => out.push(message),
                Err(e) => debug!(path = %self.path.display(), "skipping malformed log line: {}", e),
            }
            self.partial.clear();
        }
        Ok(out)
    }
}

async fn stream_logs(
    container: Arc<Container>,
    mut tail: LogTail,
    options: LogsOptions,
    interval: Duration,
    tx: mpsc::Sender<LogMessage>,
    cancel: CancellationToken,
) {
    let mut backlog: Vec<LogMessage> = match tail.read_available().await {
        Ok(messages) => messages.into_iter().filter(|m| options.wants(m)).collect(),
        Err(e) => {
            warn!(container = %container.id(), "failed to read log: {}", e);
            return;
        }
    };
    if let Some(n) = options.tail {
        let skip = backlog.len().saturating_sub(n);
        backlog.drain(..skip);
    }
    for message in backlog {
        if tx.send(message).await.is_err() {
            return;
        }
    }
    if !options.follow {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            _ = ticker.tick() => {}
        }
        // Sample liveness before reading so lines written just before the
        // exit are still delivered
        let running = container.exported().map(|e| e.running).unwrap_or(false);
        let batch = match tail.read_available().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(container = %container.id(), "failed to read log: {}", e);
                return;
            }
        };
        let idle = batch.is_empty();
        for message in batch.into_iter().filter(|m| options.wants(m)) {
            if tx.send(message).await.is_err() {
                return;
            }
        }
        if idle && !running {
            debug!(container = %container.id(), "container stopped, log follow finished");
            return;
        }
    }
}

impl ContainerManager {
    /// Stream the container's log. The channel closes at end of log, or
    /// when following, once the container stops and the log is drained.
    pub async fn logs(
        &self,
        id: &str,
        options: LogsOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LogMessage>> {
        let container = self.registry.get(id)?;
        let meta = container.snapshot().await;
        let driver = &meta.host_config.log_config.driver;
        if driver != JSON_FILE_DRIVER {
            return Err(HullError::InvalidParam(format!(
                "configured logging driver {} does not support reading",
                driver
            )));
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(stream_logs(
            container,
            LogTail::new(&meta.log_path),
            options,
            self.config.log_follow_interval,
            tx,
            cancel,
        ));
        Ok(rx)
    }
}
