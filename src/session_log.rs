//! Session log sink
//!
//! One append-only file per orchestrator run receives internal log lines and
//! every spawned agent's standard output and standard error. Free text with
//! a leading timestamp and severity tag; structured envelopes never land
//! here. The writer task is the file's single writer; everything else sends
//! lines over a channel.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Severity tag on a session log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    fn tag(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

struct LogLine {
    severity: Severity,
    source: String,
    text: String,
}

/// Cheap handle to the session log sink
#[derive(Clone)]
pub struct SessionLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<LogLine>,
}

impl SessionLog {
    /// Opens (creating or appending) the sink and starts its writer task
    pub async fn open(path: &Path) -> std::io::Result<(Self, JoinHandle<()>)> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();

        let writer = tokio::spawn(async move {
            let mut file = file;
            while let Some(line) = rx.recv().await {
                let rendered = format!(
                    "{} [{}] {}: {}\n",
                    Utc::now().to_rfc3339(),
                    line.severity.tag(),
                    line.source,
                    line.text
                );
                if file.write_all(rendered.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = file.flush().await;
        });

        Ok((
            Self {
                path: path.to_path_buf(),
                tx,
            },
            writer,
        ))
    }

    /// Path agents receive in their environment
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line
    pub fn line(&self, severity: Severity, source: &str, text: impl Into<String>) {
        let _ = self.tx.send(LogLine {
            severity,
            source: source.to_string(),
            text: text.into(),
        });
    }

    /// Appends an info line
    pub fn info(&self, source: &str, text: impl Into<String>) {
        self.line(Severity::Info, source, text);
    }

    /// Appends a warning line
    pub fn warn(&self, source: &str, text: impl Into<String>) {
        self.line(Severity::Warn, source, text);
    }

    /// Appends an error line
    pub fn error(&self, source: &str, text: impl Into<String>) {
        self.line(Severity::Error, source, text);
    }

    /// Forwards a child process stream into the sink, line by line
    pub fn pipe_child_stream<R>(
        &self,
        reader: R,
        source: String,
        severity: Severity,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => sink.line(severity, &source, line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(source = %source, error = %e, "child stream read failed");
                        break;
                    }
                }
            }
        })
    }
}
