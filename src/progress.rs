//! Ingestion progress reporting.
//!
//! An ingestion run emits [`ProgressEvent`]s through a [`ProgressReporter`]
//! so callers see which stage is running and roughly how far along it is.
//! Every run ends with exactly one terminal event: `complete` carrying the
//! final [`IngestReport`], or `error`.
//!
//! The CLI prints progress on **stderr** so stdout remains parseable for
//! scripts; the HTTP server forwards events to an SSE stream through
//! [`ChannelProgress`].

use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc;

use crate::models::IngestReport;

/// Stage of the ingestion pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Starting,
    /// Cloning or synchronizing the working copy.
    Cloning,
    /// Reading, chunking, embedding, and indexing.
    Loading,
    Complete,
    Error,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Starting => "starting",
            IngestStage::Cloning => "cloning",
            IngestStage::Loading => "loading",
            IngestStage::Complete => "complete",
            IngestStage::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestStage::Complete | IngestStage::Error)
    }
}

/// A single progress event.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub stage: IngestStage,
    pub message: String,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<IngestReport>,
}

impl ProgressEvent {
    pub fn new(stage: IngestStage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            progress: progress.min(100),
            result: None,
        }
    }

    pub fn finished(report: IngestReport) -> Self {
        let stage = if report.success {
            IngestStage::Complete
        } else {
            IngestStage::Error
        };
        Self {
            stage,
            message: report.message.clone(),
            progress: 100,
            result: Some(report),
        }
    }
}

/// Receives progress events from the ingestion pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest [ 40%] loading  Loaded 1,234 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!(
            "ingest [{:>3}%] {:<8}  {}\n",
            event.progress,
            event.stage.as_str(),
            event.message
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events to an async consumer. Events sent after the receiver
/// is dropped are discarded.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Thousands separators for counts in progress messages.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse the `--progress` flag; `auto` picks [`Self::default_for_tty`].
    pub fn from_flag(flag: &str) -> Result<Self, String> {
        match flag {
            "auto" => Ok(Self::default_for_tty()),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            "off" => Ok(ProgressMode::Off),
            other => Err(format!(
                "invalid progress mode '{}': expected auto, human, json, or off",
                other
            )),
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn finished_event_is_terminal() {
        let ok = ProgressEvent::finished(IngestReport {
            success: true,
            message: "done".into(),
            repository: "tiny".into(),
            documents: 1,
            chunks: 1,
            code: None,
        });
        assert_eq!(ok.stage, IngestStage::Complete);
        assert!(ok.stage.is_terminal());

        let failed = ProgressEvent::finished(IngestReport::failed("tiny", "boom"));
        assert_eq!(failed.stage, IngestStage::Error);
        assert_eq!(failed.progress, 100);
    }

    #[test]
    fn event_json_shape() {
        let event = ProgressEvent::new(IngestStage::Cloning, 10, "Cloning repository");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "cloning");
        assert_eq!(json["progress"], 10);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn progress_flag_parsing() {
        assert_eq!(ProgressMode::from_flag("json").unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::from_flag("off").unwrap(), ProgressMode::Off);
        assert!(ProgressMode::from_flag("loud").is_err());
    }

    #[tokio::test]
    async fn channel_reporter_forwards() {
        let (reporter, mut rx) = ChannelProgress::new();
        reporter.report(ProgressEvent::new(IngestStage::Starting, 0, "go"));
        drop(reporter);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.stage, IngestStage::Starting);
        assert!(rx.recv().await.is_none());
    }
}
