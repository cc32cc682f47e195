pub mod analyzer;


use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::FlowDetailLevel;
use crate::{RagError, Result};

pub(crate) const SEPARATOR_FULL: &str =
    "================================================================================";
pub(crate) const SEPARATOR_HALF: &str =
    "--------------------------------------------------------------------------------";
const TRUNCATE_AT: usize = 500;
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowEventType {
    QueryStart,
    QueryAnalysis,
    ToolSelection,
    ToolExecution,
    LlmCall,
    QueryComplete,
    Error,
    LogOverflow,
}

impl std::fmt::Display for FlowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            FlowEventType::QueryStart => "QUERY_START",
            FlowEventType::QueryAnalysis => "QUERY_ANALYSIS",
            FlowEventType::ToolSelection => "TOOL_SELECTION",
            FlowEventType::ToolExecution => "TOOL_EXECUTION",
            FlowEventType::LlmCall => "LLM_CALL",
            FlowEventType::QueryComplete => "QUERY_COMPLETE",
            FlowEventType::Error => "ERROR",
            FlowEventType::LogOverflow => "LOG_OVERFLOW",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for FlowEventType {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUERY_START" => Ok(FlowEventType::QueryStart),
            "QUERY_ANALYSIS" => Ok(FlowEventType::QueryAnalysis),
            "TOOL_SELECTION" => Ok(FlowEventType::ToolSelection),
            "TOOL_EXECUTION" => Ok(FlowEventType::ToolExecution),
            "LLM_CALL" => Ok(FlowEventType::LlmCall),
            "QUERY_COMPLETE" => Ok(FlowEventType::QueryComplete),
            "ERROR" => Ok(FlowEventType::Error),
            "LOG_OVERFLOW" => Ok(FlowEventType::LogOverflow),
            other => Err(RagError::Validation(format!("unknown event type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Success,
    Error,
    InProgress,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FlowStatus::Success => write!(f, "SUCCESS"),
            FlowStatus::Error => write!(f, "ERROR"),
            FlowStatus::InProgress => write!(f, "IN_PROGRESS"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(FlowStatus::Success),
            "ERROR" => Ok(FlowStatus::Error),
            "IN_PROGRESS" => Ok(FlowStatus::InProgress),
            other => Err(RagError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// One structured record in the chronological flow of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub timestamp: NaiveDateTime,
    pub session_id: Uuid,
    pub event_type: FlowEventType,
    /// Seconds since the session's QUERY_START.
    pub elapsed: f64,
    /// Seconds the operation itself took, where applicable.
    pub duration: Option<f64>,
    pub status: FlowStatus,
    /// Ordered key/value detail pairs; keys come from [`METADATA_KEYS`].
    pub metadata: Vec<(String, String)>,
}

/// Every metadata key the formatter emits. The analyzer uses this set to
/// tell a new field from a continuation line when parsing multi-line values.
pub const METADATA_KEYS: &[&str] = &[
    "Query",
    "Intent",
    "Requires Tools",
    "Reasoning",
    "Tool",
    "Rationale",
    "Input",
    "Output",
    "Model",
    "Prompt",
    "Response",
    "Answer",
    "Error Type",
    "Message",
    "Dropped",
];

enum WriterMessage {
    Entry(String),
    Flush(std::sync::mpsc::Sender<()>),
}

/// Append-only structured flow log with a bounded queue in front of the
/// writer. The hot path never blocks: when the queue is full, events are
/// dropped and a single LOG_OVERFLOW marker records the gap.
#[derive(Clone)]
pub struct FlowLogger {
    sender: SyncSender<WriterMessage>,
    detail_level: FlowDetailLevel,
    overflowed: Arc<AtomicBool>,
    path: PathBuf,
}

impl FlowLogger {
    pub fn new(path: &Path, detail_level: FlowDetailLevel, queue_capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (sender, receiver) = sync_channel(queue_capacity.max(1));
        let writer_path = path.to_path_buf();
        std::thread::Builder::new()
            .name("flow-log-writer".to_string())
            .spawn(move || writer_loop(&writer_path, &receiver))
            .map_err(|e| RagError::Internal(format!("failed to spawn flow log writer: {e}")))?;

        Ok(Self {
            sender,
            detail_level,
            overflowed: Arc::new(AtomicBool::new(false)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn detail_level(&self) -> FlowDetailLevel {
        self.detail_level
    }

    /// Open a session-scoped handle; elapsed times count from this call.
    pub fn session(&self, session_id: Uuid) -> SessionFlow {
        SessionFlow {
            logger: self.clone(),
            session_id,
            started: Instant::now(),
        }
    }

    /// Enqueue one event. Never blocks and never fails the caller.
    pub fn log(&self, event: &FlowEvent) {
        // A previous overflow is recorded as soon as the queue has room again.
        if self.overflowed.load(Ordering::Relaxed) {
            let marker = FlowEvent {
                timestamp: Utc::now().naive_utc(),
                session_id: event.session_id,
                event_type: FlowEventType::LogOverflow,
                elapsed: event.elapsed,
                duration: None,
                status: FlowStatus::Error,
                metadata: vec![("Dropped".to_string(), "flow events were dropped".to_string())],
            };
            let formatted = format_event(&marker, self.detail_level);
            if self.sender.try_send(WriterMessage::Entry(formatted)).is_ok() {
                self.overflowed.store(false, Ordering::Relaxed);
            } else {
                return;
            }
        }

        let formatted = format_event(event, self.detail_level);
        match self.sender.try_send(WriterMessage::Entry(formatted)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Flow log writer is gone; dropping event");
            }
        }
    }

    /// Wait until everything queued so far has reached the file.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        if self.sender.send(WriterMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(std::time::Duration::from_secs(5));
        }
    }
}

fn writer_loop(path: &Path, receiver: &Receiver<WriterMessage>) {
    let mut file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open flow log {}: {e}", path.display());
            // Drain the queue so senders never block on a dead writer.
            while let Ok(message) = receiver.recv() {
                if let WriterMessage::Flush(ack) = message {
                    let _ = ack.send(());
                }
            }
            return;
        }
    };

    while let Ok(message) = receiver.recv() {
        match message {
            WriterMessage::Entry(entry) => {
                if let Err(e) = writeln!(file, "{entry}") {
                    warn!("Failed to write flow log entry: {e}");
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = file.flush();
                let _ = ack.send(());
            }
        }
    }
}

/// Session-scoped emitter used by the agent path. One instance per `chat`
/// call; all events share the session id and a common start instant.
pub struct SessionFlow {
    logger: FlowLogger,
    session_id: Uuid,
    started: Instant,
}

impl SessionFlow {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn query_start(&self, query: &str) {
        self.emit(
            FlowEventType::QueryStart,
            None,
            FlowStatus::InProgress,
            vec![("Query".to_string(), query.to_string())],
        );
    }

    pub fn query_analysis(&self, intent: &str, requires_tools: bool, reasoning: &str) {
        self.emit(
            FlowEventType::QueryAnalysis,
            None,
            FlowStatus::Success,
            vec![
                ("Intent".to_string(), intent.to_string()),
                ("Requires Tools".to_string(), requires_tools.to_string()),
                ("Reasoning".to_string(), reasoning.to_string()),
            ],
        );
    }

    pub fn tool_selection(&self, tool: &str, rationale: &str) {
        self.emit(
            FlowEventType::ToolSelection,
            None,
            FlowStatus::InProgress,
            vec![
                ("Tool".to_string(), tool.to_string()),
                ("Rationale".to_string(), rationale.to_string()),
            ],
        );
    }

    pub fn tool_execution(
        &self,
        tool: &str,
        input: &str,
        output: &str,
        duration: f64,
        status: FlowStatus,
    ) {
        self.emit(
            FlowEventType::ToolExecution,
            Some(duration),
            status,
            vec![
                ("Tool".to_string(), tool.to_string()),
                ("Input".to_string(), input.to_string()),
                ("Output".to_string(), output.to_string()),
            ],
        );
    }

    pub fn llm_call(
        &self,
        model: &str,
        prompt: &str,
        response: &str,
        duration: f64,
        status: FlowStatus,
    ) {
        self.emit(
            FlowEventType::LlmCall,
            Some(duration),
            status,
            vec![
                ("Model".to_string(), model.to_string()),
                ("Prompt".to_string(), prompt.to_string()),
                ("Response".to_string(), response.to_string()),
            ],
        );
    }

    pub fn query_complete(&self, answer: &str, status: FlowStatus) {
        self.emit(
            FlowEventType::QueryComplete,
            Some(self.elapsed()),
            status,
            vec![("Answer".to_string(), answer.to_string())],
        );
    }

    pub fn error(&self, error_type: &str, message: &str) {
        self.emit(
            FlowEventType::Error,
            None,
            FlowStatus::Error,
            vec![
                ("Error Type".to_string(), error_type.to_string()),
                ("Message".to_string(), message.to_string()),
            ],
        );
    }

    fn emit(
        &self,
        event_type: FlowEventType,
        duration: Option<f64>,
        status: FlowStatus,
        metadata: Vec<(String, String)>,
    ) {
        let event = FlowEvent {
            timestamp: Utc::now().naive_utc(),
            session_id: self.session_id,
            event_type,
            elapsed: self.elapsed(),
            duration,
            status,
            metadata,
        };
        self.logger.log(&event);
    }
}

/// Render one event for the log file.
pub fn format_event(event: &FlowEvent, detail_level: FlowDetailLevel) -> String {
    let timestamp = event.timestamp.format(TIMESTAMP_FORMAT);

    if detail_level == FlowDetailLevel::Minimal {
        let summary = event
            .metadata
            .first()
            .map(|(_, v)| v.chars().take(80).filter(|c| *c != '\n').collect::<String>())
            .unwrap_or_default();
        return format!(
            "[{timestamp}] {} (Session: {}) [+{:.3}s] {} {summary}",
            event.event_type, event.session_id, event.elapsed, event.status
        );
    }

    let mut lines = vec![
        SEPARATOR_FULL.to_string(),
        format!(
            "[{timestamp}] {} (Session: {}) [+{:.3}s]",
            event.event_type, event.session_id, event.elapsed
        ),
        SEPARATOR_HALF.to_string(),
        format!("Status: {}", event.status),
    ];
    if let Some(duration) = event.duration {
        lines.push(format!("Duration: {duration:.3}s"));
    }
    for (key, value) in &event.metadata {
        let rendered = if detail_level == FlowDetailLevel::Verbose {
            value.clone()
        } else {
            truncate(value, TRUNCATE_AT)
        };
        lines.push(format!("{key}: {rendered}"));
    }
    lines.push(SEPARATOR_FULL.to_string());
    lines.join("\n")
}

fn truncate(content: &str, limit: usize) -> String {
    if content.chars().count() <= limit {
        return content.to_string();
    }
    let truncated: String = content.chars().take(limit).collect();
    format!(
        "{truncated}\n  [Full length: {} chars]",
        content.chars().count()
    )
}
