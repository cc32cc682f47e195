use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

use super::{FlowEvent, FlowEventType, FlowStatus, METADATA_KEYS};
use crate::{RagError, Result};

const SEPARATOR_FULL: &str = super::SEPARATOR_FULL;
const SEPARATOR_HALF: &str = super::SEPARATOR_HALF;

/// Post-hoc analyzer over a flow log file written at `normal` or `verbose`
/// detail. Supports session filtering, per-event timing statistics, error
/// and slow-operation extraction, and JSON/CSV export.
pub struct FlowAnalyzer {
    events: Vec<FlowEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

impl FlowAnalyzer {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self {
            events: parse_events(&content)?,
        })
    }

    pub fn from_events(events: Vec<FlowEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[FlowEvent] {
        &self.events
    }

    pub fn sessions(&self) -> Vec<Uuid> {
        let mut sessions = Vec::new();
        for event in &self.events {
            if !sessions.contains(&event.session_id) {
                sessions.push(event.session_id);
            }
        }
        sessions
    }

    pub fn filter_session(&self, session_id: Uuid) -> Vec<&FlowEvent> {
        self.events
            .iter()
            .filter(|e| e.session_id == session_id)
            .collect()
    }

    /// Timing statistics per event type, over the events that carry a
    /// duration.
    pub fn timing_stats(&self) -> BTreeMap<String, TimingStats> {
        let mut durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for event in &self.events {
            if let Some(duration) = event.duration {
                durations
                    .entry(event.event_type.to_string())
                    .or_default()
                    .push(duration);
            }
        }

        durations
            .into_iter()
            .map(|(event_type, mut values)| {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let count = values.len();
                let sum: f64 = values.iter().sum();
                let p95_index = ((count as f64 * 0.95).ceil() as usize).saturating_sub(1);
                let stats = TimingStats {
                    count,
                    avg: sum / count as f64,
                    min: values[0],
                    max: values[count - 1],
                    p95: values[p95_index.min(count - 1)],
                };
                (event_type, stats)
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<&FlowEvent> {
        self.events
            .iter()
            .filter(|e| e.status == FlowStatus::Error || e.event_type == FlowEventType::Error)
            .collect()
    }

    /// Events whose duration exceeds `threshold_seconds`, slowest first.
    pub fn slow_operations(&self, threshold_seconds: f64) -> Vec<&FlowEvent> {
        let mut slow: Vec<&FlowEvent> = self
            .events
            .iter()
            .filter(|e| e.duration.is_some_and(|d| d > threshold_seconds))
            .collect();
        slow.sort_by(|a, b| {
            b.duration
                .partial_cmp(&a.duration)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slow
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.events)?)
    }

    pub fn export_csv(&self) -> String {
        let mut out = String::from("timestamp,session_id,event_type,elapsed,duration,status,metadata\n");
        for event in &self.events {
            let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
            out.push_str(&format!(
                "{},{},{},{:.3},{},{},{}\n",
                event.timestamp.format(super::TIMESTAMP_FORMAT),
                event.session_id,
                event.event_type,
                event.elapsed,
                event
                    .duration
                    .map(|d| format!("{d:.3}"))
                    .unwrap_or_default(),
                event.status,
                csv_escape(&metadata),
            ));
        }
        out
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Parse the block format back into events. Only `normal`/`verbose` blocks
/// are recognized; `minimal` single-line entries are skipped.
pub fn parse_events(content: &str) -> Result<Vec<FlowEvent>> {
    let mut events = Vec::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        if line != SEPARATOR_FULL {
            continue;
        }
        let Some(header) = lines.next() else { break };
        if !header.starts_with('[') {
            continue;
        }
        // The half separator between header and fields.
        match lines.next() {
            Some(sep) if sep == SEPARATOR_HALF => {}
            _ => continue,
        }

        let (timestamp, session_id, event_type, elapsed) = parse_header(header)?;

        let mut status = FlowStatus::InProgress;
        let mut duration = None;
        let mut metadata: Vec<(String, String)> = Vec::new();
        let mut saw_status = false;

        for field_line in lines.by_ref() {
            if field_line == SEPARATOR_FULL {
                break;
            }
            if !saw_status {
                if let Some(value) = field_line.strip_prefix("Status: ") {
                    status = value.parse()?;
                    saw_status = true;
                    continue;
                }
            }
            if duration.is_none() && metadata.is_empty() {
                if let Some(value) = field_line.strip_prefix("Duration: ") {
                    if let Some(seconds) = value.strip_suffix('s') {
                        if let Ok(parsed) = seconds.parse::<f64>() {
                            duration = Some(parsed);
                            continue;
                        }
                    }
                }
            }

            match split_metadata_line(field_line) {
                Some((key, value)) => metadata.push((key.to_string(), value.to_string())),
                None => {
                    // Continuation of the previous value.
                    if let Some((_, value)) = metadata.last_mut() {
                        value.push('\n');
                        value.push_str(field_line);
                    }
                }
            }
        }

        events.push(FlowEvent {
            timestamp,
            session_id,
            event_type,
            elapsed,
            duration,
            status,
            metadata,
        });
    }

    Ok(events)
}

fn parse_header(header: &str) -> Result<(NaiveDateTime, Uuid, FlowEventType, f64)> {
    let malformed = || RagError::Validation(format!("malformed flow log header: {header}"));

    let close = header.find(']').ok_or_else(malformed)?;
    let timestamp = NaiveDateTime::parse_from_str(&header[1..close], super::TIMESTAMP_FORMAT)
        .map_err(|_| malformed())?;

    let rest = header[close + 1..].trim();
    let (event_name, rest) = rest.split_once(" (Session: ").ok_or_else(malformed)?;
    let event_type: FlowEventType = event_name.parse()?;

    let (session, rest) = rest.split_once(')').ok_or_else(malformed)?;
    let session_id = Uuid::parse_str(session.trim()).map_err(|_| malformed())?;

    let elapsed = rest
        .trim()
        .strip_prefix("[+")
        .and_then(|s| s.strip_suffix("s]"))
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(malformed)?;

    Ok((timestamp, session_id, event_type, elapsed))
}

fn split_metadata_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(": ")?;
    if METADATA_KEYS.contains(&key) {
        Some((key, value))
    } else {
        None
    }
}
