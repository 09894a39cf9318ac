use crate::params::DetectionConfig;
use crate::signal::EventRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One item on the detection stream, and what the coordinator delivers to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Message {
    StatusUpdate(String),
    EventsBatch(Vec<EventRecord>),
    Done,
}

/// Everything a worker process needs, written to its stdin as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub filenames: Vec<PathBuf>,
    pub config: DetectionConfig,
}

/// Serialise a message as one line of the wire format, newline included.
pub fn encode_line(message: &Message) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> serde_json::Result<Message> {
    serde_json::from_str(line.trim_end())
}
