//! Line-delimited JSON spoken between the orchestrator and its children, and
//! between fetchers and the buffer writer.

use crate::config::SourceSpec;
use crate::plan::FetchJob;
use crate::ExtractError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchProgress {
    pub org: String,
    pub object: String,
    pub page: usize,
    pub records_in_page: usize,
    pub total_records: usize,
    pub has_next_page: bool,
}

/// Messages a child writes on its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChildMessage {
    Ready { address: String },
    Progress(FetchProgress),
    ObjectDone { org: String, object: String, total_records: usize, pages: usize },
    FetchError { org: String, object: String, error: String },
}

/// Job input a fetcher reads from stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetcherPayload {
    pub job: FetchJob,
    pub data_dir: PathBuf,
    pub writer_address: String,
    #[serde(default)]
    pub source: SourceSpec,
}

/// One fetched page handed to the buffer writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub fetcher_id: String,
    pub org: String,
    pub object: String,
    pub page: usize,
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppendAck {
    pub fn staged(buffer_file: String) -> Self {
        Self { ok: true, buffer_file: Some(buffer_file), error: None }
    }

    pub fn failed(error: String) -> Self {
        Self { ok: false, buffer_file: None, error: Some(error) }
    }
}

pub fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), ExtractError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Next non-blank line decoded as `T`; `None` at end of stream.
pub fn read_json_line<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ExtractError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(line.trim())
        .map(Some)
        .map_err(|e| ExtractError::Protocol(format!("malformed message: {}", e)))
}

/// Publish a message to the parent on stdout.
pub fn emit(message: &ChildMessage) -> Result<(), ExtractError> {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    write_json_line(&mut lock, message)
}

/// Decode one stdout line from a child. Lines that are not protocol
/// messages yield `None`.
pub fn parse_child_line(line: &str) -> Option<ChildMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
