//! Append-only CSV message logs.
//!
//! Two files, no header row, every field quoted:
//!
//! - channel log: `device, channel, timestamp, sender, message`
//! - direct log: `device, remote, timestamp, from, to, message`
//!
//! Timestamps use [`TIMESTAMP_FORMAT`]. Replaying both files in order
//! rebuilds the channel and direct buffers of a [`StateStore`].

use chrono::NaiveDateTime;
use csv::{QuoteStyle, ReaderBuilder, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::MeshError;
use crate::state::{Message, StateStore, TIMESTAMP_FORMAT, channel_label};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLogRecord {
    pub device: String,
    pub channel: String,
    pub timestamp: String,
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectLogRecord {
    pub device: String,
    pub remote: String,
    pub timestamp: String,
    pub from: String,
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Channel(ChannelLogRecord),
    Direct(DirectLogRecord),
}

impl ChannelLogRecord {
    pub fn new(device: &str, channel: &str, message: &Message) -> Self {
        Self {
            device: device.to_string(),
            channel: channel.to_string(),
            timestamp: message.formatted_time(),
            sender: message.from.clone(),
            message: message.text.clone(),
        }
    }

    /// Buffer key for this row. Older logs wrote the unnamed primary channel as an
    /// empty string; only channel 0 can be unnamed there.
    pub fn channel_key(&self) -> String {
        channel_label(0, &self.channel)
    }

    pub fn to_message(&self) -> Result<Message, chrono::ParseError> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        Ok(Message::channel(
            timestamp,
            &self.sender,
            &self.channel_key(),
            &self.message,
        ))
    }
}

impl DirectLogRecord {
    pub fn new(device: &str, remote: &str, message: &Message) -> Self {
        Self {
            device: device.to_string(),
            remote: remote.to_string(),
            timestamp: message.formatted_time(),
            from: message.from.clone(),
            to: message.to.clone(),
            message: message.text.clone(),
        }
    }

    pub fn to_message(&self) -> Result<Message, chrono::ParseError> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        Ok(Message::direct(
            timestamp,
            &self.from,
            &self.to,
            &self.remote,
            &self.message,
        ))
    }
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
}

/// Writer and reader for the channel and direct logs
#[derive(Debug)]
pub struct MessageLog {
    channel_path: PathBuf,
    direct_path: PathBuf,
    write_lock: Mutex<()>,
}

impl MessageLog {
    pub fn new(channel_path: impl Into<PathBuf>, direct_path: impl Into<PathBuf>) -> Self {
        Self {
            channel_path: channel_path.into(),
            direct_path: direct_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.channel_log, &config.direct_log)
    }

    pub fn channel_path(&self) -> &Path {
        &self.channel_path
    }

    pub fn direct_path(&self) -> &Path {
        &self.direct_path
    }

    pub fn append_channel(
        &self,
        device: &str,
        channel: &str,
        message: &Message,
    ) -> Result<(), MeshError> {
        self.append(&LogRecord::Channel(ChannelLogRecord::new(
            device, channel, message,
        )))
    }

    pub fn append_direct(
        &self,
        device: &str,
        remote: &str,
        message: &Message,
    ) -> Result<(), MeshError> {
        self.append(&LogRecord::Direct(DirectLogRecord::new(
            device, remote, message,
        )))
    }

    /// Append one row and flush it
    pub fn append(&self, record: &LogRecord) -> Result<(), MeshError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match record {
            LogRecord::Channel(row) => write_row(&self.channel_path, row),
            LogRecord::Direct(row) => write_row(&self.direct_path, row),
        }
    }

    /// Read both logs, channel rows first. A missing file is an empty log;
    /// rows that do not parse are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<LogRecord>, MeshError> {
        let mut records: Vec<LogRecord> = read_rows::<ChannelLogRecord>(&self.channel_path)?
            .into_iter()
            .map(LogRecord::Channel)
            .collect();
        records.extend(
            read_rows::<DirectLogRecord>(&self.direct_path)?
                .into_iter()
                .map(LogRecord::Direct),
        );
        Ok(records)
    }
}

fn write_row<T: Serialize>(path: &Path, row: &T) -> Result<(), MeshError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::CRLF)
        .from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, MeshError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No message log at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<T>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => warn!(
                "Skipping malformed row {row} in {path}: {e}",
                row = line + 1,
                path = path.display()
            ),
        }
    }
    Ok(rows)
}

/// Append every record to the store's buffers in log order.
///
/// Returns how many records were applied; records with an unreadable
/// timestamp are skipped.
pub fn replay(records: &[LogRecord], store: &mut StateStore) -> usize {
    let mut applied = 0;

    for record in records {
        match record {
            LogRecord::Channel(row) => match row.to_message() {
                Ok(message) => {
                    store.append_channel_message(&row.device, &row.channel_key(), message);
                    applied += 1;
                }
                Err(e) => warn!("Skipping channel log row with bad timestamp {:?}: {e}", row.timestamp),
            },
            LogRecord::Direct(row) => match row.to_message() {
                Ok(message) => {
                    store.append_direct_message(&row.device, &row.remote, message);
                    applied += 1;
                }
                Err(e) => warn!("Skipping direct log row with bad timestamp {:?}: {e}", row.timestamp),
            },
        }
    }

    debug!("Replayed {applied} of {total} logged message(s)", total = records.len());
    applied
}
