//! Event sink - responsibility and behavior
//!
//! The sink takes the ordered events of a cycle and appends them to the output
//! file, one line per event. It also mirrors every event to the operational log
//! under the `vmware_remote` target at the event's own severity.
//!
//! Two line formats are supported:
//! - `plain`: the formatted message as-is.
//! - `structured`: a self-contained JSON object under a `vmware` key, carrying
//!   timestamp, message, user, the scalar properties and one sub-object per
//!   context attribute present on the event.
//!
//! A structured event that cannot be projected is logged and skipped; the rest
//! of the batch is still written. I/O failures abort the batch.

// Local crates
use crate::{
    metrics::metrics::{EVENTS_SKIPPED_TOTAL, EVENTS_WRITTEN_TOTAL},
    models::event::{AttributeValue, Event, EventAttributes, Severity},
};

// External crates
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::instrument;

/// Target the per-event operational log lines are emitted under.
pub const REMOTE_TARGET: &str = "vmware_remote";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    Plain,
    #[default]
    Structured,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("output directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),
    #[error("output path {} is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("output path {} is not writable", .0.display())]
    NotWritable(PathBuf),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("event {event} has an unusable {attribute} attribute")]
    Projection { event: String, attribute: &'static str },
    #[error("failed to serialize event {event}: {source}")]
    Serialize {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of one `write_events` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub written: usize,
    pub skipped: usize,
}

/// Check that `path` can be used as the output file.
///
/// The parent directory must exist. An existing path must be a regular file
/// that opens for appending; a missing one must be creatable, which is
/// checked with a throwaway file in the parent directory. The output file
/// itself is neither created nor modified.
pub fn validate_output_path(path: &Path) -> Result<(), SinkError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let dir = fs::metadata(parent).map_err(|_| SinkError::MissingDirectory(parent.to_path_buf()))?;
    if !dir.is_dir() {
        return Err(SinkError::MissingDirectory(parent.to_path_buf()));
    }

    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => Err(SinkError::NotAFile(path.to_path_buf())),
        Ok(_) => fs::OpenOptions::new()
            .append(true)
            .open(path)
            .map(drop)
            .map_err(|source| writability_error(path, source)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => tempfile::Builder::new()
            .prefix(".vmwarelog-")
            .tempfile_in(parent)
            .map(drop)
            .map_err(|source| writability_error(parent, source)),
        Err(source) => Err(SinkError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn writability_error(path: &Path, source: io::Error) -> SinkError {
    match source.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
            SinkError::NotWritable(path.to_path_buf())
        }
        _ => SinkError::Io {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Append-only event writer, opened once per run.
#[derive(Debug)]
pub struct EventSink {
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
    mode: SinkMode,
    echo_to_console: bool,
}

impl EventSink {
    #[instrument(
        name = "event_collector_sink::open",
        target = "sink::sink",
        skip_all,
        fields(path = %path.as_ref().display()),
        level = "debug"
    )]
    pub async fn open(
        path: impl AsRef<Path>,
        mode: SinkMode,
        echo_to_console: bool,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        validate_output_path(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(mode = ?mode, "Output file opened in append mode");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            mode,
            echo_to_console,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `events` in order and flush.
    #[instrument(
        name = "event_collector_sink::write_events",
        target = "sink::sink",
        skip_all,
        fields(event_count = events.len()),
        level = "debug"
    )]
    pub async fn write_events(&mut self, events: &[Event]) -> Result<SinkReport, SinkError> {
        let mut report = SinkReport::default();

        for event in events {
            let line = match self.mode {
                SinkMode::Plain => single_line(&event.full_formatted_message),
                SinkMode::Structured => match structured_line(event) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            event_key = ?event.key,
                            created_time = %event.created_time,
                            "Skipping event that could not be serialized"
                        );
                        EVENTS_SKIPPED_TOTAL.inc();
                        report.skipped += 1;
                        continue;
                    }
                },
            };

            self.append_line(&line).await?;
            route_to_operational_log(event);
            if self.echo_to_console {
                println!("{}", event.full_formatted_message);
            }

            EVENTS_WRITTEN_TOTAL.inc();
            report.written += 1;
        }

        self.writer.flush().await.map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(
            written = report.written,
            skipped = report.skipped,
            "Events appended to output file"
        );
        Ok(report)
    }

    async fn append_line(&mut self, line: &str) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.writer.write_all(&buf).await.map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Emit one operational log line at the event's severity.
pub fn route_to_operational_log(event: &Event) {
    let message = event.full_formatted_message.as_str();
    match event.severity {
        Severity::Error => tracing::error!(
            target: REMOTE_TARGET,
            created_time = %event.created_time,
            event_type = %event.type_name,
            "{message}"
        ),
        Severity::Warning => tracing::warn!(
            target: REMOTE_TARGET,
            created_time = %event.created_time,
            event_type = %event.type_name,
            "{message}"
        ),
        Severity::Info => tracing::info!(
            target: REMOTE_TARGET,
            created_time = %event.created_time,
            event_type = %event.type_name,
            "{message}"
        ),
    }
}

/// Build the structured record of one event.
pub fn project_event(event: &Event) -> Result<Value, SinkError> {
    let mut properties = Map::new();
    for (name, value) in event.scalar_attributes() {
        if !is_placeholder(value) {
            properties.insert(name.to_string(), value.clone());
        }
    }

    let mut record = Map::new();
    record.insert("timestamp".into(), json!(event.created_time.to_rfc3339()));
    record.insert("event".into(), json!(event.full_formatted_message));
    record.insert("username".into(), json!(event.user_name));
    record.insert("properties".into(), Value::Object(properties));

    for (slot, value) in event.context_attributes() {
        let projected = match value {
            AttributeValue::Reference { name } if name.trim().is_empty() => {
                return Err(SinkError::Projection {
                    event: describe(event),
                    attribute: slot.wire_name(),
                });
            }
            AttributeValue::Reference { name } => json!({ "name": name }),
            AttributeValue::Raw(raw) if is_placeholder(raw) => continue,
            AttributeValue::Raw(raw) => raw.clone(),
        };
        record.insert(slot.wire_name().to_string(), projected);
    }

    Ok(json!({ "vmware": record }))
}

fn structured_line(event: &Event) -> Result<String, SinkError> {
    let record = project_event(event)?;
    serde_json::to_string(&record).map_err(|source| SinkError::Serialize {
        event: describe(event),
        source,
    })
}

fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn single_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}

fn describe(event: &Event) -> String {
    match event.key {
        Some(key) => format!("{}#{key}", event.type_name),
        None => format!("{}@{}", event.type_name, event.created_time.to_rfc3339()),
    }
}
