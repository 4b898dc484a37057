use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A log record persisted to the JSONL log file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
}

impl LogQuery {
    fn matches(&self, record: &LogRecord) -> bool {
        self.level.as_ref().map_or(true, |l| &record.level == l)
            && self.target.as_ref().map_or(true, |t| record.target.contains(t.as_str()))
            && self.session_id.as_ref().map_or(true, |s| record.session_id.as_ref() == Some(s))
            && self.since.as_ref().map_or(true, |s| record.timestamp.as_str() >= s.as_str())
    }
}

/// Append-only JSONL sink that persists warn+ logs.
pub struct JsonlLogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogSink {
    pub fn open(path: &Path) -> Result<Self, LogSinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn insert(&self, record: &LogRecord) -> Result<(), LogSinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        Ok(())
    }

    /// Most recent records first, like a `tail`.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, LogSinkError> {
        let _guard = self.file.lock();
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            // Torn or foreign lines are ignored.
            let Ok(record) = serde_json::from_str::<LogRecord>(&line) else {
                continue;
            };
            if q.matches(&record) {
                records.push(record);
            }
        }
        records.reverse();
        records.truncate(q.limit.unwrap_or(100));
        Ok(records)
    }

    pub fn count(&self) -> Result<usize, LogSinkError> {
        Ok(self.query(&LogQuery { limit: Some(usize::MAX), ..Default::default() })?.len())
    }
}

/// tracing Layer that writes warn+ events to a [`JsonlLogSink`].
pub struct JsonlLogLayer {
    sink: Arc<JsonlLogSink>,
}

impl JsonlLogLayer {
    pub fn new(sink: Arc<JsonlLogSink>) -> Self {
        Self { sink }
    }
}

/// Visitor that extracts fields from a tracing event.
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            session_id: None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            "session_id" => self.session_id = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "session_id" => self.session_id = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for JsonlLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Only persist WARN and above
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        if visitor.session_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(fields) = span.extensions().get::<SpanFields>() {
                        visitor.session_id.clone_from(&fields.session_id);
                        break;
                    }
                }
            }
        }

        let span_id = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| format!("{:?}", span.id()));

        let record = LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: (!visitor.fields.is_empty()).then_some(visitor.fields),
            span_id,
            session_id: visitor.session_id,
        };

        if let Err(e) = self.sink.insert(&record) {
            eprintln!("strand-telemetry: failed to persist log record: {e}");
        }
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.session_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    session_id: visitor.session_id,
                });
            }
        }
    }
}

/// Stored on spans to propagate session_id to child events.
struct SpanFields {
    session_id: Option<String>,
}
