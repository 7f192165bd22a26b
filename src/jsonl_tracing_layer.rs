//! Tracing layer that mirrors log events into daily JSONL files

use crate::log_writer::{LogRecord, LogWriter};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use uuid::Uuid;

/// Writes every tracing event as a [`LogRecord`], tagged with a per-process session id.
pub struct JsonlTracingLayer {
    log_writer: LogWriter,
    session_id: String,
}

impl JsonlTracingLayer {
    pub fn new(log_writer: LogWriter) -> Self {
        Self {
            log_writer,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl<S> Layer<S> for JsonlTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(
            self.session_id.clone(),
            metadata.level().to_string(),
            visitor.message,
        );
        record.target = metadata.target().to_string();
        record.fields = visitor.fields;
        record.file = metadata.file().map(String::from);
        record.line = metadata.line();

        // A failing log sink must never take the proxy down
        let _ = self.log_writer.write_sync(&record);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), Value::String(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }
}
