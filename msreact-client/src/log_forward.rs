//! Tracing layer that turns events into [`AcqRequest::Log`] messages, so a
//! worker process logs through its outbound link instead of its own outputs.

use std::fmt::Write;

use chrono::Utc;
use crossbeam_channel::Sender;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{layer::Context, Layer};

use crate::command::{AcqRequest, LogLevel, LogRecord};

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

pub struct ForwardingLayer {
    sender: Sender<AcqRequest>,
}

impl ForwardingLayer {
    #[must_use]
    pub const fn new(sender: Sender<AcqRequest>) -> Self {
        Self { sender }
    }
}

impl<S> Layer<S> for ForwardingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut message = if visitor.message.is_empty() {
            metadata.name().to_string()
        } else {
            visitor.message
        };
        message.push_str(&visitor.fields);

        // nowhere left to report a closed link
        let _ = self.sender.send(AcqRequest::Log(LogRecord {
            level: LogLevel::from(metadata.level()),
            target: metadata.target().to_string(),
            message,
            timestamp: Utc::now(),
        }));
    }
}
