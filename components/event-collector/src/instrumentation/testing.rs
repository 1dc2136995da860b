//! Layer that records emitted events so tests can assert on the operational log.

// External crates
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{
    Level, Subscriber,
    field::{Field, Visit},
    subscriber::DefaultGuard,
};
use tracing_subscriber::{layer::Context, prelude::*, registry::Registry, Layer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub level: Level,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureLayer {
    records: Arc<Mutex<Vec<Captured>>>,
}

impl CaptureLayer {
    /// Install a fresh capture layer as the default subscriber of this thread.
    pub fn install() -> (Self, DefaultGuard) {
        let layer = Self::default();
        let guard = tracing::subscriber::set_default(Registry::default().with(layer.clone()));
        (layer, guard)
    }

    pub fn records(&self) -> Vec<Captured> {
        self.records.lock().unwrap().clone()
    }

    pub fn for_target(&self, target: &str) -> Vec<Captured> {
        self.records()
            .into_iter()
            .filter(|r| r.target == target)
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.records.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}
