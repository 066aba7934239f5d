use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::{Command, Dispatcher, Event, Measurement, Metric, Request, Tags};

/// A JSON lines metrics / events recorder.
#[derive(Debug, Clone)]
pub struct Recorder {
    sender: mpsc::UnboundedSender<Command>,
}

impl Recorder {
    /// Creates a new recorder for the file at `path`. An existing file is truncated once the
    /// returned [`Dispatcher`] runs.
    ///
    /// Nothing is written until the returned [`Dispatcher`] runs.
    pub fn new(path: impl Into<PathBuf>) -> (Self, Dispatcher) {
        Self::with_mode(path.into(), false)
    }

    /// Creates a new recorder that appends to the file at `path`.
    pub fn appending(path: impl Into<PathBuf>) -> (Self, Dispatcher) {
        Self::with_mode(path.into(), true)
    }

    fn with_mode(path: PathBuf, append: bool) -> (Self, Dispatcher) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, Dispatcher::new(path, append, receiver))
    }

    /// Records a new metric.
    pub fn metric(&self, measurement: Measurement, value: impl Into<Value>, tags: Option<Tags>) {
        let mut metric = Metric::new(measurement, value);
        if let Some(tags) = tags {
            metric = metric.with_tags(tags);
        }
        self.call(metric.into())
    }

    /// Records a new event.
    pub fn event<T, D>(&self, title: T, description: Option<D>, tags: Option<&[&str]>)
    where
        T: Into<String>,
        D: Into<String>,
    {
        let mut event = Event::new(title);
        if let Some(description) = description {
            event = event.with_description(description);
        }
        if let Some(tags) = tags {
            event = event.with_tags(tags);
        }
        self.call(event.into())
    }

    /// Waits until everything recorded so far has been written.
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.sender.send(Command::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }

    fn call(&self, req: Request) {
        if self.sender.send(Command::Record(req)).is_err() {
            warn!("metrics dispatcher is gone");
        }
    }
}
