use std::path::PathBuf;

use derive_more::From;
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use super::models::{Event, Metric};

/// A data point as it is written to the metrics file.
#[derive(Debug, From, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(in crate::metrics) enum Request {
    Metric(Metric),
    Event(Event),
}

pub(in crate::metrics) enum Command {
    Record(Request),
    /// Acknowledges once everything sent before has been written.
    Flush(oneshot::Sender<()>),
}

/// The receiving end of a [`Recorder`], which writes the recorded data points to a file.
///
/// [`Recorder`]: crate::metrics::Recorder
pub struct Dispatcher {
    path: PathBuf,
    append: bool,
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl Dispatcher {
    pub(in crate::metrics) fn new(
        path: PathBuf,
        append: bool,
        receiver: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            path,
            append,
            receiver,
        }
    }

    /// Writes data points until all recorders have been dropped.
    ///
    /// # Errors
    /// Fails if the metrics file can't be opened or written.
    pub async fn run(mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .await?;

        while let Some(command) = self.receiver.recv().await {
            match command {
                Command::Record(request) => match serde_json::to_vec(&request) {
                    Ok(mut line) => {
                        debug!("dispatch metric");
                        line.push(b'\n');
                        file.write_all(&line).await?;
                    }
                    Err(err) => warn!("failed to serialize metric: {}", err),
                },
                Command::Flush(done) => {
                    file.flush().await?;
                    let _ = done.send(());
                }
            }
        }
        file.flush().await
    }
}
