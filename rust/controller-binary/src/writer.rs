//! Hand-off of configuration sections to the out-of-process agent that
//! programs the load balancer.
//!
//! The controller never talks to the load balancer itself; it replaces named
//! sections of a JSON document and an external agent picks the document up.

use std::path::{Path, PathBuf};

use serde_json::Value;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Snafu)]
pub enum WriterError {
    #[snafu(display("config writer is no longer running"))]
    Closed,
    #[snafu(display("failed to write config output: {message}"))]
    Io { message: String },
}

/// Resolves once the writer has applied (or failed to apply) one section
/// replacement.
#[derive(Debug)]
pub struct SectionHandle {
    pub(crate) done: oneshot::Receiver<()>,
    pub(crate) error: oneshot::Receiver<WriterError>,
}

impl SectionHandle {
    pub async fn wait(mut self) -> Result<(), WriterError> {
        tokio::select! {
            res = &mut self.done => match res {
                Ok(()) => Ok(()),
                Err(_) => match self.error.await {
                    Ok(err) => Err(err),
                    Err(_) => Err(WriterError::Closed),
                },
            },
            res = &mut self.error => match res {
                Ok(err) => Err(err),
                Err(_) => match self.done.await {
                    Ok(()) => Ok(()),
                    Err(_) => Err(WriterError::Closed),
                },
            },
        }
    }
}

pub trait ConfigWriter: Send + Sync + 'static {
    /// Queues the replacement of one named section. Fails immediately when
    /// the writer is unavailable; otherwise completion or failure is reported
    /// through the returned handle.
    fn send_section(&self, name: &str, value: Value) -> Result<SectionHandle, WriterError>;
}

struct SectionUpdate {
    name: String,
    value: Value,
    done: oneshot::Sender<()>,
    error: oneshot::Sender<WriterError>,
}

/// Writer that owns a JSON document on disk. Section updates are merged into
/// the document and the file is replaced atomically, so the agent never
/// observes a partial write.
pub struct FileConfigWriter {
    tx: mpsc::UnboundedSender<SectionUpdate>,
}

impl FileConfigWriter {
    /// Spawns the background task owning `path`.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SectionUpdate>();
        tokio::spawn(async move {
            let mut doc = serde_json::Map::new();
            while let Some(update) = rx.recv().await {
                doc.insert(update.name, update.value);
                match write_document(&path, &Value::Object(doc.clone())).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "config document written");
                        let _ = update.done.send(());
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "config document write failed");
                        let _ = update.error.send(err);
                    }
                }
            }
        });
        Self { tx }
    }
}

impl ConfigWriter for FileConfigWriter {
    fn send_section(&self, name: &str, value: Value) -> Result<SectionHandle, WriterError> {
        let (done_tx, done_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        self.tx
            .send(SectionUpdate {
                name: name.to_string(),
                value,
                done: done_tx,
                error: error_tx,
            })
            .map_err(|_| WriterError::Closed)?;
        Ok(SectionHandle {
            done: done_rx,
            error: error_rx,
        })
    }
}

async fn write_document(path: &Path, doc: &Value) -> Result<(), WriterError> {
    let data = serde_json::to_vec(doc).map_err(|err| WriterError::Io {
        message: err.to_string(),
    })?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || replace_file(&path, &data))
        .await
        .map_err(|err| WriterError::Io {
            message: err.to_string(),
        })?
}

fn replace_file(path: &Path, data: &[u8]) -> Result<(), WriterError> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| WriterError::Io {
        message: err.to_string(),
    })?;
    tmp.write_all(data).map_err(|err| WriterError::Io {
        message: err.to_string(),
    })?;
    tmp.persist(path).map_err(|err| WriterError::Io {
        message: err.to_string(),
    })?;
    Ok(())
}
