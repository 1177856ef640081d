//! Status snapshots written to a JSON file for external readers.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};
use watch::WatchSender;

use crate::error::{Error, Result};
use crate::governor::ControllerStatus;

#[derive(Debug, Clone)]
enum StatusUpdate {
    Pending,
    Snapshot(Box<ControllerStatus>),
    Stop,
}

/// Handle the controller publishes snapshots through. Only the latest
/// snapshot is kept if the writer falls behind.
pub struct StatusPublisher {
    sender: Arc<WatchSender<StatusUpdate>>,
}

impl StatusPublisher {
    pub fn publish(&self, status: ControllerStatus) {
        self.sender.send(StatusUpdate::Snapshot(Box::new(status)));
    }
}

/// Background writer of the status file.
pub struct StatusReporter {
    sender: Arc<WatchSender<StatusUpdate>>,
    handle: JoinHandle<()>,
}

impl StatusReporter {
    pub fn spawn(path: PathBuf) -> Result<(Self, StatusPublisher)> {
        let (send, mut recv) = watch::channel(StatusUpdate::Pending);
        let sender = Arc::new(send);

        let handle = thread::Builder::new()
            .name("hotplug-status".to_string())
            .spawn(move || {
                debug!(path = %path.display(), "status reporter started");
                loop {
                    match recv.wait() {
                        StatusUpdate::Pending => continue,
                        StatusUpdate::Snapshot(status) => {
                            if let Err(e) = write_status(&path, &status) {
                                warn!(error = %e, "failed to write status file");
                            }
                        }
                        StatusUpdate::Stop => break,
                    }
                }
            })
            .map_err(|source| Error::Spawn {
                name: "hotplug-status",
                source,
            })?;

        let publisher = StatusPublisher {
            sender: sender.clone(),
        };
        Ok((Self { sender, handle }, publisher))
    }

    pub fn stop(self) {
        self.sender.send(StatusUpdate::Stop);
        if self.handle.join().is_err() {
            warn!("status reporter panicked");
        }
    }
}

/// Default status file location, under the user's runtime directory.
pub fn default_status_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/run"))
        .join("hotplug-governor")
        .join("status.json")
}

/// Writes `status` as JSON, atomically through a temporary file.
pub fn write_status(path: &Path, status: &ControllerStatus) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let mut content = serde_json::to_string_pretty(status)?;
    content.push('\n');

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut file = File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| Error::io(&temp_path, e))?;
    file.flush().map_err(|e| Error::io(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}
