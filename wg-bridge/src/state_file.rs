// State file writer for external monitoring
//!
//! Writes one `<name>.status` file per tunnel for consumption by external
//! tools like shell prompts and status bar widgets.

use crate::status::Subscription;
use crate::types::TunnelStatus;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::task::JoinHandle;

const STATE_FILE_EXTENSION: &str = "status";

/// Render a status file
pub fn render(status: &TunnelStatus, timestamp: u64) -> String {
    format!(
        "STATE={}\nRX={}\nTX={}\nHANDSHAKE={}\nTIMESTAMP={}\n",
        status.state, status.rx_bytes, status.tx_bytes, status.latest_handshake_millis, timestamp
    )
}

/// Writes per-tunnel status files into a directory
#[derive(Debug, Clone)]
pub struct StateFileWriter {
    dir: PathBuf,
}

impl StateFileWriter {
    /// Create a writer for `dir`; the directory is created on first write
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the file for `name`
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", name, STATE_FILE_EXTENSION))
    }

    /// Write current status of one tunnel
    pub fn write(&self, status: &TunnelStatus) -> Result<()> {
        // Create directory if it doesn't exist
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).context("Failed to create state directory")?;
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        fs::write(self.path(&status.name), render(status, timestamp))
            .context("Failed to write state file")?;

        Ok(())
    }

    /// Write a file for every status on the stream until it closes
    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(status) = subscription.next().await {
                if let Err(e) = self.write(&status) {
                    log::warn!("Failed to write state file for {}: {:#}", status.name, e);
                }
            }
        })
    }
}

/// Remove all state files on shutdown
pub fn cleanup(dir: impl AsRef<Path>) {
    let Ok(entries) = fs::read_dir(dir.as_ref()) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == STATE_FILE_EXTENSION) {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusHub;
    use crate::types::TunnelState;

    fn status() -> TunnelStatus {
        TunnelStatus {
            name: "home".into(),
            state: TunnelState::Up,
            rx_bytes: 1000,
            tx_bytes: 500,
            latest_handshake_millis: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_render() {
        assert_eq!(
            render(&status(), 42),
            "STATE=UP\nRX=1000\nTX=500\nHANDSHAKE=1700000000000\nTIMESTAMP=42\n"
        );
    }

    #[test]
    fn test_write_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateFileWriter::new(dir.path().join("run"));

        writer.write(&status()).unwrap();

        let contents = fs::read_to_string(writer.path("home")).unwrap();
        assert!(contents.starts_with("STATE=UP\nRX=1000\n"));
    }

    #[test]
    fn test_cleanup_only_removes_state_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateFileWriter::new(dir.path());
        writer.write(&status()).unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();

        cleanup(dir.path());

        assert!(!writer.path("home").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_spawned_writer_follows_stream() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateFileWriter::new(dir.path());
        let path = writer.path("home");
        let hub = StatusHub::new();

        let task = writer.spawn(hub.subscribe());
        hub.publish(status());
        hub.close();
        task.await.unwrap();

        assert!(fs::read_to_string(path).unwrap().contains("STATE=UP"));
    }
}
