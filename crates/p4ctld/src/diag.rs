//! Per-device diagnostic trace log.
//!
//! An append-only record of every request and response exchanged with
//! one device, one file per device. The controller never reads it
//! back; it exists for post-hoc replay and debugging.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::warn;

/// Append-only request/response log for one device.
#[derive(Debug)]
pub struct DiagLog {
    device: String,
    file: File,
}

impl DiagLog {
    /// Opens (creating if needed) `<dir>/<device>-requests.txt`.
    pub fn create(dir: impl AsRef<Path>, device: &str) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}-requests.txt", device)))?;
        Ok(Self {
            device: device.to_string(),
            file,
        })
    }

    /// Appends one exchange. Write failures are logged, never raised;
    /// diagnostics must not affect the control path.
    pub fn record(&mut self, direction: &str, message: &str) {
        if let Err(e) = writeln!(self.file, "{} {}", direction, message) {
            warn!(device = %self.device, error = %e, "Failed to append diagnostic record");
        }
    }
}
