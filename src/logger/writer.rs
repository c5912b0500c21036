//! Log writer module
//!
//! Opens the append-only log file handed to the tracing subscriber.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Open or create a log file for appending, creating parent directories.
///
/// The file is wrapped in a `Mutex` so it can serve as a subscriber writer
/// shared by every thread.
pub fn open_log_file(path: &Path) -> Result<Mutex<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| log_file_error(path, &e))?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
        .map_err(|e| log_file_error(path, &e))
}

fn log_file_error(path: &Path, err: &std::io::Error) -> Error {
    Error::Logging(format!("cannot open log file {}: {err}", path.display()))
}
