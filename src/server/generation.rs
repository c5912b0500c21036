// Generation module
// Identity of the running process instance

use chrono::{DateTime, Local};
use serde::Serialize;

/// One OS process instance of the service.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Generation {
    pub pid: u32,
    /// Recovered an inherited listener instead of binding
    pub inherited: bool,
    pub started_at: DateTime<Local>,
}

impl Generation {
    pub fn current(inherited: bool) -> Self {
        Self {
            pid: std::process::id(),
            inherited,
            started_at: Local::now(),
        }
    }
}
