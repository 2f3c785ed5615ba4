//! Terminal-state notification hooks.

use std::io::Write;

use crate::watch::CiWatchOutcome;

/// Called once when a watch reaches `Success` or `Failure`.
///
/// Purely observational; implementations must not fail the watch.
pub trait Notifier: Send + Sync {
    fn notify(&self, outcome: &CiWatchOutcome);
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalBell;

impl Notifier for TerminalBell {
    fn notify(&self, _outcome: &CiWatchOutcome) {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}
