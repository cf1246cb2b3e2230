use std::collections::TryReserveError;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Conditions the fuzzer cannot recover from.
///
/// Every variant except [`FuzzError::DestinationClosed`] is routed through an
/// [`ErrorHandler`] before it is returned; the default handler never returns.
#[derive(Error, Debug)]
pub enum FuzzError {
    /// The input stream produced a selector outside the operation table.
    #[error("selector {0} is outside the operation table")]
    InvalidSelector(u64),

    #[error("failed to reserve {bytes} bytes of scratch space")]
    Allocation {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("failed to write log event")]
    LogWrite(#[source] io::Error),

    #[error("iteration exceeded timeout of {0:?}")]
    IterationTimeout(Duration),

    #[error("failed to acquire I/O privilege")]
    Privilege(#[source] io::Error),

    /// The reading end of the log destination was closed. Not routed through
    /// the error handler: callers stop cleanly.
    #[error("log destination closed")]
    DestinationClosed,
}

impl FuzzError {
    /// OS error code carried by the underlying cause, or 0.
    pub fn os_error(&self) -> i32 {
        match self {
            FuzzError::LogWrite(e) | FuzzError::Privilege(e) => e.raw_os_error().unwrap_or(0),
            FuzzError::Allocation { .. } => libc::ENOMEM,
            _ => 0,
        }
    }
}

/// A fatal condition as handed to an [`ErrorHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub status: i32,
    pub os_error: i32,
    pub message: String,
}

impl ErrorReport {
    /// Renders the report as printed on the diagnostic stream.
    pub fn render(&self) -> String {
        if self.os_error != 0 {
            format!(
                "{}: {}",
                self.message,
                io::Error::from_raw_os_error(self.os_error)
            )
        } else {
            self.message.clone()
        }
    }
}

impl From<&FuzzError> for ErrorReport {
    fn from(err: &FuzzError) -> Self {
        ErrorReport {
            status: libc::EXIT_FAILURE,
            os_error: err.os_error(),
            message: err.to_string(),
        }
    }
}

/// Receives fatal conditions.
///
/// Implementations may terminate the process. If `handle` returns, the
/// caller still abandons the operation that failed.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, report: &ErrorReport);
}

/// Default handler: print the report to stderr and abort, leaving a core
/// dump for post-mortem analysis.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortHandler;

impl ErrorHandler for AbortHandler {
    fn handle(&self, report: &ErrorReport) {
        let _ = io::stdout().flush();
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", report.render());
        let _ = stderr.flush();
        std::process::abort();
    }
}

/// Keeps every report instead of terminating. Used by tests and by drivers
/// that want to inspect failures.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    reports: Mutex<Vec<ErrorReport>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ErrorHandler for CollectingHandler {
    fn handle(&self, report: &ErrorReport) {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(report.clone());
    }
}
