//! Harness error taxonomy.
//!
//! Every variant is fatal at the harness level: the binary maps each one to a
//! non-zero exit and no result record is written after it.

use std::fmt;
use std::io;

use thiserror::Error;

/// Counter kinds checked for monotonicity after every stop snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    CoreCycles,
    Aperf,
    Mperf,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::CoreCycles => "core_cycles",
            Counter::Aperf => "aperf",
            Counter::Mperf => "mperf",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("unknown benchmark `{name}` (known: {})", known.join(", "))]
    EntryPointNotFound { name: String, known: Vec<String> },

    #[error("benchmark `{name}` cannot be run: {reason}")]
    EntryPointInvalid { name: String, reason: String },

    #[error("measurement backend `{backend}` unavailable: {reason}")]
    MeasurementUnavailable { backend: &'static str, reason: String },

    #[error("wallclock error: start={start}, stop={stop}")]
    WallclockNotMonotonic { start: f64, stop: f64 },

    #[error("{counter} error on core {core}: start={start}, stop={stop}")]
    CounterNotMonotonic {
        counter: Counter,
        core: usize,
        start: u64,
        stop: u64,
    },

    #[error("benchmark failed in iteration {iteration}: {message}")]
    BenchmarkInvocation { iteration: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    pub(crate) fn unavailable(backend: &'static str, reason: impl fmt::Display) -> Self {
        HarnessError::MeasurementUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    /// True for both wall-clock and hardware-counter regressions.
    pub fn is_monotonicity_violation(&self) -> bool {
        matches!(
            self,
            HarnessError::WallclockNotMonotonic { .. } | HarnessError::CounterNotMonotonic { .. }
        )
    }
}
