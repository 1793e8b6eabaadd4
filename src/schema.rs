use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::harness::IterationSample;
use crate::OutputShape;

/// Complete telemetry for one run.
///
/// Per-core collections are indexed by core, then by iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub wallclock_times: Vec<f64>,
    pub core_cycle_counts: Vec<Vec<u64>>,
    pub aperf_counts: Vec<Vec<u64>>,
    pub mperf_counts: Vec<Vec<u64>>,
}

impl RunResult {
    /// Zero-filled storage for the whole run, so nothing is reallocated
    /// between iterations.
    pub fn preallocated(iterations: usize, cores: usize) -> Self {
        Self {
            wallclock_times: vec![0.0; iterations],
            core_cycle_counts: vec![vec![0; iterations]; cores],
            aperf_counts: vec![vec![0; iterations]; cores],
            mperf_counts: vec![vec![0; iterations]; cores],
        }
    }

    pub fn num_cores(&self) -> usize {
        self.core_cycle_counts.len()
    }

    pub(crate) fn record(&mut self, sample: &IterationSample<'_>) {
        let i = sample.index;
        self.wallclock_times[i] = sample.wallclock;
        for core in 0..self.num_cores() {
            self.core_cycle_counts[core][i] = sample.core_cycles(core);
            self.aperf_counts[core][i] = sample.aperf(core);
            self.mperf_counts[core][i] = sample.mperf(core);
        }
    }

    /// Render the record as one line of JSON (without the newline).
    pub fn render(&self, shape: OutputShape) -> Result<String, HarnessError> {
        let json = match shape {
            OutputShape::Extended => serde_json::to_string(self),
            OutputShape::Minimal => serde_json::to_string(&self.wallclock_times),
        };
        Ok(json.map_err(io::Error::other)?)
    }

    /// Write the complete record with a single write and flush.
    pub fn emit(&self, shape: OutputShape, out: &mut dyn Write) -> Result<(), HarnessError> {
        let mut line = self.render(shape)?;
        line.push('\n');
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}
