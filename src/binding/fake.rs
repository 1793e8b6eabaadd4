//! Deterministic backends for tests.

use std::collections::VecDeque;

use crate::binding::{MeasurementBackend, Slot, Snapshot};
use crate::error::HarnessError;

/// Backend replaying scripted snapshots, falling back to a steady tick once
/// the script runs out. Counts every lifecycle call so tests can spy on it.
pub(crate) struct ScriptedBackend {
    cores: usize,
    script: VecDeque<Snapshot>,
    tick: u64,
    fail_init: bool,
    slots: [Snapshot; 2],
    pub init_calls: usize,
    pub done_calls: usize,
    pub measure_calls: usize,
}

impl ScriptedBackend {
    /// Every measurement advances the clock by 0.25s and each core's
    /// counters by 1000, 800 and 900 (plus the core index).
    pub fn ticking(cores: usize) -> Self {
        Self::scripted(cores, Vec::new())
    }

    pub fn scripted(cores: usize, script: Vec<Snapshot>) -> Self {
        Self {
            cores,
            script: script.into(),
            tick: 0,
            fail_init: false,
            slots: [Snapshot::with_cores(cores), Snapshot::with_cores(cores)],
            init_calls: 0,
            done_calls: 0,
            measure_calls: 0,
        }
    }

    pub fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Self::ticking(0)
        }
    }

    fn next_tick(&mut self) -> Snapshot {
        self.tick += 1;
        let t = self.tick;
        Snapshot {
            wallclock: t as f64 * 0.25,
            core_cycles: (0..self.cores as u64).map(|c| t * 1000 + c).collect(),
            aperf: (0..self.cores as u64).map(|c| t * 800 + c).collect(),
            mperf: (0..self.cores as u64).map(|c| t * 900 + c).collect(),
        }
    }
}

/// Snapshot with the same counter values on every core.
pub(crate) fn uniform(cores: usize, wallclock: f64, cycles: u64, aperf: u64, mperf: u64) -> Snapshot {
    Snapshot {
        wallclock,
        core_cycles: vec![cycles; cores],
        aperf: vec![aperf; cores],
        mperf: vec![mperf; cores],
    }
}

impl MeasurementBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn init(&mut self) -> Result<(), HarnessError> {
        self.init_calls += 1;
        if self.fail_init {
            return Err(HarnessError::unavailable("scripted", "init refused"));
        }
        Ok(())
    }

    fn done(&mut self) {
        self.done_calls += 1;
    }

    fn num_cores(&self) -> usize {
        self.cores
    }

    fn measure(&mut self, slot: Slot) -> Result<(), HarnessError> {
        self.measure_calls += 1;
        let snap = match self.script.pop_front() {
            Some(snap) => snap,
            None => self.next_tick(),
        };
        self.slots[slot.index()] = snap;
        Ok(())
    }

    fn snapshot(&self, slot: Slot) -> &Snapshot {
        &self.slots[slot.index()]
    }
}
