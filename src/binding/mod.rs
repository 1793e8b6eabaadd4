//! Measurement binding: process-wide clock and counter session.
//!
//! A backend captures a complete [`Snapshot`] into one of two slots per call to
//! [`MeasurementBackend::measure`]. The iteration loop only ever talks to a
//! backend through a [`Session`], which brackets the run with exactly one
//! `init` and exactly one `done`, including on early error returns.

mod clock;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod msr;

#[cfg(test)]
pub(crate) mod fake;

use clap::ValueEnum;
use tracing::debug;

use crate::error::HarnessError;

pub use clock::{now_monotonic, ClockBackend};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use msr::MsrBackend;

/// Default device node template for the per-core MSR backend.
///
/// `{core}` is replaced with the logical core index.
pub const DEFAULT_MSR_DEVICE: &str = "/dev/cpu/{core}/rmsr";

/// Which snapshot a measurement lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Start,
    Stop,
}

impl Slot {
    #[inline(always)]
    pub fn index(self) -> usize {
        match self {
            Slot::Start => 0,
            Slot::Stop => 1,
        }
    }
}

/// Readings taken at one instant: the wall clock plus one value per core for
/// each hardware counter. Backends without counters leave the vectors empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub wallclock: f64,
    pub core_cycles: Vec<u64>,
    pub aperf: Vec<u64>,
    pub mperf: Vec<u64>,
}

impl Snapshot {
    pub fn with_cores(cores: usize) -> Self {
        Self {
            wallclock: 0.0,
            core_cycles: vec![0; cores],
            aperf: vec![0; cores],
            mperf: vec![0; cores],
        }
    }
}

/// A clock and counter source.
///
/// Constructing a backend must not touch the hardware; all acquisition
/// happens in `init`.
pub trait MeasurementBackend {
    fn name(&self) -> &'static str;

    fn init(&mut self) -> Result<(), HarnessError>;

    fn done(&mut self);

    /// Number of cores with per-core counters. Zero for clock-only backends.
    fn num_cores(&self) -> usize;

    fn measure(&mut self, slot: Slot) -> Result<(), HarnessError>;

    fn snapshot(&self, slot: Slot) -> &Snapshot;
}

/// Scoped ownership of an initialised backend.
pub struct Session<'a> {
    backend: &'a mut dyn MeasurementBackend,
    open: bool,
}

impl<'a> Session<'a> {
    pub fn open(backend: &'a mut dyn MeasurementBackend) -> Result<Self, HarnessError> {
        backend.init()?;
        debug!(
            backend = backend.name(),
            cores = backend.num_cores(),
            "measurement session opened"
        );
        Ok(Self {
            backend,
            open: true,
        })
    }

    pub fn num_cores(&self) -> usize {
        self.backend.num_cores()
    }

    #[inline(always)]
    pub fn measure(&mut self, slot: Slot) -> Result<(), HarnessError> {
        self.backend.measure(slot)
    }

    pub fn snapshot(&self, slot: Slot) -> &Snapshot {
        self.backend.snapshot(slot)
    }

    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.open {
            self.open = false;
            self.backend.done();
            debug!(backend = self.backend.name(), "measurement session closed");
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Counter source selection.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum CounterSource {
    /// Per-core MSR counters when the device nodes exist, else clock only.
    #[default]
    Auto,
    /// Per-core core-cycle, APERF and MPERF counters via MSR device nodes.
    Msr,
    /// Monotonic wall clock only.
    Clock,
}

/// Expand a device template for one core.
pub fn device_path(template: &str, core: usize) -> std::path::PathBuf {
    template.replace("{core}", &core.to_string()).into()
}

/// Build (but do not initialise) the backend for `source`.
pub fn open_backend(
    source: CounterSource,
    msr_device: &str,
) -> Result<Box<dyn MeasurementBackend>, HarnessError> {
    let source = match source {
        CounterSource::Auto if msr_supported() && device_path(msr_device, 0).exists() => {
            CounterSource::Msr
        }
        CounterSource::Auto => CounterSource::Clock,
        other => other,
    };
    debug!(?source, "selected counter source");

    match source {
        CounterSource::Clock => Ok(Box::new(ClockBackend::new())),
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        CounterSource::Msr => Ok(Box::new(MsrBackend::new(msr_device))),
        #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
        CounterSource::Msr => Err(HarnessError::unavailable(
            "msr",
            "per-core MSR counters need Linux on x86_64",
        )),
        CounterSource::Auto => unreachable!("auto resolved above"),
    }
}

fn msr_supported() -> bool {
    cfg!(all(target_os = "linux", target_arch = "x86_64"))
}
