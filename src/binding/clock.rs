use std::io;

use crate::binding::{MeasurementBackend, Slot, Snapshot};
use crate::error::HarnessError;

#[cfg(target_os = "linux")]
const MONOTONIC_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC_RAW;
#[cfg(all(unix, not(target_os = "linux")))]
const MONOTONIC_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Seconds from an arbitrary fixed origin, never adjusted by NTP or the user.
///
/// On Linux this is `CLOCK_MONOTONIC_RAW`, which (unlike `CLOCK_MONOTONIC`)
/// is not slewed.
#[cfg(unix)]
#[inline(always)]
pub fn now_monotonic() -> io::Result<f64> {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: `ts` points to writable storage for one timespec.
    if unsafe { libc::clock_gettime(MONOTONIC_CLOCK, ts.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: clock_gettime filled `ts` on success.
    let ts = unsafe { ts.assume_init() };
    Ok(ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9)
}

#[cfg(not(unix))]
#[inline(always)]
pub fn now_monotonic() -> io::Result<f64> {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    Ok(ORIGIN.get_or_init(Instant::now).elapsed().as_secs_f64())
}

/// Wall-clock-only backend, for hosts without readable performance counters.
#[derive(Debug, Default)]
pub struct ClockBackend {
    slots: [Snapshot; 2],
}

impl ClockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeasurementBackend for ClockBackend {
    fn name(&self) -> &'static str {
        "clock"
    }

    fn init(&mut self) -> Result<(), HarnessError> {
        now_monotonic().map_err(|e| HarnessError::unavailable("clock", e))?;
        Ok(())
    }

    fn done(&mut self) {}

    fn num_cores(&self) -> usize {
        0
    }

    #[inline(always)]
    fn measure(&mut self, slot: Slot) -> Result<(), HarnessError> {
        self.slots[slot.index()].wallclock =
            now_monotonic().map_err(|e| HarnessError::unavailable("clock", e))?;
        Ok(())
    }

    fn snapshot(&self, slot: Slot) -> &Snapshot {
        &self.slots[slot.index()]
    }
}
