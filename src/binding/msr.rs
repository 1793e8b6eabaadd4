//! Per-core hardware counters read through MSR device nodes.
//!
//! The default device template points at `rmsr`, a variant of the stock
//! `msr` driver that honours ordinary file permissions instead of requiring
//! `CAP_SYS_RAWIO`. Any template with a `{core}` placeholder works, so the
//! stock `/dev/cpu/{core}/msr` can be used when running privileged.
//!
//! Counters sampled per core:
//!
//! - fixed-function counter 1 (`CPU_CLK_UNHALTED.CORE`), masked to the
//!   counter width advertised by CPUID leaf 0xA
//! - `IA32_APERF` and `IA32_MPERF`, full 64-bit

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::binding::{device_path, now_monotonic, MeasurementBackend, Slot, Snapshot};
use crate::error::HarnessError;

const NAME: &str = "msr";

const MSR_IA32_FIXED_CTR_CTRL: u64 = 0x38d;
const MSR_IA32_PERF_FIXED_CTR1: u64 = 0x30a;
const IA32_MPERF: u64 = 0xe7;
const IA32_APERF: u64 = 0xe8;

// Fixed counter 1 enable bits in IA32_FIXED_CTR_CTRL: ring 0, ring > 0, any thread.
const EN1_OS: u64 = 1 << 4;
const EN1_USR: u64 = 1 << 5;
const EN1_ANYTHR: u64 = 1 << 6;

pub struct MsrBackend {
    device_template: String,
    nodes: Vec<File>,
    cycles_mask: u64,
    slots: [Snapshot; 2],
}

impl MsrBackend {
    pub fn new(device_template: impl Into<String>) -> Self {
        Self {
            device_template: device_template.into(),
            nodes: Vec::new(),
            cycles_mask: u64::MAX,
            slots: Default::default(),
        }
    }

    fn open_nodes(&self, cores: usize) -> Result<Vec<File>, HarnessError> {
        (0..cores)
            .map(|core| {
                let path = device_path(&self.device_template, core);
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| HarnessError::unavailable(NAME, format!("{}: {e}", path.display())))
            })
            .collect()
    }
}

impl MeasurementBackend for MsrBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self) -> Result<(), HarnessError> {
        let width = fixed_counter_width().map_err(|reason| HarnessError::unavailable(NAME, reason))?;
        let cores = online_cores().map_err(|e| HarnessError::unavailable(NAME, e))?;
        let nodes = self.open_nodes(cores)?;

        let fail = |e: io::Error| HarnessError::unavailable(NAME, e);
        for node in &nodes {
            let ctrl = read_msr(node, MSR_IA32_FIXED_CTR_CTRL).map_err(fail)?;
            write_msr(node, MSR_IA32_FIXED_CTR_CTRL, ctrl | EN1_OS | EN1_USR | EN1_ANYTHR)
                .map_err(fail)?;
            write_msr(node, MSR_IA32_PERF_FIXED_CTR1, 0).map_err(fail)?;
        }
        for node in &nodes {
            write_msr(node, IA32_MPERF, 0).map_err(fail)?;
            write_msr(node, IA32_APERF, 0).map_err(fail)?;
        }

        self.cycles_mask = counter_mask(width);
        self.slots = [Snapshot::with_cores(cores), Snapshot::with_cores(cores)];
        self.nodes = nodes;
        debug!(cores, width, "msr counters configured");
        Ok(())
    }

    fn done(&mut self) {
        self.nodes.clear();
    }

    fn num_cores(&self) -> usize {
        self.nodes.len()
    }

    /// Wall clock is the innermost reading on both sides. APERF and MPERF are
    /// always read in the same order since they are later used as a ratio.
    fn measure(&mut self, slot: Slot) -> Result<(), HarnessError> {
        let fail = |e: io::Error| HarnessError::unavailable(NAME, e);
        let snap = &mut self.slots[slot.index()];
        let mask = self.cycles_mask;

        match slot {
            Slot::Start => {
                for (core, node) in self.nodes.iter().enumerate() {
                    snap.aperf[core] = read_msr(node, IA32_APERF).map_err(fail)?;
                    snap.mperf[core] = read_msr(node, IA32_MPERF).map_err(fail)?;
                    snap.core_cycles[core] =
                        read_msr(node, MSR_IA32_PERF_FIXED_CTR1).map_err(fail)? & mask;
                }
                snap.wallclock = now_monotonic().map_err(fail)?;
            }
            Slot::Stop => {
                snap.wallclock = now_monotonic().map_err(fail)?;
                for (core, node) in self.nodes.iter().enumerate() {
                    snap.core_cycles[core] =
                        read_msr(node, MSR_IA32_PERF_FIXED_CTR1).map_err(fail)? & mask;
                    snap.aperf[core] = read_msr(node, IA32_APERF).map_err(fail)?;
                    snap.mperf[core] = read_msr(node, IA32_MPERF).map_err(fail)?;
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self, slot: Slot) -> &Snapshot {
        &self.slots[slot.index()]
    }
}

#[inline(always)]
fn read_msr(node: &File, addr: u64) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    node.read_exact_at(&mut buf, addr)?;
    Ok(u64::from_ne_bytes(buf))
}

fn write_msr(node: &File, addr: u64, value: u64) -> io::Result<()> {
    node.write_all_at(&value.to_ne_bytes(), addr)
}

fn online_cores() -> io::Result<usize> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn fixed_counter_width() -> Result<u32, String> {
    // SAFETY: CPUID is available on every x86_64 processor.
    #[allow(unused_unsafe)]
    let leaf = unsafe { std::arch::x86_64::__cpuid(0xa) };
    decode_pmu_leaf(leaf.eax, leaf.edx)
}

/// Validate CPUID leaf 0xA and return the fixed-function counter width.
fn decode_pmu_leaf(eax: u32, edx: u32) -> Result<u32, String> {
    let arch_version = eax & 0xff;
    let fixed_counters = edx & 0x1f;
    let width = (edx & 0x1fe0) >> 5;

    // Fixed-function counters appeared in architectural PMU version 2.
    if arch_version < 2 {
        return Err(format!(
            "architectural perfmon version >= 2 required, got {arch_version}"
        ));
    }
    // Fixed counter 1 is the second fixed counter.
    if fixed_counters < 2 {
        return Err(format!("too few fixed-function counters: {fixed_counters}"));
    }
    if width == 0 {
        return Err("fixed-function counter width reported as 0".to_string());
    }
    Ok(width)
}

fn counter_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
