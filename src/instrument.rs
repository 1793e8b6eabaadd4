//! Per-iteration runtime instrumentation on the diagnostic channel.
//!
//! Each event is one line:
//!
//! ```text
//! @@@ RUNTIME_EVENTS: [iter, compile_ms, [[collector, [pool, ...], time_ms, count], ...]]
//! ```
//!
//! Times are cumulative milliseconds and counts are cumulative. Collector names
//! are not assumed unique, so collectors are a list rather than a map. Lines
//! are written whole and flushed immediately; consumers find them by the
//! marker, not by position.

use std::io::{self, Write};

use serde::ser::{Serialize, SerializeTuple, Serializer};

use crate::alloc;
use crate::error::HarnessError;

pub const EVENT_MARKER: &str = "@@@ RUNTIME_EVENTS: ";

/// Cumulative activity of one memory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorRecord {
    pub name: String,
    pub pools: Vec<String>,
    pub collect_time_ms: u64,
    pub collect_count: u64,
}

impl Serialize for CollectorRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&self.name)?;
        tup.serialize_element(&self.pools)?;
        tup.serialize_element(&self.collect_time_ms)?;
        tup.serialize_element(&self.collect_count)?;
        tup.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationEvent {
    pub iteration: usize,
    pub compile_time_ms: u64,
    pub collectors: Vec<CollectorRecord>,
}

impl Serialize for InstrumentationEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.iteration)?;
        tup.serialize_element(&self.compile_time_ms)?;
        tup.serialize_element(&self.collectors)?;
        tup.end()
    }
}

/// Source of host runtime statistics.
pub trait RuntimeProbe {
    /// Cumulative time spent compiling code, in milliseconds.
    fn compile_time_ms(&self) -> u64;

    /// Current collectors. Called afresh for every event since the set may
    /// change while the process runs.
    fn collectors(&self) -> Vec<CollectorRecord>;
}

/// Probe for an ahead-of-time compiled process.
///
/// Compile time is always zero. Collectors are the counting global allocator
/// and the kernel page-fault handler (`getrusage`), whose time is the
/// cumulative system CPU time.
#[derive(Debug, Default)]
pub struct ProcessProbe;

impl RuntimeProbe for ProcessProbe {
    fn compile_time_ms(&self) -> u64 {
        0
    }

    fn collectors(&self) -> Vec<CollectorRecord> {
        let allocations = alloc::allocation_count();
        let faults = page_faults();

        let mut out = vec![CollectorRecord {
            name: "global-allocator".to_string(),
            pools: vec!["heap".to_string()],
            collect_time_ms: 0,
            collect_count: allocations,
        }];
        out.extend(faults.map(|(stime_ms, faults)| CollectorRecord {
            name: "page-faults".to_string(),
            pools: vec!["resident".to_string()],
            collect_time_ms: stime_ms,
            collect_count: faults,
        }));
        out
    }
}

/// Cumulative system CPU milliseconds and minor plus major faults.
#[cfg(unix)]
fn page_faults() -> Option<(u64, u64)> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: `usage` points to writable storage for one rusage.
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
        return None;
    }
    // SAFETY: zero-initialised and filled by getrusage.
    let usage = unsafe { usage.assume_init() };
    let stime_ms = usage.ru_stime.tv_sec as u64 * 1000 + usage.ru_stime.tv_usec as u64 / 1000;
    Some((stime_ms, (usage.ru_minflt + usage.ru_majflt) as u64))
}

#[cfg(not(unix))]
fn page_faults() -> Option<(u64, u64)> {
    None
}

/// Builds and writes one event per iteration.
pub struct Collector {
    probe: Box<dyn RuntimeProbe>,
    line: String,
}

impl Collector {
    /// Collector over the running process.
    pub fn new() -> Self {
        Self::with_probe(Box::new(ProcessProbe))
    }

    pub fn with_probe(probe: Box<dyn RuntimeProbe>) -> Self {
        Self {
            probe,
            line: String::with_capacity(256),
        }
    }

    pub fn event(&self, iteration: usize) -> InstrumentationEvent {
        InstrumentationEvent {
            iteration,
            compile_time_ms: self.probe.compile_time_ms(),
            collectors: self.probe.collectors(),
        }
    }

    /// Write the event for `iteration` as one marker line and flush.
    ///
    /// Allocations made here are not counted, so consecutive events differ
    /// only by what ran between them.
    pub fn emit(&mut self, iteration: usize, out: &mut dyn Write) -> Result<(), HarnessError> {
        alloc::untracked(|| -> Result<(), HarnessError> {
            let event = self.event(iteration);
            let json = serde_json::to_string(&event).map_err(io::Error::other)?;

            self.line.clear();
            self.line.push_str(EVENT_MARKER);
            self.line.push_str(&json);
            self.line.push('\n');

            out.write_all(self.line.as_bytes())?;
            out.flush()?;
            Ok(())
        })
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}
