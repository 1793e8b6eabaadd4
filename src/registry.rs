//! Benchmark entry points, registered statically and resolved by name.
//!
//! Benchmarks register an [`EntryPoint`] with `inventory::submit!`. At startup
//! [`Registry::global`] collects every submission into a name-keyed map, so
//! resolution is a map lookup that happens once, before any measurement.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use clap::ValueEnum;
use tracing::debug;

use crate::error::HarnessError;

/// Error type benchmarks report failures with.
pub type BenchError = Box<dyn Error + Send + Sync>;

/// One iteration of work for a given size parameter.
pub trait Benchmark {
    fn run_iter(&mut self, param: i32) -> Result<(), BenchError>;
}

/// One iteration of work that also folds the running checksum.
///
/// The returned value is added to the checksum passed into the next
/// iteration, which keeps the work observable to the optimiser.
pub trait ChecksumBenchmark {
    fn run_iter(&mut self, param: i32, checksum: i64) -> Result<i64, BenchError>;
}

/// Calling convention of an entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Contract {
    /// `run_iter(param)`
    Plain,
    /// `run_iter(param, checksum) -> checksum`
    Checksum,
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contract::Plain => f.write_str("plain"),
            Contract::Checksum => f.write_str("checksum"),
        }
    }
}

/// Zero-argument constructor for a benchmark instance.
#[derive(Clone, Copy)]
pub enum Constructor {
    Plain(fn() -> Box<dyn Benchmark>),
    Checksum(fn() -> Box<dyn ChecksumBenchmark>),
}

impl Constructor {
    pub fn contract(&self) -> Contract {
        match self {
            Constructor::Plain(_) => Contract::Plain,
            Constructor::Checksum(_) => Contract::Checksum,
        }
    }

    fn build(&self) -> BenchmarkHandle {
        match self {
            Constructor::Plain(new) => BenchmarkHandle::Plain(new()),
            Constructor::Checksum(new) => BenchmarkHandle::Checksum(new()),
        }
    }
}

/// A named, registered benchmark.
pub struct EntryPoint {
    pub name: &'static str,
    pub description: &'static str,
    pub constructor: Constructor,
}

impl EntryPoint {
    pub const fn plain(
        name: &'static str,
        description: &'static str,
        new: fn() -> Box<dyn Benchmark>,
    ) -> Self {
        Self {
            name,
            description,
            constructor: Constructor::Plain(new),
        }
    }

    pub const fn checksum(
        name: &'static str,
        description: &'static str,
        new: fn() -> Box<dyn ChecksumBenchmark>,
    ) -> Self {
        Self {
            name,
            description,
            constructor: Constructor::Checksum(new),
        }
    }

    pub fn contract(&self) -> Contract {
        self.constructor.contract()
    }
}

inventory::collect!(EntryPoint);

/// A constructed benchmark, owned by the iteration loop for the whole run.
pub enum BenchmarkHandle {
    Plain(Box<dyn Benchmark>),
    Checksum(Box<dyn ChecksumBenchmark>),
}

impl BenchmarkHandle {
    pub fn contract(&self) -> Contract {
        match self {
            BenchmarkHandle::Plain(_) => Contract::Plain,
            BenchmarkHandle::Checksum(_) => Contract::Checksum,
        }
    }

    /// Run one iteration, returning the checksum increment (0 for plain
    /// benchmarks).
    #[inline(always)]
    pub fn invoke(&mut self, param: i32, checksum: i64) -> Result<i64, BenchError> {
        match self {
            BenchmarkHandle::Plain(bench) => bench.run_iter(param).map(|()| 0),
            BenchmarkHandle::Checksum(bench) => bench.run_iter(param, checksum),
        }
    }
}

/// Name-keyed view over a set of entry points.
pub struct Registry {
    entries: BTreeMap<&'static str, Vec<&'static EntryPoint>>,
}

impl Registry {
    /// Every entry point submitted anywhere in the binary.
    pub fn global() -> Self {
        crate::benches::anchor();
        Self::from_entries(inventory::iter::<EntryPoint>)
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'static EntryPoint>,
    {
        let mut map: BTreeMap<&'static str, Vec<&'static EntryPoint>> = BTreeMap::new();
        for entry in entries {
            map.entry(entry.name).or_default().push(entry);
        }
        Self { entries: map }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// First registration under each name, in name order.
    pub fn entries(&self) -> impl Iterator<Item = &'static EntryPoint> + '_ {
        self.entries.values().filter_map(|v| v.first().copied())
    }

    /// Look up and construct the benchmark called `name`.
    ///
    /// Constructing the instance may run arbitrary benchmark setup; callers
    /// must do this before the first timed iteration.
    pub fn resolve(
        &self,
        name: &str,
        required: Option<Contract>,
    ) -> Result<BenchmarkHandle, HarnessError> {
        let candidates = self
            .entries
            .get(name)
            .ok_or_else(|| HarnessError::EntryPointNotFound {
                name: name.to_string(),
                known: self.names().iter().map(|s| s.to_string()).collect(),
            })?;

        let entry = match candidates.as_slice() {
            [entry] => *entry,
            many => {
                return Err(HarnessError::EntryPointInvalid {
                    name: name.to_string(),
                    reason: format!("registered {} times", many.len()),
                })
            }
        };

        if let Some(required) = required {
            if entry.contract() != required {
                return Err(HarnessError::EntryPointInvalid {
                    name: name.to_string(),
                    reason: format!(
                        "implements the {} contract, {required} required",
                        entry.contract()
                    ),
                });
            }
        }

        debug!(benchmark = name, contract = %entry.contract(), "resolved entry point");
        Ok(entry.constructor.build())
    }
}
