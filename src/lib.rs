use clap::ValueEnum;

pub mod alloc;
pub mod benches;
pub mod binding;
pub mod error;
pub mod harness;
pub mod instrument;
pub mod registry;
pub mod schema;

pub use error::HarnessError;
pub use harness::{execute, RunConfig};
pub use registry::Registry;
pub use schema::RunResult;

/// Shape of the record written to the primary output.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputShape {
    /// JSON object with `wallclock_times` plus per-core `core_cycle_counts`,
    /// `aperf_counts` and `mperf_counts`.
    #[default]
    Extended,
    /// JSON list of wall-clock times only.
    Minimal,
}
