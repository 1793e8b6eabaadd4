//! Benchmarks shipped with the runner.

use crate::registry::{Benchmark, ChecksumBenchmark};


/// Touch every built-in constructor so the linker keeps their registrations
/// when this crate is linked in as an archive.
pub(crate) fn anchor() {
    let plain: [fn() -> Box<dyn Benchmark>; 2] = [dummy::construct, fannkuch::construct];
    let checksum: [fn() -> Box<dyn ChecksumBenchmark>; 2] = [parallel_sum::construct, sort::construct];
    std::hint::black_box((plain, checksum));
}
