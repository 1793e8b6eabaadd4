use std::io::Write;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, info};

use crate::binding::{MeasurementBackend, Session, Slot, Snapshot};
use crate::error::{Counter, HarnessError};
use crate::instrument::Collector;
use crate::registry::{BenchmarkHandle, Contract, Registry};
use crate::schema::RunResult;
use crate::OutputShape;

/// Tag on progress lines written in debug mode.
pub const PROGRESS_TAG: &str = "[krun-iterations]";

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub benchmark: String,
    pub iterations: usize,
    pub param: i32,
    pub debug: bool,
    pub instrument: bool,
    /// Calling convention the benchmark must implement, if the caller cares.
    pub contract: Option<Contract>,
    pub shape: OutputShape,
}

impl RunConfig {
    pub fn new(benchmark: impl Into<String>, iterations: usize, param: i32) -> Self {
        Self {
            benchmark: benchmark.into(),
            iterations,
            param,
            debug: false,
            instrument: false,
            contract: None,
            shape: OutputShape::default(),
        }
    }
}

/// Unsigned counter difference. Counters are validated `stop >= start`
/// before this is recorded; the arithmetic itself wraps.
#[inline(always)]
pub fn counter_delta(start: u64, stop: u64) -> u64 {
    stop.wrapping_sub(start)
}

/// One validated iteration: the wall-clock delta plus borrowed start and stop
/// readings from which counter deltas are taken.
#[derive(Debug)]
pub struct IterationSample<'s> {
    pub index: usize,
    pub wallclock: f64,
    start: &'s Snapshot,
    stop: &'s Snapshot,
}

impl<'s> IterationSample<'s> {
    /// Check every quantity for `stop >= start`, then build the sample.
    pub fn between(index: usize, start: &'s Snapshot, stop: &'s Snapshot) -> Result<Self, HarnessError> {
        // Written so that a NaN reading is also rejected.
        if !(stop.wallclock >= start.wallclock) {
            return Err(HarnessError::WallclockNotMonotonic {
                start: start.wallclock,
                stop: stop.wallclock,
            });
        }

        let counters = [
            (Counter::CoreCycles, &start.core_cycles, &stop.core_cycles),
            (Counter::Aperf, &start.aperf, &stop.aperf),
            (Counter::Mperf, &start.mperf, &stop.mperf),
        ];
        for core in 0..start.core_cycles.len() {
            for (counter, starts, stops) in counters {
                if stops[core] < starts[core] {
                    return Err(HarnessError::CounterNotMonotonic {
                        counter,
                        core,
                        start: starts[core],
                        stop: stops[core],
                    });
                }
            }
        }

        Ok(Self {
            index,
            wallclock: stop.wallclock - start.wallclock,
            start,
            stop,
        })
    }

    pub fn core_cycles(&self, core: usize) -> u64 {
        counter_delta(self.start.core_cycles[core], self.stop.core_cycles[core])
    }

    pub fn aperf(&self, core: usize) -> u64 {
        counter_delta(self.start.aperf[core], self.stop.aperf[core])
    }

    pub fn mperf(&self, core: usize) -> u64 {
        counter_delta(self.start.mperf[core], self.stop.mperf[core])
    }
}

/// Run the timed iterations of an already-resolved benchmark.
///
/// Opens the measurement session, so the backend sees exactly one `init`
/// and, on every return path, exactly one `done`. Nothing but the benchmark
/// call sits between the start and stop snapshots; progress and
/// instrumentation lines are written outside that window.
pub fn run_iterations(
    config: &RunConfig,
    handle: &mut BenchmarkHandle,
    backend: &mut dyn MeasurementBackend,
    mut collector: Option<&mut Collector>,
    diag: &mut dyn Write,
) -> Result<RunResult, HarnessError> {
    let mut session = Session::open(backend)?;
    let total = config.iterations;
    let param = config.param;
    let mut result = RunResult::preallocated(total, session.num_cores());
    let mut checksum: i64 = 0;

    for i in 0..total {
        if config.debug {
            writeln!(diag, "{PROGRESS_TAG} iteration: {}/{}", i + 1, total)?;
            diag.flush()?;
        }

        session.measure(Slot::Start)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handle.invoke(param, checksum)));
        session.measure(Slot::Stop)?;

        checksum = checksum.wrapping_add(settle(i, outcome)?);

        let sample =
            IterationSample::between(i, session.snapshot(Slot::Start), session.snapshot(Slot::Stop))?;
        result.record(&sample);

        if let Some(collector) = collector.as_deref_mut() {
            collector.emit(i, diag)?;
        }
    }

    session.close();
    debug!(iterations = total, checksum, "iterations complete");
    Ok(result)
}

fn settle(
    iteration: usize,
    outcome: std::thread::Result<Result<i64, crate::registry::BenchError>>,
) -> Result<i64, HarnessError> {
    match outcome {
        Ok(Ok(increment)) => Ok(increment),
        Ok(Err(err)) => Err(HarnessError::BenchmarkInvocation {
            iteration,
            message: err.to_string(),
        }),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "benchmark panicked".to_string()
            };
            Err(HarnessError::BenchmarkInvocation { iteration, message })
        }
    }
}

/// Resolve, measure and emit one run.
///
/// Resolution happens before the backend is initialised, so an unknown or
/// malformed entry point never touches the counters. The record is written
/// to `out` only after the whole run succeeded and the session is closed.
pub fn execute(
    config: &RunConfig,
    registry: &Registry,
    backend: &mut dyn MeasurementBackend,
    out: &mut dyn Write,
    diag: &mut dyn Write,
) -> Result<RunResult, HarnessError> {
    let mut handle = registry.resolve(&config.benchmark, config.contract)?;
    info!(
        benchmark = %config.benchmark,
        iterations = config.iterations,
        param = config.param,
        backend = backend.name(),
        "starting run"
    );

    let mut collector = config.instrument.then(Collector::new);
    let result = run_iterations(config, &mut handle, backend, collector.as_mut(), diag)?;
    result.emit(config.shape, out)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::fake::{uniform, ScriptedBackend};
    use crate::registry::{BenchError, Benchmark, ChecksumBenchmark, EntryPoint};
    use std::cell::RefCell;

    thread_local! {
        static SEEN_CHECKSUMS: RefCell<Vec<i64>> = const { RefCell::new(Vec::new()) };
    }

    /// Returns 1, 1, 2, 3, 5, ... and records the checksum it was handed.
    struct Fibonacci {
        a: i64,
        b: i64,
    }

    impl ChecksumBenchmark for Fibonacci {
        fn run_iter(&mut self, _param: i32, checksum: i64) -> Result<i64, BenchError> {
            SEEN_CHECKSUMS.with(|seen| seen.borrow_mut().push(checksum));
            let out = self.b;
            (self.a, self.b) = (self.b, self.a + self.b);
            Ok(out)
        }
    }

    struct Nothing;

    impl Benchmark for Nothing {
        fn run_iter(&mut self, _param: i32) -> Result<(), BenchError> {
            Ok(())
        }
    }

    struct FailsOnThird {
        calls: usize,
    }

    impl Benchmark for FailsOnThird {
        fn run_iter(&mut self, _param: i32) -> Result<(), BenchError> {
            self.calls += 1;
            if self.calls == 3 {
                return Err("bad checksum: 1615 vs 1616".into());
            }
            Ok(())
        }
    }

    struct Panics;

    impl Benchmark for Panics {
        fn run_iter(&mut self, param: i32) -> Result<(), BenchError> {
            panic!("index {param} out of range");
        }
    }

    fn fibonacci() -> Box<dyn ChecksumBenchmark> {
        Box::new(Fibonacci { a: 0, b: 1 })
    }
    fn nothing() -> Box<dyn Benchmark> {
        Box::new(Nothing)
    }
    fn fails_on_third() -> Box<dyn Benchmark> {
        Box::new(FailsOnThird { calls: 0 })
    }
    fn panics() -> Box<dyn Benchmark> {
        Box::new(Panics)
    }

    static FIB: EntryPoint = EntryPoint::checksum("fib", "fibonacci increments", fibonacci);
    static NOTHING: EntryPoint = EntryPoint::plain("nothing", "empty iteration", nothing);
    static FAILS: EntryPoint = EntryPoint::plain("fails", "errors on iteration 3", fails_on_third);
    static PANICS: EntryPoint = EntryPoint::plain("panics", "panics immediately", panics);

    fn registry() -> Registry {
        Registry::from_entries([&FIB, &NOTHING, &FAILS, &PANICS])
    }

    fn run(
        config: &RunConfig,
        backend: &mut ScriptedBackend,
    ) -> (Result<RunResult, HarnessError>, Vec<u8>, String) {
        let mut out = Vec::new();
        let mut diag = Vec::new();
        let result = execute(config, &registry(), backend, &mut out, &mut diag);
        (result, out, String::from_utf8(diag).unwrap())
    }

    #[test]
    fn iteration_count_fidelity() {
        for n in [0usize, 1, 1000] {
            let mut backend = ScriptedBackend::ticking(2);
            let (result, out, _) = run(&RunConfig::new("nothing", n, 0), &mut backend);
            let result = result.unwrap();

            assert_eq!(result.wallclock_times.len(), n);
            for per_core in [&result.core_cycle_counts, &result.aperf_counts, &result.mperf_counts] {
                assert_eq!(per_core.len(), 2);
                assert!(per_core.iter().all(|iters| iters.len() == n));
            }

            let parsed: RunResult = serde_json::from_slice(&out).unwrap();
            assert_eq!(parsed, result);
            assert_eq!(backend.init_calls, 1);
            assert_eq!(backend.done_calls, 1);
            assert_eq!(backend.measure_calls, 2 * n);
        }
    }

    #[test]
    fn per_core_shape_is_cores_by_iterations() {
        let mut backend = ScriptedBackend::ticking(4);
        let (result, out, _) = run(&RunConfig::new("nothing", 3, 0), &mut backend);
        result.unwrap();

        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        for key in ["core_cycle_counts", "aperf_counts", "mperf_counts"] {
            let outer = json[key].as_array().unwrap();
            assert_eq!(outer.len(), 4, "{key}");
            assert!(outer.iter().all(|inner| inner.as_array().unwrap().len() == 3));
        }
        assert_eq!(json["wallclock_times"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn deltas_are_stop_minus_start() {
        let mut backend = ScriptedBackend::ticking(2);
        let (result, _, _) = run(&RunConfig::new("nothing", 2, 0), &mut backend);
        let result = result.unwrap();

        // Every measurement advances one tick.
        assert_eq!(result.wallclock_times, vec![0.25, 0.25]);
        assert_eq!(result.core_cycle_counts, vec![vec![1000, 1000], vec![1000, 1000]]);
        assert_eq!(result.aperf_counts, vec![vec![800, 800], vec![800, 800]]);
        assert_eq!(result.mperf_counts, vec![vec![900, 900], vec![900, 900]]);
    }

    #[test]
    fn accumulator_threads_running_sum() {
        SEEN_CHECKSUMS.with(|seen| seen.borrow_mut().clear());
        let mut backend = ScriptedBackend::ticking(0);
        let (result, _, _) = run(&RunConfig::new("fib", 6, 0), &mut backend);
        result.unwrap();

        // Increments 1, 1, 2, 3, 5 fold into 1, 2, 4, 7, 12.
        let seen = SEEN_CHECKSUMS.with(|seen| seen.borrow().clone());
        assert_eq!(seen, vec![0, 1, 2, 4, 7, 12]);
    }

    #[test]
    fn decreasing_wallclock_is_fatal_and_silent() {
        let mut backend = ScriptedBackend::scripted(
            1,
            vec![uniform(1, 10.0, 0, 0, 0), uniform(1, 9.5, 1, 1, 1)],
        );
        let (result, out, _) = run(&RunConfig::new("nothing", 3, 0), &mut backend);

        match result {
            Err(HarnessError::WallclockNotMonotonic { start, stop }) => {
                assert_eq!((start, stop), (10.0, 9.5));
            }
            other => panic!("expected wallclock violation, got {other:?}"),
        }
        assert!(out.is_empty());
        assert_eq!(backend.done_calls, 1);
        assert_eq!(backend.measure_calls, 2);
    }

    #[test]
    fn decreasing_counter_is_fatal_and_silent() {
        let start = uniform(2, 1.0, 500, 100, 100);
        let mut stop = uniform(2, 2.0, 600, 200, 200);
        stop.mperf[1] = 99;
        let mut backend = ScriptedBackend::scripted(2, vec![start, stop]);
        let (result, out, _) = run(&RunConfig::new("nothing", 1, 0), &mut backend);

        let err = result.unwrap_err();
        assert!(err.is_monotonicity_violation());
        match err {
            HarnessError::CounterNotMonotonic { counter, core, start, stop } => {
                assert_eq!((counter, core, start, stop), (Counter::Mperf, 1, 100, 99));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.is_empty());
        assert_eq!(backend.done_calls, 1);
    }

    #[test]
    fn counters_are_compared_unsigned() {
        // 2^63 + 1 is negative as i64; stop > start as u64.
        let start = uniform(1, 1.0, 1, 1, 1);
        let stop = uniform(1, 2.0, (1 << 63) + 1, 2, 2);
        let sample = IterationSample::between(0, &start, &stop).unwrap();
        assert_eq!(sample.core_cycles(0), 1 << 63);
    }

    #[test]
    fn unresolvable_benchmark_never_inits_backend() {
        let mut backend = ScriptedBackend::ticking(1);
        let (result, out, _) = run(&RunConfig::new("nbody", 5, 0), &mut backend);

        assert!(matches!(result, Err(HarnessError::EntryPointNotFound { .. })));
        assert!(out.is_empty());
        assert_eq!(backend.init_calls, 0);
        assert_eq!(backend.done_calls, 0);
    }

    #[test]
    fn contract_mismatch_never_inits_backend() {
        let mut backend = ScriptedBackend::ticking(1);
        let mut config = RunConfig::new("nothing", 5, 0);
        config.contract = Some(Contract::Checksum);
        let (result, _, _) = run(&config, &mut backend);

        assert!(matches!(result, Err(HarnessError::EntryPointInvalid { .. })));
        assert_eq!(backend.init_calls, 0);
    }

    #[test]
    fn unavailable_backend_aborts_before_iterating() {
        let mut backend = ScriptedBackend::failing_init();
        let (result, out, _) = run(&RunConfig::new("nothing", 5, 0), &mut backend);

        assert!(matches!(result, Err(HarnessError::MeasurementUnavailable { .. })));
        assert!(out.is_empty());
        assert_eq!(backend.measure_calls, 0);
    }

    #[test]
    fn benchmark_error_aborts_whole_run() {
        let mut backend = ScriptedBackend::ticking(1);
        let (result, out, _) = run(&RunConfig::new("fails", 10, 0), &mut backend);

        match result {
            Err(HarnessError::BenchmarkInvocation { iteration, message }) => {
                assert_eq!(iteration, 2);
                assert_eq!(message, "bad checksum: 1615 vs 1616");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.is_empty());
        assert_eq!(backend.done_calls, 1);
        assert_eq!(backend.measure_calls, 6);
    }

    #[test]
    fn benchmark_panic_is_an_invocation_failure() {
        let mut backend = ScriptedBackend::ticking(0);
        let (result, out, _) = run(&RunConfig::new("panics", 2, 42), &mut backend);

        match result {
            Err(HarnessError::BenchmarkInvocation { iteration, message }) => {
                assert_eq!(iteration, 0);
                assert_eq!(message, "index 42 out of range");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.is_empty());
        assert_eq!(backend.done_calls, 1);
    }

    #[test]
    fn debug_writes_progress_lines() {
        let mut backend = ScriptedBackend::ticking(0);
        let mut config = RunConfig::new("nothing", 3, 0);
        config.debug = true;
        let (result, _, diag) = run(&config, &mut backend);
        result.unwrap();

        assert_eq!(
            diag,
            "[krun-iterations] iteration: 1/3\n\
             [krun-iterations] iteration: 2/3\n\
             [krun-iterations] iteration: 3/3\n"
        );
    }

    #[test]
    fn instrumentation_leaves_primary_output_untouched() {
        let plain = RunConfig::new("fib", 4, 7);
        let mut instrumented = plain.clone();
        instrumented.instrument = true;

        let mut backend_a = ScriptedBackend::ticking(2);
        let (result_a, out_a, diag_a) = run(&plain, &mut backend_a);
        let mut backend_b = ScriptedBackend::ticking(2);
        let (result_b, out_b, diag_b) = run(&instrumented, &mut backend_b);

        assert_eq!(result_a.unwrap(), result_b.unwrap());
        assert_eq!(out_a, out_b);
        assert!(diag_a.is_empty());

        let lines: Vec<&str> = diag_b.lines().collect();
        assert_eq!(lines.len(), 4);
        for (i, line) in lines.iter().enumerate() {
            let body = line.strip_prefix(crate::instrument::EVENT_MARKER).unwrap();
            let event: serde_json::Value = serde_json::from_str(body).unwrap();
            assert_eq!(event[0], i);
        }
    }

    #[test]
    fn minimal_shape_prints_wallclock_only() {
        let mut backend = ScriptedBackend::ticking(2);
        let mut config = RunConfig::new("nothing", 2, 0);
        config.shape = OutputShape::Minimal;
        let (result, out, _) = run(&config, &mut backend);
        result.unwrap();
        assert_eq!(out, b"[0.25,0.25]\n");
    }
}
