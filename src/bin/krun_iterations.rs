use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use krun_iterations::alloc::CountingAllocator;
use krun_iterations::binding::{self, CounterSource, DEFAULT_MSR_DEVICE};
use krun_iterations::registry::Contract;
use krun_iterations::{execute, HarnessError, OutputShape, Registry, RunConfig};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

#[derive(Parser, Debug)]
#[command(name = "krun-iterations")]
#[command(version, about = "Run a benchmark for N in-process iterations and report per-iteration timings (JSON output)")]
struct Args {
    /// Registered benchmark name.
    #[arg(value_name = "BENCHMARK", required_unless_present = "list")]
    benchmark: Option<String>,

    /// Number of timed iterations.
    #[arg(value_name = "ITERATIONS", required_unless_present = "list")]
    iterations: Option<usize>,

    /// Size parameter passed to every iteration.
    #[arg(value_name = "PARAM", required_unless_present = "list", allow_negative_numbers = true)]
    param: Option<i32>,

    /// Legacy positional form of --debug (0 or 1).
    #[arg(value_name = "DEBUG", hide = true, value_parser = clap::value_parser!(u8).range(0..=1))]
    legacy_debug: Option<u8>,

    /// Legacy positional form of --instrument (0 or 1).
    #[arg(value_name = "INSTRUMENT", hide = true, value_parser = clap::value_parser!(u8).range(0..=1))]
    legacy_instrument: Option<u8>,

    /// Print a progress line on stderr before each iteration.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Print a runtime event line on stderr after each iteration.
    #[arg(long, default_value_t = false)]
    instrument: bool,

    /// Where per-core counters come from.
    #[arg(long, value_enum, default_value_t = CounterSource::Auto)]
    counters: CounterSource,

    /// MSR device node template; `{core}` is replaced by the core index.
    #[arg(long, value_name = "TEMPLATE", default_value = DEFAULT_MSR_DEVICE)]
    msr_device: String,

    /// Require the benchmark to implement this calling convention.
    #[arg(long, value_enum)]
    contract: Option<Contract>,

    /// Shape of the JSON record.
    #[arg(long, value_enum, default_value_t = OutputShape::Extended)]
    shape: OutputShape,

    /// Where to write the JSON record. If omitted, prints to stdout.
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// List registered benchmarks and exit.
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Debug-level logging on stderr.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig, HarnessError> {
        let (Some(benchmark), Some(iterations), Some(param)) =
            (&self.benchmark, self.iterations, self.param)
        else {
            return Err(HarnessError::Usage(
                "BENCHMARK, ITERATIONS and PARAM are required".to_string(),
            ));
        };

        let mut config = RunConfig::new(benchmark.clone(), iterations, param);
        config.debug = self.debug || self.legacy_debug == Some(1);
        config.instrument = self.instrument || self.legacy_instrument == Some(1);
        config.contract = self.contract;
        config.shape = self.shape;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "krun_iterations=debug"
    } else {
        "krun_iterations=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn list(registry: &Registry, out: &mut dyn Write) -> io::Result<()> {
    for entry in registry.entries() {
        writeln!(
            out,
            "{:<16} {:<9} {}",
            entry.name,
            entry.contract().to_string(),
            entry.description
        )?;
    }
    out.flush()
}

/// Parse `argv`. On failure the rendered clap message (usage, help or
/// version) is written to `out` and the exit status is returned.
fn parse_args<I, T>(argv: I, out: &mut dyn Write) -> Result<Args, u8>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Args::try_parse_from(argv).map_err(|err| {
        let code = match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
            _ => 1,
        };
        let _ = write!(out, "{}", err.render());
        let _ = out.flush();
        code
    })
}

fn run(args: &Args, stdout: &mut dyn Write, diag: &mut dyn Write) -> Result<(), HarnessError> {
    let registry = Registry::global();
    if args.list {
        return Ok(list(&registry, stdout)?);
    }

    let config = args.run_config()?;
    let mut backend = binding::open_backend(args.counters, &args.msr_device)?;

    match &args.out {
        Some(path) => {
            let mut record = Vec::new();
            execute(&config, &registry, backend.as_mut(), &mut record, diag)?;
            fs::write(path, record)?;
        }
        None => {
            execute(&config, &registry, backend.as_mut(), stdout, diag)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let args = match parse_args(std::env::args_os(), &mut out) {
        Ok(args) => args,
        Err(code) => return ExitCode::from(code),
    };

    init_logging(args.verbose);

    let stderr = io::stderr();
    let mut diag = stderr.lock();
    match run(&args, &mut out, &mut diag) {
        Ok(()) => ExitCode::SUCCESS,
        Err(HarnessError::Usage(msg)) => {
            let _ = writeln!(out, "krun-iterations: {msg}\n\n{}", Args::command().render_usage());
            ExitCode::FAILURE
        }
        Err(err) => {
            let _ = writeln!(diag, "krun-iterations: {err}");
            ExitCode::FAILURE
        }
    }
}
