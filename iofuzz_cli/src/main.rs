use iofuzz_core::config::{IoFuzzConfig, Mode, Verbosity};
use iofuzz_core::driver::{CancelToken, Generator, RunLimits, Watchdog, replay};
use iofuzz_core::error::FuzzError;
use iofuzz_core::event::{JsonLineLogger, LogDestination};
use iofuzz_core::fuzzer::IoFuzzer;
use iofuzz_core::port_io::{NullPortIo, PortIo};
use iofuzz_core::parse_number;

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// I/O port address space fuzzer.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Enable debug mode.
    #[clap(short, long)]
    debug: bool,
    /// Generate inputs with a seeded pseudorandom generator.
    #[clap(short, long)]
    generate: bool,
    /// Append log records to FILE instead of stdout.
    #[clap(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Comma separated I/O ports or ranges (default: all ports).
    #[clap(short, long, value_name = "LIST")]
    ports: Option<String>,
    /// Enable quiet mode.
    #[clap(short, long)]
    quiet: bool,
    /// Seed for the pseudorandom generator (default: 1).
    #[clap(short, long, value_parser = parse_u64)]
    seed: Option<u64>,
    /// Timeout, in seconds, for each iteration (default: 5, 0 disables).
    #[clap(short, long, value_parser = parse_u64)]
    timeout: Option<u64>,
    /// Enable verbose mode.
    #[clap(short, long)]
    verbose: bool,
    /// Stop generation after NUM iterations.
    #[clap(short = 'n', long, value_parser = parse_u64)]
    iterations: Option<u64>,
    /// Log operations without touching hardware.
    #[clap(long)]
    dry_run: bool,
    /// Input to replay (default: stdin).
    input: Option<PathBuf>,
}

fn parse_u64(text: &str) -> Result<u64, String> {
    parse_number(text).map_err(|e| e.to_string())
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbosity: Verbosity) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(verbosity.level_filter());
    }
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

fn install_signal_handlers(token: CancelToken) {
    let _ = CANCEL.set(token);
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn load_config(path: Option<&Path>) -> Result<IoFuzzConfig, anyhow::Error> {
    match path {
        Some(config_path) => IoFuzzConfig::load_from_file(config_path),
        None => {
            let default_config_path = PathBuf::from("iofuzz.toml");
            if default_config_path.exists() {
                IoFuzzConfig::load_from_file(&default_config_path)
            } else {
                Ok(IoFuzzConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut IoFuzzConfig, cli: &Cli) {
    if cli.generate {
        config.fuzzer.mode = Mode::Generate;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = seed;
    }
    if let Some(timeout) = cli.timeout {
        config.fuzzer.timeout_secs = timeout;
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if cli.dry_run {
        config.fuzzer.dry_run = true;
    }
    if let Some(ports) = &cli.ports {
        config.target.ports = Some(ports.clone());
    }
    if let Some(output) = &cli.output {
        config.output.path = Some(output.clone());
    }
    if cli.debug {
        config.output.verbosity = Verbosity::Debug;
    } else if cli.verbose {
        config.output.verbosity = Verbosity::Verbose;
    } else if cli.quiet {
        config.output.verbosity = Verbosity::Quiet;
    }
}

fn open_destination(path: Option<&Path>) -> Result<LogDestination, anyhow::Error> {
    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .read(true)
                .open(path)
                .with_context(|| format!("Failed to open output file {path:?}"))?;
            Ok(LogDestination::new(file))
        }
        None => Ok(LogDestination::stdout()),
    }
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>, anyhow::Error> {
    match path {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read input file {path:?}"))
        }
        None => {
            let mut input = Vec::new();
            std::io::stdin()
                .lock()
                .read_to_end(&mut input)
                .context("Failed to read input from stdin")?;
            Ok(input)
        }
    }
}

fn run<P: PortIo>(
    config: &IoFuzzConfig,
    io: P,
    destination: LogDestination,
    input: Option<&Path>,
) -> Result<(), anyhow::Error> {
    let mut fuzzer = IoFuzzer::new(config.target.port_list()?, io)?;
    fuzzer.set_logger(Some(Box::new(JsonLineLogger::new())));
    fuzzer.set_log_destination(Some(destination));

    let timeout = (config.fuzzer.timeout_secs > 0)
        .then(|| Duration::from_secs(config.fuzzer.timeout_secs));

    match config.fuzzer.mode {
        Mode::Generate => {
            let limits = RunLimits {
                max_iterations: config.fuzzer.max_iterations,
                cancel: CancelToken::new(),
                timeout,
            };
            install_signal_handlers(limits.cancel.clone());

            log::info!(
                "Starting generation with seed {} over {} ports...",
                config.fuzzer.seed,
                if fuzzer.ports().is_empty() {
                    iofuzz_core::MAX_PORTS
                } else {
                    fuzzer.ports().len()
                }
            );
            let start_time = Instant::now();
            let completed = Generator::new(config.fuzzer.seed).run(&mut fuzzer, &limits)?;
            let elapsed = start_time.elapsed();
            log::info!(
                "Generation finished: {completed} iterations in {elapsed:.2?} ({:.2} iter/s)",
                completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
            );
        }
        Mode::Replay => {
            let input = read_input(input)?;
            let watchdog = timeout.map(|timeout| Watchdog::spawn(timeout, fuzzer.error_handler()));
            if let Some(watchdog) = &watchdog {
                watchdog.arm();
            }
            let result = replay(&mut fuzzer, &input);
            if let Some(watchdog) = &watchdog {
                watchdog.disarm();
            }
            match result {
                Ok(invocation) => log::info!(
                    "Replayed {} on port {:#06x}",
                    invocation.operation,
                    invocation.port
                ),
                Err(FuzzError::DestinationClosed) => {
                    log::info!("Replay finished; log destination was closed")
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn run_on_hardware(
    config: &IoFuzzConfig,
    destination: LogDestination,
    input: Option<&Path>,
) -> Result<(), anyhow::Error> {
    iofuzz_core::acquire_io_privilege().context("iopl")?;
    // SAFETY: I/O privilege was acquired above.
    let io = unsafe { iofuzz_core::RawPortIo::new() };
    run(config, io, destination, input)
}

#[cfg(not(target_arch = "x86_64"))]
fn run_on_hardware(
    _config: &IoFuzzConfig,
    _destination: LogDestination,
    _input: Option<&Path>,
) -> Result<(), anyhow::Error> {
    anyhow::bail!("port I/O is only available on x86_64; use --dry-run")
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config_file.as_deref())?;
    apply_overrides(&mut config, &cli);
    init_logging(config.output.verbosity);
    log::debug!("Effective configuration: {config:#?}");

    // Reject a bad port list before touching privileges or files.
    config.target.port_list()?;
    let destination = open_destination(config.output.path.as_deref())?;

    if config.fuzzer.dry_run {
        run(&config, NullPortIo, destination, cli.input.as_deref())
    } else {
        run_on_hardware(&config, destination, cli.input.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "iofuzz_cli", "-g", "-s", "0x10", "-t", "0", "-p", "0x60,0x64", "-n", "3", "-v",
            "--dry-run",
        ]);
        let mut config = IoFuzzConfig::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.fuzzer.mode, Mode::Generate);
        assert_eq!(config.fuzzer.seed, 16);
        assert_eq!(config.fuzzer.timeout_secs, 0);
        assert_eq!(config.fuzzer.max_iterations, Some(3));
        assert!(config.fuzzer.dry_run);
        assert_eq!(config.target.port_list().unwrap(), Some(vec![0x60, 0x64]));
        assert_eq!(config.output.verbosity, Verbosity::Verbose);
    }

    #[test]
    fn debug_wins_over_quiet() {
        let cli = Cli::parse_from(["iofuzz_cli", "-q", "-d"]);
        let mut config = IoFuzzConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.output.verbosity, Verbosity::Debug);
        assert_eq!(config.fuzzer.mode, Mode::Replay);
    }

    #[test]
    fn dry_run_generation_appends_records_to_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iofuzz.log");
        let cli = Cli::parse_from([
            "iofuzz_cli", "-g", "-n", "4", "-t", "0", "--dry-run", "-o",
            path.to_str().unwrap(),
        ]);
        let mut config = IoFuzzConfig::default();
        apply_overrides(&mut config, &cli);

        for _ in 0..2 {
            let destination = open_destination(config.output.path.as_deref()).unwrap();
            run(&config, NullPortIo, destination, None).unwrap();
        }

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 8);
        assert!(written.lines().all(|line| line.starts_with("{\"time\":")));
    }

    #[test]
    fn dry_run_replay_reads_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("case.bin");
        let output = dir.path().join("iofuzz.log");
        std::fs::write(&input, [8u8, 0x41]).unwrap();

        let cli = Cli::parse_from([
            "iofuzz_cli", "--dry-run", "-p", "0x60", "-o", output.to_str().unwrap(),
            input.to_str().unwrap(),
        ]);
        let mut config = IoFuzzConfig::default();
        apply_overrides(&mut config, &cli);
        let destination = open_destination(config.output.path.as_deref()).unwrap();
        run(&config, NullPortIo, destination, cli.input.as_deref()).unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.ends_with(",\"function\":\"write8\",\"port\":96,\"value\":65}\n"));
    }
}
