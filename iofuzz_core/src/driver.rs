//! Generation and replay loops around [`IoFuzzer::iterate`].

use crate::error::{ErrorHandler, ErrorReport, FuzzError};
use crate::fuzzer::{Invocation, IoFuzzer, MAX_STRING};
use crate::port_io::PortIo;
use arbitrary::Unstructured;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bytes generated per iteration: enough for the port, selector and count
/// headers plus the widest string payload.
pub const MAX_INPUT: usize = 20 + MAX_STRING;

pub const DEFAULT_SEED: u64 = 1;

/// Runs a single iteration over a captured input.
pub fn replay<P: PortIo>(fuzzer: &mut IoFuzzer<P>, input: &[u8]) -> Result<Invocation, FuzzError> {
    let mut u = Unstructured::new(input);
    let invocation = fuzzer.iterate(&mut u)?;
    log::debug!(
        "replayed {} on port {:#06x} using {} of {} input bytes",
        invocation.operation,
        invocation.port,
        input.len() - u.len(),
        input.len()
    );
    Ok(invocation)
}

/// Stops a generation loop between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    /// Stop after this many iterations; run until cancelled when `None`.
    pub max_iterations: Option<u64>,
    pub cancel: CancelToken,
    /// Abort an iteration that runs longer than this.
    pub timeout: Option<Duration>,
}

/// Feeds the fuzzer pseudorandom inputs from a seeded generator.
///
/// The same seed always produces the same sequence of inputs, so a run can
/// be reproduced from its seed and iteration number.
pub struct Generator {
    rng: ChaCha8Rng,
    buffer: Vec<u8>,
}

impl Generator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            buffer: vec![0; MAX_INPUT],
        }
    }

    /// Produces the next input.
    pub fn next_input(&mut self) -> &[u8] {
        self.rng.fill_bytes(&mut self.buffer);
        &self.buffer
    }

    /// Iterates until the limits are hit or the log destination is closed.
    /// Returns the number of completed iterations.
    pub fn run<P: PortIo>(
        &mut self,
        fuzzer: &mut IoFuzzer<P>,
        limits: &RunLimits,
    ) -> Result<u64, FuzzError> {
        let watchdog = limits
            .timeout
            .map(|timeout| Watchdog::spawn(timeout, fuzzer.error_handler()));

        let mut completed = 0u64;
        while !limits.cancel.is_cancelled() {
            if limits.max_iterations.is_some_and(|max| completed >= max) {
                break;
            }

            let mut u = Unstructured::new(self.next_input());

            if let Some(watchdog) = &watchdog {
                watchdog.arm();
            }
            let result = fuzzer.iterate(&mut u);
            if let Some(watchdog) = &watchdog {
                watchdog.disarm();
            }
            match result {
                Ok(_) => {}
                Err(FuzzError::DestinationClosed) => break,
                Err(err) => return Err(err),
            }

            completed += 1;
            if completed % 100_000 == 0 {
                log::info!("{completed} iterations");
            }
        }

        log::info!("generation stopped after {completed} iterations");
        Ok(completed)
    }
}

const WATCHDOG_POLL: Duration = Duration::from_millis(50);

/// Reports an iteration that outlives its timeout.
///
/// The watchdog only observes; the report goes to the error handler, whose
/// default implementation aborts the process.
pub struct Watchdog {
    /// Milliseconds since `epoch` at which the current iteration started,
    /// plus one. Zero while idle.
    armed_at: Arc<AtomicU64>,
    epoch: Instant,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(timeout: Duration, handler: Arc<dyn ErrorHandler>) -> Self {
        let armed_at = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let epoch = Instant::now();

        let thread = {
            let armed_at = Arc::clone(&armed_at);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(WATCHDOG_POLL.min(timeout));
                    let started = armed_at.load(Ordering::SeqCst);
                    if started == 0 {
                        continue;
                    }
                    let now = epoch.elapsed().as_millis() as u64 + 1;
                    if now.saturating_sub(started) > timeout.as_millis() as u64
                        && armed_at
                            .compare_exchange(started, 0, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        let err = FuzzError::IterationTimeout(timeout);
                        log::error!("{err}");
                        handler.handle(&ErrorReport::from(&err));
                    }
                }
            })
        };

        Self {
            armed_at,
            epoch,
            stop,
            thread: Some(thread),
        }
    }

    pub fn arm(&self) {
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        self.armed_at.store(now, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed_at.store(0, Ordering::SeqCst);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectingHandler;
    use crate::event::{JsonLineLogger, LogDestination, MemorySink, SyncWrite};
    use crate::port_io::RecordingPortIo;

    fn collecting_fuzzer() -> (IoFuzzer<RecordingPortIo>, Arc<CollectingHandler>) {
        let handler = Arc::new(CollectingHandler::new());
        let fuzzer =
            IoFuzzer::with_error_handler(None, RecordingPortIo::new(), handler.clone()).unwrap();
        (fuzzer, handler)
    }

    #[test]
    fn replay_runs_exactly_one_iteration() {
        let (mut fuzzer, _handler) = collecting_fuzzer();
        let invocation = replay(&mut fuzzer, &[0x00, 0x60, 8, 0x41]).unwrap();
        assert_eq!(invocation.port, 0x60);
        assert_eq!(fuzzer.io().accesses.len(), 1);
        assert_eq!(fuzzer.io().accesses[0].value, Some(0x41));
    }

    #[test]
    fn replay_of_empty_input_reads_zeros() {
        let (mut fuzzer, _handler) = collecting_fuzzer();
        let invocation = replay(&mut fuzzer, &[]).unwrap();
        assert_eq!(invocation.port, 0);
        assert_eq!(invocation.operation.selector(), 0);
    }

    #[test]
    fn generator_stops_at_iteration_limit() {
        let (mut fuzzer, _handler) = collecting_fuzzer();
        let sink = MemorySink::new();
        fuzzer.set_logger(Some(Box::new(JsonLineLogger::new())));
        fuzzer.set_log_destination(Some(LogDestination::new(sink.clone())));

        let limits = RunLimits {
            max_iterations: Some(25),
            ..RunLimits::default()
        };
        let completed = Generator::new(DEFAULT_SEED).run(&mut fuzzer, &limits).unwrap();
        assert_eq!(completed, 25);
        assert_eq!(fuzzer.io().accesses.len(), 25);
        assert_eq!(sink.lines().len(), 25);
    }

    #[test]
    fn same_seed_reproduces_the_same_run() {
        let limits = RunLimits {
            max_iterations: Some(10),
            ..RunLimits::default()
        };
        let (mut first, _) = collecting_fuzzer();
        let (mut second, _) = collecting_fuzzer();
        Generator::new(42).run(&mut first, &limits).unwrap();
        Generator::new(42).run(&mut second, &limits).unwrap();
        assert_eq!(first.io().accesses, second.io().accesses);

        let (mut third, _) = collecting_fuzzer();
        Generator::new(43).run(&mut third, &limits).unwrap();
        assert_ne!(first.io().accesses, third.io().accesses);
    }

    #[test]
    fn cancelled_token_stops_before_first_iteration() {
        let (mut fuzzer, _handler) = collecting_fuzzer();
        let limits = RunLimits::default();
        limits.cancel.cancel();
        let completed = Generator::new(DEFAULT_SEED).run(&mut fuzzer, &limits).unwrap();
        assert_eq!(completed, 0);
        assert!(fuzzer.io().accesses.is_empty());
    }

    struct ClosedPipe;

    impl std::io::Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SyncWrite for ClosedPipe {
        fn sync(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn closed_destination_ends_generation_cleanly() {
        let (mut fuzzer, handler) = collecting_fuzzer();
        fuzzer.set_logger(Some(Box::new(JsonLineLogger::new())));
        fuzzer.set_log_destination(Some(LogDestination::new(ClosedPipe)));

        let limits = RunLimits {
            max_iterations: Some(10),
            ..RunLimits::default()
        };
        let completed = Generator::new(DEFAULT_SEED).run(&mut fuzzer, &limits).unwrap();
        assert_eq!(completed, 0);
        assert_eq!(fuzzer.io().accesses.len(), 1);
        assert!(handler.reports().is_empty());
    }

    #[test]
    fn cancel_token_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn generated_inputs_have_fixed_size() {
        let mut generator = Generator::new(DEFAULT_SEED);
        let first = generator.next_input().to_vec();
        assert_eq!(first.len(), MAX_INPUT);
        assert_ne!(generator.next_input(), first.as_slice());
    }

    #[test]
    fn watchdog_reports_a_stuck_iteration() {
        let handler = Arc::new(CollectingHandler::new());
        let watchdog = Watchdog::spawn(Duration::from_millis(20), handler.clone());
        watchdog.arm();
        thread::sleep(Duration::from_millis(300));
        watchdog.disarm();
        drop(watchdog);

        let reports = handler.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("timeout"));
    }

    #[test]
    fn watchdog_stays_quiet_for_fast_iterations() {
        let handler = Arc::new(CollectingHandler::new());
        let watchdog = Watchdog::spawn(Duration::from_secs(5), handler.clone());
        for _ in 0..100 {
            watchdog.arm();
            watchdog.disarm();
        }
        thread::sleep(Duration::from_millis(120));
        drop(watchdog);
        assert!(handler.reports().is_empty());
    }
}
