//! Structured, line-oriented event records.
//!
//! Each primitive invocation produces one [`LogEvent`]. A [`LogDestination`]
//! is locked for the whole record, and the record is synced to storage before
//! the lock is released, so a record on disk survives a machine that hangs on
//! the next port access.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Stdout, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// A typed log value. The set of variants is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Char(char),
    Int(i64),
    Float(f64),
    Octal(u32),
    Pointer(usize),
    U64(u64),
    Str(String),
    Unsigned(u32),
    Hex(u32),
    Size(usize),
}

impl LogValue {
    fn render(&self, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = match self {
            LogValue::Char(c) => out.write_str(&quote(&c.to_string())),
            LogValue::Int(v) => write!(out, "{v}"),
            LogValue::Float(v) if v.is_finite() => write!(out, "{v:.6}"),
            LogValue::Float(v) => out.write_str(&quote(&v.to_string())),
            LogValue::Octal(v) => write!(out, "{v:o}"),
            LogValue::Pointer(v) => write!(out, "\"{v:#x}\""),
            LogValue::U64(v) => write!(out, "{v}"),
            LogValue::Str(s) => out.write_str(&quote(s)),
            LogValue::Unsigned(v) => write!(out, "{v}"),
            LogValue::Hex(v) => write!(out, "\"{v:x}\""),
            LogValue::Size(v) => write!(out, "{v}"),
        };
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// An ordered list of named values describing one invocation.
///
/// The `time` field is not part of the event; the logger stamps it when the
/// record is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEvent {
    fields: Vec<(&'static str, LogValue)>,
}

impl LogEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: LogValue) -> Self {
        self.fields.push((key, value));
        self
    }

    pub fn fields(&self) -> &[(&'static str, LogValue)] {
        &self.fields
    }

    /// Renders the event as a single record line, including the trailing newline.
    pub fn render(&self, time: u64) -> String {
        let mut line = String::with_capacity(64);
        line.push_str("{\"time\":");
        let _ = write!(line, "{time}");
        for (key, value) in &self.fields {
            line.push(',');
            line.push_str(&quote(key));
            line.push(':');
            value.render(&mut line);
        }
        line.push_str("}\n");
        line
    }
}

/// A writer that can force its contents to durable storage.
pub trait SyncWrite: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
}

/// `fsync`s `fd`. Descriptors that cannot be synced, such as pipes and
/// terminals, count as synced.
fn sync_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: fsync only reads the descriptor number; a closed one yields EBADF.
    if unsafe { libc::fsync(fd) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINVAL | libc::ENOTSUP | libc::EROFS) => Ok(()),
        _ => Err(err),
    }
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        sync_fd(self.as_raw_fd())
    }
}

impl SyncWrite for Stdout {
    fn sync(&mut self) -> io::Result<()> {
        sync_fd(self.as_raw_fd())
    }
}

impl SyncWrite for Vec<u8> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Shared, lockable stream that records are written to.
#[derive(Clone)]
pub struct LogDestination {
    inner: Arc<Mutex<Box<dyn SyncWrite>>>,
}

impl LogDestination {
    pub fn new(writer: impl SyncWrite + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Exclusive access for the duration of one record. A poisoned lock is
    /// recovered: a panic in another writer cannot leave a half record here
    /// because every record is written with a single `write_all`.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn SyncWrite>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for LogDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDestination").finish_non_exhaustive()
    }
}

/// In-memory destination whose contents can be read back.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

#[cfg(test)]
impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl SyncWrite for MemorySink {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes events onto a destination.
pub trait EventLogger: Send + Sync {
    fn log(&self, destination: &LogDestination, event: &LogEvent) -> io::Result<()>;
}

/// Source of the `time` field, in seconds since the Unix epoch.
pub type Clock = fn() -> u64;

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Writes one JSON object per line: `{"time":T,"function":...}`.
#[derive(Debug, Clone, Copy)]
pub struct JsonLineLogger {
    clock: Clock,
}

impl JsonLineLogger {
    pub fn new() -> Self {
        Self { clock: unix_time }
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }
}

impl Default for JsonLineLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLogger for JsonLineLogger {
    fn log(&self, destination: &LogDestination, event: &LogEvent) -> io::Result<()> {
        let line = event.render((self.clock)());
        let mut stream = destination.lock();
        stream.write_all(line.as_bytes())?;
        stream.flush()?;
        stream.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_clock() -> u64 {
        1_700_000_000
    }

    #[test]
    fn renders_write8_record() {
        let event = LogEvent::new()
            .with("function", LogValue::Str("write8".into()))
            .with("port", LogValue::Unsigned(0x60))
            .with("value", LogValue::Unsigned(0x41));
        assert_eq!(
            event.render(7),
            "{\"time\":7,\"function\":\"write8\",\"port\":96,\"value\":65}\n"
        );
    }

    #[test]
    fn every_variant_renders_as_valid_json() {
        let event = LogEvent::new()
            .with("c", LogValue::Char('"'))
            .with("d", LogValue::Int(-42))
            .with("f", LogValue::Float(1.5))
            .with("nan", LogValue::Float(f64::NAN))
            .with("o", LogValue::Octal(8))
            .with("p", LogValue::Pointer(0xdead_beef))
            .with("q", LogValue::U64(u64::MAX))
            .with("s", LogValue::Str("a\nb".into()))
            .with("u", LogValue::Unsigned(7))
            .with("x", LogValue::Hex(255))
            .with("z", LogValue::Size(4096));
        let line = event.render(1);
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();

        assert_eq!(parsed["c"], "\"");
        assert_eq!(parsed["d"], -42);
        assert_eq!(parsed["f"].as_f64(), Some(1.5));
        assert_eq!(parsed["nan"], "NaN");
        assert_eq!(parsed["o"], 10);
        assert_eq!(parsed["p"], "0xdeadbeef");
        assert_eq!(parsed["q"], u64::MAX);
        assert_eq!(parsed["s"], "a\nb");
        assert_eq!(parsed["u"], 7);
        assert_eq!(parsed["x"], "ff");
        assert_eq!(parsed["z"], 4096);
        assert!(line.contains("\"f\":1.500000"));
    }

    #[test]
    fn time_is_the_first_field() {
        let event = LogEvent::new().with("function", LogValue::Str("read8".into()));
        let line = event.render(99);
        assert!(line.starts_with("{\"time\":99,"));
        assert!(line.ends_with("}\n"));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn json_line_logger_writes_one_line_per_event() {
        let sink = MemorySink::new();
        let destination = LogDestination::new(sink.clone());
        let logger = JsonLineLogger::with_clock(fixed_clock);

        for port in [1u32, 2, 3] {
            let event = LogEvent::new()
                .with("function", LogValue::Str("read16".into()))
                .with("port", LogValue::Unsigned(port));
            logger.log(&destination, &event).unwrap();
        }

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        for (line, port) in lines.iter().zip(1..) {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["time"], fixed_clock());
            assert_eq!(parsed["port"], port);
        }
    }

    #[test]
    fn json_line_logger_appends_to_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let destination = LogDestination::new(file.reopen().unwrap());
        let logger = JsonLineLogger::with_clock(fixed_clock);
        let event = LogEvent::new().with("function", LogValue::Str("write32".into()));
        logger.log(&destination, &event).unwrap();

        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(written, "{\"time\":1700000000,\"function\":\"write32\"}\n");
    }

    #[test]
    fn sync_reaches_the_descriptor() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut reopened = file.reopen().unwrap();
        reopened.write_all(b"record\n").unwrap();
        assert!(reopened.sync().is_ok());

        let err = sync_fd(RawFd::MAX).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn sync_of_unsyncable_descriptors_succeeds() {
        let mut null = File::options().write(true).open("/dev/null").unwrap();
        assert!(null.sync().is_ok());
        assert!(io::stdout().sync().is_ok());
    }

    #[test]
    fn sync_of_a_pipe_succeeds() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let result = sync_fd(fds[1]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        assert!(result.is_ok());
    }
}
