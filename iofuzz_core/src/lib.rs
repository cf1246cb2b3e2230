pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod fuzzer;
pub mod input;
pub mod port_io;

pub use catalog::{OpKind, OperandShape, Operation, Width};
pub use config::{ConfigError, IoFuzzConfig, Mode, Verbosity, parse_number, parse_port_list};
pub use driver::{CancelToken, Generator, MAX_INPUT, RunLimits, Watchdog, replay};
pub use error::{AbortHandler, CollectingHandler, ErrorHandler, ErrorReport, FuzzError};
pub use event::{EventLogger, JsonLineLogger, LogDestination, LogEvent, LogValue, SyncWrite};
pub use fuzzer::{Invocation, IoFuzzer, MAX_COUNT, MAX_PORTS, MAX_STRING, Operands};
pub use input::InputStream;
pub use port_io::{NullPortIo, PortIo, acquire_io_privilege};

#[cfg(target_arch = "x86_64")]
pub use port_io::RawPortIo;
