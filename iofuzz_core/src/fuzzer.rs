use crate::catalog::{OpKind, Operation, Width};
use crate::error::{AbortHandler, ErrorHandler, ErrorReport, FuzzError};
use crate::event::{EventLogger, LogDestination, LogEvent, LogValue};
use crate::input::InputStream;
use crate::port_io::PortIo;
use std::io;
use std::sync::Arc;

/// Number of addressable I/O ports.
pub const MAX_PORTS: usize = 1 << 16;
/// Largest element count a string operation can carry.
pub const MAX_COUNT: usize = u16::MAX as usize;
/// Scratch space needed by the widest string operation.
pub const MAX_STRING: usize = MAX_COUNT * 4;

/// Operands derived for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    Value(u32),
    /// Element count of a string operation. The elements live in the
    /// fuzzer's scratch buffer.
    Counted { count: u16 },
}

/// What a single iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub port: u16,
    pub operation: Operation,
    pub operands: Operands,
}

impl Invocation {
    /// Bytes of scratch space the operation transferred.
    pub fn payload_len(&self) -> usize {
        match self.operands {
            Operands::Counted { count } => usize::from(count) * self.operation.width().bytes(),
            _ => 0,
        }
    }
}

/// An I/O port address space fuzzer.
///
/// Each call to [`IoFuzzer::iterate`] consumes a prefix of an input stream,
/// performs exactly one port operation and logs it.
pub struct IoFuzzer<P: PortIo> {
    ports: Vec<u16>,
    io: P,
    logger: Option<Box<dyn EventLogger>>,
    destination: Option<LogDestination>,
    error_handler: Arc<dyn ErrorHandler>,
    scratch: Vec<u8>,
}

impl<P: PortIo> IoFuzzer<P> {
    /// Creates a fuzzer that reports fatal conditions with [`AbortHandler`].
    ///
    /// `ports` restricts the fuzzer to the listed ports; `None` or an empty
    /// list means every port.
    pub fn new(ports: Option<Vec<u16>>, io: P) -> Result<Self, FuzzError> {
        Self::with_error_handler(ports, io, Arc::new(AbortHandler))
    }

    pub fn with_error_handler(
        ports: Option<Vec<u16>>,
        io: P,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, FuzzError> {
        let mut scratch = Vec::new();
        if let Err(source) = scratch.try_reserve_exact(MAX_STRING) {
            let err = FuzzError::Allocation {
                bytes: MAX_STRING,
                source,
            };
            error_handler.handle(&ErrorReport::from(&err));
            return Err(err);
        }
        scratch.resize(MAX_STRING, 0);

        let ports = ports.unwrap_or_default();
        log::debug!(
            "created fuzzer over {} ports",
            if ports.is_empty() { MAX_PORTS } else { ports.len() }
        );

        Ok(Self {
            ports,
            io,
            logger: None,
            destination: None,
            error_handler,
            scratch,
        })
    }

    /// Installs a logger, returning the previous one.
    pub fn set_logger(
        &mut self,
        logger: Option<Box<dyn EventLogger>>,
    ) -> Option<Box<dyn EventLogger>> {
        std::mem::replace(&mut self.logger, logger)
    }

    /// Installs the log destination, returning the previous one.
    pub fn set_log_destination(
        &mut self,
        destination: Option<LogDestination>,
    ) -> Option<LogDestination> {
        std::mem::replace(&mut self.destination, destination)
    }

    /// Replaces the fatal error handler, returning the previous one.
    pub fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) -> Arc<dyn ErrorHandler> {
        std::mem::replace(&mut self.error_handler, handler)
    }

    pub fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        Arc::clone(&self.error_handler)
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn io(&self) -> &P {
        &self.io
    }

    /// Scratch contents transferred by the last string operation.
    pub fn payload(&self, invocation: &Invocation) -> &[u8] {
        &self.scratch[..invocation.payload_len()]
    }

    /// Performs one iteration: resolve the port, select an operation, derive
    /// its operands, invoke the primitive, then log it.
    pub fn iterate<S: InputStream + ?Sized>(
        &mut self,
        stream: &mut S,
    ) -> Result<Invocation, FuzzError> {
        let port = self.resolve_port(stream);

        let selector = stream.derive_range(0, Operation::MAX_SELECTOR);
        let Some(operation) = Operation::from_selector(selector) else {
            return Err(self.fatal(FuzzError::InvalidSelector(selector)));
        };

        let operands = self.derive_operands(operation, stream);
        let invocation = Invocation {
            port,
            operation,
            operands,
        };

        self.invoke(&invocation);
        self.log_invocation(&invocation)?;
        Ok(invocation)
    }

    /// Picks the target port, from the allow-list when there is one.
    pub fn resolve_port<S: InputStream + ?Sized>(&self, stream: &mut S) -> u16 {
        if self.ports.is_empty() {
            return stream.derive_range(0, u64::from(u16::MAX)) as u16;
        }
        let last = self.ports.len() as u64 - 1;
        let index = stream.derive_range(0, last) as usize;
        self.ports[index % self.ports.len()]
    }

    /// Pulls the operands `operation` needs from the stream. String writes
    /// also copy their elements into scratch space.
    pub fn derive_operands<S: InputStream + ?Sized>(
        &mut self,
        operation: Operation,
        stream: &mut S,
    ) -> Operands {
        match operation.kind() {
            OpKind::ScalarRead => Operands::None,
            OpKind::ScalarWrite => Operands::Value(match operation.width() {
                Width::W8 => stream.read_u8().into(),
                Width::W16 => stream.read_u16().into(),
                Width::W32 => stream.read_u32(),
            }),
            OpKind::StringRead => Operands::Counted {
                count: stream.read_u16(),
            },
            OpKind::StringWrite => {
                let count = stream.read_u16();
                let len = usize::from(count) * operation.width().bytes();
                stream.read_into(&mut self.scratch[..len]);
                Operands::Counted { count }
            }
        }
    }

    fn invoke(&mut self, invocation: &Invocation) {
        let port = invocation.port;
        let value = match invocation.operands {
            Operands::Value(value) => value,
            _ => 0,
        };
        let buf = &mut self.scratch[..invocation.payload_len()];

        match invocation.operation {
            Operation::Read16 => {
                self.io.read16(port);
            }
            Operation::Read32 => {
                self.io.read32(port);
            }
            Operation::Read8 => {
                self.io.read8(port);
            }
            Operation::ReadString16 => self.io.read_string16(port, buf),
            Operation::ReadString32 => self.io.read_string32(port, buf),
            Operation::ReadString8 => self.io.read_string8(port, buf),
            Operation::Write16 => self.io.write16(port, value as u16),
            Operation::Write32 => self.io.write32(port, value),
            Operation::Write8 => self.io.write8(port, value as u8),
            Operation::WriteString16 => self.io.write_string16(port, buf),
            Operation::WriteString32 => self.io.write_string32(port, buf),
            Operation::WriteString8 => self.io.write_string8(port, buf),
        }
    }

    fn event_for(&self, invocation: &Invocation) -> LogEvent {
        let event = LogEvent::new()
            .with("function", LogValue::Str(invocation.operation.name().to_owned()))
            .with("port", LogValue::Unsigned(invocation.port.into()));
        match invocation.operands {
            Operands::None => event,
            Operands::Value(value) => event.with("value", LogValue::Unsigned(value)),
            Operands::Counted { count } => event
                .with("string", LogValue::Pointer(self.scratch.as_ptr() as usize))
                .with("count", LogValue::Unsigned(count.into())),
        }
    }

    fn log_invocation(&self, invocation: &Invocation) -> Result<(), FuzzError> {
        let (Some(logger), Some(destination)) = (&self.logger, &self.destination) else {
            return Ok(());
        };
        let event = self.event_for(invocation);
        match logger.log(destination, &event) {
            Ok(()) => Ok(()),
            // The reader went away, e.g. `iofuzz_cli -g | head`.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                log::info!("log destination closed: {e}");
                Err(FuzzError::DestinationClosed)
            }
            Err(e) => Err(self.fatal(FuzzError::LogWrite(e))),
        }
    }

    /// Hands `err` to the error handler and gives it back for propagation.
    pub fn fatal(&self, err: FuzzError) -> FuzzError {
        log::error!("fatal: {err}");
        self.error_handler.handle(&ErrorReport::from(&err));
        err
    }
}

impl<P: PortIo + std::fmt::Debug> std::fmt::Debug for IoFuzzer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoFuzzer")
            .field("ports", &self.ports)
            .field("io", &self.io)
            .field("logger", &self.logger.is_some())
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}
