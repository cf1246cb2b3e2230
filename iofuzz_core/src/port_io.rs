use crate::error::FuzzError;
use std::io;

/// The port access primitives, one per catalog entry.
///
/// String methods transfer `buf.len() / width` elements; callers pass a
/// slice of exactly `count * width` bytes. None of the primitives report a
/// status.
pub trait PortIo {
    fn read8(&mut self, port: u16) -> u8;
    fn read16(&mut self, port: u16) -> u16;
    fn read32(&mut self, port: u16) -> u32;

    fn write8(&mut self, port: u16, value: u8);
    fn write16(&mut self, port: u16, value: u16);
    fn write32(&mut self, port: u16, value: u32);

    fn read_string8(&mut self, port: u16, buf: &mut [u8]);
    fn read_string16(&mut self, port: u16, buf: &mut [u8]);
    fn read_string32(&mut self, port: u16, buf: &mut [u8]);

    fn write_string8(&mut self, port: u16, buf: &[u8]);
    fn write_string16(&mut self, port: u16, buf: &[u8]);
    fn write_string32(&mut self, port: u16, buf: &[u8]);
}

/// Raises the I/O privilege level of the process so that [`RawPortIo`] may
/// touch every port.
#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
pub fn acquire_io_privilege() -> Result<(), FuzzError> {
    // SAFETY: iopl only changes the privilege level of the calling process.
    if unsafe { libc::iopl(3) } == -1 {
        return Err(FuzzError::Privilege(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64")))]
pub fn acquire_io_privilege() -> Result<(), FuzzError> {
    Err(FuzzError::Privilege(io::Error::new(
        io::ErrorKind::Unsupported,
        "port I/O is not supported on this platform",
    )))
}

/// Executes the real `in`/`out` instruction family.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct RawPortIo {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl RawPortIo {
    /// # Safety
    /// The process must hold I/O privilege for every port it will be asked
    /// to access (see [`acquire_io_privilege`]); otherwise the first access
    /// raises `#GP` and the process is killed. Writes go to real hardware.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86_64")]
mod raw {
    use core::arch::asm;

    // SAFETY (all functions): the caller owns the privilege contract of
    // `RawPortIo::new`; string variants get a pointer/count pair that stays
    // inside the caller's slice. The direction flag is clear per the ABI.

    pub fn inb(port: u16) -> u8 {
        let value: u8;
        unsafe {
            asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    pub fn inw(port: u16) -> u16 {
        let value: u16;
        unsafe {
            asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    pub fn inl(port: u16) -> u32 {
        let value: u32;
        unsafe {
            asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    pub fn outb(port: u16, value: u8) {
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
    }

    pub fn outw(port: u16, value: u16) {
        unsafe {
            asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
        }
    }

    pub fn outl(port: u16, value: u32) {
        unsafe {
            asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
        }
    }

    pub fn insb(port: u16, buf: &mut [u8]) {
        unsafe {
            asm!("rep insb", in("dx") port, inout("rdi") buf.as_mut_ptr() => _,
                 inout("rcx") buf.len() => _, options(nostack, preserves_flags));
        }
    }

    pub fn insw(port: u16, buf: &mut [u8]) {
        unsafe {
            asm!("rep insw", in("dx") port, inout("rdi") buf.as_mut_ptr() => _,
                 inout("rcx") buf.len() / 2 => _, options(nostack, preserves_flags));
        }
    }

    pub fn insl(port: u16, buf: &mut [u8]) {
        unsafe {
            asm!("rep insd", in("dx") port, inout("rdi") buf.as_mut_ptr() => _,
                 inout("rcx") buf.len() / 4 => _, options(nostack, preserves_flags));
        }
    }

    pub fn outsb(port: u16, buf: &[u8]) {
        unsafe {
            asm!("rep outsb", in("dx") port, inout("rsi") buf.as_ptr() => _,
                 inout("rcx") buf.len() => _, options(nostack, preserves_flags, readonly));
        }
    }

    pub fn outsw(port: u16, buf: &[u8]) {
        unsafe {
            asm!("rep outsw", in("dx") port, inout("rsi") buf.as_ptr() => _,
                 inout("rcx") buf.len() / 2 => _, options(nostack, preserves_flags, readonly));
        }
    }

    pub fn outsl(port: u16, buf: &[u8]) {
        unsafe {
            asm!("rep outsd", in("dx") port, inout("rsi") buf.as_ptr() => _,
                 inout("rcx") buf.len() / 4 => _, options(nostack, preserves_flags, readonly));
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl PortIo for RawPortIo {
    fn read8(&mut self, port: u16) -> u8 {
        raw::inb(port)
    }
    fn read16(&mut self, port: u16) -> u16 {
        raw::inw(port)
    }
    fn read32(&mut self, port: u16) -> u32 {
        raw::inl(port)
    }
    fn write8(&mut self, port: u16, value: u8) {
        raw::outb(port, value)
    }
    fn write16(&mut self, port: u16, value: u16) {
        raw::outw(port, value)
    }
    fn write32(&mut self, port: u16, value: u32) {
        raw::outl(port, value)
    }
    fn read_string8(&mut self, port: u16, buf: &mut [u8]) {
        raw::insb(port, buf)
    }
    fn read_string16(&mut self, port: u16, buf: &mut [u8]) {
        raw::insw(port, buf)
    }
    fn read_string32(&mut self, port: u16, buf: &mut [u8]) {
        raw::insl(port, buf)
    }
    fn write_string8(&mut self, port: u16, buf: &[u8]) {
        raw::outsb(port, buf)
    }
    fn write_string16(&mut self, port: u16, buf: &[u8]) {
        raw::outsw(port, buf)
    }
    fn write_string32(&mut self, port: u16, buf: &[u8]) {
        raw::outsl(port, buf)
    }
}

/// Dry-run backend: writes are dropped and reads see a floating bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPortIo;

impl PortIo for NullPortIo {
    fn read8(&mut self, _port: u16) -> u8 {
        u8::MAX
    }
    fn read16(&mut self, _port: u16) -> u16 {
        u16::MAX
    }
    fn read32(&mut self, _port: u16) -> u32 {
        u32::MAX
    }
    fn write8(&mut self, _port: u16, _value: u8) {}
    fn write16(&mut self, _port: u16, _value: u16) {}
    fn write32(&mut self, _port: u16, _value: u32) {}
    fn read_string8(&mut self, _port: u16, buf: &mut [u8]) {
        buf.fill(0xff);
    }
    fn read_string16(&mut self, _port: u16, buf: &mut [u8]) {
        buf.fill(0xff);
    }
    fn read_string32(&mut self, _port: u16, buf: &mut [u8]) {
        buf.fill(0xff);
    }
    fn write_string8(&mut self, _port: u16, _buf: &[u8]) {}
    fn write_string16(&mut self, _port: u16, _buf: &[u8]) {}
    fn write_string32(&mut self, _port: u16, _buf: &[u8]) {}
}

/// One recorded primitive call.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortAccess {
    pub function: &'static str,
    pub port: u16,
    pub value: Option<u32>,
    pub payload: Vec<u8>,
}

/// Test backend that records every call. Reads return `fill` repeated.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingPortIo {
    pub accesses: Vec<PortAccess>,
    pub fill: u8,
}

#[cfg(test)]
impl RecordingPortIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, function: &'static str, port: u16, value: Option<u32>, payload: &[u8]) {
        self.accesses.push(PortAccess {
            function,
            port,
            value,
            payload: payload.to_vec(),
        });
    }
}

#[cfg(test)]
impl PortIo for RecordingPortIo {
    fn read8(&mut self, port: u16) -> u8 {
        self.record("read8", port, None, &[]);
        self.fill
    }
    fn read16(&mut self, port: u16) -> u16 {
        self.record("read16", port, None, &[]);
        u16::from_le_bytes([self.fill; 2])
    }
    fn read32(&mut self, port: u16) -> u32 {
        self.record("read32", port, None, &[]);
        u32::from_le_bytes([self.fill; 4])
    }
    fn write8(&mut self, port: u16, value: u8) {
        self.record("write8", port, Some(value.into()), &[]);
    }
    fn write16(&mut self, port: u16, value: u16) {
        self.record("write16", port, Some(value.into()), &[]);
    }
    fn write32(&mut self, port: u16, value: u32) {
        self.record("write32", port, Some(value), &[]);
    }
    fn read_string8(&mut self, port: u16, buf: &mut [u8]) {
        buf.fill(self.fill);
        self.record("read_string8", port, None, buf);
    }
    fn read_string16(&mut self, port: u16, buf: &mut [u8]) {
        buf.fill(self.fill);
        self.record("read_string16", port, None, buf);
    }
    fn read_string32(&mut self, port: u16, buf: &mut [u8]) {
        buf.fill(self.fill);
        self.record("read_string32", port, None, buf);
    }
    fn write_string8(&mut self, port: u16, buf: &[u8]) {
        self.record("write_string8", port, None, buf);
    }
    fn write_string16(&mut self, port: u16, buf: &[u8]) {
        self.record("write_string16", port, None, buf);
    }
    fn write_string32(&mut self, port: u16, buf: &[u8]) {
        self.record("write_string32", port, None, buf);
    }
}
