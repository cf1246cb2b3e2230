use arbitrary::Unstructured;

/// A cursor over fuzz input from which bounded integers, fixed-width scalars
/// and raw buffers are derived.
///
/// Every method is deterministic: the same bytes from the same position
/// always yield the same values. When the underlying bytes run out, the
/// missing bytes read as zero and the caller carries on.
pub trait InputStream {
    /// Derives a value in `min..=max`. A reversed range is taken in order.
    fn derive_range(&mut self, min: u64, max: u64) -> u64;

    /// Fills `buf` with exactly `buf.len()` bytes from the stream.
    fn read_into(&mut self, buf: &mut [u8]);

    fn read_u8(&mut self) -> u8 {
        let mut bytes = [0u8; 1];
        self.read_into(&mut bytes);
        bytes[0]
    }

    fn read_u16(&mut self) -> u16 {
        let mut bytes = [0u8; 2];
        self.read_into(&mut bytes);
        u16::from_le_bytes(bytes)
    }

    fn read_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_into(&mut bytes);
        u32::from_le_bytes(bytes)
    }
}

/// `int_in_range` consumes only the bytes needed to cover the span, none for
/// a single value. `fill_buffer` zero-fills past the end of the data.
impl InputStream for Unstructured<'_> {
    fn derive_range(&mut self, min: u64, max: u64) -> u64 {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.int_in_range(min..=max).unwrap_or(min)
    }

    fn read_into(&mut self, buf: &mut [u8]) {
        if self.fill_buffer(buf).is_err() {
            buf.fill(0);
        }
    }

    fn read_u8(&mut self) -> u8 {
        self.arbitrary().unwrap_or(0)
    }

    fn read_u16(&mut self) -> u16 {
        self.arbitrary().unwrap_or(0)
    }

    fn read_u32(&mut self) -> u32 {
        self.arbitrary().unwrap_or(0)
    }
}
