//! The fixed table of port operations the fuzzer can perform.
//!
//! Selectors are positions in [`Operation::ALL`]; the order is part of the
//! input format and must not change, otherwise captured inputs stop replaying.

use std::fmt;

/// Access width of a port operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    ScalarRead,
    ScalarWrite,
    StringRead,
    StringWrite,
}

/// What an operation pulls from the input stream besides the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    Value,
    /// A 16-bit element count; string writes also consume the elements.
    CountedBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read16,
    Read32,
    Read8,
    ReadString16,
    ReadString32,
    ReadString8,
    Write16,
    Write32,
    Write8,
    WriteString16,
    WriteString32,
    WriteString8,
}

impl Operation {
    /// All operations, indexed by selector.
    pub const ALL: [Operation; 12] = [
        Operation::Read16,
        Operation::Read32,
        Operation::Read8,
        Operation::ReadString16,
        Operation::ReadString32,
        Operation::ReadString8,
        Operation::Write16,
        Operation::Write32,
        Operation::Write8,
        Operation::WriteString16,
        Operation::WriteString32,
        Operation::WriteString8,
    ];

    /// Largest valid selector.
    pub const MAX_SELECTOR: u64 = Self::ALL.len() as u64 - 1;

    pub fn from_selector(selector: u64) -> Option<Operation> {
        usize::try_from(selector)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    pub fn selector(self) -> u64 {
        self as u64
    }

    /// Name of the primitive, as it appears in the `function` log field.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Read16 => "read16",
            Operation::Read32 => "read32",
            Operation::Read8 => "read8",
            Operation::ReadString16 => "read_string16",
            Operation::ReadString32 => "read_string32",
            Operation::ReadString8 => "read_string8",
            Operation::Write16 => "write16",
            Operation::Write32 => "write32",
            Operation::Write8 => "write8",
            Operation::WriteString16 => "write_string16",
            Operation::WriteString32 => "write_string32",
            Operation::WriteString8 => "write_string8",
        }
    }

    pub fn width(self) -> Width {
        match self {
            Operation::Read8
            | Operation::ReadString8
            | Operation::Write8
            | Operation::WriteString8 => Width::W8,
            Operation::Read16
            | Operation::ReadString16
            | Operation::Write16
            | Operation::WriteString16 => Width::W16,
            Operation::Read32
            | Operation::ReadString32
            | Operation::Write32
            | Operation::WriteString32 => Width::W32,
        }
    }

    pub fn kind(self) -> OpKind {
        match self {
            Operation::Read16 | Operation::Read32 | Operation::Read8 => OpKind::ScalarRead,
            Operation::ReadString16 | Operation::ReadString32 | Operation::ReadString8 => {
                OpKind::StringRead
            }
            Operation::Write16 | Operation::Write32 | Operation::Write8 => OpKind::ScalarWrite,
            Operation::WriteString16 | Operation::WriteString32 | Operation::WriteString8 => {
                OpKind::StringWrite
            }
        }
    }

    pub fn shape(self) -> OperandShape {
        match self.kind() {
            OpKind::ScalarRead => OperandShape::None,
            OpKind::ScalarWrite => OperandShape::Value,
            OpKind::StringRead | OpKind::StringWrite => OperandShape::CountedBuffer,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_table_matches_documented_order() {
        let expected = [
            (16, OpKind::ScalarRead),
            (32, OpKind::ScalarRead),
            (8, OpKind::ScalarRead),
            (16, OpKind::StringRead),
            (32, OpKind::StringRead),
            (8, OpKind::StringRead),
            (16, OpKind::ScalarWrite),
            (32, OpKind::ScalarWrite),
            (8, OpKind::ScalarWrite),
            (16, OpKind::StringWrite),
            (32, OpKind::StringWrite),
            (8, OpKind::StringWrite),
        ];
        for (selector, (bits, kind)) in expected.into_iter().enumerate() {
            let op = Operation::from_selector(selector as u64).unwrap();
            assert_eq!(op.selector(), selector as u64);
            assert_eq!(op.width().bits(), bits, "width of selector {selector}");
            assert_eq!(op.kind(), kind, "kind of selector {selector}");
        }
    }

    #[test]
    fn out_of_range_selectors_are_rejected() {
        assert_eq!(Operation::MAX_SELECTOR, 11);
        assert!(Operation::from_selector(12).is_none());
        assert!(Operation::from_selector(u64::MAX).is_none());
    }

    #[test]
    fn names_are_unique_and_match_width() {
        let mut names: Vec<_> = Operation::ALL.iter().map(|op| op.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Operation::ALL.len());

        for op in Operation::ALL {
            assert!(op.name().ends_with(&op.width().bits().to_string()));
        }
    }

    #[test]
    fn operand_shapes() {
        assert_eq!(Operation::Read8.shape(), OperandShape::None);
        assert_eq!(Operation::Write32.shape(), OperandShape::Value);
        assert_eq!(Operation::ReadString16.shape(), OperandShape::CountedBuffer);
        assert_eq!(Operation::WriteString8.shape(), OperandShape::CountedBuffer);
    }
}
