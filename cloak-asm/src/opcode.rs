use core::fmt;

/// Operation executed by a single instruction of the secure element.
///
/// The numeric codes are part of the wire format (4 bits per opcode); code
/// `12` is unassigned. All arithmetic is unsigned, modulo the configured
/// word size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumIter, strum::EnumString)]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// No operation.
    NOP = 0x00,
    /// Copy the source into the destination.
    MOV = 0x01,
    /// Bitwise exclusive or.
    XOR = 0x02,
    /// Bitwise or.
    OR = 0x03,
    /// Bitwise and.
    AND = 0x04,
    /// Logical shift left.
    LSL = 0x05,
    /// Logical shift right.
    LSR = 0x06,
    /// Unsigned less-than; produces `0` or `1`.
    LT = 0x07,
    /// Wrapping addition.
    ADD = 0x08,
    /// Wrapping subtraction.
    SUB = 0x09,
    /// Wrapping multiplication.
    MUL = 0x0a,
    /// Equality; produces `0` or `1`.
    EQ = 0x0b,
    /// Unsigned division.
    DIV = 0x0d,
    /// Unsigned remainder.
    MOD = 0x0e,
    /// Ternary select: `dst = if cond != 0 { a } else { b }`.
    CMOV = 0x0f,
}

impl Opcode {
    /// The 4-bit wire code of the opcode.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a 4-bit wire code.
    pub const fn from_code(code: u8) -> Option<Self> {
        use Opcode::*;
        match code {
            0x00 => Some(NOP),
            0x01 => Some(MOV),
            0x02 => Some(XOR),
            0x03 => Some(OR),
            0x04 => Some(AND),
            0x05 => Some(LSL),
            0x06 => Some(LSR),
            0x07 => Some(LT),
            0x08 => Some(ADD),
            0x09 => Some(SUB),
            0x0a => Some(MUL),
            0x0b => Some(EQ),
            0x0d => Some(DIV),
            0x0e => Some(MOD),
            0x0f => Some(CMOV),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
