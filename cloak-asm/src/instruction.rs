use core::fmt;

use crate::{MemId, MemOrImm, Opcode, RegId, RegOrImm};

/// The source operands of an instruction.
///
/// The arity is encoded structurally: there is no way to build an
/// instruction with a third source but no second one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Sources<S> {
    /// No sources (`NOP`).
    Nullary,
    /// One source (`MOV`).
    Unary(S),
    /// Two sources (the binary ALU operations).
    Binary(S, S),
    /// Three sources (`CMOV cond, if_true, if_false`).
    Ternary(S, S, S),
}

impl<S> Sources<S> {
    /// Number of sources present.
    pub const fn len(&self) -> usize {
        match self {
            Self::Nullary => 0,
            Self::Unary(..) => 1,
            Self::Binary(..) => 2,
            Self::Ternary(..) => 3,
        }
    }

    /// `true` iff there are no sources.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first source, if present.
    pub const fn src1(&self) -> Option<&S> {
        match self {
            Self::Nullary => None,
            Self::Unary(a) | Self::Binary(a, _) | Self::Ternary(a, _, _) => Some(a),
        }
    }

    /// The second source, if present.
    pub const fn src2(&self) -> Option<&S> {
        match self {
            Self::Binary(_, b) | Self::Ternary(_, b, _) => Some(b),
            _ => None,
        }
    }

    /// The third source, if present.
    pub const fn src3(&self) -> Option<&S> {
        match self {
            Self::Ternary(_, _, c) => Some(c),
            _ => None,
        }
    }

    /// Iterate over the sources in order.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        [self.src1(), self.src2(), self.src3()].into_iter().flatten()
    }

    /// Apply `f` to every source, preserving the arity.
    pub fn map<T>(&self, mut f: impl FnMut(&S) -> T) -> Sources<T> {
        match self {
            Self::Nullary => Sources::Nullary,
            Self::Unary(a) => Sources::Unary(f(a)),
            Self::Binary(a, b) => Sources::Binary(f(a), f(b)),
            Self::Ternary(a, b, c) => Sources::Ternary(f(a), f(b), f(c)),
        }
    }
}

/// High-level instruction.
///
/// The destination is a memory cell and the sources are memory cells or
/// immediates; registers do not exist at this level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hli {
    /// Operation to perform.
    pub opcode: Opcode,
    /// Destination cell.
    pub dst: MemId,
    /// Source operands.
    pub srcs: Sources<MemOrImm>,
}

impl Hli {
    /// Build an instruction from its parts.
    pub const fn new(opcode: Opcode, dst: MemId, srcs: Sources<MemOrImm>) -> Self {
        Self { opcode, dst, srcs }
    }

    /// `MOV dst, src`.
    pub fn mov(dst: MemId, src: impl Into<MemOrImm>) -> Self {
        Self::new(Opcode::MOV, dst, Sources::Unary(src.into()))
    }

    /// A binary operation `op dst, a, b`.
    pub fn binary(
        opcode: Opcode,
        dst: MemId,
        a: impl Into<MemOrImm>,
        b: impl Into<MemOrImm>,
    ) -> Self {
        Self::new(opcode, dst, Sources::Binary(a.into(), b.into()))
    }

    /// `CMOV dst, cond, if_true, if_false`.
    pub fn cmov(
        dst: MemId,
        cond: impl Into<MemOrImm>,
        if_true: impl Into<MemOrImm>,
        if_false: impl Into<MemOrImm>,
    ) -> Self {
        Self::new(
            Opcode::CMOV,
            dst,
            Sources::Ternary(cond.into(), if_true.into(), if_false.into()),
        )
    }

    /// The source operands that read from memory, in order.
    pub fn mem_inputs(&self) -> impl Iterator<Item = MemId> + '_ {
        self.srcs.iter().filter_map(MemOrImm::mem)
    }
}

/// Low-level instruction.
///
/// Part of an [`Lls`](crate::Lls) inside an [`Llmi`](crate::Llmi); operates
/// on the multi-instruction's internal registers rather than on the global
/// memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lli {
    /// Operation to perform.
    pub opcode: Opcode,
    /// Destination register.
    pub dst: RegId,
    /// Source operands.
    pub srcs: Sources<RegOrImm>,
}

impl Lli {
    /// Build an instruction from its parts.
    pub const fn new(opcode: Opcode, dst: RegId, srcs: Sources<RegOrImm>) -> Self {
        Self { opcode, dst, srcs }
    }

    /// The canonical `NOP`.
    pub const fn nop() -> Self {
        Self::new(Opcode::NOP, RegId(0), Sources::Nullary)
    }

    /// `true` iff this instruction is a `NOP`.
    pub fn is_nop(&self) -> bool {
        self.opcode == Opcode::NOP
    }
}

fn fmt_operands<S: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    opcode: Opcode,
    dst: impl fmt::Display,
    srcs: &Sources<S>,
) -> fmt::Result {
    if opcode == Opcode::NOP {
        return write!(f, "NOP");
    }
    write!(f, "{opcode} {dst}")?;
    for src in srcs.iter() {
        write!(f, ", {src}")?;
    }
    Ok(())
}

impl fmt::Display for Hli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_operands(f, self.opcode, self.dst, &self.srcs)
    }
}

impl fmt::Display for Lli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_operands(f, self.opcode, self.dst, &self.srcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_inputs_skips_immediates() {
        let hli = Hli::binary(Opcode::ADD, MemId(3), MemId(1), MemOrImm::Imm(7));
        let inputs: Vec<_> = hli.mem_inputs().collect();
        assert_eq!(inputs, vec![MemId(1)]);
    }

    #[test]
    fn duplicate_sources_are_reported_twice() {
        let hli = Hli::binary(Opcode::XOR, MemId(1), MemId(0), MemId(0));
        assert_eq!(hli.mem_inputs().count(), 2);
    }

    #[test]
    fn display_matches_assembly_form() {
        let hli = Hli::cmov(MemId(4), MemId(0), MemId(1), MemOrImm::Imm(9));
        assert_eq!(hli.to_string(), "CMOV m[4], m[0], m[1], 9");
        assert_eq!(Lli::nop().to_string(), "NOP");
    }
}
