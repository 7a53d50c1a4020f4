use core::fmt;
use std::collections::BTreeSet;

use crate::{Hli, Lli, MemId, MemOrImm};

/// Mid-level sequence: the ordered body of one multi-instruction before
/// register allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mls {
    /// Instructions, in execution order.
    pub instrs: Vec<Hli>,
}

impl Mls {
    /// Build a sequence from instructions.
    pub fn new(instrs: Vec<Hli>) -> Self {
        Self { instrs }
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// `true` iff the sequence has no instructions.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Iterate over the instructions.
    pub fn iter(&self) -> core::slice::Iter<'_, Hli> {
        self.instrs.iter()
    }

    /// The memory cells defined by this sequence.
    pub fn defs(&self) -> BTreeSet<MemId> {
        self.instrs.iter().map(|i| i.dst).collect()
    }

    /// The memory cells read by this sequence but not defined in it.
    pub fn uses(&self) -> BTreeSet<MemId> {
        let defs = self.defs();
        self.instrs
            .iter()
            .flat_map(|i| i.srcs.iter().filter_map(MemOrImm::mem))
            .filter(|m| !defs.contains(m))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Mls {
    type Item = &'a Hli;
    type IntoIter = core::slice::Iter<'a, Hli>;

    fn into_iter(self) -> Self::IntoIter {
        self.instrs.iter()
    }
}

impl fmt::Display for Mls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, instr) in self.instrs.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "    {instr}")?;
        }
        Ok(())
    }
}

/// Low-level sequence: the register-level body of one multi-instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lls {
    /// Instructions, in execution order.
    pub instrs: Vec<Lli>,
}

impl Lls {
    /// Build a sequence from instructions.
    pub fn new(instrs: Vec<Lli>) -> Self {
        Self { instrs }
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// `true` iff the sequence has no instructions.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Iterate over the instructions.
    pub fn iter(&self) -> core::slice::Iter<'_, Lli> {
        self.instrs.iter()
    }
}

impl<'a> IntoIterator for &'a Lls {
    type Item = &'a Lli;
    type IntoIter = core::slice::Iter<'a, Lli>;

    fn into_iter(self) -> Self::IntoIter {
        self.instrs.iter()
    }
}

impl fmt::Display for Lls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, instr) in self.instrs.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "    {instr}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opcode;

    #[test]
    fn uses_excludes_locally_defined_cells() {
        let seq = Mls::new(vec![
            Hli::binary(Opcode::ADD, MemId(3), MemId(0), MemId(1)),
            Hli::binary(Opcode::XOR, MemId(4), MemId(3), MemId(2)),
        ]);
        assert_eq!(seq.defs(), [MemId(3), MemId(4)].into());
        assert_eq!(seq.uses(), [MemId(0), MemId(1), MemId(2)].into());
    }
}
