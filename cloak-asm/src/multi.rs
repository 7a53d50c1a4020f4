use core::fmt;
use std::collections::BTreeSet;

use crate::{Hli, Lls, MemId, Mls};

/// Mid-level multi-instruction: one secure-element block before register
/// allocation.
///
/// `inputs` are the memory cells fetched from the bus before the body runs
/// and `outputs` the cells written back afterwards. Every cell read by the
/// body is either an input or defined earlier in the body; every output is
/// either defined in the body or an input passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mlmi {
    /// The straight-line body.
    pub seq: Mls,
    /// Cells fetched from the global memory, in bus order.
    pub inputs: Vec<MemId>,
    /// Cells stored back to the global memory, in bus order.
    pub outputs: Vec<MemId>,
}

impl Mlmi {
    /// Build a multi-instruction from its parts.
    pub fn new(seq: Mls, inputs: Vec<MemId>, outputs: Vec<MemId>) -> Self {
        Self {
            seq,
            inputs,
            outputs,
        }
    }

    /// Wrap a single instruction: its memory sources become the inputs and
    /// its destination the only output.
    pub fn from_hli(hli: Hli) -> Self {
        let inputs = hli.mem_inputs().collect();
        let outputs = vec![hli.dst];
        Self::new(Mls::new(vec![hli]), inputs, outputs)
    }

    /// An empty block; universalization pads layers with these.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The memory cells defined by the body.
    pub fn defs(&self) -> BTreeSet<MemId> {
        self.seq.defs()
    }

    /// The memory cells read by the body but not defined in it.
    pub fn uses(&self) -> BTreeSet<MemId> {
        self.seq.uses()
    }
}

/// Low-level multi-instruction.
///
/// Execution model of the secure element:
///
/// 1. fetch `inputs` from the global memory and pass them through the
///    encryption boundary; inside, they land in registers `0..`,
/// 2. execute the body over the internal register file,
/// 3. return the contents of the output register window, which the host
///    stores to the cells named by `outputs`.
///
/// `inputs` and `outputs` stay memory indices: they describe bus traffic,
/// not registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Llmi {
    /// The register-level body.
    pub seq: Lls,
    /// Cells fetched from the global memory, in bus order.
    pub inputs: Vec<MemId>,
    /// Cells stored back to the global memory, in bus order.
    pub outputs: Vec<MemId>,
}

impl Llmi {
    /// Build a multi-instruction from its parts.
    pub fn new(seq: Lls, inputs: Vec<MemId>, outputs: Vec<MemId>) -> Self {
        Self {
            seq,
            inputs,
            outputs,
        }
    }
}

fn fmt_multi(
    f: &mut fmt::Formatter<'_>,
    inputs: &[MemId],
    outputs: &[MemId],
    label: &str,
    body: impl fmt::Display,
) -> fmt::Result {
    write!(f, "{{\n  inputs: ")?;
    fmt_cells(f, inputs)?;
    write!(f, "\n  outputs: ")?;
    fmt_cells(f, outputs)?;
    write!(f, "\n  {label}:\n{body}\n}}")
}

fn fmt_cells(f: &mut fmt::Formatter<'_>, cells: &[MemId]) -> fmt::Result {
    for (idx, m) in cells.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{m}")?;
    }
    Ok(())
}

impl fmt::Display for Mlmi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_multi(f, &self.inputs, &self.outputs, "MLS", &self.seq)
    }
}

impl fmt::Display for Llmi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_multi(f, &self.inputs, &self.outputs, "LLS", &self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemOrImm, Opcode};

    #[test]
    fn from_hli_collects_memory_sources() {
        let mi = Mlmi::from_hli(Hli::binary(Opcode::XOR, MemId(2), MemId(0), MemId(1)));
        assert_eq!(mi.inputs, vec![MemId(0), MemId(1)]);
        assert_eq!(mi.outputs, vec![MemId(2)]);
        assert_eq!(mi.seq.len(), 1);
    }

    #[test]
    fn from_hli_ignores_immediates() {
        let mi = Mlmi::from_hli(Hli::binary(Opcode::ADD, MemId(1), MemId(0), MemOrImm::Imm(3)));
        assert_eq!(mi.inputs, vec![MemId(0)]);
    }
}
