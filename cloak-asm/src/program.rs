use core::fmt;

use crate::{Hli, Llmi, MemId, Mlmi};

/// High-level program: a flat list of instructions over an SSA memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HlirProgram {
    /// Instructions, in execution order.
    pub instrs: Vec<Hli>,
    /// Cells holding the program inputs.
    pub inputs: Vec<MemId>,
    /// Cells holding the program outputs.
    pub outputs: Vec<MemId>,
    /// Number of memory cells the program addresses.
    pub memory_count: u32,
}

/// Mid-level program: a list of mid-level multi-instructions, before
/// register allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MlirProgram {
    /// Multi-instructions, in execution order.
    pub instrs: Vec<Mlmi>,
    /// Cells holding the program inputs.
    pub inputs: Vec<MemId>,
    /// Cells holding the program outputs.
    pub outputs: Vec<MemId>,
    /// Number of memory cells the program addresses.
    pub memory_count: u32,
}

/// Low-level program: the list of register-allocated multi-instructions
/// that gets serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LlirProgram {
    /// Multi-instructions, in execution order.
    pub instrs: Vec<Llmi>,
    /// Cells holding the program inputs.
    pub inputs: Vec<MemId>,
    /// Cells holding the program outputs.
    pub outputs: Vec<MemId>,
    /// Number of memory cells the program addresses.
    pub memory_count: u32,
}

fn fmt_program(
    f: &mut fmt::Formatter<'_>,
    inputs: &[MemId],
    outputs: &[MemId],
    body: impl Iterator<Item = String>,
) -> fmt::Result {
    write!(f, "Inputs: ")?;
    for (idx, m) in inputs.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{m}")?;
    }
    write!(f, "\nOutputs: ")?;
    for (idx, m) in outputs.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{m}")?;
    }
    writeln!(f, "\nBody:")?;
    for line in body {
        writeln!(f, "  {line}")?;
    }
    Ok(())
}

impl fmt::Display for HlirProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_program(
            f,
            &self.inputs,
            &self.outputs,
            self.instrs.iter().map(|i| i.to_string()),
        )
    }
}

impl fmt::Display for MlirProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_program(
            f,
            &self.inputs,
            &self.outputs,
            self.instrs.iter().map(|i| i.to_string()),
        )
    }
}

impl fmt::Display for LlirProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_program(
            f,
            &self.inputs,
            &self.outputs,
            self.instrs.iter().map(|i| i.to_string()),
        )
    }
}
