//! Instruction set and intermediate representations of the cloak compiler.
//!
//! The compiler lowers a straight-line program through three levels:
//!
//! * **HLIR** — high-level instructions ([`Hli`]) operating on an
//!   addressable, write-once (SSA) global memory.
//! * **MLIR** — the same instructions grouped into mid-level
//!   multi-instructions ([`Mlmi`]), the unit the secure element executes
//!   atomically inside its encryption boundary.
//! * **LLIR** — low-level multi-instructions ([`Llmi`]) whose bodies
//!   ([`Lls`]) manipulate the element's internal register file instead of
//!   memory.
//!
//! This crate holds only the vocabulary; all transformations live in
//! `cloak-compiler`.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod instruction;
mod multi;
mod opcode;
mod operand;
mod program;
mod sequence;

pub use instruction::{Hli, Lli, Sources};
pub use multi::{Llmi, Mlmi};
pub use opcode::Opcode;
pub use operand::{MemId, MemOrImm, RegId, RegOrImm, Word};
pub use program::{HlirProgram, LlirProgram, MlirProgram};
pub use sequence::{Lls, Mls};
