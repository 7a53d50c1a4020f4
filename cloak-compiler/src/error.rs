//! Compiler error implementation.

use crate::frontend::ParseError;

/// Distinguished register-allocation failure.
///
/// The clusterizer treats this as "the candidate merge is illegal" and
/// recovers; reaching it during lowering means clusterization let an
/// over-wide multi-instruction through and is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not enough registers to perform register allocation")]
pub struct OutOfRegisters;

/// Invalid compiler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The register file cannot hold the input and output windows.
    #[error("`r` should be at least `l_in + l_out`; provided: r={r}, l_in={l_in}, l_out={l_out}")]
    RegisterFileTooSmall {
        /// Configured register count.
        r: u32,
        /// Configured input width.
        l_in: u32,
        /// Configured output width.
        l_out: u32,
    },

    /// A multi-instruction needs at least one input and one output slot.
    #[error("`l_in` and `l_out` should be at least 1; provided: l_in={l_in}, l_out={l_out}")]
    ZeroWidth {
        /// Configured input width.
        l_in: u32,
        /// Configured output width.
        l_out: u32,
    },

    /// A multi-instruction cannot copy all its inputs to its outputs.
    #[error("`s` should be at least `l_in` and `l_out`; provided: s={s}, l_in={l_in}, l_out={l_out}")]
    SequenceTooShort {
        /// Configured body length.
        s: u32,
        /// Configured input width.
        l_in: u32,
        /// Configured output width.
        l_out: u32,
    },

    /// Universalization needs square, power-of-two multi-instructions.
    #[error(
        "universalization requires `l_in == l_out`, a power of two of at \
         least 2; provided: l_in={l_in}, l_out={l_out}"
    )]
    NotUniversalizable {
        /// Configured input width.
        l_in: u32,
        /// Configured output width.
        l_out: u32,
    },

    /// The word size does not describe whole bytes.
    #[error("word size must be a multiple of 8 bits, at most 64; provided: {word_size}")]
    BadWordSize {
        /// Configured word size in bits.
        word_size: u32,
    },
}

/// Compilation error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration fails validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The input program is not acceptable.
    #[error("unsupported input program: {0}")]
    Frontend(#[from] ParseError),

    /// Register allocation failed on a multi-instruction that
    /// clusterization accepted.
    #[error("lowering failed: {0}")]
    Lowering(#[from] OutOfRegisters),

    /// A dataflow-graph invariant does not hold.
    #[error("invalid dataflow graph: {0}")]
    Integrity(String),

    /// Lowering could not schedule every node.
    #[error("dataflow graph contains an unschedulable node (cycle or missing edge)")]
    UnscheduledNode,

    /// The parallel permutation checker diverged from the target wiring.
    #[error(
        "permutation network between layers {layer} and {next} does not \
         realize the target wiring"
    )]
    PermutationMismatch {
        /// Index of the producing layer.
        layer: usize,
        /// Index of the consuming layer.
        next: usize,
    },

    /// Failure writing the output stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
