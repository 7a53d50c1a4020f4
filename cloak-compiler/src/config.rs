use crate::error::ConfigError;

/// Shape of the target secure element and the knobs of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of internal registers per multi-instruction.
    pub r: u32,
    /// Maximum number of inputs per multi-instruction.
    pub l_in: u32,
    /// Maximum number of outputs per multi-instruction.
    pub l_out: u32,
    /// Maximum number of instructions per multi-instruction body.
    pub s: u32,
    /// Word size in bits.
    pub word_size: u32,
    /// Version tag emitted in the bytecode header.
    pub version: u32,
    /// Minimal program width after universalization; `0` keeps the natural
    /// width.
    pub width: usize,
    /// Minimal program depth after universalization; `0` keeps the natural
    /// depth.
    pub depth: usize,
    /// Use the work-list clusterizer instead of the exhaustive one.
    pub simple_clusterizer: bool,
    /// Skip re-examining nodes that already failed to merge.
    pub fast: bool,
    /// Run universalization to hide the dataflow.
    pub universal: bool,
}

impl Config {
    /// A configuration for the given element shape, with default knobs.
    pub fn new(r: u32, l_in: u32, l_out: u32, s: u32) -> Self {
        Self {
            r,
            l_in,
            l_out,
            s,
            word_size: 32,
            version: 0,
            width: 0,
            depth: 0,
            simple_clusterizer: false,
            fast: true,
            universal: true,
        }
    }

    /// Check that the element shape is workable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l_in == 0 || self.l_out == 0 {
            // Every block fetches at least one input and returns through
            // the output window; the serializer also keys its provider
            // numbering on `l_out`.
            return Err(ConfigError::ZeroWidth {
                l_in: self.l_in,
                l_out: self.l_out,
            });
        }
        if self.r < self.l_in + self.l_out {
            // Otherwise the register file cannot hold the input and output
            // windows at the same time.
            return Err(ConfigError::RegisterFileTooSmall {
                r: self.r,
                l_in: self.l_in,
                l_out: self.l_out,
            });
        }
        if self.s < self.l_in || self.s < self.l_out {
            // Otherwise a multi-instruction cannot copy all of its inputs
            // to its outputs, which rectangularization requires.
            return Err(ConfigError::SequenceTooShort {
                s: self.s,
                l_in: self.l_in,
                l_out: self.l_out,
            });
        }
        if self.universal
            && (self.l_in != self.l_out || !self.l_in.is_power_of_two() || self.l_in < 2)
        {
            // The routing layers need at least two slots per block.
            return Err(ConfigError::NotUniversalizable {
                l_in: self.l_in,
                l_out: self.l_out,
            });
        }
        if self.word_size == 0 || self.word_size % 8 != 0 || self.word_size > 64 {
            return Err(ConfigError::BadWordSize {
                word_size: self.word_size,
            });
        }
        Ok(())
    }

    /// Word size in bytes.
    pub fn word_bytes(&self) -> usize {
        self.word_size as usize / 8
    }
}
