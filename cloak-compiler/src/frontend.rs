//! Reader for straight-line programs in three-address text form.
//!
//! The front end proper (parsing the source language, unrolling,
//! SSA conversion) lives outside this crate; what arrives here is its
//! output: a flat list of three-address instructions over an SSA memory,
//! in a line-based text form:
//!
//! ```text
//! # o = (a ^ b) + c
//! input m0 m1 m2
//! output m4
//! xor m3, m0, m1
//! add m4, m3, m2
//! ```
//!
//! Destinations are memory cells (`m3` or `m[3]`); sources are cells or
//! unsigned immediates. The reader enforces the SSA discipline and rejects
//! anything a correct front end would not emit.

use std::collections::HashSet;

use cloak_asm::{Hli, HlirProgram, MemId, MemOrImm, Opcode, Sources};

/// Rejection of an input program.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The opcode name is not part of the instruction set.
    #[error("line {line}: unknown opcode `{name}`")]
    UnknownOpcode {
        /// 1-based source line.
        line: usize,
        /// The offending token.
        name: String,
    },

    /// An operand token is neither a cell nor an immediate.
    #[error("line {line}: malformed operand `{token}`")]
    BadOperand {
        /// 1-based source line.
        line: usize,
        /// The offending token.
        token: String,
    },

    /// The destination of an instruction must be a memory cell.
    #[error("line {line}: destination must be a memory cell, found `{token}`")]
    BadDestination {
        /// 1-based source line.
        line: usize,
        /// The offending token.
        token: String,
    },

    /// Wrong number of source operands for the opcode.
    #[error("line {line}: {opcode} takes {expected} source operand(s), found {found}")]
    BadArity {
        /// 1-based source line.
        line: usize,
        /// The instruction's opcode.
        opcode: Opcode,
        /// Sources the opcode takes.
        expected: usize,
        /// Sources found on the line.
        found: usize,
    },

    /// A cell is written twice; memory must be in SSA form.
    #[error("line {line}: m[{cell}] is written twice, memory must be in SSA form")]
    NotSsa {
        /// 1-based source line.
        line: usize,
        /// The cell written twice.
        cell: u32,
    },

    /// A cell is read before any instruction defines it.
    #[error("line {line}: m[{cell}] is read before being defined")]
    UndefinedRead {
        /// 1-based source line.
        line: usize,
        /// The undefined cell.
        cell: u32,
    },

    /// A declared output is never defined.
    #[error("output m[{cell}] is never defined")]
    UndefinedOutput {
        /// The undefined cell.
        cell: u32,
    },
}

fn parse_mem(token: &str) -> Option<MemId> {
    let index = token
        .strip_prefix("m[")
        .and_then(|rest| rest.strip_suffix(']'))
        .or_else(|| token.strip_prefix('m'))?;
    index.parse().ok().map(MemId)
}

fn parse_source(token: &str, line: usize) -> Result<MemOrImm, ParseError> {
    if let Some(m) = parse_mem(token) {
        return Ok(MemOrImm::Mem(m));
    }
    token
        .parse()
        .map(MemOrImm::Imm)
        .map_err(|_| ParseError::BadOperand {
            line,
            token: token.to_string(),
        })
}

/// Number of sources each opcode takes in source text.
fn source_arity(opcode: Opcode) -> usize {
    match opcode {
        Opcode::NOP => 0,
        Opcode::MOV => 1,
        Opcode::CMOV => 3,
        _ => 2,
    }
}

/// Parse a straight-line program.
pub fn parse_program(source: &str) -> Result<HlirProgram, ParseError> {
    let mut inputs: Vec<MemId> = Vec::new();
    let mut outputs: Vec<MemId> = Vec::new();
    let mut instrs: Vec<Hli> = Vec::new();

    let mut defined: HashSet<MemId> = HashSet::new();
    let mut memory_count = 0u32;
    fn note(m: MemId, memory_count: &mut u32) -> MemId {
        *memory_count = (*memory_count).max(m.0 + 1);
        m
    }

    for (idx, raw_line) in source.lines().enumerate() {
        let line = idx + 1;
        let text = raw_line.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }

        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };

        match head {
            "input" => {
                for token in rest.split_whitespace() {
                    let m = parse_mem(token).ok_or_else(|| ParseError::BadOperand {
                        line,
                        token: token.to_string(),
                    })?;
                    inputs.push(note(m, &mut memory_count));
                    defined.insert(m);
                }
            }
            "output" => {
                for token in rest.split_whitespace() {
                    let m = parse_mem(token).ok_or_else(|| ParseError::BadOperand {
                        line,
                        token: token.to_string(),
                    })?;
                    outputs.push(note(m, &mut memory_count));
                }
            }
            name => {
                let opcode: Opcode = name.parse().map_err(|_| ParseError::UnknownOpcode {
                    line,
                    name: name.to_string(),
                })?;
                if opcode == Opcode::NOP {
                    // A front end never emits NOPs; padding is the
                    // compiler's own business.
                    return Err(ParseError::UnknownOpcode {
                        line,
                        name: name.to_string(),
                    });
                }

                let tokens: Vec<&str> = rest
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect();
                let expected = source_arity(opcode);
                if tokens.len() != expected + 1 {
                    return Err(ParseError::BadArity {
                        line,
                        opcode,
                        expected,
                        found: tokens.len().saturating_sub(1),
                    });
                }

                let dst = parse_mem(tokens[0]).ok_or_else(|| ParseError::BadDestination {
                    line,
                    token: tokens[0].to_string(),
                })?;
                if !defined.insert(dst) {
                    return Err(ParseError::NotSsa { line, cell: dst.0 });
                }
                note(dst, &mut memory_count);

                let mut srcs = Vec::with_capacity(expected);
                for token in &tokens[1..] {
                    let src = parse_source(token, line)?;
                    if let MemOrImm::Mem(m) = src {
                        if !defined.contains(&m) {
                            return Err(ParseError::UndefinedRead { line, cell: m.0 });
                        }
                        note(m, &mut memory_count);
                    }
                    srcs.push(src);
                }
                let srcs = match *srcs.as_slice() {
                    [a] => Sources::Unary(a),
                    [a, b] => Sources::Binary(a, b),
                    [a, b, c] => Sources::Ternary(a, b, c),
                    _ => unreachable!("arity was checked above"),
                };
                instrs.push(Hli::new(opcode, dst, srcs));
            }
        }
    }

    for m in &outputs {
        if !defined.contains(m) {
            return Err(ParseError::UndefinedOutput { cell: m.0 });
        }
    }

    Ok(HlirProgram {
        instrs,
        inputs,
        outputs,
        memory_count,
    })
}
