//! Reference interpreter for low-level programs.
//!
//! Executes a program the way the secure element would, minus the
//! cryptography: each multi-instruction fetches its inputs from the global
//! memory into registers `0..`, runs its body over the internal register
//! file, and stores the output window back to memory. Used by the test
//! suites to check that lowering and serialization preserve semantics.

use cloak_asm::{Lli, LlirProgram, Opcode, RegOrImm, Sources, Word};

use crate::Error;

/// Word arithmetic truncated to `word_size` bits.
#[derive(Debug, Clone, Copy)]
struct WordOps {
    mask: Word,
    bits: u32,
}

impl WordOps {
    fn new(word_size: u32) -> Self {
        let mask = if word_size >= 64 {
            Word::MAX
        } else {
            (1 << word_size) - 1
        };
        Self {
            mask,
            bits: word_size,
        }
    }

    fn trunc(&self, v: Word) -> Word {
        v & self.mask
    }
}

/// Execute `prog` on `input_values` (one word per program input, in
/// order) and return one word per program output.
///
/// `r` and `l_out` must match the shape the program was compiled for;
/// `word_size` is the element's word width in bits. Division and remainder
/// by zero produce 0.
pub fn execute(
    prog: &LlirProgram,
    r: u32,
    l_out: u32,
    word_size: u32,
    input_values: &[Word],
) -> Result<Vec<Word>, Error> {
    if input_values.len() != prog.inputs.len() {
        return Err(Error::Integrity(format!(
            "program takes {} inputs, {} provided",
            prog.inputs.len(),
            input_values.len()
        )));
    }
    let ops = WordOps::new(word_size);

    let mut memory: Vec<Word> = vec![0; prog.memory_count as usize];
    for (m, v) in prog.inputs.iter().zip(input_values) {
        memory[m.0 as usize] = ops.trunc(*v);
    }

    for llmi in &prog.instrs {
        let mut regs: Vec<Word> = vec![0; r as usize];
        for (idx, m) in llmi.inputs.iter().enumerate() {
            regs[idx] = memory[m.0 as usize];
        }

        for lli in &llmi.seq {
            step(lli, &mut regs, ops)?;
        }

        let first_output = (r - l_out) as usize;
        for (idx, m) in llmi.outputs.iter().enumerate() {
            memory[m.0 as usize] = regs[first_output + idx];
        }
    }

    Ok(prog
        .outputs
        .iter()
        .map(|m| memory[m.0 as usize])
        .collect())
}

fn step(lli: &Lli, regs: &mut [Word], ops: WordOps) -> Result<(), Error> {
    let value = |src: &RegOrImm| match src {
        RegOrImm::Reg(r) => regs[r.0 as usize],
        RegOrImm::Imm(v) => ops.trunc(*v),
    };

    let unary = || match &lli.srcs {
        Sources::Unary(a) => Ok(value(a)),
        _ => Err(arity_error(lli)),
    };
    let binary = || match &lli.srcs {
        Sources::Binary(a, b) => Ok((value(a), value(b))),
        _ => Err(arity_error(lli)),
    };
    let ternary = || match &lli.srcs {
        Sources::Ternary(a, b, c) => Ok((value(a), value(b), value(c))),
        _ => Err(arity_error(lli)),
    };

    let result = match lli.opcode {
        Opcode::NOP => return Ok(()),
        Opcode::MOV => unary()?,
        Opcode::XOR => {
            let (a, b) = binary()?;
            a ^ b
        }
        Opcode::OR => {
            let (a, b) = binary()?;
            a | b
        }
        Opcode::AND => {
            let (a, b) = binary()?;
            a & b
        }
        Opcode::LSL => {
            let (a, b) = binary()?;
            if b >= ops.bits as Word {
                0
            } else {
                ops.trunc(a << b)
            }
        }
        Opcode::LSR => {
            let (a, b) = binary()?;
            if b >= ops.bits as Word {
                0
            } else {
                a >> b
            }
        }
        Opcode::LT => {
            let (a, b) = binary()?;
            (a < b) as Word
        }
        Opcode::ADD => {
            let (a, b) = binary()?;
            ops.trunc(a.wrapping_add(b))
        }
        Opcode::SUB => {
            let (a, b) = binary()?;
            ops.trunc(a.wrapping_sub(b))
        }
        Opcode::MUL => {
            let (a, b) = binary()?;
            ops.trunc(a.wrapping_mul(b))
        }
        Opcode::EQ => {
            let (a, b) = binary()?;
            (a == b) as Word
        }
        Opcode::DIV => {
            let (a, b) = binary()?;
            if b == 0 {
                0
            } else {
                a / b
            }
        }
        Opcode::MOD => {
            let (a, b) = binary()?;
            if b == 0 {
                0
            } else {
                a % b
            }
        }
        Opcode::CMOV => {
            let (cond, if_true, if_false) = ternary()?;
            if cond != 0 {
                if_true
            } else {
                if_false
            }
        }
    };

    regs[lli.dst.0 as usize] = result;
    Ok(())
}

fn arity_error(lli: &Lli) -> Error {
    Error::Integrity(format!(
        "{} takes a different number of sources than provided",
        lli.opcode
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_asm::{Llmi, Lls, MemId, RegId};
    use rstest::rstest;

    fn binary_prog(opcode: Opcode) -> LlirProgram {
        LlirProgram {
            instrs: vec![Llmi::new(
                Lls::new(vec![Lli::new(
                    opcode,
                    RegId(2),
                    Sources::Binary(RegOrImm::Reg(RegId(0)), RegOrImm::Reg(RegId(1))),
                )]),
                vec![MemId(0), MemId(1)],
                vec![MemId(2)],
            )],
            inputs: vec![MemId(0), MemId(1)],
            outputs: vec![MemId(2)],
            memory_count: 3,
        }
    }

    #[rstest]
    #[case(Opcode::ADD, 7, 5, 12)]
    #[case(Opcode::SUB, 5, 7, 0xffff_fffe)]
    #[case(Opcode::MUL, 1 << 31, 2, 0)]
    #[case(Opcode::XOR, 0b1100, 0b1010, 0b0110)]
    #[case(Opcode::LT, 3, 4, 1)]
    #[case(Opcode::LT, 4, 3, 0)]
    #[case(Opcode::EQ, 9, 9, 1)]
    #[case(Opcode::DIV, 17, 5, 3)]
    #[case(Opcode::DIV, 17, 0, 0)]
    #[case(Opcode::MOD, 17, 5, 2)]
    #[case(Opcode::MOD, 17, 0, 0)]
    fn binary_semantics(#[case] opcode: Opcode, #[case] a: Word, #[case] b: Word, #[case] out: Word) {
        let prog = binary_prog(opcode);
        let result = execute(&prog, 4, 2, 32, &[a, b]).expect("executes");
        assert_eq!(result, vec![out]);
    }

    #[test]
    fn shifts_saturate_past_the_word_size() {
        let prog = binary_prog(Opcode::LSL);
        assert_eq!(execute(&prog, 4, 2, 32, &[1, 31]).expect("executes"), vec![1 << 31]);
        assert_eq!(execute(&prog, 4, 2, 32, &[1, 32]).expect("executes"), vec![0]);
    }

    #[test]
    fn cmov_selects_by_condition() {
        let prog = LlirProgram {
            instrs: vec![Llmi::new(
                Lls::new(vec![Lli::new(
                    Opcode::CMOV,
                    RegId(3),
                    Sources::Ternary(
                        RegOrImm::Reg(RegId(0)),
                        RegOrImm::Reg(RegId(1)),
                        RegOrImm::Reg(RegId(2)),
                    ),
                )]),
                vec![MemId(0), MemId(1), MemId(2)],
                vec![MemId(3)],
            )],
            inputs: vec![MemId(0), MemId(1), MemId(2)],
            outputs: vec![MemId(3)],
            memory_count: 4,
        };
        assert_eq!(execute(&prog, 4, 1, 32, &[1, 10, 20]).expect("executes"), vec![10]);
        assert_eq!(execute(&prog, 4, 1, 32, &[0, 10, 20]).expect("executes"), vec![20]);
    }

    #[test]
    fn nop_changes_nothing() {
        let prog = LlirProgram {
            instrs: vec![Llmi::new(
                Lls::new(vec![Lli::nop(), Lli::new(
                    Opcode::MOV,
                    RegId(3),
                    Sources::Unary(RegOrImm::Reg(RegId(0))),
                )]),
                vec![MemId(0)],
                vec![MemId(1)],
            )],
            inputs: vec![MemId(0)],
            outputs: vec![MemId(1)],
            memory_count: 2,
        };
        assert_eq!(execute(&prog, 4, 1, 32, &[42]).expect("executes"), vec![42]);
    }

    #[test]
    fn word_size_truncates_arithmetic() {
        let prog = binary_prog(Opcode::ADD);
        assert_eq!(execute(&prog, 4, 2, 8, &[200, 100]).expect("executes"), vec![44]);
    }
}
