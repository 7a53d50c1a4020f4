//! Bytecode serialization.
//!
//! The wire format is big-endian throughout. A fixed header carries the
//! element shape, the memory size, the sealed session key, and the program
//! interface; each low-level multi-instruction follows with its bus-level
//! fields in the clear and its body encrypted under the session key, with
//! the bus-level fields authenticated as associated data.
//!
//! Field widths derive from the declared sizes: memory indices, register
//! indices, and output slots each take the fewest whole bytes that can
//! hold their count.

use std::collections::HashMap;
use std::io::Write;

use cloak_asm::{Lli, Llmi, LlirProgram, Lls, MemId, Opcode, RegId, RegOrImm, Sources, Word};
use cloak_crypto::{Aead, ElementKey, KeySealer, Nonce, SealedKey, SessionKey, SEALED_KEY_SIZE};
use tracing::info;

use crate::{Config, Error};

/// The element key programs are sealed to.
///
/// Provisioned into the compiler at build time, like the element it talks
/// to; a deployment ships its own.
pub const ELEMENT_KEY: ElementKey = ElementKey([
    0x6b, 0x8f, 0x1a, 0x5d, 0xc4, 0x0e, 0x92, 0x77, 0x3b, 0xa9, 0x50, 0xe1, 0x2c, 0x86, 0xf3,
    0x49, 0x0d, 0x7e, 0xb5, 0x62, 0x98, 0x04, 0xdf, 0x1c, 0x8a, 0x35, 0xc7, 0x59, 0xe0, 0x4b,
    0x26, 0xf8,
]);

/// Bytes needed to index `count` distinct values.
///
/// One past the top of `ceil(log2(count))` bits, in whole bytes; a count of
/// one needs no bytes at all.
fn byte_width(count: u64) -> usize {
    let bits = 64 - count.saturating_sub(1).leading_zeros() as usize;
    (bits + 7) / 8
}

fn uint_bytes(value: u64, width: usize, what: &str) -> Result<Vec<u8>, Error> {
    let bytes = value.to_be_bytes();
    let (high, low) = bytes.split_at(8 - width);
    if high.iter().any(|&b| b != 0) {
        return Err(Error::Integrity(format!(
            "{what} {value} does not fit in {width} bytes"
        )));
    }
    Ok(low.to_vec())
}

/// 4-bit operand-shape code of a non-`NOP` instruction.
///
/// The three letters stand for `src1 src2 src3`, each `I`mmediate,
/// `R`egister, or `N`ull; a present third source implies a present second
/// one, and the destination is always a register, so 14 shapes exist.
fn operand_code(srcs: &Sources<RegOrImm>) -> Result<u8, Error> {
    use RegOrImm::{Imm, Reg};
    Ok(match srcs {
        Sources::Unary(Imm(_)) => 0,  // INN
        Sources::Binary(Imm(_), Reg(_)) => 1, // IRN
        Sources::Ternary(Imm(_), Reg(_), Reg(_)) => 2, // IRR
        Sources::Ternary(Imm(_), Reg(_), Imm(_)) => 3, // IRI
        Sources::Binary(Imm(_), Imm(_)) => 4, // IIN
        Sources::Ternary(Imm(_), Imm(_), Reg(_)) => 5, // IIR
        Sources::Ternary(Imm(_), Imm(_), Imm(_)) => 6, // III
        Sources::Unary(Reg(_)) => 7,  // RNN
        Sources::Binary(Reg(_), Reg(_)) => 8, // RRN
        Sources::Ternary(Reg(_), Reg(_), Imm(_)) => 9, // RRI
        Sources::Ternary(Reg(_), Reg(_), Reg(_)) => 10, // RRR
        Sources::Ternary(Reg(_), Imm(_), Imm(_)) => 11, // RII
        Sources::Ternary(Reg(_), Imm(_), Reg(_)) => 12, // RIR
        Sources::Binary(Reg(_), Imm(_)) => 13, // RIN
        Sources::Nullary => {
            return Err(Error::Integrity(
                "only NOP takes no source operands".to_string(),
            ))
        }
    })
}

/// `(instrID, outputID)` of the multi-instruction providing a cell.
#[derive(Debug, Clone, Copy)]
struct ProviderId {
    instr: u32,
    output: u32,
}

fn lls_bytes(seq: &Lls, lb_r: usize, word_bytes: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    for lli in seq {
        if lli.is_nop() {
            // NOP elides every operand byte.
            out.push(Opcode::NOP.code() << 4);
            continue;
        }
        out.push(lli.opcode.code() << 4 | operand_code(&lli.srcs)?);
        out.extend(uint_bytes(u64::from(lli.dst.0), lb_r, "register")?);
        for src in lli.srcs.iter() {
            match src {
                RegOrImm::Reg(r) => out.extend(uint_bytes(u64::from(r.0), lb_r, "register")?),
                RegOrImm::Imm(v) => out.extend(uint_bytes(*v, word_bytes, "immediate")?),
            }
        }
    }
    Ok(out)
}

/// Serialize `prog` to `out`, sealing the session key to `element` and
/// encrypting every body under it.
///
/// Streams the bytes as multi-instructions are encoded; a failed write
/// leaves a partial file that must be considered invalid.
pub fn write_program<A, K, W>(
    prog: &LlirProgram,
    config: &Config,
    element: &ElementKey,
    session: &SessionKey,
    aead: &A,
    sealer: &K,
    out: &mut W,
) -> Result<(), Error>
where
    A: Aead,
    K: KeySealer,
    W: Write,
{
    let l_out = config.l_out;
    let lb_m = byte_width(u64::from(prog.memory_count));
    let lb_r = byte_width(u64::from(config.r));
    let lb_o = byte_width(u64::from(l_out));
    let word_bytes = config.word_bytes();
    let cipher_key = session.cipher_key();

    let mut header = Vec::new();
    header.extend(config.version.to_be_bytes());
    header.extend(config.word_size.to_be_bytes());
    header.extend(config.l_in.to_be_bytes());
    header.extend(l_out.to_be_bytes());
    header.extend(config.r.to_be_bytes());
    header.extend(config.s.to_be_bytes());
    header.extend(prog.memory_count.to_be_bytes());
    header.extend(sealer.seal(element, session).as_ref());

    let mut providers: HashMap<MemId, ProviderId> = HashMap::new();

    header.extend(uint_bytes(prog.inputs.len() as u64, lb_m, "input count")?);
    for (idx, m) in prog.inputs.iter().enumerate() {
        header.extend(uint_bytes(u64::from(m.0), lb_m, "memory cell")?);
        providers.insert(
            *m,
            ProviderId {
                instr: idx as u32 / l_out + 1,
                output: idx as u32 % l_out,
            },
        );
    }
    header.extend(uint_bytes(prog.outputs.len() as u64, lb_m, "output count")?);
    for m in &prog.outputs {
        header.extend(uint_bytes(u64::from(m.0), lb_m, "memory cell")?);
    }
    header.extend((prog.instrs.len() as u32).to_be_bytes());
    out.write_all(&header)?;

    let prog_outputs: std::collections::HashSet<MemId> = prog.outputs.iter().copied().collect();
    let first_instr_id = prog.inputs.len() as u32 / l_out + 2;

    for (idx, llmi) in prog.instrs.iter().enumerate() {
        let instr_id = first_instr_id + idx as u32;

        let input_count = uint_bytes(llmi.inputs.len() as u64, lb_m, "input count")?;
        let mut inputs = Vec::new();
        let mut input_ids = Vec::new();
        for m in &llmi.inputs {
            inputs.extend(uint_bytes(u64::from(m.0), lb_m, "memory cell")?);
            let provider = providers
                .get(m)
                .ok_or_else(|| Error::Integrity(format!("{m} has no provider")))?;
            input_ids.extend(provider.instr.to_be_bytes());
            input_ids.extend(uint_bytes(u64::from(provider.output), lb_o, "output slot")?);
        }

        let output_count = uint_bytes(llmi.outputs.len() as u64, lb_m, "output count")?;
        let mut outputs = Vec::new();
        for (slot, m) in llmi.outputs.iter().enumerate() {
            outputs.extend(uint_bytes(u64::from(m.0), lb_m, "memory cell")?);
            providers.insert(
                *m,
                ProviderId {
                    instr: instr_id,
                    output: slot as u32,
                },
            );
        }

        let reveal = u8::from(llmi.outputs.iter().any(|m| prog_outputs.contains(m)));

        let mut ad = Vec::new();
        ad.extend(instr_id.to_be_bytes());
        ad.push(reveal);
        ad.extend(&input_count);
        ad.extend(&input_ids);
        ad.extend(&output_count);

        let body = lls_bytes(&llmi.seq, lb_r, word_bytes)?;
        let sealed = aead.encrypt(
            &cipher_key,
            &Nonce::from_counter(u128::from(instr_id)),
            &ad,
            &body,
        );

        let mut record = Vec::new();
        record.extend(&input_count);
        record.extend(&inputs);
        record.extend(&output_count);
        record.extend(&outputs);
        record.extend(instr_id.to_be_bytes());
        record.push(reveal);
        record.extend(&input_ids);
        record.extend((sealed.len() as u32).to_be_bytes());
        record.extend(&sealed);
        out.write_all(&record)?;
    }

    info!(llmis = prog.instrs.len(), "serialized program");
    Ok(())
}

/// The fixed header of a serialized program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Compiler version tag.
    pub version: u32,
    /// Word size in bits.
    pub word_size: u32,
    /// Maximum inputs per multi-instruction.
    pub l_in: u32,
    /// Maximum outputs per multi-instruction.
    pub l_out: u32,
    /// Registers per multi-instruction.
    pub r: u32,
    /// Maximum body length.
    pub s: u32,
    /// Memory cells the program addresses.
    pub memory_count: u32,
    /// The sealed session key.
    pub sealed_key: SealedKey,
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.bytes.len() < n {
            return Err(Error::Integrity("bytecode is truncated".to_string()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn uint(&mut self, width: usize) -> Result<u64, Error> {
        let mut value = 0u64;
        for &b in self.take(width)? {
            value = value << 8 | u64::from(b);
        }
        Ok(value)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(self.uint(4)? as u32)
    }
}

fn read_lls(body: &[u8], lb_r: usize, word_bytes: usize) -> Result<Lls, Error> {
    let mut reader = Reader { bytes: body };
    let mut instrs = Vec::new();
    while !reader.bytes.is_empty() {
        let tag = reader.uint(1)? as u8;
        let opcode = Opcode::from_code(tag >> 4)
            .ok_or_else(|| Error::Integrity(format!("unknown opcode code {}", tag >> 4)))?;
        if opcode == Opcode::NOP {
            instrs.push(Lli::nop());
            continue;
        }

        let dst = RegId(reader.uint(lb_r)? as u32);
        let shapes: [&[u8]; 14] = [
            b"INN", b"IRN", b"IRR", b"IRI", b"IIN", b"IIR", b"III", b"RNN", b"RRN", b"RRI",
            b"RRR", b"RII", b"RIR", b"RIN",
        ];
        let shape = shapes
            .get((tag & 0x0f) as usize)
            .ok_or_else(|| Error::Integrity(format!("unknown operand code {}", tag & 0x0f)))?;

        let mut srcs = Vec::new();
        for kind in shape.iter() {
            match kind {
                b'R' => srcs.push(RegOrImm::Reg(RegId(reader.uint(lb_r)? as u32))),
                b'I' => srcs.push(RegOrImm::Imm(reader.uint(word_bytes)? as Word)),
                _ => break,
            }
        }
        let srcs = match *srcs.as_slice() {
            [a] => Sources::Unary(a),
            [a, b] => Sources::Binary(a, b),
            [a, b, c] => Sources::Ternary(a, b, c),
            _ => return Err(Error::Integrity("instruction has no sources".to_string())),
        };
        instrs.push(Lli::new(opcode, dst, srcs));
    }
    Ok(Lls::new(instrs))
}

/// Parse a serialized program, decrypting the bodies with `session`.
///
/// The element-side counterpart of [`write_program`], used by the test
/// suites to check the stream round-trips and executes correctly.
pub fn read_program<A: Aead>(
    bytes: &[u8],
    aead: &A,
    session: &SessionKey,
) -> Result<(ProgramHeader, LlirProgram), Error> {
    let mut reader = Reader { bytes };

    let version = reader.u32()?;
    let word_size = reader.u32()?;
    let l_in = reader.u32()?;
    let l_out = reader.u32()?;
    let r = reader.u32()?;
    let s = reader.u32()?;
    let memory_count = reader.u32()?;
    let mut sealed_key = [0u8; SEALED_KEY_SIZE];
    sealed_key.copy_from_slice(reader.take(SEALED_KEY_SIZE)?);

    if word_size == 0 || word_size % 8 != 0 || word_size > 64 || l_out == 0 {
        return Err(Error::Integrity("malformed header".to_string()));
    }

    let lb_m = byte_width(u64::from(memory_count));
    let lb_r = byte_width(u64::from(r));
    let lb_o = byte_width(u64::from(l_out));
    let word_bytes = word_size as usize / 8;
    let cipher_key = session.cipher_key();

    let input_count = reader.uint(lb_m)? as usize;
    let inputs = (0..input_count)
        .map(|_| Ok(MemId(reader.uint(lb_m)? as u32)))
        .collect::<Result<Vec<_>, Error>>()?;
    let output_count = reader.uint(lb_m)? as usize;
    let outputs = (0..output_count)
        .map(|_| Ok(MemId(reader.uint(lb_m)? as u32)))
        .collect::<Result<Vec<_>, Error>>()?;
    let llmi_count = reader.u32()? as usize;

    let mut instrs = Vec::with_capacity(llmi_count);
    for _ in 0..llmi_count {
        let input_count = reader.uint(lb_m)?;
        let llmi_inputs = (0..input_count)
            .map(|_| Ok(MemId(reader.uint(lb_m)? as u32)))
            .collect::<Result<Vec<_>, Error>>()?;
        let output_count = reader.uint(lb_m)?;
        let llmi_outputs = (0..output_count)
            .map(|_| Ok(MemId(reader.uint(lb_m)? as u32)))
            .collect::<Result<Vec<_>, Error>>()?;
        let instr_id = reader.u32()?;
        let reveal = reader.uint(1)? as u8;
        let mut input_ids = Vec::new();
        for _ in 0..input_count {
            input_ids.extend(reader.take(4)?);
            input_ids.extend(reader.take(lb_o)?);
        }
        let sealed_len = reader.u32()? as usize;
        let sealed = reader.take(sealed_len)?;

        let mut ad = Vec::new();
        ad.extend(instr_id.to_be_bytes());
        ad.push(reveal);
        ad.extend(uint_bytes(input_count, lb_m, "input count")?);
        ad.extend(&input_ids);
        ad.extend(uint_bytes(output_count, lb_m, "output count")?);

        let body = aead
            .decrypt(
                &cipher_key,
                &Nonce::from_counter(u128::from(instr_id)),
                &ad,
                sealed,
            )
            .map_err(|e| Error::Integrity(format!("sealed body of {instr_id}: {e}")))?;

        instrs.push(Llmi::new(
            read_lls(&body, lb_r, word_bytes)?,
            llmi_inputs,
            llmi_outputs,
        ));
    }

    let header = ProgramHeader {
        version,
        word_size,
        l_in,
        l_out,
        r,
        s,
        memory_count,
        sealed_key: SealedKey(sealed_key),
    };
    let prog = LlirProgram {
        instrs,
        inputs,
        outputs,
        memory_count,
    };
    Ok((header, prog))
}

/// Deterministic doubles for the cryptographic collaborators.
#[cfg(any(test, feature = "test-helpers"))]
pub mod doubles {
    use super::*;
    use cloak_crypto::{CipherKey, TAG_SIZE};

    /// An "AEAD" that reveals its plaintext and tags it with a checksum of
    /// the associated data; only for format tests.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PlainAead;

    impl Aead for PlainAead {
        fn encrypt(&self, _key: &CipherKey, nonce: &Nonce, ad: &[u8], plaintext: &[u8]) -> Vec<u8> {
            let mut out = plaintext.to_vec();
            let mut tag = [0u8; TAG_SIZE];
            for (idx, &b) in ad.iter().chain(nonce.as_ref().iter()).enumerate() {
                tag[idx % TAG_SIZE] ^= b;
            }
            out.extend(tag);
            out
        }

        fn decrypt(
            &self,
            key: &CipherKey,
            nonce: &Nonce,
            ad: &[u8],
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, cloak_crypto::Error> {
            let body_len = ciphertext
                .len()
                .checked_sub(TAG_SIZE)
                .ok_or(cloak_crypto::Error::TruncatedCiphertext)?;
            let (body, tag) = ciphertext.split_at(body_len);
            let expected = &self.encrypt(key, nonce, ad, body)[body_len..];
            if tag != expected {
                return Err(cloak_crypto::Error::InvalidTag);
            }
            Ok(body.to_vec())
        }
    }

    /// A sealer that stores the session key in the clear next to a fixed
    /// filler; only for format tests.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PlainSealer;

    impl KeySealer for PlainSealer {
        fn seal(&self, _element: &ElementKey, session: &SessionKey) -> SealedKey {
            let mut bytes = [0xa5u8; SEALED_KEY_SIZE];
            bytes[..32].copy_from_slice(session.as_ref().as_slice());
            SealedKey(bytes)
        }
    }
}
