//! Linear-scan register allocation over one multi-instruction body.
//!
//! The register conventions are part of the execution protocol: inputs
//! arrive in registers `0..|inputs|` (positionally, whether or not the body
//! reads them) and outputs leave from the window of the last `l_out`
//! registers. Temporaries draw from the middle range.

use std::collections::{BTreeSet, HashMap};

use cloak_asm::{Hli, MemId, Mlmi, Mls, RegId};

use crate::error::OutOfRegisters;

/// Assign a register to every memory cell of `instrs`.
///
/// `inputs` and `outputs` are positional; `r` is the size of the register
/// file and `l_out` the width of the output window. Inputs that the body
/// never reads get no mapping but keep their slot reserved. An output that
/// is also an input maps to its output slot.
pub fn allocate(
    instrs: &[Hli],
    inputs: &[MemId],
    outputs: &[MemId],
    r: u32,
    l_out: u32,
) -> Result<HashMap<MemId, RegId>, OutOfRegisters> {
    let mut mapping = HashMap::new();

    // Inputs sit in the low registers. Universalization introduces inputs
    // that are never read; those get no mapping, but their slot stays
    // reserved so the positional protocol holds.
    let used = Mlmi::new(Mls::new(instrs.to_vec()), inputs.to_vec(), outputs.to_vec()).uses();
    for (idx, m) in inputs.iter().enumerate() {
        if used.contains(m) && !mapping.contains_key(m) {
            mapping.insert(*m, RegId(idx as u32));
        }
    }

    // Outputs sit in the window of the last `l_out` registers; the output
    // binding wins for cells that are both input and output.
    let first_output = r - l_out;
    for (idx, m) in outputs.iter().enumerate() {
        mapping.insert(*m, RegId(first_output + idx as u32));
    }

    let (births, deaths) = live_intervals(instrs, outputs);

    let mut free: BTreeSet<RegId> = (inputs.len() as u32..first_output).map(RegId).collect();

    for idx in 0..instrs.len() {
        if let Some(dying) = deaths.get(&idx) {
            for m in dying {
                free.insert(mapping[m]);
            }
        }
        if let Some(m) = births.get(&idx) {
            if !mapping.contains_key(m) {
                let reg = free.pop_first().ok_or(OutOfRegisters)?;
                mapping.insert(*m, reg);
            }
        }
    }

    Ok(mapping)
}

/// `true` iff `instrs` allocates within `r` registers.
pub fn fits(instrs: &[Hli], inputs: &[MemId], outputs: &[MemId], r: u32, l_out: u32) -> bool {
    allocate(instrs, inputs, outputs, r, l_out).is_ok()
}

/// Birth (definition index) and death (last-use index) points.
///
/// Outputs never die inside the body; their registers stay reserved until
/// the multi-instruction returns.
fn live_intervals(
    instrs: &[Hli],
    outputs: &[MemId],
) -> (HashMap<usize, MemId>, HashMap<usize, Vec<MemId>>) {
    let births: HashMap<usize, MemId> =
        instrs.iter().enumerate().map(|(idx, i)| (idx, i.dst)).collect();

    let alive_to_the_end: BTreeSet<MemId> = outputs.iter().copied().collect();
    let mut deaths: HashMap<usize, Vec<MemId>> = HashMap::new();
    let mut dead: BTreeSet<MemId> = BTreeSet::new();
    for (idx, instr) in instrs.iter().enumerate().rev() {
        for m in instr.mem_inputs() {
            if !alive_to_the_end.contains(&m) && dead.insert(m) {
                deaths.entry(idx).or_default().push(m);
            }
        }
    }

    (births, deaths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_asm::Opcode;

    #[test]
    fn inputs_low_outputs_high() {
        // m2 = m0 ^ m1 with r=4, l_out=2: output lands at the start of the
        // output window.
        let instrs = [Hli::binary(Opcode::XOR, MemId(2), MemId(0), MemId(1))];
        let mapping = allocate(&instrs, &[MemId(0), MemId(1)], &[MemId(2)], 4, 2)
            .expect("enough registers");
        assert_eq!(mapping[&MemId(0)], RegId(0));
        assert_eq!(mapping[&MemId(1)], RegId(1));
        assert_eq!(mapping[&MemId(2)], RegId(2));
    }

    #[test]
    fn temporaries_reuse_dead_registers() {
        // Two chained temporaries never overlap, so one middle register is
        // enough: r = 2 inputs + 1 temp + 1 output.
        let instrs = [
            Hli::binary(Opcode::ADD, MemId(2), MemId(0), MemId(1)),
            Hli::binary(Opcode::XOR, MemId(3), MemId(2), MemId(1)),
            Hli::binary(Opcode::AND, MemId(4), MemId(3), MemId(0)),
        ];
        let mapping = allocate(&instrs, &[MemId(0), MemId(1)], &[MemId(4)], 4, 1)
            .expect("enough registers");
        // m2 takes the only middle register; by the time m3 is born, m2 and
        // the input m1 are dead, and the freed input slot is reused.
        assert_eq!(mapping[&MemId(2)], RegId(2));
        assert_eq!(mapping[&MemId(3)], RegId(1));
        assert_eq!(mapping[&MemId(4)], RegId(3));
    }

    #[test]
    fn exhaustion_is_reported() {
        // Three temporaries all live at once on top of two inputs and one
        // output do not fit in three registers.
        let instrs = [
            Hli::binary(Opcode::ADD, MemId(2), MemId(0), MemId(1)),
            Hli::binary(Opcode::SUB, MemId(3), MemId(0), MemId(1)),
            Hli::binary(Opcode::MUL, MemId(4), MemId(0), MemId(1)),
            Hli::binary(Opcode::XOR, MemId(5), MemId(2), MemId(3)),
            Hli::binary(Opcode::OR, MemId(6), MemId(5), MemId(4)),
        ];
        let inputs = [MemId(0), MemId(1)];
        let outputs = [MemId(6)];
        assert_eq!(allocate(&instrs, &inputs, &outputs, 3, 1), Err(OutOfRegisters));
        assert!(!fits(&instrs, &inputs, &outputs, 3, 1));
        assert!(fits(&instrs, &inputs, &outputs, 6, 1));
    }

    #[test]
    fn unused_input_keeps_its_slot() {
        // m1 is never read: it gets no mapping, but temporaries must not
        // take register 1.
        let instrs = [
            Hli::mov(MemId(2), MemId(0)),
            Hli::binary(Opcode::ADD, MemId(3), MemId(2), MemId(0)),
        ];
        let mapping = allocate(&instrs, &[MemId(0), MemId(1)], &[MemId(3)], 4, 1)
            .expect("enough registers");
        assert!(!mapping.contains_key(&MemId(1)));
        assert_eq!(mapping[&MemId(2)], RegId(2));
    }

    #[test]
    fn pass_through_output_binds_to_the_output_window() {
        let mapping = allocate(&[], &[MemId(0)], &[MemId(0)], 4, 2).expect("enough registers");
        assert_eq!(mapping[&MemId(0)], RegId(2));
    }
}
