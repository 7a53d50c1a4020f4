//! Lowering: scheduling the graph and allocating registers per node.

use std::collections::{BTreeSet, HashSet};

use cloak_asm::{Lli, Llmi, LlirProgram, Lls, MemId, MemOrImm, Mlmi, RegOrImm};
use tracing::info;

use crate::dfg::{Dfg, NodeId};
use crate::error::OutOfRegisters;
use crate::{regalloc, Config, Error};

/// One topological order of the graph, program inputs first.
///
/// Fails when some node can never become ready, which means the graph is
/// cyclic or an edge is missing.
pub fn schedule(dfg: &Dfg) -> Result<Vec<NodeId>, Error> {
    let mut ready: HashSet<MemId> = dfg.prog_inputs().iter().copied().collect();
    let is_ready =
        |ready: &HashSet<MemId>, id: NodeId| dfg.node(id).inputs.iter().all(|m| ready.contains(m));

    let mut todo: BTreeSet<NodeId> = dfg
        .node_ids()
        .into_iter()
        .filter(|&id| is_ready(&ready, id))
        .collect();
    let mut order = Vec::with_capacity(dfg.node_count());
    let mut done: HashSet<NodeId> = HashSet::new();

    while let Some(id) = todo.pop_first() {
        if done.contains(&id) || !is_ready(&ready, id) {
            continue;
        }
        for m in &dfg.node(id).outputs {
            ready.insert(*m);
        }
        order.push(id);
        done.insert(id);
        todo.extend(dfg.next_nodes(id));
    }

    if order.len() != dfg.node_count() {
        return Err(Error::UnscheduledNode);
    }
    Ok(order)
}

/// Register-allocate one multi-instruction.
///
/// The element protocol requires at least one input per block, so an
/// input-less body gets cell 0 as a dummy. `inputs` and `outputs` keep
/// their order: positions are meaning on the bus.
pub fn mlmi_to_llmi(mlmi: &Mlmi, r: u32, l_out: u32) -> Result<Llmi, OutOfRegisters> {
    let inputs = if mlmi.inputs.is_empty() {
        vec![MemId(0)]
    } else {
        mlmi.inputs.clone()
    };
    let registers = regalloc::allocate(&mlmi.seq.instrs, &inputs, &mlmi.outputs, r, l_out)?;

    let instrs = mlmi
        .seq
        .iter()
        .map(|hli| {
            let srcs = hli.srcs.map(|src| match src {
                MemOrImm::Mem(m) => RegOrImm::Reg(registers[m]),
                MemOrImm::Imm(v) => RegOrImm::Imm(*v),
            });
            Lli::new(hli.opcode, registers[&hli.dst], srcs)
        })
        .collect();

    Ok(Llmi::new(Lls::new(instrs), inputs, mlmi.outputs.clone()))
}

/// Lower the whole graph to a low-level program.
pub fn lower(dfg: &Dfg, config: &Config) -> Result<LlirProgram, Error> {
    let order = schedule(dfg)?;
    let instrs = order
        .into_iter()
        .map(|id| mlmi_to_llmi(dfg.node(id), config.r, config.l_out))
        .collect::<Result<Vec<Llmi>, OutOfRegisters>>()?;

    info!(llmis = instrs.len(), "lowered");
    Ok(LlirProgram {
        instrs,
        inputs: dfg.prog_inputs().to_vec(),
        outputs: dfg.prog_outputs().to_vec(),
        memory_count: dfg.memory_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_asm::{Hli, MlirProgram, Mls, Opcode, RegId};

    #[test]
    fn single_xor_uses_the_conventional_registers() {
        let mlmi = Mlmi::new(
            Mls::new(vec![Hli::binary(Opcode::XOR, MemId(2), MemId(0), MemId(1))]),
            vec![MemId(0), MemId(1)],
            vec![MemId(2)],
        );
        let llmi = mlmi_to_llmi(&mlmi, 4, 2).expect("allocates");

        assert_eq!(llmi.inputs, vec![MemId(0), MemId(1)]);
        assert_eq!(llmi.outputs, vec![MemId(2)]);
        assert_eq!(
            llmi.seq.instrs,
            vec![Lli::new(
                Opcode::XOR,
                RegId(2),
                cloak_asm::Sources::Binary(RegOrImm::Reg(RegId(0)), RegOrImm::Reg(RegId(1))),
            )]
        );
    }

    #[test]
    fn input_less_node_gets_a_dummy_input() {
        let mlmi = Mlmi::new(
            Mls::new(vec![Hli::mov(MemId(3), MemOrImm::Imm(7))]),
            vec![],
            vec![MemId(3)],
        );
        let llmi = mlmi_to_llmi(&mlmi, 4, 1).expect("allocates");
        assert_eq!(llmi.inputs, vec![MemId(0)]);
    }

    #[test]
    fn schedule_visits_every_node_in_dependency_order() {
        let mlir = MlirProgram {
            instrs: vec![
                Mlmi::from_hli(Hli::binary(Opcode::ADD, MemId(2), MemId(0), MemId(1))),
                Mlmi::from_hli(Hli::binary(Opcode::MUL, MemId(3), MemId(2), MemId(1))),
                Mlmi::from_hli(Hli::binary(Opcode::XOR, MemId(4), MemId(3), MemId(2))),
            ],
            inputs: vec![MemId(0), MemId(1)],
            outputs: vec![MemId(4)],
            memory_count: 5,
        };
        let dfg = Dfg::from_mlir(mlir).expect("valid program");
        let order = schedule(&dfg).expect("acyclic");
        assert_eq!(order, dfg.node_ids());
    }
}
