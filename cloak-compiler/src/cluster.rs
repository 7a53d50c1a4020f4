//! Clusterization: grouping single instructions into multi-instructions.
//!
//! Starting from one multi-instruction per instruction, three passes merge
//! nodes of the dataflow graph while every candidate respects the element
//! shape (`l_in`, `l_out`, `s`), register pressure, and acyclicity:
//!
//! 1. nodes with a single consumer fuse into that consumer,
//! 2. parent/child pairs merge by best saving in inputs plus outputs,
//! 3. siblings sharing a parent merge by the same score.

use std::collections::BTreeSet;

use cloak_asm::{HlirProgram, MlirProgram, Mlmi, Mls};
use itertools::Itertools;
use tracing::{debug, info};

use crate::dfg::{Dfg, NodeId};
use crate::{regalloc, Config, Error};

/// One multi-instruction per instruction, so the passes only ever deal
/// with merges of multi-instructions.
fn initial_mlir(hlir: HlirProgram) -> MlirProgram {
    MlirProgram {
        instrs: hlir.instrs.into_iter().map(Mlmi::from_hli).collect(),
        inputs: hlir.inputs,
        outputs: hlir.outputs,
        memory_count: hlir.memory_count,
    }
}

/// Group the instructions of `hlir` into capacity-respecting
/// multi-instructions and return the resulting dataflow graph.
pub fn clusterize(hlir: HlirProgram, config: &Config) -> Result<Dfg, Error> {
    let mut dfg = Dfg::from_mlir(initial_mlir(hlir))?;

    let (inout, nodes) = graph_size(&dfg);
    info!(inputs_outputs = inout, nodes, "before clusterization");

    merge_single_output_nodes(&mut dfg, config);
    merge_parents_children(&mut dfg, config);
    merge_siblings(&mut dfg, config);

    let (inout, nodes) = graph_size(&dfg);
    info!(inputs_outputs = inout, nodes, "after clusterization");

    Ok(dfg)
}

fn graph_size(dfg: &Dfg) -> (usize, usize) {
    let inout = dfg
        .node_ids()
        .iter()
        .map(|&id| dfg.node(id).inputs.len() + dfg.node(id).outputs.len())
        .sum();
    (inout, dfg.node_count())
}

/// Pass 1: a node with exactly one consumer disappears into it, as long as
/// the fusion stays within `l_in`, `s`, and the register file. The direct
/// edge makes the merge trivially cycle-safe.
fn merge_single_output_nodes(dfg: &mut Dfg, config: &Config) {
    fn fusion_seq(dfg: &Dfg, config: &Config, node: NodeId) -> Option<(NodeId, Mls)> {
        if dfg.output_count(node) != 1 {
            return None;
        }
        let next = dfg.next_nodes(node)[0];
        let merged_inputs = dfg.compute_merged_inputs(node, next);
        if merged_inputs.len() > config.l_in as usize {
            return None;
        }
        if dfg.node(node).seq.len() + dfg.node(next).seq.len() > config.s as usize {
            return None;
        }
        let merged_instrs = dfg.compute_merged_instrs(node, next, &merged_inputs);
        let merged_outputs = dfg.compute_merged_outputs(node, next);
        if !regalloc::fits(
            &merged_instrs.instrs,
            &merged_inputs,
            &merged_outputs,
            config.r,
            config.l_out,
        ) {
            return None;
        }
        Some((next, merged_instrs))
    }

    if config.simple_clusterizer {
        let mut to_visit: BTreeSet<NodeId> = dfg.node_ids().into_iter().collect();
        while let Some(candidate) = to_visit.pop_first() {
            if !dfg.is_live(candidate) {
                continue;
            }
            let Some((next, seq)) = fusion_seq(dfg, config, candidate) else {
                continue;
            };
            let merged = dfg.merge_nodes(candidate, next, Some(seq));
            debug!(%merged, "fused single-output node");

            to_visit.extend(dfg.next_nodes(merged));
            to_visit.extend(dfg.prev_nodes(merged));
            to_visit.insert(merged);
        }
    } else {
        loop {
            let found = dfg
                .node_ids()
                .into_iter()
                .find_map(|n| fusion_seq(dfg, config, n).map(|(next, seq)| (n, next, seq)));
            match found {
                Some((node, next, seq)) => {
                    let merged = dfg.merge_nodes(node, next, Some(seq));
                    debug!(%merged, "fused single-output node");
                }
                None => break,
            }
        }
    }
}

/// Score a candidate merge: the number of inputs and outputs it saves.
/// `None` means the merge is illegal. Constraints are checked from the
/// cheapest to the most expensive so most candidates bail early.
fn merge_score(dfg: &Dfg, config: &Config, n1: NodeId, n2: NodeId) -> Option<(usize, Mls)> {
    if dfg.node(n1).seq.len() + dfg.node(n2).seq.len() > config.s as usize {
        return None;
    }
    let merged_inputs = dfg.compute_merged_inputs(n1, n2);
    if merged_inputs.len() > config.l_in as usize {
        return None;
    }
    let merged_outputs = dfg.compute_merged_outputs(n1, n2);
    if merged_outputs.len() > config.l_out as usize {
        return None;
    }
    let merged_instrs = dfg.compute_merged_instrs(n1, n2, &merged_inputs);
    if !regalloc::fits(
        &merged_instrs.instrs,
        &merged_inputs,
        &merged_outputs,
        config.r,
        config.l_out,
    ) {
        return None;
    }
    if !dfg.check_domination_for_merge(n1, n2) {
        return None;
    }

    let score = dfg.node(n1).inputs.len() + dfg.node(n2).inputs.len() - merged_inputs.len()
        + dfg.node(n1).outputs.len()
        + dfg.node(n2).outputs.len()
        - merged_outputs.len();
    Some((score, merged_instrs))
}

/// The best-scoring legal merge of `n1` with one of its direct consumers.
fn best_child_merge(dfg: &Dfg, config: &Config, n1: NodeId) -> Option<(usize, NodeId, Mls)> {
    dfg.next_nodes(n1)
        .into_iter()
        .filter_map(|n2| merge_score(dfg, config, n1, n2).map(|(score, seq)| (score, n2, seq)))
        .max_by_key(|(score, ..)| *score)
}

/// Pass 2: merge parents with their children while a legal merge exists,
/// taking the best-scoring child each time.
fn merge_parents_children(dfg: &mut Dfg, config: &Config) {
    if config.simple_clusterizer {
        let mut to_visit: BTreeSet<NodeId> = dfg.node_ids().into_iter().collect();
        while let Some(n1) = to_visit.pop_first() {
            if !dfg.is_live(n1) {
                continue;
            }
            let Some((score, n2, seq)) = best_child_merge(dfg, config, n1) else {
                continue;
            };
            let merged = dfg.merge_nodes(n1, n2, Some(seq));
            debug!(%merged, score, "merged parent with child");

            if !config.fast {
                to_visit.extend(dfg.next_nodes(merged));
                to_visit.extend(dfg.prev_nodes(merged));
                to_visit.insert(merged);
            }
        }
    } else {
        let mut to_skip: BTreeSet<NodeId> = BTreeSet::new();
        loop {
            let mut found = None;
            for n1 in dfg.node_ids() {
                if config.fast && to_skip.contains(&n1) {
                    continue;
                }
                if let Some((score, n2, seq)) = best_child_merge(dfg, config, n1) {
                    found = Some((score, n1, n2, seq));
                    break;
                } else if config.fast {
                    to_skip.insert(n1);
                }
            }
            match found {
                Some((score, n1, n2, seq)) => {
                    let merged = dfg.merge_nodes(n1, n2, Some(seq));
                    debug!(%merged, score, "merged parent with child");
                }
                None => break,
            }
        }
    }
}

/// Pass 3: for every node with several consumers, merge the best pair of
/// siblings, while some pair still saves traffic.
fn merge_siblings(dfg: &mut Dfg, config: &Config) {
    let mut to_skip: BTreeSet<NodeId> = BTreeSet::new();
    let mut merged_any = true;
    while merged_any {
        merged_any = false;
        for parent in dfg.node_ids() {
            if config.fast && to_skip.contains(&parent) {
                continue;
            }
            let best = dfg
                .next_nodes(parent)
                .into_iter()
                .tuple_combinations()
                .filter_map(|(c1, c2)| {
                    merge_score(dfg, config, c1, c2).map(|(score, seq)| (score, c1, c2, seq))
                })
                .max_by_key(|(score, ..)| *score);
            match best {
                Some((score, c1, c2, seq)) if score > 0 => {
                    let merged = dfg.merge_nodes(c1, c2, Some(seq));
                    debug!(%merged, score, "merged siblings");
                    merged_any = true;
                    break;
                }
                _ => {
                    if config.fast {
                        to_skip.insert(parent);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_asm::{Hli, MemId, Opcode};

    fn hlir(instrs: Vec<Hli>, inputs: Vec<MemId>, outputs: Vec<MemId>) -> HlirProgram {
        let memory_count = instrs
            .iter()
            .map(|i| i.dst.0 + 1)
            .chain(inputs.iter().map(|m| m.0 + 1))
            .max()
            .unwrap_or(0);
        HlirProgram {
            instrs,
            inputs,
            outputs,
            memory_count,
        }
    }

    #[test]
    fn single_xor_stays_one_node() {
        let prog = hlir(
            vec![Hli::binary(Opcode::XOR, MemId(2), MemId(0), MemId(1))],
            vec![MemId(0), MemId(1)],
            vec![MemId(2)],
        );
        let dfg = clusterize(prog, &Config::new(4, 2, 2, 2)).expect("clusterizes");

        assert_eq!(dfg.node_count(), 1);
        let node = dfg.node(dfg.node_ids()[0]);
        assert_eq!(node.inputs, vec![MemId(0), MemId(1)]);
        assert_eq!(node.outputs, vec![MemId(2)]);
        assert_eq!(node.seq.len(), 1);
    }

    #[test]
    fn single_output_chain_fuses() {
        // ADD feeds only XOR: pass 1 folds them into one node.
        let prog = hlir(
            vec![
                Hli::binary(Opcode::ADD, MemId(3), MemId(0), MemId(1)),
                Hli::binary(Opcode::XOR, MemId(4), MemId(3), MemId(2)),
            ],
            vec![MemId(0), MemId(1), MemId(2)],
            vec![MemId(4)],
        );
        let dfg = clusterize(prog, &Config::new(4, 3, 1, 2)).expect("clusterizes");

        assert_eq!(dfg.node_count(), 1);
        let node = dfg.node(dfg.node_ids()[0]);
        let mut inputs = node.inputs.clone();
        inputs.sort();
        assert_eq!(inputs, vec![MemId(0), MemId(1), MemId(2)]);
        assert_eq!(node.outputs, vec![MemId(4)]);
        assert_eq!(node.seq.len(), 2);
        dfg.check_integrity().expect("graph stays consistent");
    }

    #[test]
    fn instruction_budget_blocks_fusion() {
        let prog = hlir(
            vec![
                Hli::binary(Opcode::ADD, MemId(3), MemId(0), MemId(1)),
                Hli::binary(Opcode::XOR, MemId(4), MemId(3), MemId(2)),
            ],
            vec![MemId(0), MemId(1), MemId(2)],
            vec![MemId(4)],
        );
        let dfg = clusterize(prog, &Config::new(4, 3, 1, 1)).expect("clusterizes");
        assert_eq!(dfg.node_count(), 2);
    }

    #[test]
    fn register_exhaustion_blocks_merges() {
        // Both operands of the final OR stay live across the other's
        // computation; with r=3, l_in=2, l_out=1 there is no room, so every
        // node stays separate.
        let prog = hlir(
            vec![
                Hli::binary(Opcode::ADD, MemId(2), MemId(0), MemId(1)),
                Hli::binary(Opcode::SUB, MemId(3), MemId(0), MemId(1)),
                Hli::binary(Opcode::MUL, MemId(4), MemId(2), MemId(3)),
            ],
            vec![MemId(0), MemId(1)],
            vec![MemId(4)],
        );
        let config = Config::new(3, 2, 1, 8);
        let dfg = clusterize(prog, &config).expect("clusterizes");
        for id in dfg.node_ids() {
            assert!(regalloc::fits(
                &dfg.node(id).seq.instrs,
                &dfg.node(id).inputs,
                &dfg.node(id).outputs,
                config.r,
                config.l_out,
            ));
        }
    }

    #[test]
    fn domination_is_respected_across_passes() {
        // a -> b, a -> c, b -> c with capacities that allow nothing but the
        // illegal a+c merge; the clusterizer must leave the shape alone
        // rather than close a cycle.
        let prog = hlir(
            vec![
                Hli::binary(Opcode::ADD, MemId(1), MemId(0), MemId(0)),
                Hli::binary(Opcode::MUL, MemId(2), MemId(1), MemId(1)),
                Hli::binary(Opcode::XOR, MemId(3), MemId(1), MemId(2)),
            ],
            vec![MemId(0)],
            vec![MemId(3)],
        );
        let config = Config::new(4, 2, 2, 2);
        let dfg = clusterize(prog, &config).expect("clusterizes");
        dfg.check_integrity().expect("graph stays consistent");

        // Whatever merged, the graph must still be acyclic: a topological
        // sweep must visit every node.
        let schedule = crate::lowering::schedule(&dfg).expect("acyclic graph schedules");
        assert_eq!(schedule.len(), dfg.node_count());
    }

    #[test]
    fn exhaustive_and_simple_modes_agree_on_capacities() {
        let build = || {
            hlir(
                vec![
                    Hli::binary(Opcode::ADD, MemId(4), MemId(0), MemId(1)),
                    Hli::binary(Opcode::XOR, MemId(5), MemId(2), MemId(3)),
                    Hli::binary(Opcode::AND, MemId(6), MemId(4), MemId(5)),
                    Hli::binary(Opcode::OR, MemId(7), MemId(4), MemId(6)),
                ],
                vec![MemId(0), MemId(1), MemId(2), MemId(3)],
                vec![MemId(7)],
            )
        };
        for simple in [false, true] {
            let config = Config {
                simple_clusterizer: simple,
                ..Config::new(8, 4, 2, 4)
            };
            let dfg = clusterize(build(), &config).expect("clusterizes");
            dfg.check_integrity().expect("graph stays consistent");
            for id in dfg.node_ids() {
                let node = dfg.node(id);
                assert!(node.inputs.len() <= config.l_in as usize);
                assert!(node.outputs.len() <= config.l_out as usize);
                assert!(node.seq.len() <= config.s as usize);
            }
        }
    }
}
