//! Rectangularization: reshaping the graph so every edge spans exactly one
//! layer.
//!
//! Nodes first get a layer by longest path from the program inputs. An
//! edge that skips layers is then routed through the intermediate layer:
//! preferably through an existing node with spare budget (best of all, one
//! that already carries the operand), otherwise through a fresh node. The
//! carried value is copied with a `MOV` into a fresh cell, so the SSA
//! discipline holds.

use std::collections::{BTreeSet, HashMap, HashSet};

use cloak_asm::{Hli, MemId, MemOrImm, Mlmi};

use crate::dfg::{Dfg, NodeId};
use crate::Config;

/// Layer assignment of every node, lowest layer first.
pub type Layers = Vec<Vec<NodeId>>;

/// Compute layers by longest path from the program inputs.
fn layerize(dfg: &Dfg) -> (HashMap<NodeId, usize>, Layers) {
    let mut node_layers: HashMap<NodeId, usize> = HashMap::new();
    let mut to_visit: BTreeSet<NodeId> = dfg.node_ids().into_iter().collect();
    let mut last_layer = 0;

    while !to_visit.is_empty() {
        let mut placed = Vec::new();
        for &node in &to_visit {
            let mut layer = 0;
            let mut ready = true;
            for prev in dfg.prev_nodes(node) {
                match node_layers.get(&prev) {
                    Some(&l) => layer = layer.max(l + 1),
                    None => {
                        ready = false;
                        break;
                    }
                }
            }
            if ready {
                last_layer = last_layer.max(layer);
                node_layers.insert(node, layer);
                placed.push(node);
            }
        }
        assert!(!placed.is_empty(), "dataflow graph is cyclic");
        for node in placed {
            to_visit.remove(&node);
        }
    }

    let mut layers: Layers = vec![Vec::new(); last_layer + 1];
    for id in dfg.node_ids() {
        layers[node_layers[&id]].push(id);
    }
    (node_layers, layers)
}

/// Replace every occurrence of `old` in the inputs and sources of `node`.
pub(crate) fn replace_input(dfg: &mut Dfg, node: NodeId, old: MemId, new: MemId) {
    let mlmi = dfg.node_mut(node);
    for m in &mut mlmi.inputs {
        if *m == old {
            *m = new;
        }
    }
    for instr in &mut mlmi.seq.instrs {
        instr.srcs = instr.srcs.map(|src| match src {
            MemOrImm::Mem(m) if *m == old => MemOrImm::Mem(new),
            other => *other,
        });
    }
}

/// Drop the `def -> user` edge unless some cell still justifies it.
fn remove_forward_edge_if_needed(dfg: &mut Dfg, def: NodeId, user: NodeId) {
    let outputs: HashSet<MemId> = dfg.node(def).outputs.iter().copied().collect();
    let still_needed = dfg.node(user).inputs.iter().any(|m| outputs.contains(m));
    if !still_needed {
        dfg.forward_edges
            .get_mut(&def)
            .expect("definer is live")
            .remove(&user);
    }
}

struct Segregator {
    /// Per cell: the copy available in each layer, if one was made.
    alternative_defs: HashMap<MemId, Vec<Option<MemId>>>,
    layer_count: usize,
}

impl Segregator {
    fn alternative(&self, m: MemId, layer: usize) -> Option<MemId> {
        self.alternative_defs.get(&m).and_then(|defs| defs[layer])
    }

    /// Make `node` (in `layer`) export a copy of `old_m` under a fresh
    /// name.
    fn make_alternative(
        &mut self,
        dfg: &mut Dfg,
        old_m: MemId,
        node: NodeId,
        layer: usize,
    ) -> MemId {
        let new_m = dfg.fresh_mem();
        self.alternative_defs
            .entry(old_m)
            .or_insert_with(|| vec![None; self.layer_count])[layer] = Some(new_m);

        dfg.backward_edges.insert(new_m, node);
        let needs_input = !dfg.node(node).inputs.contains(&old_m);
        {
            let mlmi = dfg.node_mut(node);
            mlmi.outputs.push(new_m);
            if needs_input {
                mlmi.inputs.push(old_m);
            }
            // The copy goes to the head of the body so the input does not
            // stay live across the whole sequence.
            mlmi.seq.instrs.insert(0, Hli::mov(new_m, old_m));
        }
        if needs_input && !dfg.is_prog_input(old_m) {
            let def = dfg.backward_edges[&old_m];
            dfg.forward_edges
                .get_mut(&def)
                .expect("definer is live")
                .insert(node);
        }

        new_m
    }

    /// Reroute the layer-skipping edge `def_node -> dst_node` carried by
    /// `m` through `mid_layer`.
    fn break_edge(
        &mut self,
        dfg: &mut Dfg,
        node_layers: &mut HashMap<NodeId, usize>,
        layers: &mut Layers,
        config: &Config,
        def_node: Option<NodeId>,
        dst_node: NodeId,
        mid_layer: usize,
        m: MemId,
    ) {
        if let Some(alt_m) = self.alternative(m, mid_layer) {
            // A copy of `m` already lives in the intermediate layer.
            let alt_def = dfg.backward_edges[&alt_m];
            dfg.forward_edges
                .get_mut(&alt_def)
                .expect("definer is live")
                .insert(dst_node);
            replace_input(dfg, dst_node, m, alt_m);
            if let Some(def) = def_node {
                remove_forward_edge_if_needed(dfg, def, dst_node);
            }
            return;
        }

        // Prefer a node that already carries `m`, else any node with spare
        // input, output, and instruction budget.
        let mut candidate = None;
        for &other in &layers[mid_layer] {
            let mlmi = dfg.node(other);
            if mlmi.outputs.len() < config.l_out as usize && mlmi.seq.len() < config.s as usize {
                if mlmi.inputs.contains(&m) {
                    candidate = Some(other);
                    break;
                } else if mlmi.inputs.len() < config.l_in as usize {
                    candidate = Some(other);
                }
            }
        }
        let node = candidate.unwrap_or_else(|| {
            let id = dfg.insert_node(Mlmi::empty());
            node_layers.insert(id, mid_layer);
            layers[mid_layer].push(id);
            id
        });

        let alt_m = self.make_alternative(dfg, m, node, mid_layer);
        replace_input(dfg, dst_node, m, alt_m);
        dfg.forward_edges
            .get_mut(&node)
            .expect("carrier is live")
            .insert(dst_node);

        if let Some(def) = def_node {
            remove_forward_edge_if_needed(dfg, def, dst_node);
            dfg.forward_edges
                .get_mut(&def)
                .expect("definer is live")
                .insert(node);
        }
    }
}

/// Route every layer-skipping edge through the intermediate layers.
///
/// Walks the layers from the last to the first so a copy made for a deep
/// consumer is reusable by shallower ones through `alternative_defs`.
fn segregate_layers(
    dfg: &mut Dfg,
    node_layers: &mut HashMap<NodeId, usize>,
    layers: &mut Layers,
    config: &Config,
) {
    let mut segregator = Segregator {
        alternative_defs: HashMap::new(),
        layer_count: layers.len(),
    };

    for curr_layer in (1..layers.len()).rev() {
        for node in layers[curr_layer].clone() {
            for m in dfg.node(node).inputs.clone() {
                let (def_node, def_layer) = if dfg.is_prog_input(m) {
                    (None, None)
                } else {
                    let def = dfg.backward_edges[&m];
                    (Some(def), Some(node_layers[&def]))
                };
                if def_layer != Some(curr_layer - 1) {
                    segregator.break_edge(
                        dfg,
                        node_layers,
                        layers,
                        config,
                        def_node,
                        node,
                        curr_layer - 1,
                        m,
                    );
                }
            }
        }
    }
}

/// Layerize the graph and make every edge span exactly one layer.
pub fn rectangularize(dfg: &mut Dfg, config: &Config) -> Layers {
    let (mut node_layers, mut layers) = layerize(dfg);
    segregate_layers(dfg, &mut node_layers, &mut layers, config);
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_asm::{MlirProgram, Opcode};

    fn skip_layer_dfg() -> Dfg {
        // a: m1 = m0 + m0 (layer 0)
        // b: m2 = m1 * m1 (layer 1)
        // c: m3 = m1 ^ m2 (layer 2, reads m1 across two layers)
        let mlir = MlirProgram {
            instrs: vec![
                Mlmi::from_hli(Hli::binary(Opcode::ADD, MemId(1), MemId(0), MemId(0))),
                Mlmi::from_hli(Hli::binary(Opcode::MUL, MemId(2), MemId(1), MemId(1))),
                Mlmi::from_hli(Hli::binary(Opcode::XOR, MemId(3), MemId(1), MemId(2))),
            ],
            inputs: vec![MemId(0)],
            outputs: vec![MemId(3)],
            memory_count: 4,
        };
        Dfg::from_mlir(mlir).expect("valid program")
    }

    #[test]
    fn layerize_uses_longest_paths() {
        let dfg = skip_layer_dfg();
        let (node_layers, layers) = layerize(&dfg);
        assert_eq!(layers.len(), 3);
        let ids = dfg.node_ids();
        assert_eq!(node_layers[&ids[0]], 0);
        assert_eq!(node_layers[&ids[1]], 1);
        assert_eq!(node_layers[&ids[2]], 2);
    }

    #[test]
    fn skipping_edges_are_routed_through_the_middle_layer() {
        let mut dfg = skip_layer_dfg();
        let config = Config::new(8, 4, 4, 4);
        let layers = rectangularize(&mut dfg, &config);

        dfg.check_integrity().expect("graph stays consistent");
        // Every input of every node now comes from the previous layer or
        // from the program inputs.
        for (idx, layer) in layers.iter().enumerate() {
            for &id in layer {
                for m in &dfg.node(id).inputs {
                    if dfg.is_prog_input(*m) {
                        assert_eq!(idx, 0, "program inputs are only read in layer 0");
                        continue;
                    }
                    let def = dfg.backward_edges[m];
                    let def_layer = layers
                        .iter()
                        .position(|l| l.contains(&def))
                        .expect("definer is placed");
                    assert_eq!(def_layer + 1, idx, "edge for {m} spans one layer");
                }
            }
        }
    }

    #[test]
    fn middle_node_with_budget_carries_the_copy() {
        let mut dfg = skip_layer_dfg();
        let config = Config::new(8, 4, 4, 4);
        let before = dfg.node_count();
        rectangularize(&mut dfg, &config);
        // The MUL node had spare budget, so no fresh node was needed.
        assert_eq!(dfg.node_count(), before);
    }

    #[test]
    fn saturated_middle_layer_gets_a_fresh_node() {
        let mut dfg = skip_layer_dfg();
        // No spare output slot in the middle node.
        let config = Config::new(2, 1, 1, 4);
        let before = dfg.node_count();
        rectangularize(&mut dfg, &config);
        assert_eq!(dfg.node_count(), before + 1);
        dfg.check_integrity().expect("graph stays consistent");
    }
}
