//! Universalization: reshaping the graph into a shape-uniform,
//! permutation-routed circuit.
//!
//! After rectangularization, the passes here (in order) pad the depth,
//! prepend an input-masking layer, copy every program output forward to the
//! last layer, equalize layer widths, give every interior node exactly
//! `l_in` inputs and `l_out` outputs, and connect adjacent layers through
//! secret permutation networks. What reaches the bus afterwards is a
//! rectangle of identically-shaped multi-instructions whose wiring is
//! hidden by the routing layers.

use std::collections::{HashMap, HashSet};

use cloak_asm::{Hli, MemId, MemOrImm, Mlmi};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::dfg::{Dfg, NodeId};
use crate::rectangularize::{rectangularize, replace_input, Layers};
use crate::routing::{self, log2_exact, BdbFuncMi, Row};
use crate::{Config, Error};

/// Run the whole universalization pipeline over `dfg`.
///
/// Requires a validated configuration with `l_in == l_out`, a power of two.
/// `rng` drives the only random choice (which previous-layer outputs feed
/// the padding inputs); seed it for reproducible builds.
pub fn universalize(dfg: &mut Dfg, config: &Config, rng: &mut impl Rng) -> Result<(), Error> {
    debug_assert!(config.l_in == config.l_out && config.l_in.is_power_of_two());

    let mut layers = rectangularize(dfg, config);
    info!(depth = layers.len(), "rectangularized");

    add_depth_padding(dfg, &mut layers, config);
    add_input_masking_layer(dfg, &mut layers, config);
    propagate_outputs_to_last_layer(dfg, &mut layers, config);
    equalize_layers(dfg, &mut layers, config);
    match_layer_shapes(dfg, &mut layers, config, rng);
    info!(
        depth = layers.len(),
        width = layers[1].len(),
        nodes = dfg.node_count(),
        "universalized shape"
    );

    add_permutations(dfg, &mut layers, config)?;
    info!(nodes = dfg.node_count(), "inserted permutation layers");

    dfg.check_integrity()
}

/// Append empty layers until the program is `config.depth` deep.
fn add_depth_padding(dfg: &mut Dfg, layers: &mut Layers, config: &Config) {
    let depth = layers.len();
    if config.depth == 0 {
        return;
    }
    if config.depth < depth {
        warn!(
            requested = config.depth,
            natural = depth,
            "-depth is below the natural depth of the program; ignoring it"
        );
        return;
    }
    for _ in depth..config.depth {
        let node = dfg.insert_node(Mlmi::empty());
        layers.push(vec![node]);
    }
}

/// Prepend a layer copying every program input into a fresh cell.
///
/// The permutation inserted after this layer then hides which input feeds
/// which consumer. At least one node of the layer is padded to a full
/// `l_out` outputs so the next layer can fill all of its inputs.
fn add_input_masking_layer(dfg: &mut Dfg, layers: &mut Layers, config: &Config) {
    let mut initial_layer = Vec::new();
    let mut old_to_new: HashMap<MemId, MemId> = HashMap::new();

    let old_inputs: Vec<MemId> = dfg.prog_inputs().to_vec();
    let mut remaining = old_inputs.as_slice();
    while !remaining.is_empty() {
        let id = dfg.insert_node(Mlmi::empty());
        initial_layer.push(id);
        while dfg.node(id).inputs.len() < config.l_in as usize
            && dfg.node(id).outputs.len() < config.l_out as usize
            && !remaining.is_empty()
        {
            let (&m, rest) = remaining.split_first().expect("nonempty");
            remaining = rest;
            let masked = dfg.fresh_mem();

            let mlmi = dfg.node_mut(id);
            mlmi.inputs.push(m);
            mlmi.outputs.push(masked);
            mlmi.seq.instrs.push(Hli::mov(masked, m));

            dfg.backward_edges.insert(masked, id);
            old_to_new.insert(m, masked);
        }
    }
    if initial_layer.is_empty() {
        initial_layer.push(dfg.insert_node(Mlmi::empty()));
    }

    // The next layer draws `l_in` inputs from somewhere; make sure the
    // first node offers a full window.
    let first = initial_layer[0];
    while dfg.node(first).outputs.len() != config.l_out as usize {
        let out = dfg.fresh_mem();
        let mlmi = dfg.node_mut(first);
        mlmi.outputs.push(out);
        mlmi.seq.instrs.push(Hli::mov(out, MemOrImm::Imm(0)));
        dfg.backward_edges.insert(out, first);
    }

    // Every downstream use of an old input now reads its masked copy.
    let masked_nodes: HashSet<NodeId> = initial_layer.iter().copied().collect();
    dfg.prog_outputs = dfg
        .prog_outputs
        .iter()
        .map(|m| *old_to_new.get(m).unwrap_or(m))
        .collect();
    for id in dfg.node_ids() {
        if masked_nodes.contains(&id) {
            continue;
        }
        for m in dfg.node(id).inputs.clone() {
            if let Some(masked) = old_to_new.get(&m) {
                let def = dfg.backward_edges[masked];
                dfg.forward_edges
                    .get_mut(&def)
                    .expect("masking node is live")
                    .insert(id);
                replace_input(dfg, id, m, *masked);
            }
        }
    }

    layers.insert(0, initial_layer);
}

/// Add `m` as an input of `node` and make the node export a fresh copy.
fn add_input_output_to_node(dfg: &mut Dfg, m: MemId, node: NodeId) -> MemId {
    let copy = dfg.fresh_mem();

    let mlmi = dfg.node_mut(node);
    mlmi.inputs.push(m);
    mlmi.outputs.push(copy);
    mlmi.seq.instrs.push(Hli::mov(copy, m));

    let def = dfg.backward_edges[&m];
    dfg.forward_edges
        .get_mut(&def)
        .expect("definer is live")
        .insert(node);
    dfg.backward_edges.insert(copy, node);

    copy
}

/// Copy every program output forward, layer by layer, until it is defined
/// in a final reveal layer.
fn propagate_outputs_to_last_layer(dfg: &mut Dfg, layers: &mut Layers, config: &Config) {
    let mut pending: Vec<MemId> = Vec::new();

    for layer_idx in 0..layers.len() {
        let mut renamed: HashMap<MemId, MemId> = HashMap::new();
        while let Some(m) = pending.pop() {
            let spare = layers[layer_idx].iter().copied().find(|&id| {
                let mlmi = dfg.node(id);
                mlmi.inputs.len() < config.l_in as usize
                    && mlmi.outputs.len() < config.l_out as usize
                    && mlmi.seq.len() < config.s as usize
            });
            let node = spare.unwrap_or_else(|| {
                let id = dfg.insert_node(Mlmi::empty());
                layers[layer_idx].push(id);
                id
            });
            renamed.insert(m, add_input_output_to_node(dfg, m, node));
        }

        dfg.prog_outputs = dfg
            .prog_outputs
            .iter()
            .map(|m| *renamed.get(m).unwrap_or(m))
            .collect();

        let prog_outputs: HashSet<MemId> = dfg.prog_outputs.iter().copied().collect();
        pending = layers[layer_idx]
            .iter()
            .flat_map(|&id| dfg.node(id).outputs.iter().copied())
            .filter(|m| prog_outputs.contains(m))
            .collect();
    }

    // The reveal layer: everything the program returns is defined here.
    let mut final_layer = Vec::new();
    let mut renamed: HashMap<MemId, MemId> = HashMap::new();
    while !pending.is_empty() {
        let id = dfg.insert_node(Mlmi::empty());
        while dfg.node(id).inputs.len() < config.l_in as usize
            && dfg.node(id).outputs.len() < config.l_out as usize
            && dfg.node(id).seq.len() < config.s as usize
            && !pending.is_empty()
        {
            let m = pending.pop().expect("nonempty");
            renamed.insert(m, add_input_output_to_node(dfg, m, id));
        }
        final_layer.push(id);
    }
    dfg.prog_outputs = dfg
        .prog_outputs
        .iter()
        .map(|m| *renamed.get(m).unwrap_or(m))
        .collect();

    layers.push(final_layer);
}

/// Pad every interior layer with empty nodes up to the widest one (or
/// `config.width`, if larger).
fn equalize_layers(dfg: &mut Dfg, layers: &mut Layers, config: &Config) {
    let interior = 1..layers.len() - 1;
    let mut max_width = layers[interior.clone()]
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0);

    if config.width != 0 {
        if config.width < max_width {
            warn!(
                requested = config.width,
                natural = max_width,
                "-width is below the natural width of the program; ignoring it"
            );
        } else {
            max_width = config.width;
        }
    }
    info!(width = max_width, "equalizing layer widths");

    for layer in &mut layers[interior] {
        while layer.len() < max_width {
            layer.push(dfg.insert_node(Mlmi::empty()));
        }
    }
}

/// Give every interior node exactly `l_in` inputs and `l_out` outputs.
///
/// Missing inputs are drawn at random (without repetition per node) from
/// the previous layer's outputs; once the permutation layers are in, any
/// choice is equivalent from the dataflow's standpoint. Missing outputs
/// first promote intermediate values, then export fresh zeros.
fn match_layer_shapes(dfg: &mut Dfg, layers: &mut Layers, config: &Config, rng: &mut impl Rng) {
    let mut prev_outputs = layer_outputs(dfg, &layers[0]);

    for layer_idx in 1..layers.len() - 1 {
        for &id in &layers[layer_idx] {
            while dfg.node(id).inputs.len() < config.l_in as usize {
                let candidates: Vec<MemId> = prev_outputs
                    .iter()
                    .copied()
                    .filter(|m| !dfg.node(id).inputs.contains(m))
                    .collect();
                let &pick = candidates
                    .choose(rng)
                    .expect("previous layer is at least l_in wide");
                let def = dfg.backward_edges[&pick];
                dfg.node_mut(id).inputs.push(pick);
                dfg.forward_edges
                    .get_mut(&def)
                    .expect("definer is live")
                    .insert(id);
            }
        }

        for &id in &layers[layer_idx] {
            if dfg.node(id).outputs.len() == config.l_out as usize {
                continue;
            }
            let mut promotable: Vec<MemId> = dfg
                .node(id)
                .seq
                .iter()
                .map(|hli| hli.dst)
                .filter(|m| !dfg.node(id).outputs.contains(m))
                .collect();
            while dfg.node(id).outputs.len() < config.l_out as usize {
                if let Some(m) = promotable.pop() {
                    dfg.node_mut(id).outputs.push(m);
                    dfg.backward_edges.insert(m, id);
                } else {
                    let zero = dfg.fresh_mem();
                    let mlmi = dfg.node_mut(id);
                    mlmi.seq.instrs.push(Hli::mov(zero, MemOrImm::Imm(0)));
                    mlmi.outputs.push(zero);
                    dfg.backward_edges.insert(zero, id);
                }
            }
        }

        prev_outputs = layer_outputs(dfg, &layers[layer_idx]);
    }
}

fn layer_outputs(dfg: &Dfg, layer: &[NodeId]) -> Vec<MemId> {
    let mut seen = HashSet::new();
    layer
        .iter()
        .flat_map(|&id| dfg.node(id).outputs.iter().copied())
        .filter(|m| seen.insert(*m))
        .collect()
}

/// Materialize one secret shuffle as a node of `MOV`s and update the
/// working wire and checker vectors in place.
fn apply_secret_shuffle(
    dfg: &mut Dfg,
    wires: &mut [MemOrImm],
    checker: &mut [usize],
    off: usize,
    perm: &[usize],
) {
    let window: Vec<(MemOrImm, usize)> = perm
        .iter()
        .map(|&idx| (wires[off + idx], checker[off + idx]))
        .collect();
    let inputs: Vec<MemId> = wires[off..off + perm.len()]
        .iter()
        .filter_map(MemOrImm::mem)
        .collect();

    let mut seq = Vec::with_capacity(window.len());
    let mut outputs = Vec::with_capacity(window.len());
    for (slot, &(src, chk)) in window.iter().enumerate() {
        let out = dfg.fresh_mem();
        seq.push(Hli::mov(out, src));
        outputs.push(out);
        wires[off + slot] = MemOrImm::Mem(out);
        checker[off + slot] = chk;
    }

    let id = dfg.insert_node(Mlmi::new(cloak_asm::Mls::new(seq), inputs.clone(), outputs.clone()));
    for out in outputs {
        dfg.backward_edges.insert(out, id);
    }
    for m in inputs {
        if let Some(&def) = dfg.backward_edges.get(&m) {
            dfg.forward_edges
                .get_mut(&def)
                .expect("definer is live")
                .insert(id);
        }
    }
}

/// Replace the direct wiring between every pair of adjacent layers by a
/// compiled permutation network.
///
/// A parallel integer vector goes through the same reindexing as the wire
/// vector; any divergence from the target wiring is a miscompile and
/// aborts the build.
fn add_permutations(dfg: &mut Dfg, layers: &mut Layers, config: &Config) -> Result<(), Error> {
    let le = log2_exact(config.l_in as usize);

    for layer_idx in 0..layers.len() - 1 {
        let sources: Vec<MemId> = layers[layer_idx]
            .iter()
            .flat_map(|&id| dfg.node(id).outputs.iter().copied())
            .collect();
        let sinks: Vec<MemId> = layers[layer_idx + 1]
            .iter()
            .flat_map(|&id| dfg.node(id).inputs.iter().copied())
            .collect();

        // The network replaces the direct wiring entirely.
        for &id in &layers[layer_idx] {
            dfg.forward_edges
                .get_mut(&id)
                .expect("layer node is live")
                .clear();
        }

        let size = sources.len().max(sinks.len()).next_power_of_two();
        let source_pos: HashMap<MemId, usize> =
            sources.iter().enumerate().map(|(i, &m)| (m, i)).collect();
        let mut target: Vec<usize> = sinks
            .iter()
            .map(|m| {
                source_pos.get(m).copied().ok_or_else(|| {
                    Error::Integrity(format!(
                        "{m} feeds layer {} but is not produced by layer {}",
                        layer_idx + 1,
                        layer_idx
                    ))
                })
            })
            .collect::<Result<_, _>>()?;
        target.resize(size, 0);

        let mut wires: Vec<MemOrImm> = sources.iter().map(|&m| MemOrImm::Mem(m)).collect();
        wires.resize(size, MemOrImm::Imm(0));
        let mut checker: Vec<usize> = (0..size).collect();

        let rows = routing::optimize(BdbFuncMi::new(&target, le).canonical());
        debug!(
            layer = layer_idx,
            size,
            rows = rows.len(),
            "compiled inter-layer permutation"
        );
        for row in &rows {
            match row {
                Row::Public(p) => {
                    wires = p.0.iter().map(|&i| wires[i]).collect();
                    checker = p.0.iter().map(|&i| checker[i]).collect();
                }
                Row::Secret(groups) => {
                    for (off, perm) in &groups.0 {
                        apply_secret_shuffle(dfg, &mut wires, &mut checker, *off, &perm.0);
                    }
                }
            }
        }

        if checker != target {
            return Err(Error::PermutationMismatch {
                layer: layer_idx,
                next: layer_idx + 1,
            });
        }

        // The next layer now reads the network's outputs.
        let mut off = 0;
        for id in layers[layer_idx + 1].clone() {
            let input_count = dfg.node(id).inputs.len();
            for slot in 0..input_count {
                let old = dfg.node(id).inputs[slot];
                let new = match wires[off + slot] {
                    MemOrImm::Mem(m) => m,
                    MemOrImm::Imm(_) => {
                        return Err(Error::Integrity(format!(
                            "permutation network left a padding wire on slot {slot} of {id}"
                        )))
                    }
                };
                let def = dfg.backward_edges[&new];
                dfg.forward_edges
                    .get_mut(&def)
                    .expect("definer is live")
                    .insert(id);
                replace_input(dfg, id, old, new);
            }
            off += input_count;
        }
    }

    Ok(())
}
