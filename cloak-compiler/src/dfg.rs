//! Dataflow graph over mid-level multi-instructions.

use core::fmt;
use std::collections::{BTreeSet, HashMap, HashSet};

use cloak_asm::{Hli, MemId, MemOrImm, MlirProgram, Mlmi, Mls};

use crate::Error;

/// Stable identifier of a node in a [`Dfg`].
///
/// Identifiers index an arena and are never reused within one graph, so
/// they stay valid across merges (of other nodes) and node insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Dataflow graph of a program.
///
/// Nodes are [`Mlmi`]s. `backward_edges` maps every defined memory cell to
/// the node defining it (unique, by SSA); `forward_edges` maps every node
/// to the nodes consuming any of its outputs.
#[derive(Debug, Clone)]
pub struct Dfg {
    slots: Vec<Option<Mlmi>>,
    pub(crate) backward_edges: HashMap<MemId, NodeId>,
    pub(crate) forward_edges: HashMap<NodeId, BTreeSet<NodeId>>,
    prog_inputs: Vec<MemId>,
    prog_input_set: HashSet<MemId>,
    pub(crate) prog_outputs: Vec<MemId>,
    pub(crate) memory_count: u32,
}

impl Dfg {
    /// Build the dataflow graph of `mlir`.
    ///
    /// Fails when an instruction reads a cell that is neither a program
    /// input nor defined by some multi-instruction.
    pub fn from_mlir(mlir: MlirProgram) -> Result<Self, Error> {
        let MlirProgram {
            instrs,
            inputs,
            outputs,
            memory_count,
        } = mlir;

        let prog_input_set: HashSet<MemId> = inputs.iter().copied().collect();

        let mut dfg = Self {
            slots: Vec::with_capacity(instrs.len()),
            backward_edges: HashMap::new(),
            forward_edges: HashMap::new(),
            prog_inputs: inputs,
            prog_input_set,
            prog_outputs: outputs,
            memory_count,
        };

        for mlmi in instrs {
            let id = dfg.insert_node(mlmi);
            for m in dfg.node(id).defs() {
                dfg.backward_edges.insert(m, id);
            }
        }

        for id in dfg.node_ids() {
            for m in dfg.node(id).uses() {
                if dfg.prog_input_set.contains(&m) {
                    continue;
                }
                let def = *dfg.backward_edges.get(&m).ok_or_else(|| {
                    Error::Integrity(format!("{m} is read but never defined"))
                })?;
                dfg.forward_edges.get_mut(&def).expect("def node exists").insert(id);
            }
        }

        Ok(dfg)
    }

    /// All live node identifiers, in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| NodeId(idx as u32))
            .collect()
    }

    /// `true` iff `id` has not been destroyed by a merge.
    ///
    /// Work lists may hold on to identifiers across merges; this lets them
    /// skip the stale ones.
    pub fn is_live(&self, id: NodeId) -> bool {
        self.slots[id.0 as usize].is_some()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// The multi-instruction behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was destroyed by a merge.
    pub fn node(&self, id: NodeId) -> &Mlmi {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("node id refers to a live node")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Mlmi {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("node id refers to a live node")
    }

    /// Add a node with no edges; the caller wires it up.
    pub(crate) fn insert_node(&mut self, mlmi: Mlmi) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(mlmi));
        self.forward_edges.insert(id, BTreeSet::new());
        id
    }

    /// Allocate a fresh memory cell.
    pub(crate) fn fresh_mem(&mut self) -> MemId {
        let m = MemId(self.memory_count);
        self.memory_count += 1;
        m
    }

    /// The program inputs, in declaration order.
    pub fn prog_inputs(&self) -> &[MemId] {
        &self.prog_inputs
    }

    /// The program outputs, in declaration order.
    pub fn prog_outputs(&self) -> &[MemId] {
        &self.prog_outputs
    }

    /// Number of memory cells addressed by the program.
    pub fn memory_count(&self) -> u32 {
        self.memory_count
    }

    /// `true` iff `m` is a program input.
    pub fn is_prog_input(&self, m: MemId) -> bool {
        self.prog_input_set.contains(&m)
    }

    /// Number of nodes consuming outputs of `id`.
    pub fn output_count(&self, id: NodeId) -> usize {
        self.forward_edges[&id].len()
    }

    /// The nodes consuming outputs of `id`.
    pub fn next_nodes(&self, id: NodeId) -> Vec<NodeId> {
        self.forward_edges[&id].iter().copied().collect()
    }

    /// The nodes defining inputs of `id`.
    pub fn prev_nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut prevs = BTreeSet::new();
        for m in &self.node(id).inputs {
            if let Some(def) = self.backward_edges.get(m) {
                prevs.insert(*def);
            }
        }
        prevs.into_iter().collect()
    }

    /// Check whether `n1` and `n2` may be merged without creating a cycle.
    ///
    /// The merge is illegal when some node is reachable from one of the two
    /// through a path that does not start with the direct edge between
    /// them, and reaches the other: contracting the pair would close a
    /// cycle. Returns `false` in that case.
    pub fn check_domination_for_merge(&self, n1: NodeId, n2: NodeId) -> bool {
        for (start, end) in [(n1, n2), (n2, n1)] {
            let mut to_visit: Vec<NodeId> = self
                .next_nodes(start)
                .into_iter()
                .filter(|&n| n != end)
                .collect();
            let mut visited = HashSet::new();
            while let Some(n) = to_visit.pop() {
                if !visited.insert(n) {
                    continue;
                }
                if n == end {
                    return false;
                }
                to_visit.extend(self.next_nodes(n));
            }
        }
        true
    }

    /// Inputs of the node that would result from merging `n1` and `n2`.
    pub fn compute_merged_inputs(&self, n1: NodeId, n2: NodeId) -> Vec<MemId> {
        let (a, b) = (self.node(n1), self.node(n2));
        let internal: HashSet<MemId> = a.outputs.iter().chain(&b.outputs).copied().collect();
        let mut seen = HashSet::new();
        a.inputs
            .iter()
            .chain(&b.inputs)
            .copied()
            .filter(|m| !internal.contains(m) && seen.insert(*m))
            .collect()
    }

    /// Outputs of the node that would result from merging `n1` and `n2`.
    ///
    /// An output consumed only inside the pair becomes an internal value
    /// and is dropped; it survives when some other node (or the program
    /// itself) also consumes it.
    pub fn compute_merged_outputs(&self, n1: NodeId, n2: NodeId) -> Vec<MemId> {
        let prog_outputs: HashSet<MemId> = self.prog_outputs.iter().copied().collect();
        let mut outputs = Vec::new();
        let mut seen = HashSet::new();

        for (first, second) in [(n1, n2), (n2, n1)] {
            let second_inputs: HashSet<MemId> =
                self.node(second).inputs.iter().copied().collect();
            for &o in &self.node(first).outputs {
                if !seen.insert(o) {
                    continue;
                }
                if second_inputs.contains(&o) {
                    let mut use_count = self
                        .next_nodes(first)
                        .into_iter()
                        .filter(|&n| self.node(n).inputs.contains(&o))
                        .count();
                    if prog_outputs.contains(&o) {
                        use_count += 1;
                    }
                    debug_assert!(use_count >= 1);
                    if use_count > 1 {
                        outputs.push(o);
                    }
                } else {
                    outputs.push(o);
                }
            }
        }

        outputs
    }

    /// One valid schedule of the union of the two bodies.
    ///
    /// Instructions are emitted once all their memory sources are defined,
    /// seeding the defined set with `merged_inputs`. The order within a
    /// ready set is unspecified; callers must not re-invoke this expecting
    /// a different (or the same) schedule.
    ///
    /// # Panics
    ///
    /// Panics if the union cannot be scheduled, which only happens when the
    /// two nodes do not satisfy the merge preconditions.
    pub fn compute_merged_instrs(
        &self,
        n1: NodeId,
        n2: NodeId,
        merged_inputs: &[MemId],
    ) -> Mls {
        let mut pending: Vec<Hli> = self
            .node(n1)
            .seq
            .iter()
            .chain(self.node(n2).seq.iter())
            .cloned()
            .collect();
        let mut defined: HashSet<MemId> = merged_inputs.iter().copied().collect();
        let mut instrs = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let mut progressed = false;
            let mut remaining = Vec::with_capacity(pending.len());
            for instr in pending {
                let ready = instr
                    .srcs
                    .iter()
                    .all(|src| !matches!(src, MemOrImm::Mem(m) if !defined.contains(m)));
                if ready {
                    defined.insert(instr.dst);
                    instrs.push(instr);
                    progressed = true;
                } else {
                    remaining.push(instr);
                }
            }
            assert!(progressed, "merged sequence is unschedulable");
            pending = remaining;
        }

        Mls::new(instrs)
    }

    /// Replace `n1` and `n2` by their merge and re-point all edges.
    ///
    /// When `merged_seq` is `None` a schedule is computed here. No
    /// preconditions are rechecked; callers must have validated the merge
    /// (capacities, register pressure, [`Self::check_domination_for_merge`])
    /// beforehand.
    pub fn merge_nodes(&mut self, n1: NodeId, n2: NodeId, merged_seq: Option<Mls>) -> NodeId {
        let inputs = self.compute_merged_inputs(n1, n2);
        let outputs = self.compute_merged_outputs(n1, n2);
        let seq = merged_seq.unwrap_or_else(|| self.compute_merged_instrs(n1, n2, &inputs));

        let merged = Mlmi::new(seq, inputs, outputs);
        let defined = merged.defs();
        let used = merged.uses();

        // Outdated forward edges must go before backward edges move.
        for m in &used {
            if self.prog_input_set.contains(m) {
                continue;
            }
            let def = self.backward_edges[m];
            if let Some(targets) = self.forward_edges.get_mut(&def) {
                targets.remove(&n1);
                targets.remove(&n2);
            }
        }

        let mut merged_targets = BTreeSet::new();
        for &t in &self.forward_edges[&n1] {
            if t != n2 {
                merged_targets.insert(t);
            }
        }
        for &t in &self.forward_edges[&n2] {
            if t != n1 {
                merged_targets.insert(t);
            }
        }

        let new_id = self.insert_node(merged);
        self.forward_edges.insert(new_id, merged_targets);

        for m in &defined {
            self.backward_edges.insert(*m, new_id);
        }

        self.forward_edges.remove(&n1);
        self.forward_edges.remove(&n2);
        self.slots[n1.0 as usize] = None;
        self.slots[n2.0 as usize] = None;

        for m in &used {
            if self.prog_input_set.contains(m) {
                continue;
            }
            let def = self.backward_edges[m];
            self.forward_edges
                .get_mut(&def)
                .expect("definer is live")
                .insert(new_id);
        }

        new_id
    }

    /// Check that the edge maps are consistent with the nodes.
    pub fn check_integrity(&self) -> Result<(), Error> {
        for id in self.node_ids() {
            let node = self.node(id);
            for m in &node.inputs {
                if self.prog_input_set.contains(m) {
                    continue;
                }
                let def = *self
                    .backward_edges
                    .get(m)
                    .ok_or_else(|| Error::Integrity(format!("missing backward edge for {m}")))?;
                if !self.forward_edges[&def].contains(&id) {
                    return Err(Error::Integrity(format!(
                        "missing forward edge from the definition to a use of {m}"
                    )));
                }
            }

            let outputs: HashSet<MemId> = node.outputs.iter().copied().collect();
            for next in self.next_nodes(id) {
                if !self.node(next).inputs.iter().any(|m| outputs.contains(m)) {
                    return Err(Error::Integrity(format!(
                        "erroneous forward edge {id} -> {next}: no shared cell"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render the graph in Graphviz dot form.
    pub fn to_dot(&self) -> String {
        use std::fmt::Write;

        let mut dot = String::from("digraph dfg {\n");
        for id in self.node_ids() {
            let label = self.node(id).to_string().replace('\n', "\\l").replace('"', "'");
            let _ = writeln!(dot, "    {id} [shape=box, label=\"{label}\"];");
        }
        for id in self.node_ids() {
            for next in self.next_nodes(id) {
                let _ = writeln!(dot, "    {id} -> {next};");
            }
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_asm::Opcode;

    fn mlir_of(instrs: Vec<Hli>, inputs: Vec<MemId>, outputs: Vec<MemId>) -> MlirProgram {
        let memory_count = instrs
            .iter()
            .map(|i| i.dst.0 + 1)
            .chain(inputs.iter().map(|m| m.0 + 1))
            .max()
            .unwrap_or(0);
        MlirProgram {
            instrs: instrs.into_iter().map(Mlmi::from_hli).collect(),
            inputs,
            outputs,
            memory_count,
        }
    }

    /// `m4 = (m0 + m1) ^ m2` as two chained nodes plus one sibling.
    fn diamond() -> Dfg {
        // a: m3 = m0 + m1    b: m4 = m3 ^ m2    c: m5 = m3 & m2
        let mlir = mlir_of(
            vec![
                Hli::binary(Opcode::ADD, MemId(3), MemId(0), MemId(1)),
                Hli::binary(Opcode::XOR, MemId(4), MemId(3), MemId(2)),
                Hli::binary(Opcode::AND, MemId(5), MemId(3), MemId(2)),
            ],
            vec![MemId(0), MemId(1), MemId(2)],
            vec![MemId(4), MemId(5)],
        );
        Dfg::from_mlir(mlir).expect("valid program")
    }

    #[test]
    fn construction_wires_both_edge_maps() {
        let dfg = diamond();
        dfg.check_integrity().expect("fresh graph is consistent");

        let ids = dfg.node_ids();
        assert_eq!(ids.len(), 3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        assert_eq!(dfg.next_nodes(a), vec![b, c]);
        assert_eq!(dfg.prev_nodes(b), vec![a]);
        assert_eq!(dfg.output_count(b), 0);
    }

    #[test]
    fn undefined_read_is_rejected() {
        let mlir = mlir_of(
            vec![Hli::binary(Opcode::ADD, MemId(2), MemId(0), MemId(1))],
            vec![MemId(0)],
            vec![MemId(2)],
        );
        assert!(matches!(Dfg::from_mlir(mlir), Err(Error::Integrity(_))));
    }

    #[test]
    fn merged_inputs_drop_internal_cells() {
        let dfg = diamond();
        let ids = dfg.node_ids();
        let inputs = dfg.compute_merged_inputs(ids[0], ids[1]);
        assert_eq!(inputs, vec![MemId(0), MemId(1), MemId(2)]);
    }

    #[test]
    fn locally_consumed_output_becomes_internal() {
        // After merging a and b, m3 is still consumed by c and stays an
        // output; once c is gone too it would be dropped.
        let dfg = diamond();
        let ids = dfg.node_ids();
        let outputs = dfg.compute_merged_outputs(ids[0], ids[1]);
        assert!(outputs.contains(&MemId(3)));
        assert!(outputs.contains(&MemId(4)));
    }

    #[test]
    fn merged_instrs_respect_dependencies() {
        let dfg = diamond();
        let ids = dfg.node_ids();
        let inputs = dfg.compute_merged_inputs(ids[0], ids[1]);
        let seq = dfg.compute_merged_instrs(ids[0], ids[1], &inputs);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.instrs[0].dst, MemId(3));
        assert_eq!(seq.instrs[1].dst, MemId(4));
    }

    #[test]
    fn merge_rewires_edges_and_preserves_integrity() {
        let mut dfg = diamond();
        let ids = dfg.node_ids();
        let merged = dfg.merge_nodes(ids[0], ids[1], None);

        assert_eq!(dfg.node_count(), 2);
        dfg.check_integrity().expect("graph stays consistent");
        // c still consumes m3, now defined by the merged node.
        assert_eq!(dfg.next_nodes(merged), vec![ids[2]]);
    }

    #[test]
    fn domination_blocks_indirect_merges() {
        // a -> b, a -> c, b -> c: merging a and c would close a cycle
        // through b.
        let mlir = mlir_of(
            vec![
                Hli::mov(MemId(1), MemId(0)),
                Hli::binary(Opcode::ADD, MemId(2), MemId(1), MemId(0)),
                Hli::binary(Opcode::XOR, MemId(3), MemId(1), MemId(2)),
            ],
            vec![MemId(0)],
            vec![MemId(3)],
        );
        let dfg = Dfg::from_mlir(mlir).expect("valid program");
        let ids = dfg.node_ids();
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        assert!(!dfg.check_domination_for_merge(a, c));
        assert!(!dfg.check_domination_for_merge(c, a));
        // Direct parent-child pairs stay mergeable.
        assert!(dfg.check_domination_for_merge(a, b));
        assert!(dfg.check_domination_for_merge(b, c));
    }
}
