//! A loop analysis represented as mappings of loops to their header blocks
//! and member sets.
//!
//! A natural loop exists for every back edge `u → v` where `v` dominates
//! `u`: the header is `v`, `u` is a latch, and the body is every block that
//! can reach `u` without passing through `v`. Back edges sharing a header
//! describe one loop. Loops nest by body inclusion.

use crate::dominance::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use carve_entity::packed_option::PackedOption;
use carve_entity::{entity_impl, EntitySet, PrimaryMap, SecondaryMap};

/// An opaque reference to a loop.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

/// One natural loop.
pub struct LoopData {
    /// The block every path into the loop goes through.
    pub header: Block,
    /// All member blocks, header included.
    pub blocks: Vec<Block>,
    /// Sources of the back edges.
    pub latches: Vec<Block>,
    /// Members with at least one successor outside the loop.
    pub exiting_blocks: Vec<Block>,
    /// The out-of-loop targets of exiting blocks.
    pub exit_blocks: Vec<Block>,
    /// The innermost loop strictly containing this one.
    pub parent: PackedOption<Loop>,
    /// Nesting depth; top-level loops have depth 1.
    pub depth: u32,
    members: EntitySet<Block>,
}

impl LoopData {
    /// Is `block` part of this loop?
    pub fn contains(&self, block: Block) -> bool {
        self.members.contains(block)
    }

    /// Number of member blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Loop information for a function.
pub struct LoopAnalysis {
    loops: PrimaryMap<Loop, LoopData>,
    /// Innermost loop containing each block, if any.
    innermost: SecondaryMap<Block, PackedOption<Loop>>,
    valid: bool,
}

impl LoopAnalysis {
    /// Allocate and compute the loop analysis for `func`.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> Self {
        let mut la = Self {
            loops: PrimaryMap::new(),
            innermost: SecondaryMap::new(),
            valid: false,
        };
        la.compute(func, cfg, domtree);
        la
    }

    /// Recompute from scratch.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        let _ = func;
        self.loops.clear();
        self.innermost.clear();

        self.find_loops(cfg, domtree);
        self.compute_nesting();
        self.compute_exits(cfg);
        self.valid = true;
    }

    /// Is the analysis computed?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Iterate over all loops.
    pub fn loops(&self) -> impl Iterator<Item = Loop> + '_ {
        self.loops.keys()
    }

    /// Number of detected loops.
    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    /// Data of one loop.
    pub fn loop_data(&self, lp: Loop) -> &LoopData {
        &self.loops[lp]
    }

    /// The innermost loop containing `block`, if any.
    pub fn innermost_loop(&self, block: Block) -> Option<Loop> {
        self.innermost[block].expand()
    }

    /// Is `block` the header of some loop?
    pub fn is_loop_header(&self, block: Block) -> bool {
        self.loops.values().any(|data| data.header == block)
    }

    /// Nesting depth of `block`; 0 when it is in no loop.
    pub fn loop_depth(&self, block: Block) -> u32 {
        match self.innermost_loop(block) {
            Some(lp) => self.loops[lp].depth,
            None => 0,
        }
    }

    fn find_loops(&mut self, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        // Back edges grouped by header; sharing a header merges the loops.
        for &u in cfg.postorder() {
            for &v in cfg.succs(u) {
                if !domtree.dominates(v, u) {
                    continue;
                }
                let existing = self
                    .loops
                    .iter()
                    .find(|(_, d)| d.header == v)
                    .map(|(lp, _)| lp);
                let lp = match existing {
                    Some(lp) => lp,
                    None => self.loops.push(LoopData {
                        header: v,
                        blocks: vec![v],
                        latches: Vec::new(),
                        exiting_blocks: Vec::new(),
                        exit_blocks: Vec::new(),
                        parent: None.into(),
                        depth: 0,
                        members: {
                            let mut s = EntitySet::new();
                            s.insert(v);
                            s
                        },
                    }),
                };
                self.loops[lp].latches.push(u);
                self.collect_body(lp, u, cfg);
            }
        }
    }

    /// Add to `lp` every block that reaches `latch` without passing through
    /// the header, by reverse BFS from the latch on the inverse graph.
    fn collect_body(&mut self, lp: Loop, latch: Block, cfg: &ControlFlowGraph) {
        let header = self.loops[lp].header;
        let mut queue = Vec::new();
        if self.loops[lp].members.insert(latch) {
            self.loops[lp].blocks.push(latch);
        }
        if latch != header {
            queue.push(latch);
        }
        while let Some(block) = queue.pop() {
            for &pred in cfg.preds(block) {
                if pred == header {
                    continue;
                }
                if self.loops[lp].members.insert(pred) {
                    self.loops[lp].blocks.push(pred);
                    queue.push(pred);
                }
            }
        }
    }

    fn compute_nesting(&mut self) {
        // Sort loop keys by ascending body size; the first strictly larger
        // loop containing a header is its innermost parent.
        let mut by_size: Vec<Loop> = self.loops.keys().collect();
        by_size.sort_by_key(|&lp| self.loops[lp].num_blocks());

        for (i, &inner) in by_size.iter().enumerate() {
            let header = self.loops[inner].header;
            for &outer in &by_size[i + 1..] {
                if outer != inner && self.loops[outer].contains(header) {
                    self.loops[inner].parent = outer.into();
                    break;
                }
            }
        }

        // Depth is the length of the parent chain.
        for lp in self.loops.keys().collect::<Vec<_>>() {
            let mut depth = 1;
            let mut cur = self.loops[lp].parent;
            while let Some(p) = cur.expand() {
                depth += 1;
                cur = self.loops[p].parent;
            }
            self.loops[lp].depth = depth;
        }

        // Innermost-loop map: visit loops from largest to smallest so the
        // smallest containing loop wins.
        for &lp in by_size.iter().rev() {
            for &block in &self.loops[lp].blocks.clone() {
                self.innermost[block] = lp.into();
            }
        }
    }

    fn compute_exits(&mut self, cfg: &ControlFlowGraph) {
        for lp in self.loops.keys().collect::<Vec<_>>() {
            let mut exiting = Vec::new();
            let mut exits = Vec::new();
            for &block in &self.loops[lp].blocks {
                for &succ in cfg.succs(block) {
                    if !self.loops[lp].contains(succ) {
                        if !exiting.contains(&block) {
                            exiting.push(block);
                        }
                        if !exits.contains(&succ) {
                            exits.push(succ);
                        }
                    }
                }
            }
            self.loops[lp].exiting_blocks = exiting;
            self.loops[lp].exit_blocks = exits;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, IntCC, Operand, Signature};

    #[test]
    fn single_loop() {
        // b0 -> b1(header) -> b2(body) -> b1, b1 -> b3(exit).
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        func.jump(b0, b1);
        let c = func.icmp(b1, IntCC::SignedLessThan, func.params[0], Operand::Imm32(10));
        func.branch(b1, c, b2, b3);
        func.jump(b2, b1);
        func.ret(b3, Some(Operand::Imm32(0)));

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);

        assert_eq!(la.num_loops(), 1);
        let lp = la.loops().next().unwrap();
        let data = la.loop_data(lp);
        assert_eq!(data.header, b1);
        assert_eq!(data.latches, vec![b2]);
        assert!(data.contains(b1) && data.contains(b2));
        assert!(!data.contains(b0) && !data.contains(b3));
        assert_eq!(data.exiting_blocks, vec![b1]);
        assert_eq!(data.exit_blocks, vec![b3]);
        assert_eq!(data.depth, 1);
        assert_eq!(la.loop_depth(b2), 1);
        assert_eq!(la.loop_depth(b0), 0);
        assert!(la.is_loop_header(b1));
    }

    #[test]
    fn nested_loops() {
        // Outer header b1, inner header b2 with latch b3, outer latch b4.
        let mut func = Function::with_name_signature("g", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let b4 = func.add_block();
        let b5 = func.add_block();
        let n = func.params[0];
        func.jump(b0, b1);
        let c1 = func.icmp(b1, IntCC::SignedLessThan, n, Operand::Imm32(10));
        func.branch(b1, c1, b2, b5);
        let c2 = func.icmp(b2, IntCC::SignedLessThan, n, Operand::Imm32(5));
        func.branch(b2, c2, b3, b4);
        func.jump(b3, b2);
        func.jump(b4, b1);
        func.ret(b5, Some(Operand::Imm32(0)));

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);

        assert_eq!(la.num_loops(), 2);
        let inner = la.innermost_loop(b3).unwrap();
        let outer = la.innermost_loop(b4).unwrap();
        assert_ne!(inner, outer);
        assert_eq!(la.loop_data(inner).header, b2);
        assert_eq!(la.loop_data(outer).header, b1);
        assert_eq!(la.loop_data(inner).parent.expand(), Some(outer));
        assert_eq!(la.loop_data(inner).depth, 2);
        assert_eq!(la.loop_data(outer).depth, 1);
        // The inner header belongs to both; innermost wins in the map.
        assert_eq!(la.innermost_loop(b2), Some(inner));
        assert!(la.loop_data(outer).contains(b2));
    }

    #[test]
    fn shared_header_merges() {
        // Two back edges to the same header form one loop.
        let mut func = Function::with_name_signature("h", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let b4 = func.add_block();
        let n = func.params[0];
        func.jump(b0, b1);
        let c1 = func.icmp(b1, IntCC::SignedLessThan, n, Operand::Imm32(10));
        func.branch(b1, c1, b2, b3);
        func.jump(b2, b1);
        let c2 = func.icmp(b3, IntCC::SignedGreaterThan, n, Operand::Imm32(0));
        func.branch(b3, c2, b1, b4);
        func.ret(b4, Some(Operand::Imm32(0)));

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);

        assert_eq!(la.num_loops(), 1);
        let data = la.loop_data(la.loops().next().unwrap());
        let mut latches = data.latches.clone();
        latches.sort();
        assert_eq!(latches, vec![b2, b3]);
    }
}
