//! Dominance and post-dominance analysis.
//!
//! The heavy lifting is done by [`DomAnalyzer`], a Lengauer–Tarjan solver
//! over plain adjacency lists: DFS numbering from a virtual source whose
//! successors are the declared entries, semi-dominator computation with a
//! path-compressing Eval/Link forest, the standard two-pass immediate
//! dominator resolution, dominator-tree child lists, and Cytron dominance
//! frontiers. Because the solver only sees integer adjacency lists, the
//! same code computes post-dominance from the reversed graph with the exit
//! nodes as entries.
//!
//! [`DominatorTree`] and [`PostDominatorTree`] wrap the solver with
//! block-typed queries.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use carve_entity::EntityRef;

const UNDEF: u32 = u32::MAX;

/// Lengauer–Tarjan dominator solver over an integer graph.
pub struct DomAnalyzer {
    /// Immediate dominator of each node; `None` for entries and
    /// unreachable nodes.
    idom: Vec<Option<u32>>,
    /// Dominator tree child lists.
    children: Vec<Vec<u32>>,
    /// Dominance frontier of each node.
    frontier: Vec<Vec<u32>>,
    /// DFS number of each node; `UNDEF` when unreachable.
    dfn: Vec<u32>,
}

impl DomAnalyzer {
    /// Create an empty solver. Call [`Self::solve`] to fill it.
    pub fn new() -> Self {
        Self {
            idom: Vec::new(),
            children: Vec::new(),
            frontier: Vec::new(),
            dfn: Vec::new(),
        }
    }

    /// Clear all computed state.
    pub fn clear(&mut self) {
        self.idom.clear();
        self.children.clear();
        self.frontier.clear();
        self.dfn.clear();
    }

    /// Compute dominators of `graph` from the given entry nodes.
    ///
    /// A virtual source with edges to every entry roots the traversal, so a
    /// multi-exit reverse graph still has a single root when this is used
    /// for post-dominance.
    pub fn solve(&mut self, graph: &[Vec<u32>], entries: &[u32]) {
        self.clear();
        let n = graph.len();
        let root = n as u32;
        let total = n + 1;

        // Predecessor lists of the working graph, virtual edges included.
        let mut preds: Vec<Vec<u32>> = vec![Vec::new(); total];
        for (u, succs) in graph.iter().enumerate() {
            for &v in succs {
                preds[v as usize].push(u as u32);
            }
        }
        for &e in entries {
            preds[e as usize].push(root);
        }

        // Step 1: DFS numbering from the virtual source.
        let mut dfn = vec![UNDEF; total];
        let mut vertex: Vec<u32> = Vec::with_capacity(total);
        let mut parent = vec![UNDEF; total];
        let mut stack: Vec<(u32, u32)> = vec![(root, UNDEF)];
        while let Some((node, from)) = stack.pop() {
            if dfn[node as usize] != UNDEF {
                continue;
            }
            dfn[node as usize] = vertex.len() as u32;
            parent[node as usize] = from;
            vertex.push(node);
            let succs: &[u32] = if node == root {
                entries
            } else {
                &graph[node as usize]
            };
            for &next in succs.iter().rev() {
                if dfn[next as usize] == UNDEF {
                    stack.push((next, node));
                }
            }
        }

        // Step 2: semi-dominators via the Eval/Link forest, buckets per
        // semi-dominator, and the first half of idom resolution.
        let mut semi: Vec<u32> = dfn.clone();
        let mut ancestor = vec![UNDEF; total];
        let mut label: Vec<u32> = (0..total as u32).collect();
        let mut bucket: Vec<Vec<u32>> = vec![Vec::new(); total];
        let mut idom = vec![UNDEF; total];

        let eval = |v: u32, ancestor: &mut [u32], label: &mut [u32], semi: &[u32]| -> u32 {
            if ancestor[v as usize] == UNDEF {
                return v;
            }
            // Path compression, processing the chain top-down.
            let mut chain = Vec::new();
            let mut x = v;
            while ancestor[ancestor[x as usize] as usize] != UNDEF {
                chain.push(x);
                x = ancestor[x as usize];
            }
            while let Some(y) = chain.pop() {
                let a = ancestor[y as usize];
                if semi[label[a as usize] as usize] < semi[label[y as usize] as usize] {
                    label[y as usize] = label[a as usize];
                }
                ancestor[y as usize] = ancestor[a as usize];
            }
            label[v as usize]
        };

        for i in (1..vertex.len()).rev() {
            let w = vertex[i];
            for &v in &preds[w as usize] {
                if dfn[v as usize] == UNDEF {
                    continue;
                }
                let u = eval(v, &mut ancestor, &mut label, &semi);
                if semi[u as usize] < semi[w as usize] {
                    semi[w as usize] = semi[u as usize];
                }
            }
            bucket[vertex[semi[w as usize] as usize] as usize].push(w);
            let p = parent[w as usize];
            ancestor[w as usize] = p;
            for v in std::mem::take(&mut bucket[p as usize]) {
                let u = eval(v, &mut ancestor, &mut label, &semi);
                idom[v as usize] = if semi[u as usize] < semi[v as usize] {
                    u
                } else {
                    p
                };
            }
        }

        // Step 3: the second resolution pass, in DFS order.
        for i in 1..vertex.len() {
            let w = vertex[i];
            if idom[w as usize] != vertex[semi[w as usize] as usize] {
                idom[w as usize] = idom[idom[w as usize] as usize];
            }
        }

        // Publish, folding the virtual source away.
        self.dfn = dfn[..n].to_vec();
        self.idom = (0..n)
            .map(|v| match idom[v] {
                UNDEF => None,
                d if d == root => None,
                d => Some(d),
            })
            .collect();

        // Step 4: dominator tree child lists.
        self.children = vec![Vec::new(); n];
        for v in 0..n {
            if let Some(d) = self.idom[v] {
                self.children[d as usize].push(v as u32);
            }
        }

        // Step 5: dominance frontiers, Cytron style. Join nodes with at
        // least two reachable predecessors push themselves up each
        // predecessor's idom chain, stopping below their own idom.
        self.frontier = vec![Vec::new(); n];
        for b in 0..n {
            if self.dfn[b] == UNDEF {
                continue;
            }
            let bpreds: Vec<u32> = preds[b]
                .iter()
                .copied()
                .filter(|&p| p != root && self.dfn[p as usize] != UNDEF)
                .collect();
            if bpreds.len() < 2 {
                continue;
            }
            for &p in &bpreds {
                let mut runner = Some(p);
                while let Some(r) = runner {
                    if Some(r) == self.idom[b] {
                        break;
                    }
                    if !self.frontier[r as usize].contains(&(b as u32)) {
                        self.frontier[r as usize].push(b as u32);
                    }
                    runner = self.idom[r as usize];
                }
            }
        }
    }

    /// Was `v` reached from the entries?
    pub fn is_reachable(&self, v: u32) -> bool {
        self.dfn.get(v as usize).is_some_and(|&d| d != UNDEF)
    }

    /// Immediate dominator of `v`, if it has one.
    pub fn idom(&self, v: u32) -> Option<u32> {
        self.idom[v as usize]
    }

    /// Does `a` dominate `b`? A node dominates itself. Returns `false` when
    /// either node is unreachable.
    pub fn dominates(&self, a: u32, b: u32) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom[cur as usize] {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    /// Dominator tree children of `v`.
    pub fn children(&self, v: u32) -> &[u32] {
        &self.children[v as usize]
    }

    /// Dominance frontier of `v`.
    pub fn frontier(&self, v: u32) -> &[u32] {
        &self.frontier[v as usize]
    }
}

impl Default for DomAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// The dominator tree of a function's CFG.
pub struct DominatorTree {
    analyzer: DomAnalyzer,
    valid: bool,
}

impl DominatorTree {
    /// Allocate and compute the dominator tree of `func`.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self {
            analyzer: DomAnalyzer::new(),
            valid: false,
        };
        domtree.compute(func, cfg);
        domtree
    }

    /// Recompute from scratch.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        let graph = forward_graph(func, cfg);
        let entries = [func.entry_block().index() as u32];
        self.analyzer.solve(&graph, &entries);
        self.valid = true;
    }

    /// Is the tree computed?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Is `block` reachable from the entry?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.analyzer.is_reachable(block.index() as u32)
    }

    /// The immediate dominator of `block`; `None` for the entry and for
    /// unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.analyzer
            .idom(block.index() as u32)
            .map(|v| Block::new(v as usize))
    }

    /// Does `a` dominate `b`? A block dominates itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        self.analyzer.dominates(a.index() as u32, b.index() as u32)
    }

    /// Dominator tree children of `block`.
    pub fn children(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.analyzer
            .children(block.index() as u32)
            .iter()
            .map(|&v| Block::new(v as usize))
    }

    /// Dominance frontier of `block`.
    pub fn frontier(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.analyzer
            .frontier(block.index() as u32)
            .iter()
            .map(|&v| Block::new(v as usize))
    }
}

/// The post-dominator tree: dominance on the reversed CFG, rooted at the
/// exit nodes.
pub struct PostDominatorTree {
    analyzer: DomAnalyzer,
    valid: bool,
}

impl PostDominatorTree {
    /// Allocate and compute the post-dominator tree of `func`.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut tree = Self {
            analyzer: DomAnalyzer::new(),
            valid: false,
        };
        tree.compute(func, cfg);
        tree
    }

    /// Recompute from scratch.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        let n = func.blocks.len();
        let mut graph: Vec<Vec<u32>> = vec![Vec::new(); n];
        let mut exits: Vec<u32> = Vec::new();
        for &block in cfg.postorder() {
            for &succ in cfg.succs(block) {
                graph[succ.index()].push(block.index() as u32);
            }
            if cfg.succs(block).is_empty() {
                exits.push(block.index() as u32);
            }
        }
        self.analyzer.solve(&graph, &exits);
        self.valid = true;
    }

    /// Is the tree computed?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Does some exit node post-dominate `block`? Blocks inside infinite
    /// loops are not covered by the post-dominance relation at all.
    pub fn is_reachable(&self, block: Block) -> bool {
        self.analyzer.is_reachable(block.index() as u32)
    }

    /// The immediate post-dominator of `block`; `None` for exit blocks.
    pub fn ipdom(&self, block: Block) -> Option<Block> {
        self.analyzer
            .idom(block.index() as u32)
            .map(|v| Block::new(v as usize))
    }

    /// Does `a` post-dominate `b`?
    pub fn post_dominates(&self, a: Block, b: Block) -> bool {
        self.analyzer.dominates(a.index() as u32, b.index() as u32)
    }

    /// The post-dominance frontier of `block`: the blocks `block` is
    /// control dependent on.
    pub fn frontier(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.analyzer
            .frontier(block.index() as u32)
            .iter()
            .map(|&v| Block::new(v as usize))
    }
}

fn forward_graph(func: &Function, cfg: &ControlFlowGraph) -> Vec<Vec<u32>> {
    let mut graph: Vec<Vec<u32>> = vec![Vec::new(); func.blocks.len()];
    for &block in cfg.postorder() {
        graph[block.index()] = cfg
            .succs(block)
            .iter()
            .map(|s| s.index() as u32)
            .collect();
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, IntCC, Operand, Signature};

    /// Build the diamond `b0 -> {b1, b2} -> b3`.
    fn diamond() -> (Function, Block, Block, Block, Block) {
        let mut func = Function::with_name_signature("d", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.jump(b1, b3);
        func.jump(b2, b3);
        func.ret(b3, Some(Operand::Imm32(0)));
        (func, b0, b1, b2, b3)
    }

    #[test]
    fn diamond_idoms() {
        let (func, b0, b1, b2, b3) = diamond();
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert_eq!(dt.idom(b0), None);
        assert_eq!(dt.idom(b1), Some(b0));
        assert_eq!(dt.idom(b2), Some(b0));
        assert_eq!(dt.idom(b3), Some(b0));

        assert!(dt.dominates(b0, b3));
        assert!(dt.dominates(b0, b0));
        assert!(!dt.dominates(b1, b3));
        assert!(!dt.dominates(b3, b1));
    }

    #[test]
    fn diamond_frontiers() {
        let (func, b0, b1, b2, b3) = diamond();
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert_eq!(dt.frontier(b1).collect::<Vec<_>>(), vec![b3]);
        assert_eq!(dt.frontier(b2).collect::<Vec<_>>(), vec![b3]);
        assert_eq!(dt.frontier(b0).count(), 0);
        assert_eq!(dt.frontier(b3).count(), 0);

        let mut kids: Vec<_> = dt.children(b0).collect();
        kids.sort();
        assert_eq!(kids, vec![b1, b2, b3]);
    }

    #[test]
    fn diamond_postdom() {
        let (func, b0, b1, b2, b3) = diamond();
        let cfg = ControlFlowGraph::with_function(&func);
        let pdt = PostDominatorTree::with_function(&func, &cfg);

        assert_eq!(pdt.ipdom(b3), None);
        assert_eq!(pdt.ipdom(b1), Some(b3));
        assert_eq!(pdt.ipdom(b2), Some(b3));
        assert_eq!(pdt.ipdom(b0), Some(b3));
        assert!(pdt.post_dominates(b3, b0));
        assert!(!pdt.post_dominates(b1, b0));

        // b1 and b2 are control dependent on b0.
        assert_eq!(pdt.frontier(b1).collect::<Vec<_>>(), vec![b0]);
        assert_eq!(pdt.frontier(b2).collect::<Vec<_>>(), vec![b0]);
    }

    #[test]
    fn loop_back_edge() {
        // b0 -> b1; b1 -> b2 (exit) or b1 -> b1 (latch).
        let mut func = Function::with_name_signature("l", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        func.jump(b0, b1);
        let c = func.icmp(b1, IntCC::SignedLessThan, func.params[0], Operand::Imm32(10));
        func.branch(b1, c, b1, b2);
        func.ret(b2, Some(Operand::Imm32(0)));

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert_eq!(dt.idom(b1), Some(b0));
        assert_eq!(dt.idom(b2), Some(b1));
        // The self-loop puts b1 in its own frontier.
        assert_eq!(dt.frontier(b1).collect::<Vec<_>>(), vec![b1]);
    }

    #[test]
    fn unreachable_is_not_dominated() {
        let mut func = Function::with_name_signature("u", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let dead = func.add_block();
        func.ret(b0, Some(Operand::Imm32(0)));
        func.ret(dead, Some(Operand::Imm32(1)));

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert!(!dt.is_reachable(dead));
        assert!(!dt.dominates(b0, dead));
        assert_eq!(dt.idom(dead), None);
    }
}
