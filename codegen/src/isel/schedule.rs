//! DAG scheduling: linearize a block's nodes for selection.
//!
//! A post-order walk from the roots respects both data and token edges —
//! every operand is placed before its consumer — and breaks ties by DFS
//! discovery order, which keeps values close to their uses and the
//! register pressure reasonable. Exported values are scheduled first, the
//! terminator root last, so the branch always ends up at the bottom of the
//! block.

use crate::isel::dag::{SdNodeId, SelectionDag};
use carve_entity::EntitySet;

/// Compute the selection order of `dag`.
pub fn schedule(dag: &SelectionDag) -> Vec<SdNodeId> {
    let mut order = Vec::with_capacity(dag.nodes.len());
    let mut placed = EntitySet::new();

    let mut roots: Vec<SdNodeId> = dag.exports.iter().map(|&(n, _)| n).collect();
    roots.push(dag.terminator);

    for root in roots {
        // Iterative post-order: push the node, revisit it after its args.
        enum Visit {
            First(SdNodeId),
            Again(SdNodeId),
        }
        let mut stack = vec![Visit::First(root)];
        let mut seen = EntitySet::new();
        seen.insert(root);
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::First(node) => {
                    stack.push(Visit::Again(node));
                    for &arg in dag.nodes[node].args.iter().rev() {
                        if !placed.contains(arg) && seen.insert(arg) {
                            stack.push(Visit::First(arg));
                        }
                    }
                }
                Visit::Again(node) => {
                    if placed.insert(node) {
                        order.push(node);
                    }
                }
            }
        }
    }

    debug_assert_eq!(order.last(), Some(&dag.terminator));
    order
}
