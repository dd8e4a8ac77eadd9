//! The optimization pass pipeline.
//!
//! Pipeline order: mem2reg → SCCP → SimplifyCFG → CSE → DCE → LICM →
//! Inline → TCO → ADCE → UnifyReturn. Function passes report whether they
//! changed anything so the driver can invalidate the analysis cache; module
//! passes invalidate through the manager themselves.

pub mod adce;
pub mod cse;
pub mod dce;
pub mod inline;
pub mod licm;
pub mod mem2reg;
pub mod sccp;
pub mod simplify_cfg;
pub mod tco;
pub mod unify_return;

use crate::analysis::AnalysisManager;
use crate::dominance::{DominatorTree, PostDominatorTree};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{
    Block, FuncRef, Function, Inst, InstructionData, Module, Operand, Value,
};
use carve_entity::SecondaryMap;

/// Run the whole middle-end pipeline over `module`.
pub fn run_pipeline(module: &mut Module, am: &mut AnalysisManager) {
    let funcs: Vec<FuncRef> = module.defined_functions().collect();

    for &fr in &funcs {
        let cfg = am.get::<ControlFlowGraph>(fr, module);
        let domtree = am.get::<DominatorTree>(fr, module);
        let func = module.functions[fr].body_mut().unwrap();
        if mem2reg::do_mem2reg(func, &cfg, &domtree) {
            am.invalidate(fr);
        }
    }

    for &fr in &funcs {
        let func = module.functions[fr].body_mut().unwrap();
        let mut changed = sccp::do_sccp(func);
        changed |= remove_unreachable_blocks(func);
        if changed {
            am.invalidate(fr);
        }
    }

    for &fr in &funcs {
        let func = module.functions[fr].body_mut().unwrap();
        if simplify_cfg::do_simplify_cfg(func) {
            am.invalidate(fr);
        }
    }

    for &fr in &funcs {
        let domtree = am.get::<DominatorTree>(fr, module);
        let func = module.functions[fr].body_mut().unwrap();
        // CSE only redirects uses; the dead duplicates fall to DCE next.
        let _ = cse::do_cse(func, &domtree);
    }

    for &fr in &funcs {
        let func = module.functions[fr].body_mut().unwrap();
        if dce::do_dce(func) {
            am.invalidate(fr);
        }
    }

    licm::do_licm(module, am);
    inline::do_inline(module, am);
    tco::do_tco(module, am);

    let funcs: Vec<FuncRef> = module.defined_functions().collect();
    for &fr in &funcs {
        let cfg = am.get::<ControlFlowGraph>(fr, module);
        let pdt = am.get::<PostDominatorTree>(fr, module);
        let func = module.functions[fr].body_mut().unwrap();
        let mut changed = adce::do_adce(func, &cfg, &pdt);
        changed |= remove_unreachable_blocks(func);
        if changed {
            am.invalidate(fr);
        }
    }

    for &fr in &funcs {
        let func = module.functions[fr].body_mut().unwrap();
        if unify_return::do_unify_return(func) {
            am.invalidate(fr);
        }
    }
}

/// Count the uses of every value in the linked instructions of `func`,
/// φ-incomings included.
pub(crate) fn use_counts(func: &Function) -> SecondaryMap<Value, u32> {
    let mut counts = SecondaryMap::new();
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            for op in func.dfg[inst].arguments() {
                if let Some(v) = op.as_value() {
                    counts[v] += 1;
                }
            }
        }
    }
    counts
}

/// Replace every use of `from` with the operand `to`.
pub(crate) fn replace_value_uses(func: &mut Function, from: Value, to: Operand) {
    replace_value_uses_except(func, from, to, None)
}

/// Replace every use of `from` with `to`, leaving `skip` untouched.
pub(crate) fn replace_value_uses_except(
    func: &mut Function,
    from: Value,
    to: Operand,
    skip: Option<Inst>,
) {
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for block in blocks {
        for i in 0..func.block_insts(block).len() {
            let inst = func.block_insts(block)[i];
            if Some(inst) == skip {
                continue;
            }
            func.dfg[inst].map_arguments(|op| match op {
                Operand::Value(v) if v == from => to,
                other => other,
            });
        }
    }
}

/// Map from each linked instruction to its containing block.
pub(crate) fn inst_blocks(func: &Function) -> crate::fx::FxHashMap<Inst, Block> {
    let mut map = crate::fx::FxHashMap::default();
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            map.insert(inst, block);
        }
    }
    map
}

/// Drop blocks not reachable from the entry and prune φ-incomings from
/// edges that went with them. Returns whether anything changed.
pub(crate) fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let cfg = ControlFlowGraph::with_function(func);
    let dead = cfg.unreachable_blocks(func);
    prune_phi_incomings(func, &cfg);
    for &block in &dead {
        log::debug!("{}: removing unreachable {block}", func.name);
        func.layout.remove_block(block);
    }
    !dead.is_empty()
}

/// Retain only the φ-incomings whose predecessor edge still exists.
pub(crate) fn prune_phi_incomings(func: &mut Function, cfg: &ControlFlowGraph) {
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for block in blocks {
        if !cfg.is_reachable(block) {
            continue;
        }
        let preds: Vec<Block> = cfg
            .preds(block)
            .iter()
            .copied()
            .filter(|&p| cfg.is_reachable(p))
            .collect();
        for &phi in func.phis(block).to_vec().iter() {
            if let InstructionData::Phi { args } = &mut func.dfg[phi] {
                args.retain(|(pred, _)| preds.contains(pred));
            }
        }
    }
}
