//! Function inlining.
//!
//! An [`InlineStrategy`] first surveys the module: per-function size,
//! loop presence (back-edge detection), pointer parameters, and recursion,
//! plus a call graph whose reverse topological order makes leaves inline
//! before their callers. A call is inlined when the callee is
//! non-recursive and small enough, where "small enough" stretches for leaf
//! callees and for call sites inside loops, and shrinks for callees taking
//! pointers (they tend to pin memory traffic the optimizer can no longer
//! see through).
//!
//! The mechanics: split the caller block at the call, clone the callee
//! body with remapped values and labels, rewrite its returns as jumps to
//! the continuation (merging return values in a φ), and retarget the φs
//! that named the split block.

use crate::analysis::AnalysisManager;
use crate::dominance::DomAnalyzer;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{
    types, Block, FuncRef, Function, Inst, InstructionData, Module, Operand, Value,
};
use crate::opt::replace_value_uses;
use carve_entity::EntityRef;

/// Base instruction-count threshold for inlining.
const SIZE_THRESHOLD: usize = 48;
/// Multiplier for callees that call nothing themselves.
const LEAF_BOOST: usize = 2;
/// Multiplier for call sites inside loops.
const LOOP_BONUS: usize = 3;
/// Divisor applied when the callee takes pointer parameters.
const POINTER_PENALTY: usize = 2;

/// Per-function facts driving the inline decision.
#[derive(Default, Clone)]
struct FunctionInfo {
    inst_count: usize,
    has_loops: bool,
    has_pointer_params: bool,
    is_recursive: bool,
    is_leaf: bool,
    /// Blocks inside some loop, for flagging in-loop call sites.
    loop_blocks: FxHashSet<Block>,
}

/// Module-wide inlining survey.
#[derive(Default)]
struct InlineStrategy {
    info: FxHashMap<FuncRef, FunctionInfo>,
    /// Defined functions, callees before callers.
    order: Vec<FuncRef>,
}

impl InlineStrategy {
    fn analyze(module: &Module) -> Self {
        let mut strategy = Self::default();
        let funcs: Vec<FuncRef> = module.defined_functions().collect();

        let mut call_graph: FxHashMap<FuncRef, Vec<FuncRef>> = FxHashMap::default();
        for &fr in &funcs {
            let func = module.functions[fr].body().unwrap();
            let mut info = FunctionInfo {
                has_pointer_params: func.signature.params.contains(&types::PTR),
                ..Default::default()
            };
            let mut callees = Vec::new();
            for block in func.layout.blocks() {
                for &inst in func.block_insts(block) {
                    info.inst_count += 1;
                    if let InstructionData::Call { func: callee, .. } = func.dfg[inst] {
                        if !callees.contains(&callee) {
                            callees.push(callee);
                        }
                    }
                }
            }
            info.is_leaf = callees.is_empty();
            info.loop_blocks = loop_blocks(func);
            info.has_loops = !info.loop_blocks.is_empty();
            call_graph.insert(fr, callees);
            strategy.info.insert(fr, info);
        }

        // A function on any call-graph cycle counts as recursive.
        for &fr in &funcs {
            if on_cycle(fr, &call_graph) {
                strategy.info.get_mut(&fr).unwrap().is_recursive = true;
            }
        }

        // Reverse topological order: DFS postorder visits callees first.
        let mut visited: FxHashSet<FuncRef> = FxHashSet::default();
        for &fr in &funcs {
            postorder(fr, &call_graph, &mut visited, &mut strategy.order, module);
        }
        strategy
    }

    fn should_inline(&self, caller: FuncRef, callee: FuncRef, in_loop: bool) -> bool {
        if caller == callee {
            return false;
        }
        let Some(info) = self.info.get(&callee) else {
            // Imported; nothing to inline.
            return false;
        };
        if info.is_recursive {
            return false;
        }
        let mut threshold = SIZE_THRESHOLD;
        if info.is_leaf {
            threshold *= LEAF_BOOST;
        }
        if in_loop {
            threshold *= LOOP_BONUS;
        }
        if info.has_pointer_params {
            threshold /= POINTER_PENALTY;
        }
        info.inst_count <= threshold
    }
}

/// Lightweight loop detection: the body blocks of every back edge, found
/// with a throwaway dominator computation.
fn loop_blocks(func: &Function) -> FxHashSet<Block> {
    let cfg = crate::flowgraph::ControlFlowGraph::with_function(func);
    let mut analyzer = DomAnalyzer::new();
    let mut graph: Vec<Vec<u32>> = vec![Vec::new(); func.blocks.len()];
    for &block in cfg.postorder() {
        graph[block.index()] = cfg.succs(block).iter().map(|s| s.index() as u32).collect();
    }
    analyzer.solve(&graph, &[func.entry_block().index() as u32]);

    let mut in_loop: FxHashSet<Block> = FxHashSet::default();
    for &u in cfg.postorder() {
        for &v in cfg.succs(u) {
            if !analyzer.dominates(v.index() as u32, u.index() as u32) {
                continue;
            }
            // Walk back from the latch to the header.
            in_loop.insert(v);
            let mut stack = vec![u];
            while let Some(b) = stack.pop() {
                if !in_loop.insert(b) || b == v {
                    continue;
                }
                for &p in cfg.preds(b) {
                    if p != v && !in_loop.contains(&p) {
                        stack.push(p);
                    }
                }
            }
        }
    }
    in_loop
}

fn on_cycle(start: FuncRef, graph: &FxHashMap<FuncRef, Vec<FuncRef>>) -> bool {
    let mut stack = vec![start];
    let mut seen: FxHashSet<FuncRef> = FxHashSet::default();
    while let Some(fr) = stack.pop() {
        for &callee in graph.get(&fr).map(Vec::as_slice).unwrap_or(&[]) {
            if callee == start {
                return true;
            }
            if seen.insert(callee) {
                stack.push(callee);
            }
        }
    }
    false
}

fn postorder(
    fr: FuncRef,
    graph: &FxHashMap<FuncRef, Vec<FuncRef>>,
    visited: &mut FxHashSet<FuncRef>,
    out: &mut Vec<FuncRef>,
    module: &Module,
) {
    if !visited.insert(fr) {
        return;
    }
    for &callee in graph.get(&fr).map(Vec::as_slice).unwrap_or(&[]) {
        if module.functions[callee].body().is_some() {
            postorder(callee, graph, visited, out, module);
        }
    }
    out.push(fr);
}

/// Perform inlining over `module`.
pub fn do_inline(module: &mut Module, am: &mut AnalysisManager) {
    let strategy = InlineStrategy::analyze(module);
    for &caller in &strategy.order.clone() {
        loop {
            let Some((block, call, callee)) = find_inlinable_site(module, &strategy, caller)
            else {
                break;
            };
            let callee_body = module.functions[callee].body().unwrap().clone();
            let func = module.functions[caller].body_mut().unwrap();
            log::debug!(
                "{}: inlining call to {} in {block}",
                func.name,
                callee_body.name
            );
            inline_call(func, block, call, &callee_body);
            am.invalidate(caller);
        }
    }
}

fn find_inlinable_site(
    module: &Module,
    strategy: &InlineStrategy,
    caller: FuncRef,
) -> Option<(Block, Inst, FuncRef)> {
    let func = module.functions[caller].body()?;
    let caller_loops = &strategy.info.get(&caller)?.loop_blocks;
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            if let InstructionData::Call { func: callee, .. } = func.dfg[inst] {
                let in_loop = caller_loops.contains(&block);
                if strategy.should_inline(caller, callee, in_loop) {
                    return Some((block, inst, callee));
                }
            }
        }
    }
    None
}

/// Splice `callee` into `caller` at `call` within `call_block`.
fn inline_call(caller: &mut Function, call_block: Block, call: Inst, callee: &Function) {
    let insts = caller.block_insts(call_block).to_vec();
    let call_pos = insts.iter().position(|&i| i == call).unwrap();
    let InstructionData::Call { args, .. } = caller.dfg[call].clone() else {
        unreachable!("inline_call on a non-call")
    };

    // Split: the call block keeps the prefix, the continuation block takes
    // the rest.
    let cont = caller.make_block();
    caller.layout.insert_block_after(cont, call_block);
    caller.set_block_insts(call_block, insts[..call_pos].to_vec());
    caller.set_block_insts(cont, insts[call_pos + 1..].to_vec());

    // The split moved the block's outgoing edges onto `cont`; φs in the
    // old successors must follow.
    let blocks: Vec<Block> = caller.layout.blocks().collect();
    for block in blocks {
        if block == cont {
            continue;
        }
        for &phi in caller.phis(block).to_vec().iter() {
            caller.dfg[phi].map_phi_labels(|b| if b == call_block { cont } else { b });
        }
    }

    // Clone the callee body: fresh blocks, fresh result values, remapped
    // operands. Parameters map to the actual arguments.
    let mut vmap: FxHashMap<Value, Operand> = FxHashMap::default();
    for (&param, &arg) in callee.params.iter().zip(args.iter()) {
        vmap.insert(param, arg);
    }
    let mut bmap: FxHashMap<Block, Block> = FxHashMap::default();
    for b in callee.layout.blocks() {
        let nb = caller.make_block();
        caller.layout.insert_block_before(nb, cont);
        bmap.insert(b, nb);
    }

    // First create every cloned instruction so forward references (loop
    // φs) resolve, then rewrite the operands.
    let mut cloned: Vec<(Inst, Inst)> = Vec::new();
    for b in callee.layout.blocks() {
        let nb = bmap[&b];
        for &inst in callee.block_insts(b) {
            let ninst = caller.dfg.make_inst(callee.dfg[inst].clone());
            if let Some(result) = callee.dfg.inst_result(inst) {
                let ty = callee.dfg.value_type(result);
                let nresult = caller.dfg.attach_result(ninst, ty);
                vmap.insert(result, Operand::Value(nresult));
            }
            caller.append_inst(nb, ninst);
            cloned.push((inst, ninst));
        }
    }

    let mut returns: Vec<(Block, Option<Operand>)> = Vec::new();
    for &(old, new) in &cloned {
        let remap_op = |op: Operand| -> Operand {
            match op {
                Operand::Value(v) => *vmap.get(&v).unwrap_or(&Operand::Value(v)),
                other => other,
            }
        };
        caller.dfg[new].map_arguments(remap_op);
        caller.dfg[new].map_branch_targets(|b| bmap[&b]);
        caller.dfg[new].map_phi_labels(|b| bmap[&b]);

        if let InstructionData::Return { value } = caller.dfg[new].clone() {
            let home = bmap[&callee
                .inst_block(old)
                .expect("callee return outside the layout")];
            returns.push((home, value));
            caller.remove_inst(home, new);
            caller.jump(home, cont);
        }
    }

    // The call's value, if any, becomes a merge of the returned values.
    if let Some(result) = caller.dfg.inst_result(call) {
        let merged = match returns.as_slice() {
            [(_, Some(op))] => *op,
            _ => {
                let ty = caller.dfg.value_type(result);
                let incoming = returns
                    .iter()
                    .map(|&(b, op)| (b, op.expect("void return feeding a value")));
                Operand::Value(caller.phi(cont, ty, incoming))
            }
        };
        replace_value_uses(caller, result, merged);
    }

    // Finally enter the inlined body.
    caller.jump(call_block, bmap[&callee.entry_block()]);
}
