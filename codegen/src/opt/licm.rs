//! Loop-invariant code motion.
//!
//! For every loop, computes the invariant instruction set by fixpoint: an
//! instruction is invariant when all of its SSA operands are defined
//! outside the loop or by already-invariant instructions, and it has no
//! side effects. Loads get an extra safety check: the pointer must resolve
//! to a global that is immutable module-wide, or one the loop provably
//! does not store to while containing no call. Divisions only hoist when
//! their block dominates every latch, since hoisting would otherwise
//! execute them on trips that never reach them.
//!
//! Invariants move to a dedicated preheader between the header and its
//! non-latch predecessors, inserted on demand and shared by everything
//! hoisted out of the loop. Hoisting keeps the original intra-loop order,
//! which preserves dominance among the hoisted instructions themselves.

use crate::analysis::AnalysisManager;
use crate::dominance::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{
    Block, FuncRef, Function, GlobalVar, Inst, InstructionData, Module, Opcode, Operand, Value,
};
use crate::loop_analysis::LoopAnalysis;

/// Perform LICM over every defined function of `module`.
pub fn do_licm(module: &mut Module, am: &mut AnalysisManager) {
    let immutable = collect_immutable_globals(module);
    let funcs: Vec<FuncRef> = module.defined_functions().collect();
    for fr in funcs {
        let cfg = am.get::<ControlFlowGraph>(fr, module);
        let domtree = am.get::<DominatorTree>(fr, module);
        let loops = am.get::<LoopAnalysis>(fr, module);
        let func = module.functions[fr].body_mut().unwrap();
        if run_function(func, &cfg, &domtree, &loops, &immutable) {
            am.invalidate(fr);
        }
    }
}

/// Globals no function in the module writes to or lets escape into a
/// call. Loads from them are invariant in any loop.
fn collect_immutable_globals(module: &Module) -> FxHashSet<GlobalVar> {
    let mut mutated: FxHashSet<GlobalVar> = FxHashSet::default();
    for fr in module.defined_functions().collect::<Vec<_>>() {
        let func = module.functions[fr].body().unwrap();
        let roots = global_roots(func);
        let root_of = |op: Operand| -> Option<GlobalVar> {
            match op {
                Operand::Global(g) => Some(g),
                Operand::Value(v) => roots.get(&v).copied(),
                _ => None,
            }
        };
        for block in func.layout.blocks() {
            for &inst in func.block_insts(block) {
                match &func.dfg[inst] {
                    InstructionData::Store { value, ptr } => {
                        if let Some(g) = root_of(*ptr) {
                            mutated.insert(g);
                        }
                        // Storing a global's address lets it escape.
                        if let Some(g) = root_of(*value) {
                            mutated.insert(g);
                        }
                    }
                    InstructionData::Call { args, .. } => {
                        for &arg in args {
                            if let Some(g) = root_of(arg) {
                                mutated.insert(g);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    module
        .globals
        .keys()
        .filter(|g| !mutated.contains(g))
        .collect()
}

/// Map from each address value to the global it is derived from, through
/// element-address chains.
fn global_roots(func: &Function) -> FxHashMap<Value, GlobalVar> {
    let mut roots: FxHashMap<Value, GlobalVar> = FxHashMap::default();
    // Element-address chains are defined before use, so one pass over the
    // layout order converges.
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            if let InstructionData::ElemAddr { base, .. } = func.dfg[inst] {
                let root = match base {
                    Operand::Global(g) => Some(g),
                    Operand::Value(v) => roots.get(&v).copied(),
                    _ => None,
                };
                if let Some(g) = root {
                    roots.insert(func.dfg.inst_result(inst).unwrap(), g);
                }
            }
        }
    }
    roots
}

struct LoopShape {
    header: Block,
    members: FxHashSet<Block>,
    ordered_members: Vec<Block>,
    latches: Vec<Block>,
}

fn run_function(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    loops: &LoopAnalysis,
    immutable: &FxHashSet<GlobalVar>,
) -> bool {
    // Outer loops first: an inner preheader lands inside the outer body,
    // and processing outward-in would treat its definitions as
    // loop-external.
    let mut order: Vec<_> = loops.loops().collect();
    order.sort_by_key(|&lp| loops.loop_data(lp).depth);

    let roots = global_roots(func);
    let mut changed = false;
    for lp in order {
        let data = loops.loop_data(lp);
        let members: FxHashSet<Block> = data.blocks.iter().copied().collect();
        let ordered_members: Vec<Block> = func
            .layout
            .blocks()
            .filter(|b| members.contains(b))
            .collect();
        let shape = LoopShape {
            header: data.header,
            members,
            ordered_members,
            latches: data.latches.clone(),
        };
        changed |= hoist_loop(func, cfg, domtree, &shape, immutable, &roots);
    }
    changed
}

fn hoist_loop(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    shape: &LoopShape,
    immutable: &FxHashSet<GlobalVar>,
    roots: &FxHashMap<Value, GlobalVar>,
) -> bool {
    // What the loop does to memory and control.
    let mut loop_has_call = false;
    let mut stores_unknown = false;
    let mut stored_globals: FxHashSet<GlobalVar> = FxHashSet::default();
    for &block in &shape.ordered_members {
        for &inst in func.block_insts(block) {
            match &func.dfg[inst] {
                InstructionData::Call { .. } => loop_has_call = true,
                InstructionData::Store { ptr, .. } => {
                    match root_global(*ptr, roots) {
                        Some(g) => {
                            stored_globals.insert(g);
                        }
                        None => stores_unknown = true,
                    }
                }
                _ => {}
            }
        }
    }

    let inst_block: FxHashMap<Inst, Block> = shape
        .ordered_members
        .iter()
        .flat_map(|&b| func.block_insts(b).iter().map(move |&i| (i, b)))
        .collect();

    // A value is loop-external when its definition lives outside the
    // member set; parameters always qualify.
    let defined_in_loop = |func: &Function, v: Value| -> bool {
        match func.dfg.value_def(v).inst() {
            Some(inst) => inst_block.contains_key(&inst),
            None => false,
        }
    };

    // Fixpoint over the invariant set.
    let mut invariant_insts: FxHashSet<Inst> = FxHashSet::default();
    let mut invariant_values: FxHashSet<Value> = FxHashSet::default();
    loop {
        let mut grew = false;
        for &block in &shape.ordered_members {
            for &inst in func.block_insts(block) {
                if invariant_insts.contains(&inst) {
                    continue;
                }
                if !is_candidate(&func.dfg[inst]) {
                    continue;
                }
                let operands_invariant = func.dfg[inst].arguments().iter().all(|op| match op {
                    Operand::Value(v) => {
                        !defined_in_loop(func, *v) || invariant_values.contains(v)
                    }
                    _ => true,
                });
                if !operands_invariant {
                    continue;
                }
                if let InstructionData::Load { ptr } = func.dfg[inst] {
                    let safe = match root_global(ptr, roots) {
                        Some(g) => {
                            immutable.contains(&g)
                                || (!loop_has_call
                                    && !stores_unknown
                                    && !stored_globals.contains(&g))
                        }
                        None => false,
                    };
                    if !safe {
                        continue;
                    }
                }
                if matches!(func.dfg[inst].opcode(), Opcode::Idiv | Opcode::Imod)
                    && !shape
                        .latches
                        .iter()
                        .all(|&latch| domtree.dominates(block, latch))
                {
                    // Hoisting would execute the division on trips that
                    // skip it.
                    continue;
                }
                invariant_insts.insert(inst);
                if let Some(r) = func.dfg.inst_result(inst) {
                    invariant_values.insert(r);
                }
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    if invariant_insts.is_empty() {
        return false;
    }

    // Original intra-loop order, refined so definitions always precede
    // their uses even when the layout order disagrees with dominance.
    let mut pending: Vec<(Block, Inst)> = shape
        .ordered_members
        .iter()
        .flat_map(|&b| {
            func.block_insts(b)
                .iter()
                .filter(|i| invariant_insts.contains(*i))
                .map(move |&i| (b, i))
        })
        .collect();
    let mut hoist_order: Vec<(Block, Inst)> = Vec::with_capacity(pending.len());
    let mut placed: FxHashSet<Value> = FxHashSet::default();
    while !pending.is_empty() {
        let ready = pending.iter().position(|&(_, inst)| {
            func.dfg[inst].arguments().iter().all(|op| match op {
                Operand::Value(v) => !invariant_values.contains(v) || placed.contains(v),
                _ => true,
            })
        });
        let at = ready.expect("cyclic dependency among invariant instructions");
        let entry = pending.remove(at);
        if let Some(r) = func.dfg.inst_result(entry.1) {
            placed.insert(r);
        }
        hoist_order.push(entry);
    }

    let preheader = get_or_create_preheader(func, cfg, shape);
    for &(block, inst) in &hoist_order {
        log::debug!(
            "{}: hoisting {} into {preheader}",
            func.name,
            func.dfg.display_inst(inst)
        );
        func.remove_inst(block, inst);
        let at = func.block_insts(preheader).len() - 1;
        func.insert_inst(preheader, at, inst);
    }
    true
}

fn root_global(ptr: Operand, roots: &FxHashMap<Value, GlobalVar>) -> Option<GlobalVar> {
    match ptr {
        Operand::Global(g) => Some(g),
        Operand::Value(v) => roots.get(&v).copied(),
        _ => None,
    }
}

fn is_candidate(data: &InstructionData) -> bool {
    matches!(
        data,
        InstructionData::Binary { .. }
            | InstructionData::Unary { .. }
            | InstructionData::IntCompare { .. }
            | InstructionData::FloatCompare { .. }
            | InstructionData::ElemAddr { .. }
            | InstructionData::Load { .. }
    )
}

/// Find or insert the block hoisted code goes to: a dedicated predecessor
/// of the header outside the loop. Redirecting the outside edges onto a
/// fresh block also splits any critical edge into the header.
fn get_or_create_preheader(func: &mut Function, cfg: &ControlFlowGraph, shape: &LoopShape) -> Block {
    let outside: Vec<Block> = cfg
        .preds(shape.header)
        .iter()
        .copied()
        .filter(|p| !shape.latches.contains(p))
        .collect();
    debug_assert!(!outside.is_empty(), "loop header without an entry edge");

    if outside.len() == 1 && cfg.succs(outside[0]).len() == 1 {
        return outside[0];
    }

    let pre = func.make_block();
    func.layout.insert_block_before(pre, shape.header);
    for &p in &outside {
        let term = func.terminator(p);
        let header = shape.header;
        func.dfg[term].map_branch_targets(|t| if t == header { pre } else { t });
    }

    // Header φs: the incomings from outside move to the preheader. With
    // several outside predecessors their values merge in a new φ there.
    for &phi in func.phis(shape.header).to_vec().iter() {
        let InstructionData::Phi { args } = func.dfg[phi].clone() else {
            continue;
        };
        let (from_outside, from_latches): (Vec<_>, Vec<_>) =
            args.into_iter().partition(|(p, _)| outside.contains(p));
        let merged: (Block, Operand) = if from_outside.len() == 1 {
            (pre, from_outside[0].1)
        } else {
            let ty = func.dfg.value_type(func.dfg.inst_result(phi).unwrap());
            let merged = func.phi(pre, ty, from_outside);
            (pre, Operand::Value(merged))
        };
        if let InstructionData::Phi { args } = &mut func.dfg[phi] {
            args.clear();
            args.push(merged);
            args.extend(from_latches);
        }
    }

    func.jump(pre, shape.header);
    pre
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, GlobalVarData, IntCC, Signature};
    use crate::verifier::verify_function;

    fn analyses(func: &Function) -> (ControlFlowGraph, DominatorTree, LoopAnalysis) {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        let la = LoopAnalysis::with_function(func, &cfg, &dt);
        (cfg, dt, la)
    }

    /// while (i < n) { t = a * b; s += t; i += 1 }
    fn loop_with_invariant() -> (Function, Block, Block) {
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![I32, I32, I32], I32));
        let b0 = func.entry_block();
        let header = func.add_block();
        let body = func.add_block();
        let exit = func.add_block();
        let (n, a, b) = (func.params[0], func.params[1], func.params[2]);

        func.jump(b0, header);
        let i = func.phi(header, I32, [(b0, Operand::Imm32(0))]);
        let s = func.phi(header, I32, [(b0, Operand::Imm32(0))]);
        let c = func.icmp(header, IntCC::SignedLessThan, i, n);
        func.branch(header, c, body, exit);
        let t = func.binary(body, Opcode::Imul, I32, a, b);
        let s2 = func.binary(body, Opcode::Iadd, I32, s, t);
        let i2 = func.binary(body, Opcode::Iadd, I32, i, Operand::Imm32(1));
        func.jump(body, header);
        // Close the φs over the latch.
        for (&phi, val) in func.phis(header).to_vec().iter().zip([i2, s2]) {
            if let InstructionData::Phi { args } = &mut func.dfg[phi] {
                args.push((body, Operand::Value(val)));
            }
        }
        func.ret(exit, Some(Operand::Value(s)));
        (func, header, body)
    }

    #[test]
    fn hoists_invariant_multiply() {
        let (mut func, header, body) = loop_with_invariant();
        assert_eq!(verify_function(&func), Ok(()));
        let (cfg, dt, la) = analyses(&func);
        let immutable = FxHashSet::default();
        let roots = global_roots(&func);
        assert!(run_function(&mut func, &cfg, &dt, &la, &immutable));
        let _ = roots;
        assert_eq!(verify_function(&func), Ok(()));

        // The multiply left the body; the adds stayed.
        let body_ops: Vec<Opcode> = func
            .block_insts(body)
            .iter()
            .map(|&i| func.dfg[i].opcode())
            .collect();
        assert!(!body_ops.contains(&Opcode::Imul));
        assert_eq!(body_ops.iter().filter(|&&o| o == Opcode::Iadd).count(), 2);

        // It sits in the entry block, which is the dedicated preheader.
        let entry = func.entry_block();
        assert!(func
            .block_insts(entry)
            .iter()
            .any(|&i| func.dfg[i].opcode() == Opcode::Imul));
        let _ = header;
    }

    #[test]
    fn loop_varying_operands_stay() {
        let (mut func, _, body) = loop_with_invariant();
        // Remove nothing; just check the i+1 increment is never hoisted.
        let (cfg, dt, la) = analyses(&func);
        let immutable = FxHashSet::default();
        run_function(&mut func, &cfg, &dt, &la, &immutable);
        let body_ops: Vec<Opcode> = func
            .block_insts(body)
            .iter()
            .map(|&i| func.dfg[i].opcode())
            .collect();
        assert!(body_ops.contains(&Opcode::Iadd));
    }

    #[test]
    fn load_from_immutable_global_hoists() {
        let mut module = Module::new();
        let g = module.declare_global(GlobalVarData {
            name: "limit".into(),
            ty: I32,
            dims: vec![],
            init: vec![42],
        });

        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let header = func.add_block();
        let body = func.add_block();
        let exit = func.add_block();
        let n = func.params[0];
        func.jump(b0, header);
        let i = func.phi(header, I32, [(b0, Operand::Imm32(0))]);
        let c = func.icmp(header, IntCC::SignedLessThan, i, n);
        func.branch(header, c, body, exit);
        let limit = func.load(body, I32, Operand::Global(g));
        let i2 = func.binary(body, Opcode::Iadd, I32, i, limit);
        func.jump(body, header);
        let header_phi = func.phis(header)[0];
        if let InstructionData::Phi { args } = &mut func.dfg[header_phi] {
            args.push((body, Operand::Value(i2)));
        }
        func.ret(exit, Some(Operand::Value(i)));

        let fr = module.define_function(func);
        let mut am = AnalysisManager::new();
        do_licm(&mut module, &mut am);

        let func = module.functions[fr].body().unwrap();
        assert_eq!(verify_function(func), Ok(()));
        let body_has_load = func
            .block_insts(body)
            .iter()
            .any(|&i| matches!(func.dfg[i], InstructionData::Load { .. }));
        assert!(!body_has_load);
    }

    #[test]
    fn load_from_stored_global_stays() {
        let mut module = Module::new();
        let g = module.declare_global(GlobalVarData {
            name: "counter".into(),
            ty: I32,
            dims: vec![],
            init: vec![],
        });

        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let header = func.add_block();
        let body = func.add_block();
        let exit = func.add_block();
        let n = func.params[0];
        func.jump(b0, header);
        let i = func.phi(header, I32, [(b0, Operand::Imm32(0))]);
        let c = func.icmp(header, IntCC::SignedLessThan, i, n);
        func.branch(header, c, body, exit);
        let cur = func.load(body, I32, Operand::Global(g));
        let next = func.binary(body, Opcode::Iadd, I32, cur, Operand::Imm32(1));
        func.store(body, next, Operand::Global(g));
        let i2 = func.binary(body, Opcode::Iadd, I32, i, Operand::Imm32(1));
        func.jump(body, header);
        let header_phi = func.phis(header)[0];
        if let InstructionData::Phi { args } = &mut func.dfg[header_phi] {
            args.push((body, Operand::Value(i2)));
        }
        func.ret(exit, Some(Operand::Value(i)));

        let fr = module.define_function(func);
        let mut am = AnalysisManager::new();
        do_licm(&mut module, &mut am);

        let func = module.functions[fr].body().unwrap();
        let body_has_load = func
            .block_insts(body)
            .iter()
            .any(|&i| matches!(func.dfg[i], InstructionData::Load { .. }));
        assert!(body_has_load);
    }
}
