//! Memory-to-register promotion.
//!
//! Promotes stack-allocated scalars whose address never escapes — every
//! use is a load or a store *through* the slot address — to SSA values.
//! φ-nodes are placed at the iterated dominance frontier of the defining
//! blocks, then a depth-first walk of the dominator tree renames loads and
//! stores against a per-slot value stack: a store pushes, a load reads the
//! top, and leaving a subtree pops what it pushed. A load with no reaching
//! store reads zero of the slot type, which keeps the rewrite total for
//! uninitialized locals.

use crate::dominance::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{
    types, Block, Function, Ieee32, Inst, InstructionData, Operand, Type, Value,
};
use crate::opt::replace_value_uses;

/// Perform memory-to-register promotion on `func`. Returns whether any
/// slot was promoted.
pub fn do_mem2reg(func: &mut Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> bool {
    let candidates = promotable_slots(func);
    if candidates.is_empty() {
        return false;
    }
    log::debug!(
        "{}: promoting {} stack slots",
        func.name,
        candidates.len()
    );

    // Blocks that store to each slot.
    let mut def_blocks: FxHashMap<Value, Vec<Block>> = FxHashMap::default();
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            if let InstructionData::Store { ptr, .. } = func.dfg[inst] {
                if let Some(slot) = ptr.as_value() {
                    if candidates.contains_key(&slot) {
                        def_blocks.entry(slot).or_default().push(block);
                    }
                }
            }
        }
    }

    // Insert φ-nodes at the iterated dominance frontier of each slot's
    // defining blocks. The φs start without incomings; renaming fills them.
    let mut phi_slot: FxHashMap<Inst, Value> = FxHashMap::default();
    for (&slot, ty) in &candidates {
        let mut placed: FxHashSet<Block> = FxHashSet::default();
        let mut worklist: Vec<Block> = def_blocks.get(&slot).cloned().unwrap_or_default();
        let mut on_list: FxHashSet<Block> = worklist.iter().copied().collect();
        while let Some(block) = worklist.pop() {
            for join in domtree.frontier(block) {
                if !placed.insert(join) {
                    continue;
                }
                let phi = func.dfg.make_inst(InstructionData::Phi {
                    args: Default::default(),
                });
                func.dfg.attach_result(phi, *ty);
                func.insert_inst(join, 0, phi);
                phi_slot.insert(phi, slot);
                if on_list.insert(join) {
                    worklist.push(join);
                }
            }
        }
    }

    // Rename via a DFS over the dominator tree.
    let mut stacks: FxHashMap<Value, Vec<Operand>> = FxHashMap::default();
    let mut removed: Vec<(Block, Inst)> = Vec::new();

    enum Walk {
        Enter(Block),
        Leave(Vec<(Value, usize)>),
    }
    let mut stack = vec![Walk::Enter(func.entry_block())];
    while let Some(step) = stack.pop() {
        match step {
            Walk::Enter(block) => {
                let mut pushed: Vec<(Value, usize)> = Vec::new();
                for i in 0..func.block_insts(block).len() {
                    let inst = func.block_insts(block)[i];
                    if let Some(&slot) = phi_slot.get(&inst) {
                        let result = func.dfg.inst_result(inst).unwrap();
                        stacks.entry(slot).or_default().push(Operand::Value(result));
                        pushed.push((slot, 1));
                        continue;
                    }
                    match func.dfg[inst].clone() {
                        InstructionData::Load { ptr } => {
                            let Some(slot) = ptr.as_value() else { continue };
                            let Some(&ty) = candidates.get(&slot) else {
                                continue;
                            };
                            let current = reaching_value(&stacks, slot, ty);
                            let result = func.dfg.inst_result(inst).unwrap();
                            replace_value_uses(func, result, current);
                            removed.push((block, inst));
                        }
                        InstructionData::Store { value, ptr } => {
                            let Some(slot) = ptr.as_value() else { continue };
                            if !candidates.contains_key(&slot) {
                                continue;
                            }
                            stacks.entry(slot).or_default().push(value);
                            pushed.push((slot, 1));
                            removed.push((block, inst));
                        }
                        InstructionData::StackAlloc { .. } => {
                            let result = func.dfg.inst_result(inst).unwrap();
                            if candidates.contains_key(&result) {
                                removed.push((block, inst));
                            }
                        }
                        _ => {}
                    }
                }

                // Feed the slot φs of every CFG successor.
                for &succ in cfg.succs(block) {
                    for &phi in func.phis(succ).to_vec().iter() {
                        let Some(&slot) = phi_slot.get(&phi) else {
                            continue;
                        };
                        let ty = candidates[&slot];
                        let incoming = reaching_value(&stacks, slot, ty);
                        if let InstructionData::Phi { args } = &mut func.dfg[phi] {
                            args.push((block, incoming));
                        }
                    }
                }

                stack.push(Walk::Leave(pushed));
                for child in domtree.children(block) {
                    stack.push(Walk::Enter(child));
                }
            }
            Walk::Leave(pushed) => {
                for (slot, n) in pushed {
                    let st = stacks.get_mut(&slot).unwrap();
                    for _ in 0..n {
                        st.pop();
                    }
                }
            }
        }
    }

    for (block, inst) in removed {
        func.remove_inst(block, inst);
    }
    true
}

/// The value reaching the current program point for `slot`.
fn reaching_value(stacks: &FxHashMap<Value, Vec<Operand>>, slot: Value, ty: Type) -> Operand {
    match stacks.get(&slot).and_then(|s| s.last()) {
        Some(&op) => op,
        None => zero_of(ty),
    }
}

fn zero_of(ty: Type) -> Operand {
    if ty == types::F32 {
        Operand::Fimm32(Ieee32::with_float(0.0))
    } else {
        Operand::Imm32(0)
    }
}

/// Find single-element stack slots whose address is only ever used as the
/// pointer of a load or store.
fn promotable_slots(func: &Function) -> FxHashMap<Value, Type> {
    let mut slots: FxHashMap<Value, Type> = FxHashMap::default();
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            if let InstructionData::StackAlloc { ty, elems: 1 } = func.dfg[inst] {
                if ty == types::I32 || ty == types::F32 {
                    slots.insert(func.dfg.inst_result(inst).unwrap(), ty);
                }
            }
        }
    }
    if slots.is_empty() {
        return slots;
    }

    // Disqualify any slot whose address appears outside a load/store
    // pointer position.
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            match &func.dfg[inst] {
                InstructionData::Load { .. } => {}
                InstructionData::Store { value, .. } => {
                    if let Some(v) = value.as_value() {
                        slots.remove(&v);
                    }
                }
                data => {
                    for op in data.arguments() {
                        if let Some(v) = op.as_value() {
                            slots.remove(&v);
                        }
                    }
                }
            }
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IntCC, Opcode, Signature};
    use crate::verifier::verify_function;
    use types::I32;

    fn analyses(func: &Function) -> (ControlFlowGraph, DominatorTree) {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        (cfg, dt)
    }

    #[test]
    fn straight_line_promotion() {
        // int x = 1; return x + 2;
        let mut func = Function::with_name_signature("f", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 1);
        func.store(b0, Operand::Imm32(1), slot);
        let x = func.load(b0, I32, slot);
        let sum = func.binary(b0, Opcode::Iadd, I32, x, Operand::Imm32(2));
        func.ret(b0, Some(Operand::Value(sum)));

        let (cfg, dt) = analyses(&func);
        assert!(do_mem2reg(&mut func, &cfg, &dt));
        assert_eq!(verify_function(&func), Ok(()));
        // Only the add and the return remain.
        assert_eq!(func.block_insts(b0).len(), 2);
        match &func.dfg[func.block_insts(b0)[0]] {
            InstructionData::Binary { args, .. } => {
                assert_eq!(args[0], Operand::Imm32(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn diamond_inserts_phi() {
        // int x; if (c) x = 1; else x = 2; return x;
        let mut func = Function::with_name_signature("g", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let slot = func.stack_alloc(b0, I32, 1);
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.store(b1, Operand::Imm32(1), slot);
        func.jump(b1, b3);
        func.store(b2, Operand::Imm32(2), slot);
        func.jump(b2, b3);
        let x = func.load(b3, I32, slot);
        func.ret(b3, Some(Operand::Value(x)));

        let (cfg, dt) = analyses(&func);
        assert!(do_mem2reg(&mut func, &cfg, &dt));
        assert_eq!(verify_function(&func), Ok(()));
        assert_eq!(func.phis(b3).len(), 1);
        // No loads or stores left anywhere.
        for block in func.layout.blocks() {
            for &inst in func.block_insts(block) {
                assert!(!matches!(
                    func.dfg[inst],
                    InstructionData::Load { .. } | InstructionData::Store { .. }
                ));
            }
        }
    }

    #[test]
    fn escaping_slot_stays() {
        // The slot address is passed to elem_addr, so it must not be
        // promoted.
        let mut func = Function::with_name_signature("h", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 1);
        let addr = func.elem_addr(b0, slot, Operand::Imm32(0), I32);
        func.store(b0, Operand::Imm32(1), addr);
        let x = func.load(b0, I32, slot);
        func.ret(b0, Some(Operand::Value(x)));

        let (cfg, dt) = analyses(&func);
        assert!(!do_mem2reg(&mut func, &cfg, &dt));
    }

    #[test]
    fn uninitialized_load_reads_zero() {
        let mut func = Function::with_name_signature("u", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 1);
        let x = func.load(b0, I32, slot);
        func.ret(b0, Some(Operand::Value(x)));

        let (cfg, dt) = analyses(&func);
        assert!(do_mem2reg(&mut func, &cfg, &dt));
        match func.dfg[func.terminator(b0)] {
            InstructionData::Return { value } => assert_eq!(value, Some(Operand::Imm32(0))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn loop_carried_value_gets_header_phi() {
        // int s = 0; while (s < n) s = s + 1; return s;
        let mut func = Function::with_name_signature("l", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let header = func.add_block();
        let body = func.add_block();
        let exit = func.add_block();
        let n = func.params[0];
        let slot = func.stack_alloc(b0, I32, 1);
        func.store(b0, Operand::Imm32(0), slot);
        func.jump(b0, header);
        let s = func.load(header, I32, slot);
        let c = func.icmp(header, IntCC::SignedLessThan, s, n);
        func.branch(header, c, body, exit);
        let s2 = func.load(body, I32, slot);
        let inc = func.binary(body, Opcode::Iadd, I32, s2, Operand::Imm32(1));
        func.store(body, inc, slot);
        func.jump(body, header);
        let out = func.load(exit, I32, slot);
        func.ret(exit, Some(Operand::Value(out)));

        let (cfg, dt) = analyses(&func);
        assert!(do_mem2reg(&mut func, &cfg, &dt));
        assert_eq!(verify_function(&func), Ok(()));
        assert_eq!(func.phis(header).len(), 1);
    }
}
