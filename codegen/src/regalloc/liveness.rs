//! Liveness analysis over the machine IR.
//!
//! Blocks are linearized in reverse post-order and every instruction gets
//! a position in that order. Per-block live-in/live-out sets come from the
//! standard backward dataflow (`out = ∪ in(succ)`, `in = gen ∪ (out −
//! kill)`), and each virtual register is summarized as one contiguous
//! interval from its first definition to its last use, widened across
//! blocks it is live through. Holes inside an interval are given up, as
//! the allocator accepts slightly conservative ranges in exchange for
//! one-dimensional bookkeeping.

use crate::fx::{FxHashMap, FxHashSet};
use crate::isa::InstrAdapter;
use crate::mir::{MachineBlock, MachineFunction, MachineOperand, Reg};

/// The live interval of one virtual register.
#[derive(Clone, Debug)]
pub struct Interval {
    /// The virtual register.
    pub reg: Reg,
    /// First position where the register is live.
    pub start: u32,
    /// Last position where the register is live.
    pub end: u32,
    /// Whether a call executes strictly inside the interval; such values
    /// must live in callee-saved registers or on the stack.
    pub crosses_call: bool,
}

/// The result of liveness computation.
pub struct Liveness {
    /// Blocks in reverse post-order; positions number the instructions in
    /// this order.
    pub order: Vec<MachineBlock>,
    /// One interval per virtual register, unsorted.
    pub intervals: Vec<Interval>,
    /// Positions of call instructions.
    pub call_positions: Vec<u32>,
    /// Positions at which each physical register is mentioned.
    pub fixed: FxHashMap<u32, Vec<u32>>,
}

/// Successor blocks, read from the branch labels of the terminators.
pub fn block_succs(mfunc: &MachineFunction, block: MachineBlock) -> Vec<MachineBlock> {
    let mut succs = Vec::new();
    for inst in &mfunc.blocks[block].insts {
        if inst.is_phi() {
            continue;
        }
        for op in &inst.operands {
            if let MachineOperand::Label(s) = *op {
                if !succs.contains(&s) {
                    succs.push(s);
                }
            }
        }
    }
    succs
}

/// Reverse post-order of the machine CFG.
pub fn rpo(mfunc: &MachineFunction) -> Vec<MachineBlock> {
    enum Visit {
        First(MachineBlock),
        Again(MachineBlock),
    }
    let mut post = Vec::new();
    let mut seen: FxHashSet<MachineBlock> = FxHashSet::default();
    let entry = mfunc.entry_block();
    seen.insert(entry);
    let mut stack = vec![Visit::First(entry)];
    while let Some(visit) = stack.pop() {
        match visit {
            Visit::First(b) => {
                stack.push(Visit::Again(b));
                for s in block_succs(mfunc, b) {
                    if seen.insert(s) {
                        stack.push(Visit::First(s));
                    }
                }
            }
            Visit::Again(b) => post.push(b),
        }
    }
    post.reverse();
    post
}

/// Compute liveness for `mfunc`.
pub fn compute(mfunc: &MachineFunction, adapter: &dyn InstrAdapter) -> Liveness {
    let mut order = rpo(mfunc);
    // Blocks the traversal missed still need positions so their registers
    // get allocated; nothing branches to them, so they go last.
    for &b in &mfunc.layout {
        if !order.contains(&b) {
            order.push(b);
        }
    }

    // Position ranges per block.
    let mut block_range: FxHashMap<MachineBlock, (u32, u32)> = FxHashMap::default();
    let mut pos = 0u32;
    for &b in &order {
        let start = pos;
        pos += mfunc.blocks[b].insts.len() as u32;
        block_range.insert(b, (start, pos));
    }

    // Per-block gen/kill over virtual registers, call and phys positions.
    let mut gen: FxHashMap<MachineBlock, FxHashSet<Reg>> = FxHashMap::default();
    let mut kill: FxHashMap<MachineBlock, FxHashSet<Reg>> = FxHashMap::default();
    let mut call_positions = Vec::new();
    let mut fixed: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    let mut scratch_uses = Vec::new();
    let mut scratch_defs = Vec::new();
    for &b in &order {
        let g = gen.entry(b).or_default();
        let k = kill.entry(b).or_default();
        let mut p = block_range[&b].0;
        for inst in &mfunc.blocks[b].insts {
            if adapter.is_call(inst) {
                call_positions.push(p);
            }
            let mut phys = Vec::new();
            adapter.phys_regs(inst, &mut phys);
            for r in phys {
                fixed.entry(r.num).or_default().push(p);
            }
            scratch_uses.clear();
            scratch_defs.clear();
            adapter.uses(inst, &mut scratch_uses);
            adapter.defs(inst, &mut scratch_defs);
            for &r in scratch_uses.iter().filter(|r| r.virt) {
                if !k.contains(&r) {
                    g.insert(r);
                }
            }
            for &r in scratch_defs.iter().filter(|r| r.virt) {
                k.insert(r);
            }
            p += 1;
        }
    }

    // Backward dataflow to a fixpoint.
    let mut live_in: FxHashMap<MachineBlock, FxHashSet<Reg>> = FxHashMap::default();
    let mut live_out: FxHashMap<MachineBlock, FxHashSet<Reg>> = FxHashMap::default();
    loop {
        let mut changed = false;
        for &b in order.iter().rev() {
            let mut out: FxHashSet<Reg> = FxHashSet::default();
            for s in block_succs(mfunc, b) {
                if let Some(si) = live_in.get(&s) {
                    out.extend(si.iter().copied());
                }
            }
            let mut inn: FxHashSet<Reg> = out.difference(&kill[&b]).copied().collect();
            inn.extend(gen[&b].iter().copied());
            if live_out.get(&b) != Some(&out) || live_in.get(&b) != Some(&inn) {
                live_out.insert(b, out);
                live_in.insert(b, inn);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Intervals: widen over block boundaries and instruction positions.
    let mut ranges: FxHashMap<Reg, (u32, u32)> = FxHashMap::default();
    let mut extend = |r: Reg, p: u32, ranges: &mut FxHashMap<Reg, (u32, u32)>| {
        let e = ranges.entry(r).or_insert((p, p));
        e.0 = e.0.min(p);
        e.1 = e.1.max(p);
    };
    for &b in &order {
        let (bs, be) = block_range[&b];
        if bs == be {
            continue;
        }
        for &r in &live_in[&b] {
            extend(r, bs, &mut ranges);
        }
        for &r in &live_out[&b] {
            extend(r, be - 1, &mut ranges);
        }
        let mut p = bs;
        for inst in &mfunc.blocks[b].insts {
            scratch_uses.clear();
            scratch_defs.clear();
            adapter.uses(inst, &mut scratch_uses);
            adapter.defs(inst, &mut scratch_defs);
            for r in scratch_uses
                .iter()
                .chain(scratch_defs.iter())
                .copied()
                .filter(|r| r.virt)
            {
                extend(r, p, &mut ranges);
            }
            p += 1;
        }
    }

    call_positions.sort_unstable();
    let intervals = ranges
        .into_iter()
        .map(|(reg, (start, end))| Interval {
            reg,
            start,
            end,
            crosses_call: call_positions.iter().any(|&c| start < c && c < end),
        })
        .collect();

    Liveness {
        order,
        intervals,
        call_positions,
        fixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::I32;
    use crate::ir::Signature;
    use crate::isa::riscv64::adapter;
    use crate::isa::riscv64::opcodes::{inst, RvOpcode};

    #[test]
    fn intervals_cover_defs_uses_and_call_crossings() {
        let ad = adapter();
        let mut mfunc = MachineFunction::new("f", Signature::new(vec![], I32));
        let b0 = mfunc.add_block();
        let b1 = mfunc.add_block();
        let v0 = mfunc.new_vreg(I32);
        let v1 = mfunc.new_vreg(I32);
        let v3 = mfunc.new_vreg(I32);
        let a0 = Reg::phys(10, I32);

        // b0: v0 lives across the call, v1 dies into a0 before it.
        mfunc.blocks[b0].insts.push_back(inst(
            RvOpcode::Li,
            [MachineOperand::Reg(v0), MachineOperand::Imm32(1)],
        ));
        mfunc.blocks[b0].insts.push_back(inst(
            RvOpcode::Li,
            [MachineOperand::Reg(v1), MachineOperand::Imm32(2)],
        ));
        mfunc.blocks[b0].insts.push_back(inst(
            RvOpcode::Mv,
            [MachineOperand::Reg(a0), MachineOperand::Reg(v1)],
        ));
        mfunc.blocks[b0]
            .insts
            .push_back(inst(RvOpcode::CallSym, [MachineOperand::Sym("g".into())]));
        mfunc.blocks[b0]
            .insts
            .push_back(inst(RvOpcode::J, [MachineOperand::Label(b1)]));
        // b1: first use of v0 after the call.
        mfunc.blocks[b1].insts.push_back(inst(
            RvOpcode::Addw,
            [
                MachineOperand::Reg(v3),
                MachineOperand::Reg(v0),
                MachineOperand::Reg(v0),
            ],
        ));
        mfunc.blocks[b1].insts.push_back(inst(
            RvOpcode::Mv,
            [MachineOperand::Reg(a0), MachineOperand::Reg(v3)],
        ));
        mfunc.blocks[b1]
            .insts
            .push_back(inst(RvOpcode::RetInst, []));

        let live = compute(&mfunc, &ad);

        assert_eq!(live.order, vec![b0, b1]);
        assert_eq!(live.call_positions, vec![3]);

        let iv = |r: Reg| {
            live.intervals
                .iter()
                .find(|i| i.reg == r)
                .unwrap()
                .clone()
        };
        // v0 is live from its def through the branch into its b1 use.
        assert_eq!((iv(v0).start, iv(v0).end), (0, 5));
        assert!(iv(v0).crosses_call);
        // v1 dies at the copy before the call.
        assert_eq!((iv(v1).start, iv(v1).end), (1, 2));
        assert!(!iv(v1).crosses_call);
        assert!(!iv(v3).crosses_call);

        // Both explicit a0 mentions are recorded as fixed positions.
        assert_eq!(live.fixed[&10], vec![2, 6]);
    }
}
