//! Linear-scan register allocation.
//!
//! Intervals are processed in start order. Expired intervals return their
//! register to the free pool; the next interval takes the first acceptable
//! free register of its class, where acceptable means no overlap with a
//! position where that physical register is named explicitly. Intervals
//! crossing a call may only take callee-saved registers — caller-saved
//! ones die at the call — and everything else prefers caller-saved so the
//! prologue stays small. When nothing is free, the active interval with
//! the latest end is evicted to a stack slot; spilled registers are
//! rewritten to go through the reserved scratch registers with a reload
//! before each use and a spill after each def.

use crate::fx::FxHashMap;
use crate::isa::{InstrAdapter, TargetRegInfo};
use crate::mir::{FrameIdx, MachineFunction, Reg};
use crate::regalloc::liveness::{self, Interval};

struct ActiveInterval {
    end: u32,
    phys: u32,
    reg: Reg,
}

/// Allocate every virtual register of `mfunc`.
pub fn run(mfunc: &mut MachineFunction, adapter: &dyn InstrAdapter, reg_info: &dyn TargetRegInfo) {
    let live = liveness::compute(mfunc, adapter);
    let mut intervals: Vec<Interval> = live.intervals;
    intervals.sort_by_key(|iv| (iv.start, iv.end));

    let reserved = reg_info.reserved();
    let not_reserved = |&&num: &&u32| !reserved.contains(&num);
    let caller_int: Vec<u32> = reg_info
        .int_regs()
        .iter()
        .filter(not_reserved)
        .filter(|&&num| !reg_info.callee_saved_int().contains(&num))
        .copied()
        .collect();
    let callee_int: Vec<u32> = reg_info
        .callee_saved_int()
        .iter()
        .filter(not_reserved)
        .copied()
        .collect();
    let caller_float: Vec<u32> = reg_info
        .float_regs()
        .iter()
        .filter(not_reserved)
        .filter(|&&num| !reg_info.callee_saved_float().contains(&num))
        .copied()
        .collect();
    let callee_float: Vec<u32> = reg_info
        .callee_saved_float()
        .iter()
        .filter(not_reserved)
        .copied()
        .collect();

    let fixed_conflict = |phys: u32, start: u32, end: u32| -> bool {
        live.fixed
            .get(&phys)
            .is_some_and(|ps| ps.iter().any(|&p| start <= p && p <= end))
    };

    let mut active: Vec<ActiveInterval> = Vec::new();
    let mut assignment: FxHashMap<Reg, u32> = FxHashMap::default();
    let mut spill_slot: FxHashMap<Reg, FrameIdx> = FxHashMap::default();

    for iv in &intervals {
        active.retain(|a| a.end >= iv.start);

        let is_float = iv.reg.ty.is_float();
        let (callee, caller): (&[u32], &[u32]) = if is_float {
            (&callee_float, &caller_float)
        } else {
            (&callee_int, &caller_int)
        };
        let candidates: Vec<u32> = if iv.crosses_call {
            callee.to_vec()
        } else {
            caller.iter().chain(callee).copied().collect()
        };

        let taken: Vec<u32> = active.iter().map(|a| a.phys).collect();
        let pick = candidates
            .iter()
            .copied()
            .find(|&p| !taken.contains(&p) && !fixed_conflict(p, iv.start, iv.end));

        match pick {
            Some(phys) => {
                assignment.insert(iv.reg, phys);
                if callee.contains(&phys) {
                    mfunc.frame.record_callee_saved(phys);
                }
                active.push(ActiveInterval {
                    end: iv.end,
                    phys,
                    reg: iv.reg,
                });
            }
            None => {
                // Evict the latest-ending eligible active interval, or
                // spill the current one if it ends even later.
                let victim = active
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| candidates.contains(&a.phys))
                    .filter(|(_, a)| !fixed_conflict(a.phys, iv.start, iv.end))
                    .max_by_key(|(_, a)| a.end)
                    .map(|(i, _)| i);
                match victim {
                    Some(vi) if active[vi].end > iv.end => {
                        let victim = active.swap_remove(vi);
                        log::debug!(
                            "{}: spilling {} to free {}",
                            mfunc.name,
                            victim.reg,
                            reg_info.reg_name(victim.phys)
                        );
                        assignment.remove(&victim.reg);
                        let slot = mfunc.frame.make_spill_slot(victim.reg.ty);
                        spill_slot.insert(victim.reg, slot);
                        assignment.insert(iv.reg, victim.phys);
                        if callee.contains(&victim.phys) {
                            mfunc.frame.record_callee_saved(victim.phys);
                        }
                        active.push(ActiveInterval {
                            end: iv.end,
                            phys: victim.phys,
                            reg: iv.reg,
                        });
                    }
                    _ => {
                        log::debug!("{}: spilling {}", mfunc.name, iv.reg);
                        let slot = mfunc.frame.make_spill_slot(iv.reg.ty);
                        spill_slot.insert(iv.reg, slot);
                    }
                }
            }
        }
    }

    rewrite(mfunc, adapter, reg_info, &assignment, &spill_slot);
}

/// Apply the assignment: rename allocated registers and route spilled ones
/// through the scratch registers.
fn rewrite(
    mfunc: &mut MachineFunction,
    adapter: &dyn InstrAdapter,
    reg_info: &dyn TargetRegInfo,
    assignment: &FxHashMap<Reg, u32>,
    spill_slot: &FxHashMap<Reg, FrameIdx>,
) {
    let blocks = mfunc.layout.clone();
    for block in blocks {
        let mut i = 0;
        while i < mfunc.blocks[block].insts.len() {
            let mut uses = Vec::new();
            let mut defs = Vec::new();
            adapter.uses(&mfunc.blocks[block].insts[i], &mut uses);
            adapter.defs(&mfunc.blocks[block].insts[i], &mut defs);
            uses.dedup();

            // Reloads go in front, each use through its own scratch.
            let mut used_scratch = [false; 2];
            for reg in uses.into_iter().filter(|r| r.virt) {
                if let Some(&slot) = spill_slot.get(&reg) {
                    let bank = if reg.ty.is_float() {
                        reg_info.float_scratch()
                    } else {
                        reg_info.int_scratch()
                    };
                    let k = if used_scratch[0] { 1 } else { 0 };
                    used_scratch[k] = true;
                    let scratch = Reg::phys(bank[k], reg.ty);
                    adapter.insert_reload_before(&mut mfunc.blocks[block], i, scratch, slot);
                    i += 1;
                    adapter.replace_use(&mut mfunc.blocks[block].insts[i], reg, scratch);
                } else if let Some(&phys) = assignment.get(&reg) {
                    let phys = Reg::phys(phys, reg.ty);
                    adapter.replace_use(&mut mfunc.blocks[block].insts[i], reg, phys);
                }
            }

            let mut spill_after = None;
            for reg in defs.into_iter().filter(|r| r.virt) {
                if let Some(&slot) = spill_slot.get(&reg) {
                    let bank = if reg.ty.is_float() {
                        reg_info.float_scratch()
                    } else {
                        reg_info.int_scratch()
                    };
                    let scratch = Reg::phys(bank[0], reg.ty);
                    adapter.replace_def(&mut mfunc.blocks[block].insts[i], reg, scratch);
                    spill_after = Some((scratch, slot));
                } else if let Some(&phys) = assignment.get(&reg) {
                    let phys = Reg::phys(phys, reg.ty);
                    adapter.replace_def(&mut mfunc.blocks[block].insts[i], reg, phys);
                }
            }
            if let Some((scratch, slot)) = spill_after {
                adapter.insert_spill_after(&mut mfunc.blocks[block], i, scratch, slot);
                i += 1;
            }
            i += 1;
        }
    }

    // Nothing virtual may survive.
    #[cfg(debug_assertions)]
    for block in mfunc.layout.clone() {
        for inst in &mfunc.blocks[block].insts {
            let mut regs = Vec::new();
            adapter.uses(inst, &mut regs);
            adapter.defs(inst, &mut regs);
            for r in regs {
                debug_assert!(!r.virt, "{}: {r} left unallocated", mfunc.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::I32;
    use crate::ir::Signature;
    use crate::isa::riscv64::opcodes::{inst, RvOpcode};
    use crate::isa::riscv64::{adapter, RegInfo};
    use crate::mir::{FrameSlotKind, MachineInst, MachineOperand};

    fn all_physical(mfunc: &MachineFunction, ad: &dyn InstrAdapter) -> bool {
        mfunc.layout.iter().all(|&b| {
            mfunc.blocks[b].insts.iter().all(|i| {
                let mut regs = Vec::new();
                ad.uses(i, &mut regs);
                ad.defs(i, &mut regs);
                regs.iter().all(|r| !r.virt)
            })
        })
    }

    /// Define two more values than the integer file holds and keep them
    /// all live into an accumulation chain. Two intervals spill where
    /// they start; a third, long-lived one is evicted once the chain
    /// begins and shorter intervals outbid it.
    #[test]
    fn spills_and_evicts_under_register_pressure() {
        let ad = adapter();
        let ri = RegInfo;
        let mut mfunc = MachineFunction::new("f", Signature::new(vec![], I32));
        let b = mfunc.add_block();

        let allocatable = ri
            .int_regs()
            .iter()
            .filter(|r| !ri.reserved().contains(r))
            .count();
        let n = allocatable + 2;
        let vals: Vec<Reg> = (0..n).map(|_| mfunc.new_vreg(I32)).collect();
        for (k, &v) in vals.iter().enumerate() {
            mfunc.blocks[b].insts.push_back(inst(
                RvOpcode::Li,
                [MachineOperand::Reg(v), MachineOperand::Imm32(k as i32)],
            ));
        }
        let mut acc = vals[0];
        for &v in &vals[1..] {
            let sum = mfunc.new_vreg(I32);
            mfunc.blocks[b].insts.push_back(inst(
                RvOpcode::Addw,
                [
                    MachineOperand::Reg(sum),
                    MachineOperand::Reg(acc),
                    MachineOperand::Reg(v),
                ],
            ));
            acc = sum;
        }
        let a0 = Reg::phys(ri.int_arg_regs()[0], I32);
        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Mv,
            [MachineOperand::Reg(a0), MachineOperand::Reg(acc)],
        ));
        mfunc.blocks[b].insts.push_back(inst(RvOpcode::RetInst, []));

        run(&mut mfunc, &ad, &ri);
        assert!(all_physical(&mfunc, &ad));

        let spill_slots = mfunc
            .frame
            .slots
            .values()
            .filter(|s| s.kind == FrameSlotKind::Spill)
            .count();
        assert_eq!(spill_slots, 3);

        let insts: Vec<MachineInst> = mfunc.blocks[b].insts.iter().cloned().collect();
        let scratch = ri.int_scratch();
        let is_frame = |i: &MachineInst| {
            i.operands
                .iter()
                .any(|o| matches!(o, MachineOperand::FrameIndex(_)))
        };

        // Every spill store immediately follows the definition of its
        // scratch register; every reload immediately precedes the use.
        let mut stores = 0;
        let mut reloads = 0;
        for (k, i) in insts.iter().enumerate() {
            match RvOpcode::from_u16(i.opcode.0) {
                Some(RvOpcode::Sw) if is_frame(i) => {
                    stores += 1;
                    let stored = i.operands[0].as_reg().unwrap();
                    assert!(scratch.contains(&stored.num));
                    let mut defs = Vec::new();
                    ad.defs(&insts[k - 1], &mut defs);
                    assert_eq!(defs, vec![stored]);
                }
                Some(RvOpcode::Lw) if is_frame(i) => {
                    reloads += 1;
                    let loaded = i.operands[0].as_reg().unwrap();
                    assert!(scratch.contains(&loaded.num));
                    let mut uses = Vec::new();
                    ad.uses(&insts[k + 1], &mut uses);
                    assert!(uses.contains(&loaded));
                }
                _ => {}
            }
        }
        assert_eq!(stores, 3);
        assert_eq!(reloads, 3);

        // The definitions that stayed in registers hold pairwise
        // distinct physical registers.
        let li_dests: Vec<u32> = insts
            .iter()
            .filter(|i| RvOpcode::from_u16(i.opcode.0) == Some(RvOpcode::Li))
            .map(|i| i.operands[0].as_reg().unwrap().num)
            .collect();
        assert_eq!(li_dests.len(), n);
        let mut kept: Vec<u32> = li_dests
            .iter()
            .copied()
            .filter(|r| !scratch.contains(r))
            .collect();
        let kept_count = kept.len();
        kept.sort_unstable();
        kept.dedup();
        assert_eq!(kept.len(), kept_count);
        assert_eq!(kept_count, allocatable - 1);
    }

    #[test]
    fn call_crossing_values_take_callee_saved_registers() {
        let ad = adapter();
        let ri = RegInfo;
        let mut mfunc = MachineFunction::new("f", Signature::new(vec![], I32));
        let b = mfunc.add_block();
        let v0 = mfunc.new_vreg(I32);
        let v1 = mfunc.new_vreg(I32);
        let a0 = Reg::phys(ri.int_arg_regs()[0], I32);

        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Li,
            [MachineOperand::Reg(v0), MachineOperand::Imm32(7)],
        ));
        mfunc.blocks[b]
            .insts
            .push_back(inst(RvOpcode::CallSym, [MachineOperand::Sym("g".into())]));
        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Addw,
            [
                MachineOperand::Reg(v1),
                MachineOperand::Reg(v0),
                MachineOperand::Reg(v0),
            ],
        ));
        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Mv,
            [MachineOperand::Reg(a0), MachineOperand::Reg(v1)],
        ));
        mfunc.blocks[b].insts.push_back(inst(RvOpcode::RetInst, []));

        run(&mut mfunc, &ad, &ri);
        assert!(all_physical(&mfunc, &ad));
        // Plenty of callee-saved registers: nothing had to spill.
        assert!(mfunc.frame.slots.is_empty());

        // The value live across the call sits in a callee-saved
        // register, recorded for frame lowering to preserve.
        let li_dst = mfunc.blocks[b].insts[0].operands[0].as_reg().unwrap();
        assert!(ri.callee_saved_int().contains(&li_dst.num));
        assert_eq!(mfunc.frame.used_callee_saved, vec![li_dst.num]);

        // The post-call temporary stays caller-saved and steers clear
        // of the explicitly named return register.
        let add_dst = mfunc.blocks[b].insts[2].operands[0].as_reg().unwrap();
        assert!(!ri.callee_saved_int().contains(&add_dst.num));
        assert!(!ri.reserved().contains(&add_dst.num));
        assert_ne!(add_dst.num, ri.int_arg_regs()[0]);
    }

    /// An interval overlapping an explicit mention of a physical
    /// register must not be assigned that register.
    #[test]
    fn avoids_registers_with_explicit_uses_in_range() {
        let ad = adapter();
        let ri = RegInfo;
        let mut mfunc = MachineFunction::new("f", Signature::new(vec![], I32));
        let b = mfunc.add_block();
        let v0 = mfunc.new_vreg(I32);
        let v1 = mfunc.new_vreg(I32);
        let a0 = Reg::phys(ri.int_arg_regs()[0], I32);

        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Li,
            [MachineOperand::Reg(v0), MachineOperand::Imm32(1)],
        ));
        // a0 is written while v0 is live, and again while v1 is live.
        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Li,
            [MachineOperand::Reg(a0), MachineOperand::Imm32(9)],
        ));
        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Addw,
            [
                MachineOperand::Reg(v1),
                MachineOperand::Reg(v0),
                MachineOperand::Reg(v0),
            ],
        ));
        mfunc.blocks[b].insts.push_back(inst(
            RvOpcode::Mv,
            [MachineOperand::Reg(a0), MachineOperand::Reg(v1)],
        ));
        mfunc.blocks[b].insts.push_back(inst(RvOpcode::RetInst, []));

        run(&mut mfunc, &ad, &ri);
        assert!(all_physical(&mfunc, &ad));

        // Both values skip a0 and take the next argument registers.
        let li_dst = mfunc.blocks[b].insts[0].operands[0].as_reg().unwrap();
        assert_eq!(li_dst.num, ri.int_arg_regs()[1]);
        let add_dst = mfunc.blocks[b].insts[2].operands[0].as_reg().unwrap();
        assert_eq!(add_dst.num, ri.int_arg_regs()[2]);
    }
}
