//! Frame lowering for RV64.
//!
//! Computes the final stack layout — outgoing-argument area at the bottom,
//! then locals and spill slots, then the callee-saved area and the saved
//! return address — rounds the whole frame to 16 bytes, and materializes
//! it: the prologue drops the stack pointer and saves what must be saved,
//! an epilogue mirrors it before every return, and every abstract frame
//! index becomes a concrete `sp`-relative address. Offsets beyond the
//! 12-bit immediate range go through the reserved `t0` scratch register.

use crate::ir::types;
use crate::isa::riscv64::opcodes::{inst, RvOpcode};
use crate::isa::riscv64::registers::{self, RegInfo};
use crate::isa::TargetRegInfo;
use crate::mir::{
    FrameIdx, FrameSlotKind, MachineFunction, MachineInst, MachineOperand, Reg,
};

fn round_up(x: u32, align: u32) -> u32 {
    (x + align - 1) / align * align
}

fn is_simm12(x: i32) -> bool {
    (-2048..=2047).contains(&x)
}

/// Lower the frame of `mfunc`.
pub(super) fn lower(mfunc: &mut MachineFunction, reg_info: &RegInfo) {
    // Slot offsets, bottom up.
    let mut off = round_up(mfunc.frame.out_args_size, 8);
    let slot_ids: Vec<FrameIdx> = mfunc.frame.slots.keys().collect();
    for &fi in &slot_ids {
        if mfunc.frame.slots[fi].kind == FrameSlotKind::IncomingArg {
            continue;
        }
        let align = mfunc.frame.slots[fi].align.max(4);
        off = round_up(off, align);
        mfunc.frame.slots[fi].offset = off as i32;
        off += mfunc.frame.slots[fi].size;
    }

    let mut saves: Vec<(u32, u32)> = Vec::new();
    let mut saved_regs = mfunc.frame.used_callee_saved.clone();
    saved_regs.sort_unstable();
    for r in saved_regs {
        off = round_up(off, 8);
        saves.push((r, off));
        off += 8;
    }
    let ra_off = if mfunc.has_calls {
        off = round_up(off, 8);
        let o = off;
        off += 8;
        Some(o)
    } else {
        None
    };
    let frame_size = round_up(off, 16);
    mfunc.frame.frame_size = frame_size;

    rewrite_frame_indexes(mfunc, reg_info, frame_size);

    if frame_size == 0 {
        return;
    }

    let sp = Reg::phys(reg_info.sp(), types::PTR);
    let t0 = Reg::phys(registers::T0, types::PTR);
    let ra = Reg::phys(reg_info.ra(), types::I64);

    // Prologue, pushed onto the entry in reverse.
    let mut prologue: Vec<MachineInst> = Vec::new();
    if is_simm12(-(frame_size as i32)) {
        prologue.push(inst(
            RvOpcode::Addi,
            [
                MachineOperand::Reg(sp),
                MachineOperand::Reg(sp),
                MachineOperand::Imm32(-(frame_size as i32)),
            ],
        ));
    } else {
        prologue.push(inst(
            RvOpcode::Li,
            [
                MachineOperand::Reg(t0),
                MachineOperand::Imm32(frame_size as i32),
            ],
        ));
        prologue.push(inst(
            RvOpcode::Sub,
            [
                MachineOperand::Reg(sp),
                MachineOperand::Reg(sp),
                MachineOperand::Reg(t0),
            ],
        ));
    }
    if let Some(o) = ra_off {
        prologue.push(save_inst(ra, sp, o));
    }
    for &(r, o) in &saves {
        let reg = phys_for_save(r, reg_info);
        prologue.push(save_inst(reg, sp, o));
    }
    let entry = mfunc.entry_block();
    for i in prologue.into_iter().rev() {
        mfunc.blocks[entry].insts.push_front(i);
    }

    // Epilogue before every return.
    for block in mfunc.layout.clone() {
        let mut i = 0;
        while i < mfunc.blocks[block].insts.len() {
            let op = RvOpcode::from_u16(mfunc.blocks[block].insts[i].opcode.0);
            if op != Some(RvOpcode::RetInst) {
                i += 1;
                continue;
            }
            let mut epilogue: Vec<MachineInst> = Vec::new();
            for &(r, o) in &saves {
                let reg = phys_for_save(r, reg_info);
                epilogue.push(restore_inst(reg, sp, o));
            }
            if let Some(o) = ra_off {
                epilogue.push(restore_inst(ra, sp, o));
            }
            if is_simm12(frame_size as i32) {
                epilogue.push(inst(
                    RvOpcode::Addi,
                    [
                        MachineOperand::Reg(sp),
                        MachineOperand::Reg(sp),
                        MachineOperand::Imm32(frame_size as i32),
                    ],
                ));
            } else {
                epilogue.push(inst(
                    RvOpcode::Li,
                    [
                        MachineOperand::Reg(t0),
                        MachineOperand::Imm32(frame_size as i32),
                    ],
                ));
                epilogue.push(inst(
                    RvOpcode::Add,
                    [
                        MachineOperand::Reg(sp),
                        MachineOperand::Reg(sp),
                        MachineOperand::Reg(t0),
                    ],
                ));
            }
            let n = epilogue.len();
            for (k, e) in epilogue.into_iter().enumerate() {
                mfunc.blocks[block].insts.insert(i + k, e);
            }
            i += n + 1;
        }
    }
}

fn phys_for_save(num: u32, reg_info: &RegInfo) -> Reg {
    if reg_info.is_float_reg(num) {
        Reg::phys(num, types::F32)
    } else {
        Reg::phys(num, types::I64)
    }
}

fn save_inst(reg: Reg, sp: Reg, offset: u32) -> MachineInst {
    let op = if reg.ty.is_float() {
        RvOpcode::Fsw
    } else {
        RvOpcode::Sd
    };
    inst(
        op,
        [
            MachineOperand::Reg(reg),
            MachineOperand::Mem {
                base: sp,
                offset: offset as i32,
            },
        ],
    )
}

fn restore_inst(reg: Reg, sp: Reg, offset: u32) -> MachineInst {
    let op = if reg.ty.is_float() {
        RvOpcode::Flw
    } else {
        RvOpcode::Ld
    };
    inst(
        op,
        [
            MachineOperand::Reg(reg),
            MachineOperand::Mem {
                base: sp,
                offset: offset as i32,
            },
        ],
    )
}

/// Replace frame indexes with `sp`-relative addresses and the `lea`
/// pseudos with `addi`.
fn rewrite_frame_indexes(mfunc: &mut MachineFunction, reg_info: &RegInfo, frame_size: u32) {
    let sp = Reg::phys(reg_info.sp(), types::PTR);
    let t0 = Reg::phys(registers::T0, types::PTR);
    for block in mfunc.layout.clone() {
        let mut i = 0;
        while i < mfunc.blocks[block].insts.len() {
            let fi = mfunc.blocks[block].insts[i]
                .operands
                .iter()
                .find_map(|op| match op {
                    MachineOperand::FrameIndex(fi) => Some(*fi),
                    _ => None,
                });
            let Some(fi) = fi else {
                i += 1;
                continue;
            };
            let slot = &mfunc.frame.slots[fi];
            let offset = match slot.kind {
                FrameSlotKind::IncomingArg => frame_size as i32 + slot.offset,
                _ => slot.offset,
            };

            let is_lea = RvOpcode::from_u16(mfunc.blocks[block].insts[i].opcode.0)
                == Some(RvOpcode::LeaFi);
            if is_lea {
                let dst = mfunc.blocks[block].insts[i].operands[0].clone();
                if is_simm12(offset) {
                    mfunc.blocks[block].insts[i] = inst(
                        RvOpcode::Addi,
                        [dst, MachineOperand::Reg(sp), MachineOperand::Imm32(offset)],
                    );
                } else {
                    mfunc.blocks[block].insts[i] = inst(
                        RvOpcode::Li,
                        [MachineOperand::Reg(t0), MachineOperand::Imm32(offset)],
                    );
                    mfunc.blocks[block].insts.insert(
                        i + 1,
                        inst(
                            RvOpcode::Add,
                            [dst, MachineOperand::Reg(sp), MachineOperand::Reg(t0)],
                        ),
                    );
                    i += 1;
                }
            } else if is_simm12(offset) {
                for op in mfunc.blocks[block].insts[i].operands.iter_mut() {
                    if matches!(op, MachineOperand::FrameIndex(_)) {
                        *op = MachineOperand::Mem { base: sp, offset };
                    }
                }
            } else {
                mfunc.blocks[block].insts.insert(
                    i,
                    inst(
                        RvOpcode::Li,
                        [MachineOperand::Reg(t0), MachineOperand::Imm32(offset)],
                    ),
                );
                mfunc.blocks[block].insts.insert(
                    i + 1,
                    inst(
                        RvOpcode::Add,
                        [
                            MachineOperand::Reg(t0),
                            MachineOperand::Reg(t0),
                            MachineOperand::Reg(sp),
                        ],
                    ),
                );
                for op in mfunc.blocks[block].insts[i + 2].operands.iter_mut() {
                    if matches!(op, MachineOperand::FrameIndex(_)) {
                        *op = MachineOperand::Mem { base: t0, offset: 0 };
                    }
                }
                i += 2;
            }
            i += 1;
        }
    }
}
