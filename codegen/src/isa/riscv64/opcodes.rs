//! The RV64 machine opcode space and its instruction adapter.
//!
//! Every opcode belongs to an operand class that fixes the layout of the
//! operand list, so the [`InstrAdapter`] can answer def/use queries and
//! perform register surgery without a per-opcode table. `li`, `la`, and
//! `fli` are the usual assembler pseudos; `lea` is ours, a frame-slot
//! address that frame lowering rewrites into an `addi` off `sp`.

use crate::ir::types;
use crate::isa::InstrAdapter;
use crate::mir::{FrameIdx, MachineBlock, MachineInst, MachineOpcode, MachineOperand, Reg};

/// Operand layout classes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OpClass {
    /// `[rd, rs1, rs2]`.
    Rrr,
    /// `[rd, rs1, imm]`.
    Rri,
    /// `[rd, imm]`.
    Ri,
    /// `[rd, sym]`.
    Rsym,
    /// `[rd, rs]`.
    Rr,
    /// `[rd, fimm]`, expanded at emission.
    Rfimm,
    /// `[rd, mem-or-frame]`.
    Load,
    /// `[rs, mem-or-frame]`.
    Store,
    /// `[rs1, rs2, label]`.
    BranchCmp,
    /// `[rs, label]`.
    BranchZero,
    /// `[label]`.
    Jump,
    /// `[sym]`.
    Call,
    /// `[]`.
    Ret,
    /// `[rd, frame]`, rewritten by frame lowering.
    Lea,
}

macro_rules! rv64_opcodes {
    ($(($name:ident, $mnemonic:literal, $class:ident)),* $(,)?) => {
        /// An RV64 instruction opcode.
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub enum RvOpcode {
            $(
                #[doc = $mnemonic]
                $name,
            )*
        }

        const ALL: &[RvOpcode] = &[$(RvOpcode::$name),*];

        impl RvOpcode {
            /// Assembly mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$name => $mnemonic),*
                }
            }

            /// Operand layout class.
            pub fn class(self) -> OpClass {
                match self {
                    $(Self::$name => OpClass::$class),*
                }
            }

            /// Decode from a `MachineOpcode` number.
            pub fn from_u16(raw: u16) -> Option<Self> {
                raw.checked_sub(MachineOpcode::FIRST_TARGET)
                    .and_then(|i| ALL.get(i as usize))
                    .copied()
            }
        }

        impl From<RvOpcode> for MachineOpcode {
            fn from(op: RvOpcode) -> MachineOpcode {
                let index = ALL.iter().position(|&o| o == op).unwrap() as u16;
                MachineOpcode(MachineOpcode::FIRST_TARGET + index)
            }
        }
    };
}

rv64_opcodes! {
    (Add, "add", Rrr),
    (Addw, "addw", Rrr),
    (Sub, "sub", Rrr),
    (Subw, "subw", Rrr),
    (Mul, "mul", Rrr),
    (Mulw, "mulw", Rrr),
    (Div, "div", Rrr),
    (Divw, "divw", Rrr),
    (Rem, "rem", Rrr),
    (Remw, "remw", Rrr),
    (Sll, "sll", Rrr),
    (Sllw, "sllw", Rrr),
    (Srl, "srl", Rrr),
    (Srlw, "srlw", Rrr),
    (Sra, "sra", Rrr),
    (Sraw, "sraw", Rrr),
    (And, "and", Rrr),
    (Or, "or", Rrr),
    (Xor, "xor", Rrr),
    (Slt, "slt", Rrr),
    (Sltu, "sltu", Rrr),
    (Addi, "addi", Rri),
    (Addiw, "addiw", Rri),
    (Andi, "andi", Rri),
    (Ori, "ori", Rri),
    (Xori, "xori", Rri),
    (Slli, "slli", Rri),
    (Slliw, "slliw", Rri),
    (Srli, "srli", Rri),
    (Srliw, "srliw", Rri),
    (Srai, "srai", Rri),
    (Sraiw, "sraiw", Rri),
    (Seqz, "seqz", Rr),
    (Snez, "snez", Rr),
    (Li, "li", Ri),
    (La, "la", Rsym),
    (Mv, "mv", Rr),
    (LeaFi, "lea", Lea),
    (FaddS, "fadd.s", Rrr),
    (FsubS, "fsub.s", Rrr),
    (FmulS, "fmul.s", Rrr),
    (FdivS, "fdiv.s", Rrr),
    (FmvS, "fmv.s", Rr),
    (FmvWX, "fmv.w.x", Rr),
    (FmvXW, "fmv.x.w", Rr),
    (FcvtSW, "fcvt.s.w", Rr),
    (FcvtWS, "fcvt.w.s", Rr),
    (FeqS, "feq.s", Rrr),
    (FltS, "flt.s", Rrr),
    (FleS, "fle.s", Rrr),
    (Fli, "fli", Rfimm),
    (Lw, "lw", Load),
    (Ld, "ld", Load),
    (Flw, "flw", Load),
    (Sw, "sw", Store),
    (Sd, "sd", Store),
    (Fsw, "fsw", Store),
    (J, "j", Jump),
    (Beq, "beq", BranchCmp),
    (Bne, "bne", BranchCmp),
    (Blt, "blt", BranchCmp),
    (Bge, "bge", BranchCmp),
    (Bltu, "bltu", BranchCmp),
    (Bgeu, "bgeu", BranchCmp),
    (Bnez, "bnez", BranchZero),
    (CallSym, "call", Call),
    (RetInst, "ret", Ret),
}

/// Build an RV64 instruction.
pub fn inst(op: RvOpcode, operands: impl IntoIterator<Item = MachineOperand>) -> MachineInst {
    MachineInst::new(op.into(), operands)
}

fn class_of(inst: &MachineInst) -> Option<OpClass> {
    RvOpcode::from_u16(inst.opcode.0).map(RvOpcode::class)
}

fn mem_base(op: &MachineOperand) -> Option<Reg> {
    match op {
        MachineOperand::Mem { base, .. } => Some(*base),
        _ => None,
    }
}

/// The RV64 implementation of the target instruction adapter.
#[derive(Default)]
pub struct RvInstrAdapter;

impl InstrAdapter for RvInstrAdapter {
    fn is_call(&self, inst: &MachineInst) -> bool {
        class_of(inst) == Some(OpClass::Call)
    }

    fn is_return(&self, inst: &MachineInst) -> bool {
        class_of(inst) == Some(OpClass::Ret)
    }

    fn is_uncond_branch(&self, inst: &MachineInst) -> bool {
        class_of(inst) == Some(OpClass::Jump)
    }

    fn is_cond_branch(&self, inst: &MachineInst) -> bool {
        matches!(
            class_of(inst),
            Some(OpClass::BranchCmp | OpClass::BranchZero)
        )
    }

    fn branch_target(&self, inst: &MachineInst) -> Option<MachineBlock> {
        let at = match class_of(inst)? {
            OpClass::Jump => 0,
            OpClass::BranchZero => 1,
            OpClass::BranchCmp => 2,
            _ => return None,
        };
        match inst.operands.get(at) {
            Some(&MachineOperand::Label(b)) => Some(b),
            _ => None,
        }
    }

    fn uses(&self, inst: &MachineInst, out: &mut Vec<Reg>) {
        let Some(class) = class_of(inst) else {
            // The φ pseudo is not a target instruction; its reads happen
            // on the edges and are accounted for there.
            return;
        };
        match class {
            OpClass::Rrr => {
                out.extend(inst.operands[1].as_reg());
                out.extend(inst.operands[2].as_reg());
            }
            OpClass::Rri | OpClass::Rr => out.extend(inst.operands[1].as_reg()),
            OpClass::Load => out.extend(mem_base(&inst.operands[1])),
            OpClass::Store => {
                out.extend(inst.operands[0].as_reg());
                out.extend(mem_base(&inst.operands[1]));
            }
            OpClass::BranchCmp => {
                out.extend(inst.operands[0].as_reg());
                out.extend(inst.operands[1].as_reg());
            }
            OpClass::BranchZero => out.extend(inst.operands[0].as_reg()),
            OpClass::Ri
            | OpClass::Rsym
            | OpClass::Rfimm
            | OpClass::Jump
            | OpClass::Call
            | OpClass::Ret
            | OpClass::Lea => {}
        }
    }

    fn defs(&self, inst: &MachineInst, out: &mut Vec<Reg>) {
        let Some(class) = class_of(inst) else { return };
        match class {
            OpClass::Rrr
            | OpClass::Rri
            | OpClass::Ri
            | OpClass::Rsym
            | OpClass::Rr
            | OpClass::Rfimm
            | OpClass::Load
            | OpClass::Lea => out.extend(inst.operands[0].as_reg()),
            OpClass::Store
            | OpClass::BranchCmp
            | OpClass::BranchZero
            | OpClass::Jump
            | OpClass::Call
            | OpClass::Ret => {}
        }
    }

    fn replace_use(&self, inst: &mut MachineInst, from: Reg, to: Reg) {
        let Some(class) = class_of(inst) else { return };
        let replace = |op: &mut MachineOperand| match op {
            MachineOperand::Reg(r) if *r == from => *op = MachineOperand::Reg(to),
            MachineOperand::Mem { base, .. } if *base == from => *base = to,
            _ => {}
        };
        match class {
            OpClass::Rrr => inst.operands[1..=2].iter_mut().for_each(replace),
            OpClass::Rri | OpClass::Rr => replace(&mut inst.operands[1]),
            OpClass::Load => replace(&mut inst.operands[1]),
            OpClass::Store => inst.operands[0..=1].iter_mut().for_each(replace),
            OpClass::BranchCmp => inst.operands[0..=1].iter_mut().for_each(replace),
            OpClass::BranchZero => replace(&mut inst.operands[0]),
            _ => {}
        }
    }

    fn replace_def(&self, inst: &mut MachineInst, from: Reg, to: Reg) {
        let Some(class) = class_of(inst) else { return };
        match class {
            OpClass::Rrr
            | OpClass::Rri
            | OpClass::Ri
            | OpClass::Rsym
            | OpClass::Rr
            | OpClass::Rfimm
            | OpClass::Load
            | OpClass::Lea => {
                if inst.operands[0] == MachineOperand::Reg(from) {
                    inst.operands[0] = MachineOperand::Reg(to);
                }
            }
            _ => {}
        }
    }

    fn make_copy(&self, dst: Reg, src: MachineOperand) -> MachineInst {
        match src {
            MachineOperand::Reg(r) if r.ty.is_float() => {
                inst(RvOpcode::FmvS, [MachineOperand::Reg(dst), src])
            }
            MachineOperand::Reg(_) => inst(RvOpcode::Mv, [MachineOperand::Reg(dst), src]),
            MachineOperand::Imm32(_) => inst(RvOpcode::Li, [MachineOperand::Reg(dst), src]),
            MachineOperand::Fimm32(_) => inst(RvOpcode::Fli, [MachineOperand::Reg(dst), src]),
            other => panic!("cannot copy {other:?} into a register"),
        }
    }

    fn make_jump(&self, dest: MachineBlock) -> MachineInst {
        inst(RvOpcode::J, [MachineOperand::Label(dest)])
    }

    fn make_reload(&self, dst: Reg, slot: FrameIdx) -> MachineInst {
        let op = match dst.ty {
            types::F32 => RvOpcode::Flw,
            types::I32 => RvOpcode::Lw,
            _ => RvOpcode::Ld,
        };
        inst(op, [MachineOperand::Reg(dst), MachineOperand::FrameIndex(slot)])
    }

    fn make_spill(&self, src: Reg, slot: FrameIdx) -> MachineInst {
        let op = match src.ty {
            types::F32 => RvOpcode::Fsw,
            types::I32 => RvOpcode::Sw,
            _ => RvOpcode::Sd,
        };
        inst(op, [MachineOperand::Reg(src), MachineOperand::FrameIndex(slot)])
    }
}
