//! Instruction set architectures.
//!
//! The `isa` module provides the [`TargetIsa`] trait behind which each
//! target hides instruction selection, lowering, and emission, together
//! with the two narrow interfaces the target-independent back-end passes
//! see: [`TargetRegInfo`] (the register file and ABI sets) and
//! [`InstrAdapter`] (queries and surgery on target instructions). The
//! register allocator and PHI elimination touch target instructions
//! through the adapter only.
//!
//! Targets are found by [`lookup`] from a `target_lexicon::Triple`, or by
//! [`lookup_by_name`] from a plain name such as `"riscv64"`. Looking a
//! target up twice hands out two independent instances; registration is a
//! static match and therefore idempotent.

pub mod riscv64;

use crate::ir::Module;
use crate::mir::{FrameIdx, MachineBlock, MachineBlockData, MachineInst, MachineOperand, Reg};
use crate::result::{CodegenError, CodegenResult};
use std::io::Write;
use target_lexicon::{Architecture, Triple};

/// The register file and calling convention of a target.
pub trait TargetRegInfo {
    /// Number of the stack pointer.
    fn sp(&self) -> u32;
    /// Number of the return-address register.
    fn ra(&self) -> u32;
    /// Number of the hardwired zero register.
    fn zero(&self) -> u32;
    /// Integer argument registers, in ABI order.
    fn int_arg_regs(&self) -> &[u32];
    /// Floating argument registers, in ABI order.
    fn float_arg_regs(&self) -> &[u32];
    /// Callee-saved integer registers.
    fn callee_saved_int(&self) -> &[u32];
    /// Callee-saved floating registers.
    fn callee_saved_float(&self) -> &[u32];
    /// Registers the allocator must never hand out.
    fn reserved(&self) -> &[u32];
    /// The full integer register file.
    fn int_regs(&self) -> &[u32];
    /// The full floating register file.
    fn float_regs(&self) -> &[u32];
    /// Does `num` name a floating register?
    fn is_float_reg(&self, num: u32) -> bool;
    /// Reserved integer scratch registers for spill traffic and frame
    /// materialization.
    fn int_scratch(&self) -> [u32; 2];
    /// Reserved floating scratch registers.
    fn float_scratch(&self) -> [u32; 2];
    /// Assembly name of a register.
    fn reg_name(&self, num: u32) -> &'static str;
}

/// The register allocator's and lowering passes' only window into target
/// instruction encodings.
pub trait InstrAdapter {
    /// Is this a call?
    fn is_call(&self, inst: &MachineInst) -> bool;
    /// Is this a return?
    fn is_return(&self, inst: &MachineInst) -> bool;
    /// Is this an unconditional branch?
    fn is_uncond_branch(&self, inst: &MachineInst) -> bool;
    /// Is this a conditional branch?
    fn is_cond_branch(&self, inst: &MachineInst) -> bool;
    /// The label a branch targets, if it is a branch.
    fn branch_target(&self, inst: &MachineInst) -> Option<MachineBlock>;
    /// Append the registers this instruction reads to `out`.
    fn uses(&self, inst: &MachineInst, out: &mut Vec<Reg>);
    /// Append the registers this instruction writes to `out`.
    fn defs(&self, inst: &MachineInst, out: &mut Vec<Reg>);
    /// Append every physical register mentioned by this instruction.
    fn phys_regs(&self, inst: &MachineInst, out: &mut Vec<Reg>) {
        let mut all = Vec::new();
        self.uses(inst, &mut all);
        self.defs(inst, &mut all);
        out.extend(all.into_iter().filter(|r| !r.virt));
    }
    /// Replace a read of `from` with `to`.
    fn replace_use(&self, inst: &mut MachineInst, from: Reg, to: Reg);
    /// Replace a write of `from` with `to`.
    fn replace_def(&self, inst: &mut MachineInst, from: Reg, to: Reg);
    /// Build a register copy. The source may be an immediate or symbol.
    fn make_copy(&self, dst: Reg, src: MachineOperand) -> MachineInst;
    /// Build an unconditional jump.
    fn make_jump(&self, dest: MachineBlock) -> MachineInst;
    /// Build a load of `dst` from a frame slot.
    fn make_reload(&self, dst: Reg, slot: FrameIdx) -> MachineInst;
    /// Build a store of `src` to a frame slot.
    fn make_spill(&self, src: Reg, slot: FrameIdx) -> MachineInst;
    /// Insert a reload of `phys` from `slot` in front of `index`.
    fn insert_reload_before(
        &self,
        block: &mut MachineBlockData,
        index: usize,
        phys: Reg,
        slot: FrameIdx,
    ) {
        block.insts.insert(index, self.make_reload(phys, slot));
    }
    /// Insert a spill of `phys` to `slot` right after `index`.
    fn insert_spill_after(
        &self,
        block: &mut MachineBlockData,
        index: usize,
        phys: Reg,
        slot: FrameIdx,
    ) {
        block.insts.insert(index + 1, self.make_spill(phys, slot));
    }
}

/// A target instruction set.
pub trait TargetIsa {
    /// Canonical name of the target.
    fn name(&self) -> &'static str;
    /// The register file description.
    fn reg_info(&self) -> &dyn TargetRegInfo;
    /// Lower `module` all the way to textual assembly on `out`:
    /// instruction selection, PHI elimination, register allocation, frame
    /// lowering, emission.
    fn compile(&self, module: &Module, out: &mut dyn Write) -> CodegenResult<()>;
}

/// Look up a target from a triple.
pub fn lookup(triple: Triple) -> CodegenResult<Box<dyn TargetIsa>> {
    match triple.architecture {
        Architecture::Riscv64(_) => Ok(riscv64::isa_builder()),
        arch => Err(CodegenError::UnknownTarget(arch.to_string())),
    }
}

/// Look up a target by plain name; falls back to parsing the name as a
/// triple.
pub fn lookup_by_name(name: &str) -> CodegenResult<Box<dyn TargetIsa>> {
    match name {
        "riscv64" | "riscv" | "rv64" => Ok(riscv64::isa_builder()),
        other => match other.parse::<Triple>() {
            Ok(triple) => lookup(triple),
            Err(_) => Err(CodegenError::UnknownTarget(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_lookup_aliases() {
        for name in ["riscv64", "riscv", "rv64"] {
            assert_eq!(lookup_by_name(name).unwrap().name(), "riscv64");
        }
        assert!(lookup_by_name("riscv64-unknown-linux-gnu").is_ok());
        assert!(matches!(
            lookup_by_name("m68k"),
            Err(CodegenError::UnknownTarget(_))
        ));
    }
}
