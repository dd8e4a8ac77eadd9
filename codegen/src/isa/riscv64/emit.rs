//! Textual assembly emission for RV64.
//!
//! Walks the machine module and prints GNU-assembler syntax: data and bss
//! directives for the globals, then each function with labeled blocks and
//! one line per instruction. The `fli` pseudo expands here into a `li`
//! plus `fmv.w.x` through the reserved `t0`, matching how the other
//! pseudos (`li`, `la`) lean on the assembler.

use crate::isa::riscv64::opcodes::{OpClass, RvOpcode};
use crate::isa::riscv64::registers::RegInfo;
use crate::isa::TargetRegInfo;
use crate::mir::{MachineFunction, MachineGlobal, MachineInst, MachineModule, MachineOperand, Reg};
use crate::result::{CodegenError, CodegenResult};
use std::fmt::Write as _;
use std::io::Write;

/// Write the assembly of `mmod` to `out`.
pub(super) fn emit(
    mmod: &MachineModule,
    reg_info: &RegInfo,
    out: &mut dyn Write,
) -> CodegenResult<()> {
    let mut text = String::new();
    for global in &mmod.globals {
        emit_global(&mut text, global);
    }
    for func in &mmod.functions {
        emit_function(&mut text, func, reg_info);
    }
    out.write_all(text.as_bytes())
        .map_err(|e| CodegenError::Io(e.to_string()))
}

fn emit_global(text: &mut String, global: &MachineGlobal) {
    let align = if global.ty.bytes() == 8 { 3 } else { 2 };
    let section = if global.init.is_empty() { ".bss" } else { ".data" };
    let _ = writeln!(text, "\t{section}");
    let _ = writeln!(text, "\t.globl\t{}", global.name);
    let _ = writeln!(text, "\t.align\t{align}");
    let _ = writeln!(text, "{}:", global.name);
    let size = global.elems * global.ty.bytes();
    if global.init.is_empty() {
        let _ = writeln!(text, "\t.zero\t{size}");
    } else {
        for &word in &global.init {
            if global.ty.bytes() == 8 {
                let _ = writeln!(text, "\t.quad\t{word}");
            } else {
                let _ = writeln!(text, "\t.word\t{}", word as i32);
            }
        }
        let tail = (global.elems as usize - global.init.len()) as u32 * global.ty.bytes();
        if tail > 0 {
            let _ = writeln!(text, "\t.zero\t{tail}");
        }
    }
    let _ = writeln!(text, "\t.size\t{}, {size}", global.name);
}

fn block_label(func: &MachineFunction, mb: crate::mir::MachineBlock) -> String {
    use carve_entity::EntityRef;
    format!(".L{}_{}", func.name, mb.index())
}

fn emit_function(text: &mut String, func: &MachineFunction, reg_info: &RegInfo) {
    let _ = writeln!(text, "\t.text");
    let _ = writeln!(text, "\t.align\t1");
    let _ = writeln!(text, "\t.globl\t{}", func.name);
    let _ = writeln!(text, "\t.type\t{}, @function", func.name);
    let _ = writeln!(text, "{}:", func.name);
    for (i, &mb) in func.layout.iter().enumerate() {
        if i > 0 {
            let _ = writeln!(text, "{}:", block_label(func, mb));
        }
        for inst in &func.blocks[mb].insts {
            emit_inst(text, func, inst, reg_info);
        }
    }
    let _ = writeln!(text, "\t.size\t{0}, .-{0}", func.name);
}

fn reg(r: Reg, reg_info: &RegInfo) -> &'static str {
    debug_assert!(!r.virt, "virtual register reached emission");
    reg_info.reg_name(r.num)
}

fn operand(op: &MachineOperand, func: &MachineFunction, reg_info: &RegInfo) -> String {
    match op {
        MachineOperand::Reg(r) => reg(*r, reg_info).to_string(),
        MachineOperand::Imm32(x) => x.to_string(),
        MachineOperand::Fimm32(x) => x.to_string(),
        MachineOperand::Sym(s) => s.clone(),
        MachineOperand::Label(mb) => block_label(func, *mb),
        MachineOperand::Mem { base, offset } => {
            format!("{offset}({})", reg(*base, reg_info))
        }
        MachineOperand::FrameIndex(fi) => {
            unreachable!("{fi} survived frame lowering")
        }
    }
}

fn emit_inst(text: &mut String, func: &MachineFunction, inst: &MachineInst, reg_info: &RegInfo) {
    let op = RvOpcode::from_u16(inst.opcode.0)
        .unwrap_or_else(|| panic!("pseudo opcode {:?} reached emission", inst.opcode));
    let p = |op: &MachineOperand| operand(op, func, reg_info);

    match op {
        RvOpcode::Fli => {
            // li + fmv.w.x through the frame scratch register.
            let MachineOperand::Fimm32(bits) = inst.operands[1] else {
                panic!("fli without a float immediate");
            };
            let _ = writeln!(text, "\tli\tt0, {}", bits.bits() as i32);
            let _ = writeln!(text, "\tfmv.w.x\t{}, t0", p(&inst.operands[0]));
            return;
        }
        RvOpcode::FcvtWS => {
            // Truncating convert, as the source language rounds toward
            // zero.
            let _ = writeln!(
                text,
                "\tfcvt.w.s\t{}, {}, rtz",
                p(&inst.operands[0]),
                p(&inst.operands[1])
            );
            return;
        }
        _ => {}
    }

    let ops: Vec<String> = match op.class() {
        OpClass::Ret => Vec::new(),
        _ => inst.operands.iter().map(|o| p(o)).collect(),
    };
    if ops.is_empty() {
        let _ = writeln!(text, "\t{}", op.mnemonic());
    } else {
        let _ = writeln!(text, "\t{}\t{}", op.mnemonic(), ops.join(", "));
    }
}
