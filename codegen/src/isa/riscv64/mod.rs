//! RISC-V 64 target.
//!
//! The lowering pipeline per function: DAG instruction selection, PHI
//! elimination, linear-scan register allocation, frame lowering, then
//! textual emission over the whole module.

mod emit;
mod frame;
mod legalize;
pub mod opcodes;
mod registers;
mod select;

pub use self::registers::RegInfo;

use self::opcodes::RvInstrAdapter;
use crate::ir::Module;
use crate::isa::TargetIsa;
use crate::mir::{MachineGlobal, MachineModule};
use crate::result::CodegenResult;
use std::io::Write;

/// Create the RV64 target.
pub fn isa_builder() -> Box<dyn TargetIsa> {
    Box::new(Rv64Target::default())
}

/// The RV64 instruction adapter, also used by target-independent tests.
pub fn adapter() -> RvInstrAdapter {
    RvInstrAdapter
}

#[derive(Default)]
struct Rv64Target {
    reg_info: RegInfo,
}

impl TargetIsa for Rv64Target {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn reg_info(&self) -> &dyn crate::isa::TargetRegInfo {
        &self.reg_info
    }

    fn compile(&self, module: &Module, out: &mut dyn Write) -> CodegenResult<()> {
        let adapter = RvInstrAdapter;
        let mut mmod = MachineModule::default();

        for data in module.globals.values() {
            mmod.globals.push(MachineGlobal {
                name: data.name.clone(),
                ty: data.ty,
                elems: data.elems(),
                init: data.init.clone(),
            });
        }

        for fr in module.defined_functions().collect::<Vec<_>>() {
            let func = module.functions[fr].body().unwrap();
            log::debug!("lowering function {}", func.name);
            let mut mfunc = select::select_function(func, module, &self.reg_info)?;
            crate::phi_elim::run(&mut mfunc, &adapter);
            crate::regalloc::run(&mut mfunc, &adapter, &self.reg_info);
            frame::lower(&mut mfunc, &self.reg_info);
            mmod.functions.push(mfunc);
        }

        emit::emit(&mmod, &self.reg_info, out)
    }
}
