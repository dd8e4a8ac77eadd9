//! A compilation context owning the pass pipeline.

use crate::analysis::AnalysisManager;
use crate::ir::Module;
use crate::isa;
use crate::opt;
use crate::result::CodegenResult;
use crate::settings::{Flags, OptLevel};
use crate::verifier;
use std::io::Write;

/// The driver for compiling one module: verifies the input, runs the
/// middle-end pipeline, and hands the result to a target.
///
/// The context owns the analysis manager so repeated compilations reuse
/// nothing stale: every pass that mutates a function invalidates its
/// cached analyses through the manager.
pub struct Context {
    /// Pipeline settings.
    pub flags: Flags,
    /// The per-function analysis cache.
    pub am: AnalysisManager,
}

impl Context {
    /// Create a context with default flags.
    pub fn new() -> Self {
        Self::with_flags(Flags::default())
    }

    /// Create a context with the given flags.
    pub fn with_flags(flags: Flags) -> Self {
        Self {
            flags,
            am: AnalysisManager::new(),
        }
    }

    /// Verify `module` and run the optimization pipeline over it.
    pub fn optimize(&mut self, module: &mut Module) -> CodegenResult<()> {
        verifier::verify_module(module)?;
        if self.flags.opt_level() == OptLevel::None {
            return Ok(());
        }
        opt::run_pipeline(module, &mut self.am);
        verifier::verify_module(module)
    }

    /// Optimize `module` and emit assembly for `target` on `out`.
    ///
    /// `target` may be a plain name (`"riscv64"`, `"rv64"`, `"riscv"`) or
    /// a target triple.
    pub fn compile(
        &mut self,
        module: &mut Module,
        target: &str,
        out: &mut dyn Write,
    ) -> CodegenResult<()> {
        let isa = isa::lookup_by_name(target)?;
        self.optimize(module)?;
        isa.compile(module, out)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, Operand, Signature};
    use crate::result::CodegenError;

    #[test]
    fn unknown_target_is_reported_before_optimizing() {
        let mut module = Module::new();
        let mut ctx = Context::new();
        let err = ctx
            .compile(&mut module, "vax", &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, CodegenError::UnknownTarget(_)));
    }

    #[test]
    fn compiles_trivial_function() {
        let mut module = Module::new();
        let mut func = Function::with_name_signature("answer", Signature::new(vec![], I32));
        let entry = func.entry_block();
        func.ret(entry, Some(Operand::Imm32(42)));
        module.define_function(func);

        let mut out = Vec::new();
        let mut ctx = Context::new();
        ctx.compile(&mut module, "riscv64", &mut out).unwrap();
        let asm = String::from_utf8(out).unwrap();
        assert!(asm.contains("answer:"));
        assert!(asm.contains("li\ta0, 42"));
        assert!(asm.contains("ret"));
    }
}
