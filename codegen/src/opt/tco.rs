//! Tail-call elimination: rewriting self-recursive tail calls into loops.
//!
//! A call to the enclosing function is a tail call when its block ends by
//! returning either nothing or exactly the call's result, possibly through
//! a chain of blocks that only forward to a bare `ret` of void. The
//! rewrite moves the whole entry block into a fresh loop header, gives
//! every parameter a header φ merging its original value with the
//! arguments of each rewritten call site, and replaces call-plus-return
//! with a jump back to the header — the SSA rendition of the parallel
//! parameter copies. Calls passing anything derived from a stack slot are
//! left alone: the slot would be reused across iterations.

use crate::analysis::AnalysisManager;
use crate::fx::FxHashMap;
use crate::ir::{
    types, Block, FuncRef, Function, Inst, InstructionData, Module, Operand, Value, ValueDef,
};
use crate::opt::replace_value_uses_except;

/// Perform tail-call elimination over every defined function of `module`.
pub fn do_tco(module: &mut Module, am: &mut AnalysisManager) {
    let funcs: Vec<FuncRef> = module.defined_functions().collect();
    for fr in funcs {
        let func = module.functions[fr].body_mut().unwrap();
        if rewrite_function(func, fr) {
            am.invalidate(fr);
        }
    }
}

/// A rewritable call site: the call instruction and its block.
struct TailSite {
    block: Block,
    call: Inst,
}

fn rewrite_function(func: &mut Function, fr: FuncRef) -> bool {
    let sites = find_tail_sites(func, fr);
    if sites.is_empty() {
        return false;
    }
    log::debug!(
        "{}: rewriting {} tail call(s) into a loop",
        func.name,
        sites.len()
    );

    let entry = func.entry_block();

    // The loop header takes over the entry's body; the entry keeps only a
    // jump, right after the parameter definitions.
    let header = func.make_block();
    func.layout.insert_block_after(header, entry);
    let moved = func.block_insts(entry).to_vec();
    func.set_block_insts(entry, Vec::new());
    func.set_block_insts(header, moved);
    func.jump(entry, header);

    // Blocks that listed the entry as a φ-predecessor now see the header.
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for block in blocks {
        for &phi in func.phis(block).to_vec().iter() {
            func.dfg[phi].map_phi_labels(|b| if b == entry { header } else { b });
        }
    }

    // One header φ per parameter.
    let params = func.params.clone();
    let mut param_phis: Vec<Value> = Vec::with_capacity(params.len());
    for (i, &p) in params.iter().enumerate() {
        let ty = func.signature.params[i];
        let merged = func.phi(header, ty, [(entry, Operand::Value(p))]);
        let phi_inst = func.dfg.value_def(merged).inst().unwrap();
        replace_value_uses_except(func, p, Operand::Value(merged), Some(phi_inst));
        param_phis.push(merged);
    }

    // Rewrite each site: drop the call and everything after it, then loop.
    for site in &sites {
        let block = if site.block == entry { header } else { site.block };
        let insts = func.block_insts(block).to_vec();
        let call_pos = insts.iter().position(|&i| i == site.call).unwrap();
        let InstructionData::Call { args, .. } = func.dfg[site.call].clone() else {
            unreachable!()
        };
        func.set_block_insts(block, insts[..call_pos].to_vec());
        func.jump(block, header);
        for (i, &arg) in args.iter().enumerate() {
            let phi_inst = func.dfg.value_def(param_phis[i]).inst().unwrap();
            if let InstructionData::Phi { args: incoming } = &mut func.dfg[phi_inst] {
                incoming.push((block, arg));
            }
        }
    }

    func.loop_header = header.into();
    func.loop_preentry = entry.into();
    true
}

fn find_tail_sites(func: &Function, fr: FuncRef) -> Vec<TailSite> {
    let mut sites = Vec::new();
    for block in func.layout.blocks() {
        let insts = func.block_insts(block);
        if insts.len() < 2 {
            continue;
        }
        let call = insts[insts.len() - 2];
        let InstructionData::Call { func: callee, args } = &func.dfg[call] else {
            continue;
        };
        if *callee != fr || args.len() != func.signature.params.len() {
            continue;
        }

        let term = insts[insts.len() - 1];
        let in_tail_position = match func.dfg[term] {
            InstructionData::Return { value: None } => true,
            InstructionData::Return { value: Some(op) } => {
                op.as_value() == func.dfg.inst_result(call)
            }
            InstructionData::Jump { dest } => {
                // A void call may fall into a chain of blocks that do
                // nothing but reach a bare `ret`.
                func.signature.ret == types::VOID && is_void_return_chain(func, dest)
            }
            _ => false,
        };
        if !in_tail_position {
            continue;
        }

        let mut memo: FxHashMap<Value, bool> = FxHashMap::default();
        let escapes = args.iter().any(|&arg| match arg {
            Operand::Value(v) => {
                is_alloca_derived(func, v, &mut memo, &mut Vec::new())
            }
            _ => false,
        });
        if escapes {
            continue;
        }
        sites.push(TailSite { block, call });
    }
    sites
}

/// Does every path from `start` reach a `ret` of void through empty
/// forwarding blocks?
fn is_void_return_chain(func: &Function, start: Block) -> bool {
    let mut block = start;
    for _ in 0..func.layout.num_blocks() {
        let insts = func.block_insts(block);
        if insts.len() != 1 {
            return false;
        }
        match func.dfg[insts[0]] {
            InstructionData::Return { value: None } => return true,
            InstructionData::Jump { dest } => block = dest,
            _ => return false,
        }
    }
    false
}

/// Is `value` derived from a stack allocation, walking the def-use chain
/// with memoization and cycle tolerance (φs can see themselves).
fn is_alloca_derived(
    func: &Function,
    value: Value,
    memo: &mut FxHashMap<Value, bool>,
    visiting: &mut Vec<Value>,
) -> bool {
    if let Some(&known) = memo.get(&value) {
        return known;
    }
    if visiting.contains(&value) {
        return false;
    }
    let ValueDef::Inst(def) = func.dfg.value_def(value) else {
        return false;
    };
    visiting.push(value);
    let derived = match &func.dfg[def] {
        InstructionData::StackAlloc { .. } => true,
        InstructionData::ElemAddr { base, .. } => match base.as_value() {
            Some(v) => is_alloca_derived(func, v, memo, visiting),
            None => false,
        },
        InstructionData::Phi { args } => args.iter().any(|&(_, op)| match op.as_value() {
            Some(v) => is_alloca_derived(func, v, memo, visiting),
            None => false,
        }),
        _ => false,
    };
    visiting.pop();
    memo.insert(value, derived);
    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, IntCC, Opcode, Signature};
    use crate::verifier::verify_function;

    /// int tail(int n, int acc) { if (n == 0) return acc;
    ///                            return tail(n - 1, acc + n); }
    fn tail_sum(module: &mut Module) -> FuncRef {
        let fr = module.declare_function("tail", Signature::new(vec![I32, I32], I32));
        let mut func = Function::with_name_signature("tail", Signature::new(vec![I32, I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let (n, acc) = (func.params[0], func.params[1]);
        let c = func.icmp(b0, IntCC::Equal, n, Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.ret(b1, Some(Operand::Value(acc)));
        let n1 = func.binary(b2, Opcode::Isub, I32, n, Operand::Imm32(1));
        let a1 = func.binary(b2, Opcode::Iadd, I32, acc, n);
        let r = func
            .call(b2, fr, [Operand::Value(n1), Operand::Value(a1)], I32)
            .unwrap();
        func.ret(b2, Some(Operand::Value(r)));

        // Re-register under the same ref by replacing the import with the
        // body.
        module.functions[fr] = crate::ir::FuncDecl::Defined(func);
        fr
    }

    #[test]
    fn rewrites_tail_recursion_to_loop() {
        let mut module = Module::new();
        let fr = tail_sum(&mut module);
        let mut am = AnalysisManager::new();
        do_tco(&mut module, &mut am);

        let func = module.functions[fr].body().unwrap();
        assert_eq!(verify_function(func), Ok(()));

        // No call remains anywhere.
        for block in func.layout.blocks() {
            for &inst in func.block_insts(block) {
                assert!(!matches!(func.dfg[inst], InstructionData::Call { .. }));
            }
        }
        // The header merges both parameters.
        let header = func.loop_header.expand().unwrap();
        assert_eq!(func.phis(header).len(), 2);
    }

    #[test]
    fn non_tail_recursion_untouched() {
        // fact(n) = n * fact(n - 1): the multiply follows the call.
        let mut module = Module::new();
        let fr = module.declare_function("fact", Signature::new(vec![I32], I32));
        let mut func = Function::with_name_signature("fact", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let n = func.params[0];
        let c = func.icmp(b0, IntCC::SignedLessThanOrEqual, n, Operand::Imm32(1));
        func.branch(b0, c, b1, b2);
        func.ret(b1, Some(Operand::Imm32(1)));
        let n1 = func.binary(b2, Opcode::Isub, I32, n, Operand::Imm32(1));
        let r = func.call(b2, fr, [Operand::Value(n1)], I32).unwrap();
        let prod = func.binary(b2, Opcode::Imul, I32, n, r);
        func.ret(b2, Some(Operand::Value(prod)));
        module.functions[fr] = crate::ir::FuncDecl::Defined(func);

        let mut am = AnalysisManager::new();
        do_tco(&mut module, &mut am);

        let func = module.functions[fr].body().unwrap();
        let mut calls = 0;
        for block in func.layout.blocks() {
            for &inst in func.block_insts(block) {
                if matches!(func.dfg[inst], InstructionData::Call { .. }) {
                    calls += 1;
                }
            }
        }
        assert_eq!(calls, 1);
        assert!(func.loop_header.is_none());
    }

    #[test]
    fn alloca_derived_argument_blocks_rewrite() {
        let mut module = Module::new();
        let fr = module.declare_function("f", Signature::new(vec![types::PTR], types::VOID));
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![types::PTR], types::VOID));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 4);
        let addr = func.elem_addr(b0, slot, Operand::Imm32(1), I32);
        func.call(b0, fr, [Operand::Value(addr)], types::VOID);
        func.ret(b0, None);
        module.functions[fr] = crate::ir::FuncDecl::Defined(func);

        let mut am = AnalysisManager::new();
        do_tco(&mut module, &mut am);
        let func = module.functions[fr].body().unwrap();
        assert!(func.loop_header.is_none());
    }
}
