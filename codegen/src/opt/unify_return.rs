//! Return unification.
//!
//! Rewrites a function with several `ret` instructions into one with a
//! dedicated exit block: each original return becomes a jump there, and a
//! φ merges the returned values for non-void functions. The back end then
//! sees a single epilogue point.

use crate::ir::{types, Block, Function, Inst, InstructionData, Operand};

/// Consolidate the returns of `func`. Returns whether anything changed.
pub fn do_unify_return(func: &mut Function) -> bool {
    let rets: Vec<(Block, Inst)> = func
        .layout
        .blocks()
        .map(|b| (b, func.terminator(b)))
        .filter(|&(_, term)| matches!(func.dfg[term], InstructionData::Return { .. }))
        .collect();
    if rets.len() <= 1 {
        return false;
    }
    log::debug!("{}: unifying {} returns", func.name, rets.len());

    let exit = func.add_block();
    let ret_ty = func.signature.ret;

    if ret_ty == types::VOID {
        for &(block, term) in &rets {
            func.remove_inst(block, term);
            func.jump(block, exit);
        }
        func.ret(exit, None);
    } else {
        let mut incoming = Vec::with_capacity(rets.len());
        for &(block, term) in &rets {
            let InstructionData::Return { value } = func.dfg[term].clone() else {
                unreachable!()
            };
            let value = value.expect("non-void function returning nothing");
            func.remove_inst(block, term);
            func.jump(block, exit);
            incoming.push((block, value));
        }
        let merged = func.phi(exit, ret_ty, incoming);
        func.ret(exit, Some(Operand::Value(merged)));
    }
    true
}
