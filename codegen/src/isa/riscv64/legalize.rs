//! DAG legalization for RV64.
//!
//! RV64 has no addressing mode for scaled element access, so element
//! addresses are rewritten into a shift and a 64-bit add before pattern
//! selection. Element types are 4 or 8 bytes wide, so the scale is always
//! a power of two; 32-bit indexes arrive sign-extended in their registers
//! and the full-width shift-and-add computes the right address for
//! negative indexes too.

use crate::ir::{types, Opcode};
use crate::isel::dag::{SdKind, SelectionDag};
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;

/// Rewrite unsupported nodes of `dag` into RV64-friendly forms.
pub fn legalize(dag: &mut SelectionDag) -> CodegenResult<()> {
    for node in dag.nodes.keys().collect::<Vec<_>>() {
        let SdKind::ElemAddr(elem_ty) = dag.nodes[node].kind else {
            continue;
        };
        let shamt = match elem_ty.bytes() {
            4 => 2,
            8 => 3,
            n => {
                return Err(CodegenError::Unsupported(format!(
                    "element stride of {n} bytes"
                )))
            }
        };
        let base = dag.nodes[node].args[0];
        let index = dag.nodes[node].args[1];

        let amount = dag.nodes.push(crate::isel::dag::SdNode {
            kind: SdKind::ConstI32(shamt),
            ty: types::I32,
            args: SmallVec::new(),
        });
        let scaled = dag.nodes.push(crate::isel::dag::SdNode {
            kind: SdKind::Binary(Opcode::Shl),
            ty: types::I64,
            args: SmallVec::from_slice(&[index, amount]),
        });

        let n = &mut dag.nodes[node];
        n.kind = SdKind::Binary(Opcode::Iadd);
        n.ty = types::PTR;
        n.args = SmallVec::from_slice(&[base, scaled]);

        dag.use_counts[amount] += 1;
        dag.use_counts[scaled] += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, Operand, Signature};
    use crate::isel::{exported_values, FuncLowering};
    use crate::mir::MachineFunction;

    #[test]
    fn elem_addr_becomes_shift_add() {
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let arr = func.stack_alloc(b0, I32, 10);
        let addr = func.elem_addr(b0, arr, func.params[0], I32);
        let x = func.load(b0, I32, addr);
        func.ret(b0, Some(Operand::Value(x)));

        let mut mfunc = MachineFunction::new("f", Signature::new(vec![I32], I32));
        mfunc.add_block();
        let mut ctx = FuncLowering::default();
        ctx.collect_allocas(&mut mfunc, &func);
        let exported = exported_values(&func);
        let mut dag =
            crate::isel::dag::SelectionDag::build(&func, b0, &mut ctx, &mut mfunc, &exported);

        legalize(&mut dag).unwrap();

        assert!(!dag
            .nodes
            .values()
            .any(|n| matches!(n.kind, SdKind::ElemAddr(_))));
        let shifts = dag
            .nodes
            .values()
            .filter(|n| matches!(n.kind, SdKind::Binary(Opcode::Shl)))
            .count();
        assert_eq!(shifts, 1);
    }
}
