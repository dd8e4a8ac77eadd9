//! The per-block selection DAG.
//!
//! One node per non-φ IR instruction, plus token nodes threading memory
//! order: the block starts with an entry token, every load hangs off the
//! current chain, and each store or call first merges the outstanding
//! loads through a token-factor node, so loads may reorder among
//! themselves but never move across a memory barrier. The block terminator
//! is the DAG root; values consumed by later blocks are extra roots.
//!
//! φ-nodes are not built into the DAG. The target emits a φ pseudo
//! straight from the IR before selection, and in-block readers of a φ
//! result see a plain virtual-register node.

use crate::fx::FxHashMap;
use crate::ir::{
    types, Block, FloatCC, FuncRef, Function, GlobalVar, Ieee32, InstructionData, IntCC, Opcode,
    Operand, Type, Value,
};
use crate::isel::FuncLowering;
use crate::mir::{FrameIdx, MachineFunction, Reg};
use carve_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

/// An opaque reference to a DAG node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SdNodeId(u32);
entity_impl!(SdNodeId, "n");

/// What a node computes.
#[derive(Clone, PartialEq, Debug)]
pub enum SdKind {
    /// Start of the block's side-effect chain.
    EntryToken,
    /// Merge of several side-effect chains.
    TokenFactor,
    /// A 32-bit integer constant.
    ConstI32(i32),
    /// A 64-bit integer constant.
    ConstI64(i64),
    /// A 32-bit float constant.
    ConstF32(Ieee32),
    /// The address of a global.
    Sym(GlobalVar),
    /// A value living in a virtual register (defined in another block, a
    /// parameter, or a φ result).
    VReg(Reg),
    /// The address of a stack slot.
    FrameAddr(FrameIdx),
    /// Integer or float arithmetic; args are the two operands.
    Binary(Opcode),
    /// A conversion; arg is the operand.
    Unary(Opcode),
    /// Integer compare producing 0/1.
    Icmp(IntCC),
    /// Float compare producing 0/1.
    Fcmp(FloatCC),
    /// Element address; args are base and index, the type is the element
    /// type. Targets legalize this into shifts and adds.
    ElemAddr(Type),
    /// Memory read; args are `[chain, addr]`.
    Load,
    /// Memory write; args are `[chain, value, addr]`.
    Store,
    /// Call; args are `[chain, call args...]`.
    Call(FuncRef),
    /// Return; args are `[chain]` or `[chain, value]`.
    Ret,
    /// Unconditional branch; args are `[chain]`.
    Br(Block),
    /// Conditional branch; args are `[chain, cond]`, targets then/else.
    BrCond(Block, Block),
}

/// One DAG node.
#[derive(Clone, Debug)]
pub struct SdNode {
    /// The operation.
    pub kind: SdKind,
    /// Result type; `types::TOKEN` for chain nodes, `types::VOID` for
    /// sinks.
    pub ty: Type,
    /// Operand nodes.
    pub args: SmallVec<[SdNodeId; 4]>,
}

/// The selection DAG of one basic block.
pub struct SelectionDag {
    /// Node arena.
    pub nodes: PrimaryMap<SdNodeId, SdNode>,
    /// The IR block this DAG was built from.
    pub block: Block,
    /// The terminator node.
    pub terminator: SdNodeId,
    /// Nodes whose value must land in the virtual register of the given
    /// IR value, for consumption by other blocks.
    pub exports: Vec<(SdNodeId, Value)>,
    /// Number of in-DAG consumers of each node, for fold decisions.
    pub use_counts: SecondaryMap<SdNodeId, u32>,
}

impl SelectionDag {
    /// Build the DAG for `block`.
    pub fn build(
        func: &Function,
        block: Block,
        ctx: &mut FuncLowering,
        mfunc: &mut MachineFunction,
        exported: &crate::fx::FxHashSet<Value>,
    ) -> Self {
        let mut b = Builder {
            func,
            ctx,
            mfunc,
            nodes: PrimaryMap::new(),
            value_node: FxHashMap::default(),
            chain: SdNodeId::from_u32(0),
            pending_loads: Vec::new(),
        };
        b.chain = b.push(SdKind::EntryToken, types::TOKEN, []);

        let mut terminator = None;
        for &inst in func.block_insts(block) {
            terminator = b.build_inst(inst);
        }
        let terminator = terminator.expect("block without terminator");

        let mut exports = Vec::new();
        for (&value, &node) in &b.value_node {
            if exported.contains(&value) && !matches!(b.nodes[node].kind, SdKind::FrameAddr(_)) {
                exports.push((node, value));
            }
        }
        // Deterministic selection order.
        exports.sort_by_key(|&(n, _)| n);

        let mut use_counts = SecondaryMap::new();
        for node in b.nodes.keys().collect::<Vec<_>>() {
            for &arg in &b.nodes[node].args {
                use_counts[arg] += 1;
            }
        }

        Self {
            nodes: b.nodes,
            block,
            terminator,
            exports,
            use_counts,
        }
    }

    /// Is `node` exported out of the block?
    pub fn is_exported(&self, node: SdNodeId) -> bool {
        self.exports.iter().any(|&(n, _)| n == node)
    }
}

struct Builder<'a> {
    func: &'a Function,
    ctx: &'a mut FuncLowering,
    mfunc: &'a mut MachineFunction,
    nodes: PrimaryMap<SdNodeId, SdNode>,
    value_node: FxHashMap<Value, SdNodeId>,
    chain: SdNodeId,
    pending_loads: Vec<SdNodeId>,
}

impl Builder<'_> {
    fn push(
        &mut self,
        kind: SdKind,
        ty: Type,
        args: impl IntoIterator<Item = SdNodeId>,
    ) -> SdNodeId {
        self.nodes.push(SdNode {
            kind,
            ty,
            args: SmallVec::from_iter(args),
        })
    }

    /// The node computing `op` in this block.
    fn operand(&mut self, op: Operand) -> SdNodeId {
        match op {
            Operand::Value(v) => {
                if let Some(&n) = self.value_node.get(&v) {
                    return n;
                }
                let node = if let Some(&fi) = self.ctx.frame_index.get(&v) {
                    self.push(SdKind::FrameAddr(fi), types::PTR, [])
                } else {
                    let ty = self.func.dfg.value_type(v);
                    let r = self.ctx.vreg_of(self.mfunc, self.func, v);
                    self.push(SdKind::VReg(r), ty, [])
                };
                self.value_node.insert(v, node);
                node
            }
            Operand::Imm32(x) => self.push(SdKind::ConstI32(x), types::I32, []),
            Operand::Imm64(x) => self.push(SdKind::ConstI64(x), types::I64, []),
            Operand::Fimm32(x) => self.push(SdKind::ConstF32(x), types::F32, []),
            Operand::Global(g) => self.push(SdKind::Sym(g), types::PTR, []),
        }
    }

    /// Merge the chain with all loads issued since the last barrier.
    fn barrier(&mut self) -> SdNodeId {
        if self.pending_loads.is_empty() {
            return self.chain;
        }
        let mut args = vec![self.chain];
        args.append(&mut self.pending_loads);
        let tf = self.push(SdKind::TokenFactor, types::TOKEN, args);
        self.chain = tf;
        tf
    }

    fn define(&mut self, inst: crate::ir::Inst, node: SdNodeId) {
        if let Some(result) = self.func.dfg.inst_result(inst) {
            self.value_node.insert(result, node);
        }
    }

    /// Translate one instruction; returns the node when it terminates the
    /// block.
    fn build_inst(&mut self, inst: crate::ir::Inst) -> Option<SdNodeId> {
        let result_ty = self
            .func
            .dfg
            .inst_result(inst)
            .map(|r| self.func.dfg.value_type(r))
            .unwrap_or(types::VOID);
        match self.func.dfg[inst].clone() {
            InstructionData::Binary { opcode, args } => {
                let lhs = self.operand(args[0]);
                let rhs = self.operand(args[1]);
                let n = self.push(SdKind::Binary(opcode), result_ty, [lhs, rhs]);
                self.define(inst, n);
                None
            }
            InstructionData::Unary { opcode, arg } => {
                let a = self.operand(arg);
                let n = self.push(SdKind::Unary(opcode), result_ty, [a]);
                self.define(inst, n);
                None
            }
            InstructionData::IntCompare { cond, args } => {
                let lhs = self.operand(args[0]);
                let rhs = self.operand(args[1]);
                let n = self.push(SdKind::Icmp(cond), types::I32, [lhs, rhs]);
                self.define(inst, n);
                None
            }
            InstructionData::FloatCompare { cond, args } => {
                let lhs = self.operand(args[0]);
                let rhs = self.operand(args[1]);
                let n = self.push(SdKind::Fcmp(cond), types::I32, [lhs, rhs]);
                self.define(inst, n);
                None
            }
            InstructionData::ElemAddr {
                base,
                index,
                elem_ty,
            } => {
                let b = self.operand(base);
                let i = self.operand(index);
                let n = self.push(SdKind::ElemAddr(elem_ty), types::PTR, [b, i]);
                self.define(inst, n);
                None
            }
            InstructionData::StackAlloc { .. } => {
                let result = self.func.dfg.inst_result(inst).unwrap();
                let fi = self.ctx.frame_index[&result];
                let n = self.push(SdKind::FrameAddr(fi), types::PTR, []);
                self.value_node.insert(result, n);
                None
            }
            InstructionData::Load { ptr } => {
                let addr = self.operand(ptr);
                let chain = self.chain;
                let n = self.push(SdKind::Load, result_ty, [chain, addr]);
                self.pending_loads.push(n);
                self.define(inst, n);
                None
            }
            InstructionData::Store { value, ptr } => {
                let v = self.operand(value);
                let addr = self.operand(ptr);
                let chain = self.barrier();
                let n = self.push(SdKind::Store, types::VOID, [chain, v, addr]);
                self.chain = n;
                None
            }
            InstructionData::Call { func: callee, args } => {
                let mut ops = vec![self.barrier()];
                for &arg in &args {
                    ops.push(self.operand(arg));
                }
                let n = self.push(SdKind::Call(callee), result_ty, ops);
                self.chain = n;
                self.define(inst, n);
                None
            }
            InstructionData::Phi { .. } => {
                // φs execute on the edges; readers see the φ's register.
                let result = self.func.dfg.inst_result(inst).unwrap();
                let r = self.ctx.vreg_of(self.mfunc, self.func, result);
                let ty = self.func.dfg.value_type(result);
                let n = self.push(SdKind::VReg(r), ty, []);
                self.value_node.insert(result, n);
                None
            }
            InstructionData::Jump { dest } => {
                let chain = self.barrier();
                Some(self.push(SdKind::Br(dest), types::VOID, [chain]))
            }
            InstructionData::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                let c = self.operand(cond);
                let chain = self.barrier();
                Some(self.push(SdKind::BrCond(then_dest, else_dest), types::VOID, [chain, c]))
            }
            InstructionData::Return { value } => {
                let mut ops = vec![self.barrier()];
                if let Some(v) = value {
                    ops.push(self.operand(v));
                }
                Some(self.push(SdKind::Ret, types::VOID, ops))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Signature;
    use crate::isel::exported_values;
    use types::I32;

    #[test]
    fn loads_chain_through_stores() {
        // load a; store b; load c — the store must merge the first load
        // into the chain, and the second load hangs off the store.
        let mut func = Function::with_name_signature("f", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 1);
        let a = func.load(b0, I32, slot);
        func.store(b0, Operand::Imm32(1), slot);
        let c = func.load(b0, I32, slot);
        let s = func.binary(b0, Opcode::Iadd, I32, a, c);
        func.ret(b0, Some(Operand::Value(s)));

        let mut mfunc = MachineFunction::new("f", Signature::new(vec![], I32));
        mfunc.add_block();
        let mut ctx = FuncLowering::default();
        ctx.collect_allocas(&mut mfunc, &func);
        let exported = exported_values(&func);
        let dag = SelectionDag::build(&func, b0, &mut ctx, &mut mfunc, &exported);

        // Find the store; its chain arg must be a token factor over the
        // entry token and the first load.
        let store = dag
            .nodes
            .keys()
            .find(|&n| matches!(dag.nodes[n].kind, SdKind::Store))
            .unwrap();
        let chain = dag.nodes[store].args[0];
        assert!(matches!(dag.nodes[chain].kind, SdKind::TokenFactor));
        assert!(dag.nodes[chain]
            .args
            .iter()
            .any(|&a| matches!(dag.nodes[a].kind, SdKind::Load)));

        // The second load chains off the store.
        let second_load = dag
            .nodes
            .keys()
            .filter(|&n| matches!(dag.nodes[n].kind, SdKind::Load))
            .last()
            .unwrap();
        assert_eq!(dag.nodes[second_load].args[0], store);
    }

    #[test]
    fn cross_block_values_become_vregs() {
        let mut func = Function::with_name_signature("g", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let x = func.binary(b0, Opcode::Iadd, I32, func.params[0], Operand::Imm32(1));
        func.jump(b0, b1);
        let y = func.binary(b1, Opcode::Imul, I32, x, x);
        func.ret(b1, Some(Operand::Value(y)));

        let mut mfunc = MachineFunction::new("g", Signature::new(vec![I32], I32));
        mfunc.add_block();
        let mut ctx = FuncLowering::default();
        let exported = exported_values(&func);
        assert!(exported.contains(&x));

        let dag0 = SelectionDag::build(&func, b0, &mut ctx, &mut mfunc, &exported);
        assert_eq!(dag0.exports.len(), 1);

        let dag1 = SelectionDag::build(&func, b1, &mut ctx, &mut mfunc, &exported);
        // In b1, x reads as a VReg leaf.
        assert!(dag1
            .nodes
            .values()
            .any(|n| matches!(n.kind, SdKind::VReg(_))));
        assert!(dag1.exports.is_empty());
    }
}
