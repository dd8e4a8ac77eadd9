//! Intermediate representation of a function.
//!
//! The `Function` struct owns all of its basic blocks and instructions:
//! the data flow graph holds the instruction and value arenas, the block
//! arena holds per-block instruction sequences, and the layout orders the
//! live blocks. Convenience constructors for each instruction format are
//! provided for the IR builder and for tests.

use crate::ir::condcodes::{FloatCC, IntCC};
use crate::ir::dfg::DataFlowGraph;
use crate::ir::entities::{Block, FuncRef, Inst, Value};
use crate::ir::instructions::{CallArgs, InstructionData, Opcode, Operand, PhiArgs};
use crate::ir::layout::Layout;
use crate::ir::types::{self, Type};
use crate::ir::SourceLoc;
use carve_entity::packed_option::PackedOption;
use carve_entity::{PrimaryMap, SecondaryMap};
use smallvec::SmallVec;
use std::fmt;

/// Function signature: parameter types and return type.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature {
    /// Parameter types, in order.
    pub params: Vec<Type>,
    /// Return type; `types::VOID` for none.
    pub ret: Type,
}

impl Signature {
    /// Create a signature.
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }
}

/// A basic block: an ordered instruction sequence ending in a terminator.
/// φ-instructions, if any, precede all others.
#[derive(Clone, Default)]
pub struct BlockData {
    insts: Vec<Inst>,
}

impl BlockData {
    /// The instructions of this block, in order.
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }
}

/// A function.
///
/// Functions can be cloned (inlining does), which keeps all entity numbers
/// of the original.
#[derive(Clone)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Signature of this function.
    pub signature: Signature,
    /// Parameter values, pre-defined at the entry.
    pub params: Vec<Value>,
    /// Instruction and value arenas.
    pub dfg: DataFlowGraph,
    /// Block arena. Membership in the program is decided by `layout`.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Order of live blocks; the first is the entry.
    pub layout: Layout,
    /// Source position of each instruction, for assembly comments.
    pub srclocs: SecondaryMap<Inst, SourceLoc>,
    /// Loop header installed by tail-call elimination, if any.
    pub loop_header: PackedOption<Block>,
    /// The block jumping into `loop_header`, if any.
    pub loop_preentry: PackedOption<Block>,
}

impl Function {
    /// Create a function with the given name and signature. The entry block
    /// and parameter values are created eagerly.
    pub fn with_name_signature(name: impl Into<String>, signature: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let params = signature
            .params
            .iter()
            .enumerate()
            .map(|(i, &ty)| dfg.make_param(ty, i))
            .collect();
        let mut func = Self {
            name: name.into(),
            signature,
            params,
            dfg,
            blocks: PrimaryMap::new(),
            layout: Layout::new(),
            srclocs: SecondaryMap::new(),
            loop_header: None.into(),
            loop_preentry: None.into(),
        };
        func.add_block();
        func
    }

    /// The entry block.
    pub fn entry_block(&self) -> Block {
        self.layout.entry_block().expect("function has no blocks")
    }

    /// Allocate a block without adding it to the layout.
    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Allocate a block and append it to the layout.
    pub fn add_block(&mut self) -> Block {
        let block = self.make_block();
        self.layout.append_block(block);
        block
    }

    /// The instructions of `block`.
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    /// The terminator of `block`, which must not be empty.
    pub fn terminator(&self, block: Block) -> Inst {
        *self.blocks[block]
            .insts
            .last()
            .unwrap_or_else(|| panic!("{block} has no terminator"))
    }

    /// The successors of `block`, read off its terminator.
    pub fn successors(&self, block: Block) -> SmallVec<[Block; 2]> {
        self.dfg[self.terminator(block)].branch_targets()
    }

    /// The leading φ-instructions of `block`.
    pub fn phis(&self, block: Block) -> &[Inst] {
        let insts = &self.blocks[block].insts;
        let end = insts
            .iter()
            .position(|&i| !self.dfg[i].is_phi())
            .unwrap_or(insts.len());
        &insts[..end]
    }

    /// Append an already-allocated instruction to `block`.
    pub fn append_inst(&mut self, block: Block, inst: Inst) {
        self.blocks[block].insts.push(inst);
    }

    /// Insert an already-allocated instruction at `index` within `block`.
    pub fn insert_inst(&mut self, block: Block, index: usize, inst: Inst) {
        self.blocks[block].insts.insert(index, inst);
    }

    /// Unlink `inst` from `block`. The instruction stays in the arena; it
    /// just no longer executes.
    pub fn remove_inst(&mut self, block: Block, inst: Inst) {
        self.blocks[block].insts.retain(|&i| i != inst);
    }

    /// Replace the whole instruction sequence of `block`.
    pub fn set_block_insts(&mut self, block: Block, insts: Vec<Inst>) {
        self.blocks[block].insts = insts;
    }

    /// The block containing `inst`, scanning the layout.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.layout
            .blocks()
            .find(|&b| self.blocks[b].insts.contains(&inst))
    }

    fn build(&mut self, block: Block, data: InstructionData, ty: Type) -> (Inst, Option<Value>) {
        let inst = self.dfg.make_inst(data);
        let result = if ty == types::VOID {
            None
        } else {
            Some(self.dfg.attach_result(inst, ty))
        };
        self.append_inst(block, inst);
        (inst, result)
    }

    /// Append a binary arithmetic instruction.
    pub fn binary(
        &mut self,
        block: Block,
        opcode: Opcode,
        ty: Type,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Value {
        let data = InstructionData::Binary {
            opcode,
            args: [lhs.into(), rhs.into()],
        };
        self.build(block, data, ty).1.unwrap()
    }

    /// Append a conversion instruction.
    pub fn unary(
        &mut self,
        block: Block,
        opcode: Opcode,
        ty: Type,
        arg: impl Into<Operand>,
    ) -> Value {
        let data = InstructionData::Unary {
            opcode,
            arg: arg.into(),
        };
        self.build(block, data, ty).1.unwrap()
    }

    /// Append an integer compare producing an `i32` truth value.
    pub fn icmp(
        &mut self,
        block: Block,
        cond: IntCC,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Value {
        let data = InstructionData::IntCompare {
            cond,
            args: [lhs.into(), rhs.into()],
        };
        self.build(block, data, types::I32).1.unwrap()
    }

    /// Append a float compare producing an `i32` truth value.
    pub fn fcmp(
        &mut self,
        block: Block,
        cond: FloatCC,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Value {
        let data = InstructionData::FloatCompare {
            cond,
            args: [lhs.into(), rhs.into()],
        };
        self.build(block, data, types::I32).1.unwrap()
    }

    /// Append a load of type `ty` from `ptr`.
    pub fn load(&mut self, block: Block, ty: Type, ptr: impl Into<Operand>) -> Value {
        let data = InstructionData::Load { ptr: ptr.into() };
        self.build(block, data, ty).1.unwrap()
    }

    /// Append a store of `value` to `ptr`.
    pub fn store(&mut self, block: Block, value: impl Into<Operand>, ptr: impl Into<Operand>) {
        let data = InstructionData::Store {
            value: value.into(),
            ptr: ptr.into(),
        };
        self.build(block, data, types::VOID);
    }

    /// Append a stack allocation of `elems` elements of `ty`; the result is
    /// the slot address.
    pub fn stack_alloc(&mut self, block: Block, ty: Type, elems: u32) -> Value {
        let data = InstructionData::StackAlloc { ty, elems };
        self.build(block, data, types::PTR).1.unwrap()
    }

    /// Append an element-address computation.
    pub fn elem_addr(
        &mut self,
        block: Block,
        base: impl Into<Operand>,
        index: impl Into<Operand>,
        elem_ty: Type,
    ) -> Value {
        let data = InstructionData::ElemAddr {
            base: base.into(),
            index: index.into(),
            elem_ty,
        };
        self.build(block, data, types::PTR).1.unwrap()
    }

    /// Append an unconditional jump.
    pub fn jump(&mut self, block: Block, dest: Block) -> Inst {
        self.build(block, InstructionData::Jump { dest }, types::VOID).0
    }

    /// Append a conditional branch.
    pub fn branch(
        &mut self,
        block: Block,
        cond: impl Into<Operand>,
        then_dest: Block,
        else_dest: Block,
    ) -> Inst {
        let data = InstructionData::Branch {
            cond: cond.into(),
            then_dest,
            else_dest,
        };
        self.build(block, data, types::VOID).0
    }

    /// Append a return.
    pub fn ret(&mut self, block: Block, value: Option<Operand>) -> Inst {
        self.build(block, InstructionData::Return { value }, types::VOID)
            .0
    }

    /// Append a call. Returns the result value unless `ret_ty` is void.
    pub fn call(
        &mut self,
        block: Block,
        func: FuncRef,
        args: impl IntoIterator<Item = Operand>,
        ret_ty: Type,
    ) -> Option<Value> {
        let data = InstructionData::Call {
            func,
            args: CallArgs::from_iter(args),
        };
        self.build(block, data, ret_ty).1
    }

    /// Insert a φ-node after the existing φ-run of `block`.
    pub fn phi(
        &mut self,
        block: Block,
        ty: Type,
        args: impl IntoIterator<Item = (Block, Operand)>,
    ) -> Value {
        let inst = self.dfg.make_inst(InstructionData::Phi {
            args: PhiArgs::from_iter(args),
        });
        let value = self.dfg.attach_result(inst, ty);
        let at = self.phis(block).len();
        self.insert_inst(block, at, inst);
        value
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "function {}(", self.name)?;
        for (i, (&v, &ty)) in self.params.iter().zip(&self.signature.params).enumerate() {
            let sep = if i == 0 { "" } else { ", " };
            write!(f, "{sep}{v}: {ty}")?;
        }
        writeln!(f, ") -> {} {{", self.signature.ret)?;
        for block in self.layout.blocks() {
            writeln!(f, "{block}:")?;
            for &inst in self.block_insts(block) {
                writeln!(f, "    {}", self.dfg.display_inst(inst))?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::I32;

    #[test]
    fn build_simple_function() {
        let mut func =
            Function::with_name_signature("double", Signature::new(vec![I32], I32));
        let entry = func.entry_block();
        let a = func.params[0];
        let sum = func.binary(entry, Opcode::Iadd, I32, a, a);
        func.ret(entry, Some(Operand::Value(sum)));

        assert_eq!(func.block_insts(entry).len(), 2);
        assert_eq!(func.successors(entry).len(), 0);
        let term = func.terminator(entry);
        assert!(func.dfg[term].is_terminator());
        assert_eq!(func.inst_block(term), Some(entry));
    }

    #[test]
    fn phi_insertion_keeps_phis_first() {
        let mut func = Function::with_name_signature("p", Signature::new(vec![I32], I32));
        let entry = func.entry_block();
        let other = func.add_block();
        let a = func.params[0];
        func.jump(entry, other);
        let phi1 = func.phi(other, I32, [(entry, Operand::Value(a))]);
        func.ret(other, Some(Operand::Value(phi1)));
        let phi2 = func.phi(other, I32, [(entry, Operand::Imm32(1))]);

        assert_eq!(func.phis(other).len(), 2);
        let _ = phi2;
        // Terminator still last.
        let term = func.terminator(other);
        assert!(func.dfg[term].is_terminator());
    }
}
