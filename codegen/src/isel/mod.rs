//! Instruction selection support shared by all targets.
//!
//! Selection works block by block over a [`dag::SelectionDag`], but some
//! state must span the whole function: the map from IR values to machine
//! virtual registers (φ-nodes read values across block boundaries) and the
//! map from stack allocations to frame indexes (collected in a pre-pass,
//! shared by every block). [`FuncLowering`] carries both.

pub mod dag;
pub mod schedule;

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Function, InstructionData, Value};
use crate::mir::{FrameIdx, MachineFunction, Reg};

/// Function-scoped lowering state.
#[derive(Default)]
pub struct FuncLowering {
    /// IR value → machine virtual register, shared across blocks.
    pub vregs: FxHashMap<Value, Reg>,
    /// Stack-allocation result → frame index.
    pub frame_index: FxHashMap<Value, FrameIdx>,
}

impl FuncLowering {
    /// The virtual register holding `value`, created on first request.
    pub fn vreg_of(&mut self, mfunc: &mut MachineFunction, func: &Function, value: Value) -> Reg {
        if let Some(&r) = self.vregs.get(&value) {
            return r;
        }
        let r = mfunc.new_vreg(func.dfg.value_type(value));
        self.vregs.insert(value, r);
        r
    }

    /// Populate the frame-index map from the allocas of `func`.
    pub fn collect_allocas(&mut self, mfunc: &mut MachineFunction, func: &Function) {
        for block in func.layout.blocks() {
            for &inst in func.block_insts(block) {
                if let InstructionData::StackAlloc { ty, elems } = func.dfg[inst] {
                    let size = ty.bytes() * elems;
                    let fi = mfunc.frame.make_local_slot(size, ty.bytes());
                    let result = func.dfg.inst_result(inst).unwrap();
                    self.frame_index.insert(result, fi);
                }
            }
        }
    }
}

/// Values whose computation must leave their defining block in a register:
/// used from another block or from any φ-node.
pub fn exported_values(func: &Function) -> FxHashSet<Value> {
    let mut def_block: FxHashMap<Value, crate::ir::Block> = FxHashMap::default();
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            if let Some(r) = func.dfg.inst_result(inst) {
                def_block.insert(r, block);
            }
        }
    }

    let mut exported = FxHashSet::default();
    for block in func.layout.blocks() {
        for &inst in func.block_insts(block) {
            let is_phi = func.dfg[inst].is_phi();
            for op in func.dfg[inst].arguments() {
                if let Some(v) = op.as_value() {
                    match def_block.get(&v) {
                        Some(&db) if db == block && !is_phi => {}
                        Some(_) => {
                            exported.insert(v);
                        }
                        None => {}
                    }
                }
            }
        }
    }
    exported
}
