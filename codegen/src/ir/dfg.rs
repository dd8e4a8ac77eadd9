//! Data flow graph tracking instructions and values.
//!
//! The `DataFlowGraph` owns the arenas for instructions and SSA values and
//! records, for every value, its unique definition. It knows nothing about
//! block membership or ordering; that is the function's layout.

use crate::ir::entities::{Inst, Value};
use crate::ir::instructions::InstructionData;
use crate::ir::types::Type;
use carve_entity::packed_option::PackedOption;
use carve_entity::{PrimaryMap, SecondaryMap};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Where a value comes from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ValueDef {
    /// The result of an instruction.
    Inst(Inst),
    /// Function parameter number `n`, defined at the entry.
    Param(usize),
}

impl ValueDef {
    /// The defining instruction, if the value is an instruction result.
    pub fn inst(self) -> Option<Inst> {
        match self {
            Self::Inst(inst) => Some(inst),
            Self::Param(_) => None,
        }
    }
}

/// Internal table entry for a value.
#[derive(Clone, Debug)]
struct ValueData {
    ty: Type,
    def: ValueDef,
}

/// A data flow graph.
#[derive(Clone, Default)]
pub struct DataFlowGraph {
    insts: PrimaryMap<Inst, InstructionData>,
    results: SecondaryMap<Inst, PackedOption<Value>>,
    values: PrimaryMap<Value, ValueData>,
}

impl DataFlowGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an instruction. It belongs to no block until the caller
    /// inserts it somewhere.
    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        self.insts.push(data)
    }

    /// Allocate and attach the result value of `inst`, of type `ty`.
    ///
    /// Producing instructions have exactly one result.
    pub fn attach_result(&mut self, inst: Inst, ty: Type) -> Value {
        debug_assert!(
            self.results[inst].is_none(),
            "{inst} already has a result attached"
        );
        let value = self.values.push(ValueData {
            ty,
            def: ValueDef::Inst(inst),
        });
        self.results[inst] = value.into();
        value
    }

    /// Allocate a value defined as parameter `index`.
    pub fn make_param(&mut self, ty: Type, index: usize) -> Value {
        self.values.push(ValueData {
            ty,
            def: ValueDef::Param(index),
        })
    }

    /// The result value of `inst`, if it produces one.
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst].expand()
    }

    /// The unique definition of `value`.
    pub fn value_def(&self, value: Value) -> ValueDef {
        self.values[value].def
    }

    /// The type of `value`.
    pub fn value_type(&self, value: Value) -> Type {
        self.values[value].ty
    }

    /// Total number of values allocated, for sizing side tables.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Total number of instructions allocated.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Iterate over every allocated instruction id. Note that this includes
    /// instructions that have been unlinked from their block.
    pub fn insts(&self) -> impl Iterator<Item = Inst> + '_ {
        self.insts.keys()
    }

    /// A printable form of `inst`, e.g. `v3 = iadd v1, v2`.
    pub fn display_inst(&self, inst: Inst) -> DisplayInst {
        DisplayInst { dfg: self, inst }
    }
}

impl Index<Inst> for DataFlowGraph {
    type Output = InstructionData;

    fn index(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }
}

impl IndexMut<Inst> for DataFlowGraph {
    fn index_mut(&mut self, inst: Inst) -> &mut InstructionData {
        &mut self.insts[inst]
    }
}

/// Wrapper implementing `Display` for a single instruction.
pub struct DisplayInst<'a> {
    dfg: &'a DataFlowGraph,
    inst: Inst,
}

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use crate::ir::instructions::InstructionData as D;
        let data = &self.dfg[self.inst];
        if let Some(result) = self.dfg.inst_result(self.inst) {
            write!(f, "{result} = ")?;
        }
        match data {
            D::IntCompare { cond, .. } => write!(f, "icmp {cond}")?,
            D::FloatCompare { cond, .. } => write!(f, "fcmp {cond}")?,
            D::StackAlloc { ty, elems } => return write!(f, "alloca {ty} x {elems}"),
            D::Jump { dest } => return write!(f, "jump {dest}"),
            D::Branch {
                cond,
                then_dest,
                else_dest,
            } => return write!(f, "br {cond}, {then_dest}, {else_dest}"),
            D::Call { func, .. } => write!(f, "call {func}")?,
            D::Phi { args } => {
                write!(f, "phi")?;
                for (i, (block, op)) in args.iter().enumerate() {
                    let sep = if i == 0 { ' ' } else { ',' };
                    write!(f, "{sep}[{block}: {op}]")?;
                }
                return Ok(());
            }
            other => write!(f, "{}", other.opcode())?,
        }
        for (i, arg) in data.arguments().iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{sep}{arg}")?;
        }
        Ok(())
    }
}
