//! Instruction formats and opcodes.
//!
//! The representation of instructions is the `InstructionData` enum: a sum
//! over every instruction format, matched exhaustively wherever the
//! compiler inspects code. Where the queries below return values (operand
//! lists, branch targets, side-effect flags), passes use them instead of
//! matching formats themselves.

use crate::ir::condcodes::{FloatCC, IntCC};
use crate::ir::entities::{Block, FuncRef, GlobalVar, Value};
use crate::ir::immediates::Ieee32;
use crate::ir::types::Type;
use smallvec::SmallVec;
use std::fmt;

/// An instruction operand.
///
/// Operands are small `Copy` values, not owned graph nodes: an SSA register
/// is referenced by its `Value` id, and constants are carried inline. After
/// constant propagation a register use may simply be replaced by an
/// immediate in place.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Operand {
    /// An SSA register.
    Value(Value),
    /// A 32-bit integer immediate.
    Imm32(i32),
    /// A 64-bit integer immediate.
    Imm64(i64),
    /// A 32-bit float immediate.
    Fimm32(Ieee32),
    /// The address of a global variable.
    Global(GlobalVar),
}

impl Operand {
    /// The referenced SSA value, if this operand is a register.
    pub fn as_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Is this operand a constant immediate?
    pub fn is_const(self) -> bool {
        matches!(self, Self::Imm32(_) | Self::Imm64(_) | Self::Fimm32(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Imm32(x) => write!(f, "{x}"),
            Self::Imm64(x) => write!(f, "{x}"),
            Self::Fimm32(x) => write!(f, "{x}"),
            Self::Global(g) => write!(f, "{g}"),
        }
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

/// An instruction opcode, independent of the operands.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Opcode {
    /// Integer add.
    Iadd,
    /// Integer subtract.
    Isub,
    /// Integer multiply.
    Imul,
    /// Signed integer divide.
    Idiv,
    /// Signed integer remainder.
    Imod,
    /// Shift left.
    Shl,
    /// Arithmetic shift right.
    Ashr,
    /// Logical shift right.
    Lshr,
    /// Bitwise and.
    Band,
    /// Bitwise or.
    Bor,
    /// Bitwise xor.
    Bxor,
    /// Float add.
    Fadd,
    /// Float subtract.
    Fsub,
    /// Float multiply.
    Fmul,
    /// Float divide.
    Fdiv,
    /// Integer compare producing 0 or 1.
    Icmp,
    /// Float compare producing 0 or 1.
    Fcmp,
    /// Zero-extend a narrow integer.
    Zext,
    /// Signed integer to float.
    Sitofp,
    /// Float to signed integer.
    Fptosi,
    /// Read memory.
    Load,
    /// Write memory.
    Store,
    /// Reserve a stack slot, producing its address.
    StackAlloc,
    /// Compute the address of an array element.
    ElemAddr,
    /// Unconditional jump.
    Jump,
    /// Two-way conditional branch.
    Branch,
    /// Return from the function.
    Return,
    /// Call a function.
    Call,
    /// SSA φ-node merging one value per predecessor.
    Phi,
}

impl Opcode {
    /// True for instructions that must end a block.
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jump | Self::Branch | Self::Return)
    }

    /// True for control transfers with block targets.
    pub fn is_branch(self) -> bool {
        matches!(self, Self::Jump | Self::Branch)
    }

    /// True for binary opcodes whose operands commute.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Iadd | Self::Imul | Self::Band | Self::Bor | Self::Bxor | Self::Fadd | Self::Fmul
        )
    }

    /// True when the instruction does something besides producing its
    /// result: writes memory, transfers control, or calls.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Self::Store | Self::Call | Self::Return | Self::Jump | Self::Branch
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("{self:?}").to_lowercase();
        f.write_str(&name)
    }
}

/// Operand list of a φ-node: one incoming value per predecessor block.
pub type PhiArgs = SmallVec<[(Block, Operand); 4]>;

/// Argument list of a call.
pub type CallArgs = SmallVec<[Operand; 4]>;

/// Contents of an instruction.
///
/// Every variant carries its opcode implicitly or explicitly plus the typed
/// operand fields of its format. Every producing instruction has exactly
/// one result register, attached in the data flow graph; sinks have none.
#[derive(Clone, PartialEq, Debug)]
pub enum InstructionData {
    /// Arithmetic with two operands, integer or floating.
    Binary {
        /// Which arithmetic operation.
        opcode: Opcode,
        /// Left and right operands.
        args: [Operand; 2],
    },
    /// Conversions: `zext`, `sitofp`, `fptosi`.
    Unary {
        /// Which conversion.
        opcode: Opcode,
        /// The converted operand.
        arg: Operand,
    },
    /// Integer comparison.
    IntCompare {
        /// Predicate to evaluate.
        cond: IntCC,
        /// Left and right operands.
        args: [Operand; 2],
    },
    /// Float comparison.
    FloatCompare {
        /// Predicate to evaluate.
        cond: FloatCC,
        /// Left and right operands.
        args: [Operand; 2],
    },
    /// Read the value at `ptr`.
    Load {
        /// Address to read from.
        ptr: Operand,
    },
    /// Write `value` to `ptr`.
    Store {
        /// Value to write.
        value: Operand,
        /// Address to write to.
        ptr: Operand,
    },
    /// Reserve `elems` elements of `ty` on the stack; the result is the
    /// slot address.
    StackAlloc {
        /// Element type.
        ty: Type,
        /// Number of elements; 1 for scalars.
        elems: u32,
    },
    /// Address of element `index` in the array starting at `base`.
    ElemAddr {
        /// Array base address.
        base: Operand,
        /// Element index.
        index: Operand,
        /// Element type, determining the stride.
        elem_ty: Type,
    },
    /// Unconditional jump.
    Jump {
        /// Where to go.
        dest: Block,
    },
    /// Conditional branch on a non-zero condition.
    Branch {
        /// Branch condition; taken when non-zero.
        cond: Operand,
        /// Destination when the condition is non-zero.
        then_dest: Block,
        /// Destination when the condition is zero.
        else_dest: Block,
    },
    /// Return, with a value unless the function is void.
    Return {
        /// The returned value, if any.
        value: Option<Operand>,
    },
    /// Direct call.
    Call {
        /// The callee.
        func: FuncRef,
        /// Actual arguments.
        args: CallArgs,
    },
    /// φ-node. Incoming entries cover exactly the predecessors of the
    /// containing block.
    Phi {
        /// `(predecessor, value)` pairs.
        args: PhiArgs,
    },
}

impl InstructionData {
    /// The opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Binary { opcode, .. } | Self::Unary { opcode, .. } => *opcode,
            Self::IntCompare { .. } => Opcode::Icmp,
            Self::FloatCompare { .. } => Opcode::Fcmp,
            Self::Load { .. } => Opcode::Load,
            Self::Store { .. } => Opcode::Store,
            Self::StackAlloc { .. } => Opcode::StackAlloc,
            Self::ElemAddr { .. } => Opcode::ElemAddr,
            Self::Jump { .. } => Opcode::Jump,
            Self::Branch { .. } => Opcode::Branch,
            Self::Return { .. } => Opcode::Return,
            Self::Call { .. } => Opcode::Call,
            Self::Phi { .. } => Opcode::Phi,
        }
    }

    /// Collect the operands of this instruction, φ-incomings included.
    pub fn arguments(&self) -> CallArgs {
        let mut out = CallArgs::new();
        match self {
            Self::Binary { args, .. }
            | Self::IntCompare { args, .. }
            | Self::FloatCompare { args, .. } => out.extend_from_slice(args),
            Self::Unary { arg, .. } => out.push(*arg),
            Self::Load { ptr } => out.push(*ptr),
            Self::Store { value, ptr } => {
                out.push(*value);
                out.push(*ptr);
            }
            Self::StackAlloc { .. } => {}
            Self::ElemAddr { base, index, .. } => {
                out.push(*base);
                out.push(*index);
            }
            Self::Jump { .. } => {}
            Self::Branch { cond, .. } => out.push(*cond),
            Self::Return { value } => out.extend(value.iter().copied()),
            Self::Call { args, .. } => out.extend_from_slice(args),
            Self::Phi { args } => out.extend(args.iter().map(|(_, op)| *op)),
        }
        out
    }

    /// Rewrite every operand through `f`, φ-incomings included.
    pub fn map_arguments(&mut self, mut f: impl FnMut(Operand) -> Operand) {
        match self {
            Self::Binary { args, .. }
            | Self::IntCompare { args, .. }
            | Self::FloatCompare { args, .. } => {
                for a in args.iter_mut() {
                    *a = f(*a);
                }
            }
            Self::Unary { arg, .. } => *arg = f(*arg),
            Self::Load { ptr } => *ptr = f(*ptr),
            Self::Store { value, ptr } => {
                *value = f(*value);
                *ptr = f(*ptr);
            }
            Self::StackAlloc { .. } => {}
            Self::ElemAddr { base, index, .. } => {
                *base = f(*base);
                *index = f(*index);
            }
            Self::Jump { .. } => {}
            Self::Branch { cond, .. } => *cond = f(*cond),
            Self::Return { value } => {
                if let Some(v) = value {
                    *v = f(*v);
                }
            }
            Self::Call { args, .. } => {
                for a in args.iter_mut() {
                    *a = f(*a);
                }
            }
            Self::Phi { args } => {
                for (_, op) in args.iter_mut() {
                    *op = f(*op);
                }
            }
        }
    }

    /// The block targets of a branch, in then/else order. Empty for
    /// non-branches.
    pub fn branch_targets(&self) -> SmallVec<[Block; 2]> {
        match self {
            Self::Jump { dest } => SmallVec::from_slice(&[*dest]),
            Self::Branch {
                then_dest,
                else_dest,
                ..
            } => SmallVec::from_slice(&[*then_dest, *else_dest]),
            _ => SmallVec::new(),
        }
    }

    /// Rewrite the block targets of a branch through `f`. φ-incoming labels
    /// are not touched; use [`Self::map_phi_labels`] for those.
    pub fn map_branch_targets(&mut self, mut f: impl FnMut(Block) -> Block) {
        match self {
            Self::Jump { dest } => *dest = f(*dest),
            Self::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                *then_dest = f(*then_dest);
                *else_dest = f(*else_dest);
            }
            _ => {}
        }
    }

    /// Rewrite the predecessor labels of a φ-node through `f`.
    pub fn map_phi_labels(&mut self, mut f: impl FnMut(Block) -> Block) {
        if let Self::Phi { args } = self {
            for (pred, _) in args.iter_mut() {
                *pred = f(*pred);
            }
        }
    }

    /// Does this instruction end its block?
    pub fn is_terminator(&self) -> bool {
        self.opcode().is_terminator()
    }

    /// Is this a φ-node?
    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// Side effects beyond producing the result register.
    pub fn has_side_effects(&self) -> bool {
        self.opcode().has_side_effects()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_entity::EntityRef;

    #[test]
    fn arguments_cover_all_formats() {
        let v0 = Value::new(0);
        let v1 = Value::new(1);
        let store = InstructionData::Store {
            value: Operand::Value(v0),
            ptr: Operand::Value(v1),
        };
        assert_eq!(store.arguments().len(), 2);
        assert!(store.has_side_effects());
        assert!(!store.is_terminator());

        let br = InstructionData::Branch {
            cond: Operand::Value(v0),
            then_dest: Block::new(1),
            else_dest: Block::new(2),
        };
        assert_eq!(br.branch_targets().len(), 2);
        assert!(br.is_terminator());

        let mut phi = InstructionData::Phi {
            args: PhiArgs::from_slice(&[
                (Block::new(0), Operand::Value(v0)),
                (Block::new(1), Operand::Imm32(3)),
            ]),
        };
        assert_eq!(phi.arguments().len(), 2);
        phi.map_phi_labels(|b| Block::new(b.index() + 10));
        match &phi {
            InstructionData::Phi { args } => {
                assert_eq!(args[0].0, Block::new(10));
                assert_eq!(args[1].0, Block::new(11));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn map_arguments_rewrites_in_place() {
        let v0 = Value::new(0);
        let mut add = InstructionData::Binary {
            opcode: Opcode::Iadd,
            args: [Operand::Value(v0), Operand::Value(v0)],
        };
        add.map_arguments(|op| match op {
            Operand::Value(_) => Operand::Imm32(7),
            other => other,
        });
        assert_eq!(add.arguments()[0], Operand::Imm32(7));
        assert_eq!(add.arguments()[1], Operand::Imm32(7));
    }
}
