//! Common subexpression elimination.
//!
//! Two stages over the pure candidate instructions (arithmetic, compares,
//! element addresses, conversions): a block-local sweep, then a global
//! sweep over the dominator tree where an earlier definition replaces any
//! computation it dominates. Expression keys canonicalize commutative
//! operand order and swap comparison predicates accordingly, so `a + b`
//! matches `b + a` and `a < b` matches `b > a`.
//!
//! Loads, stores, calls, allocas, and φ-nodes are never candidates. The
//! pass only redirects uses; the dead duplicates are left for DCE.

use crate::dominance::DominatorTree;
use crate::fx::FxHashMap;
use crate::ir::{
    Block, CondCode, FloatCC, Function, Inst, InstructionData, IntCC, Opcode, Operand, Type, Value,
};
use crate::opt::replace_value_uses;

/// Canonical key of a pure expression.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum ExprKey {
    Binary {
        opcode: Opcode,
        ty: Type,
        args: [Operand; 2],
    },
    Unary {
        opcode: Opcode,
        ty: Type,
        arg: Operand,
    },
    IntCmp {
        cond: IntCC,
        args: [Operand; 2],
    },
    FloatCmp {
        cond: FloatCC,
        args: [Operand; 2],
    },
    Elem {
        base: Operand,
        index: Operand,
        ty: Type,
    },
}

/// Build the canonical key of `inst` if it is a CSE candidate with a
/// result.
fn expr_key(func: &Function, inst: Inst) -> Option<(ExprKey, Value)> {
    let result = func.dfg.inst_result(inst)?;
    let key = match &func.dfg[inst] {
        InstructionData::Binary { opcode, args } => {
            let mut args = *args;
            if opcode.is_commutative() && args[1] < args[0] {
                args.swap(0, 1);
            }
            ExprKey::Binary {
                opcode: *opcode,
                ty: func.dfg.value_type(result),
                args,
            }
        }
        InstructionData::Unary { opcode, arg } => ExprKey::Unary {
            opcode: *opcode,
            ty: func.dfg.value_type(result),
            arg: *arg,
        },
        InstructionData::IntCompare { cond, args } => {
            let (cond, args) = if args[1] < args[0] {
                (cond.swap_args(), [args[1], args[0]])
            } else {
                (*cond, *args)
            };
            ExprKey::IntCmp { cond, args }
        }
        InstructionData::FloatCompare { cond, args } => {
            let (cond, args) = if args[1] < args[0] {
                (cond.swap_args(), [args[1], args[0]])
            } else {
                (*cond, *args)
            };
            ExprKey::FloatCmp { cond, args }
        }
        InstructionData::ElemAddr {
            base,
            index,
            elem_ty,
        } => ExprKey::Elem {
            base: *base,
            index: *index,
            ty: *elem_ty,
        },
        _ => return None,
    };
    Some((key, result))
}

/// Perform CSE on `func`. Returns whether any use was redirected.
pub fn do_cse(func: &mut Function, domtree: &DominatorTree) -> bool {
    let mut changed = run_block_local(func);
    changed |= run_dominator_global(func, domtree);
    changed
}

/// Stage 1: dedupe within each block.
fn run_block_local(func: &mut Function) -> bool {
    let mut changed = false;
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for block in blocks {
        let mut seen: FxHashMap<ExprKey, Value> = FxHashMap::default();
        for i in 0..func.block_insts(block).len() {
            let inst = func.block_insts(block)[i];
            let Some((key, result)) = expr_key(func, inst) else {
                continue;
            };
            match seen.get(&key) {
                Some(&prior) => {
                    log::trace!(
                        "{}: cse redirects {result} to {prior}",
                        func.name
                    );
                    replace_value_uses(func, result, Operand::Value(prior));
                    changed = true;
                }
                None => {
                    seen.insert(key, result);
                }
            }
        }
    }
    changed
}

/// Stage 2: dedupe across blocks where the prior definition dominates the
/// later one, via a scoped table over a dominator tree walk.
fn run_dominator_global(func: &mut Function, domtree: &DominatorTree) -> bool {
    let mut changed = false;
    let mut table: FxHashMap<ExprKey, Value> = FxHashMap::default();

    enum Walk {
        Enter(Block),
        Leave(Vec<ExprKey>),
    }
    let mut stack = vec![Walk::Enter(func.entry_block())];
    while let Some(step) = stack.pop() {
        match step {
            Walk::Enter(block) => {
                let mut inserted = Vec::new();
                for i in 0..func.block_insts(block).len() {
                    let inst = func.block_insts(block)[i];
                    let Some((key, result)) = expr_key(func, inst) else {
                        continue;
                    };
                    match table.get(&key) {
                        Some(&prior) if prior != result => {
                            replace_value_uses(func, result, Operand::Value(prior));
                            changed = true;
                        }
                        Some(_) => {}
                        None => {
                            table.insert(key.clone(), result);
                            inserted.push(key);
                        }
                    }
                }
                stack.push(Walk::Leave(inserted));
                for child in domtree.children(block) {
                    stack.push(Walk::Enter(child));
                }
            }
            Walk::Leave(inserted) => {
                for key in inserted {
                    table.remove(&key);
                }
            }
        }
    }
    changed
}
