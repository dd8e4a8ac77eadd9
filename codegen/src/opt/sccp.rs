//! Sparse conditional constant propagation.
//!
//! Runs the classic two-worklist algorithm over the three-point lattice
//! `UNDEF ⊑ CONST(v) ⊑ OVERDEFINED`: block reachability and edge
//! reachability propagate together with value facts, so code behind a
//! statically-false branch contributes nothing. φ-nodes meet only over
//! incoming edges proven reachable. After the fixpoint, constant register
//! uses are replaced with immediates and branches with constant conditions
//! fold to jumps.

use crate::flowgraph::ControlFlowGraph;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{
    types, Block, Function, Ieee32, Inst, InstructionData, Opcode, Operand, Type, Value,
};
use crate::opt::prune_phi_incomings;
use carve_entity::EntitySet;
use std::collections::VecDeque;

/// A lattice fact about one SSA value.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Lattice {
    /// No evidence yet; optimistically assumed constant.
    Undef,
    /// Known to be this immediate on every execution.
    Const(Operand),
    /// Shown to vary.
    Over,
}

impl Lattice {
    fn meet(self, other: Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Undef, x) | (x, Lattice::Undef) => x,
            (Lattice::Over, _) | (_, Lattice::Over) => Lattice::Over,
            (Lattice::Const(a), Lattice::Const(b)) => {
                if a == b {
                    Lattice::Const(a)
                } else {
                    Lattice::Over
                }
            }
        }
    }
}

struct Solver<'a> {
    func: &'a Function,
    values: FxHashMap<Value, Lattice>,
    reachable_blocks: EntitySet<Block>,
    reachable_edges: FxHashSet<(Block, Block)>,
    block_worklist: VecDeque<Block>,
    inst_worklist: VecDeque<Inst>,
    users: FxHashMap<Value, Vec<Inst>>,
    inst_block: FxHashMap<Inst, Block>,
}

/// Perform SCCP on `func`. Returns whether anything was rewritten.
pub fn do_sccp(func: &mut Function) -> bool {
    let mut solver = Solver::new(func);
    solver.run();
    let values = solver.values;
    let reachable_blocks = solver.reachable_blocks;

    // Rewrite constant uses as immediates.
    let mut changed = false;
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for &block in &blocks {
        if !reachable_blocks.contains(block) {
            continue;
        }
        for i in 0..func.block_insts(block).len() {
            let inst = func.block_insts(block)[i];
            func.dfg[inst].map_arguments(|op| match op {
                Operand::Value(v) => match values.get(&v) {
                    Some(&Lattice::Const(imm)) => {
                        changed = true;
                        imm
                    }
                    _ => op,
                },
                other => other,
            });
        }
    }

    // Fold branches whose condition resolved. An UNDEF condition means the
    // branch is never executed with a computed value; either arm is
    // correct and we take the else edge.
    for &block in &blocks {
        if !reachable_blocks.contains(block) {
            continue;
        }
        let term = func.terminator(block);
        let InstructionData::Branch {
            cond,
            then_dest,
            else_dest,
        } = func.dfg[term]
        else {
            continue;
        };
        let fact = match cond {
            Operand::Value(v) => values.get(&v).copied().unwrap_or(Lattice::Undef),
            imm => Lattice::Const(imm),
        };
        let dest = match fact {
            Lattice::Const(imm) => {
                if const_is_nonzero(imm) {
                    then_dest
                } else {
                    else_dest
                }
            }
            Lattice::Undef => else_dest,
            Lattice::Over => continue,
        };
        log::debug!("{}: folding branch in {block} to {dest}", func.name);
        func.remove_inst(block, term);
        func.jump(block, dest);
        changed = true;
    }

    if changed {
        // Dropped edges invalidate φ-incomings in their former targets.
        let cfg = ControlFlowGraph::with_function(func);
        prune_phi_incomings(func, &cfg);
    }
    changed
}

impl<'a> Solver<'a> {
    fn new(func: &'a Function) -> Self {
        let mut users: FxHashMap<Value, Vec<Inst>> = FxHashMap::default();
        let mut inst_block = FxHashMap::default();
        for block in func.layout.blocks() {
            for &inst in func.block_insts(block) {
                inst_block.insert(inst, block);
                for op in func.dfg[inst].arguments() {
                    if let Some(v) = op.as_value() {
                        users.entry(v).or_default().push(inst);
                    }
                }
            }
        }
        let mut solver = Self {
            func,
            values: FxHashMap::default(),
            reachable_blocks: EntitySet::new(),
            reachable_edges: FxHashSet::default(),
            block_worklist: VecDeque::new(),
            inst_worklist: VecDeque::new(),
            users,
            inst_block,
        };
        // Parameters vary by call site.
        for &p in &func.params {
            solver.values.insert(p, Lattice::Over);
        }
        solver.mark_block(func.entry_block());
        solver
    }

    fn run(&mut self) {
        loop {
            if let Some(block) = self.block_worklist.pop_front() {
                for &inst in self.func.block_insts(block) {
                    self.eval(inst, block);
                }
                continue;
            }
            if let Some(inst) = self.inst_worklist.pop_front() {
                let block = self.inst_block[&inst];
                if self.reachable_blocks.contains(block) {
                    self.eval(inst, block);
                }
                continue;
            }
            break;
        }
    }

    fn mark_block(&mut self, block: Block) {
        if self.reachable_blocks.insert(block) {
            self.block_worklist.push_back(block);
        }
    }

    fn mark_edge(&mut self, from: Block, to: Block) {
        if !self.reachable_edges.insert((from, to)) {
            return;
        }
        if self.reachable_blocks.contains(to) {
            // The block was already evaluated; only its φs can change from
            // one more incoming edge.
            for &phi in self.func.phis(to) {
                self.inst_worklist.push_back(phi);
            }
        } else {
            self.mark_block(to);
        }
    }

    fn fact(&self, op: Operand) -> Lattice {
        match op {
            Operand::Value(v) => self.values.get(&v).copied().unwrap_or(Lattice::Undef),
            Operand::Global(_) => Lattice::Over,
            imm => Lattice::Const(imm),
        }
    }

    fn update(&mut self, value: Value, fact: Lattice) {
        let old = self.values.get(&value).copied().unwrap_or(Lattice::Undef);
        // Facts only descend the lattice.
        let merged = old.meet(fact);
        if merged != old {
            self.values.insert(value, merged);
            if let Some(users) = self.users.get(&value) {
                for &u in users {
                    self.inst_worklist.push_back(u);
                }
            }
        }
    }

    fn eval(&mut self, inst: Inst, block: Block) {
        let data = &self.func.dfg[inst];
        match data {
            InstructionData::Binary { opcode, args } => {
                let fact = self.eval_binary(*opcode, args, inst);
                self.update(self.result(inst), fact);
            }
            InstructionData::Unary { opcode, arg } => {
                let fact = match self.fact(*arg) {
                    Lattice::Const(imm) => eval_unary(*opcode, imm)
                        .map(Lattice::Const)
                        .unwrap_or(Lattice::Over),
                    other => other,
                };
                self.update(self.result(inst), fact);
            }
            InstructionData::IntCompare { cond, args } => {
                let fact = match (self.fact(args[0]), self.fact(args[1])) {
                    (Lattice::Const(a), Lattice::Const(b)) => {
                        match (int_of(a), int_of(b)) {
                            (Some(x), Some(y)) => {
                                Lattice::Const(Operand::Imm32(cond.eval(x, y) as i32))
                            }
                            _ => Lattice::Over,
                        }
                    }
                    (Lattice::Over, _) | (_, Lattice::Over) => Lattice::Over,
                    _ => Lattice::Undef,
                };
                self.update(self.result(inst), fact);
            }
            InstructionData::FloatCompare { cond, args } => {
                let fact = match (self.fact(args[0]), self.fact(args[1])) {
                    (Lattice::Const(a), Lattice::Const(b)) => match (float_of(a), float_of(b)) {
                        (Some(x), Some(y)) => {
                            Lattice::Const(Operand::Imm32(cond.eval(x, y) as i32))
                        }
                        _ => Lattice::Over,
                    },
                    (Lattice::Over, _) | (_, Lattice::Over) => Lattice::Over,
                    _ => Lattice::Undef,
                };
                self.update(self.result(inst), fact);
            }
            InstructionData::Phi { args } => {
                let mut fact = Lattice::Undef;
                for &(pred, op) in args {
                    if self.reachable_edges.contains(&(pred, block)) {
                        fact = fact.meet(self.fact(op));
                    }
                }
                self.update(self.result(inst), fact);
            }
            InstructionData::Load { .. }
            | InstructionData::StackAlloc { .. }
            | InstructionData::ElemAddr { .. } => {
                self.update(self.result(inst), Lattice::Over);
            }
            InstructionData::Call { .. } => {
                if let Some(result) = self.func.dfg.inst_result(inst) {
                    self.update(result, Lattice::Over);
                }
            }
            InstructionData::Store { .. } | InstructionData::Return { .. } => {}
            InstructionData::Jump { dest } => {
                self.mark_edge(block, *dest);
            }
            InstructionData::Branch {
                cond,
                then_dest,
                else_dest,
            } => match self.fact(*cond) {
                Lattice::Const(imm) => {
                    let taken = if const_is_nonzero(imm) {
                        *then_dest
                    } else {
                        *else_dest
                    };
                    self.mark_edge(block, taken);
                }
                Lattice::Over => {
                    self.mark_edge(block, *then_dest);
                    self.mark_edge(block, *else_dest);
                }
                Lattice::Undef => {}
            },
        }
    }

    fn eval_binary(&self, opcode: Opcode, args: &[Operand; 2], inst: Inst) -> Lattice {
        match (self.fact(args[0]), self.fact(args[1])) {
            (Lattice::Const(a), Lattice::Const(b)) => {
                let ty = self
                    .func
                    .dfg
                    .inst_result(inst)
                    .map(|r| self.func.dfg.value_type(r))
                    .unwrap_or(types::I32);
                eval_binary(opcode, a, b, ty)
                    .map(Lattice::Const)
                    .unwrap_or(Lattice::Over)
            }
            (Lattice::Over, _) | (_, Lattice::Over) => Lattice::Over,
            _ => Lattice::Undef,
        }
    }

    fn result(&self, inst: Inst) -> Value {
        self.func
            .dfg
            .inst_result(inst)
            .expect("producing instruction without a result")
    }
}

fn int_of(op: Operand) -> Option<i64> {
    match op {
        Operand::Imm32(x) => Some(i64::from(x)),
        Operand::Imm64(x) => Some(x),
        _ => None,
    }
}

fn float_of(op: Operand) -> Option<f32> {
    match op {
        Operand::Fimm32(x) => Some(x.as_f32()),
        _ => None,
    }
}

fn const_is_nonzero(op: Operand) -> bool {
    match op {
        Operand::Imm32(x) => x != 0,
        Operand::Imm64(x) => x != 0,
        Operand::Fimm32(x) => x.as_f32() != 0.0,
        _ => true,
    }
}

/// Fold an integer or float binary op; `None` means give up (e.g. division
/// by zero).
fn eval_binary(opcode: Opcode, a: Operand, b: Operand, ty: Type) -> Option<Operand> {
    if let (Some(x), Some(y)) = (float_of(a), float_of(b)) {
        let r = match opcode {
            Opcode::Fadd => x + y,
            Opcode::Fsub => x - y,
            Opcode::Fmul => x * y,
            Opcode::Fdiv => x / y,
            _ => return None,
        };
        return Some(Operand::Fimm32(Ieee32::with_float(r)));
    }
    let (x, y) = (int_of(a)?, int_of(b)?);
    let r = match opcode {
        Opcode::Iadd => x.wrapping_add(y),
        Opcode::Isub => x.wrapping_sub(y),
        Opcode::Imul => x.wrapping_mul(y),
        Opcode::Idiv => {
            if y == 0 {
                return None;
            }
            x.wrapping_div(y)
        }
        Opcode::Imod => {
            if y == 0 {
                return None;
            }
            x.wrapping_rem(y)
        }
        Opcode::Shl => x.wrapping_shl(y as u32 & 63),
        Opcode::Ashr => x.wrapping_shr(y as u32 & 63),
        Opcode::Lshr => ((x as u64).wrapping_shr(y as u32 & 63)) as i64,
        Opcode::Band => x & y,
        Opcode::Bor => x | y,
        Opcode::Bxor => x ^ y,
        _ => return None,
    };
    Some(if ty == types::I64 || ty == types::PTR {
        Operand::Imm64(r)
    } else {
        Operand::Imm32(r as i32)
    })
}

fn eval_unary(opcode: Opcode, arg: Operand) -> Option<Operand> {
    match opcode {
        Opcode::Zext => int_of(arg).map(|x| Operand::Imm32(x as i32)),
        Opcode::Sitofp => {
            int_of(arg).map(|x| Operand::Fimm32(Ieee32::with_float(x as f32)))
        }
        Opcode::Fptosi => float_of(arg).map(|x| Operand::Imm32(x as i32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, IntCC, Signature};
    use crate::opt::remove_unreachable_blocks;
    use crate::verifier::verify_function;

    #[test]
    fn folds_constant_branch() {
        // int x = 1; if (x) return 2; else return 3;
        let mut func = Function::with_name_signature("g", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let x = func.binary(b0, Opcode::Iadd, I32, Operand::Imm32(1), Operand::Imm32(0));
        func.branch(b0, x, b1, b2);
        func.ret(b1, Some(Operand::Imm32(2)));
        func.ret(b2, Some(Operand::Imm32(3)));

        assert!(do_sccp(&mut func));
        assert!(remove_unreachable_blocks(&mut func));
        assert_eq!(verify_function(&func), Ok(()));

        // The else side is gone and the branch became a jump.
        assert!(!func.layout.is_inserted(b2));
        assert!(matches!(
            func.dfg[func.terminator(b0)],
            InstructionData::Jump { dest } if dest == b1
        ));
    }

    #[test]
    fn propagates_through_phi() {
        // Both arms write 5; the φ is constant.
        let mut func = Function::with_name_signature("p", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.jump(b1, b3);
        func.jump(b2, b3);
        let p = func.phi(b3, I32, [(b1, Operand::Imm32(5)), (b2, Operand::Imm32(5))]);
        let y = func.binary(b3, Opcode::Iadd, I32, p, Operand::Imm32(1));
        func.ret(b3, Some(Operand::Value(y)));

        assert!(do_sccp(&mut func));
        match func.dfg[func.terminator(b3)] {
            InstructionData::Return { value } => assert_eq!(value, Some(Operand::Imm32(6))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn unreachable_arm_does_not_pollute_phi() {
        // if (0) { v = 100 } else { v = 7 } — the dead arm's incoming must
        // not force the φ to Over.
        let mut func = Function::with_name_signature("q", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        func.branch(b0, Operand::Imm32(0), b1, b2);
        func.jump(b1, b3);
        func.jump(b2, b3);
        let p = func.phi(b3, I32, [(b1, Operand::Imm32(100)), (b2, Operand::Imm32(7))]);
        func.ret(b3, Some(Operand::Value(p)));

        assert!(do_sccp(&mut func));
        match func.dfg[func.terminator(b3)] {
            InstructionData::Return { value } => assert_eq!(value, Some(Operand::Imm32(7))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut func = Function::with_name_signature("d", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let q = func.binary(b0, Opcode::Idiv, I32, Operand::Imm32(1), Operand::Imm32(0));
        func.ret(b0, Some(Operand::Value(q)));

        // No rewrite: the quotient stays a register.
        do_sccp(&mut func);
        match func.dfg[func.terminator(b0)] {
            InstructionData::Return { value } => assert_eq!(value, Some(Operand::Value(q))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn params_are_overdefined() {
        let mut func = Function::with_name_signature("o", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let y = func.binary(b0, Opcode::Iadd, I32, func.params[0], Operand::Imm32(1));
        func.ret(b0, Some(Operand::Value(y)));

        assert!(!do_sccp(&mut func));
    }
}
