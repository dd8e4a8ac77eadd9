//! DAG pattern selection for RV64.
//!
//! Walks each block's legalized DAG in schedule order and emits machine
//! instructions. 32-bit arithmetic uses the `w`-form instructions so
//! values stay sign-extended in their 64-bit registers; small immediates
//! fold into I-type forms; a compare consumed only by its block's branch
//! fuses into a branch-on-compare; and base-plus-displacement addresses
//! fold into the load or store. Constants, symbols, and frame addresses
//! materialize lazily the first time a register for them is needed.

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{self, types, FloatCC, GlobalVar, IntCC, Opcode, Operand, Value};
use crate::isa::riscv64::opcodes::{inst, RvOpcode};
use crate::isa::riscv64::registers::{self, RegInfo};
use crate::isa::TargetRegInfo;
use crate::isel::dag::{SdKind, SdNodeId, SelectionDag};
use crate::isel::{exported_values, schedule::schedule, FuncLowering};
use crate::mir::{MachineBlock, MachineFunction, MachineInst, MachineOperand, Reg};
use crate::result::CodegenResult;

/// Select `func` into a machine function.
pub(super) fn select_function(
    func: &ir::Function,
    module: &ir::Module,
    reg_info: &RegInfo,
) -> CodegenResult<MachineFunction> {
    let mut sel = Selector {
        func,
        module,
        reg_info,
        mfunc: MachineFunction::new(func.name.clone(), func.signature.clone()),
        ctx: FuncLowering::default(),
        bmap: FxHashMap::default(),
        exported: exported_values(func),
        global_addr: FxHashMap::default(),
        node_reg: FxHashMap::default(),
    };
    sel.run()?;
    Ok(sel.mfunc)
}

struct Selector<'a> {
    func: &'a ir::Function,
    module: &'a ir::Module,
    reg_info: &'a RegInfo,
    mfunc: MachineFunction,
    ctx: FuncLowering,
    bmap: FxHashMap<ir::Block, MachineBlock>,
    exported: FxHashSet<Value>,
    /// Globals named by φ-incomings, materialized once in the entry.
    global_addr: FxHashMap<GlobalVar, Reg>,
    /// Per-block map from selected node to its result register.
    node_reg: FxHashMap<SdNodeId, Reg>,
}

impl Selector<'_> {
    fn run(&mut self) -> CodegenResult<()> {
        for block in self.func.layout.blocks() {
            let mb = self.mfunc.add_block();
            self.bmap.insert(block, mb);
        }
        self.ctx.collect_allocas(&mut self.mfunc, self.func);

        self.emit_params();
        self.emit_phi_address_materializations();

        for block in self.func.layout.blocks().collect::<Vec<_>>() {
            let mb = self.bmap[&block];
            self.emit_phis(block, mb);
            let mut dag =
                SelectionDag::build(self.func, block, &mut self.ctx, &mut self.mfunc, &self.exported);
            super::legalize::legalize(&mut dag)?;
            let order = schedule(&dag);
            self.node_reg.clear();
            for node in order {
                self.select_node(&dag, node, mb);
            }
        }
        Ok(())
    }

    fn emit(&mut self, mb: MachineBlock, i: MachineInst) {
        self.mfunc.blocks[mb].insts.push_back(i);
    }

    /// Copy the incoming arguments into virtual registers.
    fn emit_params(&mut self) {
        let entry = self.bmap[&self.func.entry_block()];
        let params = self.func.params.clone();
        let tys = self.func.signature.params.clone();
        let (mut next_int, mut next_float, mut stack_off) = (0usize, 0usize, 0i32);
        for (&value, &ty) in params.iter().zip(&tys) {
            let r = self.ctx.vreg_of(&mut self.mfunc, self.func, value);
            if ty.is_float() {
                if next_float < self.reg_info.float_arg_regs().len() {
                    let phys = Reg::phys(self.reg_info.float_arg_regs()[next_float], ty);
                    self.emit(
                        entry,
                        inst(
                            RvOpcode::FmvS,
                            [MachineOperand::Reg(r), MachineOperand::Reg(phys)],
                        ),
                    );
                } else {
                    let slot = self.mfunc.frame.make_incoming_slot(stack_off, 8);
                    stack_off += 8;
                    self.emit(
                        entry,
                        inst(
                            RvOpcode::Flw,
                            [MachineOperand::Reg(r), MachineOperand::FrameIndex(slot)],
                        ),
                    );
                }
                next_float += 1;
            } else {
                if next_int < self.reg_info.int_arg_regs().len() {
                    let phys = Reg::phys(self.reg_info.int_arg_regs()[next_int], ty);
                    self.emit(
                        entry,
                        inst(
                            RvOpcode::Mv,
                            [MachineOperand::Reg(r), MachineOperand::Reg(phys)],
                        ),
                    );
                } else {
                    let slot = self.mfunc.frame.make_incoming_slot(stack_off, 8);
                    stack_off += 8;
                    let opc = if ty == types::I32 { RvOpcode::Lw } else { RvOpcode::Ld };
                    self.emit(
                        entry,
                        inst(
                            opc,
                            [MachineOperand::Reg(r), MachineOperand::FrameIndex(slot)],
                        ),
                    );
                }
                next_int += 1;
            }
            self.mfunc.params.push(r);
        }
    }

    /// φ-incomings naming a stack slot or a global need the address in a
    /// register; the entry block computes each such address once.
    fn emit_phi_address_materializations(&mut self) {
        let entry = self.bmap[&self.func.entry_block()];
        let mut slot_values: Vec<Value> = Vec::new();
        let mut globals: Vec<GlobalVar> = Vec::new();
        for block in self.func.layout.blocks() {
            for &phi in self.func.phis(block) {
                if let ir::InstructionData::Phi { args } = &self.func.dfg[phi] {
                    for &(_, op) in args {
                        match op {
                            Operand::Value(v) if self.ctx.frame_index.contains_key(&v) => {
                                if !slot_values.contains(&v) {
                                    slot_values.push(v);
                                }
                            }
                            Operand::Global(g) => {
                                if !globals.contains(&g) {
                                    globals.push(g);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        for v in slot_values {
            let fi = self.ctx.frame_index[&v];
            let r = self.ctx.vreg_of(&mut self.mfunc, self.func, v);
            self.emit(
                entry,
                inst(
                    RvOpcode::LeaFi,
                    [MachineOperand::Reg(r), MachineOperand::FrameIndex(fi)],
                ),
            );
        }
        for g in globals {
            let r = self.mfunc.new_vreg(types::PTR);
            let name = self.module.globals[g].name.clone();
            self.emit(
                entry,
                inst(RvOpcode::La, [MachineOperand::Reg(r), MachineOperand::Sym(name)]),
            );
            self.global_addr.insert(g, r);
        }
    }

    /// Lower the leading φ-run of `block` into φ pseudos.
    fn emit_phis(&mut self, block: ir::Block, mb: MachineBlock) {
        for &phi in self.func.phis(block).to_vec().iter() {
            let result = self.func.dfg.inst_result(phi).unwrap();
            let dst = self.ctx.vreg_of(&mut self.mfunc, self.func, result);
            let mut operands = vec![MachineOperand::Reg(dst)];
            let ir::InstructionData::Phi { args } = self.func.dfg[phi].clone() else {
                unreachable!()
            };
            for (pred, op) in args {
                operands.push(MachineOperand::Label(self.bmap[&pred]));
                operands.push(match op {
                    Operand::Value(v) => {
                        MachineOperand::Reg(self.ctx.vreg_of(&mut self.mfunc, self.func, v))
                    }
                    Operand::Imm32(c) => MachineOperand::Imm32(c),
                    Operand::Imm64(c) => {
                        debug_assert!(i32::try_from(c).is_ok(), "wide φ immediate");
                        MachineOperand::Imm32(c as i32)
                    }
                    Operand::Fimm32(f) => MachineOperand::Fimm32(f),
                    Operand::Global(g) => MachineOperand::Reg(self.global_addr[&g]),
                });
            }
            self.emit(mb, MachineInst::new(crate::mir::MachineOpcode::PHI, operands));
        }
    }

    /// The register assigned to `node` when it defines one: the export
    /// register when the value leaves the block, a fresh vreg otherwise.
    fn def_reg(&mut self, dag: &SelectionDag, node: SdNodeId) -> Reg {
        if let Some(&r) = self.node_reg.get(&node) {
            return r;
        }
        let r = match dag.exports.iter().find(|&&(n, _)| n == node) {
            Some(&(_, value)) => self.ctx.vreg_of(&mut self.mfunc, self.func, value),
            None => self.mfunc.new_vreg(dag.nodes[node].ty),
        };
        self.node_reg.insert(node, r);
        r
    }

    /// The register holding `node`'s value, materializing leaves on
    /// demand.
    fn use_reg(&mut self, dag: &SelectionDag, node: SdNodeId, mb: MachineBlock) -> Reg {
        if let Some(&r) = self.node_reg.get(&node) {
            return r;
        }
        let ty = dag.nodes[node].ty;
        let r = match dag.nodes[node].kind.clone() {
            // Integer zero reads straight from the hardwired register,
            // unless another block needs it in the export vreg.
            SdKind::ConstI32(0) | SdKind::ConstI64(0) if !dag.is_exported(node) => {
                Reg::phys(registers::ZERO, ty)
            }
            SdKind::ConstI32(c) => {
                let d = self.def_reg(dag, node);
                self.emit(
                    mb,
                    inst(RvOpcode::Li, [MachineOperand::Reg(d), MachineOperand::Imm32(c)]),
                );
                d
            }
            SdKind::ConstI64(c) => {
                debug_assert!(i32::try_from(c).is_ok(), "wide integer constant");
                let d = self.def_reg(dag, node);
                self.emit(
                    mb,
                    inst(
                        RvOpcode::Li,
                        [MachineOperand::Reg(d), MachineOperand::Imm32(c as i32)],
                    ),
                );
                d
            }
            SdKind::ConstF32(f) => {
                let d = self.def_reg(dag, node);
                if f.bits() == 0 {
                    self.emit(
                        mb,
                        inst(
                            RvOpcode::FmvWX,
                            [
                                MachineOperand::Reg(d),
                                MachineOperand::Reg(Reg::phys(registers::ZERO, types::I32)),
                            ],
                        ),
                    );
                } else {
                    let bits = self.mfunc.new_vreg(types::I32);
                    self.emit(
                        mb,
                        inst(
                            RvOpcode::Li,
                            [
                                MachineOperand::Reg(bits),
                                MachineOperand::Imm32(f.bits() as i32),
                            ],
                        ),
                    );
                    self.emit(
                        mb,
                        inst(
                            RvOpcode::FmvWX,
                            [MachineOperand::Reg(d), MachineOperand::Reg(bits)],
                        ),
                    );
                }
                d
            }
            SdKind::Sym(g) => {
                let d = self.def_reg(dag, node);
                let name = self.module.globals[g].name.clone();
                self.emit(
                    mb,
                    inst(RvOpcode::La, [MachineOperand::Reg(d), MachineOperand::Sym(name)]),
                );
                d
            }
            SdKind::FrameAddr(fi) => {
                let d = self.def_reg(dag, node);
                self.emit(
                    mb,
                    inst(
                        RvOpcode::LeaFi,
                        [MachineOperand::Reg(d), MachineOperand::FrameIndex(fi)],
                    ),
                );
                d
            }
            SdKind::VReg(r) => r,
            other => panic!("use of unselected node {other:?}"),
        };
        self.node_reg.insert(node, r);
        r
    }

    fn select_node(&mut self, dag: &SelectionDag, node: SdNodeId, mb: MachineBlock) {
        match dag.nodes[node].kind.clone() {
            SdKind::EntryToken | SdKind::TokenFactor => {}
            SdKind::ConstI32(_)
            | SdKind::ConstI64(_)
            | SdKind::ConstF32(_)
            | SdKind::Sym(_)
            | SdKind::FrameAddr(_)
            | SdKind::VReg(_) => {
                if dag.is_exported(node) {
                    let _ = self.use_reg(dag, node, mb);
                }
            }
            SdKind::Binary(op) => self.select_binary(dag, node, op, mb),
            SdKind::Unary(op) => self.select_unary(dag, node, op, mb),
            SdKind::Icmp(cc) => {
                if !self.fused_with_branch(dag, node) {
                    self.select_icmp(dag, node, cc, mb);
                }
            }
            SdKind::Fcmp(cc) => self.select_fcmp(dag, node, cc, mb),
            SdKind::ElemAddr(_) => unreachable!("element address survived legalization"),
            SdKind::Load => self.select_load(dag, node, mb),
            SdKind::Store => self.select_store(dag, node, mb),
            SdKind::Call(callee) => self.select_call(dag, node, callee, mb),
            SdKind::Ret => self.select_ret(dag, node, mb),
            SdKind::Br(dest) => {
                let label = MachineOperand::Label(self.bmap[&dest]);
                self.emit(mb, inst(RvOpcode::J, [label]));
            }
            SdKind::BrCond(t, e) => self.select_brcond(dag, node, t, e, mb),
        }
    }

    /// Is `node` a compare consumed only by this block's branch?
    fn fused_with_branch(&self, dag: &SelectionDag, node: SdNodeId) -> bool {
        if dag.use_counts[node] != 1 || dag.is_exported(node) {
            return false;
        }
        let term = &dag.nodes[dag.terminator];
        matches!(term.kind, SdKind::BrCond(..)) && term.args[1] == node
    }

    /// Is `node` an add folded into the address of its only memory user?
    fn folded_into_address(&self, dag: &SelectionDag, node: SdNodeId) -> bool {
        if dag.use_counts[node] != 1 || dag.is_exported(node) {
            return false;
        }
        if self.address_fold_parts(dag, node).is_none() {
            return false;
        }
        dag.nodes.keys().any(|user| match dag.nodes[user].kind {
            SdKind::Load => dag.nodes[user].args[1] == node,
            SdKind::Store => dag.nodes[user].args[2] == node,
            _ => false,
        })
    }

    /// `Some((base, offset))` when `node` is `base + simm12` with a
    /// register base.
    fn address_fold_parts(&self, dag: &SelectionDag, node: SdNodeId) -> Option<(SdNodeId, i32)> {
        let n = &dag.nodes[node];
        if !matches!(n.kind, SdKind::Binary(Opcode::Iadd)) {
            return None;
        }
        let c = match dag.nodes[n.args[1]].kind {
            SdKind::ConstI32(c) if is_simm12(c) => c,
            SdKind::ConstI64(c) if is_simm12(c as i32) && i32::try_from(c).is_ok() => c as i32,
            _ => return None,
        };
        if matches!(dag.nodes[n.args[0]].kind, SdKind::FrameAddr(_)) {
            return None;
        }
        Some((n.args[0], c))
    }

    /// An operand for the address computed by `addr`.
    fn fold_address(
        &mut self,
        dag: &SelectionDag,
        addr: SdNodeId,
        mb: MachineBlock,
    ) -> MachineOperand {
        match dag.nodes[addr].kind {
            SdKind::FrameAddr(fi) => MachineOperand::FrameIndex(fi),
            _ => {
                if !self.node_reg.contains_key(&addr) {
                    if let Some((base, offset)) = self.address_fold_parts(dag, addr) {
                        let base = self.use_reg(dag, base, mb);
                        return MachineOperand::Mem { base, offset };
                    }
                }
                let base = self.use_reg(dag, addr, mb);
                MachineOperand::Mem { base, offset: 0 }
            }
        }
    }

    fn select_binary(&mut self, dag: &SelectionDag, node: SdNodeId, op: Opcode, mb: MachineBlock) {
        if self.folded_into_address(dag, node) {
            return;
        }
        let ty = dag.nodes[node].ty;
        let lhs = dag.nodes[node].args[0];
        let rhs = dag.nodes[node].args[1];

        if ty.is_float() {
            let opc = match op {
                Opcode::Fadd => RvOpcode::FaddS,
                Opcode::Fsub => RvOpcode::FsubS,
                Opcode::Fmul => RvOpcode::FmulS,
                Opcode::Fdiv => RvOpcode::FdivS,
                other => panic!("float binary {other}"),
            };
            let l = self.use_reg(dag, lhs, mb);
            let r = self.use_reg(dag, rhs, mb);
            let d = self.def_reg(dag, node);
            self.emit(
                mb,
                inst(
                    opc,
                    [
                        MachineOperand::Reg(d),
                        MachineOperand::Reg(l),
                        MachineOperand::Reg(r),
                    ],
                ),
            );
            return;
        }

        let narrow = ty == types::I32;
        let (rr, ri) = match op {
            Opcode::Iadd => (
                if narrow { RvOpcode::Addw } else { RvOpcode::Add },
                Some(if narrow { RvOpcode::Addiw } else { RvOpcode::Addi }),
            ),
            Opcode::Isub => (if narrow { RvOpcode::Subw } else { RvOpcode::Sub }, None),
            Opcode::Imul => (if narrow { RvOpcode::Mulw } else { RvOpcode::Mul }, None),
            Opcode::Idiv => (if narrow { RvOpcode::Divw } else { RvOpcode::Div }, None),
            Opcode::Imod => (if narrow { RvOpcode::Remw } else { RvOpcode::Rem }, None),
            Opcode::Shl => (
                if narrow { RvOpcode::Sllw } else { RvOpcode::Sll },
                Some(if narrow { RvOpcode::Slliw } else { RvOpcode::Slli }),
            ),
            Opcode::Ashr => (
                if narrow { RvOpcode::Sraw } else { RvOpcode::Sra },
                Some(if narrow { RvOpcode::Sraiw } else { RvOpcode::Srai }),
            ),
            Opcode::Lshr => (
                if narrow { RvOpcode::Srlw } else { RvOpcode::Srl },
                Some(if narrow { RvOpcode::Srliw } else { RvOpcode::Srli }),
            ),
            Opcode::Band => (RvOpcode::And, Some(RvOpcode::Andi)),
            Opcode::Bor => (RvOpcode::Or, Some(RvOpcode::Ori)),
            Opcode::Bxor => (RvOpcode::Xor, Some(RvOpcode::Xori)),
            other => panic!("integer binary {other}"),
        };

        // Subtraction of a small constant is an addi of its negation.
        if op == Opcode::Isub {
            if let Some(c) = self.imm_of(dag, rhs) {
                if let Some(neg) = c.checked_neg().filter(|&n| is_simm12(n)) {
                    let l = self.use_reg(dag, lhs, mb);
                    let d = self.def_reg(dag, node);
                    let opc = if narrow { RvOpcode::Addiw } else { RvOpcode::Addi };
                    self.emit(
                        mb,
                        inst(
                            opc,
                            [
                                MachineOperand::Reg(d),
                                MachineOperand::Reg(l),
                                MachineOperand::Imm32(neg),
                            ],
                        ),
                    );
                    return;
                }
            }
        }

        let (mut a, mut b) = (lhs, rhs);
        if self.imm_of(dag, b).is_none() && self.imm_of(dag, a).is_some() && op.is_commutative() {
            std::mem::swap(&mut a, &mut b);
        }
        if let (Some(opc), Some(c)) = (ri, self.imm_of(dag, b).filter(|&c| is_simm12(c))) {
            let l = self.use_reg(dag, a, mb);
            let d = self.def_reg(dag, node);
            self.emit(
                mb,
                inst(
                    opc,
                    [
                        MachineOperand::Reg(d),
                        MachineOperand::Reg(l),
                        MachineOperand::Imm32(c),
                    ],
                ),
            );
        } else {
            let l = self.use_reg(dag, a, mb);
            let r = self.use_reg(dag, b, mb);
            let d = self.def_reg(dag, node);
            self.emit(
                mb,
                inst(
                    rr,
                    [
                        MachineOperand::Reg(d),
                        MachineOperand::Reg(l),
                        MachineOperand::Reg(r),
                    ],
                ),
            );
        }
    }

    fn imm_of(&self, dag: &SelectionDag, node: SdNodeId) -> Option<i32> {
        match dag.nodes[node].kind {
            SdKind::ConstI32(c) => Some(c),
            SdKind::ConstI64(c) => i32::try_from(c).ok(),
            _ => None,
        }
    }

    fn select_unary(&mut self, dag: &SelectionDag, node: SdNodeId, op: Opcode, mb: MachineBlock) {
        let arg = dag.nodes[node].args[0];
        let a = self.use_reg(dag, arg, mb);
        let d = self.def_reg(dag, node);
        let opc = match op {
            // Truth values are already zero-extended in their registers.
            Opcode::Zext => RvOpcode::Mv,
            Opcode::Sitofp => RvOpcode::FcvtSW,
            Opcode::Fptosi => RvOpcode::FcvtWS,
            other => panic!("conversion {other}"),
        };
        self.emit(
            mb,
            inst(opc, [MachineOperand::Reg(d), MachineOperand::Reg(a)]),
        );
    }

    fn select_icmp(&mut self, dag: &SelectionDag, node: SdNodeId, cc: IntCC, mb: MachineBlock) {
        let l = self.use_reg(dag, dag.nodes[node].args[0], mb);
        let r = self.use_reg(dag, dag.nodes[node].args[1], mb);
        let d = self.def_reg(dag, node);
        let rrr = |opc, d, a, b| {
            inst(
                opc,
                [
                    MachineOperand::Reg(d),
                    MachineOperand::Reg(a),
                    MachineOperand::Reg(b),
                ],
            )
        };
        let unary = |opc, d, a| inst(opc, [MachineOperand::Reg(d), MachineOperand::Reg(a)]);
        let negate = |d| {
            inst(
                RvOpcode::Xori,
                [
                    MachineOperand::Reg(d),
                    MachineOperand::Reg(d),
                    MachineOperand::Imm32(1),
                ],
            )
        };
        match cc {
            IntCC::Equal | IntCC::NotEqual => {
                let diff = self.mfunc.new_vreg(types::I64);
                self.emit(mb, rrr(RvOpcode::Xor, diff, l, r));
                let opc = if cc == IntCC::Equal {
                    RvOpcode::Seqz
                } else {
                    RvOpcode::Snez
                };
                self.emit(mb, unary(opc, d, diff));
            }
            IntCC::SignedLessThan => self.emit(mb, rrr(RvOpcode::Slt, d, l, r)),
            IntCC::SignedGreaterThan => self.emit(mb, rrr(RvOpcode::Slt, d, r, l)),
            IntCC::SignedGreaterThanOrEqual => {
                self.emit(mb, rrr(RvOpcode::Slt, d, l, r));
                self.emit(mb, negate(d));
            }
            IntCC::SignedLessThanOrEqual => {
                self.emit(mb, rrr(RvOpcode::Slt, d, r, l));
                self.emit(mb, negate(d));
            }
            IntCC::UnsignedLessThan => self.emit(mb, rrr(RvOpcode::Sltu, d, l, r)),
            IntCC::UnsignedGreaterThan => self.emit(mb, rrr(RvOpcode::Sltu, d, r, l)),
            IntCC::UnsignedGreaterThanOrEqual => {
                self.emit(mb, rrr(RvOpcode::Sltu, d, l, r));
                self.emit(mb, negate(d));
            }
            IntCC::UnsignedLessThanOrEqual => {
                self.emit(mb, rrr(RvOpcode::Sltu, d, r, l));
                self.emit(mb, negate(d));
            }
        }
    }

    fn select_fcmp(&mut self, dag: &SelectionDag, node: SdNodeId, cc: FloatCC, mb: MachineBlock) {
        let l = self.use_reg(dag, dag.nodes[node].args[0], mb);
        let r = self.use_reg(dag, dag.nodes[node].args[1], mb);
        let d = self.def_reg(dag, node);
        let rrr = |opc, d, a, b| {
            inst(
                opc,
                [
                    MachineOperand::Reg(d),
                    MachineOperand::Reg(a),
                    MachineOperand::Reg(b),
                ],
            )
        };
        let negate = |d| {
            inst(
                RvOpcode::Xori,
                [
                    MachineOperand::Reg(d),
                    MachineOperand::Reg(d),
                    MachineOperand::Imm32(1),
                ],
            )
        };
        match cc {
            FloatCC::Equal => self.emit(mb, rrr(RvOpcode::FeqS, d, l, r)),
            FloatCC::NotEqual => {
                self.emit(mb, rrr(RvOpcode::FeqS, d, l, r));
                self.emit(mb, negate(d));
            }
            FloatCC::LessThan => self.emit(mb, rrr(RvOpcode::FltS, d, l, r)),
            FloatCC::LessThanOrEqual => self.emit(mb, rrr(RvOpcode::FleS, d, l, r)),
            FloatCC::GreaterThan => self.emit(mb, rrr(RvOpcode::FltS, d, r, l)),
            FloatCC::GreaterThanOrEqual => self.emit(mb, rrr(RvOpcode::FleS, d, r, l)),
            FloatCC::Ordered | FloatCC::Unordered => {
                let lo = self.mfunc.new_vreg(types::I32);
                let ro = self.mfunc.new_vreg(types::I32);
                self.emit(mb, rrr(RvOpcode::FeqS, lo, l, l));
                self.emit(mb, rrr(RvOpcode::FeqS, ro, r, r));
                self.emit(mb, rrr(RvOpcode::And, d, lo, ro));
                if cc == FloatCC::Unordered {
                    self.emit(mb, negate(d));
                }
            }
        }
    }

    fn select_load(&mut self, dag: &SelectionDag, node: SdNodeId, mb: MachineBlock) {
        let addr = dag.nodes[node].args[1];
        let mem = self.fold_address(dag, addr, mb);
        let d = self.def_reg(dag, node);
        let opc = match dag.nodes[node].ty {
            types::F32 => RvOpcode::Flw,
            types::I32 => RvOpcode::Lw,
            _ => RvOpcode::Ld,
        };
        self.emit(mb, inst(opc, [MachineOperand::Reg(d), mem]));
    }

    fn select_store(&mut self, dag: &SelectionDag, node: SdNodeId, mb: MachineBlock) {
        let value = dag.nodes[node].args[1];
        let addr = dag.nodes[node].args[2];
        let src = self.use_reg(dag, value, mb);
        let mem = self.fold_address(dag, addr, mb);
        let opc = match dag.nodes[value].ty {
            types::F32 => RvOpcode::Fsw,
            types::I32 => RvOpcode::Sw,
            _ => RvOpcode::Sd,
        };
        self.emit(mb, inst(opc, [MachineOperand::Reg(src), mem]));
    }

    fn select_call(
        &mut self,
        dag: &SelectionDag,
        node: SdNodeId,
        callee: ir::FuncRef,
        mb: MachineBlock,
    ) {
        let args: Vec<SdNodeId> = dag.nodes[node].args[1..].to_vec();
        let (mut next_int, mut next_float, mut stack_off) = (0usize, 0usize, 0i32);
        let sp = Reg::phys(self.reg_info.sp(), types::PTR);
        for a in args {
            let ty = dag.nodes[a].ty;
            if ty.is_float() {
                if next_float < self.reg_info.float_arg_regs().len() {
                    let phys = Reg::phys(self.reg_info.float_arg_regs()[next_float], ty);
                    let r = self.use_reg(dag, a, mb);
                    self.emit(
                        mb,
                        inst(
                            RvOpcode::FmvS,
                            [MachineOperand::Reg(phys), MachineOperand::Reg(r)],
                        ),
                    );
                } else {
                    let r = self.use_reg(dag, a, mb);
                    self.emit(
                        mb,
                        inst(
                            RvOpcode::Fsw,
                            [
                                MachineOperand::Reg(r),
                                MachineOperand::Mem {
                                    base: sp,
                                    offset: stack_off,
                                },
                            ],
                        ),
                    );
                    stack_off += 8;
                }
                next_float += 1;
            } else {
                if next_int < self.reg_info.int_arg_regs().len() {
                    let phys = Reg::phys(self.reg_info.int_arg_regs()[next_int], ty);
                    match self.imm_of(dag, a).filter(|_| !self.node_reg.contains_key(&a)) {
                        Some(c) => self.emit(
                            mb,
                            inst(
                                RvOpcode::Li,
                                [MachineOperand::Reg(phys), MachineOperand::Imm32(c)],
                            ),
                        ),
                        None => {
                            let r = self.use_reg(dag, a, mb);
                            self.emit(
                                mb,
                                inst(
                                    RvOpcode::Mv,
                                    [MachineOperand::Reg(phys), MachineOperand::Reg(r)],
                                ),
                            );
                        }
                    }
                } else {
                    let r = self.use_reg(dag, a, mb);
                    self.emit(
                        mb,
                        inst(
                            RvOpcode::Sd,
                            [
                                MachineOperand::Reg(r),
                                MachineOperand::Mem {
                                    base: sp,
                                    offset: stack_off,
                                },
                            ],
                        ),
                    );
                    stack_off += 8;
                }
                next_int += 1;
            }
        }
        self.mfunc.frame.grow_out_args(stack_off as u32);
        self.mfunc.has_calls = true;

        let name = self.module.functions[callee].name().to_string();
        self.emit(mb, inst(RvOpcode::CallSym, [MachineOperand::Sym(name)]));

        let ty = dag.nodes[node].ty;
        if ty != types::VOID && (dag.use_counts[node] > 0 || dag.is_exported(node)) {
            let d = self.def_reg(dag, node);
            if ty.is_float() {
                let fa0 = Reg::phys(registers::FA0, ty);
                self.emit(
                    mb,
                    inst(
                        RvOpcode::FmvS,
                        [MachineOperand::Reg(d), MachineOperand::Reg(fa0)],
                    ),
                );
            } else {
                let a0 = Reg::phys(registers::A0, ty);
                self.emit(
                    mb,
                    inst(RvOpcode::Mv, [MachineOperand::Reg(d), MachineOperand::Reg(a0)]),
                );
            }
        }
    }

    fn select_ret(&mut self, dag: &SelectionDag, node: SdNodeId, mb: MachineBlock) {
        if let Some(&value) = dag.nodes[node].args.get(1) {
            let ty = dag.nodes[value].ty;
            if ty.is_float() {
                let fa0 = Reg::phys(registers::FA0, ty);
                let r = self.use_reg(dag, value, mb);
                self.emit(
                    mb,
                    inst(
                        RvOpcode::FmvS,
                        [MachineOperand::Reg(fa0), MachineOperand::Reg(r)],
                    ),
                );
            } else {
                let a0 = Reg::phys(registers::A0, ty);
                match self.imm_of(dag, value).filter(|_| !self.node_reg.contains_key(&value)) {
                    Some(c) => self.emit(
                        mb,
                        inst(RvOpcode::Li, [MachineOperand::Reg(a0), MachineOperand::Imm32(c)]),
                    ),
                    None => {
                        let r = self.use_reg(dag, value, mb);
                        self.emit(
                            mb,
                            inst(RvOpcode::Mv, [MachineOperand::Reg(a0), MachineOperand::Reg(r)]),
                        );
                    }
                }
            }
        }
        self.emit(mb, inst(RvOpcode::RetInst, []));
    }

    fn select_brcond(
        &mut self,
        dag: &SelectionDag,
        node: SdNodeId,
        then_dest: ir::Block,
        else_dest: ir::Block,
        mb: MachineBlock,
    ) {
        let cond = dag.nodes[node].args[1];
        let then_label = MachineOperand::Label(self.bmap[&then_dest]);
        let else_label = MachineOperand::Label(self.bmap[&else_dest]);

        let fused = match dag.nodes[cond].kind {
            SdKind::Icmp(cc) if self.fused_with_branch(dag, cond) => Some(cc),
            _ => None,
        };
        match fused {
            Some(cc) => {
                let l = self.use_reg(dag, dag.nodes[cond].args[0], mb);
                let r = self.use_reg(dag, dag.nodes[cond].args[1], mb);
                let (opc, a, b) = match cc {
                    IntCC::Equal => (RvOpcode::Beq, l, r),
                    IntCC::NotEqual => (RvOpcode::Bne, l, r),
                    IntCC::SignedLessThan => (RvOpcode::Blt, l, r),
                    IntCC::SignedGreaterThanOrEqual => (RvOpcode::Bge, l, r),
                    IntCC::SignedGreaterThan => (RvOpcode::Blt, r, l),
                    IntCC::SignedLessThanOrEqual => (RvOpcode::Bge, r, l),
                    IntCC::UnsignedLessThan => (RvOpcode::Bltu, l, r),
                    IntCC::UnsignedGreaterThanOrEqual => (RvOpcode::Bgeu, l, r),
                    IntCC::UnsignedGreaterThan => (RvOpcode::Bltu, r, l),
                    IntCC::UnsignedLessThanOrEqual => (RvOpcode::Bgeu, r, l),
                };
                self.emit(
                    mb,
                    inst(
                        opc,
                        [MachineOperand::Reg(a), MachineOperand::Reg(b), then_label],
                    ),
                );
            }
            None => {
                let c = self.use_reg(dag, cond, mb);
                self.emit(mb, inst(RvOpcode::Bnez, [MachineOperand::Reg(c), then_label]));
            }
        }
        self.emit(mb, inst(RvOpcode::J, [else_label]));
    }
}

fn is_simm12(c: i32) -> bool {
    (-2048..=2047).contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Signature};
    use types::I32;

    fn select(func: &ir::Function, module: &ir::Module) -> MachineFunction {
        select_function(func, module, &RegInfo).unwrap()
    }

    fn opcodes_of(mfunc: &MachineFunction, mb: MachineBlock) -> Vec<RvOpcode> {
        mfunc.blocks[mb]
            .insts
            .iter()
            .filter_map(|i| RvOpcode::from_u16(i.opcode.0))
            .collect()
    }

    #[test]
    fn selects_add_of_params() {
        let module = ir::Module::new();
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let a = func.params[0];
        let s = func.binary(b0, Opcode::Iadd, I32, a, a);
        func.ret(b0, Some(Operand::Value(s)));

        let mfunc = select(&func, &module);
        let ops = opcodes_of(&mfunc, mfunc.entry_block());
        // mv (param), addw, mv a0, ret.
        assert_eq!(
            ops,
            vec![RvOpcode::Mv, RvOpcode::Addw, RvOpcode::Mv, RvOpcode::RetInst]
        );
    }

    #[test]
    fn folds_small_immediates() {
        let module = ir::Module::new();
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let a = func.params[0];
        let s = func.binary(b0, Opcode::Iadd, I32, a, Operand::Imm32(7));
        let t = func.binary(b0, Opcode::Isub, I32, s, Operand::Imm32(3));
        func.ret(b0, Some(Operand::Value(t)));

        let mfunc = select(&func, &module);
        let ops = opcodes_of(&mfunc, mfunc.entry_block());
        assert!(ops.contains(&RvOpcode::Addiw));
        assert!(!ops.contains(&RvOpcode::Subw));
        assert!(!ops.contains(&RvOpcode::Li));
    }

    #[test]
    fn fuses_compare_into_branch() {
        let module = ir::Module::new();
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let a = func.params[0];
        let c = func.icmp(b0, IntCC::SignedLessThan, a, Operand::Imm32(10));
        func.branch(b0, c, b1, b2);
        func.ret(b1, Some(Operand::Imm32(1)));
        func.ret(b2, Some(Operand::Imm32(0)));

        let mfunc = select(&func, &module);
        let ops = opcodes_of(&mfunc, mfunc.entry_block());
        assert!(ops.contains(&RvOpcode::Blt));
        assert!(!ops.contains(&RvOpcode::Slt));
        assert!(ops.contains(&RvOpcode::J));
    }

    #[test]
    fn phi_pseudo_carries_edges() {
        let module = ir::Module::new();
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.jump(b1, b3);
        func.jump(b2, b3);
        let p = func.phi(b3, I32, [(b1, Operand::Imm32(1)), (b2, Operand::Imm32(2))]);
        func.ret(b3, Some(Operand::Value(p)));

        let mfunc = select(&func, &module);
        let mb3 = mfunc.layout[3];
        let first = &mfunc.blocks[mb3].insts[0];
        assert!(first.is_phi());
        assert_eq!(first.operands.len(), 5);
    }

    #[test]
    fn call_marshals_arguments() {
        let mut module = ir::Module::new();
        let callee = module.declare_function("g", Signature::new(vec![I32, I32], I32));
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let a = func.params[0];
        let r = func
            .call(b0, callee, [Operand::Value(a), Operand::Imm32(5)], I32)
            .unwrap();
        func.ret(b0, Some(Operand::Value(r)));

        let mfunc = select(&func, &module);
        assert!(mfunc.has_calls);
        let insts: Vec<_> = mfunc.blocks[mfunc.entry_block()].insts.iter().collect();
        let call_pos = insts
            .iter()
            .position(|i| RvOpcode::from_u16(i.opcode.0) == Some(RvOpcode::CallSym))
            .unwrap();
        // An a0 copy and an a1 li precede the call.
        let before = &insts[..call_pos];
        assert!(before.iter().any(|i| {
            i.operands.first()
                == Some(&MachineOperand::Reg(Reg::phys(registers::A0, I32)))
        }));
        assert!(before.iter().any(|i| {
            i.operands.first() == Some(&MachineOperand::Reg(Reg::phys(11, I32)))
        }));
    }

    #[test]
    fn alloca_load_uses_frame_index() {
        let module = ir::Module::new();
        let mut func = Function::with_name_signature("f", Signature::new(vec![], I32));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 1);
        func.store(b0, Operand::Imm32(3), slot);
        let x = func.load(b0, I32, slot);
        func.ret(b0, Some(Operand::Value(x)));

        let mfunc = select(&func, &module);
        let has_fi = mfunc.blocks[mfunc.entry_block()]
            .insts
            .iter()
            .any(|i| i.operands.iter().any(|o| matches!(o, MachineOperand::FrameIndex(_))));
        assert!(has_fi);
    }
}
