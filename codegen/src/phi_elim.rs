//! PHI elimination on the machine IR.
//!
//! The φ pseudos emitted by instruction selection are lowered to copies on
//! the incoming edges before register allocation. Copies for a critical
//! edge (the predecessor branches several ways and the block has several
//! predecessors) go into a fresh block spliced into the edge; otherwise
//! they land in the predecessor just before its terminators.
//!
//! All copies of one edge form a parallel-copy set: semantically they
//! happen at once. They are sequenced by repeatedly emitting a copy whose
//! destination no other pending copy still reads; when none exists the
//! remaining copies form cycles, and one source is saved in a fresh
//! temporary to break them.

use crate::isa::InstrAdapter;
use crate::mir::{MachineBlock, MachineFunction, MachineInst, MachineOperand, Reg};

/// Copies of one incoming edge: `(destination, source)` pairs.
type CopyList = Vec<(Reg, MachineOperand)>;

/// Lower every φ pseudo in `mfunc`.
pub fn run(mfunc: &mut MachineFunction, adapter: &dyn InstrAdapter) {
    let blocks: Vec<MachineBlock> = mfunc.layout.clone();
    for &block in &blocks {
        // Pull out the leading φ run.
        let mut phis: Vec<MachineInst> = Vec::new();
        while mfunc.blocks[block]
            .insts
            .front()
            .is_some_and(MachineInst::is_phi)
        {
            phis.push(mfunc.blocks[block].insts.pop_front().unwrap());
        }
        if phis.is_empty() {
            continue;
        }

        // One copy list per predecessor edge.
        let mut per_pred: Vec<(MachineBlock, CopyList)> = Vec::new();
        for phi in &phis {
            let dst = phi.operands[0].as_reg().expect("φ without a destination");
            for pair in phi.operands[1..].chunks(2) {
                let MachineOperand::Label(pred) = pair[0] else {
                    panic!("malformed φ operand list");
                };
                match per_pred.iter().position(|(p, _)| *p == pred) {
                    Some(at) => per_pred[at].1.push((dst, pair[1].clone())),
                    None => per_pred.push((pred, vec![(dst, pair[1].clone())])),
                }
            }
        }

        let n_preds = per_pred.len();
        for (pred, copies) in per_pred {
            let succ_count = mfunc.blocks[pred]
                .insts
                .iter()
                .filter(|i| !i.is_phi())
                .flat_map(|i| i.operands.iter())
                .filter(|op| matches!(op, MachineOperand::Label(_)))
                .count();
            let host = if succ_count > 1 && n_preds > 1 {
                split_edge(mfunc, adapter, pred, block)
            } else {
                pred
            };

            let seq = sequence_copies(mfunc, adapter, copies);
            let at = copy_insertion_point(mfunc, adapter, host);
            for (k, inst) in seq.into_iter().enumerate() {
                mfunc.blocks[host].insts.insert(at + k, inst);
            }
        }
    }
}

/// Splice a fresh block into the edge `pred → block` and return it.
fn split_edge(
    mfunc: &mut MachineFunction,
    adapter: &dyn InstrAdapter,
    pred: MachineBlock,
    block: MachineBlock,
) -> MachineBlock {
    let nb = mfunc.make_block();
    let pos = mfunc.layout.iter().position(|&b| b == pred).unwrap();
    mfunc.layout.insert(pos + 1, nb);
    mfunc.blocks[nb].insts.push_back(adapter.make_jump(block));
    for inst in mfunc.blocks[pred].insts.iter_mut() {
        // φ pseudos in the predecessor name its own incoming edges, not
        // this one.
        if inst.is_phi() {
            continue;
        }
        for op in inst.operands.iter_mut() {
            if *op == MachineOperand::Label(block) {
                *op = MachineOperand::Label(nb);
            }
        }
    }
    log::debug!("split critical edge {pred} -> {block} with {nb}");
    nb
}

/// Index just before the branch instructions ending `block`.
fn copy_insertion_point(
    mfunc: &MachineFunction,
    adapter: &dyn InstrAdapter,
    block: MachineBlock,
) -> usize {
    let insts = &mfunc.blocks[block].insts;
    let mut at = insts.len();
    while at > 0 {
        let inst = &insts[at - 1];
        if adapter.is_uncond_branch(inst) || adapter.is_cond_branch(inst) {
            at -= 1;
        } else {
            break;
        }
    }
    at
}

/// Order a parallel-copy set, breaking cycles with temporaries.
fn sequence_copies(
    mfunc: &mut MachineFunction,
    adapter: &dyn InstrAdapter,
    mut copies: CopyList,
) -> Vec<MachineInst> {
    // Self-copies do nothing.
    copies.retain(|(dst, src)| src.as_reg() != Some(*dst));

    let mut out = Vec::with_capacity(copies.len());
    while !copies.is_empty() {
        let ready = copies.iter().position(|&(dst, _)| {
            !copies
                .iter()
                .any(|(_, src)| src.as_reg() == Some(dst))
        });
        match ready {
            Some(i) => {
                let (dst, src) = copies.remove(i);
                out.push(adapter.make_copy(dst, src));
            }
            None => {
                // Every destination is still read: the rest is one or more
                // cycles. Detach one source into a temporary.
                let (_, src) = &copies[0];
                let src_reg = src.as_reg().expect("cycle through an immediate");
                let tmp = mfunc.new_vreg(src_reg.ty);
                out.push(adapter.make_copy(tmp, MachineOperand::Reg(src_reg)));
                for (_, s) in copies.iter_mut() {
                    if s.as_reg() == Some(src_reg) {
                        *s = MachineOperand::Reg(tmp);
                    }
                }
            }
        }
    }
    out
}
