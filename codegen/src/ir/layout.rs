//! Block order within a function.
//!
//! The layout is the ordered list of blocks that are part of the program;
//! the first entry is the function entry. Blocks removed from the layout
//! (unreachable code, forwarding blocks) still exist in the block arena but
//! no longer take part in compilation. Functions stay small enough that a
//! plain vector beats a linked structure here.

use crate::ir::entities::Block;

/// The block order of one function.
#[derive(Clone, Default)]
pub struct Layout {
    order: Vec<Block>,
}

impl Layout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry block, if any block has been appended.
    pub fn entry_block(&self) -> Option<Block> {
        self.order.first().copied()
    }

    /// Append `block` at the end of the order.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.is_inserted(block), "{block} already in layout");
        self.order.push(block);
    }

    /// Insert `block` immediately before `before`.
    pub fn insert_block_before(&mut self, block: Block, before: Block) {
        debug_assert!(!self.is_inserted(block), "{block} already in layout");
        let pos = self.position(before).expect("insertion point not in layout");
        self.order.insert(pos, block);
    }

    /// Insert `block` immediately after `after`.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.is_inserted(block), "{block} already in layout");
        let pos = self.position(after).expect("insertion point not in layout");
        self.order.insert(pos + 1, block);
    }

    /// Remove `block` from the order.
    pub fn remove_block(&mut self, block: Block) {
        self.order.retain(|&b| b != block);
    }

    /// Is `block` part of the order?
    pub fn is_inserted(&self, block: Block) -> bool {
        self.position(block).is_some()
    }

    /// Number of blocks in the order.
    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    /// Iterate over the blocks in layout order.
    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = Block> + '_ {
        self.order.iter().copied()
    }

    fn position(&self, block: Block) -> Option<usize> {
        self.order.iter().position(|&b| b == block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_entity::EntityRef;

    #[test]
    fn ordering() {
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        let b2 = Block::new(2);
        let b3 = Block::new(3);

        let mut layout = Layout::new();
        layout.append_block(b0);
        layout.append_block(b2);
        layout.insert_block_before(b1, b2);
        layout.insert_block_after(b3, b2);

        assert_eq!(layout.entry_block(), Some(b0));
        assert_eq!(layout.blocks().collect::<Vec<_>>(), [b0, b1, b2, b3]);

        layout.remove_block(b1);
        assert!(!layout.is_inserted(b1));
        assert_eq!(layout.blocks().collect::<Vec<_>>(), [b0, b2, b3]);
    }
}
