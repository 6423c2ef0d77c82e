//! Block tree: every known valid-looking block, indexed by hash, with the
//! active chain as a path from genesis to the best tip.
//!
//! Forks share storage: each node keeps its block and its parent's hash
//! only, so competing branches cost one entry per distinct block.

use crate::error::{RejectReason, ValidationResult};
use crate::pow::{block_work, U256};
use crate::types::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct BlockNode {
    pub block: Block,
    /// Work of this block plus all its ancestors
    pub cumulative_work: U256,
    pub invalid: bool,
}

impl BlockNode {
    pub fn hash(&self) -> Hash {
        self.block.hash
    }

    pub fn height(&self) -> Natural {
        self.block.header.height
    }

    pub fn parent(&self) -> Hash {
        self.block.header.previous_hash
    }
}

#[derive(Debug, Clone)]
pub struct BlockTree {
    nodes: HashMap<Hash, BlockNode>,
    children: HashMap<Hash, Vec<Hash>>,
    /// Active chain, index = height
    active: Vec<Hash>,
}

impl BlockTree {
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash;
        let node = BlockNode {
            cumulative_work: block_work(genesis.header.difficulty_target),
            block: genesis,
            invalid: false,
        };
        let mut nodes = HashMap::new();
        nodes.insert(hash, node);
        BlockTree {
            nodes,
            children: HashMap::new(),
            active: vec![hash],
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<&BlockNode> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn genesis_hash(&self) -> Hash {
        self.active[0]
    }

    pub fn tip_hash(&self) -> Hash {
        self.active[self.active.len() - 1]
    }

    pub fn tip(&self) -> &BlockNode {
        // The active chain always holds at least genesis, whose node is never removed
        &self.nodes[&self.tip_hash()]
    }

    pub fn height(&self) -> Natural {
        (self.active.len() - 1) as Natural
    }

    pub fn active_hashes(&self) -> &[Hash] {
        &self.active
    }

    pub fn hash_at_height(&self, height: Natural) -> Option<Hash> {
        self.active.get(height as usize).copied()
    }

    pub fn block_at_height(&self, height: Natural) -> Option<&Block> {
        self.hash_at_height(height)
            .and_then(|hash| self.nodes.get(&hash))
            .map(|node| &node.block)
    }

    pub fn is_active(&self, hash: &Hash) -> bool {
        match self.nodes.get(hash) {
            Some(node) => self.hash_at_height(node.height()) == Some(*hash),
            None => false,
        }
    }

    /// Add a block whose parent is already known. The block's validity is
    /// the caller's business; the tree only tracks structure and work.
    pub fn insert(&mut self, block: Block) -> ValidationResult<&BlockNode> {
        let hash = block.hash;
        if self.nodes.contains_key(&hash) {
            return Err(RejectReason::AlreadyKnown);
        }
        let parent = self
            .nodes
            .get(&block.header.previous_hash)
            .ok_or(RejectReason::UnknownParent)?;
        if parent.invalid {
            return Err(RejectReason::KnownInvalid);
        }
        let cumulative_work = parent
            .cumulative_work
            .saturating_add(&block_work(block.header.difficulty_target));

        self.children
            .entry(block.header.previous_hash)
            .or_default()
            .push(hash);
        self.nodes.insert(
            hash,
            BlockNode {
                block,
                cumulative_work,
                invalid: false,
            },
        );
        Ok(&self.nodes[&hash])
    }

    /// Walk parent links from `hash` down to `height`
    pub fn ancestor_at(&self, hash: &Hash, height: Natural) -> Option<&BlockNode> {
        let mut node = self.nodes.get(hash)?;
        if node.height() < height {
            return None;
        }
        while node.height() > height {
            node = self.nodes.get(&node.parent())?;
        }
        Some(node)
    }

    /// Last active-chain block on the path to `hash`, and the blocks after
    /// it up to and including `hash`, oldest first
    pub fn find_fork(&self, hash: &Hash) -> Option<(Hash, Vec<Hash>)> {
        let mut branch = Vec::new();
        let mut cursor = *hash;
        loop {
            if self.is_active(&cursor) {
                branch.reverse();
                return Some((cursor, branch));
            }
            let node = self.nodes.get(&cursor)?;
            branch.push(cursor);
            cursor = node.parent();
        }
    }

    /// Mark `hash` and every known descendant invalid
    pub fn mark_invalid(&mut self, hash: &Hash) {
        let mut frontier = vec![*hash];
        let mut visited = HashSet::new();
        while let Some(current) = frontier.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&current) {
                node.invalid = true;
            }
            if let Some(children) = self.children.get(&current) {
                frontier.extend(children.iter().copied());
            }
        }
    }

    pub(crate) fn push_active(&mut self, hash: Hash) {
        self.active.push(hash);
    }

    pub(crate) fn pop_active(&mut self) -> Option<Hash> {
        if self.active.len() > 1 {
            self.active.pop()
        } else {
            None
        }
    }

    pub(crate) fn set_active(&mut self, active: Vec<Hash>) {
        self.active = active;
    }
}
