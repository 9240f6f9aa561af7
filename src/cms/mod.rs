use std::fmt;

use crate::flow::{CounterCell, FlowKey};
use crate::hashing::{bucket, FlowHasher, HashRole};

/// A flow table entry: the flow and the cells it was counted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFlow {
    pub key: FlowKey,
    pub cells: Vec<usize>,
}

impl fmt::Display for BlockFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} idx", self.key)?;
        for c in &self.cells {
            write!(f, " {}", c)?;
        }
        Ok(())
    }
}

/// Independent counting unit: the flows mapped to it and its counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub flow_table: Vec<BlockFlow>,
    pub count_table: Vec<CounterCell>,
    pub overflowed: bool,
}

impl Block {
    fn with_capacity(cells_per_block: usize, flow_table_capacity: usize) -> Block {
        Block {
            flow_table: Vec::with_capacity(flow_table_capacity),
            count_table: vec![CounterCell::default(); cells_per_block],
            overflowed: false,
        }
    }

    fn clear(&mut self) {
        self.flow_table.clear();
        for c in self.count_table.iter_mut() {
            *c = CounterCell::default();
        }
        self.overflowed = false;
    }

    pub fn packets(&self) -> u64 {
        self.count_table.iter().map(|c| c.packets).sum()
    }
}

/// The blocks of one switch. Memory is fixed by the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    cells_per_block: usize,
    hash_function_count: usize,
    flow_table_capacity: usize,
    pub blocks: Vec<Block>,
}

impl Sketch {
    pub fn build_sketch(
        cells_per_block: usize,
        hash_function_count: usize,
        num_blocks: usize,
        flow_table_capacity: usize,
    ) -> Sketch {
        Sketch {
            cells_per_block,
            hash_function_count,
            flow_table_capacity,
            blocks: (0..num_blocks)
                .map(|_| Block::with_capacity(cells_per_block, flow_table_capacity))
                .collect(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn cells_per_block(&self) -> usize {
        self.cells_per_block
    }

    pub fn flow_table_capacity(&self) -> usize {
        self.flow_table_capacity
    }

    /// Block index and cell indices of `key`.
    pub fn index<H: FlowHasher + ?Sized>(&self, hasher: &H, key: &FlowKey) -> (usize, Vec<usize>) {
        let block = bucket(hasher.hash(key, HashRole::Block), self.blocks.len());
        let cells = (0..self.hash_function_count)
            .map(|k| bucket(hasher.hash(key, HashRole::Cell(k as u32)), self.cells_per_block))
            .collect();
        (block, cells)
    }

    /// Counts one packet. Returns false if the flow was novel but its block's
    /// flow table was already full.
    pub fn insert(
        &mut self,
        block: usize,
        cells: Vec<usize>,
        key: FlowKey,
        bytes: u32,
        is_new: bool,
    ) -> bool {
        let capacity = self.flow_table_capacity;
        let b = &mut self.blocks[block];
        for &i in &cells {
            let cell = &mut b.count_table[i];
            cell.packets += 1;
            cell.bytes += bytes as u64;
            if is_new {
                cell.new_flows += 1;
            }
        }
        if is_new {
            if b.flow_table.len() >= capacity {
                b.overflowed = true;
                return false;
            }
            b.flow_table.push(BlockFlow { key, cells });
        }
        true
    }

    pub fn clear(&mut self) {
        for b in self.blocks.iter_mut() {
            b.clear();
        }
    }

    pub fn num_flows(&self) -> usize {
        self.blocks.iter().map(|b| b.flow_table.len()).sum()
    }

    /// Fraction of non-empty counters.
    pub fn get_load(&self) -> f32 {
        let used: usize = (0..self.blocks.len()).map(|b| self.used_cells(b)).sum();
        used as f32 / (self.cells_per_block * self.blocks.len()) as f32
    }

    pub fn get_block_load(&self, block: usize) -> f32 {
        self.used_cells(block) as f32 / self.cells_per_block as f32
    }

    fn used_cells(&self, block: usize) -> usize {
        self.blocks[block].count_table.iter().filter(|c| !c.is_empty()).count()
    }

    /// Bytes reserved by the counters and flow tables.
    pub fn footprint(&self) -> usize {
        let cell = std::mem::size_of::<CounterCell>();
        let entry = std::mem::size_of::<BlockFlow>()
            + self.hash_function_count * std::mem::size_of::<usize>();
        self.blocks.len() * (self.cells_per_block * cell + self.flow_table_capacity * entry)
    }
}
