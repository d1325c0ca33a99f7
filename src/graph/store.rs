//! Layered proximity graph storage.
//!
//! Adjacency is an arena of per-node, per-layer neighbor lists indexed by
//! internal id; there is no pointer graph. Layer 0 holds up to
//! `2 * max_degree` neighbors, every layer above holds up to `max_degree`.
//! Exactly one entry point exists once the graph is non-empty, and it lies
//! on the current top layer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphStore {
    max_degree: usize,
    /// `adjacency[id][layer]` is the out-neighbor list of `id` at `layer`.
    adjacency: Vec<Vec<Vec<u32>>>,
    /// Top layer of each node.
    levels: Vec<u8>,
    entry_point: Option<u32>,
    max_layer: usize,
}

impl GraphStore {
    pub fn new(max_degree: usize) -> Self {
        Self {
            max_degree,
            adjacency: Vec::new(),
            levels: Vec::new(),
            entry_point: None,
            max_layer: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    #[inline]
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Out-adjacency cap for a layer.
    #[inline]
    pub fn cap(&self, layer: usize) -> usize {
        if layer == 0 {
            2 * self.max_degree
        } else {
            self.max_degree
        }
    }

    #[inline]
    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    #[inline]
    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    #[inline]
    pub fn level(&self, id: u32) -> usize {
        self.levels[id as usize] as usize
    }

    /// Append a node with adjacency lists for layers `0..=level`.
    ///
    /// The entry point moves only when the new node tops the current highest
    /// layer, so the first node to reach a layer stays the entry for it.
    pub fn new_node(&mut self, level: usize) -> u32 {
        let id = self.adjacency.len() as u32;
        let mut layers = Vec::with_capacity(level + 1);
        for layer in 0..=level {
            layers.push(Vec::with_capacity(self.cap(layer).min(8)));
        }
        self.adjacency.push(layers);
        self.levels.push(level as u8);
        match self.entry_point {
            None => {
                self.entry_point = Some(id);
                self.max_layer = level;
            }
            Some(_) if level > self.max_layer => {
                self.entry_point = Some(id);
                self.max_layer = level;
            }
            Some(_) => {}
        }
        id
    }

    #[inline]
    pub fn neighbors(&self, id: u32, layer: usize) -> &[u32] {
        let node = &self.adjacency[id as usize];
        if layer < node.len() {
            &node[layer]
        } else {
            &[]
        }
    }

    /// Swap in a whole adjacency list for one node at one layer.
    pub fn replace_adjacency(&mut self, id: u32, layer: usize, mut list: Vec<u32>) {
        let cap = self.cap(layer);
        if list.len() > cap {
            list.truncate(cap);
        }
        self.adjacency[id as usize][layer] = list;
    }

    /// Append one neighbor without capacity enforcement; callers prune with
    /// [`replace_adjacency`](Self::replace_adjacency) when over cap.
    pub fn push_neighbor(&mut self, id: u32, layer: usize, neighbor: u32) {
        self.adjacency[id as usize][layer].push(neighbor);
    }

    /// Install a prebuilt layer-0 adjacency, one list per existing node.
    pub fn install_base_layer(&mut self, lists: Vec<Vec<u32>>) -> Result<()> {
        if lists.len() != self.adjacency.len() {
            return Err(Error::InternalError(format!(
                "base layer has {} lists for {} nodes",
                lists.len(),
                self.adjacency.len()
            )));
        }
        for (id, mut list) in lists.into_iter().enumerate() {
            let cap = self.cap(0);
            if list.len() > cap {
                list.truncate(cap);
            }
            self.adjacency[id][0] = list;
        }
        Ok(())
    }

    /// Bytes held live by the adjacency arena.
    pub fn memory_usage(&self) -> usize {
        let mut bytes = self.adjacency.capacity() * std::mem::size_of::<Vec<Vec<u32>>>()
            + self.levels.capacity();
        for node in &self.adjacency {
            bytes += node.capacity() * std::mem::size_of::<Vec<u32>>();
            for layer in node {
                bytes += layer.capacity() * std::mem::size_of::<u32>();
            }
        }
        bytes
    }

    /// Structural consistency check after deserialization.
    ///
    /// Verifies array lengths, adjacency caps, neighbor id bounds, and that
    /// every edge endpoint exists at the edge's layer.
    pub fn validate(&self) -> Result<()> {
        let n = self.adjacency.len();
        if self.levels.len() != n {
            return Err(Error::InvalidBinary(
                "level array length does not match node count".into(),
            ));
        }
        match self.entry_point {
            None if n > 0 => {
                return Err(Error::InvalidBinary("missing entry point".into()));
            }
            Some(ep) => {
                if ep as usize >= n {
                    return Err(Error::InvalidBinary(format!(
                        "entry point {ep} out of bounds"
                    )));
                }
                if self.level(ep) != self.max_layer {
                    return Err(Error::InvalidBinary(
                        "entry point is not on the top layer".into(),
                    ));
                }
            }
            None => {}
        }
        for (id, node) in self.adjacency.iter().enumerate() {
            if node.len() != self.levels[id] as usize + 1 {
                return Err(Error::InvalidBinary(format!(
                    "node {id} has {} layers but level {}",
                    node.len(),
                    self.levels[id]
                )));
            }
            for (layer, list) in node.iter().enumerate() {
                if list.len() > self.cap(layer) {
                    return Err(Error::InvalidBinary(format!(
                        "node {id} exceeds adjacency cap at layer {layer}"
                    )));
                }
                for &nb in list {
                    if nb as usize >= n {
                        return Err(Error::InvalidBinary(format!(
                            "node {id} references out-of-bounds neighbor {nb}"
                        )));
                    }
                    if (self.levels[nb as usize] as usize) < layer {
                        return Err(Error::InvalidBinary(format!(
                            "edge {id}->{nb} at layer {layer} dangles below neighbor's level"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
