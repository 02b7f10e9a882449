//! HNSW (Hierarchical Navigable Small World) graph over unit-norm vectors.
//!
//! Similarity is the plain inner product. Node levels come from a seeded LCG,
//! so inserting the same vectors in the same order always yields the same
//! graph. Removal unlinks the node and reconnects its former neighbors to
//! each other.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::store::ann::{dot, IndexError, Neighbor};
use crate::store::ByteReader;

const MAX_LEVEL: usize = 16;
const RNG_SEED: u64 = 42;

#[derive(Debug, Clone)]
struct Node {
    vector: Vec<f32>,
    /// One adjacency list per level, 0..=node level
    neighbors: Vec<Vec<u64>>,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }
}

/// Heap entry: greater means more similar; equal scores prefer the lower id.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    score: f32,
    id: u64,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct HnswIndex {
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    nodes: HashMap<u64, Node>,
    entry: Option<u64>,
    level_max: usize,
    rng_state: u64,
}

impl HnswIndex {
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: ef_construction.max(1),
            ef_search: ef_search.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            nodes: HashMap::new(),
            entry: None,
            level_max: 0,
            rng_state: RNG_SEED,
        }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn ef_construction(&self) -> usize {
        self.ef_construction
    }

    pub fn ef_search(&self) -> usize {
        self.ef_search
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: u64) -> Option<&[f32]> {
        self.nodes.get(&id).map(|n| n.vector.as_slice())
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }

    fn level_limit(&self, level: usize) -> usize {
        if level == 0 {
            self.m_max0
        } else {
            self.m
        }
    }

    /// Level for a new node: floor(-ln(uniform) / ln(M)), capped.
    fn select_level(&mut self) -> usize {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let r = ((self.rng_state >> 11) as f64 / (1u64 << 53) as f64).max(1e-12);
        ((-r.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn score(&self, id: u64, query: &[f32]) -> Option<Scored> {
        self.nodes.get(&id).map(|n| Scored {
            score: dot(&n.vector, query),
            id,
        })
    }

    /// Greedy walk at one level towards the node most similar to `query`.
    fn greedy(&self, entry: u64, query: &[f32], level: usize) -> u64 {
        let Some(mut best) = self.score(entry, query) else {
            return entry;
        };

        loop {
            let mut changed = false;
            let links = self
                .nodes
                .get(&best.id)
                .and_then(|n| n.neighbors.get(level))
                .cloned()
                .unwrap_or_default();

            for nid in links {
                if let Some(candidate) = self.score(nid, query) {
                    if candidate > best {
                        best = candidate;
                        changed = true;
                    }
                }
            }

            if !changed {
                return best.id;
            }
        }
    }

    /// Beam search at one level. Returns up to `ef` nodes, best first.
    fn search_layer(&self, entry: u64, query: &[f32], ef: usize, level: usize) -> Vec<Scored> {
        let Some(first) = self.score(entry, query) else {
            return vec![];
        };

        let mut visited = HashSet::from([entry]);
        let mut candidates = BinaryHeap::from([first]);
        let mut results = BinaryHeap::from([Reverse(first)]);

        while let Some(current) = candidates.pop() {
            if let Some(Reverse(worst)) = results.peek() {
                if results.len() >= ef && current < *worst {
                    break;
                }
            }

            let Some(links) = self.nodes.get(&current.id).and_then(|n| n.neighbors.get(level)) else {
                continue;
            };

            for &nid in links {
                if !visited.insert(nid) {
                    continue;
                }
                let Some(scored) = self.score(nid, query) else {
                    continue;
                };

                let admit = match results.peek() {
                    Some(Reverse(worst)) => results.len() < ef || scored > *worst,
                    None => true,
                };
                if admit {
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        found.sort_by(|a, b| b.cmp(a));
        found
    }

    fn add_link(&mut self, from: u64, to: u64, level: usize) {
        if let Some(node) = self.nodes.get_mut(&from) {
            if let Some(list) = node.neighbors.get_mut(level) {
                if !list.contains(&to) {
                    list.push(to);
                }
            }
        }
    }

    /// Keep the `limit` most similar links of `id` at `level`.
    fn prune(&mut self, id: u64, level: usize, limit: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let Some(list) = node.neighbors.get(level) else {
            return;
        };
        if list.len() <= limit {
            return;
        }

        let mut scored: Vec<Scored> = list
            .iter()
            .filter_map(|&nid| self.score(nid, &node.vector))
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        let kept: Vec<u64> = scored.into_iter().take(limit).map(|s| s.id).collect();

        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[level] = kept;
        }
    }

    /// Insert a node. The caller guarantees `id` is new.
    pub fn insert(&mut self, id: u64, vector: Vec<f32>) {
        let level = self.select_level();
        let query = vector.clone();
        self.nodes.insert(
            id,
            Node {
                vector,
                neighbors: vec![Vec::new(); level + 1],
            },
        );

        let Some(mut ep) = self.entry else {
            self.entry = Some(id);
            self.level_max = level;
            return;
        };

        // descend through the levels above the new node
        let mut lc = self.level_max;
        while lc > level {
            ep = self.greedy(ep, &query, lc);
            lc -= 1;
        }

        for lc in (0..=level.min(self.level_max)).rev() {
            let candidates = self.search_layer(ep, &query, self.ef_construction, lc);
            let selected: Vec<u64> = candidates
                .iter()
                .filter(|c| c.id != id)
                .take(self.m)
                .map(|c| c.id)
                .collect();

            if let Some(node) = self.nodes.get_mut(&id) {
                node.neighbors[lc] = selected.clone();
            }

            let limit = self.level_limit(lc);
            for &nid in &selected {
                self.add_link(nid, id, lc);
                self.prune(nid, lc, limit);
            }

            if let Some(best) = candidates.iter().find(|c| c.id != id) {
                ep = best.id;
            }
        }

        if level > self.level_max {
            self.entry = Some(id);
            self.level_max = level;
        }
    }

    /// Remove a node and patch the holes it leaves. Returns false if absent.
    pub fn remove(&mut self, id: u64) -> bool {
        let Some(removed) = self.nodes.remove(&id) else {
            return false;
        };

        let mut orphaned: Vec<(u64, usize)> = Vec::new();
        for (&nid, node) in self.nodes.iter_mut() {
            for (lc, list) in node.neighbors.iter_mut().enumerate() {
                let before = list.len();
                list.retain(|&x| x != id);
                if list.len() != before {
                    orphaned.push((nid, lc));
                }
            }
        }
        orphaned.sort_unstable();

        for (nid, lc) in orphaned {
            if let Some(replacements) = removed.neighbors.get(lc) {
                for &candidate in replacements {
                    if candidate != nid && self.nodes.contains_key(&candidate) {
                        self.add_link(nid, candidate, lc);
                    }
                }
            }
            let limit = self.level_limit(lc);
            self.prune(nid, lc, limit);
        }

        if self.entry == Some(id) {
            let top = self
                .nodes
                .iter()
                .map(|(&nid, node)| (node.level(), Reverse(nid)))
                .max();
            match top {
                Some((level, Reverse(nid))) => {
                    self.entry = Some(nid);
                    self.level_max = level;
                }
                None => {
                    self.entry = None;
                    self.level_max = 0;
                }
            }
        }

        true
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let Some(mut ep) = self.entry else {
            return vec![];
        };

        for lc in (1..=self.level_max).rev() {
            ep = self.greedy(ep, query, lc);
        }

        let ef = self.ef_search.max(k);
        self.search_layer(ep, query, ef, 0)
            .into_iter()
            .take(k)
            .map(|s| Neighbor {
                id: s.id,
                score: s.score,
            })
            .collect()
    }

    pub(crate) fn write_body(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&(self.m as u16).to_le_bytes());
        buffer.extend_from_slice(&(self.ef_construction as u32).to_le_bytes());
        buffer.extend_from_slice(&(self.ef_search as u32).to_le_bytes());
        buffer.push(self.level_max as u8);
        match self.entry {
            Some(entry) => {
                buffer.push(1);
                buffer.extend_from_slice(&entry.to_le_bytes());
            }
            None => {
                buffer.push(0);
                buffer.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        buffer.extend_from_slice(&self.rng_state.to_le_bytes());
        buffer.extend_from_slice(&(self.nodes.len() as u64).to_le_bytes());

        // sorted for a stable byte layout
        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let node = &self.nodes[&id];
            buffer.extend_from_slice(&id.to_le_bytes());
            buffer.push(node.neighbors.len() as u8);
            for value in &node.vector {
                buffer.extend_from_slice(&value.to_le_bytes());
            }
            for list in &node.neighbors {
                buffer.extend_from_slice(&(list.len() as u16).to_le_bytes());
                for nid in list {
                    buffer.extend_from_slice(&nid.to_le_bytes());
                }
            }
        }
    }

    pub(crate) fn read_body(reader: &mut ByteReader<'_>, dimensions: usize) -> Result<Self, IndexError> {
        let m = reader.u16("m")? as usize;
        let ef_construction = reader.u32("ef_construction")? as usize;
        let ef_search = reader.u32("ef_search")? as usize;
        let level_max = reader.u8("level_max")? as usize;
        let has_entry = reader.u8("entry flag")? != 0;
        let entry_raw = reader.u64("entry")?;
        let rng_state = reader.u64("rng state")?;
        let count = reader.u64("node count")?;

        let mut index = Self::new(m, ef_construction, ef_search);
        index.level_max = level_max;
        index.entry = has_entry.then_some(entry_raw);
        index.rng_state = rng_state;

        for _ in 0..count {
            let id = reader.u64("node id")?;
            let level_count = reader.u8("level count")? as usize;
            if level_count == 0 || level_count > MAX_LEVEL + 1 {
                return Err(IndexError::Corrupt(format!("node {id} has {level_count} levels")));
            }
            let vector = reader.f32s(dimensions, "node vector")?;

            let mut neighbors = Vec::with_capacity(level_count);
            for _ in 0..level_count {
                let n = reader.u16("neighbor count")? as usize;
                let mut list = Vec::with_capacity(n);
                for _ in 0..n {
                    list.push(reader.u64("neighbor id")?);
                }
                neighbors.push(list);
            }

            if index.nodes.insert(id, Node { vector, neighbors }).is_some() {
                return Err(IndexError::DuplicateId(id));
            }
        }

        index.validate()?;
        Ok(index)
    }

    /// Structural checks for a decoded graph.
    fn validate(&self) -> Result<(), IndexError> {
        match self.entry {
            Some(entry) => {
                let node = self
                    .nodes
                    .get(&entry)
                    .ok_or_else(|| IndexError::Corrupt(format!("entry point {entry} is missing")))?;
                if node.level() != self.level_max {
                    return Err(IndexError::Corrupt("entry point level mismatch".to_string()));
                }
            }
            None if !self.nodes.is_empty() => {
                return Err(IndexError::Corrupt("non-empty graph without entry point".to_string()));
            }
            None => {}
        }

        for (id, node) in &self.nodes {
            for (lc, list) in node.neighbors.iter().enumerate() {
                for nid in list {
                    let linked = self
                        .nodes
                        .get(nid)
                        .ok_or_else(|| IndexError::Corrupt(format!("node {id} links to missing {nid}")))?;
                    if linked.level() < lc {
                        return Err(IndexError::Corrupt(format!(
                            "node {id} links to {nid} above its level"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random unit vectors.
    fn vectors(n: usize, dims: usize) -> Vec<Vec<f32>> {
        let mut state = 7u64;
        (0..n)
            .map(|_| {
                let mut v: Vec<f32> = (0..dims)
                    .map(|_| {
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                        ((state >> 40) as f32 / (1u64 << 24) as f32) - 0.5
                    })
                    .collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                v.iter_mut().for_each(|x| *x /= norm);
                v
            })
            .collect()
    }

    fn exact_top(data: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u64> {
        let mut scored: Vec<Scored> = data
            .iter()
            .enumerate()
            .map(|(i, v)| Scored {
                score: dot(v, query),
                id: i as u64,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.into_iter().take(k).map(|s| s.id).collect()
    }

    #[test]
    fn test_level_distribution() {
        let mut hnsw = HnswIndex::new(16, 100, 50);
        let mut levels = [0u32; MAX_LEVEL + 1];

        for _ in 0..10000 {
            levels[hnsw.select_level()] += 1;
        }

        // Most should be level 0
        assert!(levels[0] > 8000, "Level 0 should be most common");
        assert!(levels[0] > levels[1]);
    }

    #[test]
    fn test_recall_on_small_set() {
        let data = vectors(300, 16);
        let mut hnsw = HnswIndex::new(8, 64, 64);
        for (i, v) in data.iter().enumerate() {
            hnsw.insert(i as u64, v.clone());
        }

        let queries = vectors(20, 16);
        let mut hits = 0;
        for q in &queries {
            let expected = exact_top(&data, q, 10);
            let got: Vec<u64> = hnsw.search(q, 10).into_iter().map(|n| n.id).collect();
            hits += got.iter().filter(|id| expected.contains(id)).count();
        }

        assert!(hits >= 180, "recall too low: {hits}/200");
    }

    #[test]
    fn test_remove_entry_point_keeps_graph_searchable() {
        let data = vectors(50, 8);
        let mut hnsw = HnswIndex::new(4, 32, 32);
        for (i, v) in data.iter().enumerate() {
            hnsw.insert(i as u64, v.clone());
        }

        let entry = hnsw.entry.unwrap();
        assert!(hnsw.remove(entry));
        assert!(!hnsw.remove(entry));
        assert_eq!(hnsw.len(), 49);
        hnsw.validate().unwrap();

        let results = hnsw.search(&data[entry as usize], 49);
        assert!(results.iter().all(|n| n.id != entry));
        assert!(results.len() >= 40);
    }

    #[test]
    fn test_remove_last_node_empties_graph() {
        let mut hnsw = HnswIndex::new(4, 16, 16);
        hnsw.insert(1, vec![1.0, 0.0]);
        assert!(hnsw.remove(1));
        assert!(hnsw.entry.is_none());
        assert!(hnsw.search(&[1.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_same_inserts_same_graph() {
        let data = vectors(40, 8);
        let build = || {
            let mut hnsw = HnswIndex::new(4, 16, 16);
            for (i, v) in data.iter().enumerate() {
                hnsw.insert(i as u64, v.clone());
            }
            let mut buf = Vec::new();
            hnsw.write_body(&mut buf);
            buf
        };
        assert_eq!(build(), build());
    }
}
