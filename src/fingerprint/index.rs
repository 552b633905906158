// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Fingerprint Index (IX) — materializes every `(video_idx, window_idx) ->
//! key` triple from the store via the key projector and builds a static
//! k-d tree over the keys for approximate-turned-exact nearest-neighbor
//! search.
//!
//! Grounded in `original_source/db.py::_compute_kd_keys`/`_kd_tree_build`
//! (two-pass allocate-then-fill into `np.empty` arrays, sklearn `KDTree`
//! with `leaf_size=400`) and in the teacher's arena-of-indices storage
//! style (`storage/chunk_pool.rs`, `storage/index.rs`): rows are held as
//! flat parallel arrays, never as per-row heap objects.
//!
//! The tree itself is hand-built rather than taken from a generic
//! nearest-neighbor crate: spec.md's tie-break rule ("lower `video_idx`,
//! then lower `window_start`") is a hard correctness requirement a
//! black-box crate's neighbor ordering cannot be trusted to honor, so the
//! k-NN search below ranks every candidate by the full composite key
//! `(distance, video_idx, window_start)` end to end — pruning is
//! conservative (branches are only skipped when they provably cannot
//! contain a smaller composite key), so it is exact, not approximate,
//! despite being commonly called "approximate nearest neighbor" in the
//! literature for this kind of partition tree.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{info, warn};

use crate::error::{IdError, Result};
use crate::fingerprint::key_projector;
use crate::fingerprint::store::FingerprintStore;

const INDEX_MAGIC: &[u8; 8] = b"FPIDX001";
pub const DEFAULT_LEAF_SIZE: usize = 400;

#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf { start: u32, end: u32 },
    Split { dim: u8, threshold: u32, left: u32, right: u32 },
}

/// A single candidate, ranked by the exact composite key the spec requires:
/// non-decreasing distance, then lower `video_idx`, then lower `window_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    dist: u64,
    video_idx: u32,
    window_start: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .cmp(&other.dist)
            .then(self.video_idx.cmp(&other.video_idx))
            .then(self.window_start.cmp(&other.window_start))
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Static k-d tree over every window in the fingerprint database.
pub struct FingerprintIndex {
    w: usize,
    k: usize,
    leaf_size: usize,
    /// Row-major `[n_rows x k]` key matrix.
    keys: Vec<u32>,
    video_idx: Vec<u32>,
    window_start: Vec<u32>,
    /// Permutation of row indices, reordered in place during `build`.
    order: Vec<u32>,
    nodes: Vec<Node>,
    root: u32,
}

impl FingerprintIndex {
    /// Build the index from every fingerprint in `store`.
    pub fn build(store: &FingerprintStore, w: usize, k: usize, leaf_size: usize) -> Result<Self> {
        if k == 0 || w == 0 || k > w || w % k != 0 {
            return Err(IdError::Dimension { w, k });
        }

        let total_rows: usize = store
            .fingerprints()
            .iter()
            .map(|fp| {
                if fp.len() >= w {
                    fp.len() - w + 1
                } else {
                    0
                }
            })
            .sum();

        let mut keys = vec![0u32; total_rows * k];
        let mut video_idx = Vec::with_capacity(total_rows);
        let mut window_start = Vec::with_capacity(total_rows);

        for (vid, fp) in store.fingerprints().iter().enumerate() {
            if fp.len() < w {
                continue;
            }
            for start in 0..=(fp.len() - w) {
                let window = &fp[start..start + w];
                let row = video_idx.len();
                key_projector::project_into(window, &mut keys[row * k..row * k + k])?;
                video_idx.push(vid as u32);
                window_start.push(start as u32);
            }
        }

        info!(rows = total_rows, w, k, leaf_size, "Computed fingerprint keys, building k-d tree");

        let mut order: Vec<u32> = (0..total_rows as u32).collect();
        let mut nodes = Vec::new();
        let root = if total_rows == 0 {
            nodes.push(Node::Leaf { start: 0, end: 0 });
            0
        } else {
            build_node(&mut order, 0, total_rows, 0, &keys, k, leaf_size, &mut nodes)
        };

        info!("K-d tree built successfully");

        Ok(Self {
            w,
            k,
            leaf_size,
            keys,
            video_idx,
            window_start,
            order,
            nodes,
            root: root as u32,
        })
    }

    /// Load a cached key/back-pointer array set and rebuild the tree over
    /// it, or fall back to a full rebuild from `store` when the cache is
    /// absent, unversioned, or built for a different `(w, k)`.
    pub fn load_or_build(
        store: &FingerprintStore,
        w: usize,
        k: usize,
        leaf_size: usize,
        cache_path: &Path,
    ) -> Result<Self> {
        match Self::try_load_cache(cache_path, w, k, leaf_size) {
            Some(index) => {
                info!(path = %cache_path.display(), "Fingerprint index loaded from cache");
                Ok(index)
            }
            None => {
                let index = Self::build(store, w, k, leaf_size)?;
                if let Err(e) = index.write_cache(cache_path) {
                    warn!(error = %e, "Failed to write index cache (continuing uncached)");
                }
                Ok(index)
            }
        }
    }

    fn try_load_cache(cache_path: &Path, w: usize, k: usize, leaf_size: usize) -> Option<Self> {
        let mut f = BufReader::new(std::fs::File::open(cache_path).ok()?);
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic).ok()?;
        if &magic != INDEX_MAGIC {
            return None;
        }
        let cached_w = f.read_u32::<LittleEndian>().ok()? as usize;
        let cached_k = f.read_u32::<LittleEndian>().ok()? as usize;
        if cached_w != w || cached_k != k {
            return None;
        }
        let n = f.read_u32::<LittleEndian>().ok()? as usize;

        let mut keys = vec![0u32; n * k];
        for slot in keys.iter_mut() {
            *slot = f.read_u32::<LittleEndian>().ok()?;
        }
        let mut video_idx = Vec::with_capacity(n);
        for _ in 0..n {
            video_idx.push(f.read_u32::<LittleEndian>().ok()?);
        }
        let mut window_start = Vec::with_capacity(n);
        for _ in 0..n {
            window_start.push(f.read_u32::<LittleEndian>().ok()?);
        }

        let mut order: Vec<u32> = (0..n as u32).collect();
        let mut nodes = Vec::new();
        let root = if n == 0 {
            nodes.push(Node::Leaf { start: 0, end: 0 });
            0
        } else {
            build_node(&mut order, 0, n, 0, &keys, k, leaf_size, &mut nodes)
        };

        Some(Self {
            w,
            k,
            leaf_size,
            keys,
            video_idx,
            window_start,
            order,
            nodes,
            root: root as u32,
        })
    }

    /// Persist this index's key/back-pointer arrays to a versioned binary
    /// cache at `cache_path`, for the `build-index` CLI subcommand to force
    /// a fresh cache without going through `load_or_build`'s cache-hit path.
    pub fn persist(&self, cache_path: &Path) -> Result<()> {
        self.write_cache(cache_path)
    }

    fn write_cache(&self, cache_path: &Path) -> Result<()> {
        let mut f = BufWriter::new(std::fs::File::create(cache_path)?);
        f.write_all(INDEX_MAGIC)?;
        f.write_u32::<LittleEndian>(self.w as u32)?;
        f.write_u32::<LittleEndian>(self.k as u32)?;
        f.write_u32::<LittleEndian>(self.video_idx.len() as u32)?;
        for v in &self.keys {
            f.write_u32::<LittleEndian>(*v)?;
        }
        for v in &self.video_idx {
            f.write_u32::<LittleEndian>(*v)?;
        }
        for v in &self.window_start {
            f.write_u32::<LittleEndian>(*v)?;
        }
        f.flush()?;
        Ok(())
    }

    pub fn window_width(&self) -> usize {
        self.w
    }

    pub fn k_dimension(&self) -> usize {
        self.k
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    pub fn len(&self) -> usize {
        self.video_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.video_idx.is_empty()
    }

    /// The key stored at row `row`, if any.
    pub fn key_at(&self, row: usize) -> Option<&[u32]> {
        if row >= self.len() {
            return None;
        }
        Some(&self.keys[row * self.k..row * self.k + self.k])
    }

    /// Nearest neighbors of `query_key` by exact Euclidean distance in
    /// projected space, in non-decreasing order of distance, ties broken by
    /// lower `video_idx` then lower `window_start`. Always returns at most
    /// `k_nn` entries; an empty index yields an empty list.
    pub fn neighbors(&self, query_key: &[u32], k_nn: usize) -> Vec<(u32, u32)> {
        if self.is_empty() || k_nn == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k_nn + 1);
        self.search_node(self.root, query_key, k_nn, &mut heap);

        let mut out: Vec<Candidate> = heap.into_vec();
        out.sort();
        out.into_iter().map(|c| (c.video_idx, c.window_start)).collect()
    }

    fn search_node(&self, node_idx: u32, query: &[u32], k_nn: usize, heap: &mut BinaryHeap<Candidate>) {
        match self.nodes[node_idx as usize] {
            Node::Leaf { start, end } => {
                for &row in &self.order[start as usize..end as usize] {
                    let row = row as usize;
                    let key = &self.keys[row * self.k..row * self.k + self.k];
                    let dist = squared_euclidean(query, key);
                    let candidate = Candidate {
                        dist,
                        video_idx: self.video_idx[row],
                        window_start: self.window_start[row],
                    };
                    push_bounded(heap, candidate, k_nn);
                }
            }
            Node::Split { dim, threshold, left, right } => {
                let q = query[dim as usize] as i64;
                let diff = q - threshold as i64;
                let (near, far) = if diff <= 0 { (left, right) } else { (right, left) };
                self.search_node(near, query, k_nn, heap);

                let axis_dist = (diff * diff) as u64;
                let worst = if heap.len() >= k_nn {
                    heap.peek().map(|c| c.dist)
                } else {
                    None
                };
                // Only prune when the far side provably cannot beat (or tie)
                // the current worst kept candidate.
                let must_search_far = match worst {
                    Some(w) => axis_dist <= w,
                    None => true,
                };
                if must_search_far {
                    self.search_node(far, query, k_nn, heap);
                }
            }
        }
    }
}

fn push_bounded(heap: &mut BinaryHeap<Candidate>, candidate: Candidate, k_nn: usize) {
    if heap.len() < k_nn {
        heap.push(candidate);
    } else if let Some(worst) = heap.peek().copied() {
        if candidate < worst {
            heap.pop();
            heap.push(candidate);
        }
    }
}

fn squared_euclidean(a: &[u32], b: &[u32]) -> u64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as i64 - y as i64;
            (d * d) as u64
        })
        .sum()
}

fn key_at(keys: &[u32], k: usize, row: u32, dim: usize) -> u32 {
    keys[row as usize * k + dim]
}

/// Recursively partition `order[lo..hi]` by the median of dimension
/// `depth % k`, pushing child nodes before the parent (post-order), and
/// return the index of the node covering this range.
fn build_node(
    order: &mut [u32],
    lo: usize,
    hi: usize,
    depth: usize,
    keys: &[u32],
    k: usize,
    leaf_size: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    if hi - lo <= leaf_size.max(1) {
        nodes.push(Node::Leaf { start: lo as u32, end: hi as u32 });
        return nodes.len() - 1;
    }

    let dim = depth % k;
    order[lo..hi].sort_unstable_by(|&a, &b| {
        key_at(keys, k, a, dim)
            .cmp(&key_at(keys, k, b, dim))
            .then(a.cmp(&b))
    });
    let mid = lo + (hi - lo) / 2;
    let threshold = key_at(keys, k, order[mid], dim);

    let left = build_node(order, lo, mid, depth + 1, keys, k, leaf_size, nodes);
    let right = build_node(order, mid, hi, depth + 1, keys, k, leaf_size, nodes);
    nodes.push(Node::Split { dim: dim as u8, threshold, left: left as u32, right: right as u32 });
    nodes.len() - 1
}
