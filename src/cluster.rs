use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::assoc::{Accounting, AssocConfig};
use crate::bitmap::Bitmap;
use crate::engine::EngineError;
use crate::model::{JobRecord, NodeRecord, NodeState, PartitionRecord};

/// Sentinel node expression meaning every node (or every partition node
/// when the partition-mirror flag is set).
pub const ALL_NODES: &str = "ALL";

// ── Node table ───────────────────────────────────────────────────

/// Read-only array of node records plus the name↔bitmap resolver and the
/// global core index space (prefix sums of per-node CPU counts).
pub struct NodeTable {
    nodes: Vec<NodeRecord>,
    by_name: HashMap<String, usize>,
    core_offset: Vec<u32>,
    total_cores: u32,
}

impl NodeTable {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        let by_name = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let mut core_offset = Vec::with_capacity(nodes.len());
        let mut total = 0u32;
        for n in &nodes {
            core_offset.push(total);
            total += n.cpus;
        }
        Self {
            nodes,
            by_name,
            core_offset,
            total_cores: total,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&NodeRecord> {
        self.nodes.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn total_cores(&self) -> u32 {
        self.total_cores
    }

    /// Global core indices belonging to node `idx`.
    pub fn core_range(&self, idx: usize) -> std::ops::Range<usize> {
        let start = self.core_offset[idx] as usize;
        start..start + self.nodes[idx].cpus as usize
    }

    pub fn all_bitmap(&self) -> Bitmap {
        Bitmap::filled(self.nodes.len())
    }

    /// Nodes not down, draining, or unresponsive.
    pub fn avail_bitmap(&self) -> Bitmap {
        let mut bm = Bitmap::new(self.nodes.len());
        for (i, n) in self.nodes.iter().enumerate() {
            if n.state.is_available() {
                bm.set(i);
            }
        }
        bm
    }

    pub fn feature_bitmap(&self, tag: &str) -> Bitmap {
        let mut bm = Bitmap::new(self.nodes.len());
        for (i, n) in self.nodes.iter().enumerate() {
            if n.features.iter().any(|f| f == tag) {
                bm.set(i);
            }
        }
        bm
    }

    pub fn has_feature_tag(&self, tag: &str) -> bool {
        self.nodes.iter().any(|n| n.features.iter().any(|f| f == tag))
    }

    pub fn sum_cpus(&self, bm: &Bitmap) -> u32 {
        bm.iter_ones().map(|i| self.nodes[i].cpus).sum()
    }

    pub fn set_state(&mut self, name: &str, state: NodeState) -> bool {
        match self.by_name.get(name) {
            Some(&i) => {
                self.nodes[i].state = state;
                true
            }
            None => false,
        }
    }

    /// Resolve a node-name expression (`tux[1-3,7],login0` or `ALL`) to a
    /// bitmap over node indices.
    pub fn expr_to_bitmap(&self, expr: &str) -> Result<Bitmap, EngineError> {
        if expr == ALL_NODES {
            return Ok(self.all_bitmap());
        }
        let mut bm = Bitmap::new(self.nodes.len());
        for name in expand_hostlist(expr)? {
            match self.by_name.get(&name) {
                Some(&i) => bm.set(i),
                None => return Err(EngineError::UnknownNode(name)),
            }
        }
        Ok(bm)
    }

    /// Inverse of `expr_to_bitmap`: a compact `tux[1-3,7]` style expression.
    pub fn bitmap_to_expr(&self, bm: &Bitmap) -> String {
        let names: Vec<&str> = bm
            .iter_ones()
            .filter_map(|i| self.nodes.get(i).map(|n| n.name.as_str()))
            .collect();
        compact_hostlist(&names)
    }
}

// ── Hostlist expressions ─────────────────────────────────────────

/// Expand `tux[1-3,7],login0` into individual node names, preserving
/// zero-padding (`n[08-10]` → n08, n09, n10).
pub fn expand_hostlist(expr: &str) -> Result<Vec<String>, EngineError> {
    let mut out = Vec::new();
    for part in split_outside_brackets(expr) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.find('[') {
            None => out.push(part.to_string()),
            Some(open) => {
                let Some(close) = part.rfind(']') else {
                    return Err(EngineError::UnknownNode(part.to_string()));
                };
                let prefix = &part[..open];
                let ranges = &part[open + 1..close];
                for range in ranges.split(',') {
                    let (lo, hi) = match range.split_once('-') {
                        Some((a, b)) => (a, b),
                        None => (range, range),
                    };
                    let width = if lo.len() == hi.len() && lo.starts_with('0') {
                        lo.len()
                    } else {
                        0
                    };
                    let (lo_n, hi_n) = match (lo.parse::<u64>(), hi.parse::<u64>()) {
                        (Ok(a), Ok(b)) if a <= b => (a, b),
                        _ => return Err(EngineError::UnknownNode(part.to_string())),
                    };
                    for n in lo_n..=hi_n {
                        out.push(format!("{prefix}{n:0width$}"));
                    }
                }
            }
        }
    }
    Ok(out)
}

fn split_outside_brackets(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    parts
}

/// Compact a list of node names into range expressions, grouping by common
/// prefix and digit width.
pub fn compact_hostlist(names: &[&str]) -> String {
    // (prefix, width) → sorted numeric suffixes; non-numeric names pass through.
    let mut groups: Vec<((String, usize), Vec<u64>)> = Vec::new();
    let mut plain: Vec<&str> = Vec::new();

    for name in names {
        let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            plain.push(name);
            continue;
        }
        let (prefix, num) = name.split_at(name.len() - digits);
        let Ok(n) = num.parse::<u64>() else {
            plain.push(name);
            continue;
        };
        let width = if num.starts_with('0') { num.len() } else { 0 };
        let key = (prefix.to_string(), width);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => v.push(n),
            None => groups.push((key, vec![n])),
        }
    }

    let mut out: Vec<String> = plain.iter().map(|s| s.to_string()).collect();
    for ((prefix, width), mut nums) in groups {
        nums.sort_unstable();
        nums.dedup();
        if nums.len() == 1 {
            out.push(format!("{prefix}{:0width$}", nums[0]));
            continue;
        }
        let mut ranges: Vec<String> = Vec::new();
        let mut lo = nums[0];
        let mut hi = nums[0];
        for &n in &nums[1..] {
            if n == hi + 1 {
                hi = n;
            } else {
                ranges.push(format_range(lo, hi, width));
                lo = n;
                hi = n;
            }
        }
        ranges.push(format_range(lo, hi, width));
        out.push(format!("{prefix}[{}]", ranges.join(",")));
    }
    out.join(",")
}

fn format_range(lo: u64, hi: u64, width: usize) -> String {
    if lo == hi {
        format!("{lo:0width$}")
    } else {
        format!("{lo:0width$}-{hi:0width$}")
    }
}

// ── Partition table ──────────────────────────────────────────────

pub struct PartitionTable {
    parts: Vec<PartitionRecord>,
    by_name: HashMap<String, usize>,
    default_idx: Option<usize>,
}

impl PartitionTable {
    pub fn new(parts: Vec<PartitionRecord>) -> Self {
        let by_name = parts
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        let default_idx = parts.iter().position(|p| p.is_default);
        Self {
            parts,
            by_name,
            default_idx,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PartitionRecord> {
        self.by_name.get(name).map(|&i| &self.parts[i])
    }

    pub fn default_partition(&self) -> Option<&PartitionRecord> {
        self.default_idx.map(|i| &self.parts[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.parts.iter()
    }
}

// ── Job table ────────────────────────────────────────────────────

/// In-memory mirror of the dispatcher's job records. The reservation
/// manager reads everything and writes only the `resv_id` back-reference.
#[derive(Default)]
pub struct JobTable {
    jobs: Vec<JobRecord>,
    by_id: HashMap<u32, usize>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, job: JobRecord) {
        match self.by_id.get(&job.job_id) {
            Some(&i) => self.jobs[i] = job,
            None => {
                self.by_id.insert(job.job_id, self.jobs.len());
                self.jobs.push(job);
            }
        }
    }

    pub fn get(&self, job_id: u32) -> Option<&JobRecord> {
        self.by_id.get(&job_id).map(|&i| &self.jobs[i])
    }

    pub fn bind_resv(&mut self, job_id: u32, resv_id: Option<u32>) {
        if let Some(&i) = self.by_id.get(&job_id) {
            self.jobs[i].resv_id = resv_id;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter()
    }

    pub fn running(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|j| j.state.is_running())
    }

    /// True if any unfinished job still references the reservation.
    pub fn references_resv(&self, resv_id: u32, resv_name: &str) -> bool {
        self.jobs.iter().any(|j| {
            !j.state.is_finished()
                && (j.resv_id == Some(resv_id)
                    || j.resv_name.as_deref() == Some(resv_name))
        })
    }
}

// ── Cluster layout configuration ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub cpus: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Hostlist expression; empty means "nodes that list this partition".
    #[serde(default)]
    pub nodes: String,
    #[serde(default = "default_min_nodes")]
    pub min_nodes: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
    #[serde(default)]
    pub default: bool,
}

fn default_min_nodes() -> u32 {
    1
}

fn default_max_nodes() -> u32 {
    u32::MAX
}

#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    pub partitions: Vec<PartitionConfig>,
    #[serde(default)]
    pub licenses: HashMap<String, u32>,
    #[serde(default)]
    pub associations: Vec<AssocConfig>,
    #[serde(default)]
    pub enforce_associations: bool,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Materialize the node/partition tables and the accounting view.
    pub fn build(self) -> Result<(NodeTable, PartitionTable, Accounting), EngineError> {
        let records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .map(|n| NodeRecord {
                name: n.name.clone(),
                cpus: n.cpus,
                features: n.features.clone(),
                partitions: n.partitions.clone(),
                state: NodeState::up(),
            })
            .collect();
        let nodes = NodeTable::new(records);

        let mut parts = Vec::with_capacity(self.partitions.len());
        for p in &self.partitions {
            let node_bitmap = if p.nodes.is_empty() {
                let mut bm = Bitmap::new(nodes.len());
                for i in 0..nodes.len() {
                    if nodes.nodes[i].partitions.iter().any(|m| *m == p.name) {
                        bm.set(i);
                    }
                }
                bm
            } else {
                nodes.expr_to_bitmap(&p.nodes)?
            };
            parts.push(PartitionRecord {
                name: p.name.clone(),
                node_bitmap,
                min_nodes: p.min_nodes,
                max_nodes: p.max_nodes,
                is_default: p.default,
            });
        }

        let accounting = Accounting::new(
            self.associations,
            self.licenses,
            self.enforce_associations,
        );
        Ok((nodes, PartitionTable::new(parts), accounting))
    }
}
