use crate::bitmap::Bitmap;
use crate::cluster::{JobTable, NodeTable, ALL_NODES};
use crate::model::*;

use super::EngineError;

/// Capacity request handed to the selection engine: an explicit node-name
/// expression (possibly the `ALL` sentinel), or one or more node-count
/// targets (several for block-structured hardware), optionally narrowed by
/// a feature expression and refined to a core count for partial-node
/// reservations.
pub struct SelectRequest<'a> {
    pub node_expr: Option<&'a str>,
    pub node_counts: &'a [u32],
    pub core_cnt: Option<u32>,
    pub features: Option<&'a str>,
    pub flags: ResvFlags,
    pub start_time: Ms,
    pub end_time: Ms,
}

/// A concrete allocation: node bitmap plus, for partial reservations, the
/// global-core-index claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Picked {
    pub nodes: Bitmap,
    pub cores: Option<Bitmap>,
}

/// Inputs for the capacity-aware fallback pick.
pub struct PickContext<'a> {
    pub pool: &'a Bitmap,
    pub idle: &'a Bitmap,
    pub count: usize,
    pub core_level: bool,
    pub nodes: &'a NodeTable,
    pub jobs: &'a JobTable,
    pub excluded_cores: &'a Bitmap,
}

/// Seam to the node-selection collaborator: consulted when the idle subset
/// cannot satisfy a count target on its own.
pub trait NodeSelector: Send + Sync {
    fn pick(&self, ctx: &PickContext<'_>) -> Result<Bitmap, EngineError>;
}

/// Default selector. Takes every idle node first; for core-level requests
/// it will additionally accept nodes running jobs as long as the per-job
/// core-compatibility test leaves at least one unclaimed core. Nodes whose
/// cores are entirely claimed are excluded outright. Full-node requests
/// never take a busy node.
pub struct CapacityAware;

impl NodeSelector for CapacityAware {
    fn pick(&self, ctx: &PickContext<'_>) -> Result<Bitmap, EngineError> {
        let idle = ctx.idle.and(ctx.pool);
        if idle.count() >= ctx.count
            && let Some(picked) = idle.pick_n(ctx.count)
        {
            return Ok(picked);
        }
        let mut out = idle;
        let mut need = ctx.count.saturating_sub(out.count());
        if ctx.core_level {
            for i in ctx.pool.and_not(&out).iter_ones() {
                if need == 0 {
                    break;
                }
                if !free_cores_on_node(i, ctx.nodes, ctx.jobs, ctx.excluded_cores).is_empty() {
                    out.set(i);
                    need -= 1;
                }
            }
        }
        if need > 0 {
            Err(EngineError::Insufficient("nodes"))
        } else {
            Ok(out)
        }
    }
}

/// Cores of node `idx` not claimed by the exclusion mask or by any running
/// job. A running job without a core bitmap owns the whole node.
fn free_cores_on_node(
    idx: usize,
    nodes: &NodeTable,
    jobs: &JobTable,
    excluded: &Bitmap,
) -> Vec<usize> {
    let mut free: Vec<usize> = nodes
        .core_range(idx)
        .filter(|c| !excluded.test(*c))
        .collect();
    for j in jobs.running() {
        if !j.node_bitmap.test(idx) {
            continue;
        }
        match &j.core_bitmap {
            Some(cb) => free.retain(|c| !cb.test(*c)),
            None => return Vec::new(),
        }
        if free.is_empty() {
            break;
        }
    }
    free
}

/// Resolve a capacity request to a concrete node (and core) allocation.
///
/// Count-based requests start from the partition's node set, drop nodes
/// consumed by time-overlapping full-node reservations (and accumulate the
/// core claims of partial ones), fold the feature expression, intersect
/// with currently-available nodes, and then pick idle-first. Explicit node
/// expressions are honored as given; the conflict detector rules on their
/// legality afterwards.
pub fn select<'a>(
    req: &SelectRequest<'_>,
    partition: Option<&PartitionRecord>,
    nodes: &NodeTable,
    others: impl Iterator<Item = &'a Reservation>,
    jobs: &JobTable,
    selector: &dyn NodeSelector,
) -> Result<Picked, EngineError> {
    // Exclusions from other reservations whose window intersects ours.
    let mut busy_nodes = Bitmap::new(nodes.len());
    let mut excluded_cores = Bitmap::new(nodes.total_cores() as usize);
    if !req.flags.intersects(ResvFlags::OVERLAP.union(ResvFlags::MAINT)) {
        for other in others {
            if other.node_bitmap.is_clear()
                || !other.overlaps_window(req.start_time, req.end_time)
            {
                continue;
            }
            match &other.core_bitmap {
                None => busy_nodes.or_assign(&other.node_bitmap),
                Some(cb) => excluded_cores.or_assign(cb),
            }
        }
    }

    if let Some(expr) = req.node_expr {
        let picked = if expr == ALL_NODES {
            if req.flags.contains(ResvFlags::PART_NODES)
                && let Some(part) = partition
            {
                part.node_bitmap.clone()
            } else {
                nodes.all_bitmap()
            }
        } else {
            nodes.expr_to_bitmap(expr)?
        };
        if picked.is_clear() {
            return Err(EngineError::Insufficient("nodes"));
        }
        return finish(picked, req.core_cnt, nodes, jobs, &excluded_cores);
    }

    let Some(part) = partition else {
        return Err(EngineError::NoDefaultPartition);
    };
    let mut candidates = part.node_bitmap.and_not(&busy_nodes);

    if let Some(expr) = req.features {
        candidates = apply_features(expr, &candidates, nodes)?;
    }

    if !req.flags.contains(ResvFlags::MAINT) {
        candidates = candidates.and(&nodes.avail_bitmap());
    }

    let picked = solve_counts(
        req.node_counts,
        &candidates,
        nodes,
        jobs,
        req.core_cnt.is_some(),
        &excluded_cores,
        selector,
    )?;
    finish(picked, req.core_cnt, nodes, jobs, &excluded_cores)
}

/// Fold a feature expression over the candidate set, strictly left to
/// right: each tag transitions the accumulator using the operator
/// immediately preceding it, starting from the full candidate set.
fn apply_features(
    expr: &str,
    base: &Bitmap,
    nodes: &NodeTable,
) -> Result<Bitmap, EngineError> {
    let mut acc = base.clone();
    let mut op = '&';
    let mut tok = String::new();

    let step = |acc: &Bitmap, op: char, tag: &str| -> Result<Bitmap, EngineError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(EngineError::InvalidFeatures(format!(
                "dangling operator in {expr:?}"
            )));
        }
        if !nodes.has_feature_tag(tag) {
            return Err(EngineError::InvalidFeatures(format!(
                "unknown feature {tag:?}"
            )));
        }
        let tagged = nodes.feature_bitmap(tag).and(base);
        Ok(match op {
            '&' => acc.and(&tagged),
            _ => acc.or(&tagged),
        })
    };

    for c in expr.chars() {
        match c {
            '&' | '|' => {
                acc = step(&acc, op, &tok)?;
                op = c;
                tok.clear();
            }
            _ => tok.push(c),
        }
    }
    acc = step(&acc, op, &tok)?;
    Ok(acc)
}

/// Solve the node-count targets. Multiple size classes first try one pick
/// sized to the sum; if the selector rounded the pick up, each target is
/// solved independently in descending size order against a shrinking pool.
fn solve_counts(
    counts: &[u32],
    candidates: &Bitmap,
    nodes: &NodeTable,
    jobs: &JobTable,
    core_level: bool,
    excluded_cores: &Bitmap,
    selector: &dyn NodeSelector,
) -> Result<Bitmap, EngineError> {
    let total: usize = counts.iter().map(|c| *c as usize).sum();
    if total == 0 {
        return Err(EngineError::Insufficient("nodes"));
    }

    let mut occupied = Bitmap::new(nodes.len());
    for j in jobs.running() {
        occupied.or_assign(&j.node_bitmap);
    }
    let idle = candidates.and_not(&occupied);

    let pick_one = |pool: &Bitmap, count: usize| -> Result<Bitmap, EngineError> {
        let idle_pool = idle.and(pool);
        if idle_pool.count() >= count
            && let Some(picked) = idle_pool.pick_n(count)
        {
            return Ok(picked);
        }
        selector.pick(&PickContext {
            pool,
            idle: &idle_pool,
            count,
            core_level,
            nodes,
            jobs,
            excluded_cores,
        })
    };

    let summed = pick_one(candidates, total)?;
    if counts.len() <= 1 || summed.count() == total {
        return Ok(summed);
    }

    // Topology rounding made the single solve inexact: redo per target,
    // largest first, removing already-picked nodes between solves.
    let mut sorted: Vec<u32> = counts.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let mut pool = candidates.clone();
    let mut acc = Bitmap::new(nodes.len());
    for count in sorted {
        let picked = pick_one(&pool, count as usize)?;
        pool = pool.and_not(&picked);
        acc.or_assign(&picked);
    }
    Ok(acc)
}

/// Attach the core-level claim for partial reservations and trim nodes
/// that contribute no cores.
fn finish(
    picked: Bitmap,
    core_cnt: Option<u32>,
    nodes: &NodeTable,
    jobs: &JobTable,
    excluded_cores: &Bitmap,
) -> Result<Picked, EngineError> {
    let Some(core_cnt) = core_cnt else {
        return Ok(Picked {
            nodes: picked,
            cores: None,
        });
    };

    let mut cores = Bitmap::new(nodes.total_cores() as usize);
    let mut kept = Bitmap::new(picked.domain());
    let mut need = core_cnt as usize;
    for idx in picked.iter_ones() {
        if need == 0 {
            break;
        }
        let free = free_cores_on_node(idx, nodes, jobs, excluded_cores);
        if free.is_empty() {
            continue;
        }
        kept.set(idx);
        for c in free.into_iter().take(need) {
            cores.set(c);
            need -= 1;
        }
    }
    if need > 0 {
        return Err(EngineError::Insufficient("cores"));
    }
    Ok(Picked {
        nodes: kept,
        cores: Some(cores),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeTable;
    use crate::model::{JobRecord, JobState, NodeRecord, NodeState};

    const H: Ms = 3_600_000;

    fn table(n: usize, cpus: u32) -> NodeTable {
        NodeTable::new(
            (0..n)
                .map(|i| NodeRecord {
                    name: format!("n{i}"),
                    cpus,
                    features: if i % 2 == 0 {
                        vec!["even".into()]
                    } else {
                        vec!["odd".into()]
                    },
                    partitions: vec!["batch".into()],
                    state: NodeState::up(),
                })
                .collect(),
        )
    }

    fn partition(nodes: &NodeTable) -> PartitionRecord {
        PartitionRecord {
            name: "batch".into(),
            node_bitmap: nodes.all_bitmap(),
            min_nodes: 1,
            max_nodes: u32::MAX,
            is_default: true,
        }
    }

    fn request<'a>(counts: &'a [u32]) -> SelectRequest<'a> {
        SelectRequest {
            node_expr: None,
            node_counts: counts,
            core_cnt: None,
            features: None,
            flags: ResvFlags::empty(),
            start_time: 0,
            end_time: H,
        }
    }

    fn running_job(id: u32, nodes: &[usize], domain: usize, cores: Option<&[usize]>) -> JobRecord {
        JobRecord {
            job_id: id,
            state: JobState::Running,
            user_id: 0,
            account: String::new(),
            assoc_id: None,
            start_time: 0,
            end_time: 10 * H,
            node_bitmap: Bitmap::from_indices(domain, nodes),
            core_bitmap: cores.map(|c| Bitmap::from_indices(64, c)),
            licenses: vec![],
            resv_name: None,
            resv_id: None,
        }
    }

    fn full_resv(name: &str, start: Ms, end: Ms, nodes_idx: &[usize], domain: usize) -> Reservation {
        let node_bitmap = Bitmap::from_indices(domain, nodes_idx);
        Reservation {
            resv_id: 1,
            name: name.into(),
            start_time: start,
            end_time: end,
            duration: None,
            start_time_first: start,
            start_time_prev: start,
            flags: ResvFlags::empty(),
            partition: None,
            node_cnt: node_bitmap.count() as u32,
            node_bitmap,
            core_bitmap: None,
            node_list: String::new(),
            cpu_cnt: 0,
            accounts: vec!["a".into()],
            account_not: false,
            users: vec![],
            user_not: false,
            assoc_list: String::new(),
            licenses: vec![],
            features: None,
            job_pend_cnt: 0,
            job_run_cnt: 0,
        }
    }

    #[test]
    fn picks_requested_count_from_idle() {
        let nodes = table(5, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();
        let picked = select(
            &request(&[2]),
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes.count(), 2);
        assert!(picked.cores.is_none());
        assert!(part.node_bitmap.is_superset_of(&picked.nodes));
    }

    #[test]
    fn excludes_overlapping_full_node_reservation() {
        let nodes = table(4, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();
        let existing = vec![full_resv("m", 0, 2 * H, &[0, 1], 4)];
        let picked = select(
            &request(&[2]),
            Some(&part),
            &nodes,
            existing.iter(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes, Bitmap::from_indices(4, &[2, 3]));

        // A third node is not there to give.
        let err = select(
            &request(&[3]),
            Some(&part),
            &nodes,
            existing.iter(),
            &jobs,
            &CapacityAware,
        )
        .unwrap_err();
        assert_eq!(err, EngineError::Insufficient("nodes"));
    }

    #[test]
    fn overlap_flag_ignores_existing_reservations() {
        let nodes = table(2, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();
        let existing = vec![full_resv("m", 0, 2 * H, &[0, 1], 2)];
        let mut req = request(&[2]);
        req.flags = ResvFlags::OVERLAP;
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            existing.iter(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes.count(), 2);
    }

    #[test]
    fn feature_fold_left_to_right() {
        let nodes = table(6, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();

        let mut req = request(&[3]);
        req.features = Some("even");
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes, Bitmap::from_indices(6, &[0, 2, 4]));

        // even|odd covers everything; the trailing &odd narrows again.
        let mut req = request(&[3]);
        req.features = Some("even|odd&odd");
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes, Bitmap::from_indices(6, &[1, 3, 5]));
    }

    #[test]
    fn feature_errors_are_distinguishable() {
        let nodes = table(4, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();

        let mut req = request(&[1]);
        req.features = Some("fpga");
        assert!(matches!(
            select(&req, Some(&part), &nodes, std::iter::empty(), &jobs, &CapacityAware),
            Err(EngineError::InvalidFeatures(_))
        ));

        let mut req = request(&[1]);
        req.features = Some("even&");
        assert!(matches!(
            select(&req, Some(&part), &nodes, std::iter::empty(), &jobs, &CapacityAware),
            Err(EngineError::InvalidFeatures(_))
        ));
    }

    #[test]
    fn unavailable_nodes_skipped_unless_maint() {
        let mut raw = table(3, 4);
        raw.set_state("n0", NodeState::DOWN);
        let part = partition(&raw);
        let jobs = JobTable::new();

        let picked = select(
            &request(&[2]),
            Some(&part),
            &raw,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert!(!picked.nodes.test(0));

        let mut req = request(&[3]);
        req.flags = ResvFlags::MAINT;
        let picked = select(
            &req,
            Some(&part),
            &raw,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes.count(), 3);
    }

    #[test]
    fn idle_nodes_win_over_job_occupied() {
        let nodes = table(4, 4);
        let part = partition(&nodes);
        let mut jobs = JobTable::new();
        jobs.upsert(running_job(1, &[0, 1], 4, None));

        let picked = select(
            &request(&[2]),
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes, Bitmap::from_indices(4, &[2, 3]));

        // Full-node request for 3 can't take the occupied ones.
        assert_eq!(
            select(&request(&[3]), Some(&part), &nodes, std::iter::empty(), &jobs, &CapacityAware)
                .unwrap_err(),
            EngineError::Insufficient("nodes")
        );
    }

    #[test]
    fn core_level_accepts_partially_claimed_nodes() {
        let nodes = table(2, 4); // cores 0-3 on n0, 4-7 on n1
        let part = partition(&nodes);
        let mut jobs = JobTable::new();
        // Job holds cores 0-1 of n0 and all of n1.
        jobs.upsert(running_job(1, &[0], 2, Some(&[0, 1])));
        jobs.upsert(running_job(2, &[1], 2, None));

        let mut req = request(&[1]);
        req.core_cnt = Some(2);
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes, Bitmap::from_indices(2, &[0]));
        let cores = picked.cores.unwrap();
        assert!(cores.test(2) && cores.test(3));
        assert!(!cores.test(0) && !cores.test(1));
    }

    #[test]
    fn core_exclusion_from_partial_reservation() {
        let nodes = table(1, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();
        let mut other = full_resv("p", 0, 2 * H, &[0], 1);
        other.core_bitmap = Some(Bitmap::from_indices(4, &[0, 1]));

        let mut req = request(&[1]);
        req.core_cnt = Some(2);
        let existing = vec![other];
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            existing.iter(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.cores.unwrap(), Bitmap::from_indices(4, &[2, 3]));

        // Asking for three cores exceeds what's left.
        let mut req = request(&[1]);
        req.core_cnt = Some(3);
        assert_eq!(
            select(&req, Some(&part), &nodes, existing.iter(), &jobs, &CapacityAware)
                .unwrap_err(),
            EngineError::Insufficient("cores")
        );
    }

    #[test]
    fn multi_block_counts_union() {
        let nodes = table(6, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();
        let picked = select(
            &request(&[2, 1, 2]),
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes.count(), 5);

        assert_eq!(
            select(&request(&[4, 3]), Some(&part), &nodes, std::iter::empty(), &jobs, &CapacityAware)
                .unwrap_err(),
            EngineError::Insufficient("nodes")
        );
    }

    #[test]
    fn explicit_expression_and_all() {
        let nodes = table(4, 4);
        let part = partition(&nodes);
        let jobs = JobTable::new();

        let mut req = request(&[]);
        req.node_expr = Some("n[1-2]");
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes, Bitmap::from_indices(4, &[1, 2]));

        let mut req = request(&[]);
        req.node_expr = Some(ALL_NODES);
        let picked = select(
            &req,
            Some(&part),
            &nodes,
            std::iter::empty(),
            &jobs,
            &CapacityAware,
        )
        .unwrap();
        assert_eq!(picked.nodes.count(), 4);
    }

    #[test]
    fn missing_partition_is_distinguishable() {
        let nodes = table(2, 4);
        let jobs = JobTable::new();
        assert_eq!(
            select(&request(&[1]), None, &nodes, std::iter::empty(), &jobs, &CapacityAware)
                .unwrap_err(),
            EngineError::NoDefaultPartition
        );
    }
}
