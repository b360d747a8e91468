use chrono::Local;
use tracing::{info, warn};

use crate::calendar::advance_window;
use crate::cluster::{JobTable, NodeTable, PartitionTable};
use crate::model::*;
use crate::notify::NotifyHub;

use super::select::{select, NodeSelector, SelectRequest};
use super::{Engine, ResvStore};

impl Engine {
    /// One maintenance pass: refresh job counters, advance expired
    /// recurring reservations by one period, purge vestigial ones, and
    /// replace unavailable nodes where the reservation allows a re-pick.
    pub async fn sweep(&self, now: Ms) {
        let mut store = self.resvs.write().await;
        let jobs = self.jobs.read().await;
        let nodes = self.nodes.read().await;
        let parts = self.partitions.read().await;
        let mut changed = false;

        let names: Vec<String> = store.iter().map(|r| r.name.clone()).collect();

        // Counters come from the job table, not from increments, so a
        // missed binding can't wedge a reservation as in-use forever.
        for name in &names {
            let resv_id = match store.get(name) {
                Some(r) => r.resv_id,
                None => continue,
            };
            let mut pend = 0;
            let mut run = 0;
            for j in jobs.iter() {
                let references = j.resv_id == Some(resv_id)
                    || j.resv_name.as_deref() == Some(name.as_str());
                if !references || j.state.is_finished() {
                    continue;
                }
                if j.state.is_running() {
                    run += 1;
                } else {
                    pend += 1;
                }
            }
            if let Some(r) = store.get_mut(name) {
                r.job_pend_cnt = pend;
                r.job_run_cnt = run;
            }
        }

        for name in &names {
            let (expired, rec, purgeable) = match store.get(name) {
                Some(r) => (
                    r.end_time <= now,
                    r.recurrence(),
                    !r.in_use()
                        && !r
                            .flags
                            .intersects(ResvFlags::MAINT.union(ResvFlags::STATIC_NODES)),
                ),
                None => continue,
            };
            if !expired {
                continue;
            }
            if rec.is_recurring() {
                let Some(r) = store.get_mut(name) else { continue };
                let (ns, ne) = advance_window(&Local, r.start_time, r.end_time, rec);
                r.start_time_prev = r.start_time;
                r.start_time = ns;
                r.end_time = ne;
                r.job_pend_cnt = 0;
                r.job_run_cnt = 0;
                info!(resv = %name, start = ns, "recurring reservation re-armed");
                metrics::counter!(crate::observability::SWEEP_ADVANCED_TOTAL).increment(1);
                self.notify.send(&ResvEvent::Advanced {
                    name: name.clone(),
                    start_time: ns,
                    end_time: ne,
                });
                changed = true;
            } else if purgeable {
                store.remove(name);
                info!(resv = %name, "vestigial reservation purged");
                metrics::counter!(crate::observability::SWEEP_PURGED_TOTAL).increment(1);
                self.notify.send(&ResvEvent::Deleted { name: name.clone() });
                changed = true;
            }
        }

        changed |= revalidate_nodes(
            &mut store,
            &jobs,
            &nodes,
            &parts,
            &self.notify,
            self.selector.as_ref(),
            now,
        );

        if changed {
            metrics::gauge!(crate::observability::RESV_ACTIVE).set(store.len() as f64);
            self.schedule_save();
        }
    }

    /// Node-state-change callback: re-validate node selections right away
    /// instead of waiting for the next sweep.
    pub async fn node_state_changed(&self, now: Ms) {
        let mut store = self.resvs.write().await;
        let jobs = self.jobs.read().await;
        let nodes = self.nodes.read().await;
        let parts = self.partitions.read().await;
        if revalidate_nodes(
            &mut store,
            &jobs,
            &nodes,
            &parts,
            &self.notify,
            self.selector.as_ref(),
            now,
        ) {
            self.schedule_save();
        }
    }
}

/// Best-effort delta re-pick for reservations whose node set degraded.
/// Static and explicit-node-list reservations are left alone; failures are
/// logged and never block the sweep.
fn revalidate_nodes(
    store: &mut ResvStore,
    jobs: &JobTable,
    nodes: &NodeTable,
    parts: &PartitionTable,
    notify: &NotifyHub,
    selector: &dyn NodeSelector,
    now: Ms,
) -> bool {
    let avail = nodes.avail_bitmap();
    let names: Vec<String> = store
        .iter()
        .filter(|r| r.end_time > now)
        .filter(|r| {
            !r.flags
                .intersects(ResvFlags::STATIC_NODES.union(ResvFlags::SPEC_NODES))
        })
        .filter(|r| r.core_bitmap.is_none() && !r.node_bitmap.is_clear())
        .map(|r| r.name.clone())
        .collect();

    let mut changed = false;
    for name in names {
        let (down_cnt, keep, features, flags, start, end, partition) = {
            let Some(r) = store.get(&name) else { continue };
            let down = r.node_bitmap.and_not(&avail);
            if down.is_clear() {
                continue;
            }
            (
                down.count() as u32,
                r.node_bitmap.and(&avail),
                r.features.clone(),
                r.flags,
                r.start_time,
                r.end_time,
                r.partition.clone(),
            )
        };

        let counts = [down_cnt];
        let sreq = SelectRequest {
            node_expr: None,
            node_counts: &counts,
            core_cnt: None,
            features: features.as_deref(),
            flags,
            start_time: start,
            end_time: end,
        };
        let partition = partition
            .as_deref()
            .and_then(|p| parts.get(p))
            .or_else(|| parts.default_partition());

        match select(&sreq, partition, nodes, store.iter(), jobs, selector) {
            Ok(picked) => {
                let Some(r) = store.get_mut(&name) else { continue };
                let bm = keep.or(&picked.nodes);
                r.node_list = nodes.bitmap_to_expr(&bm);
                r.node_cnt = bm.count() as u32;
                r.cpu_cnt = nodes.sum_cpus(&bm);
                r.node_bitmap = bm;
                info!(resv = %name, nodes = %r.node_list, "replaced unavailable nodes");
                metrics::counter!(crate::observability::SWEEP_REPICK_TOTAL).increment(1);
                notify.send(&ResvEvent::Updated { name: name.clone() });
                changed = true;
            }
            Err(e) => warn!(resv = %name, "node re-pick failed: {e}"),
        }
    }
    changed
}
