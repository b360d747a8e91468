use chrono::Local;
use tracing::info;

use crate::bitmap::Bitmap;
use crate::assoc::Accounting;
use crate::cluster::{JobTable, NodeTable, PartitionTable, ALL_NODES};
use crate::limits::{DEFAULT_DURATION_MS, MAX_NAME_LEN};
use crate::model::*;

use super::acl;
use super::conflict::{check_no_conflict, now_ms, validate_window};
use super::select::{select, NodeSelector, SelectRequest};
use super::{Engine, EngineError, ResvStore};

/// Administrative create request. Unset times default (start = now,
/// end = start + duration, or a year); unknown flag bits are dropped.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub duration: Option<Ms>,
    pub flags: ResvFlags,
    pub partition: Option<String>,
    pub node_expr: Option<String>,
    pub node_counts: Vec<u32>,
    pub core_cnt: Option<u32>,
    pub accounts: Vec<String>,
    pub account_not: bool,
    pub users: Vec<u32>,
    pub user_not: bool,
    pub licenses: Option<String>,
    pub features: Option<String>,
}

/// Incremental account/user list edit: full replacement, or `+name`/`-name`
/// style patches.
#[derive(Debug, Clone)]
pub enum AclEdit<T> {
    Replace { entries: Vec<T>, not: bool },
    Patch { add: Vec<T>, remove: Vec<T> },
}

/// Field deltas for `update`. Every populated field replaces or patches the
/// corresponding reservation field; flag bits are toggled through
/// independent set/clear pairs.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub flags_set: ResvFlags,
    pub flags_clear: ResvFlags,
    pub partition: Option<String>,
    pub accounts: Option<AclEdit<String>>,
    pub users: Option<AclEdit<u32>>,
    pub licenses: Option<String>,
    /// `Some(None)` clears the feature expression.
    pub features: Option<Option<String>>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub duration: Option<Ms>,
    pub node_expr: Option<String>,
    /// Resize target for full-node reservations.
    pub node_cnt: Option<u32>,
}

impl Engine {
    /// Create a reservation: validate, select nodes/cores, prove the
    /// time×space footprint legal, then commit — all under one store write
    /// guard so the conflict check and the commit are the same critical
    /// section.
    pub async fn create(&self, req: CreateRequest) -> Result<String, EngineError> {
        let mut store = self.resvs.write().await;
        let jobs = self.jobs.read().await;
        let nodes = self.nodes.read().await;
        let parts = self.partitions.read().await;
        let accounting = self.accounting.read().await;

        let now = now_ms();
        let mut flags = req.flags.normalized();
        let start = req.start_time.unwrap_or(now);
        let end = match (req.end_time, req.duration) {
            (Some(e), _) => e,
            (None, Some(d)) => start.saturating_add(d),
            (None, None) => start + DEFAULT_DURATION_MS,
        };
        validate_window(start, end)?;

        if let Some(name) = &req.name {
            if name.is_empty()
                || name.len() > MAX_NAME_LEN
                || name.contains(|c: char| c.is_whitespace() || c == ',')
            {
                return Err(EngineError::InvalidName(name.clone()));
            }
            if store.get(name).is_some() {
                return Err(EngineError::DuplicateName(name.clone()));
            }
        }

        let license_only = flags.contains(ResvFlags::LICENSE_ONLY);
        if req.accounts.is_empty() && req.users.is_empty() && !license_only {
            return Err(EngineError::MissingAccess);
        }
        for account in &req.accounts {
            if !accounting.account_valid(account) {
                return Err(EngineError::UnknownAccount(account.clone()));
            }
        }

        let licenses = match &req.licenses {
            Some(list) => accounting.validate_licenses(list)?,
            None => Vec::new(),
        };
        if license_only && licenses.is_empty() {
            return Err(EngineError::InvalidLicenses(
                "license-only reservation holds no licenses".into(),
            ));
        }

        let partition = match &req.partition {
            Some(p) => {
                Some(parts.get(p).ok_or_else(|| EngineError::UnknownPartition(p.clone()))?)
            }
            None => parts.default_partition(),
        };

        let (node_bitmap, core_bitmap) = if license_only {
            (Bitmap::new(nodes.len()), None)
        } else {
            let sreq = SelectRequest {
                node_expr: req.node_expr.as_deref(),
                node_counts: &req.node_counts,
                core_cnt: req.core_cnt,
                features: req.features.as_deref(),
                flags,
                start_time: start,
                end_time: end,
            };
            let picked = select(
                &sreq,
                partition,
                &nodes,
                store.iter(),
                &jobs,
                self.selector.as_ref(),
            )?;
            (picked.nodes, picked.cores)
        };

        if req.node_expr.as_deref().is_some_and(|e| e != ALL_NODES) {
            flags.insert(ResvFlags::SPEC_NODES);
        }

        let cpu_cnt = match &core_bitmap {
            Some(cb) => cb.count() as u32,
            None => nodes.sum_cpus(&node_bitmap),
        };
        let assoc_list = acl::build_assoc_list(
            &req.accounts,
            req.account_not,
            &req.users,
            req.user_not,
            accounting.assocs(),
        );

        let mut resv = Reservation {
            resv_id: 0,
            name: String::new(),
            start_time: start,
            end_time: end,
            duration: req.duration,
            start_time_first: start,
            start_time_prev: start,
            flags,
            partition: partition.map(|p| p.name.clone()),
            node_list: nodes.bitmap_to_expr(&node_bitmap),
            node_cnt: node_bitmap.count() as u32,
            cpu_cnt,
            node_bitmap,
            core_bitmap,
            accounts: req.accounts,
            account_not: req.account_not,
            users: req.users,
            user_not: req.user_not,
            assoc_list,
            licenses,
            features: req.features,
            job_pend_cnt: 0,
            job_run_cnt: 0,
        };

        if let Err(e) = check_no_conflict(&Local, &resv, store.iter(), &jobs) {
            metrics::counter!(crate::observability::RESV_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        resv.resv_id = store.alloc_id(&jobs);
        resv.name = match req.name {
            Some(name) => name,
            None => {
                let base = resv
                    .accounts
                    .first()
                    .cloned()
                    .or_else(|| resv.users.first().map(|u| format!("u{u}")))
                    .unwrap_or_else(|| "resv".to_string());
                store.gen_name(&base)
            }
        };

        let name = resv.name.clone();
        let resv_id = resv.resv_id;
        info!(resv = %name, resv_id, nodes = %resv.node_list, "reservation created");
        store.insert(resv);
        metrics::counter!(crate::observability::RESV_CREATED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::RESV_ACTIVE).set(store.len() as f64);
        self.notify.send(&ResvEvent::Created { name: name.clone(), resv_id });
        self.schedule_save();
        Ok(name)
    }

    /// Apply field deltas to a reservation. All edits land on a deep copy;
    /// the stored record is replaced only once the final proposed state
    /// passes validation and the conflict re-check, so a failed update is
    /// observably a no-op.
    pub async fn update(&self, name: &str, req: UpdateRequest) -> Result<(), EngineError> {
        let mut store = self.resvs.write().await;
        let jobs = self.jobs.read().await;
        let nodes = self.nodes.read().await;
        let parts = self.partitions.read().await;
        let accounting = self.accounting.read().await;

        let mut work = match store.get(name) {
            Some(r) => r.clone(),
            None => return Err(EngineError::NotFound(name.into())),
        };

        apply_update(
            &mut work,
            &req,
            &store,
            &jobs,
            &nodes,
            &parts,
            &accounting,
            self.selector.as_ref(),
        )?;
        work.assoc_list = acl::build_assoc_list(
            &work.accounts,
            work.account_not,
            &work.users,
            work.user_not,
            accounting.assocs(),
        );

        if let Err(e) = check_no_conflict(&Local, &work, store.iter(), &jobs) {
            metrics::counter!(crate::observability::RESV_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        info!(resv = %name, nodes = %work.node_list, "reservation updated");
        store.insert(work);
        metrics::counter!(crate::observability::RESV_UPDATED_TOTAL).increment(1);
        self.notify.send(&ResvEvent::Updated { name: name.into() });
        self.schedule_save();
        Ok(())
    }

    /// Delete a reservation, refusing while any unfinished job still
    /// references it.
    pub async fn delete(&self, name: &str) -> Result<(), EngineError> {
        let mut store = self.resvs.write().await;
        let jobs = self.jobs.read().await;

        let busy = match store.get(name) {
            None => return Err(EngineError::NotFound(name.into())),
            Some(r) => r.in_use() || jobs.references_resv(r.resv_id, name),
        };
        if busy {
            return Err(EngineError::Busy(name.into()));
        }

        store.remove(name);
        info!(resv = %name, "reservation deleted");
        metrics::counter!(crate::observability::RESV_DELETED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::RESV_ACTIVE).set(store.len() as f64);
        self.notify.send(&ResvEvent::Deleted { name: name.into() });
        self.schedule_save();
        Ok(())
    }

    /// Record a job ↔ reservation binding after a successful admission
    /// test: writes the job's integer back-reference and bumps the
    /// reservation's pending/running counter.
    pub async fn bind_job(&self, job_id: u32) -> Result<(), EngineError> {
        let mut store = self.resvs.write().await;
        let mut jobs = self.jobs.write().await;

        let (rname, running) = match jobs.get(job_id) {
            None => return Err(EngineError::NotFound(format!("job {job_id}"))),
            Some(j) => match &j.resv_name {
                None => return Err(EngineError::BadRequest("job names no reservation")),
                Some(r) => (r.clone(), j.state.is_running()),
            },
        };
        let resv = store
            .get_mut(&rname)
            .ok_or(EngineError::NotFound(rname.clone()))?;
        jobs.bind_resv(job_id, Some(resv.resv_id));
        if running {
            resv.job_run_cnt += 1;
        } else {
            resv.job_pend_cnt += 1;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_update(
    work: &mut Reservation,
    req: &UpdateRequest,
    store: &ResvStore,
    jobs: &JobTable,
    nodes: &NodeTable,
    parts: &PartitionTable,
    accounting: &Accounting,
    selector: &dyn NodeSelector,
) -> Result<(), EngineError> {
    work.flags.insert(req.flags_set.normalized());
    work.flags.remove(req.flags_clear);

    if let Some(p) = &req.partition {
        if parts.get(p).is_none() {
            return Err(EngineError::UnknownPartition(p.clone()));
        }
        work.partition = Some(p.clone());
    }

    if let Some(edit) = &req.accounts {
        apply_acl_edit(&mut work.accounts, &mut work.account_not, edit);
        for account in &work.accounts {
            if !accounting.account_valid(account) {
                return Err(EngineError::UnknownAccount(account.clone()));
            }
        }
    }
    if let Some(edit) = &req.users {
        apply_acl_edit(&mut work.users, &mut work.user_not, edit);
    }
    if work.accounts.is_empty()
        && work.users.is_empty()
        && !work.flags.contains(ResvFlags::LICENSE_ONLY)
    {
        return Err(EngineError::MissingAccess);
    }

    if let Some(list) = &req.licenses {
        work.licenses = accounting.validate_licenses(list)?;
    }
    if let Some(features) = &req.features {
        work.features = features.clone();
    }

    if let Some(s) = req.start_time {
        work.start_time = s;
        work.start_time_first = s;
        work.start_time_prev = s;
    }
    if let Some(e) = req.end_time {
        work.end_time = e;
        work.duration = None;
    }
    if let Some(d) = req.duration {
        work.end_time = work.start_time.saturating_add(d);
        work.duration = Some(d);
    }
    validate_window(work.start_time, work.end_time)?;

    if let Some(expr) = &req.node_expr {
        let sreq = SelectRequest {
            node_expr: Some(expr.as_str()),
            node_counts: &[],
            core_cnt: None,
            features: work.features.as_deref(),
            flags: work.flags,
            start_time: work.start_time,
            end_time: work.end_time,
        };
        let partition = work.partition.as_deref().and_then(|p| parts.get(p));
        let picked = select(&sreq, partition, nodes, store.iter(), jobs, selector)?;
        if expr == ALL_NODES {
            work.flags.remove(ResvFlags::SPEC_NODES);
        } else {
            work.flags.insert(ResvFlags::SPEC_NODES);
        }
        set_nodes(work, picked.nodes, nodes);
    } else if let Some(target) = req.node_cnt {
        resize(work, target, store, jobs, nodes, parts, selector)?;
    }
    Ok(())
}

/// Resize a full-node reservation. Shrinking removes currently-idle nodes
/// first, then whatever remains; growing asks the selection engine for the
/// delta only and unions it in.
fn resize(
    work: &mut Reservation,
    target: u32,
    store: &ResvStore,
    jobs: &JobTable,
    nodes: &NodeTable,
    parts: &PartitionTable,
    selector: &dyn NodeSelector,
) -> Result<(), EngineError> {
    if work.core_bitmap.is_some() {
        return Err(EngineError::BadRequest("cannot resize a core-level reservation"));
    }
    let current = work.node_cnt;
    if target == current {
        return Ok(());
    }
    if target == 0 {
        return Err(EngineError::BadRequest("resize to zero nodes"));
    }

    if target < current {
        let mut remove = (current - target) as usize;
        let mut occupied = Bitmap::new(nodes.len());
        for j in jobs.running() {
            occupied.or_assign(&j.node_bitmap);
        }
        let mut keep = work.node_bitmap.clone();
        for idx in work.node_bitmap.and_not(&occupied).iter_ones() {
            if remove == 0 {
                break;
            }
            keep.unset(idx);
            remove -= 1;
        }
        if remove > 0 {
            for idx in keep.clone().iter_ones() {
                if remove == 0 {
                    break;
                }
                keep.unset(idx);
                remove -= 1;
            }
        }
        set_nodes(work, keep, nodes);
    } else {
        let delta = [target - current];
        let sreq = SelectRequest {
            node_expr: None,
            node_counts: &delta,
            core_cnt: None,
            features: work.features.as_deref(),
            flags: work.flags,
            start_time: work.start_time,
            end_time: work.end_time,
        };
        let partition = work
            .partition
            .as_deref()
            .and_then(|p| parts.get(p))
            .or_else(|| parts.default_partition());
        let picked = select(&sreq, partition, nodes, store.iter(), jobs, selector)?;
        let union = work.node_bitmap.or(&picked.nodes);
        if (union.count() as u32) < target {
            return Err(EngineError::Insufficient("nodes"));
        }
        set_nodes(work, union, nodes);
    }
    Ok(())
}

fn set_nodes(work: &mut Reservation, bm: Bitmap, nodes: &NodeTable) {
    work.node_list = nodes.bitmap_to_expr(&bm);
    work.node_cnt = bm.count() as u32;
    work.cpu_cnt = nodes.sum_cpus(&bm);
    work.node_bitmap = bm;
}

fn apply_acl_edit<T: Clone + PartialEq>(list: &mut Vec<T>, not: &mut bool, edit: &AclEdit<T>) {
    match edit {
        AclEdit::Replace { entries, not: n } => {
            let mut out: Vec<T> = Vec::with_capacity(entries.len());
            for e in entries {
                if !out.contains(e) {
                    out.push(e.clone());
                }
            }
            *list = out;
            *not = *n;
        }
        AclEdit::Patch { add, remove } => {
            for e in add {
                if !list.contains(e) {
                    list.push(e.clone());
                }
            }
            list.retain(|e| !remove.contains(e));
        }
    }
}
