use crate::assoc::Accounting;
use crate::bitmap::Bitmap;
use crate::limits::MAX_RESV_TEST_RETRIES;
use crate::model::*;

use super::{acl, Engine, EngineError};

/// Fallback window width when a pending job carries no time estimate yet.
const DEFAULT_JOB_WINDOW_MS: Ms = 3_600_000;

/// What the scheduler gets back from `job_test_resv`: the nodes the job
/// may occupy, the cores it must stay off (claims of partial reservations),
/// and the earliest start the answer is valid for.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTestResult {
    pub usable_nodes: Bitmap,
    pub excluded_cores: Option<Bitmap>,
    pub effective_start: Ms,
}

impl Engine {
    /// Query-all dump for display, name-sorted for stable output.
    pub async fn list(&self) -> Vec<ResvInfo> {
        let store = self.resvs.read().await;
        let mut out: Vec<ResvInfo> = store.iter().map(ResvInfo::from).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn find(&self, name: &str) -> Option<ResvInfo> {
        let store = self.resvs.read().await;
        store.get(name).map(ResvInfo::from)
    }

    pub async fn resv_count(&self) -> usize {
        let store = self.resvs.read().await;
        store.len()
    }

    /// Answer "which resources may this job use at `when`".
    ///
    /// For a job naming a reservation: validate time-window containment
    /// (too early sets `when` to the reservation's start and returns the
    /// invalid-time error) and the ACL, then return the reservation's node
    /// set minus nodes of overlapping full-node maintenance/exclusive
    /// reservations, plus the core claims of partial ones to avoid.
    ///
    /// For a job naming none: the full node set minus every overlapping
    /// full-node reservation, retried through successively later start
    /// times (bounded) when license contention with an active reservation
    /// blocks immediate eligibility.
    pub async fn job_test_resv(
        &self,
        job_id: u32,
        when: &mut Ms,
    ) -> Result<JobTestResult, EngineError> {
        let store = self.resvs.read().await;
        let jobs = self.jobs.read().await;
        let nodes = self.nodes.read().await;
        let accounting = self.accounting.read().await;

        let job = jobs
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;

        if let Some(rname) = &job.resv_name {
            let resv = store
                .get(rname)
                .ok_or_else(|| EngineError::NotFound(rname.clone()))?;

            if *when < resv.start_time {
                *when = resv.start_time;
                return Err(EngineError::InvalidTime("reservation has not started"));
            }
            if *when >= resv.end_time {
                return Err(EngineError::InvalidTime("reservation already ended"));
            }
            if !acl::admits(resv, job.user_id, &job.account, job.assoc_id, &accounting) {
                return Err(EngineError::AccessDenied);
            }

            let mut usable = if resv.flags.contains(ResvFlags::LICENSE_ONLY) {
                nodes.all_bitmap()
            } else {
                resv.node_bitmap.clone()
            };
            let mut excluded = Bitmap::new(nodes.total_cores() as usize);
            for other in store.iter() {
                if other.name == *rname
                    || !other.overlaps_window(resv.start_time, resv.end_time)
                {
                    continue;
                }
                match &other.core_bitmap {
                    None => {
                        if other.flags.contains(ResvFlags::MAINT)
                            || !other.flags.contains(ResvFlags::OVERLAP)
                        {
                            usable = usable.and_not(&other.node_bitmap);
                        }
                    }
                    Some(cb) => excluded.or_assign(cb),
                }
            }
            return Ok(JobTestResult {
                usable_nodes: usable,
                excluded_cores: none_if_clear(excluded),
                effective_start: *when,
            });
        }

        // "No reservation" path.
        let duration = if job.end_time > job.start_time {
            job.end_time - job.start_time
        } else {
            DEFAULT_JOB_WINDOW_MS
        };

        let mut start = *when;
        for _ in 0..=MAX_RESV_TEST_RETRIES {
            let end = start + duration;
            let mut usable = nodes.all_bitmap();
            let mut excluded = Bitmap::new(nodes.total_cores() as usize);
            let mut pushed_to: Option<Ms> = None;

            for resv in store.iter() {
                if !resv.overlaps_window(start, end) {
                    continue;
                }
                if license_contention(&job.licenses, resv, &accounting) {
                    let next = resv.end_time;
                    pushed_to = Some(pushed_to.map_or(next, |p: Ms| p.max(next)));
                    continue;
                }
                match &resv.core_bitmap {
                    None => usable = usable.and_not(&resv.node_bitmap),
                    Some(cb) => excluded.or_assign(cb),
                }
            }

            if let Some(next) = pushed_to {
                start = next;
                continue;
            }
            *when = start;
            return Ok(JobTestResult {
                usable_nodes: usable,
                excluded_cores: none_if_clear(excluded),
                effective_start: start,
            });
        }
        Err(EngineError::Busy("licenses".into()))
    }
}

fn none_if_clear(bm: Bitmap) -> Option<Bitmap> {
    if bm.is_clear() {
        None
    } else {
        Some(bm)
    }
}

/// True when the reservation's license claim leaves too few floating
/// licenses for the job to run outside it.
fn license_contention(
    job_licenses: &[LicenseReq],
    resv: &Reservation,
    accounting: &Accounting,
) -> bool {
    job_licenses.iter().any(|jl| {
        resv.licenses.iter().any(|rl| {
            rl.name == jl.name && {
                let total = accounting.license_total(&rl.name).unwrap_or(0);
                rl.count + jl.count > total
            }
        })
    })
}
