use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;
pub const WEEK_MS: Ms = 7 * DAY_MS;

/// Plain half-open interval intersection: `[s1,e1)` meets `[s2,e2)`.
pub fn windows_intersect(s1: Ms, e1: Ms, s2: Ms, e2: Ms) -> bool {
    s1 < e2 && s2 < e1
}

// ── Reservation flags ────────────────────────────────────────────

/// Reservation behavior flags, persisted as a raw mask. Unknown bits are
/// dropped at the validation boundary, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResvFlags(u32);

impl ResvFlags {
    /// System maintenance: wins node exclusions, skips availability filter.
    pub const MAINT: ResvFlags = ResvFlags(0x0001);
    /// May share nodes with other reservations.
    pub const OVERLAP: ResvFlags = ResvFlags(0x0002);
    /// Skip the running-job conflict scan.
    pub const IGNORE_JOBS: ResvFlags = ResvFlags(0x0004);
    /// Re-arms every day after expiry.
    pub const DAILY: ResvFlags = ResvFlags(0x0008);
    /// Re-arms every week after expiry.
    pub const WEEKLY: ResvFlags = ResvFlags(0x0010);
    /// Holds licenses only; no node claim.
    pub const LICENSE_ONLY: ResvFlags = ResvFlags(0x0020);
    /// Node set is never re-picked when nodes fail.
    pub const STATIC_NODES: ResvFlags = ResvFlags(0x0040);
    /// Node set mirrors the partition's membership.
    pub const PART_NODES: ResvFlags = ResvFlags(0x0080);
    /// An explicit node list was given at create time.
    pub const SPEC_NODES: ResvFlags = ResvFlags(0x0100);

    const LEGAL_MASK: u32 = 0x01FF;

    pub fn empty() -> Self {
        ResvFlags(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Drop any bit outside the legal mask.
    pub fn normalized(self) -> Self {
        ResvFlags(self.0 & Self::LEGAL_MASK)
    }

    /// Rebuild from a raw persisted mask, dropping unknown bits.
    pub fn from_bits_truncate(bits: u32) -> Self {
        ResvFlags(bits & Self::LEGAL_MASK)
    }

    pub fn contains(self, other: ResvFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ResvFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ResvFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ResvFlags) {
        self.0 &= !other.0;
    }

    pub fn union(self, other: ResvFlags) -> ResvFlags {
        ResvFlags(self.0 | other.0)
    }

    pub fn recurrence(self) -> Recurrence {
        if self.contains(Self::DAILY) {
            Recurrence::Daily
        } else if self.contains(Self::WEEKLY) {
            Recurrence::Weekly
        } else {
            Recurrence::None
        }
    }

    /// Display form, e.g. `MAINT,DAILY`.
    pub fn label(self) -> String {
        const NAMES: [(ResvFlags, &str); 9] = [
            (ResvFlags::MAINT, "MAINT"),
            (ResvFlags::OVERLAP, "OVERLAP"),
            (ResvFlags::IGNORE_JOBS, "IGNORE_JOBS"),
            (ResvFlags::DAILY, "DAILY"),
            (ResvFlags::WEEKLY, "WEEKLY"),
            (ResvFlags::LICENSE_ONLY, "LICENSE_ONLY"),
            (ResvFlags::STATIC_NODES, "STATIC"),
            (ResvFlags::PART_NODES, "PART_NODES"),
            (ResvFlags::SPEC_NODES, "SPEC_NODES"),
        ];
        let mut out: Vec<&str> = Vec::new();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                out.push(name);
            }
        }
        out.join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
}

impl Recurrence {
    pub fn period_days(self) -> Option<i32> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => Some(1),
            Recurrence::Weekly => Some(7),
        }
    }

    pub fn is_recurring(self) -> bool {
        !matches!(self, Recurrence::None)
    }
}

// ── Licenses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseReq {
    pub name: String,
    pub count: u32,
}

/// Parse `"matlab:4,vtune"` into license requests; a missing count means 1.
pub fn parse_license_list(list: &str) -> Result<Vec<LicenseReq>, String> {
    let mut out = Vec::new();
    for tok in list.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        let (name, count) = match tok.split_once(':') {
            Some((n, c)) => {
                let count: u32 = c
                    .parse()
                    .map_err(|_| format!("bad license count in {tok:?}"))?;
                (n, count)
            }
            None => (tok, 1),
        };
        if name.is_empty() || count == 0 {
            return Err(format!("bad license token {tok:?}"));
        }
        out.push(LicenseReq {
            name: name.to_string(),
            count,
        });
    }
    Ok(out)
}

pub fn format_license_list(licenses: &[LicenseReq]) -> String {
    licenses
        .iter()
        .map(|l| {
            if l.count == 1 {
                l.name.clone()
            } else {
                format!("{}:{}", l.name, l.count)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ── Reservation ──────────────────────────────────────────────────

/// The central entity: a named, time-windowed claim on nodes/cores/licenses
/// with an access-control list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub resv_id: u32,
    pub name: String,

    pub start_time: Ms,
    pub end_time: Ms,
    /// Caller-specified duration, kept so recurrence re-arming preserves it.
    pub duration: Option<Ms>,
    /// First-ever start, before any recurrence advancement.
    pub start_time_first: Ms,
    /// Start of the previous occurrence (recurrence bookkeeping).
    pub start_time_prev: Ms,

    pub flags: ResvFlags,
    pub partition: Option<String>,

    pub node_bitmap: Bitmap,
    /// Global-core-index claim; present only for partial-node reservations.
    pub core_bitmap: Option<Bitmap>,
    /// Denormalized display form of `node_bitmap`.
    pub node_list: String,
    pub node_cnt: u32,
    pub cpu_cnt: u32,

    pub accounts: Vec<String>,
    pub account_not: bool,
    pub users: Vec<u32>,
    pub user_not: bool,
    /// Packed signed association ids, e.g. `"12,-40,57"`. Empty until the
    /// accounting provider resolves the explicit lists.
    pub assoc_list: String,

    pub licenses: Vec<LicenseReq>,
    pub features: Option<String>,

    pub job_pend_cnt: u32,
    pub job_run_cnt: u32,
}

impl Reservation {
    pub fn recurrence(&self) -> Recurrence {
        self.flags.recurrence()
    }

    /// Full-node reservations claim whole nodes; partial ones carry cores.
    pub fn is_full_nodes(&self) -> bool {
        self.core_bitmap.is_none()
    }

    pub fn in_use(&self) -> bool {
        self.job_pend_cnt > 0 || self.job_run_cnt > 0
    }

    pub fn overlaps_window(&self, start: Ms, end: Ms) -> bool {
        windows_intersect(self.start_time, self.end_time, start, end)
    }
}

// ── External read-only views (owned by the in-crate tables) ──────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Complete,
}

impl JobState {
    pub fn is_running(self) -> bool {
        matches!(self, JobState::Running | JobState::Suspended)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Complete)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: u32,
    pub state: JobState,
    pub user_id: u32,
    pub account: String,
    pub assoc_id: Option<u32>,
    pub start_time: Ms,
    pub end_time: Ms,
    pub node_bitmap: Bitmap,
    pub core_bitmap: Option<Bitmap>,
    pub licenses: Vec<LicenseReq>,
    /// Reservation the job asked for by name, if any.
    pub resv_name: Option<String>,
    /// Back-reference set when the job is admitted. An integer foreign key
    /// resolved by lookup at time of use; a stale id simply fails to resolve.
    pub resv_id: Option<u32>,
}

/// Node state bits mirrored from the node-state callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeState(u8);

impl NodeState {
    pub const DOWN: NodeState = NodeState(0x1);
    pub const DRAIN: NodeState = NodeState(0x2);
    pub const NOT_RESPONDING: NodeState = NodeState(0x4);

    pub fn up() -> Self {
        NodeState(0)
    }

    pub fn with(self, other: NodeState) -> NodeState {
        NodeState(self.0 | other.0)
    }

    pub fn is_available(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub cpus: u32,
    pub features: Vec<String>,
    pub partitions: Vec<String>,
    pub state: NodeState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRecord {
    pub name: String,
    pub node_bitmap: Bitmap,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub is_default: bool,
}

// ── Notifications ────────────────────────────────────────────────

/// Narrow events published for the node fan-out layer and display callers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResvEvent {
    Created { name: String, resv_id: u32 },
    Updated { name: String },
    Deleted { name: String },
    Advanced { name: String, start_time: Ms, end_time: Ms },
}

impl ResvEvent {
    pub fn resv_name(&self) -> &str {
        match self {
            ResvEvent::Created { name, .. }
            | ResvEvent::Updated { name }
            | ResvEvent::Deleted { name }
            | ResvEvent::Advanced { name, .. } => name,
        }
    }
}

// ── Display dump ─────────────────────────────────────────────────

/// Flattened reservation view for the query-all dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResvInfo {
    pub resv_id: u32,
    pub name: String,
    pub start_time: Ms,
    pub end_time: Ms,
    pub node_list: String,
    pub node_cnt: u32,
    pub cpu_cnt: u32,
    pub partition: Option<String>,
    pub accounts: Vec<String>,
    pub users: Vec<u32>,
    pub licenses: String,
    pub features: Option<String>,
    pub flags: String,
}

impl From<&Reservation> for ResvInfo {
    fn from(r: &Reservation) -> Self {
        ResvInfo {
            resv_id: r.resv_id,
            name: r.name.clone(),
            start_time: r.start_time,
            end_time: r.end_time,
            node_list: r.node_list.clone(),
            node_cnt: r.node_cnt,
            cpu_cnt: r.cpu_cnt,
            partition: r.partition.clone(),
            accounts: r.accounts.clone(),
            users: r.users.clone(),
            licenses: format_license_list(&r.licenses),
            features: r.features.clone(),
            flags: r.flags.label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_intersection_half_open() {
        assert!(windows_intersect(100, 200, 150, 250));
        assert!(!windows_intersect(100, 200, 200, 300)); // adjacent
        assert!(windows_intersect(100, 200, 0, 101));
        assert!(!windows_intersect(100, 200, 0, 100));
    }

    #[test]
    fn flags_normalize_drops_unknown_bits() {
        let raw = ResvFlags(0xFFFF_0000 | ResvFlags::MAINT.bits() | ResvFlags::DAILY.bits());
        let normalized = raw.normalized();
        assert!(normalized.contains(ResvFlags::MAINT));
        assert!(normalized.contains(ResvFlags::DAILY));
        assert_eq!(normalized.bits() & 0xFFFF_0000, 0);
    }

    #[test]
    fn flags_recurrence_mapping() {
        assert_eq!(ResvFlags::DAILY.recurrence(), Recurrence::Daily);
        assert_eq!(ResvFlags::WEEKLY.recurrence(), Recurrence::Weekly);
        assert_eq!(ResvFlags::empty().recurrence(), Recurrence::None);
        assert_eq!(Recurrence::Daily.period_days(), Some(1));
        assert_eq!(Recurrence::Weekly.period_days(), Some(7));
    }

    #[test]
    fn flags_label() {
        let f = ResvFlags::MAINT.union(ResvFlags::WEEKLY);
        assert_eq!(f.label(), "MAINT,WEEKLY");
        assert_eq!(ResvFlags::empty().label(), "");
    }

    #[test]
    fn license_parse_basic() {
        let reqs = parse_license_list("matlab:4,vtune").unwrap();
        assert_eq!(
            reqs,
            vec![
                LicenseReq { name: "matlab".into(), count: 4 },
                LicenseReq { name: "vtune".into(), count: 1 },
            ]
        );
        assert_eq!(format_license_list(&reqs), "matlab:4,vtune");
    }

    #[test]
    fn license_parse_rejects_garbage() {
        assert!(parse_license_list("matlab:x").is_err());
        assert!(parse_license_list(":3").is_err());
        assert!(parse_license_list("matlab:0").is_err());
        assert!(parse_license_list("").unwrap().is_empty());
    }

    #[test]
    fn node_state_availability() {
        assert!(NodeState::up().is_available());
        assert!(!NodeState::up().with(NodeState::DRAIN).is_available());
        assert!(!NodeState::DOWN.is_available());
    }
}
