mod acl;
mod conflict;
mod error;
mod mutations;
mod queries;
mod select;
mod sweep;

pub use acl::{admits, build_assoc_list, explicit_admits};
pub use conflict::{check_no_conflict, job_conflict, resv_conflict};
pub use error::EngineError;
pub use mutations::{AclEdit, CreateRequest, UpdateRequest};
pub use queries::JobTestResult;
pub use select::{select, CapacityAware, NodeSelector, PickContext, Picked, SelectRequest};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::assoc::Accounting;
use crate::cluster::{JobTable, NodeTable, PartitionTable};
use crate::limits::{MAX_RESV_ID, SAVE_CHANNEL_DEPTH};
use crate::model::Reservation;
use crate::notify::NotifyHub;
use crate::state;

// ── Reservation store ────────────────────────────────────────────

/// The authoritative in-memory reservation collection, plus the two
/// store-owned sequence generators (recyclable id counter and the name
/// suffix high-water mark).
pub struct ResvStore {
    resvs: HashMap<String, Reservation>,
    next_resv_id: u32,
    top_suffix: u32,
}

impl ResvStore {
    fn new() -> Self {
        Self {
            resvs: HashMap::new(),
            next_resv_id: 1,
            top_suffix: 0,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Reservation> {
        self.resvs.get(name)
    }

    pub(super) fn get_mut(&mut self, name: &str) -> Option<&mut Reservation> {
        self.resvs.get_mut(name)
    }

    pub fn find_by_id(&self, resv_id: u32) -> Option<&Reservation> {
        self.resvs.values().find(|r| r.resv_id == resv_id)
    }

    pub fn len(&self) -> usize {
        self.resvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resvs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.resvs.values()
    }

    pub fn next_resv_id(&self) -> u32 {
        self.next_resv_id
    }

    pub fn top_suffix(&self) -> u32 {
        self.top_suffix
    }

    pub(super) fn insert(&mut self, resv: Reservation) {
        self.resvs.insert(resv.name.clone(), resv);
    }

    pub(super) fn remove(&mut self, name: &str) -> Option<Reservation> {
        self.resvs.remove(name)
    }

    /// Next free reservation id. The counter wraps back to 1 past
    /// `MAX_RESV_ID`; ids still held by a live reservation or referenced
    /// by an unfinished job are skipped, so an id is never reused while a
    /// job can still resolve it.
    pub(super) fn alloc_id(&mut self, jobs: &JobTable) -> u32 {
        loop {
            let id = self.next_resv_id;
            self.next_resv_id = if id >= MAX_RESV_ID { 1 } else { id + 1 };
            let in_use = self.resvs.values().any(|r| r.resv_id == id)
                || jobs
                    .iter()
                    .any(|j| !j.state.is_finished() && j.resv_id == Some(id));
            if !in_use {
                return id;
            }
        }
    }

    /// Generate a collision-checked name from an ACL-derived base token.
    pub(super) fn gen_name(&mut self, base: &str) -> String {
        loop {
            self.top_suffix = self.top_suffix.wrapping_add(1);
            let candidate = format!("{base}_{}", self.top_suffix);
            if !self.resvs.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

// ── Save writer task ─────────────────────────────────────────────

pub(super) enum SaveCommand {
    Save {
        response: Option<oneshot::Sender<io::Result<()>>>,
    },
}

/// Background task that owns the state file and coalesces save signals.
/// 1. Block until the first Save arrives.
/// 2. Drain all immediately pending Saves (they share one snapshot).
/// 3. Capture the store under a read lock, write the file once.
/// 4. Respond to every waiting sender.
async fn save_writer_loop(
    store: Arc<RwLock<ResvStore>>,
    path: PathBuf,
    mut rx: mpsc::Receiver<SaveCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        let SaveCommand::Save { response } = cmd;
        let mut responders = vec![response];
        while let Ok(SaveCommand::Save { response }) = rx.try_recv() {
            responders.push(response);
        }
        metrics::histogram!(crate::observability::STATE_SAVE_BATCH_SIZE)
            .record(responders.len() as f64);

        let snapshot = {
            let guard = store.read().await;
            state::Snapshot::capture(
                conflict::now_ms(),
                guard.next_resv_id(),
                guard.top_suffix(),
                guard.iter(),
            )
        };
        let started = std::time::Instant::now();
        let result = state::write_snapshot(&path, &snapshot);
        metrics::histogram!(crate::observability::STATE_SAVE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("state save failed: {e}");
        }

        for tx in responders.into_iter().flatten() {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// The reservation manager. Owns the store; shares read access to the
/// node/partition/job/accounting tables the surrounding daemon maintains.
///
/// Lock discipline: every operation acquires what it needs in the fixed
/// order store → jobs → nodes → partitions → accounting, and the whole
/// validate → conflict-check → commit sequence of a mutation runs under a
/// single store write guard, so two concurrent creates can never both
/// believe the same nodes are free.
pub struct Engine {
    pub(crate) resvs: Arc<RwLock<ResvStore>>,
    pub nodes: Arc<RwLock<NodeTable>>,
    pub partitions: Arc<RwLock<PartitionTable>>,
    pub jobs: Arc<RwLock<JobTable>>,
    pub accounting: Arc<RwLock<Accounting>>,
    pub notify: Arc<NotifyHub>,
    save_tx: mpsc::Sender<SaveCommand>,
    pub(super) selector: Box<dyn NodeSelector>,
}

impl Engine {
    /// Recover the store from the state file (corrupt records are dropped,
    /// recovery continues) and start the save writer task.
    pub fn new(
        state_path: PathBuf,
        nodes: NodeTable,
        partitions: PartitionTable,
        accounting: Accounting,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let recovered = state::recover(&state_path, &nodes)?;
        let mut store = ResvStore::new();
        store.next_resv_id = recovered.next_resv_id.clamp(1, MAX_RESV_ID);
        store.top_suffix = recovered.top_suffix;
        let count = recovered.reservations.len();
        for resv in recovered.reservations {
            store.insert(resv);
        }
        if count > 0 {
            info!("recovered {count} reservations from {}", state_path.display());
        }
        metrics::gauge!(crate::observability::RESV_ACTIVE).set(store.len() as f64);

        let resvs = Arc::new(RwLock::new(store));
        let (save_tx, save_rx) = mpsc::channel(SAVE_CHANNEL_DEPTH);
        tokio::spawn(save_writer_loop(resvs.clone(), state_path, save_rx));

        Ok(Self {
            resvs,
            nodes: Arc::new(RwLock::new(nodes)),
            partitions: Arc::new(RwLock::new(partitions)),
            jobs: Arc::new(RwLock::new(JobTable::new())),
            accounting: Arc::new(RwLock::new(accounting)),
            notify,
            save_tx,
            selector: Box::new(CapacityAware),
        })
    }

    /// Swap in an external capacity-aware node selector.
    pub fn with_selector(mut self, selector: Box<dyn NodeSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Best-effort save signal; the store never blocks on disk I/O.
    pub(crate) fn schedule_save(&self) {
        if self
            .save_tx
            .try_send(SaveCommand::Save { response: None })
            .is_err()
        {
            // Channel full means a write is already pending; the next
            // snapshot will include this change too.
            tracing::debug!("save already pending");
        }
    }

    /// Synchronous save, awaited. Used at shutdown and by tests.
    pub async fn save_now(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.save_tx
            .send(SaveCommand::Save { response: Some(tx) })
            .await
            .map_err(|_| EngineError::SaveError("state writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::SaveError("state writer dropped response".into()))?
            .map_err(|e| EngineError::SaveError(e.to_string()))
    }
}
