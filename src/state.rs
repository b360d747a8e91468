use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bitmap::Bitmap;
use crate::cluster::NodeTable;
use crate::model::{
    format_license_list, parse_license_list, Ms, Reservation, ResvFlags,
};

/// Version tag leading every state file. The dispatch table in
/// `decode_file` maps known tags to their decoder; anything else is
/// rejected and recovery falls back to the previous generation.
pub const STATE_VERSION_V1: &str = "corral-resv-v1";

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ── On-disk records ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct HeaderV1 {
    version: String,
    saved_at: Ms,
    next_resv_id: u32,
    top_suffix: u32,
    count: u32,
}

/// One reservation in fixed field order. Node membership is persisted as
/// the denormalized name expression and re-resolved against the node table
/// at recovery; the core bitmap is carried verbatim (it has no stable name
/// form).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordV1 {
    pub name: String,
    pub accounts: Vec<String>,
    pub end_time: Ms,
    pub features: Option<String>,
    pub flags: u32,
    pub licenses: String,
    pub node_cnt: u32,
    pub node_list: String,
    pub partition: Option<String>,
    pub start_time_first: Ms,
    pub users: Vec<u32>,
    // internal-only fields
    pub account_not: bool,
    pub assoc_list: String,
    pub core_bitmap: Option<Bitmap>,
    pub duration: Option<Ms>,
    pub full_nodes: bool,
    pub resv_id: u32,
    pub start_time_prev: Ms,
    pub start_time: Ms,
    pub user_not: bool,
}

impl RecordV1 {
    pub fn from_reservation(r: &Reservation) -> Self {
        RecordV1 {
            name: r.name.clone(),
            accounts: r.accounts.clone(),
            end_time: r.end_time,
            features: r.features.clone(),
            flags: r.flags.bits(),
            licenses: format_license_list(&r.licenses),
            node_cnt: r.node_cnt,
            node_list: r.node_list.clone(),
            partition: r.partition.clone(),
            start_time_first: r.start_time_first,
            users: r.users.clone(),
            account_not: r.account_not,
            assoc_list: r.assoc_list.clone(),
            core_bitmap: r.core_bitmap.clone(),
            duration: r.duration,
            full_nodes: r.core_bitmap.is_none(),
            resv_id: r.resv_id,
            start_time_prev: r.start_time_prev,
            start_time: r.start_time,
            user_not: r.user_not,
        }
    }

    /// Rebuild the live reservation, enforcing the store invariants. A
    /// record violating them is rejected rather than admitted.
    pub fn into_reservation(self, nodes: &NodeTable) -> Result<Reservation, String> {
        if self.name.is_empty() {
            return Err("empty name".into());
        }
        if self.start_time >= self.end_time {
            return Err("start not before end".into());
        }
        let flags = ResvFlags::from_bits_truncate(self.flags);
        let license_only = flags.contains(ResvFlags::LICENSE_ONLY);
        if self.accounts.is_empty() && self.users.is_empty() && !license_only {
            return Err("no accounts or users".into());
        }
        let licenses = parse_license_list(&self.licenses)?;

        let node_bitmap = if self.node_list.is_empty() {
            Bitmap::new(nodes.len())
        } else {
            nodes
                .expr_to_bitmap(&self.node_list)
                .map_err(|e| e.to_string())?
        };
        if node_bitmap.count() as u32 != self.node_cnt {
            return Err(format!(
                "node_cnt {} disagrees with node_list {:?}",
                self.node_cnt, self.node_list
            ));
        }

        let core_bitmap = match (self.full_nodes, self.core_bitmap) {
            (true, Some(_)) => return Err("full-node record carries a core bitmap".into()),
            (true, None) => None,
            (false, None) => return Err("partial record missing its core bitmap".into()),
            (false, Some(cb)) => {
                if cb.domain() != nodes.total_cores() as usize {
                    return Err("core bitmap domain disagrees with cluster".into());
                }
                let mut allowed = Bitmap::new(cb.domain());
                for idx in node_bitmap.iter_ones() {
                    for c in nodes.core_range(idx) {
                        allowed.set(c);
                    }
                }
                if !allowed.is_superset_of(&cb) {
                    return Err("core bitmap escapes the node bitmap".into());
                }
                Some(cb)
            }
        };

        let cpu_cnt = match &core_bitmap {
            Some(cb) => cb.count() as u32,
            None => nodes.sum_cpus(&node_bitmap),
        };

        Ok(Reservation {
            resv_id: self.resv_id,
            name: self.name,
            start_time: self.start_time,
            end_time: self.end_time,
            duration: self.duration,
            start_time_first: self.start_time_first,
            start_time_prev: self.start_time_prev,
            flags,
            partition: self.partition,
            node_bitmap,
            core_bitmap,
            node_list: self.node_list,
            node_cnt: self.node_cnt,
            cpu_cnt,
            accounts: self.accounts,
            account_not: self.account_not,
            users: self.users,
            user_not: self.user_not,
            assoc_list: self.assoc_list,
            licenses,
            features: self.features,
            job_pend_cnt: 0,
            job_run_cnt: 0,
        })
    }
}

// ── Snapshot ─────────────────────────────────────────────────────

pub struct Snapshot {
    pub saved_at: Ms,
    pub next_resv_id: u32,
    pub top_suffix: u32,
    pub records: Vec<RecordV1>,
}

impl Snapshot {
    pub fn capture<'a>(
        saved_at: Ms,
        next_resv_id: u32,
        top_suffix: u32,
        resvs: impl Iterator<Item = &'a Reservation>,
    ) -> Self {
        Snapshot {
            saved_at,
            next_resv_id,
            top_suffix,
            records: resvs.map(RecordV1::from_reservation).collect(),
        }
    }
}

pub struct RecoveredState {
    pub next_resv_id: u32,
    pub top_suffix: u32,
    pub reservations: Vec<Reservation>,
}

impl RecoveredState {
    fn empty() -> Self {
        RecoveredState {
            next_resv_id: 1,
            top_suffix: 0,
            reservations: Vec::new(),
        }
    }
}

// ── Framing: [u32 len][bincode payload][u32 crc32] ───────────────

fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

enum Frame {
    Good(Vec<u8>),
    /// Length was readable but the payload failed its CRC; the frame was
    /// skipped in full so the stream stays aligned.
    Corrupt,
}

fn read_frame(reader: &mut impl Read) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None); // unrecognizable garbage; stop here
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Some(Frame::Corrupt));
    }
    Ok(Some(Frame::Good(payload)))
}

// ── Write path ───────────────────────────────────────────────────

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Serialize the snapshot to `<path>.tmp`, fsync, rotate the live file to
/// `<path>.old` (one-generation backup), then rename the temp file into
/// place.
pub fn write_snapshot(path: &Path, snap: &Snapshot) -> io::Result<()> {
    let tmp = sibling(path, ".tmp");
    let old = sibling(path, ".old");

    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);

        let header = HeaderV1 {
            version: STATE_VERSION_V1.to_string(),
            saved_at: snap.saved_at,
            next_resv_id: snap.next_resv_id,
            top_suffix: snap.top_suffix,
            count: snap.records.len() as u32,
        };
        let bytes = bincode::serialize(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(&mut writer, &bytes)?;

        for record in &snap.records {
            let bytes = bincode::serialize(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write_frame(&mut writer, &bytes)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    match fs::rename(path, &old) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(&tmp, path)
}

// ── Read path ────────────────────────────────────────────────────

fn decode_file(path: &Path, nodes: &NodeTable) -> io::Result<RecoveredState> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header: HeaderV1 = match read_frame(&mut reader)? {
        Some(Frame::Good(payload)) => bincode::deserialize(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unreadable state header",
            ));
        }
    };

    // Version dispatch: known tags decode, everything else is rejected.
    match header.version.as_str() {
        STATE_VERSION_V1 => {}
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported state version {other:?}"),
            ));
        }
    }

    let mut reservations = Vec::with_capacity(header.count as usize);
    while let Some(frame) = read_frame(&mut reader)? {
        let payload = match frame {
            Frame::Good(p) => p,
            Frame::Corrupt => {
                warn!("dropping reservation record with bad checksum");
                continue;
            }
        };
        let record: RecordV1 = match bincode::deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping undecodable reservation record: {e}");
                continue;
            }
        };
        let name = record.name.clone();
        match record.into_reservation(nodes) {
            Ok(resv) => reservations.push(resv),
            Err(reason) => warn!("dropping reservation {name:?}: {reason}"),
        }
    }

    Ok(RecoveredState {
        next_resv_id: header.next_resv_id,
        top_suffix: header.top_suffix,
        reservations,
    })
}

/// Load the store from disk. The live file is tried first; if it is
/// missing or unreadable the one-generation backup is consulted before
/// giving up. A cluster that has never saved starts empty.
pub fn recover(path: &Path, nodes: &NodeTable) -> io::Result<RecoveredState> {
    let live_err = match decode_file(path, nodes) {
        Ok(state) => return Ok(state),
        Err(e) => e,
    };
    let old = sibling(path, ".old");
    match decode_file(&old, nodes) {
        Ok(state) => {
            warn!(
                "state file {} unreadable ({live_err}); recovered from backup",
                path.display()
            );
            Ok(state)
        }
        Err(old_err) => {
            if live_err.kind() == io::ErrorKind::NotFound
                && old_err.kind() == io::ErrorKind::NotFound
            {
                Ok(RecoveredState::empty())
            } else if live_err.kind() == io::ErrorKind::NotFound {
                Err(old_err)
            } else {
                Err(live_err)
            }
        }
    }
}
