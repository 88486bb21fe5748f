//! Per-torrent packed piece cache.
//!
//! Each torrent owns one cache file `<dir>/<hex infohash>.tc`:
//!
//! ```text
//! offset 0      magic 'bt02' (big-endian u32)
//! offset 4      metainfo length M (big-endian u32)
//! offset 8      M bytes of metainfo, byte-exact
//! offset 8+M    piece→slot map, one big-endian u32 per piece, 0xFFFFFFFF = absent
//! offset 8+M+4N slot storage, piece_length bytes per slot
//! ```
//!
//! A single worker task performs every read and write; the core lock is
//! never held across file I/O. Write ordering is what makes a torn write
//! safe: the reclaimed slot's old map entry is cleared first, then the
//! piece bytes land, then the new map entry — so the map never points a
//! piece at bytes that did not pass verification.

use crate::error::{BtError, BtResult};
use crate::hasher;
use crate::metainfo::InfoHash;
use crate::session::{Core, Session};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const MAGIC: u32 = 0x6274_3032; // 'bt02'
const ABSENT: u32 = 0xffff_ffff;
const MAX_HEADER_METAINFO: u32 = 1024 * 1024;
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Open cache file state for one torrent. The map and its inverse stay in
/// RAM; `file` is taken out by the worker for the duration of each I/O.
pub(crate) struct CacheFile {
    path: PathBuf,
    file: Option<File>,
    /// piece index -> slot, ABSENT when not on disk.
    map: Vec<u32>,
    /// slot -> piece index.
    inv: Vec<u32>,
    map_offset: u64,
    store_offset: u64,
    pub next_disk_block: u32,
    pub total_disk_blocks: u32,
    piece_length: u32,
}

/// Where one piece write goes, with the ordering constraints resolved at
/// allocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotPlan {
    pub slot: u32,
    pub data_offset: u64,
    pub map_entry_offset: u64,
    /// Map entry of the piece that previously occupied the slot; cleared
    /// on disk before the new data is written.
    pub old_map_entry_offset: Option<u64>,
}

impl CacheFile {
    pub fn slot_of(&self, piece: u32) -> Option<u32> {
        self.map
            .get(piece as usize)
            .copied()
            .filter(|slot| *slot != ABSENT)
    }

    pub fn file_size(&self) -> u64 {
        self.store_offset + self.total_disk_blocks as u64 * self.piece_length as u64
    }

    pub fn data_offset(&self, slot: u32) -> u64 {
        self.store_offset + slot as u64 * self.piece_length as u64
    }

    /// Claim the next slot for `piece`, fixing the map and inverse map in
    /// RAM and reporting which disk offsets the worker must touch, in
    /// order. Maintains the partial bijection between map and inverse.
    pub fn allocate_slot(&mut self, piece: u32) -> SlotPlan {
        // The slot window never outgrows the piece count; wrap instead
        if self.next_disk_block as usize >= self.inv.len() {
            self.next_disk_block = 0;
        }
        let slot = self.next_disk_block;
        self.next_disk_block += 1;
        self.total_disk_blocks = self.total_disk_blocks.max(self.next_disk_block);

        let mut old_map_entry_offset = None;
        let old_piece = self.inv[slot as usize];
        if old_piece != ABSENT {
            // Another piece occupied this slot; its map entry must be
            // cleared on disk before the slot is overwritten.
            self.map[old_piece as usize] = ABSENT;
            old_map_entry_offset = Some(self.map_offset + 4 * old_piece as u64);
        }
        let old_slot = self.map[piece as usize];
        if old_slot != ABSENT {
            // Rewrite after corruption: drop the stale inverse entry.
            self.inv[old_slot as usize] = ABSENT;
        }
        self.map[piece as usize] = slot;
        self.inv[slot as usize] = piece;

        SlotPlan {
            slot,
            data_offset: self.data_offset(slot),
            map_entry_offset: self.map_offset + 4 * piece as u64,
            old_map_entry_offset,
        }
    }

    /// Drop the upper half of the slot window to make room when eviction
    /// found nothing to delete.
    pub fn shrink_window(&mut self) {
        self.next_disk_block /= 2;
        for slot in self.next_disk_block..self.total_disk_blocks {
            let piece = self.inv[slot as usize];
            if piece != ABSENT {
                self.map[piece as usize] = ABSENT;
                self.inv[slot as usize] = ABSENT;
            }
        }
        warn!(next = self.next_disk_block, "cache window shrunk");
    }

    /// Open or initialise the cache file. A header that fails validation
    /// (bad magic, foreign metainfo, short map) is rewritten from scratch
    /// with every slot cleared.
    pub async fn open(
        dir: &Path,
        hash: InfoHash,
        metainfo_raw: &[u8],
        num_pieces: u32,
        piece_length: u32,
    ) -> BtResult<CacheFile> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| BtError::CacheIo(e.to_string()))?;
        let path = dir.join(format!("{}.tc", hash.to_hex()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| BtError::CacheIo(e.to_string()))?;

        let mut cache = CacheFile {
            path,
            file: None,
            map: vec![ABSENT; num_pieces as usize],
            inv: vec![ABSENT; num_pieces as usize],
            map_offset: 0,
            store_offset: 0,
            next_disk_block: 0,
            total_disk_blocks: 0,
            piece_length,
        };

        match validate_header(&mut file, hash, num_pieces).await {
            Ok((meta_len, map_raw)) => {
                cache.map_offset = 8 + meta_len as u64;
                cache.store_offset = cache.map_offset + 4 * num_pieces as u64;
                let mut max_slot: i64 = -1;
                for (piece, chunk) in map_raw.chunks_exact(4).enumerate() {
                    let mut slot = u32::from_be_bytes(chunk.try_into().unwrap());
                    if slot >= num_pieces {
                        slot = ABSENT;
                    }
                    if slot != ABSENT {
                        cache.map[piece] = slot;
                        cache.inv[slot as usize] = piece as u32;
                        max_slot = max_slot.max(slot as i64);
                    }
                }
                cache.next_disk_block = (max_slot + 1) as u32;
                cache.total_disk_blocks = cache.next_disk_block;
                debug!(
                    pieces_on_disk = cache.map.iter().filter(|s| **s != ABSENT).count(),
                    "cache file validated"
                );
            }
            Err(err) => {
                debug!(error = %err, "cache header invalid, rewriting");
                write_fresh_header(&mut file, metainfo_raw, num_pieces)
                    .await
                    .map_err(|e| BtError::CacheIo(e.to_string()))?;
                cache.map_offset = 8 + metainfo_raw.len() as u64;
                cache.store_offset = cache.map_offset + 4 * num_pieces as u64;
            }
        }
        cache.file = Some(file);
        Ok(cache)
    }
}

async fn validate_header(
    file: &mut File,
    hash: InfoHash,
    num_pieces: u32,
) -> BtResult<(u32, Vec<u8>)> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut head = [0u8; 8];
    file.read_exact(&mut head)
        .await
        .map_err(|_| BtError::CacheInvalid("short header".into()))?;
    let magic = u32::from_be_bytes(head[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(BtError::CacheInvalid(format!("bad magic 0x{magic:08x}")));
    }
    let meta_len = u32::from_be_bytes(head[4..8].try_into().unwrap());
    if meta_len == 0 || meta_len > MAX_HEADER_METAINFO {
        return Err(BtError::CacheInvalid(format!("bad metainfo size {meta_len}")));
    }
    let mut metainfo = vec![0u8; meta_len as usize];
    file.read_exact(&mut metainfo)
        .await
        .map_err(|_| BtError::CacheInvalid("short metainfo".into()))?;

    let doc = crate::bencode::parse_document(&metainfo)
        .map_err(|e| BtError::CacheInvalid(format!("metainfo: {e}")))?;
    let span = doc
        .info_span
        .ok_or_else(|| BtError::CacheInvalid("no info dict in header".into()))?;
    if InfoHash::of(&metainfo[span]) != hash {
        return Err(BtError::CacheInvalid("metainfo hash mismatch".into()));
    }

    let mut map_raw = vec![0u8; num_pieces as usize * 4];
    if file.read_exact(&mut map_raw).await.is_err() {
        // Truncated map: treat every slot as absent but keep the header.
        map_raw.fill(0xff);
    }
    Ok((meta_len, map_raw))
}

async fn write_fresh_header(
    file: &mut File,
    metainfo_raw: &[u8],
    num_pieces: u32,
) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&MAGIC.to_be_bytes()).await?;
    file.write_all(&(metainfo_raw.len() as u32).to_be_bytes())
        .await?;
    file.write_all(metainfo_raw).await?;
    file.write_all(&vec![0xffu8; num_pieces as usize * 4]).await?;
    file.flush().await?;
    Ok(())
}

/// The ordered piece write: clear the reclaimed slot's old map entry,
/// write the piece bytes, then write the new map entry.
pub(crate) async fn write_slot(file: &mut File, plan: &SlotPlan, data: &[u8]) -> std::io::Result<()> {
    if let Some(offset) = plan.old_map_entry_offset {
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&ABSENT.to_be_bytes()).await?;
    }
    file.seek(SeekFrom::Start(plan.data_offset)).await?;
    file.write_all(data).await?;
    file.seek(SeekFrom::Start(plan.map_entry_offset)).await?;
    file.write_all(&plan.slot.to_be_bytes()).await?;
    file.flush().await?;
    Ok(())
}

pub(crate) async fn read_slot(
    file: &mut File,
    data_offset: u64,
    buf: &mut [u8],
) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(data_offset)).await?;
    file.read_exact(buf).await?;
    Ok(())
}

/// Read the stored metainfo back out of a cache file, so a magnet re-open
/// needs no network metadata exchange.
pub(crate) async fn load_metainfo_from_cache(dir: &Path, hash: InfoHash) -> Option<Vec<u8>> {
    let path = dir.join(format!("{}.tc", hash.to_hex()));
    let mut file = File::open(&path).await.ok()?;
    let mut head = [0u8; 8];
    file.read_exact(&mut head).await.ok()?;
    if u32::from_be_bytes(head[0..4].try_into().unwrap()) != MAGIC {
        return None;
    }
    let meta_len = u32::from_be_bytes(head[4..8].try_into().unwrap());
    if meta_len == 0 || meta_len > MAX_HEADER_METAINFO {
        return None;
    }
    let mut metainfo = vec![0u8; meta_len as usize];
    file.read_exact(&mut metainfo).await.ok()?;

    let doc = crate::bencode::parse_document(&metainfo).ok()?;
    let span = doc.info_span?;
    if InfoHash::of(&metainfo[span]) != hash {
        return None;
    }
    Some(metainfo)
}

enum Job {
    Open(InfoHash),
    Load(InfoHash, u32),
    Write(InfoHash, u32),
}

/// The disk worker: opens cache files, loads requested pieces, writes
/// verified ones, and keeps usage under the global budget.
pub(crate) async fn run(session: Arc<Session>) {
    loop {
        update_disk_avail(&session);

        let job = {
            let mut core = session.core.lock().unwrap();
            find_job(&mut core)
        };

        match job {
            Some(Job::Open(hash)) => handle_open(&session, hash).await,
            Some(Job::Load(hash, index)) => handle_load(&session, hash, index).await,
            Some(Job::Write(hash, index)) => handle_write(&session, hash, index).await,
            None => {
                tokio::select! {
                    _ = session.shutdown.cancelled() => return,
                    _ = timeout(IDLE_WAIT, session.io_notify.notified()) => {}
                }
            }
        }
    }
}

fn find_job(core: &mut Core) -> Option<Job> {
    for (hash, to) in core.torrents.iter() {
        if to.cache_open_req && to.metainfo.is_some() && to.cache.is_none() {
            return Some(Job::Open(*hash));
        }
        if to.cache.is_none() {
            continue;
        }
        for piece in to.pieces.values() {
            if piece.io_busy {
                continue;
            }
            if piece.load_req && !piece.load_fail {
                return Some(Job::Load(*hash, piece.index));
            }
            if piece.hash_ok && !piece.on_disk && !piece.disk_fail {
                return Some(Job::Write(*hash, piece.index));
            }
        }
    }
    None
}

async fn handle_open(session: &Arc<Session>, hash: InfoHash) {
    let params = {
        let mut core = session.core.lock().unwrap();
        let Some(to) = core.torrents.get_mut(&hash) else {
            return;
        };
        to.cache_open_req = false;
        to.metainfo
            .as_ref()
            .map(|mi| (mi.raw.clone(), mi.num_pieces(), mi.piece_length))
    };
    let Some((raw, num_pieces, piece_length)) = params else {
        return;
    };

    let result = CacheFile::open(&session.cache_dir, hash, &raw, num_pieces, piece_length).await;

    let mut core = session.core.lock().unwrap();
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    match result {
        Ok(cache) => {
            info!(torrent = %hash, path = %cache.path.display(), "cache file open");
            to.cache = Some(cache);
            // Pieces created before the cache opened may already be on
            // disk: stop requesting them from the network and queue loads
            // for the ones readers are waiting on.
            let cache = to.cache.as_ref().unwrap();
            let cached: Vec<u32> = to
                .pieces
                .values()
                .filter(|p| !p.complete && !p.io_busy && cache.slot_of(p.index).is_some())
                .map(|p| p.index)
                .collect();
            for index in cached {
                let piece = to.pieces.get_mut(&index).unwrap();
                piece.waiting.clear();
                if !piece.active_handles.is_empty() || !piece.sendreqs.is_empty() {
                    piece.load_req = true;
                }
            }
        }
        Err(err) => {
            // Run without a disk cache for this torrent
            warn!(torrent = %hash, error = %err, "unable to open cache file");
        }
    }
}

async fn handle_load(session: &Arc<Session>, hash: InfoHash, index: u32) {
    let taken = {
        let mut core = session.core.lock().unwrap();
        take_piece_io(&mut core, hash, index, false)
    };
    let Some((mut file, mut buf, offset)) = taken else {
        // Slot vanished under us; hand the piece back to the network path
        let mut core = session.core.lock().unwrap();
        if let Some(piece) = core
            .torrents
            .get_mut(&hash)
            .and_then(|to| to.pieces.get_mut(&index))
        {
            piece.load_req = false;
            piece.load_fail = true;
            piece.restart();
        }
        return;
    };

    let ok = read_slot(&mut file, offset, &mut buf).await.is_ok();

    let mut core = session.core.lock().unwrap();
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    if let Some(cache) = &mut to.cache {
        cache.file = Some(file);
    }
    let Some(piece) = to.pieces.get_mut(&index) else {
        return;
    };
    piece.data = buf;
    piece.io_busy = false;
    piece.load_req = false;
    if ok {
        debug!(torrent = %hash, piece = index, "piece loaded from cache");
        piece.complete = true;
        piece.on_disk = true;
        hasher::wake(session, &mut core);
    } else {
        // Fail silently; the piece is re-fetched over the network
        warn!(torrent = %hash, piece = index, "cache load failed");
        piece.load_fail = true;
        piece.restart();
    }
}

async fn handle_write(session: &Arc<Session>, hash: InfoHash, index: u32) {
    // Budget check happens before allocation; eviction and window
    // shrinking make room when the write would overflow the cache limit.
    loop {
        let over = {
            let mut core = session.core.lock().unwrap();
            update_usage(&mut core);
            let Some(to) = core.torrents.get(&hash) else {
                return;
            };
            let Some(cache) = &to.cache else {
                return;
            };
            let growth = if cache.next_disk_block >= cache.total_disk_blocks {
                cache.piece_length as u64
            } else {
                0
            };
            core.disk.active + core.disk.inactive + growth >= core.disk.limit
        };
        if !over {
            break;
        }
        debug!("cache write would exceed budget, evicting");
        if scan(session, false).await {
            continue; // something was deleted, re-check
        }
        let mut core = session.core.lock().unwrap();
        if let Some(cache) = core
            .torrents
            .get_mut(&hash)
            .and_then(|to| to.cache.as_mut())
        {
            cache.shrink_window();
        }
        break;
    }

    let taken = {
        let mut core = session.core.lock().unwrap();
        take_piece_io(&mut core, hash, index, true)
    };
    let Some((mut file, buf, _)) = taken else {
        let mut core = session.core.lock().unwrap();
        if let Some(piece) = core
            .torrents
            .get_mut(&hash)
            .and_then(|to| to.pieces.get_mut(&index))
        {
            piece.disk_fail = true;
        }
        return;
    };
    let plan = {
        let mut core = session.core.lock().unwrap();
        let plan = core
            .torrents
            .get_mut(&hash)
            .and_then(|to| to.cache.as_mut())
            .map(|cache| cache.allocate_slot(index));
        plan
    };
    let Some(plan) = plan else {
        restore_piece_io(session, hash, index, file, buf, false);
        return;
    };

    let ok = write_slot(&mut file, &plan, &buf).await.is_ok();
    debug!(torrent = %hash, piece = index, slot = plan.slot, ok, "piece write");
    restore_piece_io(session, hash, index, file, buf, ok);
}

/// Pull the piece buffer and cache file handle out of the core for an
/// unlocked I/O region. Marks the piece busy.
fn take_piece_io(
    core: &mut Core,
    hash: InfoHash,
    index: u32,
    write: bool,
) -> Option<(File, Vec<u8>, u64)> {
    let to = core.torrents.get_mut(&hash)?;
    if !to.pieces.contains_key(&index) {
        return None;
    }
    let cache = to.cache.as_mut()?;
    let offset = if write {
        0 // offset comes from the allocation plan
    } else {
        let slot = cache.slot_of(index)?;
        cache.data_offset(slot)
    };
    let file = cache.file.take()?;
    let piece = to.pieces.get_mut(&index).unwrap();
    piece.io_busy = true;
    Some((file, std::mem::take(&mut piece.data), offset))
}

fn restore_piece_io(
    session: &Arc<Session>,
    hash: InfoHash,
    index: u32,
    file: File,
    buf: Vec<u8>,
    write_ok: bool,
) {
    let mut core = session.core.lock().unwrap();
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    if let Some(cache) = &mut to.cache {
        cache.file = Some(file);
    }
    let Some(piece) = to.pieces.get_mut(&index) else {
        return;
    };
    piece.data = buf;
    piece.io_busy = false;
    if write_ok {
        piece.on_disk = true;
    } else {
        // Not retried this session; the piece stays valid in RAM
        piece.disk_fail = true;
    }
}

/// Recompute the active-bytes total and the global cache limit:
/// (free + active + inactive) * free_space_percentage / 100.
fn update_usage(core: &mut Core) {
    let active: u64 = core
        .torrents
        .values()
        .filter_map(|to| to.cache.as_ref())
        .map(CacheFile::file_size)
        .sum();
    core.disk.active = active;
    let sum = core.disk.active + core.disk.inactive;
    core.disk.limit = ((core.disk.avail + sum) * core.limits.free_space_percentage as u64 / 100)
        .max(1);
}

fn update_disk_avail(session: &Arc<Session>) {
    let Some(avail) = fs_available_bytes(&session.cache_dir) else {
        return;
    };
    let mut core = session.core.lock().unwrap();
    core.disk.avail = avail;
}

#[cfg(unix)]
fn fs_available_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let cstr = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cstr.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn fs_available_bytes(_path: &Path) -> Option<u64> {
    None
}

/// List the cache directory and delete inactive torrents' files, oldest
/// mtime first, until usage drops under the budget (or everything went,
/// with `force`). Returns whether anything was deleted.
pub(crate) async fn scan(session: &Arc<Session>, force: bool) -> bool {
    update_disk_avail(session);

    let mut entries: Vec<(PathBuf, InfoHash, u64, SystemTime)> = Vec::new();
    let Ok(mut dir) = fs::read_dir(&session.cache_dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() != 43 || !name.ends_with(".tc") {
            continue;
        }
        let Ok(hash) = InfoHash::from_hex(&name[..40]) else {
            continue;
        };
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((entry.path(), hash, meta.len(), mtime));
    }
    entries.sort_by_key(|e| e.3);

    let doomed: Vec<(PathBuf, u64)> = {
        let mut core = session.core.lock().unwrap();
        core.disk.inactive = entries
            .iter()
            .filter(|(_, hash, _, _)| !core.torrents.contains_key(hash))
            .map(|(_, _, size, _)| size)
            .sum();
        update_usage(&mut core);

        let mut running = core.disk.active + core.disk.inactive;
        let limit = core.disk.limit;
        let mut doomed = Vec::new();
        for (path, hash, size, _) in &entries {
            if core.torrents.contains_key(hash) {
                continue;
            }
            if force || running >= limit {
                doomed.push((path.clone(), *size));
                running -= size;
            }
        }
        doomed
    };

    let mut deleted = false;
    for (path, size) in doomed {
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), size, "evicted cache file");
                deleted = true;
                let mut core = session.core.lock().unwrap();
                core.disk.inactive = core.disk.inactive.saturating_sub(size);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unable to evict cache file");
            }
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NUM_PIECES: u32 = 8;
    const PIECE_LEN: u32 = 65536;

    fn metainfo_bytes() -> (Vec<u8>, InfoHash) {
        use crate::bencode::{dict, Value};
        let info = dict(vec![
            ("length", Value::Int(PIECE_LEN as i64 * NUM_PIECES as i64)),
            ("name", Value::Bytes(b"cachetest".to_vec())),
            ("piece length", Value::Int(PIECE_LEN as i64)),
            ("pieces", Value::Bytes(vec![0u8; NUM_PIECES as usize * 20])),
        ]);
        let raw = dict(vec![("info", info)]).encode();
        let mi = crate::metainfo::Metainfo::parse(&raw).unwrap();
        (raw, mi.info_hash)
    }

    #[tokio::test]
    async fn test_open_write_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, hash) = metainfo_bytes();

        let mut cache = CacheFile::open(dir.path(), hash, &raw, NUM_PIECES, PIECE_LEN)
            .await
            .unwrap();
        assert_eq!(cache.next_disk_block, 0);
        assert!(cache.slot_of(3).is_none());

        let plan = cache.allocate_slot(3);
        assert_eq!(plan.slot, 0);
        assert!(plan.old_map_entry_offset.is_none());
        let mut file = cache.file.take().unwrap();
        let data = vec![0x5a; PIECE_LEN as usize];
        write_slot(&mut file, &plan, &data).await.unwrap();
        drop(file);

        // Reopen: the map must come back and the data must be readable.
        let mut cache = CacheFile::open(dir.path(), hash, &raw, NUM_PIECES, PIECE_LEN)
            .await
            .unwrap();
        assert_eq!(cache.slot_of(3), Some(0));
        assert_eq!(cache.next_disk_block, 1);
        let mut file = cache.file.take().unwrap();
        let mut buf = vec![0u8; PIECE_LEN as usize];
        read_slot(&mut file, cache.data_offset(0), &mut buf)
            .await
            .unwrap();
        assert!(buf.iter().all(|b| *b == 0x5a));

        // The stored metainfo round-trips for magnet reopen.
        let loaded = load_metainfo_from_cache(dir.path(), hash).await.unwrap();
        assert_eq!(loaded, raw);
    }

    #[tokio::test]
    async fn test_foreign_header_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, hash) = metainfo_bytes();
        let path = dir.path().join(format!("{}.tc", hash.to_hex()));
        fs::write(&path, b"not a cache file at all").await.unwrap();

        let cache = CacheFile::open(dir.path(), hash, &raw, NUM_PIECES, PIECE_LEN)
            .await
            .unwrap();
        assert_eq!(cache.next_disk_block, 0);
        assert!((0..NUM_PIECES).all(|p| cache.slot_of(p).is_none()));

        let loaded = load_metainfo_from_cache(dir.path(), hash).await;
        assert_eq!(loaded, Some(raw));
    }

    #[tokio::test]
    async fn test_reclaimed_slot_clears_old_piece_first() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, hash) = metainfo_bytes();
        let mut cache = CacheFile::open(dir.path(), hash, &raw, NUM_PIECES, PIECE_LEN)
            .await
            .unwrap();

        let plan_a = cache.allocate_slot(1);
        assert_eq!(plan_a.slot, 0);
        // Window wraps back to slot 0
        cache.next_disk_block = 0;
        let plan_b = cache.allocate_slot(5);
        assert_eq!(plan_b.slot, 0);
        assert_eq!(
            plan_b.old_map_entry_offset,
            Some(plan_a.map_entry_offset)
        );
        assert!(cache.slot_of(1).is_none());
        assert_eq!(cache.slot_of(5), Some(0));
    }

    #[test]
    fn test_shrink_window_drops_upper_half() {
        let mut cache = CacheFile {
            path: PathBuf::new(),
            file: None,
            map: vec![ABSENT; 8],
            inv: vec![ABSENT; 8],
            map_offset: 100,
            store_offset: 132,
            next_disk_block: 4,
            total_disk_blocks: 4,
            piece_length: PIECE_LEN,
        };
        for piece in 0..4u32 {
            cache.map[piece as usize] = piece;
            cache.inv[piece as usize] = piece;
        }
        cache.shrink_window();
        assert_eq!(cache.next_disk_block, 2);
        assert_eq!(cache.slot_of(0), Some(0));
        assert_eq!(cache.slot_of(1), Some(1));
        assert!(cache.slot_of(2).is_none());
        assert!(cache.slot_of(3).is_none());
    }

    proptest! {
        /// After any allocation sequence, map and inverse stay a partial
        /// bijection: slot occupied ⇒ inv[slot]=p and map[p]=slot.
        #[test]
        fn prop_slot_map_bijection(pieces in proptest::collection::vec(0u32..NUM_PIECES, 1..64)) {
            let mut cache = CacheFile {
                path: PathBuf::new(),
                file: None,
                map: vec![ABSENT; NUM_PIECES as usize],
                inv: vec![ABSENT; NUM_PIECES as usize],
                map_offset: 0,
                store_offset: 4 * NUM_PIECES as u64,
                next_disk_block: 0,
                total_disk_blocks: 0,
                piece_length: PIECE_LEN,
            };
            for piece in pieces {
                if cache.next_disk_block >= NUM_PIECES {
                    cache.next_disk_block = 0;
                }
                cache.allocate_slot(piece);
                for (p, slot) in cache.map.iter().enumerate() {
                    if *slot != ABSENT {
                        prop_assert_eq!(cache.inv[*slot as usize], p as u32);
                    }
                }
                for (slot, p) in cache.inv.iter().enumerate() {
                    if *p != ABSENT {
                        prop_assert_eq!(cache.map[*p as usize], slot as u32);
                    }
                }
            }
        }
    }
}
