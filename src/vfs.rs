//! Byte-addressable access to files inside a torrent.
//!
//! `torrentfile://<hex infohash>/<path>` names a file in a torrent's
//! tree; a [`FileHandle`] reads it at arbitrary offsets while the content
//! is still downloading. A read blocks until the piece covering the
//! requested range is verified, feeding the piece scheduler a deadline
//! via [`FileHandle::set_read_deadline`]. Cancellation is cooperative and
//! immediate: a cancelled read unblocks, detaches from its pieces and
//! returns an error.

use crate::error::{BtError, BtResult};
use crate::hasher;
use crate::metainfo::InfoHash;
use crate::sched;
use crate::session::{Session, TorrentHandle};
use crate::torrent::HandleState;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Poll fallback for the verified-piece wait; covers a notification
/// racing the unlocked window.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    /// Path from the torrent root.
    pub path: String,
    /// Full `torrentfile://` URL.
    pub url: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// What a URL opened into.
pub enum Opened {
    /// A torrent to browse, optionally positioned at a directory path.
    Browse(TorrentHandle, Option<String>),
    /// A concrete file (from `torrentfile://` or `torrent:video:`).
    File(TorrentHandle, String),
}

/// Fires the cooperative cancellation of one file handle.
#[derive(Clone)]
pub struct CancelToken {
    session: Arc<Session>,
    hash: InfoHash,
    handle_id: u64,
}

impl CancelToken {
    pub fn cancel(&self) {
        let mut core = self.session.core.lock().unwrap();
        let Some(to) = core.torrents.get_mut(&self.hash) else {
            return;
        };
        if let Some(handle) = to.handles.get_mut(&self.handle_id) {
            handle.cancelled = true;
            handle.wake.notify_waiters();
            debug!(handle = self.handle_id, "read cancelled");
        }
    }
}

/// An open file inside a torrent. Reads are sequential from an internal
/// position; `seek` is purely positional.
pub struct FileHandle {
    torrent: TorrentHandle,
    handle_id: u64,
    path: String,
    file_offset: u64,
    file_size: u64,
    pos: u64,
    wake: Arc<Notify>,
}

impl Session {
    /// Route any of the accepted URL schemes.
    pub async fn open_url(&self, url: &str) -> BtResult<Opened> {
        if url.starts_with("magnet:") {
            return Ok(Opened::Browse(self.open_magnet(url).await?, None));
        }
        if let Some(rest) = url.strip_prefix("torrentfile://") {
            let (hash, path) = split_hash_path(rest)?;
            let path = path.ok_or_else(|| BtError::FileNotFound(url.to_string()))?;
            let handle = self.open_hash(hash, None, Vec::new()).await?;
            return Ok(Opened::File(handle, path));
        }
        if let Some(rest) = url.strip_prefix("torrent:browse:") {
            let (hash, path) = split_hash_path(rest)?;
            let handle = self.open_hash(hash, None, Vec::new()).await?;
            return Ok(Opened::Browse(handle, path));
        }
        if let Some(rest) = url.strip_prefix("torrent:video:") {
            let (hash, _) = split_hash_path(rest)?;
            let handle = self.open_hash(hash, None, Vec::new()).await?;
            handle.wait_metainfo().await?;
            let path = handle.largest_file_path()?;
            return Ok(Opened::File(handle, path));
        }
        Err(BtError::InvalidUrl(url.to_string()))
    }
}

fn split_hash_path(rest: &str) -> BtResult<(InfoHash, Option<String>)> {
    let (hash, path) = match rest.split_once('/') {
        Some((hash, path)) => (hash, (!path.is_empty()).then(|| path.to_string())),
        None => (rest, None),
    };
    Ok((InfoHash::from_hex(hash)?, path))
}

impl TorrentHandle {
    /// List the torrent root (path = None) or a directory inside it.
    pub fn list_dir(&self, path: Option<&str>) -> BtResult<Vec<DirEntry>> {
        let core = self.session.core.lock().unwrap();
        let to = core.torrents.get(&self.hash).ok_or(BtError::Shutdown)?;
        let mi = to
            .metainfo
            .as_ref()
            .ok_or(BtError::MetadataTimeout)?;

        let children: &[usize] = match path {
            None => &mi.root,
            Some(path) => {
                let node = mi
                    .find(path)
                    .ok_or_else(|| BtError::FileNotFound(path.to_string()))?;
                if !node.is_dir() {
                    return Err(BtError::NotDirectory(path.to_string()));
                }
                &node.children
            }
        };

        let hex = self.hash.to_hex();
        Ok(children
            .iter()
            .map(|&idx| {
                let node = &mi.files[idx];
                DirEntry {
                    name: node.name.clone(),
                    path: node.full_path.clone(),
                    url: format!("torrentfile://{hex}/{}", node.full_path),
                    size: node.size,
                    is_dir: node.is_dir(),
                }
            })
            .collect())
    }

    /// Size and kind of a path; path = None is the torrent root.
    pub fn stat(&self, path: Option<&str>) -> BtResult<FileStat> {
        let core = self.session.core.lock().unwrap();
        let to = core.torrents.get(&self.hash).ok_or(BtError::Shutdown)?;
        let mi = to
            .metainfo
            .as_ref()
            .ok_or(BtError::MetadataTimeout)?;
        match path {
            None => Ok(FileStat {
                size: 0,
                is_dir: true,
            }),
            Some(path) => {
                let node = mi
                    .find(path)
                    .ok_or_else(|| BtError::FileNotFound(path.to_string()))?;
                Ok(FileStat {
                    size: node.size,
                    is_dir: node.is_dir(),
                })
            }
        }
    }

    /// Path of the largest file, for "play the video in this torrent".
    pub fn largest_file_path(&self) -> BtResult<String> {
        let core = self.session.core.lock().unwrap();
        let to = core.torrents.get(&self.hash).ok_or(BtError::Shutdown)?;
        let mi = to
            .metainfo
            .as_ref()
            .ok_or(BtError::MetadataTimeout)?;
        mi.largest_file()
            .map(|f| f.full_path.clone())
            .ok_or_else(|| BtError::FileNotFound("<empty torrent>".into()))
    }

    /// Open a file for random-offset reads. Waits for metainfo first.
    pub async fn open_file(&self, path: &str) -> BtResult<FileHandle> {
        self.wait_metainfo().await?;

        let mut core = self.session.core.lock().unwrap();
        let handle_id = {
            let next = &mut core.next_handle;
            *next += 1;
            *next
        };
        let to = core.torrents.get_mut(&self.hash).ok_or(BtError::Shutdown)?;
        let mi = to.metainfo.as_ref().ok_or(BtError::MetadataTimeout)?;
        let node = mi
            .find(path)
            .ok_or_else(|| BtError::FileNotFound(path.to_string()))?;
        if node.is_dir() {
            return Err(BtError::NotDirectory(path.to_string()));
        }
        let (file_offset, file_size) = (node.offset, node.size);

        let wake = Arc::new(Notify::new());
        to.handles.insert(
            handle_id,
            HandleState {
                deadline: None,
                cancelled: false,
                wake: wake.clone(),
            },
        );
        // Retain under the lock we already hold; TorrentHandle::clone
        // would try to take it again.
        to.refcount += 1;
        debug!(torrent = %self.hash, path, handle = handle_id, "file opened");

        Ok(FileHandle {
            torrent: TorrentHandle {
                session: Arc::clone(&self.session),
                hash: self.hash,
            },
            handle_id,
            path: path.to_string(),
            file_offset,
            file_size,
            pos: 0,
            wake,
        })
    }
}

impl FileHandle {
    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            session: Arc::clone(&self.torrent.session),
            hash: self.torrent.hash,
            handle_id: self.handle_id,
        }
    }

    /// Positional seek; never touches the network.
    pub fn seek(&mut self, from: SeekFrom) -> BtResult<u64> {
        let next = match from {
            SeekFrom::Start(pos) => pos as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.file_size as i64 + delta,
        };
        if next < 0 {
            return Err(BtError::InvalidUrl(format!("seek to {next}")));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }

    /// Declare that upcoming reads must complete within `within`; feeds
    /// the deadline used for duplicate-request racing.
    pub fn set_read_deadline(&self, within: Duration) {
        let mut core = self.torrent.session.core.lock().unwrap();
        let Some(to) = core.torrents.get_mut(&self.torrent.hash) else {
            return;
        };
        if let Some(handle) = to.handles.get_mut(&self.handle_id) {
            handle.deadline = Some(Instant::now() + within);
        }
        let bound: Vec<u32> = to
            .pieces
            .values()
            .filter(|p| p.active_handles.contains(&self.handle_id))
            .map(|p| p.index)
            .collect();
        for index in bound {
            to.update_piece_deadline(index);
        }
    }

    /// Read up to `buf.len()` bytes at the current position, blocking
    /// until each covering piece verifies. Returns the bytes copied; 0 at
    /// end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> BtResult<usize> {
        if self.pos >= self.file_size {
            return Ok(0);
        }
        let want = buf.len().min((self.file_size - self.pos) as usize);
        let mut done = 0usize;

        while done < want {
            let copied = self.read_some(&mut buf[done..want]).await?;
            done += copied;
        }
        Ok(done)
    }

    /// Copy out of the single piece covering the current position,
    /// waiting for it to verify first.
    async fn read_some(&mut self, buf: &mut [u8]) -> BtResult<usize> {
        let session = Arc::clone(&self.torrent.session);
        let hash = self.torrent.hash;

        loop {
            let waiters = {
                let mut core = session.core.lock().unwrap();
                let to = core.torrents.get_mut(&hash).ok_or(BtError::Shutdown)?;
                let handle = to
                    .handles
                    .get(&self.handle_id)
                    .ok_or(BtError::Cancelled)?;
                if handle.cancelled {
                    detach(to, self.handle_id);
                    return Err(BtError::Cancelled);
                }

                let mi = to.metainfo.as_ref().ok_or(BtError::MetadataTimeout)?;
                let piece_length = mi.piece_length as u64;
                let num_pieces = mi.num_pieces();
                let abs = self.file_offset + self.pos;
                let index = (abs / piece_length) as u32;
                let in_piece = (abs % piece_length) as usize;

                // Speculative read-ahead of the two following pieces
                for ahead in [index + 1, index + 2] {
                    if ahead < num_pieces {
                        to.piece_entry(ahead);
                    }
                }

                to.piece_entry(index).active_handles.insert(self.handle_id);
                to.update_piece_deadline(index);

                let cached = to
                    .cache
                    .as_ref()
                    .map_or(false, |c| c.slot_of(index).is_some());
                let piece = to.pieces.get_mut(&index).unwrap();

                if piece.hash_ok && !piece.io_busy {
                    let n = buf
                        .len()
                        .min(piece.length as usize - in_piece);
                    buf[..n].copy_from_slice(&piece.data[in_piece..in_piece + n]);
                    piece.active_handles.remove(&self.handle_id);
                    to.update_piece_deadline(index);
                    self.pos += n as u64;
                    trace!(piece = index, offset = in_piece, n, "read satisfied");
                    return Ok(n);
                }

                // Arrange for the piece to arrive: disk load when cached,
                // otherwise the network path.
                if !piece.complete {
                    if cached && !piece.load_req && !piece.io_busy && !piece.load_fail {
                        piece.load_req = true;
                        session.io_notify.notify_one();
                    } else {
                        sched::do_requests(to, Instant::now());
                    }
                } else if !piece.hash_computed {
                    hasher::wake(&session, &mut core);
                }

                let to = core.torrents.get_mut(&hash).ok_or(BtError::Shutdown)?;
                let piece = to.pieces.get_mut(&index).unwrap();
                (piece.verified.clone(), self.wake.clone())
            };

            let (verified, wake) = waiters;
            tokio::select! {
                _ = verified.notified() => {}
                _ = wake.notified() => {}
                _ = tokio::time::sleep(WAIT_SLICE) => {}
            }
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let session = Arc::clone(&self.torrent.session);
        let mut core = session.core.lock().unwrap();
        if let Some(to) = core.torrents.get_mut(&self.torrent.hash) {
            to.handles.remove(&self.handle_id);
            detach(to, self.handle_id);
        }
        // The embedded TorrentHandle drops after this and releases the
        // torrent reference itself.
    }
}

/// Unbind a handle from every piece it was holding and relax deadlines.
fn detach(to: &mut crate::torrent::Torrent, handle_id: u64) {
    let bound: Vec<u32> = to
        .pieces
        .values()
        .filter(|p| p.active_handles.contains(&handle_id))
        .map(|p| p.index)
        .collect();
    for index in bound {
        to.pieces
            .get_mut(&index)
            .unwrap()
            .active_handles
            .remove(&handle_id);
        to.update_piece_deadline(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{dict, Value};
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.cache.directory = std::env::temp_dir().join("btstream-vfs-test");
        config.network.metadata_timeout = 2;
        config
    }

    fn three_file_metainfo() -> Vec<u8> {
        let piece_len: i64 = 65536;
        let files = vec![("a.bin", 65536i64), ("dir/b.bin", 65536), ("dir/c.bin", 65536)];
        let file_list: Vec<Value> = files
            .iter()
            .map(|(path, size)| {
                dict(vec![
                    ("length", Value::Int(*size)),
                    (
                        "path",
                        Value::List(
                            path.split('/')
                                .map(|c| Value::Bytes(c.as_bytes().to_vec()))
                                .collect(),
                        ),
                    ),
                ])
            })
            .collect();
        let info = dict(vec![
            ("files", Value::List(file_list)),
            ("name", Value::Bytes(b"threefiles".to_vec())),
            ("piece length", Value::Int(piece_len)),
            ("pieces", Value::Bytes(vec![0u8; 3 * 20])),
        ]);
        dict(vec![("info", info)]).encode()
    }

    #[tokio::test]
    async fn test_listing_and_stat() {
        let session = Session::start(test_config()).await.unwrap();
        let handle = session
            .open_metainfo(&three_file_metainfo())
            .await
            .unwrap();

        let root = handle.list_dir(None).unwrap();
        assert_eq!(root.len(), 2); // a.bin + dir
        let dir = root.iter().find(|e| e.is_dir).unwrap();
        assert_eq!(dir.name, "dir");
        assert!(dir.url.ends_with("/dir"));

        let sub = handle.list_dir(Some("dir")).unwrap();
        assert_eq!(sub.len(), 2);
        assert!(sub.iter().all(|e| !e.is_dir));

        assert!(handle.stat(None).unwrap().is_dir);
        let st = handle.stat(Some("dir/b.bin")).unwrap();
        assert_eq!(st.size, 65536);
        assert!(!st.is_dir);

        assert!(matches!(
            handle.list_dir(Some("a.bin")),
            Err(BtError::NotDirectory(_))
        ));
        assert!(matches!(
            handle.stat(Some("nope")),
            Err(BtError::FileNotFound(_))
        ));
        session.shutdown();
    }

    #[tokio::test]
    async fn test_read_from_verified_pieces() {
        let session = Session::start(test_config()).await.unwrap();
        let handle = session
            .open_metainfo(&three_file_metainfo())
            .await
            .unwrap();

        // Hand-verify all three pieces with a recognizable pattern
        {
            let mut core = session.core.lock().unwrap();
            let to = core.torrents.get_mut(&handle.info_hash()).unwrap();
            for index in 0..3u32 {
                let piece = to.piece_entry(index);
                piece.waiting.clear();
                piece.data.fill(index as u8 + 1);
                piece.complete = true;
                piece.hash_computed = true;
                piece.hash_ok = true;
            }
        }

        let mut file = handle.open_file("dir/b.bin").await.unwrap();
        assert_eq!(file.size(), 65536);

        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(n, 16);
        // dir/b.bin occupies the second piece
        assert!(buf.iter().all(|b| *b == 2));

        // Cross-boundary read: end of b.bin (EOF clamps to the file)
        file.seek(SeekFrom::End(-8)).unwrap();
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);

        // Past EOF
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        session.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_read_returns_immediately() {
        let session = Session::start(test_config()).await.unwrap();
        let handle = session
            .open_metainfo(&three_file_metainfo())
            .await
            .unwrap();

        let mut file = handle.open_file("a.bin").await.unwrap();
        let token = file.cancel_token();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            file.read(&mut buf).await
        });
        // Give the read a moment to block on the unverified piece
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read must unblock")
            .unwrap();
        assert!(matches!(result, Err(BtError::Cancelled)));
        session.shutdown();
    }

    #[tokio::test]
    async fn test_open_url_routing() {
        let session = Session::start(test_config()).await.unwrap();
        let handle = session
            .open_metainfo(&three_file_metainfo())
            .await
            .unwrap();
        let hex = handle.info_hash().to_hex();

        match session
            .open_url(&format!("torrentfile://{hex}/dir/b.bin"))
            .await
            .unwrap()
        {
            Opened::File(h, path) => {
                assert_eq!(h.info_hash(), handle.info_hash());
                assert_eq!(path, "dir/b.bin");
            }
            _ => panic!("expected file"),
        }

        match session
            .open_url(&format!("torrent:video:{hex}"))
            .await
            .unwrap()
        {
            // All files are equal-sized; any of them is acceptable
            Opened::File(_, path) => assert!(path.ends_with(".bin")),
            _ => panic!("expected file"),
        }

        assert!(session.open_url("gopher://x").await.is_err());
        session.shutdown();
    }
}
