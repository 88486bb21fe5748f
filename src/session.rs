//! The engine session: torrent registry, shared workers, public open API.
//!
//! One `Session` owns the mutable core (every torrent, peer, piece and
//! tracker) behind a single mutex that is never held across I/O or an
//! await point. Long-lived tasks spawned at construction: the shared UDP
//! tracker socket, the disk worker, the egress refill timer, and the
//! per-second tick that drives scheduling, choke review, HAVE fanout and
//! tracker announces. Torrent identity is the info-hash; handles retain
//! the torrent and the last release tears it down.

use crate::config::Config;
use crate::diskio;
use crate::error::{BtError, BtResult};
use crate::hasher;
use crate::metainfo::{InfoHash, MagnetLink, Metainfo};
use crate::peer::{self, PeerState};
use crate::rate;
use crate::sched;
use crate::torrent::Torrent;
use crate::tracker::{self, Tracker};
use rand::RngCore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime-adjustable limits, kept under the core lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_peers_global: usize,
    pub max_peers_torrent: usize,
    pub max_send_speed: u64,
    pub free_space_percentage: u8,
    pub listen_port: u16,
}

#[derive(Debug, Default)]
pub(crate) struct DiskBudget {
    pub avail: u64,
    pub active: u64,
    pub inactive: u64,
    pub limit: u64,
}

/// Everything the global lock protects.
pub(crate) struct Core {
    pub torrents: HashMap<InfoHash, Torrent>,
    pub trackers: Vec<Tracker>,
    pub active_peers: usize,
    pub limits: Limits,
    pub next_handle: u64,
    pub next_txid: u32,
    pub announce_key: u32,
    pub hash_running: bool,
    pub disk: DiskBudget,
}

pub struct Session {
    pub(crate) core: Mutex<Core>,
    pub(crate) peer_id: [u8; 20],
    pub(crate) http: reqwest::Client,
    pub(crate) udp: UdpSocket,
    pub(crate) io_notify: Notify,
    pub(crate) hash_notify: Notify,
    pub(crate) shutdown: CancellationToken,
    pub(crate) cache_dir: PathBuf,
    pub(crate) metadata_timeout: Duration,
    self_ref: std::sync::Weak<Session>,
}

/// A retained reference to one torrent in the session. Cloning retains;
/// dropping the last handle (and closing every file handle) destroys the
/// torrent, disconnecting its peers and announcing the stop.
pub struct TorrentHandle {
    pub(crate) session: Arc<Session>,
    pub(crate) hash: InfoHash,
}

/// Point-in-time counters for UI or logging.
#[derive(Debug, Clone)]
pub struct TorrentStats {
    pub info_hash: InfoHash,
    pub title: String,
    pub total_length: Option<u64>,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub wasted_bytes: u64,
    pub download_rate: u64,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub seeders: u32,
    pub leechers: u32,
    pub num_pieces: u32,
    pub pieces_on_disk: u32,
}

impl Session {
    /// Build a session and start its background workers.
    pub async fn start(config: Config) -> BtResult<Arc<Session>> {
        if let Err(issues) = config.validate() {
            let joined = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BtError::Config(joined));
        }

        let udp = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| BtError::Io(e.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BtError::Io(e.to_string()))?;

        let limits = Limits {
            max_peers_global: config.network.max_peers_global,
            max_peers_torrent: config.network.max_peers_torrent,
            max_send_speed: config.rate.max_send_speed,
            free_space_percentage: config.cache.free_space_percentage,
            listen_port: config.network.listen_port,
        };

        let session = Arc::new_cyclic(|weak| Session {
            core: Mutex::new(Core {
                torrents: HashMap::new(),
                trackers: Vec::new(),
                active_peers: 0,
                limits,
                next_handle: 0,
                next_txid: rand::random(),
                announce_key: rand::random(),
                hash_running: false,
                disk: DiskBudget::default(),
            }),
            peer_id: generate_peer_id(),
            http,
            udp,
            io_notify: Notify::new(),
            hash_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            cache_dir: config.cache.directory.clone(),
            metadata_timeout: Duration::from_secs(config.network.metadata_timeout),
            self_ref: weak.clone(),
        });

        info!(
            peer_id = %String::from_utf8_lossy(&session.peer_id),
            cache_dir = %session.cache_dir.display(),
            "session started"
        );

        tokio::spawn(tracker::udp::run(Arc::clone(&session)));
        tokio::spawn(diskio::run(Arc::clone(&session)));
        tokio::spawn(rate::run(Arc::clone(&session)));
        tokio::spawn(tick_loop(Arc::clone(&session)));

        Ok(session)
    }

    pub(crate) fn arc(&self) -> Arc<Session> {
        self.self_ref.upgrade().expect("session alive")
    }

    /// Stop every worker. Peer tasks die when their cancellation tokens
    /// fire during teardown of their torrents.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Open (or join) a torrent from a `magnet:` link.
    pub async fn open_magnet(&self, url: &str) -> BtResult<TorrentHandle> {
        let link = MagnetLink::parse(url)?;
        debug!(hash = %link.info_hash, name = ?link.name, "opening magnet");
        self.open_hash(link.info_hash, link.name, link.trackers).await
    }

    /// Open (or join) a torrent from raw `.torrent` metainfo bytes.
    pub async fn open_metainfo(&self, data: &[u8]) -> BtResult<TorrentHandle> {
        let mi = Metainfo::parse(data)?;
        let hash = mi.info_hash;
        let trackers = mi.trackers.clone();
        let session = self.arc();
        {
            let mut core = session.core.lock().unwrap();
            let exists = core.torrents.contains_key(&hash);
            if !exists {
                let mut to = Torrent::new(hash);
                to.refcount = 1;
                core.torrents.insert(hash, to);
                let to = core.torrents.get_mut(&hash).unwrap();
                let bad = to.adopt_metainfo(mi);
                debug_assert!(bad.is_empty());
            } else {
                let to = core.torrents.get_mut(&hash).unwrap();
                to.refcount += 1;
                if to.metainfo.is_none() {
                    let bad = to.adopt_metainfo(mi);
                    for addr in bad {
                        peer::peer_shutdown(
                            &session,
                            &mut core,
                            hash,
                            addr,
                            PeerState::Destroyed,
                            false,
                        );
                    }
                }
            }
            for url in &trackers {
                tracker::add_tracker(&session, &mut core, hash, url);
            }
        }
        self.io_notify.notify_one();
        Ok(TorrentHandle {
            session,
            hash,
        })
    }

    /// Open (or join) a torrent by bare info-hash.
    pub async fn open_hash(
        &self,
        hash: InfoHash,
        title: Option<String>,
        trackers: Vec<String>,
    ) -> BtResult<TorrentHandle> {
        let session = self.arc();
        let need_metainfo = {
            let mut core = session.core.lock().unwrap();
            let need = match core.torrents.get_mut(&hash) {
                Some(to) => {
                    to.refcount += 1;
                    to.metainfo.is_none()
                }
                None => {
                    let mut to = Torrent::new(hash);
                    to.refcount = 1;
                    if let Some(title) = title {
                        to.title = title;
                    }
                    core.torrents.insert(hash, to);
                    true
                }
            };
            for url in &trackers {
                tracker::add_tracker(&session, &mut core, hash, url);
            }
            need
        };

        if need_metainfo {
            // A previous run may have left the metainfo in the cache
            // header; that saves the whole network metadata exchange.
            if let Some(raw) = diskio::load_metainfo_from_cache(&self.cache_dir, hash).await {
                match Metainfo::parse(&raw) {
                    Ok(mi) => {
                        debug!(torrent = %hash, "metainfo restored from cache");
                        let mut core = session.core.lock().unwrap();
                        let more = mi.trackers.clone();
                        if let Some(to) = core.torrents.get_mut(&hash) {
                            if to.metainfo.is_none() {
                                let bad = to.adopt_metainfo(mi);
                                for addr in bad {
                                    peer::peer_shutdown(
                                        &session,
                                        &mut core,
                                        hash,
                                        addr,
                                        PeerState::Destroyed,
                                        false,
                                    );
                                }
                            }
                        }
                        for url in &more {
                            tracker::add_tracker(&session, &mut core, hash, url);
                        }
                        self.io_notify.notify_one();
                    }
                    Err(err) => warn!(torrent = %hash, error = %err, "stale cache metainfo"),
                }
            }
        }

        Ok(TorrentHandle { session, hash })
    }

    /// Adjust the peer caps at runtime.
    pub fn set_peer_limits(&self, global: usize, per_torrent: usize) {
        let mut core = self.core.lock().unwrap();
        core.limits.max_peers_global = global;
        core.limits.max_peers_torrent = per_torrent;
    }

    /// Adjust the upload ceiling at runtime.
    pub fn set_max_send_speed(&self, bytes_per_sec: u64) {
        let mut core = self.core.lock().unwrap();
        core.limits.max_send_speed = bytes_per_sec;
    }

    /// Adjust the share of disk space the cache may occupy at runtime.
    pub fn set_free_space_percentage(&self, percentage: u8) {
        let mut core = self.core.lock().unwrap();
        core.limits.free_space_percentage = percentage.clamp(1, 100);
    }
}

impl TorrentHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.hash
    }

    /// Block until the torrent's metainfo is known (fetched from peers or
    /// restored from cache), up to the configured timeout.
    pub async fn wait_metainfo(&self) -> BtResult<()> {
        let deadline = Instant::now() + self.session.metadata_timeout;
        loop {
            let ready = {
                let core = self.session.core.lock().unwrap();
                let to = core
                    .torrents
                    .get(&self.hash)
                    .ok_or(BtError::Shutdown)?;
                if to.metainfo.is_some() {
                    return Ok(());
                }
                to.metainfo_ready.clone()
            };
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(BtError::MetadataTimeout)?;
            // Short poll fallback covers a notify racing the re-check
            let _ = timeout(remaining.min(Duration::from_millis(250)), ready.notified()).await;
            if Instant::now() >= deadline {
                return Err(BtError::MetadataTimeout);
            }
        }
    }

    pub fn stats(&self) -> BtResult<TorrentStats> {
        let core = self.session.core.lock().unwrap();
        let to = core.torrents.get(&self.hash).ok_or(BtError::Shutdown)?;
        Ok(TorrentStats {
            info_hash: to.info_hash,
            title: to.title.clone(),
            total_length: to.metainfo.as_ref().map(|mi| mi.total_length),
            downloaded_bytes: to.downloaded_bytes,
            uploaded_bytes: to.uploaded_bytes,
            wasted_bytes: to.wasted_bytes,
            download_rate: to.download_rate.read(),
            known_peers: to.peers.len(),
            connected_peers: to
                .peers
                .values()
                .filter(|p| p.state == PeerState::Running)
                .count(),
            seeders: to.seeders,
            leechers: to.leechers,
            num_pieces: to.num_pieces(),
            pieces_on_disk: to
                .cache
                .as_ref()
                .map(|c| (0..to.num_pieces()).filter(|p| c.slot_of(*p).is_some()).count() as u32)
                .unwrap_or(0),
        })
    }
}

impl Clone for TorrentHandle {
    fn clone(&self) -> Self {
        let mut core = self.session.core.lock().unwrap();
        if let Some(to) = core.torrents.get_mut(&self.hash) {
            to.refcount += 1;
        }
        TorrentHandle {
            session: Arc::clone(&self.session),
            hash: self.hash,
        }
    }
}

impl Drop for TorrentHandle {
    fn drop(&mut self) {
        let session = Arc::clone(&self.session);
        let mut core = session.core.lock().unwrap();
        release_torrent(&session, &mut core, self.hash);
    }
}

/// Drop one reference; the last one destroys the torrent: all peers are
/// shut down, trackers get the stop announce, and the cache file closes.
pub(crate) fn release_torrent(session: &Arc<Session>, core: &mut Core, hash: InfoHash) {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    to.refcount = to.refcount.saturating_sub(1);
    if to.refcount > 0 || !to.handles.is_empty() {
        return;
    }
    info!(torrent = %hash, "destroying torrent");
    let addrs: Vec<_> = to.peers.keys().copied().collect();
    for addr in addrs {
        peer::peer_shutdown(session, core, hash, addr, PeerState::Destroyed, false);
    }
    tracker::remove_torrent(session, core, hash);
    core.torrents.remove(&hash);
}

/// 20 bytes over `[0-9a-zA-Z_.]`, drawn from the OS entropy source once
/// per process.
fn generate_peer_id() -> [u8; 20] {
    const ALPHABET: &[u8; 64] =
        b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_.";
    let mut seed = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let mut id = [0u8; 20];
    for (out, s) in id.iter_mut().zip(seed) {
        *out = ALPHABET[(s & 0x3f) as usize];
    }
    id
}

/// The per-second maintenance tick: scheduling, metadata requests, HAVE
/// fanout, admission, tracker timers.
async fn tick_loop(session: Arc<Session>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = session.shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        let now = Instant::now();
        let mut core = session.core.lock().unwrap();
        tracker::tick(&session, &mut core, now);

        let hashes: Vec<InfoHash> = core.torrents.keys().copied().collect();
        for hash in hashes {
            if let Some(to) = core.torrents.get_mut(&hash) {
                if to.new_valid_piece {
                    to.new_valid_piece = false;
                    to.send_haves();
                }
                peer::request_metadata_pieces(to);
                sched::do_requests(to, now);
                if to.pieces.values().any(|p| p.complete && !p.hash_computed) {
                    hasher::wake(&session, &mut core);
                }
            }
            peer::attempt_more_peers(&session, &mut core, hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.cache.directory = std::env::temp_dir().join("btstream-session-test");
        config
    }

    #[test]
    fn test_peer_id_alphabet_and_length() {
        let id = generate_peer_id();
        assert_eq!(id.len(), 20);
        assert!(id
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.'));
        // Two draws should essentially never collide
        assert_ne!(generate_peer_id(), id);
    }

    #[tokio::test]
    async fn test_open_metainfo_registers_torrent() {
        use crate::bencode::{dict, Value};
        let session = Session::start(test_config()).await.unwrap();

        let info = dict(vec![
            ("length", Value::Int(65536)),
            ("name", Value::Bytes(b"one".to_vec())),
            ("piece length", Value::Int(65536)),
            ("pieces", Value::Bytes(vec![0u8; 20])),
        ]);
        let raw = dict(vec![("info", info)]).encode();

        let handle = session.open_metainfo(&raw).await.unwrap();
        let stats = handle.stats().unwrap();
        assert_eq!(stats.title, "one");
        assert_eq!(stats.total_length, Some(65536));
        assert_eq!(stats.num_pieces, 1);

        // A second open joins the same torrent
        let again = session.open_metainfo(&raw).await.unwrap();
        assert_eq!(again.info_hash(), handle.info_hash());
        {
            let core = session.core.lock().unwrap();
            assert_eq!(core.torrents.len(), 1);
            assert_eq!(core.torrents[&handle.info_hash()].refcount, 2);
        }

        drop(again);
        drop(handle);
        let core = session.core.lock().unwrap();
        assert!(core.torrents.is_empty());
        session.shutdown();
    }

    #[tokio::test]
    async fn test_open_magnet_waits_for_metadata_and_times_out() {
        let mut config = test_config();
        config.network.metadata_timeout = 1;
        let session = Session::start(config).await.unwrap();

        let handle = session
            .open_magnet(
                "magnet:?xt=urn:btih:0000000000000000000000000000000000000001",
            )
            .await
            .unwrap();
        let err = handle.wait_metainfo().await.unwrap_err();
        assert!(matches!(err, BtError::MetadataTimeout));
        session.shutdown();
    }
}
