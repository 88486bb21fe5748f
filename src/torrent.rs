//! The torrent object: file tree, active pieces, peers by state, block
//! receive path, interest and choke maintenance, metadata exchange state.
//!
//! All mutation happens under the session's core lock. Pieces and peers
//! live in separate maps so the message handlers can borrow one of each
//! without fighting the borrow checker.

use crate::diskio::CacheFile;
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::{Peer, PeerState};
use crate::piece::Piece;
use crate::wire::{self, Message};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// At most this many pieces are kept resident per torrent.
pub(crate) const MAX_ACTIVE_PIECES: usize = 20;

/// Choke decisions are reviewed at this cadence.
pub(crate) const CHOKE_REVIEW_INTERVAL: Duration = Duration::from_secs(5);

/// Metadata exchange transfers the info dict in pieces of this size.
pub(crate) const METADATA_PIECE_SIZE: usize = 16_384;

/// Rolling byte-rate estimator over a few one-second buckets.
#[derive(Debug, Default)]
pub(crate) struct RateEstimator {
    samples: VecDeque<(u64, u64)>, // (second, cumulative total)
}

impl RateEstimator {
    pub fn fill(&mut self, second: u64, total: u64) {
        match self.samples.back_mut() {
            Some(last) if last.0 == second => last.1 = total,
            _ => self.samples.push_back((second, total)),
        }
        while self.samples.len() > 8 {
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the sampled window.
    pub fn read(&self) -> u64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) if l.0 > f.0 => (f, l),
            _ => return 0,
        };
        (last.1 - first.1) / (last.0 - first.0)
    }
}

/// Per-open-handle state: the deadline feeding piece scheduling and the
/// cancellation flag checked by the blocking read loop.
#[derive(Debug)]
pub(crate) struct HandleState {
    pub deadline: Option<Instant>,
    pub cancelled: bool,
    /// Woken on cancellation so a blocked read returns promptly.
    pub wake: Arc<Notify>,
}

/// In-progress metadata (info dict) fetch over the extension protocol.
#[derive(Debug)]
pub(crate) struct MetadataFetch {
    pub total_size: usize,
    pub pieces: Vec<Option<Bytes>>,
    /// piece index -> peer currently asked
    pub inflight: HashMap<u32, SocketAddr>,
}

impl MetadataFetch {
    pub fn new(total_size: usize) -> Self {
        let num = (total_size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE;
        MetadataFetch {
            total_size,
            pieces: vec![None; num.max(1)],
            inflight: HashMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size);
        for piece in self.pieces.iter().flatten() {
            out.extend_from_slice(piece);
        }
        out
    }
}

pub(crate) struct Torrent {
    pub info_hash: InfoHash,
    pub title: String,
    pub metainfo: Option<Metainfo>,
    /// Set while the metainfo is still being fetched from peers.
    pub metadata: Option<MetadataFetch>,
    /// Wakes magnet openers blocked on metadata arrival.
    pub metainfo_ready: Arc<Notify>,

    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub wasted_bytes: u64,

    pub peers: HashMap<SocketAddr, Peer>,
    pub inactive_q: VecDeque<SocketAddr>,
    pub disconnected_q: VecDeque<SocketAddr>,
    pub connect_failed_q: VecDeque<SocketAddr>,
    /// Peers currently not choking us, in unchoke order.
    pub unchoked: Vec<SocketAddr>,
    pub active_peers: usize,

    pub pieces: BTreeMap<u32, Piece>,
    /// Piece indices sorted by deadline ascending (no-deadline last).
    pub serve_order: Vec<u32>,

    pub handles: HashMap<u64, HandleState>,
    /// Open handles + internal retains; the torrent is dropped at zero.
    pub refcount: usize,

    pub new_valid_piece: bool,
    pub last_choke_review: Instant,

    pub cache: Option<CacheFile>,
    /// Ask the disk worker to open (or re-open) the cache file.
    pub cache_open_req: bool,

    /// Egress token bucket, refilled by the rate task.
    pub out_tokens: u64,

    pub download_rate: RateEstimator,
    /// Aggregated from tracker announce replies.
    pub seeders: u32,
    pub leechers: u32,
}

impl Torrent {
    pub fn new(info_hash: InfoHash) -> Self {
        Torrent {
            info_hash,
            title: info_hash.to_hex(),
            metainfo: None,
            metadata: None,
            metainfo_ready: Arc::new(Notify::new()),
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            wasted_bytes: 0,
            peers: HashMap::new(),
            inactive_q: VecDeque::new(),
            disconnected_q: VecDeque::new(),
            connect_failed_q: VecDeque::new(),
            unchoked: Vec::new(),
            active_peers: 0,
            pieces: BTreeMap::new(),
            serve_order: Vec::new(),
            handles: HashMap::new(),
            refcount: 0,
            new_valid_piece: false,
            last_choke_review: Instant::now()
                .checked_sub(CHOKE_REVIEW_INTERVAL)
                .unwrap_or_else(Instant::now),
            cache: None,
            cache_open_req: false,
            out_tokens: 0,
            download_rate: RateEstimator::default(),
            seeders: 0,
            leechers: 0,
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.metainfo.as_ref().map(Metainfo::num_pieces).unwrap_or(0)
    }

    /// Get or create the in-memory piece for `index`. Newly created pieces
    /// start with every block on the waiting list and no deadline.
    pub fn piece_entry(&mut self, index: u32) -> &mut Piece {
        if !self.pieces.contains_key(&index) {
            let length = self
                .metainfo
                .as_ref()
                .expect("piece_entry requires metainfo")
                .piece_len(index);
            let mut piece = Piece::new(index, length);
            // A piece present in the cache map needs no network requests;
            // its blocks are satisfied by a disk load.
            if let Some(cache) = &self.cache {
                if cache.slot_of(index).is_some() {
                    piece.waiting.clear();
                }
            }
            self.pieces.insert(index, piece);
            self.serve_order.push(index);
            self.resort_serve_order();
            self.interest_dirty();
        }
        let piece = self.pieces.get_mut(&index).unwrap();
        piece.last_touch = Instant::now();
        piece
    }

    /// Recompute a piece's deadline from the handles bound to it and keep
    /// the serve order sorted.
    pub fn update_piece_deadline(&mut self, index: u32) {
        let Some(piece) = self.pieces.get(&index) else {
            return;
        };
        let deadline = piece
            .active_handles
            .iter()
            .filter_map(|id| self.handles.get(id).and_then(|h| h.deadline))
            .min();
        let piece = self.pieces.get_mut(&index).unwrap();
        if piece.deadline != deadline {
            piece.deadline = deadline;
            self.resort_serve_order();
        }
    }

    pub fn resort_serve_order(&mut self) {
        let pieces = &self.pieces;
        // Pieces without a deadline serve last, not first
        self.serve_order.sort_by_key(|idx| {
            let deadline = pieces.get(idx).and_then(|p| p.deadline);
            (deadline.is_none(), deadline)
        });
        debug_assert_sorted(&self.serve_order, pieces);
    }

    /// Mark interest as needing recomputation on the next review. We
    /// recompute eagerly since the peer set is small.
    fn interest_dirty(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Running)
            .map(|(a, _)| *a)
            .collect();
        for addr in addrs {
            self.update_interest(addr);
        }
    }

    /// Recompute am_interested for one peer and send the transition.
    /// Interested iff the peer has a piece that is active and still wants
    /// data.
    pub fn update_interest(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let interested = match &peer.piece_flags {
            Some(flags) => self
                .pieces
                .values()
                .any(|tp| tp.wants_data() && Peer::flag_has(flags, tp.index)),
            None => false,
        };

        let peer = self.peers.get_mut(&addr).unwrap();
        if peer.state != PeerState::Running {
            return;
        }
        if peer.am_interested != interested {
            peer.am_interested = interested;
            debug!(peer = %addr, interested, "interest changed");
            peer.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    pub fn update_interest_all(&mut self) {
        self.interest_dirty();
    }

    /// Copy a received block into its piece. Returns true when the piece
    /// just became complete.
    pub fn receive_block(&mut self, index: u32, begin: u32, data: &[u8], from: SocketAddr) -> bool {
        let Some(piece) = self.pieces.get(&index) else {
            return false;
        };
        // A straggling duplicate must never touch a piece that already
        // completed (it may be verified, or mid-hash with its buffer out)
        if piece.complete || piece.io_busy {
            self.wasted_bytes += data.len() as u64;
            return false;
        }

        let now_sec = now_seconds();
        self.downloaded_bytes += data.len() as u64;
        let downloaded = self.downloaded_bytes;
        self.download_rate.fill(now_sec, downloaded);

        let piece = self.pieces.get_mut(&index).unwrap();
        piece.data[begin as usize..begin as usize + data.len()].copy_from_slice(data);
        piece.downloaded_bytes += data.len() as u64;
        piece.add_contributor(from);

        if piece.all_blocks_done() && !piece.complete {
            piece.complete = true;
            debug!(piece = index, "piece complete");
            return true;
        }
        false
    }

    /// Local choke policy: every peer that is interested and does not
    /// already have every piece gets unchoked, everyone else is choked.
    /// Choking a peer forfeits its queued upload requests; fast-extension
    /// peers get a REJECT for each.
    pub fn review_chokes(&mut self, now: Instant) {
        if now.duration_since(self.last_choke_review) < CHOKE_REVIEW_INTERVAL {
            return;
        }
        self.last_choke_review = now;

        let num_pieces = self.num_pieces();
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let peer = self.peers.get_mut(&addr).unwrap();
            if peer.state != PeerState::Running {
                continue;
            }
            let choke = !(peer.peer_interested && peer.num_pieces_have != num_pieces);
            if peer.am_choking == choke {
                continue;
            }
            peer.am_choking = choke;
            debug!(peer = %addr, choke, "choke state changed");
            peer.send(if choke { Message::Choke } else { Message::Unchoke });

            if choke {
                let fast = peer.fast_ext;
                let mut rejects = Vec::new();
                for piece in self.pieces.values_mut() {
                    let index = piece.index;
                    piece.sendreqs.retain(|sr| {
                        if sr.peer != addr {
                            return true;
                        }
                        if fast {
                            rejects.push((index, sr.offset, sr.length));
                        }
                        false
                    });
                }
                if let Some(peer) = self.peers.get(&addr) {
                    for (piece, begin, length) in rejects {
                        peer.send(Message::Reject {
                            piece,
                            begin,
                            length,
                        });
                    }
                }
            }
        }
    }

    /// Announce newly verified pieces to running peers that neither have
    /// them nor were already notified.
    pub fn send_haves(&mut self) {
        let verified: Vec<u32> = self
            .pieces
            .values()
            .filter(|p| p.hash_ok)
            .map(|p| p.index)
            .collect();
        let num_pieces = self.num_pieces();

        for (addr, peer) in self.peers.iter_mut() {
            if peer.state != PeerState::Running {
                continue;
            }
            peer.ensure_flags(num_pieces);
            for &index in &verified {
                if peer.flag(index, Peer::HAVE) || peer.flag(index, Peer::NOTIFIED) {
                    continue;
                }
                debug!(peer = %addr, piece = index, "sending have");
                peer.send(Message::Have(index));
                peer.set_flag(index, Peer::NOTIFIED);
            }
        }
    }

    /// Drop flushable pieces while over the residency cap, oldest first.
    pub fn flush_pieces(&mut self) {
        while self.pieces.len() > MAX_ACTIVE_PIECES {
            let victim = self
                .pieces
                .values()
                .filter(|p| p.flushable())
                .min_by_key(|p| p.last_touch)
                .map(|p| p.index);
            let Some(index) = victim else { break };
            debug!(piece = index, "flushing piece from memory");
            self.pieces.remove(&index);
            self.serve_order.retain(|&i| i != index);
        }
    }

    /// The wire bitfield covering verified in-memory pieces plus pieces
    /// resident in the disk cache. None when nothing is set or the piece
    /// count is unknown.
    pub fn local_bitfield(&self) -> Option<Vec<u8>> {
        let num_pieces = self.num_pieces();
        if num_pieces == 0 {
            return None;
        }
        let mut bits = vec![0u8; wire::bitfield_len(num_pieces)];
        let mut something = false;
        for piece in self.pieces.values().filter(|p| p.hash_ok) {
            wire::bitfield_set(&mut bits, piece.index);
            something = true;
        }
        if let Some(cache) = &self.cache {
            for index in 0..num_pieces {
                if cache.slot_of(index).is_some() {
                    wire::bitfield_set(&mut bits, index);
                    something = true;
                }
            }
        }
        something.then_some(bits)
    }

    /// Adopt a freshly parsed metainfo: reinterpret stashed bitfields,
    /// size the per-peer flag arrays and wake metadata waiters. Returns
    /// peers whose stashed bitfield turned out invalid; the caller runs
    /// the full disconnect path for those.
    pub fn adopt_metainfo(&mut self, mi: Metainfo) -> Vec<SocketAddr> {
        self.title = mi.name.clone();
        self.metainfo = Some(mi);
        self.metadata = None;
        self.cache_open_req = true;

        let num_pieces = self.num_pieces();
        let mut bad_peers = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            if peer.state != PeerState::Running {
                continue;
            }
            peer.ensure_flags(num_pieces);
            if peer.pending_have_all {
                peer.pending_have_all = false;
                for index in 0..num_pieces {
                    peer.mark_have(index);
                }
            }
            if let Some(bits) = peer.pending_bitfield.take() {
                if bits.len() != wire::bitfield_len(num_pieces) {
                    warn!(peer = %addr, "stashed bitfield length invalid");
                    bad_peers.push(*addr);
                    continue;
                }
                for index in 0..num_pieces {
                    if wire::bitfield_get(&bits, index) {
                        peer.mark_have(index);
                    }
                }
            }
        }
        self.metainfo_ready.notify_waiters();
        self.update_interest_all();
        bad_peers
    }
}

pub(crate) fn now_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(debug_assertions)]
fn debug_assert_sorted(order: &[u32], pieces: &BTreeMap<u32, Piece>) {
    let deadlines: Vec<_> = order
        .iter()
        .map(|i| pieces.get(i).and_then(|p| p.deadline))
        .collect();
    for pair in deadlines.windows(2) {
        match (pair[0], pair[1]) {
            (Some(a), Some(b)) => debug_assert!(a <= b),
            (None, Some(_)) => debug_assert!(false, "deadline after none"),
            _ => {}
        }
    }
}

#[cfg(not(debug_assertions))]
fn debug_assert_sorted(_order: &[u32], _pieces: &BTreeMap<u32, Piece>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{dict, Value};

    fn test_metainfo(piece_length: u32, total: u64) -> Metainfo {
        let num_pieces = (total + piece_length as u64 - 1) / piece_length as u64;
        let info = dict(vec![
            ("length", Value::Int(total as i64)),
            ("name", Value::Bytes(b"test".to_vec())),
            ("piece length", Value::Int(piece_length as i64)),
            ("pieces", Value::Bytes(vec![0u8; num_pieces as usize * 20])),
        ]);
        let doc = dict(vec![("info", info)]).encode();
        Metainfo::parse(&doc).unwrap()
    }

    fn test_torrent() -> Torrent {
        let mi = test_metainfo(65536, 65536 * 5);
        let mut to = Torrent::new(mi.info_hash);
        to.metainfo = Some(mi);
        to
    }

    #[test]
    fn test_piece_entry_creates_once() {
        let mut to = test_torrent();
        to.piece_entry(2);
        to.piece_entry(2);
        assert_eq!(to.pieces.len(), 1);
        assert_eq!(to.serve_order, vec![2]);
    }

    #[test]
    fn test_serve_order_sorts_by_deadline() {
        let mut to = test_torrent();
        let base = Instant::now();

        for idx in [0, 1, 2] {
            to.piece_entry(idx);
        }
        to.pieces.get_mut(&2).unwrap().deadline = Some(base);
        to.pieces.get_mut(&0).unwrap().deadline = Some(base + Duration::from_secs(5));
        // piece 1 keeps no deadline
        to.resort_serve_order();
        assert_eq!(to.serve_order, vec![2, 0, 1]);
    }

    #[test]
    fn test_deadline_tracks_min_over_handles() {
        let mut to = test_torrent();
        let base = Instant::now();
        to.piece_entry(0);

        let wake = Arc::new(Notify::new());
        to.handles.insert(
            1,
            HandleState {
                deadline: Some(base + Duration::from_secs(10)),
                cancelled: false,
                wake: wake.clone(),
            },
        );
        to.handles.insert(
            2,
            HandleState {
                deadline: Some(base + Duration::from_secs(3)),
                cancelled: false,
                wake,
            },
        );
        let piece = to.pieces.get_mut(&0).unwrap();
        piece.active_handles.insert(1);
        piece.active_handles.insert(2);

        to.update_piece_deadline(0);
        assert_eq!(
            to.pieces[&0].deadline,
            Some(base + Duration::from_secs(3))
        );

        // Dropping the tighter handle relaxes the deadline
        to.pieces.get_mut(&0).unwrap().active_handles.remove(&2);
        to.update_piece_deadline(0);
        assert_eq!(
            to.pieces[&0].deadline,
            Some(base + Duration::from_secs(10))
        );
    }

    #[test]
    fn test_receive_block_completes_piece() {
        let mut to = test_torrent();
        let from: SocketAddr = "10.1.1.1:6881".parse().unwrap();
        to.piece_entry(0);

        // Simulate all four blocks in flight then delivered
        let piece = to.pieces.get_mut(&0).unwrap();
        let blocks: Vec<_> = piece.waiting.drain(..).collect();
        piece.sent = blocks.clone();

        for (i, block) in blocks.iter().enumerate() {
            let data = vec![0xab; block.length as usize];
            let piece = to.pieces.get_mut(&0).unwrap();
            piece.sent.retain(|b| b.begin != block.begin);
            let done = to.receive_block(0, block.begin, &data, from);
            assert_eq!(done, i == blocks.len() - 1);
        }

        let piece = &to.pieces[&0];
        assert!(piece.complete);
        assert!(piece.data.iter().all(|&b| b == 0xab));
        assert_eq!(piece.contributors, vec![from]);
        assert_eq!(to.downloaded_bytes, 65536);
    }

    #[test]
    fn test_flush_respects_cap_and_refs() {
        let mut to = test_torrent();
        let mi = test_metainfo(65536, 65536 * 40);
        to.metainfo = Some(mi);

        for idx in 0..25u32 {
            let piece = to.piece_entry(idx);
            piece.waiting.clear(); // pretend downloaded
        }
        // Pin piece 0
        to.pieces.get_mut(&0).unwrap().refcount = 1;
        to.flush_pieces();
        assert_eq!(to.pieces.len(), MAX_ACTIVE_PIECES);
        assert!(to.pieces.contains_key(&0));
        assert_eq!(to.serve_order.len(), MAX_ACTIVE_PIECES);
    }

    #[test]
    fn test_interest_follows_active_pieces() {
        use crate::peer::{Peer, PeerState};
        let mut to = test_torrent();
        let addr: SocketAddr = "10.2.2.2:6881".parse().unwrap();
        let mut peer = Peer::new(addr);
        peer.state = PeerState::Running;
        peer.ensure_flags(to.num_pieces());
        peer.mark_have(1);
        to.peers.insert(addr, peer);

        // No active pieces yet
        to.update_interest(addr);
        assert!(!to.peers[&addr].am_interested);

        // An active piece the peer has makes us interested
        to.piece_entry(1);
        assert!(to.peers[&addr].am_interested);

        // Once the piece stops wanting data, interest drops
        {
            let piece = to.pieces.get_mut(&1).unwrap();
            piece.waiting.clear();
            piece.complete = true;
        }
        to.update_interest(addr);
        assert!(!to.peers[&addr].am_interested);

        // A piece the peer does not have leaves us uninterested
        to.piece_entry(3);
        to.update_interest(addr);
        assert!(!to.peers[&addr].am_interested);
    }

    #[test]
    fn test_rate_estimator_window() {
        let mut rate = RateEstimator::default();
        rate.fill(100, 0);
        rate.fill(101, 1000);
        rate.fill(102, 4000);
        assert_eq!(rate.read(), 2000);
        assert_eq!(RateEstimator::default().read(), 0);
    }

    #[test]
    fn test_metadata_fetch_assembly() {
        let mut fetch = MetadataFetch::new(METADATA_PIECE_SIZE + 5);
        assert_eq!(fetch.pieces.len(), 2);
        assert!(!fetch.is_complete());
        fetch.pieces[0] = Some(Bytes::from(vec![1u8; METADATA_PIECE_SIZE]));
        fetch.pieces[1] = Some(Bytes::from(vec![2u8; 5]));
        assert!(fetch.is_complete());
        let data = fetch.assemble();
        assert_eq!(data.len(), METADATA_PIECE_SIZE + 5);
        assert_eq!(data[METADATA_PIECE_SIZE], 2);
    }
}
