//! In-memory piece, block and request model.
//!
//! A piece exists in memory only while some reader, peer or the scheduler
//! needs it; completed-and-flushed pieces live in the disk cache and are
//! represented solely by the cache piece map. Blocks move from `waiting`
//! to `sent` as requests go out and are dropped when their data arrives.

use crate::wire::BLOCK_SIZE;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// A 16 KiB sub-range of a piece (shorter at the tail). `holders` tracks
/// which peers currently have a live request linked to this block, so a
/// disconnect only returns the block to the waiting list when no other
/// request is still racing for it.
#[derive(Debug, Clone)]
pub struct Block {
    pub begin: u32,
    pub length: u32,
    /// Peers with an outstanding linked request for this block.
    pub holders: Vec<SocketAddr>,
    /// Total requests ever issued for this block, for duplicate ordering.
    pub req_tally: u8,
}

/// One outstanding REQUEST on a peer. `linked` is cleared when the block
/// is completed by another peer but the request is kept alive purely to
/// measure this peer's first block delay.
#[derive(Debug, Clone)]
pub struct Request {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
    pub sent_at: Instant,
    /// Peer queue depth at send time, indexes the delay histogram.
    pub qdepth: u8,
    pub linked: bool,
}

impl Request {
    pub fn matches(&self, piece: u32, begin: u32, length: u32) -> bool {
        self.piece == piece && self.begin == begin && self.length == length
    }
}

/// An upload request we could not serve immediately (piece still loading
/// from disk, or the egress token bucket ran dry).
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub peer: SocketAddr,
    pub offset: u32,
    pub length: u32,
}

/// An active in-memory piece.
#[derive(Debug)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub data: Vec<u8>,

    pub waiting: Vec<Block>,
    pub sent: Vec<Block>,
    pub sendreqs: Vec<PendingSend>,

    /// Peers that contributed at least one block, for blame on hash
    /// failure; `blame_rotor` rotates which one gets marked bad.
    pub contributors: Vec<SocketAddr>,
    pub blame_rotor: usize,

    pub complete: bool,
    pub hash_computed: bool,
    pub hash_ok: bool,
    pub on_disk: bool,
    pub disk_fail: bool,
    pub load_req: bool,
    pub load_fail: bool,
    /// Buffer temporarily taken by the hash or disk worker.
    pub io_busy: bool,

    /// Readers and workers holding the piece across an unlocked region.
    pub refcount: u32,
    /// Read handles currently blocked on (or reading ahead into) this
    /// piece; deadline is the minimum of their deadlines.
    pub active_handles: HashSet<u64>,
    pub deadline: Option<Instant>,

    /// Woken whenever the piece's verification state changes.
    pub verified: Arc<Notify>,

    pub downloaded_bytes: u64,
    pub last_touch: Instant,
}

impl Piece {
    /// Allocate a piece with its full block breakdown queued for request.
    pub fn new(index: u32, length: u32) -> Self {
        let mut waiting = Vec::with_capacity(((length + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize);
        let mut begin = 0;
        while begin < length {
            waiting.push(Block {
                begin,
                length: (length - begin).min(BLOCK_SIZE),
                holders: Vec::new(),
                req_tally: 0,
            });
            begin += BLOCK_SIZE;
        }
        Piece {
            index,
            length,
            data: vec![0; length as usize],
            waiting,
            sent: Vec::new(),
            sendreqs: Vec::new(),
            contributors: Vec::new(),
            blame_rotor: 0,
            complete: false,
            hash_computed: false,
            hash_ok: false,
            on_disk: false,
            disk_fail: false,
            load_req: false,
            load_fail: false,
            io_busy: false,
            refcount: 0,
            active_handles: HashSet::new(),
            deadline: None,
            verified: Arc::new(Notify::new()),
            downloaded_bytes: 0,
            last_touch: Instant::now(),
        }
    }

    /// True once no blocks remain to schedule or wait for.
    pub fn all_blocks_done(&self) -> bool {
        self.waiting.is_empty() && self.sent.is_empty()
    }

    /// Whether the piece still wants data from peers.
    pub fn wants_data(&self) -> bool {
        !self.waiting.is_empty() || !self.sent.is_empty()
    }

    /// Record a contributing peer for later blame.
    pub fn add_contributor(&mut self, addr: SocketAddr) {
        if !self.contributors.contains(&addr) {
            self.contributors.push(addr);
        }
    }

    /// Reset the piece for a fresh download after a hash mismatch: all
    /// blocks return to the waiting list and the contributor set clears.
    pub fn restart(&mut self) {
        self.complete = false;
        self.hash_computed = false;
        self.hash_ok = false;
        self.waiting.clear();
        self.sent.clear();
        let mut begin = 0;
        while begin < self.length {
            self.waiting.push(Block {
                begin,
                length: (self.length - begin).min(BLOCK_SIZE),
                holders: Vec::new(),
                req_tally: 0,
            });
            begin += BLOCK_SIZE;
        }
        self.contributors.clear();
        self.downloaded_bytes = 0;
    }

    /// Move a block from `waiting` to `sent`, returning its index in
    /// `sent`. Caller has already linked a request to it.
    pub fn mark_sent(&mut self, waiting_idx: usize) -> usize {
        let block = self.waiting.remove(waiting_idx);
        self.sent.push(block);
        self.sent.len() - 1
    }

    /// Return a sent block to the waiting list (failed request with no
    /// surviving holders).
    pub fn return_to_waiting(&mut self, sent_idx: usize) {
        let block = self.sent.remove(sent_idx);
        self.waiting.push(block);
    }

    /// Eligible for flushing out of memory.
    pub fn flushable(&self) -> bool {
        self.refcount == 0
            && self.active_handles.is_empty()
            && self.waiting.is_empty()
            && self.sent.is_empty()
            && self.sendreqs.is_empty()
            && !self.io_busy
            && !self.load_req
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_breakdown() {
        let piece = Piece::new(0, 65536);
        assert_eq!(piece.waiting.len(), 4);
        assert!(piece.waiting.iter().all(|b| b.length == BLOCK_SIZE));

        // Trailing block is truncated
        let piece = Piece::new(1, 40_000);
        assert_eq!(piece.waiting.len(), 3);
        assert_eq!(piece.waiting[2].length, 40_000 - 2 * BLOCK_SIZE);

        // Piece shorter than one block
        let piece = Piece::new(2, 1000);
        assert_eq!(piece.waiting.len(), 1);
        assert_eq!(piece.waiting[0].length, 1000);
    }

    #[test]
    fn test_restart_rebuilds_blocks() {
        let mut piece = Piece::new(0, 32768);
        piece.mark_sent(0);
        piece.mark_sent(0);
        piece.complete = true;
        piece.hash_computed = true;
        piece.add_contributor("10.0.0.1:1".parse().unwrap());

        piece.restart();
        assert!(!piece.complete && !piece.hash_computed);
        assert_eq!(piece.waiting.len(), 2);
        assert!(piece.sent.is_empty());
        assert!(piece.contributors.is_empty());
    }

    #[test]
    fn test_flushable_gates() {
        let mut piece = Piece::new(0, 16384);
        assert!(!piece.flushable()); // waiting block pending
        piece.waiting.clear();
        assert!(piece.flushable());
        piece.refcount = 1;
        assert!(!piece.flushable());
        piece.refcount = 0;
        piece.active_handles.insert(1);
        assert!(!piece.flushable());
    }
}
