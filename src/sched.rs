//! Deadline-driven piece and block scheduling.
//!
//! Runs under the core lock whenever peers change state, a block arrives,
//! a piece is wanted, or the periodic tick fires. Three passes walk the
//! deadline-ordered piece list:
//!
//! 1. redundancy: duplicate-request blocks whose predicted arrival misses
//!    the piece deadline, racing a faster peer against the incumbent;
//! 2. optimal: hand waiting blocks to the unchoked peer with the lowest
//!    measured block delay (unmeasured peers get one cheap first chance);
//! 3. any-peer: hand leftovers to any unchoked peer with spare queue.

use crate::peer::Peer;
use crate::torrent::Torrent;
use crate::wire::Message;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::trace;

pub(crate) fn do_requests(to: &mut Torrent, now: Instant) {
    let order: Vec<u32> = to.serve_order.clone();

    // Pass 1: only pieces with a real deadline are worth racing for; the
    // serve order puts them first.
    for &index in &order {
        let Some(deadline) = to.pieces.get(&index).and_then(|p| p.deadline) else {
            break;
        };
        check_active_requests(to, index, deadline, now);
    }

    for &index in &order {
        serve_waiting_blocks(to, index, true, now);
    }
    for &index in &order {
        serve_waiting_blocks(to, index, false, now);
    }

    to.flush_pieces();
    to.review_chokes(now);
}

/// Can this peer be asked for this piece at all.
fn peer_has_piece(peer: &Peer, index: u32) -> bool {
    peer.flag(index, Peer::HAVE) && !peer.flag(index, Peer::REJECTED)
}

/// Lowest-EWMA unchoked peer holding the piece. A peer with no
/// measurement scores zero only while it has no outstanding requests, so
/// one slow discovery cannot poison every choice.
fn find_optimal_peer(to: &Torrent, index: u32) -> Option<SocketAddr> {
    let mut best: Option<(Duration, SocketAddr)> = None;
    for addr in &to.unchoked {
        let Some(peer) = to.peers.get(addr) else {
            continue;
        };
        if !peer_has_piece(peer, index) {
            continue;
        }
        let score = match peer.block_delay {
            Some(delay) => delay,
            None => {
                if peer.active_requests() > 0 {
                    continue;
                }
                Duration::ZERO
            }
        };
        if best.map_or(true, |(b, _)| score < b) {
            best = Some((score, *addr));
        }
    }
    best.map(|(_, addr)| addr)
}

/// Any unchoked peer holding the piece with less than half its queue cap
/// in flight.
fn find_any_peer(to: &Torrent, index: u32) -> Option<SocketAddr> {
    for addr in &to.unchoked {
        let Some(peer) = to.peers.get(addr) else {
            continue;
        };
        if !peer_has_piece(peer, index) {
            continue;
        }
        if peer.active_requests() < (peer.maxq / 2) as usize {
            return Some(*addr);
        }
    }
    None
}

/// A measured, not-fully-queued unchoked peer that has the piece, is not
/// already racing this block, and whose predicted arrival beats
/// `eta_to_beat`.
fn find_faster_peer(
    to: &Torrent,
    index: u32,
    holders: &[SocketAddr],
    mut eta_to_beat: Instant,
    now: Instant,
) -> Option<SocketAddr> {
    let mut best = None;
    for addr in &to.unchoked {
        let Some(peer) = to.peers.get(addr) else {
            continue;
        };
        if !peer_has_piece(peer, index) {
            continue;
        }
        let Some(delay) = peer.block_delay else {
            continue;
        };
        if peer.active_requests() >= peer.maxq as usize {
            continue;
        }
        if holders.contains(addr) {
            continue;
        }
        let eta = now + delay * 2;
        if eta < eta_to_beat {
            eta_to_beat = eta;
            best = Some(*addr);
        }
    }
    best
}

/// Issue one REQUEST to `addr` for the given block and link it to the
/// block's holder list. Returns false when the peer is gone or already
/// has this exact request outstanding.
fn add_request(
    to: &mut Torrent,
    index: u32,
    begin: u32,
    length: u32,
    addr: SocketAddr,
    now: Instant,
) -> bool {
    let Some(peer) = to.peers.get_mut(&addr) else {
        return false;
    };
    if peer
        .requests
        .iter()
        .any(|r| r.matches(index, begin, length))
    {
        return false;
    }
    let qdepth = peer.requests.len().min(9) as u8;
    peer.requests.push(crate::piece::Request {
        piece: index,
        begin,
        length,
        sent_at: now,
        qdepth,
        linked: true,
    });
    peer.num_requests += 1;
    peer.send(Message::Request {
        piece: index,
        begin,
        length,
    });
    trace!(peer = %addr, piece = index, begin, length, qdepth, "request sent");

    if let Some(tp) = to.pieces.get_mut(&index) {
        let block = tp
            .sent
            .iter_mut()
            .chain(tp.waiting.iter_mut())
            .find(|b| b.begin == begin && b.length == length);
        if let Some(block) = block {
            block.holders.push(addr);
            block.req_tally = block.req_tally.wrapping_add(1);
        }
    }
    true
}

/// Passes 2 and 3: hand out waiting blocks until the finder runs dry or
/// the chosen peer is saturated.
fn serve_waiting_blocks(to: &mut Torrent, index: u32, optimal: bool, now: Instant) {
    loop {
        let Some(tp) = to.pieces.get(&index) else {
            return;
        };
        let Some((begin, length)) = tp.waiting.first().map(|b| (b.begin, b.length)) else {
            return;
        };

        let addr = if optimal {
            let Some(addr) = find_optimal_peer(to, index) else {
                return;
            };
            let peer = &to.peers[&addr];
            if peer.active_requests() >= peer.maxq as usize {
                return;
            }
            addr
        } else {
            let Some(addr) = find_any_peer(to, index) else {
                return;
            };
            addr
        };

        if !add_request(to, index, begin, length, addr, now) {
            return;
        }
        let tp = to.pieces.get_mut(&index).unwrap();
        if let Some(pos) = tp.waiting.iter().position(|b| b.begin == begin) {
            tp.mark_sent(pos);
        }
    }
}

/// Pass 1: for every in-flight block of a deadline piece, predict the
/// newest request's arrival and race a faster peer when it would miss.
fn check_active_requests(to: &mut Torrent, index: u32, deadline: Instant, now: Instant) {
    let Some(tp) = to.pieces.get(&index) else {
        return;
    };
    let blocks: Vec<(u32, u32, Vec<SocketAddr>)> = tp
        .sent
        .iter()
        .filter(|b| !b.holders.is_empty())
        .map(|b| (b.begin, b.length, b.holders.clone()))
        .collect();

    for (begin, length, holders) in blocks {
        // The newest request is the one to beat: duplicates are only worth
        // it when we expect to outrun everything already enqueued.
        let newest = *holders.last().unwrap();
        let Some(cur_peer) = to.peers.get(&newest) else {
            continue;
        };
        let cur_delay = cur_peer.block_delay.unwrap_or(Duration::ZERO);
        let Some(req) = cur_peer
            .requests
            .iter()
            .find(|r| r.linked && r.matches(index, begin, length))
        else {
            continue;
        };
        let sent_at = req.sent_at;

        let mut eta = sent_at + cur_delay;
        if eta < now {
            // Already late; assume it keeps getting worse
            let late = now.duration_since(eta);
            eta += late * 2;
        }
        if eta < deadline {
            continue;
        }

        let Some(cand) = find_faster_peer(to, index, &holders, eta, now) else {
            continue;
        };
        trace!(piece = index, begin, racer = %cand, incumbent = %newest, "duplicate request");
        add_request(to, index, begin, length, cand, now);

        // Push the incumbent's estimate toward reality so the same block
        // does not trigger a new race every pass.
        if let Some(peer) = to.peers.get_mut(&newest) {
            let observed = now.duration_since(sent_at);
            if let Some(delay) = peer.block_delay {
                if observed > delay {
                    peer.block_delay = Some((delay * 7 + observed) / 8);
                }
            }
        }
    }
}
