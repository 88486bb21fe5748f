//! Peer objects, connection tasks and wire message dispatch.
//!
//! Each admitted peer gets one outbound TCP connection driven by two
//! tasks: a reader that frames incoming messages and dispatches them into
//! the core under the session lock, and a writer that drains the peer's
//! outbound queue and keeps the connection alive. The state machine
//! (inactive → connecting → wait-handshake → running, with parking on
//! failure) lives in the core; tasks carry a connection generation so a
//! stale task can never mutate a newer incarnation of the peer.

use crate::bencode::{self, dict, Value};
use crate::error::{BtError, BtResult};
use crate::metainfo::{InfoHash, Metainfo};
use crate::piece::{PendingSend, Request};
use crate::sched;
use crate::session::{Core, Session};
use crate::torrent::{now_seconds, MetadataFetch, RateEstimator, Torrent, METADATA_PIECE_SIZE};
use crate::wire::{self, Handshake, HandshakeCodec, Message, PeerCodec};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive connect failures or disconnects before the peer is dropped
/// for good.
const MAX_FAILURES: u32 = 5;

/// Hash-failure blame markings before a peer is disconnected.
const MAX_BAD_PIECES: u32 = 3;

/// Measured block delays are clamped here before feeding the EWMA.
const DELAY_CLAMP: Duration = Duration::from_secs(60);

const EXT_MSG_HANDSHAKE: u8 = 0;
/// The ut_metadata message id we advertise.
pub(crate) const EXT_MSG_METADATA: u8 = 2;

/// Stashed pre-metainfo bitfields above this size are ignored.
const MAX_STASHED_BITFIELD: usize = 8192;

/// Upper bound accepted for a peer-reported metadata size.
const MAX_METADATA_SIZE: i64 = 4 * 1024 * 1024;

/// Metadata pieces one peer may have in flight.
const METADATA_PIPELINE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerState {
    Inactive,
    Connecting,
    ConnectFail,
    WaitHandshake,
    Running,
    Disconnected,
    /// Sentinel passed to the shutdown path; never stored.
    Destroyed,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Inactive => "inactive",
            PeerState::Connecting => "connecting",
            PeerState::ConnectFail => "connect-fail",
            PeerState::WaitHandshake => "wait-handshake",
            PeerState::Running => "running",
            PeerState::Disconnected => "disconnected",
            PeerState::Destroyed => "destroyed",
        }
    }
}

/// Live connection: outbound queue plus the token that tears both I/O
/// tasks down.
#[derive(Debug)]
pub(crate) struct ConnHandle {
    pub tx: UnboundedSender<Message>,
    pub cancel: CancellationToken,
}

pub(crate) struct Peer {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub conn: Option<ConnHandle>,
    /// Bumped on every connect attempt and shutdown; stale tasks compare
    /// against it before touching the peer.
    pub conn_gen: u64,

    pub connect_fails: u32,
    pub disconnects: u32,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub fast_ext: bool,
    pub ext_prot: bool,
    pub pending_have_all: bool,

    pub peer_id: Option<[u8; 20]>,

    /// Per-piece HAVE/NOTIFIED/REJECTED bits, sized once metainfo is known.
    pub piece_flags: Option<Vec<u8>>,
    /// Bitfield received before metainfo, reinterpreted later.
    pub pending_bitfield: Option<Vec<u8>>,
    pub num_pieces_have: u32,

    pub requests: Vec<Request>,

    /// EWMA of REQUEST→PIECE latency; None until first measurement.
    pub block_delay: Option<Duration>,
    /// Same, broken down by queue depth at request-send time.
    pub delay_by_depth: [Option<Duration>; 10],
    /// Request pipeline cap: 1 on unchoke, 10 after the first delivery.
    pub maxq: u32,

    pub num_requests: u64,
    pub num_cancels: u64,
    pub num_waste: u64,
    pub bad_pieces: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub download_rate: RateEstimator,

    /// Peer's ut_metadata extension message id; 0 = unsupported.
    pub ext_ut_metadata: u8,
}

impl Peer {
    pub const HAVE: u8 = 0x1;
    pub const NOTIFIED: u8 = 0x2;
    pub const REJECTED: u8 = 0x4;

    pub fn new(addr: SocketAddr) -> Self {
        Peer {
            addr,
            state: PeerState::Inactive,
            conn: None,
            conn_gen: 0,
            connect_fails: 0,
            disconnects: 0,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            fast_ext: false,
            ext_prot: false,
            pending_have_all: false,
            peer_id: None,
            piece_flags: None,
            pending_bitfield: None,
            num_pieces_have: 0,
            requests: Vec::new(),
            block_delay: None,
            delay_by_depth: [None; 10],
            maxq: 1,
            num_requests: 0,
            num_cancels: 0,
            num_waste: 0,
            bad_pieces: 0,
            bytes_received: 0,
            bytes_sent: 0,
            download_rate: RateEstimator::default(),
            ext_ut_metadata: 0,
        }
    }

    pub fn send(&self, msg: Message) {
        if let Some(conn) = &self.conn {
            let _ = conn.tx.send(msg);
        }
    }

    pub fn ensure_flags(&mut self, num_pieces: u32) {
        if self.piece_flags.is_none() {
            self.piece_flags = Some(vec![0; num_pieces as usize]);
        }
    }

    pub fn flag(&self, index: u32, bit: u8) -> bool {
        self.piece_flags
            .as_ref()
            .map_or(false, |f| f.get(index as usize).map_or(false, |v| v & bit != 0))
    }

    pub fn set_flag(&mut self, index: u32, bit: u8) {
        if let Some(flags) = &mut self.piece_flags {
            if let Some(slot) = flags.get_mut(index as usize) {
                *slot |= bit;
            }
        }
    }

    /// Static form used where the peer itself is mutably borrowed.
    pub fn flag_has(flags: &[u8], index: u32) -> bool {
        flags.get(index as usize).map_or(false, |v| v & Self::HAVE != 0)
    }

    pub fn mark_have(&mut self, index: u32) {
        if !self.flag(index, Self::HAVE) {
            self.set_flag(index, Self::HAVE);
            self.num_pieces_have += 1;
        }
    }

    pub fn apply_bitfield(&mut self, bits: &[u8], num_pieces: u32) {
        self.ensure_flags(num_pieces);
        if let Some(flags) = &mut self.piece_flags {
            for value in flags.iter_mut() {
                *value &= !Self::HAVE;
            }
        }
        self.num_pieces_have = 0;
        for index in 0..num_pieces {
            if wire::bitfield_get(bits, index) {
                self.mark_have(index);
            }
        }
    }

    /// Feed a block delay into the EWMAs. Returns true when this was the
    /// first measurement for the peer.
    pub fn note_block_delay(&mut self, qdepth: u8, measured: Duration) -> bool {
        let measured = measured.min(DELAY_CLAMP);
        let first = self.block_delay.is_none();
        self.block_delay = Some(match self.block_delay {
            Some(prev) => (prev * 7 + measured) / 8,
            None => measured,
        });
        self.maxq = 10;

        let slot = &mut self.delay_by_depth[(qdepth as usize).min(9)];
        *slot = Some(match *slot {
            Some(prev) => (prev * 7 + measured) / 8,
            None => measured,
        });
        first
    }

    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }
}

/// Register a peer learned from a tracker (or another source). Connects
/// immediately when under the global and per-torrent caps, otherwise
/// parks it on the inactive queue.
pub(crate) fn add_peer(session: &Arc<Session>, core: &mut Core, hash: InfoHash, addr: SocketAddr) {
    let limits = core.limits;
    let global_active = core.active_peers;
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    if to.peers.contains_key(&addr) {
        return;
    }
    let at_cap = to.active_peers >= limits.max_peers_torrent
        || global_active >= limits.max_peers_global;
    to.peers.insert(addr, Peer::new(addr));
    if at_cap {
        to.inactive_q.push_back(addr);
        return;
    }
    start_connect(session, core, hash, addr);
}

fn start_connect(session: &Arc<Session>, core: &mut Core, hash: InfoHash, addr: SocketAddr) {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return;
    };
    debug_assert!(peer.conn.is_none());
    peer.state = PeerState::Connecting;
    peer.conn_gen += 1;
    let gen = peer.conn_gen;
    to.active_peers += 1;
    core.active_peers += 1;

    let session = Arc::clone(session);
    tokio::spawn(async move {
        run_peer(session, hash, addr, gen).await;
    });
}

/// Fill an open connection slot from the parked queues: inactive first,
/// then disconnected, then connect-failed.
pub(crate) fn attempt_more_peers(session: &Arc<Session>, core: &mut Core, hash: InfoHash) {
    let limits = core.limits;
    if core.active_peers >= limits.max_peers_global {
        return;
    }
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    if to.active_peers >= limits.max_peers_torrent {
        return;
    }
    let next = to
        .inactive_q
        .pop_front()
        .or_else(|| to.disconnected_q.pop_front())
        .or_else(|| to.connect_failed_q.pop_front());
    if let Some(addr) = next {
        start_connect(session, core, hash, addr);
    }
}

/// Tear a peer down and move it to `next` (or destroy it outright).
/// Outstanding download requests go back to their blocks unless some
/// other peer still races for them; queued upload requests are dropped.
pub(crate) fn peer_shutdown(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    next: PeerState,
    resched: bool,
) {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return;
    };
    let old = peer.state;
    trace!(peer = %addr, from = old.as_str(), to = next.as_str(), "peer shutdown");

    // Parked peers already gave their slot back
    if matches!(
        old,
        PeerState::Connecting | PeerState::WaitHandshake | PeerState::Running
    ) {
        to.active_peers = to.active_peers.saturating_sub(1);
        core.active_peers = core.active_peers.saturating_sub(1);
    }
    if let Some(conn) = peer.conn.take() {
        conn.cancel.cancel();
    }
    peer.conn_gen += 1;
    peer.pending_bitfield = None;
    peer.piece_flags = None;
    peer.num_pieces_have = 0;
    peer.pending_have_all = false;
    peer.ext_ut_metadata = 0;
    peer.peer_id = None;

    match old {
        PeerState::Inactive => to.inactive_q.retain(|a| *a != addr),
        PeerState::Disconnected => to.disconnected_q.retain(|a| *a != addr),
        PeerState::ConnectFail => to.connect_failed_q.retain(|a| *a != addr),
        PeerState::Running => {
            to.unchoked.retain(|a| *a != addr);
            if let Some(peer) = to.peers.get_mut(&addr) {
                peer.peer_choking = true;
            }
            if let Some(fetch) = &mut to.metadata {
                fetch.inflight.retain(|_, holder| *holder != addr);
            }
        }
        PeerState::Connecting | PeerState::WaitHandshake => {}
        PeerState::Destroyed => unreachable!("destroyed peers are removed"),
    }

    abort_requests(to, addr);

    let peer = to.peers.get_mut(&addr).unwrap();
    let destroy = match next {
        PeerState::ConnectFail => {
            peer.connect_fails += 1;
            if peer.connect_fails >= MAX_FAILURES {
                true
            } else {
                peer.state = PeerState::ConnectFail;
                to.connect_failed_q.push_back(addr);
                false
            }
        }
        PeerState::Disconnected => {
            peer.disconnects += 1;
            if peer.disconnects >= MAX_FAILURES {
                true
            } else {
                peer.state = PeerState::Disconnected;
                to.disconnected_q.push_back(addr);
                false
            }
        }
        PeerState::Destroyed => true,
        other => {
            peer.state = other;
            false
        }
    };
    if destroy {
        debug!(peer = %addr, "peer destroyed");
        to.peers.remove(&addr);
    }

    if resched {
        attempt_more_peers(session, core, hash);
        if let Some(to) = core.torrents.get_mut(&hash) {
            sched::do_requests(to, Instant::now());
        }
    }
}

async fn run_peer(session: Arc<Session>, hash: InfoHash, addr: SocketAddr, gen: u64) {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            peer_io_failed(&session, hash, addr, gen);
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    {
        let mut core = session.core.lock().unwrap();
        let Some(peer) = peer_mut(&mut core, &hash, &addr) else {
            return;
        };
        if peer.conn_gen != gen || peer.state != PeerState::Connecting {
            return;
        }
        peer.state = PeerState::WaitHandshake;
        peer.am_choking = true;
        peer.am_interested = false;
        peer.peer_choking = true;
        peer.peer_interested = false;
        peer.conn = Some(ConnHandle {
            tx,
            cancel: cancel.clone(),
        });
    }

    let mut framed = Framed::new(stream, HandshakeCodec);
    if framed
        .send(Handshake::new(hash, session.peer_id))
        .await
        .is_err()
    {
        peer_io_failed(&session, hash, addr, gen);
        return;
    }

    let hs = match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(hs))) => hs,
        Ok(Some(Err(err))) if err.is_protocol_fatal() => {
            peer_fatal(&session, hash, addr, gen, err);
            return;
        }
        _ => {
            peer_io_failed(&session, hash, addr, gen);
            return;
        }
    };
    if hs.info_hash != hash {
        peer_fatal(&session, hash, addr, gen, BtError::InfoHashMismatch);
        return;
    }

    // Switch to message framing, keeping any bytes the peer pipelined
    // right behind its handshake.
    let parts = framed.into_parts();
    let mut new_parts = FramedParts::new(parts.io, PeerCodec);
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    let framed = Framed::from_parts(new_parts);
    let (sink, mut stream) = framed.split();

    tokio::spawn(write_loop(sink, rx, cancel.clone()));

    if !on_handshake(&session, hash, addr, gen, &hs) {
        return;
    }

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            res = timeout(IDLE_TIMEOUT, stream.next()) => res,
        };
        match next {
            Ok(Some(Ok(msg))) => {
                if on_peer_message(&session, hash, addr, gen, msg).is_err() {
                    return;
                }
            }
            Ok(Some(Err(err))) if err.is_protocol_fatal() => {
                peer_fatal(&session, hash, addr, gen, err);
                return;
            }
            _ => {
                // EOF, socket error or 300 s idle timeout
                peer_io_failed(&session, hash, addr, gen);
                return;
            }
        }
    }
}

/// Transient failure: park for retry. Which park queue depends on whether
/// the handshake had completed.
fn peer_io_failed(session: &Arc<Session>, hash: InfoHash, addr: SocketAddr, gen: u64) {
    let mut core = session.core.lock().unwrap();
    let Some(peer) = peer_mut(&mut core, &hash, &addr) else {
        return;
    };
    if peer.conn_gen != gen {
        return;
    }
    let next = if peer.state == PeerState::Running {
        PeerState::Disconnected
    } else {
        PeerState::ConnectFail
    };
    peer_shutdown(session, &mut core, hash, addr, next, true);
}

/// Protocol violation: destroy the peer, no retry.
fn peer_fatal(session: &Arc<Session>, hash: InfoHash, addr: SocketAddr, gen: u64, err: BtError) {
    let mut core = session.core.lock().unwrap();
    let Some(peer) = peer_mut(&mut core, &hash, &addr) else {
        return;
    };
    if peer.conn_gen != gen {
        return;
    }
    warn!(peer = %addr, error = %err, "disconnecting peer");
    peer_shutdown(session, &mut core, hash, addr, PeerState::Destroyed, true);
}

/// Handshake received: enter RUNNING and send the initial set (our
/// bitfield plus, when negotiated, the extension handshake).
fn on_handshake(
    session: &Arc<Session>,
    hash: InfoHash,
    addr: SocketAddr,
    gen: u64,
    hs: &Handshake,
) -> bool {
    let mut core = session.core.lock().unwrap();
    let Some(to) = core.torrents.get_mut(&hash) else {
        return false;
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return false;
    };
    if peer.conn_gen != gen || peer.state != PeerState::WaitHandshake {
        return false;
    }
    peer.state = PeerState::Running;
    peer.connect_fails = 0;
    peer.disconnects = 0;
    peer.fast_ext = hs.fast_ext;
    peer.ext_prot = hs.ext_prot;
    peer.peer_id = Some(hs.peer_id);
    let ext_prot = peer.ext_prot;
    debug!(
        peer = %addr,
        fast = hs.fast_ext,
        ext = hs.ext_prot,
        "handshake complete"
    );

    if let Some(bits) = to.local_bitfield() {
        if let Some(peer) = to.peers.get(&addr) {
            peer.send(Message::Bitfield(Bytes::from(bits)));
        }
    }
    if ext_prot {
        let mut entries = vec![
            (
                "m",
                dict(vec![("ut_metadata", Value::Int(EXT_MSG_METADATA as i64))]),
            ),
            (
                "v",
                Value::Bytes(format!("btstream {}", env!("CARGO_PKG_VERSION")).into_bytes()),
            ),
        ];
        if let Some(mi) = &to.metainfo {
            entries.push(("metadata_size", Value::Int(mi.info_bytes().len() as i64)));
        }
        if let Some(peer) = to.peers.get(&addr) {
            peer.send(Message::Extension {
                ext_id: EXT_MSG_HANDSHAKE,
                payload: Bytes::from(dict(entries).encode()),
            });
        }
    }
    true
}

/// Dispatch one incoming message. A returned error means the peer was
/// already destroyed and the reader task must stop.
pub(crate) fn on_peer_message(
    session: &Arc<Session>,
    hash: InfoHash,
    addr: SocketAddr,
    gen: u64,
    msg: Message,
) -> BtResult<()> {
    let mut core = session.core.lock().unwrap();
    {
        let Some(peer) = peer_mut(&mut core, &hash, &addr) else {
            return Err(BtError::Shutdown);
        };
        if peer.conn_gen != gen || peer.state != PeerState::Running {
            return Err(BtError::Shutdown);
        }
    }
    let result = dispatch(session, &mut core, hash, addr, msg);
    if let Err(err) = &result {
        if err.is_protocol_fatal() {
            warn!(peer = %addr, error = %err, "protocol violation");
            peer_shutdown(session, &mut core, hash, addr, PeerState::Destroyed, true);
        }
    }
    result
}

fn dispatch(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    msg: Message,
) -> BtResult<()> {
    match msg {
        Message::KeepAlive => Ok(()),
        Message::Choke => recv_choke(core, hash, addr, true),
        Message::Unchoke => recv_choke(core, hash, addr, false),
        Message::Interested => set_peer_interested(core, &hash, &addr, true),
        Message::NotInterested => set_peer_interested(core, &hash, &addr, false),
        Message::Have(piece) => recv_have(core, hash, addr, piece),
        Message::Bitfield(bits) => recv_bitfield(core, hash, addr, &bits),
        Message::HaveAll => recv_have_all(core, hash, addr),
        Message::HaveNone => Ok(()),
        Message::Piece { piece, begin, data } => {
            recv_piece(session, core, hash, addr, piece, begin, &data)
        }
        Message::Request {
            piece,
            begin,
            length,
        } => recv_request(session, core, hash, addr, piece, begin, length),
        Message::Cancel {
            piece,
            begin,
            length,
        } => recv_cancel(core, &hash, &addr, piece, begin, length),
        Message::Reject {
            piece,
            begin,
            length,
        } => recv_reject(core, hash, addr, piece, begin, length),
        Message::AllowedFast(_) => Ok(()),
        Message::Extension { ext_id, payload } => {
            recv_extension(session, core, hash, addr, ext_id, &payload)
        }
        Message::Unknown(id) => {
            trace!(peer = %addr, msgid = id, "ignoring unknown message");
            Ok(())
        }
    }
}

fn recv_choke(core: &mut Core, hash: InfoHash, addr: SocketAddr, choked: bool) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    if peer.peer_choking == choked {
        return Ok(());
    }
    peer.peer_choking = choked;
    debug!(peer = %addr, choked, interested = peer.am_interested, "remote choke state");
    if choked {
        to.unchoked.retain(|a| *a != addr);
        abort_requests(to, addr);
    } else {
        peer.maxq = 1;
        to.unchoked.push(addr);
    }
    sched::do_requests(to, Instant::now());
    Ok(())
}

fn recv_have(core: &mut Core, hash: InfoHash, addr: SocketAddr, piece: u32) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    if to.metainfo.is_none() {
        let Some(peer) = to.peers.get_mut(&addr) else {
            return Ok(());
        };
        if let Some(bits) = &mut peer.pending_bitfield {
            wire::bitfield_set(bits, piece);
        }
        return Ok(());
    }
    let num_pieces = to.num_pieces();
    if piece >= num_pieces {
        return Err(BtError::MalformedMessage(format!(
            "have index {piece} out of range ({num_pieces} pieces)"
        )));
    }
    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    peer.ensure_flags(num_pieces);
    peer.mark_have(piece);
    let unchoked = !peer.peer_choking;
    to.update_interest(addr);
    if unchoked {
        sched::do_requests(to, Instant::now());
    }
    Ok(())
}

fn recv_bitfield(core: &mut Core, hash: InfoHash, addr: SocketAddr, bits: &[u8]) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    if to.metainfo.is_none() {
        if !bits.is_empty() && bits.len() <= MAX_STASHED_BITFIELD {
            if let Some(peer) = to.peers.get_mut(&addr) {
                peer.pending_bitfield = Some(bits.to_vec());
                trace!(peer = %addr, "bitfield stashed until metainfo is known");
            }
        }
        return Ok(());
    }
    let num_pieces = to.num_pieces();
    if bits.len() != wire::bitfield_len(num_pieces) {
        return Err(BtError::MalformedMessage(format!(
            "bitfield is {} bytes for {num_pieces} pieces",
            bits.len()
        )));
    }
    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    peer.apply_bitfield(bits, num_pieces);
    let unchoked = !peer.peer_choking;
    to.update_interest(addr);
    if unchoked {
        sched::do_requests(to, Instant::now());
    }
    Ok(())
}

fn recv_have_all(core: &mut Core, hash: InfoHash, addr: SocketAddr) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    if to.metainfo.is_none() {
        let Some(peer) = to.peers.get_mut(&addr) else {
            return Ok(());
        };
        peer.pending_have_all = true;
        return Ok(());
    }
    let num_pieces = to.num_pieces();
    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    peer.ensure_flags(num_pieces);
    for index in 0..num_pieces {
        peer.mark_have(index);
    }
    let unchoked = !peer.peer_choking;
    to.update_interest(addr);
    if unchoked {
        sched::do_requests(to, Instant::now());
    }
    Ok(())
}

fn recv_piece(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    piece: u32,
    begin: u32,
    data: &Bytes,
) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    let length = data.len() as u32;

    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    let pos = peer
        .requests
        .iter()
        .position(|r| r.matches(piece, begin, length));
    let Some(pos) = pos else {
        // Data we never asked for (or asked for and already cancelled)
        to.wasted_bytes += length as u64;
        let Some(peer) = to.peers.get_mut(&addr) else {
            return Ok(());
        };
        peer.num_waste += 1;
        trace!(peer = %addr, piece, begin, length, "unrequested block, counted as waste");
        return Ok(());
    };
    let req = peer.requests.remove(pos);
    peer.bytes_received += length as u64;
    let received = peer.bytes_received;
    peer.download_rate.fill(now_seconds(), received);

    let first = peer.note_block_delay(req.qdepth, req.sent_at.elapsed());
    if first {
        // First measurement for this peer: flush the orphaned requests
        // that were kept only to keep the measurement window honest.
        let orphans: Vec<Request> = peer.requests.iter().filter(|r| !r.linked).cloned().collect();
        peer.requests.retain(|r| r.linked);
        for orphan in orphans {
            peer.num_cancels += 1;
            peer.send(Message::Cancel {
                piece: orphan.piece,
                begin: orphan.begin,
                length: orphan.length,
            });
        }
    }

    if !req.linked {
        return Ok(());
    }

    // Unlink the block and deal with the races still in flight for it.
    let mut racers: Vec<SocketAddr> = Vec::new();
    if let Some(tp) = to.pieces.get_mut(&piece) {
        if let Some(bpos) = tp
            .sent
            .iter()
            .position(|b| b.begin == begin && b.length == length)
        {
            racers = tp.sent[bpos].holders.clone();
            tp.sent.remove(bpos);
        }
    }
    for racer in racers {
        if racer == addr {
            continue;
        }
        let Some(other) = to.peers.get_mut(&racer) else {
            continue;
        };
        let Some(rpos) = other
            .requests
            .iter()
            .position(|r| r.linked && r.matches(piece, begin, length))
        else {
            continue;
        };
        if other.block_delay.is_some() {
            let r = other.requests.remove(rpos);
            other.num_cancels += 1;
            other.send(Message::Cancel {
                piece: r.piece,
                begin: r.begin,
                length: r.length,
            });
        } else {
            // Keep the request alive purely to measure this peer's first
            // block delay; it gets cancelled at measurement time.
            other.requests[rpos].linked = false;
        }
    }

    let completed = to.receive_block(piece, begin, data, addr);
    sched::do_requests(to, Instant::now());
    if completed {
        crate::hasher::wake(session, core);
    }
    Ok(())
}

fn recv_request(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    piece: u32,
    begin: u32,
    length: u32,
) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    let Some(peer) = to.peers.get(&addr) else {
        return Ok(());
    };
    trace!(peer = %addr, piece, begin, length, "upload request");
    if peer.am_choking {
        // Requests from peers we have choked are forfeit
        return Ok(());
    }
    if to.metainfo.is_none() || piece >= to.num_pieces() {
        return Err(BtError::MalformedMessage(format!(
            "request for piece {piece} out of range"
        )));
    }

    if !to.pieces.contains_key(&piece) {
        let cached = to
            .cache
            .as_ref()
            .map_or(false, |c| c.slot_of(piece).is_some());
        if !cached {
            trace!(piece, "requested piece neither in memory nor cache");
            return Ok(());
        }
        let tp = to.piece_entry(piece);
        tp.load_req = true;
        session.io_notify.notify_one();
    }

    let tp = to.pieces.get_mut(&piece).unwrap();
    if begin.checked_add(length).map_or(true, |end| end > tp.length) {
        return Err(BtError::MalformedMessage(format!(
            "request {piece}:{begin}+{length} out of piece range"
        )));
    }

    let ready = tp.hash_ok && !tp.io_busy;
    if !ready || to.out_tokens < length as u64 {
        tp.sendreqs.push(PendingSend {
            peer: addr,
            offset: begin,
            length,
        });
        return Ok(());
    }
    to.out_tokens -= length as u64;
    send_piece(to, addr, piece, begin, length);
    Ok(())
}

fn recv_reject(
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    piece: u32,
    begin: u32,
    length: u32,
) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    let pos = peer
        .requests
        .iter()
        .position(|r| r.matches(piece, begin, length));
    let Some(pos) = pos else {
        // Some peers reject in response to a cancel; common, ignore.
        return Ok(());
    };
    let req = peer.requests.remove(pos);
    debug!(peer = %addr, piece, begin, length, "request rejected");
    // Don't ask this peer for the piece again until a bitfield/have
    // refresh clears the mark.
    peer.set_flag(piece, Peer::REJECTED);

    if req.linked {
        if let Some(tp) = to.pieces.get_mut(&piece) {
            if let Some(bpos) = tp
                .sent
                .iter()
                .position(|b| b.begin == begin && b.length == length)
            {
                let block = &mut tp.sent[bpos];
                block.holders.retain(|h| *h != addr);
                if block.holders.is_empty() {
                    tp.return_to_waiting(bpos);
                }
            }
        }
    }
    sched::do_requests(to, Instant::now());
    Ok(())
}

fn recv_extension(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    ext_id: u8,
    payload: &Bytes,
) -> BtResult<()> {
    match ext_id {
        EXT_MSG_HANDSHAKE => recv_ext_handshake(core, hash, addr, payload),
        EXT_MSG_METADATA => recv_ext_metadata(session, core, hash, addr, payload),
        other => {
            trace!(peer = %addr, ext_id = other, "unknown extension message");
            Ok(())
        }
    }
}

fn recv_ext_handshake(
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    payload: &Bytes,
) -> BtResult<()> {
    let msg = bencode::parse(payload)
        .map_err(|e| BtError::MalformedMessage(format!("extension handshake: {e}")))?;
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return Ok(());
    };
    if let Some(m) = msg.get_dict("m") {
        peer.ext_ut_metadata = m.get_int("ut_metadata").unwrap_or(0).clamp(0, 255) as u8;
    }
    debug!(peer = %addr, ut_metadata = peer.ext_ut_metadata, "extension handshake");

    if to.metainfo.is_none() {
        if let Some(size) = msg.get_int("metadata_size") {
            if size > 0 && size <= MAX_METADATA_SIZE && to.metadata.is_none() {
                to.metadata = Some(MetadataFetch::new(size as usize));
            }
        }
        request_metadata_pieces(to);
    }
    Ok(())
}

fn recv_ext_metadata(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    payload: &Bytes,
) -> BtResult<()> {
    let (header, consumed) = bencode::parse_prefix(payload)
        .map_err(|e| BtError::MalformedMessage(format!("metadata message: {e}")))?;
    let body = payload.slice(consumed..);
    let msg_type = header.get_int("msg_type").unwrap_or(-1);
    let piece = header.get_int("piece").unwrap_or(-1);
    if piece < 0 {
        return Ok(());
    }
    let piece = piece as u32;

    match msg_type {
        // Peer requests our metadata
        0 => {
            let Some(to) = core.torrents.get_mut(&hash) else {
                return Ok(());
            };
            let Some(peer) = to.peers.get(&addr) else {
                return Ok(());
            };
            let out_id = peer.ext_ut_metadata;
            if out_id == 0 {
                return Ok(());
            }
            match &to.metainfo {
                Some(mi) => {
                    let info = mi.info_bytes();
                    let start = piece as usize * METADATA_PIECE_SIZE;
                    if start >= info.len() {
                        send_metadata_reject(peer, out_id, piece);
                        return Ok(());
                    }
                    let end = (start + METADATA_PIECE_SIZE).min(info.len());
                    let mut reply = dict(vec![
                        ("msg_type", Value::Int(1)),
                        ("piece", Value::Int(piece as i64)),
                        ("total_size", Value::Int(info.len() as i64)),
                    ])
                    .encode();
                    reply.extend_from_slice(&info[start..end]);
                    peer.send(Message::Extension {
                        ext_id: out_id,
                        payload: Bytes::from(reply),
                    });
                }
                None => send_metadata_reject(peer, out_id, piece),
            }
            Ok(())
        }
        // Metadata piece data
        1 => {
            let total_size = header.get_int("total_size").unwrap_or(-1);
            if total_size < 1 || total_size > MAX_METADATA_SIZE {
                return Ok(());
            }
            store_metadata_piece(session, core, hash, addr, piece, total_size as usize, body)
        }
        // Reject
        2 => {
            let Some(to) = core.torrents.get_mut(&hash) else {
                return Ok(());
            };
            if let Some(fetch) = &mut to.metadata {
                fetch.inflight.remove(&piece);
            }
            request_metadata_pieces(to);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn store_metadata_piece(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    addr: SocketAddr,
    piece: u32,
    total_size: usize,
    body: Bytes,
) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return Ok(());
    };
    if to.metainfo.is_some() {
        return Ok(());
    }
    if to.metadata.is_none() {
        to.metadata = Some(MetadataFetch::new(total_size));
    }
    let fetch = to.metadata.as_mut().unwrap();
    let fetch_total = fetch.total_size;
    fetch.inflight.remove(&piece);

    let idx = piece as usize;
    if idx >= fetch.pieces.len() {
        return Ok(());
    }
    let expected = (fetch_total - idx * METADATA_PIECE_SIZE).min(METADATA_PIECE_SIZE);
    if body.len() != expected {
        trace!(peer = %addr, piece, got = body.len(), expected, "metadata piece size mismatch");
        request_metadata_pieces(to);
        return Ok(());
    }
    fetch.pieces[idx] = Some(body);

    if !fetch.is_complete() {
        request_metadata_pieces(to);
        return Ok(());
    }

    let assembled = fetch.assemble();
    if InfoHash::of(&assembled) != to.info_hash {
        warn!(torrent = %to.info_hash, "assembled metadata hash mismatch, retrying");
        to.metadata = Some(MetadataFetch::new(fetch_total));
        request_metadata_pieces(to);
        return Ok(());
    }

    match Metainfo::from_info_dict(&assembled, Vec::new()) {
        Ok(mi) => {
            debug!(torrent = %to.info_hash, name = %mi.name, "metadata fetched and verified");
            let bad = to.adopt_metainfo(mi);
            sched::do_requests(to, Instant::now());
            for bad_addr in bad {
                peer_shutdown(session, core, hash, bad_addr, PeerState::Destroyed, true);
            }
            session.io_notify.notify_one();
        }
        Err(err) => {
            warn!(torrent = %to.info_hash, error = %err, "metadata parse failed, retrying");
            to.metadata = Some(MetadataFetch::new(fetch_total));
            request_metadata_pieces(to);
        }
    }
    Ok(())
}

/// Attribute a hash failure to one contributing peer (rotating) and
/// disconnect repeat offenders.
pub(crate) fn blame_contributor(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    piece: u32,
) {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    let num_pieces = to.num_pieces();
    let Some(tp) = to.pieces.get_mut(&piece) else {
        return;
    };
    if tp.contributors.is_empty() {
        return;
    }
    let victim = tp.contributors[tp.blame_rotor % tp.contributors.len()];
    tp.blame_rotor += 1;

    let mut destroy = false;
    if let Some(peer) = to.peers.get_mut(&victim) {
        peer.bad_pieces += 1;
        peer.ensure_flags(num_pieces);
        peer.set_flag(piece, Peer::REJECTED);
        warn!(peer = %victim, piece, bad = peer.bad_pieces, "peer blamed for corrupt piece");
        destroy = peer.bad_pieces >= MAX_BAD_PIECES;
    }
    if destroy {
        peer_shutdown(session, core, hash, victim, PeerState::Destroyed, true);
    }
}

/// Return every outstanding request the peer owed: linked blocks go back
/// to the waiting list unless another peer still holds a live request;
/// the peer's parked upload requests are dropped.
pub(crate) fn abort_requests(to: &mut Torrent, addr: SocketAddr) {
    let Some(peer) = to.peers.get_mut(&addr) else {
        return;
    };
    let requests = std::mem::take(&mut peer.requests);
    for req in requests.iter().filter(|r| r.linked) {
        if let Some(tp) = to.pieces.get_mut(&req.piece) {
            if let Some(pos) = tp
                .sent
                .iter()
                .position(|b| b.begin == req.begin && b.length == req.length)
            {
                let block = &mut tp.sent[pos];
                block.holders.retain(|h| *h != addr);
                if block.holders.is_empty() {
                    tp.return_to_waiting(pos);
                }
            }
        }
    }
    for tp in to.pieces.values_mut() {
        tp.sendreqs.retain(|sr| sr.peer != addr);
    }
}

fn set_peer_interested(
    core: &mut Core,
    hash: &InfoHash,
    addr: &SocketAddr,
    interested: bool,
) -> BtResult<()> {
    if let Some(peer) = peer_mut(core, hash, addr) {
        peer.peer_interested = interested;
        trace!(peer = %addr, interested, "remote interest");
    }
    Ok(())
}

fn recv_cancel(
    core: &mut Core,
    hash: &InfoHash,
    addr: &SocketAddr,
    piece: u32,
    begin: u32,
    length: u32,
) -> BtResult<()> {
    let Some(to) = core.torrents.get_mut(hash) else {
        return Ok(());
    };
    if let Some(tp) = to.pieces.get_mut(&piece) {
        tp.sendreqs
            .retain(|sr| !(sr.peer == *addr && sr.offset == begin && sr.length == length));
    }
    Ok(())
}

fn send_metadata_reject(peer: &Peer, out_id: u8, piece: u32) {
    let reply = dict(vec![
        ("msg_type", Value::Int(2)),
        ("piece", Value::Int(piece as i64)),
    ]);
    peer.send(Message::Extension {
        ext_id: out_id,
        payload: Bytes::from(reply.encode()),
    });
}

/// Copy a verified piece range to a peer and account for the upload.
pub(crate) fn send_piece(to: &mut Torrent, addr: SocketAddr, piece: u32, begin: u32, length: u32) {
    let data = match to.pieces.get(&piece) {
        Some(tp) if tp.hash_ok && !tp.io_busy => {
            Bytes::copy_from_slice(&tp.data[begin as usize..(begin + length) as usize])
        }
        _ => return,
    };
    let Some(peer) = to.peers.get_mut(&addr) else {
        return;
    };
    peer.bytes_sent += length as u64;
    peer.send(Message::Piece { piece, begin, data });
    to.uploaded_bytes += length as u64;
}

/// Serve queued upload requests now that tokens or piece data became
/// available.
pub(crate) fn drain_sendreqs(to: &mut Torrent) {
    let ready: Vec<u32> = to
        .pieces
        .values()
        .filter(|p| p.hash_ok && !p.io_busy && !p.sendreqs.is_empty())
        .map(|p| p.index)
        .collect();
    for index in ready {
        loop {
            let tp = to.pieces.get_mut(&index).unwrap();
            let Some(sr) = tp.sendreqs.first().cloned() else {
                break;
            };
            if to.out_tokens < sr.length as u64 {
                return; // bucket dry, the refill timer resumes draining
            }
            tp.sendreqs.remove(0);
            to.out_tokens -= sr.length as u64;
            send_piece(to, sr.peer, index, sr.offset, sr.length);
        }
    }
}

/// Assign missing metadata pieces to running peers that advertise
/// ut_metadata, respecting a small per-peer pipeline.
pub(crate) fn request_metadata_pieces(to: &mut Torrent) {
    if to.metainfo.is_some() {
        return;
    }
    let Some(fetch) = &mut to.metadata else {
        return;
    };

    let capable: Vec<SocketAddr> = to
        .peers
        .iter()
        .filter(|(_, p)| p.state == PeerState::Running && p.ext_ut_metadata != 0)
        .map(|(a, _)| *a)
        .collect();
    if capable.is_empty() {
        return;
    }

    let missing: Vec<u32> = (0..fetch.pieces.len() as u32)
        .filter(|i| fetch.pieces[*i as usize].is_none() && !fetch.inflight.contains_key(i))
        .collect();

    for index in missing {
        let target = capable
            .iter()
            .copied()
            .map(|a| {
                let inflight = fetch.inflight.values().filter(|h| **h == a).count();
                (inflight, a)
            })
            .filter(|(inflight, _)| *inflight < METADATA_PIPELINE)
            .min_by_key(|(inflight, _)| *inflight);
        let Some((_, target)) = target else {
            break; // every capable peer is at its pipeline cap
        };
        fetch.inflight.insert(index, target);
        let peer = &to.peers[&target];
        debug!(peer = %target, piece = index, "requesting metadata piece");
        let req = dict(vec![
            ("msg_type", Value::Int(0)),
            ("piece", Value::Int(index as i64)),
        ]);
        peer.send(Message::Extension {
            ext_id: peer.ext_ut_metadata,
            payload: Bytes::from(req.encode()),
        });
    }
}

fn peer_mut<'a>(core: &'a mut Core, hash: &InfoHash, addr: &SocketAddr) -> Option<&'a mut Peer> {
    core.torrents.get_mut(hash)?.peers.get_mut(addr)
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    mut rx: UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    let mut last_send = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                    last_send = Instant::now();
                }
                None => break,
            },
            _ = tick.tick() => {
                if last_send.elapsed() >= KEEPALIVE_INTERVAL {
                    if sink.send(Message::KeepAlive).await.is_err() {
                        break;
                    }
                    last_send = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new("10.0.0.1:6881".parse().unwrap())
    }

    #[test]
    fn test_delay_ewma() {
        let mut p = peer();
        assert!(p.note_block_delay(0, Duration::from_millis(800)));
        assert_eq!(p.block_delay, Some(Duration::from_millis(800)));
        assert_eq!(p.maxq, 10);

        assert!(!p.note_block_delay(1, Duration::from_millis(80)));
        // (800*7 + 80) / 8 = 710
        assert_eq!(p.block_delay, Some(Duration::from_millis(710)));
        assert_eq!(p.delay_by_depth[1], Some(Duration::from_millis(80)));
    }

    #[test]
    fn test_delay_clamped_to_sixty_seconds() {
        let mut p = peer();
        p.note_block_delay(0, Duration::from_secs(300));
        assert_eq!(p.block_delay, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_have_flags_count_once() {
        let mut p = peer();
        p.ensure_flags(16);
        p.mark_have(3);
        p.mark_have(3);
        assert_eq!(p.num_pieces_have, 1);
        assert!(p.flag(3, Peer::HAVE));
        assert!(!p.flag(4, Peer::HAVE));
    }

    #[test]
    fn test_apply_bitfield_replaces_previous() {
        let mut p = peer();
        p.ensure_flags(9);
        p.mark_have(8);
        p.set_flag(8, Peer::REJECTED);

        let mut bits = vec![0u8; 2];
        wire::bitfield_set(&mut bits, 0);
        wire::bitfield_set(&mut bits, 5);
        p.apply_bitfield(&bits, 9);

        assert_eq!(p.num_pieces_have, 2);
        assert!(p.flag(0, Peer::HAVE));
        assert!(p.flag(5, Peer::HAVE));
        assert!(!p.flag(8, Peer::HAVE));
        // Other flag bits survive a bitfield refresh of HAVE bits
        assert!(p.flag(8, Peer::REJECTED));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PeerState::Running.as_str(), "running");
        assert_eq!(PeerState::ConnectFail.as_str(), "connect-fail");
    }
}
