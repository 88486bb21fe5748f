//! BEP-15 UDP tracker client.
//!
//! One UDP socket, bound at session start, serves every UDP tracker. The
//! receive task dispatches replies by source address; connect retransmits
//! follow the 15·2^n schedule and an error reply tears the connection
//! down for a fresh connect.

use crate::peer;
use crate::session::{Core, Session};
use crate::tracker::{self, TrackerKind, UdpState, EVENT_STARTED};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const CONNECT_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
/// Some trackers forget to byte-swap the error action.
const ACTION_ERROR_SWAPPED: u32 = 0x03000000;

/// "udp://host:port/..." -> (host, port). Port defaults to 80 like the
/// original when absent.
pub(crate) fn split_host_port(url: &str) -> Option<(String, u16)> {
    let rest = url.strip_prefix("udp://")?;
    let rest = rest.split(['/', '?']).next()?;
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            (!host.is_empty()).then(|| (host.to_string(), port))
        }
        None => (!rest.is_empty()).then(|| (rest.to_string(), 80)),
    }
}

/// Resolve the tracker hostname off the lock, then kick off the connect
/// exchange.
pub(crate) fn spawn_dns(session: &Arc<Session>, url: String, host: String, port: u16) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let resolved = tokio::net::lookup_host((host.as_str(), port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()));

        let mut core = session.core.lock().unwrap();
        let Some(ti) = core.trackers.iter().position(|t| t.url == url) else {
            return;
        };
        match resolved {
            Some(addr) => {
                debug!(url, %addr, "tracker resolved");
                if let TrackerKind::Udp(state) = &mut core.trackers[ti].kind {
                    state.addr = Some(addr);
                }
                send_connect(&session, &mut core, ti);
            }
            None => {
                warn!(url, "tracker dns lookup failed");
                if let TrackerKind::Udp(state) = &mut core.trackers[ti].kind {
                    state.state = UdpState::Error;
                }
            }
        }
    });
}

/// Send (or resend) the 16-byte connect request, arming the 15·2^attempt
/// retransmit timer.
pub(crate) fn send_connect(session: &Arc<Session>, core: &mut Core, ti: usize) {
    let txid = rand::random::<u32>() | 0x8000_0000;
    let url = core.trackers[ti].url.clone();
    let TrackerKind::Udp(state) = &mut core.trackers[ti].kind else {
        return;
    };
    let Some(addr) = state.addr else {
        return;
    };
    state.state = UdpState::Connecting;
    state.conn_txid = txid;

    let mut pkt = [0u8; 16];
    pkt[0..8].copy_from_slice(&CONNECT_MAGIC.to_be_bytes());
    pkt[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    pkt[12..16].copy_from_slice(&txid.to_be_bytes());

    let timeout = 15u64 << state.conn_attempt.min(8);
    state.retry_at = Some(Instant::now() + Duration::from_secs(timeout));
    state.conn_attempt += 1;
    debug!(
        url,
        attempt = state.conn_attempt,
        txid = format_args!("0x{txid:08x}"),
        timeout,
        "tracker connect"
    );
    let _ = session.udp.try_send_to(&pkt, addr);
}

/// Send the fixed 98-byte announce for one association.
pub(crate) fn announce(session: &Arc<Session>, core: &mut Core, ti: usize, ai: usize, event: u32) {
    core.next_txid = core.next_txid.wrapping_add(1);
    let txid = core.next_txid;
    let listen_port = core.limits.listen_port;
    let key = core.announce_key;

    let hash = core.trackers[ti].assocs[ai].hash;
    let Some(stats) = tracker::announce_stats(core, &hash) else {
        return;
    };
    let TrackerKind::Udp(state) = &core.trackers[ti].kind else {
        return;
    };
    if state.state != UdpState::Connected {
        return;
    }
    let Some(addr) = state.addr else {
        return;
    };
    let conn_id = state.conn_id;

    let mut pkt = [0u8; 98];
    pkt[0..8].copy_from_slice(&conn_id.to_be_bytes());
    pkt[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    pkt[12..16].copy_from_slice(&txid.to_be_bytes());
    pkt[16..36].copy_from_slice(hash.as_bytes());
    pkt[36..56].copy_from_slice(&session.peer_id);
    pkt[56..64].copy_from_slice(&stats.downloaded.to_be_bytes());
    pkt[64..72].copy_from_slice(&stats.left.to_be_bytes());
    pkt[72..80].copy_from_slice(&stats.uploaded.to_be_bytes());
    pkt[80..84].copy_from_slice(&event.to_be_bytes());
    // bytes 84..88: IP address 0 (tracker uses the source address)
    pkt[88..92].copy_from_slice(&key.to_be_bytes());
    pkt[92..96].copy_from_slice(&(-1i32).to_be_bytes()); // num_want
    pkt[96..98].copy_from_slice(&listen_port.to_be_bytes());

    let assoc = &mut core.trackers[ti].assocs[ai];
    assoc.txid = txid;
    if event == EVENT_STARTED {
        assoc.tentative = false;
    }
    tracker::schedule_next(assoc, Instant::now());
    trace!(url = %core.trackers[ti].url, torrent = %hash, event, "udp announce");
    let _ = session.udp.try_send_to(&pkt, addr);
}

/// Receive loop for the shared tracker socket.
pub(crate) async fn run(session: Arc<Session>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, from) = tokio::select! {
            _ = session.shutdown.cancelled() => return,
            res = session.udp.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(_) => continue,
            },
        };
        if len < 4 {
            continue;
        }
        let mut core = session.core.lock().unwrap();
        handle_datagram(&session, &mut core, &buf[..len], from);
    }
}

fn handle_datagram(session: &Arc<Session>, core: &mut Core, data: &[u8], from: SocketAddr) {
    let Some(ti) = core.trackers.iter().position(|t| {
        matches!(&t.kind, TrackerKind::Udp(s) if s.addr == Some(from))
    }) else {
        return;
    };
    let action = u32::from_be_bytes(data[0..4].try_into().unwrap());
    trace!(url = %core.trackers[ti].url, action, "tracker packet");

    match action {
        ACTION_CONNECT => handle_connect_reply(session, core, ti, data),
        ACTION_ANNOUNCE => handle_announce_reply(session, core, ti, data),
        ACTION_ERROR | ACTION_ERROR_SWAPPED => handle_error(session, core, ti, data),
        _ => {}
    }
}

fn handle_connect_reply(session: &Arc<Session>, core: &mut Core, ti: usize, data: &[u8]) {
    if data.len() < 16 {
        return;
    }
    let txid = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let conn_id = u64::from_be_bytes(data[8..16].try_into().unwrap());
    {
        let TrackerKind::Udp(state) = &mut core.trackers[ti].kind else {
            return;
        };
        if state.conn_txid != txid {
            return;
        }
        state.conn_attempt = 0;
        state.conn_id = conn_id;
        state.retry_at = None;
        state.state = UdpState::Connected;
    }
    debug!(url = %core.trackers[ti].url, "tracker connected");

    // Immediately announce every associated torrent
    for ai in 0..core.trackers[ti].assocs.len() {
        let event = if core.trackers[ti].assocs[ai].tentative {
            EVENT_STARTED
        } else {
            crate::tracker::EVENT_NONE
        };
        announce(session, core, ti, ai, event);
    }
}

fn handle_announce_reply(session: &Arc<Session>, core: &mut Core, ti: usize, data: &[u8]) {
    if data.len() < 20 {
        return;
    }
    let txid = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let Some(ai) = core.trackers[ti]
        .assocs
        .iter()
        .position(|a| a.txid == txid)
    else {
        trace!(url = %core.trackers[ti].url, "announce reply for unknown txid");
        return;
    };

    let interval = u32::from_be_bytes(data[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(data[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(data[16..20].try_into().unwrap());

    let hash = {
        let assoc = &mut core.trackers[ti].assocs[ai];
        assoc.interval = if interval > 0 {
            interval
        } else {
            tracker::DEFAULT_ANNOUNCE_INTERVAL
        };
        assoc.leechers = leechers;
        assoc.seeders = seeders;
        tracker::schedule_next(assoc, Instant::now());
        assoc.hash
    };
    debug!(
        url = %core.trackers[ti].url,
        torrent = %hash,
        leechers,
        seeders,
        interval,
        peers = (data.len() - 20) / 6,
        "announce reply"
    );

    if let Some(to) = core.torrents.get_mut(&hash) {
        to.leechers = leechers;
        to.seeders = seeders;
    }

    for entry in data[20..].chunks_exact(6) {
        let ip = std::net::Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        if port == 0 {
            continue;
        }
        peer::add_peer(session, core, hash, SocketAddr::from((ip, port)));
    }
}

/// Tracker-signalled error: log the reason and rebuild the connection.
fn handle_error(session: &Arc<Session>, core: &mut Core, ti: usize, data: &[u8]) {
    if data.len() < 8 {
        return;
    }
    let txid = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let known = core.trackers[ti]
        .assocs
        .iter()
        .any(|a| a.txid == txid);
    let is_conn = matches!(
        &core.trackers[ti].kind,
        TrackerKind::Udp(s) if s.conn_txid == txid
    );
    if !known && !is_conn {
        return;
    }
    let reason = String::from_utf8_lossy(&data[8..]).into_owned();
    warn!(url = %core.trackers[ti].url, reason, "tracker error, reconnecting");
    for assoc in &mut core.trackers[ti].assocs {
        if assoc.txid == txid {
            assoc.interval = tracker::backoff(assoc.interval);
            tracker::schedule_next(assoc, Instant::now());
        }
    }
    send_connect(session, core, ti);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("udp://tracker.example.com:6969/announce"),
            Some(("tracker.example.com".to_string(), 6969))
        );
        assert_eq!(
            split_host_port("udp://tracker.example.com"),
            Some(("tracker.example.com".to_string(), 80))
        );
        assert_eq!(split_host_port("http://x"), None);
        assert_eq!(split_host_port("udp://"), None);
    }

    #[test]
    fn test_connect_packet_layout() {
        let mut pkt = [0u8; 16];
        pkt[0..8].copy_from_slice(&CONNECT_MAGIC.to_be_bytes());
        assert_eq!(&pkt[0..8], &[0, 0, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
    }
}
