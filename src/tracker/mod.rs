//! Tracker registry and per-torrent tracker associations.
//!
//! A tracker object is shared by every torrent announcing to the same
//! URL. UDP trackers (BEP-15) ride one shared socket; HTTP trackers go
//! through the session's reqwest client. The per-second session tick
//! drives connect retransmits and due announces.

pub(crate) mod http;
pub(crate) mod udp;

use crate::metainfo::InfoHash;
use crate::session::{Core, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fallback announce interval when a tracker does not supply one.
pub(crate) const DEFAULT_ANNOUNCE_INTERVAL: u32 = 1800;
/// Error back-off never exceeds this.
pub(crate) const MAX_ANNOUNCE_INTERVAL: u32 = 3600;

/// BEP-15 / BEP-3 announce events.
pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_COMPLETED: u32 = 1;
pub(crate) const EVENT_STARTED: u32 = 2;
pub(crate) const EVENT_STOPPED: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UdpState {
    PendingDns,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug)]
pub(crate) struct UdpTrackerState {
    pub state: UdpState,
    pub addr: Option<SocketAddr>,
    pub conn_txid: u32,
    pub conn_id: u64,
    pub conn_attempt: u32,
    pub retry_at: Option<Instant>,
}

#[derive(Debug)]
pub(crate) enum TrackerKind {
    Udp(UdpTrackerState),
    Http,
}

/// Per-torrent state at one tracker.
#[derive(Debug)]
pub(crate) struct TrackerTorrent {
    pub hash: InfoHash,
    pub txid: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    /// First announce still pending; it carries event=started.
    pub tentative: bool,
    pub trackerid: Option<String>,
    pub next_announce: Option<Instant>,
    pub http_inflight: bool,
}

#[derive(Debug)]
pub(crate) struct Tracker {
    pub url: String,
    pub kind: TrackerKind,
    pub assocs: Vec<TrackerTorrent>,
}

/// Associate `hash` with the tracker at `url`, creating the tracker on
/// first sight. Unsupported schemes are logged and dropped.
pub(crate) fn add_tracker(session: &Arc<Session>, core: &mut Core, hash: InfoHash, url: &str) {
    let idx = core.trackers.iter().position(|t| t.url == url);
    let idx = match idx {
        Some(idx) => idx,
        None => {
            let kind = if url.starts_with("udp://") {
                let Some((host, port)) = udp::split_host_port(url) else {
                    warn!(url, "unparseable udp tracker url");
                    return;
                };
                udp::spawn_dns(session, url.to_string(), host, port);
                TrackerKind::Udp(UdpTrackerState {
                    state: UdpState::PendingDns,
                    addr: None,
                    conn_txid: 0,
                    conn_id: 0,
                    conn_attempt: 0,
                    retry_at: None,
                })
            } else if url.starts_with("http://") || url.starts_with("https://") {
                TrackerKind::Http
            } else {
                warn!(url, "unsupported tracker scheme");
                return;
            };
            debug!(url, "tracker added");
            core.trackers.push(Tracker {
                url: url.to_string(),
                kind,
                assocs: Vec::new(),
            });
            core.trackers.len() - 1
        }
    };

    let tracker = &mut core.trackers[idx];
    if tracker.assocs.iter().any(|a| a.hash == hash) {
        return;
    }
    core.next_txid = core.next_txid.wrapping_add(1);
    let txid = core.next_txid;
    core.trackers[idx].assocs.push(TrackerTorrent {
        hash,
        txid,
        interval: DEFAULT_ANNOUNCE_INTERVAL,
        leechers: 0,
        seeders: 0,
        tentative: true,
        trackerid: None,
        next_announce: Some(Instant::now()),
        http_inflight: false,
    });
}

/// Announce a stop for every tracker association of a torrent being torn
/// down, then drop the associations.
pub(crate) fn remove_torrent(session: &Arc<Session>, core: &mut Core, hash: InfoHash) {
    for ti in 0..core.trackers.len() {
        let Some(ai) = core.trackers[ti].assocs.iter().position(|a| a.hash == hash) else {
            continue;
        };
        match &core.trackers[ti].kind {
            TrackerKind::Udp(udp_state) => {
                if udp_state.state == UdpState::Connected {
                    udp::announce(session, core, ti, ai, EVENT_STOPPED);
                }
            }
            TrackerKind::Http => {
                http::spawn_announce(session, core, ti, ai, EVENT_STOPPED);
            }
        }
        core.trackers[ti].assocs.retain(|a| a.hash != hash);
    }
}

/// Per-second maintenance: UDP connect retransmits and due announces.
pub(crate) fn tick(session: &Arc<Session>, core: &mut Core, now: Instant) {
    enum Act {
        Retry,
        Announce(Vec<usize>, bool), // assoc indices, is_http
        Nothing,
    }
    for ti in 0..core.trackers.len() {
        let act = {
            let tracker = &core.trackers[ti];
            match &tracker.kind {
                TrackerKind::Udp(state) => {
                    if state.state == UdpState::Connecting
                        && state.retry_at.map_or(false, |at| now >= at)
                    {
                        Act::Retry
                    } else if state.state == UdpState::Connected {
                        Act::Announce(due_assocs(&tracker.assocs, now), false)
                    } else {
                        Act::Nothing
                    }
                }
                TrackerKind::Http => Act::Announce(due_assocs(&tracker.assocs, now), true),
            }
        };
        match act {
            Act::Retry => udp::send_connect(session, core, ti),
            Act::Announce(due, is_http) => {
                for ai in due {
                    let event = if core.trackers[ti].assocs[ai].tentative {
                        EVENT_STARTED
                    } else {
                        EVENT_NONE
                    };
                    if is_http {
                        http::spawn_announce(session, core, ti, ai, event);
                    } else {
                        udp::announce(session, core, ti, ai, event);
                    }
                }
            }
            Act::Nothing => {}
        }
    }
}

fn due_assocs(assocs: &[TrackerTorrent], now: Instant) -> Vec<usize> {
    assocs
        .iter()
        .enumerate()
        .filter(|(_, a)| !a.http_inflight && a.next_announce.map_or(false, |at| now >= at))
        .map(|(i, _)| i)
        .collect()
}

/// Double an announce interval after an error, capped at one hour.
pub(crate) fn backoff(interval: u32) -> u32 {
    (interval.max(1) * 2).min(MAX_ANNOUNCE_INTERVAL)
}

/// Torrent counters snapshot for an announce.
pub(crate) struct AnnounceStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

pub(crate) fn announce_stats(core: &Core, hash: &InfoHash) -> Option<AnnounceStats> {
    let to = core.torrents.get(hash)?;
    let total = to
        .metainfo
        .as_ref()
        .map(|mi| mi.total_length)
        .unwrap_or(0);
    Some(AnnounceStats {
        downloaded: to.downloaded_bytes,
        uploaded: to.uploaded_bytes,
        // The original reports a placeholder before metainfo is known
        left: if total > 0 { total } else { 16384 },
    })
}

pub(crate) fn schedule_next(assoc: &mut TrackerTorrent, now: Instant) {
    assoc.next_announce = Some(now + Duration::from_secs(assoc.interval.max(1) as u64));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(1800), 3600);
        assert_eq!(backoff(3000), 3600);
        assert_eq!(backoff(3600), 3600);
        assert_eq!(backoff(0), 2);
    }

    #[test]
    fn test_due_assocs_filters_inflight_and_future() {
        let now = Instant::now();
        let mk = |next: Option<Instant>, inflight: bool| TrackerTorrent {
            hash: InfoHash([0; 20]),
            txid: 1,
            interval: 1800,
            leechers: 0,
            seeders: 0,
            tentative: false,
            trackerid: None,
            next_announce: next,
            http_inflight: inflight,
        };
        let assocs = vec![
            mk(Some(now - Duration::from_secs(1)), false),
            mk(Some(now + Duration::from_secs(60)), false),
            mk(Some(now - Duration::from_secs(1)), true),
            mk(None, false),
        ];
        assert_eq!(due_assocs(&assocs, now), vec![0]);
    }
}
