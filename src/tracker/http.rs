//! BEP-3 HTTP tracker client with BEP-23 compact peer lists.
//!
//! Announces are plain GETs built by hand because `info_hash` and
//! `peer_id` are raw byte strings that must be percent-encoded as-is.
//! Replies are bencoded; both the compact peers string and the list-of-
//! dicts form are accepted. A `failure reason` doubles the interval up to
//! one hour.

use crate::bencode;
use crate::metainfo::InfoHash;
use crate::peer;
use crate::session::{Core, Session};
use crate::tracker::{self, EVENT_STARTED, EVENT_STOPPED};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Percent-encode raw bytes for a query component.
fn urlencode_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for &b in data {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn event_str(event: u32) -> Option<&'static str> {
    match event {
        EVENT_STARTED => Some("started"),
        EVENT_STOPPED => Some("stopped"),
        _ => None,
    }
}

/// Build the announce URL and fire the request on a background task. The
/// association is marked in flight until the reply is applied.
pub(crate) fn spawn_announce(
    session: &Arc<Session>,
    core: &mut Core,
    ti: usize,
    ai: usize,
    event: u32,
) {
    let url = core.trackers[ti].url.clone();
    let listen_port = core.limits.listen_port;
    let hash = core.trackers[ti].assocs[ai].hash;
    let Some(stats) = tracker::announce_stats(core, &hash) else {
        return;
    };
    let assoc = &mut core.trackers[ti].assocs[ai];
    let trackerid = assoc.trackerid.clone();
    assoc.http_inflight = true;
    if event == EVENT_STARTED {
        assoc.tentative = false;
    }

    let sep = if url.contains('?') { '&' } else { '?' };
    let mut full = format!(
        "{url}{sep}info_hash={}&peer_id={}&port={listen_port}&compact=1\
         &uploaded={}&downloaded={}&left={}",
        urlencode_bytes(hash.as_bytes()),
        urlencode_bytes(&session.peer_id),
        stats.uploaded,
        stats.downloaded,
        stats.left,
    );
    if let Some(event) = event_str(event) {
        full.push_str("&event=");
        full.push_str(event);
    }
    if let Some(id) = &trackerid {
        full.push_str("&trackerid=");
        full.push_str(&urlencode_bytes(id.as_bytes()));
    }

    trace!(url = %full, "http announce");
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let body = match session.http.get(&full).send().await {
            Ok(resp) => resp.bytes().await.ok(),
            Err(err) => {
                debug!(url, error = %err, "http announce failed");
                None
            }
        };
        let mut core = session.core.lock().unwrap();
        apply_reply(&session, &mut core, &url, hash, body.as_deref());
    });
}

/// Apply an announce reply (or back off on failure) under the core lock.
fn apply_reply(
    session: &Arc<Session>,
    core: &mut Core,
    url: &str,
    hash: InfoHash,
    body: Option<&[u8]>,
) {
    let mut peers: Vec<SocketAddr> = Vec::new();
    let mut interval = None;
    let mut trackerid = None;
    let mut failure = None;

    if let Some(body) = body {
        match bencode::parse(body) {
            Ok(msg) => {
                failure = msg.get_str("failure reason").map(str::to_string);
                trackerid = msg.get_str("trackerid").map(str::to_string);
                interval = msg
                    .get_int("min interval")
                    .or_else(|| msg.get_int("interval"))
                    .filter(|v| *v > 0)
                    .map(|v| v as u32);

                match msg.get("peers") {
                    // BEP-23 compact string of 6-byte entries
                    Some(bencode::Value::Bytes(compact)) => {
                        for entry in compact.chunks_exact(6) {
                            let ip = std::net::Ipv4Addr::new(
                                entry[0], entry[1], entry[2], entry[3],
                            );
                            let port = u16::from_be_bytes([entry[4], entry[5]]);
                            if port > 0 {
                                peers.push(SocketAddr::from((ip, port)));
                            }
                        }
                    }
                    // Original list-of-dicts form
                    Some(bencode::Value::List(list)) => {
                        for entry in list {
                            let Some(ip) = entry.get_str("ip") else { continue };
                            let Some(port) = entry.get_int("port") else { continue };
                            let Ok(ip) = ip.parse::<std::net::IpAddr>() else {
                                continue;
                            };
                            if !ip.is_ipv4() || port <= 0 || port > u16::MAX as i64 {
                                continue;
                            }
                            peers.push(SocketAddr::new(ip, port as u16));
                        }
                    }
                    _ => {}
                }
            }
            Err(err) => debug!(url, error = %err, "unparseable tracker reply"),
        }
    }

    // Update the association regardless of outcome
    for tracker_obj in core.trackers.iter_mut().filter(|t| t.url == url) {
        for assoc in tracker_obj.assocs.iter_mut().filter(|a| a.hash == hash) {
            assoc.http_inflight = false;
            match (&failure, interval) {
                (Some(reason), _) => {
                    warn!(url, reason = %reason, "tracker failure");
                    assoc.interval = tracker::backoff(assoc.interval);
                }
                (None, Some(interval)) => assoc.interval = interval,
                (None, None) if body.is_none() => {
                    assoc.interval = tracker::backoff(assoc.interval);
                }
                _ => {}
            }
            if let Some(id) = &trackerid {
                assoc.trackerid = Some(id.clone());
            }
            tracker::schedule_next(assoc, Instant::now());
        }
    }

    if failure.is_none() {
        if core.torrents.contains_key(&hash) {
            debug!(url, torrent = %hash, peers = peers.len(), "http announce reply");
        }
        for addr in peers {
            peer::add_peer(session, core, hash, addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencode_binary_hash() {
        let data = [0x01, 0xff, b'a', b' ', b'~'];
        assert_eq!(urlencode_bytes(&data), "%01%FFa%20~");
    }

    #[test]
    fn test_event_strings() {
        assert_eq!(event_str(EVENT_STARTED), Some("started"));
        assert_eq!(event_str(EVENT_STOPPED), Some("stopped"));
        assert_eq!(event_str(0), None);
    }
}
